pub mod track;
pub mod user;

pub use track::{StreamFormat, StreamVariant, Track};
pub use user::{AuthResponse, CreateUserRequest, LoginRequest, User, UserInfo, UserRole};
