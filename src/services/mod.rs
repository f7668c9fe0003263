pub mod auth;
pub mod cache;
pub mod catalog;
pub mod coordinator;
pub mod janitor;
pub mod manifest;
pub mod transcoder;

pub use auth::AuthService;
pub use cache::StreamCache;
pub use catalog::Catalog;
pub use coordinator::GenerationGate;
pub use transcoder::{FfmpegTranscoder, Transcoder};
