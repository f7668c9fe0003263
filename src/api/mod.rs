pub mod auth;
pub mod library;
pub mod middleware;
pub mod streaming;

pub use auth::auth_routes;
pub use library::library_routes;
pub use streaming::streaming_routes;

use crate::config::Config;
use crate::services::{AuthService, Catalog, GenerationGate, StreamCache, Transcoder};
use std::sync::Arc;

pub struct AppState {
    pub config: Config,
    pub auth_service: Arc<AuthService>,
    pub catalog: Arc<Catalog>,
    pub cache: Arc<StreamCache>,
    pub gate: Arc<GenerationGate>,
    pub transcoder: Arc<dyn Transcoder>,
}
