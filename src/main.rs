mod api;
mod config;
mod error;
mod models;
mod services;

use crate::api::AppState;
use crate::config::Config;
use crate::services::{
    janitor, AuthService, Catalog, FfmpegTranscoder, GenerationGate, StreamCache, Transcoder,
};
use axum::http::{header, HeaderValue, Method};
use axum::Router;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,chorus=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env()?;
    tracing::info!("Configuration loaded");

    // Connect to database
    let db = PgPoolOptions::new()
        .max_connections(50)
        .connect(&config.database_url)
        .await?;
    tracing::info!("Connected to database");

    // Run migrations
    sqlx::migrate!("./migrations").run(&db).await?;
    tracing::info!("Database migrations completed");

    // Open the stream cache; an unusable cache directory is fatal
    let cache = Arc::new(
        StreamCache::open(
            config.cache_dir.clone(),
            config.cache_max_bytes,
            config.cache_min_ttl,
        )
        .await
        .map_err(|e| anyhow::anyhow!("opening stream cache: {}", e))?,
    );

    // Initialize services
    let auth_service = Arc::new(AuthService::new(db.clone(), &config));
    let catalog = Arc::new(Catalog::new(db.clone()));
    let gate = Arc::new(GenerationGate::new());
    let transcoder = Arc::new(FfmpegTranscoder::new(
        config.encoder_path.clone(),
        cache.clone(),
        config.generation_timeout,
    ));

    if transcoder.available().await {
        tracing::info!(encoder = %config.encoder_path.display(), "encoder binary found");
    } else {
        tracing::warn!(
            encoder = %config.encoder_path.display(),
            "encoder binary not responding; transcoded streaming will fail"
        );
    }

    // Deleted tracks drop their cached stream artifacts
    let mut deletions = catalog.subscribe_deletions();
    let invalidation_cache = cache.clone();
    tokio::spawn(async move {
        while let Ok(track_id) = deletions.recv().await {
            invalidation_cache.invalidate(track_id).await;
        }
    });

    // Background cache maintenance
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let janitor_handle = janitor::spawn(
        cache.clone(),
        gate.clone(),
        config.janitor_interval,
        shutdown_rx,
    );

    let cors = cors_layer(&config);
    let addr = format!("{}:{}", config.server_host, config.server_port);

    let app_state = Arc::new(AppState {
        config,
        auth_service,
        catalog,
        cache,
        gate,
        transcoder,
    });

    // Build router
    let app = Router::new()
        .nest(
            "/api/v1",
            Router::new()
                .nest("/auth", api::auth_routes())
                .merge(api::library_routes()),
        )
        // Media elements hit these directly, so they live at the root
        .merge(api::streaming_routes())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(app_state);

    // Start server
    tracing::info!("Starting server on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Stop background tasks before exit
    let _ = shutdown_tx.send(true);
    let _ = janitor_handle.await;
    tracing::info!("Shutdown complete");

    Ok(())
}

fn cors_layer(config: &Config) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE, header::RANGE]);

    if config.cors_origins.iter().any(|origin| origin == "*") {
        layer.allow_origin(Any)
    } else {
        let origins: Vec<HeaderValue> = config
            .cors_origins
            .iter()
            .filter_map(|origin| origin.parse().ok())
            .collect();
        layer.allow_origin(origins)
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
}
