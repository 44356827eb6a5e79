use axum::routing::get;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use std::time::Duration;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use preview_service::app_state::AppState;
use preview_service::config::AppConfig;
use preview_service::db::{self, queries::{PgFileCatalog, PgJobStore}};
use preview_service::routes;
use preview_service::services::{
    converter::ConversionClient,
    pipeline::{Dependencies, PreviewPipeline},
    replay::{RedisReplayStore, ReplayGuard, ReplayStore},
    storage::R2Client,
    token::TokenIssuer,
};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let config = AppConfig::from_env()?;
    let settings = config.pipeline_settings();

    tracing::info!("Initializing preview-service");

    let prometheus_handle = Arc::new(PrometheusBuilder::new().install_recorder()?);
    routes::metrics::describe();

    tracing::info!("Connecting to PostgreSQL database");
    let db_pool = db::init_pool(&config.database_url).await?;

    tracing::info!("Running database migrations");
    db::run_migrations(&db_pool).await?;

    tracing::info!("Initializing R2 storage client");
    let storage = R2Client::new(
        &config.r2_bucket,
        &config.r2_endpoint,
        &config.r2_access_key,
        &config.r2_secret_key,
    )?;

    let converter = ConversionClient::new(&config.converter_url, settings.conversion_timeout)?;
    tracing::info!(endpoint = converter.endpoint(), "Conversion client ready");

    let tokens = TokenIssuer::from_base64(&config.preview_token_secret)?;

    let redis = match &config.redis_url {
        Some(url) => {
            tracing::info!("Tracking token nonces in Redis");
            Some(Arc::new(RedisReplayStore::new(url)?))
        }
        None => {
            tracing::info!("Tracking token nonces in process memory");
            None
        }
    };
    let replay: Arc<dyn ReplayStore> = match &redis {
        Some(store) => store.clone(),
        None => Arc::new(ReplayGuard::new()),
    };

    let store = Arc::new(PgJobStore::new(db_pool.clone()));
    let deps = Dependencies {
        store: store.clone(),
        files: Arc::new(PgFileCatalog::new(db_pool)),
        storage: Arc::new(storage),
        converter: Arc::new(converter),
        tokens: Arc::new(tokens),
        replay,
    };

    let pipeline = PreviewPipeline::new(deps, settings);
    pipeline.start();

    let state = AppState::new(&pipeline, store, redis);

    let app = routes::router(state)
        .route(
            "/metrics",
            get(routes::metrics::prometheus_metrics).with_state(prometheus_handle),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(RequestBodyLimitLayer::new(64 * 1024));

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("HTTP server stopped, draining pipeline");
    if tokio::time::timeout(Duration::from_secs(10), pipeline.shutdown())
        .await
        .is_err()
    {
        tracing::warn!("Pipeline shutdown timed out");
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
