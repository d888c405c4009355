//! Carmarket API Server

use axum::http::{header, HeaderName, HeaderValue, Method};
use carmarket_api::{create_router, AppState, Config};
use carmarket_payments::{PaymentsService, MIGRATOR};
use carmarket_shared::{create_pool, init_tracing};
use tower_http::cors::{AllowOrigin, CorsLayer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    init_tracing("info,carmarket_api=debug");

    tracing::info!("Starting Carmarket API Server v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;
    tracing::info!("Configuration loaded");

    tracing::info!("Connecting to database...");
    let pool = create_pool(&config.database_url).await?;
    tracing::info!("Database connection established");

    tracing::info!("Running database migrations...");
    MIGRATOR.run(&pool).await?;

    let payments = PaymentsService::from_env(pool)?;

    if config.run_poller_in_process {
        tracing::info!(
            interval_secs = payments.poller.config().interval.as_secs(),
            "Starting in-process status poller"
        );
        tokio::spawn(payments.poller.clone().run());
    }

    let allowed_origins: Vec<HeaderValue> = config
        .allowed_origins
        .iter()
        .filter_map(|o| match o.parse() {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!(origin = %o, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed_origins))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            HeaderName::from_static("x-webhook-secret"),
        ]);

    let app = create_router(AppState::new(payments)).layer(cors);

    tracing::info!("Starting server on {}", config.bind_address);
    let listener = tokio::net::TcpListener::bind(config.bind_address).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
