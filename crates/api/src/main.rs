//! Subledger API Server

use std::net::SocketAddr;

use axum::http::{header, HeaderName, HeaderValue, Method};
use subledger_api::{create_router, AppState, Config};
use subledger_billing::BillingService;
use subledger_shared::{create_pool, init_tracing, run_migrations};
use tower_http::{
    compression::CompressionLayer,
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    init_tracing("info,subledger_api=debug,subledger_billing=debug");

    tracing::info!("Starting Subledger API Server v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;
    tracing::info!("Configuration loaded");

    let pool = create_pool(&config.database_url).await?;
    run_migrations(&pool).await?;

    let billing = BillingService::from_env(pool)?;
    tracing::info!("Billing service initialized");

    let allowed_origins: Vec<HeaderValue> = config
        .allowed_origins
        .iter()
        .filter_map(|s| s.parse().ok())
        .collect();
    tracing::info!(
        allowed_origins = ?allowed_origins,
        "CORS configured with {} allowed origins",
        allowed_origins.len()
    );

    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed_origins))
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            header::ACCEPT,
            HeaderName::from_static("x-customer-id"),
            HeaderName::from_static("x-role"),
        ])
        .expose_headers([header::CONTENT_TYPE]);

    let addr: SocketAddr = config.bind_address.parse()?;
    let state = AppState::new(billing, config);

    let app = create_router(state)
        .layer(cors)
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http());

    tracing::info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
