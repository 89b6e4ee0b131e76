//! Binary entry point: wires a Postgres-backed job engine to the HTTP
//! edge and starts the background reap/cleanup loops alongside it.

use std::env;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use conveyor_core::{
    spawn_cleanup_loop, spawn_reap_loop, Config, HandlerRegistry, Intake,
};
use conveyor_core::{CleanupOptions, HandlerFailure};
use conveyor_postgres::{PgJobStore, PgRateLimiter};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn config_from_env() -> Config {
    let mut config = Config::default();
    if let Ok(v) = env::var("CONVEYOR_RATE_MAX") {
        if let Ok(n) = v.parse() {
            config.rate_max = n;
        }
    }
    if let Ok(v) = env::var("CONVEYOR_LEASE_TIMEOUT_SECONDS") {
        if let Ok(n) = v.parse() {
            config.lease_timeout = Duration::from_secs(n);
        }
    }
    if let Ok(v) = env::var("CONVEYOR_DEFAULT_MAX_ATTEMPTS") {
        if let Ok(n) = v.parse() {
            config.default_max_attempts = n;
        }
    }
    config
}

/// A handler for demonstration/smoke-testing purposes only: echoes its
/// payload back as the result. Real deployments register their own
/// handlers before calling `router`.
async fn echo_handler(
    payload: serde_json::Value,
    _job: conveyor_core::Job,
    _cascade: Arc<dyn conveyor_core::Cascade>,
) -> Result<serde_json::Value, HandlerFailure> {
    Ok(payload)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,conveyor_http=debug,conveyor_core=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let database_url = env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&database_url)
        .await
        .context("failed to connect to database")?;

    let config = config_from_env();

    let store = Arc::new(PgJobStore::new(pool.clone()));
    let rate_limiter = Arc::new(PgRateLimiter::new(pool, config.rate_max));

    let mut registry = HandlerRegistry::new();
    registry.register("echo", |payload, job, cascade| {
        echo_handler(payload, job, cascade)
    });
    let registry = Arc::new(registry);

    spawn_reap_loop(store.clone(), config.lease_timeout, Duration::from_secs(60));
    spawn_cleanup_loop(
        store.clone(),
        CleanupOptions::from_config(&config),
        Duration::from_secs(3600),
    );

    let intake = Intake::new(store, rate_limiter, registry, config);
    let app = conveyor_http::router(conveyor_http::AppState { intake });

    let port: u16 = env::var("PORT")
        .unwrap_or_else(|_| "8080".to_string())
        .parse()
        .context("PORT must be a valid number")?;
    let addr = format!("0.0.0.0:{port}");
    tracing::info!(%addr, "conveyor-http listening");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("failed to bind listener")?;
    axum::serve(listener, app)
        .await
        .context("server error")?;

    Ok(())
}
