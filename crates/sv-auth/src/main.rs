//! surveyor auth service — issues and verifies bearer tokens, resolves
//! users, and serves the authentication HTTP surface.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sv_auth::config::AuthConfig;
use sv_auth::routes::{auth_router, AuthState};
use sv_auth::store::PgUserStore;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    sv_telemetry::logging::init_logging("sv-authd", "info");

    let config = AuthConfig::from_env();
    config.validate().context("invalid configuration")?;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&config.database_url)
        .await
        .context("failed to connect to database")?;
    info!("connected to database");

    let store = Arc::new(PgUserStore::new(pool));
    let state = Arc::new(AuthState::new(store, config.clone()).context("invalid token config")?);

    let cors = build_cors(&config);
    let app = auth_router()
        .route("/healthz", axum::routing::get(healthz))
        .route("/ready", axum::routing::get(healthz))
        .layer(cors)
        .with_state(state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(addr, "auth service listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("auth service stopped");
    Ok(())
}

async fn healthz() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({"status": "healthy"}))
}

fn build_cors(config: &AuthConfig) -> CorsLayer {
    let origins = config.cors_origins_list();
    if origins.iter().any(|o| o == "*") {
        warn!("CORS allows any origin");
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let parsed: Vec<_> = origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(parsed))
            .allow_methods(Any)
            .allow_headers(Any)
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for ctrl-c");
        return;
    }
    info!("ctrl-c received, shutting down");
}
