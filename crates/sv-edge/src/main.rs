//! surveyor backend edge — authenticated front door, network data model,
//! and downstream proxy.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sv_auth::TokenVerifier;
use sv_edge::config::EdgeConfig;
use sv_edge::networks::PgNetworkStore;
use sv_edge::proxy::ProxyClient;
use sv_edge::routes::{edge_router, EdgeState};
use sv_edge::verify::RemoteAuthVerifier;
use sv_quota::{EdgeThrottle, RatePolicy, ThrottleLayer};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    sv_telemetry::logging::init_logging("sv-edged", "info");

    let config = EdgeConfig::from_env();
    config.validate().context("invalid configuration")?;

    let verifier = Arc::new(
        TokenVerifier::new(&config.jwt_secret, &config.jwt_algorithm)
            .context("invalid token configuration")?,
    );

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&config.database_url)
        .await
        .context("failed to connect to database")?;
    info!("connected to database");

    let state = Arc::new(EdgeState {
        store: Arc::new(PgNetworkStore::new(pool)),
        verify: RemoteAuthVerifier::new(config.auth_service_url.clone(), verifier),
        proxy: ProxyClient::new(),
        config: std::sync::RwLock::new(config.clone()),
    });

    // The edge throttle refuses floods before any downstream is touched.
    let throttle = Arc::new(EdgeThrottle::new(
        RatePolicy::per_minute(600),
        RatePolicy::per_minute(120),
        RatePolicy::per_minute(60),
    ));

    let app = edge_router()
        .route("/healthz", axum::routing::get(healthz))
        .route("/ready", axum::routing::get(healthz))
        .layer(ThrottleLayer::new(throttle))
        .layer(build_cors(&config))
        .with_state(state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(addr, "edge listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("edge stopped");
    Ok(())
}

async fn healthz() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({"status": "healthy"}))
}

fn build_cors(config: &EdgeConfig) -> CorsLayer {
    let origins = config.cors_origins_list();
    if origins.iter().any(|o| o == "*") {
        warn!("CORS allows any origin");
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let parsed: Vec<_> = origins.iter().filter_map(|o| o.parse().ok()).collect();
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
