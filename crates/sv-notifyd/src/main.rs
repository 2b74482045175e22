//! surveyor notification service — policy evaluation, multi-channel
//! dispatch, anomaly baselining, and the scheduled-broadcast scheduler.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sv_auth::{TokenAuthenticator, TokenSigner, TokenVerifier};
use sv_notifyd::anomaly::AnomalyDetector;
use sv_notifyd::broadcast::BroadcastStore;
use sv_notifyd::channels::{DiscordChannel, EmailChannel, LogOnlyTransport};
use sv_notifyd::config::NotifyConfig;
use sv_notifyd::history::NotificationHistory;
use sv_notifyd::manager::NotificationManager;
use sv_notifyd::members::HttpNetworkMembers;
use sv_notifyd::prefs::PreferencesStore;
use sv_notifyd::routes::{notify_router, NotifyState};
use sv_telemetry::ShutdownSignal;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    sv_telemetry::logging::init_logging("sv-notifyd", "info");

    let config = NotifyConfig::from_env();
    config.validate().context("invalid configuration")?;

    let signer = TokenSigner::new(&config.jwt_secret, &config.jwt_algorithm)
        .context("invalid token configuration")?;
    let verifier = Arc::new(
        TokenVerifier::new(&config.jwt_secret, &config.jwt_algorithm)
            .context("invalid token configuration")?,
    );
    let service_token = signer
        .issue_service_token("notification-service")
        .context("cannot issue service token")?;

    let members = Arc::new(HttpNetworkMembers::new(
        config.backend_service_url.clone(),
        service_token,
    ));

    let manager = Arc::new(NotificationManager::new(
        PreferencesStore::load(&config.data_dir),
        NotificationHistory::load(&config.data_dir),
        BroadcastStore::load(&config.data_dir),
        AnomalyDetector::load(&config.data_dir),
        vec![
            Arc::new(EmailChannel::new(Arc::new(LogOnlyTransport))),
            Arc::new(DiscordChannel::new()),
        ],
        members,
    ));

    let migrated = manager.migrate_global_preferences().await;
    if migrated > 0 {
        info!(migrated, "global preference migration applied");
    }

    let shutdown = ShutdownSignal::new();
    let scheduler = manager.spawn_scheduler(
        Duration::from_secs(config.scheduler_interval_seconds),
        shutdown.clone(),
    );

    let state = Arc::new(NotifyState {
        manager: manager.clone(),
        authenticator: TokenAuthenticator::new(verifier),
        config: std::sync::RwLock::new(config.clone()),
    });

    let app = notify_router()
        .route("/healthz", axum::routing::get(healthz))
        .route("/ready", axum::routing::get(healthz))
        .layer(build_cors(&config))
        .with_state(state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(addr, "notification service listening");

    let server_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received, initiating shutdown");
            server_shutdown.trigger();
        }
    });

    let mut shutdown_rx = shutdown.subscribe();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
        })
        .await
        .context("server error")?;

    // Flush in-memory state before exit; the scheduler finishes its tick.
    let _ = scheduler.await;
    manager.anomaly.save_state();
    info!("notification service stopped");
    Ok(())
}

async fn healthz() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({"status": "healthy"}))
}

fn build_cors(config: &NotifyConfig) -> CorsLayer {
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
