//! surveyor metrics service — aggregates collector data into topology
//! snapshots, publishes them on the bus, and serves the WebSocket gateway.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sv_metricsd::aggregator::Aggregator;
use sv_metricsd::config::MetricsConfig;
use sv_metricsd::hub::SnapshotHub;
use sv_metricsd::publisher::BusPublisher;
use sv_metricsd::routes::{metrics_router, MetricsState};
use sv_metricsd::upstream::UpstreamClient;
use sv_auth::{TokenAuthenticator, TokenSigner, TokenVerifier};
use sv_kv::{Kv, RedisKv};
use sv_telemetry::{ShutdownSignal, UsageTracker, UsageTrackingLayer};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    sv_telemetry::logging::init_logging("sv-metricsd", "info");

    let config = MetricsConfig::from_env();
    config.validate().context("invalid configuration")?;

    let signer = TokenSigner::new(&config.jwt_secret, &config.jwt_algorithm)
        .context("invalid token configuration")?;
    let verifier = Arc::new(
        TokenVerifier::new(&config.jwt_secret, &config.jwt_algorithm)
            .context("invalid token configuration")?,
    );

    let kv: Arc<dyn Kv> = Arc::new(
        RedisKv::connect(&config.redis_url)
            .await
            .context("failed to connect to kv store")?,
    );

    let upstream = Arc::new(UpstreamClient::new(&config, &signer).context("upstream client")?);
    let aggregator = Arc::new(Aggregator::new(upstream, config.metrics_publish_interval));
    let publisher = Arc::new(BusPublisher::new(kv.clone()));
    let hub = SnapshotHub::new();
    let usage = Arc::new(UsageTracker::new(kv.clone()));
    let shutdown = ShutdownSignal::new();

    hub.spawn_bus_listener(kv.clone(), shutdown.clone());

    // Initial snapshots are generated synchronously so /api/metrics/snapshot
    // is answerable the moment the listener opens.
    info!("generating initial snapshots for all networks");
    let initial = aggregator.generate_all_snapshots().await;
    if initial.is_empty() {
        warn!("no initial snapshots generated; networks may not exist yet");
    } else {
        let total_nodes: usize = initial.values().map(|s| s.total_nodes).sum();
        info!(
            networks = initial.len(),
            total_nodes, "initial snapshots ready"
        );
        for snapshot in initial.values() {
            publisher.store_last_snapshot(snapshot).await;
            publisher.publish_topology_snapshot(snapshot).await;
        }
    }

    spawn_publish_loop(aggregator.clone(), publisher.clone(), shutdown.clone());

    let state = Arc::new(MetricsState {
        aggregator,
        publisher,
        hub,
        usage: usage.clone(),
        authenticator: TokenAuthenticator::new(verifier),
        config: std::sync::RwLock::new(config.clone()),
    });

    let usage_layer = UsageTrackingLayer::new(
        "metrics-service",
        usage,
        config.usage_batch_size,
        Duration::from_secs_f64(config.usage_batch_interval_seconds),
    );

    let app = metrics_router()
        .route("/healthz", axum::routing::get(healthz))
        .route("/ready", axum::routing::get(healthz))
        .layer(usage_layer)
        .layer(build_cors(&config))
        .with_state(state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(addr, "metrics service listening");

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

    info!("metrics service stopped");
    Ok(())
}

/// Background publish loop: sleep one interval, publish every network's
/// snapshot, repeat. A cycle that finds the previous one still in flight is
/// skipped; failures are logged and retried on the next interval.
fn spawn_publish_loop(
    aggregator: Arc<Aggregator>,
    publisher: Arc<BusPublisher>,
    shutdown: ShutdownSignal,
) {
    tokio::spawn(async move {
        info!(
            interval = aggregator.publish_interval_secs(),
            "metrics publish loop started"
        );
        let mut shutdown_rx = shutdown.subscribe();

        loop {
            let interval = Duration::from_secs(aggregator.publish_interval_secs());
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("publish loop stopping");
                    break;
                }
                _ = tokio::time::sleep(interval) => {}
            }

            if !aggregator.publishing_enabled() {
                continue;
            }
            if !aggregator.try_begin_publish() {
                warn!("previous publish cycle still running, skipping this one");
                continue;
            }

            let snapshots = aggregator.generate_all_snapshots().await;
            for snapshot in snapshots.values() {
                if publisher.publish_topology_snapshot(snapshot).await {
                    publisher.store_last_snapshot(snapshot).await;
                } else {
                    error!(
                        network_id = snapshot.network_id.as_deref().unwrap_or("default"),
                        "publish failed; will retry next interval"
                    );
                }
            }
            aggregator.end_publish();
        }
    });
}

async fn healthz() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({"status": "healthy"}))
}

fn build_cors(config: &MetricsConfig) -> CorsLayer {
    let origins = config.cors_origins_list();
    if origins.iter().any(|o| o == "*") {
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
