//! Usage tracking middleware for surveyor HTTP surfaces.
//!
//! Records (endpoint, method, status, latency) for every request into an
//! in-memory buffer, which a background task flushes to the [`UsageTracker`]
//! in batches. Health probes and the usage endpoints themselves are excluded
//! so the tracker does not feed on its own traffic.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{Request, Response};
use chrono::Utc;
use tokio::sync::Notify;
use tower::{Layer, Service};
use tracing::debug;

use crate::usage::{EndpointUsageRecord, UsageTracker};

const EXCLUDED_PATHS: &[&str] = &["/", "/healthz", "/ready"];
const USAGE_PATH_PREFIX: &str = "/api/metrics/usage";

// ---------------------------------------------------------------------------
// UsageBuffer
// ---------------------------------------------------------------------------

/// Shared buffer between the middleware and its flush task.
struct UsageBuffer {
    records: Mutex<VecDeque<EndpointUsageRecord>>,
    batch_size: usize,
    flush_hint: Notify,
}

impl UsageBuffer {
    fn push(&self, record: EndpointUsageRecord) {
        let len = {
            let mut records = self.records.lock().expect("usage buffer lock poisoned");
            if records.len() >= 1000 {
                records.pop_front();
            }
            records.push_back(record);
            records.len()
        };
        if len >= self.batch_size {
            self.flush_hint.notify_one();
        }
    }

    fn drain(&self, max: usize) -> Vec<EndpointUsageRecord> {
        let mut records = self.records.lock().expect("usage buffer lock poisoned");
        let take = records.len().min(max);
        records.drain(..take).collect()
    }
}

// ---------------------------------------------------------------------------
// UsageTrackingLayer
// ---------------------------------------------------------------------------

/// A [`tower::Layer`] that wraps services with [`UsageTrackingMiddleware`].
///
/// Constructing the layer spawns the flush task; dropping every clone of the
/// layer and middleware lets the task end on its next tick.
#[derive(Clone)]
pub struct UsageTrackingLayer {
    service_name: Arc<String>,
    buffer: Arc<UsageBuffer>,
}

impl UsageTrackingLayer {
    pub fn new(
        service_name: impl Into<String>,
        tracker: Arc<UsageTracker>,
        batch_size: usize,
        batch_interval: Duration,
    ) -> Self {
        let buffer = Arc::new(UsageBuffer {
            records: Mutex::new(VecDeque::new()),
            batch_size: batch_size.max(1),
            flush_hint: Notify::new(),
        });

        let flush_buffer = Arc::downgrade(&buffer);
        tokio::spawn(async move {
            loop {
                let Some(buffer) = flush_buffer.upgrade() else {
                    break;
                };
                tokio::select! {
                    _ = tokio::time::sleep(batch_interval) => {}
                    _ = buffer.flush_hint.notified() => {}
                }
                let batch = buffer.drain(buffer.batch_size);
                drop(buffer);
                if !batch.is_empty() {
                    let stored = tracker.record_batch(&batch).await;
                    debug!(stored, total = batch.len(), "flushed usage batch");
                }
            }
        });

        Self {
            service_name: Arc::new(service_name.into()),
            buffer,
        }
    }
}

impl<S> Layer<S> for UsageTrackingLayer {
    type Service = UsageTrackingMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        UsageTrackingMiddleware {
            inner,
            service_name: self.service_name.clone(),
            buffer: self.buffer.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// UsageTrackingMiddleware
// ---------------------------------------------------------------------------

/// The actual middleware service produced by [`UsageTrackingLayer`].
#[derive(Clone)]
pub struct UsageTrackingMiddleware<S> {
    inner: S,
    service_name: Arc<String>,
    buffer: Arc<UsageBuffer>,
}

fn is_excluded(path: &str) -> bool {
    EXCLUDED_PATHS.contains(&path)
        || path.starts_with(USAGE_PATH_PREFIX)
        || path.starts_with("/docs")
        || path.starts_with("/openapi")
}

impl<S> Service<Request<Body>> for UsageTrackingMiddleware<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let mut inner = self.inner.clone();
        let service_name = self.service_name.clone();
        let buffer = self.buffer.clone();

        let path = req.uri().path().to_string();
        let method = req.method().to_string();

        Box::pin(async move {
            if is_excluded(&path) {
                return inner.call(req).await;
            }

            let started = Instant::now();
            let response = inner.call(req).await?;
            let response_time_ms = started.elapsed().as_secs_f64() * 1000.0;

            buffer.push(EndpointUsageRecord {
                service: (*service_name).clone(),
                method,
                endpoint: path,
                status_code: response.status().as_u16(),
                response_time_ms,
                timestamp: Utc::now(),
            });

            Ok(response)
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;
    use axum::Router;
    use sv_kv::MemoryKv;
    use tower::ServiceExt;

    fn test_app(tracker: Arc<UsageTracker>) -> Router {
        Router::new()
            .route("/api/things", get(|| async { "ok" }))
            .route("/healthz", get(|| async { "ok" }))
            .layer(UsageTrackingLayer::new(
                "test-service",
                tracker,
                1,
                Duration::from_millis(10),
            ))
    }

    #[tokio::test]
    async fn tracked_endpoint_lands_in_stats() {
        let kv = Arc::new(MemoryKv::new());
        let tracker = Arc::new(UsageTracker::new(kv));
        let app = test_app(tracker.clone());

        let req = Request::builder()
            .uri("/api/things")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), axum::http::StatusCode::OK);

        // Give the flush task a couple of ticks.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let stats = tracker.usage_stats(Some("test-service")).await.unwrap();
        assert_eq!(stats.total_requests, 1);
    }

    #[tokio::test]
    async fn health_probe_is_excluded() {
        let kv = Arc::new(MemoryKv::new());
        let tracker = Arc::new(UsageTracker::new(kv));
        let app = test_app(tracker.clone());

        let req = Request::builder()
            .uri("/healthz")
            .body(Body::empty())
            .unwrap();
        app.oneshot(req).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        let stats = tracker.usage_stats(None).await.unwrap();
        assert_eq!(stats.total_requests, 0);
    }

    #[test]
    fn exclusion_rules() {
        assert!(is_excluded("/"));
        assert!(is_excluded("/healthz"));
        assert!(is_excluded("/api/metrics/usage/record"));
        assert!(!is_excluded("/api/metrics/snapshot"));
    }
}
