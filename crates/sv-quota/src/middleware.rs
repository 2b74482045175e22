//! Edge throttling middleware.
//!
//! Runs every request through the three-tier [`EdgeThrottle`] (global,
//! per-client, per-endpoint) before it reaches a router. A refused request
//! gets HTTP 429 with a `Retry-After` header. The client scope comes from
//! `X-Forwarded-For` (first entry) or `X-Real-IP`, falling back to
//! `"unknown"`.

use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::{Request, Response, StatusCode};
use axum::response::IntoResponse;
use tower::{Layer, Service};
use tracing::warn;

use crate::throttle::EdgeThrottle;

// ---------------------------------------------------------------------------
// ThrottleLayer
// ---------------------------------------------------------------------------

/// A [`tower::Layer`] that wraps services with [`ThrottleMiddleware`].
#[derive(Clone)]
pub struct ThrottleLayer {
    throttle: Arc<EdgeThrottle>,
}

impl ThrottleLayer {
    pub fn new(throttle: Arc<EdgeThrottle>) -> Self {
        Self { throttle }
    }
}

impl<S> Layer<S> for ThrottleLayer {
    type Service = ThrottleMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ThrottleMiddleware {
            inner,
            throttle: self.throttle.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// ThrottleMiddleware
// ---------------------------------------------------------------------------

/// The actual middleware service produced by [`ThrottleLayer`].
#[derive(Clone)]
pub struct ThrottleMiddleware<S> {
    inner: S,
    throttle: Arc<EdgeThrottle>,
}

impl<S> Service<Request<Body>> for ThrottleMiddleware<S>
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
        let throttle = self.throttle.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let client = req
                .headers()
                .get("x-forwarded-for")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.split(',').next())
                .map(|s| s.trim().to_string())
                .or_else(|| {
                    req.headers()
                        .get("x-real-ip")
                        .and_then(|v| v.to_str().ok())
                        .map(|s| s.to_string())
                })
                .unwrap_or_else(|| "unknown".to_string());

            let endpoint = req.uri().path().to_string();

            match throttle.admit(&client, &endpoint) {
                Ok(()) => inner.call(req).await,
                Err(err) => {
                    warn!(client, endpoint, error = %err, "edge throttle refused request");

                    let retry_after_secs = err.retry_in.as_secs().max(1);
                    let resp = (
                        StatusCode::TOO_MANY_REQUESTS,
                        [("Retry-After", retry_after_secs.to_string())],
                        axum::Json(serde_json::json!({
                            "detail": "Too many requests",
                            "retry_after": retry_after_secs,
                        })),
                    )
                        .into_response();
                    Ok(resp)
                }
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::throttle::RatePolicy;
    use axum::routing::get;
    use axum::Router;
    use tower::ServiceExt;

    fn test_router(throttle: Arc<EdgeThrottle>) -> Router {
        Router::new()
            .route("/ping", get(|| async { "pong" }))
            .layer(ThrottleLayer::new(throttle))
    }

    #[tokio::test]
    async fn allows_requests_within_limit() {
        let throttle = Arc::new(EdgeThrottle::new(
            RatePolicy::per_second(100),
            RatePolicy::per_second(10),
            RatePolicy::per_second(5),
        ));
        let app = test_router(throttle);

        for _ in 0..2 {
            let req = Request::builder().uri("/ping").body(Body::empty()).unwrap();
            let resp = app.clone().oneshot(req).await.unwrap();
            assert_eq!(resp.status(), StatusCode::OK);
        }
    }

    #[tokio::test]
    async fn refuses_floods_with_retry_after() {
        let throttle = Arc::new(EdgeThrottle::new(
            RatePolicy::per_second(100),
            RatePolicy::per_second(100),
            RatePolicy::per_second(2),
        ));
        let app = test_router(throttle);

        for _ in 0..2 {
            let req = Request::builder().uri("/ping").body(Body::empty()).unwrap();
            let resp = app.clone().oneshot(req).await.unwrap();
            assert_eq!(resp.status(), StatusCode::OK);
        }

        let req = Request::builder().uri("/ping").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        let retry_after = resp.headers().get("retry-after").unwrap();
        assert!(retry_after.to_str().unwrap().parse::<u64>().unwrap() >= 1);
    }

    #[tokio::test]
    async fn clients_are_throttled_separately() {
        let throttle = Arc::new(EdgeThrottle::new(
            RatePolicy::per_second(100),
            RatePolicy::per_second(1),
            RatePolicy::per_second(100),
        ));
        let app = test_router(throttle);

        let req = Request::builder()
            .uri("/ping")
            .header("X-Forwarded-For", "10.0.0.1")
            .body(Body::empty())
            .unwrap();
        assert_eq!(app.clone().oneshot(req).await.unwrap().status(), StatusCode::OK);

        // Same client trips its own budget.
        let req = Request::builder()
            .uri("/ping")
            .header("X-Forwarded-For", "10.0.0.1")
            .body(Body::empty())
            .unwrap();
        assert_eq!(
            app.clone().oneshot(req).await.unwrap().status(),
            StatusCode::TOO_MANY_REQUESTS
        );

        // A different client is unaffected.
        let req = Request::builder()
            .uri("/ping")
            .header("X-Forwarded-For", "10.0.0.2")
            .body(Body::empty())
            .unwrap();
        assert_eq!(app.oneshot(req).await.unwrap().status(), StatusCode::OK);
    }
}
