//! Downstream request forwarding with uniform error translation.
//!
//! Successful responses mirror the upstream status and body. Failures map
//! onto the platform's error table: connect errors become 503, timeouts 504,
//! 429 passes its `Retry-After` through with a typed daily-limit detail, and
//! other upstream errors mirror their status with the JSON `detail` when one
//! can be extracted.

use std::time::Duration;

use axum::body::Body;
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures_util::StreamExt;
use serde_json::Value;
use sv_auth::{ApiError, AuthenticatedUser};
use tracing::{debug, warn};

/// Default per-call timeout for forwarded requests.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
/// Chat and speed test endpoints do real work upstream.
pub const LONG_TIMEOUT: Duration = Duration::from_secs(120);

// ---------------------------------------------------------------------------
// ProxyClient
// ---------------------------------------------------------------------------

pub struct ProxyClient {
    http: reqwest::Client,
}

impl ProxyClient {
    pub fn new() -> Self {
        let http = reqwest::Client::builder()
            .pool_idle_timeout(Duration::from_secs(60))
            .build()
            .unwrap_or_default();
        Self { http }
    }

    fn build_request(
        &self,
        method: Method,
        url: &str,
        headers: &HeaderMap,
        body: Bytes,
        user: Option<&AuthenticatedUser>,
        timeout: Duration,
    ) -> reqwest::RequestBuilder {
        let method = reqwest::Method::from_bytes(method.as_str().as_bytes())
            .unwrap_or(reqwest::Method::GET);
        let mut request = self.http.request(method, url).timeout(timeout);

        // Pass the caller's bearer straight through; downstream services do
        // their own verification.
        if let Some(authorization) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
            request = request.header("Authorization", authorization);
        }
        if let Some(content_type) = headers.get("content-type").and_then(|v| v.to_str().ok()) {
            request = request.header("Content-Type", content_type);
        }
        // Identity headers for downstreams that want the resolved user.
        if let Some(user) = user {
            request = request
                .header("X-User-Id", user.user_id.clone())
                .header("X-Username", user.username.clone());
        }
        if !body.is_empty() {
            request = request.body(body);
        }
        request
    }

    fn translate_send_error(err: reqwest::Error) -> ApiError {
        if err.is_timeout() {
            ApiError::UpstreamTimeout("Upstream service timeout".into())
        } else if err.is_connect() {
            ApiError::UpstreamUnavailable("Upstream service unavailable".into())
        } else {
            ApiError::Internal(err.to_string())
        }
    }

    /// Forward a request and buffer the response. Error statuses are
    /// translated; success mirrors status, content type, and body.
    pub async fn forward(
        &self,
        method: Method,
        url: &str,
        headers: &HeaderMap,
        body: Bytes,
        user: Option<&AuthenticatedUser>,
        timeout: Duration,
    ) -> Result<Response, ApiError> {
        debug!(url, "forwarding request");
        let response = self
            .build_request(method, url, headers, body, user, timeout)
            .send()
            .await
            .map_err(Self::translate_send_error)?;

        let status = response.status();
        if status.as_u16() >= 400 {
            return Err(translate_error_response(response).await);
        }

        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/json")
            .to_string();
        let payload = response
            .bytes()
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))?;

        Ok((
            StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::OK),
            [("Content-Type", content_type)],
            payload,
        )
            .into_response())
    }

    /// Forward a request whose response is a server-sent-event stream.
    ///
    /// Upstream bytes are piped through verbatim. An error raised while
    /// iterating the upstream body is emitted as a final
    /// `data: {"type":"error",...}` frame before both sockets close; a
    /// client disconnect drops the stream and with it the upstream socket.
    pub async fn forward_sse(
        &self,
        method: Method,
        url: &str,
        headers: &HeaderMap,
        body: Bytes,
        user: Option<&AuthenticatedUser>,
    ) -> Result<Response, ApiError> {
        debug!(url, "opening sse relay");
        let response = self
            .build_request(method, url, headers, body, user, LONG_TIMEOUT)
            .send()
            .await
            .map_err(Self::translate_send_error)?;

        if response.status().as_u16() >= 400 {
            return Err(translate_error_response(response).await);
        }

        let stream = response.bytes_stream().map(|chunk| match chunk {
            Ok(bytes) => Ok::<Bytes, std::convert::Infallible>(bytes),
            Err(e) => {
                warn!(error = %e, "sse upstream failed mid-stream");
                let frame = serde_json::json!({
                    "type": "error",
                    "message": "Upstream stream interrupted",
                });
                Ok(Bytes::from(format!("data: {frame}\n\n")))
            }
        });

        Ok((
            StatusCode::OK,
            [
                ("Content-Type", "text/event-stream"),
                ("Cache-Control", "no-cache"),
                ("X-Accel-Buffering", "no"),
            ],
            Body::from_stream(stream),
        )
            .into_response())
    }
}

impl Default for ProxyClient {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Error translation
// ---------------------------------------------------------------------------

async fn translate_error_response(response: reqwest::Response) -> ApiError {
    let status = response.status().as_u16();
    let retry_after = response
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    let detail = extract_detail(response).await;

    match status {
        429 => ApiError::RateLimited {
            detail: detail.unwrap_or_else(|| "Daily chat limit exceeded".into()),
            retry_after: retry_after.unwrap_or(0),
        },
        401 => ApiError::InvalidToken,
        403 => ApiError::Forbidden(detail.unwrap_or_else(|| "Forbidden".into())),
        404 => ApiError::NotFound(detail.unwrap_or_else(|| "Not found".into())),
        409 => ApiError::Conflict(detail.unwrap_or_else(|| "Conflict".into())),
        400 => ApiError::Validation(detail.unwrap_or_else(|| "Invalid request".into())),
        503 => ApiError::UpstreamUnavailable(
            detail.unwrap_or_else(|| "Upstream service unavailable".into()),
        ),
        504 => ApiError::UpstreamTimeout(detail.unwrap_or_else(|| "Upstream timeout".into())),
        _ => ApiError::Internal(detail.unwrap_or_else(|| format!("Upstream returned {status}"))),
    }
}

/// Pull a human detail out of a JSON error body when there is one.
async fn extract_detail(response: reqwest::Response) -> Option<String> {
    let payload = response.bytes().await.ok()?;
    let value: Value = serde_json::from_slice(&payload).ok()?;
    value
        .get("detail")
        .and_then(Value::as_str)
        .map(String::from)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
