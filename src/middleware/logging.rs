//! Request logging middleware.
//!
//! Logs every HTTP request with method, path, status code, and latency.
//! Ledger errors are already logged where they happen, so 4xx responses are
//! kept at DEBUG here.

use axum::{body::Body, http::Request, middleware::Next, response::Response};
use std::time::Instant;
use tracing::{debug, info, warn, Instrument};

pub async fn request_logging(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    // Skip logging for health checks to reduce noise
    if path == "/health" {
        return next.run(request).await;
    }

    let request_id = uuid::Uuid::new_v4();
    let span = tracing::info_span!(
        "http_request",
        %request_id,
        method = %method,
        path = %path,
        status = tracing::field::Empty,
        latency_ms = tracing::field::Empty,
    );

    let start = Instant::now();
    let response = next.run(request).instrument(span.clone()).await;
    let latency_ms = start.elapsed().as_millis() as u64;
    let status = response.status().as_u16();

    span.record("status", status);
    span.record("latency_ms", latency_ms);

    let _entered = span.enter();
    if status >= 500 {
        warn!(status, latency_ms, "Request failed (5xx)");
    } else if status >= 400 {
        debug!(status, latency_ms, "Request rejected (4xx)");
    } else {
        info!(status, latency_ms, "Request completed");
    }

    response
}
