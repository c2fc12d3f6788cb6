//! Axum middleware shared by the gateway and admin listeners.
//!
//! These are lightweight composable layers kept stateless to minimize
//! contention: request-ID propagation and request timing. The recovery
//! wrapper lives in the router assembly (`CatchPanicLayer`).
use std::time::Instant;

use axum::{extract::Request, http::HeaderValue, middleware::Next, response::Response};

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Echo the inbound `X-Request-ID` or mint a UUIDv4, expose it to tracing
/// and stamp it on the response.
pub async fn request_id_middleware(req: Request, next: Next) -> Response {
    let request_id = req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let span = crate::tracing_setup::create_request_span(
        req.method().as_str(),
        req.uri().path(),
        &request_id,
    );

    let mut response = {
        use tracing::Instrument;
        next.run(req).instrument(span.clone()).await
    };
    span.record("http.status_code", response.status().as_u16());

    if let Ok(header_value) = HeaderValue::from_str(&request_id) {
        response
            .headers_mut()
            .insert(REQUEST_ID_HEADER, header_value);
    }

    response
}

/// Log start/end of a request including latency.
pub async fn request_timing_middleware(req: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().clone();
    let uri = req.uri().clone();

    let response = next.run(req).await;
    let duration = start.elapsed();

    tracing::info!(
        method = %method,
        uri = %uri,
        status = response.status().as_u16(),
        duration_ms = duration.as_millis() as u64,
        "request completed"
    );

    response
}
