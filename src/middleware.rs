use axum::{
    extract::{MatchedPath, Request, State},
    http::HeaderValue,
    middleware::Next,
    response::Response,
};
use std::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use crate::metrics::MetricsCollector;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Metrics bucket for requests that matched no route.
pub const UNMATCHED_ROUTE: &str = "unmatched";

/// Logs each request under a request id and records it in the metrics.
pub async fn tracking_middleware(
    State(metrics): State<MetricsCollector>,
    request: Request,
    next: Next,
) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|matched| matched.as_str().to_string())
        .unwrap_or_else(|| UNMATCHED_ROUTE.to_string());
    let request_id = request_id(&request);
    let started = Instant::now();

    debug!(
        target: "throttler_cluster::middleware",
        request_id = %request_id,
        method = %method,
        path = %path,
        "Incoming request"
    );

    let mut response = next.run(request).await;

    let status = response.status();
    let elapsed = started.elapsed();
    metrics.record_request(&route, status.as_u16(), elapsed).await;

    info!(
        target: "throttler_cluster::middleware",
        request_id = %request_id,
        method = %method,
        path = %path,
        status = %status,
        elapsed_ms = elapsed.as_millis() as u64,
        "Request completed"
    );

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

/// The caller's request id, or a fresh one.
fn request_id(request: &Request) -> String {
    request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}
