use axum::{
    extract::{rejection::JsonRejection, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use std::sync::Arc;
use std::time::Duration;

use crate::dispatcher::Dispatcher;
use crate::error::ThrottlerError;
use crate::metrics::{MetricsCollector, MetricsSnapshot};
use crate::types::{
    GetPeerRateLimitsRequest, GetPeerRateLimitsResponse, GetRateLimitsRequest, GetRateLimitsResponse,
    HealthCheckResponse, UpdatePeerGlobalsRequest, UpdatePeerGlobalsResponse,
};

/// Caller deadline in milliseconds for the whole call.
pub const REQUEST_TIMEOUT_HEADER: &str = "x-request-timeout-ms";

/// Shared application state
pub type SharedState = Arc<AppState>;

pub struct AppState {
    pub dispatcher: Dispatcher,
    pub metrics: MetricsCollector,
    /// Ceiling for the deadline of a forwarded call.
    pub peer_timeout: Duration,
}

fn json_rejection(rejection: JsonRejection) -> ThrottlerError {
    if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ThrottlerError::PayloadTooLarge(rejection.body_text())
    } else {
        ThrottlerError::InvalidRequest(rejection.body_text())
    }
}

/// The caller's deadline from [`REQUEST_TIMEOUT_HEADER`], capped at `max`.
pub fn request_deadline(headers: &HeaderMap, max: Duration) -> Duration {
    headers
        .get(REQUEST_TIMEOUT_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(|ms| Duration::from_millis(ms).min(max))
        .unwrap_or(max)
}

/// Check a batch of rate limits, forwarding items this node does not own
pub async fn get_rate_limits(
    State(state): State<SharedState>,
    headers: HeaderMap,
    payload: Result<Json<GetRateLimitsRequest>, JsonRejection>,
) -> Result<Json<GetRateLimitsResponse>, ThrottlerError> {
    let Json(req) = payload.map_err(json_rejection)?;
    let deadline = request_deadline(&headers, state.peer_timeout);

    let responses = state.dispatcher.get_rate_limits(&req.requests, deadline).await?;
    Ok(Json(GetRateLimitsResponse { responses }))
}

/// Check a batch a peer has already determined this node owns
pub async fn get_peer_rate_limits(
    State(state): State<SharedState>,
    payload: Result<Json<GetPeerRateLimitsRequest>, JsonRejection>,
) -> Result<Json<GetPeerRateLimitsResponse>, ThrottlerError> {
    let Json(req) = payload.map_err(json_rejection)?;

    let rate_limits = state.dispatcher.get_peer_rate_limits(&req.requests)?;
    Ok(Json(GetPeerRateLimitsResponse { rate_limits }))
}

/// Reserved for global counter synchronisation; accepts and ignores the update.
pub async fn update_peer_globals(
    payload: Result<Json<UpdatePeerGlobalsRequest>, JsonRejection>,
) -> Result<Json<UpdatePeerGlobalsResponse>, ThrottlerError> {
    let Json(req) = payload.map_err(json_rejection)?;
    tracing::trace!(globals = req.globals.len(), "ignoring peer globals update");
    Ok(Json(UpdatePeerGlobalsResponse::default()))
}

/// Health check endpoint
pub async fn health_check(State(state): State<SharedState>) -> Json<HealthCheckResponse> {
    Json(state.dispatcher.coordinator().health().await)
}

pub async fn metrics(State(state): State<SharedState>) -> Json<MetricsSnapshot> {
    Json(state.metrics.snapshot().await)
}
