//! Per-batch entry point: routes every item to its owner and assembles one
//! result per item.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::algorithms::{apply_algorithm, now_ms};
use crate::cache::SharedCache;
use crate::error::{ThrottlerError, ThrottlerResult};
use crate::membership::Coordinator;
use crate::metrics::{CheckPath, MetricsCollector};
use crate::types::{RateLimitRequest, RateLimitResponse, OWNER_METADATA_KEY};
use crate::validation::RequestValidator;

pub struct Dispatcher {
    coordinator: Arc<Coordinator>,
    cache: SharedCache,
    metrics: MetricsCollector,
    max_batch_size: usize,
}

impl Dispatcher {
    pub fn new(
        coordinator: Arc<Coordinator>,
        cache: SharedCache,
        metrics: MetricsCollector,
        max_batch_size: usize,
    ) -> Self {
        Self {
            coordinator,
            cache,
            metrics,
            max_batch_size,
        }
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    /// Checks every item in `requests`, locally or on the owning peer.
    ///
    /// Only an oversized batch fails the call. Every other failure is
    /// reported in that item's `error`, and the result has one entry per
    /// request in request order. `timeout` bounds the whole batch: items
    /// forwarded after it has passed fail without waiting on their peer.
    pub async fn get_rate_limits(
        &self,
        requests: &[RateLimitRequest],
        timeout: Duration,
    ) -> ThrottlerResult<Vec<RateLimitResponse>> {
        RequestValidator::validate_batch_size("requests", requests.len(), self.max_batch_size)?;
        let deadline = Instant::now() + timeout;

        // TODO: fan out forwarded items per peer concurrently instead of one call per item
        let mut responses = Vec::with_capacity(requests.len());
        for req in requests {
            responses.push(self.check(req, deadline).await);
        }
        Ok(responses)
    }

    /// Applies the local algorithm to a batch a peer has already routed here.
    pub fn get_peer_rate_limits(
        &self,
        requests: &[RateLimitRequest],
    ) -> ThrottlerResult<Vec<RateLimitResponse>> {
        RequestValidator::validate_batch_size("rate_limits", requests.len(), self.max_batch_size)?;

        Ok(requests
            .iter()
            .map(|req| {
                let resp = self
                    .apply_local(req)
                    .unwrap_or_else(|e| RateLimitResponse::from_error(e.to_string()));
                self.metrics.record_check(CheckPath::Local, &resp);
                resp
            })
            .collect())
    }

    async fn check(&self, req: &RateLimitRequest, deadline: Instant) -> RateLimitResponse {
        if let Err(msg) = RequestValidator::validate_item(req) {
            self.metrics.record_check_error();
            return RateLimitResponse::from_error(msg);
        }

        let key = req.global_key();
        let peer = match self.coordinator.pick(&key).await {
            Ok(peer) => peer,
            Err(e) => {
                self.metrics.record_check_error();
                return RateLimitResponse::from_error(format!(
                    "while finding peer that owns rate limit '{}' - '{}'",
                    key, e
                ));
            }
        };

        if peer.is_owner() {
            let resp = self.apply_local(req).unwrap_or_else(|e| {
                RateLimitResponse::from_error(format!(
                    "while applying rate limit for '{}' - '{}'",
                    key, e
                ))
            });
            self.metrics.record_check(CheckPath::Local, &resp);
            return resp;
        }

        let resp = match peer.get_peer_rate_limit(req, deadline).await {
            Ok(mut resp) => {
                resp.metadata
                    .insert(OWNER_METADATA_KEY.to_string(), peer.address().to_string());
                resp
            }
            Err(e) => {
                tracing::debug!(key = %key, peer = %peer.address(), error = %e, "forwarded check failed");
                RateLimitResponse::from_error(format!(
                    "while fetching rate limit '{}' from peer '{}' - '{}'",
                    key,
                    peer.address(),
                    e
                ))
            }
        };
        self.metrics.record_check(CheckPath::Forwarded, &resp);
        resp
    }

    fn apply_local(&self, req: &RateLimitRequest) -> ThrottlerResult<RateLimitResponse> {
        let mut cache = self
            .cache
            .lock()
            .map_err(|_| ThrottlerError::InternalError("Failed to acquire cache lock".to_string()))?;
        apply_algorithm(&mut **cache, req, now_ms())
    }
}
