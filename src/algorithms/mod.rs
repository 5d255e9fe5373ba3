//! Rate limiting algorithms module
//!
//! Each algorithm reads and updates its bucket in the [`Cache`] while the
//! caller holds the cache lock. Dispatch is over the closed [`Algorithm`]
//! set; unknown wire ids are rejected per item.

mod leaky_bucket;
mod token_bucket;

use std::time::{SystemTime, UNIX_EPOCH};

use crate::cache::Cache;
use crate::error::{ThrottlerError, ThrottlerResult};
use crate::types::{Algorithm, RateLimitRequest, RateLimitResponse};

pub use leaky_bucket::{leaky_bucket, LeakyBucketState};
pub use token_bucket::{token_bucket, TokenBucketState};

/// Current time in epoch milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Applies the algorithm named by `req` against `cache`.
pub fn apply_algorithm(
    cache: &mut dyn Cache,
    req: &RateLimitRequest,
    now: u64,
) -> ThrottlerResult<RateLimitResponse> {
    if req.duration == 0 {
        return Err(ThrottlerError::ValidationError(
            "field 'duration' must be greater than zero".to_string(),
        ));
    }

    match Algorithm::from_id(req.algorithm) {
        Some(Algorithm::TokenBucket) => token_bucket(cache, req, now),
        Some(Algorithm::LeakyBucket) => leaky_bucket(cache, req, now),
        None => Err(ThrottlerError::InvalidAlgorithm(req.algorithm)),
    }
}
