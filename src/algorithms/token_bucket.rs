use crate::cache::{BucketState, Cache, CacheItem};
use crate::error::ThrottlerResult;
use crate::types::{Algorithm, RateLimitRequest, RateLimitResponse, Status};

/// Fixed-window token bucket: `limit` tokens per `duration` starting at the
/// first hit.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenBucketState {
    pub limit: u64,
    pub remaining: u64,
    pub duration: u64,
    pub reset_time: u64,
}

impl TokenBucketState {
    pub fn new(limit: u64, duration: u64, now: u64) -> Self {
        Self {
            limit,
            remaining: limit,
            duration,
            reset_time: now.saturating_add(duration),
        }
    }

    /// Moves `remaining` by the change in limit, capped at the new limit.
    pub fn set_limit(&mut self, limit: u64) {
        if limit > self.limit {
            self.remaining = self.remaining.saturating_add(limit - self.limit);
        } else {
            self.remaining = self.remaining.saturating_sub(self.limit - limit);
        }
        self.limit = limit;
        self.remaining = self.remaining.min(limit);
    }

    pub fn take(&mut self, hits: u64) -> RateLimitResponse {
        let mut resp = RateLimitResponse {
            status: Status::UnderLimit,
            limit: self.limit,
            remaining: self.remaining,
            reset_time: self.reset_time,
            ..Default::default()
        };

        if hits == 0 {
            if self.remaining == 0 {
                resp.status = Status::OverLimit;
            }
            return resp;
        }

        if hits > self.remaining {
            resp.status = Status::OverLimit;
            return resp;
        }

        self.remaining -= hits;
        resp.remaining = self.remaining;
        resp
    }
}

pub fn token_bucket(
    cache: &mut dyn Cache,
    req: &RateLimitRequest,
    now: u64,
) -> ThrottlerResult<RateLimitResponse> {
    let key = req.global_key();

    if let Some(CacheItem {
        state: BucketState::Token(bucket),
        ..
    }) = cache.get(&key, now)
    {
        // A changed duration starts a new window below.
        if bucket.duration == req.duration {
            if bucket.limit != req.limit {
                bucket.set_limit(req.limit);
            }
            return Ok(bucket.take(req.hits));
        }
    }

    let mut bucket = TokenBucketState::new(req.limit, req.duration, now);
    let resp = bucket.take(req.hits);
    cache.add(
        key,
        CacheItem {
            algorithm: Algorithm::TokenBucket,
            expire_at: bucket.reset_time,
            state: BucketState::Token(bucket),
        },
    );
    Ok(resp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;

    fn request(hits: u64, limit: u64) -> RateLimitRequest {
        RateLimitRequest::new("test", "account:1")
            .with_hits(hits)
            .with_limit(limit, 1_000)
    }

    #[test]
    fn test_token_consumption() {
        let mut cache = MemoryCache::new(10);

        let resp = token_bucket(&mut cache, &request(5, 10), 0).unwrap();
        assert_eq!(resp.status, Status::UnderLimit);
        assert_eq!(resp.remaining, 5);
        assert_eq!(resp.reset_time, 1_000);

        let resp = token_bucket(&mut cache, &request(5, 10), 10).unwrap();
        assert_eq!(resp.remaining, 0);

        let resp = token_bucket(&mut cache, &request(1, 10), 20).unwrap();
        assert_eq!(resp.status, Status::OverLimit);
        assert_eq!(resp.remaining, 0);
    }

    #[test]
    fn test_over_limit_does_not_consume() {
        let mut cache = MemoryCache::new(10);
        token_bucket(&mut cache, &request(8, 10), 0).unwrap();

        let resp = token_bucket(&mut cache, &request(5, 10), 1).unwrap();
        assert_eq!(resp.status, Status::OverLimit);
        assert_eq!(resp.remaining, 2);

        let resp = token_bucket(&mut cache, &request(2, 10), 2).unwrap();
        assert_eq!(resp.status, Status::UnderLimit);
        assert_eq!(resp.remaining, 0);
    }

    #[test]
    fn test_zero_hits_queries_without_consuming() {
        let mut cache = MemoryCache::new(10);
        token_bucket(&mut cache, &request(3, 10), 0).unwrap();

        let resp = token_bucket(&mut cache, &request(0, 10), 1).unwrap();
        assert_eq!(resp.remaining, 7);
        let resp = token_bucket(&mut cache, &request(0, 10), 2).unwrap();
        assert_eq!(resp.remaining, 7);
    }

    #[test]
    fn test_window_resets_after_duration() {
        let mut cache = MemoryCache::new(10);
        token_bucket(&mut cache, &request(10, 10), 0).unwrap();

        let resp = token_bucket(&mut cache, &request(1, 10), 1_000).unwrap();
        assert_eq!(resp.status, Status::UnderLimit);
        assert_eq!(resp.remaining, 9);
        assert_eq!(resp.reset_time, 2_000);
    }

    #[test]
    fn test_limit_change_adjusts_remaining() {
        let mut cache = MemoryCache::new(10);
        token_bucket(&mut cache, &request(4, 10), 0).unwrap();

        let resp = token_bucket(&mut cache, &request(0, 20), 1).unwrap();
        assert_eq!(resp.limit, 20);
        assert_eq!(resp.remaining, 16);

        let resp = token_bucket(&mut cache, &request(0, 5), 2).unwrap();
        assert_eq!(resp.limit, 5);
        assert_eq!(resp.remaining, 1);
    }

    #[test]
    fn test_hits_above_limit_on_new_bucket() {
        let mut cache = MemoryCache::new(10);
        let resp = token_bucket(&mut cache, &request(11, 10), 0).unwrap();
        assert_eq!(resp.status, Status::OverLimit);
        assert_eq!(resp.remaining, 10);
    }
}
