use crate::cache::{BucketState, Cache, CacheItem};
use crate::error::ThrottlerResult;
use crate::types::{Algorithm, RateLimitRequest, RateLimitResponse, Status};

/// Leaky bucket holding up to `limit` hits, draining `limit` hits per
/// `duration`.
#[derive(Debug, Clone, PartialEq)]
pub struct LeakyBucketState {
    pub limit: u64,
    pub duration: u64,
    pub remaining: f64,
    pub updated_at: u64,
}

impl LeakyBucketState {
    pub fn new(limit: u64, duration: u64, now: u64) -> Self {
        Self {
            limit,
            duration,
            remaining: limit as f64,
            updated_at: now,
        }
    }

    /// Capacity regained per millisecond.
    fn rate(&self) -> f64 {
        self.limit as f64 / self.duration.max(1) as f64
    }

    fn leak(&mut self, now: u64) {
        let elapsed = now.saturating_sub(self.updated_at) as f64;
        self.remaining = (self.remaining + elapsed * self.rate()).min(self.limit as f64);
        self.updated_at = now.max(self.updated_at);
    }

    fn millis_until(&self, capacity: f64) -> u64 {
        let rate = self.rate();
        if rate <= 0.0 {
            return self.duration;
        }
        let missing = (capacity - self.remaining).max(0.0);
        (missing / rate).ceil() as u64
    }

    pub fn set_limit(&mut self, limit: u64, duration: u64) {
        self.limit = limit;
        self.duration = duration;
        self.remaining = self.remaining.min(limit as f64);
    }

    pub fn take(&mut self, hits: u64, now: u64) -> RateLimitResponse {
        self.leak(now);

        let mut resp = RateLimitResponse {
            status: Status::UnderLimit,
            limit: self.limit,
            remaining: self.remaining.floor() as u64,
            reset_time: now + self.millis_until(self.limit as f64),
            ..Default::default()
        };

        let wanted = hits as f64;
        if hits > 0 && wanted > self.remaining {
            resp.status = Status::OverLimit;
            resp.reset_time = now + self.millis_until(wanted.min(self.limit as f64));
            return resp;
        }

        self.remaining -= wanted;
        resp.remaining = self.remaining.floor() as u64;
        resp.reset_time = now + self.millis_until(self.limit as f64);
        resp
    }
}

pub fn leaky_bucket(
    cache: &mut dyn Cache,
    req: &RateLimitRequest,
    now: u64,
) -> ThrottlerResult<RateLimitResponse> {
    let key = req.global_key();

    if let Some(item) = cache.get(&key, now) {
        if let BucketState::Leaky(bucket) = &mut item.state {
            if bucket.limit != req.limit || bucket.duration != req.duration {
                bucket.set_limit(req.limit, req.duration);
            }
            let resp = bucket.take(req.hits, now);
            item.expire_at = now.saturating_add(req.duration);
            return Ok(resp);
        }
    }

    let mut bucket = LeakyBucketState::new(req.limit, req.duration, now);
    let resp = bucket.take(req.hits, now);
    cache.add(
        key,
        CacheItem {
            algorithm: Algorithm::LeakyBucket,
            expire_at: now.saturating_add(req.duration),
            state: BucketState::Leaky(bucket),
        },
    );
    Ok(resp)
}
