use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cache::SharedCache;
use crate::error::ThrottlerResult;
use crate::types::{RateLimitResponse, Status};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RouteMetrics {
    pub total_requests: u64,
    pub error_responses: u64,
    pub total_latency_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CheckMetrics {
    pub local: u64,
    pub forwarded: u64,
    pub errors: u64,
    pub over_limit: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub routes: HashMap<String, RouteMetrics>,
    pub checks: CheckMetrics,
    pub cache_size: u64,
}

/// Where a rate limit decision was made.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckPath {
    Local,
    Forwarded,
}

#[derive(Default)]
struct CheckCounters {
    local: AtomicU64,
    forwarded: AtomicU64,
    errors: AtomicU64,
    over_limit: AtomicU64,
}

struct Inner {
    routes: RwLock<HashMap<String, RouteMetrics>>,
    checks: CheckCounters,
    cache_size: AtomicU64,
    cache: Mutex<Option<SharedCache>>,
    interval: Duration,
    sampler: Mutex<Option<Sampler>>,
}

/// A running sampler task and the token that stops it.
struct Sampler {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Collects transport and cache statistics.
#[derive(Clone)]
pub struct MetricsCollector {
    inner: Arc<Inner>,
}

impl MetricsCollector {
    pub fn new(interval: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                routes: RwLock::new(HashMap::new()),
                checks: CheckCounters::default(),
                cache_size: AtomicU64::new(0),
                cache: Mutex::new(None),
                interval: interval.max(Duration::from_millis(10)),
                sampler: Mutex::new(None),
            }),
        }
    }

    /// Samples the size of `cache` while the collector runs.
    pub fn register_cache_stats(&self, cache: SharedCache) {
        if let Ok(mut slot) = self.inner.cache.lock() {
            *slot = Some(cache);
        }
    }

    /// Starts the background sampler; a no-op while it is already running.
    pub fn start(&self) -> ThrottlerResult<()> {
        let mut sampler = self.inner.sampler.lock().map_err(|_| {
            crate::error::ThrottlerError::InternalError("metrics sampler lock poisoned".to_string())
        })?;
        if sampler.is_some() {
            return Ok(());
        }

        let collector = self.clone();
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(collector.inner.interval);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => collector.sample_cache(),
                }
            }
            tracing::debug!("metrics sampler stopped");
        });
        *sampler = Some(Sampler { cancel, handle });
        Ok(())
    }

    /// Stops the sampler and waits for it to exit.
    pub async fn stop(&self) {
        let sampler = self.inner.sampler.lock().ok().and_then(|mut s| s.take());
        if let Some(Sampler { cancel, handle }) = sampler {
            cancel.cancel();
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "metrics sampler task failed");
            }
        }
    }

    pub fn sample_cache(&self) {
        let cache = self.inner.cache.lock().ok().and_then(|slot| slot.clone());
        if let Some(cache) = cache {
            if let Ok(cache) = cache.lock() {
                self.inner
                    .cache_size
                    .store(cache.len() as u64, Ordering::Relaxed);
            }
        }
    }

    pub async fn record_request(&self, route: &str, status: u16, latency: Duration) {
        let mut routes = self.inner.routes.write().await;
        let metrics = routes.entry(route.to_string()).or_default();
        metrics.total_requests += 1;
        if status >= 400 {
            metrics.error_responses += 1;
        }
        metrics.total_latency_ms += latency.as_millis() as u64;
    }

    pub fn record_check(&self, path: CheckPath, resp: &RateLimitResponse) {
        let checks = &self.inner.checks;
        if resp.error.is_some() {
            checks.errors.fetch_add(1, Ordering::Relaxed);
            return;
        }
        match path {
            CheckPath::Local => checks.local.fetch_add(1, Ordering::Relaxed),
            CheckPath::Forwarded => checks.forwarded.fetch_add(1, Ordering::Relaxed),
        };
        if resp.status == Status::OverLimit {
            checks.over_limit.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_check_error(&self) {
        self.inner.checks.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub async fn snapshot(&self) -> MetricsSnapshot {
        let checks = &self.inner.checks;
        MetricsSnapshot {
            routes: self.inner.routes.read().await.clone(),
            checks: CheckMetrics {
                local: checks.local.load(Ordering::Relaxed),
                forwarded: checks.forwarded.load(Ordering::Relaxed),
                errors: checks.errors.load(Ordering::Relaxed),
                over_limit: checks.over_limit.load(Ordering::Relaxed),
            },
            cache_size: self.inner.cache_size.load(Ordering::Relaxed),
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}
