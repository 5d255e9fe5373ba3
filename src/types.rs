//! Wire types shared by the client-facing and peer-facing interfaces.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Joins namespace and unique key into the global key.
pub const GLOBAL_KEY_SEPARATOR: &str = "_";

/// Metadata key naming the peer that served a forwarded item.
pub const OWNER_METADATA_KEY: &str = "owner";

/// Rate limit algorithms this node knows how to apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Algorithm {
    TokenBucket,
    LeakyBucket,
}

impl Algorithm {
    pub fn from_id(id: i32) -> Option<Self> {
        match id {
            0 => Some(Algorithm::TokenBucket),
            1 => Some(Algorithm::LeakyBucket),
            _ => None,
        }
    }

    pub fn id(self) -> i32 {
        match self {
            Algorithm::TokenBucket => 0,
            Algorithm::LeakyBucket => 1,
        }
    }
}

/// A single rate limit check.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RateLimitRequest {
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub unique_key: String,
    /// Hits to consume; zero only queries the current state.
    #[serde(default)]
    pub hits: u64,
    #[serde(default)]
    pub limit: u64,
    /// Window length in milliseconds.
    #[serde(default)]
    pub duration: u64,
    /// Wire id of the algorithm, see [`Algorithm::from_id`].
    #[serde(default)]
    pub algorithm: i32,
}

impl RateLimitRequest {
    pub fn new(namespace: impl Into<String>, unique_key: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            unique_key: unique_key.into(),
            hits: 1,
            limit: 10,
            duration: 60_000,
            algorithm: Algorithm::TokenBucket.id(),
        }
    }

    pub fn with_hits(mut self, hits: u64) -> Self {
        self.hits = hits;
        self
    }

    pub fn with_limit(mut self, limit: u64, duration_ms: u64) -> Self {
        self.limit = limit;
        self.duration = duration_ms;
        self
    }

    pub fn with_algorithm(mut self, algorithm: Algorithm) -> Self {
        self.algorithm = algorithm.id();
        self
    }

    pub fn global_key(&self) -> String {
        format!("{}{}{}", self.namespace, GLOBAL_KEY_SEPARATOR, self.unique_key)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    #[default]
    UnderLimit,
    OverLimit,
}

/// Outcome of one rate limit check.
///
/// `error` is the per-item error channel: a populated error never fails the
/// enclosing batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RateLimitResponse {
    #[serde(default)]
    pub status: Status,
    #[serde(default)]
    pub limit: u64,
    #[serde(default)]
    pub remaining: u64,
    /// Epoch milliseconds at which the limit resets.
    #[serde(default)]
    pub reset_time: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

impl RateLimitResponse {
    pub fn from_error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn owner(&self) -> Option<&str> {
        self.metadata.get(OWNER_METADATA_KEY).map(String::as_str)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetRateLimitsRequest {
    #[serde(default)]
    pub requests: Vec<RateLimitRequest>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetRateLimitsResponse {
    pub responses: Vec<RateLimitResponse>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetPeerRateLimitsRequest {
    #[serde(default)]
    pub requests: Vec<RateLimitRequest>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetPeerRateLimitsResponse {
    pub rate_limits: Vec<RateLimitResponse>,
}

/// Reserved for global counter synchronisation between peers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdatePeerGlobalsRequest {
    #[serde(default)]
    pub globals: Vec<RateLimitRequest>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdatePeerGlobalsResponse {}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    #[default]
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HealthCheckResponse {
    pub status: HealthStatus,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub peer_count: usize,
}

/// Membership list delivered by a [`crate::membership::PeerSyncer`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerConfig {
    pub peers: Vec<String>,
}

impl PeerConfig {
    pub fn new<I, S>(peers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            peers: peers.into_iter().map(Into::into).collect(),
        }
    }
}
