use clap::{Args, Parser};
use humantime_serde::re::humantime::parse_duration;
use std::time::Duration;
use validator::Validate;

use crate::error::ThrottlerError;

pub const DEFAULT_LISTEN_ADDRESS: &str = "127.0.0.1:9080";
pub const DEFAULT_MAX_BATCH_SIZE: usize = 1000;
pub const DEFAULT_MAX_REQUEST_SIZE: usize = 1024 * 1024;
pub const DEFAULT_CACHE_SIZE: usize = 50_000;

/// Node configuration, read from flags or the environment.
#[derive(Debug, Clone, Parser, Validate)]
#[command(name = "throttler-cluster", version, about)]
pub struct Config {
    /// Address the listener binds to
    #[arg(long, env = "THROTTLER_LISTEN_ADDRESS", default_value = DEFAULT_LISTEN_ADDRESS)]
    #[validate(length(min = 1))]
    pub listen_address: String,

    /// Address other peers use to reach this node; defaults to the bound address
    #[arg(long, env = "THROTTLER_ADVERTISE_ADDRESS")]
    #[validate(length(min = 1))]
    pub advertise_address: Option<String>,

    /// Static cluster membership, comma separated host:port list
    #[arg(long, env = "THROTTLER_PEERS", value_delimiter = ',')]
    pub peers: Vec<String>,

    /// Maximum number of rate limit checks in one call
    #[arg(long, env = "THROTTLER_MAX_BATCH_SIZE", default_value_t = DEFAULT_MAX_BATCH_SIZE)]
    #[validate(range(min = 1, max = 100_000))]
    pub max_batch_size: usize,

    /// Maximum request body size in bytes
    #[arg(long, env = "THROTTLER_MAX_REQUEST_SIZE", default_value_t = DEFAULT_MAX_REQUEST_SIZE)]
    #[validate(range(min = 1024))]
    pub max_request_size: usize,

    /// Number of rate limit buckets kept in memory
    #[arg(long, env = "THROTTLER_CACHE_SIZE", default_value_t = DEFAULT_CACHE_SIZE)]
    #[validate(range(min = 1))]
    pub cache_size: usize,

    /// Interval between cache statistic samples
    #[arg(long, env = "THROTTLER_METRICS_INTERVAL", default_value = "10s", value_parser = parse_duration)]
    pub metrics_interval: Duration,

    /// Log level used when RUST_LOG is not set
    #[arg(long, env = "THROTTLER_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[command(flatten)]
    #[validate(nested)]
    pub behaviors: Behaviors,
}

/// Timeouts and retry policy for peer traffic and startup checks.
#[derive(Debug, Clone, Args, Validate)]
pub struct Behaviors {
    /// Timeout for the reachability check made when a peer joins
    #[arg(long, env = "THROTTLER_CONNECT_TIMEOUT", default_value = "500ms", value_parser = parse_duration)]
    pub connect_timeout: Duration,

    /// Upper bound for a forwarded rate limit call
    #[arg(long, env = "THROTTLER_PEER_TIMEOUT", default_value = "500ms", value_parser = parse_duration)]
    pub peer_timeout: Duration,

    /// Health checks made against our own listener before joining the cluster
    #[arg(long, env = "THROTTLER_READINESS_ATTEMPTS", default_value_t = 2)]
    #[validate(range(min = 1, max = 100))]
    pub readiness_attempts: u32,

    /// Pause between readiness checks
    #[arg(long, env = "THROTTLER_READINESS_BACKOFF", default_value = "500ms", value_parser = parse_duration)]
    pub readiness_backoff: Duration,

    /// Timeout for a single readiness check
    #[arg(long, env = "THROTTLER_READINESS_TIMEOUT", default_value = "500ms", value_parser = parse_duration)]
    pub readiness_timeout: Duration,

    /// How long a removed peer may finish in-flight calls before shutdown
    #[arg(long, env = "THROTTLER_STALE_PEER_GRACE", default_value = "5s", value_parser = parse_duration)]
    pub stale_peer_grace: Duration,
}

impl Default for Behaviors {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(500),
            peer_timeout: Duration::from_millis(500),
            readiness_attempts: 2,
            readiness_backoff: Duration::from_millis(500),
            readiness_timeout: Duration::from_millis(500),
            stale_peer_grace: Duration::from_secs(5),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_address: DEFAULT_LISTEN_ADDRESS.to_string(),
            advertise_address: None,
            peers: Vec::new(),
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            max_request_size: DEFAULT_MAX_REQUEST_SIZE,
            cache_size: DEFAULT_CACHE_SIZE,
            metrics_interval: Duration::from_secs(10),
            log_level: "info".to_string(),
            behaviors: Behaviors::default(),
        }
    }
}

impl Config {
    /// Parse flags and environment variables.
    pub fn from_env() -> Self {
        Config::parse()
    }

    /// Validates bounds and address formats.
    pub fn validate_all(&self) -> Result<(), ThrottlerError> {
        self.validate()
            .map_err(|e| ThrottlerError::Configuration(e.to_string()))?;

        validate_address("listen_address", &self.listen_address)?;
        if let Some(advertise) = &self.advertise_address {
            validate_address("advertise_address", advertise)?;
        }
        for peer in &self.peers {
            validate_address("peers", peer)?;
        }
        Ok(())
    }
}

/// Checks that `address` is in host:port form.
pub fn validate_address(field: &str, address: &str) -> Result<(), ThrottlerError> {
    let Some((host, port)) = address.rsplit_once(':') else {
        return Err(ThrottlerError::Configuration(format!(
            "{} '{}' must be in host:port format",
            field, address
        )));
    };

    if host.is_empty() {
        return Err(ThrottlerError::Configuration(format!(
            "{} '{}' is missing a host",
            field, address
        )));
    }

    if port.parse::<u16>().is_err() {
        return Err(ThrottlerError::Configuration(format!(
            "{} '{}' has an invalid port",
            field, address
        )));
    }

    Ok(())
}
