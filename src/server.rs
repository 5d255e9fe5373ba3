use crate::cache::{Cache, MemoryCache, SharedCache};
use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::error::{ThrottlerError, ThrottlerResult};
use crate::handlers::{
    get_peer_rate_limits, get_rate_limits, health_check, metrics, update_peer_globals, AppState, SharedState,
};
use crate::membership::{Coordinator, PeerSyncer, StaticPeerSyncer};
use crate::metrics::MetricsCollector;
use crate::middleware::tracking_middleware;
use crate::peer_client::PEER_RATE_LIMITS_PATH;
use crate::picker::{ConsistentHash, PeerPicker};
use crate::types::{HealthCheckResponse, PeerConfig};
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::{middleware, Router};
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

pub const RATE_LIMITS_PATH: &str = "/v1/rate-limits";
pub const HEALTH_PATH: &str = "/v1/health";
pub const PEER_GLOBALS_PATH: &str = "/v1/peer/globals";
pub const METRICS_PATH: &str = "/metrics";

pub fn create_app(state: SharedState, max_request_size: usize) -> Router {
    let metrics_state = state.metrics.clone();

    Router::new()
        // Client endpoints
        .route(RATE_LIMITS_PATH, post(get_rate_limits))
        .route(HEALTH_PATH, get(health_check))
        // Peer endpoints
        .route(PEER_RATE_LIMITS_PATH, post(get_peer_rate_limits))
        .route(PEER_GLOBALS_PATH, post(update_peer_globals))
        .route(METRICS_PATH, get(metrics))
        .with_state(state)
        .layer(DefaultBodyLimit::max(max_request_size))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(middleware::from_fn_with_state(metrics_state, tracking_middleware)),
        )
}

/// Pluggable collaborators of a [`Server`].
pub struct ServerDeps {
    pub cache: Box<dyn Cache>,
    pub picker: Box<dyn PeerPicker>,
    pub peer_syncer: Arc<dyn PeerSyncer>,
    pub metrics: MetricsCollector,
}

impl ServerDeps {
    /// In-memory cache, consistent hash picker and the configured static
    /// peer list.
    pub fn from_config(config: &Config) -> Self {
        Self {
            cache: Box::new(MemoryCache::new(config.cache_size)),
            picker: Box::new(ConsistentHash::new()),
            peer_syncer: Arc::new(StaticPeerSyncer::new(config.peers.clone())),
            metrics: MetricsCollector::new(config.metrics_interval),
        }
    }
}

pub struct Server {
    config: Config,
    app: Router,
    listener: Option<TcpListener>,
    local_addr: SocketAddr,
    advertise_address: String,
    coordinator: Arc<Coordinator>,
    cache: SharedCache,
    metrics: MetricsCollector,
    peer_syncer: Arc<dyn PeerSyncer>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Server {
    /// Binds the listener and wires membership updates into the coordinator.
    ///
    /// Nothing is served until [`Server::start`].
    pub async fn bind(config: Config, deps: ServerDeps) -> ThrottlerResult<Self> {
        config.validate_all()?;

        let listener = TcpListener::bind(&config.listen_address)
            .await
            .map_err(|source| ThrottlerError::Bind {
                address: config.listen_address.clone(),
                source,
            })?;
        let local_addr = listener.local_addr().map_err(|source| ThrottlerError::Bind {
            address: config.listen_address.clone(),
            source,
        })?;

        let advertise_address = config
            .advertise_address
            .clone()
            .unwrap_or_else(|| loopback(local_addr).to_string());

        let coordinator = Arc::new(Coordinator::new(
            deps.picker,
            advertise_address.clone(),
            config.behaviors.clone(),
        ));

        let cache: SharedCache = Arc::new(std::sync::Mutex::new(deps.cache));
        deps.metrics.register_cache_stats(Arc::clone(&cache));

        let state = Arc::new(AppState {
            dispatcher: Dispatcher::new(
                Arc::clone(&coordinator),
                Arc::clone(&cache),
                deps.metrics.clone(),
                config.max_batch_size,
            ),
            metrics: deps.metrics.clone(),
            peer_timeout: config.behaviors.peer_timeout,
        });
        let app = create_app(state, config.max_request_size);

        let shutdown = CancellationToken::new();

        // Rebuilds run one at a time; lists delivered during a rebuild
        // collapse into the newest one.
        let (tx, mut rx) = watch::channel(PeerConfig::default());
        deps.peer_syncer.register_on_update(Arc::new(move |conf| {
            if tx.send(conf).is_err() {
                tracing::warn!("peer update dropped; server is shutting down");
            }
        }));

        let updates = {
            let coordinator = Arc::clone(&coordinator);
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        changed = rx.changed() => {
                            if changed.is_err() {
                                break;
                            }
                            let conf = rx.borrow_and_update().clone();
                            coordinator.update_peers(conf).await;
                        }
                    }
                }
                tracing::debug!("peer update task stopped");
            })
        };

        Ok(Self {
            config,
            app,
            listener: Some(listener),
            local_addr,
            advertise_address,
            coordinator,
            cache,
            metrics: deps.metrics,
            peer_syncer: deps.peer_syncer,
            shutdown,
            tasks: vec![updates],
        })
    }

    /// Serves requests, waits until the node answers its own health check and
    /// then joins the cluster.
    pub async fn start(&mut self) -> ThrottlerResult<()> {
        self.cache
            .lock()
            .map_err(|_| ThrottlerError::InternalError("cache lock poisoned".to_string()))?
            .start()?;
        self.metrics.start()?;

        let listener = self
            .listener
            .take()
            .ok_or_else(|| ThrottlerError::Startup("server already started".to_string()))?;
        let app = self.app.clone();
        let shutdown = self.shutdown.clone();
        self.tasks.push(tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await
            {
                tracing::error!(error = %e, "server error");
            }
        }));

        tracing::info!(
            listen_address = %self.local_addr,
            advertise_address = %self.advertise_address,
            "throttler cluster node listening"
        );

        let behaviors = &self.config.behaviors;
        let health_addr = loopback(self.local_addr);
        let timeout = behaviors.readiness_timeout;
        retry(behaviors.readiness_attempts, behaviors.readiness_backoff, || {
            check_health(health_addr, timeout)
        })
        .await
        .map_err(|e| ThrottlerError::Startup(format!("while waiting for server to pass health check - {}", e)))?;

        self.peer_syncer
            .start(&self.advertise_address)
            .map_err(|e| ThrottlerError::Startup(format!("failed to sync configs with other peers - {}", e)))?;

        Ok(())
    }

    /// Stops accepting requests and waits for background work to finish.
    pub async fn stop(&mut self) {
        tracing::info!("stopping throttler cluster node");
        self.shutdown.cancel();
        self.peer_syncer.stop();
        self.metrics.stop().await;

        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "background task failed");
            }
        }
        self.coordinator.stop_drains().await;
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn advertise_address(&self) -> &str {
        &self.advertise_address
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }
}

/// Runs `op` up to `attempts` times, sleeping `backoff` between attempts.
pub async fn retry<F, Fut, T>(attempts: u32, backoff: Duration, mut op: F) -> ThrottlerResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ThrottlerResult<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= attempts => return Err(e),
            Err(e) => {
                tracing::debug!(attempt, error = %e, "attempt failed; retrying");
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
        }
    }
}

/// Calls the health endpoint of the node at `addr`.
pub async fn check_health(addr: SocketAddr, timeout: Duration) -> ThrottlerResult<HealthCheckResponse> {
    let address = addr.to_string();
    let request_error = |reason: String| ThrottlerError::PeerRequest {
        address: address.clone(),
        reason,
    };

    let request = async {
        let response = reqwest::Client::new()
            .get(format!("http://{}{}", addr, HEALTH_PATH))
            .send()
            .await
            .map_err(|e| request_error(e.to_string()))?;

        if !response.status().is_success() {
            return Err(request_error(format!("unexpected status {}", response.status())));
        }
        response
            .json::<HealthCheckResponse>()
            .await
            .map_err(|e| request_error(e.to_string()))
    };

    tokio::time::timeout(timeout, request)
        .await
        .map_err(|_| ThrottlerError::DeadlineExceeded(timeout))?
}

/// `addr` with an unspecified IP replaced by the loopback address.
fn loopback(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), addr.port()),
        IpAddr::V6(ip) if ip.is_unspecified() => SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), addr.port()),
        _ => addr,
    }
}

/// Resolves on Ctrl+C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        },
    }
}
