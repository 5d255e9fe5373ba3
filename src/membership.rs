//! Cluster membership: rebuilds the picker when the member list changes and
//! derives the node's health from the outcome.

use std::sync::{Arc, Mutex};

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::Behaviors;
use crate::error::{ThrottlerError, ThrottlerResult};
use crate::peer_client::PeerClient;
use crate::picker::PeerPicker;
use crate::types::{HealthCheckResponse, HealthStatus, PeerConfig};

/// Callback invoked with every new member list.
pub type OnUpdate = Arc<dyn Fn(PeerConfig) + Send + Sync>;

/// Source of membership lists.
///
/// Implementations invoke the registered callback at most once at a time.
pub trait PeerSyncer: Send + Sync {
    fn register_on_update(&self, callback: OnUpdate);

    /// Announces this node under `advertise_address` and begins delivering
    /// member lists.
    fn start(&self, advertise_address: &str) -> ThrottlerResult<()>;

    fn stop(&self);
}

/// Delivers a fixed member list once, when started.
pub struct StaticPeerSyncer {
    peers: Vec<String>,
    callback: Mutex<Option<OnUpdate>>,
}

impl StaticPeerSyncer {
    pub fn new(peers: Vec<String>) -> Self {
        Self {
            peers,
            callback: Mutex::new(None),
        }
    }
}

impl PeerSyncer for StaticPeerSyncer {
    fn register_on_update(&self, callback: OnUpdate) {
        if let Ok(mut slot) = self.callback.lock() {
            *slot = Some(callback);
        }
    }

    fn start(&self, advertise_address: &str) -> ThrottlerResult<()> {
        let callback = self
            .callback
            .lock()
            .map_err(|_| ThrottlerError::InternalError("peer syncer lock poisoned".to_string()))?
            .clone()
            .ok_or_else(|| ThrottlerError::Startup("no peer update callback registered".to_string()))?;

        let peers = if self.peers.is_empty() {
            vec![advertise_address.to_string()]
        } else {
            self.peers.clone()
        };

        tracing::info!(peers = ?peers, "using static peer list");
        callback(PeerConfig { peers });
        Ok(())
    }

    fn stop(&self) {
        tracing::debug!("static peer syncer stopped");
    }
}

struct PeerState {
    picker: Box<dyn PeerPicker>,
    health: HealthCheckResponse,
}

/// Owns the current picker and health state.
///
/// Readers take the lock only for a lookup or a snapshot copy; a rebuild
/// takes it exclusively only to swap in the finished picker.
pub struct Coordinator {
    state: RwLock<PeerState>,
    advertise_address: String,
    behaviors: Behaviors,
    drains: Mutex<Vec<JoinHandle<()>>>,
    drain_cancel: CancellationToken,
}

impl Coordinator {
    pub fn new(picker: Box<dyn PeerPicker>, advertise_address: impl Into<String>, behaviors: Behaviors) -> Self {
        Self {
            state: RwLock::new(PeerState {
                picker,
                health: HealthCheckResponse::default(),
            }),
            advertise_address: advertise_address.into(),
            behaviors,
            drains: Mutex::new(Vec::new()),
            drain_cancel: CancellationToken::new(),
        }
    }

    pub fn advertise_address(&self) -> &str {
        &self.advertise_address
    }

    /// Looks up the owner of `key` in the current picker.
    pub async fn pick(&self, key: &str) -> ThrottlerResult<PeerClient> {
        let state = self.state.read().await;
        state.picker.get(key)
    }

    pub async fn health(&self) -> HealthCheckResponse {
        self.state.read().await.health.clone()
    }

    pub async fn peers(&self) -> Vec<PeerClient> {
        self.state.read().await.picker.peers()
    }

    /// Rebuilds the picker from `config` and commits it.
    ///
    /// Peers that cannot be reached are left out and reported through the
    /// health state; the rebuild itself never fails.
    pub async fn update_peers(&self, config: PeerConfig) {
        let mut picker = self.state.read().await.picker.new_picker();
        let mut errs = Vec::new();

        for address in &config.peers {
            let peer = match self.connect_peer(address).await {
                Ok(peer) => peer,
                Err(e) => {
                    tracing::warn!(peer = %address, error = %e, "peer unreachable during membership update");
                    errs.push(format!(
                        "failed to connect to peer '{}'; consistent hash is incomplete",
                        address
                    ));
                    continue;
                }
            };

            let is_owner = *address == self.advertise_address;
            picker.add(peer.with_owner(is_owner));
        }

        let stale = {
            let mut state = self.state.write().await;
            let old = std::mem::replace(&mut state.picker, picker);

            state.health = if errs.is_empty() {
                HealthCheckResponse {
                    status: HealthStatus::Healthy,
                    message: String::new(),
                    peer_count: state.picker.size(),
                }
            } else {
                HealthCheckResponse {
                    status: HealthStatus::Unhealthy,
                    message: errs.join("|"),
                    peer_count: state.picker.size(),
                }
            };

            tracing::debug!(
                peers = ?config.peers,
                peer_count = state.health.peer_count,
                status = ?state.health.status,
                "peers updated"
            );

            old.peers()
                .into_iter()
                .filter(|peer| {
                    state
                        .picker
                        .get_peer(peer.address())
                        .map_or(true, |current| !current.same_connection(peer))
                })
                .collect::<Vec<PeerClient>>()
        };

        for peer in stale {
            self.schedule_disconnect(peer);
        }
    }

    /// Reuses the live connection for `address` when the peer is still
    /// reachable, otherwise opens a new one.
    async fn connect_peer(&self, address: &str) -> ThrottlerResult<PeerClient> {
        crate::peer_client::check_reachable(address, self.behaviors.connect_timeout).await?;

        let existing = self.state.read().await.picker.get_peer(address);
        match existing {
            Some(peer) if !peer.is_shut_down() => Ok(peer),
            _ => PeerClient::new(address, &self.behaviors),
        }
    }

    /// Shuts `peer` down once `stale_peer_grace` has passed, so lookups made
    /// against the previous picker can still use it.
    fn schedule_disconnect(&self, peer: PeerClient) {
        let grace = self.behaviors.stale_peer_grace;
        let cancel = self.drain_cancel.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(grace) => {}
                _ = cancel.cancelled() => {}
            }
            if peer.in_flight() > 0 {
                tracing::warn!(
                    peer = %peer.address(),
                    in_flight = peer.in_flight(),
                    "disconnecting stale peer with calls in flight"
                );
            }
            peer.shutdown();
            tracing::debug!(peer = %peer.address(), "disconnected stale peer");
        });

        if let Ok(mut drains) = self.drains.lock() {
            drains.retain(|h| !h.is_finished());
            drains.push(handle);
        }
    }

    /// Ends pending grace periods early and waits for the disconnects.
    pub async fn stop_drains(&self) {
        self.drain_cancel.cancel();
        self.wait_for_drains().await;
    }

    /// Waits for scheduled disconnects to finish.
    pub async fn wait_for_drains(&self) {
        let handles: Vec<JoinHandle<()>> = match self.drains.lock() {
            Ok(mut drains) => drains.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "peer drain task failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::picker::ConsistentHash;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};
    use tokio::net::TcpListener;

    struct Cluster {
        listeners: Vec<TcpListener>,
        addresses: Vec<String>,
    }

    async fn cluster(size: usize) -> Cluster {
        let mut listeners = Vec::new();
        let mut addresses = Vec::new();
        for _ in 0..size {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            addresses.push(listener.local_addr().unwrap().to_string());
            listeners.push(listener);
        }
        Cluster { listeners, addresses }
    }

    async fn closed_port() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        addr
    }

    fn coordinator(advertise: &str) -> Coordinator {
        let behaviors = Behaviors {
            stale_peer_grace: Duration::from_millis(200),
            ..Behaviors::default()
        };
        Coordinator::new(Box::new(ConsistentHash::new()), advertise, behaviors)
    }

    #[tokio::test]
    async fn test_initial_health_before_any_update() {
        let coord = coordinator("127.0.0.1:1");
        let health = coord.health().await;
        assert_eq!(health.status, HealthStatus::Healthy);
        assert_eq!(health.peer_count, 0);
        assert!(coord.pick("ns_key").await.is_err());
    }

    #[tokio::test]
    async fn test_rebuild_is_idempotent() {
        let cluster = cluster(3).await;
        let coord = coordinator(&cluster.addresses[0]);

        for _ in 0..2 {
            coord.update_peers(PeerConfig::new(cluster.addresses.clone())).await;
            let health = coord.health().await;
            assert_eq!(health.status, HealthStatus::Healthy);
            assert_eq!(health.peer_count, 3);
            assert!(health.message.is_empty());
        }
        drop(cluster.listeners);
    }

    #[tokio::test]
    async fn test_only_self_is_owner() {
        let cluster = cluster(3).await;
        let coord = coordinator(&cluster.addresses[1]);
        coord.update_peers(PeerConfig::new(cluster.addresses.clone())).await;

        let owners: Vec<String> = coord
            .peers()
            .await
            .into_iter()
            .filter(|p| p.is_owner())
            .map(|p| p.address().to_string())
            .collect();
        assert_eq!(owners, vec![cluster.addresses[1].clone()]);
    }

    #[tokio::test]
    async fn test_self_missing_from_list_has_no_owner() {
        let cluster = cluster(2).await;
        let coord = coordinator("10.255.255.1:9080");
        coord.update_peers(PeerConfig::new(cluster.addresses.clone())).await;

        assert!(coord.peers().await.iter().all(|p| !p.is_owner()));
    }

    #[tokio::test]
    async fn test_unreachable_peer_marks_unhealthy() {
        let cluster = cluster(2).await;
        let dead = closed_port().await;
        let mut peers = cluster.addresses.clone();
        peers.push(dead.clone());

        let coord = coordinator(&cluster.addresses[0]);
        coord.update_peers(PeerConfig::new(peers)).await;

        let health = coord.health().await;
        assert_eq!(health.status, HealthStatus::Unhealthy);
        assert_eq!(health.peer_count, 2);
        assert!(health.message.contains(&dead));
        assert!(health.message.contains("consistent hash is incomplete"));
    }

    #[tokio::test]
    async fn test_health_recovers_after_clean_rebuild() {
        let cluster = cluster(2).await;
        let dead = closed_port().await;
        let coord = coordinator(&cluster.addresses[0]);

        coord
            .update_peers(PeerConfig::new(vec![cluster.addresses[0].clone(), dead]))
            .await;
        assert_eq!(coord.health().await.status, HealthStatus::Unhealthy);

        coord
            .update_peers(PeerConfig::new(vec![cluster.addresses[0].clone()]))
            .await;
        let health = coord.health().await;
        assert_eq!(health.status, HealthStatus::Healthy);
        assert_eq!(health.peer_count, 1);
        assert!(health.message.is_empty());
    }

    #[tokio::test]
    async fn test_rebuild_reuses_existing_connections() {
        let cluster = cluster(2).await;
        let coord = coordinator(&cluster.addresses[0]);

        coord.update_peers(PeerConfig::new(cluster.addresses.clone())).await;
        let before = coord.peers().await;
        coord.update_peers(PeerConfig::new(cluster.addresses.clone())).await;
        let after = coord.peers().await;

        for peer in &before {
            let same = after.iter().find(|p| p.address() == peer.address()).unwrap();
            assert!(same.same_connection(peer));
            assert!(!same.is_shut_down());
        }
    }

    #[tokio::test]
    async fn test_removed_peer_is_shut_down_after_drain() {
        let cluster = cluster(2).await;
        let coord = coordinator(&cluster.addresses[0]);

        coord.update_peers(PeerConfig::new(cluster.addresses.clone())).await;
        let removed = coord
            .peers()
            .await
            .into_iter()
            .find(|p| p.address() == cluster.addresses[1])
            .unwrap();

        coord
            .update_peers(PeerConfig::new(vec![cluster.addresses[0].clone()]))
            .await;
        coord.wait_for_drains().await;

        assert!(removed.is_shut_down());
        assert_eq!(coord.health().await.peer_count, 1);
    }

    #[tokio::test]
    async fn test_picked_handle_survives_rebuild_within_grace() {
        let cluster = cluster(2).await;
        let coord = coordinator(&cluster.addresses[0]);
        coord.update_peers(PeerConfig::new(cluster.addresses.clone())).await;

        let picked = coord
            .peers()
            .await
            .into_iter()
            .find(|p| p.address() == cluster.addresses[1])
            .unwrap();
        assert_eq!(picked.in_flight(), 0);

        coord
            .update_peers(PeerConfig::new(vec![cluster.addresses[0].clone()]))
            .await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!picked.is_shut_down());

        let deadline = tokio::time::Instant::now() + Duration::from_millis(50);
        let err = picked
            .get_peer_rate_limit(&crate::types::RateLimitRequest::new("ns", "key"), deadline)
            .await
            .unwrap_err();
        assert!(!matches!(err, ThrottlerError::PeerClosed(_)));

        coord.wait_for_drains().await;
        assert!(picked.is_shut_down());
    }

    #[tokio::test]
    async fn test_stop_drains_ends_grace_early() {
        let cluster = cluster(2).await;
        let behaviors = Behaviors {
            stale_peer_grace: Duration::from_secs(30),
            ..Behaviors::default()
        };
        let coord = Coordinator::new(Box::new(ConsistentHash::new()), cluster.addresses[0].clone(), behaviors);
        coord.update_peers(PeerConfig::new(cluster.addresses.clone())).await;
        let removed = coord.peers().await.into_iter().find(|p| p.address() == cluster.addresses[1]).unwrap();

        coord
            .update_peers(PeerConfig::new(vec![cluster.addresses[0].clone()]))
            .await;

        let started = Instant::now();
        coord.stop_drains().await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(removed.is_shut_down());
    }

    #[tokio::test]
    async fn test_lookups_during_rebuild_see_whole_snapshots() {
        let cluster = cluster(4).await;
        let set_a: Vec<String> = cluster.addresses[..2].to_vec();
        let set_b: Vec<String> = cluster.addresses[2..].to_vec();
        let known: Vec<String> = cluster.addresses.clone();

        let coord = Arc::new(coordinator(&cluster.addresses[0]));
        coord.update_peers(PeerConfig::new(set_a.clone())).await;

        let lookups = Arc::new(AtomicUsize::new(0));
        let mut readers = Vec::new();
        for r in 0..4 {
            let coord = Arc::clone(&coord);
            let known = known.clone();
            let lookups = Arc::clone(&lookups);
            readers.push(tokio::spawn(async move {
                for i in 0..200 {
                    let peer = coord.pick(&format!("ns_reader{}-{}", r, i)).await.unwrap();
                    assert!(known.contains(&peer.address().to_string()));
                    lookups.fetch_add(1, Ordering::Relaxed);
                    tokio::task::yield_now().await;
                }
            }));
        }

        for round in 0..6 {
            let next = if round % 2 == 0 { &set_b } else { &set_a };
            coord.update_peers(PeerConfig::new(next.clone())).await;
        }

        for reader in readers {
            reader.await.unwrap();
        }
        assert_eq!(lookups.load(Ordering::Relaxed), 800);
    }

    #[tokio::test]
    async fn test_static_syncer_delivers_list_on_start() {
        let syncer = StaticPeerSyncer::new(vec!["10.0.0.1:80".into(), "10.0.0.2:80".into()]);
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        syncer.register_on_update(Arc::new(move |conf| sink.lock().unwrap().push(conf)));

        syncer.start("10.0.0.1:80").unwrap();

        let received = received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].peers, vec!["10.0.0.1:80", "10.0.0.2:80"]);
    }

    #[tokio::test]
    async fn test_static_syncer_defaults_to_self() {
        let syncer = StaticPeerSyncer::new(Vec::new());
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        syncer.register_on_update(Arc::new(move |conf| sink.lock().unwrap().push(conf)));

        syncer.start("127.0.0.1:9080").unwrap();
        assert_eq!(received.lock().unwrap()[0].peers, vec!["127.0.0.1:9080"]);
    }

    #[test]
    fn test_static_syncer_without_callback_fails() {
        let syncer = StaticPeerSyncer::new(Vec::new());
        assert!(syncer.start("127.0.0.1:9080").is_err());
    }
}
