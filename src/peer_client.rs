//! Handle to one cluster member.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::Instant;

use crate::config::Behaviors;
use crate::error::{ThrottlerError, ThrottlerResult};
use crate::types::{GetPeerRateLimitsRequest, GetPeerRateLimitsResponse, RateLimitRequest, RateLimitResponse};

pub const PEER_RATE_LIMITS_PATH: &str = "/v1/peer/rate-limits";

struct PeerConnection {
    address: String,
    endpoint: String,
    http: reqwest::Client,
    in_flight: AtomicUsize,
    closed: AtomicBool,
}

/// Decrements the in-flight count when a call finishes or is dropped.
struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A member of the cluster: its address, whether it is this node, and the
/// connection used to forward checks to it.
///
/// Cloning is cheap and clones share the connection. The owner flag is
/// fixed per handle; [`PeerClient::with_owner`] produces a new handle over
/// the same connection.
#[derive(Clone)]
pub struct PeerClient {
    is_owner: bool,
    conn: Arc<PeerConnection>,
}

impl std::fmt::Debug for PeerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerClient")
            .field("address", &self.conn.address)
            .field("is_owner", &self.is_owner)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

impl PeerClient {
    /// Builds a handle without checking that the peer is reachable.
    pub fn new(address: impl Into<String>, behaviors: &Behaviors) -> ThrottlerResult<Self> {
        let address = address.into();
        let http = reqwest::Client::builder()
            .connect_timeout(behaviors.connect_timeout)
            .timeout(behaviors.peer_timeout)
            .build()
            .map_err(|e| ThrottlerError::PeerConnect {
                address: address.clone(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            is_owner: false,
            conn: Arc::new(PeerConnection {
                endpoint: format!("http://{}{}", address, PEER_RATE_LIMITS_PATH),
                address,
                http,
                in_flight: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Checks the peer is reachable over TCP, then builds the handle.
    pub async fn connect(address: &str, behaviors: &Behaviors) -> ThrottlerResult<Self> {
        check_reachable(address, behaviors.connect_timeout).await?;
        Self::new(address, behaviors)
    }

    pub fn address(&self) -> &str {
        &self.conn.address
    }

    pub fn is_owner(&self) -> bool {
        self.is_owner
    }

    pub fn with_owner(&self, is_owner: bool) -> Self {
        Self {
            is_owner,
            conn: Arc::clone(&self.conn),
        }
    }

    pub fn same_connection(&self, other: &PeerClient) -> bool {
        Arc::ptr_eq(&self.conn, &other.conn)
    }

    pub fn in_flight(&self) -> usize {
        self.conn.in_flight.load(Ordering::Acquire)
    }

    pub fn is_shut_down(&self) -> bool {
        self.conn.closed.load(Ordering::Acquire)
    }

    /// Refuses further calls; calls already running are left to finish.
    pub fn shutdown(&self) {
        self.conn.closed.store(true, Ordering::Release);
    }

    pub async fn get_peer_rate_limit(
        &self,
        req: &RateLimitRequest,
        deadline: Instant,
    ) -> ThrottlerResult<RateLimitResponse> {
        let mut responses = self.get_peer_rate_limits(vec![req.clone()], deadline).await?;
        responses.pop().ok_or_else(|| self.request_error("peer returned no results"))
    }

    /// Forwards a batch the peer owns; the call fails once `deadline` passes.
    pub async fn get_peer_rate_limits(
        &self,
        requests: Vec<RateLimitRequest>,
        deadline: Instant,
    ) -> ThrottlerResult<Vec<RateLimitResponse>> {
        if self.is_shut_down() {
            return Err(ThrottlerError::PeerClosed(self.conn.address.clone()));
        }

        let started = Instant::now();
        self.conn.in_flight.fetch_add(1, Ordering::AcqRel);
        let _guard = InFlightGuard(&self.conn.in_flight);

        let expected = requests.len();
        let body = GetPeerRateLimitsRequest { requests };

        let call = async {
            let resp = self
                .conn
                .http
                .post(&self.conn.endpoint)
                .json(&body)
                .send()
                .await
                .map_err(|e| self.request_error(e))?;

            let status = resp.status();
            if !status.is_success() {
                let text = resp.text().await.unwrap_or_default();
                return Err(self.request_error(format!("status {}: {}", status, text)));
            }

            resp.json::<GetPeerRateLimitsResponse>()
                .await
                .map_err(|e| self.request_error(e))
        };

        let resp = tokio::time::timeout_at(deadline, call)
            .await
            .map_err(|_| ThrottlerError::DeadlineExceeded(deadline.saturating_duration_since(started)))??;

        if resp.rate_limits.len() != expected {
            return Err(self.request_error(format!(
                "peer returned {} results for {} requests",
                resp.rate_limits.len(),
                expected
            )));
        }

        Ok(resp.rate_limits)
    }

    fn request_error(&self, reason: impl ToString) -> ThrottlerError {
        ThrottlerError::PeerRequest {
            address: self.conn.address.clone(),
            reason: reason.to_string(),
        }
    }
}

/// Opens and drops a TCP connection to `address` within `timeout`.
pub async fn check_reachable(address: &str, timeout: Duration) -> ThrottlerResult<()> {
    match tokio::time::timeout(timeout, TcpStream::connect(address)).await {
        Ok(Ok(_stream)) => Ok(()),
        Ok(Err(e)) => Err(ThrottlerError::PeerConnect {
            address: address.to_string(),
            reason: e.to_string(),
        }),
        Err(_) => Err(ThrottlerError::PeerConnect {
            address: address.to_string(),
            reason: format!("timed out after {:?}", timeout),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn closed_port() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        addr
    }

    #[test]
    fn test_with_owner_shares_connection() {
        let peer = PeerClient::new("127.0.0.1:9000", &Behaviors::default()).unwrap();
        let owner = peer.with_owner(true);

        assert!(!peer.is_owner());
        assert!(owner.is_owner());
        assert!(owner.same_connection(&peer));
        assert_eq!(owner.address(), "127.0.0.1:9000");
    }

    #[tokio::test]
    async fn test_connect_to_listening_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let peer = PeerClient::connect(&addr, &Behaviors::default()).await.unwrap();
        assert_eq!(peer.address(), addr);
    }

    #[tokio::test]
    async fn test_connect_to_closed_port_fails() {
        let addr = closed_port().await;
        let err = PeerClient::connect(&addr, &Behaviors::default()).await.unwrap_err();
        assert!(matches!(err, ThrottlerError::PeerConnect { .. }));
    }

    #[tokio::test]
    async fn test_call_to_unreachable_peer_is_an_error() {
        let addr = closed_port().await;
        let peer = PeerClient::new(&addr, &Behaviors::default()).unwrap();

        let result = peer
            .get_peer_rate_limit(&RateLimitRequest::new("ns", "key"), Instant::now() + Duration::from_secs(1))
            .await;
        assert!(result.is_err());
        assert_eq!(peer.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_shut_down_peer_refuses_calls() {
        let peer = PeerClient::new("127.0.0.1:9000", &Behaviors::default()).unwrap();
        peer.shutdown();

        let err = peer
            .get_peer_rate_limits(vec![RateLimitRequest::new("ns", "key")], Instant::now() + Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ThrottlerError::PeerClosed(_)));
    }
}
