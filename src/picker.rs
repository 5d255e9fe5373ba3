//! Key ownership: maps a global key to the peer that owns it.

use std::collections::HashMap;
use std::hash::{BuildHasher, BuildHasherDefault, DefaultHasher};

use anchorhash::{AnchorHash, Builder};

use crate::error::{ThrottlerError, ThrottlerResult};
use crate::peer_client::PeerClient;

/// Strategy mapping global keys onto the current member set.
///
/// A picker is built once per membership change through [`new_picker`]
/// and successive [`add`] calls, then only read.
///
/// [`new_picker`]: PeerPicker::new_picker
/// [`add`]: PeerPicker::add
pub trait PeerPicker: Send + Sync {
    /// Returns the peer owning `key`.
    fn get(&self, key: &str) -> ThrottlerResult<PeerClient>;

    /// Returns the handle registered for `address`, if any.
    fn get_peer(&self, address: &str) -> Option<PeerClient>;

    /// Adds a peer, replacing any handle already registered for its address.
    fn add(&mut self, peer: PeerClient);

    fn size(&self) -> usize;

    fn peers(&self) -> Vec<PeerClient>;

    /// An empty picker of the same strategy.
    fn new_picker(&self) -> Box<dyn PeerPicker>;
}

type DeterministicHasher = BuildHasherDefault<DefaultHasher>;

/// Consistent hashing over the member addresses using AnchorHash.
///
/// Buckets are assigned to addresses in sorted order, so every node that
/// sees the same member list agrees on the owner of each key.
#[derive(Default)]
pub struct ConsistentHash {
    anchor: Option<AnchorHash<u64, String, DeterministicHasher>>,
    peers: HashMap<String, PeerClient>,
}

impl ConsistentHash {
    pub fn new() -> Self {
        Self::default()
    }

    fn rebuild_anchor(&mut self) {
        if self.peers.is_empty() {
            self.anchor = None;
            return;
        }

        let mut addresses: Vec<String> = self.peers.keys().cloned().collect();
        addresses.sort();

        let capacity = addresses.len().max(16).min(u16::MAX as usize) as u16;
        self.anchor = Some(
            Builder::with_hasher(DeterministicHasher::default())
                .with_resources(addresses)
                .build(capacity),
        );
    }

    #[inline]
    fn hash_key(key: &str) -> u64 {
        DeterministicHasher::default().hash_one(key)
    }
}

impl PeerPicker for ConsistentHash {
    fn get(&self, key: &str) -> ThrottlerResult<PeerClient> {
        let anchor = self.anchor.as_ref().ok_or(ThrottlerError::EmptyPool)?;
        anchor
            .get_resource(Self::hash_key(key))
            .and_then(|address| self.peers.get(address))
            .cloned()
            .ok_or(ThrottlerError::EmptyPool)
    }

    fn get_peer(&self, address: &str) -> Option<PeerClient> {
        self.peers.get(address).cloned()
    }

    fn add(&mut self, peer: PeerClient) {
        let address = peer.address().to_string();
        if self.peers.insert(address, peer).is_none() {
            self.rebuild_anchor();
        }
    }

    fn size(&self) -> usize {
        self.peers.len()
    }

    fn peers(&self) -> Vec<PeerClient> {
        let mut peers: Vec<PeerClient> = self.peers.values().cloned().collect();
        peers.sort_by(|a, b| a.address().cmp(b.address()));
        peers
    }

    fn new_picker(&self) -> Box<dyn PeerPicker> {
        Box::new(ConsistentHash::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Behaviors;

    fn ring_of(addresses: &[&str]) -> ConsistentHash {
        let behaviors = Behaviors::default();
        let mut ring = ConsistentHash::new();
        for address in addresses {
            ring.add(PeerClient::new(*address, &behaviors).unwrap());
        }
        ring
    }

    #[test]
    fn test_empty_ring_has_no_owner() {
        let ring = ConsistentHash::new();
        let err = ring.get("ns_key").unwrap_err();
        assert!(matches!(err, ThrottlerError::EmptyPool));
    }

    #[test]
    fn test_single_peer_owns_everything() {
        let ring = ring_of(&["10.0.0.1:80"]);
        for i in 0..100 {
            assert_eq!(ring.get(&format!("key-{}", i)).unwrap().address(), "10.0.0.1:80");
        }
    }

    #[test]
    fn test_assignment_is_deterministic_across_rings() {
        let a = ring_of(&["10.0.0.1:80", "10.0.0.2:80", "10.0.0.3:80"]);
        let b = ring_of(&["10.0.0.3:80", "10.0.0.1:80", "10.0.0.2:80"]);

        for i in 0..1000 {
            let key = format!("ns_account:{}", i);
            assert_eq!(a.get(&key).unwrap().address(), b.get(&key).unwrap().address());
        }
    }

    #[test]
    fn test_keys_spread_across_peers() {
        let ring = ring_of(&["10.0.0.1:80", "10.0.0.2:80", "10.0.0.3:80"]);
        let mut counts: HashMap<String, usize> = HashMap::new();

        for i in 0..3000 {
            let owner = ring.get(&format!("ns_key-{}", i)).unwrap();
            *counts.entry(owner.address().to_string()).or_default() += 1;
        }

        assert_eq!(counts.len(), 3);
        for (address, count) in counts {
            assert!(count > 500, "{} only owns {} of 3000 keys", address, count);
        }
    }

    #[test]
    fn test_removing_a_peer_only_moves_its_keys() {
        let before = ring_of(&["10.0.0.1:80", "10.0.0.2:80", "10.0.0.3:80"]);
        let after = ring_of(&["10.0.0.1:80", "10.0.0.2:80"]);

        for i in 0..1000 {
            let key = format!("ns_key-{}", i);
            let old_owner = before.get(&key).unwrap();
            if old_owner.address() != "10.0.0.3:80" {
                assert_eq!(old_owner.address(), after.get(&key).unwrap().address());
            }
        }
    }

    #[test]
    fn test_duplicate_add_replaces_handle() {
        let behaviors = Behaviors::default();
        let mut ring = ring_of(&["10.0.0.1:80", "10.0.0.2:80"]);
        ring.add(PeerClient::new("10.0.0.1:80", &behaviors).unwrap().with_owner(true));

        assert_eq!(ring.size(), 2);
        assert!(ring.get_peer("10.0.0.1:80").unwrap().is_owner());
        assert!(ring.get_peer("10.0.0.9:80").is_none());
    }

    #[test]
    fn test_new_picker_is_empty() {
        let ring = ring_of(&["10.0.0.1:80"]);
        let fresh = ring.new_picker();
        assert_eq!(fresh.size(), 0);
        assert!(fresh.get("any").is_err());
    }
}
