use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::types::NodeId;

/// Seconds without contact before a peer is considered stale.
pub const PEER_STALE_SECS: i64 = 120;

/// A reachable peer: stable session identity, dial address, liveness.
#[derive(Debug, Clone, Serialize)]
pub struct PeerInfo {
    pub id: NodeId,
    pub address: SocketAddr,
    pub last_seen: DateTime<Utc>,
}

impl PeerInfo {
    pub fn is_alive(&self, now: DateTime<Utc>, horizon: Duration) -> bool {
        now.signed_duration_since(self.last_seen) < horizon
    }
}

/// The peer table — thread-safe registry of known peers.
///
/// The registry is the only component allowed to mutate peer entries.
/// Iterating callers always work on a snapshot, never under the lock.
#[derive(Clone)]
pub struct PeerRegistry {
    peers: Arc<RwLock<HashMap<NodeId, PeerInfo>>>,
    self_id: NodeId,
    stale_after: Duration,
}

impl PeerRegistry {
    pub fn new(self_id: NodeId) -> Self {
        Self {
            peers: Arc::new(RwLock::new(HashMap::new())),
            self_id,
            stale_after: Duration::seconds(PEER_STALE_SECS),
        }
    }

    /// Add a peer or refresh its address and last-seen time.
    pub async fn upsert(&self, id: &str, address: SocketAddr) {
        // Never track ourselves.
        if id == self.self_id {
            return;
        }
        let mut peers = self.peers.write().await;
        match peers.get_mut(id) {
            Some(peer) => {
                peer.address = address;
                peer.last_seen = Utc::now();
            }
            None => {
                tracing::info!(peer = %id, addr = %address, "🌐 Discovered new peer");
                peers.insert(
                    id.to_string(),
                    PeerInfo {
                        id: id.to_string(),
                        address,
                        last_seen: Utc::now(),
                    },
                );
            }
        }
    }

    /// Mark a peer as seen. Unknown ids are ignored.
    pub async fn touch(&self, id: &str) {
        let mut peers = self.peers.write().await;
        if let Some(peer) = peers.get_mut(id) {
            peer.last_seen = Utc::now();
        }
    }

    /// Point-in-time copy of every live peer.
    pub async fn snapshot(&self) -> Vec<PeerInfo> {
        let now = Utc::now();
        let peers = self.peers.read().await;
        peers
            .values()
            .filter(|p| p.is_alive(now, self.stale_after))
            .cloned()
            .collect()
    }

    /// Evict peers not seen within the staleness horizon.
    pub async fn prune_stale(&self, now: DateTime<Utc>) {
        let mut peers = self.peers.write().await;
        let before = peers.len();
        peers.retain(|id, peer| {
            let alive = peer.is_alive(now, self.stale_after);
            if !alive {
                tracing::info!(peer = %id, "💀 Peer went stale, removing");
            }
            alive
        });
        let removed = before - peers.len();
        if removed > 0 {
            tracing::debug!(removed, remaining = peers.len(), "Pruned stale peers");
        }
    }

    pub async fn get(&self, id: &str) -> Option<PeerInfo> {
        self.peers.read().await.get(id).cloned()
    }

    pub async fn count(&self) -> usize {
        self.snapshot().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[tokio::test]
    async fn upsert_and_touch() {
        let registry = PeerRegistry::new("self".into());
        registry.upsert("peer-1", addr(9001)).await;
        assert_eq!(registry.count().await, 1);

        let before = registry.get("peer-1").await.unwrap().last_seen;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        registry.touch("peer-1").await;
        let after = registry.get("peer-1").await.unwrap().last_seen;
        assert!(after > before);
    }

    #[tokio::test]
    async fn never_tracks_self() {
        let registry = PeerRegistry::new("self".into());
        registry.upsert("self", addr(9001)).await;
        assert_eq!(registry.count().await, 0);
    }

    #[tokio::test]
    async fn upsert_refreshes_address() {
        let registry = PeerRegistry::new("self".into());
        registry.upsert("peer-1", addr(9001)).await;
        registry.upsert("peer-1", addr(9002)).await;
        assert_eq!(registry.get("peer-1").await.unwrap().address, addr(9002));
        assert_eq!(registry.count().await, 1);
    }

    #[tokio::test]
    async fn stale_peers_are_evicted() {
        let registry = PeerRegistry::new("self".into());
        registry.upsert("peer-1", addr(9001)).await;

        // Not yet past the horizon.
        registry.prune_stale(Utc::now() + Duration::seconds(60)).await;
        assert_eq!(registry.count().await, 1);

        registry
            .prune_stale(Utc::now() + Duration::seconds(PEER_STALE_SECS + 1))
            .await;
        assert!(registry.get("peer-1").await.is_none());
    }
}
