use crate::{GeoShardError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::ops::Bound;
use tokio::sync::RwLock;

/// Peer table entry as exchanged between nodes.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerRecord {
    pub base_addr: String,
}

/// Addresses of the routing nodes in the network, this node included,
/// kept sorted so every node derives the same heartbeat ring.
pub struct PeerDirectory {
    local_addr: String,
    peers: RwLock<BTreeSet<String>>,
}

impl PeerDirectory {
    pub fn new(local_addr: impl Into<String>) -> Self {
        let local_addr = local_addr.into();
        let peers = BTreeSet::from([local_addr.clone()]);
        Self {
            local_addr,
            peers: RwLock::new(peers),
        }
    }

    pub fn local_addr(&self) -> &str {
        &self.local_addr
    }

    pub async fn list(&self) -> Vec<String> {
        self.peers.read().await.iter().cloned().collect()
    }

    pub async fn records(&self) -> Vec<PeerRecord> {
        self.peers
            .read()
            .await
            .iter()
            .map(|addr| PeerRecord {
                base_addr: addr.clone(),
            })
            .collect()
    }

    /// Every peer except this node.
    pub async fn others(&self) -> Vec<String> {
        self.peers
            .read()
            .await
            .iter()
            .filter(|addr| **addr != self.local_addr)
            .cloned()
            .collect()
    }

    pub async fn contains(&self, addr: &str) -> bool {
        self.peers.read().await.contains(addr)
    }

    /// Returns false if the peer was already known.
    pub async fn add(&self, addr: &str) -> Result<bool> {
        let addr = addr.trim();
        if addr.is_empty() {
            return Err(GeoShardError::InvalidRequest(
                "peer address cannot be empty".to_string(),
            ));
        }
        Ok(self.peers.write().await.insert(addr.to_string()))
    }

    /// Returns false if the peer was unknown. The local node is never
    /// removed from its own table.
    pub async fn remove(&self, addr: &str) -> bool {
        if addr == self.local_addr {
            return false;
        }
        self.peers.write().await.remove(addr)
    }

    pub async fn replace_all(&self, records: &[PeerRecord]) {
        let mut peers: BTreeSet<String> = records
            .iter()
            .map(|record| record.base_addr.trim().to_string())
            .filter(|addr| !addr.is_empty())
            .collect();
        peers.insert(self.local_addr.clone());
        *self.peers.write().await = peers;
    }

    /// Next peer after `addr` in address order, wrapping around. `None`
    /// when `addr` is the only peer.
    pub async fn successor_of(&self, addr: &str) -> Option<String> {
        let peers = self.peers.read().await;
        let next = peers
            .range::<str, _>((Bound::Excluded(addr), Bound::Unbounded))
            .next()
            .or_else(|| peers.iter().next())?;

        if next == addr { None } else { Some(next.clone()) }
    }

    /// Peers in ring order starting after `addr`, excluding `addr` itself.
    pub async fn ring_after(&self, addr: &str) -> Vec<String> {
        let peers = self.peers.read().await;
        let after = peers.range::<str, _>((Bound::Excluded(addr), Bound::Unbounded));
        let before = peers.range::<str, _>((Bound::Unbounded, Bound::Excluded(addr)));
        after.chain(before).cloned().collect()
    }
}
