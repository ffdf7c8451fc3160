use crate::{ClusterTransport, GeoShardError, Result, ShardDirectory, ShardRecord};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};

/// Serializes placement and removal on this node. Both read the whole
/// shard table and write back a plan derived from it, so two of them must
/// not interleave. Nodes do not share this lock.
#[derive(Clone, Default)]
pub struct TopologyLock {
    inner: Arc<Mutex<()>>,
}

impl TopologyLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self) -> MutexGuard<'_, ()> {
        self.inner.lock().await
    }
}

/// Record-level changes one node pushes to the others after it changed the
/// shard table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopologyUpdate {
    #[serde(default)]
    pub removed: Vec<String>,
    #[serde(default)]
    pub upserted: Vec<ShardRecord>,
}

impl TopologyUpdate {
    pub fn is_empty(&self) -> bool {
        self.removed.is_empty() && self.upserted.is_empty()
    }

    /// Applies removals first, then upserts. Records already gone are
    /// skipped.
    pub async fn apply(&self, directory: &dyn ShardDirectory) -> Result<()> {
        for addr in &self.removed {
            match directory.remove(addr).await {
                Ok(_) | Err(GeoShardError::NotFound(_)) => {}
                Err(error) => return Err(error),
            }
        }

        for record in &self.upserted {
            directory.upsert(record).await?;
        }

        Ok(())
    }

    /// Pushes the update to every address in `peers`. Failures are logged
    /// and left for reconciliation; returns how many peers accepted it.
    pub async fn broadcast(&self, transport: &dyn ClusterTransport, peers: &[String]) -> usize {
        if self.is_empty() {
            return 0;
        }

        let pushes = peers.iter().map(|addr| async move {
            (addr, transport.push_topology_update(addr, self).await)
        });

        let mut delivered = 0;
        for (addr, outcome) in join_all(pushes).await {
            match outcome {
                Ok(()) => delivered += 1,
                Err(error) => {
                    tracing::warn!("Failed to push topology update to {}: {}", addr, error);
                }
            }
        }
        delivered
    }
}
