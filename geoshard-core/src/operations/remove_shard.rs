use super::recalculate_ranges::refresh_read_range;
use crate::cluster_client::{RedistributionPlan, RedistributionTarget};
use crate::{
    ClusterTransport, GeoRange, GeoShardError, Result, ShardDirectory, ShardQuery, ShardRecord,
    TopologyLock, TopologyUpdate,
};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Chooses which neighbour takes over the area a removed shard leaves
/// behind.
pub trait GapFiller: Send + Sync {
    /// `neighbours` are the shards with a bound on one of `vacated`'s edges,
    /// ordered by address. Returns the grown record, or `None` to leave the
    /// area unowned.
    fn fill(&self, vacated: &GeoRange, neighbours: &[ShardRecord]) -> Option<ShardRecord>;
}

/// Hands the vacated area to the first neighbour sharing a complete edge
/// with it. Neighbours that only share a corner or part of an edge are not
/// considered; the area then stays unowned until a shard joins into it.
#[derive(Debug, Clone, Copy, Default)]
pub struct EdgeAlignedGapFiller;

impl GapFiller for EdgeAlignedGapFiller {
    fn fill(&self, vacated: &GeoRange, neighbours: &[ShardRecord]) -> Option<ShardRecord> {
        let neighbour = neighbours
            .iter()
            .find(|shard| shard.write_range.shares_full_edge_with(vacated))?;

        let mut grown = neighbour.clone();
        grown.absorb(vacated);
        Some(grown)
    }
}

#[derive(Clone)]
pub struct RemoveShardOperation {
    directory: Arc<dyn ShardDirectory>,
    transport: Arc<dyn ClusterTransport>,
    lock: TopologyLock,
    gap_filler: Arc<dyn GapFiller>,
}

#[derive(Debug, Clone)]
pub struct RemoveShardOperationRequest {
    pub base_addr: String,
    /// Recover the removed shard's posts from its backup. Off for a
    /// graceful leave, where the shard still serves its own posts.
    pub use_backup_for_recovery: bool,
}

#[derive(Debug, Clone)]
pub struct RepairSummary {
    pub removed: ShardRecord,
    pub relinked: Vec<String>,
    pub absorbed_by: Option<String>,
    pub redistributed_via: Option<String>,
    pub refreshed: Vec<String>,
    /// Final state of every surviving record the removal rewrote.
    pub updated: Vec<ShardRecord>,
    pub completed_at: DateTime<Utc>,
}

impl RepairSummary {
    pub fn topology_update(&self) -> TopologyUpdate {
        TopologyUpdate {
            removed: vec![self.removed.base_addr.clone()],
            upserted: self.updated.clone(),
        }
    }
}

impl RemoveShardOperation {
    pub fn new(
        directory: Arc<dyn ShardDirectory>,
        transport: Arc<dyn ClusterTransport>,
        lock: TopologyLock,
    ) -> Self {
        Self::with_gap_filler(directory, transport, lock, Arc::new(EdgeAlignedGapFiller))
    }

    pub fn with_gap_filler(
        directory: Arc<dyn ShardDirectory>,
        transport: Arc<dyn ClusterTransport>,
        lock: TopologyLock,
        gap_filler: Arc<dyn GapFiller>,
    ) -> Self {
        Self {
            directory,
            transport,
            lock,
            gap_filler,
        }
    }

    pub async fn run(&self, request: RemoveShardOperationRequest) -> Result<RepairSummary> {
        let RemoveShardOperationRequest {
            base_addr,
            use_backup_for_recovery,
        } = request;
        let base_addr = base_addr.trim().to_string();

        // Held for the directory changes only. Shards are contacted after
        // it is released, so a hung shard cannot stall other joins.
        let guard = self.lock.acquire().await;

        let removed = self.directory.remove(&base_addr).await.map_err(|error| {
            tracing::error!("Failed to remove shard {}: {}", base_addr, error);
            error
        })?;

        let mut updated: BTreeMap<String, ShardRecord> = BTreeMap::new();

        let relinked = self
            .relink_backups(&removed, &mut updated)
            .await
            .map_err(|error| self.abort("backup relink", &removed, error))?;

        let absorbed_by = self
            .fill_gap(&removed, &mut updated)
            .await
            .map_err(|error| self.abort("gap fill", &removed, error))?;

        for record in updated.values() {
            self.directory
                .update(record)
                .await
                .map_err(|error| self.abort("persist", &removed, error))?;
        }
        drop(guard);

        tracing::info!(
            "Removed shard {} relinked={:?} absorbed_by={:?}",
            removed.base_addr,
            relinked,
            absorbed_by
        );

        for addr in &relinked {
            if let Some(record) = updated.get(addr) {
                if let Err(error) = self
                    .transport
                    .notify_backup_change(&record.base_addr, &record.backup_addr)
                    .await
                {
                    tracing::warn!(
                        "Failed to notify shard {} of new backup {}: {}",
                        record.base_addr,
                        record.backup_addr,
                        error
                    );
                }
            }
        }

        let redistributed_via = self
            .redistribute(&removed, use_backup_for_recovery)
            .await
            .map_err(|error| self.abort("redistribution", &removed, error))?;

        let mut refreshed = Vec::new();
        if let Some(addr) = &absorbed_by {
            let refreshed_record = refresh_read_range(
                self.directory.as_ref(),
                self.transport.as_ref(),
                &self.lock,
                addr,
            )
            .await
            .map_err(|error| self.abort("read range refresh", &removed, error))?;
            if let Some(record) = refreshed_record {
                refreshed.push(record.base_addr.clone());
                updated.insert(record.base_addr.clone(), record);
            }
        }

        Ok(RepairSummary {
            removed,
            relinked,
            absorbed_by,
            redistributed_via,
            refreshed,
            updated: updated.into_values().collect(),
            completed_at: Utc::now(),
        })
    }

    /// Points every shard that backed up to the removed one at the removed
    /// shard's own backup target.
    async fn relink_backups(
        &self,
        removed: &ShardRecord,
        updated: &mut BTreeMap<String, ShardRecord>,
    ) -> Result<Vec<String>> {
        let dependents = self
            .directory
            .find_where(&ShardQuery::BackupAddr(removed.base_addr.clone()))
            .await?;

        let mut relinked = Vec::with_capacity(dependents.len());
        for mut shard in dependents {
            shard.backup_addr = if removed.is_self_backed() {
                shard.base_addr.clone()
            } else {
                removed.backup_addr.clone()
            };
            relinked.push(shard.base_addr.clone());
            updated.insert(shard.base_addr.clone(), shard);
        }

        Ok(relinked)
    }

    async fn fill_gap(
        &self,
        removed: &ShardRecord,
        updated: &mut BTreeMap<String, ShardRecord>,
    ) -> Result<Option<String>> {
        let vacated = removed.write_range;
        let neighbours: Vec<ShardRecord> = self
            .directory
            .find_where(&ShardQuery::touching_edges(&vacated))
            .await?
            .into_iter()
            .map(|shard| updated.get(&shard.base_addr).cloned().unwrap_or(shard))
            .collect();

        let Some(grown) = self.gap_filler.fill(&vacated, &neighbours) else {
            if !neighbours.is_empty() {
                tracing::warn!(
                    "No neighbour of {} shares a full edge with {:?}; area left unowned",
                    removed.base_addr,
                    vacated
                );
            }
            return Ok(None);
        };

        let addr = grown.base_addr.clone();
        updated.insert(addr.clone(), grown);
        Ok(Some(addr))
    }

    /// Tells the node holding the removed shard's posts where each of them
    /// belongs now. Skipped when no shard survives.
    async fn redistribute(
        &self,
        removed: &ShardRecord,
        use_backup_for_recovery: bool,
    ) -> Result<Option<String>> {
        let survivors = self.directory.find_all().await?;
        if survivors.is_empty() {
            tracing::info!(
                "Shard {} was the last one, nothing to redistribute",
                removed.base_addr
            );
            return Ok(None);
        }

        let source = if use_backup_for_recovery {
            removed.backup_addr.clone()
        } else {
            removed.base_addr.clone()
        };

        let plan = RedistributionPlan {
            target_servers: survivors
                .into_iter()
                .map(|shard| RedistributionTarget {
                    range: shard.write_range,
                    address: shard.base_addr,
                })
                .collect(),
        };

        self.transport.send_redistribution(&source, &plan).await?;
        Ok(Some(source))
    }

    fn abort(&self, step: &str, removed: &ShardRecord, error: GeoShardError) -> GeoShardError {
        tracing::error!(
            "Removal of shard {} aborted at {}: {}",
            removed.base_addr,
            step,
            error
        );
        error
    }
}
