use crate::{
    ClusterTransport, GeoRange, GeoShardError, OccupancyGrid, Result, ShardDirectory,
    ShardRecord, TopologyLock, TopologyUpdate, choose_backup,
};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Clone)]
pub struct PlaceShardOperation {
    directory: Arc<dyn ShardDirectory>,
    transport: Arc<dyn ClusterTransport>,
    lock: TopologyLock,
}

#[derive(Debug, Clone)]
pub struct PlaceShardOperationRequest {
    pub base_addr: String,
}

#[derive(Debug, Clone)]
pub struct PlaceShardOperationResult {
    pub shard: ShardRecord,
    /// Existing shards rewritten by the placement: a split shard, the shard
    /// re-pointed at the newcomer as its backup, or one record doing both.
    pub updated: Vec<ShardRecord>,
    pub split_from: Option<String>,
}

impl PlaceShardOperationResult {
    pub fn topology_update(&self) -> TopologyUpdate {
        let mut upserted = vec![self.shard.clone()];
        upserted.extend(self.updated.iter().cloned());
        TopologyUpdate {
            removed: Vec::new(),
            upserted,
        }
    }
}

impl PlaceShardOperation {
    pub fn new(
        directory: Arc<dyn ShardDirectory>,
        transport: Arc<dyn ClusterTransport>,
        lock: TopologyLock,
    ) -> Self {
        Self {
            directory,
            transport,
            lock,
        }
    }

    pub async fn run(
        &self,
        request: PlaceShardOperationRequest,
    ) -> Result<PlaceShardOperationResult> {
        let PlaceShardOperationRequest { base_addr } = request;
        let base_addr = base_addr.trim().to_string();
        if base_addr.is_empty() {
            return Err(GeoShardError::InvalidRequest(
                "shard baseAddr cannot be empty".to_string(),
            ));
        }

        let guard = self.lock.acquire().await;

        let mut shards = self.directory.find_all().await?;
        if shards.iter().any(|shard| shard.base_addr == base_addr) {
            return Err(GeoShardError::Conflict(format!(
                "shard {} already exists",
                base_addr
            )));
        }

        let mut updated: BTreeMap<String, ShardRecord> = BTreeMap::new();
        let grid = OccupancyGrid::build(shards.iter().map(|shard| &shard.write_range));

        let (range, split_from) = match grid.largest_free_rectangle() {
            Some(range) => (range, None),
            None => {
                let (range, split) = split_largest(&mut shards)?;
                tracing::info!(
                    "No free area left, splitting shard {} for {}",
                    split.base_addr,
                    base_addr
                );
                let split_addr = split.base_addr.clone();
                updated.insert(split_addr.clone(), split);
                (range, Some(split_addr))
            }
        };

        let assignment = choose_backup(&base_addr, &range, &shards);
        if let Some(relinked) = &assignment.relinked {
            updated.insert(relinked.base_addr.clone(), relinked.clone());
        }

        let shard = ShardRecord::new(base_addr.clone(), assignment.backup_addr.clone(), range);
        self.directory.insert(&shard).await?;
        for record in updated.values() {
            self.directory.update(record).await?;
        }
        drop(guard);

        tracing::info!(
            "Placed shard {} write_range={:?} backup={}",
            shard.base_addr,
            shard.write_range,
            shard.backup_addr
        );

        if let Some(previous_target) = &assignment.previous_target {
            if let Err(error) = self.transport.clear_backups(previous_target).await {
                tracing::warn!(
                    "Failed to clear stale backups at {}: {}",
                    previous_target,
                    error
                );
            }
        }

        if let Some(relinked) = &assignment.relinked {
            if let Err(error) = self
                .transport
                .notify_backup_change(&relinked.base_addr, &base_addr)
                .await
            {
                tracing::warn!(
                    "Failed to notify shard {} of new backup {}: {}",
                    relinked.base_addr,
                    base_addr,
                    error
                );
            }
        }

        Ok(PlaceShardOperationResult {
            shard,
            updated: updated.into_values().collect(),
            split_from,
        })
    }
}

/// Bisects the shard with the largest write area (first one on ties) and
/// returns the half handed to the newcomer along with the shrunk shard. The
/// split shard keeps its read range, which still covers the posts it holds.
fn split_largest(shards: &mut [ShardRecord]) -> Result<(GeoRange, ShardRecord)> {
    let mut largest: Option<(usize, f64)> = None;
    for (index, shard) in shards.iter().enumerate() {
        let area = shard.write_range.area();
        if largest.map_or(true, |(_, max)| area > max) {
            largest = Some((index, area));
        }
    }

    let (index, _) = largest.ok_or_else(|| {
        GeoShardError::Internal("world is fully covered but no shard exists".to_string())
    })?;

    let shard = &mut shards[index];
    let (lower, upper) = shard.write_range.split_longer_axis();
    shard.write_range = upper;

    Ok((lower, shard.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryDirectory;
    use crate::testing::{Call, FakeTransport};

    fn operation(
        directory: Arc<MemoryDirectory>,
        transport: Arc<FakeTransport>,
    ) -> PlaceShardOperation {
        PlaceShardOperation::new(directory, transport, TopologyLock::new())
    }

    async fn place(operation: &PlaceShardOperation, addr: &str) -> PlaceShardOperationResult {
        operation
            .run(PlaceShardOperationRequest {
                base_addr: addr.to_string(),
            })
            .await
            .unwrap()
    }

    fn assert_disjoint(shards: &[ShardRecord]) {
        for (i, a) in shards.iter().enumerate() {
            for b in &shards[i + 1..] {
                assert!(
                    !a.write_range.overlaps(&b.write_range),
                    "{} overlaps {}",
                    a.base_addr,
                    b.base_addr
                );
            }
        }
    }

    #[tokio::test]
    async fn test_first_shard_takes_world_and_backs_up_to_itself() {
        let directory = Arc::new(MemoryDirectory::new());
        let transport = Arc::new(FakeTransport::new());
        let result = place(&operation(directory.clone(), transport.clone()), "a").await;

        assert_eq!(result.shard.write_range, GeoRange::WORLD);
        assert_eq!(result.shard.read_range, GeoRange::WORLD);
        assert_eq!(result.shard.backup_addr, "a");
        assert!(result.updated.is_empty());
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn test_second_shard_splits_world() {
        let directory = Arc::new(MemoryDirectory::new());
        let transport = Arc::new(FakeTransport::new());
        let operation = operation(directory.clone(), transport.clone());

        place(&operation, "a").await;
        let result = place(&operation, "b").await;

        let a = directory.find_one("a").await.unwrap();
        let b = directory.find_one("b").await.unwrap();

        assert_eq!(result.split_from.as_deref(), Some("a"));
        assert_eq!(b.write_range, GeoRange::new(-90.0, 90.0, -180.0, 0.0));
        assert_eq!(a.write_range, GeoRange::new(-90.0, 90.0, 0.0, 180.0));
        assert_eq!(a.read_range, GeoRange::WORLD);
        assert!(!a.write_range.overlaps(&b.write_range));
        assert_eq!(a.write_range.expanded_to_contain(&b.write_range), GeoRange::WORLD);

        assert_eq!(b.backup_addr, "a");
        assert_eq!(a.backup_addr, "b");
        assert_eq!(result.updated.len(), 1);

        assert_eq!(
            transport.calls(),
            vec![
                Call::ClearBackups("a".to_string()),
                Call::BackupChange("a".to_string(), "b".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_placement_prefers_free_area_over_split() {
        let directory = Arc::new(MemoryDirectory::with_records([ShardRecord::new(
            "a",
            "a",
            GeoRange::new(-90.0, 90.0, -180.0, 0.0),
        )]));
        let transport = Arc::new(FakeTransport::new());
        let result = place(&operation(directory.clone(), transport), "b").await;

        assert_eq!(result.shard.write_range, GeoRange::new(-90.0, 90.0, 0.0, 180.0));
        assert!(result.split_from.is_none());
        assert_eq!(
            directory.find_one("a").await.unwrap().write_range,
            GeoRange::new(-90.0, 90.0, -180.0, 0.0)
        );
    }

    #[tokio::test]
    async fn test_many_placements_stay_disjoint_and_cover_world() {
        let directory = Arc::new(MemoryDirectory::new());
        let transport = Arc::new(FakeTransport::new());
        let operation = operation(directory.clone(), transport);

        for index in 0..9 {
            place(&operation, &format!("shard-{}", index)).await;
            let shards = directory.find_all().await.unwrap();
            assert_disjoint(&shards);

            let total: f64 = shards.iter().map(|shard| shard.write_range.area()).sum();
            assert_eq!(total, GeoRange::WORLD.area());

            for shard in &shards {
                assert!(shard.read_range.contains(&shard.write_range));
                if shards.len() > 1 {
                    assert_ne!(shard.backup_addr, shard.base_addr);
                }
            }
        }
    }

    #[tokio::test]
    async fn test_duplicate_address_is_conflict() {
        let directory = Arc::new(MemoryDirectory::new());
        let transport = Arc::new(FakeTransport::new());
        let operation = operation(directory, transport);

        place(&operation, "a").await;
        let result = operation
            .run(PlaceShardOperationRequest {
                base_addr: "a".to_string(),
            })
            .await;
        assert!(matches!(result, Err(GeoShardError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_notification_failures_do_not_fail_placement() {
        let directory = Arc::new(MemoryDirectory::new());
        let transport = Arc::new(FakeTransport::new());
        let operation = operation(directory.clone(), transport.clone());

        place(&operation, "a").await;
        transport.set_down("a");
        place(&operation, "b").await;

        assert_eq!(directory.find_all().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_joins_never_overlap() {
        let directory = Arc::new(MemoryDirectory::new());
        let transport = Arc::new(FakeTransport::new());
        let operation = operation(directory.clone(), transport);

        let mut handles = Vec::new();
        for index in 0..8 {
            let operation = operation.clone();
            handles.push(tokio::spawn(async move {
                operation
                    .run(PlaceShardOperationRequest {
                        base_addr: format!("joiner-{}", index),
                    })
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let shards = directory.find_all().await.unwrap();
        assert_eq!(shards.len(), 8);
        assert_disjoint(&shards);
    }
}
