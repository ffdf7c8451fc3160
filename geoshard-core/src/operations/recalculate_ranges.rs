use crate::{ClusterTransport, GeoShardError, Result, ShardDirectory, ShardRecord, TopologyLock};
use futures_util::future::join_all;
use std::sync::Arc;

#[derive(Clone)]
pub struct RecalculateRangesOperation {
    directory: Arc<dyn ShardDirectory>,
    transport: Arc<dyn ClusterTransport>,
    lock: TopologyLock,
}

#[derive(Debug, Clone, Default)]
pub struct RecalculateRangesOperationResult {
    pub checked: usize,
    pub updated: Vec<ShardRecord>,
    pub failed: Vec<String>,
}

impl RecalculateRangesOperation {
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

    /// Pulls the true post bounds of every shard whose read range is still
    /// wider than its write range and narrows it where possible.
    pub async fn run(&self) -> Result<RecalculateRangesOperationResult> {
        let shards: Vec<String> = self
            .directory
            .find_all()
            .await?
            .into_iter()
            .filter(|shard| shard.read_range != shard.write_range)
            .map(|shard| shard.base_addr)
            .collect();

        let checks = shards.iter().map(|base_addr| async move {
            let outcome = refresh_read_range(
                self.directory.as_ref(),
                self.transport.as_ref(),
                &self.lock,
                base_addr,
            )
            .await;
            (base_addr.clone(), outcome)
        });

        let mut result = RecalculateRangesOperationResult {
            checked: shards.len(),
            ..Default::default()
        };

        for (base_addr, outcome) in join_all(checks).await {
            match outcome {
                Ok(Some(record)) => result.updated.push(record),
                Ok(None) => {}
                Err(error) => {
                    tracing::warn!("Failed to recalculate read range of {}: {}", base_addr, error);
                    result.failed.push(base_addr);
                }
            }
        }

        if !result.updated.is_empty() {
            tracing::info!(
                "Recalculated read ranges: checked={} updated={} failed={}",
                result.checked,
                result.updated.len(),
                result.failed.len()
            );
        }

        Ok(result)
    }
}

/// Sets a shard's read range to the bounds of the posts it reports, grown to
/// cover its write range. A shard holding no posts reads exactly its write
/// range. Returns the persisted record when anything changed.
///
/// The shard is asked outside the lock. The record is then re-read under
/// `lock` and only its read range is written, so a placement or removal
/// that ran in between keeps its write range and backup.
pub async fn refresh_read_range(
    directory: &dyn ShardDirectory,
    transport: &dyn ClusterTransport,
    lock: &TopologyLock,
    base_addr: &str,
) -> Result<Option<ShardRecord>> {
    let post_range = transport.fetch_post_range(base_addr).await?;

    let _guard = lock.acquire().await;
    let mut shard = match directory.find_one(base_addr).await {
        Ok(shard) => shard,
        Err(GeoShardError::NotFound(_)) => return Ok(None),
        Err(error) => return Err(error),
    };

    let read_range = match post_range {
        Some(range) => range.expanded_to_contain(&shard.write_range),
        None => shard.write_range,
    };

    if read_range == shard.read_range {
        return Ok(None);
    }

    shard.read_range = read_range;
    directory.update(&shard).await?;

    tracing::debug!(
        "Read range of {} is now {:?}",
        shard.base_addr,
        shard.read_range
    );
    Ok(Some(shard))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Call, FakeTransport};
    use crate::{GeoRange, MemoryDirectory, PlaceShardOperation, PlaceShardOperationRequest};
    use std::time::Duration;

    fn split_shard(addr: &str, write: GeoRange) -> ShardRecord {
        let mut record = ShardRecord::new(addr, addr, write);
        record.read_range = GeoRange::WORLD;
        record
    }

    #[tokio::test]
    async fn test_read_range_shrinks_to_posts_plus_write_range() {
        let write = GeoRange::new(-90.0, 90.0, 0.0, 180.0);
        let directory = Arc::new(MemoryDirectory::with_records([split_shard("a", write)]));
        let transport = Arc::new(FakeTransport::new());
        transport.set_post_range("a", Some(GeoRange::new(10.0, 20.0, -30.0, 40.0)));

        let operation =
            RecalculateRangesOperation::new(directory.clone(), transport, TopologyLock::new());
        let result = operation.run().await.unwrap();

        assert_eq!(result.checked, 1);
        assert_eq!(result.updated.len(), 1);
        let a = directory.find_one("a").await.unwrap();
        assert_eq!(a.read_range, GeoRange::new(-90.0, 90.0, -30.0, 180.0));
        assert!(a.read_range.contains(&a.write_range));
    }

    #[tokio::test]
    async fn test_empty_shard_reads_its_write_range() {
        let write = GeoRange::new(-90.0, 90.0, 0.0, 180.0);
        let directory = Arc::new(MemoryDirectory::with_records([split_shard("a", write)]));
        let transport = Arc::new(FakeTransport::new());
        transport.set_post_range("a", None);

        RecalculateRangesOperation::new(directory.clone(), transport, TopologyLock::new())
            .run()
            .await
            .unwrap();

        assert_eq!(directory.find_one("a").await.unwrap().read_range, write);
    }

    #[tokio::test]
    async fn test_settled_shards_are_not_queried() {
        let directory = Arc::new(MemoryDirectory::with_records([ShardRecord::new(
            "a",
            "a",
            GeoRange::WORLD,
        )]));
        let transport = Arc::new(FakeTransport::new());

        let operation =
            RecalculateRangesOperation::new(directory, transport.clone(), TopologyLock::new());
        let result = operation.run().await.unwrap();

        assert_eq!(result.checked, 0);
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn test_one_failure_does_not_block_others() {
        let directory = Arc::new(MemoryDirectory::with_records([
            split_shard("a", GeoRange::new(-90.0, 90.0, -180.0, 0.0)),
            split_shard("b", GeoRange::new(-90.0, 90.0, 0.0, 180.0)),
        ]));
        let transport = Arc::new(FakeTransport::new());
        transport.set_down("a");
        transport.set_post_range("b", None);

        let operation = RecalculateRangesOperation::new(
            directory.clone(),
            transport.clone(),
            TopologyLock::new(),
        );
        let result = operation.run().await.unwrap();

        assert_eq!(result.failed, vec!["a".to_string()]);
        assert_eq!(result.updated.len(), 1);
        assert_eq!(directory.find_one("a").await.unwrap().read_range, GeoRange::WORLD);
        assert!(transport.calls().contains(&Call::PostRange("b".to_string())));
    }

    #[tokio::test]
    async fn test_unchanged_range_is_not_persisted() {
        let write = GeoRange::new(-90.0, 90.0, 0.0, 180.0);
        let directory = Arc::new(MemoryDirectory::with_records([split_shard("a", write)]));
        let transport = Arc::new(FakeTransport::new());
        transport.set_post_range("a", Some(GeoRange::WORLD));

        let result = RecalculateRangesOperation::new(directory, transport, TopologyLock::new())
            .run()
            .await
            .unwrap();

        assert!(result.updated.is_empty());
        assert!(result.failed.is_empty());
    }

    #[tokio::test]
    async fn test_slow_shard_does_not_undo_concurrent_split() {
        let lock = TopologyLock::new();
        let directory = Arc::new(MemoryDirectory::with_records([
            split_shard("a", GeoRange::new(-90.0, 90.0, -180.0, 30.0)),
            ShardRecord::new("b", "a", GeoRange::new(-90.0, 90.0, 30.0, 180.0)),
        ]));
        let transport = Arc::new(FakeTransport::new());
        transport.set_post_range("a", None);
        transport.set_delay("a", Duration::from_millis(200));

        let recalculate =
            RecalculateRangesOperation::new(directory.clone(), transport.clone(), lock.clone());
        let pending = tokio::spawn(async move { recalculate.run().await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let placement = PlaceShardOperation::new(directory.clone(), transport.clone(), lock);
        let placed = placement
            .run(PlaceShardOperationRequest {
                base_addr: "c".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(placed.split_from.as_deref(), Some("a"));
        let split_a = placed
            .updated
            .iter()
            .find(|record| record.base_addr == "a")
            .cloned()
            .unwrap();

        let recalculated = pending.await.unwrap().unwrap();
        assert_eq!(recalculated.updated.len(), 1);

        let shards = directory.find_all().await.unwrap();
        for left in &shards {
            for right in &shards {
                if left.base_addr != right.base_addr {
                    assert!(
                        !left.write_range.overlaps(&right.write_range),
                        "{} overlaps {}",
                        left.base_addr,
                        right.base_addr
                    );
                }
            }
        }

        let a = directory.find_one("a").await.unwrap();
        assert_eq!(a.write_range, split_a.write_range);
        assert_eq!(a.backup_addr, split_a.backup_addr);
        assert_eq!(a.read_range, a.write_range);
    }

    #[tokio::test]
    async fn test_shard_removed_while_asked_is_skipped() {
        let directory = Arc::new(MemoryDirectory::with_records([split_shard(
            "a",
            GeoRange::new(-90.0, 90.0, 0.0, 180.0),
        )]));
        let transport = Arc::new(FakeTransport::new());
        transport.set_post_range("a", None);
        transport.set_delay("a", Duration::from_millis(100));
        let lock = TopologyLock::new();

        let refresh = {
            let directory = directory.clone();
            let transport = transport.clone();
            let lock = lock.clone();
            tokio::spawn(async move {
                refresh_read_range(directory.as_ref(), transport.as_ref(), &lock, "a").await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        directory.remove("a").await.unwrap();

        assert_eq!(refresh.await.unwrap().unwrap(), None);
        assert!(directory.find_all().await.unwrap().is_empty());
    }
}
