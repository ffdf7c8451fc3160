//! Shard directory: the persistent `baseAddr -> ShardRecord` table.
//!
//! Backends only promise per-call atomicity. Multi-step topology changes
//! serialize through [`crate::TopologyLock`] instead.

pub mod factory;
pub mod memory;
pub mod query;
pub mod redis;
pub mod sqlite;

pub use factory::DirectoryBuilder;
pub use memory::MemoryDirectory;
pub use query::{Bound, Comparison, RangeKind, ShardQuery};
pub use self::redis::RedisDirectory;
pub use sqlite::SqliteDirectory;

use crate::{GeoShardError, Result, ShardRecord};
use async_trait::async_trait;

#[async_trait]
pub trait ShardDirectory: Send + Sync {
    /// Every record, ordered by `baseAddr`.
    async fn find_all(&self) -> Result<Vec<ShardRecord>>;

    async fn find_where(&self, query: &ShardQuery) -> Result<Vec<ShardRecord>> {
        let records = self.find_all().await?;
        Ok(records
            .into_iter()
            .filter(|record| query.matches(record))
            .collect())
    }

    async fn find_one(&self, base_addr: &str) -> Result<ShardRecord> {
        self.find_where(&ShardQuery::Addr(base_addr.to_string()))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| GeoShardError::NotFound(format!("shard {}", base_addr)))
    }

    /// Creates a record; fails with `Conflict` if `baseAddr` is taken.
    async fn insert(&self, record: &ShardRecord) -> Result<()>;

    /// Replaces an existing record; fails with `NotFound` otherwise.
    async fn update(&self, record: &ShardRecord) -> Result<()>;

    /// Inserts or replaces.
    async fn upsert(&self, record: &ShardRecord) -> Result<()>;

    /// Deletes and returns the record; fails with `NotFound` if absent.
    async fn remove(&self, base_addr: &str) -> Result<ShardRecord>;

    /// Swaps the whole table for `records`.
    async fn replace_all(&self, records: &[ShardRecord]) -> Result<()>;
}

pub(crate) fn validate_records(records: &[ShardRecord]) -> Result<()> {
    let mut seen = std::collections::BTreeSet::new();
    for record in records {
        record.validate()?;
        if !seen.insert(record.base_addr.as_str()) {
            return Err(GeoShardError::Conflict(format!(
                "duplicate shard {} in table",
                record.base_addr
            )));
        }
    }
    Ok(())
}
