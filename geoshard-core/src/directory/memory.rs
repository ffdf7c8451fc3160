use super::{ShardDirectory, validate_records};
use crate::{GeoShardError, Result, ShardRecord};
use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

#[derive(Default)]
pub struct MemoryDirectory {
    records: RwLock<BTreeMap<String, ShardRecord>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: impl IntoIterator<Item = ShardRecord>) -> Self {
        let records = records
            .into_iter()
            .map(|record| (record.base_addr.clone(), record))
            .collect();
        Self {
            records: RwLock::new(records),
        }
    }
}

#[async_trait]
impl ShardDirectory for MemoryDirectory {
    async fn find_all(&self) -> Result<Vec<ShardRecord>> {
        Ok(self.records.read().await.values().cloned().collect())
    }

    async fn insert(&self, record: &ShardRecord) -> Result<()> {
        record.validate()?;
        let mut records = self.records.write().await;
        if records.contains_key(&record.base_addr) {
            return Err(GeoShardError::Conflict(format!(
                "shard {} already exists",
                record.base_addr
            )));
        }
        records.insert(record.base_addr.clone(), record.clone());
        Ok(())
    }

    async fn update(&self, record: &ShardRecord) -> Result<()> {
        record.validate()?;
        let mut records = self.records.write().await;
        match records.get_mut(&record.base_addr) {
            Some(existing) => {
                *existing = record.clone();
                Ok(())
            }
            None => Err(GeoShardError::NotFound(format!(
                "shard {}",
                record.base_addr
            ))),
        }
    }

    async fn upsert(&self, record: &ShardRecord) -> Result<()> {
        record.validate()?;
        self.records
            .write()
            .await
            .insert(record.base_addr.clone(), record.clone());
        Ok(())
    }

    async fn remove(&self, base_addr: &str) -> Result<ShardRecord> {
        self.records
            .write()
            .await
            .remove(base_addr)
            .ok_or_else(|| GeoShardError::NotFound(format!("shard {}", base_addr)))
    }

    async fn replace_all(&self, records: &[ShardRecord]) -> Result<()> {
        validate_records(records)?;
        let replacement = records
            .iter()
            .map(|record| (record.base_addr.clone(), record.clone()))
            .collect();
        *self.records.write().await = replacement;
        Ok(())
    }
}
