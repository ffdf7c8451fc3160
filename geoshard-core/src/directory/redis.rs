use super::{ShardDirectory, validate_records};
use crate::{GeoShardError, Result, ShardRecord};
use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use std::collections::BTreeMap;

const UPDATE_IF_EXISTS: &str = r#"
if redis.call('HEXISTS', KEYS[1], ARGV[1]) == 1 then
    redis.call('HSET', KEYS[1], ARGV[1], ARGV[2])
    return 1
end
return 0
"#;

const TAKE: &str = r#"
local value = redis.call('HGET', KEYS[1], ARGV[1])
if value then
    redis.call('HDEL', KEYS[1], ARGV[1])
end
return value
"#;

/// Shard directory shared through Redis: one hash per namespace, field is
/// the shard address, value is the JSON record.
pub struct RedisDirectory {
    conn: ConnectionManager,
    key: String,
}

impl RedisDirectory {
    pub async fn new(url: &str, namespace: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(|error| {
            GeoShardError::Config(format!("invalid redis url '{}': {}", url, error))
        })?;
        let conn = ConnectionManager::new(client).await.map_err(|error| {
            GeoShardError::Internal(format!("redis connection failed: {}", error))
        })?;

        Ok(Self {
            conn,
            key: hash_key(namespace),
        })
    }
}

#[async_trait]
impl ShardDirectory for RedisDirectory {
    async fn find_all(&self) -> Result<Vec<ShardRecord>> {
        let mut conn = self.conn.clone();
        let raw: BTreeMap<String, String> = conn.hgetall(&self.key).await?;

        let mut records = Vec::with_capacity(raw.len());
        for (field, value) in raw {
            let record: ShardRecord = serde_json::from_str(&value).map_err(|error| {
                GeoShardError::Internal(format!(
                    "corrupt shard record for {} in {}: {}",
                    field, self.key, error
                ))
            })?;
            records.push(record);
        }
        Ok(records)
    }

    async fn find_one(&self, base_addr: &str) -> Result<ShardRecord> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.hget(&self.key, base_addr).await?;
        let value = value.ok_or_else(|| GeoShardError::NotFound(format!("shard {}", base_addr)))?;
        Ok(serde_json::from_str(&value)?)
    }

    async fn insert(&self, record: &ShardRecord) -> Result<()> {
        record.validate()?;
        let payload = serde_json::to_string(record)?;
        let mut conn = self.conn.clone();

        let created: bool = conn.hset_nx(&self.key, &record.base_addr, payload).await?;
        if !created {
            return Err(GeoShardError::Conflict(format!(
                "shard {} already exists",
                record.base_addr
            )));
        }
        Ok(())
    }

    async fn update(&self, record: &ShardRecord) -> Result<()> {
        record.validate()?;
        let payload = serde_json::to_string(record)?;
        let mut conn = self.conn.clone();

        let updated: i64 = redis::Script::new(UPDATE_IF_EXISTS)
            .key(&self.key)
            .arg(&record.base_addr)
            .arg(payload)
            .invoke_async(&mut conn)
            .await?;
        if updated == 0 {
            return Err(GeoShardError::NotFound(format!(
                "shard {}",
                record.base_addr
            )));
        }
        Ok(())
    }

    async fn upsert(&self, record: &ShardRecord) -> Result<()> {
        record.validate()?;
        let payload = serde_json::to_string(record)?;
        let mut conn = self.conn.clone();
        let _: () = conn.hset(&self.key, &record.base_addr, payload).await?;
        Ok(())
    }

    async fn remove(&self, base_addr: &str) -> Result<ShardRecord> {
        let mut conn = self.conn.clone();
        let value: Option<String> = redis::Script::new(TAKE)
            .key(&self.key)
            .arg(base_addr)
            .invoke_async(&mut conn)
            .await?;

        let value = value.ok_or_else(|| GeoShardError::NotFound(format!("shard {}", base_addr)))?;
        Ok(serde_json::from_str(&value)?)
    }

    async fn replace_all(&self, records: &[ShardRecord]) -> Result<()> {
        validate_records(records)?;
        let mut entries = Vec::with_capacity(records.len());
        for record in records {
            entries.push((record.base_addr.clone(), serde_json::to_string(record)?));
        }

        let mut pipe = redis::pipe();
        pipe.atomic().del(&self.key).ignore();
        if !entries.is_empty() {
            pipe.hset_multiple(&self.key, &entries).ignore();
        }

        let mut conn = self.conn.clone();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }
}

fn hash_key(namespace: &str) -> String {
    format!("geoshard:{}:shards", namespace.trim())
}
