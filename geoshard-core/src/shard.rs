use crate::{GeoRange, GeoShardError, Result};
use serde::{Deserialize, Serialize};

/// Directory entry for one storage shard.
///
/// `write_range` is the area the shard owns for new posts. `read_range` also
/// covers posts it still holds from before a split, so it always contains
/// `write_range`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShardRecord {
    pub base_addr: String,
    pub backup_addr: String,
    pub write_range: GeoRange,
    pub read_range: GeoRange,
}

impl ShardRecord {
    pub fn new(
        base_addr: impl Into<String>,
        backup_addr: impl Into<String>,
        range: GeoRange,
    ) -> Self {
        Self {
            base_addr: base_addr.into(),
            backup_addr: backup_addr.into(),
            write_range: range,
            read_range: range,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.base_addr.trim().is_empty() {
            return Err(GeoShardError::InvalidRequest(
                "shard baseAddr cannot be empty".to_string(),
            ));
        }

        if self.backup_addr.trim().is_empty() {
            return Err(GeoShardError::InvalidRequest(format!(
                "shard {} has an empty backupAddr",
                self.base_addr
            )));
        }

        self.write_range.validate()?;
        self.read_range.validate()?;

        if !self.read_range.contains(&self.write_range) {
            return Err(GeoShardError::InvalidRequest(format!(
                "shard {} readRange does not contain its writeRange",
                self.base_addr
            )));
        }

        Ok(())
    }

    /// Replaces the write range and widens the read range so it still
    /// contains it.
    pub fn set_write_range(&mut self, range: GeoRange) {
        self.write_range = range;
        self.read_range.expand_to_contain(&range);
    }

    /// Grows both ranges to cover `range`.
    pub fn absorb(&mut self, range: &GeoRange) {
        self.write_range.expand_to_contain(range);
        self.read_range.expand_to_contain(range);
    }

    pub fn is_self_backed(&self) -> bool {
        self.base_addr == self.backup_addr
    }
}
