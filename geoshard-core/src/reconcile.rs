//! Periodic comparison of a replicated table against other routing nodes and
//! majority repair when they disagree.
//!
//! This is best-effort anti-entropy. There is no leader and no write quorum,
//! so a stale majority wins.

use crate::cluster_client::{PEER_TABLE_PATH, SHARD_TABLE_PATH};
use crate::operations::merge::loosely_equal;
use crate::{
    ClusterTransport, GeoShardError, PeerDirectory, PeerRecord, Result, ShardDirectory,
    ShardRecord, TopologyLock,
};
use async_trait::async_trait;
use futures_util::future::join_all;
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

pub const DEFAULT_SAMPLE_SIZE: usize = 5;

/// A table every routing node keeps a full copy of.
#[async_trait]
pub trait SyncedTable: Send + Sync {
    fn name(&self) -> &'static str;

    /// Read-only path other nodes serve this table on.
    fn retrieval_path(&self) -> &'static str;

    /// Field identifying a row across copies.
    fn key_field(&self) -> &'static str {
        "baseAddr"
    }

    /// Whether `row` may be stored. Rows assembled field by field from
    /// different peers are checked before they replace the local copy.
    fn accepts(&self, _row: &Value) -> bool {
        true
    }

    async fn snapshot(&self) -> Result<Vec<Value>>;

    async fn replace(&self, rows: Vec<Value>) -> Result<()>;
}

/// The shard directory as a synced table. Replacing it takes the topology
/// lock so a repair never lands in the middle of a local placement or
/// removal.
pub struct ShardTable {
    directory: Arc<dyn ShardDirectory>,
    lock: TopologyLock,
}

impl ShardTable {
    pub fn new(directory: Arc<dyn ShardDirectory>, lock: TopologyLock) -> Self {
        Self { directory, lock }
    }
}

#[async_trait]
impl SyncedTable for ShardTable {
    fn name(&self) -> &'static str {
        "shard"
    }

    fn retrieval_path(&self) -> &'static str {
        SHARD_TABLE_PATH
    }

    fn accepts(&self, row: &Value) -> bool {
        serde_json::from_value::<ShardRecord>(row.clone())
            .is_ok_and(|record| record.validate().is_ok())
    }

    async fn snapshot(&self) -> Result<Vec<Value>> {
        let records = self.directory.find_all().await?;
        records
            .iter()
            .map(|record| serde_json::to_value(record).map_err(GeoShardError::from))
            .collect()
    }

    async fn replace(&self, rows: Vec<Value>) -> Result<()> {
        let records = rows
            .into_iter()
            .map(serde_json::from_value::<ShardRecord>)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let _guard = self.lock.acquire().await;
        self.directory.replace_all(&records).await
    }
}

pub struct PeerTable {
    peers: Arc<PeerDirectory>,
}

impl PeerTable {
    pub fn new(peers: Arc<PeerDirectory>) -> Self {
        Self { peers }
    }
}

#[async_trait]
impl SyncedTable for PeerTable {
    fn name(&self) -> &'static str {
        "peer"
    }

    fn retrieval_path(&self) -> &'static str {
        PEER_TABLE_PATH
    }

    async fn snapshot(&self) -> Result<Vec<Value>> {
        let records = self.peers.records().await;
        records
            .iter()
            .map(|record| serde_json::to_value(record).map_err(GeoShardError::from))
            .collect()
    }

    async fn replace(&self, rows: Vec<Value>) -> Result<()> {
        let records = rows
            .into_iter()
            .map(serde_json::from_value::<PeerRecord>)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        self.peers.replace_all(&records).await;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileOutcome {
    Unchanged,
    Repaired(Vec<Value>),
}

#[async_trait]
pub trait Reconciler: Send + Sync {
    /// Compares `table` against `peers` (other nodes only) and repairs the
    /// local copy if needed.
    async fn reconcile(&self, table: &dyn SyncedTable, peers: &[String])
    -> Result<ReconcileOutcome>;
}

pub struct MajorityReconciler {
    transport: Arc<dyn ClusterTransport>,
    sample_size: usize,
}

impl MajorityReconciler {
    pub fn new(transport: Arc<dyn ClusterTransport>) -> Self {
        Self::with_sample_size(transport, DEFAULT_SAMPLE_SIZE)
    }

    pub fn with_sample_size(transport: Arc<dyn ClusterTransport>, sample_size: usize) -> Self {
        Self {
            transport,
            sample_size: sample_size.max(1),
        }
    }

    /// Pulls the table from each address; unreachable peers are left out.
    async fn pull(&self, table: &dyn SyncedTable, peers: &[String]) -> Vec<Vec<Value>> {
        let path = table.retrieval_path();
        let fetches = peers.iter().map(|addr| async move {
            (addr, self.transport.fetch_table(addr, path).await)
        });

        let mut tables = Vec::with_capacity(peers.len());
        for (addr, outcome) in join_all(fetches).await {
            match outcome {
                Ok(rows) => tables.push(rows),
                Err(error) => {
                    tracing::warn!(
                        "Skipping {} for {} table reconciliation: {}",
                        addr,
                        table.name(),
                        error
                    );
                }
            }
        }
        tables
    }
}

#[async_trait]
impl Reconciler for MajorityReconciler {
    async fn reconcile(
        &self,
        table: &dyn SyncedTable,
        peers: &[String],
    ) -> Result<ReconcileOutcome> {
        if peers.is_empty() {
            return Ok(ReconcileOutcome::Unchanged);
        }

        let local = table.snapshot().await?;
        let key_field = table.key_field();

        let sample = sample_evenly(peers, self.sample_size);
        let sampled = self.pull(table, &sample).await;
        if !sampled.is_empty()
            && sampled
                .iter()
                .all(|rows| tables_match(&local, rows, key_field))
        {
            return Ok(ReconcileOutcome::Unchanged);
        }

        tracing::info!(
            "Local {} table differs from the network, pulling from {} peer(s)",
            table.name(),
            peers.len()
        );

        let tables = self.pull(table, peers).await;
        if tables.is_empty() {
            return Err(GeoShardError::ReconciliationInconclusive {
                responded: 0,
                required: 1,
            });
        }

        let repaired = majority_table(&tables, key_field, &|row| table.accepts(row));
        table.replace(repaired.clone()).await?;

        tracing::info!(
            "Repaired {} table from {} peer(s): {} row(s)",
            table.name(),
            tables.len(),
            repaired.len()
        );
        Ok(ReconcileOutcome::Repaired(repaired))
    }
}

/// Up to `count` addresses spread evenly over `peers` by index.
pub fn sample_evenly(peers: &[String], count: usize) -> Vec<String> {
    let count = count.min(peers.len());
    (0..count)
        .map(|index| peers[index * peers.len() / count].clone())
        .collect()
}

/// Order-insensitive comparison of two copies of a table.
pub fn tables_match(left: &[Value], right: &[Value], key_field: &str) -> bool {
    if left.len() != right.len() {
        return false;
    }

    let mut left: Vec<&Value> = left.iter().collect();
    let mut right: Vec<&Value> = right.iter().collect();
    left.sort_by(|a, b| compare_rows(a, b, key_field));
    right.sort_by(|a, b| compare_rows(a, b, key_field));

    left.iter()
        .zip(right.iter())
        .all(|(left, right)| loosely_equal(left, right))
}

fn compare_rows(left: &Value, right: &Value, key_field: &str) -> Ordering {
    row_key(left, key_field).cmp(&row_key(right, key_field))
}

/// Row identity as a string. Rows without the key field are identified by
/// their whole serialized form.
fn row_key(row: &Value, key_field: &str) -> String {
    match row.get(key_field) {
        Some(Value::String(key)) => key.clone(),
        Some(key) => key.to_string(),
        None => row.to_string(),
    }
}

/// Builds the table most peers agree on. A row survives if at least half of
/// the tables contain it; each of its fields takes the most common value,
/// ties going to the value seen first.
///
/// Mixing fields from different copies can produce a row no peer holds. When
/// `accepts` rejects it, the most common whole copy is used instead, and the
/// row is dropped if that is rejected too.
pub fn majority_table(
    tables: &[Vec<Value>],
    key_field: &str,
    accepts: &dyn Fn(&Value) -> bool,
) -> Vec<Value> {
    let mut order: Vec<String> = Vec::new();
    let mut copies: HashMap<String, Vec<&Value>> = HashMap::new();

    for rows in tables {
        for row in rows {
            let key = row_key(row, key_field);
            let entry = copies.entry(key.clone()).or_default();
            if entry.is_empty() {
                order.push(key);
            }
            entry.push(row);
        }
    }

    order
        .into_iter()
        .filter_map(|key| {
            let rows = copies.remove(&key)?;
            if rows.len() * 2 < tables.len() {
                return None;
            }

            let merged = majority_value(&rows);
            if accepts(&merged) {
                return Some(merged);
            }

            let whole = most_common(&rows);
            if accepts(&whole) {
                tracing::warn!(
                    "Field-wise majority for row {} is not a valid row, using its most common copy",
                    key
                );
                return Some(whole);
            }

            tracing::warn!("No valid copy of row {} among peers, dropping it", key);
            None
        })
        .collect()
}

/// Most common value among `values`, field by field for objects.
pub fn majority_value(values: &[&Value]) -> Value {
    if !values.is_empty() && values.iter().all(|value| value.is_object()) {
        let mut fields: Vec<&String> = Vec::new();
        for value in values {
            if let Value::Object(map) = value {
                for key in map.keys() {
                    if !fields.contains(&key) {
                        fields.push(key);
                    }
                }
            }
        }

        let mut merged = Map::new();
        for field in fields {
            let candidates: Vec<&Value> =
                values.iter().filter_map(|value| value.get(field)).collect();
            merged.insert(field.clone(), majority_value(&candidates));
        }
        return Value::Object(merged);
    }

    most_common(values)
}

/// Most common value compared as a whole, ties going to the value seen
/// first.
fn most_common(values: &[&Value]) -> Value {
    let mut tally: Vec<(&Value, usize)> = Vec::new();
    for value in values {
        match tally
            .iter_mut()
            .find(|(seen, _)| loosely_equal(seen, value))
        {
            Some((_, count)) => *count += 1,
            None => tally.push((*value, 1)),
        }
    }

    let mut winner: Option<(&Value, usize)> = None;
    for (value, count) in tally {
        if winner.map_or(true, |(_, best)| count > best) {
            winner = Some((value, count));
        }
    }

    winner.map(|(value, _)| value.clone()).unwrap_or(Value::Null)
}
