use super::query::{Bound, Comparison, RangeKind, ShardQuery};
use super::{ShardDirectory, validate_records};
use crate::{GeoRange, GeoShardError, Result, ShardRecord};
use async_trait::async_trait;
use rusqlite::types::Value;
use rusqlite::{Connection, ErrorCode, OptionalExtension, Row, params, params_from_iter};
use std::path::{Path, PathBuf};

const SELECT_COLUMNS: &str = "base_addr, backup_addr,
    write_min_lat, write_max_lat, write_min_lng, write_max_lng,
    read_min_lat, read_max_lat, read_min_lng, read_max_lng";

/// Shard directory kept in a local SQLite file, one row per shard.
pub struct SqliteDirectory {
    db_path: PathBuf,
    table: String,
}

impl SqliteDirectory {
    pub fn new(db_path: impl AsRef<Path>, namespace: &str) -> Result<Self> {
        let table = table_name(namespace)?;
        let store = Self {
            db_path: db_path.as_ref().to_path_buf(),
            table,
        };
        store.init_schema()?;
        Ok(store)
    }

    fn get_conn(&self) -> Result<Connection> {
        let conn = Connection::open(&self.db_path)?;
        Ok(conn)
    }

    fn init_schema(&self) -> Result<()> {
        if let Some(parent) = self.db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = self.get_conn()?;
        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    base_addr TEXT PRIMARY KEY,
                    backup_addr TEXT NOT NULL,
                    write_min_lat REAL NOT NULL,
                    write_max_lat REAL NOT NULL,
                    write_min_lng REAL NOT NULL,
                    write_max_lng REAL NOT NULL,
                    read_min_lat REAL NOT NULL,
                    read_max_lat REAL NOT NULL,
                    read_min_lng REAL NOT NULL,
                    read_max_lng REAL NOT NULL
                )",
                self.table
            ),
            [],
        )?;

        conn.execute(
            &format!(
                "CREATE INDEX IF NOT EXISTS idx_{0}_backup ON {0}(backup_addr)",
                self.table
            ),
            [],
        )?;

        Ok(())
    }

    fn insert_row(conn: &Connection, table: &str, record: &ShardRecord) -> Result<()> {
        let result = conn.execute(
            &format!(
                "INSERT INTO {} ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                table, SELECT_COLUMNS
            ),
            record_params(record),
        );

        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(error, _))
                if error.code == ErrorCode::ConstraintViolation =>
            {
                Err(GeoShardError::Conflict(format!(
                    "shard {} already exists",
                    record.base_addr
                )))
            }
            Err(error) => Err(error.into()),
        }
    }
}

#[async_trait]
impl ShardDirectory for SqliteDirectory {
    async fn find_all(&self) -> Result<Vec<ShardRecord>> {
        self.find_where(&ShardQuery::All).await
    }

    async fn find_where(&self, query: &ShardQuery) -> Result<Vec<ShardRecord>> {
        let conn = self.get_conn()?;
        let mut where_clause = String::new();
        let mut values = Vec::new();
        render_query(query, &mut where_clause, &mut values);

        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM {} WHERE {} ORDER BY base_addr",
            SELECT_COLUMNS, self.table, where_clause
        ))?;
        let rows = stmt.query_map(params_from_iter(values), row_to_record)?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    async fn insert(&self, record: &ShardRecord) -> Result<()> {
        record.validate()?;
        let conn = self.get_conn()?;
        Self::insert_row(&conn, &self.table, record)
    }

    async fn update(&self, record: &ShardRecord) -> Result<()> {
        record.validate()?;
        let conn = self.get_conn()?;
        let changed = conn.execute(
            &format!(
                "UPDATE {} SET backup_addr = ?2,
                    write_min_lat = ?3, write_max_lat = ?4, write_min_lng = ?5, write_max_lng = ?6,
                    read_min_lat = ?7, read_max_lat = ?8, read_min_lng = ?9, read_max_lng = ?10
                 WHERE base_addr = ?1",
                self.table
            ),
            record_params(record),
        )?;

        if changed == 0 {
            return Err(GeoShardError::NotFound(format!(
                "shard {}",
                record.base_addr
            )));
        }
        Ok(())
    }

    async fn upsert(&self, record: &ShardRecord) -> Result<()> {
        record.validate()?;
        let conn = self.get_conn()?;
        conn.execute(
            &format!(
                "INSERT INTO {} ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT(base_addr) DO UPDATE SET
                    backup_addr = excluded.backup_addr,
                    write_min_lat = excluded.write_min_lat,
                    write_max_lat = excluded.write_max_lat,
                    write_min_lng = excluded.write_min_lng,
                    write_max_lng = excluded.write_max_lng,
                    read_min_lat = excluded.read_min_lat,
                    read_max_lat = excluded.read_max_lat,
                    read_min_lng = excluded.read_min_lng,
                    read_max_lng = excluded.read_max_lng",
                self.table, SELECT_COLUMNS
            ),
            record_params(record),
        )?;
        Ok(())
    }

    async fn remove(&self, base_addr: &str) -> Result<ShardRecord> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;

        let record = tx
            .query_row(
                &format!(
                    "SELECT {} FROM {} WHERE base_addr = ?1",
                    SELECT_COLUMNS, self.table
                ),
                params![base_addr],
                row_to_record,
            )
            .optional()?
            .ok_or_else(|| GeoShardError::NotFound(format!("shard {}", base_addr)))?;

        tx.execute(
            &format!("DELETE FROM {} WHERE base_addr = ?1", self.table),
            params![base_addr],
        )?;
        tx.commit()?;

        Ok(record)
    }

    async fn replace_all(&self, records: &[ShardRecord]) -> Result<()> {
        validate_records(records)?;
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;

        tx.execute(&format!("DELETE FROM {}", self.table), [])?;
        for record in records {
            Self::insert_row(&tx, &self.table, record)?;
        }
        tx.commit()?;

        Ok(())
    }
}

fn table_name(namespace: &str) -> Result<String> {
    let namespace = namespace.trim();
    if namespace.is_empty()
        || !namespace
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
    {
        return Err(GeoShardError::Config(format!(
            "sqlite directory namespace must be alphanumeric: '{}'",
            namespace
        )));
    }
    Ok(format!("shards_{}", namespace))
}

fn record_params(record: &ShardRecord) -> [Value; 10] {
    let write = &record.write_range;
    let read = &record.read_range;
    [
        Value::Text(record.base_addr.clone()),
        Value::Text(record.backup_addr.clone()),
        Value::Real(write.min_lat),
        Value::Real(write.max_lat),
        Value::Real(write.min_lng),
        Value::Real(write.max_lng),
        Value::Real(read.min_lat),
        Value::Real(read.max_lat),
        Value::Real(read.min_lng),
        Value::Real(read.max_lng),
    ]
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<ShardRecord> {
    Ok(ShardRecord {
        base_addr: row.get(0)?,
        backup_addr: row.get(1)?,
        write_range: GeoRange::new(row.get(2)?, row.get(3)?, row.get(4)?, row.get(5)?),
        read_range: GeoRange::new(row.get(6)?, row.get(7)?, row.get(8)?, row.get(9)?),
    })
}

fn render_query(query: &ShardQuery, sql: &mut String, values: &mut Vec<Value>) {
    match query {
        ShardQuery::All => sql.push_str("1 = 1"),
        ShardQuery::Addr(addr) => {
            sql.push_str("base_addr = ?");
            values.push(Value::Text(addr.clone()));
        }
        ShardQuery::BackupAddr(addr) => {
            sql.push_str("backup_addr = ?");
            values.push(Value::Text(addr.clone()));
        }
        ShardQuery::Bound {
            range,
            bound,
            cmp,
            value,
        } => {
            sql.push_str(column_name(*range, *bound));
            sql.push_str(match cmp {
                Comparison::Eq => " = ?",
                Comparison::Gt => " > ?",
                Comparison::Lte => " <= ?",
            });
            values.push(Value::Real(*value));
        }
        ShardQuery::And(queries) => render_group(queries, " AND ", "1 = 1", sql, values),
        ShardQuery::Or(queries) => render_group(queries, " OR ", "1 = 0", sql, values),
    }
}

fn render_group(
    queries: &[ShardQuery],
    separator: &str,
    empty: &str,
    sql: &mut String,
    values: &mut Vec<Value>,
) {
    if queries.is_empty() {
        sql.push_str(empty);
        return;
    }

    sql.push('(');
    for (index, query) in queries.iter().enumerate() {
        if index > 0 {
            sql.push_str(separator);
        }
        render_query(query, sql, values);
    }
    sql.push(')');
}

fn column_name(range: RangeKind, bound: Bound) -> &'static str {
    match (range, bound) {
        (RangeKind::Write, Bound::MinLat) => "write_min_lat",
        (RangeKind::Write, Bound::MaxLat) => "write_max_lat",
        (RangeKind::Write, Bound::MinLng) => "write_min_lng",
        (RangeKind::Write, Bound::MaxLng) => "write_max_lng",
        (RangeKind::Read, Bound::MinLat) => "read_min_lat",
        (RangeKind::Read, Bound::MaxLat) => "read_max_lat",
        (RangeKind::Read, Bound::MinLng) => "read_min_lng",
        (RangeKind::Read, Bound::MaxLng) => "read_max_lng",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::GeoPoint;

    fn open(temp_dir: &tempfile::TempDir) -> SqliteDirectory {
        SqliteDirectory::new(temp_dir.path().join("directory.db"), "test").unwrap()
    }

    fn west() -> ShardRecord {
        ShardRecord::new("west:1", "east:1", GeoRange::new(-90.0, 90.0, -180.0, 0.0))
    }

    fn east() -> ShardRecord {
        ShardRecord::new("east:1", "west:1", GeoRange::new(-90.0, 90.0, 0.0, 180.0))
    }

    #[tokio::test]
    async fn test_insert_and_find_round_trip() {
        let temp_dir = tempfile::tempdir().unwrap();
        let directory = open(&temp_dir);

        directory.insert(&west()).await.unwrap();
        directory.insert(&east()).await.unwrap();

        let all = directory.find_all().await.unwrap();
        assert_eq!(all, vec![east(), west()]);
        assert_eq!(directory.find_one("west:1").await.unwrap(), west());
    }

    #[tokio::test]
    async fn test_duplicate_insert_is_conflict() {
        let temp_dir = tempfile::tempdir().unwrap();
        let directory = open(&temp_dir);

        directory.insert(&west()).await.unwrap();
        let result = directory.insert(&west()).await;
        assert!(matches!(result, Err(GeoShardError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_update_and_upsert() {
        let temp_dir = tempfile::tempdir().unwrap();
        let directory = open(&temp_dir);

        let mut record = west();
        assert!(matches!(
            directory.update(&record).await,
            Err(GeoShardError::NotFound(_))
        ));

        directory.upsert(&record).await.unwrap();
        record.backup_addr = "west:1".to_string();
        directory.upsert(&record).await.unwrap();
        record.read_range = GeoRange::WORLD;
        directory.update(&record).await.unwrap();

        assert_eq!(directory.find_one("west:1").await.unwrap(), record);
    }

    #[tokio::test]
    async fn test_remove_returns_deleted_record() {
        let temp_dir = tempfile::tempdir().unwrap();
        let directory = open(&temp_dir);
        directory.insert(&west()).await.unwrap();

        assert_eq!(directory.remove("west:1").await.unwrap(), west());
        assert!(matches!(
            directory.remove("west:1").await,
            Err(GeoShardError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_rendered_queries_match_in_memory_evaluation() {
        let temp_dir = tempfile::tempdir().unwrap();
        let directory = open(&temp_dir);
        directory.replace_all(&[west(), east()]).await.unwrap();

        let queries = [
            ShardQuery::covering(GeoPoint::new(10.0, -20.0), 5_000.0, RangeKind::Read),
            ShardQuery::covering(GeoPoint::new(0.0, -179.9), 50_000.0, RangeKind::Write),
            ShardQuery::touching_edges(&GeoRange::new(-90.0, 90.0, 0.0, 180.0)),
            ShardQuery::BackupAddr("east:1".to_string()),
            ShardQuery::Or(vec![]),
        ];

        for query in &queries {
            let expected: Vec<ShardRecord> = [east(), west()]
                .into_iter()
                .filter(|record| query.matches(record))
                .collect();
            assert_eq!(directory.find_where(query).await.unwrap(), expected, "{:?}", query);
        }
    }

    #[tokio::test]
    async fn test_replace_all_swaps_table() {
        let temp_dir = tempfile::tempdir().unwrap();
        let directory = open(&temp_dir);
        directory.insert(&west()).await.unwrap();

        let world = ShardRecord::new("solo:1", "solo:1", GeoRange::WORLD);
        directory.replace_all(std::slice::from_ref(&world)).await.unwrap();

        assert_eq!(directory.find_all().await.unwrap(), vec![world]);
    }

    #[test]
    fn test_namespace_must_be_identifier() {
        let temp_dir = tempfile::tempdir().unwrap();
        let result = SqliteDirectory::new(temp_dir.path().join("x.db"), "bad;name");
        assert!(matches!(result, Err(GeoShardError::Config(_))));
    }
}
