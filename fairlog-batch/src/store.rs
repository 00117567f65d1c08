use fairlog_core::config::MAX_UNBATCHED_WINDOW;
use fairlog_core::digest::Digest;
use fairlog_core::error::{FairlogError, Result};
use fairlog_core::record::{Batch, NewQuery, QueryRecord};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Transaction, params};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// Query log and batch table. Every write that touches both is one transaction.
pub trait QueryStore: Send + Sync {
    /// Number the query `max(seq) + 1` for its model and persist it.
    fn append(&self, query: NewQuery) -> Result<QueryRecord>;

    /// Oldest unassigned records of a model in seq order, at most `limit`
    /// (clamped to [`MAX_UNBATCHED_WINDOW`]).
    fn unbatched(&self, model_id: u32, limit: usize) -> Result<Vec<QueryRecord>>;

    fn unbatched_count(&self, model_id: u32) -> Result<u64>;

    fn oldest_unbatched_timestamp(&self, model_id: u32) -> Result<Option<u64>>;

    /// Highest `end_seq` over the model's batches, 0 when there are none.
    fn last_batched_seq(&self, model_id: u32) -> Result<u64>;

    /// Mark every listed seq as owned by an existing batch. All or nothing.
    fn assign_batch(&self, model_id: u32, seq_nums: &[u64], batch_id: &str) -> Result<()>;

    /// Persist `batch` and assign `seq_nums` to it in one transaction.
    fn insert_batch_with_assignment(&self, batch: &Batch, seq_nums: &[u64]) -> Result<()>;

    fn record(&self, model_id: u32, seq_num: u64) -> Result<Option<QueryRecord>>;

    fn records_in_range(&self, model_id: u32, start: u64, end: u64) -> Result<Vec<QueryRecord>>;

    fn batch(&self, id: &str) -> Result<Option<Batch>>;

    fn batch_for_seq(&self, model_id: u32, seq_num: u64) -> Result<Option<Batch>>;

    fn batches(&self) -> Result<Vec<Batch>>;

    fn uncommitted_batches(&self) -> Result<Vec<Batch>>;

    fn mark_committed(&self, id: &str, tx_hash: &str, committed_at: u64) -> Result<()>;

    fn models_with_backlog(&self) -> Result<Vec<u32>>;
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS batches (
    id           TEXT PRIMARY KEY,
    model_id     INTEGER NOT NULL,
    start_seq    INTEGER NOT NULL,
    end_seq      INTEGER NOT NULL,
    merkle_root  TEXT NOT NULL,
    record_count INTEGER NOT NULL,
    tx_hash      TEXT,
    created_at   INTEGER NOT NULL,
    committed_at INTEGER
);
CREATE INDEX IF NOT EXISTS idx_batches_model_range ON batches(model_id, start_seq, end_seq);

CREATE TABLE IF NOT EXISTS query_logs (
    model_id       INTEGER NOT NULL,
    seq_num        INTEGER NOT NULL,
    query_id       TEXT NOT NULL UNIQUE,
    features       BLOB NOT NULL,
    sensitive_attr INTEGER NOT NULL,
    prediction     REAL NOT NULL,
    timestamp      INTEGER NOT NULL,
    batch_id       TEXT REFERENCES batches(id),
    PRIMARY KEY (model_id, seq_num)
);
CREATE INDEX IF NOT EXISTS idx_query_logs_unbatched ON query_logs(model_id, batch_id, seq_num);
";

const RECORD_COLUMNS: &str = "seq_num, model_id, features, sensitive_attr, prediction, timestamp";
const BATCH_COLUMNS: &str =
    "id, model_id, start_seq, end_seq, merkle_root, record_count, tx_hash, created_at, committed_at";

trait StorageExt<T> {
    fn storage(self) -> Result<T>;
}

impl<T> StorageExt<T> for rusqlite::Result<T> {
    fn storage(self) -> Result<T> {
        self.map_err(|e| FairlogError::Storage(e.to_string()))
    }
}

/// SQLite-backed [`QueryStore`]. One connection behind a mutex is the
/// single-writer section for the per-model sequence counter.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).storage()?;
        conn.pragma_update(None, "journal_mode", "WAL").storage()?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory().storage()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON").storage()?;
        conn.execute_batch(SCHEMA).storage()?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| FairlogError::Storage("connection mutex poisoned".into()))
    }

    #[cfg(test)]
    pub(crate) fn execute_raw(&self, sql: &str) -> Result<usize> {
        self.conn()?.execute(sql, []).storage()
    }
}

fn features_to_blob(features: &[f32]) -> Vec<u8> {
    features.iter().flat_map(|f| f.to_bits().to_be_bytes()).collect()
}

fn blob_to_features(blob: &[u8]) -> Option<Vec<f32>> {
    if blob.len() % 4 != 0 {
        return None;
    }
    Some(
        blob.chunks_exact(4)
            .map(|c| f32::from_bits(u32::from_be_bytes([c[0], c[1], c[2], c[3]])))
            .collect(),
    )
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<QueryRecord> {
    let blob: Vec<u8> = row.get(2)?;
    let features = blob_to_features(&blob).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            Type::Blob,
            Box::new(FairlogError::Malformed(format!(
                "features blob of {} bytes",
                blob.len()
            ))),
        )
    })?;
    Ok(QueryRecord {
        seq_num: row.get::<_, i64>(0)? as u64,
        model_id: row.get(1)?,
        features,
        sensitive_attr: row.get(3)?,
        prediction: row.get::<_, f64>(4)? as f32,
        timestamp: row.get::<_, i64>(5)? as u64,
    })
}

fn row_to_batch(row: &rusqlite::Row<'_>) -> rusqlite::Result<Batch> {
    let root: String = row.get(4)?;
    let merkle_root = Digest::from_hex(&root)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(4, Type::Text, Box::new(e)))?;
    Ok(Batch {
        id: row.get(0)?,
        model_id: row.get(1)?,
        start_seq: row.get::<_, i64>(2)? as u64,
        end_seq: row.get::<_, i64>(3)? as u64,
        merkle_root,
        record_count: row.get::<_, i64>(5)? as u64,
        tx_hash: row.get(6)?,
        created_at: row.get::<_, i64>(7)? as u64,
        committed_at: row.get::<_, Option<i64>>(8)?.map(|t| t as u64),
    })
}

/// Claim each seq for `batch_id`; any seq that is missing or already owned
/// aborts with nothing written by the caller's transaction.
fn assign_in(tx: &Transaction<'_>, model_id: u32, seq_nums: &[u64], batch_id: &str) -> Result<()> {
    let mut stmt = tx
        .prepare_cached(
            "UPDATE query_logs SET batch_id = ?1
             WHERE model_id = ?2 AND seq_num = ?3 AND batch_id IS NULL",
        )
        .storage()?;
    for &seq in seq_nums {
        let changed = stmt
            .execute(params![batch_id, model_id, seq as i64])
            .storage()?;
        if changed != 1 {
            return Err(FairlogError::Storage(format!(
                "seq {seq} of model {model_id} is missing or already batched"
            )));
        }
    }
    Ok(())
}

impl QueryStore for SqliteStore {
    fn append(&self, q: NewQuery) -> Result<QueryRecord> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().storage()?;
        let next: i64 = tx
            .query_row(
                "SELECT COALESCE(MAX(seq_num), 0) + 1 FROM query_logs WHERE model_id = ?1",
                params![q.model_id],
                |r| r.get(0),
            )
            .storage()?;
        tx.execute(
            "INSERT INTO query_logs (model_id, seq_num, query_id, features, sensitive_attr, prediction, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                q.model_id,
                next,
                q.query_id,
                features_to_blob(&q.features),
                q.sensitive_attr,
                f64::from(q.prediction),
                q.timestamp as i64,
            ],
        )
        .storage()?;
        tx.commit().storage()?;
        Ok(q.into_record(next as u64))
    }

    fn unbatched(&self, model_id: u32, limit: usize) -> Result<Vec<QueryRecord>> {
        let limit = limit.min(MAX_UNBATCHED_WINDOW) as i64;
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare_cached(&format!(
                "SELECT {RECORD_COLUMNS} FROM query_logs
                 WHERE model_id = ?1 AND batch_id IS NULL
                 ORDER BY seq_num ASC LIMIT ?2"
            ))
            .storage()?;
        let rows = stmt
            .query_map(params![model_id, limit], row_to_record)
            .storage()?;
        rows.collect::<rusqlite::Result<Vec<_>>>().storage()
    }

    fn unbatched_count(&self, model_id: u32) -> Result<u64> {
        let conn = self.conn()?;
        let n: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM query_logs WHERE model_id = ?1 AND batch_id IS NULL",
                params![model_id],
                |r| r.get(0),
            )
            .storage()?;
        Ok(n as u64)
    }

    fn oldest_unbatched_timestamp(&self, model_id: u32) -> Result<Option<u64>> {
        let conn = self.conn()?;
        let ts: Option<i64> = conn
            .query_row(
                "SELECT MIN(timestamp) FROM query_logs WHERE model_id = ?1 AND batch_id IS NULL",
                params![model_id],
                |r| r.get(0),
            )
            .storage()?;
        Ok(ts.map(|t| t as u64))
    }

    fn last_batched_seq(&self, model_id: u32) -> Result<u64> {
        let conn = self.conn()?;
        let end: i64 = conn
            .query_row(
                "SELECT COALESCE(MAX(end_seq), 0) FROM batches WHERE model_id = ?1",
                params![model_id],
                |r| r.get(0),
            )
            .storage()?;
        Ok(end as u64)
    }

    fn assign_batch(&self, model_id: u32, seq_nums: &[u64], batch_id: &str) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().storage()?;
        assign_in(&tx, model_id, seq_nums, batch_id)?;
        tx.commit().storage()
    }

    fn insert_batch_with_assignment(&self, batch: &Batch, seq_nums: &[u64]) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().storage()?;

        let exists: Option<String> = tx
            .query_row("SELECT id FROM batches WHERE id = ?1", params![batch.id], |r| {
                r.get(0)
            })
            .optional()
            .storage()?;
        if exists.is_some() {
            return Err(FairlogError::BatchAlreadyExists(batch.id.clone()));
        }

        tx.execute(
            &format!("INSERT INTO batches ({BATCH_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"),
            params![
                batch.id,
                batch.model_id,
                batch.start_seq as i64,
                batch.end_seq as i64,
                batch.merkle_root.to_hex(),
                batch.record_count as i64,
                batch.tx_hash,
                batch.created_at as i64,
                batch.committed_at.map(|t| t as i64),
            ],
        )
        .storage()?;
        assign_in(&tx, batch.model_id, seq_nums, &batch.id)?;
        tx.commit().storage()
    }

    fn record(&self, model_id: u32, seq_num: u64) -> Result<Option<QueryRecord>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {RECORD_COLUMNS} FROM query_logs WHERE model_id = ?1 AND seq_num = ?2"),
            params![model_id, seq_num as i64],
            row_to_record,
        )
        .optional()
        .storage()
    }

    fn records_in_range(&self, model_id: u32, start: u64, end: u64) -> Result<Vec<QueryRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare_cached(&format!(
                "SELECT {RECORD_COLUMNS} FROM query_logs
                 WHERE model_id = ?1 AND seq_num BETWEEN ?2 AND ?3
                 ORDER BY seq_num ASC"
            ))
            .storage()?;
        let rows = stmt
            .query_map(params![model_id, start as i64, end as i64], row_to_record)
            .storage()?;
        rows.collect::<rusqlite::Result<Vec<_>>>().storage()
    }

    fn batch(&self, id: &str) -> Result<Option<Batch>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {BATCH_COLUMNS} FROM batches WHERE id = ?1"),
            params![id],
            row_to_batch,
        )
        .optional()
        .storage()
    }

    fn batch_for_seq(&self, model_id: u32, seq_num: u64) -> Result<Option<Batch>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!(
                "SELECT {BATCH_COLUMNS} FROM batches
                 WHERE model_id = ?1 AND start_seq <= ?2 AND end_seq >= ?2 LIMIT 1"
            ),
            params![model_id, seq_num as i64],
            row_to_batch,
        )
        .optional()
        .storage()
    }

    fn batches(&self) -> Result<Vec<Batch>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare_cached(&format!(
                "SELECT {BATCH_COLUMNS} FROM batches ORDER BY model_id, start_seq"
            ))
            .storage()?;
        let rows = stmt.query_map([], row_to_batch).storage()?;
        rows.collect::<rusqlite::Result<Vec<_>>>().storage()
    }

    fn uncommitted_batches(&self) -> Result<Vec<Batch>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare_cached(&format!(
                "SELECT {BATCH_COLUMNS} FROM batches WHERE committed_at IS NULL
                 ORDER BY model_id, start_seq"
            ))
            .storage()?;
        let rows = stmt.query_map([], row_to_batch).storage()?;
        rows.collect::<rusqlite::Result<Vec<_>>>().storage()
    }

    fn mark_committed(&self, id: &str, tx_hash: &str, committed_at: u64) -> Result<()> {
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "UPDATE batches SET tx_hash = ?1, committed_at = ?2 WHERE id = ?3",
                params![tx_hash, committed_at as i64, id],
            )
            .storage()?;
        if changed == 0 {
            return Err(FairlogError::Storage(format!("no batch '{id}'")));
        }
        Ok(())
    }

    fn models_with_backlog(&self) -> Result<Vec<u32>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare_cached(
                "SELECT DISTINCT model_id FROM query_logs WHERE batch_id IS NULL ORDER BY model_id",
            )
            .storage()?;
        let rows = stmt.query_map([], |r| r.get::<_, u32>(0)).storage()?;
        rows.collect::<rusqlite::Result<Vec<_>>>().storage()
    }
}
