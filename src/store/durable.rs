//! SQLite archive: records, watermarks, and the reconciliation backlog
//!
//! One database file holds three tables:
//! - `records` — append-once-by-key archive of every committed Record
//! - `watermarks` — per-source cursor, one row per source_id
//! - `index_backlog` — batches whose index projection exhausted its retries
//!
//! A batch commit is a single transaction covering the record upserts and
//! the watermark advance, so either the whole batch becomes durable and the
//! watermark moves, or neither happens.

use super::StoreError;
use crate::aggregate::Batch;
use crate::record::Record;
use crate::source::Watermark;
use crate::sqlite_pragma::apply_optimized_pragmas;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

/// Outcome of one batch commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitSummary {
    /// Records inserted or overwritten by a higher ingest_version
    pub written: usize,
    /// Replays of already-committed records (no-ops)
    pub deduplicated: usize,
}

/// One failed index projection awaiting repair.
#[derive(Debug, Clone)]
pub struct BacklogEntry {
    pub id: i64,
    pub source_id: String,
    pub from_ts: i64,
    pub to_ts: i64,
    pub attempts: i64,
}

pub struct DurableStore {
    conn: Mutex<Connection>,
}

impl DurableStore {
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::StorageUnavailable(format!(
                        "create {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let conn = Connection::open(db_path)?;
        apply_optimized_pragmas(&conn)?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS records (
                idempotency_key TEXT PRIMARY KEY,
                source_id TEXT NOT NULL,
                metric_key TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                value REAL NOT NULL,
                ingest_version INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_records_source_ts
                ON records(source_id, timestamp);
            CREATE INDEX IF NOT EXISTS idx_records_metric_ts
                ON records(metric_key, timestamp);
            CREATE TABLE IF NOT EXISTS watermarks (
                source_id TEXT PRIMARY KEY,
                position INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS index_backlog (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                source_id TEXT NOT NULL,
                from_ts INTEGER NOT NULL,
                to_ts INTEGER NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                claimed_at INTEGER,
                created_at INTEGER NOT NULL
            );",
        )?;

        log::info!("✅ Durable store initialized (WAL mode)");

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Commit a sealed Batch atomically.
    ///
    /// Each record is a version-gated upsert: a replay of an identical
    /// record is a no-op, a higher ingest_version overwrites value and
    /// version. The source's watermark advances in the same transaction.
    pub fn commit(&self, batch: &Batch) -> Result<CommitSummary, StoreError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let mut written = 0usize;
        let mut deduplicated = 0usize;

        for record in &batch.records {
            let affected = tx.execute(
                "INSERT INTO records
                     (idempotency_key, source_id, metric_key, timestamp, value, ingest_version)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(idempotency_key) DO UPDATE SET
                     value = excluded.value,
                     ingest_version = excluded.ingest_version
                 WHERE excluded.ingest_version > records.ingest_version",
                params![
                    record.idempotency_key,
                    record.source_id,
                    record.metric_key,
                    record.timestamp,
                    record.value,
                    record.ingest_version,
                ],
            )?;
            if affected > 0 {
                written += 1;
            } else {
                deduplicated += 1;
            }
        }

        tx.execute(
            "INSERT INTO watermarks (source_id, position, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(source_id) DO UPDATE SET
                 position = excluded.position,
                 updated_at = excluded.updated_at",
            params![
                batch.source_id,
                batch.next_watermark.position(),
                chrono::Utc::now().timestamp(),
            ],
        )?;

        tx.commit()?;

        log::debug!(
            "✅ Committed batch for '{}': {} written, {} deduplicated, watermark → {}",
            batch.source_id,
            written,
            deduplicated,
            batch.next_watermark.position()
        );

        Ok(CommitSummary {
            written,
            deduplicated,
        })
    }

    /// Last durably committed position for a source, if any.
    pub fn watermark(&self, source_id: &str) -> Result<Option<Watermark>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let position = conn
            .query_row(
                "SELECT position FROM watermarks WHERE source_id = ?1",
                params![source_id],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        Ok(position.map(Watermark))
    }

    /// Reset a source's cursor to an earlier position (manual backfill).
    ///
    /// Reprocessing the overlapping range is safe: replays deduplicate on
    /// idempotency_key.
    pub fn reset_watermark(&self, source_id: &str, position: i64) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO watermarks (source_id, position, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(source_id) DO UPDATE SET
                 position = excluded.position,
                 updated_at = excluded.updated_at",
            params![source_id, position, chrono::Utc::now().timestamp()],
        )?;
        log::info!("🔄 Watermark for '{}' reset to {}", source_id, position);
        Ok(())
    }

    pub fn record(&self, idempotency_key: &str) -> Result<Option<Record>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let record = conn
            .query_row(
                "SELECT idempotency_key, source_id, metric_key, timestamp, value, ingest_version
                 FROM records WHERE idempotency_key = ?1",
                params![idempotency_key],
                row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    /// Records of one source in an inclusive event-time range, ordered by
    /// (timestamp, idempotency_key). Used by reconciliation repair passes.
    pub fn records_in_range(
        &self,
        source_id: &str,
        from_ts: i64,
        to_ts: i64,
    ) -> Result<Vec<Record>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT idempotency_key, source_id, metric_key, timestamp, value, ingest_version
             FROM records
             WHERE source_id = ?1 AND timestamp BETWEEN ?2 AND ?3
             ORDER BY timestamp ASC, idempotency_key ASC",
        )?;
        let rows = stmt.query_map(params![source_id, from_ts, to_ts], row_to_record)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    pub fn record_count(&self) -> Result<i64, StoreError> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.query_row("SELECT COUNT(*) FROM records", [], |row| row.get(0))?)
    }

    // --- reconciliation backlog ---

    /// Enqueue a failed projection for out-of-band repair.
    pub fn push_backlog(
        &self,
        source_id: &str,
        from_ts: i64,
        to_ts: i64,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO index_backlog (source_id, from_ts, to_ts, attempts, created_at)
             VALUES (?1, ?2, ?3, 0, ?4)",
            params![source_id, from_ts, to_ts, chrono::Utc::now().timestamp()],
        )?;
        Ok(())
    }

    /// Claim up to `limit` unclaimed backlog entries for one repair pass.
    ///
    /// The `claimed_at` guard gives mutual exclusion per entry, so two
    /// concurrent repairers never duplicate work. Claims older than
    /// `stale_claim_secs` are considered abandoned and re-claimable.
    pub fn claim_backlog(
        &self,
        limit: usize,
        stale_claim_secs: i64,
    ) -> Result<Vec<BacklogEntry>, StoreError> {
        let mut conn = self.conn.lock().unwrap();
        let now = chrono::Utc::now().timestamp();
        let tx = conn.transaction()?;

        let entries = {
            let mut stmt = tx.prepare(
                "SELECT id, source_id, from_ts, to_ts, attempts
                 FROM index_backlog
                 WHERE claimed_at IS NULL OR claimed_at < ?1
                 ORDER BY id ASC
                 LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![now - stale_claim_secs, limit as i64], |row| {
                Ok(BacklogEntry {
                    id: row.get(0)?,
                    source_id: row.get(1)?,
                    from_ts: row.get(2)?,
                    to_ts: row.get(3)?,
                    attempts: row.get(4)?,
                })
            })?;
            let mut entries = Vec::new();
            for row in rows {
                entries.push(row?);
            }
            entries
        };

        for entry in &entries {
            tx.execute(
                "UPDATE index_backlog SET claimed_at = ?1 WHERE id = ?2",
                params![now, entry.id],
            )?;
        }
        tx.commit()?;
        Ok(entries)
    }

    /// Drop a repaired entry.
    pub fn resolve_backlog(&self, id: i64) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM index_backlog WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// Unclaim a failed repair, bumping its attempt count.
    pub fn release_backlog(&self, id: i64) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE index_backlog SET claimed_at = NULL, attempts = attempts + 1 WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    pub fn backlog_depth(&self) -> Result<i64, StoreError> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.query_row("SELECT COUNT(*) FROM index_backlog", [], |row| row.get(0))?)
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<Record> {
    Ok(Record {
        idempotency_key: row.get(0)?,
        source_id: row.get(1)?,
        metric_key: row.get(2)?,
        timestamp: row.get(3)?,
        value: row.get(4)?,
        ingest_version: row.get(5)?,
    })
}
