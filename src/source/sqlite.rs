//! SQLite collector for upstream payment transactions
//!
//! The payments system exposes a transactions database; the watermark is the
//! rowid of the last committed transaction. Rows are re-serialized to JSON so
//! the normalizer sees the same payload shape regardless of transport.

use super::{CorruptPayload, FetchError, FetchPage, RawPayload, SourceCollector, Watermark};
use crate::sqlite_pragma::apply_optimized_pragmas;
use async_trait::async_trait;
use rusqlite::Connection;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Mutex;

pub struct SqliteCollector {
    source_id: String,
    conn: Mutex<Connection>,
}

impl SqliteCollector {
    pub fn new(source_id: impl Into<String>, db_path: impl Into<PathBuf>) -> Result<Self, FetchError> {
        let path = db_path.into();
        let conn = Connection::open(&path)
            .map_err(|e| FetchError::SourceUnavailable(format!("{}: {}", path.display(), e)))?;
        apply_optimized_pragmas(&conn)
            .map_err(|e| FetchError::SourceUnavailable(e.to_string()))?;
        // Reads only; never take a write lock on the upstream database
        conn.execute("PRAGMA query_only = ON", [])
            .map_err(|e| FetchError::SourceUnavailable(e.to_string()))?;

        log::info!("📥 Payments collector attached to {}", path.display());

        Ok(Self {
            source_id: source_id.into(),
            conn: Mutex::new(conn),
        })
    }
}

#[async_trait]
impl SourceCollector for SqliteCollector {
    async fn fetch(&self, since: Watermark, limit: usize) -> Result<FetchPage, FetchError> {
        let conn = self.conn.lock().unwrap();

        let mut stmt = conn
            .prepare(
                "SELECT id, txn_id, app_uuid, amount, currency, revision, created_at
                 FROM transactions
                 WHERE id > ?1
                 ORDER BY id ASC
                 LIMIT ?2",
            )
            .map_err(|e| FetchError::SourceUnavailable(e.to_string()))?;

        let rows = stmt
            .query_map(rusqlite::params![since.position(), limit as i64], |row| {
                let id: i64 = row.get(0)?;
                let txn_id: Option<String> = row.get(1)?;
                let app_uuid: Option<String> = row.get(2)?;
                let amount: Option<f64> = row.get(3)?;
                let currency: Option<String> = row.get(4)?;
                let revision: Option<i64> = row.get(5)?;
                let created_at: Option<i64> = row.get(6)?;
                Ok((id, txn_id, app_uuid, amount, currency, revision, created_at))
            })
            .map_err(|e| FetchError::SourceUnavailable(e.to_string()))?;

        let mut page = FetchPage::empty(since);
        let mut max_id = since.position();

        for row in rows {
            let (id, txn_id, app_uuid, amount, currency, revision, created_at) =
                row.map_err(|e| FetchError::SourceUnavailable(e.to_string()))?;
            max_id = max_id.max(id);

            // NULL identity columns make the row unusable; set it aside
            let (txn_id, app_uuid) = match (txn_id, app_uuid) {
                (Some(t), Some(a)) => (t, a),
                _ => {
                    page.corrupt.push(CorruptPayload {
                        source_id: self.source_id.clone(),
                        position: id,
                        body: format!("transactions rowid {}", id),
                        reason: "NULL txn_id or app_uuid".to_string(),
                    });
                    continue;
                }
            };

            let body = json!({
                "txn_id": txn_id,
                "app_uuid": app_uuid,
                "amount": amount,
                "currency": currency,
                "revision": revision.unwrap_or(1),
                "created_at": created_at,
            })
            .to_string();

            page.payloads.push(RawPayload {
                source_id: self.source_id.clone(),
                position: id,
                body,
            });
        }

        page.next_watermark = Watermark(max_id);
        page.has_more = page.payloads.len() + page.corrupt.len() >= limit;
        Ok(page)
    }

    fn collector_type(&self) -> &'static str {
        "sqlite"
    }
}
