//! Out-of-band repair of failed index projections
//!
//! The backlog holds (source, timestamp range) entries for batches whose
//! projection exhausted its retries. A repair pass claims entries, rebuilds
//! the documents for each range from the durable store, and re-projects
//! them; after a successful pass the index equals a projection of the
//! archive for that range. Claims give per-entry mutual exclusion so
//! concurrent repairers never duplicate work.

use super::{IndexBackend, IndexProjector};
use crate::store::{DurableStore, StoreError};
use std::sync::Arc;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RepairStats {
    pub repaired: usize,
    pub failed: usize,
}

pub struct Reconciler {
    store: Arc<DurableStore>,
    backend: Arc<dyn IndexBackend>,
    projector: IndexProjector,
    claim_limit: usize,
    /// A claim older than this is treated as abandoned by a crashed repairer
    stale_claim_secs: i64,
}

impl Reconciler {
    pub fn new(
        store: Arc<DurableStore>,
        backend: Arc<dyn IndexBackend>,
        claim_limit: usize,
        stale_claim_secs: i64,
    ) -> Self {
        // The projector is only used for document rebuilding here; repair
        // does a single upsert attempt per pass and re-queues on failure.
        let projector = IndexProjector::new(store.clone(), backend.clone(), 0, 1);
        Self {
            store,
            backend,
            projector,
            claim_limit,
            stale_claim_secs,
        }
    }

    /// Run one repair pass over the claimable backlog.
    pub async fn run_repair_pass(&self) -> Result<RepairStats, StoreError> {
        let entries = self
            .store
            .claim_backlog(self.claim_limit, self.stale_claim_secs)?;
        if entries.is_empty() {
            return Ok(RepairStats::default());
        }

        log::info!("🔧 Repair pass over {} backlog entries", entries.len());
        let mut stats = RepairStats::default();

        for entry in entries {
            let documents = match self.projector.build_documents(
                &entry.source_id,
                entry.from_ts,
                entry.to_ts,
                None,
            ) {
                Ok(docs) => docs,
                Err(e) => {
                    log::error!("❌ Repair read failed for backlog #{}: {}", entry.id, e);
                    self.store.release_backlog(entry.id)?;
                    stats.failed += 1;
                    continue;
                }
            };

            if documents.is_empty() {
                // Nothing durable in the range (e.g. all dead-lettered);
                // the entry is vacuously repaired
                self.store.resolve_backlog(entry.id)?;
                stats.repaired += 1;
                continue;
            }

            match self.backend.bulk_upsert(&documents).await {
                Ok(()) => {
                    self.store.resolve_backlog(entry.id)?;
                    stats.repaired += 1;
                    log::info!(
                        "✅ Repaired backlog #{} ('{}' [{}..{}], {} documents)",
                        entry.id,
                        entry.source_id,
                        entry.from_ts,
                        entry.to_ts,
                        documents.len()
                    );
                }
                Err(e) => {
                    log::warn!(
                        "⚠️ Repair of backlog #{} failed (attempt {}): {}",
                        entry.id,
                        entry.attempts + 1,
                        e
                    );
                    self.store.release_backlog(entry.id)?;
                    stats.failed += 1;
                }
            }
        }

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::Batch;
    use crate::index::{IndexDocument, MemoryIndexBackend};
    use crate::record::Record;
    use crate::source::Watermark;
    use tempfile::tempdir;

    fn record(metric_key: &str, key: &str, timestamp: i64, value: f64) -> Record {
        Record {
            source_id: "downloads".to_string(),
            metric_key: metric_key.to_string(),
            timestamp,
            value,
            idempotency_key: key.to_string(),
            ingest_version: 1,
        }
    }

    fn setup() -> (tempfile::TempDir, Arc<DurableStore>) {
        let dir = tempdir().unwrap();
        let store = Arc::new(DurableStore::new(dir.path().join("archive.db")).unwrap());
        (dir, store)
    }

    #[tokio::test]
    async fn test_repair_rebuilds_index_from_archive() {
        let (_dir, store) = setup();
        store
            .commit(&Batch {
                source_id: "downloads".to_string(),
                records: vec![
                    record("app.a1.downloads", "k1", 1700000000, 3.0),
                    record("app.a1.downloads", "k2", 1700001000, 5.0),
                ],
                next_watermark: Watermark(2),
            })
            .unwrap();
        // The projection that should have happened never reached the index
        store.push_backlog("downloads", 1700000000, 1700001000).unwrap();

        let backend = Arc::new(MemoryIndexBackend::new());
        let reconciler = Reconciler::new(store.clone(), backend.clone(), 10, 600);

        let stats = reconciler.run_repair_pass().await.unwrap();
        assert_eq!(stats, RepairStats { repaired: 1, failed: 0 });
        assert_eq!(store.backlog_depth().unwrap(), 0);

        let doc = backend
            .document(&IndexDocument::doc_id_for("app.a1.downloads", 1699920000))
            .unwrap();
        assert_eq!(doc.value, 8.0);
    }

    #[tokio::test]
    async fn test_empty_range_resolves_vacuously() {
        let (_dir, store) = setup();
        store.push_backlog("downloads", 100, 200).unwrap();

        let backend = Arc::new(MemoryIndexBackend::new());
        let reconciler = Reconciler::new(store.clone(), backend.clone(), 10, 600);

        let stats = reconciler.run_repair_pass().await.unwrap();
        assert_eq!(stats.repaired, 1);
        assert_eq!(store.backlog_depth().unwrap(), 0);
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn test_idle_pass_is_noop() {
        let (_dir, store) = setup();
        let backend = Arc::new(MemoryIndexBackend::new());
        let reconciler = Reconciler::new(store, backend, 10, 600);
        let stats = reconciler.run_repair_pass().await.unwrap();
        assert_eq!(stats, RepairStats::default());
    }
}
