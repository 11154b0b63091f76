//! Query-index projection
//!
//! The index is a derived, rebuildable view of the durable store: documents
//! keyed by (metric_key, day bucket) so the web service can range-query
//! dashboards without touching raw sources. Projection is best-effort and
//! runs after the durable commit; a projection failure degrades to the
//! reconciliation backlog and never blocks the durable path.

pub mod http;
pub mod reconcile;

pub use http::HttpIndexBackend;
pub use reconcile::Reconciler;

use crate::aggregate::Batch;
use crate::pipeline::backoff::ExponentialBackoff;
use crate::store::{DurableStore, StoreError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

/// One index document: the rollup of a metric over a day bucket.
///
/// `ingest_version` is the sum of the constituent records' versions, which
/// is strictly monotonic in the document's content (a new record or a
/// revised one always raises it), so last-write-wins by version can never
/// regress a document to stale data.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndexDocument {
    pub doc_id: String,
    pub source_id: String,
    pub metric_key: String,
    pub bucket_start: i64,
    pub value: f64,
    pub ingest_version: i64,
}

impl IndexDocument {
    pub fn doc_id_for(metric_key: &str, bucket_start: i64) -> String {
        format!("{}@{}", metric_key, bucket_start)
    }
}

#[derive(Debug)]
pub enum IndexError {
    /// Transient index failure; bounded retries then the backlog
    IndexUnavailable(String),
    /// The index rejected the request shape; a bug, not retryable
    MalformedRequest(String),
}

impl std::fmt::Display for IndexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IndexError::IndexUnavailable(msg) => write!(f, "index unavailable: {}", msg),
            IndexError::MalformedRequest(msg) => write!(f, "malformed index request: {}", msg),
        }
    }
}

impl std::error::Error for IndexError {}

/// Bulk-upsert boundary to the document store.
#[async_trait]
pub trait IndexBackend: Send + Sync {
    /// Upsert every document, last-write-wins by ingest_version per doc_id.
    async fn bulk_upsert(&self, documents: &[IndexDocument]) -> Result<(), IndexError>;

    /// Backend type for logging
    fn backend_type(&self) -> &'static str;
}

/// In-process index backend.
///
/// Used when no index URL is configured (archive-only deployments) and by
/// tests; applies the same upsert-by-version rule the HTTP index does.
#[derive(Default)]
pub struct MemoryIndexBackend {
    documents: Mutex<std::collections::HashMap<String, IndexDocument>>,
}

impl MemoryIndexBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn document(&self, doc_id: &str) -> Option<IndexDocument> {
        self.documents.lock().unwrap().get(doc_id).cloned()
    }

    pub fn documents(&self) -> Vec<IndexDocument> {
        let mut docs: Vec<_> = self.documents.lock().unwrap().values().cloned().collect();
        docs.sort_by(|a, b| a.doc_id.cmp(&b.doc_id));
        docs
    }

    pub fn len(&self) -> usize {
        self.documents.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.lock().unwrap().is_empty()
    }
}

#[async_trait]
impl IndexBackend for MemoryIndexBackend {
    async fn bulk_upsert(&self, documents: &[IndexDocument]) -> Result<(), IndexError> {
        let mut store = self.documents.lock().unwrap();
        for doc in documents {
            match store.get(&doc.doc_id) {
                Some(existing) if existing.ingest_version >= doc.ingest_version => {}
                _ => {
                    store.insert(doc.doc_id.clone(), doc.clone());
                }
            }
        }
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}

/// Outcome of projecting one batch.
#[derive(Debug, PartialEq, Eq)]
pub enum ProjectionResult {
    /// Documents upserted
    Projected { documents: usize },
    /// Retries exhausted; the range went to the reconciliation backlog
    Deferred,
    /// Nothing to project
    Skipped,
}

/// Projects committed batches into the index.
///
/// Documents are rebuilt from the durable store, not from the batch's
/// records alone, so a bucket that spans several batches always projects to
/// the full rollup. Retries are bounded; exhaustion defers the batch's
/// timestamp range to the backlog for the out-of-band repair pass.
pub struct IndexProjector {
    store: Arc<DurableStore>,
    backend: Arc<dyn IndexBackend>,
    max_retry_passes: u32,
    retry_initial_ms: u64,
}

impl IndexProjector {
    pub fn new(
        store: Arc<DurableStore>,
        backend: Arc<dyn IndexBackend>,
        max_retry_passes: u32,
        retry_initial_ms: u64,
    ) -> Self {
        Self {
            store,
            backend,
            max_retry_passes,
            retry_initial_ms,
        }
    }

    /// Rebuild the documents for every (metric_key, bucket) a record set
    /// touches, folding over the durable store for that range.
    pub fn build_documents(
        &self,
        source_id: &str,
        from_ts: i64,
        to_ts: i64,
        affected: Option<&BTreeSet<(String, i64)>>,
    ) -> Result<Vec<IndexDocument>, StoreError> {
        // Widen to whole buckets so the fold sees every contributing record
        let from_bucket = from_ts - from_ts.rem_euclid(86_400);
        let to_bucket_end = to_ts - to_ts.rem_euclid(86_400) + 86_399;
        let records = self
            .store
            .records_in_range(source_id, from_bucket, to_bucket_end)?;

        let mut folded: std::collections::BTreeMap<(String, i64), IndexDocument> =
            std::collections::BTreeMap::new();
        for record in records {
            let bucket = record.bucket_start();
            let key = (record.metric_key.clone(), bucket);
            if let Some(affected) = affected {
                if !affected.contains(&key) {
                    continue;
                }
            }
            let doc = folded.entry(key).or_insert_with(|| IndexDocument {
                doc_id: IndexDocument::doc_id_for(&record.metric_key, bucket),
                source_id: source_id.to_string(),
                metric_key: record.metric_key.clone(),
                bucket_start: bucket,
                value: 0.0,
                ingest_version: 0,
            });
            doc.value += record.value;
            doc.ingest_version += record.ingest_version;
        }
        Ok(folded.into_values().collect())
    }

    /// Project one committed batch, best-effort.
    pub async fn project(&self, batch: &Batch) -> ProjectionResult {
        let Some((from_ts, to_ts)) = batch.timestamp_range() else {
            return ProjectionResult::Skipped;
        };

        let affected: BTreeSet<(String, i64)> = batch
            .records
            .iter()
            .map(|r| (r.metric_key.clone(), r.bucket_start()))
            .collect();

        let documents =
            match self.build_documents(&batch.source_id, from_ts, to_ts, Some(&affected)) {
                Ok(docs) => docs,
                Err(e) => {
                    // Can't even read the archive; defer rather than drop
                    log::error!("❌ Projection read failed for '{}': {}", batch.source_id, e);
                    self.defer(batch, from_ts, to_ts);
                    return ProjectionResult::Deferred;
                }
            };

        if documents.is_empty() {
            return ProjectionResult::Skipped;
        }

        let mut backoff =
            ExponentialBackoff::new(self.retry_initial_ms, self.retry_initial_ms * 16, self.max_retry_passes);
        loop {
            match self.backend.bulk_upsert(&documents).await {
                Ok(()) => {
                    log::debug!(
                        "✅ Projected {} documents for '{}' ({})",
                        documents.len(),
                        batch.source_id,
                        self.backend.backend_type()
                    );
                    return ProjectionResult::Projected {
                        documents: documents.len(),
                    };
                }
                Err(IndexError::MalformedRequest(msg)) => {
                    log::error!("❌ Index rejected projection for '{}': {}", batch.source_id, msg);
                    self.defer(batch, from_ts, to_ts);
                    return ProjectionResult::Deferred;
                }
                Err(IndexError::IndexUnavailable(msg)) => {
                    log::warn!("⚠️ Index unavailable for '{}': {}", batch.source_id, msg);
                    if backoff.sleep().await.is_err() {
                        self.defer(batch, from_ts, to_ts);
                        return ProjectionResult::Deferred;
                    }
                }
            }
        }
    }

    fn defer(&self, batch: &Batch, from_ts: i64, to_ts: i64) {
        match self.store.push_backlog(&batch.source_id, from_ts, to_ts) {
            Ok(()) => log::warn!(
                "📮 Deferred projection for '{}' [{}..{}] to reconciliation backlog",
                batch.source_id,
                from_ts,
                to_ts
            ),
            // The range stays recoverable: a manual repair over the source's
            // full history rebuilds it from the archive.
            Err(e) => log::error!(
                "❌ Failed to enqueue backlog for '{}': {}",
                batch.source_id,
                e
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Record;
    use crate::source::Watermark;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::tempdir;

    fn record(metric_key: &str, key: &str, timestamp: i64, value: f64) -> Record {
        Record {
            source_id: "hits".to_string(),
            metric_key: metric_key.to_string(),
            timestamp,
            value,
            idempotency_key: key.to_string(),
            ingest_version: 1,
        }
    }

    fn batch(records: Vec<Record>, position: i64) -> Batch {
        Batch {
            source_id: "hits".to_string(),
            records,
            next_watermark: Watermark(position),
        }
    }

    /// Backend that fails the first N calls, then delegates to memory.
    struct FlakyBackend {
        inner: MemoryIndexBackend,
        failures_left: AtomicU32,
    }

    impl FlakyBackend {
        fn new(failures: u32) -> Self {
            Self {
                inner: MemoryIndexBackend::new(),
                failures_left: AtomicU32::new(failures),
            }
        }
    }

    #[async_trait]
    impl IndexBackend for FlakyBackend {
        async fn bulk_upsert(&self, documents: &[IndexDocument]) -> Result<(), IndexError> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(IndexError::IndexUnavailable("connection refused".to_string()));
            }
            self.inner.bulk_upsert(documents).await
        }

        fn backend_type(&self) -> &'static str {
            "flaky"
        }
    }

    fn setup() -> (tempfile::TempDir, Arc<DurableStore>) {
        let dir = tempdir().unwrap();
        let store = Arc::new(DurableStore::new(dir.path().join("archive.db")).unwrap());
        (dir, store)
    }

    #[tokio::test]
    async fn test_project_rolls_up_by_bucket() {
        let (_dir, store) = setup();
        let b = batch(
            vec![
                record("page.views.home", "k1", 1700000000, 2.0),
                record("page.views.home", "k2", 1700000100, 3.0),
                record("page.views.about", "k3", 1700000000, 1.0),
            ],
            3,
        );
        store.commit(&b).unwrap();

        let backend = Arc::new(MemoryIndexBackend::new());
        let projector = IndexProjector::new(store, backend.clone(), 2, 1);

        let result = projector.project(&b).await;
        assert_eq!(result, ProjectionResult::Projected { documents: 2 });

        let bucket = 1699920000;
        let home = backend
            .document(&IndexDocument::doc_id_for("page.views.home", bucket))
            .unwrap();
        assert_eq!(home.value, 5.0);
        assert_eq!(home.ingest_version, 2); // two version-1 records
    }

    #[tokio::test]
    async fn test_project_includes_prior_batches_in_rollup() {
        let (_dir, store) = setup();
        let first = batch(vec![record("page.views.home", "k1", 1700000000, 2.0)], 1);
        let second = batch(vec![record("page.views.home", "k2", 1700000100, 3.0)], 2);
        store.commit(&first).unwrap();
        store.commit(&second).unwrap();

        let backend = Arc::new(MemoryIndexBackend::new());
        let projector = IndexProjector::new(store, backend.clone(), 2, 1);

        projector.project(&first).await;
        projector.project(&second).await;

        // Second projection carries the full bucket rollup, not just k2
        let doc = backend
            .document(&IndexDocument::doc_id_for("page.views.home", 1699920000))
            .unwrap();
        assert_eq!(doc.value, 5.0);
    }

    #[tokio::test]
    async fn test_transient_failure_retried_then_projected() {
        let (_dir, store) = setup();
        let b = batch(vec![record("page.views.home", "k1", 1700000000, 2.0)], 1);
        store.commit(&b).unwrap();

        let backend = Arc::new(FlakyBackend::new(2));
        let projector = IndexProjector::new(store.clone(), backend.clone(), 3, 1);

        let result = projector.project(&b).await;
        assert_eq!(result, ProjectionResult::Projected { documents: 1 });
        assert_eq!(store.backlog_depth().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_exhausted_retries_defer_to_backlog() {
        let (_dir, store) = setup();
        let b = batch(vec![record("page.views.home", "k1", 1700000000, 2.0)], 1);
        store.commit(&b).unwrap();

        let backend = Arc::new(FlakyBackend::new(100));
        let projector = IndexProjector::new(store.clone(), backend, 2, 1);

        let result = projector.project(&b).await;
        assert_eq!(result, ProjectionResult::Deferred);
        assert_eq!(store.backlog_depth().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_empty_batch_skipped() {
        let (_dir, store) = setup();
        let backend = Arc::new(MemoryIndexBackend::new());
        let projector = IndexProjector::new(store, backend, 2, 1);
        let result = projector.project(&batch(vec![], 1)).await;
        assert_eq!(result, ProjectionResult::Skipped);
    }

    #[tokio::test]
    async fn test_memory_backend_lww_by_version() {
        let backend = MemoryIndexBackend::new();
        let mut doc = IndexDocument {
            doc_id: "m@0".to_string(),
            source_id: "hits".to_string(),
            metric_key: "m".to_string(),
            bucket_start: 0,
            value: 5.0,
            ingest_version: 3,
        };
        backend.bulk_upsert(std::slice::from_ref(&doc)).await.unwrap();

        // Stale rewrite loses
        doc.value = 1.0;
        doc.ingest_version = 2;
        backend.bulk_upsert(std::slice::from_ref(&doc)).await.unwrap();
        assert_eq!(backend.document("m@0").unwrap().value, 5.0);

        // Newer rewrite wins
        doc.value = 9.0;
        doc.ingest_version = 4;
        backend.bulk_upsert(&[doc]).await.unwrap();
        assert_eq!(backend.document("m@0").unwrap().value, 9.0);
    }
}
