//! End-to-end pipeline tests over real files and databases
//!
//! Each test wires a real collector into a SourcePipeline against a
//! tempdir SQLite archive and an in-memory (or deliberately failing)
//! index backend, then checks the pipeline's durability properties:
//! replay idempotence, crash-safe watermarks, merge semantics, dead
//! letter isolation, and index repair.

use statflow::aggregate::{MergePolicy, MergePolicyTable};
use statflow::index::{
    IndexBackend, IndexDocument, IndexError, IndexProjector, MemoryIndexBackend, Reconciler,
};
use statflow::normalize::SourceKind;
use statflow::pipeline::{CycleOutcome, PipelineSettings, SourcePipeline, SourceState, StatusBoard};
use statflow::source::{JsonlCollector, SourceEntry, SqliteCollector};
use statflow::store::{DeadLetterLog, DurableStore};
use async_trait::async_trait;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

fn fast_settings() -> PipelineSettings {
    PipelineSettings {
        fetch_retry_initial_ms: 1,
        fetch_retry_max_ms: 2,
        fetch_max_retries: 1,
        commit_retry_initial_ms: 1,
        commit_retry_max_ms: 2,
        commit_max_retries: 1,
        ..PipelineSettings::default()
    }
}

fn write_jsonl(path: &Path, lines: &[String]) -> PathBuf {
    let mut file = std::fs::File::create(path).unwrap();
    for line in lines {
        writeln!(file, "{}", line).unwrap();
    }
    path.to_path_buf()
}

struct Harness {
    _dir: tempfile::TempDir,
    store: Arc<DurableStore>,
    backend: Arc<MemoryIndexBackend>,
    dead_letters: Arc<DeadLetterLog>,
    board: StatusBoard,
}

impl Harness {
    fn new() -> Self {
        let dir = tempdir().unwrap();
        let store = Arc::new(DurableStore::new(dir.path().join("archive.db")).unwrap());
        let backend = Arc::new(MemoryIndexBackend::new());
        let dead_letters =
            Arc::new(DeadLetterLog::new(dir.path().join("dead_letters.jsonl")).unwrap());
        Self {
            _dir: dir,
            store,
            backend,
            dead_letters,
            board: StatusBoard::new(),
        }
    }

    fn dir(&self) -> &Path {
        self._dir.path()
    }

    fn pipeline_with_backend(
        &self,
        entry: SourceEntry,
        policies: MergePolicyTable,
        settings: PipelineSettings,
        backend: Arc<dyn IndexBackend>,
    ) -> SourcePipeline {
        let projector = Arc::new(IndexProjector::new(self.store.clone(), backend, 0, 1));
        SourcePipeline::new(
            entry,
            self.store.clone(),
            projector,
            self.dead_letters.clone(),
            policies,
            settings,
            self.board.clone(),
        )
    }

    fn pipeline(&self, entry: SourceEntry, policies: MergePolicyTable) -> SourcePipeline {
        self.pipeline_with_backend(
            entry,
            policies,
            fast_settings(),
            self.backend.clone() as Arc<dyn IndexBackend>,
        )
    }

    async fn wait_for_doc(&self, doc_id: &str) -> IndexDocument {
        for _ in 0..200 {
            if let Some(doc) = self.backend.document(doc_id) {
                return doc;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("document '{}' never reached the index", doc_id);
    }
}

fn jsonl_entry(harness: &Harness, name: &str, lines: &[String]) -> SourceEntry {
    let path = write_jsonl(&harness.dir().join(format!("{}.jsonl", name)), lines);
    SourceEntry {
        source_id: name.to_string(),
        kind: SourceKind::Downloads,
        collector: Arc::new(JsonlCollector::new(name, path)),
    }
}

fn download_line(app: &str, count: u32, date: &str) -> String {
    format!(
        r#"{{"app_uuid":"{}","downloads_count":{},"date":"{}"}}"#,
        app, count, date
    )
}

#[tokio::test]
async fn test_replayed_ingestion_is_idempotent() {
    let harness = Harness::new();
    let entry = jsonl_entry(
        &harness,
        "downloads",
        &[
            download_line("a1", 3, "2024-01-02"),
            download_line("a2", 5, "2024-01-02"),
        ],
    );
    let mut pipeline = harness.pipeline(entry, MergePolicyTable::default());
    pipeline.seed().unwrap();

    let first = pipeline.run_cycle().await;
    assert!(matches!(first, CycleOutcome::Committed { written: 2, .. }));
    let doc_a1 = harness.wait_for_doc("app.a1.downloads@1704153600").await;
    assert_eq!(doc_a1.value, 3.0);

    // Replay everything from position zero: cardinality and index values
    // must not change
    pipeline.reset_for_backfill(0).unwrap();
    let replay = pipeline.run_cycle().await;
    assert!(matches!(replay, CycleOutcome::Committed { written: 0, .. }));

    assert_eq!(harness.store.record_count().unwrap(), 2);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        harness.backend.document("app.a1.downloads@1704153600").unwrap().value,
        3.0
    );
    let status = harness.board.get("downloads").unwrap();
    assert_eq!(status.records_committed, 2);
    assert_eq!(status.records_deduplicated, 2);
}

#[tokio::test]
async fn test_failed_commit_preserves_watermark() {
    let harness = Harness::new();
    let entry = jsonl_entry(
        &harness,
        "downloads",
        &[
            download_line("a1", 3, "2024-01-02"),
            download_line("a2", 5, "2024-01-02"),
        ],
    );
    let settings = PipelineSettings {
        commit_max_retries: 0,
        ..fast_settings()
    };
    let mut pipeline = harness.pipeline_with_backend(
        entry,
        MergePolicyTable::default(),
        settings,
        harness.backend.clone() as Arc<dyn IndexBackend>,
    );
    pipeline.seed().unwrap();

    // A writer holding the archive's write lock makes the commit fail
    let blocker = rusqlite::Connection::open(harness.dir().join("archive.db")).unwrap();
    blocker.busy_timeout(Duration::from_millis(100)).unwrap();
    blocker.execute_batch("BEGIN EXCLUSIVE").unwrap();

    let outcome = pipeline.run_cycle().await;
    assert_eq!(outcome, CycleOutcome::Dead);
    assert_eq!(pipeline.state(), SourceState::Dead);
    drop(blocker);

    // Nothing committed, cursor never advanced
    assert_eq!(harness.store.record_count().unwrap(), 0);
    assert_eq!(harness.store.watermark("downloads").unwrap(), None);

    // Operator reset revives the source; the rerun lands everything once
    pipeline.reset_for_backfill(0).unwrap();
    let rerun = pipeline.run_cycle().await;
    assert!(matches!(rerun, CycleOutcome::Committed { written: 2, .. }));
    assert_eq!(harness.store.record_count().unwrap(), 2);
}

#[tokio::test]
async fn test_page_view_rollup_sums_within_bucket() {
    let harness = Harness::new();
    // Two download counts for the same app land in the same day bucket and
    // the index rollup carries their sum
    let entry = jsonl_entry(
        &harness,
        "downloads",
        &[
            download_line("a1", 3, "2024-01-02"),
            download_line("a1", 5, "2024-01-02"),
        ],
    );
    let mut pipeline = harness.pipeline(entry, MergePolicyTable::default());
    pipeline.seed().unwrap();
    pipeline.run_cycle().await;

    let doc = harness.wait_for_doc("app.a1.downloads@1704153600").await;
    assert_eq!(doc.value, 8.0);
    assert_eq!(harness.store.record_count().unwrap(), 2);
}

fn payments_db(dir: &Path) -> PathBuf {
    let path = dir.join("payments.db");
    let conn = rusqlite::Connection::open(&path).unwrap();
    conn.execute_batch(
        "CREATE TABLE transactions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            txn_id TEXT,
            app_uuid TEXT,
            amount REAL NOT NULL,
            currency TEXT NOT NULL,
            revision INTEGER NOT NULL DEFAULT 1,
            created_at INTEGER NOT NULL
        )",
    )
    .unwrap();
    conn.execute(
        "INSERT INTO transactions (txn_id, app_uuid, amount, currency, revision, created_at)
         VALUES ('t1', 'a1', 10.0, 'USD', 1, 1704153600)",
        [],
    )
    .unwrap();
    path
}

#[tokio::test]
async fn test_payment_revision_is_last_write_wins() {
    let harness = Harness::new();
    let db_path = payments_db(harness.dir());
    let entry = SourceEntry {
        source_id: "payments".to_string(),
        kind: SourceKind::Payments,
        collector: Arc::new(SqliteCollector::new("payments", db_path.clone()).unwrap()),
    };
    let policies = MergePolicyTable::default().with_override("app", MergePolicy::LastWriteWins);
    let mut pipeline = harness.pipeline(entry, policies);
    pipeline.seed().unwrap();

    pipeline.run_cycle().await;
    assert_eq!(harness.store.record_count().unwrap(), 1);
    let doc = harness.wait_for_doc("app.a1.revenue@1704153600").await;
    assert_eq!(doc.value, 10.0);

    // The upstream re-states the transaction at a higher revision
    let conn = rusqlite::Connection::open(&db_path).unwrap();
    conn.execute(
        "INSERT INTO transactions (txn_id, app_uuid, amount, currency, revision, created_at)
         VALUES ('t1', 'a1', 12.0, 'USD', 2, 1704153600)",
        [],
    )
    .unwrap();

    let outcome = pipeline.run_cycle().await;
    assert!(matches!(outcome, CycleOutcome::Committed { .. }));

    // Same identity, higher version: replaced, not duplicated
    assert_eq!(harness.store.record_count().unwrap(), 1);
    let records = harness
        .store
        .records_in_range("payments", 1704153600, 1704153600)
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].value, 12.0);
    assert_eq!(records[0].ingest_version, 2);

    for _ in 0..200 {
        let doc = harness.backend.document("app.a1.revenue@1704153600").unwrap();
        if doc.value == 12.0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("index never converged on the revised amount");
}

#[tokio::test]
async fn test_stale_revision_cannot_regress_archive() {
    let harness = Harness::new();
    let db_path = payments_db(harness.dir());
    {
        let conn = rusqlite::Connection::open(&db_path).unwrap();
        conn.execute(
            "UPDATE transactions SET revision = 3, amount = 30.0 WHERE txn_id = 't1'",
            [],
        )
        .unwrap();
    }
    let entry = SourceEntry {
        source_id: "payments".to_string(),
        kind: SourceKind::Payments,
        collector: Arc::new(SqliteCollector::new("payments", db_path.clone()).unwrap()),
    };
    let mut pipeline = harness.pipeline(entry, MergePolicyTable::default());
    pipeline.seed().unwrap();
    pipeline.run_cycle().await;

    // An out-of-order older revision arrives later
    let conn = rusqlite::Connection::open(&db_path).unwrap();
    conn.execute(
        "INSERT INTO transactions (txn_id, app_uuid, amount, currency, revision, created_at)
         VALUES ('t1', 'a1', 10.0, 'USD', 1, 1704153600)",
        [],
    )
    .unwrap();
    pipeline.run_cycle().await;

    let records = harness
        .store
        .records_in_range("payments", 1704153600, 1704153600)
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].value, 30.0);
    assert_eq!(records[0].ingest_version, 3);
}

#[tokio::test]
async fn test_dead_letters_are_isolated() {
    let harness = Harness::new();
    let mut lines: Vec<String> = (0..50)
        .map(|i| download_line(&format!("a{}", i), 1, "2024-01-02"))
        .collect();
    lines.insert(25, r#"{"app_uuid":"bad","downloads_count":"not a number"}"#.to_string());
    let entry = jsonl_entry(&harness, "downloads", &lines);

    let mut pipeline = harness.pipeline(entry, MergePolicyTable::default());
    pipeline.seed().unwrap();

    let outcome = pipeline.run_cycle().await;
    assert!(matches!(outcome, CycleOutcome::Committed { written: 50, .. }));
    assert_eq!(harness.store.record_count().unwrap(), 50);
    assert_eq!(harness.dead_letters.entry_count().unwrap(), 1);

    // The bad line is behind the watermark, not refetched forever
    assert_eq!(pipeline.run_cycle().await, CycleOutcome::Idle);
}

/// Index backend that refuses bulk writes while `down` is set.
struct SwitchableBackend {
    inner: MemoryIndexBackend,
    down: AtomicBool,
}

impl SwitchableBackend {
    fn new(down: bool) -> Self {
        Self {
            inner: MemoryIndexBackend::new(),
            down: AtomicBool::new(down),
        }
    }
}

#[async_trait]
impl IndexBackend for SwitchableBackend {
    async fn bulk_upsert(&self, documents: &[IndexDocument]) -> Result<(), IndexError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(IndexError::IndexUnavailable("switched off".to_string()));
        }
        self.inner.bulk_upsert(documents).await
    }

    fn backend_type(&self) -> &'static str {
        "switchable"
    }
}

#[tokio::test]
async fn test_reconciliation_repairs_index_after_outage() {
    let harness = Harness::new();
    let backend = Arc::new(SwitchableBackend::new(true));
    let entry = jsonl_entry(
        &harness,
        "downloads",
        &[
            download_line("a1", 3, "2024-01-02"),
            download_line("a1", 5, "2024-01-02"),
        ],
    );
    let mut pipeline = harness.pipeline_with_backend(
        entry,
        MergePolicyTable::default(),
        fast_settings(),
        backend.clone() as Arc<dyn IndexBackend>,
    );
    pipeline.seed().unwrap();

    // Durable commit succeeds even though the index is down; the failed
    // projection lands in the backlog
    let outcome = pipeline.run_cycle().await;
    assert!(matches!(outcome, CycleOutcome::Committed { written: 2, .. }));
    for _ in 0..200 {
        if harness.store.backlog_depth().unwrap() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(harness.store.backlog_depth().unwrap(), 1);
    assert!(backend.inner.is_empty());

    // Index comes back; one repair pass converges it with the archive
    backend.down.store(false, Ordering::SeqCst);
    let reconciler = Reconciler::new(
        harness.store.clone(),
        backend.clone() as Arc<dyn IndexBackend>,
        10,
        600,
    );
    let stats = reconciler.run_repair_pass().await.unwrap();
    assert_eq!(stats.repaired, 1);
    assert_eq!(harness.store.backlog_depth().unwrap(), 0);

    let doc = backend.inner.document("app.a1.downloads@1704153600").unwrap();
    assert_eq!(doc.value, 8.0);
}
