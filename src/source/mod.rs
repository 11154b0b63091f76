//! Source collector capability
//!
//! Each upstream system (page-view endpoint, download-count dumps, payment
//! database) implements [`SourceCollector`]. The pipeline treats a collector
//! as an opaque capability: it fetches a bounded page of raw payloads past a
//! watermark and performs no source-specific logic itself.

pub mod http;
pub mod jsonl;
pub mod sqlite;

pub use http::HttpCollector;
pub use jsonl::JsonlCollector;
pub use sqlite::SqliteCollector;

use crate::normalize::SourceKind;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Per-source cursor marking the last durably committed position.
///
/// The meaning of the position is source-native: a line offset for JSONL
/// dumps, a rowid for the payments database, epoch seconds for the hits
/// endpoint. Owned by the pipeline coordinator and persisted next to the
/// records it covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Watermark(pub i64);

impl Watermark {
    /// Starting cursor for a first run or an explicit full backfill.
    pub fn epoch() -> Self {
        Watermark(0)
    }

    pub fn position(&self) -> i64 {
        self.0
    }
}

/// One raw item as fetched from a source, prior to normalization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawPayload {
    pub source_id: String,
    /// Source-native cursor value for this item
    pub position: i64,
    /// Raw serialized item (JSON object for every shipped collector)
    pub body: String,
}

/// An item that failed structural validation inside the collector.
///
/// Corrupt items are skipped with a dead-letter entry; they never advance
/// the watermark and never abort the rest of their page.
#[derive(Debug, Clone)]
pub struct CorruptPayload {
    pub source_id: String,
    pub position: i64,
    pub body: String,
    pub reason: String,
}

/// A bounded page of payloads from one fetch call.
///
/// `next_watermark` covers every payload in the page; `has_more` tells the
/// coordinator to run another cycle immediately instead of waiting for the
/// poll interval.
#[derive(Debug)]
pub struct FetchPage {
    pub payloads: Vec<RawPayload>,
    pub corrupt: Vec<CorruptPayload>,
    pub next_watermark: Watermark,
    pub has_more: bool,
}

impl FetchPage {
    /// An empty page that leaves the watermark where it was.
    pub fn empty(since: Watermark) -> Self {
        Self {
            payloads: Vec::new(),
            corrupt: Vec::new(),
            next_watermark: since,
            has_more: false,
        }
    }
}

#[derive(Debug)]
pub enum FetchError {
    /// Transient connectivity failure; retried with backoff
    SourceUnavailable(String),
    /// The source handed back something structurally unusable at page level
    SourceCorrupt(String),
}

impl std::fmt::Display for FetchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchError::SourceUnavailable(msg) => write!(f, "source unavailable: {}", msg),
            FetchError::SourceCorrupt(msg) => write!(f, "source corrupt: {}", msg),
        }
    }
}

impl std::error::Error for FetchError {}

/// Capability implemented by every source integration.
///
/// Collectors are read-only and safe to invoke concurrently for different
/// sources. `fetch` must be restartable from any watermark it has returned
/// and must never require the source's full history in memory, which is why
/// it pages: at most `limit` items per call.
#[async_trait]
pub trait SourceCollector: Send + Sync {
    async fn fetch(&self, since: Watermark, limit: usize) -> Result<FetchPage, FetchError>;

    /// Collector type for logging
    fn collector_type(&self) -> &'static str;
}

/// One registered source: the collector plus the payload schema its items
/// are normalized with.
#[derive(Clone)]
pub struct SourceEntry {
    pub source_id: String,
    pub kind: SourceKind,
    pub collector: Arc<dyn SourceCollector>,
}

/// Lookup of configured sources keyed by source_id.
///
/// Kept as a flat registry instead of an inheritance hierarchy; the
/// coordinator iterates it once at startup to spawn one pipeline per source.
#[derive(Default, Clone)]
pub struct CollectorRegistry {
    entries: HashMap<String, SourceEntry>,
}

impl CollectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        source_id: impl Into<String>,
        kind: SourceKind,
        collector: Arc<dyn SourceCollector>,
    ) {
        let source_id = source_id.into();
        log::info!(
            "📥 Registered source '{}' ({} via {})",
            source_id,
            kind.as_str(),
            collector.collector_type()
        );
        self.entries.insert(
            source_id.clone(),
            SourceEntry {
                source_id,
                kind,
                collector,
            },
        );
    }

    pub fn get(&self, source_id: &str) -> Option<&SourceEntry> {
        self.entries.get(source_id)
    }

    pub fn sources(&self) -> Vec<SourceEntry> {
        let mut entries: Vec<_> = self.entries.values().cloned().collect();
        entries.sort_by(|a, b| a.source_id.cmp(&b.source_id));
        entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
