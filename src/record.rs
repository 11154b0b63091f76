//! Canonical statistical record shared by every pipeline stage

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A normalized statistical event.
///
/// Records are created by the normalizer, merged in batches by the
/// aggregator, committed once to the durable store, and projected into the
/// query index. They are never mutated after durable commit except by a
/// later Record carrying the same `idempotency_key` and a strictly higher
/// `ingest_version`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Record {
    /// Originating collector/system (e.g. "marketplace-hits")
    pub source_id: String,
    /// Dimensional key, dot-separated (e.g. "app.4231.downloads")
    pub metric_key: String,
    /// Event time, UTC seconds
    pub timestamp: i64,
    /// Numeric measurement; semantics fixed per metric_key
    pub value: f64,
    /// Deterministic identity of the logical event (hex sha256)
    pub idempotency_key: String,
    /// Monotonic per-key counter, resolves last-write-wins
    pub ingest_version: i64,
}

impl Record {
    /// Derive the deterministic idempotency key for a logical event.
    ///
    /// Each part is length-prefixed before hashing so that shifting bytes
    /// between fields can never produce the same key. Depends only on the
    /// inputs, never on wall-clock time.
    pub fn idempotency_key_for(
        source_id: &str,
        metric_key: &str,
        timestamp: i64,
        identity: &str,
    ) -> String {
        let mut hasher = Sha256::new();
        for part in [source_id, metric_key] {
            hasher.update((part.len() as u64).to_be_bytes());
            hasher.update(part.as_bytes());
        }
        hasher.update(timestamp.to_be_bytes());
        hasher.update((identity.len() as u64).to_be_bytes());
        hasher.update(identity.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Start of the UTC day bucket this record falls into.
    ///
    /// The query index keys documents by (metric_key, day bucket).
    pub fn bucket_start(&self) -> i64 {
        self.timestamp - self.timestamp.rem_euclid(86_400)
    }
}
