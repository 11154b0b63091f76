//! Record batching with idempotency-key deduplication
//!
//! The aggregator accumulates normalized Records into a Batch for one
//! durable-write transaction. Colliding idempotency keys are merged by the
//! metric's policy; a flush is forced when the batch reaches its size
//! threshold or its flush interval elapses, bounding both memory and the
//! staleness of durable writes.

use crate::record::Record;
use crate::source::Watermark;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// How colliding Records of one metric_key are merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergePolicy {
    /// Additive counters: values sum, highest ingest_version is kept
    Sum,
    /// Re-statable values: the higher ingest_version wins outright
    LastWriteWins,
}

impl MergePolicy {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "sum" => Some(MergePolicy::Sum),
            "lww" => Some(MergePolicy::LastWriteWins),
            _ => None,
        }
    }
}

/// Per-metric merge policies with a configured default.
///
/// All shipped metrics are counters, so the default is Sum; re-statable
/// metrics (payment revenue) are overridden to LastWriteWins via config.
#[derive(Debug, Clone)]
pub struct MergePolicyTable {
    default: MergePolicy,
    overrides: HashMap<String, MergePolicy>,
}

impl Default for MergePolicyTable {
    fn default() -> Self {
        Self {
            default: MergePolicy::Sum,
            overrides: HashMap::new(),
        }
    }
}

impl MergePolicyTable {
    pub fn new(default: MergePolicy) -> Self {
        Self {
            default,
            overrides: HashMap::new(),
        }
    }

    pub fn with_override(mut self, metric_key: impl Into<String>, policy: MergePolicy) -> Self {
        self.overrides.insert(metric_key.into(), policy);
        self
    }

    /// Parse a "metric_key=sum,other.key=lww" override list.
    ///
    /// Unknown policy names are logged and skipped rather than failing
    /// startup; the metric falls back to the default policy.
    pub fn parse(spec: &str) -> Self {
        let mut table = Self::default();
        for entry in spec.split(',').filter(|s| !s.trim().is_empty()) {
            match entry.trim().split_once('=') {
                Some((key, policy_str)) => match MergePolicy::from_str(policy_str.trim()) {
                    Some(policy) => {
                        table.overrides.insert(key.trim().to_string(), policy);
                    }
                    None => {
                        log::warn!("⚠️ Unknown merge policy '{}' for '{}', using default", policy_str, key);
                    }
                },
                None => {
                    log::warn!("⚠️ Malformed merge policy entry '{}', expected key=policy", entry);
                }
            }
        }
        table
    }

    /// Policy for a metric: exact override first, then longest dotted prefix
    /// (so "app.revenue" covers "app.<uuid>.revenue" via "app.*" style keys
    /// is NOT supported; prefixes are literal, e.g. "page.views").
    pub fn policy_for(&self, metric_key: &str) -> MergePolicy {
        if let Some(policy) = self.overrides.get(metric_key) {
            return *policy;
        }
        let mut prefix = metric_key;
        while let Some(idx) = prefix.rfind('.') {
            prefix = &prefix[..idx];
            if let Some(policy) = self.overrides.get(prefix) {
                return *policy;
            }
        }
        self.default
    }
}

/// An ordered group of Records committed atomically to the durable store.
///
/// Idempotency keys are unique within the batch; `next_watermark` is the
/// position the source's watermark advances to when this batch commits.
/// Lifetime is bounded to one pipeline cycle.
#[derive(Debug, Clone)]
pub struct Batch {
    pub source_id: String,
    pub records: Vec<Record>,
    pub next_watermark: Watermark,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Inclusive event-time span of the batch, if non-empty.
    pub fn timestamp_range(&self) -> Option<(i64, i64)> {
        let min = self.records.iter().map(|r| r.timestamp).min()?;
        let max = self.records.iter().map(|r| r.timestamp).max()?;
        Some((min, max))
    }
}

/// Accumulates one source's Records into the next Batch.
pub struct Aggregator {
    source_id: String,
    policies: MergePolicyTable,
    // Admission order plus O(1) collision lookup
    records: Vec<Record>,
    by_key: HashMap<String, usize>,
    max_batch_size: usize,
    flush_interval: Duration,
    opened_at: Instant,
}

impl Aggregator {
    pub fn new(
        source_id: impl Into<String>,
        policies: MergePolicyTable,
        max_batch_size: usize,
        flush_interval: Duration,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            policies,
            records: Vec::new(),
            by_key: HashMap::new(),
            max_batch_size,
            flush_interval,
            opened_at: Instant::now(),
        }
    }

    /// Admit a Record, merging on idempotency-key collision.
    ///
    /// Once admitted a Record is never discarded except through the merge
    /// policy applied here.
    pub fn admit(&mut self, record: Record) {
        match self.by_key.get(&record.idempotency_key) {
            Some(&idx) => {
                let existing = &mut self.records[idx];
                match self.policies.policy_for(&record.metric_key) {
                    MergePolicy::Sum => {
                        existing.value += record.value;
                        existing.ingest_version = existing.ingest_version.max(record.ingest_version);
                    }
                    MergePolicy::LastWriteWins => {
                        if record.ingest_version > existing.ingest_version {
                            *existing = record;
                        }
                    }
                }
            }
            None => {
                self.by_key
                    .insert(record.idempotency_key.clone(), self.records.len());
                self.records.push(record);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// True when the size threshold is reached or the flush interval elapsed
    /// with something pending.
    pub fn should_flush(&self) -> bool {
        self.records.len() >= self.max_batch_size
            || (!self.records.is_empty() && self.opened_at.elapsed() >= self.flush_interval)
    }

    /// Seal the pending Records into a Batch and reset for the next one.
    pub fn seal(&mut self, next_watermark: Watermark) -> Batch {
        self.by_key.clear();
        self.opened_at = Instant::now();
        Batch {
            source_id: self.source_id.clone(),
            records: std::mem::take(&mut self.records),
            next_watermark,
        }
    }
}
