//! Per-source pipeline state machine and status reporting
//!
//! Every configured source owns one state machine:
//!
//! ```text
//! IDLE → FETCHING → NORMALIZING → BATCHING → COMMITTING → PROJECTING → IDLE
//!           ↕ BACKOFF (fetch)        BACKOFF (commit) ↕
//!                                         DEAD (commit budget exhausted)
//! ```
//!
//! BACKOFF returns to the stage it came from after its delay. DEAD is
//! terminal until an operator resets the source (backfill reset included);
//! a dead source is excluded from subsequent cycles.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// The stage a BACKOFF state resumes into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStage {
    Fetching,
    Committing,
}

impl RetryStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetryStage::Fetching => "FETCHING",
            RetryStage::Committing => "COMMITTING",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    Idle,
    Fetching,
    Normalizing,
    Batching,
    Committing,
    Projecting,
    Backoff { from: RetryStage, attempt: u32 },
    Dead,
}

impl SourceState {
    pub fn is_dead(&self) -> bool {
        matches!(self, SourceState::Dead)
    }

    pub fn label(&self) -> String {
        match self {
            SourceState::Idle => "IDLE".to_string(),
            SourceState::Fetching => "FETCHING".to_string(),
            SourceState::Normalizing => "NORMALIZING".to_string(),
            SourceState::Batching => "BATCHING".to_string(),
            SourceState::Committing => "COMMITTING".to_string(),
            SourceState::Projecting => "PROJECTING".to_string(),
            SourceState::Backoff { from, attempt } => {
                format!("BACKOFF({} attempt {})", from.as_str(), attempt)
            }
            SourceState::Dead => "DEAD".to_string(),
        }
    }
}

/// Point-in-time view of one source pipeline, published for the
/// operational surface (status reporting).
#[derive(Debug, Clone)]
pub struct SourceStatus {
    pub source_id: String,
    pub state: SourceState,
    pub watermark: i64,
    pub cycles: u64,
    pub records_committed: u64,
    pub records_deduplicated: u64,
    pub dead_letters: u64,
    pub last_error: Option<String>,
}

impl SourceStatus {
    pub fn new(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            state: SourceState::Idle,
            watermark: 0,
            cycles: 0,
            records_committed: 0,
            records_deduplicated: 0,
            dead_letters: 0,
            last_error: None,
        }
    }
}

/// Shared registry of per-source statuses.
#[derive(Default, Clone)]
pub struct StatusBoard {
    statuses: Arc<Mutex<HashMap<String, SourceStatus>>>,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, status: SourceStatus) {
        self.statuses
            .lock()
            .unwrap()
            .insert(status.source_id.clone(), status);
    }

    pub fn get(&self, source_id: &str) -> Option<SourceStatus> {
        self.statuses.lock().unwrap().get(source_id).cloned()
    }

    pub fn snapshot(&self) -> Vec<SourceStatus> {
        let mut statuses: Vec<_> = self.statuses.lock().unwrap().values().cloned().collect();
        statuses.sort_by(|a, b| a.source_id.cmp(&b.source_id));
        statuses
    }
}
