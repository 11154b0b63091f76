//! Runtime configuration from environment variables
//!
//! Everything is loaded once at startup with sensible defaults; a missing
//! or unparseable variable never aborts the process.

use crate::pipeline::{PipelineSettings, RuntimeOptions};
use std::env;

fn env_string(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// Configuration for the statistics pipeline runtime.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Path to the durable SQLite archive
    pub db_path: String,

    /// Path to the append-only dead letter log
    pub dead_letter_path: String,

    /// Base URL of the HTTP index; unset means in-memory index
    pub index_url: Option<String>,

    /// Page-view events endpoint (HTTP source)
    pub hits_url: Option<String>,

    /// Download counts dump file (JSONL source)
    pub downloads_path: Option<String>,

    /// Payments transaction database (SQLite source)
    pub payments_db_path: Option<String>,

    /// Raw merge policy overrides, `metric_key=policy` comma separated
    pub merge_policies: String,

    /// Raw backfill resets, `source_id=position` comma separated
    pub backfill: String,

    pub fetch_page_size: usize,
    pub max_batch_size: usize,
    pub batch_flush_interval_ms: u64,
    pub poll_interval_ms: u64,
    pub fetch_max_retries: u32,
    pub commit_max_retries: u32,
    pub retry_initial_ms: u64,
    pub retry_max_ms: u64,

    pub projection_max_retry_passes: u32,
    pub repair_interval_ms: u64,
    pub repair_claim_limit: usize,
    pub stale_claim_secs: i64,
    pub status_interval_ms: u64,
}

impl RuntimeConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `STATFLOW_DB_PATH` (default: /var/lib/statflow/archive.db)
    /// - `STATFLOW_DEAD_LETTER_PATH` (default: /var/lib/statflow/dead_letters.jsonl)
    /// - `STATFLOW_INDEX_URL` (default: unset, in-memory index)
    /// - `STATFLOW_HITS_URL`, `STATFLOW_DOWNLOADS_PATH`, `STATFLOW_PAYMENTS_DB`
    /// - `STATFLOW_MERGE_POLICIES` (e.g. `app.1234.revenue=lww`)
    /// - `STATFLOW_BACKFILL` (e.g. `downloads=0,hits=1700000000`)
    /// - batching/retry/repair knobs, see the struct defaults
    pub fn from_env() -> Self {
        Self {
            db_path: env_string("STATFLOW_DB_PATH", "/var/lib/statflow/archive.db"),
            dead_letter_path: env_string(
                "STATFLOW_DEAD_LETTER_PATH",
                "/var/lib/statflow/dead_letters.jsonl",
            ),
            index_url: env::var("STATFLOW_INDEX_URL").ok(),
            hits_url: env::var("STATFLOW_HITS_URL").ok(),
            downloads_path: env::var("STATFLOW_DOWNLOADS_PATH").ok(),
            payments_db_path: env::var("STATFLOW_PAYMENTS_DB").ok(),
            merge_policies: env_string("STATFLOW_MERGE_POLICIES", ""),
            backfill: env_string("STATFLOW_BACKFILL", ""),

            fetch_page_size: env_parse("STATFLOW_FETCH_PAGE_SIZE", 500),
            max_batch_size: env_parse("STATFLOW_MAX_BATCH_SIZE", 1_000),
            batch_flush_interval_ms: env_parse("STATFLOW_FLUSH_INTERVAL_MS", 5_000),
            poll_interval_ms: env_parse("STATFLOW_POLL_INTERVAL_MS", 10_000),
            fetch_max_retries: env_parse("STATFLOW_FETCH_MAX_RETRIES", 5),
            commit_max_retries: env_parse("STATFLOW_COMMIT_MAX_RETRIES", 5),
            retry_initial_ms: env_parse("STATFLOW_RETRY_INITIAL_MS", 1_000),
            retry_max_ms: env_parse("STATFLOW_RETRY_MAX_MS", 60_000),

            projection_max_retry_passes: env_parse("STATFLOW_PROJECTION_MAX_RETRIES", 3),
            repair_interval_ms: env_parse("STATFLOW_REPAIR_INTERVAL_MS", 60_000),
            repair_claim_limit: env_parse("STATFLOW_REPAIR_CLAIM_LIMIT", 50),
            stale_claim_secs: env_parse("STATFLOW_STALE_CLAIM_SECS", 600),
            status_interval_ms: env_parse("STATFLOW_STATUS_INTERVAL_MS", 30_000),
        }
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            fetch_page_size: self.fetch_page_size,
            max_batch_size: self.max_batch_size,
            batch_flush_interval_ms: self.batch_flush_interval_ms,
            poll_interval_ms: self.poll_interval_ms,
            fetch_retry_initial_ms: self.retry_initial_ms,
            fetch_retry_max_ms: self.retry_max_ms,
            fetch_max_retries: self.fetch_max_retries,
            commit_retry_initial_ms: self.retry_initial_ms,
            commit_retry_max_ms: self.retry_max_ms,
            commit_max_retries: self.commit_max_retries,
        }
    }

    pub fn runtime_options(&self) -> RuntimeOptions {
        RuntimeOptions {
            settings: self.pipeline_settings(),
            repair_interval_ms: self.repair_interval_ms,
            repair_claim_limit: self.repair_claim_limit,
            stale_claim_secs: self.stale_claim_secs,
            status_interval_ms: self.status_interval_ms,
        }
    }

    /// Parse the backfill directive into (source_id, position) resets.
    /// Malformed entries are logged and skipped.
    pub fn backfill_resets(&self) -> Vec<(String, i64)> {
        parse_backfill(&self.backfill)
    }
}

pub fn parse_backfill(raw: &str) -> Vec<(String, i64)> {
    let mut resets = Vec::new();
    for entry in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        match entry.split_once('=') {
            Some((source_id, position)) => match position.trim().parse::<i64>() {
                Ok(position) => resets.push((source_id.trim().to_string(), position)),
                Err(_) => log::warn!("⚠️ Ignoring backfill entry with bad position: '{}'", entry),
            },
            None => log::warn!("⚠️ Ignoring malformed backfill entry: '{}'", entry),
        }
    }
    resets
}
