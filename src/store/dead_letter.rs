//! Append-only JSONL dead-letter log
//!
//! A malformed payload is set aside here with its rejection reason and the
//! pipeline moves on; nothing in the batch waits for it. The file is plain
//! JSONL so operators can grep it and replay repaired items by hand.

use crate::normalize::NormalizeError;
use crate::source::{CorruptPayload, RawPayload};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub source_id: String,
    pub position: i64,
    pub reason: String,
    pub body: String,
    pub written_at: i64,
}

pub struct DeadLetterLog {
    path: PathBuf,
    file: Mutex<std::fs::File>,
}

impl DeadLetterLog {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, std::io::Error> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, entry: &DeadLetterEntry) {
        // A dead-letter write failure must never escalate into a pipeline
        // failure; log it and keep going.
        let line = match serde_json::to_string(entry) {
            Ok(line) => line,
            Err(e) => {
                log::error!("❌ Failed to serialize dead-letter entry: {}", e);
                return;
            }
        };
        let mut file = self.file.lock().unwrap();
        if let Err(e) = writeln!(file, "{}", line) {
            log::error!("❌ Failed to append dead-letter entry: {}", e);
        }
    }

    /// Set aside an item that failed structural validation at fetch time.
    pub fn record_corrupt(&self, corrupt: &CorruptPayload) {
        log::warn!(
            "⚠️ Dead-letter [{}@{}]: {}",
            corrupt.source_id,
            corrupt.position,
            corrupt.reason
        );
        self.append(&DeadLetterEntry {
            source_id: corrupt.source_id.clone(),
            position: corrupt.position,
            reason: corrupt.reason.clone(),
            body: corrupt.body.clone(),
            written_at: chrono::Utc::now().timestamp(),
        });
    }

    /// Set aside a payload the normalizer rejected.
    pub fn record_rejected(&self, payload: &RawPayload, err: &NormalizeError) {
        log::warn!(
            "⚠️ Dead-letter [{}@{}]: {}",
            payload.source_id,
            payload.position,
            err
        );
        self.append(&DeadLetterEntry {
            source_id: payload.source_id.clone(),
            position: payload.position,
            reason: err.to_string(),
            body: payload.body.clone(),
            written_at: chrono::Utc::now().timestamp(),
        });
    }

    /// Number of entries on disk (test/status helper; reads the whole file).
    pub fn entry_count(&self) -> Result<usize, std::io::Error> {
        let contents = std::fs::read_to_string(&self.path)?;
        Ok(contents.lines().filter(|l| !l.trim().is_empty()).count())
    }
}
