//! JSONL file collector for download-count dumps
//!
//! Upstream marketplaces drop daily download-count dumps as JSONL files.
//! The watermark is the byte offset of the last committed line, so a restart
//! resumes mid-file without re-reading history and a partially written tail
//! line is left for the next cycle.

use super::{CorruptPayload, FetchError, FetchPage, RawPayload, SourceCollector, Watermark};
use async_trait::async_trait;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::PathBuf;

pub struct JsonlCollector {
    source_id: String,
    path: PathBuf,
}

impl JsonlCollector {
    pub fn new(source_id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            source_id: source_id.into(),
            path: path.into(),
        }
    }
}

#[async_trait]
impl SourceCollector for JsonlCollector {
    async fn fetch(&self, since: Watermark, limit: usize) -> Result<FetchPage, FetchError> {
        let file = std::fs::File::open(&self.path).map_err(|e| {
            FetchError::SourceUnavailable(format!("{}: {}", self.path.display(), e))
        })?;
        let file_len = file
            .metadata()
            .map_err(|e| FetchError::SourceUnavailable(e.to_string()))?
            .len() as i64;

        if since.position() > file_len {
            // File shrank underneath the cursor (rotation without reset)
            return Err(FetchError::SourceCorrupt(format!(
                "{}: cursor {} past end of file ({} bytes)",
                self.path.display(),
                since.position(),
                file_len
            )));
        }

        let mut reader = BufReader::new(file);
        reader
            .seek(SeekFrom::Start(since.position() as u64))
            .map_err(|e| FetchError::SourceUnavailable(e.to_string()))?;

        let mut page = FetchPage::empty(since);
        let mut offset = since.position();

        for _ in 0..limit {
            let mut line = String::new();
            let read = reader
                .read_line(&mut line)
                .map_err(|e| FetchError::SourceUnavailable(e.to_string()))?;
            if read == 0 {
                break;
            }
            if !line.ends_with('\n') {
                // Partial tail line still being written; re-read next cycle
                break;
            }
            offset += read as i64;
            let body = line.trim_end().to_string();
            if body.is_empty() {
                continue;
            }

            // Structural validation only; field shapes are the normalizer's job
            if serde_json::from_str::<serde_json::Value>(&body).is_err() {
                page.corrupt.push(CorruptPayload {
                    source_id: self.source_id.clone(),
                    position: offset,
                    body,
                    reason: "not valid JSON".to_string(),
                });
                continue;
            }

            page.payloads.push(RawPayload {
                source_id: self.source_id.clone(),
                position: offset,
                body,
            });
        }

        page.next_watermark = Watermark(offset);
        page.has_more = offset < file_len;
        Ok(page)
    }

    fn collector_type(&self) -> &'static str {
        "jsonl"
    }
}
