//! HTTP bulk-upsert index backend
//!
//! Speaks an Elasticsearch-style `_bulk` API: one NDJSON body with an
//! action line and a document line per document, trailing newline included.
//! Documents use external versioning (our ingest_version), so the index
//! itself enforces last-write-wins and a stale rewrite comes back as a
//! version conflict, which is an expected no-op rather than an error.
//! Documents land in monthly indices (`stats_YYYY_MM`) for cheap retention.

use super::{IndexBackend, IndexDocument, IndexError};
use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};
use std::time::Duration;

pub struct HttpIndexBackend {
    base_url: String,
    client: reqwest::Client,
}

impl HttpIndexBackend {
    pub fn new(base_url: impl Into<String>) -> Result<Self, IndexError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| IndexError::IndexUnavailable(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    fn index_name(bucket_start: i64) -> String {
        let date = DateTime::<Utc>::from_timestamp(bucket_start, 0)
            .unwrap_or_else(|| DateTime::<Utc>::UNIX_EPOCH);
        format!("stats_{:04}_{:02}", date.year(), date.month())
    }

    fn bulk_body(documents: &[IndexDocument]) -> Result<String, IndexError> {
        let mut lines = Vec::with_capacity(documents.len() * 2);
        for doc in documents {
            let action = serde_json::json!({
                "index": {
                    "_index": Self::index_name(doc.bucket_start),
                    "_id": doc.doc_id,
                    "version": doc.ingest_version,
                    "version_type": "external",
                }
            });
            let body = serde_json::to_string(doc)
                .map_err(|e| IndexError::MalformedRequest(e.to_string()))?;
            lines.push(action.to_string());
            lines.push(body);
        }
        // The bulk API requires the trailing newline
        Ok(lines.join("\n") + "\n")
    }
}

#[async_trait]
impl IndexBackend for HttpIndexBackend {
    async fn bulk_upsert(&self, documents: &[IndexDocument]) -> Result<(), IndexError> {
        if documents.is_empty() {
            return Ok(());
        }

        let body = Self::bulk_body(documents)?;
        let url = format!("{}/_bulk", self.base_url);

        let response = self
            .client
            .post(&url)
            .header("content-type", "application/x-ndjson")
            .body(body)
            .send()
            .await
            .map_err(|e| IndexError::IndexUnavailable(e.to_string()))?;

        let status = response.status();
        if status.is_server_error() || status.as_u16() == 429 {
            return Err(IndexError::IndexUnavailable(format!("{} returned {}", url, status)));
        }
        if !status.is_success() {
            return Err(IndexError::MalformedRequest(format!("{} returned {}", url, status)));
        }

        let summary: serde_json::Value = response
            .json()
            .await
            .map_err(|e| IndexError::IndexUnavailable(e.to_string()))?;

        // Per-item failures: version conflicts are stale-writer losses and
        // fine; anything else makes the bulk retryable.
        if summary.get("errors").and_then(|v| v.as_bool()).unwrap_or(false) {
            let items = summary
                .get("items")
                .and_then(|v| v.as_array())
                .cloned()
                .unwrap_or_default();
            for item in items {
                let status = item
                    .get("index")
                    .and_then(|v| v.get("status"))
                    .and_then(|v| v.as_i64())
                    .unwrap_or(200);
                if status >= 400 && status != 409 {
                    return Err(IndexError::IndexUnavailable(format!(
                        "bulk item failed with status {}",
                        status
                    )));
                }
            }
        }

        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "http"
    }
}
