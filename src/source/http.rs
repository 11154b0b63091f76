//! HTTP collector for page-view hits
//!
//! Polls a JSON-over-HTTP endpoint exposing page-view counts, e.g.
//! `GET {base_url}?since=1700000000&limit=500` returning an array of hit
//! objects. The watermark is the `occurred_at` epoch second of the newest
//! committed hit; the endpoint is expected to deliver at-least-once past a
//! given `since`, which the idempotency key downstream absorbs.

use super::{CorruptPayload, FetchError, FetchPage, RawPayload, SourceCollector, Watermark};
use async_trait::async_trait;
use std::time::Duration;

pub struct HttpCollector {
    source_id: String,
    base_url: String,
    client: reqwest::Client,
}

impl HttpCollector {
    pub fn new(source_id: impl Into<String>, base_url: impl Into<String>) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| FetchError::SourceUnavailable(e.to_string()))?;
        Ok(Self {
            source_id: source_id.into(),
            base_url: base_url.into(),
            client,
        })
    }
}

#[async_trait]
impl SourceCollector for HttpCollector {
    async fn fetch(&self, since: Watermark, limit: usize) -> Result<FetchPage, FetchError> {
        let url = format!(
            "{}?since={}&limit={}",
            self.base_url,
            since.position(),
            limit
        );

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| FetchError::SourceUnavailable(e.to_string()))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(FetchError::SourceUnavailable(format!(
                "{} returned {}",
                self.base_url, status
            )));
        }
        if !status.is_success() {
            return Err(FetchError::SourceCorrupt(format!(
                "{} returned {}",
                self.base_url, status
            )));
        }

        let items: Vec<serde_json::Value> = response
            .json()
            .await
            .map_err(|e| FetchError::SourceCorrupt(format!("response not a JSON array: {}", e)))?;

        let item_count = items.len();
        let mut page = FetchPage::empty(since);
        let mut max_seen = since.position();

        for item in items {
            let occurred_at = item.get("occurred_at").and_then(|v| v.as_i64());
            match occurred_at {
                Some(ts) if item.is_object() => {
                    max_seen = max_seen.max(ts);
                    page.payloads.push(RawPayload {
                        source_id: self.source_id.clone(),
                        position: ts,
                        body: item.to_string(),
                    });
                }
                _ => {
                    page.corrupt.push(CorruptPayload {
                        source_id: self.source_id.clone(),
                        position: since.position(),
                        body: item.to_string(),
                        reason: "missing or non-integer occurred_at".to_string(),
                    });
                }
            }
        }

        page.next_watermark = Watermark(max_seen);
        page.has_more = item_count >= limit;
        Ok(page)
    }

    fn collector_type(&self) -> &'static str {
        "http"
    }
}
