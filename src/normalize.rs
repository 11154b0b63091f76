//! Payload normalization into canonical Records
//!
//! One schema per source kind. `normalize` is a pure function: the Record it
//! yields (idempotency key included) depends only on the payload content, so
//! re-delivery of the same raw payload always reproduces the same Record.

use crate::record::Record;
use crate::source::RawPayload;
use serde::Deserialize;

/// Payload schema a source's items are normalized with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    PageViews,
    Downloads,
    Payments,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::PageViews => "pageviews",
            SourceKind::Downloads => "downloads",
            SourceKind::Payments => "payments",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pageviews" => Some(SourceKind::PageViews),
            "downloads" => Some(SourceKind::Downloads),
            "payments" => Some(SourceKind::Payments),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub enum NormalizeError {
    /// Unknown field shape; payload is dead-lettered
    SchemaMismatch(String),
    /// Unrecognized unit/currency; payload is dead-lettered
    UnitConversionFailure(String),
}

impl std::fmt::Display for NormalizeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NormalizeError::SchemaMismatch(msg) => write!(f, "schema mismatch: {}", msg),
            NormalizeError::UnitConversionFailure(msg) => {
                write!(f, "unit conversion failure: {}", msg)
            }
        }
    }
}

impl std::error::Error for NormalizeError {}

/// Payment settlement rates into USD. Unknown currencies are rejected, not
/// guessed; the payload is dead-lettered until the table learns the rate.
const CURRENCY_RATES_USD: &[(&str, f64)] = &[
    ("USD", 1.0),
    ("EUR", 1.08),
    ("GBP", 1.27),
    ("JPY", 0.0067),
    ("BRL", 0.20),
];

fn usd_rate(currency: &str) -> Option<f64> {
    CURRENCY_RATES_USD
        .iter()
        .find(|(code, _)| *code == currency)
        .map(|(_, rate)| *rate)
}

#[derive(Deserialize)]
struct PageViewPayload {
    page: String,
    occurred_at: i64,
    #[serde(default = "default_count")]
    count: f64,
}

#[derive(Deserialize)]
struct DownloadPayload {
    app_uuid: String,
    downloads_count: f64,
    date: String,
}

#[derive(Deserialize)]
struct PaymentPayload {
    txn_id: String,
    app_uuid: String,
    amount: f64,
    currency: String,
    #[serde(default = "default_revision")]
    revision: i64,
    created_at: i64,
}

fn default_count() -> f64 {
    1.0
}

fn default_revision() -> i64 {
    1
}

/// Map one raw payload into a Record.
///
/// Page views and downloads are immutable facts: their identity is the whole
/// payload body and they always carry ingest_version 1. Payments are
/// re-statable: identity is the upstream transaction id and the `revision`
/// field becomes ingest_version, so a corrected amount arrives under the
/// same idempotency key at a higher version.
pub fn normalize(kind: SourceKind, payload: &RawPayload) -> Result<Record, NormalizeError> {
    match kind {
        SourceKind::PageViews => {
            let hit: PageViewPayload = serde_json::from_str(&payload.body)
                .map_err(|e| NormalizeError::SchemaMismatch(e.to_string()))?;
            if hit.page.is_empty() {
                return Err(NormalizeError::SchemaMismatch("empty page".to_string()));
            }
            let metric_key = format!("page.views.{}", hit.page.trim_matches('/'));
            let idempotency_key = Record::idempotency_key_for(
                &payload.source_id,
                &metric_key,
                hit.occurred_at,
                &payload.body,
            );
            Ok(Record {
                source_id: payload.source_id.clone(),
                metric_key,
                timestamp: hit.occurred_at,
                value: hit.count,
                idempotency_key,
                ingest_version: 1,
            })
        }
        SourceKind::Downloads => {
            let dump: DownloadPayload = serde_json::from_str(&payload.body)
                .map_err(|e| NormalizeError::SchemaMismatch(e.to_string()))?;
            let date = chrono::NaiveDate::parse_from_str(&dump.date, "%Y-%m-%d")
                .map_err(|e| NormalizeError::SchemaMismatch(format!("date '{}': {}", dump.date, e)))?;
            let timestamp = date
                .and_hms_opt(0, 0, 0)
                .expect("midnight is always valid")
                .and_utc()
                .timestamp();
            let metric_key = format!("app.{}.downloads", dump.app_uuid);
            let idempotency_key = Record::idempotency_key_for(
                &payload.source_id,
                &metric_key,
                timestamp,
                &payload.body,
            );
            Ok(Record {
                source_id: payload.source_id.clone(),
                metric_key,
                timestamp,
                value: dump.downloads_count,
                idempotency_key,
                ingest_version: 1,
            })
        }
        SourceKind::Payments => {
            let txn: PaymentPayload = serde_json::from_str(&payload.body)
                .map_err(|e| NormalizeError::SchemaMismatch(e.to_string()))?;
            let rate = usd_rate(&txn.currency).ok_or_else(|| {
                NormalizeError::UnitConversionFailure(format!(
                    "unknown currency '{}'",
                    txn.currency
                ))
            })?;
            let metric_key = format!("app.{}.revenue", txn.app_uuid);
            let idempotency_key = Record::idempotency_key_for(
                &payload.source_id,
                &metric_key,
                txn.created_at,
                &txn.txn_id,
            );
            Ok(Record {
                source_id: payload.source_id.clone(),
                metric_key,
                timestamp: txn.created_at,
                value: txn.amount * rate,
                idempotency_key,
                ingest_version: txn.revision,
            })
        }
    }
}
