//! statflow - usage statistics aggregation pipeline
//!
//! Pulls raw usage events from heterogeneous sources (HTTP feeds, JSONL
//! dumps, SQLite transaction tables), normalizes them into one metric
//! record shape, batches and merges them, commits them to a durable
//! SQLite archive, and projects day-bucket rollups into a best-effort
//! query index. The archive is the source of truth; the index is
//! disposable and continuously repairable from it.

pub mod aggregate;
pub mod config;
pub mod index;
pub mod normalize;
pub mod pipeline;
pub mod record;
pub mod source;
pub mod sqlite_pragma;
pub mod store;
