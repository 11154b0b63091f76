//! Pipeline runtime binary
//!
//! Wires configured sources into the ingestion runtime and runs until
//! SIGINT. Sources are enabled by pointing their environment variable at
//! an input:
//!
//!   STATFLOW_HITS_URL       - page-view events HTTP endpoint
//!   STATFLOW_DOWNLOADS_PATH - download counts JSONL dump
//!   STATFLOW_PAYMENTS_DB    - payments transaction SQLite database
//!
//! `STATFLOW_INDEX_URL` selects the HTTP bulk index backend; without it
//! the process runs with an in-memory index, which is useful for local
//! runs and smoke tests. `STATFLOW_BACKFILL=source=position,...` rewinds
//! watermarks once at startup.

use statflow::aggregate::MergePolicyTable;
use statflow::config::RuntimeConfig;
use statflow::index::{HttpIndexBackend, IndexBackend, IndexProjector, MemoryIndexBackend};
use statflow::normalize::SourceKind;
use statflow::pipeline::PipelineRuntime;
use statflow::source::{CollectorRegistry, HttpCollector, JsonlCollector, SqliteCollector};
use statflow::store::{DeadLetterLog, DurableStore};
use std::sync::Arc;

fn build_registry(config: &RuntimeConfig) -> CollectorRegistry {
    let mut registry = CollectorRegistry::new();

    if let Some(url) = &config.hits_url {
        match HttpCollector::new("hits", url.clone()) {
            Ok(collector) => {
                registry.register("hits", SourceKind::PageViews, Arc::new(collector))
            }
            Err(e) => log::error!("❌ Skipping 'hits' source: {}", e),
        }
    }

    if let Some(path) = &config.downloads_path {
        registry.register(
            "downloads",
            SourceKind::Downloads,
            Arc::new(JsonlCollector::new("downloads", path.clone())),
        );
    }

    if let Some(path) = &config.payments_db_path {
        match SqliteCollector::new("payments", path.clone()) {
            Ok(collector) => {
                registry.register("payments", SourceKind::Payments, Arc::new(collector))
            }
            Err(e) => log::error!("❌ Skipping 'payments' source: {}", e),
        }
    }

    registry
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    // NOTE: Workaround for rustls issue
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .expect("Can't set crypto provider to aws_lc_rs");

    let config = RuntimeConfig::from_env();
    log::info!("🚀 Starting statflow pipeline runtime...");
    log::info!("📊 Configuration:");
    log::info!("   Archive: {}", config.db_path);
    log::info!("   Dead letters: {}", config.dead_letter_path);
    log::info!(
        "   Index: {}",
        config.index_url.as_deref().unwrap_or("(in-memory)")
    );

    let store = Arc::new(DurableStore::new(&config.db_path)?);
    let dead_letters = Arc::new(DeadLetterLog::new(&config.dead_letter_path)?);

    let backend: Arc<dyn IndexBackend> = match &config.index_url {
        Some(url) => Arc::new(HttpIndexBackend::new(url.clone())?),
        None => Arc::new(MemoryIndexBackend::new()),
    };
    let projector = Arc::new(IndexProjector::new(
        store.clone(),
        backend.clone(),
        config.projection_max_retry_passes,
        config.retry_initial_ms,
    ));

    let policies = MergePolicyTable::parse(&config.merge_policies);

    let registry = build_registry(&config);
    if registry.is_empty() {
        log::error!("❌ No sources configured, nothing to do");
        return Err("no sources configured".into());
    }

    // Operator backfill: rewind persisted cursors before pipelines seed.
    // Reprocessing is duplicate-free, replayed records reproduce their
    // idempotency keys.
    for (source_id, position) in config.backfill_resets() {
        store.reset_watermark(&source_id, position)?;
        log::info!("⏪ Backfill: reset '{}' to position {}", source_id, position);
    }

    let runtime = PipelineRuntime::start(
        registry,
        store,
        backend,
        projector,
        dead_letters,
        policies,
        config.runtime_options(),
    );

    tokio::signal::ctrl_c().await?;
    runtime.shutdown().await;
    Ok(())
}
