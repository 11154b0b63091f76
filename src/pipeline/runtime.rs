//! Process-level runtime: one task per source plus shared housekeeping
//!
//! The runtime spawns an independent [`SourcePipeline`] task for every
//! registered source, a periodic backlog repair task, and a periodic
//! status report task. Shutdown is cooperative via a watch channel and
//! lands between cycles, so an in-flight commit always completes.

use super::coordinator::{PipelineSettings, SourcePipeline};
use super::state::StatusBoard;
use crate::aggregate::MergePolicyTable;
use crate::index::{IndexBackend, IndexProjector, Reconciler};
use crate::source::CollectorRegistry;
use crate::store::{DeadLetterLog, DurableStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    pub settings: PipelineSettings,
    pub repair_interval_ms: u64,
    pub repair_claim_limit: usize,
    pub stale_claim_secs: i64,
    pub status_interval_ms: u64,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            settings: PipelineSettings::default(),
            repair_interval_ms: 60_000,
            repair_claim_limit: 50,
            stale_claim_secs: 600,
            status_interval_ms: 30_000,
        }
    }
}

pub struct PipelineRuntime {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    board: StatusBoard,
}

impl PipelineRuntime {
    /// Spawn all runtime tasks. Returns immediately; call
    /// [`PipelineRuntime::shutdown`] to stop them.
    pub fn start(
        registry: CollectorRegistry,
        store: Arc<DurableStore>,
        backend: Arc<dyn IndexBackend>,
        projector: Arc<IndexProjector>,
        dead_letters: Arc<DeadLetterLog>,
        policies: MergePolicyTable,
        options: RuntimeOptions,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let board = StatusBoard::new();
        let mut tasks = Vec::new();

        log::info!(
            "🚀 Starting pipeline runtime with {} sources (index backend: {})",
            registry.len(),
            backend.backend_type()
        );

        for entry in registry.sources() {
            let pipeline = SourcePipeline::new(
                entry,
                store.clone(),
                projector.clone(),
                dead_letters.clone(),
                policies.clone(),
                options.settings.clone(),
                board.clone(),
            );
            tasks.push(tokio::spawn(pipeline.run(shutdown_rx.clone())));
        }

        tasks.push(Self::spawn_repair_task(
            store.clone(),
            backend,
            &options,
            shutdown_rx.clone(),
        ));
        tasks.push(Self::spawn_status_task(
            store,
            board.clone(),
            options.status_interval_ms,
            shutdown_rx,
        ));

        Self {
            shutdown: shutdown_tx,
            tasks,
            board,
        }
    }

    pub fn board(&self) -> StatusBoard {
        self.board.clone()
    }

    fn spawn_repair_task(
        store: Arc<DurableStore>,
        backend: Arc<dyn IndexBackend>,
        options: &RuntimeOptions,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let reconciler = Reconciler::new(
            store,
            backend,
            options.repair_claim_limit,
            options.stale_claim_secs,
        );
        let period = Duration::from_millis(options.repair_interval_ms);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        match reconciler.run_repair_pass().await {
                            Ok(stats) if stats.repaired + stats.failed > 0 => {
                                log::info!(
                                    "🔧 Repair pass done: {} repaired, {} re-queued",
                                    stats.repaired,
                                    stats.failed
                                );
                            }
                            Ok(_) => {}
                            Err(e) => log::error!("❌ Repair pass failed: {}", e),
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }

    fn spawn_status_task(
        store: Arc<DurableStore>,
        board: StatusBoard,
        status_interval_ms: u64,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let period = Duration::from_millis(status_interval_ms);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // Skip the immediate first tick so the report reflects real work
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        for status in board.snapshot() {
                            log::info!(
                                "📊 [{}] {} | watermark={} cycles={} committed={} deduped={} dead_letters={}{}",
                                status.source_id,
                                status.state.label(),
                                status.watermark,
                                status.cycles,
                                status.records_committed,
                                status.records_deduplicated,
                                status.dead_letters,
                                status
                                    .last_error
                                    .as_deref()
                                    .map(|e| format!(" last_error={}", e))
                                    .unwrap_or_default()
                            );
                        }
                        match store.backlog_depth() {
                            Ok(depth) if depth > 0 => {
                                log::info!("📊 Index backlog depth: {}", depth)
                            }
                            Ok(_) => {}
                            Err(e) => log::warn!("⚠️ Backlog depth unavailable: {}", e),
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }

    /// Signal all tasks and wait for them to stop.
    pub async fn shutdown(self) {
        log::info!("🛑 Shutting down pipeline runtime");
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                log::warn!("⚠️ Runtime task ended abnormally: {}", e);
            }
        }
        log::info!("✅ Pipeline runtime stopped");
    }
}
