//! Per-source pipeline coordination
//!
//! One [`SourcePipeline`] per configured source drives the cycle
//! fetch → normalize → batch → commit → project, owns the source's
//! watermark, and advances the state machine in `state.rs`. Pipelines are
//! fully independent: a failing source backs off or dies alone, sibling
//! sources never notice.
//!
//! Within one source, commits are strictly ordered: the pipeline is a
//! single sequential task, so a batch can never commit before its
//! predecessor's commit was acknowledged.

use super::backoff::ExponentialBackoff;
use super::state::{RetryStage, SourceState, SourceStatus, StatusBoard};
use crate::aggregate::{Aggregator, MergePolicyTable};
use crate::index::IndexProjector;
use crate::normalize::normalize;
use crate::source::{FetchError, FetchPage, SourceEntry, Watermark};
use crate::store::{DeadLetterLog, DurableStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Tuning for one source pipeline; shared defaults come from config.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub fetch_page_size: usize,
    pub max_batch_size: usize,
    pub batch_flush_interval_ms: u64,
    pub poll_interval_ms: u64,
    pub fetch_retry_initial_ms: u64,
    pub fetch_retry_max_ms: u64,
    pub fetch_max_retries: u32,
    pub commit_retry_initial_ms: u64,
    pub commit_retry_max_ms: u64,
    pub commit_max_retries: u32,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            fetch_page_size: 500,
            max_batch_size: 1000,
            batch_flush_interval_ms: 5_000,
            poll_interval_ms: 10_000,
            fetch_retry_initial_ms: 1_000,
            fetch_retry_max_ms: 60_000,
            fetch_max_retries: 5,
            commit_retry_initial_ms: 1_000,
            commit_retry_max_ms: 60_000,
            commit_max_retries: 5,
        }
    }
}

/// What one cycle accomplished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// A batch was durably committed; `has_more` asks for an immediate
    /// follow-up cycle instead of waiting out the poll interval
    Committed { written: usize, has_more: bool },
    /// Nothing to do, or the cycle was abandoned without advancing state
    Idle,
    /// Commit retry budget exhausted; the source needs an operator reset
    Dead,
}

pub struct SourcePipeline {
    entry: SourceEntry,
    store: Arc<DurableStore>,
    projector: Arc<IndexProjector>,
    dead_letters: Arc<DeadLetterLog>,
    policies: MergePolicyTable,
    settings: PipelineSettings,
    board: StatusBoard,
    state: SourceState,
    watermark: Watermark,
    status: SourceStatus,
}

impl SourcePipeline {
    pub fn new(
        entry: SourceEntry,
        store: Arc<DurableStore>,
        projector: Arc<IndexProjector>,
        dead_letters: Arc<DeadLetterLog>,
        policies: MergePolicyTable,
        settings: PipelineSettings,
        board: StatusBoard,
    ) -> Self {
        let status = SourceStatus::new(entry.source_id.clone());
        Self {
            entry,
            store,
            projector,
            dead_letters,
            policies,
            settings,
            board,
            state: SourceState::Idle,
            watermark: Watermark::epoch(),
            status,
        }
    }

    pub fn state(&self) -> SourceState {
        self.state
    }

    pub fn watermark(&self) -> Watermark {
        self.watermark
    }

    fn set_state(&mut self, state: SourceState) {
        if state != self.state {
            log::debug!(
                "🔁 [{}] {} → {}",
                self.entry.source_id,
                self.state.label(),
                state.label()
            );
        }
        self.state = state;
        self.publish();
    }

    fn publish(&mut self) {
        self.status.state = self.state;
        self.status.watermark = self.watermark.position();
        self.board.publish(self.status.clone());
    }

    /// Seed the watermark from the last durably persisted position.
    pub fn seed(&mut self) -> Result<(), crate::store::StoreError> {
        self.watermark = self
            .store
            .watermark(&self.entry.source_id)?
            .unwrap_or_else(Watermark::epoch);
        log::info!(
            "🚀 [{}] pipeline seeded at watermark {}",
            self.entry.source_id,
            self.watermark.position()
        );
        self.publish();
        Ok(())
    }

    /// Operator backfill: rewind the persisted cursor and revive the
    /// pipeline. Reprocessing the overlap is duplicate-free because
    /// replayed payloads reproduce their idempotency keys.
    pub fn reset_for_backfill(&mut self, position: i64) -> Result<(), crate::store::StoreError> {
        self.store
            .reset_watermark(&self.entry.source_id, position)?;
        self.watermark = Watermark(position);
        self.status.last_error = None;
        self.set_state(SourceState::Idle);
        Ok(())
    }

    async fn fetch_with_retry(&mut self) -> Option<FetchPage> {
        let mut backoff = ExponentialBackoff::new(
            self.settings.fetch_retry_initial_ms,
            self.settings.fetch_retry_max_ms,
            self.settings.fetch_max_retries,
        );
        loop {
            self.set_state(SourceState::Fetching);
            match self
                .entry
                .collector
                .fetch(self.watermark, self.settings.fetch_page_size)
                .await
            {
                Ok(page) => return Some(page),
                Err(FetchError::SourceCorrupt(msg)) => {
                    // The whole page is unusable; skip this cycle without
                    // advancing the watermark
                    log::error!("❌ [{}] corrupt fetch: {}", self.entry.source_id, msg);
                    self.status.last_error = Some(format!("source corrupt: {}", msg));
                    return None;
                }
                Err(FetchError::SourceUnavailable(msg)) => {
                    self.status.last_error = Some(format!("source unavailable: {}", msg));
                    self.set_state(SourceState::Backoff {
                        from: RetryStage::Fetching,
                        attempt: backoff.attempt() + 1,
                    });
                    if backoff.sleep().await.is_err() {
                        log::error!(
                            "❌ [{}] source unavailable after {} retries, waiting for next poll",
                            self.entry.source_id,
                            self.settings.fetch_max_retries
                        );
                        return None;
                    }
                }
            }
        }
    }

    /// Run one full cycle of the state machine.
    pub async fn run_cycle(&mut self) -> CycleOutcome {
        if self.state.is_dead() {
            return CycleOutcome::Dead;
        }
        self.status.cycles += 1;

        let mut aggregator = Aggregator::new(
            self.entry.source_id.clone(),
            self.policies.clone(),
            self.settings.max_batch_size,
            Duration::from_millis(self.settings.batch_flush_interval_ms),
        );
        let mut next_watermark = self.watermark;
        let mut has_more = false;

        // FETCHING/NORMALIZING/BATCHING, possibly over several pages until
        // the batch wants flushing
        loop {
            let Some(page) = self.fetch_with_retry().await else {
                // Abandoned cycle: nothing committed, watermark untouched,
                // the same data is re-fetched next poll
                self.set_state(SourceState::Idle);
                return CycleOutcome::Idle;
            };

            for corrupt in &page.corrupt {
                self.dead_letters.record_corrupt(corrupt);
                self.status.dead_letters += 1;
            }

            self.set_state(SourceState::Normalizing);
            for payload in &page.payloads {
                match normalize(self.entry.kind, payload) {
                    Ok(record) => aggregator.admit(record),
                    Err(e) => {
                        self.dead_letters.record_rejected(payload, &e);
                        self.status.dead_letters += 1;
                    }
                }
            }

            self.set_state(SourceState::Batching);
            next_watermark = next_watermark.max(page.next_watermark);
            has_more = page.has_more;
            if !page.has_more || aggregator.should_flush() {
                break;
            }
        }

        if aggregator.is_empty() && next_watermark == self.watermark {
            self.set_state(SourceState::Idle);
            return CycleOutcome::Idle;
        }

        // An all-dead-letter page still commits: the (empty) batch advances
        // the watermark past the set-aside items
        let batch = aggregator.seal(next_watermark);

        // COMMITTING: the batch is retried as a unit; exhaustion is fatal
        // for this source only
        let mut backoff = ExponentialBackoff::new(
            self.settings.commit_retry_initial_ms,
            self.settings.commit_retry_max_ms,
            self.settings.commit_max_retries,
        );
        let summary = loop {
            self.set_state(SourceState::Committing);
            match self.store.commit(&batch) {
                Ok(summary) => break summary,
                Err(e) => {
                    log::warn!("⚠️ [{}] commit failed: {}", self.entry.source_id, e);
                    self.status.last_error = Some(e.to_string());
                    self.set_state(SourceState::Backoff {
                        from: RetryStage::Committing,
                        attempt: backoff.attempt() + 1,
                    });
                    if backoff.sleep().await.is_err() {
                        log::error!(
                            "💀 [{}] commit retry budget exhausted; source is DEAD until reset",
                            self.entry.source_id
                        );
                        self.set_state(SourceState::Dead);
                        return CycleOutcome::Dead;
                    }
                }
            }
        };

        self.watermark = batch.next_watermark;
        self.status.records_committed += summary.written as u64;
        self.status.records_deduplicated += summary.deduplicated as u64;
        self.status.last_error = None;

        // PROJECTING is fire-and-forget relative to this state machine: it
        // runs on its own task and its failures degrade to the backlog
        self.set_state(SourceState::Projecting);
        if !batch.is_empty() {
            let projector = self.projector.clone();
            tokio::spawn(async move {
                projector.project(&batch).await;
            });
        }

        self.set_state(SourceState::Idle);
        CycleOutcome::Committed {
            written: summary.written,
            has_more,
        }
    }

    /// Drive cycles until shutdown or death. Cancellation lands between
    /// cycles only; an in-flight commit always runs to completion or
    /// defined failure.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        if let Err(e) = self.seed() {
            log::error!(
                "❌ [{}] cannot seed watermark, pipeline not started: {}",
                self.entry.source_id,
                e
            );
            self.status.last_error = Some(e.to_string());
            self.set_state(SourceState::Dead);
            return;
        }

        let poll = Duration::from_millis(self.settings.poll_interval_ms);
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.run_cycle().await {
                CycleOutcome::Dead => break,
                CycleOutcome::Committed { has_more: true, .. } => continue,
                _ => {
                    tokio::select! {
                        _ = tokio::time::sleep(poll) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }
        log::info!("✅ [{}] pipeline stopped", self.entry.source_id);
    }
}
