//! Ingestion pipeline: per-source state machines and the process runtime
//!
//! - `state` - source state machine, status reporting
//! - `backoff` - exponential retry with jitter
//! - `coordinator` - one source's fetch→normalize→batch→commit→project cycle
//! - `runtime` - task spawning, backlog repair, status reports, shutdown

pub mod backoff;
pub mod coordinator;
pub mod runtime;
pub mod state;

pub use backoff::ExponentialBackoff;
pub use coordinator::{CycleOutcome, PipelineSettings, SourcePipeline};
pub use runtime::{PipelineRuntime, RuntimeOptions};
pub use state::{SourceState, SourceStatus, StatusBoard};
