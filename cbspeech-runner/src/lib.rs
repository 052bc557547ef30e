//! cbspeech runner: batch orchestration on top of `cbspeech-core`.
//!
//! This crate provides:
//! - Configuration and corpus loading
//! - Batch transports (OpenAI Batch API, deterministic simulation)
//! - Durable lifecycle store with an append-only audit log
//! - Submit / poll / fetch / resume lifecycle management
//! - Result validation, index export (CSV + Parquet) and run reports

pub mod config;
pub mod corpus;
pub mod export;
pub mod lifecycle;
pub mod pipeline;
pub mod report;
pub mod results;
pub mod store;
pub mod transport;

pub use config::{ConfigError, PipelineConfig};
pub use corpus::{load_corpus, CorpusError, CorpusFilter};
pub use export::{index_rows_csv, write_index_tables, write_json_summary};
pub use lifecycle::{BatchLifecycleManager, LifecycleError, ResumePlan, SweepReport};
pub use pipeline::{
    advance_results, advance_submissions, plan_run, refresh_status, wait_for_completion,
    PipelineError, ResultsOutcome, RunContext, SubmissionOutcome,
};
pub use report::{generate_report, LifecycleSummary, RunSummary, ValidationSummary};
pub use results::{validate_chunk_output, ChunkOutcome, RejectedOutput};
pub use store::{AuditEntry, LifecycleStore, PlanManifest, StoreError};
pub use transport::{
    BatchTransport, CircuitBreaker, OpenAiBatchTransport, OpenAiSettings, ProviderStatus,
    SimulatedBehavior, SimulatedTransport, TransportError,
};
