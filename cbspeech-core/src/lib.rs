//! cbspeech core: domain types and the pure parts of the sentiment pipeline.
//!
//! - Domain types (speeches, sentiment records, daily index rows)
//! - Token estimation and greedy request chunking
//! - Prompt construction
//! - Per-chunk batch lifecycle state machine
//! - Model output validation with an error taxonomy
//! - Daily aggregation into forward-filled and sparse indices
//!
//! Nothing here performs I/O; the runner crate owns transports and storage.

pub mod aggregate;
pub mod chunker;
pub mod domain;
pub mod fingerprint;
pub mod lifecycle;
pub mod prompt;
pub mod tokens;
pub mod validate;

pub use aggregate::{build_indices, diffusion_index, join_records, JoinOutcome, ScoredSpeech};
pub use chunker::{
    pack_items, ChunkItem, ChunkLimits, ChunkOversizeWarning, ChunkPlan, ChunkRequest,
    ChunkerError, RequestChunker,
};
pub use domain::{
    DailyIndexRow, IndexTables, Institution, MarketDimension, MarketImpact, SentimentRecord,
    SpeechRecord, SubmissionId,
};
pub use fingerprint::{plan_fingerprint, PlanHash};
pub use lifecycle::{ChunkLifecycleState, ChunkStatus, SubmissionAttempt, TransitionError};
pub use prompt::{PromptBuilder, PromptPayload, PROMPT_VERSION};
pub use tokens::{CharRatioEstimator, TokenEstimator};
pub use validate::{
    parse_and_validate, ValidationError, ValidationErrorKind, ValidationReport,
};
