//! Batch transport abstraction.
//!
//! A transport knows how to hand one chunk to a remote batch service, ask for
//! its status and download the result blob. Provider status strings are
//! mapped onto [`ChunkStatus`] here, at the boundary, so nothing downstream
//! ever sees the provider's vocabulary.

pub mod circuit_breaker;
pub mod openai;
pub mod simulated;

use cbspeech_core::chunker::ChunkRequest;
use cbspeech_core::domain::SubmissionId;
use cbspeech_core::lifecycle::ChunkStatus;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use circuit_breaker::CircuitBreaker;
pub use openai::{OpenAiBatchTransport, OpenAiSettings};
pub use simulated::{SimulatedBehavior, SimulatedTransport};

/// Structured transport failures.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("network unreachable: {0}")]
    Network(String),

    #[error("rate limited by provider (retry after {retry_after_secs}s)")]
    RateLimited { retry_after_secs: u64 },

    #[error("provider rejected the request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("unknown submission '{0}'")]
    UnknownSubmission(String),

    #[error("result not available for '{0}'")]
    ResultUnavailable(String),

    #[error("unexpected provider response: {0}")]
    Response(String),

    #[error("hard stop: provider refused repeated requests (circuit breaker tripped)")]
    CircuitBreakerTripped,
}

/// Status as reported by the provider, already mapped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderStatus {
    pub status: ChunkStatus,
    /// Provider's own status string, kept for the audit log.
    pub raw: String,
    /// Handle of the downloadable result, once there is one.
    pub output_ref: Option<String>,
}

/// One asynchronous batch service.
pub trait BatchTransport: Send + Sync {
    /// Short identifier for logs and summaries.
    fn name(&self) -> &str;

    /// Submit a chunk as one batch job.
    fn submit(&self, chunk: &ChunkRequest) -> Result<SubmissionId, TransportError>;

    /// Query the current status of a submission.
    fn get_status(&self, id: &SubmissionId) -> Result<ProviderStatus, TransportError>;

    /// Download the raw result blob of a completed submission.
    fn download_result(
        &self,
        id: &SubmissionId,
        output_ref: Option<&str>,
    ) -> Result<Vec<u8>, TransportError>;
}

/// Map a provider status string onto [`ChunkStatus`].
pub fn map_provider_status(raw: &str) -> ChunkStatus {
    match raw.trim().to_ascii_lowercase().as_str() {
        "validating" => ChunkStatus::Validating,
        "in_progress" | "finalizing" => ChunkStatus::InProgress,
        "completed" => ChunkStatus::Completed,
        "failed" | "cancelling" | "cancelled" => ChunkStatus::Failed,
        "expired" => ChunkStatus::Expired,
        _ => ChunkStatus::Unknown(raw.to_string()),
    }
}
