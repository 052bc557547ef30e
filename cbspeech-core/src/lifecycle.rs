//! Per-chunk batch lifecycle state machine.
//!
//! ```text
//! not_submitted ──submit──▶ validating ──▶ in_progress ──▶ completed
//!       │                       │               │      └──▶ failed
//!       └──rejected──▶ failed   └───────────────┴────────▶ expired
//! ```
//!
//! Provider statuses outside the known vocabulary become `Unknown` and stay
//! that way until a later poll maps them onto a known state. Terminal states
//! never transition again; resubmission starts a new attempt and moves the
//! superseded one into `history`.

use crate::domain::SubmissionId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Status of one chunk's current submission.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStatus {
    NotSubmitted,
    Validating,
    InProgress,
    Completed,
    Failed,
    Expired,
    /// Provider reported a status we do not recognise; needs operator attention.
    Unknown(String),
}

impl ChunkStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ChunkStatus::Completed | ChunkStatus::Failed | ChunkStatus::Expired
        )
    }

    /// Eligible for (re)submission under the default policy.
    pub fn needs_submission(&self) -> bool {
        matches!(
            self,
            ChunkStatus::NotSubmitted | ChunkStatus::Failed | ChunkStatus::Expired
        )
    }

    /// Submitted and not yet terminal.
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            ChunkStatus::Validating | ChunkStatus::InProgress | ChunkStatus::Unknown(_)
        )
    }

    pub fn can_transition_to(&self, next: &ChunkStatus) -> bool {
        use ChunkStatus::*;
        match (self, next) {
            (NotSubmitted, Validating | Failed) => true,
            (NotSubmitted, _) => false,
            (Completed | Failed | Expired, _) => false,
            (_, NotSubmitted) => false,
            (Validating | Unknown(_), _) => true,
            (InProgress, Validating) => false,
            (InProgress, _) => true,
        }
    }

    /// Short label used in summaries and file output.
    pub fn label(&self) -> &str {
        match self {
            ChunkStatus::NotSubmitted => "not_submitted",
            ChunkStatus::Validating => "validating",
            ChunkStatus::InProgress => "in_progress",
            ChunkStatus::Completed => "completed",
            ChunkStatus::Failed => "failed",
            ChunkStatus::Expired => "expired",
            ChunkStatus::Unknown(_) => "unknown",
        }
    }
}

impl fmt::Display for ChunkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChunkStatus::Unknown(raw) => write!(f, "unknown({raw})"),
            other => f.write_str(other.label()),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("chunk {chunk_index}: illegal transition {from} -> {to}")]
    Illegal {
        chunk_index: usize,
        from: ChunkStatus,
        to: ChunkStatus,
    },

    #[error("chunk {chunk_index}: cannot submit while {status}")]
    NotSubmittable {
        chunk_index: usize,
        status: ChunkStatus,
    },
}

/// A superseded submission, kept for audit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionAttempt {
    pub submission_id: Option<SubmissionId>,
    pub status: ChunkStatus,
    pub submitted_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// Lifecycle record of one chunk. Persisted after every mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkLifecycleState {
    pub chunk_index: usize,
    pub submission_id: Option<SubmissionId>,
    pub status: ChunkStatus,
    pub num_requests: usize,
    pub submitted_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_polled_at: Option<DateTime<Utc>>,
    /// Last transport error (rejection or fetch failure).
    #[serde(default)]
    pub error: Option<String>,
    /// Provider handle for the result content, known once completed.
    #[serde(default)]
    pub output_ref: Option<String>,
    #[serde(default)]
    pub fetch_attempts: u32,
    #[serde(default)]
    pub history: Vec<SubmissionAttempt>,
}

impl ChunkLifecycleState {
    pub fn not_submitted(chunk_index: usize, num_requests: usize) -> Self {
        Self {
            chunk_index,
            submission_id: None,
            status: ChunkStatus::NotSubmitted,
            num_requests,
            submitted_at: None,
            completed_at: None,
            last_polled_at: None,
            error: None,
            output_ref: None,
            fetch_attempts: 0,
            history: Vec::new(),
        }
    }

    /// Record an accepted submission. A previous attempt, if any, moves to `history`.
    pub fn record_submission(
        &mut self,
        submission_id: SubmissionId,
        at: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        if !self.status.needs_submission() {
            return Err(TransitionError::NotSubmittable {
                chunk_index: self.chunk_index,
                status: self.status.clone(),
            });
        }
        if self.submission_id.as_ref() == Some(&submission_id) {
            // A dead identifier is never reused.
            return Err(TransitionError::Illegal {
                chunk_index: self.chunk_index,
                from: self.status.clone(),
                to: ChunkStatus::Validating,
            });
        }
        self.archive_attempt();
        self.submission_id = Some(submission_id);
        self.status = ChunkStatus::Validating;
        self.submitted_at = Some(at);
        Ok(())
    }

    /// Record a submission the transport refused. The chunk stays resubmittable.
    pub fn record_rejection(
        &mut self,
        error: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        if !self.status.needs_submission() {
            return Err(TransitionError::NotSubmittable {
                chunk_index: self.chunk_index,
                status: self.status.clone(),
            });
        }
        self.archive_attempt();
        self.status = ChunkStatus::Failed;
        self.submitted_at = Some(at);
        self.completed_at = Some(at);
        self.error = Some(error.into());
        Ok(())
    }

    /// Apply a polled status. Returns whether the status changed.
    ///
    /// Re-applying the current status only refreshes `last_polled_at`.
    pub fn apply_status(
        &mut self,
        next: ChunkStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, TransitionError> {
        if next == self.status {
            self.last_polled_at = Some(at);
            return Ok(false);
        }
        if !self.status.can_transition_to(&next) {
            return Err(TransitionError::Illegal {
                chunk_index: self.chunk_index,
                from: self.status.clone(),
                to: next,
            });
        }
        if next.is_terminal() {
            self.completed_at = Some(at);
        }
        self.status = next;
        self.last_polled_at = Some(at);
        Ok(true)
    }

    /// Move the live attempt (if there was one) into history and clear per-attempt fields.
    fn archive_attempt(&mut self) {
        if self.submission_id.is_some() || self.status != ChunkStatus::NotSubmitted {
            self.history.push(SubmissionAttempt {
                submission_id: self.submission_id.take(),
                status: self.status.clone(),
                submitted_at: self.submitted_at,
                completed_at: self.completed_at,
                error: self.error.take(),
            });
        }
        self.submitted_at = None;
        self.completed_at = None;
        self.last_polled_at = None;
        self.output_ref = None;
        self.fetch_attempts = 0;
    }
}
