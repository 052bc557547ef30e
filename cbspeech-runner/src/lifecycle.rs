//! Batch lifecycle manager: submit, poll, fetch and resume chunks.
//!
//! The manager is the only writer of [`ChunkLifecycleState`]. Every mutation
//! is persisted through the [`LifecycleStore`] before the call returns, with
//! a matching line in the audit log, so a crash at any point resumes from
//! the last recorded state.

use crate::store::{AuditEntry, LifecycleStore, StoreError};
use crate::transport::{BatchTransport, TransportError};
use cbspeech_core::chunker::ChunkRequest;
use cbspeech_core::lifecycle::{ChunkLifecycleState, ChunkStatus, TransitionError};
use chrono::Utc;
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

/// Downloads attempted before a fetch failure is surfaced.
pub const FETCH_ATTEMPTS: u32 = 2;

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("chunk {chunk_index}: submission failed: {source}")]
    Submission {
        chunk_index: usize,
        source: TransportError,
    },

    #[error("chunk {chunk_index}: fetch failed after {attempts} attempts: {message}")]
    Fetch {
        chunk_index: usize,
        attempts: u32,
        message: String,
    },

    #[error("chunk {chunk_index}: status query failed: {source}")]
    Poll {
        chunk_index: usize,
        source: TransportError,
    },

    #[error("chunk {chunk_index}: result requested while {status}")]
    NotCompleted {
        chunk_index: usize,
        status: ChunkStatus,
    },

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Where each chunk stands after a restart.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResumePlan {
    /// Still in flight; keep polling.
    pub to_poll: Vec<ChunkLifecycleState>,
    /// Completed; download the result.
    pub to_fetch: Vec<ChunkLifecycleState>,
    /// Never submitted, failed or expired; submit under a new id.
    pub to_resubmit: Vec<ChunkLifecycleState>,
    /// Chunks in an unrecognised provider status.
    pub needs_attention: Vec<usize>,
}

/// Counts from one polling pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub polled: usize,
    pub changed: usize,
    pub errors: usize,
}

pub struct BatchLifecycleManager<'a> {
    transport: &'a dyn BatchTransport,
    store: &'a LifecycleStore,
}

impl<'a> BatchLifecycleManager<'a> {
    pub fn new(transport: &'a dyn BatchTransport, store: &'a LifecycleStore) -> Self {
        Self { transport, store }
    }

    fn persist(
        &self,
        state: &ChunkLifecycleState,
        event: &str,
        from: ChunkStatus,
        detail: Option<String>,
    ) -> Result<(), StoreError> {
        let entry = AuditEntry {
            at: Utc::now(),
            chunk_index: state.chunk_index,
            event: event.to_string(),
            submission_id: state.submission_id.clone(),
            from,
            to: state.status.clone(),
            detail,
        };
        self.store.save_transition(state, &entry)
    }

    /// Submit a chunk, starting from its previous state if it has one.
    ///
    /// A transport rejection is recorded as `failed` (resubmittable) and
    /// returned as [`LifecycleError::Submission`]; other chunks are unaffected.
    pub fn submit(
        &self,
        chunk: &ChunkRequest,
        previous: Option<ChunkLifecycleState>,
    ) -> Result<ChunkLifecycleState, LifecycleError> {
        let mut state = previous
            .unwrap_or_else(|| ChunkLifecycleState::not_submitted(chunk.chunk_index, chunk.len()));
        if !state.status.needs_submission() {
            return Err(TransitionError::NotSubmittable {
                chunk_index: state.chunk_index,
                status: state.status.clone(),
            }
            .into());
        }
        let from = state.status.clone();
        let now = Utc::now();

        match self.transport.submit(chunk) {
            Ok(id) => {
                state.record_submission(id, now)?;
                state.num_requests = chunk.len();
                self.persist(&state, "submitted", from, None)?;
                tracing::info!(
                    chunk = chunk.chunk_index,
                    submission_id = ?state.submission_id.as_ref().map(|s| s.as_str()),
                    requests = chunk.len(),
                    tokens = chunk.total_tokens(),
                    "chunk submitted"
                );
                Ok(state)
            }
            Err(source) => {
                let message = source.to_string();
                state.record_rejection(message.clone(), now)?;
                self.persist(&state, "rejected", from, Some(message))?;
                tracing::warn!(chunk = chunk.chunk_index, error = %source, "submission rejected");
                Err(LifecycleError::Submission {
                    chunk_index: chunk.chunk_index,
                    source,
                })
            }
        }
    }

    /// Query the provider and apply the mapped status.
    ///
    /// Terminal and never-submitted chunks are returned unchanged without a
    /// transport call. A backwards status report (e.g. `validating` after
    /// `in_progress`) is logged and ignored.
    pub fn poll(
        &self,
        mut state: ChunkLifecycleState,
    ) -> Result<ChunkLifecycleState, LifecycleError> {
        if state.status.is_terminal() || state.status == ChunkStatus::NotSubmitted {
            return Ok(state);
        }
        let Some(id) = state.submission_id.clone() else {
            return Ok(state);
        };

        let reported = self
            .transport
            .get_status(&id)
            .map_err(|source| LifecycleError::Poll {
                chunk_index: state.chunk_index,
                source,
            })?;
        let from = state.status.clone();
        let now = Utc::now();

        match state.apply_status(reported.status.clone(), now) {
            Ok(true) => {
                if reported.output_ref.is_some() {
                    state.output_ref = reported.output_ref;
                }
                self.persist(&state, "polled", from.clone(), Some(reported.raw.clone()))?;
                tracing::info!(
                    chunk = state.chunk_index,
                    from = %from,
                    to = %state.status,
                    "chunk status changed"
                );
            }
            Ok(false) => {
                if state.output_ref.is_none() && reported.output_ref.is_some() {
                    state.output_ref = reported.output_ref;
                }
                self.store.save_state(&state)?;
                tracing::debug!(chunk = state.chunk_index, status = %state.status, "no change");
            }
            Err(e) => {
                tracing::warn!(
                    chunk = state.chunk_index,
                    error = %e,
                    raw = %reported.raw,
                    "ignoring status report"
                );
                state.last_polled_at = Some(now);
                self.store.save_state(&state)?;
            }
        }

        if let ChunkStatus::Unknown(raw) = &state.status {
            tracing::warn!(
                chunk = state.chunk_index,
                provider_status = %raw,
                "unrecognised provider status, needs operator attention"
            );
        }
        Ok(state)
    }

    /// Download the result of a completed chunk, retrying once, and store it.
    pub fn fetch(&self, state: &mut ChunkLifecycleState) -> Result<Vec<u8>, LifecycleError> {
        if state.status != ChunkStatus::Completed {
            return Err(LifecycleError::NotCompleted {
                chunk_index: state.chunk_index,
                status: state.status.clone(),
            });
        }
        let Some(id) = state.submission_id.clone() else {
            return Err(LifecycleError::NotCompleted {
                chunk_index: state.chunk_index,
                status: state.status.clone(),
            });
        };

        let mut last_error = String::new();
        for attempt in 1..=FETCH_ATTEMPTS {
            state.fetch_attempts += 1;
            match self.transport.download_result(&id, state.output_ref.as_deref()) {
                Ok(blob) => {
                    self.store.save_result(state.chunk_index, &blob)?;
                    state.error = None;
                    self.persist(state, "fetched", state.status.clone(), None)?;
                    tracing::info!(
                        chunk = state.chunk_index,
                        bytes = blob.len(),
                        "result downloaded"
                    );
                    return Ok(blob);
                }
                Err(e) => {
                    tracing::warn!(
                        chunk = state.chunk_index,
                        attempt,
                        error = %e,
                        "result download failed"
                    );
                    last_error = e.to_string();
                }
            }
        }

        state.error = Some(last_error.clone());
        self.persist(state, "fetch_failed", state.status.clone(), Some(last_error.clone()))?;
        Err(LifecycleError::Fetch {
            chunk_index: state.chunk_index,
            attempts: FETCH_ATTEMPTS,
            message: last_error,
        })
    }

    /// Reconcile persisted states with the plan after a restart.
    ///
    /// In-flight chunks are re-queried so the plan reflects the provider's
    /// current view. Chunks with no persisted state count as not submitted.
    pub fn resume(
        &self,
        chunks: &[ChunkRequest],
        persisted: Vec<ChunkLifecycleState>,
    ) -> Result<ResumePlan, LifecycleError> {
        let mut by_index: BTreeMap<usize, ChunkLifecycleState> = BTreeMap::new();
        for state in persisted {
            if state.chunk_index >= chunks.len() {
                tracing::warn!(
                    chunk = state.chunk_index,
                    "state has no chunk in the plan, ignored"
                );
                continue;
            }
            by_index.insert(state.chunk_index, state);
        }

        let mut plan = ResumePlan::default();
        for chunk in chunks {
            let state = by_index.remove(&chunk.chunk_index).unwrap_or_else(|| {
                ChunkLifecycleState::not_submitted(chunk.chunk_index, chunk.len())
            });

            let state = if state.status.is_in_flight() {
                match self.poll(state.clone()) {
                    Ok(s) => s,
                    Err(LifecycleError::Poll { chunk_index, source }) => {
                        tracing::warn!(
                            chunk = chunk_index,
                            error = %source,
                            "could not re-query chunk"
                        );
                        state
                    }
                    Err(e) => return Err(e),
                }
            } else {
                state
            };

            let status = state.status.clone();
            match status {
                ChunkStatus::Completed => plan.to_fetch.push(state),
                s if s.needs_submission() => plan.to_resubmit.push(state),
                ChunkStatus::Unknown(_) => {
                    plan.needs_attention.push(state.chunk_index);
                    plan.to_poll.push(state);
                }
                _ => plan.to_poll.push(state),
            }
        }

        tracing::info!(
            to_poll = plan.to_poll.len(),
            to_fetch = plan.to_fetch.len(),
            to_resubmit = plan.to_resubmit.len(),
            needs_attention = plan.needs_attention.len(),
            "resume plan"
        );
        Ok(plan)
    }

    /// Poll every in-flight chunk once, in parallel.
    pub fn poll_sweep(&self, states: &mut [ChunkLifecycleState]) -> SweepReport {
        states
            .par_iter_mut()
            .filter(|s| s.status.is_in_flight())
            .map(|slot| {
                let before = slot.status.clone();
                match self.poll(slot.clone()) {
                    Ok(next) => {
                        let changed = next.status != before;
                        *slot = next;
                        SweepReport {
                            polled: 1,
                            changed: usize::from(changed),
                            errors: 0,
                        }
                    }
                    Err(e) => {
                        tracing::warn!(chunk = slot.chunk_index, error = %e, "poll failed");
                        SweepReport {
                            polled: 1,
                            changed: 0,
                            errors: 1,
                        }
                    }
                }
            })
            .reduce(SweepReport::default, |a, b| SweepReport {
                polled: a.polled + b.polled,
                changed: a.changed + b.changed,
                errors: a.errors + b.errors,
            })
    }

    /// Sweep until no chunk is validating or in progress, sleeping `interval`
    /// between sweeps. Chunks in an unknown status do not hold the wait open.
    ///
    /// Returns the number of sweeps performed.
    pub fn wait_until_terminal(
        &self,
        states: &mut [ChunkLifecycleState],
        interval: Duration,
        max_sweeps: Option<u32>,
    ) -> u32 {
        let pending = |states: &[ChunkLifecycleState]| {
            states
                .iter()
                .filter(|s| matches!(s.status, ChunkStatus::Validating | ChunkStatus::InProgress))
                .count()
        };

        let mut sweeps = 0u32;
        while pending(&*states) > 0 {
            if max_sweeps.is_some_and(|max| sweeps >= max) {
                tracing::info!(sweeps, pending = pending(&*states), "stopped waiting (max sweeps)");
                break;
            }
            if sweeps > 0 {
                std::thread::sleep(interval);
            }
            let report = self.poll_sweep(states);
            sweeps += 1;
            tracing::info!(
                sweep = sweeps,
                polled = report.polled,
                changed = report.changed,
                errors = report.errors,
                pending = pending(&*states),
                "poll sweep"
            );
        }
        sweeps
    }
}
