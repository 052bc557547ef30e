//! Pipeline stages over an explicit [`RunContext`].
//!
//! Three stages share nothing but the run directory:
//! - [`plan_run`]: corpus → chunk plan, persisted with its fingerprint
//! - [`advance_submissions`]: resume, then (re)submit every eligible chunk
//! - [`advance_results`]: poll, fetch completed chunks, validate, aggregate, export
//!
//! Each stage can run in a separate process invocation; a crash between or
//! inside stages resumes from the persisted lifecycle states.

use std::time::Duration;

use cbspeech_core::aggregate::{build_indices, join_records};
use cbspeech_core::chunker::{ChunkerError, RequestChunker};
use cbspeech_core::domain::{IndexTables, SpeechRecord};
use cbspeech_core::fingerprint::plan_fingerprint;
use cbspeech_core::lifecycle::ChunkStatus;
use cbspeech_core::prompt::{PromptBuilder, PROMPT_VERSION};
use cbspeech_core::tokens::CharRatioEstimator;
use chrono::Utc;
use rayon::prelude::*;
use thiserror::Error;

use crate::config::PipelineConfig;
use crate::export::{write_index_tables, write_json_summary};
use crate::lifecycle::{BatchLifecycleManager, LifecycleError, SweepReport};
use crate::report::{generate_report, LifecycleSummary, RunSummary, ValidationSummary};
use crate::results::validate_chunk_output;
use crate::store::{write_bytes_atomic, LifecycleStore, PlanManifest, StoreError};
use crate::transport::BatchTransport;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Chunker(#[from] ChunkerError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error("export failed: {0}")]
    Export(String),
}

/// Durable and per-invocation state shared by the stages.
pub struct RunContext {
    pub config: PipelineConfig,
    pub store: LifecycleStore,
    pub transport: Box<dyn BatchTransport>,
    pub lifecycle: LifecycleSummary,
    pub validation: ValidationSummary,
}

impl RunContext {
    /// Open the run directory named by `config.output.run_dir`.
    pub fn new(
        config: PipelineConfig,
        transport: Box<dyn BatchTransport>,
    ) -> Result<Self, PipelineError> {
        let store = LifecycleStore::open(&config.output.run_dir)?;
        Ok(Self {
            config,
            store,
            transport,
            lifecycle: LifecycleSummary::default(),
            validation: ValidationSummary::default(),
        })
    }

    fn manager(&self) -> BatchLifecycleManager<'_> {
        BatchLifecycleManager::new(self.transport.as_ref(), &self.store)
    }

    /// Reload lifecycle states and persist `lifecycle_summary.json`.
    pub fn refresh_lifecycle(&mut self) -> Result<&LifecycleSummary, PipelineError> {
        let plan = self.store.require_plan()?;
        let states = self.store.load_all()?;
        self.lifecycle = LifecycleSummary::from_states(plan.chunk_count, &states);
        write_json_summary(&self.store.root().join("lifecycle_summary.json"), &self.lifecycle)
            .map_err(|e| PipelineError::Export(format!("{e:#}")))?;
        Ok(&self.lifecycle)
    }
}

// ── Plan ─────────────────────────────────────────────────────────────

/// Chunk the corpus and persist the plan. Needs no transport.
///
/// Re-planning the same corpus with the same settings is a no-op; a
/// different plan in the same run directory is refused.
pub fn plan_run(
    cfg: &PipelineConfig,
    store: &LifecycleStore,
    speeches: &[SpeechRecord],
) -> Result<PlanManifest, PipelineError> {
    let estimator = CharRatioEstimator::new(cfg.batching.chars_per_token);
    let prompts = PromptBuilder::new().with_max_text_chars(cfg.model.max_text_chars);
    let plan = RequestChunker::new(&estimator, &prompts, cfg.batching.limits()).chunk(speeches)?;

    let manifest = PlanManifest {
        fingerprint: plan_fingerprint(&plan, &cfg.model.name, PROMPT_VERSION),
        model: cfg.model.name.clone(),
        prompt_version: PROMPT_VERSION.to_string(),
        limits: plan.limits,
        chunk_count: plan.chunks.len(),
        request_count: plan.request_count(),
        created_at: Utc::now(),
        warnings: plan.warnings.clone(),
    };
    store.save_plan(&manifest, &plan.chunks)?;

    // An identical earlier plan keeps its original manifest.
    let stored = store.require_plan()?;
    tracing::info!(
        fingerprint = %stored.fingerprint,
        chunks = stored.chunk_count,
        requests = stored.request_count,
        oversized = stored.warnings.len(),
        "plan ready"
    );
    Ok(stored)
}

// ── Submissions ──────────────────────────────────────────────────────

/// Counts from one submission pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubmissionOutcome {
    pub submitted: usize,
    pub rejected: usize,
    pub in_flight: usize,
    pub completed: usize,
    pub needs_attention: usize,
}

/// Resume from persisted state and submit every chunk that needs it.
///
/// Submissions run in parallel; a rejected chunk is recorded as failed and
/// does not stop the others.
pub fn advance_submissions(ctx: &mut RunContext) -> Result<SubmissionOutcome, PipelineError> {
    let chunks = ctx.store.load_chunks()?;
    let mgr = ctx.manager();
    let resume = mgr.resume(&chunks, ctx.store.load_all()?)?;

    let results: Vec<Result<(), LifecycleError>> = resume
        .to_resubmit
        .into_par_iter()
        .map(|state| {
            let chunk = &chunks[state.chunk_index];
            let previous = (state.status != ChunkStatus::NotSubmitted).then_some(state);
            mgr.submit(chunk, previous).map(|_| ())
        })
        .collect();

    let mut outcome = SubmissionOutcome {
        in_flight: resume.to_poll.len(),
        completed: resume.to_fetch.len(),
        needs_attention: resume.needs_attention.len(),
        ..Default::default()
    };
    for r in results {
        match r {
            Ok(()) => outcome.submitted += 1,
            Err(LifecycleError::Submission { .. }) => outcome.rejected += 1,
            Err(e) => return Err(e.into()),
        }
    }
    outcome.in_flight += outcome.submitted;

    ctx.refresh_lifecycle()?;
    tracing::info!(
        submitted = outcome.submitted,
        rejected = outcome.rejected,
        in_flight = outcome.in_flight,
        completed = outcome.completed,
        "submission pass done"
    );
    Ok(outcome)
}

/// Poll every in-flight chunk once and refresh the lifecycle summary.
pub fn refresh_status(ctx: &mut RunContext) -> Result<SweepReport, PipelineError> {
    let mut states = ctx.store.load_all()?;
    let report = ctx.manager().poll_sweep(&mut states);
    ctx.refresh_lifecycle()?;
    Ok(report)
}

/// Poll until nothing is validating or in progress, per the polling config.
pub fn wait_for_completion(ctx: &mut RunContext) -> Result<u32, PipelineError> {
    let mut states = ctx.store.load_all()?;
    let interval: Duration = ctx.config.polling.interval();
    let sweeps = ctx
        .manager()
        .wait_until_terminal(&mut states, interval, ctx.config.polling.max_sweeps);
    ctx.refresh_lifecycle()?;
    Ok(sweeps)
}

// ── Results ──────────────────────────────────────────────────────────

/// Counts from one results pass.
#[derive(Debug, Clone, Default)]
pub struct ResultsOutcome {
    pub fetched: usize,
    pub fetch_failures: usize,
    /// Chunks not yet completed; their speeches are missing from the indices.
    pub pending_chunks: usize,
    pub records: usize,
    pub tables: IndexTables,
}

/// Poll, fetch completed chunks, validate every stored result and export
/// the indices, summaries and report.
///
/// Indices are rebuilt from all results on disk, so running this stage
/// again after more chunks complete extends the tables.
pub fn advance_results(
    ctx: &mut RunContext,
    speeches: &[SpeechRecord],
) -> Result<ResultsOutcome, PipelineError> {
    let chunks = ctx.store.load_chunks()?;
    let manifest = ctx.store.require_plan()?;
    let mut outcome = ResultsOutcome::default();

    {
        let mgr = ctx.manager();
        let resume = mgr.resume(&chunks, ctx.store.load_all()?)?;
        outcome.pending_chunks = resume.to_poll.len() + resume.to_resubmit.len();

        for mut state in resume.to_fetch {
            if ctx.store.has_result(state.chunk_index) {
                continue;
            }
            match mgr.fetch(&mut state) {
                Ok(_) => outcome.fetched += 1,
                Err(LifecycleError::Fetch { chunk_index, message, .. }) => {
                    tracing::warn!(
                        chunk = chunk_index,
                        error = %message,
                        "chunk left for a later pass"
                    );
                    outcome.fetch_failures += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    let mut validation = ValidationSummary::default();
    let mut records = Vec::new();
    for chunk in &chunks {
        let Some(blob) = ctx.store.load_result(chunk.chunk_index)? else {
            continue;
        };
        let chunk_outcome = validate_chunk_output(chunk, &blob);
        validation.report.merge(&chunk_outcome.report);
        validation.rejects.extend(chunk_outcome.rejects);
        records.extend(chunk_outcome.records);
    }
    ctx.store.write_records(&records)?;
    outcome.records = records.len();

    let joined = join_records(speeches, records);
    validation.unmatched_records = joined.unmatched.len();
    outcome.tables = build_indices(&joined.joined);

    let root = ctx.store.root().to_path_buf();
    let export = |e: anyhow::Error| PipelineError::Export(format!("{e:#}"));
    write_index_tables(&outcome.tables, &root.join("indices")).map_err(export)?;
    write_json_summary(&root.join("validation_summary.json"), &validation).map_err(export)?;
    ctx.validation = validation;
    ctx.refresh_lifecycle()?;

    let report = generate_report(&RunSummary {
        plan: &manifest,
        lifecycle: &ctx.lifecycle,
        validation: &ctx.validation,
        tables: &outcome.tables,
    });
    write_bytes_atomic(&root.join("report.md"), report.as_bytes())?;

    tracing::info!(
        fetched = outcome.fetched,
        fetch_failures = outcome.fetch_failures,
        pending = outcome.pending_chunks,
        valid = ctx.validation.report.valid,
        rejected = ctx.validation.report.invalid(),
        "results pass done"
    );
    Ok(outcome)
}
