//! Run summaries: lifecycle counts, validation counts and the Markdown report.

use std::collections::BTreeMap;

use cbspeech_core::domain::{IndexTables, Institution};
use cbspeech_core::lifecycle::{ChunkLifecycleState, ChunkStatus};
use cbspeech_core::validate::ValidationReport;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::results::RejectedOutput;
use crate::store::PlanManifest;

/// One chunk's line in the lifecycle summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkSummary {
    pub chunk_index: usize,
    pub status: String,
    pub submission_id: Option<String>,
    pub num_requests: usize,
    pub attempts: usize,
    pub submitted_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_polled_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// Chunk counts by status at the end of a stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LifecycleSummary {
    pub total_chunks: usize,
    pub counts_by_status: BTreeMap<String, usize>,
    /// Chunks in an unrecognised provider status.
    pub needs_attention: Vec<usize>,
    pub chunks: Vec<ChunkSummary>,
}

impl LifecycleSummary {
    /// Summarise `states`; plan chunks with no state count as not submitted.
    pub fn from_states(chunk_count: usize, states: &[ChunkLifecycleState]) -> Self {
        let mut summary = LifecycleSummary {
            total_chunks: chunk_count,
            ..Default::default()
        };
        let by_index: BTreeMap<usize, &ChunkLifecycleState> =
            states.iter().map(|s| (s.chunk_index, s)).collect();

        for index in 0..chunk_count {
            let (status, line) = match by_index.get(&index) {
                Some(s) => (
                    s.status.clone(),
                    ChunkSummary {
                        chunk_index: index,
                        status: s.status.to_string(),
                        submission_id: s.submission_id.as_ref().map(|id| id.to_string()),
                        num_requests: s.num_requests,
                        attempts: s.history.len() + usize::from(s.submission_id.is_some()),
                        submitted_at: s.submitted_at,
                        completed_at: s.completed_at,
                        last_polled_at: s.last_polled_at,
                        error: s.error.clone(),
                    },
                ),
                None => (
                    ChunkStatus::NotSubmitted,
                    ChunkSummary {
                        chunk_index: index,
                        status: ChunkStatus::NotSubmitted.to_string(),
                        submission_id: None,
                        num_requests: 0,
                        attempts: 0,
                        submitted_at: None,
                        completed_at: None,
                        last_polled_at: None,
                        error: None,
                    },
                ),
            };
            *summary
                .counts_by_status
                .entry(status.label().to_string())
                .or_insert(0) += 1;
            if matches!(status, ChunkStatus::Unknown(_)) {
                summary.needs_attention.push(index);
            }
            summary.chunks.push(line);
        }
        summary
    }

    pub fn count(&self, label: &str) -> usize {
        self.counts_by_status.get(label).copied().unwrap_or(0)
    }

    pub fn all_completed(&self) -> bool {
        self.count("completed") == self.total_chunks
    }
}

/// Validation outcome persisted as `validation_summary.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationSummary {
    pub report: ValidationReport,
    /// Records whose speech id is not in the corpus.
    pub unmatched_records: usize,
    pub rejects: Vec<RejectedOutput>,
}

/// Everything the Markdown report shows.
#[derive(Debug, Clone)]
pub struct RunSummary<'a> {
    pub plan: &'a PlanManifest,
    pub lifecycle: &'a LifecycleSummary,
    pub validation: &'a ValidationSummary,
    pub tables: &'a IndexTables,
}

/// Render the run report as Markdown.
pub fn generate_report(run: &RunSummary<'_>) -> String {
    let mut md = String::new();
    md.push_str("# Speech Sentiment Run Report\n\n");

    md.push_str("## Plan\n\n");
    md.push_str("| Field | Value |\n");
    md.push_str("| --- | --- |\n");
    md.push_str(&format!("| Fingerprint | `{}` |\n", run.plan.fingerprint));
    md.push_str(&format!("| Model | {} |\n", run.plan.model));
    md.push_str(&format!("| Prompt Version | {} |\n", run.plan.prompt_version));
    md.push_str(&format!(
        "| Token Budget | {} |\n",
        run.plan.limits.max_tokens_per_chunk
    ));
    md.push_str(&format!("| Chunks | {} |\n", run.plan.chunk_count));
    md.push_str(&format!("| Requests | {} |\n", run.plan.request_count));
    md.push('\n');

    if !run.plan.warnings.is_empty() {
        md.push_str("Oversized requests (submitted alone):\n\n");
        for w in &run.plan.warnings {
            md.push_str(&format!("- {w}\n"));
        }
        md.push('\n');
    }

    md.push_str("## Batch Lifecycle\n\n");
    md.push_str("| Status | Chunks |\n");
    md.push_str("| --- | --- |\n");
    for (status, n) in &run.lifecycle.counts_by_status {
        md.push_str(&format!("| {status} | {n} |\n"));
    }
    md.push('\n');
    if !run.lifecycle.needs_attention.is_empty() {
        md.push_str(&format!(
            "**Needs attention:** chunks {:?} report an unrecognised provider status.\n\n",
            run.lifecycle.needs_attention
        ));
    }

    let v = &run.validation.report;
    md.push_str("## Validation\n\n");
    md.push_str("| Metric | Value |\n");
    md.push_str("| --- | --- |\n");
    md.push_str(&format!("| Outputs | {} |\n", v.total));
    md.push_str(&format!("| Valid | {} |\n", v.valid));
    md.push_str(&format!("| Rejected | {} |\n", v.invalid()));
    for (kind, n) in &v.error_counts_by_kind {
        md.push_str(&format!("| Rejected: {kind} | {n} |\n"));
    }
    md.push_str(&format!(
        "| Unmatched records | {} |\n",
        run.validation.unmatched_records
    ));
    md.push('\n');

    md.push_str("## Indices\n\n");
    md.push_str("| Institution | Speech Days | Calendar Days | First | Last |\n");
    md.push_str("| --- | --- | --- | --- | --- |\n");
    for inst in Institution::ALL {
        let sparse = run.tables.sparse.get(&inst).map(Vec::len).unwrap_or(0);
        let filled = run.tables.forward_filled.get(&inst);
        let days = filled.map(Vec::len).unwrap_or(0);
        let first = filled
            .and_then(|r| r.first())
            .map(|r| r.date.to_string())
            .unwrap_or_else(|| "-".into());
        let last = filled
            .and_then(|r| r.last())
            .map(|r| r.date.to_string())
            .unwrap_or_else(|| "-".into());
        md.push_str(&format!(
            "| {inst} | {sparse} | {days} | {first} | {last} |\n"
        ));
    }
    md
}

/// Print the lifecycle table to stdout.
pub fn print_lifecycle(summary: &LifecycleSummary) {
    println!(
        "{:>6}  {:<16}  {:<24}  {:>8}  {:>8}",
        "chunk", "status", "submission", "requests", "attempts"
    );
    for c in &summary.chunks {
        println!(
            "{:>6}  {:<16}  {:<24}  {:>8}  {:>8}",
            c.chunk_index,
            c.status,
            c.submission_id.as_deref().unwrap_or("-"),
            c.num_requests,
            c.attempts
        );
    }
    let counts: Vec<String> = summary
        .counts_by_status
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect();
    println!("\n{} chunks: {}", summary.total_chunks, counts.join(", "));
    if !summary.needs_attention.is_empty() {
        println!(
            "needs attention (unknown provider status): {:?}",
            summary.needs_attention
        );
    }
}

/// Print validation counts to stdout.
pub fn print_validation(summary: &ValidationSummary) {
    let r = &summary.report;
    println!("outputs: {}  valid: {}  rejected: {}", r.total, r.valid, r.invalid());
    for (kind, n) in &r.error_counts_by_kind {
        println!("  {kind:<14} {n}");
    }
    if summary.unmatched_records > 0 {
        println!("  unmatched      {}", summary.unmatched_records);
    }
}
