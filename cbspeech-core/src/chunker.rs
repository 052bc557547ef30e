//! Request chunking: greedy sequential bin-packing under a token budget.
//!
//! Walks the requests once in input order, keeping a running token sum for
//! the open chunk. An item that would push the sum over budget closes the
//! open chunk first. An item whose own estimate exceeds the budget ends up
//! alone in its chunk; that is accepted and reported as a warning.
//!
//! Guarantees:
//! - every item appears in exactly one chunk, in input order
//! - no chunk exceeds the budget unless it holds a single item
//! - no chunk holds more than `max_requests_per_chunk` items

use crate::domain::SpeechRecord;
use crate::prompt::{PromptBuilder, PromptPayload};
use crate::tokens::TokenEstimator;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Per-batch request limit of the provider.
pub const DEFAULT_MAX_REQUESTS_PER_CHUNK: usize = 50_000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChunkerError {
    #[error("invalid chunk budget: {0}")]
    InvalidBudget(String),

    #[error("duplicate speech id '{0}' (ids must be unique within a run)")]
    DuplicateId(String),
}

/// One request inside a chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkItem {
    pub speech_id: String,
    pub estimated_tokens: usize,
    pub prompt: PromptPayload,
}

/// A token-budget-bounded group of requests submitted as one batch job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRequest {
    pub chunk_index: usize,
    pub items: Vec<ChunkItem>,
}

impl ChunkRequest {
    pub fn total_tokens(&self) -> usize {
        self.items.iter().map(|i| i.estimated_tokens).sum()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn speech_ids(&self) -> impl Iterator<Item = &str> {
        self.items.iter().map(|i| i.speech_id.as_str())
    }

    pub fn contains(&self, speech_id: &str) -> bool {
        self.items.iter().any(|i| i.speech_id == speech_id)
    }
}

/// A single item over budget, placed alone in its own chunk. Not an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkOversizeWarning {
    pub chunk_index: usize,
    pub speech_id: String,
    pub estimated_tokens: usize,
    pub budget: usize,
}

impl fmt::Display for ChunkOversizeWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "chunk {} holds speech '{}' alone at ~{} tokens (budget {})",
            self.chunk_index, self.speech_id, self.estimated_tokens, self.budget
        )
    }
}

/// Limits applied while packing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkLimits {
    pub max_tokens_per_chunk: usize,
    pub max_requests_per_chunk: usize,
}

impl ChunkLimits {
    pub fn new(max_tokens_per_chunk: usize) -> Self {
        Self {
            max_tokens_per_chunk,
            max_requests_per_chunk: DEFAULT_MAX_REQUESTS_PER_CHUNK,
        }
    }

    fn validate(&self) -> Result<(), ChunkerError> {
        if self.max_tokens_per_chunk == 0 {
            return Err(ChunkerError::InvalidBudget(
                "max_tokens_per_chunk must be > 0".into(),
            ));
        }
        if self.max_requests_per_chunk == 0 {
            return Err(ChunkerError::InvalidBudget(
                "max_requests_per_chunk must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Output of chunking: the chunks plus any oversize warnings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkPlan {
    pub limits: ChunkLimits,
    pub chunks: Vec<ChunkRequest>,
    pub warnings: Vec<ChunkOversizeWarning>,
}

impl ChunkPlan {
    pub fn request_count(&self) -> usize {
        self.chunks.iter().map(|c| c.len()).sum()
    }
}

/// Pack pre-estimated items into chunks. One pass, no reordering.
pub fn pack_items(
    items: Vec<ChunkItem>,
    limits: ChunkLimits,
) -> Result<ChunkPlan, ChunkerError> {
    limits.validate()?;
    let budget = limits.max_tokens_per_chunk;

    let mut chunks: Vec<ChunkRequest> = Vec::new();
    let mut current: Vec<ChunkItem> = Vec::new();
    let mut running = 0usize;

    for item in items {
        let overflows = running.saturating_add(item.estimated_tokens) > budget;
        let full = current.len() >= limits.max_requests_per_chunk;
        if !current.is_empty() && (overflows || full) {
            chunks.push(ChunkRequest {
                chunk_index: chunks.len(),
                items: std::mem::take(&mut current),
            });
            running = 0;
        }
        running = running.saturating_add(item.estimated_tokens);
        current.push(item);
    }
    if !current.is_empty() {
        chunks.push(ChunkRequest {
            chunk_index: chunks.len(),
            items: current,
        });
    }

    let warnings: Vec<ChunkOversizeWarning> = chunks
        .iter()
        .filter(|c| c.len() == 1 && c.total_tokens() > budget)
        .map(|c| ChunkOversizeWarning {
            chunk_index: c.chunk_index,
            speech_id: c.items[0].speech_id.clone(),
            estimated_tokens: c.items[0].estimated_tokens,
            budget,
        })
        .collect();

    for w in &warnings {
        tracing::warn!(
            chunk = w.chunk_index,
            speech_id = %w.speech_id,
            tokens = w.estimated_tokens,
            budget,
            "oversized request placed in its own chunk"
        );
    }

    Ok(ChunkPlan {
        limits,
        chunks,
        warnings,
    })
}

/// Turns an ordered speech sequence into chunk requests.
pub struct RequestChunker<'a> {
    estimator: &'a dyn TokenEstimator,
    prompts: &'a PromptBuilder,
    limits: ChunkLimits,
}

impl<'a> RequestChunker<'a> {
    pub fn new(
        estimator: &'a dyn TokenEstimator,
        prompts: &'a PromptBuilder,
        limits: ChunkLimits,
    ) -> Self {
        Self {
            estimator,
            prompts,
            limits,
        }
    }

    /// Build prompts, estimate each one and pack them in input order.
    ///
    /// Speech ids must be unique: they are the correlation keys of the batch.
    pub fn chunk(&self, speeches: &[SpeechRecord]) -> Result<ChunkPlan, ChunkerError> {
        let mut seen = std::collections::HashSet::with_capacity(speeches.len());
        let mut items = Vec::with_capacity(speeches.len());
        for speech in speeches {
            if !seen.insert(speech.id.as_str()) {
                return Err(ChunkerError::DuplicateId(speech.id.clone()));
            }
            let prompt = self.prompts.build(speech);
            items.push(ChunkItem {
                speech_id: speech.id.clone(),
                estimated_tokens: prompt.estimate_tokens(self.estimator),
                prompt,
            });
        }
        pack_items(items, self.limits)
    }
}
