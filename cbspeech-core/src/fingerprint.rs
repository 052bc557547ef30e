//! Plan fingerprinting: deterministic identity of a chunk plan.
//!
//! A resumed run must use exactly the chunks that were submitted. The
//! fingerprint covers everything that shapes the chunks and their prompts:
//! speech ids and token estimates in order, the limits, the model and the
//! prompt version.

use crate::chunker::{ChunkLimits, ChunkPlan};
use serde::{Deserialize, Serialize};
use std::fmt;

/// BLAKE3 hex digest identifying a chunk plan.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlanHash(pub String);

impl PlanHash {
    pub fn from_bytes(data: &[u8]) -> Self {
        Self(blake3::hash(data).to_hex().to_string())
    }
}

impl fmt::Display for PlanHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Canonical form hashed for a plan. Field order is fixed by the struct.
#[derive(Serialize)]
struct CanonicalPlan<'a> {
    model: &'a str,
    prompt_version: &'a str,
    limits: ChunkLimits,
    chunks: Vec<Vec<(&'a str, usize)>>,
}

/// Fingerprint a plan for a given model and prompt version.
pub fn plan_fingerprint(plan: &ChunkPlan, model: &str, prompt_version: &str) -> PlanHash {
    let canonical = CanonicalPlan {
        model,
        prompt_version,
        limits: plan.limits,
        chunks: plan
            .chunks
            .iter()
            .map(|c| {
                c.items
                    .iter()
                    .map(|i| (i.speech_id.as_str(), i.estimated_tokens))
                    .collect()
            })
            .collect(),
    };
    // Plain structs of strings and integers always serialize.
    let json = serde_json::to_vec(&canonical).unwrap_or_default();
    PlanHash::from_bytes(&json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::{pack_items, ChunkItem};
    use crate::prompt::PromptPayload;

    fn plan(tokens: &[usize], budget: usize) -> ChunkPlan {
        let items = tokens
            .iter()
            .enumerate()
            .map(|(i, t)| ChunkItem {
                speech_id: format!("s{i}"),
                estimated_tokens: *t,
                prompt: PromptPayload {
                    system: String::new(),
                    user: String::new(),
                },
            })
            .collect();
        pack_items(items, ChunkLimits::new(budget)).unwrap()
    }

    #[test]
    fn deterministic() {
        let p = plan(&[10, 20, 30], 40);
        assert_eq!(
            plan_fingerprint(&p, "gpt-4o-mini", "v1"),
            plan_fingerprint(&p, "gpt-4o-mini", "v1")
        );
    }

    #[test]
    fn sensitive_to_budget_model_and_prompt() {
        let a = plan(&[10, 20, 30], 40);
        let b = plan(&[10, 20, 30], 100);
        let base = plan_fingerprint(&a, "m", "v1");
        assert_ne!(base, plan_fingerprint(&b, "m", "v1"));
        assert_ne!(base, plan_fingerprint(&a, "other", "v1"));
        assert_ne!(base, plan_fingerprint(&a, "m", "v2"));
        assert_eq!(base.0.len(), 64);
    }
}
