//! In-memory batch service for tests and `--simulate` runs.
//!
//! Deterministic for a given seed: each speech's output is drawn from an RNG
//! seeded by the run seed and the speech id, so results do not depend on
//! chunk layout or submission order. Failure modes (rejected submissions,
//! expiry, unknown statuses, transient download failures, malformed outputs)
//! are switched on per chunk through [`SimulatedBehavior`].

use super::{map_provider_status, BatchTransport, ProviderStatus, TransportError};
use cbspeech_core::chunker::ChunkRequest;
use cbspeech_core::domain::SubmissionId;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Knobs for the simulated provider.
#[derive(Debug, Clone, Default)]
pub struct SimulatedBehavior {
    /// Status polls a batch spends in progress before it turns terminal.
    pub polls_to_complete: u32,
    /// Chunks whose submission is refused.
    pub reject_chunks: HashSet<usize>,
    /// Chunks whose first submission expires instead of completing.
    pub expire_chunks: HashSet<usize>,
    /// Chunks that report this provider status string on every poll.
    pub unknown_status: HashMap<usize, String>,
    /// Downloads that fail before one succeeds, per chunk.
    pub fetch_failures: HashMap<usize, u32>,
    /// Probability that a line carries an out-of-range or mislabeled output.
    pub invalid_rate: f64,
    /// Probability that a request has no output line at all.
    pub drop_rate: f64,
}

#[derive(Debug)]
struct SimBatch {
    chunk: ChunkRequest,
    polls: u32,
    expires: bool,
    fetch_failures_left: u32,
}

#[derive(Debug, Default)]
struct SimState {
    batches: HashMap<String, SimBatch>,
    attempts: HashMap<usize, u32>,
    next_id: u64,
}

pub struct SimulatedTransport {
    seed: u64,
    behavior: SimulatedBehavior,
    state: Mutex<SimState>,
    submit_calls: AtomicUsize,
    status_calls: AtomicUsize,
    download_calls: AtomicUsize,
}

impl SimulatedTransport {
    pub fn new(seed: u64) -> Self {
        Self::with_behavior(seed, SimulatedBehavior::default())
    }

    pub fn with_behavior(seed: u64, behavior: SimulatedBehavior) -> Self {
        Self {
            seed,
            behavior,
            state: Mutex::new(SimState::default()),
            submit_calls: AtomicUsize::new(0),
            status_calls: AtomicUsize::new(0),
            download_calls: AtomicUsize::new(0),
        }
    }

    pub fn submit_calls(&self) -> usize {
        self.submit_calls.load(Ordering::Relaxed)
    }

    pub fn status_calls(&self) -> usize {
        self.status_calls.load(Ordering::Relaxed)
    }

    pub fn download_calls(&self) -> usize {
        self.download_calls.load(Ordering::Relaxed)
    }

    /// Sub-seed for one speech: blake3 over the run seed and the speech id.
    fn speech_seed(&self, speech_id: &str) -> u64 {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.seed.to_le_bytes());
        hasher.update(speech_id.as_bytes());
        let hash = hasher.finalize();
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&hash.as_bytes()[..8]);
        u64::from_le_bytes(bytes)
    }

    fn speech_rng(&self, speech_id: &str) -> StdRng {
        StdRng::seed_from_u64(self.speech_seed(speech_id))
    }

    fn render_output(&self, chunk: &ChunkRequest) -> Vec<u8> {
        let mut out = String::new();
        for item in &chunk.items {
            let mut rng = self.speech_rng(&item.speech_id);
            if rng.gen_bool(self.behavior.drop_rate.clamp(0.0, 1.0)) {
                continue;
            }
            let invalid = rng.gen_bool(self.behavior.invalid_rate.clamp(0.0, 1.0));
            let content = sentiment_json(&mut rng, &item.speech_id, invalid);
            let line = serde_json::json!({
                "id": format!("batch_req_{}", item.speech_id),
                "custom_id": item.speech_id,
                "response": {
                    "status_code": 200,
                    "body": {
                        "choices": [
                            {"index": 0, "message": {"role": "assistant", "content": content}}
                        ]
                    }
                },
                "error": null
            });
            out.push_str(&line.to_string());
            out.push('\n');
        }
        out.into_bytes()
    }
}

fn impact_label(rng: &mut StdRng) -> &'static str {
    match rng.gen_range(0..3) {
        0 => "rise",
        1 => "fall",
        _ => "neutral",
    }
}

/// Model content for one speech. Invalid outputs alternate between a range
/// violation and a bad category.
fn sentiment_json(rng: &mut StdRng, speech_id: &str, invalid: bool) -> String {
    let mut value = serde_json::json!({
        "speech_id": speech_id,
        "hawkish_dovish_score": (rng.gen_range(-100.0..=100.0_f64) * 10.0).round() / 10.0,
        "uncertainty": rng.gen_range(0..=100),
        "forward_guidance_strength": rng.gen_range(0..=100),
        "topic_inflation": rng.gen_range(0..=100),
        "topic_growth": rng.gen_range(0..=100),
        "topic_employment": rng.gen_range(0..=100),
        "topic_financial_stability": rng.gen_range(0..=100),
        "topic_international": rng.gen_range(0..=100),
        "market_impact_stocks": impact_label(rng),
        "market_impact_bonds": impact_label(rng),
        "market_impact_currency": impact_label(rng),
    });
    if invalid {
        if rng.gen_bool(0.5) {
            value["uncertainty"] = serde_json::json!(150);
        } else {
            value["market_impact_bonds"] = serde_json::json!("up");
        }
    }
    value.to_string()
}

impl BatchTransport for SimulatedTransport {
    fn name(&self) -> &str {
        "simulated"
    }

    fn submit(&self, chunk: &ChunkRequest) -> Result<SubmissionId, TransportError> {
        self.submit_calls.fetch_add(1, Ordering::Relaxed);
        if self.behavior.reject_chunks.contains(&chunk.chunk_index) {
            return Err(TransportError::Rejected {
                status: 400,
                message: format!("chunk {} refused by simulated provider", chunk.chunk_index),
            });
        }

        let mut state = self.state.lock().unwrap();
        let attempt = {
            let a = state.attempts.entry(chunk.chunk_index).or_insert(0);
            *a += 1;
            *a
        };
        state.next_id += 1;
        let id = format!("sim_batch_{:06}", state.next_id);
        state.batches.insert(
            id.clone(),
            SimBatch {
                chunk: chunk.clone(),
                polls: 0,
                expires: attempt == 1 && self.behavior.expire_chunks.contains(&chunk.chunk_index),
                fetch_failures_left: self
                    .behavior
                    .fetch_failures
                    .get(&chunk.chunk_index)
                    .copied()
                    .unwrap_or(0),
            },
        );
        Ok(SubmissionId::new(id))
    }

    fn get_status(&self, id: &SubmissionId) -> Result<ProviderStatus, TransportError> {
        self.status_calls.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock().unwrap();
        let batch = state
            .batches
            .get_mut(id.as_str())
            .ok_or_else(|| TransportError::UnknownSubmission(id.to_string()))?;
        batch.polls += 1;

        let raw = if let Some(raw) = self.behavior.unknown_status.get(&batch.chunk.chunk_index) {
            raw.clone()
        } else if batch.polls == 1 && self.behavior.polls_to_complete > 0 {
            "validating".to_string()
        } else if batch.polls <= self.behavior.polls_to_complete {
            "in_progress".to_string()
        } else if batch.expires {
            "expired".to_string()
        } else {
            "completed".to_string()
        };

        let status = map_provider_status(&raw);
        let output_ref = (raw == "completed").then(|| format!("file-{}", id.as_str()));
        Ok(ProviderStatus {
            status,
            raw,
            output_ref,
        })
    }

    fn download_result(
        &self,
        id: &SubmissionId,
        _output_ref: Option<&str>,
    ) -> Result<Vec<u8>, TransportError> {
        self.download_calls.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock().unwrap();
        let batch = state
            .batches
            .get_mut(id.as_str())
            .ok_or_else(|| TransportError::UnknownSubmission(id.to_string()))?;
        if batch.fetch_failures_left > 0 {
            batch.fetch_failures_left -= 1;
            return Err(TransportError::ResultUnavailable(id.to_string()));
        }
        let chunk = batch.chunk.clone();
        drop(state);
        Ok(self.render_output(&chunk))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cbspeech_core::chunker::ChunkItem;
    use cbspeech_core::lifecycle::ChunkStatus;
    use cbspeech_core::prompt::PromptPayload;
    use cbspeech_core::validate::parse_and_validate;

    fn chunk(index: usize, ids: &[&str]) -> ChunkRequest {
        ChunkRequest {
            chunk_index: index,
            items: ids
                .iter()
                .map(|id| ChunkItem {
                    speech_id: id.to_string(),
                    estimated_tokens: 1,
                    prompt: PromptPayload {
                        system: String::new(),
                        user: String::new(),
                    },
                })
                .collect(),
        }
    }

    fn contents(blob: &[u8]) -> Vec<(String, String)> {
        std::str::from_utf8(blob)
            .unwrap()
            .lines()
            .map(|l| {
                let v: serde_json::Value = serde_json::from_str(l).unwrap();
                (
                    v["custom_id"].as_str().unwrap().to_string(),
                    v["response"]["body"]["choices"][0]["message"]["content"]
                        .as_str()
                        .unwrap()
                        .to_string(),
                )
            })
            .collect()
    }

    #[test]
    fn progresses_to_completed() {
        let t = SimulatedTransport::with_behavior(
            1,
            SimulatedBehavior {
                polls_to_complete: 2,
                ..Default::default()
            },
        );
        let id = t.submit(&chunk(0, &["a"])).unwrap();
        assert_eq!(t.get_status(&id).unwrap().status, ChunkStatus::Validating);
        assert_eq!(t.get_status(&id).unwrap().status, ChunkStatus::InProgress);
        let done = t.get_status(&id).unwrap();
        assert_eq!(done.status, ChunkStatus::Completed);
        assert!(done.output_ref.is_some());
    }

    #[test]
    fn valid_outputs_pass_validation() {
        let t = SimulatedTransport::new(42);
        let id = t.submit(&chunk(0, &["a", "b", "c"])).unwrap();
        let blob = t.download_result(&id, None).unwrap();
        let lines = contents(&blob);
        assert_eq!(lines.len(), 3);
        for (custom_id, content) in lines {
            parse_and_validate(&content, &custom_id).unwrap();
        }
    }

    #[test]
    fn output_is_deterministic_per_seed() {
        let a = SimulatedTransport::new(7);
        let b = SimulatedTransport::new(7);
        let ia = a.submit(&chunk(0, &["x", "y"])).unwrap();
        let ib = b.submit(&chunk(3, &["x", "y"])).unwrap();
        assert_eq!(
            a.download_result(&ia, None).unwrap(),
            b.download_result(&ib, None).unwrap()
        );
    }

    #[test]
    fn speech_seeds_depend_on_run_seed_and_id() {
        let a = SimulatedTransport::new(7);
        let b = SimulatedTransport::new(8);
        let again = SimulatedTransport::new(7);
        assert_eq!(a.speech_seed("fed-1"), again.speech_seed("fed-1"));
        assert_ne!(a.speech_seed("fed-1"), b.speech_seed("fed-1"));
        assert_ne!(a.speech_seed("fed-1"), a.speech_seed("fed-2"));
    }

    #[test]
    fn different_seeds_give_different_outputs() {
        let a = SimulatedTransport::new(7);
        let b = SimulatedTransport::new(8);
        let ids = ["x", "y", "z"];
        let ia = a.submit(&chunk(0, &ids)).unwrap();
        let ib = b.submit(&chunk(0, &ids)).unwrap();
        let out_a = contents(&a.download_result(&ia, None).unwrap());
        let out_b = contents(&b.download_result(&ib, None).unwrap());
        assert_ne!(out_a, out_b);
    }

    #[test]
    fn expiry_only_hits_first_attempt() {
        let t = SimulatedTransport::with_behavior(
            1,
            SimulatedBehavior {
                expire_chunks: HashSet::from([0]),
                ..Default::default()
            },
        );
        let first = t.submit(&chunk(0, &["a"])).unwrap();
        assert_eq!(t.get_status(&first).unwrap().status, ChunkStatus::Expired);
        let second = t.submit(&chunk(0, &["a"])).unwrap();
        assert_ne!(first, second);
        assert_eq!(t.get_status(&second).unwrap().status, ChunkStatus::Completed);
    }

    #[test]
    fn rejected_and_unknown_ids() {
        let t = SimulatedTransport::with_behavior(
            1,
            SimulatedBehavior {
                reject_chunks: HashSet::from([2]),
                ..Default::default()
            },
        );
        assert!(matches!(
            t.submit(&chunk(2, &["a"])),
            Err(TransportError::Rejected { status: 400, .. })
        ));
        assert!(matches!(
            t.get_status(&SubmissionId::new("nope")),
            Err(TransportError::UnknownSubmission(_))
        ));
    }
}
