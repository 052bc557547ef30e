//! Result blob decoding: batch output envelope → validated records.
//!
//! A downloaded blob is JSONL, one line per request:
//!
//! ```text
//! {"custom_id": "...", "response": {"status_code": 200, "body": {"choices": [{"message": {"content": "..."}}]}}, "error": null}
//! ```
//!
//! Each line is unwrapped to `(custom_id, content)` and the content goes
//! through [`parse_and_validate`] with the `custom_id` as the expected speech.
//! Failures are isolated per line and counted in the chunk's report.

use cbspeech_core::chunker::ChunkRequest;
use cbspeech_core::domain::SentimentRecord;
use cbspeech_core::validate::{
    parse_and_validate, ValidationError, ValidationErrorKind, ValidationReport,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

#[derive(Debug, Deserialize)]
struct OutputLine {
    #[serde(default)]
    custom_id: Option<String>,
    #[serde(default)]
    response: Option<ResponseEnvelope>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ResponseEnvelope {
    status_code: u16,
    #[serde(default)]
    body: Value,
}

/// One rejected output, kept for the validation summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedOutput {
    pub chunk_index: usize,
    pub speech_id: Option<String>,
    pub kind: ValidationErrorKind,
    pub message: String,
}

/// Validated records and counts for one chunk.
#[derive(Debug, Clone, Default)]
pub struct ChunkOutcome {
    pub chunk_index: usize,
    pub records: Vec<SentimentRecord>,
    pub report: ValidationReport,
    pub rejects: Vec<RejectedOutput>,
}

impl ChunkOutcome {
    fn reject(&mut self, speech_id: Option<&str>, error: ValidationError) {
        tracing::debug!(
            chunk = self.chunk_index,
            speech_id = speech_id.unwrap_or("-"),
            error = %error,
            "output rejected"
        );
        self.report.record_error(&error);
        self.rejects.push(RejectedOutput {
            chunk_index: self.chunk_index,
            speech_id: speech_id.map(str::to_string),
            kind: error.kind(),
            message: error.to_string(),
        });
    }
}

/// Pull the assistant message content out of a chat-completions body.
fn message_content(body: &Value) -> Option<&str> {
    body.get("choices")?
        .get(0)?
        .get("message")?
        .get("content")?
        .as_str()
}

/// Decode and validate every line of a chunk's result blob.
pub fn validate_chunk_output(chunk: &ChunkRequest, blob: &[u8]) -> ChunkOutcome {
    let mut outcome = ChunkOutcome {
        chunk_index: chunk.chunk_index,
        ..ChunkOutcome::default()
    };
    let mut seen: HashSet<String> = HashSet::new();
    let text = String::from_utf8_lossy(blob);

    for line in text.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let parsed: OutputLine = match serde_json::from_str(line) {
            Ok(p) => p,
            Err(e) => {
                outcome.reject(None, ValidationError::Decode(format!("envelope: {e}")));
                continue;
            }
        };

        let custom_id = match parsed.custom_id {
            Some(id) if chunk.contains(&id) && !seen.contains(&id) => id,
            other => {
                let found = other.unwrap_or_default();
                let expected = if seen.contains(&found) {
                    format!("one line for '{found}'")
                } else {
                    format!("a speech of chunk {}", chunk.chunk_index)
                };
                outcome.reject(
                    Some(found.as_str()).filter(|s| !s.is_empty()),
                    ValidationError::Correlation { expected, found: found.clone() },
                );
                continue;
            }
        };
        seen.insert(custom_id.clone());

        if let Some(err) = parsed.error.filter(|e| !e.is_null()) {
            outcome.reject(Some(&custom_id), ValidationError::Provider(err.to_string()));
            continue;
        }
        let Some(response) = parsed.response else {
            outcome.reject(
                Some(&custom_id),
                ValidationError::Provider("line has neither response nor error".into()),
            );
            continue;
        };
        if !(200..300).contains(&response.status_code) {
            outcome.reject(
                Some(&custom_id),
                ValidationError::Provider(format!("HTTP {}", response.status_code)),
            );
            continue;
        }
        let Some(content) = message_content(&response.body) else {
            outcome.reject(
                Some(&custom_id),
                ValidationError::Decode("response carries no message content".into()),
            );
            continue;
        };

        match parse_and_validate(content, &custom_id) {
            Ok(record) => {
                outcome.report.record_valid();
                outcome.records.push(record);
            }
            Err(e) => outcome.reject(Some(&custom_id), e),
        }
    }

    for id in chunk.speech_ids() {
        if !seen.contains(id) {
            outcome.reject(Some(id), ValidationError::MissingOutput);
        }
    }

    if outcome.report.invalid() > 0 {
        tracing::warn!(
            chunk = chunk.chunk_index,
            valid = outcome.report.valid,
            invalid = outcome.report.invalid(),
            "chunk has rejected outputs"
        );
    }
    outcome
}
