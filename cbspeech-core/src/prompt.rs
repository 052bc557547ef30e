//! Prompt construction for per-speech sentiment extraction.
//!
//! Each speech becomes one chat request: a fixed system prompt describing the
//! JSON the model must return, and a user message carrying the speech header
//! and text. The model is asked to echo `speech_id` so the validator can check
//! the correlation.

use crate::domain::SpeechRecord;
use crate::tokens::TokenEstimator;
use serde::{Deserialize, Serialize};

/// Bumped whenever the system prompt or output schema changes; part of the plan fingerprint.
pub const PROMPT_VERSION: &str = "cb-sentiment-v1";

const SYSTEM_PROMPT: &str = "You are an economist who reads central-bank speeches and scores them. \
Respond with a single JSON object and nothing else, with exactly these fields:\n\
- speech_id: string, copied verbatim from the request header\n\
- hawkish_dovish_score: number in [-100, 100]; -100 is maximally dovish, 100 maximally hawkish\n\
- uncertainty: number in [0, 100]; how uncertain the speaker sounds about the outlook\n\
- forward_guidance_strength: number in [0, 100]; how explicit the guidance on future policy is\n\
- topic_inflation, topic_growth, topic_employment, topic_financial_stability, topic_international: \
numbers in [0, 100]; share of emphasis on each topic\n\
- market_impact_stocks, market_impact_bonds, market_impact_currency: one of \"rise\", \"fall\", \"neutral\"; \
the likely reaction of that market to the speech";

/// System + user message for one speech.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptPayload {
    pub system: String,
    pub user: String,
}

impl PromptPayload {
    /// Estimated tokens for the whole payload.
    pub fn estimate_tokens(&self, estimator: &dyn TokenEstimator) -> usize {
        estimator.estimate(&self.system) + estimator.estimate(&self.user)
    }
}

/// Builds prompt payloads from speeches.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    system: String,
    max_text_chars: Option<usize>,
}

impl Default for PromptBuilder {
    fn default() -> Self {
        Self {
            system: SYSTEM_PROMPT.to_string(),
            max_text_chars: None,
        }
    }
}

impl PromptBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Truncate speech text to at most `max` characters.
    pub fn with_max_text_chars(mut self, max: Option<usize>) -> Self {
        self.max_text_chars = max;
        self
    }

    pub fn with_system_prompt(mut self, system: impl Into<String>) -> Self {
        self.system = system.into();
        self
    }

    pub fn build(&self, speech: &SpeechRecord) -> PromptPayload {
        let text = match self.max_text_chars {
            Some(max) => truncate_chars(&speech.text, max),
            None => speech.text.as_str(),
        };

        let mut user = String::with_capacity(text.len() + 160);
        user.push_str(&format!("speech_id: {}\n", speech.id));
        user.push_str(&format!("institution: {}\n", speech.institution));
        user.push_str(&format!("date: {}\n", speech.date));
        if let Some(title) = &speech.title {
            user.push_str(&format!("title: {title}\n"));
        }
        if let Some(speaker) = &speech.speaker {
            user.push_str(&format!("speaker: {speaker}\n"));
        }
        user.push('\n');
        user.push_str(text);

        PromptPayload {
            system: self.system.clone(),
            user,
        }
    }
}

fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((byte_idx, _)) => &text[..byte_idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Institution;
    use chrono::NaiveDate;

    fn speech(text: &str) -> SpeechRecord {
        SpeechRecord {
            id: "fed-2024-001".into(),
            date: NaiveDate::from_ymd_opt(2024, 5, 2).unwrap(),
            institution: Institution::Fed,
            text: text.into(),
            title: Some("Outlook".into()),
            speaker: None,
        }
    }

    #[test]
    fn user_message_carries_header_and_text() {
        let p = PromptBuilder::new().build(&speech("Inflation remains elevated."));
        assert!(p.user.starts_with("speech_id: fed-2024-001\n"));
        assert!(p.user.contains("institution: Fed\n"));
        assert!(p.user.contains("title: Outlook\n"));
        assert!(!p.user.contains("speaker:"));
        assert!(p.user.ends_with("Inflation remains elevated."));
        assert!(p.system.contains("market_impact_currency"));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let p = PromptBuilder::new()
            .with_max_text_chars(Some(3))
            .build(&speech("Zölle steigen"));
        assert!(p.user.ends_with("\n\nZöl"));
    }
}
