//! Pipeline configuration loaded from `cbspeech.toml`.
//!
//! Every section has defaults, so an empty file (or no file) is a valid
//! configuration apart from the corpus path. The CLI applies its flag
//! overrides on top of the parsed value and then calls [`PipelineConfig::validate`].

use cbspeech_core::chunker::{ChunkLimits, DEFAULT_MAX_REQUESTS_PER_CHUNK};
use cbspeech_core::domain::Institution;
use cbspeech_core::tokens::CharRatioEstimator;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default token budget per chunk, below the provider enqueued-token limit.
pub const DEFAULT_MAX_TOKENS_PER_CHUNK: usize = 1_800_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Full pipeline configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub corpus: CorpusConfig,
    pub model: ModelConfig,
    pub batching: BatchingConfig,
    pub polling: PollingConfig,
    pub transport: TransportConfig,
    pub output: OutputConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorpusConfig {
    /// CSV or JSONL file with `id, date, institution, text`.
    pub path: PathBuf,
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
    pub institutions: Vec<Institution>,
}

impl Default for CorpusConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("speeches.csv"),
            start: None,
            end: None,
            institutions: Institution::ALL.to_vec(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub name: String,
    pub temperature: f64,
    /// Truncate speech text to this many characters before prompting.
    pub max_text_chars: Option<usize>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: "gpt-4o-mini".into(),
            temperature: 0.0,
            max_text_chars: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchingConfig {
    pub max_tokens_per_chunk: usize,
    pub max_requests_per_chunk: usize,
    pub chars_per_token: usize,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            max_tokens_per_chunk: DEFAULT_MAX_TOKENS_PER_CHUNK,
            max_requests_per_chunk: DEFAULT_MAX_REQUESTS_PER_CHUNK,
            chars_per_token: CharRatioEstimator::DEFAULT_CHARS_PER_TOKEN,
        }
    }
}

impl BatchingConfig {
    pub fn limits(&self) -> ChunkLimits {
        ChunkLimits {
            max_tokens_per_chunk: self.max_tokens_per_chunk,
            max_requests_per_chunk: self.max_requests_per_chunk,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    pub interval_secs: u64,
    /// Stop waiting after this many sweeps. `None` waits until every chunk is terminal.
    pub max_sweeps: Option<u32>,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            max_sweeps: None,
        }
    }
}

impl PollingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub base_url: String,
    /// Name of the environment variable holding the API key.
    pub api_key_env: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".into(),
            api_key_env: "OPENAI_API_KEY".into(),
            timeout_secs: 120,
            max_retries: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub run_dir: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            run_dir: PathBuf::from("runs/default"),
        }
    }
}

impl PipelineConfig {
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }

    /// Load `path` when it exists, defaults otherwise.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let (Some(start), Some(end)) = (self.corpus.start, self.corpus.end) {
            if end < start {
                return Err(ConfigError::Invalid(format!(
                    "corpus end {end} is before start {start}"
                )));
            }
        }
        if self.corpus.institutions.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one institution is required".into(),
            ));
        }
        if self.batching.max_tokens_per_chunk == 0 {
            return Err(ConfigError::Invalid(
                "batching.max_tokens_per_chunk must be > 0".into(),
            ));
        }
        if self.batching.max_requests_per_chunk == 0 {
            return Err(ConfigError::Invalid(
                "batching.max_requests_per_chunk must be > 0".into(),
            ));
        }
        if self.batching.chars_per_token == 0 {
            return Err(ConfigError::Invalid(
                "batching.chars_per_token must be > 0".into(),
            ));
        }
        if self.polling.interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "polling.interval_secs must be > 0".into(),
            ));
        }
        if !(0.0..=2.0).contains(&self.model.temperature) {
            return Err(ConfigError::Invalid(format!(
                "model.temperature {} outside [0, 2]",
                self.model.temperature
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let cfg = PipelineConfig::from_toml("").unwrap();
        assert_eq!(cfg, PipelineConfig::default());
        assert_eq!(cfg.polling.interval_secs, 60);
        assert_eq!(cfg.batching.chars_per_token, 4);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn parses_sections() {
        let cfg = PipelineConfig::from_toml(
            r#"
            [corpus]
            path = "data/speeches.jsonl"
            start = "2010-01-01"
            end = "2020-12-31"
            institutions = ["ECB"]

            [model]
            name = "gpt-4o"
            temperature = 0.2

            [batching]
            max_tokens_per_chunk = 90000

            [polling]
            interval_secs = 5
            max_sweeps = 10

            [output]
            run_dir = "runs/ecb"
            "#,
        )
        .unwrap();

        assert_eq!(cfg.corpus.institutions, vec![Institution::Ecb]);
        assert_eq!(cfg.corpus.start, NaiveDate::from_ymd_opt(2010, 1, 1));
        assert_eq!(cfg.model.name, "gpt-4o");
        assert_eq!(cfg.batching.limits().max_tokens_per_chunk, 90_000);
        assert_eq!(
            cfg.batching.limits().max_requests_per_chunk,
            DEFAULT_MAX_REQUESTS_PER_CHUNK
        );
        assert_eq!(cfg.polling.max_sweeps, Some(10));
        assert_eq!(cfg.output.run_dir, PathBuf::from("runs/ecb"));
        cfg.validate().unwrap();
    }

    #[test]
    fn stale_prompt_version_key_is_ignored() {
        let cfg = PipelineConfig::from_toml(
            r#"
            [model]
            name = "gpt-4o"
            prompt_version = "hand-edited"
            "#,
        )
        .unwrap();
        assert_eq!(
            cfg.model,
            ModelConfig {
                name: "gpt-4o".into(),
                ..ModelConfig::default()
            }
        );
    }

    #[test]
    fn rejects_inverted_range() {
        let mut cfg = PipelineConfig::default();
        cfg.corpus.start = NaiveDate::from_ymd_opt(2020, 1, 2);
        cfg.corpus.end = NaiveDate::from_ymd_opt(2020, 1, 1);
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn rejects_zero_budget_and_interval() {
        let mut cfg = PipelineConfig::default();
        cfg.batching.max_tokens_per_chunk = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = PipelineConfig::default();
        cfg.polling.interval_secs = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = PipelineConfig::default();
        cfg.corpus.institutions.clear();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn unknown_institution_is_parse_error() {
        let err = PipelineConfig::from_toml("[corpus]\ninstitutions = [\"BoE\"]").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
