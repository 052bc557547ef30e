//! Corpus loading: CSV or JSONL speech files into [`SpeechRecord`]s.
//!
//! Both formats carry `id, date, institution, text` plus optional `title` and
//! `speaker`. Rows are filtered to the configured date range and institutions,
//! sorted by `(date, id)` so chunking is reproducible, and rejected as a whole
//! when an id repeats.

use cbspeech_core::domain::{Institution, SpeechRecord};
use crate::config::CorpusConfig;
use chrono::NaiveDate;
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::io::{self, BufRead};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CorpusError {
    #[error("failed to read corpus {path}: {source}")]
    Io { path: PathBuf, source: io::Error },

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("line {line}: {message}")]
    Row { line: usize, message: String },

    #[error("duplicate speech id '{0}'")]
    DuplicateId(String),

    #[error("unsupported corpus format '{0}' (expected .csv, .jsonl or .json)")]
    UnsupportedFormat(String),
}

/// Which speeches to keep.
#[derive(Debug, Clone, PartialEq)]
pub struct CorpusFilter {
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
    pub institutions: Vec<Institution>,
}

impl Default for CorpusFilter {
    fn default() -> Self {
        Self {
            start: None,
            end: None,
            institutions: Institution::ALL.to_vec(),
        }
    }
}

impl From<&CorpusConfig> for CorpusFilter {
    fn from(cfg: &CorpusConfig) -> Self {
        Self {
            start: cfg.start,
            end: cfg.end,
            institutions: cfg.institutions.clone(),
        }
    }
}

impl CorpusFilter {
    pub fn accepts(&self, speech: &SpeechRecord) -> bool {
        self.start.map_or(true, |s| speech.date >= s)
            && self.end.map_or(true, |e| speech.date <= e)
            && self.institutions.contains(&speech.institution)
    }
}

/// Row shape shared by both file formats. Institution is parsed leniently.
#[derive(Debug, Deserialize)]
struct RawSpeech {
    id: String,
    date: NaiveDate,
    institution: String,
    text: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    speaker: Option<String>,
}

impl RawSpeech {
    fn into_record(self, line: usize) -> Result<SpeechRecord, CorpusError> {
        let institution = self
            .institution
            .parse::<Institution>()
            .map_err(|message| CorpusError::Row { line, message })?;
        if self.id.trim().is_empty() {
            return Err(CorpusError::Row {
                line,
                message: "empty speech id".into(),
            });
        }
        Ok(SpeechRecord {
            id: self.id,
            date: self.date,
            institution,
            text: self.text,
            title: self.title.filter(|t| !t.is_empty()),
            speaker: self.speaker.filter(|s| !s.is_empty()),
        })
    }
}

/// Load, filter and sort a corpus file. Format is chosen by extension.
pub fn load_corpus(path: &Path, filter: &CorpusFilter) -> Result<Vec<SpeechRecord>, CorpusError> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    let all = match ext.as_str() {
        "csv" => read_csv(path)?,
        "jsonl" | "json" => read_jsonl(path)?,
        other => return Err(CorpusError::UnsupportedFormat(other.to_string())),
    };
    let total = all.len();

    {
        let mut seen = HashSet::with_capacity(total);
        for speech in &all {
            if !seen.insert(speech.id.as_str()) {
                return Err(CorpusError::DuplicateId(speech.id.clone()));
            }
        }
    }

    let mut speeches: Vec<SpeechRecord> = all.into_iter().filter(|s| filter.accepts(s)).collect();
    speeches.sort_by(|a, b| a.date.cmp(&b.date).then_with(|| a.id.cmp(&b.id)));

    tracing::info!(
        path = %path.display(),
        total,
        kept = speeches.len(),
        "loaded corpus"
    );
    Ok(speeches)
}

fn read_csv(path: &Path) -> Result<Vec<SpeechRecord>, CorpusError> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::Headers)
        .from_path(path)?;

    let mut out = Vec::new();
    for (i, row) in reader.deserialize::<RawSpeech>().enumerate() {
        // Line 1 is the header.
        out.push(row?.into_record(i + 2)?);
    }
    Ok(out)
}

fn read_jsonl(path: &Path) -> Result<Vec<SpeechRecord>, CorpusError> {
    let file = fs::File::open(path).map_err(|source| CorpusError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let reader = io::BufReader::new(file);

    let mut out = Vec::new();
    for (i, line) in reader.lines().enumerate() {
        let line_no = i + 1;
        let line = line.map_err(|source| CorpusError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        if line.trim().is_empty() {
            continue;
        }
        let raw: RawSpeech = serde_json::from_str(&line).map_err(|e| CorpusError::Row {
            line: line_no,
            message: e.to_string(),
        })?;
        out.push(raw.into_record(line_no)?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        let mut f = fs::File::create(&path).unwrap();
        f.write_all(body.as_bytes()).unwrap();
        path
    }

    #[test]
    fn loads_csv_sorted_and_filtered() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            dir.path(),
            "speeches.csv",
            "id,date,institution,text,title,speaker\n\
             b,2021-03-02,ECB,\"Price stability, first\",,Lagarde\n\
             a,2021-03-01,fed,Labor markets are tight,Outlook,\n\
             c,2019-01-01,Fed,Too early,,\n",
        );
        let filter = CorpusFilter {
            start: NaiveDate::from_ymd_opt(2020, 1, 1),
            ..CorpusFilter::default()
        };

        let speeches = load_corpus(&path, &filter).unwrap();
        let ids: Vec<&str> = speeches.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(speeches[0].institution, Institution::Fed);
        assert_eq!(speeches[0].title.as_deref(), Some("Outlook"));
        assert_eq!(speeches[0].speaker, None);
        assert_eq!(speeches[1].text, "Price stability, first");
        assert_eq!(speeches[1].speaker.as_deref(), Some("Lagarde"));
    }

    #[test]
    fn loads_jsonl_and_filters_institution() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            dir.path(),
            "speeches.jsonl",
            r#"{"id":"x1","date":"2022-05-01","institution":"ECB","text":"t1"}

{"id":"x2","date":"2022-05-02","institution":"Fed","text":"t2","speaker":"Powell"}
"#,
        );
        let filter = CorpusFilter {
            institutions: vec![Institution::Fed],
            ..CorpusFilter::default()
        };
        let speeches = load_corpus(&path, &filter).unwrap();
        assert_eq!(speeches.len(), 1);
        assert_eq!(speeches[0].id, "x2");
        assert_eq!(speeches[0].speaker.as_deref(), Some("Powell"));
    }

    #[test]
    fn duplicate_ids_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            dir.path(),
            "dup.csv",
            "id,date,institution,text\n\
             s1,2021-01-01,Fed,one\n\
             s1,2021-01-02,Fed,two\n",
        );
        let err = load_corpus(&path, &CorpusFilter::default()).unwrap_err();
        assert!(matches!(err, CorpusError::DuplicateId(id) if id == "s1"));
    }

    #[test]
    fn unknown_institution_names_the_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            dir.path(),
            "bad.jsonl",
            r#"{"id":"x1","date":"2022-05-01","institution":"BoE","text":"t"}"#,
        );
        let err = load_corpus(&path, &CorpusFilter::default()).unwrap_err();
        assert!(matches!(err, CorpusError::Row { line: 1, .. }));
    }

    #[test]
    fn unsupported_extension() {
        let err = load_corpus(Path::new("speeches.xlsx"), &CorpusFilter::default()).unwrap_err();
        assert!(matches!(err, CorpusError::UnsupportedFormat(_)));
    }
}
