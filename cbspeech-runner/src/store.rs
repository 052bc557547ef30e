//! Durable run state under a run directory.
//!
//! ```text
//! <run_dir>/
//!   plan.json                   plan manifest (fingerprint, limits, counts)
//!   chunks/chunk_NNNN.json      one ChunkRequest per chunk
//!   lifecycle/chunk_NNNN.json   one ChunkLifecycleState per submitted chunk
//!   lifecycle/audit.jsonl       append-only transition log
//!   results/chunk_NNNN.jsonl    downloaded raw result blobs
//!   records.jsonl               validated sentiment records
//! ```
//!
//! Every JSON write is atomic: write `<name>.tmp`, fsync, rename over the
//! target. A crash mid-write leaves the previous version in place and at
//! worst a stray `.tmp` file, which readers ignore. Writes go through one
//! mutex so concurrent submitters never interleave.

use cbspeech_core::chunker::{ChunkLimits, ChunkOversizeWarning, ChunkRequest};
use cbspeech_core::domain::{SentimentRecord, SubmissionId};
use cbspeech_core::fingerprint::PlanHash;
use cbspeech_core::lifecycle::{ChunkLifecycleState, ChunkStatus};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error at {path}: {source}")]
    Io { path: PathBuf, source: io::Error },

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("corrupt state file {path}: {message}")]
    Corrupt { path: PathBuf, message: String },

    #[error("run directory holds plan {existing}, refusing to mix with plan {requested}")]
    PlanMismatch {
        existing: PlanHash,
        requested: PlanHash,
    },

    #[error("no plan in {0}; run `plan` first")]
    NoPlan(PathBuf),
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Identity and shape of the chunk plan a run directory belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanManifest {
    pub fingerprint: PlanHash,
    pub model: String,
    pub prompt_version: String,
    pub limits: ChunkLimits,
    pub chunk_count: usize,
    pub request_count: usize,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub warnings: Vec<ChunkOversizeWarning>,
}

/// One line of the audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub at: DateTime<Utc>,
    pub chunk_index: usize,
    pub event: String,
    pub submission_id: Option<SubmissionId>,
    pub from: ChunkStatus,
    pub to: ChunkStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

pub struct LifecycleStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl LifecycleStore {
    /// Open (creating if needed) the store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        for dir in [
            root.clone(),
            root.join("chunks"),
            root.join("lifecycle"),
            root.join("results"),
        ] {
            fs::create_dir_all(&dir).map_err(io_err(&dir))?;
        }
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn plan_path(&self) -> PathBuf {
        self.root.join("plan.json")
    }

    fn chunk_path(&self, index: usize) -> PathBuf {
        self.root.join("chunks").join(format!("chunk_{index:04}.json"))
    }

    fn state_path(&self, index: usize) -> PathBuf {
        self.root.join("lifecycle").join(format!("chunk_{index:04}.json"))
    }

    fn audit_path(&self) -> PathBuf {
        self.root.join("lifecycle").join("audit.jsonl")
    }

    fn result_path(&self, index: usize) -> PathBuf {
        self.root.join("results").join(format!("chunk_{index:04}.jsonl"))
    }

    fn records_path(&self) -> PathBuf {
        self.root.join("records.jsonl")
    }

    // ── Plan ─────────────────────────────────────────────────────────

    /// Persist a plan and its chunks. Refuses to overwrite a different plan.
    pub fn save_plan(
        &self,
        manifest: &PlanManifest,
        chunks: &[ChunkRequest],
    ) -> Result<(), StoreError> {
        if let Some(existing) = self.load_plan()? {
            if existing.fingerprint != manifest.fingerprint {
                return Err(StoreError::PlanMismatch {
                    existing: existing.fingerprint,
                    requested: manifest.fingerprint.clone(),
                });
            }
            return Ok(());
        }
        let _guard = self.write_lock.lock().unwrap();
        for chunk in chunks {
            write_json_atomic(&self.chunk_path(chunk.chunk_index), chunk)?;
        }
        // Manifest last: a plan without all chunk files is never visible.
        write_json_atomic(&self.plan_path(), manifest)
    }

    pub fn load_plan(&self) -> Result<Option<PlanManifest>, StoreError> {
        read_json_opt(&self.plan_path())
    }

    pub fn require_plan(&self) -> Result<PlanManifest, StoreError> {
        self.load_plan()?
            .ok_or_else(|| StoreError::NoPlan(self.root.clone()))
    }

    /// Load every chunk of the persisted plan, in index order.
    pub fn load_chunks(&self) -> Result<Vec<ChunkRequest>, StoreError> {
        let manifest = self.require_plan()?;
        (0..manifest.chunk_count)
            .map(|i| {
                let path = self.chunk_path(i);
                read_json_opt::<ChunkRequest>(&path)?.ok_or_else(|| StoreError::Corrupt {
                    path,
                    message: "chunk file missing".into(),
                })
            })
            .collect()
    }

    // ── Lifecycle states ─────────────────────────────────────────────

    pub fn save_state(&self, state: &ChunkLifecycleState) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().unwrap();
        write_json_atomic(&self.state_path(state.chunk_index), state)
    }

    /// Persist a state together with its audit line, under one lock.
    pub fn save_transition(
        &self,
        state: &ChunkLifecycleState,
        audit: &AuditEntry,
    ) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().unwrap();
        write_json_atomic(&self.state_path(state.chunk_index), state)?;
        append_jsonl(&self.audit_path(), audit)
    }

    pub fn load_state(&self, index: usize) -> Result<Option<ChunkLifecycleState>, StoreError> {
        read_json_opt(&self.state_path(index))
    }

    /// Every persisted state, sorted by chunk index. Stray `.tmp` files are ignored.
    pub fn load_all(&self) -> Result<Vec<ChunkLifecycleState>, StoreError> {
        let dir = self.root.join("lifecycle");
        let mut states = Vec::new();
        for entry in fs::read_dir(&dir).map_err(io_err(&dir))? {
            let path = entry.map_err(io_err(&dir))?.path();
            let is_state = path.extension().is_some_and(|e| e == "json")
                && path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with("chunk_"));
            if !is_state {
                continue;
            }
            if let Some(state) = read_json_opt::<ChunkLifecycleState>(&path)? {
                states.push(state);
            }
        }
        states.sort_by_key(|s| s.chunk_index);
        Ok(states)
    }

    /// Audit log in append order. Malformed lines are skipped.
    pub fn read_audit(&self) -> Result<Vec<AuditEntry>, StoreError> {
        read_jsonl(&self.audit_path())
    }

    // ── Results ──────────────────────────────────────────────────────

    pub fn save_result(&self, index: usize, blob: &[u8]) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().unwrap();
        write_bytes_atomic(&self.result_path(index), blob)
    }

    pub fn load_result(&self, index: usize) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.result_path(index);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_err(&path)(e)),
        }
    }

    pub fn has_result(&self, index: usize) -> bool {
        self.result_path(index).exists()
    }

    // ── Validated records ────────────────────────────────────────────

    pub fn write_records(&self, records: &[SentimentRecord]) -> Result<(), StoreError> {
        let mut buf = Vec::new();
        for r in records {
            serde_json::to_writer(&mut buf, r)?;
            buf.push(b'\n');
        }
        let _guard = self.write_lock.lock().unwrap();
        write_bytes_atomic(&self.records_path(), &buf)
    }

    pub fn read_records(&self) -> Result<Vec<SentimentRecord>, StoreError> {
        read_jsonl(&self.records_path())
    }
}

// ── File helpers ─────────────────────────────────────────────────────

/// Write bytes to `path` via `<path>.tmp`, fsync and rename.
pub(crate) fn write_bytes_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_err(parent))?;
    }
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp = PathBuf::from(tmp_name);

    let mut file = fs::File::create(&tmp).map_err(io_err(&tmp))?;
    file.write_all(bytes).map_err(io_err(&tmp))?;
    file.sync_all().map_err(io_err(&tmp))?;
    drop(file);

    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        io_err(path)(e)
    })
}

pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let json = serde_json::to_vec_pretty(value)?;
    write_bytes_atomic(path, &json)
}

fn read_json_opt<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    let bytes = match fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(io_err(path)(e)),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| StoreError::Corrupt {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
}

fn append_jsonl<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let json = serde_json::to_string(value)?;
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(io_err(path))?;
    writeln!(file, "{json}").map_err(io_err(path))?;
    file.flush().map_err(io_err(path))
}

fn read_jsonl<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, StoreError> {
    let file = match fs::File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(io_err(path)(e)),
    };
    let mut out = Vec::new();
    for line in io::BufReader::new(file).lines() {
        let line = line.map_err(io_err(path))?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(&line) {
            Ok(v) => out.push(v),
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping malformed line"),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest(hash: &str, chunk_count: usize) -> PlanManifest {
        PlanManifest {
            fingerprint: PlanHash(hash.into()),
            model: "m".into(),
            prompt_version: "v1".into(),
            limits: ChunkLimits::new(100),
            chunk_count,
            request_count: 0,
            created_at: Utc::now(),
            warnings: Vec::new(),
        }
    }

    #[test]
    fn state_roundtrip_and_sorted_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = LifecycleStore::open(dir.path()).unwrap();
        for i in [3, 0, 1] {
            store
                .save_state(&ChunkLifecycleState::not_submitted(i, 2))
                .unwrap();
        }
        let all = store.load_all().unwrap();
        let idx: Vec<usize> = all.iter().map(|s| s.chunk_index).collect();
        assert_eq!(idx, vec![0, 1, 3]);
        assert_eq!(store.load_state(1).unwrap().unwrap().num_requests, 2);
        assert!(store.load_state(2).unwrap().is_none());
    }

    #[test]
    fn leftover_tmp_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let store = LifecycleStore::open(dir.path()).unwrap();
        let state = ChunkLifecycleState::not_submitted(1, 4);
        store.save_state(&state).unwrap();

        // Simulate a crash mid-write of the next version.
        fs::write(
            dir.path().join("lifecycle").join("chunk_0001.json.tmp"),
            b"{\"chunk_index\": 1, \"stat",
        )
        .unwrap();

        let all = store.load_all().unwrap();
        assert_eq!(all, vec![state.clone()]);

        // The next save replaces the stray tmp and leaves none behind.
        store.save_state(&state).unwrap();
        assert!(!dir.path().join("lifecycle").join("chunk_0001.json.tmp").exists());
    }

    #[test]
    fn plan_mismatch_refused() {
        let dir = tempfile::tempdir().unwrap();
        let store = LifecycleStore::open(dir.path()).unwrap();
        store.save_plan(&manifest("aaa", 0), &[]).unwrap();
        store.save_plan(&manifest("aaa", 0), &[]).unwrap();
        let err = store.save_plan(&manifest("bbb", 0), &[]).unwrap_err();
        assert!(matches!(err, StoreError::PlanMismatch { .. }));
    }

    #[test]
    fn audit_appends_and_skips_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let store = LifecycleStore::open(dir.path()).unwrap();
        let state = ChunkLifecycleState::not_submitted(0, 1);
        let entry = AuditEntry {
            at: Utc::now(),
            chunk_index: 0,
            event: "submitted".into(),
            submission_id: Some(SubmissionId::new("b1")),
            from: ChunkStatus::NotSubmitted,
            to: ChunkStatus::Validating,
            detail: None,
        };
        store.save_transition(&state, &entry).unwrap();
        let mut f = OpenOptions::new()
            .append(true)
            .open(dir.path().join("lifecycle").join("audit.jsonl"))
            .unwrap();
        writeln!(f, "not json").unwrap();
        store.save_transition(&state, &entry).unwrap();

        assert_eq!(store.read_audit().unwrap().len(), 2);
    }

    #[test]
    fn results_and_records() {
        let dir = tempfile::tempdir().unwrap();
        let store = LifecycleStore::open(dir.path()).unwrap();
        assert!(!store.has_result(0));
        store.save_result(0, b"line\n").unwrap();
        assert!(store.has_result(0));
        assert_eq!(store.load_result(0).unwrap().unwrap(), b"line\n");
        assert!(store.read_records().unwrap().is_empty());
    }

    #[test]
    fn load_chunks_requires_plan() {
        let dir = tempfile::tempdir().unwrap();
        let store = LifecycleStore::open(dir.path()).unwrap();
        assert!(matches!(store.load_chunks(), Err(StoreError::NoPlan(_))));
    }
}
