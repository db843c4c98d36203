//! File-backed persistence.
//!
//! Mutable documents (queue snapshot, settings) are replaced with
//! write-temp-then-rename. Log records go to append-only JSON-lines files.

use crate::job::{Job, JobId};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

/// Errors from the file-backed store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("JSON error on {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    fn io(path: &Path, source: io::Error) -> Self {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn json(path: &Path, source: serde_json::Error) -> Self {
        StoreError::Json {
            path: path.to_path_buf(),
            source,
        }
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

/// Replace `path` with `bytes` so readers see either the old or new file.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
        }
    }
    let tmp = tmp_path(path);
    {
        let mut file = File::create(&tmp).map_err(|e| StoreError::io(&tmp, e))?;
        file.write_all(bytes).map_err(|e| StoreError::io(&tmp, e))?;
        file.sync_all().map_err(|e| StoreError::io(&tmp, e))?;
    }
    fs::rename(&tmp, path).map_err(|e| StoreError::io(path, e))
}

/// Serialize `value` as pretty JSON and write it atomically.
pub fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|e| StoreError::json(path, e))?;
    write_atomic(path, &bytes)
}

/// Read a JSON document; a missing file is `Ok(None)`.
pub fn load_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    let bytes = match fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StoreError::io(path, e)),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| StoreError::json(path, e))
}

/// Persisted queue: the job list plus the id counter.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct QueueSnapshot {
    pub next_id: JobId,
    pub jobs: Vec<Job>,
}

impl QueueSnapshot {
    pub fn save(&self, path: &Path) -> Result<(), StoreError> {
        save_json(path, self)
    }

    /// Load a snapshot and make it safe to run from.
    ///
    /// Running/queued jobs go back to pending, ranks become dense, duplicate
    /// ids are dropped and `next_id` is moved past every id in use. A corrupt
    /// file is reported and treated as an empty queue.
    pub fn load(path: &Path) -> Self {
        let mut snapshot = match load_json::<QueueSnapshot>(path) {
            Ok(Some(s)) => s,
            Ok(None) => return Self::default(),
            Err(e) => {
                warn!(error = %e, "queue snapshot unreadable, starting empty");
                return Self::default();
            }
        };

        let mut seen = HashSet::new();
        snapshot.jobs.retain(|job| {
            let fresh = seen.insert(job.id);
            if !fresh {
                warn!(job_id = job.id, "dropping duplicate job id from snapshot");
            }
            fresh
        });

        for (order, job) in snapshot.jobs.iter_mut().enumerate() {
            job.restore_after_restart();
            job.order = order;
        }

        let max_id = snapshot.jobs.iter().map(|j| j.id).max();
        if let Some(max_id) = max_id {
            snapshot.next_id = snapshot.next_id.max(max_id + 1);
        }
        snapshot
    }
}

/// A log record that can be pruned by age.
pub trait LogRecord {
    fn started_at(&self) -> DateTime<Utc>;
}

/// Result of one encode job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogItem {
    pub success: bool,
    #[serde(default)]
    pub reason: String,
    pub job_id: JobId,
    pub src_path: PathBuf,
    #[serde(default)]
    pub out_paths: Vec<PathBuf>,
    #[serde(default)]
    pub src_file_size: u64,
    #[serde(default)]
    pub out_file_size: u64,
    #[serde(default)]
    pub src_duration: f64,
    #[serde(default)]
    pub out_duration: f64,
    #[serde(default)]
    pub incident: u32,
    #[serde(default)]
    pub profile_name: String,
    #[serde(default)]
    pub service_name: String,
    pub encode_start: DateTime<Utc>,
    pub encode_finish: DateTime<Utc>,
    /// File name of the console transcript in the logs directory.
    #[serde(default)]
    pub console_log: Option<String>,
}

impl LogRecord for LogItem {
    fn started_at(&self) -> DateTime<Utc> {
        self.encode_start
    }
}

/// Result of one analysis (check mode) job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckLogItem {
    pub success: bool,
    #[serde(default)]
    pub reason: String,
    pub job_id: JobId,
    pub src_path: PathBuf,
    #[serde(default)]
    pub service_name: String,
    pub check_start: DateTime<Utc>,
    pub check_finish: DateTime<Utc>,
    #[serde(default)]
    pub console_log: Option<String>,
}

impl LogRecord for CheckLogItem {
    fn started_at(&self) -> DateTime<Utc> {
        self.check_start
    }
}

/// Append-only JSON-lines log.
#[derive(Debug, Clone)]
pub struct LogFile<T> {
    path: PathBuf,
    _record: PhantomData<fn() -> T>,
}

impl<T> LogFile<T>
where
    T: Serialize + DeserializeOwned + LogRecord,
{
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _record: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, record: &T) -> Result<(), StoreError> {
        let mut line = serde_json::to_vec(record).map_err(|e| StoreError::json(&self.path, e))?;
        line.push(b'\n');
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| StoreError::io(&self.path, e))?;
        file.write_all(&line)
            .map_err(|e| StoreError::io(&self.path, e))
    }

    /// Every readable record, oldest first. Corrupt lines are skipped.
    pub fn read_all(&self) -> Vec<T> {
        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) => {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(path = %self.path.display(), error = %e, "failed to open log");
                }
                return Vec::new();
            }
        };
        BufReader::new(file)
            .lines()
            .map_while(Result::ok)
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| match serde_json::from_str(&line) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(path = %self.path.display(), error = %e, "skipping corrupt log line");
                    None
                }
            })
            .collect()
    }

    /// Drop records that started before `cutoff`. Returns how many went.
    pub fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let records = self.read_all();
        let total = records.len();
        let kept: Vec<&T> = records.iter().filter(|r| r.started_at() >= cutoff).collect();
        let removed = total - kept.len();
        if removed == 0 {
            return Ok(0);
        }
        let mut bytes = Vec::new();
        for record in kept {
            serde_json::to_writer(&mut bytes, record).map_err(|e| StoreError::json(&self.path, e))?;
            bytes.push(b'\n');
        }
        write_atomic(&self.path, &bytes)?;
        Ok(removed)
    }
}

/// Delete console transcripts in `dir` last modified before `cutoff`.
pub fn prune_transcripts(dir: &Path, cutoff: DateTime<Utc>) -> usize {
    let entries = match fs::read_dir(dir) {
        Ok(e) => e,
        Err(_) => return 0,
    };
    let mut removed = 0;
    for entry in entries.flatten() {
        let old = entry
            .metadata()
            .and_then(|m| m.modified())
            .map(|t| DateTime::<Utc>::from(t) < cutoff)
            .unwrap_or(false);
        if old && entry.path().extension().map_or(false, |e| e == "txt") {
            match fs::remove_file(entry.path()) {
                Ok(()) => removed += 1,
                Err(e) => warn!(path = %entry.path().display(), error = %e, "failed to delete transcript"),
            }
        }
    }
    removed
}
