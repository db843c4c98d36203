//! Job model and lifecycle state machine.
//!
//! Every state change of a queued job goes through [`Job::transition`], which
//! rejects moves that are not in the lifecycle table.

use crate::profile::Profile;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Numeric job identity, unique for the lifetime of the persisted queue.
pub type JobId = u64;

/// Lowest accepted priority.
pub const MIN_PRIORITY: u8 = 1;
/// Highest accepted priority.
pub const MAX_PRIORITY: u8 = 5;
/// Priority given to jobs whose request did not name one.
pub const DEFAULT_PRIORITY: u8 = 3;

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Profile or another prerequisite is not resolvable yet.
    Pending,
    /// Eligible and waiting for a worker.
    Queued,
    /// Bound to a worker slot.
    Running,
    /// Finished successfully.
    Complete,
    /// Finished with a failure reason.
    Failed,
    /// Ingestion failed; never retried.
    PreFailed,
    /// Canceled by the user or an add hook.
    Canceled,
}

impl Default for JobState {
    fn default() -> Self {
        Self::Pending
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Pending => write!(f, "pending"),
            JobState::Queued => write!(f, "queued"),
            JobState::Running => write!(f, "running"),
            JobState::Complete => write!(f, "complete"),
            JobState::Failed => write!(f, "failed"),
            JobState::PreFailed => write!(f, "pre_failed"),
            JobState::Canceled => write!(f, "canceled"),
        }
    }
}

impl JobState {
    /// Pending, queued or running.
    pub fn is_active(self) -> bool {
        matches!(self, JobState::Pending | JobState::Queued | JobState::Running)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }

    /// Whether the lifecycle table allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Pending, Queued)
                | (Pending, PreFailed)
                | (Pending, Canceled)
                | (Queued, Pending)
                | (Queued, Running)
                | (Queued, Canceled)
                | (Running, Complete)
                | (Running, Failed)
                | (Running, Canceled)
                | (Failed, Pending)
                | (Canceled, Pending)
        )
    }
}

/// How a job entered the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddMode {
    /// Directory/file batch submitted by a user.
    Batch,
    /// Batch submitted by an automated recorder hook.
    AutoBatch,
    /// Ad-hoc single submission.
    Single,
    /// Analysis-only run; produces a check log record.
    Check,
}

impl Default for AddMode {
    fn default() -> Self {
        Self::Batch
    }
}

impl std::fmt::Display for AddMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AddMode::Batch => write!(f, "batch"),
            AddMode::AutoBatch => write!(f, "auto_batch"),
            AddMode::Single => write!(f, "single"),
            AddMode::Check => write!(f, "check"),
        }
    }
}

impl AddMode {
    /// Batch jobs have their source file moved as a group on completion.
    pub fn is_batch(self) -> bool {
        matches!(self, AddMode::Batch | AddMode::AutoBatch)
    }
}

/// Rejected lifecycle move.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("job {id}: illegal transition {from} -> {to}")]
pub struct TransitionError {
    pub id: JobId,
    pub from: JobState,
    pub to: JobState,
}

/// One unit of requested encoding work.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: JobId,
    /// Rank in the queue; always equal to the job's index.
    pub order: usize,
    pub src_path: PathBuf,
    /// Expected SHA-256 (hex) of the source, for network-transferred files.
    #[serde(default)]
    pub hash: Option<String>,
    /// Source arrived over a network share and must be integrity-checked.
    #[serde(default)]
    pub remote: bool,
    pub dst_dir: PathBuf,
    pub dst_name: String,
    /// Literal profile name or an `auto:` selector.
    pub profile_name: String,
    /// Resolved snapshot; `None` while unresolved.
    #[serde(default)]
    pub profile: Option<Profile>,
    pub priority: u8,
    #[serde(default)]
    pub state: JobState,
    #[serde(default)]
    pub fail_reason: String,
    pub mode: AddMode,
    pub added_at: DateTime<Utc>,
    #[serde(default)]
    pub encode_start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub encode_finish: Option<DateTime<Utc>>,

    // Stream attributes from the prober
    #[serde(default = "unknown_service")]
    pub service_id: i32,
    #[serde(default)]
    pub service_name: String,
    #[serde(default)]
    pub event_name: String,
    #[serde(default)]
    pub ts_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub genres: Vec<String>,
    #[serde(default)]
    pub video_width: u32,
    #[serde(default)]
    pub video_height: u32,
    #[serde(default)]
    pub stream_format: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

fn unknown_service() -> i32 {
    -1
}

/// Fields needed to create a job; everything else starts at its default.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub src_path: PathBuf,
    pub hash: Option<String>,
    pub remote: bool,
    pub dst_dir: PathBuf,
    pub dst_name: String,
    pub profile_name: String,
    pub priority: u8,
    pub mode: AddMode,
}

impl Job {
    /// Create a `Pending` job. Id and rank are assigned on commit.
    pub fn new(fields: NewJob) -> Self {
        Self {
            id: 0,
            order: 0,
            src_path: fields.src_path,
            hash: fields.hash,
            remote: fields.remote,
            dst_dir: fields.dst_dir,
            dst_name: fields.dst_name,
            profile_name: fields.profile_name,
            profile: None,
            priority: clamp_priority(fields.priority),
            state: JobState::Pending,
            fail_reason: String::new(),
            mode: fields.mode,
            added_at: Utc::now(),
            encode_start: None,
            encode_finish: None,
            service_id: -1,
            service_name: String::new(),
            event_name: String::new(),
            ts_time: None,
            genres: Vec::new(),
            video_width: 0,
            video_height: 0,
            stream_format: String::new(),
            tags: Vec::new(),
        }
    }

    /// Create a job that failed during ingestion.
    pub fn pre_failed(fields: NewJob, reason: impl Into<String>) -> Self {
        let mut job = Self::new(fields);
        job.state = JobState::PreFailed;
        job.fail_reason = reason.into();
        job
    }

    /// Apply a lifecycle move, stamping encode start/finish times.
    pub fn transition(&mut self, to: JobState) -> Result<(), TransitionError> {
        if self.state == to {
            return Ok(());
        }
        if !self.state.can_transition_to(to) {
            return Err(TransitionError {
                id: self.id,
                from: self.state,
                to,
            });
        }
        match to {
            JobState::Running => {
                self.encode_start = Some(Utc::now());
                self.encode_finish = None;
            }
            JobState::Complete | JobState::Failed | JobState::Canceled
                if self.state == JobState::Running =>
            {
                self.encode_finish = Some(Utc::now());
            }
            JobState::Pending => {
                self.encode_start = None;
                self.encode_finish = None;
            }
            _ => {}
        }
        self.state = to;
        Ok(())
    }

    /// Reset a job restored from disk: the previous process's execution
    /// state is not trusted.
    pub fn restore_after_restart(&mut self) {
        if matches!(self.state, JobState::Running | JobState::Queued) {
            self.state = JobState::Pending;
            self.encode_start = None;
            self.encode_finish = None;
        }
    }

    /// Copy of this job's parameters as a fresh `Pending` job.
    ///
    /// The profile snapshot is a value copy; the two jobs share nothing.
    pub fn duplicate_as(&self, id: JobId) -> Job {
        let mut dup = self.clone();
        dup.id = id;
        dup.state = JobState::Pending;
        dup.fail_reason.clear();
        dup.added_at = Utc::now();
        dup.encode_start = None;
        dup.encode_finish = None;
        dup
    }

    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    pub fn is_batch(&self) -> bool {
        self.mode.is_batch()
    }

    pub fn is_check(&self) -> bool {
        self.mode == AddMode::Check
    }

    /// A remote source without an inline hash needs the directory manifest.
    pub fn needs_separate_hash(&self) -> bool {
        self.remote && self.hash.is_none()
    }

    pub fn output_path(&self) -> PathBuf {
        self.dst_dir.join(&self.dst_name)
    }

    pub fn src_file_name(&self) -> String {
        file_name_of(&self.src_path)
    }

    pub fn set_priority(&mut self, priority: u8) {
        self.priority = clamp_priority(priority);
    }
}

/// Clamp to the accepted priority range; 0 means "default".
pub fn clamp_priority(priority: u8) -> u8 {
    if priority == 0 {
        DEFAULT_PRIORITY
    } else {
        priority.clamp(MIN_PRIORITY, MAX_PRIORITY)
    }
}

pub(crate) fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
pub(crate) fn test_job(id: JobId, src: &str) -> Job {
    let mut job = Job::new(NewJob {
        src_path: PathBuf::from(src),
        hash: None,
        remote: false,
        dst_dir: PathBuf::from("/out"),
        dst_name: "out".to_string(),
        profile_name: "default".to_string(),
        priority: DEFAULT_PRIORITY,
        mode: AddMode::Batch,
    });
    job.id = id;
    job
}
