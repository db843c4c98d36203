//! Job registry.
//!
//! `QueueManager` owns the ordered job list. It is only ever touched from
//! the server's command loop, so it needs no locking; the resource manager
//! it consults for schedulability is the one shared piece.

mod change;
mod ingest;
mod sources;

pub use change::ChangeResult;
pub use ingest::AddSummary;
pub use sources::{FAILED_DIR, SUCCEEDED_DIR};

use crate::catalog::Catalog;
use crate::encode::Outcome;
use crate::hash::HashCache;
use crate::job::{Job, JobId, JobState};
use crate::resource::ResourceManager;
use crate::rpc::{EventSink, QueueUpdateKind, ServerMessage};
use crate::scheduler::resource_request;
use crate::store::{QueueSnapshot, StoreError};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

pub struct QueueManager {
    jobs: Vec<Job>,
    next_id: JobId,
    dirty: bool,
    /// Set when the admission order or the queued set may have changed.
    schedule_dirty: bool,
    hash_cache: HashCache,
    resources: Arc<ResourceManager>,
    events: Arc<dyn EventSink>,
}

impl QueueManager {
    pub fn new(resources: Arc<ResourceManager>, events: Arc<dyn EventSink>) -> Self {
        Self {
            jobs: Vec::new(),
            next_id: 1,
            dirty: false,
            schedule_dirty: false,
            hash_cache: HashCache::new(),
            resources,
            events,
        }
    }

    /// Replace the queue with a restored snapshot.
    pub fn restore(&mut self, snapshot: QueueSnapshot) {
        self.jobs = snapshot.jobs;
        self.next_id = snapshot.next_id.max(1);
        self.renumber();
        self.schedule_dirty = true;
        info!(jobs = self.jobs.len(), next_id = self.next_id, "queue restored");
    }

    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    pub fn get(&self, id: JobId) -> Option<&Job> {
        self.jobs.iter().find(|j| j.id == id)
    }

    fn index_of(&self, id: JobId) -> Option<usize> {
        self.jobs.iter().position(|j| j.id == id)
    }

    pub fn has_active(&self) -> bool {
        self.jobs.iter().any(Job::is_active)
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            next_id: self.next_id,
            jobs: self.jobs.clone(),
        }
    }

    /// Write the queue to `path` if it changed since the last successful
    /// save. On failure the queue stays dirty so the next call retries.
    pub fn save_if_dirty(&mut self, path: &Path) -> Result<bool, StoreError> {
        if !self.dirty {
            return Ok(false);
        }
        self.snapshot().save(path)?;
        self.dirty = false;
        Ok(true)
    }

    /// Whether admission should be re-run; clears the flag.
    pub fn take_schedule_dirty(&mut self) -> bool {
        std::mem::take(&mut self.schedule_dirty)
    }

    fn allocate_id(&mut self) -> JobId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn renumber(&mut self) {
        for (order, job) in self.jobs.iter_mut().enumerate() {
            job.order = order;
        }
        self.schedule_dirty = true;
    }

    fn notify(&mut self, kind: QueueUpdateKind, idx: usize, position: Option<usize>) {
        self.dirty = true;
        self.events
            .publish(ServerMessage::queue_update(kind, &self.jobs[idx], position));
    }

    fn notify_removed(&mut self, job: &Job) {
        self.dirty = true;
        self.events
            .publish(ServerMessage::queue_update(QueueUpdateKind::Remove, job, None));
    }

    fn set_state(job: &mut Job, to: JobState) {
        if let Err(e) = job.transition(to) {
            warn!(error = %e, "state change rejected");
        }
    }

    /// Why the job at `idx` cannot be queued yet, resolving what it can on
    /// the way (profile snapshot, manifest hash).
    fn eligibility(&mut self, idx: usize, catalog: &Catalog) -> Result<(), String> {
        let job = &mut self.jobs[idx];

        if !job.is_check() && job.profile.is_none() {
            let resolved = catalog.profiles.resolve(&job.profile_name, job)?;
            if let Some(p) = resolved.priority {
                job.set_priority(p);
            }
            job.profile = Some(resolved.profile);
        }

        if job.service_id < 0 {
            return Err("stream information not available".to_string());
        }
        let service = catalog
            .services
            .get(&job.service_id)
            .ok_or_else(|| format!("service {} is not registered", job.service_id))?;

        if let Some(profile) = job.profile.as_ref().filter(|_| !job.is_check()) {
            if !catalog.setting.logo_pending_as_error
                && profile.needs_logo()
                && !service.has_usable_logo(job.ts_time)
            {
                return Err(format!("no logo for service {}", job.service_id));
            }
        }

        if job.needs_separate_hash() {
            job.hash = Some(self.hash_cache.lookup(&job.src_path)?);
        }

        if !self.resources.can_ever_satisfy(resource_request(job)) {
            return Err("resource request can never be satisfied".to_string());
        }
        Ok(())
    }

    /// Re-evaluate one pending/queued job. Returns whether its visible state
    /// (state or reason) changed; callers decide whether to notify.
    pub fn update_queue_item(&mut self, idx: usize, catalog: &Catalog) -> bool {
        if !matches!(self.jobs[idx].state, JobState::Pending | JobState::Queued) {
            return false;
        }
        let before = (self.jobs[idx].state, self.jobs[idx].fail_reason.clone());
        let verdict = self.eligibility(idx, catalog);

        let job = &mut self.jobs[idx];
        match verdict {
            Ok(()) => {
                Self::set_state(job, JobState::Queued);
                job.fail_reason.clear();
            }
            Err(reason) => {
                Self::set_state(job, JobState::Pending);
                job.fail_reason = reason;
            }
        }
        let changed = job.state != before.0 || job.fail_reason != before.1;
        if changed {
            self.dirty = true;
            self.schedule_dirty = true;
        }
        changed
    }

    /// Re-evaluate every pending/queued job, notifying only the ones whose
    /// state changed.
    pub fn update_all_pending(&mut self, catalog: &Catalog) -> usize {
        let mut changed = 0;
        for idx in 0..self.jobs.len() {
            if self.update_queue_item(idx, catalog) {
                self.notify(QueueUpdateKind::Update, idx, None);
                changed += 1;
            }
        }
        changed
    }

    /// Forget cached hash manifests, e.g. after new files were dropped in.
    pub fn clear_hash_cache(&mut self) {
        self.hash_cache.clear();
    }

    /// Re-resolve the job's profile reference and take a fresh snapshot.
    ///
    /// Returns true when the snapshot or priority changed (including the
    /// reference becoming unresolvable).
    pub fn update_profile_item(&mut self, idx: usize, catalog: &Catalog) -> bool {
        let job = &mut self.jobs[idx];
        if job.is_check() {
            return false;
        }
        let changed = match catalog.profiles.resolve(&job.profile_name, job) {
            Ok(resolved) => {
                let priority = resolved.priority.unwrap_or(job.priority);
                let same = job.profile.as_ref().map_or(false, |cur| {
                    cur.name == resolved.profile.name
                        && cur.last_update == resolved.profile.last_update
                })
                    && job.priority == priority;
                if !same {
                    job.profile = Some(resolved.profile);
                    job.set_priority(priority);
                }
                !same
            }
            Err(_) => job.profile.take().is_some(),
        };
        if changed {
            self.dirty = true;
            self.schedule_dirty = true;
            self.update_queue_item(idx, catalog);
        }
        changed
    }

    /// Bind a queued job to a worker.
    pub fn mark_running(&mut self, id: JobId) -> bool {
        let Some(idx) = self.index_of(id) else {
            return false;
        };
        if self.jobs[idx].transition(JobState::Running).is_err() {
            return false;
        }
        self.notify(QueueUpdateKind::Update, idx, None);
        true
    }

    /// Record a worker's result. Returns the job as finished, or `None` if
    /// it was removed while running.
    pub fn finish_job(&mut self, id: JobId, outcome: &Outcome) -> Option<Job> {
        let idx = self.index_of(id)?;
        {
            let job = &mut self.jobs[idx];
            if job.state == JobState::Running {
                let to = if outcome.canceled {
                    JobState::Canceled
                } else if outcome.success {
                    JobState::Complete
                } else {
                    JobState::Failed
                };
                Self::set_state(job, to);
                job.fail_reason = if outcome.success {
                    String::new()
                } else {
                    outcome.reason.clone()
                };
            }
        }
        self.notify(QueueUpdateKind::Update, idx, None);
        self.schedule_dirty = true;

        let job = self.jobs[idx].clone();
        if job.is_batch() && matches!(job.state, JobState::Complete | JobState::Failed) {
            if let Err(e) = self.settle_source(&job) {
                warn!(job_id = id, error = %e, "failed to move source file");
                self.events.publish(ServerMessage::operation_failed(format!(
                    "failed to move {}: {}",
                    job.src_path.display(),
                    e
                )));
            }
        }
        Some(job)
    }

    /// Fraction of enabled work that is done.
    pub fn progress(&self) -> f64 {
        let enabled = self
            .jobs
            .iter()
            .filter(|j| !matches!(j.state, JobState::Pending | JobState::PreFailed))
            .count() as f64;
        let remain = self
            .jobs
            .iter()
            .filter(|j| matches!(j.state, JobState::Queued | JobState::Running))
            .count() as f64;
        (enabled - remain + 0.1) / (enabled + 0.1)
    }

    pub fn counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for job in &self.jobs {
            *counts.entry(job.state.to_string()).or_insert(0) += 1;
        }
        counts
    }
}
