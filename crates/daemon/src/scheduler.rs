//! Admission ordering and the worker slot pool.
//!
//! The pool never runs anything itself. It decides which queued jobs may
//! start, binds them to slots together with their resource reservation and
//! control handles, and the orchestrator spawns the workers.

use crate::job::{Job, JobId, JobState};
use crate::resource::{Reservation, ResourceManager, ResourceRequest};
use std::cmp::Reverse;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Resource request of a job; unresolved and check jobs need no line share.
pub fn resource_request(job: &Job) -> ResourceRequest {
    match &job.profile {
        Some(profile) if !job.is_check() => profile.resource_request(),
        _ => ResourceRequest::default(),
    }
}

/// Queued jobs in admission order.
pub struct ScheduledQueue;

impl ScheduledQueue {
    /// Indices of `Queued` jobs, highest priority first, then by rank.
    pub fn order(jobs: &[Job]) -> Vec<usize> {
        let mut idx: Vec<usize> = jobs
            .iter()
            .enumerate()
            .filter(|(_, j)| j.state == JobState::Queued)
            .map(|(i, _)| i)
            .collect();
        idx.sort_by_key(|&i| (Reverse(jobs[i].priority), jobs[i].order, i));
        idx
    }
}

/// Handles a worker needs to obey cancel/suspend requests.
#[derive(Debug)]
pub struct WorkerControl {
    pub cancel: CancellationToken,
    pub suspend: watch::Receiver<bool>,
}

/// A job bound to a slot, ready to be spawned.
#[derive(Debug)]
pub struct Admission {
    pub slot: usize,
    pub job_id: JobId,
    pub reservation: Reservation,
    pub control: WorkerControl,
}

#[derive(Debug)]
struct RunningWork {
    job_id: JobId,
    cancel: CancellationToken,
    suspend: watch::Sender<bool>,
}

/// Pause/suspend state as reported to clients.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PoolState {
    pub paused: bool,
    pub suspended: bool,
    pub scheduled_suspend: bool,
    pub worker_suspended: Vec<bool>,
    pub running: usize,
    pub parallelism: u32,
}

#[derive(Debug)]
pub struct WorkerPool {
    slots: Vec<Option<RunningWork>>,
    /// Per-slot suspend requested by a client.
    slot_suspended: Vec<bool>,
    parallelism: usize,
    paused: bool,
    suspended_all: bool,
    scheduled_suspend: bool,
    resources: Arc<ResourceManager>,
}

impl WorkerPool {
    pub fn new(parallelism: u32, resources: Arc<ResourceManager>) -> Self {
        let parallelism = parallelism.max(1) as usize;
        Self {
            slots: (0..parallelism).map(|_| None).collect(),
            slot_suspended: vec![false; parallelism],
            parallelism,
            paused: false,
            suspended_all: false,
            scheduled_suspend: false,
            resources,
        }
    }

    pub fn resources(&self) -> &Arc<ResourceManager> {
        &self.resources
    }

    pub fn occupancy(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_running(&self, job_id: JobId) -> bool {
        self.slot_of(job_id).is_some()
    }

    fn slot_of(&self, job_id: JobId) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.as_ref().map_or(false, |w| w.job_id == job_id))
    }

    fn has_capacity(&self) -> bool {
        self.occupancy() < self.parallelism
    }

    fn free_slot(&mut self) -> usize {
        match self.slots.iter().position(Option::is_none) {
            Some(i) => i,
            None => {
                self.slots.push(None);
                self.slots.len() - 1
            }
        }
    }

    fn effective_suspend(&self, slot: usize) -> bool {
        self.suspended_all
            || self.scheduled_suspend
            || self.slot_suspended.get(slot).copied().unwrap_or(false)
    }

    fn bind(&mut self, job_id: JobId, reservation: Reservation) -> Admission {
        let slot = self.free_slot();
        if self.slot_suspended.len() < self.slots.len() {
            self.slot_suspended.resize(self.slots.len(), false);
        }
        let cancel = CancellationToken::new();
        let (suspend_tx, suspend_rx) = watch::channel(self.effective_suspend(slot));
        self.slots[slot] = Some(RunningWork {
            job_id,
            cancel: cancel.clone(),
            suspend: suspend_tx,
        });
        debug!(slot, job_id, line = ?reservation.line(), "job admitted");
        Admission {
            slot,
            job_id,
            reservation,
            control: WorkerControl {
                cancel,
                suspend: suspend_rx,
            },
        }
    }

    /// Admit as many queued jobs as slots and resources allow.
    ///
    /// Jobs whose resource request cannot be granted right now are skipped,
    /// so a cheaper job further down the order can still start.
    pub fn admit(&mut self, jobs: &[Job]) -> Vec<Admission> {
        let mut admitted = Vec::new();
        if self.paused {
            return admitted;
        }
        for idx in ScheduledQueue::order(jobs) {
            if !self.has_capacity() {
                break;
            }
            let job = &jobs[idx];
            if self.is_running(job.id) {
                continue;
            }
            if let Some(reservation) = self.resources.try_reserve(resource_request(job)) {
                admitted.push(self.bind(job.id, reservation));
            }
        }
        admitted
    }

    /// Start `job` now, ignoring order and queue pause.
    pub fn force_start(&mut self, job: &Job) -> Option<Admission> {
        if job.state != JobState::Queued || self.is_running(job.id) || !self.has_capacity() {
            return None;
        }
        let reservation = self.resources.try_reserve(resource_request(job))?;
        Some(self.bind(job.id, reservation))
    }

    /// Release `slot` after its worker ended.
    pub fn finish(&mut self, slot: usize, job_id: JobId) {
        if let Some(entry) = self.slots.get_mut(slot) {
            if entry.as_ref().map_or(false, |w| w.job_id == job_id) {
                *entry = None;
            }
        }
        self.trim();
    }

    /// Drop idle slots above the limit; busy ones stay until they finish.
    fn trim(&mut self) {
        while self.slots.len() > self.parallelism && matches!(self.slots.last(), Some(None)) {
            self.slots.pop();
        }
        self.slot_suspended.truncate(self.slots.len().max(self.parallelism));
    }

    pub fn set_parallelism(&mut self, n: u32) {
        let n = n.max(1) as usize;
        if n == self.parallelism {
            return;
        }
        info!(from = self.parallelism, to = n, "parallelism changed");
        self.parallelism = n;
        while self.slots.len() < n {
            self.slots.push(None);
        }
        self.slot_suspended.resize(self.slots.len(), false);
        self.trim();
    }

    /// Ask the worker running `job_id` to stop. Returns false when idle.
    pub fn cancel(&mut self, job_id: JobId) -> bool {
        match self.slot_of(job_id).and_then(|i| self.slots[i].as_ref()) {
            Some(work) => {
                work.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&mut self) {
        for work in self.slots.iter().flatten() {
            work.cancel.cancel();
        }
    }

    pub fn set_pause(&mut self, paused: bool) {
        self.paused = paused;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Suspend or resume one worker slot, or all of them.
    pub fn suspend(&mut self, slot: Option<usize>, suspend: bool) {
        match slot {
            None => {
                self.suspended_all = suspend;
                if !suspend {
                    self.slot_suspended.iter_mut().for_each(|s| *s = false);
                }
            }
            Some(i) => {
                if self.slot_suspended.len() <= i {
                    self.slot_suspended.resize(i + 1, false);
                }
                self.slot_suspended[i] = suspend;
            }
        }
        self.push_suspend();
    }

    /// Quiet-hours suspend, tracked separately from client requests.
    pub fn set_scheduled_suspend(&mut self, suspend: bool) {
        if self.scheduled_suspend != suspend {
            self.scheduled_suspend = suspend;
            self.push_suspend();
        }
    }

    fn push_suspend(&self) {
        for (i, work) in self.slots.iter().enumerate() {
            if let Some(work) = work {
                let want = self.effective_suspend(i);
                work.suspend.send_if_modified(|cur| {
                    let changed = *cur != want;
                    *cur = want;
                    changed
                });
            }
        }
    }

    pub fn state(&self) -> PoolState {
        PoolState {
            paused: self.paused,
            suspended: self.suspended_all,
            scheduled_suspend: self.scheduled_suspend,
            worker_suspended: (0..self.slots.len().max(self.parallelism))
                .map(|i| self.effective_suspend(i))
                .collect(),
            running: self.occupancy(),
            parallelism: self.parallelism as u32,
        }
    }
}
