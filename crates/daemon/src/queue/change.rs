//! Per-item mutations requested by clients.

use super::QueueManager;
use crate::catalog::Catalog;
use crate::job::{JobId, JobState};
use crate::rpc::{ChangeItemData, ChangeKind, QueueUpdateKind};
use crate::scheduler::{Admission, WorkerPool};
use tracing::info;

/// What a successful change produced.
#[derive(Debug, Default)]
pub struct ChangeResult {
    /// Text for the operation result, if the change has something to say.
    pub message: Option<String>,
    /// Worker binding created by `ForceStart`; the caller spawns it.
    pub started: Option<Admission>,
}

impl ChangeResult {
    fn message(text: impl Into<String>) -> Self {
        Self {
            message: Some(text.into()),
            started: None,
        }
    }
}

impl QueueManager {
    /// Apply one `ChangeItem` command. Rejected preconditions come back as
    /// `Err` with a message meant for the user.
    pub fn change_item(
        &mut self,
        data: &ChangeItemData,
        catalog: &Catalog,
        pool: &mut WorkerPool,
    ) -> Result<ChangeResult, String> {
        let id = data.item_id;
        match &data.change {
            ChangeKind::RemoveCompleted => {
                let removed = self.remove_completed();
                Ok(ChangeResult::message(format!("{} items removed", removed)))
            }
            ChangeKind::Retry => {
                let (idx, state) = self.locate(id)?;
                match state {
                    JobState::PreFailed => return Err("pre-failed items cannot be retried".into()),
                    JobState::Running => return Err("item is running".into()),
                    JobState::Complete => {
                        return Err("completed items cannot be retried, duplicate instead".into())
                    }
                    _ => {}
                }
                self.reset_for_rerun(idx)?;
                self.update_profile_item(idx, catalog);
                self.update_queue_item(idx, catalog);
                self.notify(QueueUpdateKind::Update, idx, None);
                info!(job_id = id, "retry");
                Ok(ChangeResult::message(format!("item {} will be retried", id)))
            }
            ChangeKind::UpdateProfile => {
                let (idx, state) = self.locate(id)?;
                match state {
                    JobState::PreFailed => {
                        return Err("pre-failed items have no profile to update".into())
                    }
                    JobState::Running => return Err("item is running".into()),
                    _ => {}
                }
                if matches!(state, JobState::Failed | JobState::Canceled) {
                    self.reset_for_rerun(idx)?;
                }
                let changed = self.update_profile_item(idx, catalog);
                self.update_queue_item(idx, catalog);
                self.notify(QueueUpdateKind::Update, idx, None);
                Ok(ChangeResult::message(if changed {
                    "new profile applied"
                } else {
                    "profile is already up to date"
                }))
            }
            ChangeKind::Duplicate => {
                let (idx, state) = self.locate(id)?;
                if state == JobState::PreFailed {
                    return Err("pre-failed items cannot be duplicated".into());
                }
                let job = self.jobs[idx].clone();
                if job.is_batch() && job.is_active() {
                    return Err("active batch items cannot be duplicated".into());
                }
                self.restore_source(&job)
                    .map_err(|e| format!("failed to restore source file: {}", e))?;
                let new_id = self.allocate_id();
                let mut dup = job.duplicate_as(new_id);
                dup.order = self.jobs.len();
                self.jobs.push(dup);
                let new_idx = self.jobs.len() - 1;
                self.update_queue_item(new_idx, catalog);
                self.notify(QueueUpdateKind::Add, new_idx, None);
                info!(job_id = id, new_id, "duplicated");
                Ok(ChangeResult::message(format!("item {} duplicated as {}", id, new_id)))
            }
            ChangeKind::Cancel => {
                let (idx, state) = self.locate(id)?;
                if !state.is_active() {
                    return Err("item is not active".into());
                }
                pool.cancel(id);
                Self::set_state(&mut self.jobs[idx], JobState::Canceled);
                self.schedule_dirty = true;
                self.notify(QueueUpdateKind::Update, idx, None);
                Ok(ChangeResult::default())
            }
            ChangeKind::Priority { priority } => {
                let (idx, _) = self.locate(id)?;
                self.jobs[idx].set_priority(*priority);
                self.schedule_dirty = true;
                self.notify(QueueUpdateKind::Update, idx, None);
                Ok(ChangeResult::default())
            }
            ChangeKind::Profile { profile } => {
                let (idx, state) = self.locate(id)?;
                match state {
                    JobState::Running => return Err("item is running".into()),
                    JobState::PreFailed => {
                        return Err("profile of pre-failed items cannot be changed".into())
                    }
                    _ => {}
                }
                self.jobs[idx].profile_name = profile.clone();
                self.update_profile_item(idx, catalog);
                self.notify(QueueUpdateKind::Update, idx, None);
                Ok(ChangeResult::default())
            }
            ChangeKind::RemoveItem => {
                let (idx, _) = self.locate(id)?;
                pool.cancel(id);
                let job = self.jobs.remove(idx);
                self.renumber();
                self.notify_removed(&job);
                info!(job_id = id, "removed");
                Ok(ChangeResult::default())
            }
            ChangeKind::ForceStart => {
                let (idx, state) = self.locate(id)?;
                if state != JobState::Queued {
                    return Err("only queued items can be force-started".into());
                }
                let admission = pool
                    .force_start(&self.jobs[idx])
                    .ok_or_else(|| "no free worker or resources for this item".to_string())?;
                self.mark_running(id);
                info!(job_id = id, slot = admission.slot, "force start");
                Ok(ChangeResult {
                    message: None,
                    started: Some(admission),
                })
            }
            ChangeKind::RemoveSourceFile => {
                let (idx, _) = self.locate(id)?;
                let job = self.jobs[idx].clone();
                self.delete_source(&job)?;
                self.jobs.remove(idx);
                self.renumber();
                self.notify_removed(&job);
                Ok(ChangeResult::message(format!(
                    "deleted {}",
                    job.src_path.display()
                )))
            }
            ChangeKind::Move { position } => {
                let (idx, _) = self.locate(id)?;
                let position = *position;
                if position >= self.jobs.len() {
                    return Err("position out of range".into());
                }
                let job = self.jobs.remove(idx);
                self.jobs.insert(position, job);
                self.renumber();
                self.notify(QueueUpdateKind::Move, position, Some(position));
                Ok(ChangeResult::default())
            }
        }
    }

    fn locate(&self, id: JobId) -> Result<(usize, JobState), String> {
        self.index_of(id)
            .map(|idx| (idx, self.jobs[idx].state))
            .ok_or_else(|| "item not found".to_string())
    }

    /// Move a finished job back to `Pending`, bringing its source file back
    /// from the succeeded/failed folder first.
    fn reset_for_rerun(&mut self, idx: usize) -> Result<(), String> {
        let job = self.jobs[idx].clone();
        self.restore_source(&job)
            .map_err(|e| format!("failed to restore source file: {}", e))?;
        let job = &mut self.jobs[idx];
        Self::set_state(job, JobState::Pending);
        job.fail_reason.clear();
        Ok(())
    }

    fn remove_completed(&mut self) -> usize {
        let (gone, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.jobs)
            .into_iter()
            .partition(|j| matches!(j.state, JobState::Complete | JobState::PreFailed));
        self.jobs = kept;
        self.renumber();
        for job in &gone {
            self.notify_removed(job);
        }
        gone.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode::Outcome;
    use crate::queue::tests::{catalog, manager, push_job};
    use crate::rpc::QueueUpdateKind as Kind;

    fn change(id: JobId, change: ChangeKind) -> ChangeItemData {
        ChangeItemData {
            request_id: None,
            item_id: id,
            change,
        }
    }

    fn setup(n: usize) -> (QueueManager, std::sync::Arc<crate::rpc::testing::RecordingSink>, Catalog, WorkerPool) {
        let (mut qm, sink) = manager();
        let catalog = catalog();
        for i in 0..n {
            push_job(&mut qm, &format!("/nonexistent/{}.ts", i));
        }
        qm.jobs.iter_mut().for_each(|j| j.mode = crate::job::AddMode::Single);
        qm.update_all_pending(&catalog);
        sink.take();
        let pool = WorkerPool::new(2, qm.resources.clone());
        (qm, sink, catalog, pool)
    }

    fn finish(qm: &mut QueueManager, id: JobId, outcome: Outcome) {
        qm.mark_running(id);
        qm.finish_job(id, &outcome);
    }

    #[test]
    fn test_retry_rules() {
        let (mut qm, _, catalog, mut pool) = setup(3);
        finish(&mut qm, 1, Outcome::failed("boom"));
        finish(&mut qm, 2, Outcome::failed(""));
        qm.jobs[1].state = JobState::Complete;
        qm.mark_running(3);

        qm.change_item(&change(1, ChangeKind::Retry), &catalog, &mut pool).unwrap();
        assert_eq!(qm.get(1).unwrap().state, JobState::Queued);
        assert!(qm.get(1).unwrap().fail_reason.is_empty());

        assert!(qm.change_item(&change(2, ChangeKind::Retry), &catalog, &mut pool).is_err());
        assert!(qm.change_item(&change(3, ChangeKind::Retry), &catalog, &mut pool).is_err());
        assert_eq!(
            qm.change_item(&change(99, ChangeKind::Retry), &catalog, &mut pool).unwrap_err(),
            "item not found"
        );
    }

    #[test]
    fn test_retry_canceled_is_allowed() {
        let (mut qm, _, catalog, mut pool) = setup(1);
        qm.change_item(&change(1, ChangeKind::Cancel), &catalog, &mut pool).unwrap();
        assert_eq!(qm.get(1).unwrap().state, JobState::Canceled);
        assert_eq!(
            qm.change_item(&change(1, ChangeKind::Cancel), &catalog, &mut pool).unwrap_err(),
            "item is not active"
        );
        qm.change_item(&change(1, ChangeKind::Retry), &catalog, &mut pool).unwrap();
        assert_eq!(qm.get(1).unwrap().state, JobState::Queued);
    }

    #[test]
    fn test_cancel_running_signals_worker() {
        let (mut qm, _, catalog, mut pool) = setup(1);
        let adm = pool.admit(qm.jobs()).pop().unwrap();
        qm.mark_running(1);

        qm.change_item(&change(1, ChangeKind::Cancel), &catalog, &mut pool).unwrap();
        assert!(adm.control.cancel.is_cancelled());
        assert_eq!(qm.get(1).unwrap().state, JobState::Canceled);
    }

    #[test]
    fn test_duplicate_copies_profile_snapshot() {
        let (mut qm, sink, catalog, mut pool) = setup(1);
        finish(&mut qm, 1, Outcome::failed(""));
        qm.jobs[0].state = JobState::Complete;

        qm.change_item(&change(1, ChangeKind::Duplicate), &catalog, &mut pool).unwrap();
        assert_eq!(qm.jobs().len(), 2);
        let dup = &qm.jobs()[1];
        assert_eq!(dup.id, 2);
        assert_eq!(dup.state, JobState::Queued);

        qm.jobs[0].profile.as_mut().unwrap().encoder_args.push("--x".into());
        assert!(qm.jobs[1].profile.as_ref().unwrap().encoder_args.is_empty());
        assert_eq!(qm.get(1).unwrap().state, JobState::Complete);
        assert!(sink.queue_updates().contains(&(Kind::Add, 2)));
    }

    #[test]
    fn test_duplicate_rejects_active_batch() {
        let (mut qm, _, catalog, mut pool) = setup(1);
        qm.jobs[0].mode = crate::job::AddMode::Batch;
        assert!(qm.change_item(&change(1, ChangeKind::Duplicate), &catalog, &mut pool).is_err());
        qm.jobs[0].state = JobState::PreFailed;
        assert!(qm.change_item(&change(1, ChangeKind::Duplicate), &catalog, &mut pool).is_err());
    }

    #[test]
    fn test_profile_change_preconditions() {
        let (mut qm, _, catalog, mut pool) = setup(2);
        qm.mark_running(1);
        qm.jobs[1].state = JobState::PreFailed;
        let to_missing = ChangeKind::Profile {
            profile: "missing".into(),
        };
        assert!(qm.change_item(&change(1, to_missing.clone()), &catalog, &mut pool).is_err());
        assert!(qm.change_item(&change(2, to_missing.clone()), &catalog, &mut pool).is_err());

        qm.jobs[1].state = JobState::Queued;
        qm.change_item(&change(2, to_missing), &catalog, &mut pool).unwrap();
        assert_eq!(qm.get(2).unwrap().state, JobState::Pending);
        assert_eq!(qm.get(2).unwrap().fail_reason, "profile missing not found");
    }

    #[test]
    fn test_update_profile_reports_outcome() {
        let (mut qm, _, catalog, mut pool) = setup(1);
        let res = qm
            .change_item(&change(1, ChangeKind::UpdateProfile), &catalog, &mut pool)
            .unwrap();
        assert_eq!(res.message.as_deref(), Some("profile is already up to date"));
    }

    #[test]
    fn test_move_and_bounds() {
        let (mut qm, sink, catalog, mut pool) = setup(3);
        assert!(qm
            .change_item(&change(1, ChangeKind::Move { position: 3 }), &catalog, &mut pool)
            .is_err());
        qm.change_item(&change(1, ChangeKind::Move { position: 2 }), &catalog, &mut pool)
            .unwrap();
        let ids: Vec<JobId> = qm.jobs().iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![2, 3, 1]);
        let orders: Vec<usize> = qm.jobs().iter().map(|j| j.order).collect();
        assert_eq!(orders, vec![0, 1, 2]);
        assert_eq!(sink.queue_updates(), vec![(Kind::Move, 1)]);
    }

    #[test]
    fn test_remove_and_remove_completed() {
        let (mut qm, _, catalog, mut pool) = setup(4);
        qm.jobs[0].state = JobState::Complete;
        qm.jobs[1].state = JobState::PreFailed;

        let res = qm
            .change_item(&change(0, ChangeKind::RemoveCompleted), &catalog, &mut pool)
            .unwrap();
        assert_eq!(res.message.as_deref(), Some("2 items removed"));
        assert_eq!(qm.jobs().len(), 2);

        qm.change_item(&change(3, ChangeKind::RemoveItem), &catalog, &mut pool).unwrap();
        let ids: Vec<JobId> = qm.jobs().iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![4]);
        assert_eq!(qm.jobs()[0].order, 0);
    }

    #[test]
    fn test_force_start_ignores_pause() {
        let (mut qm, _, catalog, mut pool) = setup(2);
        pool.set_pause(true);
        let res = qm
            .change_item(&change(2, ChangeKind::ForceStart), &catalog, &mut pool)
            .unwrap();
        let adm = res.started.unwrap();
        assert_eq!(adm.job_id, 2);
        assert_eq!(qm.get(2).unwrap().state, JobState::Running);
        assert!(qm
            .change_item(&change(2, ChangeKind::ForceStart), &catalog, &mut pool)
            .is_err());
    }

    #[test]
    fn test_priority_change_is_clamped() {
        let (mut qm, _, catalog, mut pool) = setup(1);
        qm.take_schedule_dirty();
        qm.change_item(&change(1, ChangeKind::Priority { priority: 9 }), &catalog, &mut pool)
            .unwrap();
        assert_eq!(qm.get(1).unwrap().priority, crate::job::MAX_PRIORITY);
        assert!(qm.take_schedule_dirty());
    }
}
