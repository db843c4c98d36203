//! Batch ingestion.
//!
//! Sources are handled one at a time: probe, derive one job per program and
//! output, run the add hook on each derived job, then commit the whole set.
//! Nothing of a source is visible to clients before its commit, so a hook
//! or cancel that stops a source leaves no trace of it.

use super::QueueManager;
use crate::catalog::Catalog;
use crate::hook::AddHook;
use crate::job::{Job, JobState, NewJob};
use crate::probe::{Prober, ProgramInfo};
use crate::rpc::{
    AddQueueRequest, ConsoleUpdate, OutputInfo, QueueUpdateKind, ServerMessage,
    ServiceSettingUpdate, UpdateKind,
};
use crate::scan::discover_sources;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Console index used for add-time output.
pub const ADD_CONSOLE: i32 = -1;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AddSummary {
    pub added: usize,
    pub canceled: bool,
}

enum SourceResult {
    Ready(Vec<Job>),
    /// The add was canceled while this source was being prepared.
    Canceled,
}

fn stem_of(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn new_job(src: &Path, hash: &Option<String>, req: &AddQueueRequest, out: &OutputInfo, name: String) -> NewJob {
    NewJob {
        src_path: src.to_path_buf(),
        hash: hash.clone(),
        remote: req.remote,
        dst_dir: out.dst_dir.clone(),
        dst_name: name,
        profile_name: out.profile.clone(),
        priority: out.priority,
        mode: req.mode,
    }
}

fn apply_program(job: &mut Job, program: &ProgramInfo) {
    job.service_id = program.service_id;
    job.service_name = program.service_name.clone();
    job.event_name = program.event_name.clone();
    job.ts_time = program.event_time;
    job.genres = program.genres.clone();
    job.video_width = program.width;
    job.video_height = program.height;
    job.stream_format = program.stream_format.clone();
}

/// Programs worth encoding: one per video stream, video only.
fn playable_programs(programs: Vec<ProgramInfo>) -> Vec<ProgramInfo> {
    let mut seen = HashSet::new();
    programs
        .into_iter()
        .filter(|p| p.has_video && seen.insert(p.video_pid))
        .collect()
}

impl QueueManager {
    fn add_console(&self, line: &str) {
        let mut data = line.as_bytes().to_vec();
        data.push(b'\n');
        self.events.publish(ServerMessage::OnConsoleUpdate(ConsoleUpdate {
            index: ADD_CONSOLE,
            data,
        }));
    }

    /// Whether `src` is already being worked on and must not be added again.
    fn is_source_busy(&self, src: &Path, batch_request: bool) -> bool {
        self.jobs
            .iter()
            .any(|j| j.src_path == src && j.is_active() && (batch_request || j.is_batch()))
    }

    /// Add every source of `req`.
    ///
    /// Cancellation is checked between sources and before each hook run; a
    /// canceled add keeps what was already committed.
    pub async fn add_batch(
        &mut self,
        req: &AddQueueRequest,
        catalog: &mut Catalog,
        prober: &dyn Prober,
        hook: &dyn AddHook,
        cancel: &CancellationToken,
    ) -> Result<AddSummary, String> {
        if req.outputs.is_empty() {
            return Err("no output specified".to_string());
        }
        let sources: Vec<(PathBuf, Option<String>)> = if !req.targets.is_empty() {
            req.targets
                .iter()
                .map(|t| (t.path.clone(), t.hash.clone()))
                .collect()
        } else if let Some(dir) = &req.dir_path {
            discover_sources(dir).into_iter().map(|p| (p, None)).collect()
        } else {
            return Err("no source specified".to_string());
        };

        let mut summary = AddSummary::default();
        for (src, hash) in sources {
            if cancel.is_cancelled() {
                summary.canceled = true;
                break;
            }
            if self.is_source_busy(&src, req.mode.is_batch()) {
                debug!(src = %src.display(), "source already queued, skipping");
                continue;
            }
            match self.prepare_source(&src, &hash, req, catalog, prober, hook, cancel).await {
                SourceResult::Ready(jobs) => summary.added += self.commit(jobs, catalog),
                SourceResult::Canceled => {
                    info!(src = %src.display(), "add canceled, source discarded");
                    summary.canceled = true;
                    break;
                }
            }
        }
        info!(added = summary.added, canceled = summary.canceled, "add finished");
        Ok(summary)
    }

    #[allow(clippy::too_many_arguments)]
    async fn prepare_source(
        &mut self,
        src: &Path,
        hash: &Option<String>,
        req: &AddQueueRequest,
        catalog: &mut Catalog,
        prober: &dyn Prober,
        hook: &dyn AddHook,
        cancel: &CancellationToken,
    ) -> SourceResult {
        let stem = stem_of(src);
        let first_output = &req.outputs[0];

        let programs = match prober.probe(src).await {
            Ok(info) => playable_programs(info.programs),
            Err(e) => {
                warn!(src = %src.display(), error = %e, "probe failed");
                let mut job = Job::pre_failed(
                    new_job(src, hash, req, first_output, stem),
                    e.to_string(),
                );
                job.id = self.allocate_id();
                return SourceResult::Ready(vec![job]);
            }
        };
        if programs.is_empty() {
            let mut job = Job::pre_failed(
                new_job(src, hash, req, first_output, stem),
                "no playable program found",
            );
            job.id = self.allocate_id();
            return SourceResult::Ready(vec![job]);
        }

        for program in &programs {
            if catalog.register_service(program.service_id, &program.service_name) {
                info!(service_id = program.service_id, "new service registered");
                self.events
                    .publish(ServerMessage::OnServiceSetting(ServiceSettingUpdate {
                        kind: UpdateKind::Add,
                        service_id: program.service_id,
                        data: catalog.services.get(&program.service_id).cloned(),
                    }));
            }
        }

        let mut jobs = Vec::new();
        for (i, program) in programs.iter().enumerate() {
            let name = if i == 0 {
                stem.clone()
            } else {
                format!("{}-multi{}", stem, i)
            };
            for out in &req.outputs {
                let fields = new_job(src, hash, req, out, name.clone());
                let mut job = if program.is_undersized() {
                    Job::pre_failed(
                        fields,
                        format!("video too small ({}x{})", program.width, program.height),
                    )
                } else {
                    Job::new(fields)
                };
                apply_program(&mut job, program);
                job.id = self.allocate_id();
                jobs.push(job);
            }
        }

        if let Some(hook_name) = req.add_hook.as_deref().filter(|h| !h.is_empty()) {
            for job in jobs.iter_mut().filter(|j| j.state != JobState::PreFailed) {
                if cancel.is_cancelled() {
                    return SourceResult::Canceled;
                }
                match hook.run(hook_name, job, cancel).await {
                    Ok(result) => {
                        for line in &result.console {
                            self.add_console(line);
                        }
                        if result.cancel_add {
                            cancel.cancel();
                            return SourceResult::Canceled;
                        }
                        result.apply_to(job);
                        if result.cancel_item {
                            Self::set_state(job, JobState::Canceled);
                        }
                    }
                    Err(e) => {
                        warn!(hook = hook_name, job_id = job.id, error = %e, "add hook failed");
                        self.add_console(&format!("hook {} failed: {}", hook_name, e));
                    }
                }
            }
        }
        SourceResult::Ready(jobs)
    }

    /// Append one source's jobs and tell clients about them.
    fn commit(&mut self, jobs: Vec<Job>, catalog: &Catalog) -> usize {
        let count = jobs.len();
        for mut job in jobs {
            job.order = self.jobs.len();
            self.jobs.push(job);
            let idx = self.jobs.len() - 1;
            self.update_queue_item(idx, catalog);
            self.notify(QueueUpdateKind::Add, idx, None);
        }
        self.schedule_dirty = true;
        count
    }
}
