//! Execution of one admitted job.
//!
//! A worker owns its admission for the whole run: the resource reservation
//! is released when the worker returns, and the slot is handed back by the
//! command loop when it processes the [`WorkerOutcome`].

use crate::encode::{
    map_exit, EncodeExit, EncodeIo, EncodeManifest, EncodeRequest, Encoder, ExitPolicy, Outcome,
};
use crate::hash::{copy_verified, HashError};
use crate::job::{Job, JobId};
use crate::rpc::{ConsoleUpdate, EventSink, ServerMessage};
use crate::scheduler::{Admission, WorkerControl};
use crate::store::{CheckLogItem, LogItem};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Log record produced by a finished worker.
#[derive(Debug, Clone, PartialEq)]
pub enum LogEntry {
    Encode(LogItem),
    Check(CheckLogItem),
}

/// Result handed back to the command loop.
#[derive(Debug)]
pub struct WorkerOutcome {
    pub slot: usize,
    pub job_id: JobId,
    pub outcome: Outcome,
    pub log: LogEntry,
}

/// Shared environment of all workers.
pub struct JobRunner {
    encoder: Arc<dyn Encoder>,
    events: Arc<dyn EventSink>,
    work_dir: PathBuf,
    logs_dir: PathBuf,
    policy: ExitPolicy,
}

/// Transcript file name for a run started at `start`.
pub fn transcript_name(job_id: JobId, start: DateTime<Utc>) -> String {
    format!("{}-{}.txt", start.format("%Y%m%d-%H%M%S"), job_id)
}

async fn forward_console(
    events: Arc<dyn EventSink>,
    index: i32,
    mut chunks: mpsc::UnboundedReceiver<Bytes>,
    transcript: PathBuf,
) {
    let mut file = match open_transcript(&transcript).await {
        Ok(f) => Some(f),
        Err(e) => {
            warn!(path = %transcript.display(), error = %e, "transcript unavailable");
            None
        }
    };
    while let Some(chunk) = chunks.recv().await {
        if let Some(f) = file.as_mut() {
            if let Err(e) = f.write_all(&chunk).await {
                warn!(path = %transcript.display(), error = %e, "transcript write failed");
                file = None;
            }
        }
        events.publish(ServerMessage::OnConsoleUpdate(ConsoleUpdate {
            index,
            data: chunk.to_vec(),
        }));
    }
    if let Some(mut f) = file {
        let _ = f.flush().await;
    }
}

async fn open_transcript(path: &Path) -> std::io::Result<tokio::fs::File> {
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }
    tokio::fs::File::create(path).await
}

impl JobRunner {
    pub fn new(
        encoder: Arc<dyn Encoder>,
        events: Arc<dyn EventSink>,
        work_dir: impl Into<PathBuf>,
        logs_dir: impl Into<PathBuf>,
        policy: ExitPolicy,
    ) -> Self {
        Self {
            encoder,
            events,
            work_dir: work_dir.into(),
            logs_dir: logs_dir.into(),
            policy,
        }
    }

    /// Run `job` in the slot described by `admission`.
    pub async fn run(&self, job: Job, admission: Admission) -> WorkerOutcome {
        let Admission {
            slot,
            job_id,
            reservation,
            control,
        } = admission;
        let start = Utc::now();
        let console_log = transcript_name(job_id, start);
        info!(job_id, slot, src = %job.src_path.display(), "worker started");

        let (console_tx, console_rx) = mpsc::unbounded_channel();
        let pump = tokio::spawn(forward_console(
            self.events.clone(),
            slot as i32,
            console_rx,
            self.logs_dir.join(&console_log),
        ));

        let outcome = self.execute(&job, control, console_tx).await;
        drop(reservation);
        let _ = pump.await;

        let finish = Utc::now();
        if outcome.success {
            info!(job_id, slot, "worker finished");
        } else {
            info!(job_id, slot, reason = %outcome.reason, "worker failed");
        }
        let log = build_log(&job, &outcome, start, finish, console_log);
        WorkerOutcome {
            slot,
            job_id,
            outcome,
            log,
        }
    }

    async fn execute(
        &self,
        job: &Job,
        control: WorkerControl,
        console: mpsc::UnboundedSender<Bytes>,
    ) -> Outcome {
        if !tokio::fs::try_exists(&job.src_path).await.unwrap_or(false) {
            return Outcome::failed(format!("source file not found: {}", job.src_path.display()));
        }
        if let Err(e) = tokio::fs::create_dir_all(&self.work_dir).await {
            return Outcome::failed(format!("work directory unavailable: {}", e));
        }

        let mut input = job.src_path.clone();
        let mut local_copy = None;
        if let Some(expected) = &job.hash {
            let dst = self
                .work_dir
                .join(format!("{}-{}", job.id, job.src_file_name()));
            let _ = console.send(Bytes::from(format!(
                "copying {} for verification\n",
                job.src_path.display()
            )));
            let copied = tokio::select! {
                r = copy_verified(&job.src_path, &dst, expected) => r,
                _ = control.cancel.cancelled() => {
                    let _ = tokio::fs::remove_file(&dst).await;
                    return Outcome::canceled();
                }
            };
            match copied {
                Ok(()) => {
                    input = dst.clone();
                    local_copy = Some(dst);
                }
                Err(HashError::Mismatch { expected, actual }) => {
                    warn!(job_id = job.id, %expected, %actual, "hash mismatch");
                    return Outcome::failed("hash mismatch");
                }
                Err(e) => {
                    let _ = tokio::fs::remove_file(&dst).await;
                    return Outcome::failed(e.to_string());
                }
            }
        }

        let manifest = self.work_dir.join(format!("{}-result.json", job.id));
        let _ = tokio::fs::remove_file(&manifest).await;
        let request = EncodeRequest {
            job_id: job.id,
            input,
            output: job.output_path(),
            manifest: manifest.clone(),
            priority: job.priority,
            service_id: job.service_id,
            check: job.is_check(),
            args: job
                .profile
                .as_ref()
                .map(|p| p.encoder_args.clone())
                .unwrap_or_default(),
        };
        debug!(job_id = job.id, ?request, "launching encoder");
        let io = EncodeIo {
            cancel: control.cancel,
            suspend: control.suspend,
            console,
        };

        let outcome = match self.encoder.run(&request, io).await {
            Ok(exit) => {
                let parsed = if exit == EncodeExit::Code(0) && !request.check {
                    Some(EncodeManifest::read(&manifest).await)
                } else {
                    None
                };
                map_exit(exit, parsed, self.policy)
            }
            Err(e) => Outcome::failed(e.to_string()),
        };

        let _ = tokio::fs::remove_file(&manifest).await;
        if let Some(copy) = local_copy {
            if let Err(e) = tokio::fs::remove_file(&copy).await {
                warn!(path = %copy.display(), error = %e, "failed to remove local copy");
            }
        }
        outcome
    }
}

fn build_log(
    job: &Job,
    outcome: &Outcome,
    start: DateTime<Utc>,
    finish: DateTime<Utc>,
    console_log: String,
) -> LogEntry {
    if job.is_check() {
        return LogEntry::Check(CheckLogItem {
            success: outcome.success,
            reason: outcome.reason.clone(),
            job_id: job.id,
            src_path: job.src_path.clone(),
            service_name: job.service_name.clone(),
            check_start: start,
            check_finish: finish,
            console_log: Some(console_log),
        });
    }
    let m = outcome.manifest.clone().unwrap_or_default();
    LogEntry::Encode(LogItem {
        success: outcome.success,
        reason: outcome.reason.clone(),
        job_id: job.id,
        src_path: job.src_path.clone(),
        out_paths: m.outfiles.into_iter().map(|f| f.path).collect(),
        src_file_size: m.srcfilesize,
        out_file_size: m.outfilesize,
        src_duration: m.srcduration,
        out_duration: m.outduration,
        incident: m.incident,
        profile_name: job
            .profile
            .as_ref()
            .map_or_else(|| job.profile_name.clone(), |p| p.name.clone()),
        service_name: job.service_name.clone(),
        encode_start: start,
        encode_finish: finish,
        console_log: Some(console_log),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::copy_with_hash;
    use crate::job::{test_job, AddMode, JobState};
    use crate::profile::Profile;
    use crate::resource::ResourceManager;
    use crate::rpc::testing::RecordingSink;
    use crate::scheduler::WorkerPool;
    use crate::testing::FakeEncoder;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        sink: Arc<RecordingSink>,
        resources: Arc<ResourceManager>,
        pool: WorkerPool,
    }

    fn fixture() -> Fixture {
        let resources = ResourceManager::new(&[100]);
        Fixture {
            dir: TempDir::new().unwrap(),
            sink: Arc::new(RecordingSink::default()),
            pool: WorkerPool::new(2, resources.clone()),
            resources,
        }
    }

    impl Fixture {
        fn runner(&self, encoder: Arc<FakeEncoder>) -> JobRunner {
            JobRunner::new(
                encoder,
                self.sink.clone(),
                self.dir.path().join("work"),
                self.dir.path().join("logs"),
                ExitPolicy::default(),
            )
        }

        fn job(&self, percent: u32) -> Job {
            let src = self.dir.path().join("rec/show.ts");
            std::fs::create_dir_all(src.parent().unwrap()).unwrap();
            std::fs::write(&src, b"transport stream").unwrap();
            let mut job = test_job(1, src.to_str().unwrap());
            job.mode = AddMode::Single;
            let mut profile = Profile::new("default");
            profile.gpu_percent = percent;
            profile.encoder_args = vec!["--preset".into(), "fast".into()];
            job.profile = Some(profile);
            job.state = JobState::Queued;
            job
        }

        fn admit(&mut self, job: &Job) -> Admission {
            self.pool.admit(std::slice::from_ref(job)).pop().unwrap()
        }
    }

    #[tokio::test]
    async fn test_success_produces_log_and_console() {
        let mut fx = fixture();
        let encoder = Arc::new(FakeEncoder::exiting(EncodeExit::Code(0)));
        let job = fx.job(60);
        let adm = fx.admit(&job);
        assert_eq!(fx.resources.usage()[0].used, 60);

        let result = fx.runner(encoder.clone()).run(job, adm).await;
        assert!(result.outcome.success);
        assert_eq!(fx.resources.usage()[0].used, 0);

        let LogEntry::Encode(item) = result.log else {
            panic!("expected encode log");
        };
        assert_eq!(item.out_paths.len(), 1);
        assert_eq!(item.src_file_size, 100);
        let transcript = fx.dir.path().join("logs").join(item.console_log.unwrap());
        let text = std::fs::read_to_string(transcript).unwrap();
        assert!(text.starts_with("encoding "));

        let consoles = fx
            .sink
            .take()
            .into_iter()
            .filter(|m| matches!(m, ServerMessage::OnConsoleUpdate(c) if c.index == 0))
            .count();
        assert_eq!(consoles, 1);
        assert_eq!(encoder.requests.lock()[0].args, vec!["--preset", "fast"]);
    }

    #[tokio::test]
    async fn test_exit_codes_map_to_failures() {
        for (exit, reason) in [
            (EncodeExit::Code(1), "exited with code 1"),
            (EncodeExit::Code(100), "no matching logo found"),
            (EncodeExit::Signaled, "terminated by signal"),
        ] {
            let mut fx = fixture();
            let job = fx.job(0);
            let adm = fx.admit(&job);
            let result = fx
                .runner(Arc::new(FakeEncoder::exiting(exit)))
                .run(job, adm)
                .await;
            assert!(!result.outcome.success);
            assert_eq!(result.outcome.reason, reason);
        }
    }

    #[tokio::test]
    async fn test_incidents_fail_job() {
        let mut fx = fixture();
        let mut encoder = FakeEncoder::exiting(EncodeExit::Code(0));
        encoder.incident = 12;
        let job = fx.job(0);
        let adm = fx.admit(&job);
        let result = fx.runner(Arc::new(encoder)).run(job, adm).await;
        assert_eq!(result.outcome.reason, "too many incidents");
    }

    #[tokio::test]
    async fn test_cancel_stops_encoder() {
        let mut fx = fixture();
        let job = fx.job(30);
        let adm = fx.admit(&job);
        let cancel = adm.control.cancel.clone();
        let runner = fx.runner(Arc::new(FakeEncoder::blocking()));

        let handle = tokio::spawn(async move { runner.run(job, adm).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.outcome.canceled);
        assert_eq!(result.outcome.reason, "canceled");
        assert_eq!(fx.resources.usage()[0].used, 0);
    }

    #[tokio::test]
    async fn test_hash_mismatch_and_match() {
        let mut fx = fixture();
        let mut job = fx.job(0);
        job.hash = Some("00".repeat(32));
        let adm = fx.admit(&job);
        let encoder = Arc::new(FakeEncoder::exiting(EncodeExit::Code(0)));
        let result = fx.runner(encoder.clone()).run(job.clone(), adm).await;
        assert_eq!(result.outcome.reason, "hash mismatch");
        assert!(encoder.requests.lock().is_empty());
        fx.pool.finish(result.slot, result.job_id);

        let scratch = fx.dir.path().join("scratch.ts");
        job.hash = Some(copy_with_hash(&job.src_path, &scratch).await.unwrap());
        let adm = fx.admit(&job);
        let result = fx.runner(encoder.clone()).run(job.clone(), adm).await;
        assert!(result.outcome.success);
        let input = encoder.requests.lock()[0].input.clone();
        assert!(input.starts_with(fx.dir.path().join("work")));
        assert!(!input.exists(), "local copy is removed");
    }

    #[tokio::test]
    async fn test_missing_source_fails() {
        let mut fx = fixture();
        let job = fx.job(0);
        std::fs::remove_file(&job.src_path).unwrap();
        let adm = fx.admit(&job);
        let result = fx
            .runner(Arc::new(FakeEncoder::exiting(EncodeExit::Code(0))))
            .run(job, adm)
            .await;
        assert!(result.outcome.reason.starts_with("source file not found"));
    }

    #[tokio::test]
    async fn test_check_job_writes_check_log() {
        let mut fx = fixture();
        let mut job = fx.job(0);
        job.mode = AddMode::Check;
        let adm = fx.admit(&job);
        let result = fx
            .runner(Arc::new(FakeEncoder::exiting(EncodeExit::Code(0))))
            .run(job, adm)
            .await;
        assert!(result.outcome.success);
        assert!(matches!(result.log, LogEntry::Check(ref c) if c.success));
    }
}
