//! In-process fakes for the collaborator traits.

use crate::encode::{EncodeError, EncodeExit, EncodeIo, EncodeManifest, EncodeRequest, Encoder};
use crate::hook::{AddHook, HookError, HookResult};
use crate::job::Job;
use crate::probe::{ProbeError, ProbeInfo, Prober, ProgramInfo};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio_util::sync::CancellationToken;

pub fn program(service_id: i32, video_pid: i32, width: u32, height: u32) -> ProgramInfo {
    ProgramInfo {
        service_id,
        video_pid,
        has_video: true,
        width,
        height,
        stream_format: "mpeg2".to_string(),
        service_name: format!("service {}", service_id),
        event_time: None,
        event_name: "event".to_string(),
        genres: vec!["anime/domestic".to_string()],
    }
}

/// Returns canned probe results; unknown paths get one HD program on 1024.
#[derive(Debug, Default)]
pub struct FakeProber {
    results: Mutex<HashMap<PathBuf, Result<ProbeInfo, String>>>,
}

impl FakeProber {
    pub fn set(&self, path: impl Into<PathBuf>, result: Result<Vec<ProgramInfo>, String>) {
        self.results
            .lock()
            .insert(path.into(), result.map(|programs| ProbeInfo { programs }));
    }
}

#[async_trait]
impl Prober for FakeProber {
    async fn probe(&self, path: &Path) -> Result<ProbeInfo, ProbeError> {
        match self.results.lock().get(path) {
            Some(Ok(info)) => Ok(info.clone()),
            Some(Err(e)) => Err(ProbeError::Failed(e.clone())),
            None => Ok(ProbeInfo {
                programs: vec![program(1024, 256, 1920, 1080)],
            }),
        }
    }
}

type HookFn = dyn Fn(&Job, usize) -> HookResult + Send + Sync;

/// Hook whose result is computed by a closure from the job and call index.
pub struct FakeHook {
    f: Box<HookFn>,
    calls: AtomicUsize,
}

impl FakeHook {
    pub fn new(f: impl Fn(&Job, usize) -> HookResult + Send + Sync + 'static) -> Self {
        Self {
            f: Box::new(f),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AddHook for FakeHook {
    async fn run(
        &self,
        _name: &str,
        job: &Job,
        _cancel: &CancellationToken,
    ) -> Result<HookResult, HookError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        Ok((self.f)(job, n))
    }
}

/// Encoder double: prints one console line, writes a manifest on exit 0
/// and optionally blocks until canceled.
#[derive(Debug)]
pub struct FakeEncoder {
    pub exit: EncodeExit,
    pub incident: u32,
    pub wait_for_cancel: bool,
    pub requests: Mutex<Vec<EncodeRequest>>,
}

impl FakeEncoder {
    pub fn exiting(exit: EncodeExit) -> Self {
        Self {
            exit,
            incident: 0,
            wait_for_cancel: false,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn blocking() -> Self {
        Self {
            wait_for_cancel: true,
            ..Self::exiting(EncodeExit::Code(0))
        }
    }
}

#[async_trait]
impl Encoder for FakeEncoder {
    async fn run(&self, request: &EncodeRequest, io: EncodeIo) -> Result<EncodeExit, EncodeError> {
        self.requests.lock().push(request.clone());
        let _ = io
            .console
            .send(Bytes::from(format!("encoding {}\n", request.input.display())));
        if self.wait_for_cancel {
            io.cancel.cancelled().await;
            return Ok(EncodeExit::Canceled);
        }
        if self.exit == EncodeExit::Code(0) && !request.check {
            let manifest = EncodeManifest {
                srcpath: request.input.clone(),
                outfiles: vec![crate::encode::manifest::OutFile {
                    path: request.output.with_extension("mp4"),
                    size: 10,
                }],
                srcfilesize: 100,
                outfilesize: 10,
                srcduration: 60.0,
                outduration: 60.0,
                incident: self.incident,
            };
            let text = serde_json::to_string(&manifest).map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
            tokio::fs::write(&request.manifest, text).await?;
        }
        Ok(self.exit)
    }
}
