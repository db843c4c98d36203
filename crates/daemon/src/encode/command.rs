//! Encoder process runner
//!
//! Builds the encoder command line for a job, streams its console output
//! in small chunks, and honours cancel/suspend requests from the worker pool.

use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Largest console chunk forwarded to clients.
pub const CONSOLE_CHUNK: usize = 1024;

/// Error type for encoder invocation
#[derive(Debug, Error)]
pub enum EncodeError {
    /// Executable could not be found
    #[error("encoder executable not found: {0}")]
    NotFound(PathBuf),

    /// IO error while spawning or waiting
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// How the encoder process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeExit {
    Code(i32),
    /// Terminated by a signal we did not send.
    Signaled,
    /// Killed because the job was canceled.
    Canceled,
}

/// Everything the encoder needs to run one job.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodeRequest {
    pub job_id: u64,
    pub input: PathBuf,
    pub output: PathBuf,
    /// Where the encoder writes its JSON result manifest.
    pub manifest: PathBuf,
    pub priority: u8,
    pub service_id: i32,
    /// Analysis-only run.
    pub check: bool,
    /// Profile-specific arguments.
    pub args: Vec<String>,
}

/// Control and output channels of a running job.
#[derive(Debug)]
pub struct EncodeIo {
    pub cancel: CancellationToken,
    /// `true` while the worker is suspended.
    pub suspend: watch::Receiver<bool>,
    pub console: mpsc::UnboundedSender<Bytes>,
}

#[async_trait]
pub trait Encoder: Send + Sync {
    async fn run(&self, request: &EncodeRequest, io: EncodeIo) -> Result<EncodeExit, EncodeError>;
}

/// Build the encoder command for a request.
///
/// Layout: `<exe> -i <input> -o <output> --json <manifest> --priority <n>
/// --service <id> [--mode check] <profile args...>`
pub fn build_encode_command(executable: &Path, request: &EncodeRequest) -> Command {
    let mut cmd = Command::new(executable);
    cmd.arg("-i").arg(&request.input);
    cmd.arg("-o").arg(&request.output);
    cmd.arg("--json").arg(&request.manifest);
    cmd.arg("--priority").arg(request.priority.to_string());
    cmd.arg("--service").arg(request.service_id.to_string());
    if request.check {
        cmd.arg("--mode").arg("check");
    }
    cmd.args(&request.args);
    cmd
}

/// Runs the configured encoder executable.
#[derive(Debug, Clone)]
pub struct CommandEncoder {
    executable: PathBuf,
}

impl CommandEncoder {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
        }
    }
}

async fn pump<R: AsyncRead + Unpin>(mut reader: R, console: mpsc::UnboundedSender<Bytes>) {
    let mut buf = [0u8; CONSOLE_CHUNK];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            // Keep draining even without listeners so the child never blocks
            Ok(n) => {
                let _ = console.send(Bytes::copy_from_slice(&buf[..n]));
            }
        }
    }
}

#[cfg(unix)]
async fn set_suspended(pid: u32, suspended: bool) {
    let signal = if suspended { "-STOP" } else { "-CONT" };
    match Command::new("kill")
        .arg(signal)
        .arg(pid.to_string())
        .status()
        .await
    {
        Ok(status) if status.success() => debug!(pid, suspended, "encoder signalled"),
        Ok(status) => warn!(pid, %status, "kill {} failed", signal),
        Err(e) => warn!(pid, error = %e, "kill {} failed", signal),
    }
}

#[cfg(not(unix))]
async fn set_suspended(pid: u32, suspended: bool) {
    debug!(pid, suspended, "suspend not supported on this platform");
}

#[async_trait]
impl Encoder for CommandEncoder {
    async fn run(&self, request: &EncodeRequest, mut io: EncodeIo) -> Result<EncodeExit, EncodeError> {
        let mut cmd = build_encode_command(&self.executable, request);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => EncodeError::NotFound(self.executable.clone()),
            _ => EncodeError::Io(e),
        })?;
        let pid = child.id();

        let mut readers = Vec::new();
        if let Some(out) = child.stdout.take() {
            readers.push(tokio::spawn(pump(out, io.console.clone())));
        }
        if let Some(err) = child.stderr.take() {
            readers.push(tokio::spawn(pump(err, io.console.clone())));
        }

        let mut suspended = false;
        if *io.suspend.borrow() {
            if let Some(pid) = pid {
                set_suspended(pid, true).await;
                suspended = true;
            }
        }

        let mut watch_suspend = true;
        let exit = loop {
            tokio::select! {
                status = child.wait() => {
                    let status = status?;
                    break match status.code() {
                        Some(code) => EncodeExit::Code(code),
                        None => EncodeExit::Signaled,
                    };
                }
                _ = io.cancel.cancelled() => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    break EncodeExit::Canceled;
                }
                changed = io.suspend.changed(), if watch_suspend => {
                    if changed.is_err() {
                        watch_suspend = false;
                        continue;
                    }
                    let want = *io.suspend.borrow();
                    if want != suspended {
                        if let Some(pid) = pid {
                            set_suspended(pid, want).await;
                        }
                        suspended = want;
                    }
                }
            }
        };

        // Flush remaining console output; grandchildren may hold the pipes open
        for reader in readers {
            let _ = tokio::time::timeout(Duration::from_secs(5), reader).await;
        }

        debug!(job_id = request.job_id, ?exit, "encoder exited");
        Ok(exit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn request(check: bool, args: Vec<String>) -> EncodeRequest {
        EncodeRequest {
            job_id: 1,
            input: PathBuf::from("/rec/a.ts"),
            output: PathBuf::from("/out/a"),
            manifest: PathBuf::from("/work/1-enc.json"),
            priority: 3,
            service_id: 1024,
            check,
            args,
        }
    }

    fn get_command_args(cmd: &Command) -> Vec<String> {
        cmd.as_std()
            .get_args()
            .filter_map(|arg| arg.to_str().map(String::from))
            .collect()
    }

    fn has_flag_with_value(args: &[String], flag: &str, value: &str) -> bool {
        args.windows(2).any(|pair| pair[0] == flag && pair[1] == value)
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_command_carries_paths_and_profile_args(
            extra in proptest::collection::vec("[a-z0-9-]{1,10}", 0..6),
            check in proptest::bool::ANY,
        ) {
            let req = request(check, extra.clone());
            let cmd = build_encode_command(Path::new("encoder"), &req);
            let args = get_command_args(&cmd);

            prop_assert!(has_flag_with_value(&args, "-i", "/rec/a.ts"));
            prop_assert!(has_flag_with_value(&args, "-o", "/out/a"));
            prop_assert!(has_flag_with_value(&args, "--json", "/work/1-enc.json"));
            prop_assert!(has_flag_with_value(&args, "--priority", "3"));
            prop_assert_eq!(has_flag_with_value(&args, "--mode", "check"), check);
            prop_assert!(args.ends_with(&extra));
        }
    }

    fn io() -> (EncodeIo, mpsc::UnboundedReceiver<Bytes>, watch::Sender<bool>, CancellationToken) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (suspend_tx, suspend_rx) = watch::channel(false);
        let cancel = CancellationToken::new();
        (
            EncodeIo {
                cancel: cancel.clone(),
                suspend: suspend_rx,
                console: tx,
            },
            rx,
            suspend_tx,
            cancel,
        )
    }

    #[tokio::test]
    async fn test_missing_executable() {
        let (io, _rx, _s, _c) = io();
        let err = CommandEncoder::new("/nonexistent/encoder")
            .run(&request(false, vec![]), io)
            .await
            .unwrap_err();
        assert!(matches!(err, EncodeError::NotFound(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exit_code_and_console() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::TempDir::new().unwrap();
        let exe = dir.path().join("enc.sh");
        std::fs::write(&exe, "#!/bin/sh\necho encoding \"$2\"\nexit 7\n").unwrap();
        std::fs::set_permissions(&exe, std::fs::Permissions::from_mode(0o755)).unwrap();

        let (io, mut rx, _s, _c) = io();
        let exit = CommandEncoder::new(&exe)
            .run(&request(false, vec![]), io)
            .await
            .unwrap();
        assert_eq!(exit, EncodeExit::Code(7));

        let mut out = Vec::new();
        while let Ok(chunk) = rx.try_recv() {
            out.extend_from_slice(&chunk);
        }
        assert_eq!(String::from_utf8_lossy(&out), "encoding /rec/a.ts\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancel_kills_process() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::TempDir::new().unwrap();
        let exe = dir.path().join("slow.sh");
        std::fs::write(&exe, "#!/bin/sh\nexec sleep 30\n").unwrap();
        std::fs::set_permissions(&exe, std::fs::Permissions::from_mode(0o755)).unwrap();

        let (io, _rx, _s, cancel) = io();
        let encoder = CommandEncoder::new(&exe);
        let req = request(false, vec![]);
        let run = tokio::spawn(async move { encoder.run(&req, io).await });
        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();

        let exit = tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .expect("cancel should end the run")
            .unwrap()
            .unwrap();
        assert_eq!(exit, EncodeExit::Canceled);
    }
}
