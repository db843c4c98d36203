//! Per-add hook scripts.
//!
//! A hook runs once for every job derived during an add, before the job is
//! committed. It sees the job through environment variables and talks back
//! through `##` command lines on stdout.

use crate::job::{Job, MAX_PRIORITY, MIN_PRIORITY};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum HookError {
    #[error("invalid hook name: {0}")]
    InvalidName(String),

    #[error("hook {0} not found")]
    NotFound(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// What a hook asked for.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HookResult {
    pub tags: Vec<String>,
    pub out_dir: Option<PathBuf>,
    pub priority: Option<u8>,
    /// Commit the job as canceled.
    pub cancel_item: bool,
    /// Abort the whole add operation.
    pub cancel_add: bool,
    /// Non-command output, forwarded to the add console.
    pub console: Vec<String>,
}

impl HookResult {
    /// Apply one stdout line.
    pub fn apply_line(&mut self, line: &str) {
        let Some(command) = line.strip_prefix("##") else {
            self.console.push(line.to_string());
            return;
        };
        let (name, arg) = match command.split_once(char::is_whitespace) {
            Some((n, a)) => (n, a.trim()),
            None => (command.trim(), ""),
        };
        match name.to_ascii_uppercase().as_str() {
            "ADD_TAG" if !arg.is_empty() => self.tags.push(arg.to_string()),
            "SET_OUT_DIR" if !arg.is_empty() => self.out_dir = Some(PathBuf::from(arg)),
            "SET_PRIORITY" => match arg.parse::<u8>() {
                Ok(p) if (MIN_PRIORITY..=MAX_PRIORITY).contains(&p) => self.priority = Some(p),
                _ => self.console.push(format!("invalid priority: {}", arg)),
            },
            "CANCEL_ITEM" => self.cancel_item = true,
            "CANCEL_ADD" => self.cancel_add = true,
            _ => self.console.push(format!("unknown hook command: {}", line)),
        }
    }

    /// Fold the requested changes into `job`.
    pub fn apply_to(&self, job: &mut Job) {
        for tag in &self.tags {
            if !job.tags.contains(tag) {
                job.tags.push(tag.clone());
            }
        }
        if let Some(dir) = &self.out_dir {
            job.dst_dir = dir.clone();
        }
        if let Some(p) = self.priority {
            job.set_priority(p);
        }
    }
}

/// Environment handed to a hook for `job`.
pub fn hook_env(job: &Job) -> Vec<(&'static str, String)> {
    let src = &job.src_path;
    let out = job.output_path();
    let dir_of = |p: &Path| {
        p.parent()
            .map(|d| d.display().to_string())
            .unwrap_or_default()
    };
    vec![
        ("ITEM_ID", job.id.to_string()),
        ("IN_PATH", src.display().to_string()),
        (
            "IN_FILENAME",
            src.file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default(),
        ),
        ("IN_DIR", dir_of(src)),
        (
            "IN_EXT",
            src.extension()
                .map(|e| format!(".{}", e.to_string_lossy()))
                .unwrap_or_default(),
        ),
        ("OUT_PATH", out.display().to_string()),
        ("OUT_DIR", job.dst_dir.display().to_string()),
        ("SERVICE_ID", job.service_id.to_string()),
        ("SERVICE_NAME", job.service_name.clone()),
        (
            "TS_TIME",
            job.ts_time.map(|t| t.to_rfc3339()).unwrap_or_default(),
        ),
        ("ITEM_MODE", job.mode.to_string()),
        ("ITEM_PRIORITY", job.priority.to_string()),
        ("EVENT_GENRE", job.genres.join(";")),
        ("IMAGE_WIDTH", job.video_width.to_string()),
        ("IMAGE_HEIGHT", job.video_height.to_string()),
        ("EVENT_NAME", job.event_name.clone()),
        ("TAG", job.tags.join(";")),
    ]
}

#[async_trait]
pub trait AddHook: Send + Sync {
    /// Run hook `name` for `job`. Cancellation kills the hook and reports
    /// `cancel_add`.
    async fn run(
        &self,
        name: &str,
        job: &Job,
        cancel: &CancellationToken,
    ) -> Result<HookResult, HookError>;
}

/// Runs hook scripts from a directory.
#[derive(Debug, Clone)]
pub struct ScriptHook {
    hook_dir: PathBuf,
}

impl ScriptHook {
    pub fn new(hook_dir: impl Into<PathBuf>) -> Self {
        Self {
            hook_dir: hook_dir.into(),
        }
    }

    fn resolve(&self, name: &str) -> Result<PathBuf, HookError> {
        if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
            return Err(HookError::InvalidName(name.to_string()));
        }
        let path = self.hook_dir.join(name);
        if !path.is_file() {
            return Err(HookError::NotFound(path));
        }
        Ok(path)
    }
}

#[async_trait]
impl AddHook for ScriptHook {
    async fn run(
        &self,
        name: &str,
        job: &Job,
        cancel: &CancellationToken,
    ) -> Result<HookResult, HookError> {
        let script = self.resolve(name)?;
        let mut child = Command::new(&script)
            .envs(hook_env(job))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        let mut result = HookResult::default();
        let Some(stdout) = child.stdout.take() else {
            return Ok(result);
        };
        let mut lines = BufReader::new(stdout).lines();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    result.cancel_add = true;
                    return Ok(result);
                }
                line = lines.next_line() => match line? {
                    Some(line) => result.apply_line(&line),
                    None => break,
                },
            }
        }

        let status = child.wait().await?;
        if !status.success() {
            warn!(hook = name, job_id = job.id, %status, "hook exited unsuccessfully");
        }
        debug!(hook = name, job_id = job.id, ?result, "hook finished");
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::test_job;

    #[test]
    fn test_apply_lines() {
        let mut r = HookResult::default();
        for line in [
            "hello",
            "##ADD_TAG anime",
            "##set_out_dir /mnt/out",
            "##SET_PRIORITY 5",
            "##SET_PRIORITY 9",
            "##CANCEL_ITEM",
            "##BOGUS",
        ] {
            r.apply_line(line);
        }
        assert_eq!(r.tags, vec!["anime"]);
        assert_eq!(r.out_dir, Some(PathBuf::from("/mnt/out")));
        assert_eq!(r.priority, Some(5));
        assert!(r.cancel_item);
        assert!(!r.cancel_add);
        assert_eq!(r.console.len(), 3);
    }

    #[test]
    fn test_apply_to_job() {
        let mut job = test_job(1, "/rec/a.ts");
        let r = HookResult {
            tags: vec!["x".into(), "x".into()],
            out_dir: Some(PathBuf::from("/other")),
            priority: Some(1),
            ..HookResult::default()
        };
        r.apply_to(&mut job);
        assert_eq!(job.tags, vec!["x"]);
        assert_eq!(job.output_path(), PathBuf::from("/other/out"));
        assert_eq!(job.priority, 1);
    }

    #[test]
    fn test_env_contains_all_keys() {
        let job = test_job(4, "/rec/show.ts");
        let env = hook_env(&job);
        let get = |k: &str| env.iter().find(|(key, _)| *key == k).map(|(_, v)| v.clone());
        assert_eq!(get("ITEM_ID").as_deref(), Some("4"));
        assert_eq!(get("IN_FILENAME").as_deref(), Some("show"));
        assert_eq!(get("IN_EXT").as_deref(), Some(".ts"));
        assert_eq!(get("IN_DIR").as_deref(), Some("/rec"));
        assert_eq!(env.len(), 17);
    }

    #[tokio::test]
    async fn test_rejects_path_in_name() {
        let hook = ScriptHook::new("/tmp");
        let job = test_job(1, "/rec/a.ts");
        let err = hook
            .run("../evil.sh", &job, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, HookError::InvalidName(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_script_commands_round_trip() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::TempDir::new().unwrap();
        let script = dir.path().join("tag.sh");
        std::fs::write(
            &script,
            "#!/bin/sh\necho \"##ADD_TAG $SERVICE_ID\"\necho plain\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut job = test_job(1, "/rec/a.ts");
        job.service_id = 211;
        let result = ScriptHook::new(dir.path())
            .run("tag.sh", &job, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.tags, vec!["211"]);
        assert_eq!(result.console, vec!["plain"]);
    }
}
