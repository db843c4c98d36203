//! Source file housekeeping for batch jobs.
//!
//! Once the last active job of a source finishes, the file is moved into a
//! `succeeded` or `failed` folder next to it, together with the recorder's
//! sidecar files. Retrying moves it back.

use super::QueueManager;
use crate::job::{Job, JobState};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::info;

pub const SUCCEEDED_DIR: &str = "succeeded";
pub const FAILED_DIR: &str = "failed";

/// Suffixes of files that travel with a source (`<name><suffix>`).
const SIDECAR_SUFFIXES: &[&str] = &[".err", ".program.txt"];

fn companions(src: &Path) -> Vec<PathBuf> {
    let mut paths = vec![src.to_path_buf()];
    for suffix in SIDECAR_SUFFIXES {
        let mut p = src.as_os_str().to_owned();
        p.push(suffix);
        paths.push(PathBuf::from(p));
    }
    paths
}

/// Move `src` and its sidecars into `dst_dir`. A missing source is a no-op.
pub(crate) fn move_with_sidecars(src: &Path, dst_dir: &Path) -> io::Result<bool> {
    if !src.exists() {
        return Ok(false);
    }
    fs::create_dir_all(dst_dir)?;
    for path in companions(src) {
        if !path.exists() {
            continue;
        }
        if let Some(name) = path.file_name() {
            fs::rename(&path, dst_dir.join(name))?;
        }
    }
    Ok(true)
}

fn delete_with_sidecars(src: &Path) -> io::Result<bool> {
    if !src.exists() {
        return Ok(false);
    }
    for path in companions(src) {
        if path.exists() {
            fs::remove_file(&path)?;
        }
    }
    Ok(true)
}

/// `<dir>/<sub>/<file name>` for a source path.
pub(crate) fn moved_path(src: &Path, sub: &str) -> Option<PathBuf> {
    let dir = src.parent()?;
    Some(dir.join(sub).join(src.file_name()?))
}

impl QueueManager {
    fn has_active_sibling(&self, job: &Job) -> bool {
        self.jobs
            .iter()
            .any(|j| j.src_path == job.src_path && j.is_active())
    }

    /// Move the source of a finished batch job once no sibling is active.
    pub(super) fn settle_source(&self, job: &Job) -> io::Result<()> {
        if self.has_active_sibling(job) {
            return Ok(());
        }
        let any_failed = self
            .jobs
            .iter()
            .any(|j| j.src_path == job.src_path && j.state == JobState::Failed);
        let sub = if any_failed { FAILED_DIR } else { SUCCEEDED_DIR };
        let Some(dir) = job.src_path.parent() else {
            return Ok(());
        };
        if move_with_sidecars(&job.src_path, &dir.join(sub))? {
            info!(src = %job.src_path.display(), to = sub, "source moved");
        }
        Ok(())
    }

    /// Bring a moved source back before the job is run again.
    pub(super) fn restore_source(&self, job: &Job) -> io::Result<()> {
        if !job.is_batch()
            || !matches!(job.state, JobState::Failed | JobState::Complete)
            || self.has_active_sibling(job)
        {
            return Ok(());
        }
        let sub = if job.state == JobState::Failed {
            FAILED_DIR
        } else {
            SUCCEEDED_DIR
        };
        let (Some(moved), Some(dir)) = (moved_path(&job.src_path, sub), job.src_path.parent())
        else {
            return Ok(());
        };
        if move_with_sidecars(&moved, dir)? {
            info!(src = %job.src_path.display(), from = sub, "source restored");
        }
        Ok(())
    }

    /// Delete the moved source of a completed batch job.
    pub(super) fn delete_source(&self, job: &Job) -> Result<(), String> {
        if !job.is_batch() {
            return Err("only batch items can delete their source file".to_string());
        }
        if job.state != JobState::Complete {
            return Err("source file can only be deleted for completed items".to_string());
        }
        if self.has_active_sibling(job) {
            return Err("other items of this source are still active".to_string());
        }
        if let Some(moved) = moved_path(&job.src_path, SUCCEEDED_DIR) {
            delete_with_sidecars(&moved)
                .map_err(|e| format!("failed to delete source file: {}", e))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode::Outcome;
    use crate::queue::tests::{catalog, manager, push_job};
    use tempfile::TempDir;

    fn succeed() -> Outcome {
        Outcome {
            success: true,
            reason: String::new(),
            canceled: false,
            manifest: None,
        }
    }

    #[test]
    fn test_group_moves_once_to_failed() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("show.ts");
        fs::write(&src, b"ts").unwrap();
        fs::write(dir.path().join("show.ts.err"), b"log").unwrap();
        let src_str = src.to_str().unwrap();

        let (mut qm, _) = manager();
        let catalog = catalog();
        let a = push_job(&mut qm, src_str);
        let b = push_job(&mut qm, src_str);
        qm.update_all_pending(&catalog);
        qm.mark_running(a);
        qm.mark_running(b);

        qm.finish_job(a, &Outcome::failed("exited with code 1"));
        assert!(src.exists(), "sibling still running");

        qm.finish_job(b, &succeed());
        assert!(!src.exists());
        assert!(dir.path().join("failed/show.ts").exists());
        assert!(dir.path().join("failed/show.ts.err").exists());
        assert!(!dir.path().join("succeeded").exists());
    }

    #[test]
    fn test_all_success_moves_to_succeeded_and_back() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("show.ts");
        fs::write(&src, b"ts").unwrap();

        let (mut qm, _) = manager();
        let catalog = catalog();
        let id = push_job(&mut qm, src.to_str().unwrap());
        qm.update_all_pending(&catalog);
        qm.mark_running(id);
        qm.finish_job(id, &succeed());
        assert!(dir.path().join("succeeded/show.ts").exists());

        let job = qm.get(id).unwrap().clone();
        qm.restore_source(&job).unwrap();
        assert!(src.exists());
    }

    #[test]
    fn test_delete_source_rules() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("show.ts");
        fs::write(&src, b"ts").unwrap();

        let (mut qm, _) = manager();
        let catalog = catalog();
        let id = push_job(&mut qm, src.to_str().unwrap());
        qm.update_all_pending(&catalog);
        let job = qm.get(id).unwrap().clone();
        assert!(qm.delete_source(&job).is_err());

        qm.mark_running(id);
        qm.finish_job(id, &succeed());
        let job = qm.get(id).unwrap().clone();
        qm.delete_source(&job).unwrap();
        assert!(!dir.path().join("succeeded/show.ts").exists());
    }
}
