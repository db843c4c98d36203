//! Startup checks
//!
//! Preflight checks run before the server binds:
//! - The data directory exists (or can be created) and is writable
//! - The encoder and prober executables resolve to files

use crate::config::Config;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("{role} not found: {name} (not a file and not on PATH)")]
    ExecutableNotFound { role: &'static str, name: String },

    #[error("data directory {path} is not usable: {source}")]
    DataDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Resolve an executable the way a process spawn would.
///
/// Names containing a path separator are taken as paths; bare names are
/// looked up in each directory of `search_path`.
pub fn resolve_executable(name: &Path, search_path: Option<&std::ffi::OsStr>) -> Option<PathBuf> {
    if name.as_os_str().is_empty() {
        return None;
    }
    if name.components().count() > 1 || name.is_absolute() {
        return name.is_file().then(|| name.to_path_buf());
    }
    env::split_paths(search_path?)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

/// Check that an external program can be found
pub fn check_executable(role: &'static str, name: &Path) -> Result<PathBuf, StartupError> {
    let path_var = env::var_os("PATH");
    resolve_executable(name, path_var.as_deref()).ok_or_else(|| {
        StartupError::ExecutableNotFound {
            role,
            name: name.display().to_string(),
        }
    })
}

/// Create the data directory if needed and prove it is writable
pub fn check_data_dir(dir: &Path) -> Result<(), StartupError> {
    let fail = |source| StartupError::DataDir {
        path: dir.to_path_buf(),
        source,
    };
    fs::create_dir_all(dir).map_err(fail)?;
    let probe = dir.join(".write-test");
    fs::write(&probe, b"").map_err(fail)?;
    fs::remove_file(&probe).map_err(fail)?;
    Ok(())
}

/// Run all startup checks in order
///
/// 1. Data directory
/// 2. Encoder executable
/// 3. Prober executable
pub fn run_startup_checks(cfg: &Config) -> Result<(), StartupError> {
    check_data_dir(&cfg.server.data_dir)?;
    let encoder = check_executable("encoder", &cfg.encoder.executable)?;
    debug!(path = %encoder.display(), "encoder found");
    let prober = check_executable("prober", &cfg.encoder.prober)?;
    debug!(path = %prober.display(), "prober found");
    info!(data_dir = %cfg.server.data_dir.display(), "startup checks passed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::TempDir;

    #[test]
    fn test_bare_name_is_searched_in_path() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("encoder"), b"").unwrap();
        let search = env::join_paths([PathBuf::from("/nonexistent"), dir.path().to_path_buf()])
            .unwrap();

        let found = resolve_executable(Path::new("encoder"), Some(&search)).unwrap();
        assert_eq!(found, dir.path().join("encoder"));
        assert!(resolve_executable(Path::new("prober"), Some(&search)).is_none());
        assert!(resolve_executable(Path::new("encoder"), None).is_none());
    }

    #[test]
    fn test_explicit_path_is_not_searched() {
        let dir = TempDir::new().unwrap();
        let exe = dir.path().join("encoder");
        fs::write(&exe, b"").unwrap();
        let search = env::join_paths([dir.path()]).unwrap();

        assert_eq!(resolve_executable(&exe, None), Some(exe.clone()));
        assert!(resolve_executable(Path::new("bin/encoder"), Some(&search)).is_none());
        assert!(resolve_executable(Path::new(""), Some(&search)).is_none());
    }

    #[test]
    fn test_check_data_dir_creates_missing_dir() {
        let dir = TempDir::new().unwrap();
        let data = dir.path().join("a/b/data");
        check_data_dir(&data).unwrap();
        assert!(data.is_dir());
        assert!(!data.join(".write-test").exists());
    }

    #[test]
    fn test_data_dir_over_file_is_rejected() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("data");
        fs::write(&file, b"").unwrap();
        assert!(matches!(
            check_data_dir(&file),
            Err(StartupError::DataDir { .. })
        ));
    }

    #[test]
    fn test_missing_encoder_fails_checks() {
        let dir = TempDir::new().unwrap();
        let mut cfg = Config::default();
        cfg.server.data_dir = dir.path().join("data");
        cfg.encoder.executable = dir.path().join("missing-encoder");
        let err = run_startup_checks(&cfg).unwrap_err();
        assert!(matches!(
            err,
            StartupError::ExecutableNotFound { role: "encoder", .. }
        ));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(50))]

        #[test]
        fn prop_unknown_names_do_not_resolve(name in "[a-z][a-z0-9_-]{0,15}") {
            let dir = TempDir::new().unwrap();
            let search = env::join_paths([dir.path()]).unwrap();
            prop_assert!(resolve_executable(Path::new(&name), Some(&search)).is_none());
        }
    }
}
