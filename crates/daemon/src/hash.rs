//! Integrity checking for sources that arrived over a network share.
//!
//! A directory `<dir>` may be accompanied by a manifest `<dir>.hash` listing
//! `<file name>\t<sha256 hex>` lines. Before encoding, the worker copies the
//! source to local scratch space while hashing it and compares the digest.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

const COPY_CHUNK: usize = 1 << 20;

#[derive(Debug, Error)]
pub enum HashError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("hash mismatch (expected {expected}, got {actual})")]
    Mismatch { expected: String, actual: String },
}

/// Manifest path for a source: the parent directory with `.hash` appended.
pub fn manifest_path(src: &Path) -> Option<PathBuf> {
    let dir = src.parent()?;
    if dir.file_name().is_none() {
        return None;
    }
    let mut p = dir.as_os_str().to_owned();
    p.push(".hash");
    Some(PathBuf::from(p))
}

/// Parse manifest text into lowercase file name -> lowercase hex digest.
pub fn parse_manifest(text: &str) -> HashMap<String, String> {
    text.lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                return None;
            }
            let (name, digest) = line.rsplit_once(|c: char| c == '\t' || c == ' ')?;
            let name = name.trim();
            let digest = digest.trim();
            if name.is_empty() || digest.is_empty() {
                return None;
            }
            Some((name.to_lowercase(), digest.to_lowercase()))
        })
        .collect()
}

/// Per-manifest cache. Only manifests that were read are kept, so a
/// missing or unreadable one is tried again on the next lookup.
#[derive(Debug, Default)]
pub struct HashCache {
    manifests: HashMap<PathBuf, HashMap<String, String>>,
}

impl HashCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the expected digest of `src`; the error is a pending reason.
    pub fn lookup(&mut self, src: &Path) -> Result<String, String> {
        let manifest = manifest_path(src).ok_or_else(|| "no hash manifest location".to_string())?;
        if !self.manifests.contains_key(&manifest) {
            let text = std::fs::read_to_string(&manifest).map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    format!("hash file {} not found", manifest.display())
                } else {
                    format!("failed to read hash file: {}", e)
                }
            })?;
            self.manifests
                .insert(manifest.clone(), parse_manifest(&text));
        }
        let name = src
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        self.manifests
            .get(&manifest)
            .and_then(|entries| entries.get(&name))
            .cloned()
            .ok_or_else(|| format!("no hash entry for {}", name))
    }

    /// Forget cached manifests so new files on disk are picked up.
    pub fn clear(&mut self) {
        self.manifests.clear();
    }
}

/// Copy `src` to `dst` and return the SHA-256 of the bytes copied.
pub async fn copy_with_hash(src: &Path, dst: &Path) -> Result<String, HashError> {
    if let Some(parent) = dst.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut input = File::open(src).await?;
    let mut output = File::create(dst).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; COPY_CHUNK];
    loop {
        let n = input.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        output.write_all(&buf[..n]).await?;
    }
    output.flush().await?;
    Ok(hex::encode(hasher.finalize()))
}

/// Copy and verify; on mismatch the partial copy is removed.
pub async fn copy_verified(src: &Path, dst: &Path, expected: &str) -> Result<(), HashError> {
    let actual = copy_with_hash(src, dst).await?;
    if actual.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        let _ = tokio::fs::remove_file(dst).await;
        Err(HashError::Mismatch {
            expected: expected.to_lowercase(),
            actual,
        })
    }
}
