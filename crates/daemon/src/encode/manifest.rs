//! Encoder result manifest and exit status mapping.

use super::EncodeExit;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// One output file reported by the encoder.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutFile {
    pub path: PathBuf,
    #[serde(default)]
    pub size: u64,
}

/// JSON manifest written by the encoder on success.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EncodeManifest {
    #[serde(default)]
    pub srcpath: PathBuf,
    #[serde(default)]
    pub outfiles: Vec<OutFile>,
    #[serde(default)]
    pub srcfilesize: u64,
    #[serde(default)]
    pub outfilesize: u64,
    #[serde(default)]
    pub srcduration: f64,
    #[serde(default)]
    pub outduration: f64,
    #[serde(default)]
    pub incident: u32,
}

impl EncodeManifest {
    pub fn parse(text: &str) -> Result<Self, String> {
        serde_json::from_str(text).map_err(|e| format!("invalid result manifest: {}", e))
    }

    pub async fn read(path: &Path) -> Result<Self, String> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| format!("result manifest unreadable: {}", e))?;
        Self::parse(&text)
    }
}

/// Thresholds used to interpret an encoder exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitPolicy {
    pub incident_threshold: u32,
    pub logo_not_found_exit_code: i32,
}

impl Default for ExitPolicy {
    fn default() -> Self {
        Self {
            incident_threshold: 10,
            logo_not_found_exit_code: 100,
        }
    }
}

/// Interpreted result of one encoder run.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub success: bool,
    pub reason: String,
    pub canceled: bool,
    pub manifest: Option<EncodeManifest>,
}

impl Outcome {
    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            reason: reason.into(),
            canceled: false,
            manifest: None,
        }
    }

    pub fn canceled() -> Self {
        Self {
            canceled: true,
            ..Self::failed("canceled")
        }
    }
}

/// Map an exit and (for exit 0) the parsed manifest to an outcome.
///
/// Check-mode runs produce no manifest, so `manifest` is `None` for them.
pub fn map_exit(
    exit: EncodeExit,
    manifest: Option<Result<EncodeManifest, String>>,
    policy: ExitPolicy,
) -> Outcome {
    match exit {
        EncodeExit::Canceled => Outcome::canceled(),
        EncodeExit::Signaled => Outcome::failed("terminated by signal"),
        EncodeExit::Code(0) => match manifest {
            None => Outcome {
                success: true,
                reason: String::new(),
                canceled: false,
                manifest: None,
            },
            Some(Err(reason)) => Outcome::failed(reason),
            Some(Ok(m)) if m.incident >= policy.incident_threshold => Outcome {
                manifest: Some(m),
                ..Outcome::failed("too many incidents")
            },
            Some(Ok(m)) => Outcome {
                success: true,
                reason: String::new(),
                canceled: false,
                manifest: Some(m),
            },
        },
        EncodeExit::Code(code) if code == policy.logo_not_found_exit_code => {
            Outcome::failed("no matching logo found")
        }
        EncodeExit::Code(code) => Outcome::failed(format!("exited with code {}", code)),
    }
}
