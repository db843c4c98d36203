//! Transport stream metadata probing.
//!
//! The prober is an external program that prints a JSON description of the
//! programs (services) carried in a capture. [`Prober`] is the seam the
//! registry depends on; [`CommandProber`] runs the real executable.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::process::Command;

/// Error type for probe operations.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// Prober exited unsuccessfully.
    #[error("prober failed: {0}")]
    Failed(String),

    /// Prober output was not the expected JSON.
    #[error("failed to parse prober output: {0}")]
    Parse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// One program (service) found in a source file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProgramInfo {
    pub service_id: i32,
    /// PID of the video elementary stream; programs sharing it are one stream.
    pub video_pid: i32,
    pub has_video: bool,
    pub width: u32,
    pub height: u32,
    pub stream_format: String,
    pub service_name: String,
    pub event_time: Option<DateTime<Utc>>,
    pub event_name: String,
    pub genres: Vec<String>,
}

impl ProgramInfo {
    /// Mobile-reception ("one-seg") streams are too small to encode.
    pub fn is_undersized(&self) -> bool {
        self.width <= 320 && self.height <= 240
    }
}

/// Probe result for a source file.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProbeInfo {
    pub programs: Vec<ProgramInfo>,
}

#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, path: &Path) -> Result<ProbeInfo, ProbeError>;
}

/// Raw prober JSON structures for parsing.
mod prober_json {
    use chrono::{DateTime, Utc};
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    pub struct ProberOutput {
        pub programs: Option<Vec<Program>>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Program {
        pub service_id: Option<i32>,
        pub video_pid: Option<i32>,
        pub service_name: Option<String>,
        pub video: Option<Video>,
        pub event: Option<Event>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Video {
        pub width: Option<u32>,
        pub height: Option<u32>,
        pub format: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Event {
        pub start: Option<DateTime<Utc>>,
        pub name: Option<String>,
        pub genres: Option<Vec<String>>,
    }
}

/// Parses prober JSON output into a [`ProbeInfo`].
pub fn parse_prober_output(json_str: &str) -> Result<ProbeInfo, ProbeError> {
    let raw: prober_json::ProberOutput =
        serde_json::from_str(json_str).map_err(|e| ProbeError::Parse(e.to_string()))?;

    let programs = raw
        .programs
        .unwrap_or_default()
        .into_iter()
        .map(|p| {
            let (has_video, width, height, stream_format) = match p.video {
                Some(v) => (
                    true,
                    v.width.unwrap_or(0),
                    v.height.unwrap_or(0),
                    v.format.unwrap_or_default(),
                ),
                None => (false, 0, 0, String::new()),
            };
            let (event_time, event_name, genres) = match p.event {
                Some(e) => (
                    e.start,
                    e.name.unwrap_or_default(),
                    e.genres.unwrap_or_default(),
                ),
                None => (None, String::new(), Vec::new()),
            };
            ProgramInfo {
                service_id: p.service_id.unwrap_or(-1),
                video_pid: p.video_pid.unwrap_or(-1),
                has_video,
                width,
                height,
                stream_format,
                service_name: p.service_name.unwrap_or_default(),
                event_time,
                event_name,
                genres,
            }
        })
        .collect();

    Ok(ProbeInfo { programs })
}

/// Runs `<prober> --json <path>`.
#[derive(Debug, Clone)]
pub struct CommandProber {
    executable: PathBuf,
}

impl CommandProber {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
        }
    }
}

#[async_trait]
impl Prober for CommandProber {
    async fn probe(&self, path: &Path) -> Result<ProbeInfo, ProbeError> {
        let output = Command::new(&self.executable)
            .arg("--json")
            .arg(path)
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ProbeError::Failed(format!(
                "exited with status {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        parse_prober_output(&String::from_utf8_lossy(&output.stdout))
    }
}
