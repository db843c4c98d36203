//! Background loops. None of them touch queue state; they only post
//! [`Command`]s to the command loop.

use super::Command;
use crate::config::QuietHours;
use crate::status::{collect_system_metrics, SharedStatus};
use chrono::Timelike;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{mpsc, watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const QUIET_HOURS_CHECK: Duration = Duration::from_secs(60);
const PRUNE_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);
const SYSTEM_METRICS_INTERVAL: Duration = Duration::from_secs(2);

/// Change noticed in the data directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Logo { service_id: i32, file_name: String },
    Profile(PathBuf),
}

/// Service id of a logo file named `SID<service>-<n>.lgd`.
pub fn parse_logo_name(name: &str) -> Option<i32> {
    let rest = name.strip_prefix("SID")?.strip_suffix(".lgd")?;
    let (sid, n) = rest.split_once('-')?;
    n.parse::<u32>().ok()?;
    sid.parse().ok()
}

/// Polling state for the logo and profile directories.
#[derive(Debug)]
pub struct DirWatcher {
    logo_dir: PathBuf,
    profile_dir: PathBuf,
    seen_logos: HashSet<String>,
    profile_mtimes: HashMap<PathBuf, SystemTime>,
    primed: bool,
}

fn modified(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

impl DirWatcher {
    pub fn new(logo_dir: PathBuf, profile_dir: PathBuf) -> Self {
        Self {
            logo_dir,
            profile_dir,
            seen_logos: HashSet::new(),
            profile_mtimes: HashMap::new(),
            primed: false,
        }
    }

    /// Changes since the previous poll. The first poll reports every logo
    /// but no profiles, which were loaded at start-up.
    pub fn poll(&mut self) -> Vec<WatchEvent> {
        let mut events = Vec::new();

        if let Ok(entries) = fs::read_dir(&self.logo_dir) {
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().into_owned();
                if let Some(service_id) = parse_logo_name(&name) {
                    if self.seen_logos.insert(name.clone()) {
                        events.push(WatchEvent::Logo {
                            service_id,
                            file_name: name,
                        });
                    }
                }
            }
        }

        if let Ok(entries) = fs::read_dir(&self.profile_dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().map_or(true, |e| e != "json") {
                    continue;
                }
                let Some(mtime) = modified(&path) else {
                    continue;
                };
                let previous = self.profile_mtimes.insert(path.clone(), mtime);
                if self.primed && previous != Some(mtime) {
                    events.push(WatchEvent::Profile(path));
                }
            }
        }

        self.primed = true;
        events
    }
}

async fn post(tx: &mpsc::Sender<Command>, command: Command) -> bool {
    tx.send(command).await.is_ok()
}

/// Ask for a flush every `interval`, or sooner when `wake` is notified.
pub async fn persistence_loop(
    tx: mpsc::Sender<Command>,
    interval: Duration,
    wake: Arc<Notify>,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
            _ = wake.notified() => {}
        }
        if !post(&tx, Command::Persist).await {
            break;
        }
    }
}

/// Run `poll` on the blocking pool. A poll that panics takes the watcher
/// with it, so a fresh one over the same directories is handed back.
async fn poll_blocking<F>(watcher: DirWatcher, poll: F) -> (DirWatcher, Vec<WatchEvent>)
where
    F: FnOnce(&mut DirWatcher) -> Vec<WatchEvent> + Send + 'static,
{
    let dirs = (watcher.logo_dir.clone(), watcher.profile_dir.clone());
    let mut watcher = watcher;
    match tokio::task::spawn_blocking(move || {
        let events = poll(&mut watcher);
        (watcher, events)
    })
    .await
    {
        Ok(polled) => polled,
        Err(e) => {
            warn!(error = %e, "directory poll failed, restarting watcher");
            (DirWatcher::new(dirs.0, dirs.1), Vec::new())
        }
    }
}

pub async fn watch_loop(
    tx: mpsc::Sender<Command>,
    mut watcher: DirWatcher,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let (w, events) = poll_blocking(watcher, DirWatcher::poll).await;
        watcher = w;
        if events.is_empty() {
            continue;
        }
        debug!(count = events.len(), "data directory changed");
        if !post(&tx, Command::FilesChanged(events)).await {
            break;
        }
    }
}

/// Report entering and leaving the quiet-hours window.
pub async fn quiet_hours_loop(
    tx: mpsc::Sender<Command>,
    mut window: watch::Receiver<Option<QuietHours>>,
    shutdown: CancellationToken,
) {
    let mut inside = false;
    let mut ticker = tokio::time::interval(QUIET_HOURS_CHECK);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
            changed = window.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
        let hour = chrono::Local::now().hour();
        let now_inside = window.borrow().map_or(false, |q| q.contains(hour));
        if now_inside != inside {
            inside = now_inside;
            if !post(&tx, Command::QuietHours(inside)).await {
                break;
            }
        }
    }
}

/// Ask for log pruning at start-up and then daily.
pub async fn prune_loop(tx: mpsc::Sender<Command>, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(PRUNE_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        if !post(&tx, Command::PruneLogs).await {
            break;
        }
    }
}

/// Keep the host part of the status snapshot fresh.
pub async fn system_metrics_loop(status: SharedStatus, shutdown: CancellationToken) {
    loop {
        let metrics = match tokio::task::spawn_blocking(collect_system_metrics).await {
            Ok(m) => m,
            Err(_) => break,
        };
        status.write().await.system = metrics;
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(SYSTEM_METRICS_INTERVAL) => {}
        }
    }
}
