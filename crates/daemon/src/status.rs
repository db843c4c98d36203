//! Status snapshot shared with the HTTP endpoint
//!
//! The command loop refreshes the queue part after every command; a
//! background task refreshes the host part.

use crate::resource::LineUsage;
use crate::rpc::{DiskInfo, StateReport};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Host resource usage
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SystemMetrics {
    pub cpu_usage_percent: f32,
    pub mem_usage_percent: f32,
    pub load_avg_1: f32,
    pub load_avg_5: f32,
    pub load_avg_15: f32,
}

/// Everything served by `GET /status`
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StatusSnapshot {
    pub timestamp_unix_ms: i64,
    pub state: StateReport,
    /// Job count per state name.
    pub counts: BTreeMap<String, usize>,
    pub queue_len: usize,
    pub gpu: Vec<LineUsage>,
    pub clients: usize,
    pub system: SystemMetrics,
}

pub type SharedStatus = Arc<RwLock<StatusSnapshot>>;

pub fn new_shared_status() -> SharedStatus {
    Arc::new(RwLock::new(StatusSnapshot::default()))
}

pub fn timestamp_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Collects current host metrics using sysinfo
pub fn collect_system_metrics() -> SystemMetrics {
    use sysinfo::System;

    let mut sys = System::new();
    sys.refresh_cpu_usage();
    sys.refresh_memory();

    let total_memory = sys.total_memory();
    let mem_usage = if total_memory > 0 {
        (sys.used_memory() as f64 / total_memory as f64 * 100.0) as f32
    } else {
        0.0
    };
    let load_avg = System::load_average();

    SystemMetrics {
        cpu_usage_percent: sys.global_cpu_usage(),
        mem_usage_percent: mem_usage,
        load_avg_1: load_avg.one as f32,
        load_avg_5: load_avg.five as f32,
        load_avg_15: load_avg.fifteen as f32,
    }
}

/// Mount point that hosts `path`: the longest mount point prefixing it.
fn hosting_mount<'a>(path: &Path, mounts: &'a [(PathBuf, u64, u64)]) -> Option<&'a (PathBuf, u64, u64)> {
    mounts
        .iter()
        .filter(|(m, _, _)| path.starts_with(m))
        .max_by_key(|(m, _, _)| m.as_os_str().len())
}

/// Free space of each disk that hosts one of `dirs`, each disk once.
pub fn collect_disks(dirs: &[PathBuf]) -> Vec<DiskInfo> {
    let disks = sysinfo::Disks::new_with_refreshed_list();
    let mounts: Vec<(PathBuf, u64, u64)> = disks
        .list()
        .iter()
        .map(|d| (d.mount_point().to_path_buf(), d.available_space(), d.total_space()))
        .collect();
    disks_for(dirs, &mounts)
}

fn disks_for(dirs: &[PathBuf], mounts: &[(PathBuf, u64, u64)]) -> Vec<DiskInfo> {
    let mut out: Vec<DiskInfo> = Vec::new();
    for dir in dirs {
        if let Some((mount, available, total)) = hosting_mount(dir, mounts) {
            if out.iter().all(|d| &d.mount_point != mount) {
                out.push(DiskInfo {
                    mount_point: mount.clone(),
                    available_bytes: *available,
                    total_bytes: *total,
                });
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_disk_lookup_uses_longest_mount() {
        let mounts = vec![
            (PathBuf::from("/"), 10, 100),
            (PathBuf::from("/mnt/rec"), 20, 200),
        ];
        let disks = disks_for(
            &[
                PathBuf::from("/mnt/rec/out"),
                PathBuf::from("/mnt/rec/other"),
                PathBuf::from("/home/me"),
            ],
            &mounts,
        );
        assert_eq!(disks.len(), 2);
        assert_eq!(disks[0].mount_point, PathBuf::from("/mnt/rec"));
        assert_eq!(disks[0].available_bytes, 20);
        assert_eq!(disks[1].mount_point, PathBuf::from("/"));
    }

    #[test]
    fn test_collect_system_metrics_in_range() {
        let m = collect_system_metrics();
        assert!((0.0..=100.0).contains(&m.mem_usage_percent));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(50))]
        #[test]
        fn prop_status_snapshot_round_trip(
            queue_len in 0usize..1000,
            running in any::<bool>(),
            parallelism in 1u32..8,
            progress in 0.0f64..1.0,
            cpu in 0.0f32..100.0,
            pending in 0usize..50,
        ) {
            let mut counts = BTreeMap::new();
            counts.insert("pending".to_string(), pending);
            let snapshot = StatusSnapshot {
                timestamp_unix_ms: 1_701_388_800_000,
                state: StateReport {
                    running,
                    parallelism,
                    progress,
                    encoder_suspended: vec![false; parallelism as usize],
                    ..StateReport::default()
                },
                counts,
                queue_len,
                gpu: vec![LineUsage { budget: 100, used: 40 }],
                clients: 2,
                system: SystemMetrics { cpu_usage_percent: cpu, ..SystemMetrics::default() },
            };
            let json = serde_json::to_string(&snapshot).unwrap();
            let back: StatusSnapshot = serde_json::from_str(&json).unwrap();
            prop_assert_eq!(back, snapshot);
        }
    }
}
