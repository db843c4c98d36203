//! Server-side configuration that jobs are resolved against: profiles,
//! auto-select lists, per-service settings and the runtime [`Setting`].

use crate::concurrency::derive_parallelism;
use crate::config::{Config, QuietHours};
use crate::profile::{AutoSelectProfile, Profile, ProfileBook};
use crate::store::{load_json, save_json, StoreError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Logo file name meaning "this service is known to carry no logo".
pub const NO_LOGO: &str = "NO_LOGO";

/// Logo registered for a service, optionally limited to a time window.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogoSetting {
    pub file_name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub from: Option<DateTime<Utc>>,
    #[serde(default)]
    pub to: Option<DateTime<Utc>>,
}

fn default_true() -> bool {
    true
}

impl LogoSetting {
    pub fn new(file_name: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
            enabled: true,
            from: None,
            to: None,
        }
    }

    /// Enabled and valid at `when` (an unknown time matches any window).
    pub fn usable_at(&self, when: Option<DateTime<Utc>>) -> bool {
        if !self.enabled {
            return false;
        }
        match when {
            None => true,
            Some(t) => self.from.map_or(true, |f| t >= f) && self.to.map_or(true, |e| t <= e),
        }
    }
}

/// Per-service (channel) configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceSetting {
    pub service_id: i32,
    #[serde(default)]
    pub service_name: String,
    #[serde(default)]
    pub logos: Vec<LogoSetting>,
    #[serde(default)]
    pub disable_cm_check: bool,
}

impl ServiceSetting {
    pub fn new(service_id: i32, service_name: impl Into<String>) -> Self {
        Self {
            service_id,
            service_name: service_name.into(),
            logos: Vec::new(),
            disable_cm_check: false,
        }
    }

    pub fn has_usable_logo(&self, when: Option<DateTime<Utc>>) -> bool {
        self.logos.iter().any(|l| l.usable_at(when))
    }
}

pub type ServiceMap = BTreeMap<i32, ServiceSetting>;

/// Runtime-mutable settings, seeded from the config file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Setting {
    pub parallelism: u32,
    pub gpu_budgets: Vec<u32>,
    pub logo_pending_as_error: bool,
    pub pause_on_started: bool,
    #[serde(default)]
    pub quiet_hours: Option<QuietHours>,
    pub delete_old_logs: bool,
    pub delete_old_logs_days: u32,
    /// Output directories whose free space is reported to clients.
    #[serde(default)]
    pub watched_outputs: Vec<PathBuf>,
}

impl Setting {
    pub fn from_config(config: &Config) -> Self {
        Self {
            parallelism: derive_parallelism(&config.scheduler),
            gpu_budgets: config.scheduler.gpu_budgets(),
            logo_pending_as_error: config.encoder.logo_pending_as_error,
            pause_on_started: config.scheduler.pause_on_started,
            quiet_hours: config.scheduler.quiet_hours,
            delete_old_logs: config.logs.delete_old_logs,
            delete_old_logs_days: config.logs.delete_old_logs_days,
            watched_outputs: Vec::new(),
        }
    }
}

/// Locations inside the data directory.
#[derive(Debug, Clone)]
pub struct DataPaths {
    pub root: PathBuf,
}

impl DataPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn queue(&self) -> PathBuf {
        self.root.join("queue.json")
    }

    pub fn setting(&self) -> PathBuf {
        self.root.join("setting.json")
    }

    pub fn services(&self) -> PathBuf {
        self.root.join("service.json")
    }

    pub fn auto_select(&self) -> PathBuf {
        self.root.join("autoselect.json")
    }

    pub fn profile_dir(&self) -> PathBuf {
        self.root.join("profile")
    }

    pub fn logo_dir(&self) -> PathBuf {
        self.root.join("logo")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn encode_log(&self) -> PathBuf {
        self.root.join("encode_log.jsonl")
    }

    pub fn check_log(&self) -> PathBuf {
        self.root.join("check_log.jsonl")
    }

    pub fn profile_file(&self, name: &str) -> PathBuf {
        self.profile_dir().join(format!("{}.json", sanitize_file_name(name)))
    }
}

/// Replace characters that cannot appear in a file name.
pub fn sanitize_file_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c => c,
        })
        .collect()
}

/// Everything jobs are resolved against, with per-part dirty flags.
#[derive(Debug, Clone)]
pub struct Catalog {
    pub profiles: ProfileBook,
    pub services: ServiceMap,
    pub setting: Setting,
    pub services_dirty: bool,
    pub setting_dirty: bool,
}

impl Catalog {
    pub fn new(setting: Setting) -> Self {
        Self {
            profiles: ProfileBook::new(),
            services: ServiceMap::new(),
            setting,
            services_dirty: false,
            setting_dirty: false,
        }
    }

    /// Load persisted settings, services, profiles and auto-select lists.
    ///
    /// Missing files fall back to `defaults` and empty collections; unreadable
    /// files are logged and skipped.
    pub fn load(paths: &DataPaths, defaults: Setting) -> Self {
        let setting = match load_json::<Setting>(&paths.setting()) {
            Ok(Some(s)) => s,
            Ok(None) => defaults,
            Err(e) => {
                warn!(error = %e, "settings unreadable, using config defaults");
                defaults
            }
        };
        let mut catalog = Self::new(setting);

        match load_json::<ServiceMap>(&paths.services()) {
            Ok(Some(services)) => catalog.services = services,
            Ok(None) => {}
            Err(e) => warn!(error = %e, "service settings unreadable"),
        }

        catalog.profiles = load_profiles(&paths.profile_dir());
        match load_json::<Vec<AutoSelectProfile>>(&paths.auto_select()) {
            Ok(Some(list)) => {
                for auto in list {
                    catalog.profiles.upsert_auto_select(auto);
                }
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "auto-select list unreadable"),
        }

        info!(
            profiles = catalog.profiles.profiles().count(),
            services = catalog.services.len(),
            "catalog loaded"
        );
        catalog
    }

    /// Write the dirty parts and clear their flags.
    pub fn flush(&mut self, paths: &DataPaths) -> Result<(), StoreError> {
        if self.setting_dirty {
            save_json(&paths.setting(), &self.setting)?;
            self.setting_dirty = false;
        }
        if self.services_dirty {
            save_json(&paths.services(), &self.services)?;
            self.services_dirty = false;
        }
        Ok(())
    }

    /// Register a service seen for the first time. Returns true when added.
    pub fn register_service(&mut self, service_id: i32, service_name: &str) -> bool {
        if service_id < 0 || self.services.contains_key(&service_id) {
            return false;
        }
        self.services
            .insert(service_id, ServiceSetting::new(service_id, service_name));
        self.services_dirty = true;
        true
    }

    pub fn save_profile(&self, paths: &DataPaths, profile: &Profile) -> Result<(), StoreError> {
        save_json(&paths.profile_file(&profile.name), profile)
    }

    pub fn delete_profile_file(&self, paths: &DataPaths, name: &str) {
        let path = paths.profile_file(name);
        if let Err(e) = fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %e, "failed to delete profile file");
            }
        }
    }

    pub fn save_auto_selects(&self, paths: &DataPaths) -> Result<(), StoreError> {
        let list: Vec<&AutoSelectProfile> = self.profiles.auto_selects().collect();
        save_json(&paths.auto_select(), &list)
    }
}

/// Read every `*.json` profile in `dir`.
pub fn load_profiles(dir: &Path) -> ProfileBook {
    let mut book = ProfileBook::new();
    let entries = match fs::read_dir(dir) {
        Ok(e) => e,
        Err(_) => return book,
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().map_or(true, |e| e != "json") {
            continue;
        }
        match load_json::<Profile>(&path) {
            Ok(Some(profile)) => {
                book.upsert(profile);
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "skipping unreadable profile"),
        }
    }
    book
}
