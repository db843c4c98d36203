//! Encoding profiles and auto-select resolution.
//!
//! Profiles are plain values. Resolving a job's profile reference clones
//! the current profile into the job, so later edits never reach jobs that
//! were already resolved.

use crate::job::Job;
use crate::resource::ResourceRequest;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Prefix marking a profile reference as an auto-select indirection.
pub const AUTO_PREFIX: &str = "auto:";

/// A named, versioned encoding configuration bundle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Profile {
    pub name: String,
    pub last_update: DateTime<Utc>,
    /// Extra arguments passed to the encoder.
    #[serde(default)]
    pub encoder_args: Vec<String>,
    #[serde(default)]
    pub disable_chapter: bool,
    #[serde(default)]
    pub no_delogo: bool,
    #[serde(default)]
    pub gpu_line: Option<usize>,
    #[serde(default)]
    pub gpu_percent: u32,
}

impl Profile {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            last_update: Utc::now(),
            encoder_args: Vec::new(),
            disable_chapter: false,
            no_delogo: false,
            gpu_line: None,
            gpu_percent: 0,
        }
    }

    /// A job using this profile needs a usable logo unless both chapter
    /// detection and delogo are off.
    pub fn needs_logo(&self) -> bool {
        !self.disable_chapter || !self.no_delogo
    }

    pub fn resource_request(&self) -> ResourceRequest {
        ResourceRequest {
            line_hint: self.gpu_line,
            percent: self.gpu_percent,
        }
    }
}

/// Parsed form of a job's profile reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileRef<'a> {
    Named(&'a str),
    Auto(&'a str),
}

impl<'a> ProfileRef<'a> {
    pub fn parse(s: &'a str) -> Self {
        match s.get(..AUTO_PREFIX.len()) {
            Some(prefix) if prefix.eq_ignore_ascii_case(AUTO_PREFIX) => {
                ProfileRef::Auto(&s[AUTO_PREFIX.len()..])
            }
            _ => ProfileRef::Named(s),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct VideoSize {
    pub width: u32,
    pub height: u32,
}

/// One rule of an auto-select list. Empty criteria match anything.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AutoSelectCondition {
    pub profile: String,
    /// Priority given to matched jobs (0 keeps the requested priority).
    #[serde(default)]
    pub priority: u8,
    /// Genre prefixes, e.g. `"anime"` or `"anime/domestic"`.
    #[serde(default)]
    pub genres: Vec<String>,
    #[serde(default)]
    pub service_ids: Vec<i32>,
    #[serde(default)]
    pub video_sizes: Vec<VideoSize>,
    #[serde(default)]
    pub stream_formats: Vec<String>,
}

impl AutoSelectCondition {
    pub fn matches(&self, job: &Job) -> bool {
        let genre_ok = self.genres.is_empty()
            || self.genres.iter().any(|want| {
                job.genres
                    .iter()
                    .any(|g| g.to_lowercase().starts_with(&want.to_lowercase()))
            });
        let service_ok = self.service_ids.is_empty() || self.service_ids.contains(&job.service_id);
        let size_ok = self.video_sizes.is_empty()
            || self
                .video_sizes
                .iter()
                .any(|s| s.width == job.video_width && s.height == job.video_height);
        let format_ok = self.stream_formats.is_empty()
            || self
                .stream_formats
                .iter()
                .any(|f| f.eq_ignore_ascii_case(&job.stream_format));
        genre_ok && service_ok && size_ok && format_ok
    }
}

/// Ordered rule list; the first matching condition wins.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AutoSelectProfile {
    pub name: String,
    #[serde(default)]
    pub conditions: Vec<AutoSelectCondition>,
}

/// Result of resolving a job's profile reference.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolved {
    pub profile: Profile,
    /// Priority requested by the matching auto-select rule, if any.
    pub priority: Option<u8>,
}

/// All known profiles and auto-select lists, keyed case-insensitively.
#[derive(Debug, Clone, Default)]
pub struct ProfileBook {
    profiles: BTreeMap<String, Profile>,
    auto_selects: BTreeMap<String, AutoSelectProfile>,
}

fn key(name: &str) -> String {
    name.to_lowercase()
}

impl ProfileBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&Profile> {
        self.profiles.get(&key(name))
    }

    pub fn profiles(&self) -> impl Iterator<Item = &Profile> {
        self.profiles.values()
    }

    pub fn auto_selects(&self) -> impl Iterator<Item = &AutoSelectProfile> {
        self.auto_selects.values()
    }

    pub fn get_auto_select(&self, name: &str) -> Option<&AutoSelectProfile> {
        self.auto_selects.get(&key(name))
    }

    /// Insert or replace a profile, returning the previous version.
    pub fn upsert(&mut self, profile: Profile) -> Option<Profile> {
        self.profiles.insert(key(&profile.name), profile)
    }

    pub fn remove(&mut self, name: &str) -> Option<Profile> {
        self.profiles.remove(&key(name))
    }

    pub fn upsert_auto_select(&mut self, auto: AutoSelectProfile) -> Option<AutoSelectProfile> {
        self.auto_selects.insert(key(&auto.name), auto)
    }

    pub fn remove_auto_select(&mut self, name: &str) -> Option<AutoSelectProfile> {
        self.auto_selects.remove(&key(name))
    }

    /// Resolve `reference` for `job` into a profile snapshot.
    ///
    /// The error is the human-readable reason shown on the pending job.
    pub fn resolve(&self, reference: &str, job: &Job) -> Result<Resolved, String> {
        match ProfileRef::parse(reference) {
            ProfileRef::Named(name) => self
                .get(name)
                .map(|p| Resolved {
                    profile: p.clone(),
                    priority: None,
                })
                .ok_or_else(|| format!("profile {} not found", name)),
            ProfileRef::Auto(selector) => {
                let auto = self
                    .get_auto_select(selector)
                    .ok_or_else(|| format!("auto-select {} not found", selector))?;
                let rule = auto
                    .conditions
                    .iter()
                    .find(|c| c.matches(job))
                    .ok_or_else(|| "no matching profile".to_string())?;
                let profile = self
                    .get(&rule.profile)
                    .ok_or_else(|| format!("profile {} not found", rule.profile))?;
                Ok(Resolved {
                    profile: profile.clone(),
                    priority: (rule.priority > 0).then_some(rule.priority),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::test_job;

    fn book() -> ProfileBook {
        let mut book = ProfileBook::new();
        book.upsert(Profile::new("Default"));
        let mut anime = Profile::new("anime-hq");
        anime.gpu_percent = 50;
        book.upsert(anime);
        book.upsert_auto_select(AutoSelectProfile {
            name: "tv".into(),
            conditions: vec![
                AutoSelectCondition {
                    profile: "anime-hq".into(),
                    priority: 5,
                    genres: vec!["anime".into()],
                    service_ids: vec![],
                    video_sizes: vec![],
                    stream_formats: vec![],
                },
                AutoSelectCondition {
                    profile: "default".into(),
                    priority: 0,
                    genres: vec![],
                    service_ids: vec![1024],
                    video_sizes: vec![],
                    stream_formats: vec![],
                },
            ],
        });
        book
    }

    #[test]
    fn test_parse_reference() {
        assert_eq!(ProfileRef::parse("x264"), ProfileRef::Named("x264"));
        assert_eq!(ProfileRef::parse("auto:tv"), ProfileRef::Auto("tv"));
        assert_eq!(ProfileRef::parse("AUTO:tv"), ProfileRef::Auto("tv"));
        assert_eq!(ProfileRef::parse("au"), ProfileRef::Named("au"));
    }

    #[test]
    fn test_named_lookup_is_case_insensitive() {
        let job = test_job(1, "/rec/a.ts");
        let resolved = book().resolve("DEFAULT", &job).unwrap();
        assert_eq!(resolved.profile.name, "Default");
        assert_eq!(resolved.priority, None);
    }

    #[test]
    fn test_auto_select_first_match_wins() {
        let mut job = test_job(1, "/rec/a.ts");
        job.genres = vec!["Anime/Domestic".into()];
        job.service_id = 1024;
        let resolved = book().resolve("auto:tv", &job).unwrap();
        assert_eq!(resolved.profile.name, "anime-hq");
        assert_eq!(resolved.priority, Some(5));
    }

    #[test]
    fn test_auto_select_failures() {
        let job = test_job(1, "/rec/a.ts");
        assert_eq!(
            book().resolve("auto:tv", &job).unwrap_err(),
            "no matching profile"
        );
        assert_eq!(
            book().resolve("auto:radio", &job).unwrap_err(),
            "auto-select radio not found"
        );
        assert_eq!(
            book().resolve("missing", &job).unwrap_err(),
            "profile missing not found"
        );
    }

    #[test]
    fn test_resolution_is_a_copy() {
        let mut b = book();
        let job = test_job(1, "/rec/a.ts");
        let resolved = b.resolve("default", &job).unwrap();

        let mut edited = Profile::new("Default");
        edited.encoder_args = vec!["--crf".into(), "20".into()];
        b.upsert(edited);

        assert!(resolved.profile.encoder_args.is_empty());
    }

    #[test]
    fn test_needs_logo() {
        let mut p = Profile::new("p");
        assert!(p.needs_logo());
        p.disable_chapter = true;
        assert!(p.needs_logo());
        p.no_delogo = true;
        assert!(!p.needs_logo());
    }
}
