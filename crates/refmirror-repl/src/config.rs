//! Raw replication configuration and the sources it is read from.
//!
//! The file is TOML with an optional `[replication]` section for global
//! settings and one `[remote.NAME]` section per destination. Sections are
//! kept in file order. Values are checked when the raw sections are turned
//! into [`crate::destination::ReplicationConfig`].

use crate::error::{ReplError, Result};
use crate::retry::BackoffKind;
use crate::url_template::RemoteNameStyle;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::UNIX_EPOCH;

/// A string or list of strings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany {
    /// Single value.
    One(String),
    /// List of values.
    Many(Vec<String>),
}

impl OneOrMany {
    /// Flatten into a list.
    pub fn into_vec(self) -> Vec<String> {
        match self {
            OneOrMany::One(v) => vec![v],
            OneOrMany::Many(v) => v,
        }
    }
}

/// The `[replication]` section.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalSection {
    /// Full-sync every known project at startup.
    pub replicate_on_startup: Option<bool>,
    /// Reload automatically when the source changes.
    pub auto_reload: Option<bool>,
    /// Default for `replicationMaxRetries`.
    pub max_retries: Option<i64>,
}

/// One `[remote.NAME]` section, as written.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteSection {
    /// URL templates.
    pub url: Option<OneOrMany>,
    /// Seconds before the first attempt.
    pub replication_delay: Option<i64>,
    /// Minutes between attempts.
    pub replication_retry: Option<i64>,
    /// Retries before giving up; 0 retries forever.
    pub replication_max_retries: Option<i64>,
    /// Growth of the retry interval.
    pub retry_backoff: Option<BackoffKind>,
    /// Cap on the retry interval in minutes.
    pub max_retry_interval: Option<i64>,
    /// Project allow-list.
    pub projects: Option<OneOrMany>,
    /// Replicate project deletions.
    pub replicate_project_deletions: Option<bool>,
    /// Drain attempts at shutdown.
    pub drain_queue_attempts: Option<i64>,
    /// Concurrent pushes.
    pub threads: Option<i64>,
    /// Project name rewriting.
    pub remote_name_style: Option<RemoteNameStyle>,
    /// Delete remote refs missing on the source during a full sync.
    pub mirror: Option<bool>,
    /// Create the remote repository when it is missing.
    pub create_missing_repositories: Option<bool>,
}

/// Parsed but unvalidated configuration.
#[derive(Debug, Clone, Default)]
pub struct RawConfig {
    /// Global settings.
    pub global: GlobalSection,
    /// Remote sections in file order.
    pub remotes: Vec<(String, RemoteSection)>,
}

impl RawConfig {
    /// Parse TOML text.
    pub fn parse(text: &str) -> Result<Self> {
        let table: toml::Table = text.parse()?;

        let global = match table.get("replication") {
            Some(value) => value
                .clone()
                .try_into::<GlobalSection>()
                .map_err(|e| ReplError::config(format!("[replication]: {}", e.message())))?,
            None => GlobalSection::default(),
        };

        let mut remotes = Vec::new();
        if let Some(value) = table.get("remote") {
            let sections = value
                .as_table()
                .ok_or_else(|| ReplError::config("`remote` must hold named sections"))?;
            for (name, section) in sections {
                let parsed = section
                    .clone()
                    .try_into::<RemoteSection>()
                    .map_err(|e| ReplError::config(format!("remote.{name}: {}", e.message())))?;
                remotes.push((name.clone(), parsed));
            }
        }

        Ok(Self { global, remotes })
    }

    /// Read and parse a file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }
}

/// Where configuration comes from.
pub trait ConfigSource: Send + Sync {
    /// Read the current configuration.
    fn load(&self) -> Result<RawConfig>;

    /// Changes whenever the content may have changed; `None` if unknown.
    fn fingerprint(&self) -> Option<u64>;

    /// Human-readable description for logs.
    fn describe(&self) -> String;
}

/// Configuration stored in a file on disk.
#[derive(Debug, Clone)]
pub struct FileConfigSource {
    path: PathBuf,
}

impl FileConfigSource {
    /// Create a source for `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The file path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigSource for FileConfigSource {
    fn load(&self) -> Result<RawConfig> {
        RawConfig::from_file(&self.path)
    }

    fn fingerprint(&self) -> Option<u64> {
        let meta = std::fs::metadata(&self.path).ok()?;
        let modified = meta.modified().ok()?.duration_since(UNIX_EPOCH).ok()?;
        Some((modified.as_nanos() as u64) ^ meta.len().rotate_left(48))
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Configuration held in memory; every [`StaticConfigSource::set`] bumps the fingerprint.
#[derive(Debug, Default)]
pub struct StaticConfigSource {
    text: Mutex<String>,
    generation: AtomicU64,
}

impl StaticConfigSource {
    /// Create a source with initial text.
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: Mutex::new(text.into()),
            generation: AtomicU64::new(0),
        }
    }

    /// Replace the text.
    pub fn set(&self, text: impl Into<String>) {
        *self.text.lock().unwrap_or_else(|e| e.into_inner()) = text.into();
        self.generation.fetch_add(1, Ordering::SeqCst);
    }
}

impl ConfigSource for StaticConfigSource {
    fn load(&self) -> Result<RawConfig> {
        let text = self.text.lock().unwrap_or_else(|e| e.into_inner()).clone();
        RawConfig::parse(&text)
    }

    fn fingerprint(&self) -> Option<u64> {
        Some(self.generation.load(Ordering::SeqCst))
    }

    fn describe(&self) -> String {
        "in-memory configuration".to_string()
    }
}
