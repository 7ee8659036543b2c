//! Ambient configuration shared by every entity.
//!
//! Settings files use the same `key=value` line format as the store config:
//!
//! ```text
//! # stowage settings
//! version=1
//! algorithm=blake3
//! hash_chunk_size=4096
//! check_interval_min_hours=240
//! check_interval_max_hours=360
//! check_interval_step_hours=3
//! accessed_on_limit=10
//! config_updated_on_limit=10
//! checked_on_limit=5
//! append_delay_us=1
//! mount.DATA=/srv/data
//! ```

use crate::error::{Error, Result};
use crate::fs::Location;
use crate::hash::{Algorithm, DEFAULT_CHUNK_SIZE, Progress};
use rand::Rng;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Name of the mount every registry starts with.
pub const DEFAULT_MOUNT: &str = "CWD";

/// Decides whether a non-forced delete may proceed.
pub trait Confirm: Send + Sync {
    fn confirm(&self, prompt: &str) -> bool;
}

/// Refuses every request. The default, so deletes must be forced.
#[derive(Debug, Clone, Copy, Default)]
pub struct RefuseAll;

impl Confirm for RefuseAll {
    fn confirm(&self, _prompt: &str) -> bool {
        false
    }
}

/// Approves every request.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl Confirm for AcceptAll {
    fn confirm(&self, _prompt: &str) -> bool {
        true
    }
}

/// Window from which the periodic check interval is drawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckWindow {
    pub min: Duration,
    pub max: Duration,
    pub step: Duration,
}

impl Default for CheckWindow {
    fn default() -> Self {
        const HOUR: u64 = 60 * 60;
        Self {
            min: Duration::from_secs(10 * 24 * HOUR),
            max: Duration::from_secs(15 * 24 * HOUR),
            step: Duration::from_secs(3 * HOUR),
        }
    }
}

impl CheckWindow {
    /// Draw an interval uniformly from `min, min + step, ..., max`.
    pub fn pick<R: Rng + ?Sized>(&self, rng: &mut R) -> chrono::Duration {
        let step = self.step.as_secs().max(1);
        let span = self.max.as_secs().saturating_sub(self.min.as_secs());
        let slots = span / step;
        let offset = rng.gen_range(0..=slots) * step;
        chrono::Duration::seconds((self.min.as_secs() + offset) as i64)
    }
}

/// Caps on the bounded timestamp histories kept in Config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryLimits {
    pub accessed_on: usize,
    pub config_updated_on: usize,
    pub checked_on: usize,
}

impl Default for HistoryLimits {
    fn default() -> Self {
        Self {
            accessed_on: 10,
            config_updated_on: 10,
            checked_on: 5,
        }
    }
}

/// Explicit registry of named file-system mounts.
#[derive(Clone, Debug)]
pub struct FileSystemRegistry {
    mounts: BTreeMap<String, Location>,
}

impl Default for FileSystemRegistry {
    fn default() -> Self {
        let mut mounts = BTreeMap::new();
        mounts.insert(DEFAULT_MOUNT.to_string(), Location::local("."));
        Self { mounts }
    }
}

impl FileSystemRegistry {
    /// A registry with no mounts at all.
    pub fn empty() -> Self {
        Self {
            mounts: BTreeMap::new(),
        }
    }

    /// Add or replace a mount.
    pub fn register(&mut self, name: impl Into<String>, location: Location) {
        self.mounts.insert(name.into(), location);
    }

    pub fn get(&self, name: &str) -> Result<Location> {
        self.mounts
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownMount {
                name: name.to_string(),
            })
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.mounts.keys().map(String::as_str)
    }
}

/// Shared configuration. Build once and pass around as `Arc<Settings>`.
#[derive(Clone)]
pub struct Settings {
    pub algorithm: Algorithm,
    pub hash_chunk_size: usize,
    pub check_window: CheckWindow,
    pub history: HistoryLimits,
    /// Pause between appends so timestamp-named files stay distinct.
    pub append_delay: Duration,
    pub confirmer: Arc<dyn Confirm>,
    pub progress: Option<Arc<dyn Progress>>,
    pub mounts: FileSystemRegistry,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::default(),
            hash_chunk_size: DEFAULT_CHUNK_SIZE,
            check_window: CheckWindow::default(),
            history: HistoryLimits::default(),
            append_delay: Duration::from_micros(1),
            confirmer: Arc::new(RefuseAll),
            progress: None,
            mounts: FileSystemRegistry::default(),
        }
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settings")
            .field("algorithm", &self.algorithm)
            .field("hash_chunk_size", &self.hash_chunk_size)
            .field("check_window", &self.check_window)
            .field("history", &self.history)
            .field("append_delay", &self.append_delay)
            .field("progress", &self.progress.is_some())
            .field("mounts", &self.mounts)
            .finish()
    }
}

fn parse_hours(key: &str, value: &str) -> Result<Duration> {
    parse_num::<u64>(key, value)?
        .checked_mul(60 * 60)
        .map(Duration::from_secs)
        .ok_or_else(|| Error::invalid_settings(format!("{} is out of range: {:?}", key, value)))
}

fn parse_num<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| Error::invalid_settings(format!("{} is not a number: {:?}", key, value)))
}

impl Settings {
    /// Parse a settings file body.
    pub fn parse(content: &str) -> Result<Self> {
        let mut settings = Settings::default();
        let mut version = None;

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| Error::invalid_settings(format!("malformed line: {:?}", line)))?;
            let (key, value) = (key.trim(), value.trim());

            match key {
                "version" => version = Some(value.to_string()),
                "algorithm" => settings.algorithm = Algorithm::parse(value)?,
                "hash_chunk_size" => settings.hash_chunk_size = parse_num(key, value)?,
                "check_interval_min_hours" => settings.check_window.min = parse_hours(key, value)?,
                "check_interval_max_hours" => settings.check_window.max = parse_hours(key, value)?,
                "check_interval_step_hours" => settings.check_window.step = parse_hours(key, value)?,
                "accessed_on_limit" => settings.history.accessed_on = parse_num(key, value)?,
                "config_updated_on_limit" => {
                    settings.history.config_updated_on = parse_num(key, value)?
                }
                "checked_on_limit" => settings.history.checked_on = parse_num(key, value)?,
                "append_delay_us" => {
                    settings.append_delay = Duration::from_micros(parse_num(key, value)?)
                }
                _ => match key.strip_prefix("mount.") {
                    Some(name) if !name.is_empty() => {
                        settings.mounts.register(name, Location::local(value))
                    }
                    _ => {
                        return Err(Error::invalid_settings(format!("unknown key: {}", key)));
                    }
                },
            }
        }

        // Validate version
        if version.as_deref() != Some("1") {
            return Err(Error::invalid_settings(format!(
                "unsupported settings version: {:?}",
                version
            )));
        }
        settings.validate()?;
        Ok(settings)
    }

    /// Read and parse a settings file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn validate(&self) -> Result<()> {
        if self.hash_chunk_size == 0 {
            return Err(Error::invalid_settings("hash_chunk_size must be positive"));
        }
        if self.check_window.min > self.check_window.max {
            return Err(Error::invalid_settings(
                "check interval minimum exceeds maximum",
            ));
        }
        if self.check_window.step.is_zero() {
            return Err(Error::invalid_settings("check interval step must be positive"));
        }
        let h = &self.history;
        if h.accessed_on == 0 || h.config_updated_on == 0 || h.checked_on == 0 {
            return Err(Error::invalid_settings("history limits must be positive"));
        }
        Ok(())
    }

    pub fn with_confirmer(mut self, confirmer: Arc<dyn Confirm>) -> Self {
        self.confirmer = confirmer;
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn Progress>) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_algorithm(mut self, algorithm: Algorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    /// Resolve a named mount to its root location.
    pub fn mount(&self, name: &str) -> Result<Location> {
        self.mounts.get(name)
    }
}
