//! Info/Config state-file pair.
//!
//! `<name>.info` holds the entity record and is written once, then marked
//! read-only. `<name>.config` holds mutable metadata and is rewritten on every
//! change. Both are pretty-printed JSON.

use crate::error::{Error, Result};
use crate::fs::FileSystem;
use crate::hash::Algorithm;
use crate::table::TableSchema;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cell::{Ref, RefCell};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

pub const INFO_SUFFIX: &str = ".info";
pub const CONFIG_SUFFIX: &str = ".config";
pub const LOCK_SUFFIX: &str = ".lock";

/// Identity snapshot stored in the Info file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub name: String,
    /// Canonical text of the wrapped identity.
    pub identity: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub group_by: Vec<String>,
    #[serde(flatten)]
    pub kind: RecordKind,
}

/// Kind-specific part of an [`EntityRecord`], tagged by `kind`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecordKind {
    Folder,
    FileGroup {
        file_keys: Vec<String>,
        algorithm: Algorithm,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        declared_hashes: Option<BTreeMap<String, String>>,
    },
    Table,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Folder => "folder",
            RecordKind::FileGroup { .. } => "file_group",
            RecordKind::Table => "table",
        }
    }
}

impl EntityRecord {
    /// Encode as Info file content.
    pub fn to_text(&self) -> Result<String> {
        let mut text = serde_json::to_string_pretty(self)?;
        text.push('\n');
        Ok(text)
    }

    pub fn from_text(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Mutable metadata stored in the Config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigRecord {
    #[serde(default)]
    pub created_on: Option<DateTime<Utc>>,
    #[serde(default)]
    pub config_updated_on: Vec<DateTime<Utc>>,
    #[serde(default)]
    pub accessed_on: Vec<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: ConfigExtra,
}

/// Kind-specific Config fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConfigExtra {
    Folder,
    FileGroup {
        #[serde(default)]
        checked_on: Vec<DateTime<Utc>>,
        #[serde(default)]
        auto_hashes: Option<BTreeMap<String, String>>,
    },
    Table {
        #[serde(default)]
        schema: Option<TableSchema>,
        #[serde(default)]
        partition_cols: Option<Vec<String>>,
    },
}

impl ConfigExtra {
    pub fn kind_str(&self) -> &'static str {
        match self {
            ConfigExtra::Folder => "folder",
            ConfigExtra::FileGroup { .. } => "file_group",
            ConfigExtra::Table { .. } => "table",
        }
    }
}

impl ConfigRecord {
    /// All-defaults record of the given kind.
    pub fn empty(extra: ConfigExtra) -> Self {
        Self {
            created_on: None,
            config_updated_on: Vec::new(),
            accessed_on: Vec::new(),
            extra,
        }
    }

    pub fn to_text(&self) -> Result<String> {
        let mut text = serde_json::to_string_pretty(self)?;
        text.push('\n');
        Ok(text)
    }
}

/// Append `item`, evicting the oldest entries beyond `cap`.
pub fn push_bounded<T>(list: &mut Vec<T>, item: T, cap: usize) {
    list.push(item);
    if list.len() > cap {
        let excess = list.len() - cap;
        list.drain(..excess);
    }
}

/// Write-once identity file.
#[derive(Debug)]
pub struct InfoFile {
    fs: Arc<dyn FileSystem>,
    path: PathBuf,
}

impl InfoFile {
    pub fn new(fs: Arc<dyn FileSystem>, path: PathBuf) -> Self {
        Self { fs, path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_available(&self) -> bool {
        self.fs.is_file(&self.path)
    }

    /// Write `record` if absent, otherwise verify the stored one matches.
    pub fn sync(&self, record: &EntityRecord) -> Result<()> {
        if self.is_available() {
            return self.verify(record);
        }
        let text = record.to_text()?;
        self.fs.write(&self.path, text.as_bytes())?;
        self.fs.set_readonly(&self.path, true)?;
        debug!(path = %self.path.display(), "wrote info");
        Ok(())
    }

    /// Fail with `IdentityDrift` if the stored record differs from `record`.
    pub fn verify(&self, record: &EntityRecord) -> Result<()> {
        let stored = String::from_utf8_lossy(&self.fs.read(&self.path)?).into_owned();
        let current = record.to_text()?;
        if stored != current {
            return Err(Error::identity_drift(&self.path, stored, current));
        }
        Ok(())
    }

    pub fn load(&self) -> Result<EntityRecord> {
        let bytes = self.fs.read(&self.path)?;
        let text = String::from_utf8_lossy(&bytes);
        EntityRecord::from_text(&text)
    }

    pub fn delete(&self) -> Result<()> {
        if self.fs.is_readonly(&self.path)? {
            self.fs.set_readonly(&self.path, false)?;
        }
        self.fs.remove_file(&self.path)
    }
}

/// Write-through metadata file.
///
/// Every [`ConfigFile::update`] rewrites the file. An update that changes
/// nothing is rejected with `RedundantSync`.
#[derive(Debug)]
pub struct ConfigFile {
    fs: Arc<dyn FileSystem>,
    path: PathBuf,
    record: RefCell<ConfigRecord>,
    defaults: ConfigRecord,
    updated_cap: usize,
}

impl ConfigFile {
    /// Open the config at `path`, replaying stored fields if it exists.
    pub fn open(
        fs: Arc<dyn FileSystem>,
        path: PathBuf,
        defaults: ConfigRecord,
        updated_cap: usize,
    ) -> Result<Self> {
        let config = Self {
            fs,
            path,
            record: RefCell::new(defaults.clone()),
            defaults,
            updated_cap,
        };
        if config.is_available() {
            config.reload()?;
        }
        Ok(config)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_available(&self) -> bool {
        self.fs.is_file(&self.path)
    }

    /// Current in-memory record.
    pub fn get(&self) -> Ref<'_, ConfigRecord> {
        self.record.borrow()
    }

    /// Replace the in-memory record with what is on disk.
    pub fn reload(&self) -> Result<()> {
        let bytes = self.fs.read(&self.path)?;
        let loaded: ConfigRecord = serde_json::from_slice(&bytes)?;
        let expected = self.defaults.extra.kind_str();
        if loaded.extra.kind_str() != expected {
            return Err(Error::identity_drift(
                &self.path,
                loaded.extra.kind_str(),
                expected,
            ));
        }
        *self.record.borrow_mut() = loaded;
        Ok(())
    }

    /// Mutate the record and write it through. The in-memory record only
    /// changes once the write has landed.
    pub fn update(&self, mutate: impl FnOnce(&mut ConfigRecord)) -> Result<()> {
        let mut next = self.record.borrow().clone();
        mutate(&mut next);
        if next == *self.record.borrow() {
            return Err(Error::RedundantSync {
                path: self.path.clone(),
            });
        }
        push_bounded(&mut next.config_updated_on, Utc::now(), self.updated_cap);
        self.write_record(&next)?;
        *self.record.borrow_mut() = next;
        Ok(())
    }

    /// Serialize and write, refusing byte-identical rewrites.
    pub fn sync(&self) -> Result<()> {
        let record = self.record.borrow().clone();
        self.write_record(&record)
    }

    fn write_record(&self, record: &ConfigRecord) -> Result<()> {
        let text = record.to_text()?;
        if self.is_available() && self.fs.read(&self.path)? == text.as_bytes() {
            return Err(Error::RedundantSync {
                path: self.path.clone(),
            });
        }
        self.fs.write(&self.path, text.as_bytes())?;
        debug!(path = %self.path.display(), "synced config");
        Ok(())
    }

    /// Restore defaults in memory. Nothing is written.
    pub fn reset(&self) {
        *self.record.borrow_mut() = self.defaults.clone();
    }

    pub fn delete(&self) -> Result<()> {
        if self.fs.is_readonly(&self.path)? {
            self.fs.set_readonly(&self.path, false)?;
        }
        self.fs.remove_file(&self.path)?;
        self.reset();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{LocalFileSystem, MemoryFileSystem};
    use tempfile::TempDir;

    fn record() -> EntityRecord {
        EntityRecord {
            name: "fg".into(),
            identity: "fg".into(),
            group_by: Vec::new(),
            kind: RecordKind::FileGroup {
                file_keys: vec!["a".into()],
                algorithm: Algorithm::Blake3,
                declared_hashes: None,
            },
        }
    }

    fn file_group_config() -> ConfigRecord {
        ConfigRecord::empty(ConfigExtra::FileGroup {
            checked_on: Vec::new(),
            auto_hashes: None,
        })
    }

    #[test]
    fn test_record_round_trip_is_tagged() {
        let text = record().to_text().unwrap();
        assert!(text.contains("\"kind\": \"file_group\""));
        assert_eq!(EntityRecord::from_text(&text).unwrap(), record());
    }

    #[test]
    fn test_info_write_once_then_verify() {
        let temp = TempDir::new().unwrap();
        let fs: Arc<dyn FileSystem> = Arc::new(LocalFileSystem);
        let info = InfoFile::new(Arc::clone(&fs), temp.path().join("fg.info"));

        assert!(!info.is_available());
        info.sync(&record()).unwrap();
        assert!(info.is_available());
        assert!(fs.is_readonly(info.path()).unwrap());
        info.sync(&record()).unwrap();

        let mut other = record();
        other.identity = "changed".into();
        assert!(matches!(
            info.sync(&other),
            Err(Error::IdentityDrift { .. })
        ));

        info.delete().unwrap();
        assert!(!info.is_available());
    }

    #[test]
    fn test_config_write_through_and_reload() {
        let fs: Arc<dyn FileSystem> = Arc::new(MemoryFileSystem::new());
        let path = PathBuf::from("/fg.config");
        let config =
            ConfigFile::open(Arc::clone(&fs), path.clone(), file_group_config(), 10).unwrap();

        let now = Utc::now();
        config.update(|c| c.created_on = Some(now)).unwrap();
        assert!(config.is_available());

        let reopened = ConfigFile::open(fs, path, file_group_config(), 10).unwrap();
        assert_eq!(reopened.get().created_on, Some(now));
        assert_eq!(reopened.get().config_updated_on.len(), 1);
    }

    #[test]
    fn test_config_noop_update_rejected() {
        let fs: Arc<dyn FileSystem> = Arc::new(MemoryFileSystem::new());
        let config =
            ConfigFile::open(fs, PathBuf::from("/c.config"), file_group_config(), 10).unwrap();
        let now = Utc::now();
        config.update(|c| c.created_on = Some(now)).unwrap();
        assert!(matches!(
            config.update(|c| c.created_on = Some(now)),
            Err(Error::RedundantSync { .. })
        ));
        assert!(matches!(config.sync(), Err(Error::RedundantSync { .. })));
    }

    #[test]
    fn test_config_reset_does_not_write() {
        let fs: Arc<dyn FileSystem> = Arc::new(MemoryFileSystem::new());
        let path = PathBuf::from("/c.config");
        let config =
            ConfigFile::open(Arc::clone(&fs), path.clone(), file_group_config(), 10).unwrap();
        config.update(|c| c.created_on = Some(Utc::now())).unwrap();
        let on_disk = fs.read(&path).unwrap();

        config.reset();
        assert_eq!(config.get().created_on, None);
        assert_eq!(fs.read(&path).unwrap(), on_disk);
    }

    #[test]
    fn test_config_failed_write_keeps_memory() {
        let fs: Arc<dyn FileSystem> = Arc::new(MemoryFileSystem::new());
        let path = PathBuf::from("/c.config");
        let config =
            ConfigFile::open(Arc::clone(&fs), path.clone(), file_group_config(), 10).unwrap();
        let created = Utc::now();
        config.update(|c| c.created_on = Some(created)).unwrap();
        let before = config.get().clone();

        fs.set_readonly(&path, true).unwrap();
        assert!(config.update(|c| c.accessed_on.push(Utc::now())).is_err());
        assert_eq!(*config.get(), before);
        assert!(config.get().accessed_on.is_empty());
    }

    #[test]
    fn test_config_kind_mismatch_is_drift() {
        let fs: Arc<dyn FileSystem> = Arc::new(MemoryFileSystem::new());
        let path = PathBuf::from("/c.config");
        let config =
            ConfigFile::open(Arc::clone(&fs), path.clone(), file_group_config(), 10).unwrap();
        config.update(|c| c.created_on = Some(Utc::now())).unwrap();

        let as_folder = ConfigFile::open(fs, path, ConfigRecord::empty(ConfigExtra::Folder), 10);
        assert!(matches!(as_folder, Err(Error::IdentityDrift { .. })));
    }

    #[test]
    fn test_config_updated_on_is_bounded() {
        let fs: Arc<dyn FileSystem> = Arc::new(MemoryFileSystem::new());
        let config =
            ConfigFile::open(fs, PathBuf::from("/c.config"), file_group_config(), 3).unwrap();
        for _ in 0..6 {
            config
                .update(|c| c.accessed_on.push(Utc::now()))
                .unwrap();
        }
        assert_eq!(config.get().config_updated_on.len(), 3);
        assert_eq!(config.get().accessed_on.len(), 6);
    }

    #[test]
    fn test_push_bounded_evicts_oldest() {
        let mut v = vec![1, 2, 3];
        push_bounded(&mut v, 4, 3);
        assert_eq!(v, vec![2, 3, 4]);
    }
}
