//! Blob groups: a fixed set of files under one identity, hash-verified.

use crate::entity::EntityCore;
use crate::error::{Error, HashFailure, Result};
use crate::fs::Location;
use crate::hash::{self, Algorithm};
use crate::identity::{Identity, validate_segment};
use crate::settings::Settings;
use crate::state::{ConfigExtra, ConfigRecord, EntityRecord, RecordKind, push_bounded};
use chrono::Utc;
use std::cell::OnceCell;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Produces the content of a file group.
pub trait FileMaker {
    /// Write the bytes for `key` into `sink`.
    fn make(&self, key: &str, sink: &mut dyn Write) -> Result<()>;

    /// Produce every key in `keys` under `dir`.
    ///
    /// Override for sources that fetch many files in one go. Each file must
    /// end up at `dir/<key>`.
    fn make_all(&self, dir: &Location, keys: &[String]) -> Result<()> {
        for key in keys {
            let path = dir.dir().join(key);
            dir.fs().write_with(&path, &mut |w| self.make(key, w))?;
            debug!(key = %key, "made file");
        }
        Ok(())
    }
}

/// In-memory content per key.
#[derive(Debug, Clone, Default)]
pub struct BytesMaker {
    files: BTreeMap<String, Vec<u8>>,
}

impl BytesMaker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        self.files.insert(key.into(), data.into());
        self
    }
}

impl FileMaker for BytesMaker {
    fn make(&self, key: &str, sink: &mut dyn Write) -> Result<()> {
        let data = self
            .files
            .get(key)
            .ok_or_else(|| Error::precondition(key, "no content registered for key"))?;
        sink.write_all(data)?;
        Ok(())
    }
}

/// Copies existing local files, one source path per key.
#[derive(Debug, Clone, Default)]
pub struct PathsMaker {
    sources: BTreeMap<String, PathBuf>,
}

impl PathsMaker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, source: impl Into<PathBuf>) -> Self {
        self.sources.insert(key.into(), source.into());
        self
    }
}

impl FileMaker for PathsMaker {
    fn make(&self, key: &str, sink: &mut dyn Write) -> Result<()> {
        let source = self
            .sources
            .get(key)
            .ok_or_else(|| Error::precondition(key, "no source path registered for key"))?;
        let mut file = std::fs::File::open(source)?;
        io::copy(&mut file, sink)?;
        Ok(())
    }
}

/// Where expected hashes come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HashMode {
    /// Caller supplies a hash per key up front.
    Declared(BTreeMap<String, String>),
    /// Hashes are computed after the first create and kept in Config.
    Auto,
}

/// Caller-supplied policy deciding when a created group is stale.
#[derive(Clone, Default)]
pub enum Staleness {
    #[default]
    Never,
    /// Stale once `created_on` is older than this.
    MaxAge(chrono::Duration),
    Custom(Arc<dyn Fn(&ConfigRecord) -> bool + Send + Sync>),
}

impl fmt::Debug for Staleness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Staleness::Never => write!(f, "Never"),
            Staleness::MaxAge(d) => write!(f, "MaxAge({})", d),
            Staleness::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

impl Staleness {
    pub fn is_outdated(&self, config: &ConfigRecord) -> bool {
        match self {
            Staleness::Never => false,
            Staleness::MaxAge(age) => config
                .created_on
                .is_some_and(|created| created + *age < Utc::now()),
            Staleness::Custom(f) => f(config),
        }
    }
}

/// Everything needed to build a [`FileGroup`].
pub struct FileGroupBuilder {
    name: String,
    identity: String,
    file_keys: Vec<String>,
    hash_mode: HashMode,
    group_by: Vec<String>,
    maker: Option<Box<dyn FileMaker>>,
    staleness: Staleness,
}

impl FileGroupBuilder {
    pub fn declared(mut self, hashes: BTreeMap<String, String>) -> Self {
        self.hash_mode = HashMode::Declared(hashes);
        self
    }

    pub fn auto_hash(mut self) -> Self {
        self.hash_mode = HashMode::Auto;
        self
    }

    pub fn group_by(mut self, segments: Vec<String>) -> Self {
        self.group_by = segments;
        self
    }

    pub fn maker(mut self, maker: impl FileMaker + 'static) -> Self {
        self.maker = Some(Box::new(maker));
        self
    }

    pub fn staleness(mut self, staleness: Staleness) -> Self {
        self.staleness = staleness;
        self
    }

    pub fn build(self, parent: &Location, settings: Arc<Settings>) -> Result<FileGroup> {
        validate_keys(&self.name, &self.file_keys)?;
        let algorithm = settings.algorithm;
        let declared_hashes = match &self.hash_mode {
            HashMode::Declared(hashes) => {
                validate_declared(&self.name, algorithm, &self.file_keys, hashes)?;
                Some(hashes.clone())
            }
            HashMode::Auto => None,
        };
        let record = EntityRecord {
            name: self.name,
            identity: self.identity,
            group_by: self.group_by,
            kind: RecordKind::FileGroup {
                file_keys: self.file_keys.clone(),
                algorithm,
                declared_hashes,
            },
        };
        let core = EntityCore::new(parent, record, config_defaults(), settings)?;
        Ok(FileGroup {
            core,
            file_keys: self.file_keys,
            algorithm,
            hash_mode: self.hash_mode,
            maker: self.maker,
            staleness: self.staleness,
            check_interval: OnceCell::new(),
        })
    }
}

fn config_defaults() -> ConfigRecord {
    ConfigRecord::empty(ConfigExtra::FileGroup {
        checked_on: Vec::new(),
        auto_hashes: None,
    })
}

fn validate_keys(name: &str, keys: &[String]) -> Result<()> {
    if keys.is_empty() {
        return Err(Error::precondition(name, "file group needs at least one file key"));
    }
    let mut seen = BTreeSet::new();
    for key in keys {
        if key.contains('/') {
            return Err(Error::invalid_name(key, "file keys cannot nest"));
        }
        validate_segment(key, key)?;
        if !seen.insert(key) {
            return Err(Error::precondition(name, format!("duplicate file key {:?}", key)));
        }
    }
    Ok(())
}

fn validate_declared(
    name: &str,
    algorithm: Algorithm,
    keys: &[String],
    hashes: &BTreeMap<String, String>,
) -> Result<()> {
    for key in keys {
        match hashes.get(key) {
            None => {
                return Err(Error::precondition(
                    name,
                    format!("no declared hash for file key {:?}", key),
                ));
            }
            Some(h) if !algorithm.is_valid_digest(h) => {
                return Err(Error::precondition(
                    name,
                    format!("declared hash for {:?} is not a lower-case {} digest", key, algorithm),
                ));
            }
            Some(_) => {}
        }
    }
    if let Some(extra) = hashes.keys().find(|k| !keys.contains(k)) {
        return Err(Error::precondition(
            name,
            format!("declared hash for unknown file key {:?}", extra),
        ));
    }
    Ok(())
}

/// A named set of blob files with integrity hashes.
pub struct FileGroup {
    core: EntityCore,
    file_keys: Vec<String>,
    algorithm: Algorithm,
    hash_mode: HashMode,
    maker: Option<Box<dyn FileMaker>>,
    staleness: Staleness,
    check_interval: OnceCell<chrono::Duration>,
}

impl fmt::Debug for FileGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileGroup")
            .field("core", &self.core)
            .field("file_keys", &self.file_keys)
            .field("auto_hash", &self.is_auto_hash())
            .field("has_maker", &self.maker.is_some())
            .finish()
    }
}

impl FileGroup {
    /// Start building a group for `identity` with the given file keys.
    /// Defaults to auto hashing.
    pub fn builder(identity: &dyn Identity, file_keys: Vec<String>) -> FileGroupBuilder {
        FileGroupBuilder {
            name: identity.name(),
            identity: identity.canonical_text(),
            file_keys,
            hash_mode: HashMode::Auto,
            group_by: Vec::new(),
            maker: None,
            staleness: Staleness::Never,
        }
    }

    /// Rebuild from a stored record. The result has no maker.
    pub(crate) fn from_record(
        parent: &Location,
        record: EntityRecord,
        settings: Arc<Settings>,
    ) -> Result<Self> {
        let RecordKind::FileGroup {
            file_keys,
            algorithm,
            declared_hashes,
        } = record.kind.clone()
        else {
            return Err(Error::precondition(&record.name, "record is not a file group"));
        };
        let hash_mode = match declared_hashes {
            Some(h) => HashMode::Declared(h),
            None => HashMode::Auto,
        };
        let core = EntityCore::new(parent, record, config_defaults(), settings)?;
        Ok(Self {
            core,
            file_keys,
            algorithm,
            hash_mode,
            maker: None,
            staleness: Staleness::Never,
            check_interval: OnceCell::new(),
        })
    }

    pub fn core(&self) -> &EntityCore {
        &self.core
    }

    pub fn name(&self) -> &str {
        self.core.name()
    }

    pub fn path(&self) -> &Path {
        self.core.path()
    }

    pub fn file_keys(&self) -> &[String] {
        &self.file_keys
    }

    pub fn is_auto_hash(&self) -> bool {
        self.hash_mode == HashMode::Auto
    }

    /// Attach a producer, e.g. to a group rebuilt by a folder walk.
    pub fn set_maker(&mut self, maker: impl FileMaker + 'static) {
        self.maker = Some(Box::new(maker));
    }

    pub fn set_staleness(&mut self, staleness: Staleness) {
        self.staleness = staleness;
    }

    fn key_path(&self, key: &str) -> PathBuf {
        self.core.path().join(key)
    }

    /// Created state plus every file key present on disk.
    pub fn is_created(&self) -> Result<bool> {
        if !self.core.is_created()? {
            return Ok(false);
        }
        let fs = self.core.fs();
        let missing: Vec<String> = self
            .file_keys
            .iter()
            .filter(|k| !fs.is_file(&self.key_path(k)))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(Error::MissingContent {
                path: self.path().to_path_buf(),
                entries: missing,
            });
        }
        if self.is_auto_hash() && self.auto_hashes().is_none() {
            return Err(Error::MissingContent {
                path: self.core.config().path().to_path_buf(),
                entries: vec!["auto_hashes".into()],
            });
        }
        Ok(true)
    }

    /// Entries in the content directory that are not file keys.
    pub fn unknown_files(&self) -> Result<Vec<String>> {
        let fs = self.core.fs();
        if !fs.exists(self.path()) {
            return Ok(Vec::new());
        }
        if !fs.is_dir(self.path()) {
            return Err(Error::UnknownContent {
                path: self.path().to_path_buf(),
                entries: vec![self.name().to_string()],
            });
        }
        Ok(fs
            .list(self.path())?
            .into_iter()
            .filter(|e| !(self.file_keys.contains(e) && fs.is_file(&self.key_path(e))))
            .collect())
    }

    fn auto_hashes(&self) -> Option<BTreeMap<String, String>> {
        match &self.core.config().get().extra {
            ConfigExtra::FileGroup { auto_hashes, .. } => auto_hashes.clone(),
            _ => None,
        }
    }

    fn last_checked(&self) -> Option<chrono::DateTime<Utc>> {
        match &self.core.config().get().extra {
            ConfigExtra::FileGroup { checked_on, .. } => checked_on.last().copied(),
            _ => None,
        }
    }

    /// Randomized re-check interval, drawn once per handle.
    pub fn check_interval(&self) -> chrono::Duration {
        *self
            .check_interval
            .get_or_init(|| self.core.settings().check_window.pick(&mut rand::thread_rng()))
    }

    /// True if never checked or the last check is older than the interval.
    pub fn periodic_check_needed(&self) -> Result<bool> {
        if !self.is_created()? {
            return Err(Error::NotCreated {
                entity: self.core.to_string(),
            });
        }
        Ok(match self.last_checked() {
            None => true,
            Some(last) => last + self.check_interval() <= Utc::now(),
        })
    }

    pub fn is_outdated(&self) -> bool {
        self.staleness.is_outdated(&self.core.config().get())
    }

    /// Produce every file, then write Info/Config.
    pub fn create(&self) -> Result<Vec<PathBuf>> {
        let paths = self.core.create_with(|core| {
            let maker = self.maker.as_ref().ok_or_else(|| Error::NoProducer {
                entity: core.to_string(),
            })?;
            let fs = core.fs();
            fs.create_dir_all(core.path())?;

            let unknown = self.unknown_files()?;
            if !unknown.is_empty() {
                return Err(Error::UnknownContent {
                    path: core.path().to_path_buf(),
                    entries: unknown,
                });
            }

            // Files left by an interrupted create are reused.
            let pending: Vec<String> = self
                .file_keys
                .iter()
                .filter(|k| !fs.is_file(&self.key_path(k)))
                .cloned()
                .collect();
            maker.make_all(core.location(), &pending)?;

            let missing: Vec<String> = self
                .file_keys
                .iter()
                .filter(|k| !fs.is_file(&self.key_path(k)))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(Error::MissingContent {
                    path: core.path().to_path_buf(),
                    entries: missing,
                });
            }
            let unknown = self.unknown_files()?;
            if !unknown.is_empty() {
                return Err(Error::UnknownContent {
                    path: core.path().to_path_buf(),
                    entries: unknown,
                });
            }

            let mut paths = Vec::with_capacity(self.file_keys.len());
            for key in &self.file_keys {
                let path = self.key_path(key);
                fs.set_readonly(&path, true)?;
                paths.push(path);
            }
            Ok(paths)
        })?;

        if self.is_auto_hash() {
            let _lock = self.core.lock()?;
            let mut hashes = BTreeMap::new();
            for key in &self.file_keys {
                hashes.insert(key.clone(), self.hash_file(key)?);
            }
            self.core.config().update(|c| {
                if let ConfigExtra::FileGroup { auto_hashes, .. } = &mut c.extra {
                    *auto_hashes = Some(hashes);
                }
            })?;
            debug!(entity = %self.core, "stored auto hashes");
        }
        Ok(paths)
    }

    fn hash_file(&self, key: &str) -> Result<String> {
        let settings = self.core.settings();
        let mut reader = self.core.fs().open_read(&self.key_path(key))?;
        let progress = settings.progress.as_deref().map(|p| (p, key));
        hash::hash_reader(
            self.algorithm,
            &mut *reader,
            settings.hash_chunk_size,
            progress,
        )
    }

    /// Re-hash every file against the expected hashes.
    ///
    /// Any mismatch wipes Info/Config, so the group must be created again.
    pub fn check(&self, force: bool) -> Result<()> {
        self.core.ensure_live()?;
        if !self.is_created()? {
            return Err(Error::NotCreated {
                entity: self.core.to_string(),
            });
        }
        if !force && !self.periodic_check_needed()? {
            return Err(Error::precondition(&self.core, "periodic check is not due"));
        }
        let _lock = self.core.lock()?;

        let expected = match &self.hash_mode {
            HashMode::Declared(h) => h.clone(),
            HashMode::Auto => self.auto_hashes().unwrap_or_default(),
        };
        let mut failures = Vec::new();
        for key in &self.file_keys {
            let computed = self.hash_file(key)?;
            let want = expected.get(key).cloned().unwrap_or_default();
            if computed != want {
                failures.push(HashFailure {
                    key: key.clone(),
                    expected: want,
                    computed,
                });
            }
        }

        if !failures.is_empty() {
            warn!(entity = %self.core, failed = failures.len(), "integrity check failed");
            self.core.wipe_state()?;
            return Err(Error::integrity(&self.core, failures));
        }

        let cap = self.core.settings().history.checked_on;
        let now = Utc::now();
        self.core.config().update(|c| {
            if let ConfigExtra::FileGroup { checked_on, .. } = &mut c.extra {
                push_bounded(checked_on, now, cap);
            }
        })?;
        info!(entity = %self.core, "checked");
        Ok(())
    }

    /// Paths for the requested keys. The group must be created, checked
    /// and current.
    pub fn get_files(&self, keys: &[&str]) -> Result<BTreeMap<String, PathBuf>> {
        self.core.ensure_live()?;
        if let Some(bad) = keys.iter().find(|k| !self.file_keys.iter().any(|f| f.as_str() == **k)) {
            return Err(Error::precondition(
                &self.core,
                format!("{:?} is not one of the file keys {:?}", bad, self.file_keys),
            ));
        }
        if !self.is_created()? {
            return Err(Error::NotCreated {
                entity: self.core.to_string(),
            });
        }
        if self.periodic_check_needed()? {
            return Err(Error::precondition(
                &self.core,
                "a periodic check is due before files can be used",
            ));
        }
        if self.is_outdated() {
            return Err(Error::precondition(
                &self.core,
                "files are outdated and must be recreated",
            ));
        }

        let files = keys
            .iter()
            .map(|k| (k.to_string(), self.key_path(k)))
            .collect();
        self.core.record_access()?;
        Ok(files)
    }

    /// Remove every file and the state pair.
    pub fn delete(&self, force: bool) -> Result<()> {
        self.core.delete_with(force, |core| {
            let fs = core.fs();
            for key in &self.file_keys {
                let path = self.key_path(key);
                if fs.is_file(&path) {
                    fs.set_readonly(&path, false)?;
                    fs.remove_file(&path)?;
                } else {
                    warn!(entity = %core, key = %key, "file already missing during delete");
                }
            }
            if fs.is_dir(core.path()) {
                let leftovers = fs.list(core.path())?;
                if !leftovers.is_empty() {
                    return Err(Error::UnknownContent {
                        path: core.path().to_path_buf(),
                        entries: leftovers,
                    });
                }
            }
            Ok(())
        })
    }

    /// Scoped access: recreate if outdated, check if due, create if absent.
    pub fn enter(&self) -> Result<&Self> {
        self.core.ensure_live()?;
        if self.is_created()? {
            if self.is_outdated() {
                info!(entity = %self.core, "outdated, recreating");
                self.delete(true)?;
                self.core.revive();
                self.create()?;
                self.check(true)?;
            } else if self.periodic_check_needed()? {
                self.check(false)?;
            }
        } else {
            self.create()?;
            self.check(false)?;
        }
        self.core.mark_entered();
        Ok(self)
    }
}
