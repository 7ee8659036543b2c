//! Shared core of every storage entity.
//!
//! [`EntityCore`] owns the path, the Info/Config pair and the handle
//! lifecycle. Kind-specific code supplies only the body of create and delete;
//! the checks around it live here and cannot be skipped.

use crate::error::{Error, Result};
use crate::fs::{FileSystem, Location};
use crate::identity::{name_segments, validate_segment};
use crate::lock::EntityLock;
use crate::settings::Settings;
use crate::state::{
    CONFIG_SUFFIX, ConfigFile, ConfigRecord, EntityRecord, INFO_SUFFIX, InfoFile, LOCK_SUFFIX,
    push_bounded,
};
use chrono::Utc;
use std::cell::{Cell, OnceCell};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Where a handle is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Built in memory, nothing verified yet.
    Constructed,
    /// Entered at least once; state files were present afterwards.
    Entered,
    /// Deleted through this handle. Every further call fails.
    Deleted,
}

pub struct EntityCore {
    record: EntityRecord,
    parent: Location,
    path: PathBuf,
    content: OnceCell<Location>,
    info: InfoFile,
    config: ConfigFile,
    lifecycle: Cell<Lifecycle>,
    settings: Arc<Settings>,
}

impl fmt::Debug for EntityCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityCore")
            .field("kind", &self.record.kind.as_str())
            .field("name", &self.record.name)
            .field("path", &self.path)
            .field("lifecycle", &self.lifecycle.get())
            .finish()
    }
}

impl fmt::Display for EntityCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:?}", self.record.kind.as_str(), self.record.name)
    }
}

/// `<parent>/<group_by...>/<name segments...>`.
fn resolve_path(parent: &Path, group_by: &[String], name: &str) -> Result<PathBuf> {
    let mut path = parent.to_path_buf();
    for seg in group_by {
        validate_segment(seg, seg)?;
        path.push(seg);
    }
    for seg in name_segments(name)? {
        path.push(seg);
    }
    Ok(path)
}

fn sibling_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(suffix);
    path.with_file_name(name)
}

impl EntityCore {
    /// Build the core for `record` under `parent`. Loads Config if present.
    pub fn new(
        parent: &Location,
        record: EntityRecord,
        defaults: ConfigRecord,
        settings: Arc<Settings>,
    ) -> Result<Self> {
        let path = resolve_path(parent.dir(), &record.group_by, &record.name)?;
        let fs = Arc::clone(parent.fs());
        let info = InfoFile::new(Arc::clone(&fs), sibling_with_suffix(&path, INFO_SUFFIX));
        let config = ConfigFile::open(
            fs,
            sibling_with_suffix(&path, CONFIG_SUFFIX),
            defaults,
            settings.history.config_updated_on,
        )?;
        Ok(Self {
            record,
            parent: parent.clone(),
            path,
            content: OnceCell::new(),
            info,
            config,
            lifecycle: Cell::new(Lifecycle::Constructed),
            settings,
        })
    }

    pub fn record(&self) -> &EntityRecord {
        &self.record
    }

    pub fn name(&self) -> &str {
        &self.record.name
    }

    /// Backing content directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Backing content directory as a location children can live in.
    pub fn location(&self) -> &Location {
        self.content
            .get_or_init(|| Location::new(Arc::clone(self.parent.fs()), self.path.clone()))
    }

    pub fn parent(&self) -> &Location {
        &self.parent
    }

    pub fn fs(&self) -> &Arc<dyn FileSystem> {
        self.parent.fs()
    }

    pub fn info(&self) -> &InfoFile {
        &self.info
    }

    pub fn config(&self) -> &ConfigFile {
        &self.config
    }

    pub fn settings(&self) -> &Arc<Settings> {
        &self.settings
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle.get()
    }

    pub(crate) fn mark_entered(&self) {
        if self.lifecycle.get() == Lifecycle::Constructed {
            self.lifecycle.set(Lifecycle::Entered);
        }
    }

    /// Make a deleted handle usable again for an immediate re-create.
    pub(crate) fn revive(&self) {
        self.lifecycle.set(Lifecycle::Constructed);
    }

    fn lock_path(&self) -> PathBuf {
        sibling_with_suffix(&self.path, LOCK_SUFFIX)
    }

    pub(crate) fn lock(&self) -> Result<EntityLock> {
        EntityLock::acquire(self.fs(), &self.lock_path())
    }

    /// Fail if this handle must not be used any more.
    pub fn ensure_live(&self) -> Result<()> {
        match self.lifecycle.get() {
            Lifecycle::Deleted => Err(Error::invalidated(self, "entity was deleted")),
            Lifecycle::Entered if !self.info.is_available() && !self.config.is_available() => {
                Err(Error::invalidated(
                    self,
                    "state files were removed behind this handle",
                ))
            }
            _ => Ok(()),
        }
    }

    /// True when Info, Config and the content directory are all present.
    ///
    /// Only one of Info/Config present, a drifted Info, or a missing content
    /// directory next to a complete state pair are all errors. A created
    /// entity also has its Config reloaded, so other handles' writes are
    /// never clobbered by a stale record.
    pub fn is_created(&self) -> Result<bool> {
        let info = self.info.is_available();
        let config = self.config.is_available();
        match (info, config) {
            (false, false) => Ok(false),
            (true, true) => {
                self.info.verify(&self.record)?;
                if !self.fs().is_dir(&self.path) {
                    return Err(Error::MissingContent {
                        path: self.path.clone(),
                        entries: vec![self.record.name.clone()],
                    });
                }
                self.config.reload()?;
                Ok(true)
            }
            _ => Err(Error::StateDivergence {
                path: self.path.clone(),
                info,
                config,
            }),
        }
    }

    /// Run `body` between the shared create checks.
    ///
    /// Before: handle is live, entity not created, lock taken. After: Info
    /// then Config are written and `created_on` is stamped.
    pub fn create_with<T>(&self, body: impl FnOnce(&Self) -> Result<T>) -> Result<T> {
        self.ensure_live()?;
        let _lock = self.lock()?;
        if self.is_created()? {
            return Err(Error::AlreadyCreated {
                entity: self.to_string(),
            });
        }

        let out = body(self)?;

        if !self.fs().is_dir(&self.path) {
            return Err(Error::MissingContent {
                path: self.path.clone(),
                entries: vec![self.record.name.clone()],
            });
        }
        self.info.sync(&self.record)?;
        let now = Utc::now();
        self.config.update(|c| c.created_on = Some(now))?;
        self.mark_entered();
        info!(entity = %self, path = %self.path.display(), "created");
        Ok(out)
    }

    /// Ask the confirmation hook unless `force` is set.
    pub fn confirm_delete(&self, force: bool, prompt: &str) -> Result<()> {
        if force || self.settings.confirmer.confirm(prompt) {
            Ok(())
        } else {
            Err(Error::NotConfirmed {
                entity: self.to_string(),
            })
        }
    }

    /// Run `body` (content teardown) then remove state files and the
    /// now-empty directory. The handle is invalid afterwards.
    pub fn delete_with(&self, force: bool, body: impl FnOnce(&Self) -> Result<()>) -> Result<()> {
        self.ensure_live()?;
        let prompt = format!("Delete {} at {}?", self, self.path.display());
        self.confirm_delete(force, &prompt)?;
        {
            let _lock = self.lock()?;
            body(self)?;

            if self.info.is_available() {
                self.info.delete()?;
            }
            if self.config.is_available() {
                self.config.delete()?;
            }
            if self.fs().is_dir(&self.path) {
                self.fs().remove_dir(&self.path)?;
            }
        }
        self.prune_empty_ancestors()?;
        self.lifecycle.set(Lifecycle::Deleted);
        info!(entity = %self, path = %self.path.display(), "deleted");
        Ok(())
    }

    /// Remove group-by and name directories left empty below the parent.
    fn prune_empty_ancestors(&self) -> Result<()> {
        let stop = self.parent.dir();
        let mut dir = self.path.parent();
        while let Some(d) = dir {
            if d == stop || !d.starts_with(stop) || !self.fs().list(d)?.is_empty() {
                break;
            }
            self.fs().remove_dir(d)?;
            dir = d.parent();
        }
        Ok(())
    }

    /// Drop Info/Config so the entity counts as not created.
    pub fn wipe_state(&self) -> Result<()> {
        if self.info.is_available() {
            self.info.delete()?;
        }
        if self.config.is_available() {
            self.config.delete()?;
        }
        self.lifecycle.set(Lifecycle::Constructed);
        debug!(entity = %self, "state wiped");
        Ok(())
    }

    /// Append an access timestamp to Config.
    pub fn record_access(&self) -> Result<()> {
        let cap = self.settings.history.accessed_on;
        let now = Utc::now();
        self.config
            .update(|c| push_bounded(&mut c.accessed_on, now, cap))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::AcceptAll;
    use crate::state::{ConfigExtra, RecordKind};

    fn core_at(loc: &Location, name: &str, group_by: Vec<String>) -> EntityCore {
        let record = EntityRecord {
            name: name.into(),
            identity: name.into(),
            group_by,
            kind: RecordKind::Folder,
        };
        EntityCore::new(
            loc,
            record,
            ConfigRecord::empty(ConfigExtra::Folder),
            Arc::new(Settings::default()),
        )
        .unwrap()
    }

    fn make_dir(core: &EntityCore) -> Result<()> {
        core.fs().create_dir_all(core.path())
    }

    #[test]
    fn test_path_resolution() {
        let loc = Location::memory();
        let core = core_at(&loc, "a/b", vec!["g".into()]);
        assert_eq!(core.path(), Path::new("/g/a/b"));
        assert_eq!(core.info().path(), Path::new("/g/a/b.info"));
        assert_eq!(core.config().path(), Path::new("/g/a/b.config"));
        assert_eq!(core.location().dir(), Path::new("/g/a/b"));
    }

    #[test]
    fn test_create_then_delete() {
        let loc = Location::memory();
        let core = core_at(&loc, "a/b", vec!["g".into()]);
        assert!(!core.is_created().unwrap());

        core.create_with(make_dir).unwrap();
        assert!(core.is_created().unwrap());
        assert!(core.config().get().created_on.is_some());
        assert!(matches!(
            core.create_with(make_dir),
            Err(Error::AlreadyCreated { .. })
        ));

        core.delete_with(true, |_| Ok(())).unwrap();
        assert!(!loc.fs().exists(Path::new("/g")));
        assert!(matches!(
            core.is_created().and(core.ensure_live()),
            Err(Error::Invalidated { .. })
        ));
    }

    #[test]
    fn test_divergence_detected() {
        let loc = Location::memory();
        let core = core_at(&loc, "x", Vec::new());
        core.create_with(make_dir).unwrap();
        core.info().delete().unwrap();
        assert!(matches!(
            core.is_created(),
            Err(Error::StateDivergence { .. })
        ));
    }

    #[test]
    fn test_unforced_delete_needs_confirmation() {
        let loc = Location::memory();
        let core = core_at(&loc, "x", Vec::new());
        core.create_with(make_dir).unwrap();
        assert!(matches!(
            core.delete_with(false, |_| Ok(())),
            Err(Error::NotConfirmed { .. })
        ));

        let record = core.record().clone();
        let settings = Settings::default().with_confirmer(Arc::new(AcceptAll));
        let confirming = EntityCore::new(
            &loc,
            record,
            ConfigRecord::empty(ConfigExtra::Folder),
            Arc::new(settings),
        )
        .unwrap();
        confirming.delete_with(false, |_| Ok(())).unwrap();
        assert!(!confirming.is_created().unwrap_or(true));
    }

    #[test]
    fn test_handle_invalidated_by_external_delete() {
        let loc = Location::memory();
        let a = core_at(&loc, "x", Vec::new());
        a.create_with(make_dir).unwrap();
        let b = core_at(&loc, "x", Vec::new());
        b.delete_with(true, |_| Ok(())).unwrap();
        assert!(matches!(a.ensure_live(), Err(Error::Invalidated { .. })));
    }

    #[test]
    fn test_locked_entity_refuses_create() {
        let loc = Location::memory();
        let core = core_at(&loc, "x", Vec::new());
        let _held = core.lock().unwrap();
        assert!(matches!(
            core.create_with(make_dir),
            Err(Error::Locked { .. })
        ));
    }
}
