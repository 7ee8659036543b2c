//! Folders and the entity sum type.
//!
//! A folder owns a directory; children are found by their `.info` markers,
//! either directly inside it or below plain group-by directories.

use crate::entity::EntityCore;
use crate::error::{Error, Result};
use crate::file_group::FileGroup;
use crate::fs::Location;
use crate::identity::Identity;
use crate::settings::Settings;
use crate::state::{
    CONFIG_SUFFIX, ConfigExtra, ConfigRecord, EntityRecord, INFO_SUFFIX, InfoFile, LOCK_SUFFIX,
    RecordKind,
};
use crate::table::Table;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

fn config_defaults() -> ConfigRecord {
    ConfigRecord::empty(ConfigExtra::Folder)
}

/// A directory-backed container of other entities.
pub struct Folder {
    core: EntityCore,
}

impl fmt::Debug for Folder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Folder").field("core", &self.core).finish()
    }
}

impl Folder {
    pub fn new(parent: &Location, identity: &dyn Identity, settings: Arc<Settings>) -> Result<Self> {
        Self::with_group_by(parent, identity, Vec::new(), settings)
    }

    pub fn with_group_by(
        parent: &Location,
        identity: &dyn Identity,
        group_by: Vec<String>,
        settings: Arc<Settings>,
    ) -> Result<Self> {
        let record = EntityRecord {
            name: identity.name(),
            identity: identity.canonical_text(),
            group_by,
            kind: RecordKind::Folder,
        };
        Ok(Self {
            core: EntityCore::new(parent, record, config_defaults(), settings)?,
        })
    }

    pub(crate) fn from_record(
        parent: &Location,
        record: EntityRecord,
        settings: Arc<Settings>,
    ) -> Result<Self> {
        if record.kind != RecordKind::Folder {
            return Err(Error::precondition(&record.name, "record is not a folder"));
        }
        Ok(Self {
            core: EntityCore::new(parent, record, config_defaults(), settings)?,
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

    /// Where children of this folder live.
    pub fn location(&self) -> &Location {
        self.core.location()
    }

    pub fn is_created(&self) -> Result<bool> {
        self.core.is_created()
    }

    /// Ensure the directory exists and write the state pair. An existing
    /// directory is reused.
    pub fn create(&self) -> Result<()> {
        self.core
            .create_with(|core| core.fs().create_dir_all(core.path()))
    }

    /// Create if absent, otherwise record an access.
    pub fn enter(&self) -> Result<&Self> {
        self.core.ensure_live()?;
        if self.core.is_created()? {
            self.core.record_access()?;
        } else {
            self.create()?;
        }
        self.core.mark_entered();
        Ok(self)
    }

    /// Lazily visit children. With `only_names` the Info files are read
    /// but no handles are built.
    pub fn walk(&self, only_names: bool) -> impl Iterator<Item = Result<WalkItem>> + '_ {
        Walk::new(self).map(move |record| {
            let record = record?;
            if only_names {
                Ok(WalkItem::Name(record.name))
            } else {
                Entity::from_record(self.location(), record, Arc::clone(self.core.settings()))
                    .map(WalkItem::Entity)
            }
        })
    }

    /// Names of every child, in walk order.
    pub fn names(&self) -> Result<Vec<String>> {
        Walk::new(self)
            .map(|record| record.map(|r| r.name))
            .collect()
    }

    /// Rehydrate every child into an arena.
    pub fn items(&self) -> Result<FolderItems> {
        let mut items = FolderItems::default();
        for record in Walk::new(self) {
            let entity =
                Entity::from_record(self.location(), record?, Arc::clone(self.core.settings()))?;
            items.insert(entity);
        }
        Ok(items)
    }

    /// Delete every child, then the folder. Anything left over that is not
    /// a managed entity is refused as garbage.
    pub fn delete(&self, force: bool) -> Result<()> {
        self.core.delete_with(force, |core| {
            let items = self.items()?;
            for (_, child) in items.iter() {
                child.delete(true)?;
            }
            if core.fs().is_dir(core.path()) {
                let leftovers = core.fs().list(core.path())?;
                if !leftovers.is_empty() {
                    return Err(Error::Garbage {
                        path: core.path().to_path_buf(),
                        entries: leftovers,
                    });
                }
            }
            info!(entity = %core, children = items.len(), "children deleted");
            Ok(())
        })
    }
}

/// Output of [`Folder::walk`].
#[derive(Debug)]
pub enum WalkItem {
    Name(String),
    Entity(Entity),
}

/// Depth-first search for `.info` markers below a folder.
struct Walk<'a> {
    folder: &'a Folder,
    dirs: Vec<PathBuf>,
    found: Vec<PathBuf>,
}

impl<'a> Walk<'a> {
    fn new(folder: &'a Folder) -> Self {
        let root = folder.path().to_path_buf();
        let dirs = if folder.core.fs().is_dir(&root) {
            vec![root]
        } else {
            Vec::new()
        };
        Self {
            folder,
            dirs,
            found: Vec::new(),
        }
    }

    /// Queue the markers of `dir` and the plain directories to descend into.
    fn scan(&mut self, dir: &Path) -> Result<()> {
        let folder = self.folder;
        let fs = folder.core.fs();
        let entries = fs.list(dir)?;
        let mut markers = Vec::new();
        let mut plain = Vec::new();
        for name in &entries {
            if let Some(stem) = name.strip_suffix(INFO_SUFFIX) {
                markers.push(dir.join(name));
                debug!(dir = %dir.display(), child = stem, "found child marker");
                continue;
            }
            if name.ends_with(CONFIG_SUFFIX) || name.ends_with(LOCK_SUFFIX) {
                continue;
            }
            let path = dir.join(name);
            let owned = entries.contains(&format!("{}{}", name, INFO_SUFFIX));
            if !owned && fs.is_dir(&path) {
                plain.push(path);
            }
        }
        // Popped from the back, so reverse to keep listing order.
        self.found.extend(markers.into_iter().rev());
        self.dirs.extend(plain.into_iter().rev());
        Ok(())
    }
}

impl Iterator for Walk<'_> {
    type Item = Result<EntityRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(marker) = self.found.pop() {
                let info = InfoFile::new(Arc::clone(self.folder.core.fs()), marker);
                return Some(info.load());
            }
            let dir = self.dirs.pop()?;
            if let Err(e) = self.scan(&dir) {
                return Some(Err(e));
            }
        }
    }
}

/// Any storage entity.
#[derive(Debug)]
pub enum Entity {
    Folder(Folder),
    FileGroup(FileGroup),
    Table(Table),
}

impl Entity {
    /// Build a handle for a stored record below `parent`.
    pub fn from_record(parent: &Location, record: EntityRecord, settings: Arc<Settings>) -> Result<Self> {
        match record.kind {
            RecordKind::Folder => Folder::from_record(parent, record, settings).map(Entity::Folder),
            RecordKind::FileGroup { .. } => {
                FileGroup::from_record(parent, record, settings).map(Entity::FileGroup)
            }
            RecordKind::Table => Table::from_record(parent, record, settings).map(Entity::Table),
        }
    }

    pub fn core(&self) -> &EntityCore {
        match self {
            Entity::Folder(f) => f.core(),
            Entity::FileGroup(g) => g.core(),
            Entity::Table(t) => t.core(),
        }
    }

    pub fn name(&self) -> &str {
        self.core().name()
    }

    pub fn kind(&self) -> &'static str {
        self.core().record().kind.as_str()
    }

    pub fn is_created(&self) -> Result<bool> {
        match self {
            Entity::Folder(f) => f.is_created(),
            Entity::FileGroup(g) => g.is_created(),
            Entity::Table(t) => t.is_created(),
        }
    }

    pub fn enter(&self) -> Result<()> {
        match self {
            Entity::Folder(f) => f.enter().map(|_| ()),
            Entity::FileGroup(g) => g.enter().map(|_| ()),
            Entity::Table(t) => t.enter().map(|_| ()),
        }
    }

    pub fn delete(&self, force: bool) -> Result<()> {
        match self {
            Entity::Folder(f) => f.delete(force),
            Entity::FileGroup(g) => g.delete(force),
            Entity::Table(t) => t.delete(force),
        }
    }
}

/// Index into a [`FolderItems`] arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChildId(usize);

/// Children of a folder, owned in one place and looked up by key.
///
/// The key is the child's group-by segments and name joined with `/`.
#[derive(Debug, Default)]
pub struct FolderItems {
    entities: Vec<Entity>,
    index: BTreeMap<String, ChildId>,
}

fn child_key(record: &EntityRecord) -> String {
    let mut parts = record.group_by.clone();
    parts.push(record.name.clone());
    parts.join("/")
}

impl FolderItems {
    fn insert(&mut self, entity: Entity) -> ChildId {
        let id = ChildId(self.entities.len());
        self.index.insert(child_key(entity.core().record()), id);
        self.entities.push(entity);
        id
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn get(&self, id: ChildId) -> Option<&Entity> {
        self.entities.get(id.0)
    }

    pub fn find(&self, key: &str) -> Option<ChildId> {
        self.index.get(key).copied()
    }

    pub fn by_key(&self, key: &str) -> Option<&Entity> {
        self.find(key).and_then(|id| self.get(id))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.index.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ChildId, &Entity)> {
        self.entities.iter().enumerate().map(|(i, e)| (ChildId(i), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_group::BytesMaker;
    use crate::fs::MemoryFileSystem;
    use crate::identity::{Descriptor, Literal};
    use crate::settings::AcceptAll;
    use polars::prelude::df;
    use tempfile::TempDir;

    fn settings() -> Arc<Settings> {
        Arc::new(Settings::default())
    }

    fn populated(loc: &Location) -> (Folder, FileGroup, Table) {
        let folder = Folder::new(loc, &Literal::new("root"), settings()).unwrap();
        folder.enter().unwrap();
        let group = FileGroup::builder(&Literal::new("blobs"), vec!["k".into()])
            .maker(BytesMaker::new().with("k", "v"))
            .build(folder.location(), settings())
            .unwrap();
        group.enter().unwrap();
        let table = Table::builder(&Literal::new("rows"))
            .partition_cols(vec!["p".into()])
            .group_by(vec!["by-day".into()])
            .build(folder.location(), settings())
            .unwrap();
        table
            .write(df!("p" => &[1i64, 2], "v" => &[0.5f64, 1.5]).unwrap())
            .unwrap();
        (folder, group, table)
    }

    #[test]
    fn test_create_reuses_existing_dir() {
        let loc = Location::memory();
        loc.fs().create_dir_all(Path::new("/f")).unwrap();
        let folder = Folder::new(&loc, &Literal::new("f"), settings()).unwrap();
        folder.create().unwrap();
        assert!(folder.is_created().unwrap());
        assert!(matches!(folder.create(), Err(Error::AlreadyCreated { .. })));
    }

    #[test]
    fn test_enter_records_access() {
        let folder = Folder::new(&Location::memory(), &Literal::new("f"), settings()).unwrap();
        folder.enter().unwrap();
        assert!(folder.core().config().get().accessed_on.is_empty());
        folder.enter().unwrap();
        folder.enter().unwrap();
        assert_eq!(folder.core().config().get().accessed_on.len(), 2);
    }

    #[test]
    fn test_walk_names_and_entities() {
        let loc = Location::memory();
        let (folder, _, _) = populated(&loc);
        let sub = Folder::new(folder.location(), &Descriptor::new("shard").field("n", 3), settings())
            .unwrap();
        sub.enter().unwrap();

        let mut names = folder.names().unwrap();
        names.sort();
        let mut expected = vec!["blobs".to_string(), "rows".to_string(), sub.name().to_string()];
        expected.sort();
        assert_eq!(names, expected);

        let kinds: Vec<&str> = folder
            .walk(false)
            .map(|item| match item.unwrap() {
                WalkItem::Entity(e) => e.kind(),
                WalkItem::Name(_) => unreachable!(),
            })
            .collect();
        assert_eq!(kinds.len(), 3);
        assert!(kinds.contains(&"table"));
        assert!(kinds.contains(&"file_group"));
        assert!(kinds.contains(&"folder"));
    }

    #[test]
    fn test_items_rehydrate_children() {
        let loc = Location::memory();
        let (folder, _, _) = populated(&loc);
        let items = folder.items().unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items.keys().collect::<Vec<_>>(), ["blobs", "by-day/rows"]);

        let Some(Entity::Table(table)) = items.by_key("by-day/rows") else {
            panic!("table not found");
        };
        assert_eq!(table.partition_cols(), ["p"]);
        assert_eq!(table.read(None, None).unwrap().height(), 2);

        let Some(Entity::FileGroup(group)) = items.by_key("blobs") else {
            panic!("file group not found");
        };
        let files = group.get_files(&["k"]).unwrap();
        assert_eq!(loc.fs().read(&files["k"]).unwrap(), b"v");
        assert!(items.find("missing").is_none());
    }

    #[test]
    fn test_delete_cascades_and_invalidates_children() {
        let temp = TempDir::new().unwrap();
        let loc = Location::local(temp.path());
        let (folder, group, table) = populated(&loc);

        assert!(matches!(folder.delete(false), Err(Error::NotConfirmed { .. })));
        folder.delete(true).unwrap();

        assert!(!temp.path().join("root").exists());
        assert!(!temp.path().join("root.info").exists());
        assert!(matches!(
            group.get_files(&["k"]),
            Err(Error::Invalidated { .. })
        ));
        assert!(matches!(table.exists(None), Err(Error::Invalidated { .. })));
        assert!(matches!(folder.enter(), Err(Error::Invalidated { .. })));
    }

    #[test]
    fn test_delete_refuses_garbage() {
        let loc = Location::memory();
        let (folder, _, _) = populated(&loc);
        loc.fs()
            .write(&folder.path().join("stray.txt"), b"junk")
            .unwrap();
        assert!(matches!(folder.delete(true), Err(Error::Garbage { .. })));
        assert!(loc.fs().exists(&folder.path().join("stray.txt")));
    }

    #[test]
    fn test_confirmer_allows_delete() {
        let loc = Location::memory();
        let s = Arc::new(Settings::default().with_confirmer(Arc::new(AcceptAll)));
        let folder = Folder::new(&loc, &Literal::new("f"), s).unwrap();
        folder.enter().unwrap();
        folder.delete(false).unwrap();
        assert!(!loc.fs().exists(Path::new("/f")));
    }

    #[test]
    fn test_nested_folders_delete_depth_first() {
        let fs: Arc<dyn crate::fs::FileSystem> = Arc::new(MemoryFileSystem::new());
        let loc = Location::new(fs, "/data");
        let outer = Folder::new(&loc, &Literal::new("outer"), settings()).unwrap();
        outer.enter().unwrap();
        let inner = Folder::new(outer.location(), &Literal::new("inner"), settings()).unwrap();
        inner.enter().unwrap();
        let leaf = FileGroup::builder(&Literal::new("leaf"), vec!["x".into()])
            .maker(BytesMaker::new().with("x", "1"))
            .build(inner.location(), settings())
            .unwrap();
        leaf.enter().unwrap();

        outer.delete(true).unwrap();
        assert!(loc.fs().list(Path::new("/data")).unwrap().is_empty());
    }

    #[test]
    fn test_entity_dispatch() {
        let loc = Location::memory();
        let (folder, _, _) = populated(&loc);
        let record = folder.core().info().load().unwrap();
        let entity = Entity::from_record(&loc, record, settings()).unwrap();
        assert_eq!(entity.kind(), "folder");
        assert_eq!(entity.name(), "root");
        assert!(entity.is_created().unwrap());
        entity.enter().unwrap();
    }
}
