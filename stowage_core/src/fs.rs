//! Pluggable file-system handles.
//!
//! Every entity reaches storage through a [`Location`]: a shared
//! [`FileSystem`] plus the directory the entity lives in. Two backends are
//! provided: [`LocalFileSystem`] for disk and [`MemoryFileSystem`], an
//! in-process tree that stands in for remote object storage.

use crate::error::{Error, Result};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::{self, Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Primitive operations every storage backend must provide.
pub trait FileSystem: Send + Sync + fmt::Debug {
    fn exists(&self, path: &Path) -> bool;

    fn is_dir(&self, path: &Path) -> bool;

    fn is_file(&self, path: &Path) -> bool;

    fn create_dir_all(&self, path: &Path) -> Result<()>;

    fn read(&self, path: &Path) -> Result<Vec<u8>>;

    /// Open a file for streaming reads.
    fn open_read(&self, path: &Path) -> Result<Box<dyn Read + Send>>;

    /// Replace the file at `path` with `data`. The parent must exist.
    fn write(&self, path: &Path, data: &[u8]) -> Result<()> {
        self.write_with(path, &mut |w| Ok(w.write_all(data)?))
    }

    /// Stream content produced by `producer` into `path`. The file appears
    /// only if the producer succeeds.
    fn write_with(
        &self,
        path: &Path,
        producer: &mut dyn FnMut(&mut dyn Write) -> Result<()>,
    ) -> Result<()>;

    /// Create `path` only if nothing exists there. Returns false if it did.
    fn create_new(&self, path: &Path, data: &[u8]) -> Result<bool>;

    /// Names of the direct children of a directory, sorted.
    fn list(&self, path: &Path) -> Result<Vec<String>>;

    fn remove_file(&self, path: &Path) -> Result<()>;

    /// Remove an empty directory.
    fn remove_dir(&self, path: &Path) -> Result<()>;

    fn remove_dir_all(&self, path: &Path) -> Result<()>;

    fn rename(&self, from: &Path, to: &Path) -> Result<()>;

    fn set_readonly(&self, path: &Path, readonly: bool) -> Result<()>;

    fn is_readonly(&self, path: &Path) -> Result<bool>;
}

/// A directory on a particular file system.
#[derive(Clone)]
pub struct Location {
    fs: Arc<dyn FileSystem>,
    dir: PathBuf,
}

impl Location {
    pub fn new(fs: Arc<dyn FileSystem>, dir: impl Into<PathBuf>) -> Self {
        Self {
            fs,
            dir: dir.into(),
        }
    }

    /// A location on the local disk.
    pub fn local(dir: impl Into<PathBuf>) -> Self {
        Self::new(Arc::new(LocalFileSystem), dir)
    }

    /// A location at the root of a fresh in-memory file system.
    pub fn memory() -> Self {
        let fs = MemoryFileSystem::new();
        Self::new(Arc::new(fs), "/")
    }

    pub fn fs(&self) -> &Arc<dyn FileSystem> {
        &self.fs
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The same file system, one directory further down.
    pub fn join(&self, segment: impl AsRef<Path>) -> Location {
        Location {
            fs: Arc::clone(&self.fs),
            dir: self.dir.join(segment),
        }
    }
}

impl fmt::Debug for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Location({:?} on {:?})", self.dir, self.fs)
    }
}

fn not_found(path: &Path) -> Error {
    io::Error::new(
        io::ErrorKind::NotFound,
        format!("no such file or directory: {}", path.display()),
    )
    .into()
}

/// Local disk.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFileSystem;

impl FileSystem for LocalFileSystem {
    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn is_dir(&self, path: &Path) -> bool {
        path.is_dir()
    }

    fn is_file(&self, path: &Path) -> bool {
        path.is_file()
    }

    fn create_dir_all(&self, path: &Path) -> Result<()> {
        fs::create_dir_all(path)?;
        Ok(())
    }

    fn read(&self, path: &Path) -> Result<Vec<u8>> {
        Ok(fs::read(path)?)
    }

    fn open_read(&self, path: &Path) -> Result<Box<dyn Read + Send>> {
        Ok(Box::new(io::BufReader::new(fs::File::open(path)?)))
    }

    fn write_with(
        &self,
        path: &Path,
        producer: &mut dyn FnMut(&mut dyn Write) -> Result<()>,
    ) -> Result<()> {
        let parent = path.parent().ok_or_else(|| not_found(path))?;
        // A rename would replace read-only files, so refuse them up front.
        if fs::metadata(path).is_ok_and(|m| m.permissions().readonly()) {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("read-only file: {}", path.display()),
            )
            .into());
        }

        // Write atomically using tempfile
        let mut temp_file = tempfile::NamedTempFile::new_in(parent)?;
        producer(&mut temp_file)?;
        temp_file.flush()?;
        temp_file.persist(path)?;
        Ok(())
    }

    fn create_new(&self, path: &Path, data: &[u8]) -> Result<bool> {
        match fs::OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(mut file) => {
                file.write_all(data)?;
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn list(&self, path: &Path) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(path)? {
            names.push(entry?.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    fn remove_file(&self, path: &Path) -> Result<()> {
        fs::remove_file(path)?;
        Ok(())
    }

    fn remove_dir(&self, path: &Path) -> Result<()> {
        fs::remove_dir(path)?;
        Ok(())
    }

    fn remove_dir_all(&self, path: &Path) -> Result<()> {
        fs::remove_dir_all(path)?;
        Ok(())
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        fs::rename(from, to)?;
        Ok(())
    }

    fn set_readonly(&self, path: &Path, readonly: bool) -> Result<()> {
        let mut perms = fs::metadata(path)?.permissions();
        set_perms_readonly(&mut perms, readonly);
        fs::set_permissions(path, perms)?;
        Ok(())
    }

    fn is_readonly(&self, path: &Path) -> Result<bool> {
        Ok(fs::metadata(path)?.permissions().readonly())
    }
}

/// Toggle write bits (Unix keeps the read/execute bits untouched).
#[cfg(unix)]
fn set_perms_readonly(perms: &mut fs::Permissions, readonly: bool) {
    use std::os::unix::fs::PermissionsExt;
    let mode = perms.mode();
    let mode = if readonly { mode & !0o222 } else { mode | 0o200 };
    perms.set_mode(mode);
}

#[cfg(not(unix))]
fn set_perms_readonly(perms: &mut fs::Permissions, readonly: bool) {
    perms.set_readonly(readonly);
}

#[derive(Debug, Clone)]
enum Node {
    Dir,
    File { data: Vec<u8>, readonly: bool },
}

/// In-process file tree. Paths are used verbatim as keys.
#[derive(Debug)]
pub struct MemoryFileSystem {
    nodes: RwLock<BTreeMap<PathBuf, Node>>,
}

impl MemoryFileSystem {
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(PathBuf::from("/"), Node::Dir);
        Self {
            nodes: RwLock::new(nodes),
        }
    }

    fn require_parent_dir(nodes: &BTreeMap<PathBuf, Node>, path: &Path) -> Result<()> {
        match path.parent() {
            Some(parent) if matches!(nodes.get(parent), Some(Node::Dir)) => Ok(()),
            Some(parent) => Err(not_found(parent)),
            None => Err(not_found(path)),
        }
    }

    fn children<'a>(
        nodes: &'a BTreeMap<PathBuf, Node>,
        dir: &'a Path,
    ) -> impl Iterator<Item = &'a PathBuf> + 'a {
        nodes
            .keys()
            .filter(move |p| p.parent() == Some(dir) && p.as_path() != dir)
    }
}

impl Default for MemoryFileSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl FileSystem for MemoryFileSystem {
    fn exists(&self, path: &Path) -> bool {
        self.nodes.read().contains_key(path)
    }

    fn is_dir(&self, path: &Path) -> bool {
        matches!(self.nodes.read().get(path), Some(Node::Dir))
    }

    fn is_file(&self, path: &Path) -> bool {
        matches!(self.nodes.read().get(path), Some(Node::File { .. }))
    }

    fn create_dir_all(&self, path: &Path) -> Result<()> {
        let mut nodes = self.nodes.write();
        for ancestor in path.ancestors() {
            match nodes.get(ancestor) {
                Some(Node::Dir) => break,
                Some(Node::File { .. }) => {
                    return Err(io::Error::new(
                        io::ErrorKind::AlreadyExists,
                        format!("not a directory: {}", ancestor.display()),
                    )
                    .into());
                }
                None => {
                    nodes.insert(ancestor.to_path_buf(), Node::Dir);
                }
            }
        }
        Ok(())
    }

    fn read(&self, path: &Path) -> Result<Vec<u8>> {
        match self.nodes.read().get(path) {
            Some(Node::File { data, .. }) => Ok(data.clone()),
            _ => Err(not_found(path)),
        }
    }

    fn open_read(&self, path: &Path) -> Result<Box<dyn Read + Send>> {
        Ok(Box::new(Cursor::new(self.read(path)?)))
    }

    fn write_with(
        &self,
        path: &Path,
        producer: &mut dyn FnMut(&mut dyn Write) -> Result<()>,
    ) -> Result<()> {
        Self::require_parent_dir(&self.nodes.read(), path)?;

        let mut buf = Vec::new();
        producer(&mut buf)?;

        let mut nodes = self.nodes.write();
        match nodes.get(path) {
            Some(Node::Dir) => {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("is a directory: {}", path.display()),
                )
                .into());
            }
            Some(Node::File { readonly: true, .. }) => {
                return Err(io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    format!("read-only file: {}", path.display()),
                )
                .into());
            }
            _ => {}
        }
        nodes.insert(
            path.to_path_buf(),
            Node::File {
                data: buf,
                readonly: false,
            },
        );
        Ok(())
    }

    fn create_new(&self, path: &Path, data: &[u8]) -> Result<bool> {
        let mut nodes = self.nodes.write();
        Self::require_parent_dir(&nodes, path)?;
        if nodes.contains_key(path) {
            return Ok(false);
        }
        nodes.insert(
            path.to_path_buf(),
            Node::File {
                data: data.to_vec(),
                readonly: false,
            },
        );
        Ok(true)
    }

    fn list(&self, path: &Path) -> Result<Vec<String>> {
        let nodes = self.nodes.read();
        if !matches!(nodes.get(path), Some(Node::Dir)) {
            return Err(not_found(path));
        }
        let mut names: Vec<String> = Self::children(&nodes, path)
            .filter_map(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .collect();
        names.sort();
        Ok(names)
    }

    fn remove_file(&self, path: &Path) -> Result<()> {
        let mut nodes = self.nodes.write();
        match nodes.get(path) {
            Some(Node::File { .. }) => {
                nodes.remove(path);
                Ok(())
            }
            _ => Err(not_found(path)),
        }
    }

    fn remove_dir(&self, path: &Path) -> Result<()> {
        let mut nodes = self.nodes.write();
        if !matches!(nodes.get(path), Some(Node::Dir)) {
            return Err(not_found(path));
        }
        if Self::children(&nodes, path).next().is_some() {
            return Err(io::Error::new(
                io::ErrorKind::DirectoryNotEmpty,
                format!("directory not empty: {}", path.display()),
            )
            .into());
        }
        nodes.remove(path);
        Ok(())
    }

    fn remove_dir_all(&self, path: &Path) -> Result<()> {
        let mut nodes = self.nodes.write();
        if !matches!(nodes.get(path), Some(Node::Dir)) {
            return Err(not_found(path));
        }
        nodes.retain(|p, _| !p.starts_with(path));
        Ok(())
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        let mut nodes = self.nodes.write();
        if !nodes.contains_key(from) {
            return Err(not_found(from));
        }
        Self::require_parent_dir(&nodes, to)?;
        let moved: Vec<PathBuf> = nodes
            .keys()
            .filter(|p| p.starts_with(from))
            .cloned()
            .collect();
        for old in moved {
            if let Some(node) = nodes.remove(&old) {
                let rel = old.strip_prefix(from).map_err(|_| not_found(&old))?;
                let new = if rel.as_os_str().is_empty() {
                    to.to_path_buf()
                } else {
                    to.join(rel)
                };
                nodes.insert(new, node);
            }
        }
        Ok(())
    }

    fn set_readonly(&self, path: &Path, readonly: bool) -> Result<()> {
        match self.nodes.write().get_mut(path) {
            Some(Node::File { readonly: flag, .. }) => {
                *flag = readonly;
                Ok(())
            }
            Some(Node::Dir) => Ok(()),
            None => Err(not_found(path)),
        }
    }

    fn is_readonly(&self, path: &Path) -> Result<bool> {
        match self.nodes.read().get(path) {
            Some(Node::File { readonly, .. }) => Ok(*readonly),
            Some(Node::Dir) => Ok(false),
            None => Err(not_found(path)),
        }
    }
}
