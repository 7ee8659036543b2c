//! Advisory per-entity lock files.
//!
//! A lock is `<name>.lock` next to the entity's Info/Config pair, created
//! exclusively and removed when the guard drops. A lock left behind by a
//! crashed process must be removed by hand.

use crate::error::{Error, Result};
use crate::fs::FileSystem;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

/// Held for the duration of create, check and delete.
#[derive(Debug)]
pub struct EntityLock {
    fs: Arc<dyn FileSystem>,
    path: PathBuf,
}

impl EntityLock {
    /// Take the lock at `path`, failing with `Error::Locked` if held.
    pub fn acquire(fs: &Arc<dyn FileSystem>, path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs.create_dir_all(parent)?;
        }
        let stamp = format!(
            "pid={}\nat={}\n",
            std::process::id(),
            chrono::Utc::now().to_rfc3339()
        );
        if !fs.create_new(path, stamp.as_bytes())? {
            return Err(Error::Locked {
                path: path.to_path_buf(),
            });
        }
        Ok(Self {
            fs: Arc::clone(fs),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for EntityLock {
    fn drop(&mut self) {
        if let Err(e) = self.fs.remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to release entity lock");
        }
    }
}
