//! # Stowage Core
//!
//! Self-describing, verifiable storage entities on a pluggable file system.
//!
//! Every entity is a content directory plus two sibling state files: a
//! write-once `.info` holding its identity and a mutable `.config` holding
//! timestamps, hashes and schema. The pair must never diverge.
//!
//! ## Entities
//!
//! - [`Folder`]: a directory composing other entities
//! - [`FileGroup`]: a fixed set of blob files with integrity hashes and
//!   periodic re-validation
//! - [`Table`]: a Hive-partitioned Parquet dataset with filtered
//!   read/write/append/delete
//!
//! ## Example
//!
//! ```no_run
//! use stowage_core::{Filter, FiltersList, Folder, Literal, Location, Settings, Table};
//! use polars::prelude::df;
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = Arc::new(Settings::default());
//! let root = Folder::new(&Location::local("./data"), &Literal::new("runs"), settings.clone())?;
//! root.enter()?;
//!
//! let table = Table::builder(&Literal::new("metrics"))
//!     .partition_cols(vec!["epoch".into()])
//!     .build(root.location(), settings)?;
//! table.write(df!("epoch" => &[1i64, 1], "loss" => &[0.9f64, 0.8])?)?;
//!
//! let epoch1 = FiltersList::all(vec![Filter::equal("epoch", 1)]);
//! println!("{}", table.read(Some(&epoch1), None)?);
//! # Ok(())
//! # }
//! ```

mod entity;
mod error;
mod file_group;
mod filter;
mod folder;
mod fs;
mod hash;
mod identity;
mod lock;
mod settings;
mod state;
mod table;

pub use entity::{EntityCore, Lifecycle};
pub use error::{Error, HashFailure, Result};
pub use file_group::{
    BytesMaker, FileGroup, FileGroupBuilder, FileMaker, HashMode, PathsMaker, Staleness,
};
pub use filter::{Filter, FilterItem, FilterValue, FiltersList, Op, Scalar};
pub use folder::{ChildId, Entity, Folder, FolderItems, WalkItem};
pub use fs::{FileSystem, LocalFileSystem, Location, MemoryFileSystem};
pub use hash::{Algorithm, DEFAULT_CHUNK_SIZE, Progress, hash_bytes, hash_reader};
pub use identity::{Descriptor, Identity, Literal, StoredIdentity};
pub use lock::EntityLock;
pub use settings::{
    AcceptAll, CheckWindow, Confirm, DEFAULT_MOUNT, FileSystemRegistry, HistoryLimits, RefuseAll,
    Settings,
};
pub use state::{ConfigExtra, ConfigRecord, ConfigFile, EntityRecord, InfoFile, RecordKind};
pub use table::{
    ColumnType, SchemaColumn, Table, TableArgs, TableBuilder, TableMode, TableOutput, TableSchema,
    TableSource,
};
