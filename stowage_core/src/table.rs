//! Partitioned columnar tables.
//!
//! A table is a directory of Parquet files laid out Hive style:
//!
//! ```text
//! <table>/a=1/b=22/data.0
//! <table>/a=1/b=33/1718000000000000000.0
//! ```
//!
//! Partition columns live only in directory names and are rebuilt from the
//! stored schema on read. The schema is fixed by the first write.

use crate::entity::EntityCore;
use crate::error::{Error, Result};
use crate::filter::{Filter, FiltersList, Scalar};
use crate::fs::Location;
use crate::identity::{Identity, validate_segment};
use crate::settings::Settings;
use crate::state::{ConfigExtra, ConfigRecord, EntityRecord, RecordKind};
use polars::prelude::{
    AnyValue, Column, DataFrame, DataType, IdxCa, IdxSize, IntoLazy, NamedFrom, NewChunkedArray,
    ParquetReader, ParquetWriter, SerReader, Series,
};
use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

const WRITE_PREFIX: &str = "data";

/// Column types a table records. Only the named ones can partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Int32,
    Int64,
    UInt32,
    UInt64,
    Float32,
    Float64,
    Boolean,
    String,
    /// Any other polars type, by its display name.
    Other(String),
}

impl ColumnType {
    pub fn of(dtype: &DataType) -> Self {
        match dtype {
            DataType::Int32 => ColumnType::Int32,
            DataType::Int64 => ColumnType::Int64,
            DataType::UInt32 => ColumnType::UInt32,
            DataType::UInt64 => ColumnType::UInt64,
            DataType::Float32 => ColumnType::Float32,
            DataType::Float64 => ColumnType::Float64,
            DataType::Boolean => ColumnType::Boolean,
            DataType::String => ColumnType::String,
            other => ColumnType::Other(other.to_string()),
        }
    }

    pub fn can_partition(&self) -> bool {
        !matches!(self, ColumnType::Other(_))
    }

    /// Parse a decoded directory value.
    fn parse_value(&self, text: &str) -> Option<Scalar> {
        match self {
            ColumnType::Int32 | ColumnType::Int64 | ColumnType::UInt32 | ColumnType::UInt64 => {
                text.parse().ok().map(Scalar::Int)
            }
            ColumnType::Float32 | ColumnType::Float64 => text.parse().ok().map(Scalar::Float),
            ColumnType::Boolean => text.parse().ok().map(Scalar::Bool),
            ColumnType::String => Some(Scalar::Str(text.to_string())),
            ColumnType::Other(_) => None,
        }
    }

    /// A column of `height` copies of `value`.
    fn constant(&self, name: &str, value: &Scalar, height: usize) -> Option<Column> {
        let series = match (self, value) {
            (ColumnType::Int32, Scalar::Int(v)) => {
                Series::new(name.into(), vec![i32::try_from(*v).ok()?; height])
            }
            (ColumnType::Int64, Scalar::Int(v)) => Series::new(name.into(), vec![*v; height]),
            (ColumnType::UInt32, Scalar::Int(v)) => {
                Series::new(name.into(), vec![u32::try_from(*v).ok()?; height])
            }
            (ColumnType::UInt64, Scalar::Int(v)) => {
                Series::new(name.into(), vec![u64::try_from(*v).ok()?; height])
            }
            (ColumnType::Float32, Scalar::Float(v)) => {
                Series::new(name.into(), vec![*v as f32; height])
            }
            (ColumnType::Float64, Scalar::Float(v)) => Series::new(name.into(), vec![*v; height]),
            (ColumnType::Boolean, Scalar::Bool(v)) => Series::new(name.into(), vec![*v; height]),
            (ColumnType::String, Scalar::Str(v)) => {
                Series::new(name.into(), vec![v.as_str(); height])
            }
            _ => return None,
        };
        Some(series.into())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaColumn {
    pub name: String,
    pub dtype: ColumnType,
}

/// Ordered column names and types, persisted in Config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub columns: Vec<SchemaColumn>,
}

impl TableSchema {
    pub fn of(df: &DataFrame) -> Self {
        Self {
            columns: df
                .get_columns()
                .iter()
                .map(|c| SchemaColumn {
                    name: c.name().to_string(),
                    dtype: ColumnType::of(c.dtype()),
                })
                .collect(),
        }
    }

    pub fn column(&self, name: &str) -> Option<&SchemaColumn> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }
}

/// What a [`Table::call`] does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableMode {
    Read,
    Write,
    Append,
    ReadWrite,
    Delete,
    Exists,
}

impl TableMode {
    /// Modes whose filters may only touch partition columns.
    pub fn is_write_or_delete_mode(&self) -> bool {
        matches!(
            self,
            TableMode::Write | TableMode::Append | TableMode::ReadWrite | TableMode::Delete
        )
    }

    fn needs_source(&self) -> bool {
        matches!(
            self,
            TableMode::Write | TableMode::Append | TableMode::ReadWrite
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TableMode::Read => "r",
            TableMode::Write => "w",
            TableMode::Append => "a",
            TableMode::ReadWrite => "rw",
            TableMode::Delete => "d",
            TableMode::Exists => "e",
        }
    }
}

impl FromStr for TableMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "r" | "read" => Ok(TableMode::Read),
            "w" | "write" => Ok(TableMode::Write),
            "a" | "append" => Ok(TableMode::Append),
            "rw" | "read_write" => Ok(TableMode::ReadWrite),
            "d" | "delete" => Ok(TableMode::Delete),
            "e" | "exists" => Ok(TableMode::Exists),
            other => Err(Error::precondition(
                "table mode",
                format!("unknown mode {:?}", other),
            )),
        }
    }
}

/// Data handed to write-family modes.
pub enum TableSource {
    Frame(DataFrame),
    /// One file is written per batch and partition.
    Batches(Box<dyn Iterator<Item = Result<DataFrame>>>),
}

impl fmt::Debug for TableSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TableSource::Frame(df) => f.debug_tuple("Frame").field(&df.shape()).finish(),
            TableSource::Batches(_) => f.write_str("Batches(..)"),
        }
    }
}

impl From<DataFrame> for TableSource {
    fn from(df: DataFrame) -> Self {
        TableSource::Frame(df)
    }
}

/// Arguments of [`Table::call`].
#[derive(Debug, Default)]
pub struct TableArgs {
    /// Values for partition columns, turned into equality filters.
    pub partition_values: BTreeMap<String, Scalar>,
    pub filters: Option<FiltersList>,
    pub columns: Option<Vec<String>>,
    pub source: Option<TableSource>,
}

impl TableArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn partition(mut self, column: impl Into<String>, value: impl Into<Scalar>) -> Self {
        self.partition_values.insert(column.into(), value.into());
        self
    }

    pub fn filters(mut self, filters: FiltersList) -> Self {
        self.filters = Some(filters);
        self
    }

    pub fn columns(mut self, columns: Vec<String>) -> Self {
        self.columns = Some(columns);
        self
    }

    pub fn source(mut self, source: impl Into<TableSource>) -> Self {
        self.source = Some(source.into());
        self
    }
}

#[derive(Debug)]
pub enum TableOutput {
    Exists(bool),
    Frame(DataFrame),
    Written { files: usize },
    Deleted { partitions: usize },
}

impl TableOutput {
    pub fn into_frame(self) -> Option<DataFrame> {
        match self {
            TableOutput::Frame(df) => Some(df),
            _ => None,
        }
    }
}

/// One leaf directory of the layout.
#[derive(Debug)]
struct Partition {
    dir: PathBuf,
    values: Vec<Scalar>,
    files: Vec<PathBuf>,
}

fn is_data_file(name: &str) -> bool {
    let Some((stem, index)) = name.split_once('.') else {
        return false;
    };
    let digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    digits(index) && (stem == WRITE_PREFIX || digits(stem))
}

fn value_text(value: &Scalar) -> String {
    match value {
        Scalar::Str(s) => s.clone(),
        other => other.to_string(),
    }
}

fn segment_for(column: &str, value: &Scalar) -> String {
    format!("{}={}", column, urlencoding::encode(&value_text(value)))
}

pub struct TableBuilder {
    name: String,
    identity: String,
    partition_cols: Vec<String>,
    group_by: Vec<String>,
}

impl TableBuilder {
    pub fn partition_cols(mut self, cols: Vec<String>) -> Self {
        self.partition_cols = cols;
        self
    }

    pub fn group_by(mut self, segments: Vec<String>) -> Self {
        self.group_by = segments;
        self
    }

    pub fn build(self, parent: &Location, settings: Arc<Settings>) -> Result<Table> {
        validate_partition_cols(&self.name, &self.partition_cols)?;
        let record = EntityRecord {
            name: self.name,
            identity: self.identity,
            group_by: self.group_by,
            kind: RecordKind::Table,
        };
        let core = EntityCore::new(parent, record, config_defaults(), settings)?;
        Ok(Table {
            core,
            partition_cols: self.partition_cols,
            last_stamp: Cell::new(0),
        })
    }
}

fn config_defaults() -> ConfigRecord {
    ConfigRecord::empty(ConfigExtra::Table {
        schema: None,
        partition_cols: None,
    })
}

fn validate_partition_cols(name: &str, cols: &[String]) -> Result<()> {
    let mut seen = BTreeSet::new();
    for c in cols {
        validate_segment(c, c)?;
        if c.contains('=') || c.contains('/') {
            return Err(Error::invalid_name(c, "partition column names cannot contain '=' or '/'"));
        }
        if !seen.insert(c) {
            return Err(Error::precondition(
                name,
                format!("partition column {:?} listed twice", c),
            ));
        }
    }
    Ok(())
}

/// A partitioned columnar dataset.
pub struct Table {
    core: EntityCore,
    partition_cols: Vec<String>,
    last_stamp: Cell<u128>,
}

impl fmt::Debug for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Table")
            .field("core", &self.core)
            .field("partition_cols", &self.partition_cols)
            .finish()
    }
}

impl Table {
    pub fn builder(identity: &dyn Identity) -> TableBuilder {
        TableBuilder {
            name: identity.name(),
            identity: identity.canonical_text(),
            partition_cols: Vec::new(),
            group_by: Vec::new(),
        }
    }

    /// Rebuild from a stored record, taking partition columns from Config.
    pub(crate) fn from_record(
        parent: &Location,
        record: EntityRecord,
        settings: Arc<Settings>,
    ) -> Result<Self> {
        if record.kind != RecordKind::Table {
            return Err(Error::precondition(&record.name, "record is not a table"));
        }
        let core = EntityCore::new(parent, record, config_defaults(), settings)?;
        let partition_cols = match &core.config().get().extra {
            ConfigExtra::Table { partition_cols, .. } => partition_cols.clone().unwrap_or_default(),
            _ => Vec::new(),
        };
        Ok(Self {
            core,
            partition_cols,
            last_stamp: Cell::new(0),
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

    pub fn partition_cols(&self) -> &[String] {
        &self.partition_cols
    }

    /// Schema fixed by the first write, if any.
    pub fn schema(&self) -> Option<TableSchema> {
        match &self.core.config().get().extra {
            ConfigExtra::Table { schema, .. } => schema.clone(),
            _ => None,
        }
    }

    fn stored_partition_cols(&self) -> Option<Vec<String>> {
        match &self.core.config().get().extra {
            ConfigExtra::Table { partition_cols, .. } => partition_cols.clone(),
            _ => None,
        }
    }

    pub fn is_created(&self) -> Result<bool> {
        self.core.is_created()
    }

    /// Make the empty table directory and its state files.
    pub fn create(&self) -> Result<()> {
        self.core
            .create_with(|core| core.fs().create_dir_all(core.path()))?;
        let cols = self.partition_cols.clone();
        self.core.config().update(|c| {
            if let ConfigExtra::Table { partition_cols, .. } = &mut c.extra {
                *partition_cols = Some(cols);
            }
        })
    }

    /// Create if absent, otherwise check the layout and record the access.
    pub fn enter(&self) -> Result<&Self> {
        self.core.ensure_live()?;
        if self.core.is_created()? {
            if !self.check_layout()? {
                self.adopt_layout()?;
            }
            self.core.record_access()?;
        } else {
            self.create()?;
        }
        self.core.mark_entered();
        Ok(self)
    }

    /// Identity and layout checks for the direct access methods. Nothing is
    /// created and no access is recorded.
    fn verify_access(&self) -> Result<()> {
        if self.core.is_created()? {
            self.check_layout()?;
        }
        Ok(())
    }

    /// True when the stored partition columns match this handle. A mismatch
    /// is an error once a schema is fixed.
    fn check_layout(&self) -> Result<bool> {
        let stored = self.stored_partition_cols();
        if stored.as_deref() == Some(self.partition_cols.as_slice()) {
            return Ok(true);
        }
        if self.schema().is_some() {
            return Err(Error::precondition(
                &self.core,
                format!(
                    "stored partition columns {:?} differ from requested {:?}",
                    stored.unwrap_or_default(),
                    self.partition_cols
                ),
            ));
        }
        Ok(false)
    }

    fn adopt_layout(&self) -> Result<()> {
        let cols = self.partition_cols.clone();
        self.core.config().update(|c| {
            if let ConfigExtra::Table { partition_cols, .. } = &mut c.extra {
                *partition_cols = Some(cols);
            }
        })
    }

    /// Run one mode. Creates the table on first use.
    pub fn call(&self, mode: TableMode, args: TableArgs) -> Result<TableOutput> {
        self.enter()?;
        let TableArgs {
            partition_values,
            filters,
            columns,
            source,
        } = args;

        if let Some(unknown) = partition_values
            .keys()
            .find(|k| !self.partition_cols.contains(k))
        {
            return Err(Error::invalid_filter(format!(
                "{:?} is not a partition column of {}",
                unknown, self.core
            )));
        }
        if mode.is_write_or_delete_mode() {
            if columns.is_some() {
                return Err(Error::precondition(
                    &self.core,
                    format!("columns cannot be selected in mode {:?}", mode.as_str()),
                ));
            }
            if mode != TableMode::Delete {
                if filters.as_ref().is_some_and(|f| !f.is_empty()) {
                    return Err(Error::invalid_filter(format!(
                        "filters are not allowed in mode {:?}, pass partition values",
                        mode.as_str()
                    )));
                }
                if !partition_values.is_empty()
                    && partition_values.len() != self.partition_cols.len()
                {
                    return Err(Error::invalid_filter(format!(
                        "mode {:?} needs values for all partition columns {:?}",
                        mode.as_str(),
                        self.partition_cols
                    )));
                }
            }
        }
        if mode.needs_source() != source.is_some() {
            return match source {
                None => Err(Error::NoProducer {
                    entity: self.core.to_string(),
                }),
                Some(_) => Err(Error::precondition(
                    &self.core,
                    format!("mode {:?} takes no data", mode.as_str()),
                )),
            };
        }

        let pinned = self.pinned_values(&partition_values);
        let mut merged = FiltersList::all(
            partition_values
                .iter()
                .map(|(c, v)| Filter::equal(c.clone(), v.clone()))
                .collect(),
        );
        if let Some(user) = filters {
            for item in user.items() {
                merged.push(item.clone());
            }
        }
        let merged = (!merged.is_empty()).then_some(merged);
        debug!(entity = %self.core, mode = mode.as_str(), filters = ?merged, "table call");

        match (mode, source) {
            (TableMode::Exists, _) => Ok(TableOutput::Exists(self.exists(merged.as_ref())?)),
            (TableMode::Read, _) => Ok(TableOutput::Frame(
                self.read(merged.as_ref(), columns.as_deref())?,
            )),
            (TableMode::Delete, _) => Ok(TableOutput::Deleted {
                partitions: self.delete_(merged.as_ref())?,
            }),
            (TableMode::Write, Some(src)) => Ok(TableOutput::Written {
                files: self.store(src, pinned.as_deref(), true)?,
            }),
            (TableMode::Append, Some(src)) => Ok(TableOutput::Written {
                files: self.store(src, pinned.as_deref(), false)?,
            }),
            (TableMode::ReadWrite, Some(src)) => {
                if let Some(df) = self.scan(merged.as_ref(), None)? {
                    return Ok(TableOutput::Frame(df));
                }
                match src {
                    TableSource::Frame(df) => {
                        self.store(TableSource::Frame(df.clone()), pinned.as_deref(), false)?;
                        Ok(TableOutput::Frame(df))
                    }
                    batches => {
                        self.store(batches, pinned.as_deref(), false)?;
                        Ok(TableOutput::Frame(self.read(merged.as_ref(), None)?))
                    }
                }
            }
            (_, None) => Err(Error::NoProducer {
                entity: self.core.to_string(),
            }),
        }
    }

    /// Partition values in column order when all are given.
    fn pinned_values(&self, values: &BTreeMap<String, Scalar>) -> Option<Vec<Scalar>> {
        if values.is_empty() {
            return None;
        }
        self.partition_cols
            .iter()
            .map(|c| values.get(c).cloned())
            .collect()
    }

    /// True when any row matches. Without filters no data is read.
    pub fn exists(&self, filters: Option<&FiltersList>) -> Result<bool> {
        self.core.ensure_live()?;
        self.verify_access()?;
        if self.schema().is_none() {
            return Ok(false);
        }
        let parts = self.partitions(filters)?;
        if parts.iter().all(|p| p.files.is_empty()) {
            return Ok(false);
        }
        match filters {
            None => Ok(true),
            Some(_) => Ok(self.scan(filters, None)?.is_some()),
        }
    }

    /// Matching rows, optionally projected. An empty result is an error.
    pub fn read(&self, filters: Option<&FiltersList>, columns: Option<&[String]>) -> Result<DataFrame> {
        self.core.ensure_live()?;
        self.verify_access()?;
        self.scan(filters, columns)?.ok_or_else(|| Error::NothingToRead {
            entity: self.core.to_string(),
        })
    }

    /// Write `df`; fails if any of its partitions already hold data.
    pub fn write(&self, df: DataFrame) -> Result<usize> {
        self.call(TableMode::Write, TableArgs::new().source(df))
            .map(|out| match out {
                TableOutput::Written { files } => files,
                _ => 0,
            })
    }

    /// Add `df` next to whatever is already stored.
    pub fn append(&self, df: DataFrame) -> Result<usize> {
        self.call(TableMode::Append, TableArgs::new().source(df))
            .map(|out| match out {
                TableOutput::Written { files } => files,
                _ => 0,
            })
    }

    /// Return the stored rows for `partition`, producing them if absent.
    pub fn read_write(
        &self,
        partition: BTreeMap<String, Scalar>,
        source: impl Into<TableSource>,
    ) -> Result<DataFrame> {
        let args = TableArgs {
            partition_values: partition,
            source: Some(source.into()),
            ..TableArgs::default()
        };
        self.call(TableMode::ReadWrite, args)?
            .into_frame()
            .ok_or_else(|| Error::NothingToRead {
                entity: self.core.to_string(),
            })
    }

    /// Remove data. `None` empties the table but keeps it created; filters
    /// remove whole partition directories and may only use partition
    /// columns. Returns the number of partitions removed.
    pub fn delete_(&self, filters: Option<&FiltersList>) -> Result<usize> {
        self.core.ensure_live()?;
        let _lock = self.core.lock()?;
        self.verify_access()?;
        let Some(filters) = filters else {
            return self.wipe_data();
        };
        if self.partition_cols.is_empty() {
            return Err(Error::invalid_filter(format!(
                "{} has no partition columns to delete by",
                self.core
            )));
        }
        if filters.has_groups() {
            return Err(Error::invalid_filter(
                "delete filters cannot contain OR groups",
            ));
        }
        filters.check_columns(&self.partition_cols, "delete")?;
        if self.schema().is_none() {
            return Ok(0);
        }
        let parts = self.partitions(Some(filters))?;
        for part in &parts {
            self.core.fs().remove_dir_all(&part.dir)?;
            self.prune_partition_dirs(&part.dir)?;
            info!(entity = %self.core, partition = %part.dir.display(), "partition deleted");
        }
        Ok(parts.len())
    }

    /// Remove every data file and partition directory, keeping the table.
    fn wipe_data(&self) -> Result<usize> {
        let fs = self.core.fs();
        let root = self.core.path();
        if !fs.is_dir(root) {
            return Ok(0);
        }
        let entries = fs.list(root)?;
        if entries.is_empty() {
            return Ok(0);
        }
        if self.schema().is_none() {
            return Err(Error::UnknownContent {
                path: root.to_path_buf(),
                entries,
            });
        }
        let parts = self.partitions(None)?;
        for name in entries {
            let path = root.join(&name);
            if fs.is_dir(&path) {
                fs.remove_dir_all(&path)?;
            } else {
                fs.remove_file(&path)?;
            }
        }
        info!(entity = %self.core, partitions = parts.len(), "table data wiped");
        Ok(parts.len())
    }

    /// Remove the table with its data and state files.
    pub fn delete(&self, force: bool) -> Result<()> {
        self.core.delete_with(force, |_| self.wipe_data().map(|_| ()))
    }

    fn prune_partition_dirs(&self, leaf: &Path) -> Result<()> {
        let root = self.core.path();
        let mut dir = leaf.parent();
        while let Some(d) = dir {
            if d == root || !d.starts_with(root) || !self.core.fs().list(d)?.is_empty() {
                break;
            }
            self.core.fs().remove_dir(d)?;
            dir = d.parent();
        }
        Ok(())
    }

    fn partition_label(&self, values: &[Scalar]) -> String {
        if values.is_empty() {
            return "<root>".to_string();
        }
        self.partition_cols
            .iter()
            .zip(values)
            .map(|(c, v)| segment_for(c, v))
            .collect::<Vec<_>>()
            .join("/")
    }

    fn partition_path(&self, values: &[Scalar]) -> PathBuf {
        let mut dir = self.core.path().to_path_buf();
        for (c, v) in self.partition_cols.iter().zip(values) {
            dir.push(segment_for(c, v));
        }
        dir
    }

    /// Leaf directories whose values pass the flat filters.
    fn partitions(&self, filters: Option<&FiltersList>) -> Result<Vec<Partition>> {
        let Some(schema) = self.schema() else {
            return Ok(Vec::new());
        };
        let root = self.core.path().to_path_buf();
        if !self.core.fs().is_dir(&root) {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        let mut values = Vec::new();
        self.walk_level(&schema, filters, &root, &mut values, &mut out)?;
        Ok(out)
    }

    fn walk_level(
        &self,
        schema: &TableSchema,
        filters: Option<&FiltersList>,
        dir: &Path,
        values: &mut Vec<Scalar>,
        out: &mut Vec<Partition>,
    ) -> Result<()> {
        let fs = self.core.fs();
        let entries = fs.list(dir)?;
        let depth = values.len();

        let Some(column) = self.partition_cols.get(depth) else {
            let (data, stray): (Vec<String>, Vec<String>) = entries
                .into_iter()
                .partition(|n| is_data_file(n) && fs.is_file(&dir.join(n)));
            if !stray.is_empty() {
                return Err(Error::UnknownContent {
                    path: dir.to_path_buf(),
                    entries: stray,
                });
            }
            out.push(Partition {
                dir: dir.to_path_buf(),
                values: values.clone(),
                files: data.iter().map(|n| dir.join(n)).collect(),
            });
            return Ok(());
        };

        let dtype = schema
            .column(column)
            .map(|c| c.dtype.clone())
            .ok_or_else(|| {
                Error::schema_mismatch(&self.core, format!("partition column {:?} not in schema", column))
            })?;
        let prefix = format!("{}=", column);
        let mut stray = Vec::new();
        let mut children = Vec::new();
        for name in entries {
            let path = dir.join(&name);
            let parsed = name
                .strip_prefix(&prefix)
                .filter(|_| fs.is_dir(&path))
                .and_then(|raw| urlencoding::decode(raw).ok())
                .and_then(|text| dtype.parse_value(&text));
            match parsed {
                Some(value) => children.push((path, value)),
                None => stray.push(name),
            }
        }
        if !stray.is_empty() {
            return Err(Error::UnknownContent {
                path: dir.to_path_buf(),
                entries: stray,
            });
        }

        for (path, value) in children {
            if let Some(filters) = filters {
                let mut keep = true;
                for f in filters.flat().filter(|f| f.column() == column) {
                    if !f.matches(&value)? {
                        keep = false;
                        break;
                    }
                }
                if !keep {
                    continue;
                }
            }
            values.push(value);
            self.walk_level(schema, filters, &path, values, out)?;
            values.pop();
        }
        Ok(())
    }

    /// Read, filter and project. `None` when no row matches.
    fn scan(&self, filters: Option<&FiltersList>, columns: Option<&[String]>) -> Result<Option<DataFrame>> {
        self.core.ensure_live()?;
        let Some(schema) = self.schema() else {
            return Ok(None);
        };
        if let Some(cols) = columns
            && let Some(missing) = cols.iter().find(|c| schema.column(c).is_none())
        {
            return Err(Error::precondition(
                &self.core,
                format!("unknown column {:?}", missing),
            ));
        }
        if let Some(f) = filters {
            let names: Vec<String> = schema.names().map(String::from).collect();
            f.check_columns(&names, "read")?;
        }

        let mut acc: Option<DataFrame> = None;
        for part in self.partitions(filters)? {
            for file in &part.files {
                let df = self.load_file(&schema, &part.values, file)?;
                match acc.as_mut() {
                    Some(a) => {
                        a.vstack_mut(&df)?;
                    }
                    None => acc = Some(df),
                }
            }
        }
        let Some(mut df) = acc else {
            return Ok(None);
        };
        if let Some(expr) = filters.and_then(FiltersList::to_expr) {
            df = df.lazy().filter(expr).collect()?;
        }
        if let Some(cols) = columns {
            df = df.select(cols.iter().map(String::as_str))?;
        }
        debug!(entity = %self.core, rows = df.height(), "scanned");
        Ok((df.height() > 0).then_some(df))
    }

    fn load_file(&self, schema: &TableSchema, values: &[Scalar], file: &Path) -> Result<DataFrame> {
        let bytes = self.core.fs().read(file)?;
        let mut df = ParquetReader::new(Cursor::new(bytes)).finish()?;
        let height = df.height();
        for (column, value) in self.partition_cols.iter().zip(values) {
            let col = schema
                .column(column)
                .and_then(|c| c.dtype.constant(column, value, height))
                .ok_or_else(|| {
                    Error::schema_mismatch(
                        &self.core,
                        format!("cannot rebuild partition column {:?} from {}", column, value),
                    )
                })?;
            df.with_column(col)?;
        }
        Ok(df.select(schema.names())?)
    }

    /// Require an exact match with the stored schema. Before the first write
    /// the frame's own schema is returned, to be fixed once data lands.
    fn check_schema(&self, df: &DataFrame) -> Result<Option<TableSchema>> {
        let incoming = TableSchema::of(df);
        for c in &self.partition_cols {
            let Some(col) = incoming.column(c) else {
                return Err(Error::schema_mismatch(
                    &self.core,
                    format!("partition column {:?} missing from data", c),
                ));
            };
            if !col.dtype.can_partition() {
                return Err(Error::schema_mismatch(
                    &self.core,
                    format!("column {:?} of type {:?} cannot partition", c, col.dtype),
                ));
            }
            if df.column(c)?.null_count() > 0 {
                return Err(Error::schema_mismatch(
                    &self.core,
                    format!("partition column {:?} has null values", c),
                ));
            }
        }
        if incoming.columns.len() == self.partition_cols.len() {
            return Err(Error::schema_mismatch(
                &self.core,
                "data has no columns besides the partition columns",
            ));
        }
        match self.schema() {
            Some(stored) if stored == incoming => Ok(None),
            Some(stored) => Err(Error::schema_mismatch(
                &self.core,
                format!("expected {:?}, got {:?}", stored.columns, incoming.columns),
            )),
            None => Ok(Some(incoming)),
        }
    }

    fn fix_schema(&self, fixed: TableSchema) -> Result<()> {
        info!(entity = %self.core, columns = fixed.columns.len(), "schema fixed");
        self.core.config().update(|c| {
            if let ConfigExtra::Table { schema, .. } = &mut c.extra {
                *schema = Some(fixed);
            }
        })
    }

    /// Row groups by partition values, in first-seen order.
    fn split(&self, df: &DataFrame) -> Result<Vec<(Vec<Scalar>, DataFrame)>> {
        if df.height() == 0 {
            return Ok(Vec::new());
        }
        if self.partition_cols.is_empty() {
            return Ok(vec![(Vec::new(), df.clone())]);
        }
        let columns = self
            .partition_cols
            .iter()
            .map(|c| df.column(c))
            .collect::<polars::prelude::PolarsResult<Vec<_>>>()?;
        let mut order: Vec<Vec<Scalar>> = Vec::new();
        let mut rows: BTreeMap<PathBuf, Vec<IdxSize>> = BTreeMap::new();
        for row in 0..df.height() {
            let key = columns
                .iter()
                .map(|c| self.scalar_at(c, row))
                .collect::<Result<Vec<_>>>()?;
            let dir = self.partition_path(&key);
            rows.entry(dir)
                .or_insert_with(|| {
                    order.push(key);
                    Vec::new()
                })
                .push(row as IdxSize);
        }
        order
            .into_iter()
            .map(|key| -> Result<(Vec<Scalar>, DataFrame)> {
                let idx = rows.remove(&self.partition_path(&key)).unwrap_or_default();
                let part = df.take(&IdxCa::from_vec("".into(), idx))?;
                Ok((key, part))
            })
            .collect()
    }

    fn scalar_at(&self, column: &Column, row: usize) -> Result<Scalar> {
        let value = match column.get(row)? {
            AnyValue::Boolean(b) => Scalar::Bool(b),
            AnyValue::Int8(v) => Scalar::Int(v.into()),
            AnyValue::Int16(v) => Scalar::Int(v.into()),
            AnyValue::Int32(v) => Scalar::Int(v.into()),
            AnyValue::Int64(v) => Scalar::Int(v),
            AnyValue::UInt8(v) => Scalar::Int(v.into()),
            AnyValue::UInt16(v) => Scalar::Int(v.into()),
            AnyValue::UInt32(v) => Scalar::Int(v.into()),
            AnyValue::UInt64(v) => Scalar::Int(i64::try_from(v).map_err(|_| {
                Error::schema_mismatch(&self.core, format!("{} does not fit a partition value", v))
            })?),
            AnyValue::Float32(v) => Scalar::Float(v.into()),
            AnyValue::Float64(v) => Scalar::Float(v),
            AnyValue::String(s) => Scalar::Str(s.to_string()),
            AnyValue::StringOwned(s) => Scalar::Str(s.to_string()),
            other => {
                return Err(Error::schema_mismatch(
                    &self.core,
                    format!("unsupported partition value {:?} in {:?}", other, column.name()),
                ));
            }
        };
        Ok(value)
    }

    fn has_data(&self, dir: &Path) -> Result<bool> {
        let fs = self.core.fs();
        if !fs.is_dir(dir) {
            return Ok(false);
        }
        Ok(fs.list(dir)?.iter().any(|n| is_data_file(n)))
    }

    fn next_write_name(&self, dir: &Path) -> String {
        let mut n = 0usize;
        loop {
            let name = format!("{}.{}", WRITE_PREFIX, n);
            if !self.core.fs().exists(&dir.join(&name)) {
                return name;
            }
            n += 1;
        }
    }

    /// Nanosecond stamp, strictly increasing per handle.
    fn next_stamp(&self) -> u128 {
        std::thread::sleep(self.core.settings().append_delay);
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let stamp = now.max(self.last_stamp.get() + 1);
        self.last_stamp.set(stamp);
        stamp
    }

    fn write_file(&self, path: &Path, mut df: DataFrame) -> Result<()> {
        let data_cols: Vec<String> = df
            .get_column_names()
            .into_iter()
            .map(|n| n.to_string())
            .filter(|n| !self.partition_cols.contains(n))
            .collect();
        df = df.select(data_cols.iter().map(String::as_str))?;
        let mut buf = Vec::new();
        ParquetWriter::new(&mut buf).finish(&mut df)?;
        let fs = self.core.fs();
        if let Some(dir) = path.parent() {
            fs.create_dir_all(dir)?;
        }
        fs.write(path, &buf)?;
        debug!(entity = %self.core, file = %path.display(), rows = df.height(), "data file written");
        Ok(())
    }

    /// Write every frame of `source`. `fresh` refuses partitions that held
    /// data before this call. Returns the number of files written.
    fn store(&self, source: TableSource, pinned: Option<&[Scalar]>, fresh: bool) -> Result<usize> {
        let _lock = self.core.lock()?;
        let frames: Box<dyn Iterator<Item = Result<DataFrame>>> = match source {
            TableSource::Frame(df) => Box::new(std::iter::once(Ok(df))),
            TableSource::Batches(it) => it,
        };
        let mut touched = BTreeSet::new();
        let mut files = 0;
        for frame in frames {
            let frame = frame?;
            let unfixed = self.check_schema(&frame)?;
            let groups = self.split(&frame)?;
            for (values, _) in &groups {
                if let Some(expected) = pinned
                    && values.as_slice() != expected
                {
                    return Err(Error::schema_mismatch(
                        &self.core,
                        format!(
                            "rows for partition {:?} do not belong to {:?}",
                            values, expected
                        ),
                    ));
                }
                let dir = self.partition_path(values);
                if fresh && !touched.contains(&dir) && self.has_data(&dir)? {
                    return Err(Error::PartitionExists {
                        entity: self.core.to_string(),
                        partition: self.partition_label(values),
                    });
                }
            }
            if groups.is_empty() {
                continue;
            }
            if let Some(schema) = unfixed {
                self.fix_schema(schema)?;
            }
            let stamp = (!fresh).then(|| self.next_stamp());
            for (values, part) in groups {
                let dir = self.partition_path(&values);
                let name = match stamp {
                    Some(s) => format!("{}.0", s),
                    None => self.next_write_name(&dir),
                };
                self.write_file(&dir.join(name), part)?;
                touched.insert(dir);
                files += 1;
            }
        }
        info!(entity = %self.core, files, append = !fresh, "table data stored");
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{FilterItem, Op};
    use crate::identity::{Descriptor, Literal};
    use polars::prelude::df;
    use tempfile::TempDir;

    fn settings() -> Arc<Settings> {
        Arc::new(Settings::default())
    }

    fn ab_table(loc: &Location) -> Table {
        Table::builder(&Literal::new("t"))
            .partition_cols(vec!["a".into(), "b".into()])
            .build(loc, settings())
            .unwrap()
    }

    fn rows(b: i64) -> DataFrame {
        df!(
            "a" => &[1i64, 1, 1, 1],
            "b" => &[b, b, b, b],
            "c" => &[6i64, 7, 8, 9],
        )
        .unwrap()
    }

    fn only(filters: Vec<Filter>) -> FiltersList {
        FiltersList::all(filters)
    }

    #[test]
    fn test_partitioned_write_read_delete_scenario() {
        let temp = TempDir::new().unwrap();
        let table = ab_table(&Location::local(temp.path()));
        table.write(rows(22)).unwrap();
        table.write(rows(33)).unwrap();

        assert!(temp.path().join("t/a=1/b=22/data.0").is_file());
        assert!(temp.path().join("t/a=1/b=33/data.0").is_file());

        let a1 = only(vec![Filter::equal("a", 1)]);
        assert_eq!(table.read(Some(&a1), None).unwrap().height(), 8);

        let a1b22 = only(vec![Filter::equal("a", 1), Filter::equal("b", 22)]);
        let first = table.read(Some(&a1b22), None).unwrap();
        assert_eq!(first.height(), 4);
        let names: Vec<String> = first.get_column_names().iter().map(|n| n.to_string()).collect();
        assert_eq!(names, ["a", "b", "c"]);

        let removed = table.delete_(Some(&only(vec![Filter::equal("b", 33)]))).unwrap();
        assert_eq!(removed, 1);
        let rest = table.read(None, None).unwrap();
        assert_eq!(rest.height(), 4);
        assert!(rest.equals(&rows(22)));
        assert!(!table.exists(Some(&only(vec![Filter::equal("b", 33)]))).unwrap());
        assert!(!temp.path().join("t/a=1/b=33").exists());
    }

    #[test]
    fn test_write_twice_fails_append_unions() {
        let table = ab_table(&Location::memory());
        table.write(rows(22)).unwrap();
        assert!(matches!(
            table.write(rows(22)),
            Err(Error::PartitionExists { .. })
        ));
        table.append(rows(22)).unwrap();
        table.append(rows(22)).unwrap();
        let all = table.read(None, None).unwrap();
        assert_eq!(all.height(), 12);

        let dir = table.path().join("a=1/b=22");
        let files = table.core().fs().list(&dir).unwrap();
        assert_eq!(files.len(), 3);
        assert!(files.iter().all(|n| is_data_file(n)));
    }

    #[test]
    fn test_schema_is_fixed_by_first_write() {
        let table = ab_table(&Location::memory());
        table.write(rows(22)).unwrap();
        let other = df!(
            "a" => &[1i64],
            "b" => &[44i64],
            "c" => &["x"],
        )
        .unwrap();
        assert!(matches!(
            table.append(other),
            Err(Error::SchemaMismatch { .. })
        ));
        let missing = df!("a" => &[1i64], "c" => &[1i64]).unwrap();
        assert!(matches!(
            table.append(missing),
            Err(Error::SchemaMismatch { .. })
        ));
    }

    #[test]
    fn test_null_partition_values_rejected() {
        let table = ab_table(&Location::memory());
        let df = df!(
            "a" => &[Some(1i64), None],
            "b" => &[1i64, 2],
            "c" => &[1i64, 2],
        )
        .unwrap();
        assert!(matches!(table.write(df), Err(Error::SchemaMismatch { .. })));
        assert!(table.schema().is_none());
    }

    #[test]
    fn test_unpartitioned_table() {
        let table = Table::builder(&Literal::new("plain"))
            .build(&Location::memory(), settings())
            .unwrap();
        assert!(!table.exists(None).unwrap());
        table.write(df!("x" => &[1i64, 2, 3]).unwrap()).unwrap();
        assert!(table.exists(None).unwrap());
        assert!(matches!(
            table.write(df!("x" => &[4i64]).unwrap()),
            Err(Error::PartitionExists { .. })
        ));
        let gt = only(vec![Filter::with_op("x", Op::Gt, 1).unwrap()]);
        assert_eq!(table.read(Some(&gt), None).unwrap().height(), 2);
        assert!(matches!(
            table.delete_(Some(&gt)),
            Err(Error::InvalidFilter { .. })
        ));
    }

    #[test]
    fn test_read_nothing_is_an_error() {
        let table = ab_table(&Location::memory());
        assert!(matches!(table.read(None, None), Err(Error::NothingToRead { .. })));
        table.write(rows(22)).unwrap();
        let none = only(vec![Filter::equal("c", 100)]);
        assert!(matches!(
            table.read(Some(&none), None),
            Err(Error::NothingToRead { .. })
        ));
        assert!(!table.exists(Some(&none)).unwrap());
    }

    #[test]
    fn test_or_groups_and_projection() {
        let table = ab_table(&Location::memory());
        table.write(rows(22)).unwrap();
        table.write(rows(33)).unwrap();
        let filters = FiltersList::new(vec![
            FilterItem::Filter(Filter::with_op("c", Op::GtEq, 8).unwrap()),
            FilterItem::Group(vec![Filter::equal("b", 22)]),
            FilterItem::Group(vec![Filter::equal("b", 33), Filter::equal("c", 9)]),
        ]);
        let cols = vec!["c".to_string()];
        let df = table.read(Some(&filters), Some(cols.as_slice())).unwrap();
        assert_eq!(df.width(), 1);
        assert_eq!(df.height(), 3);
    }

    #[test]
    fn test_delete_rejects_non_partition_and_grouped_filters() {
        let table = ab_table(&Location::memory());
        table.write(rows(22)).unwrap();
        let on_data = only(vec![Filter::equal("c", 6)]);
        assert!(matches!(
            table.delete_(Some(&on_data)),
            Err(Error::InvalidFilter { .. })
        ));
        let grouped = FiltersList::new(vec![FilterItem::Group(vec![Filter::equal("a", 1)])]);
        assert!(matches!(
            table.delete_(Some(&grouped)),
            Err(Error::InvalidFilter { .. })
        ));
        assert_eq!(table.read(None, None).unwrap().height(), 4);
    }

    #[test]
    fn test_range_delete_by_directory_values() {
        let table = ab_table(&Location::memory());
        for b in [10, 20, 30] {
            table.write(rows(b)).unwrap();
        }
        let ge20 = only(vec![Filter::with_op("b", Op::GtEq, 20).unwrap()]);
        assert_eq!(table.delete_(Some(&ge20)).unwrap(), 2);
        let left = table.read(None, None).unwrap();
        assert_eq!(left.height(), 4);
        assert_eq!(left.column("b").unwrap().i64().unwrap().get(0), Some(10));
    }

    #[test]
    fn test_unconditional_delete_keeps_table() {
        let table = ab_table(&Location::memory());
        table.write(rows(22)).unwrap();
        assert_eq!(table.delete_(None).unwrap(), 1);
        assert!(table.is_created().unwrap());
        assert!(!table.exists(None).unwrap());
        assert!(table.core().fs().list(table.path()).unwrap().is_empty());
        // Schema survives, so the next write must still match it.
        assert!(table.schema().is_some());
        table.write(rows(22)).unwrap();
    }

    #[test]
    fn test_call_validates_arguments() {
        let table = ab_table(&Location::memory());
        let partial = TableArgs::new().partition("a", 1).source(rows(22));
        assert!(matches!(
            table.call(TableMode::Write, partial),
            Err(Error::InvalidFilter { .. })
        ));
        let with_filters = TableArgs::new()
            .filters(only(vec![Filter::equal("a", 1)]))
            .source(rows(22));
        assert!(matches!(
            table.call(TableMode::Append, with_filters),
            Err(Error::InvalidFilter { .. })
        ));
        let projected = TableArgs::new().columns(vec!["c".into()]).source(rows(22));
        assert!(matches!(
            table.call(TableMode::Write, projected),
            Err(Error::Precondition { .. })
        ));
        assert!(matches!(
            table.call(TableMode::Write, TableArgs::new()),
            Err(Error::NoProducer { .. })
        ));
        let wrong_partition = TableArgs::new()
            .partition("a", 1)
            .partition("b", 99)
            .source(rows(22));
        assert!(matches!(
            table.call(TableMode::Write, wrong_partition),
            Err(Error::SchemaMismatch { .. })
        ));
        assert!(matches!(
            table.call(TableMode::Read, TableArgs::new().partition("zz", 1)),
            Err(Error::InvalidFilter { .. })
        ));
    }

    #[test]
    fn test_read_write_produces_once() {
        let table = ab_table(&Location::memory());
        let partition = BTreeMap::from([
            ("a".to_string(), Scalar::Int(1)),
            ("b".to_string(), Scalar::Int(22)),
        ]);
        let first = table.read_write(partition.clone(), rows(22)).unwrap();
        assert_eq!(first.height(), 4);
        // Second call reads back instead of appending again.
        let second = table.read_write(partition, rows(22)).unwrap();
        assert_eq!(second.height(), 4);
        assert_eq!(table.read(None, None).unwrap().height(), 4);
    }

    #[test]
    fn test_batches_write_one_file_each() {
        let table = ab_table(&Location::memory());
        let batches: Vec<Result<DataFrame>> = vec![Ok(rows(22)), Ok(rows(22)), Ok(rows(33))];
        let args = TableArgs {
            source: Some(TableSource::Batches(Box::new(batches.into_iter()))),
            ..TableArgs::default()
        };
        match table.call(TableMode::Write, args).unwrap() {
            TableOutput::Written { files } => assert_eq!(files, 3),
            other => panic!("unexpected {:?}", other),
        }
        let dir = table.path().join("a=1/b=22");
        assert_eq!(
            table.core().fs().list(&dir).unwrap(),
            vec!["data.0".to_string(), "data.1".to_string()]
        );
        assert_eq!(table.read(None, None).unwrap().height(), 12);
    }

    #[test]
    fn test_string_partition_values_are_encoded() {
        let table = Table::builder(&Literal::new("s"))
            .partition_cols(vec!["city".into()])
            .build(&Location::memory(), settings())
            .unwrap();
        let df = df!(
            "city" => &["New York", "a/b"],
            "n" => &[1i64, 2],
        )
        .unwrap();
        table.write(df).unwrap();
        let names = table.core().fs().list(table.path()).unwrap();
        assert_eq!(names, ["city=New%20York", "city=a%2Fb"]);
        let ny = only(vec![Filter::equal("city", "a/b")]);
        let got = table.read(Some(&ny), None).unwrap();
        assert_eq!(got.column("n").unwrap().i64().unwrap().get(0), Some(2));
    }

    #[test]
    fn test_stray_files_are_refused() {
        let table = ab_table(&Location::memory());
        table.write(rows(22)).unwrap();
        let fs = table.core().fs();
        fs.write(&table.path().join("a=1/notes.txt"), b"x").unwrap();
        assert!(matches!(
            table.read(None, None),
            Err(Error::UnknownContent { .. })
        ));
        assert!(matches!(
            table.delete(true),
            Err(Error::UnknownContent { .. })
        ));
    }

    #[test]
    fn test_layout_guard() {
        let loc = Location::memory();
        let table = ab_table(&loc);
        table.enter().unwrap();

        // Before any data the stored partition columns follow the handle.
        let reordered = Table::builder(&Literal::new("t"))
            .partition_cols(vec!["b".into(), "a".into()])
            .build(&loc, settings())
            .unwrap();
        reordered.enter().unwrap();
        reordered.write(rows(22)).unwrap();

        let again = ab_table(&loc);
        assert!(matches!(again.enter(), Err(Error::Precondition { .. })));
    }

    #[test]
    fn test_entity_delete_removes_everything() {
        let temp = TempDir::new().unwrap();
        let loc = Location::local(temp.path());
        let table = ab_table(&loc);
        table.write(rows(22)).unwrap();
        table.delete(true).unwrap();
        assert!(!temp.path().join("t").exists());
        assert!(!temp.path().join("t.info").exists());
        assert!(!temp.path().join("t.config").exists());
        assert!(matches!(table.exists(None), Err(Error::Invalidated { .. })));
    }

    #[test]
    fn test_rehydrated_table_knows_partitions() {
        let loc = Location::memory();
        let table = ab_table(&loc);
        table.write(rows(22)).unwrap();
        let record = table.core().info().load().unwrap();
        let back = Table::from_record(&loc, record, settings()).unwrap();
        assert_eq!(back.partition_cols(), ["a", "b"]);
        assert_eq!(back.read(None, None).unwrap().height(), 4);
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!("rw".parse::<TableMode>().unwrap(), TableMode::ReadWrite);
        assert_eq!("exists".parse::<TableMode>().unwrap(), TableMode::Exists);
        assert!("x".parse::<TableMode>().is_err());
        assert!(TableMode::Append.is_write_or_delete_mode());
        assert!(!TableMode::Read.is_write_or_delete_mode());
    }

    #[test]
    fn test_data_file_names() {
        assert!(is_data_file("data.0"));
        assert!(is_data_file("1718000000000000000.0"));
        assert!(!is_data_file("data"));
        assert!(!is_data_file("data.x"));
        assert!(!is_data_file("notes.txt"));
    }

    #[test]
    fn test_direct_access_checks_identity() {
        let loc = Location::memory();
        let owner = ab_table(&loc);
        owner.write(rows(22)).unwrap();

        let impostor = Table::builder(&Descriptor::new("other").field("x", 1).named("t"))
            .partition_cols(vec!["a".into(), "b".into()])
            .build(&loc, settings())
            .unwrap();
        assert_eq!(impostor.path(), owner.path());
        assert!(matches!(impostor.read(None, None), Err(Error::IdentityDrift { .. })));
        assert!(matches!(impostor.exists(None), Err(Error::IdentityDrift { .. })));
        assert!(matches!(impostor.delete_(None), Err(Error::IdentityDrift { .. })));
        assert!(matches!(
            impostor.delete_(Some(&only(vec![Filter::equal("b", 22)]))),
            Err(Error::IdentityDrift { .. })
        ));

        assert!(owner.exists(None).unwrap());
        assert_eq!(owner.read(None, None).unwrap().height(), 4);
    }

    #[test]
    fn test_direct_access_checks_layout() {
        let loc = Location::memory();
        ab_table(&loc).write(rows(22)).unwrap();
        let reordered = Table::builder(&Literal::new("t"))
            .partition_cols(vec!["b".into(), "a".into()])
            .build(&loc, settings())
            .unwrap();
        assert!(matches!(reordered.read(None, None), Err(Error::Precondition { .. })));
        assert!(matches!(reordered.delete_(None), Err(Error::Precondition { .. })));
        assert_eq!(ab_table(&loc).read(None, None).unwrap().height(), 4);
    }

    #[test]
    fn test_rejected_write_leaves_schema_open() {
        let table = ab_table(&Location::memory());
        let args = TableArgs {
            partition_values: BTreeMap::from([
                ("a".to_string(), Scalar::Int(1)),
                ("b".to_string(), Scalar::Int(99)),
            ]),
            source: Some(rows(22).into()),
            ..TableArgs::default()
        };
        assert!(matches!(
            table.call(TableMode::Write, args),
            Err(Error::SchemaMismatch { .. })
        ));
        assert_eq!(table.schema(), None);
        assert!(!table.exists(None).unwrap());

        let strings = df!(
            "a" => &[1i64],
            "b" => &[22i64],
            "c" => &["x"],
        )
        .unwrap();
        table.write(strings).unwrap();
        let fixed = table.schema().unwrap();
        assert_eq!(fixed.column("c").unwrap().dtype, ColumnType::String);
    }

    #[test]
    fn test_stale_handle_keeps_stored_config() {
        let loc = Location::memory();
        let early = ab_table(&loc);
        let writer = ab_table(&loc);
        writer.write(rows(22)).unwrap();
        let created = writer.core().config().get().created_on;
        assert!(created.is_some());

        early.append(rows(33)).unwrap();
        let fresh = ab_table(&loc);
        assert_eq!(fresh.core().config().get().created_on, created);
        assert!(fresh.schema().is_some());
        assert_eq!(fresh.read(None, None).unwrap().height(), 8);
    }

    #[test]
    fn test_read_write_batches_returns_stored_rows() {
        let table = ab_table(&Location::memory());
        let partition = BTreeMap::from([
            ("a".to_string(), Scalar::Int(1)),
            ("b".to_string(), Scalar::Int(22)),
        ]);
        let batches: Vec<Result<DataFrame>> = vec![Ok(rows(22)), Ok(rows(22))];
        let first = table
            .read_write(partition.clone(), TableSource::Batches(Box::new(batches.into_iter())))
            .unwrap();
        assert_eq!(first.height(), 8);
        assert_eq!(table.core().fs().list(&table.path().join("a=1/b=22")).unwrap().len(), 2);

        let unused: Vec<Result<DataFrame>> = vec![Ok(rows(22))];
        let second = table
            .read_write(partition, TableSource::Batches(Box::new(unused.into_iter())))
            .unwrap();
        assert_eq!(second.height(), 8);
        assert_eq!(table.core().fs().list(&table.path().join("a=1/b=22")).unwrap().len(), 2);
    }

    #[test]
    fn test_recreated_table_is_byte_identical() {
        let loc = Location::memory();
        let first = ab_table(&loc);
        first.write(rows(22)).unwrap();
        let fs = first.core().fs();
        let data = first.path().join("a=1/b=22/data.0");
        let info = first.core().info().path().to_path_buf();
        let data_bytes = fs.read(&data).unwrap();
        let info_bytes = fs.read(&info).unwrap();

        first.delete(true).unwrap();
        assert!(!fs.exists(&data));

        let second = ab_table(&loc);
        second.write(rows(22)).unwrap();
        assert_eq!(fs.read(&data).unwrap(), data_bytes);
        assert_eq!(fs.read(&info).unwrap(), info_bytes);
    }

    #[test]
    fn test_memory_and_local_agree() {
        let temp = TempDir::new().unwrap();
        for loc in [Location::memory(), Location::local(temp.path())] {
            let table = ab_table(&loc);
            table.write(rows(22)).unwrap();
            assert_eq!(table.read(None, None).unwrap().height(), 4);
        }
    }
}
