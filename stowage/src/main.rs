mod output;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use output::{
    CheckOutput, EntryInfo, ExistsOutput, OutputWriter, ReadOutput, RmOutput, ShowOutput,
    WalkOutput,
};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use stowage_core::{
    Confirm, DEFAULT_MOUNT, Entity, Filter, FilterItem, FiltersList, InfoFile, Location, Progress,
    Settings, WalkItem,
};
use tracing_subscriber::EnvFilter;

/// Stowage - self-describing, hash-verified storage entities
#[derive(Parser)]
#[command(name = "stowage")]
#[command(about = "Inspect and maintain stowage folders, file groups and tables", long_about = None)]
#[command(version)]
struct Cli {
    /// Storage root directory (defaults to STOWAGE_ROOT env var, then the mount)
    #[arg(short, long, global = true)]
    root: Option<PathBuf>,

    /// Settings file (key=value lines)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Named mount from the settings to use as root
    #[arg(long, global = true, default_value = DEFAULT_MOUNT)]
    mount: String,

    /// Output results as JSON
    #[arg(long, global = true)]
    json: bool,

    /// More log output on stderr (-v info, -vv debug)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List entities at the root or inside a folder
    Walk {
        /// Folder path relative to the root
        path: Option<PathBuf>,

        /// Show kind and path of every child
        #[arg(short, long)]
        long: bool,
    },

    /// Print the Info and Config records of an entity
    Show {
        path: PathBuf,
    },

    /// Re-hash a file group against its expected hashes
    Check {
        path: PathBuf,

        /// Check even if no periodic check is due
        #[arg(long)]
        force: bool,
    },

    /// Read rows from a table
    Read {
        path: PathBuf,

        #[command(flatten)]
        filters: FilterArgs,

        /// Comma-separated columns to keep
        #[arg(long, value_delimiter = ',')]
        columns: Option<Vec<String>>,
    },

    /// Check whether a table holds matching rows
    Exists {
        path: PathBuf,

        #[command(flatten)]
        filters: FilterArgs,
    },

    /// Delete an entity, or only table partitions with --data/--filter
    Rm {
        path: PathBuf,

        /// Skip the confirmation prompt
        #[arg(long)]
        force: bool,

        /// Remove all table data but keep the table
        #[arg(long)]
        data: bool,

        #[command(flatten)]
        filters: FilterArgs,
    },
}

#[derive(clap::Args)]
struct FilterArgs {
    /// Filter like `a=1`, `b>=2.5` or `c in [1,2]`; repeated filters are AND-ed
    #[arg(short, long = "filter")]
    filter: Vec<String>,

    /// AND-group like `b=33 & c=9`; groups are OR-ed together
    #[arg(long = "or")]
    or: Vec<String>,
}

impl FilterArgs {
    fn is_empty(&self) -> bool {
        self.filter.is_empty() && self.or.is_empty()
    }

    fn to_list(&self) -> Result<Option<FiltersList>> {
        if self.is_empty() {
            return Ok(None);
        }
        let mut list = FiltersList::default();
        for text in &self.filter {
            let f: Filter = text
                .parse()
                .with_context(|| format!("Invalid filter: {}", text))?;
            list.push(f);
        }
        for text in &self.or {
            let group = text
                .split('&')
                .map(|part| part.trim().parse::<Filter>())
                .collect::<stowage_core::Result<Vec<_>>>()
                .with_context(|| format!("Invalid filter group: {}", text))?;
            list.push(FilterItem::Group(group));
        }
        Ok(Some(list))
    }
}

/// Asks on stderr, reads the answer from stdin.
struct StdinConfirm;

impl Confirm for StdinConfirm {
    fn confirm(&self, prompt: &str) -> bool {
        eprint!("{} [y/N] ", prompt);
        let mut line = String::new();
        io::stdin().read_line(&mut line).is_ok() && matches!(line.trim(), "y" | "Y" | "yes")
    }
}

struct LogProgress;

impl Progress for LogProgress {
    fn advance(&self, label: &str, bytes: u64) {
        tracing::trace!(file = label, bytes, "hashing");
    }

    fn finish(&self, label: &str, total: u64) {
        tracing::debug!(file = label, total, "hashed");
    }
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let out = OutputWriter::new(cli.json);
    if let Err(e) = run(cli, &out) {
        let status = out.fail(&e);
        std::process::exit(i32::from(status));
    }
}

fn run(cli: Cli, out: &OutputWriter) -> Result<()> {
    let settings = match &cli.settings {
        Some(path) => Settings::load(path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))?,
        None => Settings::default(),
    };
    let settings = Arc::new(
        settings
            .with_confirmer(Arc::new(StdinConfirm))
            .with_progress(Arc::new(LogProgress)),
    );

    // Root: --root > STOWAGE_ROOT > named mount
    let base = match cli
        .root
        .or_else(|| std::env::var("STOWAGE_ROOT").ok().map(PathBuf::from))
    {
        Some(dir) => Location::local(dir),
        None => settings
            .mount(&cli.mount)
            .with_context(|| format!("Unknown mount: {}", cli.mount))?,
    };

    match cli.command {
        Commands::Walk { path, long } => cmd_walk(&base, &settings, path.as_deref(), long, out),
        Commands::Show { path } => cmd_show(&base, &settings, &path, out),
        Commands::Check { path, force } => cmd_check(&base, &settings, &path, force, out),
        Commands::Read {
            path,
            filters,
            columns,
        } => cmd_read(&base, &settings, &path, &filters, columns, out),
        Commands::Exists { path, filters } => cmd_exists(&base, &settings, &path, &filters, out),
        Commands::Rm {
            path,
            force,
            data,
            filters,
        } => cmd_rm(&base, &settings, &path, force, data, &filters, out),
    }
}

/// Rebuild the entity whose Info file is `<base>/<rel>.info`.
fn open_entity(base: &Location, rel: &Path, settings: &Arc<Settings>) -> Result<Entity> {
    let mut marker = base.dir().join(rel).into_os_string();
    marker.push(".info");
    let marker = PathBuf::from(marker);
    let record = InfoFile::new(Arc::clone(base.fs()), marker.clone())
        .load()
        .with_context(|| format!("No entity at {}", marker.display()))?;

    let depth = record.group_by.len() + record.name.split('/').count();
    let parent_rel = rel
        .ancestors()
        .nth(depth)
        .with_context(|| format!("Path {} is shorter than entity name {}", rel.display(), record.name))?;
    let parent = if parent_rel.as_os_str().is_empty() {
        base.clone()
    } else {
        base.join(parent_rel)
    };
    Entity::from_record(&parent, record, Arc::clone(settings))
        .with_context(|| format!("Failed to open {}", rel.display()))
}

fn relative(base: &Location, path: &Path) -> String {
    path.strip_prefix(base.dir())
        .unwrap_or(path)
        .display()
        .to_string()
}

fn cmd_walk(
    base: &Location,
    settings: &Arc<Settings>,
    path: Option<&Path>,
    long: bool,
    out: &OutputWriter,
) -> Result<()> {
    let mut entries = Vec::new();
    match path {
        Some(rel) => {
            let Entity::Folder(folder) = open_entity(base, rel, settings)? else {
                bail!("{} is not a folder", rel.display());
            };
            for item in folder.walk(!long) {
                match item.with_context(|| format!("Failed to walk {}", rel.display()))? {
                    WalkItem::Name(name) => entries.push(EntryInfo {
                        name,
                        kind: None,
                        path: None,
                    }),
                    WalkItem::Entity(e) => entries.push(EntryInfo {
                        name: e.name().to_string(),
                        kind: Some(e.kind().to_string()),
                        path: Some(relative(base, e.core().path())),
                    }),
                }
            }
        }
        None => {
            let names = base
                .fs()
                .list(base.dir())
                .with_context(|| format!("Failed to list {}", base.dir().display()))?;
            for marker in names.iter().filter_map(|n| n.strip_suffix(".info")) {
                let e = open_entity(base, Path::new(marker), settings)?;
                entries.push(EntryInfo {
                    name: e.name().to_string(),
                    kind: long.then(|| e.kind().to_string()),
                    path: long.then(|| relative(base, e.core().path())),
                });
            }
        }
    }

    let output = WalkOutput {
        success: true,
        result_code: 0,
        entries: entries.clone(),
    };
    out.emit(&output, || {
        let mut text = String::new();
        for e in &entries {
            match (&e.kind, &e.path) {
                (Some(kind), Some(path)) => {
                    text.push_str(&format!("{:<10} {} ({})\n", kind, e.name, path))
                }
                _ => text.push_str(&format!("{}\n", e.name)),
            }
        }
        if text.is_empty() {
            text.push_str("No entities\n");
        }
        text
    })
}

fn cmd_show(base: &Location, settings: &Arc<Settings>, rel: &Path, out: &OutputWriter) -> Result<()> {
    let entity = open_entity(base, rel, settings)?;
    let core = entity.core();
    let info = serde_json::to_value(core.record())?;
    let config = serde_json::to_value(&*core.config().get())?;
    let output = ShowOutput {
        success: true,
        result_code: 0,
        path: relative(base, core.path()),
        info,
        config,
    };
    out.emit(&output, || {
        format!(
            "{}\n\n[info]\n{}\n\n[config]\n{}\n",
            output.path,
            serde_json::to_string_pretty(&output.info).unwrap_or_default(),
            serde_json::to_string_pretty(&output.config).unwrap_or_default()
        )
    })
}

fn cmd_check(
    base: &Location,
    settings: &Arc<Settings>,
    rel: &Path,
    force: bool,
    out: &OutputWriter,
) -> Result<()> {
    let Entity::FileGroup(group) = open_entity(base, rel, settings)? else {
        bail!("{} is not a file group", rel.display());
    };
    group
        .check(force)
        .with_context(|| format!("Check failed for {}", rel.display()))?;
    let output = CheckOutput {
        success: true,
        result_code: 0,
        name: group.name().to_string(),
        forced: force,
    };
    out.emit(&output, || format!("OK {}\n", output.name))
}

fn cmd_read(
    base: &Location,
    settings: &Arc<Settings>,
    rel: &Path,
    filters: &FilterArgs,
    columns: Option<Vec<String>>,
    out: &OutputWriter,
) -> Result<()> {
    let Entity::Table(table) = open_entity(base, rel, settings)? else {
        bail!("{} is not a table", rel.display());
    };
    let filters = filters.to_list()?;
    let df = table
        .read(filters.as_ref(), columns.as_deref())
        .with_context(|| format!("Failed to read {}", rel.display()))?;
    let output = ReadOutput {
        success: true,
        result_code: 0,
        rows: df.height(),
        columns: df
            .get_column_names()
            .into_iter()
            .map(|c| c.to_string())
            .collect(),
        preview: df.to_string(),
    };
    out.emit(&output, || format!("{}\n", output.preview))
}

fn cmd_exists(
    base: &Location,
    settings: &Arc<Settings>,
    rel: &Path,
    filters: &FilterArgs,
    out: &OutputWriter,
) -> Result<()> {
    let Entity::Table(table) = open_entity(base, rel, settings)? else {
        bail!("{} is not a table", rel.display());
    };
    let filters = filters.to_list()?;
    let exists = table.exists(filters.as_ref())?;
    let output = ExistsOutput {
        success: true,
        result_code: 0,
        exists,
    };
    out.emit(&output, || format!("{}\n", exists))
}

fn cmd_rm(
    base: &Location,
    settings: &Arc<Settings>,
    rel: &Path,
    force: bool,
    data: bool,
    filters: &FilterArgs,
    out: &OutputWriter,
) -> Result<()> {
    let entity = open_entity(base, rel, settings)?;
    let name = entity.name().to_string();

    let partitions = if data || !filters.is_empty() {
        let Entity::Table(table) = &entity else {
            bail!("{} is not a table; --data and filters only apply to tables", rel.display());
        };
        if !force && !settings.confirmer.confirm(&format!("Delete data of table {}?", name)) {
            bail!("Deletion of {} was not confirmed", name);
        }
        let list = filters.to_list()?;
        Some(
            table
                .delete_(list.as_ref())
                .with_context(|| format!("Failed to delete data of {}", rel.display()))?,
        )
    } else {
        entity
            .delete(force)
            .with_context(|| format!("Failed to delete {}", rel.display()))?;
        None
    };

    let output = RmOutput {
        success: true,
        result_code: 0,
        name,
        partitions,
    };
    out.emit(&output, || match output.partitions {
        Some(n) => format!("Removed {} partition(s) from {}\n", n, output.name),
        None => format!("Removed {}\n", output.name),
    })
}
