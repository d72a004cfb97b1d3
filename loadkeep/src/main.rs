mod output;

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use clap::{Args, Parser, Subcommand};
use loadkeep_core::config::CONFIG_FILE;
use loadkeep_core::{
    BackupEntry, Config, ContentHash, ExtractRequest, IngestPlan, LocationId, Loadout, Node,
    Placement, Synchronizer, flatten, flatten_for,
};
use output::*;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "LOADKEEP_LOG";
const CONFIG_ENV: &str = "LOADKEEP_CONFIG";
const DEFAULT_LOG_FILTER: &str = "warn,loadkeep=info,loadkeep_core=info";

/// Loadkeep - keep game installations in sync with mod loadouts
#[derive(Parser)]
#[command(name = "loadkeep")]
#[command(about = "Mod loadout synchronization backed by a deduplicating content store", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file (defaults to LOADKEEP_CONFIG env var or ./loadkeep.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Verbose logging to stderr (repeat for more)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a starter config and create the data directories
    Init {
        /// Installation id to configure
        #[arg(long)]
        installation: Option<String>,

        /// Installation location as NAME=PATH (repeatable)
        #[arg(long = "location", value_parser = parse_location)]
        locations: Vec<(String, PathBuf)>,

        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },

    /// Record the current, unmodified contents of an installation
    Index {
        installation: String,
    },

    /// Store files in the content store (`-` reads stdin)
    Backup {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Write stored content to stdout
    Cat {
        hash: String,
    },

    /// Write stored content to a file
    Extract {
        hash: String,
        dest: PathBuf,
    },

    /// Delete stored content no loadout or disk state references
    Gc {
        /// Show what would be deleted without deleting
        #[arg(long)]
        dry_run: bool,
    },

    /// Manage loadouts
    #[command(subcommand)]
    Loadout(LoadoutCommands),

    /// Manage mods within a loadout
    #[command(subcommand)]
    Mod(ModCommands),

    /// Show what apply (or ingest) would do
    Plan {
        loadout: String,

        /// Plan an ingest instead of an apply
        #[arg(long)]
        ingest: bool,
    },

    /// Make the installation match the loadout
    Apply {
        loadout: String,
    },

    /// Record changes made on disk into the loadout
    Ingest {
        loadout: String,
    },

    /// Ingest changes if needed, then apply
    Sync {
        loadout: String,
    },
}

#[derive(Subcommand)]
enum LoadoutCommands {
    /// Create a loadout from the indexed game files
    Create {
        name: String,

        /// Installation id (optional when only one is configured)
        #[arg(long)]
        installation: Option<String>,
    },

    /// List all loadouts
    List,

    /// Show the groups of a loadout in priority order
    Show {
        loadout: String,
    },
}

#[derive(Subcommand)]
enum ModCommands {
    /// Import an unpacked mod directory as a new group
    Import {
        loadout: String,
        dir: PathBuf,

        /// Group name (defaults to the directory name)
        #[arg(long)]
        name: Option<String>,

        /// Location the directory maps onto
        #[arg(long, default_value = "game")]
        location: String,
    },

    /// Enable a group
    Enable(GroupArgs),

    /// Disable a group
    Disable(GroupArgs),

    /// Move a group before or after another one
    Move {
        #[command(flatten)]
        target: GroupArgs,

        /// Place directly before this group
        #[arg(long, conflicts_with = "after", required_unless_present = "after")]
        before: Option<String>,

        /// Place directly after this group
        #[arg(long)]
        after: Option<String>,
    },

    /// Remove a group and its files from the loadout
    Remove(GroupArgs),
}

#[derive(Args)]
struct GroupArgs {
    loadout: String,
    group: String,
}

struct App {
    config_path: PathBuf,
    out: OutputWriter,
}

impl App {
    fn config(&self) -> Result<Config> {
        Config::load(&self.config_path)
            .with_context(|| format!("Failed to load config from {}", self.config_path.display()))
    }

    fn open(&self) -> Result<Synchronizer> {
        let config = self.config()?;
        Synchronizer::open(config).with_context(|| {
            format!("Failed to open loadkeep with {}", self.config_path.display())
        })
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    // Config path: CLI arg > LOADKEEP_CONFIG env var > ./loadkeep.toml
    let config_path = cli
        .config
        .or_else(|| std::env::var(CONFIG_ENV).ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(CONFIG_FILE));
    let app = App {
        config_path,
        out: OutputWriter::new(cli.json),
    };

    match run(&app, cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            let code = exit_code(&error);
            app.out.write_error(&error, code);
            ExitCode::from(code)
        }
    }
}

fn init_logging(verbose: u8) {
    let filter = match verbose {
        0 => EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        1 => EnvFilter::new("warn,loadkeep=debug,loadkeep_core=debug"),
        _ => EnvFilter::new("debug,loadkeep=trace,loadkeep_core=trace"),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn exit_code(error: &anyhow::Error) -> u8 {
    let conflict = error.chain().any(|cause| {
        cause
            .downcast_ref::<loadkeep_core::Error>()
            .is_some_and(|e| e.is_conflict())
    });
    if conflict { EXIT_CONFLICT } else { EXIT_FAILURE }
}

fn run(app: &App, command: Commands) -> Result<()> {
    match command {
        Commands::Init {
            installation,
            locations,
            force,
        } => cmd_init(app, installation, locations, force),
        Commands::Index { installation } => cmd_index(app, &installation),
        Commands::Backup { paths } => cmd_backup(app, &paths),
        Commands::Cat { hash } => cmd_cat(app, &hash),
        Commands::Extract { hash, dest } => cmd_extract(app, &hash, &dest),
        Commands::Gc { dry_run } => cmd_gc(app, dry_run),
        Commands::Loadout(loadout_cmd) => match loadout_cmd {
            LoadoutCommands::Create { name, installation } => {
                cmd_loadout_create(app, &name, installation)
            }
            LoadoutCommands::List => cmd_loadout_list(app),
            LoadoutCommands::Show { loadout } => cmd_loadout_show(app, &loadout),
        },
        Commands::Mod(mod_cmd) => match mod_cmd {
            ModCommands::Import {
                loadout,
                dir,
                name,
                location,
            } => cmd_mod_import(app, &loadout, &dir, name, &location),
            ModCommands::Enable(args) => cmd_mod_toggle(app, &args, true),
            ModCommands::Disable(args) => cmd_mod_toggle(app, &args, false),
            ModCommands::Move {
                target,
                before,
                after,
            } => {
                let (anchor, placement) = match (before, after) {
                    (Some(anchor), _) => (anchor, Placement::Before),
                    (None, Some(anchor)) => (anchor, Placement::After),
                    (None, None) => anyhow::bail!("Either --before or --after is required"),
                };
                cmd_mod_move(app, &target, &anchor, placement)
            }
            ModCommands::Remove(args) => cmd_mod_remove(app, &args),
        },
        Commands::Plan { loadout, ingest } => cmd_plan(app, &loadout, ingest),
        Commands::Apply { loadout } => cmd_apply(app, &loadout),
        Commands::Ingest { loadout } => cmd_ingest(app, &loadout),
        Commands::Sync { loadout } => cmd_sync(app, &loadout),
    }
}

fn parse_location(s: &str) -> std::result::Result<(String, PathBuf), String> {
    let (name, path) = s
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=PATH, got {:?}", s))?;
    if name.is_empty() || path.is_empty() {
        return Err(format!("expected NAME=PATH, got {:?}", s));
    }
    Ok((name.to_string(), PathBuf::from(path)))
}

/// Quote a string for TOML. JSON string escapes are valid TOML basic strings.
fn toml_string(s: &str) -> Result<String> {
    Ok(serde_json::to_string(s)?)
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn cmd_init(
    app: &App,
    installation: Option<String>,
    locations: Vec<(String, PathBuf)>,
    force: bool,
) -> Result<()> {
    let path = &app.config_path;
    let written = force || !path.exists();
    if written {
        let base = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => std::path::absolute(parent),
            _ => std::env::current_dir(),
        }
        .with_context(|| format!("Failed to resolve the directory of {}", path.display()))?;
        let data_dir = base.join("loadkeep-data");

        let mut text = String::new();
        text.push_str(&format!("data_dir = {}\n", toml_string(&data_dir.to_string_lossy())?));
        text.push_str(&format!(
            "storage_locations = [{}]\n",
            toml_string(&data_dir.join("archives").to_string_lossy())?
        ));
        text.push_str("\n[container]\nchunk_size = 1048576\ncompression_level = 3\nmethod = \"zstd\"\n");

        if let Some(id) = &installation {
            anyhow::ensure!(!locations.is_empty(), "--installation needs at least one --location");
            text.push_str(&format!("\n[[installations]]\nid = {}\nignore = []\n\n", toml_string(id)?));
            text.push_str("[installations.locations]\n");
            for (name, root) in &locations {
                let root = std::path::absolute(root)
                    .with_context(|| format!("Failed to resolve {}", root.display()))?;
                text.push_str(&format!(
                    "{} = {}\n",
                    toml_string(name)?,
                    toml_string(&root.to_string_lossy())?
                ));
            }
        } else if !locations.is_empty() {
            anyhow::bail!("--location requires --installation");
        }

        Config::parse(&text).with_context(|| "Generated config is invalid")?;
        std::fs::write(path, text)
            .with_context(|| format!("Failed to write config to {}", path.display()))?;
    }

    let sync = app.open()?;
    let data_dir = sync.config().data_dir.display().to_string();
    let output = InitOutput {
        success: true,
        result_code: EXIT_OK,
        config: path.display().to_string(),
        data_dir: data_dir.clone(),
        written,
    };
    app.out.write(&output, || {
        if written {
            format!("Wrote {}\nData directory: {}\n", path.display(), data_dir)
        } else {
            format!("Config {} already exists\nData directory: {}\n", path.display(), data_dir)
        }
    })
}

fn cmd_index(app: &App, installation: &str) -> Result<()> {
    let sync = app.open()?;
    let report = sync
        .index_game(installation)
        .with_context(|| format!("Failed to index installation {}", installation))?;

    let output = IndexOutput {
        success: true,
        result_code: EXIT_OK,
        installation: report.installation.clone(),
        generation: report.generation,
        files: report.files,
        bytes: report.bytes,
        stored: report.stored,
    };
    app.out.write(&output, || {
        format!(
            "Indexed {}: {} files, {} ({} newly stored), generation {}\n",
            report.installation,
            report.files,
            format_bytes(report.bytes),
            report.stored,
            report.generation
        )
    })
}

fn cmd_backup(app: &App, paths: &[PathBuf]) -> Result<()> {
    let sync = app.open()?;

    let mut entries = Vec::with_capacity(paths.len());
    let mut files = Vec::with_capacity(paths.len());
    for path in paths {
        let entry = if path.as_os_str() == "-" {
            if atty::is(atty::Stream::Stdin) {
                anyhow::bail!("Refusing to read content from a terminal; pipe data into `backup -`");
            }
            let mut data = Vec::new();
            io::stdin()
                .lock()
                .read_to_end(&mut data)
                .with_context(|| "Failed to read stdin")?;
            BackupEntry::from_bytes(data)
        } else {
            if path.is_dir() {
                anyhow::bail!(
                    "{} is a directory; use `loadkeep mod import` for mod folders",
                    path.display()
                );
            }
            BackupEntry::from_path(path)
                .with_context(|| format!("Failed to read {}", path.display()))?
        };
        files.push(BackedUpFile {
            hash: entry.hash,
            size: entry.size,
            path: path.display().to_string(),
        });
        entries.push(entry);
    }

    let report = sync
        .backup_files(entries)
        .with_context(|| "Failed to back up files")?;

    let output = BackupOutput {
        success: true,
        result_code: EXIT_OK,
        files: files.clone(),
        stored: report.stored.len(),
        container: report.container.clone(),
    };
    app.out.write(&output, || {
        let mut text = String::new();
        for file in &files {
            text.push_str(&format!("{} {}\n", file.hash, file.path));
        }
        if let Some(container) = &report.container {
            text.push_str(&format!("Stored {} new in {}\n", report.stored.len(), container));
        }
        text
    })
}

fn parse_hash(hash: &str) -> Result<ContentHash> {
    ContentHash::from_hex(hash).with_context(|| format!("Invalid hash: {}", hash))
}

fn cmd_cat(app: &App, hash_str: &str) -> Result<()> {
    let sync = app.open()?;
    let hash = parse_hash(hash_str)?;

    let mut stream = sync
        .store()
        .get_file_stream(&hash)
        .with_context(|| format!("Failed to open {}", hash))?;
    let stdout = io::stdout();
    let mut handle = stdout.lock();
    io::copy(&mut stream, &mut handle).with_context(|| format!("Failed to output {}", hash))?;

    Ok(())
}

fn cmd_extract(app: &App, hash_str: &str, dest: &Path) -> Result<()> {
    let sync = app.open()?;
    let hash = parse_hash(hash_str)?;

    sync.store()
        .extract_files(&[ExtractRequest::new(hash, dest)], &sync.cancellation_token())
        .with_context(|| format!("Failed to extract {} to {}", hash, dest.display()))?;

    let output = ExtractOutput {
        success: true,
        result_code: EXIT_OK,
        hash,
        destination: dest.display().to_string(),
    };
    app.out
        .write(&output, || format!("Extracted {} to {}\n", hash, dest.display()))
}

fn cmd_gc(app: &App, dry_run: bool) -> Result<()> {
    let sync = app.open()?;
    let stats = sync
        .gc(dry_run)
        .with_context(|| "Failed to run garbage collection")?;

    let output = GcOutput {
        success: true,
        result_code: EXIT_OK,
        dry_run,
        containers_deleted: stats.containers_deleted,
        entries_retracted: stats.entries_retracted,
        bytes_freed: stats.bytes_freed,
        stale_temp_files: stats.stale_temp_files,
    };
    app.out.write(&output, || {
        if dry_run {
            format!(
                "Dry run - nothing deleted\nWould delete {} containers\nWould free {}\n",
                stats.containers_deleted,
                format_bytes(stats.bytes_freed)
            )
        } else {
            format!(
                "Deleted {} containers\nFreed {}\n",
                stats.containers_deleted,
                format_bytes(stats.bytes_freed)
            )
        }
    })
}

fn loadout_info(loadout: &Loadout) -> LoadoutInfo {
    LoadoutInfo {
        id: loadout.id.clone(),
        name: loadout.name.clone(),
        installation: loadout.installation.clone(),
        revision: loadout.revision,
        groups: loadout.groups().len(),
        files: loadout.files().len(),
    }
}

fn find_loadout(sync: &Synchronizer, id_or_name: &str) -> Result<Loadout> {
    sync.loadouts()
        .find(id_or_name)
        .with_context(|| format!("Failed to find loadout {}", id_or_name))
}

fn cmd_loadout_create(app: &App, name: &str, installation: Option<String>) -> Result<()> {
    let sync = app.open()?;
    let installation = match installation {
        Some(id) => id,
        None => {
            let mut ids = sync.installations().map(|i| i.id().to_string());
            match (ids.next(), ids.next()) {
                (Some(id), None) => id,
                (None, _) => anyhow::bail!("No installations configured"),
                (Some(_), Some(_)) => anyhow::bail!("Several installations configured; pass --installation"),
            }
        }
    };

    let loadout = sync
        .create_loadout(name, &installation)
        .with_context(|| format!("Failed to create loadout {}", name))?;

    let output = LoadoutCreateOutput {
        success: true,
        result_code: EXIT_OK,
        loadout: loadout_info(&loadout),
    };
    app.out.write(&output, || {
        format!(
            "Created loadout {} ({}) for {} with {} game files\n",
            loadout.name,
            loadout.id,
            loadout.installation,
            loadout.files().len()
        )
    })
}

fn cmd_loadout_list(app: &App) -> Result<()> {
    let sync = app.open()?;
    let loadouts: Vec<LoadoutInfo> = sync
        .loadouts()
        .list()
        .with_context(|| "Failed to list loadouts")?
        .iter()
        .map(loadout_info)
        .collect();

    let output = LoadoutListOutput {
        success: true,
        result_code: EXIT_OK,
        loadouts: loadouts.clone(),
    };
    app.out.write(&output, || {
        if loadouts.is_empty() {
            return "No loadouts (use 'loadkeep loadout create' to create one)\n".to_string();
        }
        loadouts
            .iter()
            .map(|l| {
                format!(
                    "{} {} [{}] rev {}, {} groups\n",
                    l.id, l.name, l.installation, l.revision, l.groups
                )
            })
            .collect()
    })
}

fn cmd_loadout_show(app: &App, id_or_name: &str) -> Result<()> {
    let sync = app.open()?;
    let loadout = find_loadout(&sync, id_or_name)?;

    let mut groups = Vec::new();
    for (id, group) in loadout.groups_by_priority() {
        let collection = loadout.collection(group.collection)?;
        let files = loadout
            .items_of(id)
            .map(|(item, _)| loadout.files_of(item).count())
            .sum();
        groups.push(GroupInfo {
            id,
            name: group.name.clone(),
            collection: collection.name.clone(),
            kind: group.kind,
            priority: group.priority.0,
            enabled: group.enabled,
            active: loadout.is_group_active(id),
            files,
        });
    }

    let flat = match sync.installation(&loadout.installation) {
        Ok(installation) => flatten_for(&loadout, installation),
        Err(_) => flatten(&loadout),
    }
    .with_context(|| format!("Failed to resolve loadout {}", loadout.name))?;
    let group_name = |id| loadout.group(id).map(|g| g.name.clone());
    let mut conflicts = Vec::new();
    for (path, claimants) in flat.conflicts() {
        if let Some((winner, losers)) = claimants.split_last() {
            conflicts.push(PathConflict {
                path: path.clone(),
                winner: group_name(*winner)?,
                losers: losers.iter().map(|g| group_name(*g)).collect::<loadkeep_core::Result<_>>()?,
            });
        }
    }

    let output = LoadoutShowOutput {
        success: true,
        result_code: EXIT_OK,
        loadout: loadout_info(&loadout),
        group_list: groups.clone(),
        conflicts: conflicts.clone(),
    };
    app.out.write(&output, || {
        let mut text = format!(
            "{} ({}) installation {}, revision {}\n",
            loadout.name, loadout.id, loadout.installation, loadout.revision
        );
        for group in &groups {
            let mark = match (group.enabled, group.active) {
                (true, true) => "x",
                (true, false) => "~",
                (false, _) => " ",
            };
            text.push_str(&format!(
                "  {:>3} [{}] {:<32} {:<10} {} files\n",
                group.priority,
                mark,
                group.name,
                group.kind.as_str(),
                group.files
            ));
        }
        if !conflicts.is_empty() {
            text.push_str("Conflicts:\n");
            for conflict in &conflicts {
                text.push_str(&format!(
                    "  {}: {} wins over {}\n",
                    conflict.path,
                    conflict.winner,
                    conflict.losers.join(", ")
                ));
            }
        }
        text
    })
}

fn cmd_mod_import(
    app: &App,
    id_or_name: &str,
    dir: &Path,
    name: Option<String>,
    location: &str,
) -> Result<()> {
    let sync = app.open()?;
    let mut loadout = find_loadout(&sync, id_or_name)?;
    let name = match name {
        Some(name) => name,
        None => dir
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .with_context(|| format!("Cannot derive a group name from {}", dir.display()))?,
    };
    let location = LocationId::new(location)?;
    sync.installation(&loadout.installation)?.root(&location)?;

    let report = sync
        .import_mod(&mut loadout, &name, dir, &location)
        .with_context(|| format!("Failed to import {} into {}", dir.display(), loadout.name))?;

    let output = ModImportOutput {
        success: true,
        result_code: EXIT_OK,
        loadout: loadout.id.clone(),
        group: report.group,
        name: name.clone(),
        files: report.files,
        bytes: report.bytes,
        stored: report.stored,
        revision: loadout.revision,
    };
    app.out.write(&output, || {
        format!(
            "Imported {} into {}: {} files, {} ({} newly stored)\n",
            name,
            loadout.name,
            report.files,
            format_bytes(report.bytes),
            report.stored
        )
    })
}

/// Load a loadout, change one group, save, and report.
fn change_group(
    app: &App,
    args: &GroupArgs,
    change: &str,
    apply: impl FnOnce(&mut Loadout, loadkeep_core::GroupId) -> loadkeep_core::Result<()>,
) -> Result<()> {
    let sync = app.open()?;
    let mut loadout = find_loadout(&sync, &args.loadout)?;
    let group = loadout
        .find_group(&args.group)
        .with_context(|| format!("No group named {} in loadout {}", args.group, loadout.name))?;
    apply(&mut loadout, group)
        .with_context(|| format!("Failed to {} group {}", change, args.group))?;
    sync.loadouts()
        .save(&mut loadout)
        .with_context(|| format!("Failed to save loadout {}", loadout.name))?;

    let output = ModChangeOutput {
        success: true,
        result_code: EXIT_OK,
        loadout: loadout.id.clone(),
        group: args.group.clone(),
        change: change.to_string(),
        revision: loadout.revision,
    };
    app.out.write(&output, || {
        format!(
            "{}: {} {} (revision {})\n",
            loadout.name, change, args.group, loadout.revision
        )
    })
}

fn cmd_mod_toggle(app: &App, args: &GroupArgs, enabled: bool) -> Result<()> {
    let change = if enabled { "enable" } else { "disable" };
    change_group(app, args, change, |loadout, group| {
        loadout.set_enabled(Node::Group(group), enabled)
    })
}

fn cmd_mod_move(app: &App, args: &GroupArgs, anchor: &str, placement: Placement) -> Result<()> {
    let change = match placement {
        Placement::Before => format!("move before {}", anchor),
        Placement::After => format!("move after {}", anchor),
    };
    change_group(app, args, &change, |loadout, group| {
        let anchor = loadout
            .find_group(anchor)
            .ok_or_else(|| loadkeep_core::Error::unknown_item("group", anchor))?;
        loadout.move_group(group, anchor, placement)
    })
}

fn cmd_mod_remove(app: &App, args: &GroupArgs) -> Result<()> {
    change_group(app, args, "remove", |loadout, group| loadout.remove_groups(&[group]))
}

fn ingest_plan_text(plan: &IngestPlan) -> String {
    if plan.is_empty() {
        return "Nothing to ingest\n".to_string();
    }
    let mut text = String::new();
    for action in &plan.actions {
        text.push_str(&format!("  {:<20} {}\n", action.name(), action.path()));
    }
    text
}

fn cmd_plan(app: &App, id_or_name: &str, ingest: bool) -> Result<()> {
    let sync = app.open()?;
    let loadout = find_loadout(&sync, id_or_name)?;

    if ingest {
        let plan = sync
            .plan_ingest(&loadout)
            .with_context(|| format!("Failed to plan ingest for {}", loadout.name))?;
        let output = PlanOutput {
            success: true,
            result_code: EXIT_OK,
            loadout: loadout.id.clone(),
            mode: "ingest".to_string(),
            actions: plan.actions.clone(),
            conflicts: Vec::new(),
        };
        return app.out.write(&output, || ingest_plan_text(&plan));
    }

    let plan = sync
        .plan_apply(&loadout)
        .with_context(|| format!("Failed to plan apply for {}", loadout.name))?;
    let output = PlanOutput {
        success: true,
        result_code: EXIT_OK,
        loadout: loadout.id.clone(),
        mode: "apply".to_string(),
        actions: plan.actions.clone(),
        conflicts: plan.conflicts.clone(),
    };
    app.out.write(&output, || {
        let mut text = String::new();
        if plan.is_empty() && !plan.has_conflicts() {
            text.push_str("Nothing to do\n");
        }
        for action in &plan.actions {
            text.push_str(&format!("  {:<20} {}\n", action.name(), action.path()));
        }
        if plan.has_conflicts() {
            text.push_str(&format!(
                "{} paths changed on disk; run 'loadkeep ingest' or 'loadkeep sync' first:\n",
                plan.conflicts.len()
            ));
            for path in &plan.conflicts {
                text.push_str(&format!("  {}\n", path));
            }
        }
        text
    })
}

fn apply_text(name: &str, info: &ApplyInfo) -> String {
    format!(
        "Applied {}: {} extracted, {} deleted, {} backed up, {} directories removed (generation {})\n",
        name, info.extracted, info.deleted, info.backed_up, info.removed_dirs, info.generation
    )
}

fn ingest_text(name: &str, info: &IngestInfo) -> String {
    format!(
        "Ingested into {}: {} created, {} removed, {} backed up (revision {})\n",
        name, info.created, info.removed, info.backed_up, info.revision
    )
}

fn cmd_apply(app: &App, id_or_name: &str) -> Result<()> {
    let sync = app.open()?;
    let loadout = find_loadout(&sync, id_or_name)?;
    let report = sync
        .apply(&loadout)
        .with_context(|| format!("Failed to apply loadout {}", loadout.name))?;

    let output = ApplyOutput {
        success: true,
        result_code: EXIT_OK,
        loadout: loadout.id.clone(),
        finished_at: now(),
        applied: ApplyInfo::from(&report),
    };
    app.out.write(&output, || apply_text(&loadout.name, &output.applied))
}

fn cmd_ingest(app: &App, id_or_name: &str) -> Result<()> {
    let sync = app.open()?;
    let mut loadout = find_loadout(&sync, id_or_name)?;
    let report = sync
        .ingest(&mut loadout)
        .with_context(|| format!("Failed to ingest into loadout {}", loadout.name))?;

    let output = IngestOutput {
        success: true,
        result_code: EXIT_OK,
        loadout: loadout.id.clone(),
        finished_at: now(),
        ingested: IngestInfo::from(&report),
    };
    app.out.write(&output, || ingest_text(&loadout.name, &output.ingested))
}

fn cmd_sync(app: &App, id_or_name: &str) -> Result<()> {
    let sync = app.open()?;
    let mut loadout = find_loadout(&sync, id_or_name)?;
    let report = sync
        .synchronize(&mut loadout)
        .with_context(|| format!("Failed to synchronize loadout {}", loadout.name))?;

    let output = SyncOutput {
        success: true,
        result_code: EXIT_OK,
        loadout: loadout.id.clone(),
        finished_at: now(),
        ingested: report.ingested.as_ref().map(IngestInfo::from),
        applied: ApplyInfo::from(&report.applied),
    };
    app.out.write(&output, || {
        let mut text = String::new();
        if let Some(ingested) = &output.ingested {
            text.push_str(&ingest_text(&loadout.name, ingested));
        }
        text.push_str(&apply_text(&loadout.name, &output.applied));
        text
    })
}
