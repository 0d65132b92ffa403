use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use plugtag_core::backup::BackupManager;
use plugtag_core::config::{FileConfig, Overrides, Settings};
use plugtag_core::diagnose::{diagnose, DiagnoseFilter, DiagnosticsReport};
use plugtag_core::registry::{load_catalog, scan_components};
use plugtag_core::report::{write_json, ApplyReport, Outcome};
use plugtag_core::{apply, ApplyOptions, PluginIdentity, RuleSet, TagMode, TagStore};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(name = "plugtag", version, about = "Organize Logic Pro Audio Unit plugins into categories")]
struct Cli {
    /// Config file (default: <config dir>/plugtag/config.toml)
    #[arg(long, global = true, value_name = "PATH", env = "PLUGTAG_CONFIG")]
    config: Option<PathBuf>,
    /// Logic Pro Tags directory
    #[arg(long, global = true, value_name = "PATH", env = "PLUGTAG_TAGS_DIR")]
    tags_dir: Option<PathBuf>,
    /// Where snapshots are kept
    #[arg(long, global = true, value_name = "PATH", env = "PLUGTAG_BACKUP_DIR")]
    backup_dir: Option<PathBuf>,
    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Categorize plugins (dry run unless --apply)
    Organize(OrganizeArgs),
    /// Explain plugins that end up in the fallback category
    Diagnose(DiagnoseArgs),
    /// Restore the Tags directory from a snapshot
    Restore(RestoreArgs),
    /// List snapshots, most recent first
    Snapshots,
    /// Show categories and tags currently in the store
    Tags(TagsArgs),
}

#[derive(Args)]
struct SourceArgs {
    /// Rule set JSON
    #[arg(long, value_name = "PATH", env = "PLUGTAG_RULES")]
    rules: Option<PathBuf>,
    /// Audio Unit folder to scan (repeatable)
    #[arg(long = "components-dir", value_name = "PATH")]
    components_dirs: Vec<PathBuf>,
    /// Read plugins from a JSON catalog instead of scanning
    #[arg(long, value_name = "PATH")]
    catalog: Option<PathBuf>,
}

#[derive(Args)]
struct OrganizeArgs {
    #[command(flatten)]
    source: SourceArgs,
    /// Write changes (takes a snapshot first)
    #[arg(long)]
    apply: bool,
    /// Add the category to existing tags instead of replacing them
    #[arg(long)]
    merge_tags: bool,
    /// Rewrite the host's category list from the rule set
    #[arg(long)]
    update_categories: bool,
    /// Write the JSON report here
    #[arg(long, value_name = "PATH")]
    report: Option<PathBuf>,
}

#[derive(Args)]
struct DiagnoseArgs {
    #[command(flatten)]
    source: SourceArgs,
    /// Only this vendor (repeatable)
    #[arg(long = "vendor", value_name = "VENDOR")]
    vendors: Vec<String>,
    /// Only plugins without a record in the store
    #[arg(long)]
    missing_only: bool,
    #[arg(long, value_name = "PATH")]
    report: Option<PathBuf>,
}

#[derive(Args)]
struct RestoreArgs {
    /// Most recent snapshot
    #[arg(long, conflicts_with = "snapshot", required_unless_present = "snapshot")]
    latest: bool,
    /// Snapshot id or directory
    #[arg(long, value_name = "ID_OR_PATH")]
    snapshot: Option<String>,
}

#[derive(Args)]
struct TagsArgs {
    /// Include per-record tags
    #[arg(long)]
    records: bool,
    /// Write JSON here instead of stdout
    #[arg(long, value_name = "PATH")]
    output: Option<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .with_writer(std::io::stderr)
        .init();

    let file_config = FileConfig::resolve(cli.config.as_deref())?;
    let source_overrides = match &cli.command {
        Commands::Organize(args) => Some(&args.source),
        Commands::Diagnose(args) => Some(&args.source),
        _ => None,
    };
    let overrides = Overrides {
        tags_dir: cli.tags_dir.clone(),
        backup_dir: cli.backup_dir.clone(),
        rules: source_overrides.and_then(|s| s.rules.clone()),
        components_dirs: source_overrides
            .map(|s| s.components_dirs.clone())
            .unwrap_or_default(),
    };
    let settings = Settings::resolve(overrides, file_config)?;

    match cli.command {
        Commands::Organize(args) => organize(&settings, args),
        Commands::Diagnose(args) => run_diagnose(&settings, args),
        Commands::Restore(args) => restore(&settings, args),
        Commands::Snapshots => list_snapshots(&settings),
        Commands::Tags(args) => show_tags(&settings, args),
    }
}

fn load_identities(settings: &Settings, source: &SourceArgs) -> Result<Vec<PluginIdentity>> {
    let identities = match &source.catalog {
        Some(path) => load_catalog(path)?,
        None => scan_components(&settings.components_dirs),
    };
    info!("Found {} plugin(s)", identities.len());
    Ok(identities)
}

fn organize(settings: &Settings, args: OrganizeArgs) -> Result<()> {
    let rules = RuleSet::load(&settings.rules_path)?;
    let store = TagStore::open(&settings.tags_dir)?;
    let backups = BackupManager::new(&settings.backup_dir);
    let identities = load_identities(settings, &args.source)?;

    let options = ApplyOptions {
        mode: if args.merge_tags {
            TagMode::Merge
        } else {
            TagMode::Replace
        },
        dry_run: !args.apply,
        update_categories: args.update_categories,
    };
    let report = apply(&identities, &rules, &store, &backups, &options)?;

    print_summary(&report);
    if let Some(path) = report_path(settings, args.report, "organize") {
        write_json(&path, &report)?;
        println!("Report: {}", path.display());
    }
    Ok(())
}

fn print_summary(report: &ApplyReport) {
    let s = &report.summary;
    println!("Plugins: {}", s.total);
    println!("Matched: {}  Fallback ({}): {}", s.matched, report.fallback_category, s.unmatched);
    println!("Excluded: {}  No record: {}", s.excluded, s.skipped_no_record);
    println!("Unchanged: {}  Changed: {}", s.unchanged, s.changed);

    for plugin in report.with_outcome(Outcome::Failed) {
        println!(
            "  failed: {} ({})",
            plugin.name,
            plugin.error.as_deref().unwrap_or("unknown error")
        );
    }
    if let Some(update) = &report.category_update {
        if let Some(e) = &update.error {
            println!("Category update failed: {}", e);
        } else if update.changed {
            println!("Categories updated ({})", update.categories.len());
        } else if update.would_change {
            println!("Categories would be updated ({})", update.categories.len());
        }
    }

    if report.dry_run {
        println!("Dry run (no files changed). Use --apply to write changes.");
    } else {
        println!("Written: {}  Failed: {}", s.written, s.failed);
        if let Some(snapshot) = &report.snapshot {
            println!("Snapshot: {}", snapshot.path.display());
        }
    }
}

fn run_diagnose(settings: &Settings, args: DiagnoseArgs) -> Result<()> {
    let rules = RuleSet::load(&settings.rules_path)?;
    let identities = load_identities(settings, &args.source)?;

    let absent_from = if args.missing_only {
        let store = TagStore::open(&settings.tags_dir)?;
        Some(store.record_names()?)
    } else {
        None
    };
    let filter = DiagnoseFilter {
        vendors: args.vendors,
        absent_from,
    };
    let entries = diagnose(&identities, &rules, &filter);

    for entry in &entries {
        println!(
            "{} / {}",
            entry.vendor.as_deref().unwrap_or("-"),
            entry.identity.name
        );
        for note in entry.tiers_checked.iter().filter_map(|c| c.note.as_ref()) {
            println!("    {}", note);
        }
        for miss in &entry.near_misses {
            println!("    {:>3}%  {} -> {}", miss.score, miss.pattern, miss.category);
        }
    }
    println!("Fallback plugins: {}", entries.len());

    if let Some(path) = report_path(settings, args.report, "diagnose") {
        write_json(&path, &DiagnosticsReport::new(&rules, entries))?;
        println!("Report: {}", path.display());
    }
    Ok(())
}

fn restore(settings: &Settings, args: RestoreArgs) -> Result<()> {
    let backups = BackupManager::new(&settings.backup_dir);
    let snapshot = match (args.latest, args.snapshot) {
        (_, Some(id)) => {
            let snapshot = backups.find(&id)?;
            backups.restore(&snapshot, &settings.tags_dir)?;
            snapshot
        }
        (true, None) => backups.restore_latest(&settings.tags_dir)?,
        (false, None) => bail!("pass --latest or --snapshot"),
    };
    println!("Restored {} from {}", settings.tags_dir.display(), snapshot.path.display());
    Ok(())
}

fn list_snapshots(settings: &Settings) -> Result<()> {
    let backups = BackupManager::new(&settings.backup_dir);
    let snapshots = backups.list_snapshots()?;
    if snapshots.is_empty() {
        println!("No snapshots in {}", backups.root().display());
    }
    for snapshot in snapshots {
        let files = match snapshot.manifest()? {
            Some(manifest) => format!("{} files", manifest.files.len()),
            None => "no manifest".to_string(),
        };
        println!("{}  ({})", snapshot.id, files);
    }
    Ok(())
}

fn show_tags(settings: &Settings, args: TagsArgs) -> Result<()> {
    let store = TagStore::open(&settings.tags_dir)?;
    let inventory = store.inventory(args.records)?;
    match args.output {
        Some(path) => {
            write_json(&path, &inventory)?;
            println!("Wrote {}", path.display());
        }
        None => {
            let json = serde_json::to_string_pretty(&inventory).context("Failed to encode inventory")?;
            println!("{}", json);
        }
    }
    Ok(())
}

/// Explicit path, else a timestamped file in the configured report folder.
fn report_path(settings: &Settings, explicit: Option<PathBuf>, kind: &str) -> Option<PathBuf> {
    explicit.or_else(|| {
        settings.report_dir.as_ref().map(|dir| {
            let stamp = chrono::Local::now().format("%Y%m%d%H%M%S");
            dir.join(format!("{}-{}.json", kind, stamp))
        })
    })
}
