//! # Vaultkeeper CLI
//!
//! Command-line front end for the vaultkeeper backup engine.
//!
//! ## Usage
//! ```bash
//! # Create a vault backed by a local disk with 50 GiB of room
//! vaultkeeper init --local /mnt/backup --capacity 50G --password hunter2
//!
//! # Back up a directory, then see what changed since
//! vaultkeeper backup ~/docs --progress
//! vaultkeeper estimate ~/docs
//!
//! # Restore a directory as it was two days ago
//! vaultkeeper restore ~/docs --to /tmp/restored --ago 2days
//!
//! # Look through history
//! vaultkeeper history ~/docs/notes.txt
//! vaultkeeper ls ~/docs --as-of "2026-01-01 12:00:00"
//! ```
//!
//! The password can also be given through `VAULTKEEPER_PASSWORD`.

use anyhow::{bail, Context};
use chrono::{DateTime, Local, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};
use colored::*;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;
use vaultkeeper::progress::SilentProgress;
use vaultkeeper::store::{LocalDiskSettings, NoopSettings};
use vaultkeeper::utils::format_bytes;
use vaultkeeper::{
    BackupPhase, BackupSpecification, CompressionStrategy, ProgressSink, RestoreSpecification, Revision,
    StoreRegistry, StoreSettings, Vault, VaultBuilder, VaultConfiguration, VaultError,
};

const PASSWORD_VARIABLE: &str = "VAULTKEEPER_PASSWORD";

/// Vaultkeeper CLI - versioned, encrypted backups
#[derive(Parser)]
#[command(name = "vaultkeeper")]
#[command(version)]
#[command(about = "Versioned, encrypted backups over local disks and mailboxes")]
#[command(long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(short, long, global = true, default_value = "vaultkeeper.json")]
    config: PathBuf,

    /// Index file (defaults to the configuration path with an .idx extension)
    #[arg(short, long, global = true)]
    index: Option<PathBuf>,

    /// Vault password (or set VAULTKEEPER_PASSWORD)
    #[arg(short, long, global = true)]
    password: Option<String>,

    /// Compression strategy for new content
    #[arg(long, global = true, value_enum, default_value = "adaptive")]
    compression: CompressionMode,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new vault configuration
    Init {
        /// Directory for a local disk store
        #[arg(long)]
        local: Option<PathBuf>,

        /// Capacity of the local disk store (e.g. 500M, 20G)
        #[arg(long, default_value = "10G", value_parser = parse_size)]
        capacity: u64,

        /// Shard levels of the local disk store (1-3)
        #[arg(long, default_value = "2")]
        fan_out: u8,

        /// Add a store that discards everything (for dry runs)
        #[arg(long)]
        noop: bool,
    },

    /// Back up files and directories
    #[command(alias = "bk")]
    Backup {
        #[command(flatten)]
        selection: SelectionArgs,

        /// Show progress
        #[arg(long)]
        progress: bool,
    },

    /// Show what a backup would transfer
    Estimate {
        #[command(flatten)]
        selection: SelectionArgs,
    },

    /// Restore files and directories
    #[command(alias = "rs")]
    Restore {
        /// Paths as they were backed up
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Directory to restore into
        #[arg(short, long, default_value = ".")]
        to: PathBuf,

        /// Restore as of this date (RFC 3339, e.g. "2026-01-01 12:00:00")
        #[arg(long, conflicts_with = "ago")]
        as_of: Option<String>,

        /// Restore as of this long ago (e.g. "2days", "6h")
        #[arg(long)]
        ago: Option<String>,

        /// Replace existing files instead of restoring next to them
        #[arg(long)]
        overwrite: bool,

        /// Show progress
        #[arg(long)]
        progress: bool,
    },

    /// Show every revision of a path
    History {
        /// Path as it was backed up
        path: PathBuf,
    },

    /// List a backed-up directory
    Ls {
        /// Directory as it was backed up
        path: PathBuf,

        /// List as of this date
        #[arg(long)]
        as_of: Option<String>,
    },

    /// Free store space by pruning old revisions
    Reclaim {
        /// Bytes to free (e.g. 1G)
        #[arg(value_parser = parse_size)]
        bytes: u64,
    },

    /// Run store housekeeping
    Maintain,

    /// Rebuild the index from the last backed-up copy
    Recover,

    /// Change the vault password
    Passwd {
        /// New password
        new_password: String,
    },
}

#[derive(Args)]
struct SelectionArgs {
    /// Files and directories to back up
    #[arg(required = true)]
    paths: Vec<PathBuf>,

    /// Paths to leave out
    #[arg(short, long)]
    exclude: Vec<PathBuf>,

    /// Only back up files matching these globs
    #[arg(long)]
    include_glob: Vec<String>,

    /// Skip files matching these globs
    #[arg(long)]
    exclude_glob: Vec<String>,

    /// Skip files larger than this (e.g. 100M)
    #[arg(long, value_parser = parse_size)]
    max_size: Option<u64>,

    /// Back up every selected file, changed or not
    #[arg(long)]
    all: bool,

    /// Include hidden files
    #[arg(long)]
    hidden: bool,
}

impl SelectionArgs {
    fn specification(&self) -> BackupSpecification {
        let mut spec = BackupSpecification::new()
            .only_changed(!self.all)
            .skip_hidden(!self.hidden);
        for path in &self.paths {
            spec = spec.include(path);
        }
        for path in &self.exclude {
            spec = spec.exclude(path);
        }
        for glob in &self.include_glob {
            spec = spec.include_glob(glob);
        }
        for glob in &self.exclude_glob {
            spec = spec.exclude_glob(glob);
        }
        if let Some(max) = self.max_size {
            spec = spec.max_file_size(max);
        }
        spec
    }
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
enum CompressionMode {
    None,
    Fast,
    Adaptive,
}

impl CompressionMode {
    fn strategy(self) -> CompressionStrategy {
        match self {
            CompressionMode::None => CompressionStrategy::None,
            CompressionMode::Fast => CompressionStrategy::Fast,
            CompressionMode::Adaptive => CompressionStrategy::Adaptive {
                min_size: 4096,
                skip_extensions: ["jpg", "jpeg", "png", "gif", "mp4", "mp3", "zip", "gz", "bz2", "7z", "rar"]
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
            },
        }
    }
}

/// Progress bar over the bytes of a backup or restore
struct BarProgress {
    bar: ProgressBar,
}

impl BarProgress {
    fn new(total_bytes: u64) -> Self {
        let bar = ProgressBar::new(total_bytes);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );
        bar.enable_steady_tick(Duration::from_millis(100));
        Self { bar }
    }
}

impl ProgressSink for BarProgress {
    fn will_process_file(&self, path: &Path) -> bool {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.bar.set_message(name);
        true
    }

    fn file_progress(&self, _path: &Path, bytes: u64) -> bool {
        self.bar.inc(bytes);
        true
    }

    fn phase_changed(&self, phase: BackupPhase) {
        if phase == BackupPhase::ReclaimingSpace {
            self.bar.println(format!("{} Making room on the stores", "→".yellow()));
        }
    }

    fn operation_did_end(&self, _error: Option<&VaultError>, was_canceled: bool) {
        if was_canceled {
            self.bar.abandon_with_message("canceled");
        } else {
            self.bar.finish_and_clear();
        }
    }
}

fn main() {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("vaultkeeper=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();

    if std::env::var("NO_COLOR").is_ok() {
        colored::control::set_override(false);
    }

    if let Err(e) = run(cli) {
        let message = match e.downcast_ref::<VaultError>() {
            Some(vault_error) => vault_error.user_message(),
            None => format!("{e:#}"),
        };
        eprintln!("{}: {}", "Error".red().bold(), message);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let password = cli
        .password
        .clone()
        .or_else(|| std::env::var(PASSWORD_VARIABLE).ok());
    let index = cli
        .index
        .clone()
        .unwrap_or_else(|| cli.config.with_extension("idx"));

    if let Commands::Init {
        local,
        capacity,
        fan_out,
        noop,
    } = &cli.command
    {
        return cmd_init(&cli.config, password.as_deref(), local.as_deref(), *capacity, *fan_out, *noop);
    }

    let config = Arc::new(
        VaultConfiguration::load(&cli.config, password.as_deref())
            .with_context(|| format!("cannot open vault configuration {}", cli.config.display()))?,
    );
    let vault = VaultBuilder::new(&index, config)
        .compression(cli.compression.strategy())
        .stores_from_registry(StoreRegistry::with_defaults())
        .build()?;

    let result = match cli.command {
        Commands::Init { .. } => Ok(()),
        Commands::Backup { selection, progress } => cmd_backup(&vault, &selection, progress),
        Commands::Estimate { selection } => cmd_estimate(&vault, &selection),
        Commands::Restore {
            paths,
            to,
            as_of,
            ago,
            overwrite,
            progress,
        } => cmd_restore(&vault, paths, to, as_of, ago, overwrite, progress),
        Commands::History { path } => cmd_history(&vault, &path),
        Commands::Ls { path, as_of } => cmd_ls(&vault, &path, as_of),
        Commands::Reclaim { bytes } => cmd_reclaim(&vault, bytes),
        Commands::Maintain => cmd_maintain(&vault),
        Commands::Recover => cmd_recover(&vault),
        Commands::Passwd { new_password } => cmd_passwd(&vault, &new_password),
    };
    vault.shutdown()?;
    result
}

/// Create the configuration file with its first stores
fn cmd_init(
    config_path: &Path,
    password: Option<&str>,
    local: Option<&Path>,
    capacity: u64,
    fan_out: u8,
    noop: bool,
) -> anyhow::Result<()> {
    if local.is_none() && !noop {
        bail!("give at least one store (--local <DIR> or --noop)");
    }

    println!("{}", "Initializing vault...".blue().bold());
    let config = VaultConfiguration::create_default(config_path)?;
    match password {
        Some(password) => config.change_password(password)?,
        None => println!(
            "{} No password given, content will be stored unencrypted",
            "!".yellow().bold()
        ),
    }

    if let Some(root) = local {
        let root = std::path::absolute(root)?;
        config.add_store(StoreSettings::LocalDisk(LocalDiskSettings {
            name: "local".to_string(),
            root: root.clone(),
            capacity,
            fan_out: fan_out.into(),
        }))?;
        println!("  Local store: {} ({})", root.display().to_string().cyan(), format_bytes(capacity));
    }
    if noop {
        config.add_store(StoreSettings::Noop(NoopSettings {
            name: "noop".to_string(),
            capacity: u64::MAX,
        }))?;
        println!("  Noop store: {}", "discards everything".dimmed());
    }
    config.save()?;

    println!("{} Created {}", "✓".green().bold(), config_path.display().to_string().cyan());
    println!("\nNext steps:");
    println!("  - Back up a directory: {}", "vaultkeeper backup <DIR>".yellow());
    Ok(())
}

fn cmd_backup(vault: &Vault, selection: &SelectionArgs, show_progress: bool) -> anyhow::Result<()> {
    let spec = selection.specification();
    println!("{}", "Backing up...".blue().bold());
    let start = Instant::now();

    let report = if show_progress {
        let estimate = vault.estimate(&spec)?;
        vault.backup(&spec, &BarProgress::new(estimate.original_bytes))?
    } else {
        vault.backup(&spec, &SilentProgress)?
    };

    println!("{} Backup complete", "✓".green().bold());
    println!("  Scanned: {}", report.files_scanned);
    println!("  Unchanged: {}", report.files_unchanged);
    println!(
        "  Backed up: {} ({} already stored)",
        report.files_backed_up.to_string().green(),
        report.files_deduplicated
    );
    println!("  Deletions recorded: {}", report.deletions_recorded);
    println!(
        "  Size: {} read, {} stored",
        format_bytes(report.original_bytes),
        format_bytes(report.stored_bytes)
    );
    if let Some(reclaimed) = report.reclaimed {
        println!(
            "  Reclaimed: {} from {} old revision(s)",
            format_bytes(reclaimed.bytes_freed),
            reclaimed.revisions_removed
        );
    }
    println!("  Duration: {}", humantime::format_duration(round(start.elapsed())));
    Ok(())
}

fn cmd_estimate(vault: &Vault, selection: &SelectionArgs) -> anyhow::Result<()> {
    let estimate = vault.estimate(&selection.specification())?;
    let available = vault.available_bytes()?;

    println!("{}", "Backup estimate".bold());
    println!("  Files to transfer: {}", estimate.files);
    println!("  Original size: {}", format_bytes(estimate.original_bytes));
    println!("  Estimated stored size: {}", format_bytes(estimate.estimated_stored_bytes));
    println!("  Available: {}", format_bytes(available));
    if estimate.estimated_stored_bytes > available {
        println!(
            "  {} Old revisions will be pruned to make room",
            "!".yellow().bold()
        );
    }
    Ok(())
}

fn cmd_restore(
    vault: &Vault,
    paths: Vec<PathBuf>,
    to: PathBuf,
    as_of: Option<String>,
    ago: Option<String>,
    overwrite: bool,
    show_progress: bool,
) -> anyhow::Result<()> {
    let date = match (as_of, ago) {
        (Some(date), _) => Some(parse_date(&date)?),
        (None, Some(ago)) => {
            let ago = humantime::parse_duration(&ago).with_context(|| format!("bad duration '{ago}'"))?;
            Some(Utc::now() - chrono::Duration::from_std(ago)?)
        }
        (None, None) => None,
    };

    let mut spec = RestoreSpecification::new(&to).overwrite(overwrite);
    for path in paths {
        let path = std::path::absolute(path)?;
        spec = match date {
            Some(date) => spec.as_of(path, date),
            None => spec.latest(path),
        };
    }

    println!("{}", "Restoring...".blue().bold());
    let report = if show_progress {
        vault.restore(&spec, &BarProgress::new(0))?
    } else {
        vault.restore(&spec, &SilentProgress)?
    };

    println!(
        "{} Restored {} file(s), {}",
        "✓".green().bold(),
        report.files_restored,
        format_bytes(report.bytes_restored)
    );
    if report.renamed > 0 {
        println!(
            "  {} {} file(s) restored under a new name to avoid overwriting",
            "!".yellow().bold(),
            report.renamed
        );
    }
    Ok(())
}

fn cmd_history(vault: &Vault, path: &Path) -> anyhow::Result<()> {
    let path = std::path::absolute(path)?;
    let history = vault.history(&path);
    if history.is_empty() {
        println!("{}", "No revisions found".yellow());
        return Ok(());
    }

    println!("{}", format!("History of {}", path.display()).bold());
    for revision in &history {
        let date = revision.date().with_timezone(&Local).format("%Y-%m-%d %H:%M:%S");
        match revision {
            Revision::File(file) => println!(
                "  {} {} {} ({} stored) {}",
                "●".green(),
                date,
                format_bytes(file.original_size),
                format_bytes(file.stored_size),
                file.identifier.guid.dimmed()
            ),
            Revision::Directory(directory) => println!(
                "  {} {} directory +{} -{}",
                "■".blue(),
                date,
                directory.added.len(),
                directory.removed.len()
            ),
        }
    }
    println!("  Stored in total: {}", format_bytes(vault.backed_up_size(&path)?));
    Ok(())
}

fn cmd_ls(vault: &Vault, path: &Path, as_of: Option<String>) -> anyhow::Result<()> {
    let path = std::path::absolute(path)?;
    let as_of = as_of.map(|d| parse_date(&d)).transpose()?;
    let Some(members) = vault.list(&path, as_of) else {
        bail!("{} was never backed up as a directory", path.display());
    };

    for name in members {
        let child = path.join(&name);
        match vault.find_revision(&child, as_of) {
            Some(Revision::Directory(_)) => println!("{}/", name.blue().bold()),
            Some(Revision::File(file)) => println!("{:>10}  {}", format_bytes(file.original_size), name),
            None => println!("{}", name.dimmed()),
        }
    }
    Ok(())
}

fn cmd_reclaim(vault: &Vault, bytes: u64) -> anyhow::Result<()> {
    println!("{}", format!("Reclaiming {}...", format_bytes(bytes)).blue().bold());
    let report = vault.reclaim_space(bytes)?;
    println!(
        "{} Freed {} from {} revision(s)",
        "✓".green().bold(),
        format_bytes(report.bytes_freed),
        report.revisions_removed
    );
    Ok(())
}

fn cmd_maintain(vault: &Vault) -> anyhow::Result<()> {
    vault.perform_maintenance()?;
    println!(
        "{} Maintenance done, {} available",
        "✓".green().bold(),
        format_bytes(vault.available_bytes()?)
    );
    Ok(())
}

fn cmd_recover(vault: &Vault) -> anyhow::Result<()> {
    vault.recover_index()?;
    println!("{} Index recovered from the stores", "✓".green().bold());
    Ok(())
}

fn cmd_passwd(vault: &Vault, new_password: &str) -> anyhow::Result<()> {
    vault.config().change_password(new_password)?;
    println!(
        "{} Password changed; {} epoch(s) on record",
        "✓".green().bold(),
        vault.config().password_count()
    );
    Ok(())
}

/// Parse sizes like `4096`, `500K`, `20G` or `1.5T` (binary units)
fn parse_size(text: &str) -> Result<u64, String> {
    let text = text.trim();
    let split = text
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(text.len());
    let (number, unit) = text.split_at(split);
    let number: f64 = number.parse().map_err(|_| format!("bad size '{text}'"))?;
    let multiplier: u64 = match unit.trim().to_ascii_uppercase().trim_end_matches("IB").trim_end_matches('B') {
        "" => 1,
        "K" => 1 << 10,
        "M" => 1 << 20,
        "G" => 1 << 30,
        "T" => 1 << 40,
        other => return Err(format!("unknown size unit '{other}'")),
    };
    Ok((number * multiplier as f64) as u64)
}

fn parse_date(text: &str) -> anyhow::Result<DateTime<Utc>> {
    let time = humantime::parse_rfc3339_weak(text).with_context(|| format!("bad date '{text}'"))?;
    Ok(DateTime::<Utc>::from(time))
}

fn round(duration: Duration) -> Duration {
    Duration::from_millis(duration.as_millis() as u64)
}
