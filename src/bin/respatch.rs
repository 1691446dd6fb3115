//! # Respatch CLI - Versioned patch chains for directory trees
//!
//! A command-line front end for the respatch library.
//!
//! ## Usage
//! ```bash
//! # Record the template tree as the next version
//! respatch --patches patches commit template/
//!
//! # Install version 3 into a new directory
//! respatch --patches patches deploy my_app --version 3
//!
//! # Upgrade it to the newest version, keeping local edits
//! respatch --patches patches migrate my_app --from 3 --merge
//!
//! # Check every record and replay the chain
//! respatch --patches patches verify
//! ```
//!
//! Exit status is 0 on success, 1 on error, and 2 when a migration finished
//! but left conflict markers behind.

use clap::{Parser, Subcommand};
use colored::*;
use humantime::format_duration;
use indicatif::{ProgressBar, ProgressStyle};
use respatch::{
    ApplyMode, CodecKind, FileAction, PatchError, Respatch, RespatchBuilder, Result, VersionSpec,
};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

/// Exit status for a migration that left conflicts
const EXIT_CONFLICTS: i32 = 2;

/// Respatch CLI - reverse-delta patch chains for directory trees
#[derive(Parser)]
#[command(name = "respatch")]
#[command(version)]
#[command(about = "Versioned, checksum-verified patch chains for directory trees")]
#[command(long_about = None)]
struct Cli {
    /// Directory holding the NNNNN.patch records
    #[arg(short, long, global = true, default_value = "patches")]
    patches: PathBuf,

    /// JSON configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Use the external diff and patch programs
    #[arg(long, global = true)]
    external: bool,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the latest committed version
    Latest,

    /// Commit a tree as the next version
    Commit {
        /// Tree to record
        to: PathBuf,

        /// Tree of the current head (reconstructed when omitted)
        #[arg(long)]
        from: Option<PathBuf>,
    },

    /// Materialize a version into an empty directory
    Deploy {
        /// Target directory (created if missing)
        target: PathBuf,

        /// Version number or "latest"
        #[arg(long, default_value = "latest")]
        version: VersionSpec,
    },

    /// Upgrade a deployed tree to a newer version
    Migrate {
        /// Deployed tree, modified in place
        dir: PathBuf,

        /// Version the tree is currently at
        #[arg(long)]
        from: u32,

        /// Version to move to
        #[arg(long, default_value = "latest")]
        to: VersionSpec,

        /// Only reconcile these files (repeatable)
        #[arg(long = "file")]
        files: Vec<String>,

        /// Leave conflict markers instead of failing
        #[arg(long)]
        merge: bool,
    },

    /// Check every record and replay the chain
    Verify {
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print a record
    Show {
        /// Version to print
        version: u32,
    },

    /// Recompute the body digest of a hand-edited record
    Reseal {
        /// Version to reseal
        version: u32,
    },
}

fn main() {
    let cli = Cli::parse();

    // Set up logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    // Disable colors if needed
    if std::env::var("NO_COLOR").is_ok() {
        colored::control::set_override(false);
    }

    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("{}: {}", "Error".red().bold(), e.user_message());
            std::process::exit(1);
        }
    }
}

/// Main command runner
fn run(cli: Cli) -> Result<i32> {
    let mut builder = RespatchBuilder::new();
    if let Some(config) = &cli.config {
        builder = builder.config_file(config);
    }
    if cli.external {
        builder = builder.codec(CodecKind::External);
    }
    let respatch = builder.build(&cli.patches)?;

    match cli.command {
        Commands::Latest => cmd_latest(&respatch),
        Commands::Commit { to, from } => cmd_commit(respatch, to, from),
        Commands::Deploy { target, version } => cmd_deploy(&respatch, target, version),
        Commands::Migrate {
            dir,
            from,
            to,
            files,
            merge,
        } => cmd_migrate(&respatch, dir, from, to, files, merge),
        Commands::Verify { json } => cmd_verify(&respatch, json),
        Commands::Show { version } => cmd_show(&respatch, version),
        Commands::Reseal { version } => cmd_reseal(respatch, version),
    }
}

fn spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} {msg}") {
        pb.set_style(style);
    }
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

fn elapsed(start: Instant) -> String {
    // Millisecond precision is plenty for humans
    let millis = start.elapsed().as_millis() as u64;
    format_duration(Duration::from_millis(millis)).to_string()
}

/// Print the latest version, plain, for scripts
fn cmd_latest(respatch: &Respatch) -> Result<i32> {
    println!("{}", respatch.latest_version());
    Ok(0)
}

/// Commit a tree as the next version
///
/// Without `--from` the current head is rebuilt in scratch space and used as
/// the source tree.
fn cmd_commit(mut respatch: Respatch, to: PathBuf, from: Option<PathBuf>) -> Result<i32> {
    if !to.is_dir() {
        return Err(PatchError::InvalidPath(format!("{} is not a directory", to.display())));
    }

    let start = Instant::now();
    let pb = spinner("Diffing trees...");
    let result = match &from {
        Some(from) => respatch.commit_from(Some(from), &to),
        None => respatch.commit(&to),
    };
    pb.finish_and_clear();

    match result? {
        Some(version) => {
            println!(
                "{} Created version {}",
                "✓".green().bold(),
                version.to_string().yellow().bold()
            );
            let record = respatch.record(version)?;
            println!("  Tree: {}", record.after_digest[..16].cyan());
            println!("  Time: {}", elapsed(start).cyan());
        }
        None => println!("{} No changes since version {}", "•".blue(), respatch.latest_version()),
    }
    Ok(0)
}

/// Materialize a version into an empty directory
fn cmd_deploy(respatch: &Respatch, target: PathBuf, version: VersionSpec) -> Result<i32> {
    let pb = spinner(&format!("Deploying version {}...", version));
    let result = respatch.deploy(&target, version);
    pb.finish_and_clear();
    let result = result?;

    println!(
        "{} Deployed version {} into {}",
        "✓".green().bold(),
        result.version.to_string().yellow().bold(),
        result.target.display().to_string().cyan()
    );
    println!("  Files: {}", result.files_deployed.to_string().cyan());
    println!("  Records replayed: {}", result.records_applied.to_string().cyan());
    println!(
        "  Time: {}",
        format_duration(Duration::from_millis(result.duration_ms)).to_string().cyan()
    );
    Ok(0)
}

/// Upgrade a deployed tree
fn cmd_migrate(
    respatch: &Respatch,
    dir: PathBuf,
    from: u32,
    to: VersionSpec,
    files: Vec<String>,
    merge: bool,
) -> Result<i32> {
    let mode = if merge { ApplyMode::Merge } else { ApplyMode::Batch };
    let files = (!files.is_empty()).then_some(files);

    let pb = spinner("Reconstructing versions...");
    let result = respatch.migrate(&dir, from, to, files.as_deref(), mode);
    pb.finish_and_clear();
    let result = result?;

    println!(
        "{} {} -> {}",
        "Migrated".blue().bold(),
        result.from_version.to_string().yellow(),
        result.to_version.to_string().yellow()
    );
    for file in &result.files {
        let (marker, label) = match file.action {
            FileAction::UpToDate => ("=".normal(), "up to date".normal()),
            FileAction::NoUpstreamChange => ("=".normal(), "no upstream change".normal()),
            FileAction::LocallyRemoved => ("-".yellow(), "removed locally, skipped".yellow()),
            FileAction::Patched => ("M".green(), "patched".green()),
            FileAction::Conflicted => ("C".red().bold(), "CONFLICT".red().bold()),
        };
        let base = if file.matched {
            format!("from {}", file.match_point)
        } else {
            format!("from {}, locally modified", file.match_point)
        };
        println!("  {} {} ({}, {})", marker, file.path, label, base.dimmed());
    }
    for created in &result.outcome.files_created {
        println!("  {} {}", "A".green(), created);
    }
    for deleted in &result.outcome.files_deleted {
        println!("  {} {}", "D".red(), deleted);
    }
    println!(
        "  Time: {}",
        format_duration(Duration::from_millis(result.duration_ms)).to_string().cyan()
    );

    if result.has_conflicts() {
        eprintln!(
            "{} {} files contain conflict markers; resolve them by hand",
            "!".red().bold(),
            result.outcome.conflicts.len()
        );
        return Ok(EXIT_CONFLICTS);
    }
    Ok(0)
}

/// Verify every record and replay the chain
fn cmd_verify(respatch: &Respatch, json: bool) -> Result<i32> {
    let report = respatch.verify()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", "Chain Verification Report:".bold());
        println!("  Latest version: {}", report.latest);
        for record in &report.records {
            let status = if record.is_valid() {
                "✓ Valid".green()
            } else {
                "✗ Invalid".red()
            };
            let shape = if record.is_snapshot { "snapshot" } else { "delta" };
            println!("  {:05} {} ({})", record.version, status, shape);
            if let Some(error) = &record.error {
                println!("        {}", error.red());
            }
        }
        for error in &report.errors {
            println!("  {}", error.red());
        }
        println!("  Verification time: {}ms", report.verification_time_ms);
        println!("\n{}", report.summary());
    }

    Ok(if report.is_valid() { 0 } else { 1 })
}

/// Print a record's headers and body
fn cmd_show(respatch: &Respatch, version: u32) -> Result<i32> {
    let record = respatch.record(version)?;
    println!("{} {}", "Before:".bold(), record.before_digest);
    println!("{} {}", "After:".bold(), record.after_digest);
    println!("{} {}", "Patch:".bold(), record.patch_digest);
    println!(
        "{}",
        if version == respatch.latest_version() {
            "(snapshot of the empty tree)".dimmed()
        } else {
            "(backward delta)".dimmed()
        }
    );
    print!("{}", record.body);
    Ok(0)
}

/// Recompute the body digest of a hand-edited record
fn cmd_reseal(mut respatch: Respatch, version: u32) -> Result<i32> {
    if respatch.reseal(version)? {
        println!(
            "{} Resealed {:05}.patch; run 'respatch verify' to check the chain",
            "✓".green().bold(),
            version
        );
    } else {
        println!("{} {:05}.patch digest already current", "•".blue(), version);
    }
    Ok(0)
}
