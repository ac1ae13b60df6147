//! Sealpost - Command-line interface for the encrypt-and-ship engine.
//!
//! `sealpost run` drains the configured input directory once and exits;
//! scheduling repeated runs is left to cron, systemd timers and the like.
//! `sealpost keygen` prints a fresh recipient key pair.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use clap::{Args, Parser, Subcommand, ValueEnum};
use sealpost_engine::{
    format_bytes, generate_keypair, run_ingest, store, AgeGateway, Config, FileTask, PipelineObserver,
    RunReport, Stage,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Sealpost - encrypt files from a drop directory and ship them to remote storage
#[derive(Parser, Debug)]
#[command(name = "sealpost")]
#[command(version)]
#[command(about = "Encrypt matching files and upload them in resumable chunks")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Process the input directory once
    Run(RunArgs),
    /// Print a new recipient key pair
    Keygen,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Configuration file (TOML)
    #[arg(long, value_name = "PATH")]
    config: PathBuf,

    /// Enable verbose output and debug logging
    #[arg(long)]
    verbose: bool,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum LogFormat {
    Text,
    Json,
}

/// Install the global subscriber. `RUST_LOG` wins over `--verbose`.
fn init_logging(verbose: bool, format: LogFormat) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    // A subscriber may already be installed (tests); keep it
    let _ = match format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
}

/// Terminal observer: per-file lines, a throttled progress bar, a summary.
struct CliProgress {
    verbose: bool,
    start_time: Instant,
    last_progress_update: Mutex<Instant>,
}

impl CliProgress {
    fn new(verbose: bool) -> Self {
        let now = Instant::now();
        CliProgress {
            verbose,
            start_time: now,
            last_progress_update: Mutex::new(now),
        }
    }

    fn format_duration(elapsed: Duration) -> String {
        let secs = elapsed.as_secs();
        let hours = secs / 3600;
        let mins = (secs % 3600) / 60;
        let secs = secs % 60;

        if hours > 0 {
            format!("{}h {}m {}s", hours, mins, secs)
        } else if mins > 0 {
            format!("{}m {}s", mins, secs)
        } else {
            format!("{}s", secs)
        }
    }

    fn progress_bar(percent: u32) -> String {
        let filled = (percent.min(100) / 5) as usize;
        format!("[{}{}] {}%", "=".repeat(filled), " ".repeat(20 - filled), percent.min(100))
    }

    /// True at most once per 200ms across all workers.
    fn should_redraw(&self) -> bool {
        let mut last = match self.last_progress_update.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if last.elapsed() < Duration::from_millis(200) {
            return false;
        }
        *last = Instant::now();
        true
    }
}

impl PipelineObserver for CliProgress {
    fn on_run_started(&self, input_root: &Path) {
        eprintln!("Scanning {}", input_root.display());
    }

    fn on_task_started(&self, task: &FileTask) {
        if self.verbose {
            eprintln!("Starting: {} ({})", task.file_name(), format_bytes(task.size));
        }
    }

    fn on_stage_changed(&self, task: &FileTask, stage: Stage) {
        if self.verbose {
            eprintln!("  {}: {}", task.file_name(), stage);
        }
    }

    fn on_upload_progress(&self, task: &FileTask, committed: u64, total: u64) {
        if committed < total && !self.should_redraw() {
            return;
        }

        let percent = if total == 0 {
            100
        } else {
            (committed as f64 / total as f64 * 100.0) as u32
        };
        eprint!(
            "\r{}: {} | {}/{}",
            task.file_name(),
            Self::progress_bar(percent),
            format_bytes(committed),
            format_bytes(total)
        );
        let _ = std::io::stderr().flush();
    }

    fn on_task_finished(&self, task: &FileTask) {
        eprintln!();
        match (&task.stage, &task.fault) {
            (Stage::Purged, _) => eprintln!("Shipped: {} -> {}", task.file_name(), task.remote_key),
            (_, Some(fault)) => eprintln!("Failed: {}: {}", task.file_name(), fault),
            _ => eprintln!("Failed: {}", task.file_name()),
        }
    }

    fn on_run_completed(&self, report: &RunReport) {
        eprintln!();
        eprintln!("Run complete!");
        eprintln!(
            "Summary: {} shipped, {} failed, {} not matching, {} symlinks skipped",
            report.purged_count(),
            report.failed_count(),
            report.unmatched_files,
            report.symlinks
        );
        eprintln!("Bytes uploaded: {}", format_bytes(report.bytes_uploaded()));
        if !report.pruned_dirs.is_empty() {
            eprintln!("Empty directories removed: {}", report.pruned_dirs.len());
        }
        eprintln!("Elapsed: {}", Self::format_duration(self.start_time.elapsed()));

        if report.has_failures() {
            eprintln!();
            eprintln!("Failed files:");
            for task in report.tasks.iter().filter(|t| t.stage == Stage::Failed) {
                let from = task.failed_from.map(|s| s.to_string()).unwrap_or_default();
                match &task.fault {
                    Some(fault) => eprintln!("  {} (after {}): {}", task.source_path.display(), from, fault),
                    None => eprintln!("  {} (after {})", task.source_path.display(), from),
                }
                if task.staged_path.exists() {
                    eprintln!("    staged copy kept at {}", task.staged_path.display());
                }
            }
        }

        if !report.traversal_faults.is_empty() {
            eprintln!();
            eprintln!("Unreadable entries:");
            for fault in &report.traversal_faults {
                eprintln!("  {}", fault);
            }
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Command::Keygen => {
            keygen();
            ExitCode::SUCCESS
        }
        Command::Run(args) => {
            init_logging(args.verbose, args.log_format);
            match run_cli(&args) {
                Ok(report) if report.has_failures() => ExitCode::from(1),
                Ok(_) => ExitCode::SUCCESS,
                Err(msg) => {
                    eprintln!("Error: {}", msg);
                    ExitCode::from(2)
                }
            }
        }
    }
}

fn keygen() {
    let keys = generate_keypair();
    println!("secret_key = \"{}\"", keys.secret.expose());
    println!("recipient_key = \"{}\"", keys.public);
    eprintln!("Fingerprint: {}", keys.public.fingerprint());
    eprintln!("Keep secret_key offline; only recipient_key belongs in the config.");
}

/// Main CLI logic - separated for testability
fn run_cli(args: &RunArgs) -> Result<RunReport, String> {
    let mut config =
        Config::from_file(&args.config).map_err(|e| format!("Failed to load configuration: {}", e))?;
    config
        .validate()
        .map_err(|e| format!("Invalid configuration: {}", e))?;
    info!(
        config = %args.config.display(),
        input = %config.input_path.display(),
        recipient = %config.recipient_key.fingerprint(),
        "configuration loaded"
    );

    let remote = store::open(&config.store).map_err(|e| format!("Failed to open store: {}", e))?;
    let progress = CliProgress::new(args.verbose);

    run_ingest(Arc::new(config), remote, Arc::new(AgeGateway), Some(&progress))
        .map_err(|e| format!("Run failed: {}", e))
}
