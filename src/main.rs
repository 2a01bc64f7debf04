use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};
use serde::Serialize;

use codictate_backup::archive::Scope;
use codictate_backup::config::{default_data_dir, EngineConfig};
use codictate_backup::export::ExportOptions;
use codictate_backup::ops::report::PreflightReport;
use codictate_backup::ops::Progress;
use codictate_backup::restore::RestoreOptions;
use codictate_backup::{logging, AppError, BackupEngine, ErrorClass};

const EXIT_OK: i32 = 0;
const EXIT_OPERATIONAL: i32 = 1;
const EXIT_BLOCKING: i32 = 2;
const EXIT_FATAL: i32 = 3;

#[derive(Debug, Parser)]
#[command(name = "codictate-backup", about = "Back up and restore Codictate data", version)]
struct Cli {
    /// Application data directory (defaults to the platform location).
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Write a new backup archive.
    Create {
        #[arg(long, default_value = "full")]
        scope: Scope,
        /// Archive path; must not exist.
        #[arg(long)]
        out: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Inspect an archive without changing anything.
    Preflight {
        archive: PathBuf,
        #[arg(long)]
        json: bool,
        /// List every finding and the media plan.
        #[arg(long)]
        details: bool,
    },
    /// Replace the current data with the archive contents.
    Restore {
        archive: PathBuf,
        /// Confirm that the current data will be replaced.
        #[arg(long)]
        yes: bool,
        #[arg(long)]
        json: bool,
    },
    /// Recover from an interrupted restore and clean up old snapshots.
    Reconcile {
        #[arg(long)]
        json: bool,
    },
}

impl Command {
    fn json(&self) -> bool {
        match self {
            Command::Create { json, .. }
            | Command::Preflight { json, .. }
            | Command::Restore { json, .. }
            | Command::Reconcile { json } => *json,
        }
    }
}

fn main() {
    let cli = Cli::parse();
    let data_dir = cli.data_dir.clone().unwrap_or_else(default_data_dir);
    if let Err(err) = logging::init(Some(&data_dir)) {
        eprintln!("warning: file logging unavailable: {err:#}");
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("Error: failed to start runtime: {err}");
            process::exit(EXIT_OPERATIONAL);
        }
    };
    let engine = BackupEngine::new(EngineConfig::load(data_dir));
    let code = runtime.block_on(run(engine, cli.command));
    logging::shutdown();
    process::exit(code);
}

async fn run(engine: BackupEngine, command: Command) -> i32 {
    if !matches!(command, Command::Reconcile { .. }) {
        match engine.reconcile_if_pending().await {
            Ok(Some(report)) => eprintln!("{}", report.summary()),
            Ok(None) => {}
            Err(err) => return fail(command.json(), &err),
        }
    }
    match command {
        Command::Create { scope, out, json } => {
            match engine.create_backup(scope, out, ExportOptions::default()).await {
                Ok(report) => emit(json, &report, || {
                    let mut text = report.summary();
                    for warning in &report.warnings {
                        text.push_str(&format!("\n  warning: {}", warning.message));
                    }
                    text
                }),
                Err(err) => fail(json, &err),
            }
        }
        Command::Preflight {
            archive,
            json,
            details,
        } => match engine.preflight_restore(archive, Progress::silent()).await {
            Ok(report) => {
                let code = if report.restorable { EXIT_OK } else { EXIT_BLOCKING };
                emit(json, &report, || describe_preflight(&report, details));
                code
            }
            Err(err) => fail(json, &err),
        },
        Command::Restore { archive, yes, json } => {
            match engine.apply_restore(archive, yes, RestoreOptions::default()).await {
                Ok(report) => emit(json, &report, || report.summary()),
                Err(err) => fail(json, &err),
            }
        }
        Command::Reconcile { json } => match engine.reconcile().await {
            Ok(report) => emit(json, &report, || report.summary()),
            Err(err) => fail(json, &err),
        },
    }
}

fn emit<T: Serialize>(json: bool, value: &T, text: impl FnOnce() -> String) -> i32 {
    if json {
        match serde_json::to_string_pretty(value) {
            Ok(out) => println!("{out}"),
            Err(err) => {
                eprintln!("Error: failed to encode report: {err}");
                return EXIT_OPERATIONAL;
            }
        }
    } else {
        println!("{}", text());
    }
    EXIT_OK
}

fn fail(json: bool, err: &AppError) -> i32 {
    if json {
        match serde_json::to_string_pretty(err) {
            Ok(out) => println!("{out}"),
            Err(_) => eprintln!("Error: [{}] {}", err.code(), err.message()),
        }
    } else {
        eprintln!("Error: {} ({})", err.message(), err.code());
        if let Some(crash_id) = err.crash_id() {
            eprintln!("Crash id: {crash_id}");
        }
    }
    exit_code(err)
}

fn exit_code(err: &AppError) -> i32 {
    match err.class() {
        ErrorClass::Blocking => EXIT_BLOCKING,
        ErrorClass::Fatal => EXIT_FATAL,
        ErrorClass::Operational | ErrorClass::Recoverable => {
            // A rolled-back restore reports why it failed.
            match err.cause() {
                Some(cause) if cause.class() == ErrorClass::Blocking => EXIT_BLOCKING,
                _ => EXIT_OPERATIONAL,
            }
        }
    }
}

fn describe_preflight(report: &PreflightReport, details: bool) -> String {
    let mut text = report.summary();
    if !details {
        return text;
    }
    for finding in &report.findings {
        text.push_str(&format!("\n  [{}] {}", finding.code, finding.message));
        if let Some(path) = &finding.path {
            text.push_str(&format!(" ({path})"));
        }
    }
    let detail = &report.detail;
    text.push_str(&format!(
        "\n  entries: {}, uncompressed: {} bytes, verified files: {}",
        detail.entries, detail.total_uncompressed_bytes, detail.verified_files
    ));
    for step in &detail.migrations {
        text.push_str(&format!("\n  migration: {step}"));
    }
    for media in &detail.media {
        match &media.target_name {
            Some(target) if target != &media.archive_name => {
                text.push_str(&format!("\n  media: {} -> {target}", media.archive_name))
            }
            Some(_) => {}
            None => text.push_str(&format!("\n  media skipped: {}", media.archive_name)),
        }
    }
    text
}
