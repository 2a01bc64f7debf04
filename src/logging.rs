use std::fs;
use std::path::Path;
use std::sync::Mutex;

use once_cell::sync::OnceCell;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::paths::DataLayout;

pub const LOG_ENV: &str = "CODICTATE_BACKUP_LOG";
const DEFAULT_DIRECTIVE: &str = "codictate_backup=info";
const LOG_FILE_PREFIX: &str = "codictate-backup.log";

/// Keeps the non-blocking file writer alive for the life of the process.
static FILE_GUARD: OnceCell<Mutex<Option<WorkerGuard>>> = OnceCell::new();

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE))
}

/// Install the global subscriber: human-readable lines on stderr and, when
/// `data_dir` is given, JSON lines in a daily file under `<data_dir>/logs/`.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init(data_dir: Option<&Path>) -> anyhow::Result<()> {
    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(env_filter());

    let file_layer = match data_dir {
        Some(dir) => {
            let logs = DataLayout::new(dir).logs();
            fs::create_dir_all(&logs)?;
            let (writer, guard) = tracing_appender::non_blocking(rolling::daily(&logs, LOG_FILE_PREFIX));
            let slot = FILE_GUARD.get_or_init(|| Mutex::new(None));
            let mut held = slot.lock().unwrap_or_else(|e| e.into_inner());
            if held.is_some() {
                return Ok(());
            }
            *held = Some(guard);
            Some(
                fmt::layer()
                    .json()
                    .with_ansi(false)
                    .with_current_span(false)
                    .with_writer(writer)
                    .with_filter(env_filter()),
            )
        }
        None => None,
    };

    // A subscriber installed earlier (tests, embedding app) wins.
    let _ = tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .try_init();
    Ok(())
}

/// Flush the file writer. Events logged afterwards only reach stderr.
pub fn shutdown() {
    if let Some(slot) = FILE_GUARD.get() {
        let mut held = slot.lock().unwrap_or_else(|e| e.into_inner());
        held.take();
    }
}
