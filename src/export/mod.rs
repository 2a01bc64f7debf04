//! Archive builder. Reads one coherent snapshot of the live dataset (the
//! only write-blocking window), serializes it into a payload tree inside a
//! private workspace next to the destination, packages and verifies the
//! ZIP, and renames it into place last.

mod package;
mod payload;

use std::fs;
use std::io;
use std::path::Path;
use std::time::Instant;

use crate::archive::Scope;
use crate::engine::EngineContext;
use crate::error::codes;
use crate::fs_ops::{dir_size, ensure_free_space, sync_dir};
use crate::ops::report::{ExportReport, ItemCounts};
use crate::ops::{CancelToken, Phase, Progress};
use crate::paths::DatasetPaths;
use crate::restore::marker::RestoreMarker;
use crate::security::hash_path;
use crate::store::HistoryStore;
use crate::{AppError, AppResult};

use self::payload::PayloadTree;

const PARTIAL_SUFFIX: &str = ".partial";
const WORKSPACE_PREFIX: &str = ".codictate-export-";

#[derive(Clone, Default)]
pub struct ExportOptions {
    pub progress: Progress,
    pub cancel: CancelToken,
}

/// Create a backup archive at `destination`, which must not exist yet.
pub fn create_backup(
    ctx: &EngineContext,
    scope: Scope,
    destination: &Path,
    opts: &ExportOptions,
) -> AppResult<ExportReport> {
    let started = Instant::now();
    let _guard = ctx.lock.acquire("export")?;
    let dest_hash = hash_path(destination);
    tracing::info!(
        target: "codictate_backup",
        event = "export_started",
        scope = scope.as_str(),
        path_hash = %dest_hash
    );

    let result = run_export(ctx, scope, destination, opts);
    match &result {
        Ok(report) => tracing::info!(
            target: "codictate_backup",
            event = "export_complete",
            scope = scope.as_str(),
            path_hash = %dest_hash,
            history = report.counts.history,
            recordings = report.counts.recordings,
            warnings = report.warnings.len(),
            archive_bytes = report.archive_bytes,
            duration_ms = started.elapsed().as_millis() as u64
        ),
        Err(err) => tracing::warn!(
            target: "codictate_backup",
            event = "export_failed",
            path_hash = %dest_hash,
            code = err.code()
        ),
    }
    result.map(|mut report| {
        report.duration_ms = started.elapsed().as_millis() as u64;
        report
    })
}

fn run_export(
    ctx: &EngineContext,
    scope: Scope,
    destination: &Path,
    opts: &ExportOptions,
) -> AppResult<ExportReport> {
    let progress = &opts.progress;
    let cancel = &opts.cancel;

    if RestoreMarker::load(&ctx.layout.marker())?.is_some() {
        return Err(AppError::new(
            codes::RESTORE_RECONCILE_REQUIRED,
            "An earlier restore was interrupted; recover it before making a backup.",
        ));
    }
    ensure_destination_free(destination)?;
    let archive_name = destination
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| {
            AppError::new(codes::EXPORT_DESTINATION_INVALID, "The destination has no file name.")
        })?;
    let parent = match destination.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => std::env::current_dir().map_err(|err| {
            AppError::from(err).with_context("operation", "export_current_dir")
        })?,
    };
    fs::create_dir_all(&parent).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "create_out_parent")
            .with_context("path_hash", hash_path(&parent))
    })?;

    let active = DatasetPaths::new(ctx.layout.active());
    if !active.root().is_dir() {
        return Err(AppError::new(
            codes::EXPORT_MISSING_DATASET,
            "There is no Codictate data to back up yet.",
        )
        .with_context("path_hash", hash_path(active.root())));
    }

    // Payload copy plus the archive itself.
    let estimate = dir_size(active.root());
    ensure_free_space(
        &parent,
        estimate.saturating_mul(2),
        ctx.config.free_space_override,
        "export_workspace",
    )?;

    // Dropped on every early return, taking all temporary state with it.
    let workspace = tempfile::Builder::new()
        .prefix(WORKSPACE_PREFIX)
        .tempdir_in(&parent)
        .map_err(|err| {
            AppError::from(err)
                .with_context("operation", "export_workspace")
                .with_context("path_hash", hash_path(&parent))
        })?;

    cancel.checkpoint(Phase::Snapshot)?;
    let snapshot = DatasetPaths::new(workspace.path().join("snapshot"));
    snapshot_live_dataset(ctx, &active, &snapshot, progress)?;

    cancel.checkpoint(Phase::Serialize)?;
    let tree = PayloadTree::create(workspace.path().join("payload"))?;
    let serialized = tree.serialize(&snapshot, &active, scope, progress, cancel)?;

    cancel.checkpoint(Phase::Manifest)?;
    progress.emit(Phase::Manifest, 0, 1);
    let manifest = tree.write_manifest(scope, &serialized)?;
    let (checksums, files) = tree.write_checksums()?;
    progress.emit(Phase::Manifest, 1, 1);

    cancel.checkpoint(Phase::Package)?;
    ensure_free_space(
        &parent,
        dir_size(tree.root()),
        ctx.config.free_space_override,
        "export_package",
    )?;
    let partial = workspace
        .path()
        .join(format!("{archive_name}{PARTIAL_SUFFIX}"));
    let with_recordings_dir = scope.includes_media();
    if let Err(err) = package::write_archive(&partial, &files, with_recordings_dir, progress, cancel) {
        package::discard(&partial);
        return Err(err);
    }

    cancel.checkpoint(Phase::Verify)?;
    let expected_entries = files.len() + usize::from(with_recordings_dir);
    package::verify_archive(&partial, &checksums, expected_entries, progress)?;
    let archive_bytes = fs::metadata(&partial)
        .map_err(|err| AppError::from(err).with_context("operation", "export_stat_archive"))?
        .len();

    publish(&partial, destination)?;
    sync_dir(&parent).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "export_sync_parent")
            .with_context("path_hash", hash_path(&parent))
    })?;
    drop(workspace);

    Ok(ExportReport {
        archive_name,
        scope,
        created_at: manifest.created_at.clone(),
        counts: ItemCounts {
            history: serialized.history,
            dictionary: serialized.dictionary,
            settings: serialized.settings,
            recordings: serialized.recordings,
            recordings_bytes: serialized.recordings_bytes,
        },
        archive_bytes,
        warnings: serialized.warnings,
        duration_ms: 0,
    })
}

fn ensure_destination_free(destination: &Path) -> AppResult<()> {
    if destination.exists() {
        return Err(destination_exists(destination));
    }
    Ok(())
}

fn destination_exists(destination: &Path) -> AppError {
    AppError::new(
        codes::EXPORT_DESTINATION_EXISTS,
        "A file already exists at the chosen backup location.",
    )
    .with_context("path_hash", hash_path(destination))
}

/// Moves the verified archive into place without ever replacing a file
/// that appeared at the destination meanwhile. Linking refuses an existing
/// target; volumes without hard links fall back to a checked rename.
fn publish(partial: &Path, destination: &Path) -> AppResult<()> {
    match fs::hard_link(partial, destination) {
        Ok(()) => {
            package::discard(partial);
            Ok(())
        }
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Err(destination_exists(destination)),
        Err(err) => {
            tracing::debug!(
                target: "codictate_backup",
                event = "export_link_unsupported",
                error = %err
            );
            ensure_destination_free(destination)?;
            fs::rename(partial, destination).map_err(|err| {
                AppError::from(err)
                    .with_context("operation", "export_rename")
                    .with_context("path_hash", hash_path(destination))
            })
        }
    }
}

/// Copies the record store (through SQLite's online backup), dictionary and
/// settings while writers are fenced out. Media is read later; it is only
/// ever added or deleted, never rewritten in place.
fn snapshot_live_dataset(
    ctx: &EngineContext,
    active: &DatasetPaths,
    snapshot: &DatasetPaths,
    progress: &Progress,
) -> AppResult<()> {
    fs::create_dir_all(snapshot.root()).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "export_snapshot_mkdir")
            .with_context("path_hash", hash_path(snapshot.root()))
    })?;
    progress.emit(Phase::Snapshot, 0, 1);

    let fence_started = Instant::now();
    {
        let _fence = ctx.gate.fence();
        if active.history_db().exists() {
            let live = HistoryStore::open_read_only(&active.history_db())?;
            live.snapshot_to(&snapshot.history_db())?;
            live.close()?;
        }
        for (source, target) in [
            (active.dictionary(), snapshot.dictionary()),
            (active.settings(), snapshot.settings()),
        ] {
            if source.exists() {
                fs::copy(&source, &target).map_err(|err| {
                    AppError::from(err)
                        .with_context("operation", "export_snapshot_copy")
                        .with_context("path_hash", hash_path(&source))
                })?;
            }
        }
    }
    tracing::debug!(
        target: "codictate_backup",
        event = "export_fence_released",
        fence_ms = fence_started.elapsed().as_millis() as u64
    );
    progress.emit(Phase::Snapshot, 1, 1);
    Ok(())
}
