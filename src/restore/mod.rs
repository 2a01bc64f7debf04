pub mod marker;
pub mod reconcile;
pub mod retention;
pub mod swap;

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use uuid::Uuid;

use crate::engine::EngineContext;
use crate::error::codes;
use crate::fs_ops::{dir_size, ensure_free_space, remove_dir_if_exists, tree_digest};
use crate::import::{self, StagedDataset};
use crate::ops::report::RestoreReport;
use crate::ops::{CancelToken, Phase, Progress};
use crate::paths::{DatasetPaths, StagingPaths};
use crate::preflight::{self, Inspection};
use crate::security::hash_path;
use crate::store::settings;
use crate::{AppError, AppResult};

use self::marker::{MarkerPhase, RestoreMarker};
use self::swap::{SwapManager, SwapPlan};

/// Called after each marker phase is persisted. Returning an error fails
/// the restore at that point, exactly like a real I/O failure would.
pub type PhaseHook = Arc<dyn Fn(MarkerPhase) -> AppResult<()> + Send + Sync + 'static>;

#[derive(Clone, Default)]
pub struct RestoreOptions {
    pub progress: Progress,
    pub cancel: CancelToken,
    pub after_phase: Option<PhaseHook>,
}

impl RestoreOptions {
    fn phase_reached(&self, phase: MarkerPhase) -> AppResult<()> {
        match &self.after_phase {
            Some(hook) => hook(phase),
            None => Ok(()),
        }
    }
}

/// Replace the active dataset with the contents of `archive_path`.
///
/// Nothing is written before the archive passes preflight, and the active
/// dataset is only touched after a verified rollback snapshot exists. Any
/// failure from then on puts the original dataset back before returning.
pub fn apply_restore(
    ctx: &EngineContext,
    archive_path: &Path,
    user_confirmed: bool,
    opts: &RestoreOptions,
) -> AppResult<RestoreReport> {
    if !user_confirmed {
        return Err(AppError::new(
            codes::RESTORE_CONFIRMATION_REQUIRED,
            "Restoring replaces your current data and needs explicit confirmation.",
        ));
    }
    let started = Instant::now();
    let _guard = ctx.lock.acquire("restore")?;
    if RestoreMarker::load(&ctx.layout.marker())?.is_some() {
        return Err(AppError::new(
            codes::RESTORE_RECONCILE_REQUIRED,
            "An earlier restore was interrupted; recover it before starting another.",
        ));
    }

    let archive_hash = hash_path(archive_path);
    tracing::info!(
        target: "codictate_backup",
        event = "restore_started",
        path_hash = %archive_hash
    );

    let inspection = preflight::inspect(
        archive_path,
        &ctx.config.limits,
        ctx.config.min_format_major,
        &opts.progress,
    )?;
    if let Some(err) = inspection.report.blocking_error() {
        tracing::warn!(
            target: "codictate_backup",
            event = "restore_blocked",
            path_hash = %archive_hash,
            code = err.code()
        );
        return Err(err);
    }

    let restore_id = Uuid::now_v7().to_string();
    let result = run_restore(ctx, archive_path, &inspection, &restore_id, opts);
    match &result {
        Ok(report) => tracing::info!(
            target: "codictate_backup",
            event = "restore_complete",
            restore_id = %restore_id,
            history = report.counts.history,
            recordings = report.counts.recordings,
            media_unavailable = report.media_unavailable,
            warnings = report.warnings.len(),
            duration_ms = started.elapsed().as_millis() as u64
        ),
        Err(err) => tracing::warn!(
            target: "codictate_backup",
            event = "restore_failed",
            restore_id = %restore_id,
            code = err.code(),
            class = ?err.class()
        ),
    }
    result.map(|mut report| {
        report.duration_ms = started.elapsed().as_millis() as u64;
        report
    })
}

fn run_restore(
    ctx: &EngineContext,
    archive_path: &Path,
    inspection: &Inspection,
    restore_id: &str,
    opts: &RestoreOptions,
) -> AppResult<RestoreReport> {
    let layout = &ctx.layout;
    let active = DatasetPaths::new(layout.active());
    let staging = StagingPaths::new(layout.staging(restore_id));

    // Extracted payloads, the rebuilt dataset and the rollback snapshot.
    let needed = inspection
        .report
        .detail
        .total_uncompressed_bytes
        .saturating_mul(2)
        .saturating_add(dir_size(active.root()));
    ensure_free_space(
        layout.root(),
        needed,
        ctx.config.free_space_override,
        "restore_workspace",
    )?;

    let current_settings = settings::load(&active.settings())?;
    let staged = match import::build_staging(
        archive_path,
        inspection,
        &staging,
        &current_settings,
        &ctx.config.limits,
        &opts.progress,
        &opts.cancel,
    ) {
        Ok(staged) => staged,
        Err(err) => {
            discard_staging(&staging);
            return Err(err);
        }
    };

    if let Err(err) = opts.cancel.checkpoint(Phase::RollbackSnapshot) {
        discard_staging(&staging);
        return Err(err);
    }

    let _quiesce = ctx.gate.quiesce();
    let plan = SwapPlan::new(layout, restore_id);
    let prepared = plan
        .check_same_volume()
        .and_then(|()| {
            ensure_free_space(
                layout.root(),
                dir_size(active.root()),
                ctx.config.free_space_override,
                "rollback_snapshot",
            )
        })
        .and_then(|()| refresh_local_settings(&active, &staging, &staged));
    let staged_digest = match prepared {
        Ok(digest) => digest,
        Err(err) => {
            discard_staging(&staging);
            return Err(err);
        }
    };

    opts.progress.emit(Phase::RollbackSnapshot, 0, 1);
    let manager = match SwapManager::begin(plan, staged_digest) {
        Ok(manager) => manager,
        Err(err) => {
            discard_staging(&staging);
            return Err(err);
        }
    };
    opts.progress.emit(Phase::RollbackSnapshot, 1, 1);

    let expires_at = swap_in(ctx, manager, opts)?;
    let cleanup = retention::sweep(layout, Utc::now(), None);
    tracing::debug!(
        target: "codictate_backup",
        event = "restore_housekeeping",
        staging_removed = cleanup.staging_removed,
        snapshots_expired = cleanup.snapshots_expired
    );

    Ok(report(restore_id, inspection, staged, expires_at))
}

/// The destructive part. Every error between `snapshot_ready` and
/// `completed` is answered with a rollback.
fn swap_in(ctx: &EngineContext, mut manager: SwapManager, opts: &RestoreOptions) -> AppResult<String> {
    let steps = (|| -> AppResult<()> {
        opts.phase_reached(MarkerPhase::SnapshotReady)?;
        opts.cancel.checkpoint(Phase::Swap)?;

        // No cancellation between the two renames.
        opts.progress.emit(Phase::Swap, 0, 2);
        manager.move_active()?;
        opts.phase_reached(MarkerPhase::ActiveMoved)?;
        manager.activate_staged()?;
        opts.progress.emit(Phase::Swap, 2, 2);
        opts.phase_reached(MarkerPhase::StagedActivated)
    })();

    match steps {
        Ok(()) => {
            // The restored data is live from here on; a failure only delays
            // the bookkeeping until the next reconcile.
            opts.progress.emit(Phase::Finalize, 0, 1);
            let restore_id = manager.marker().restore_id.clone();
            let expires_at = manager
                .complete(ctx.config.retention, Utc::now())
                .map_err(|err| {
                    tracing::warn!(
                        target: "codictate_backup",
                        event = "restore_finalize_deferred",
                        restore_id = %restore_id,
                        code = err.code()
                    );
                    AppError::new(
                        codes::RESTORE_FINALIZE_PENDING,
                        "Your backup was restored, but cleanup did not finish. It completes the next time recovery runs.",
                    )
                    .with_context("restore_id", restore_id.clone())
                    .with_cause(err)
                })?;
            opts.progress.emit(Phase::Finalize, 1, 1);
            Ok(expires_at)
        }
        Err(err) => {
            let phase = manager.phase();
            tracing::warn!(
                target: "codictate_backup",
                event = "restore_rolling_back",
                phase = phase.as_str(),
                code = err.code()
            );
            manager
                .roll_back()
                .map_err(|fatal| fatal.with_context("restore_error", err.code().to_string()))?;
            if err.code() == codes::OPERATION_CANCELED {
                return Err(err);
            }
            Err(AppError::new(
                codes::RESTORE_ROLLED_BACK,
                "The restore failed and your previous data was put back.",
            )
            .with_context("phase", phase.as_str())
            .with_cause(err))
        }
    }
}

/// Local-only settings may have changed while staging ran. Writers are
/// quiesced now, so rebase the staged settings on their latest values.
/// Returns the digest of the final staged dataset.
fn refresh_local_settings(
    active: &DatasetPaths,
    staging: &StagingPaths,
    staged: &StagedDataset,
) -> AppResult<String> {
    let dataset = staging.dataset();
    let current = settings::load(&active.settings())?;
    let merged = settings::load(&dataset.settings())?;
    let rebased = settings::rebase(&merged, &current, &staged.applied_settings).map_err(|err| {
        AppError::new(codes::IMPORT_SETTINGS_TYPE, "A setting in this backup has an unexpected value.")
            .with_context("reason", err.to_string())
    })?;
    if rebased != merged {
        settings::write(&dataset.settings(), &rebased)?;
        tracing::debug!(target: "codictate_backup", event = "staged_settings_rebased");
    }
    tree_digest(dataset.root())
}

fn discard_staging(staging: &StagingPaths) {
    if let Err(err) = remove_dir_if_exists(staging.root()) {
        tracing::warn!(
            target: "codictate_backup",
            event = "staging_cleanup_failed",
            path_hash = %hash_path(staging.root()),
            error = %err
        );
    }
}

fn report(
    restore_id: &str,
    inspection: &Inspection,
    staged: StagedDataset,
    snapshot_expires_at: String,
) -> RestoreReport {
    RestoreReport {
        restore_id: restore_id.to_string(),
        counts: staged.counts,
        media_renamed: staged.media_renamed,
        media_unavailable: staged.media_unavailable,
        settings: staged.settings,
        warnings: staged.warnings,
        snapshot_expires_at,
        headline: inspection.report.headline.clone(),
        duration_ms: 0,
    }
}
