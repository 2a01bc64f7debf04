use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};

use crate::error::codes;
use crate::fs_ops::{copy_tree, remove_dir_if_exists, same_volume, sync_dir, tree_digest};
use crate::ops::report::ReconcileAction;
use crate::paths::{DataLayout, RollbackPaths, StagingPaths};
use crate::security::hash_path;
use crate::{AppError, AppResult};

use super::marker::{MarkerPhase, RestoreMarker};
use super::retention::RollbackMeta;

pub(crate) const DISCARDED_DIR: &str = "discarded";
pub(crate) const REBUILD_DIR: &str = "rebuild";

/// Paths taking part in one restore's swap.
#[derive(Debug, Clone)]
pub struct SwapPlan {
    pub restore_id: String,
    pub active: PathBuf,
    pub staged: PathBuf,
    pub rollback: RollbackPaths,
    pub marker_path: PathBuf,
}

impl SwapPlan {
    pub fn new(layout: &DataLayout, restore_id: &str) -> Self {
        let staging = StagingPaths::new(layout.staging(restore_id));
        Self {
            restore_id: restore_id.to_string(),
            active: layout.active(),
            staged: staging.dataset().root().to_path_buf(),
            rollback: RollbackPaths::new(layout.rollback(restore_id)),
            marker_path: layout.marker(),
        }
    }

    /// Renames are only atomic within one volume.
    pub fn check_same_volume(&self) -> AppResult<()> {
        let anchor = self.active.parent().unwrap_or(&self.active);
        for other in [&self.staged, self.rollback.root()] {
            let same = same_volume(anchor, other).map_err(|err| {
                AppError::from(err)
                    .with_context("operation", "same_volume")
                    .with_context("path_hash", hash_path(other))
            })?;
            if !same {
                return Err(AppError::new(
                    codes::RESTORE_VOLUME_MISMATCH,
                    "The restore workspace is on a different drive than your data.",
                )
                .with_context("active_hash", hash_path(&self.active))
                .with_context("other_hash", hash_path(other)));
            }
        }
        Ok(())
    }
}

/// Drives the durable swap one marker phase at a time.
pub struct SwapManager {
    plan: SwapPlan,
    marker: RestoreMarker,
}

impl SwapManager {
    /// Copy the active dataset into the rollback directory, verify the copy
    /// and persist the `snapshot_ready` marker. Nothing live is touched.
    pub fn begin(plan: SwapPlan, staged_digest: String) -> AppResult<Self> {
        match snapshot_active(&plan) {
            Ok(snapshot_digest) => {
                let marker = RestoreMarker::new(
                    plan.restore_id.clone(),
                    plan.active.clone(),
                    plan.staged.clone(),
                    plan.rollback.root().to_path_buf(),
                    snapshot_digest,
                    staged_digest,
                );
                if let Err(err) = marker.persist(&plan.marker_path) {
                    remove_dir_if_exists(plan.rollback.root()).ok();
                    return Err(err);
                }
                Ok(Self { plan, marker })
            }
            Err(err) => {
                remove_dir_if_exists(plan.rollback.root()).ok();
                Err(err)
            }
        }
    }

    pub fn phase(&self) -> MarkerPhase {
        self.marker.phase
    }

    pub fn marker(&self) -> &RestoreMarker {
        &self.marker
    }

    pub fn move_active(&mut self) -> AppResult<()> {
        rename_synced(&self.plan.active, &self.plan.rollback.displaced(), "displace_active")?;
        self.marker
            .advance(MarkerPhase::ActiveMoved, &self.plan.marker_path)
    }

    pub fn activate_staged(&mut self) -> AppResult<()> {
        rename_synced(&self.plan.staged, &self.plan.active, "activate_staged")?;
        self.marker
            .advance(MarkerPhase::StagedActivated, &self.plan.marker_path)
    }

    /// Commit: drop the displaced original, start the snapshot's retention
    /// clock and retire the marker. Returns the snapshot expiry.
    pub fn complete(mut self, retention: Duration, now: DateTime<Utc>) -> AppResult<String> {
        let expires_at = finalize(&self.marker, retention, now)?;
        self.marker
            .advance(MarkerPhase::Completed, &self.plan.marker_path)?;
        RestoreMarker::clear(&self.plan.marker_path)?;
        Ok(expires_at)
    }

    /// Put the pre-restore dataset back. Failure here is fatal and leaves
    /// the marker for the next startup to retry.
    pub fn roll_back(mut self) -> AppResult<ReconcileAction> {
        // Past `staged_activated` the phase alone would tell reconcile to
        // finalize; the flag keeps an interrupted rollback a rollback.
        self.marker
            .begin_rollback(&self.plan.marker_path)
            .map_err(|err| rollback_failed(&self.marker, err))?;
        let action = reinstate_original(&self.marker)?;
        remove_dir_if_exists(self.plan.rollback.root()).ok();
        if let Some(staging_root) = self.plan.staged.parent() {
            remove_dir_if_exists(staging_root).ok();
        }
        RestoreMarker::clear(&self.plan.marker_path)?;
        tracing::info!(
            target: "codictate_backup",
            event = "restore_rolled_back",
            restore_id = %self.marker.restore_id,
            action = ?action
        );
        Ok(action)
    }
}

fn snapshot_active(plan: &SwapPlan) -> AppResult<String> {
    if !plan.active.exists() {
        // First restore on a fresh install: snapshot an empty dataset.
        fs::create_dir_all(&plan.active).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "create_active_dataset")
                .with_context("path_hash", hash_path(&plan.active))
        })?;
    }
    fs::create_dir_all(plan.rollback.root()).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "create_rollback_dir")
            .with_context("path_hash", hash_path(plan.rollback.root()))
    })?;

    let snapshot = plan.rollback.snapshot();
    let bytes = copy_tree(&plan.active, &snapshot)?;
    let active_digest = tree_digest(&plan.active)?;
    let snapshot_digest = tree_digest(&snapshot)?;
    if active_digest != snapshot_digest {
        return Err(AppError::new(
            codes::RESTORE_SNAPSHOT_UNVERIFIED,
            "The safety copy of your current data could not be verified.",
        )
        .with_context("restore_id", plan.restore_id.clone()));
    }
    sync_dir(plan.rollback.root()).ok();
    tracing::info!(
        target: "codictate_backup",
        event = "rollback_snapshot_verified",
        restore_id = %plan.restore_id,
        bytes
    );
    Ok(snapshot_digest)
}

fn rename_synced(from: &Path, to: &Path, operation: &'static str) -> AppResult<()> {
    fs::rename(from, to).map_err(|err| {
        AppError::from(err)
            .with_context("operation", operation)
            .with_context("from_hash", hash_path(from))
            .with_context("to_hash", hash_path(to))
    })?;
    for dir in [from.parent(), to.parent()].into_iter().flatten() {
        sync_dir(dir).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "sync_parent_dir")
                .with_context("path_hash", hash_path(dir))
        })?;
    }
    Ok(())
}

/// Committed side of the state machine. Safe to repeat.
pub(crate) fn finalize(
    marker: &RestoreMarker,
    retention: Duration,
    now: DateTime<Utc>,
) -> AppResult<String> {
    let rollback = RollbackPaths::new(&marker.rollback);
    if let Err(err) = remove_dir_if_exists(&rollback.displaced()) {
        // The snapshot still covers it; the sweep removes it with the rest.
        tracing::warn!(
            target: "codictate_backup",
            event = "displaced_cleanup_failed",
            restore_id = %marker.restore_id,
            error = %err
        );
    }
    let meta = match RollbackMeta::load(&rollback.meta()) {
        Some(meta) if meta.restore_id == marker.restore_id => meta,
        _ => {
            let meta = RollbackMeta::new(&marker.restore_id, now, retention);
            meta.write(&rollback.meta())?;
            meta
        }
    };
    tracing::info!(
        target: "codictate_backup",
        event = "restore_finalized",
        restore_id = %marker.restore_id,
        snapshot_expires_at = %meta.expires_at
    );
    Ok(meta.expires_at)
}

/// Rolled-back side of the state machine: make the active dataset equal the
/// verified snapshot again. Safe to repeat after a crash at any point.
pub(crate) fn reinstate_original(marker: &RestoreMarker) -> AppResult<ReconcileAction> {
    reinstate_inner(marker).map_err(|err| rollback_failed(marker, err))
}

fn rollback_failed(marker: &RestoreMarker, err: AppError) -> AppError {
    let fatal = AppError::critical(
        codes::RESTORE_ROLLBACK_FAILED,
        "Your previous data could not be put back automatically.",
    )
    .with_context("restore_id", marker.restore_id.clone())
    .with_context("active_hash", hash_path(&marker.active))
    .with_context("rollback_hash", hash_path(&marker.rollback))
    .with_cause(err);
    tracing::error!(
        target: "codictate_backup",
        event = "rollback_failed",
        restore_id = %marker.restore_id,
        crash_id = ?fatal.crash_id(),
        error = %fatal
    );
    fatal
}

fn reinstate_inner(marker: &RestoreMarker) -> AppResult<ReconcileAction> {
    let rollback = RollbackPaths::new(&marker.rollback);
    let displaced = rollback.displaced();
    let snapshot = rollback.snapshot();

    let action = if displaced.exists() {
        discard_active(marker, &rollback)?;
        rename_synced(&displaced, &marker.active, "reinstate_displaced")?;
        ReconcileAction::ReinstatedDisplaced
    } else if marker.active.exists() && tree_digest(&marker.active)? == marker.snapshot_digest {
        ReconcileAction::VerifiedActive
    } else {
        if !snapshot.exists() {
            return Err(AppError::critical(
                codes::RECONCILE_SNAPSHOT_LOST,
                "The safety copy needed to recover your data is missing.",
            )
            .with_context("restore_id", marker.restore_id.clone()));
        }
        discard_active(marker, &rollback)?;
        let rebuild = rollback.root().join(REBUILD_DIR);
        remove_dir_if_exists(&rebuild).map_err(AppError::from)?;
        copy_tree(&snapshot, &rebuild)?;
        rename_synced(&rebuild, &marker.active, "reinstate_snapshot")?;
        ReconcileAction::RestoredFromSnapshot
    };

    let digest = tree_digest(&marker.active)?;
    if digest != marker.snapshot_digest {
        return Err(AppError::new(
            codes::RESTORE_SNAPSHOT_UNVERIFIED,
            "The recovered data does not match the safety copy.",
        )
        .with_context("restore_id", marker.restore_id.clone()));
    }
    Ok(action)
}

// Whatever is live (staged data or a partial copy) is renamed out of the
// way first so the slot is empty before anything moves into it.
fn discard_active(marker: &RestoreMarker, rollback: &RollbackPaths) -> AppResult<()> {
    if !marker.active.exists() {
        return Ok(());
    }
    let discarded = rollback.root().join(DISCARDED_DIR);
    remove_dir_if_exists(&discarded).map_err(AppError::from)?;
    rename_synced(&marker.active, &discarded, "discard_active")?;
    remove_dir_if_exists(&discarded).ok();
    Ok(())
}
