use chrono::{DateTime, Duration, Utc};

use crate::fs_ops::remove_dir_if_exists;
use crate::ops::report::{ReconcileAction, ReconcileReport};
use crate::paths::DataLayout;
use crate::AppResult;

use super::marker::{MarkerPhase, RestoreMarker};
use super::retention;
use super::swap;

/// Startup recovery. Reads the marker, drives the dataset to the matching
/// terminal state, clears the marker and sweeps `.restore/`. Running it
/// twice is the same as running it once.
pub fn reconcile(
    layout: &DataLayout,
    retention: Duration,
    now: DateTime<Utc>,
) -> AppResult<ReconcileReport> {
    let marker_path = layout.marker();
    let marker = RestoreMarker::load(&marker_path)?;
    let marker_phase = marker.as_ref().map(|marker| marker.phase);

    let action = match &marker {
        None => ReconcileAction::None,
        Some(marker) => {
            tracing::warn!(
                target: "codictate_backup",
                event = "interrupted_restore_found",
                restore_id = %marker.restore_id,
                phase = marker.phase.as_str(),
                rolling_back = marker.rolling_back
            );
            match marker.phase {
                _ if marker.rolling_back => reinstate(marker)?,
                MarkerPhase::SnapshotReady | MarkerPhase::ActiveMoved => reinstate(marker)?,
                MarkerPhase::StagedActivated => {
                    swap::finalize(marker, retention, now)?;
                    ReconcileAction::Finalized
                }
                MarkerPhase::Completed => {
                    swap::finalize(marker, retention, now)?;
                    ReconcileAction::None
                }
            }
        }
    };
    if marker.is_some() {
        RestoreMarker::clear(&marker_path)?;
    }

    let cleanup = retention::sweep(layout, now, None);
    let report = ReconcileReport {
        marker_phase,
        action,
        staging_removed: cleanup.staging_removed,
        snapshots_expired: cleanup.snapshots_expired,
    };
    tracing::info!(
        target: "codictate_backup",
        event = "reconcile_complete",
        phase = marker_phase.map(MarkerPhase::as_str).unwrap_or("none"),
        action = ?report.action,
        staging_removed = report.staging_removed,
        snapshots_expired = report.snapshots_expired
    );
    Ok(report)
}

fn reinstate(marker: &RestoreMarker) -> AppResult<ReconcileAction> {
    let action = swap::reinstate_original(marker)?;
    remove_dir_if_exists(&marker.rollback).ok();
    Ok(action)
}
