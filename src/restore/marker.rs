use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::error::codes;
use crate::fs_ops::{sync_dir, write_atomic};
use crate::security::hash_path;
use crate::{AppError, AppResult};

pub const MARKER_VERSION: u32 = 1;

/// Durable phases of an in-flight restore, in their only legal order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum MarkerPhase {
    SnapshotReady,
    ActiveMoved,
    StagedActivated,
    Completed,
}

impl MarkerPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            MarkerPhase::SnapshotReady => "snapshot_ready",
            MarkerPhase::ActiveMoved => "active_moved",
            MarkerPhase::StagedActivated => "staged_activated",
            MarkerPhase::Completed => "completed",
        }
    }

    pub fn next(self) -> Option<MarkerPhase> {
        match self {
            MarkerPhase::SnapshotReady => Some(MarkerPhase::ActiveMoved),
            MarkerPhase::ActiveMoved => Some(MarkerPhase::StagedActivated),
            MarkerPhase::StagedActivated => Some(MarkerPhase::Completed),
            MarkerPhase::Completed => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreMarker {
    pub version: u32,
    pub restore_id: String,
    pub phase: MarkerPhase,
    pub active: PathBuf,
    pub staging: PathBuf,
    pub rollback: PathBuf,
    /// Tree digest of the verified rollback snapshot (== pre-restore active).
    pub snapshot_digest: String,
    /// Tree digest of the staged dataset.
    pub staged_digest: String,
    /// Set before a rollback starts. Reconcile then always reinstates the
    /// original, whatever phase was reached.
    #[serde(default)]
    pub rolling_back: bool,
    pub updated_at: String,
}

impl RestoreMarker {
    pub fn new(
        restore_id: impl Into<String>,
        active: PathBuf,
        staging: PathBuf,
        rollback: PathBuf,
        snapshot_digest: String,
        staged_digest: String,
    ) -> Self {
        Self {
            version: MARKER_VERSION,
            restore_id: restore_id.into(),
            phase: MarkerPhase::SnapshotReady,
            active,
            staging,
            rollback,
            snapshot_digest,
            staged_digest,
            rolling_back: false,
            updated_at: now(),
        }
    }

    pub fn load(path: &Path) -> AppResult<Option<Self>> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(AppError::from(err)
                    .with_context("operation", "read_restore_marker")
                    .with_context("path_hash", hash_path(path)))
            }
        };
        let marker = serde_json::from_slice(&bytes).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "parse_restore_marker")
                .with_context("path_hash", hash_path(path))
        })?;
        Ok(Some(marker))
    }

    /// Written with temp-file-then-rename; returns only once durable.
    pub fn persist(&self, path: &Path) -> AppResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| {
                AppError::from(err)
                    .with_context("operation", "create_restore_dir")
                    .with_context("path_hash", hash_path(parent))
            })?;
        }
        let payload = serde_json::to_vec_pretty(self)
            .map_err(|err| AppError::from(err).with_context("operation", "encode_restore_marker"))?;
        write_atomic(path, &payload).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "write_restore_marker")
                .with_context("path_hash", hash_path(path))
        })?;
        tracing::info!(
            target: "codictate_backup",
            event = "restore_marker_persisted",
            restore_id = %self.restore_id,
            phase = self.phase.as_str()
        );
        Ok(())
    }

    /// Move to the next phase and persist it. Any other transition fails.
    pub fn advance(&mut self, next: MarkerPhase, path: &Path) -> AppResult<()> {
        if self.phase.next() != Some(next) {
            return Err(AppError::new(
                codes::MARKER_INVALID_TRANSITION,
                "Restore marker cannot move to the requested phase.",
            )
            .with_context("from", self.phase.as_str())
            .with_context("to", next.as_str()));
        }
        let previous = self.phase;
        self.phase = next;
        self.updated_at = now();
        if let Err(err) = self.persist(path) {
            self.phase = previous;
            return Err(err);
        }
        Ok(())
    }

    /// Record that the swap is being undone. The phase stays where it was.
    pub fn begin_rollback(&mut self, path: &Path) -> AppResult<()> {
        if self.rolling_back {
            return Ok(());
        }
        self.rolling_back = true;
        self.updated_at = now();
        if let Err(err) = self.persist(path) {
            self.rolling_back = false;
            return Err(err);
        }
        Ok(())
    }

    pub fn clear(path: &Path) -> AppResult<()> {
        match fs::remove_file(path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => {
                return Err(AppError::from(err)
                    .with_context("operation", "clear_restore_marker")
                    .with_context("path_hash", hash_path(path)))
            }
        }
        if let Some(parent) = path.parent() {
            sync_dir(parent).ok();
        }
        tracing::info!(target: "codictate_backup", event = "restore_marker_cleared");
        Ok(())
    }
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
