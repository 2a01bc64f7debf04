use std::fs;
use std::path::Path;

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::fs_ops::{remove_dir_if_exists, write_atomic};
use crate::paths::{DataLayout, RollbackPaths, ROLLBACK_PREFIX, STAGING_PREFIX};
use crate::security::hash_path;
use crate::{AppError, AppResult};

/// `rollback.json`, written when a restore completes. A rollback directory
/// without it belongs to a restore that never finished.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackMeta {
    pub restore_id: String,
    pub created_at: String,
    pub expires_at: String,
}

impl RollbackMeta {
    pub fn new(restore_id: &str, now: DateTime<Utc>, retention: Duration) -> Self {
        Self {
            restore_id: restore_id.to_string(),
            created_at: now.to_rfc3339_opts(SecondsFormat::Secs, true),
            expires_at: (now + retention).to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.expires_at)
            .ok()
            .map(|value| value.with_timezone(&Utc))
    }

    pub fn load(path: &Path) -> Option<Self> {
        let bytes = fs::read(path).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    pub fn write(&self, path: &Path) -> AppResult<()> {
        let payload = serde_json::to_vec_pretty(self)
            .map_err(|err| AppError::from(err).with_context("operation", "encode_rollback_meta"))?;
        write_atomic(path, &payload).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "write_rollback_meta")
                .with_context("path_hash", hash_path(path))
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cleanup {
    pub staging_removed: u32,
    pub snapshots_expired: u32,
}

/// Housekeeping under `.restore/`: staging directories and unfinished
/// rollback directories are removed (except `keep`), completed snapshots
/// are removed once expired. Individual failures are logged and skipped.
pub fn sweep(layout: &DataLayout, now: DateTime<Utc>, keep: Option<&str>) -> Cleanup {
    let mut cleanup = Cleanup::default();
    let entries = match fs::read_dir(layout.restore_root()) {
        Ok(entries) => entries,
        Err(_) => return cleanup,
    };

    for entry in entries.filter_map(Result::ok) {
        let name = entry.file_name().to_string_lossy().into_owned();
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }

        if let Some(id) = name.strip_prefix(STAGING_PREFIX) {
            if keep == Some(id) {
                continue;
            }
            if remove(&path, "staging") {
                cleanup.staging_removed += 1;
            }
        } else if let Some(id) = name.strip_prefix(ROLLBACK_PREFIX) {
            if keep == Some(id) {
                continue;
            }
            let rollback = RollbackPaths::new(&path);
            let expired = match RollbackMeta::load(&rollback.meta()) {
                Some(meta) => meta.expires_at().map_or(true, |expires| expires <= now),
                None => true,
            };
            if expired && remove(&path, "rollback") {
                cleanup.snapshots_expired += 1;
            }
        }
    }

    if cleanup != Cleanup::default() {
        tracing::info!(
            target: "codictate_backup",
            event = "restore_dir_swept",
            staging_removed = cleanup.staging_removed,
            snapshots_expired = cleanup.snapshots_expired
        );
    }
    cleanup
}

fn remove(path: &Path, kind: &'static str) -> bool {
    match remove_dir_if_exists(path) {
        Ok(()) => true,
        Err(err) => {
            tracing::warn!(
                target: "codictate_backup",
                event = "restore_dir_sweep_failed",
                kind,
                path_hash = %hash_path(path),
                error = %err
            );
            false
        }
    }
}
