//! Error codes and the taxonomy they belong to.
//!
//! Every code the engine emits is listed here. Codes bridged from library
//! errors (for example `IO/NotFound` or `SQLITE/ERROR`) are operational.

use serde::{Deserialize, Serialize};
use ts_rs::TS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum ErrorClass {
    /// Aborts before any destructive write.
    Blocking,
    /// Aggregated into the final report; the operation continues.
    Recoverable,
    /// Environment or caller problem, safe to retry.
    Operational,
    /// Rollback itself failed.
    Fatal,
}

// Blocking / corruption.
pub const PREFLIGHT_ARCHIVE_UNREADABLE: &str = "PREFLIGHT/ARCHIVE_UNREADABLE";
pub const PREFLIGHT_UNSAFE_ENTRY: &str = "PREFLIGHT/UNSAFE_ENTRY";
pub const PREFLIGHT_LIMIT_EXCEEDED: &str = "PREFLIGHT/LIMIT_EXCEEDED";
pub const PREFLIGHT_MISSING_ENTRY: &str = "PREFLIGHT/MISSING_ENTRY";
pub const PREFLIGHT_MANIFEST_INVALID: &str = "PREFLIGHT/MANIFEST_INVALID";
pub const PREFLIGHT_CHECKSUM_MISMATCH: &str = "PREFLIGHT/CHECKSUM_MISMATCH";
pub const PREFLIGHT_CHECKSUM_UNLISTED: &str = "PREFLIGHT/CHECKSUM_UNLISTED";
pub const PREFLIGHT_FORMAT_TOO_NEW: &str = "PREFLIGHT/FORMAT_TOO_NEW";
pub const PREFLIGHT_FORMAT_TOO_OLD: &str = "PREFLIGHT/FORMAT_TOO_OLD";
pub const PREFLIGHT_INVALID_REQUIRED_NAME: &str = "PREFLIGHT/INVALID_REQUIRED_NAME";
pub const PREFLIGHT_COUNT_MISMATCH: &str = "PREFLIGHT/COUNT_MISMATCH";
pub const MIGRATION_STEP_MISSING: &str = "MIGRATION/STEP_MISSING";
pub const IMPORT_CORRUPT_RECORD: &str = "IMPORT/CORRUPT_RECORD";
pub const IMPORT_CORRUPT_PAYLOAD: &str = "IMPORT/CORRUPT_PAYLOAD";
pub const IMPORT_SETTINGS_TYPE: &str = "IMPORT/SETTINGS_TYPE";
pub const IMPORT_EXTRACT_MISMATCH: &str = "IMPORT/EXTRACT_MISMATCH";
pub const IMPORT_INTEGRITY_FAILED: &str = "IMPORT/INTEGRITY_FAILED";
pub const IMPORT_MEDIA_UNRESOLVED: &str = "IMPORT/MEDIA_UNRESOLVED";
pub const RESTORE_VOLUME_MISMATCH: &str = "RESTORE/VOLUME_MISMATCH";
pub const RESTORE_SNAPSHOT_UNVERIFIED: &str = "RESTORE/SNAPSHOT_UNVERIFIED";
pub const EXPORT_VERIFY_FAILED: &str = "EXPORT/VERIFY_FAILED";
pub const STORE_MIGRATION_DRIFT: &str = "STORE/MIGRATION_DRIFT";
pub const FS_SYMLINK: &str = "FS/SYMLINK";

// Recoverable.
pub const PREFLIGHT_MEDIA_NAME_SANITIZED: &str = "PREFLIGHT/MEDIA_NAME_SANITIZED";
pub const PREFLIGHT_MEDIA_NAME_INVALID: &str = "PREFLIGHT/MEDIA_NAME_INVALID";
pub const PREFLIGHT_FORMAT_DEPRECATED: &str = "PREFLIGHT/FORMAT_DEPRECATED";
pub const PREFLIGHT_EXPORT_WARNING: &str = "PREFLIGHT/EXPORT_WARNING";
pub const EXPORT_MEDIA_MISSING: &str = "EXPORT/MEDIA_MISSING";
pub const IMPORT_MEDIA_SKIPPED: &str = "IMPORT/MEDIA_SKIPPED";
pub const IMPORT_MEDIA_RENAMED: &str = "IMPORT/MEDIA_RENAMED";
pub const IMPORT_MEDIA_UNAVAILABLE: &str = "IMPORT/MEDIA_UNAVAILABLE";
pub const EXPORT_MEDIA_NAME_COLLISION: &str = "EXPORT/MEDIA_NAME_COLLISION";

// Operational.
pub const OPERATION_BUSY: &str = "OPERATION/BUSY";
pub const OPERATION_CANCELED: &str = "OPERATION/CANCELED";
pub const OPERATION_TASK: &str = "OPERATION/TASK";
pub const DISK_LOW_SPACE: &str = "DISK/LOW_SPACE";
pub const EXPORT_DESTINATION_EXISTS: &str = "EXPORT/DESTINATION_EXISTS";
pub const EXPORT_MISSING_DATASET: &str = "EXPORT/MISSING_DATASET";
pub const STORE_RESTORE_IN_PROGRESS: &str = "STORE/RESTORE_IN_PROGRESS";
pub const RESTORE_CONFIRMATION_REQUIRED: &str = "RESTORE/CONFIRMATION_REQUIRED";
pub const RESTORE_RECONCILE_REQUIRED: &str = "RESTORE/RECONCILE_REQUIRED";
pub const RESTORE_ROLLED_BACK: &str = "RESTORE/ROLLED_BACK";
pub const RESTORE_FINALIZE_PENDING: &str = "RESTORE/FINALIZE_PENDING";
pub const MARKER_INVALID_TRANSITION: &str = "MARKER/INVALID_TRANSITION";
pub const EXPORT_DESTINATION_INVALID: &str = "EXPORT/DESTINATION_INVALID";
pub const EXPORT_ZIP: &str = "EXPORT/ZIP";
pub const EXPORT_PAYLOAD: &str = "EXPORT/PAYLOAD";
pub const STORE_EXISTS: &str = "STORE/EXISTS";
pub const FS_COPY_TREE: &str = "FS/COPY_TREE";

// Fatal.
pub const RESTORE_ROLLBACK_FAILED: &str = "RESTORE/ROLLBACK_FAILED";
pub const RECONCILE_SNAPSHOT_LOST: &str = "RECONCILE/SNAPSHOT_LOST";

const BLOCKING: &[&str] = &[
    PREFLIGHT_ARCHIVE_UNREADABLE,
    PREFLIGHT_UNSAFE_ENTRY,
    PREFLIGHT_LIMIT_EXCEEDED,
    PREFLIGHT_MISSING_ENTRY,
    PREFLIGHT_MANIFEST_INVALID,
    PREFLIGHT_CHECKSUM_MISMATCH,
    PREFLIGHT_CHECKSUM_UNLISTED,
    PREFLIGHT_FORMAT_TOO_NEW,
    PREFLIGHT_FORMAT_TOO_OLD,
    PREFLIGHT_INVALID_REQUIRED_NAME,
    PREFLIGHT_COUNT_MISMATCH,
    MIGRATION_STEP_MISSING,
    IMPORT_CORRUPT_RECORD,
    IMPORT_CORRUPT_PAYLOAD,
    IMPORT_SETTINGS_TYPE,
    IMPORT_EXTRACT_MISMATCH,
    IMPORT_INTEGRITY_FAILED,
    IMPORT_MEDIA_UNRESOLVED,
    RESTORE_VOLUME_MISMATCH,
    RESTORE_SNAPSHOT_UNVERIFIED,
    EXPORT_VERIFY_FAILED,
    STORE_MIGRATION_DRIFT,
    FS_SYMLINK,
];

const RECOVERABLE: &[&str] = &[
    PREFLIGHT_MEDIA_NAME_SANITIZED,
    PREFLIGHT_MEDIA_NAME_INVALID,
    PREFLIGHT_FORMAT_DEPRECATED,
    PREFLIGHT_EXPORT_WARNING,
    EXPORT_MEDIA_MISSING,
    IMPORT_MEDIA_SKIPPED,
    IMPORT_MEDIA_RENAMED,
    IMPORT_MEDIA_UNAVAILABLE,
    EXPORT_MEDIA_NAME_COLLISION,
];

const OPERATIONAL: &[&str] = &[
    OPERATION_BUSY,
    OPERATION_CANCELED,
    OPERATION_TASK,
    DISK_LOW_SPACE,
    EXPORT_DESTINATION_EXISTS,
    EXPORT_MISSING_DATASET,
    STORE_RESTORE_IN_PROGRESS,
    RESTORE_CONFIRMATION_REQUIRED,
    RESTORE_RECONCILE_REQUIRED,
    RESTORE_ROLLED_BACK,
    RESTORE_FINALIZE_PENDING,
    MARKER_INVALID_TRANSITION,
    EXPORT_DESTINATION_INVALID,
    EXPORT_ZIP,
    EXPORT_PAYLOAD,
    STORE_EXISTS,
    FS_COPY_TREE,
];

const FATAL: &[&str] = &[RESTORE_ROLLBACK_FAILED, RECONCILE_SNAPSHOT_LOST];

pub fn classify(code: &str) -> ErrorClass {
    if BLOCKING.contains(&code) {
        ErrorClass::Blocking
    } else if RECOVERABLE.contains(&code) {
        ErrorClass::Recoverable
    } else if FATAL.contains(&code) {
        ErrorClass::Fatal
    } else {
        ErrorClass::Operational
    }
}
