use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::archive::Scope;
use crate::error::ErrorClass;
use crate::fs_ops::format_bytes;
use crate::restore::marker::MarkerPhase;
use crate::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum Severity {
    Blocking,
    Recoverable,
}

/// One classified issue found while inspecting or importing an archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct Finding {
    pub code: String,
    pub severity: Severity,
    pub message: String,
    /// Archive-relative path, never a host path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub path: Option<String>,
}

impl Finding {
    pub fn blocking(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            severity: Severity::Blocking,
            message: message.into(),
            path: None,
        }
    }

    pub fn recoverable(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            severity: Severity::Recoverable,
            message: message.into(),
            path: None,
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Blocking unless the code is classed as recoverable.
    pub fn from_error(error: &AppError) -> Self {
        let severity = match error.class() {
            ErrorClass::Recoverable => Severity::Recoverable,
            _ => Severity::Blocking,
        };
        Self {
            code: error.code().to_string(),
            severity,
            message: error.message().to_string(),
            path: error.context().get("entry").cloned(),
        }
    }

    pub fn is_blocking(&self) -> bool {
        self.severity == Severity::Blocking
    }

    pub fn to_error(&self) -> AppError {
        let error = AppError::new(self.code.clone(), self.message.clone());
        match &self.path {
            Some(path) => error.with_context("entry", path.clone()),
            None => error,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct ItemCounts {
    #[ts(type = "number")]
    pub history: u64,
    #[ts(type = "number")]
    pub dictionary: u64,
    #[ts(type = "number")]
    pub settings: u64,
    #[ts(type = "number")]
    pub recordings: u64,
    #[ts(type = "number")]
    pub recordings_bytes: u64,
}

impl ItemCounts {
    fn describe(&self) -> String {
        let mut text = format!(
            "{} records, {} dictionary entries, {} settings",
            self.history, self.dictionary, self.settings
        );
        if self.recordings > 0 {
            text.push_str(&format!(
                ", {} recordings ({})",
                self.recordings,
                format_bytes(self.recordings_bytes)
            ));
        }
        text
    }
}

fn plural(count: usize, word: &str) -> String {
    if count == 1 {
        format!("1 {word}")
    } else {
        format!("{count} {word}s")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct ExportReport {
    /// File name of the archive; the directory is the caller's.
    pub archive_name: String,
    pub scope: Scope,
    pub created_at: String,
    pub counts: ItemCounts,
    #[ts(type = "number")]
    pub archive_bytes: u64,
    pub warnings: Vec<Finding>,
    #[ts(type = "number")]
    pub duration_ms: u64,
}

impl ExportReport {
    pub fn summary(&self) -> String {
        let mut text = format!("Backup created: {}.", self.counts.describe());
        if !self.warnings.is_empty() {
            text.push_str(&format!(" {}.", plural(self.warnings.len(), "warning")));
        }
        text
    }
}

/// Facts shown to the user before they confirm a restore.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct Headline {
    pub created_at: String,
    pub app_version: String,
    pub platform: String,
    pub scope: Scope,
    pub format_version: String,
    pub counts: ItemCounts,
}

/// What will happen to one media entry on restore.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct MediaPlan {
    pub archive_name: String,
    /// `None` when the file will be skipped.
    #[ts(optional)]
    pub target_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct PreflightDetail {
    #[ts(type = "number")]
    pub entries: u64,
    #[ts(type = "number")]
    pub total_uncompressed_bytes: u64,
    #[ts(type = "number")]
    pub verified_files: u64,
    /// Migration steps that will run, e.g. `history v1 -> v2`.
    pub migrations: Vec<String>,
    pub media: Vec<MediaPlan>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct PreflightReport {
    pub restorable: bool,
    /// Missing when the manifest itself could not be read.
    #[ts(optional)]
    pub headline: Option<Headline>,
    pub findings: Vec<Finding>,
    pub detail: PreflightDetail,
}

impl PreflightReport {
    pub fn blocking(&self) -> impl Iterator<Item = &Finding> {
        self.findings.iter().filter(|finding| finding.is_blocking())
    }

    pub fn recoverable(&self) -> impl Iterator<Item = &Finding> {
        self.findings.iter().filter(|finding| !finding.is_blocking())
    }

    pub fn first_blocking(&self) -> Option<&Finding> {
        self.blocking().next()
    }

    /// The error a restore of this archive fails with, if any.
    pub fn blocking_error(&self) -> Option<AppError> {
        let first = self.first_blocking()?;
        Some(
            first
                .to_error()
                .with_context("blocking_findings", self.blocking().count().to_string()),
        )
    }

    pub fn summary(&self) -> String {
        if let Some(first) = self.first_blocking() {
            let others = self.blocking().count() - 1;
            let mut text = format!("Cannot restore this backup: {}", first.message);
            if others > 0 {
                let noun = if others == 1 { "issue" } else { "issues" };
                text.push_str(&format!(" (and {others} more {noun})"));
            }
            return text;
        }
        let warnings = self.recoverable().count();
        let mut text = match &self.headline {
            Some(headline) => format!(
                "Backup from {} (app {}): {}.",
                headline.created_at,
                headline.app_version,
                headline.counts.describe()
            ),
            None => "Backup inspected.".to_string(),
        };
        text.push_str(" Ready to restore");
        if warnings > 0 {
            text.push_str(&format!(" with {}", plural(warnings, "warning")));
        }
        text.push('.');
        text
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct SettingsSummary {
    pub applied: u32,
    pub kept_current: u32,
    pub dropped: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct RestoreReport {
    pub restore_id: String,
    pub counts: ItemCounts,
    #[ts(type = "number")]
    pub media_renamed: u64,
    #[ts(type = "number")]
    pub media_unavailable: u64,
    pub settings: SettingsSummary,
    pub warnings: Vec<Finding>,
    pub snapshot_expires_at: String,
    #[ts(optional)]
    pub headline: Option<Headline>,
    #[ts(type = "number")]
    pub duration_ms: u64,
}

impl RestoreReport {
    pub fn summary(&self) -> String {
        let mut text = format!("Restore complete: {}.", self.counts.describe());
        if self.media_unavailable > 0 {
            text.push_str(&format!(
                " {} marked unavailable.",
                plural(self.media_unavailable as usize, "recording")
            ));
        }
        if !self.warnings.is_empty() {
            text.push_str(&format!(" {}.", plural(self.warnings.len(), "warning")));
        }
        text
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum ReconcileAction {
    /// No marker; only housekeeping ran.
    None,
    /// Active dataset matched the snapshot and was left alone.
    VerifiedActive,
    /// Active dataset was rebuilt from the rollback snapshot.
    RestoredFromSnapshot,
    /// The displaced original was renamed back into place.
    ReinstatedDisplaced,
    /// Staged data was already live; the restore was committed.
    Finalized,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct ReconcileReport {
    #[ts(optional)]
    pub marker_phase: Option<MarkerPhase>,
    pub action: ReconcileAction,
    pub staging_removed: u32,
    pub snapshots_expired: u32,
}

impl ReconcileReport {
    pub fn summary(&self) -> String {
        match self.action {
            ReconcileAction::None => "No interrupted restore found.".to_string(),
            ReconcileAction::VerifiedActive => {
                "An interrupted restore was found; your existing data was kept.".to_string()
            }
            ReconcileAction::RestoredFromSnapshot | ReconcileAction::ReinstatedDisplaced => {
                "An interrupted restore was rolled back; your previous data is back in place."
                    .to_string()
            }
            ReconcileAction::Finalized => {
                "An interrupted restore had already switched over; it was completed.".to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::codes;

    fn headline() -> Headline {
        Headline {
            created_at: "2026-10-01T09:00:00.000Z".into(),
            app_version: "0.1.0".into(),
            platform: "linux/x86_64".into(),
            scope: Scope::Lightweight,
            format_version: "2.0.0".into(),
            counts: ItemCounts {
                history: 3,
                dictionary: 1,
                settings: 26,
                ..ItemCounts::default()
            },
        }
    }

    #[test]
    fn preflight_summary_leads_with_first_blocking_finding() {
        let report = PreflightReport {
            restorable: false,
            headline: Some(headline()),
            findings: vec![
                Finding::recoverable(codes::PREFLIGHT_MEDIA_NAME_SANITIZED, "renamed"),
                Finding::blocking(codes::PREFLIGHT_CHECKSUM_MISMATCH, "checksum mismatch")
                    .with_path("history/history.jsonl"),
                Finding::blocking(codes::PREFLIGHT_COUNT_MISMATCH, "count mismatch"),
            ],
            detail: PreflightDetail::default(),
        };
        assert_eq!(
            report.summary(),
            "Cannot restore this backup: checksum mismatch (and 1 more issue)"
        );
        let err = report.blocking_error().expect("blocking error");
        assert_eq!(err.code(), codes::PREFLIGHT_CHECKSUM_MISMATCH);
        assert_eq!(err.context().get("entry").map(String::as_str), Some("history/history.jsonl"));
        assert_eq!(err.context().get("blocking_findings").map(String::as_str), Some("2"));

        let mut worse = report.clone();
        worse
            .findings
            .push(Finding::blocking(codes::PREFLIGHT_MISSING_ENTRY, "missing entry"));
        assert_eq!(
            worse.summary(),
            "Cannot restore this backup: checksum mismatch (and 2 more issues)"
        );
    }

    #[test]
    fn clean_preflight_summary_mentions_counts_and_warnings() {
        let report = PreflightReport {
            restorable: true,
            headline: Some(headline()),
            findings: vec![Finding::recoverable(codes::PREFLIGHT_EXPORT_WARNING, "missing")],
            detail: PreflightDetail::default(),
        };
        let summary = report.summary();
        assert!(summary.contains("3 records"));
        assert!(summary.ends_with("Ready to restore with 1 warning."));
        assert!(report.blocking_error().is_none());
    }

    #[test]
    fn finding_from_recoverable_error_keeps_severity() {
        let err = AppError::new(codes::IMPORT_MEDIA_SKIPPED, "skipped")
            .with_context("entry", "recordings/a.wav");
        let finding = Finding::from_error(&err);
        assert_eq!(finding.severity, Severity::Recoverable);
        assert_eq!(finding.path.as_deref(), Some("recordings/a.wav"));
    }
}
