//! Builds the replacement dataset inside a staging workspace. The active
//! dataset is never opened for writing here.

mod extract;
mod payloads;

use std::fs;
use std::path::Path;

use crate::archive::manifest::Manifest;
use crate::archive::{DICTIONARY_PATH, HISTORY_PATH, SETTINGS_PATH};
use crate::config::ResourceLimits;
use crate::error::codes;
use crate::fs_ops::remove_dir_if_exists;
use crate::ops::report::{Finding, ItemCounts, SettingsSummary};
use crate::ops::{CancelToken, Phase, Progress};
use crate::paths::{DatasetPaths, StagingPaths};
use crate::preflight::{Inspection, PayloadPlans};
use crate::security::hash_path;
use crate::store::settings::AppSettings;
use crate::store::{dictionary, settings, AudioStatus, HistoryStore, NewHistoryEntry};
use crate::{AppError, AppResult};

pub use extract::MediaIndex;

const ROW_CHUNK_SIZE: usize = 500;

/// A finished staging dataset, ready to be swapped in.
#[derive(Debug, Clone)]
pub struct StagedDataset {
    pub counts: ItemCounts,
    pub settings: SettingsSummary,
    /// Settings fields whose value came from the backup.
    pub applied_settings: Vec<&'static str>,
    pub warnings: Vec<Finding>,
    pub media_renamed: u64,
    pub media_unavailable: u64,
}

#[derive(Debug, Default)]
struct HistoryOutcome {
    records: u64,
    renamed: u64,
    unavailable: u64,
}

pub fn build_staging(
    archive_path: &Path,
    inspection: &Inspection,
    staging: &StagingPaths,
    current_settings: &AppSettings,
    limits: &ResourceLimits,
    progress: &Progress,
    cancel: &CancelToken,
) -> AppResult<StagedDataset> {
    let (manifest, plans) = match (&inspection.manifest, &inspection.plans) {
        (Some(manifest), Some(plans)) => (manifest, plans),
        _ => {
            return Err(AppError::new(
                codes::PREFLIGHT_MANIFEST_INVALID,
                "The backup was not inspected successfully.",
            ))
        }
    };

    let dataset = staging.dataset();
    fs::create_dir_all(dataset.recordings()).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "create_staging_dataset")
            .with_context("path_hash", hash_path(dataset.root()))
    })?;

    cancel.checkpoint(Phase::Extract)?;
    let media = extract::extract_verified(archive_path, inspection, staging, limits, progress, cancel)?;

    cancel.checkpoint(Phase::Migrate)?;
    progress.emit(Phase::Migrate, 0, 3);
    let extract_root = staging.extract();
    let payload = |relative: &str| {
        relative
            .split('/')
            .fold(extract_root.clone(), |path, segment| path.join(segment))
    };

    let entries = payloads::read_dictionary(&payload(DICTIONARY_PATH), &plans.dictionary, limits.max_entry_bytes)?;
    progress.emit(Phase::Migrate, 1, 3);
    let (merged, outcome) = payloads::merge_settings(
        &payload(SETTINGS_PATH),
        &plans.settings,
        current_settings,
        limits.max_entry_bytes,
    )?;
    progress.emit(Phase::Migrate, 2, 3);

    cancel.checkpoint(Phase::Import)?;
    let mut store = HistoryStore::create_fresh(&dataset.history_db())?;
    let history = import_history(
        &payload(HISTORY_PATH),
        plans,
        manifest,
        &mut store,
        &media,
        limits,
        progress,
    )?;
    progress.emit(Phase::Migrate, 3, 3);

    dictionary::write(&dataset.dictionary(), &entries)?;
    settings::write(&dataset.settings(), &merged)?;

    cancel.checkpoint(Phase::Validate)?;
    progress.emit(Phase::Validate, 0, 1);
    store.recompute_stats()?;
    store.integrity_check()?;
    let stored = store.count()?;
    if stored != history.records {
        return Err(AppError::new(
            codes::IMPORT_INTEGRITY_FAILED,
            "The rebuilt history store is missing records.",
        )
        .with_context("expected", history.records.to_string())
        .with_context("actual", stored.to_string()));
    }
    cross_check_media(&store, &dataset)?;
    store.close()?;
    progress.emit(Phase::Validate, 1, 1);

    remove_dir_if_exists(&extract_root).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "remove_extract_dir")
            .with_context("path_hash", hash_path(&extract_root))
    })?;

    let warnings = import_warnings(inspection, manifest, &history);
    let staged = StagedDataset {
        counts: ItemCounts {
            history: history.records,
            dictionary: entries.len() as u64,
            settings: outcome.applied.len() as u64,
            recordings: media.len() as u64,
            recordings_bytes: media.bytes,
        },
        settings: SettingsSummary {
            applied: outcome.applied.len() as u32,
            kept_current: outcome.kept_current.len() as u32,
            dropped: outcome.dropped,
        },
        applied_settings: outcome.applied,
        warnings,
        media_renamed: history.renamed,
        media_unavailable: history.unavailable,
    };
    tracing::info!(
        target: "codictate_backup",
        event = "staging_built",
        records = staged.counts.history,
        dictionary = staged.counts.dictionary,
        recordings = staged.counts.recordings,
        media_unavailable = staged.media_unavailable,
        settings_dropped = staged.settings.dropped.len()
    );
    Ok(staged)
}

fn import_history(
    path: &Path,
    plans: &PayloadPlans,
    manifest: &Manifest,
    store: &mut HistoryStore,
    media: &MediaIndex,
    limits: &ResourceLimits,
    progress: &Progress,
) -> AppResult<HistoryOutcome> {
    let total = manifest.components.history.count;
    let mut reader = payloads::HistoryReader::open(path, &plans.history, limits.max_line_bytes)?;
    let mut outcome = HistoryOutcome::default();
    let mut batch: Vec<NewHistoryEntry> = Vec::with_capacity(ROW_CHUNK_SIZE);

    while let Some(record) = reader.next_record()? {
        let (file_name, status) = match record.audio.as_ref() {
            None => (None, AudioStatus::None),
            Some(audio) => match media.resolve(&audio.file_name) {
                Some(target) => {
                    if target != audio.file_name {
                        outcome.renamed += 1;
                    }
                    (Some(target.to_string()), AudioStatus::Available)
                }
                None => {
                    outcome.unavailable += 1;
                    (Some(audio.file_name.clone()), AudioStatus::Unavailable)
                }
            },
        };
        batch.push(record.into_new_entry(file_name, status));
        outcome.records += 1;

        if batch.len() == ROW_CHUNK_SIZE {
            store.import_batch(&batch)?;
            batch.clear();
            progress.emit(Phase::Import, outcome.records, total);
        }
    }
    if !batch.is_empty() {
        store.import_batch(&batch)?;
    }
    progress.emit(Phase::Import, outcome.records, total);
    Ok(outcome)
}

/// Every record is either playable or explicitly marked unavailable.
fn cross_check_media(store: &HistoryStore, dataset: &DatasetPaths) -> AppResult<()> {
    store.for_each_entry(|entry| {
        if entry.audio_status != AudioStatus::Available {
            return Ok(());
        }
        let resolved = entry
            .file_name
            .as_deref()
            .map(|name| dataset.recording(name).is_file())
            .unwrap_or(false);
        if resolved {
            Ok(())
        } else {
            Err(AppError::new(
                codes::IMPORT_MEDIA_UNRESOLVED,
                "A restored record points at a recording that is not there.",
            )
            .with_context("record_id", entry.id.to_string()))
        }
    })
}

fn import_warnings(inspection: &Inspection, manifest: &Manifest, history: &HistoryOutcome) -> Vec<Finding> {
    let mut warnings: Vec<Finding> = inspection.report.recoverable().cloned().collect();
    for plan in &inspection.report.detail.media {
        if plan.target_name.is_none() {
            warnings.push(
                Finding::recoverable(codes::IMPORT_MEDIA_SKIPPED, "A recording was skipped.")
                    .with_path(format!("recordings/{}", plan.archive_name)),
            );
        }
    }
    if history.renamed > 0 {
        warnings.push(Finding::recoverable(
            codes::IMPORT_MEDIA_RENAMED,
            format!("{} recordings were renamed to fit this system.", history.renamed),
        ));
    }
    if history.unavailable > 0 {
        let message = if manifest.scope.includes_media() {
            format!(
                "{} records point at recordings missing from the backup; they are marked unavailable.",
                history.unavailable
            )
        } else {
            format!(
                "This backup does not include recordings; {} records are marked unavailable.",
                history.unavailable
            )
        };
        warnings.push(Finding::recoverable(codes::IMPORT_MEDIA_UNAVAILABLE, message));
    }
    warnings
}
