use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, BufWriter, Read};
use std::path::{Path, PathBuf};

use unicode_normalization::UnicodeNormalization;
use zip::ZipArchive;

use crate::archive::checksums::HashingReader;
use crate::archive::{self, CHECKSUMS_PATH, MANIFEST_PATH, REQUIRED_ENTRIES};
use crate::config::ResourceLimits;
use crate::error::codes;
use crate::ops::{CancelToken, Phase, Progress};
use crate::paths::StagingPaths;
use crate::preflight::Inspection;
use crate::security::filenames::check_entry_path;
use crate::security::hash_path;
use crate::{AppError, AppResult};

/// Archive media name (NFC) to the file name it was restored under.
#[derive(Debug, Default)]
pub struct MediaIndex {
    restored: HashMap<String, String>,
    pub bytes: u64,
}

impl MediaIndex {
    pub fn resolve(&self, archive_name: &str) -> Option<&str> {
        let key: String = archive_name.nfc().collect();
        self.restored.get(&key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.restored.len()
    }

    pub fn is_empty(&self) -> bool {
        self.restored.is_empty()
    }
}

/// Write every payload into `extract/` and every planned recording straight
/// into the staged dataset, re-hashing each against the checksum file.
pub fn extract_verified(
    archive_path: &Path,
    inspection: &Inspection,
    staging: &StagingPaths,
    limits: &ResourceLimits,
    progress: &Progress,
    cancel: &CancelToken,
) -> AppResult<MediaIndex> {
    let file = File::open(archive_path).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "open_archive")
            .with_context("path_hash", hash_path(archive_path))
    })?;
    let mut zip = ZipArchive::new(file)
        .map_err(|err| AppError::from(err).with_context("operation", "reopen_archive"))?;

    let targets: HashMap<&str, &str> = inspection
        .report
        .detail
        .media
        .iter()
        .filter_map(|plan| Some((plan.archive_name.as_str(), plan.target_name.as_deref()?)))
        .collect();
    let recordings = staging.dataset().recordings();
    let mut media = MediaIndex::default();

    let work: Vec<(&str, usize, PathBuf)> = inspection
        .entries
        .files()
        .filter_map(|(name, meta)| {
            let dest = match archive::media_name(name) {
                Some(media_name) => recordings.join(targets.get(media_name)?),
                None if REQUIRED_ENTRIES.contains(&name)
                    && name != CHECKSUMS_PATH
                    && name != MANIFEST_PATH =>
                {
                    name.split('/')
                        .fold(staging.extract(), |path, segment| path.join(segment))
                }
                None => return None,
            };
            Some((name, meta.index, dest))
        })
        .collect();

    let total = work.len() as u64;
    for (position, (name, index, dest)) in work.into_iter().enumerate() {
        cancel.checkpoint(Phase::Extract)?;
        progress.emit(Phase::Extract, position as u64, total);
        check_entry_path(name).map_err(|reason| {
            AppError::new(codes::PREFLIGHT_UNSAFE_ENTRY, reason.to_string()).with_context("entry", name)
        })?;
        let expected = inspection.checksums.get(name).ok_or_else(|| {
            AppError::new(
                codes::PREFLIGHT_CHECKSUM_UNLISTED,
                "A file in the backup has no checksum.",
            )
            .with_context("entry", name)
        })?;

        let (digest, written) = extract_entry(&mut zip, index, &dest, limits)
            .map_err(|err| err.with_context("entry", name))?;
        if digest != expected {
            return Err(AppError::new(
                codes::IMPORT_EXTRACT_MISMATCH,
                "A file changed between inspection and restore.",
            )
            .with_context("entry", name));
        }

        if let Some(media_name) = archive::media_name(name) {
            if let Some(target) = targets.get(media_name) {
                media
                    .restored
                    .insert(media_name.nfc().collect(), (*target).to_string());
                media.bytes += written;
            }
        }
    }
    progress.emit(Phase::Extract, total, total);
    tracing::debug!(
        target: "codictate_backup",
        event = "staging_extracted",
        files = total,
        media = media.len()
    );
    Ok(media)
}

fn extract_entry<R: Read + io::Seek>(
    zip: &mut ZipArchive<R>,
    index: usize,
    dest: &Path,
    limits: &ResourceLimits,
) -> AppResult<(String, u64)> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "create_extract_dir")
                .with_context("path_hash", hash_path(parent))
        })?;
    }
    let entry = zip
        .by_index(index)
        .map_err(|err| AppError::from(err).with_context("operation", "open_entry"))?;
    let mut reader = HashingReader::new(entry.take(limits.max_entry_bytes + 1));

    let out = File::options()
        .write(true)
        .create_new(true)
        .open(dest)
        .map_err(|err| {
            AppError::from(err)
                .with_context("operation", "create_extracted_file")
                .with_context("path_hash", hash_path(dest))
        })?;
    let mut writer = BufWriter::new(out);
    io::copy(&mut reader, &mut writer).map_err(|err| {
        AppError::new(codes::IMPORT_EXTRACT_MISMATCH, "A file in the backup could not be read.")
            .with_cause(err)
    })?;
    let out = writer
        .into_inner()
        .map_err(|err| AppError::from(err.into_error()).with_context("operation", "flush_extracted_file"))?;
    out.sync_all().map_err(|err| {
        AppError::from(err)
            .with_context("operation", "sync_extracted_file")
            .with_context("path_hash", hash_path(dest))
    })?;

    let (digest, written) = reader.finish();
    if written > limits.max_entry_bytes {
        return Err(AppError::new(
            codes::PREFLIGHT_LIMIT_EXCEEDED,
            format!("Entry is larger than {} bytes.", limits.max_entry_bytes),
        ));
    }
    Ok((digest, written))
}
