use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};

use zip::result::ZipError;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::archive::checksums::{ChecksumSet, HashingReader};
use crate::archive::RECORDINGS_PREFIX;
use crate::error::codes;
use crate::ops::{CancelToken, Phase, Progress};
use crate::security::hash_path;
use crate::{AppError, AppResult};

/// Writes `files` (already in packaging order) into a new ZIP at `target`.
/// Audio is stored as-is; everything else is deflated.
pub fn write_archive(
    target: &Path,
    files: &[(String, PathBuf)],
    with_recordings_dir: bool,
    progress: &Progress,
    cancel: &CancelToken,
) -> AppResult<()> {
    let file = File::options()
        .write(true)
        .create_new(true)
        .open(target)
        .map_err(|err| {
            AppError::from(err)
                .with_context("operation", "export_zip_create")
                .with_context("path_hash", hash_path(target))
        })?;

    let mut writer = ZipWriter::new(BufWriter::new(file));
    let deflated = FileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .unix_permissions(0o644);
    let stored = FileOptions::default()
        .compression_method(CompressionMethod::Stored)
        .unix_permissions(0o644);

    let total = files.len() as u64;
    progress.emit(Phase::Package, 0, total);
    let mut dir_written = false;
    for (idx, (name, source)) in files.iter().enumerate() {
        let is_media = name.starts_with(RECORDINGS_PREFIX);
        if is_media {
            cancel.checkpoint(Phase::Package)?;
        }
        if with_recordings_dir && is_media && !dir_written {
            writer
                .add_directory(RECORDINGS_PREFIX, deflated)
                .map_err(|err| map_zip_error(err, "export_zip_dir"))?;
            dir_written = true;
        }

        let mut input = File::open(source).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "export_zip_open")
                .with_context("path_hash", hash_path(source))
        })?;
        let size = input
            .metadata()
            .map_err(|err| AppError::from(err).with_context("operation", "export_zip_stat"))?
            .len();
        let options = if is_media { stored } else { deflated };
        writer
            .start_file(name.as_str(), options.large_file(size >= u32::MAX as u64))
            .map_err(|err| map_zip_error(err, "export_zip_entry"))?;
        io::copy(&mut input, &mut writer).map_err(|err| {
            AppError::from(err).with_context("operation", "export_zip_copy")
        })?;
        progress.emit(Phase::Package, idx as u64 + 1, total);
    }
    if with_recordings_dir && !dir_written {
        writer
            .add_directory(RECORDINGS_PREFIX, deflated)
            .map_err(|err| map_zip_error(err, "export_zip_dir"))?;
    }

    let buffered = writer
        .finish()
        .map_err(|err| map_zip_error(err, "export_zip_finish"))?;
    let file = buffered.into_inner().map_err(|err| {
        AppError::from(err.into_error()).with_context("operation", "export_zip_flush")
    })?;
    file.sync_all()
        .map_err(|err| AppError::from(err).with_context("operation", "export_zip_sync"))
}

/// Re-reads the packaged archive and checks every listed entry against the
/// checksum set. Nothing is renamed into place until this passes.
pub fn verify_archive(
    target: &Path,
    checksums: &ChecksumSet,
    expected_entries: usize,
    progress: &Progress,
) -> AppResult<()> {
    let file = File::open(target).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "export_verify_open")
            .with_context("path_hash", hash_path(target))
    })?;
    let mut archive = ZipArchive::new(BufReader::new(file))
        .map_err(|err| map_zip_error(err, "export_verify_read"))?;
    if archive.len() != expected_entries {
        return Err(AppError::new(
            codes::EXPORT_VERIFY_FAILED,
            "The written backup does not contain the expected entries.",
        )
        .with_context("expected", expected_entries.to_string())
        .with_context("actual", archive.len().to_string()));
    }

    let total = checksums.len() as u64;
    progress.emit(Phase::Verify, 0, total);
    for (idx, name) in checksums.paths().enumerate() {
        let entry = archive
            .by_name(name)
            .map_err(|err| map_zip_error(err, "export_verify_entry").with_context("entry", name))?;
        let mut reader = HashingReader::new(entry);
        io::copy(&mut reader, &mut io::sink()).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "export_verify_hash")
                .with_context("entry", name)
        })?;
        let (digest, _) = reader.finish();
        if Some(digest.as_str()) != checksums.get(name) {
            return Err(AppError::new(
                codes::EXPORT_VERIFY_FAILED,
                "The written backup failed its checksum verification.",
            )
            .with_context("entry", name));
        }
        progress.emit(Phase::Verify, idx as u64 + 1, total);
    }
    Ok(())
}

/// Removes a partial archive, ignoring a file that is already gone.
pub fn discard(target: &Path) {
    match fs::remove_file(target) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => tracing::warn!(
            target: "codictate_backup",
            event = "export_partial_cleanup_failed",
            path_hash = %hash_path(target),
            error = %err
        ),
    }
}

fn map_zip_error(err: ZipError, operation: &'static str) -> AppError {
    AppError::new(codes::EXPORT_ZIP, "Failed to write the backup archive.")
        .with_context("operation", operation)
        .with_context("error", err.to_string())
}
