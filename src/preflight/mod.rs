//! Read-only archive inspection. Nothing here writes to disk; the archive
//! is opened, its central directory checked, then every file is streamed
//! through SHA-256 under hard bounds.

mod entries;

use std::collections::HashSet;
use std::fs::File;
use std::io::{self, BufReader, Read, Seek};
use std::path::Path;
use std::time::Instant;

use zip::ZipArchive;

use crate::archive::checksums::{ChecksumSet, HashingReader};
use crate::archive::lines::{count_lines, LineError};
use crate::archive::manifest::{Manifest, CURRENT_FORMAT_MAJOR};
use crate::archive::{self, CHECKSUMS_PATH, HISTORY_PATH, MANIFEST_PATH, REQUIRED_ENTRIES};
use crate::config::ResourceLimits;
use crate::error::codes;
use crate::migration::{Component, Plan};
use crate::ops::report::{Finding, Headline, ItemCounts, MediaPlan, PreflightDetail, PreflightReport};
use crate::ops::{Phase, Progress};
use crate::security::filenames::{sanitize_component, unique_name, validate_component};
use crate::security::hash_path;
use crate::{AppError, AppResult};

pub use entries::{EntryMeta, EntryTable};

/// Upgrade plans for the three payloads.
#[derive(Clone)]
pub struct PayloadPlans {
    pub history: Plan,
    pub dictionary: Plan,
    pub settings: Plan,
}

/// Everything preflight learned, for the importer to reuse.
pub struct Inspection {
    pub report: PreflightReport,
    pub manifest: Option<Manifest>,
    pub checksums: ChecksumSet,
    pub entries: EntryTable,
    pub plans: Option<PayloadPlans>,
}

impl Inspection {
    fn finish(
        findings: Vec<Finding>,
        detail: PreflightDetail,
        manifest: Option<Manifest>,
        checksums: ChecksumSet,
        entries: EntryTable,
        plans: Option<PayloadPlans>,
    ) -> Self {
        let restorable = !findings.iter().any(Finding::is_blocking);
        let headline = manifest.as_ref().map(headline);
        Self {
            report: PreflightReport {
                restorable,
                headline,
                findings,
                detail,
            },
            manifest,
            checksums,
            entries,
            plans,
        }
    }
}

/// Blocking conditions become findings; only environment failures (the
/// archive cannot be opened at all) are returned as errors.
pub fn inspect(
    archive_path: &Path,
    limits: &ResourceLimits,
    min_format_major: u64,
    progress: &Progress,
) -> AppResult<Inspection> {
    let started = Instant::now();
    let file = File::open(archive_path).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "open_archive")
            .with_context("path_hash", hash_path(archive_path))
    })?;
    progress.emit(Phase::Inspect, 0, 1);

    let mut zip = match ZipArchive::new(file) {
        Ok(zip) => zip,
        Err(err) => {
            let finding = Finding::blocking(
                codes::PREFLIGHT_ARCHIVE_UNREADABLE,
                format!("The file is not a readable backup: {err}"),
            );
            return Ok(Inspection::finish(
                vec![finding],
                PreflightDetail::default(),
                None,
                ChecksumSet::new(),
                EntryTable::default(),
                None,
            ));
        }
    };

    let inspection = inspect_zip(&mut zip, limits, min_format_major, progress);
    progress.emit(Phase::Inspect, 1, 1);

    let report = &inspection.report;
    tracing::info!(
        target: "codictate_backup",
        event = "preflight_complete",
        path_hash = %hash_path(archive_path),
        restorable = report.restorable,
        blocking = report.blocking().count(),
        recoverable = report.recoverable().count(),
        entries = report.detail.entries,
        elapsed_ms = started.elapsed().as_millis() as u64
    );
    Ok(inspection)
}

fn inspect_zip<R: Read + Seek>(
    zip: &mut ZipArchive<R>,
    limits: &ResourceLimits,
    min_format_major: u64,
    progress: &Progress,
) -> Inspection {
    let mut findings = Vec::new();
    let mut detail = PreflightDetail {
        entries: zip.len() as u64,
        ..PreflightDetail::default()
    };

    let table = entries::scan(zip, limits, &mut findings);
    detail.total_uncompressed_bytes = table.total_uncompressed;
    if findings.iter().any(Finding::is_blocking) {
        return Inspection::finish(findings, detail, None, ChecksumSet::new(), table, None);
    }

    let manifest = match read_metadata(zip, &table, MANIFEST_PATH, limits)
        .and_then(|bytes| Manifest::parse(&bytes).map_err(|err| Finding::from_error(&err)))
    {
        Ok(manifest) => manifest,
        Err(finding) => {
            findings.push(finding.with_path(MANIFEST_PATH));
            return Inspection::finish(findings, detail, None, ChecksumSet::new(), table, None);
        }
    };

    if let Some(finding) = compatibility(&manifest, min_format_major) {
        let stop = finding.is_blocking();
        findings.push(finding);
        if stop {
            return Inspection::finish(findings, detail, Some(manifest), ChecksumSet::new(), table, None);
        }
    }

    for required in REQUIRED_ENTRIES {
        if table.file(required).is_none() {
            findings.push(
                Finding::blocking(codes::PREFLIGHT_MISSING_ENTRY, "A required file is missing.")
                    .with_path(required),
            );
        }
    }
    check_required_names(&table, &mut findings);

    let checksums = match read_metadata(zip, &table, CHECKSUMS_PATH, limits).and_then(|bytes| {
        ChecksumSet::parse(&bytes).map_err(|err| {
            Finding::blocking(
                codes::PREFLIGHT_MANIFEST_INVALID,
                format!("The checksum file is invalid: {err}"),
            )
        })
    }) {
        Ok(checksums) => checksums,
        Err(finding) => {
            if table.file(CHECKSUMS_PATH).is_some() {
                findings.push(finding.with_path(CHECKSUMS_PATH));
            }
            return Inspection::finish(findings, detail, Some(manifest), ChecksumSet::new(), table, None);
        }
    };

    detail.verified_files = verify_checksums(zip, &table, &checksums, &manifest, limits, progress, &mut findings);

    let plans = payload_plans(&manifest, &mut findings);
    if let Some(plans) = &plans {
        detail.migrations = [&plans.history, &plans.dictionary, &plans.settings]
            .iter()
            .flat_map(|plan| plan.describe())
            .collect();
    }

    detail.media = plan_media(&table, &mut findings);

    for warning in &manifest.warnings {
        let mut finding = Finding::recoverable(
            codes::PREFLIGHT_EXPORT_WARNING,
            format!("{} ({})", warning.message, warning.code),
        );
        finding.path = warning.path.clone();
        findings.push(finding);
    }

    Inspection::finish(findings, detail, Some(manifest), checksums, table, plans)
}

fn headline(manifest: &Manifest) -> Headline {
    let components = &manifest.components;
    Headline {
        created_at: manifest.created_at.clone(),
        app_version: manifest.app_version.clone(),
        platform: format!("{}/{}", manifest.platform.os, manifest.platform.arch),
        scope: manifest.scope,
        format_version: manifest.format_version.clone(),
        counts: ItemCounts {
            history: components.history.count,
            dictionary: components.dictionary.count,
            settings: components.settings.count,
            recordings: components.recordings.count,
            recordings_bytes: components.recordings.bytes,
        },
    }
}

fn compatibility(manifest: &Manifest, min_format_major: u64) -> Option<Finding> {
    let version = match manifest.format_version() {
        Ok(version) => version,
        Err(err) => return Some(Finding::from_error(&err)),
    };
    if version.major > CURRENT_FORMAT_MAJOR {
        return Some(Finding::blocking(
            codes::PREFLIGHT_FORMAT_TOO_NEW,
            format!(
                "This backup was made by a newer version of Codictate (format {version}). Update the app first, then restore."
            ),
        ));
    }
    if version.major < min_format_major {
        return Some(Finding::blocking(
            codes::PREFLIGHT_FORMAT_TOO_OLD,
            format!(
                "This backup format ({version}) is no longer supported. Restore it with an older version of Codictate, then create a new backup."
            ),
        ));
    }
    if version.major < CURRENT_FORMAT_MAJOR {
        return Some(Finding::recoverable(
            codes::PREFLIGHT_FORMAT_DEPRECATED,
            format!(
                "This backup uses an older format ({version}). It will be upgraded; support for it will end in a future release."
            ),
        ));
    }
    None
}

// Everything outside recordings/ must be valid on every platform as is.
fn check_required_names(table: &EntryTable, findings: &mut Vec<Finding>) {
    for (name, _) in table.files() {
        if archive::media_name(name).is_some() {
            continue;
        }
        if let Some(reason) = name
            .split('/')
            .find_map(|segment| validate_component(segment).err())
        {
            findings.push(
                Finding::blocking(
                    codes::PREFLIGHT_INVALID_REQUIRED_NAME,
                    format!("A file name in the backup is not portable: {reason}."),
                )
                .with_path(name),
            );
        }
    }
}

fn read_metadata<R: Read + Seek>(
    zip: &mut ZipArchive<R>,
    table: &EntryTable,
    name: &str,
    limits: &ResourceLimits,
) -> Result<Vec<u8>, Finding> {
    let meta = table.file(name).ok_or_else(|| {
        Finding::blocking(codes::PREFLIGHT_MISSING_ENTRY, "A required file is missing.")
    })?;
    if meta.size > limits.max_metadata_bytes {
        return Err(Finding::blocking(
            codes::PREFLIGHT_LIMIT_EXCEEDED,
            "A metadata file is too large.",
        ));
    }
    let file = zip.by_index(meta.index).map_err(|err| {
        Finding::blocking(
            codes::PREFLIGHT_ARCHIVE_UNREADABLE,
            format!("A metadata file could not be read: {err}"),
        )
    })?;
    let mut bytes = Vec::new();
    file.take(limits.max_metadata_bytes + 1)
        .read_to_end(&mut bytes)
        .map_err(|err| {
            Finding::blocking(
                codes::PREFLIGHT_CHECKSUM_MISMATCH,
                format!("A metadata file is damaged: {err}"),
            )
        })?;
    if bytes.len() as u64 > limits.max_metadata_bytes {
        return Err(Finding::blocking(
            codes::PREFLIGHT_LIMIT_EXCEEDED,
            "A metadata file is too large.",
        ));
    }
    Ok(bytes)
}

fn verify_checksums<R: Read + Seek>(
    zip: &mut ZipArchive<R>,
    table: &EntryTable,
    checksums: &ChecksumSet,
    manifest: &Manifest,
    limits: &ResourceLimits,
    progress: &Progress,
    findings: &mut Vec<Finding>,
) -> u64 {
    let files: Vec<(&str, &EntryMeta)> = table
        .files()
        .filter(|(name, _)| *name != CHECKSUMS_PATH)
        .collect();
    let total = files.len() as u64;
    let mut verified = 0u64;

    for (position, (name, meta)) in files.into_iter().enumerate() {
        progress.emit(Phase::Checksums, position as u64, total);
        let Some(expected) = checksums.get(name) else {
            findings.push(
                Finding::blocking(
                    codes::PREFLIGHT_CHECKSUM_UNLISTED,
                    "A file in the backup has no checksum.",
                )
                .with_path(name),
            );
            continue;
        };
        match hash_entry(zip, name, meta, manifest, limits) {
            Ok(actual) if actual == expected => verified += 1,
            Ok(_) => findings.push(
                Finding::blocking(
                    codes::PREFLIGHT_CHECKSUM_MISMATCH,
                    "A file in the backup is damaged (checksum mismatch).",
                )
                .with_path(name),
            ),
            Err(finding) => findings.push(finding.with_path(name)),
        }
    }
    progress.emit(Phase::Checksums, total, total);

    for listed in checksums.paths() {
        if table.file(listed).is_none() {
            findings.push(
                Finding::blocking(
                    codes::PREFLIGHT_MISSING_ENTRY,
                    "A file listed in the checksums is missing from the backup.",
                )
                .with_path(listed),
            );
        }
    }
    verified
}

fn hash_entry<R: Read + Seek>(
    zip: &mut ZipArchive<R>,
    name: &str,
    meta: &EntryMeta,
    manifest: &Manifest,
    limits: &ResourceLimits,
) -> Result<String, Finding> {
    let damaged = |err: io::Error| {
        Finding::blocking(
            codes::PREFLIGHT_CHECKSUM_MISMATCH,
            format!("A file in the backup is damaged: {err}"),
        )
    };
    let file = zip.by_index(meta.index).map_err(|err| {
        Finding::blocking(
            codes::PREFLIGHT_ARCHIVE_UNREADABLE,
            format!("A file in the backup could not be opened: {err}"),
        )
    })?;
    let mut reader = HashingReader::new(file.take(limits.max_entry_bytes + 1));

    if name == HISTORY_PATH {
        let lines = count_lines(BufReader::new(&mut reader), limits.max_line_bytes).map_err(
            |err| match err {
                LineError::TooLong { line, limit } => Finding::blocking(
                    codes::PREFLIGHT_LIMIT_EXCEEDED,
                    format!("History line {line} is longer than {limit} bytes."),
                ),
                LineError::Io { source, .. } => damaged(source),
            },
        )?;
        if lines != manifest.components.history.count {
            return Err(Finding::blocking(
                codes::PREFLIGHT_COUNT_MISMATCH,
                format!(
                    "The backup lists {} records but contains {lines}.",
                    manifest.components.history.count
                ),
            ));
        }
    } else {
        io::copy(&mut reader, &mut io::sink()).map_err(damaged)?;
    }

    let (digest, read) = reader.finish();
    if read > limits.max_entry_bytes {
        return Err(Finding::blocking(
            codes::PREFLIGHT_LIMIT_EXCEEDED,
            format!("Entry is larger than {} bytes.", limits.max_entry_bytes),
        ));
    }
    if read != meta.size {
        return Err(Finding::blocking(
            codes::PREFLIGHT_CHECKSUM_MISMATCH,
            "A file in the backup does not match its recorded size.",
        ));
    }
    Ok(digest)
}

fn payload_plans(manifest: &Manifest, findings: &mut Vec<Finding>) -> Option<PayloadPlans> {
    let components = &manifest.components;
    let mut plan = |component: Component, version: u32| match Plan::for_component(component, version) {
        Ok(plan) => Some(plan),
        Err(err) => {
            findings.push(Finding::from_error(&AppError::from(err)));
            None
        }
    };
    let history = plan(Component::History, components.history.payload_version);
    let dictionary = plan(Component::Dictionary, components.dictionary.payload_version);
    let settings = plan(Component::Settings, components.settings.payload_version);
    Some(PayloadPlans {
        history: history?,
        dictionary: dictionary?,
        settings: settings?,
    })
}

/// Target names for media entries, in archive-name order so the result is
/// deterministic. Unusable names are skipped with a recoverable finding.
fn plan_media(table: &EntryTable, findings: &mut Vec<Finding>) -> Vec<MediaPlan> {
    let mut taken = HashSet::new();
    let mut plans = Vec::new();

    for (entry, _) in table.files() {
        let Some(name) = archive::media_name(entry) else {
            continue;
        };
        let candidate = if name.contains('/') {
            findings.push(
                Finding::recoverable(
                    codes::PREFLIGHT_MEDIA_NAME_INVALID,
                    "Nested recording folders are not supported; the file will be skipped.",
                )
                .with_path(entry),
            );
            None
        } else if validate_component(name).is_ok() {
            Some(name.to_string())
        } else {
            let sanitized = sanitize_component(name);
            match &sanitized {
                Some(fixed) => findings.push(
                    Finding::recoverable(
                        codes::PREFLIGHT_MEDIA_NAME_SANITIZED,
                        format!("Recording will be restored as `{fixed}`."),
                    )
                    .with_path(entry),
                ),
                None => findings.push(
                    Finding::recoverable(
                        codes::PREFLIGHT_MEDIA_NAME_INVALID,
                        "Recording name cannot be used on this system; the file will be skipped.",
                    )
                    .with_path(entry),
                ),
            }
            sanitized
        };

        let target_name = candidate.map(|candidate| {
            let unique = unique_name(&candidate, &mut taken);
            if unique != candidate {
                findings.push(
                    Finding::recoverable(
                        codes::PREFLIGHT_MEDIA_NAME_SANITIZED,
                        format!("Recording will be restored as `{unique}` to avoid a name clash."),
                    )
                    .with_path(entry),
                );
            }
            unique
        });
        plans.push(MediaPlan {
            archive_name: name.to_string(),
            target_name,
        });
    }
    plans
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::manifest::{ComponentInfo, Components, MediaInfo};
    use crate::archive::Scope;

    fn manifest(format: &str) -> Manifest {
        let info = ComponentInfo {
            payload_version: 2,
            count: 0,
        };
        let mut manifest = Manifest::new(
            Scope::Lightweight,
            Components {
                history: info,
                dictionary: info,
                settings: info,
                recordings: MediaInfo::default(),
            },
            Vec::new(),
        );
        manifest.format_version = format.to_string();
        manifest
    }

    #[test]
    fn format_window_is_enforced() {
        let too_new = compatibility(&manifest("3.0.0"), 1).expect("finding");
        assert_eq!(too_new.code, codes::PREFLIGHT_FORMAT_TOO_NEW);
        assert!(too_new.message.contains("Update the app first"));

        let deprecated = compatibility(&manifest("1.4.0"), 1).expect("finding");
        assert_eq!(deprecated.code, codes::PREFLIGHT_FORMAT_DEPRECATED);
        assert!(!deprecated.is_blocking());

        let too_old = compatibility(&manifest("1.4.0"), 2).expect("finding");
        assert_eq!(too_old.code, codes::PREFLIGHT_FORMAT_TOO_OLD);

        assert!(compatibility(&manifest("2.1.0"), 1).is_none());
        assert!(compatibility(&manifest("two"), 1).expect("finding").is_blocking());
    }

    #[test]
    fn media_plans_sanitize_and_dedupe() {
        let mut table = EntryTable::default();
        for (index, name) in ["recordings/a.wav", "recordings/A.wav", "recordings/b:c.wav", "recordings/CON"]
            .into_iter()
            .enumerate()
        {
            table.entries.insert(
                name.to_string(),
                EntryMeta {
                    index,
                    size: 1,
                    compressed_size: 1,
                    is_dir: false,
                },
            );
        }
        let mut findings = Vec::new();
        let plans = plan_media(&table, &mut findings);
        let targets: Vec<Option<&str>> = plans.iter().map(|p| p.target_name.as_deref()).collect();
        // BTreeMap order: "A.wav" < "CON" < "a.wav" < "b:c.wav".
        assert_eq!(targets, vec![Some("A.wav"), Some("_CON"), Some("a-1.wav"), Some("b_c.wav")]);
        assert!(findings.iter().all(|f| !f.is_blocking()));
        assert_eq!(findings.len(), 3);
    }
}
