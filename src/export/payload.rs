use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use unicode_normalization::UnicodeNormalization;
use walkdir::WalkDir;

use crate::archive::checksums::ChecksumSet;
use crate::archive::manifest::{ComponentInfo, Components, Manifest, MediaInfo, ManifestWarning};
use crate::archive::records::{HistoryLine, StatsSnapshot, HISTORY_PAYLOAD_VERSION, STATS_PAYLOAD_VERSION};
use crate::archive::{
    Scope, CHECKSUMS_PATH, DICTIONARY_PATH, HISTORY_PATH, MANIFEST_PATH, RECORDINGS_PREFIX,
    SETTINGS_PATH, STATS_PATH,
};
use crate::error::codes;
use crate::fs_ops::{file_sha256, sync_file, write_atomic};
use crate::ops::report::Finding;
use crate::ops::{CancelToken, Phase, Progress};
use crate::paths::DatasetPaths;
use crate::security::filenames::{check_entry_path, portable_archive_path, unique_name};
use crate::security::hash_path;
use crate::store::dictionary::{self, DictionaryFile, DICTIONARY_VERSION};
use crate::store::settings::{self, export_fields, SETTINGS_PAYLOAD_VERSION};
use crate::store::HistoryStore;
use crate::{AppError, AppResult};

const PROGRESS_EVERY: u64 = 500;

/// The payload tree of one export, laid out exactly as inside the archive.
pub struct PayloadTree {
    root: PathBuf,
}

/// What went into the payload: component counts and the media entries that
/// were actually copied.
#[derive(Debug, Default)]
pub struct Serialized {
    pub history: u64,
    pub dictionary: u64,
    pub settings: u64,
    pub recordings: u64,
    pub recordings_bytes: u64,
    pub warnings: Vec<Finding>,
}

impl PayloadTree {
    pub fn create(root: PathBuf) -> AppResult<Self> {
        for dir in ["history", "dictionary", "settings"] {
            let path = root.join(dir);
            fs::create_dir_all(&path).map_err(|err| {
                AppError::from(err)
                    .with_context("operation", "export_payload_mkdir")
                    .with_context("path_hash", hash_path(&path))
            })?;
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, relative: &str) -> PathBuf {
        relative
            .split('/')
            .fold(self.root.clone(), |path, segment| path.join(segment))
    }

    /// History lines, stats, dictionary and the allow-listed settings, all
    /// read from the fenced snapshot rather than the live stores.
    pub fn serialize(
        &self,
        snapshot: &DatasetPaths,
        media_source: &DatasetPaths,
        scope: Scope,
        progress: &Progress,
        cancel: &CancelToken,
    ) -> AppResult<Serialized> {
        let mut out = Serialized::default();
        let mut media = MediaNames::default();

        let history_path = self.path(HISTORY_PATH);
        let file = File::create(&history_path).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "export_history_create")
                .with_context("path_hash", hash_path(&history_path))
        })?;
        let mut writer = BufWriter::new(file);

        let stats = if snapshot.history_db().exists() {
            let store = HistoryStore::open_read_only(&snapshot.history_db())?;
            let total = store.count()?;
            progress.emit(Phase::Serialize, 0, total);
            store.for_each_entry(|entry| {
                let mut line = HistoryLine::from_entry(&entry);
                if let Some(audio) = line.audio.as_mut() {
                    let stored = std::mem::take(&mut audio.file_name);
                    audio.file_name = media.archive_name(stored, &mut out.warnings);
                }
                serde_json::to_writer(&mut writer, &line).map_err(|err| {
                    AppError::from(err).with_context("operation", "export_history_line")
                })?;
                writer.write_all(b"\n").map_err(|err| {
                    AppError::from(err).with_context("operation", "export_history_write")
                })?;
                out.history += 1;
                if out.history % PROGRESS_EVERY == 0 {
                    progress.emit(Phase::Serialize, out.history, total);
                }
                Ok(())
            })?;
            let stats = store.read_stats()?;
            store.close()?;
            stats
        } else {
            Default::default()
        };

        let file = writer.into_inner().map_err(|err| {
            AppError::from(err.into_error()).with_context("operation", "export_history_flush")
        })?;
        file.sync_all().map_err(|err| {
            AppError::from(err).with_context("operation", "export_history_sync")
        })?;
        progress.emit(Phase::Serialize, out.history, out.history);

        write_json(
            &self.path(STATS_PATH),
            &StatsSnapshot {
                version: STATS_PAYLOAD_VERSION,
                stats,
            },
            "export_stats",
        )?;

        let entries = dictionary::load(&snapshot.dictionary())?;
        out.dictionary = entries.len() as u64;
        write_json(
            &self.path(DICTIONARY_PATH),
            &DictionaryFile {
                version: DICTIONARY_VERSION,
                entries,
            },
            "export_dictionary",
        )?;

        let current = settings::load(&snapshot.settings())?;
        let payload = export_fields(&current);
        out.settings = payload.fields.len() as u64;
        write_json(&self.path(SETTINGS_PATH), &payload, "export_settings")?;

        if scope.includes_media() {
            cancel.checkpoint(Phase::Media)?;
            self.copy_media(media_source, &media.by_archive, &mut out, progress)?;
        }

        tracing::debug!(
            target: "codictate_backup",
            event = "export_payload_serialized",
            history = out.history,
            dictionary = out.dictionary,
            settings = out.settings,
            recordings = out.recordings,
            history_version = HISTORY_PAYLOAD_VERSION,
            settings_version = SETTINGS_PAYLOAD_VERSION
        );
        Ok(out)
    }

    fn copy_media(
        &self,
        source: &DatasetPaths,
        referenced: &BTreeMap<String, String>,
        out: &mut Serialized,
        progress: &Progress,
    ) -> AppResult<()> {
        let target_dir = self.path(RECORDINGS_PREFIX.trim_end_matches('/'));
        fs::create_dir_all(&target_dir).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "export_media_mkdir")
                .with_context("path_hash", hash_path(&target_dir))
        })?;

        let total = referenced.len() as u64;
        progress.emit(Phase::Media, 0, total);
        for (idx, (archive_name, stored)) in referenced.iter().enumerate() {
            let entry_path = format!("{RECORDINGS_PREFIX}{archive_name}");
            let source_path = source.recording(stored);
            let usable = check_entry_path(&entry_path).is_ok()
                && !stored.contains(['/', '\\'])
                && source_path.is_file();
            if !usable {
                tracing::warn!(
                    target: "codictate_backup",
                    event = "export_media_missing",
                    path_hash = %hash_path(&source_path)
                );
                out.warnings.push(
                    Finding::recoverable(
                        codes::EXPORT_MEDIA_MISSING,
                        format!("Recording {archive_name} is missing and was left out."),
                    )
                    .with_path(entry_path),
                );
                continue;
            }

            let target = target_dir.join(archive_name);
            let copied = fs::copy(&source_path, &target).map_err(|err| {
                AppError::from(err)
                    .with_context("operation", "export_media_copy")
                    .with_context("path_hash", hash_path(&source_path))
            })?;
            out.recordings += 1;
            out.recordings_bytes += copied;
            progress.emit(Phase::Media, idx as u64 + 1, total);
        }
        Ok(())
    }

    pub fn write_manifest(&self, scope: Scope, serialized: &Serialized) -> AppResult<Manifest> {
        let info = |payload_version: u32, count: u64| ComponentInfo {
            payload_version,
            count,
        };
        let components = Components {
            history: info(HISTORY_PAYLOAD_VERSION, serialized.history),
            dictionary: info(DICTIONARY_VERSION, serialized.dictionary),
            settings: info(SETTINGS_PAYLOAD_VERSION, serialized.settings),
            recordings: MediaInfo {
                count: serialized.recordings,
                bytes: serialized.recordings_bytes,
            },
        };
        let warnings = serialized
            .warnings
            .iter()
            .map(|finding| ManifestWarning {
                code: finding.code.clone(),
                message: finding.message.clone(),
                path: finding.path.clone(),
            })
            .collect();
        let manifest = Manifest::new(scope, components, warnings);
        write_json(&self.path(MANIFEST_PATH), &manifest, "export_manifest")?;
        Ok(manifest)
    }

    /// Hashes every file in the tree (manifest included) and writes the
    /// checksum file. Returns the archive entry names in packaging order.
    pub fn write_checksums(&self) -> AppResult<(ChecksumSet, Vec<(String, PathBuf)>)> {
        let mut set = ChecksumSet::new();
        let mut files = Vec::new();
        for entry in WalkDir::new(&self.root).min_depth(1).sort_by_file_name() {
            let entry = entry.map_err(|err| {
                AppError::from(std::io::Error::from(err))
                    .with_context("operation", "export_checksum_walk")
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry.path().strip_prefix(&self.root).map_err(|_| {
                AppError::new(codes::EXPORT_PAYLOAD, "Payload file outside the export workspace.")
                    .with_context("path_hash", hash_path(entry.path()))
            })?;
            let name = portable_archive_path(relative).ok_or_else(|| {
                AppError::new(codes::EXPORT_PAYLOAD, "Payload file name is not portable.")
                    .with_context("path_hash", hash_path(entry.path()))
            })?;
            let digest = file_sha256(entry.path()).map_err(|err| {
                AppError::from(err).with_context("operation", "export_checksum_hash")
            })?;
            set.insert(name.clone(), digest);
            files.push((name, entry.path().to_path_buf()));
        }

        write_atomic(&self.path(CHECKSUMS_PATH), set.render().as_bytes()).map_err(|err| {
            AppError::from(err).with_context("operation", "export_checksums_write")
        })?;

        files.push((CHECKSUMS_PATH.to_string(), self.path(CHECKSUMS_PATH)));
        files.sort_by_key(|(name, _)| packaging_rank(name));
        Ok((set, files))
    }
}

/// Manifest first, then the checksum file, payloads, and media last.
fn packaging_rank(name: &str) -> (u8, String) {
    let rank = match name {
        MANIFEST_PATH => 0,
        CHECKSUMS_PATH => 1,
        _ if name.starts_with(RECORDINGS_PREFIX) => 3,
        _ => 2,
    };
    (rank, name.to_string())
}

/// Archive names of referenced recordings. Archive names are NFC, so two
/// stored names that only differ in normalization need distinct entries.
#[derive(Debug, Default)]
struct MediaNames {
    by_archive: BTreeMap<String, String>,
    by_stored: HashMap<String, String>,
    taken: HashSet<String>,
}

impl MediaNames {
    fn archive_name(&mut self, stored: String, warnings: &mut Vec<Finding>) -> String {
        if let Some(name) = self.by_stored.get(&stored) {
            return name.clone();
        }
        let nfc: String = stored.nfc().collect();
        let name = if self.by_archive.contains_key(&nfc) {
            let renamed = unique_name(&nfc, &mut self.taken);
            tracing::warn!(
                target: "codictate_backup",
                event = "export_media_name_collision",
                path_hash = %hash_path(Path::new(&stored))
            );
            warnings.push(
                Finding::recoverable(
                    codes::EXPORT_MEDIA_NAME_COLLISION,
                    format!("Two recordings are named {nfc}; one was exported as {renamed}."),
                )
                .with_path(format!("{RECORDINGS_PREFIX}{renamed}")),
            );
            renamed
        } else {
            self.taken.insert(nfc.to_lowercase());
            nfc
        };
        self.by_archive.insert(name.clone(), stored.clone());
        self.by_stored.insert(stored, name.clone());
        name
    }
}

fn write_json<T: serde::Serialize>(path: &Path, value: &T, operation: &'static str) -> AppResult<()> {
    let bytes = serde_json::to_vec_pretty(value)
        .map_err(|err| AppError::from(err).with_context("operation", operation))?;
    fs::write(path, &bytes).map_err(|err| {
        AppError::from(err)
            .with_context("operation", operation)
            .with_context("path_hash", hash_path(path))
    })?;
    sync_file(path).map_err(|err| AppError::from(err).with_context("operation", operation))
}
