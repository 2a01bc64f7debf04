#![allow(clippy::unwrap_used, clippy::expect_used, dead_code)]

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use codictate_backup::archive::checksums::{sha256_hex, ChecksumSet};
use codictate_backup::archive::CHECKSUMS_PATH;
use codictate_backup::config::EngineConfig;
use codictate_backup::fs_ops::tree_digest;
use codictate_backup::paths::{DataLayout, DatasetPaths};
use codictate_backup::state::WriteGate;
use codictate_backup::store::{
    dictionary, settings, AppSettings, AudioStatus, CustomWordEntry, HistoryStore,
    NewHistoryEntry,
};
use codictate_backup::BackupEngine;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

pub const PLENTY_OF_SPACE: u64 = 1 << 40;

pub fn config(data_dir: &Path) -> EngineConfig {
    EngineConfig::new(data_dir).with_free_space_override(PLENTY_OF_SPACE)
}

pub fn engine(data_dir: &Path) -> BackupEngine {
    BackupEngine::new(config(data_dir))
}

pub fn active(data_dir: &Path) -> DatasetPaths {
    DatasetPaths::new(DataLayout::new(data_dir).active())
}

pub fn record(timestamp: i64, text: &str, audio: Option<&str>) -> NewHistoryEntry {
    NewHistoryEntry {
        file_name: audio.map(str::to_string),
        timestamp,
        saved: timestamp % 2 == 0,
        title: format!("Recording {timestamp}"),
        transcription_text: text.to_string(),
        post_processed_text: None,
        post_process_prompt: None,
        duration_ms: 1_500,
        audio_status: if audio.is_some() {
            AudioStatus::Available
        } else {
            AudioStatus::None
        },
    }
}

/// A small but complete live dataset: three records (two with audio),
/// a dictionary, customised settings including a secret.
pub fn seed_dataset(data_dir: &Path) -> DatasetPaths {
    let paths = active(data_dir);
    fs::create_dir_all(paths.recordings()).unwrap();
    let gate = WriteGate::default();

    let mut store = HistoryStore::open(&paths.history_db()).unwrap();
    for entry in [
        record(1_700_000_000_000, "hello world from codictate", Some("codictate-1.wav")),
        record(1_700_000_100_000, "second note", None),
        record(1_700_086_400_000, "third one with audio", Some("codictate-3.wav")),
    ] {
        if let Some(name) = &entry.file_name {
            fs::write(paths.recording(name), fake_wav(name)).unwrap();
        }
        store.insert(&gate, &entry).unwrap();
    }
    store.close().unwrap();

    dictionary::save(
        &gate,
        &paths.dictionary(),
        &[
            CustomWordEntry::word("Codictate"),
            CustomWordEntry {
                input: "gonna".into(),
                aliases: vec!["gunna".into()],
                replacement: "going to".into(),
                is_replacement: true,
            },
        ],
    )
    .unwrap();

    let mut prefs = AppSettings {
        selected_language: "de".into(),
        history_limit: 25,
        ..AppSettings::default()
    };
    prefs
        .post_process_api_keys
        .insert("openai".into(), "sk-live-secret".into());
    prefs.selected_microphone = Some("Studio Mic".into());
    settings::save(&gate, &paths.settings(), &prefs).unwrap();
    paths
}

pub fn empty_dataset(data_dir: &Path) -> DatasetPaths {
    let paths = active(data_dir);
    fs::create_dir_all(&paths.root()).unwrap();
    HistoryStore::open(&paths.history_db()).unwrap().close().unwrap();
    paths
}

pub fn fake_wav(name: &str) -> Vec<u8> {
    let mut bytes = b"RIFF\0\0\0\0WAVEfmt ".to_vec();
    bytes.extend_from_slice(name.as_bytes());
    bytes.extend(std::iter::repeat(0u8).take(2048));
    bytes
}

pub fn dataset_digest(data_dir: &Path) -> String {
    tree_digest(active(data_dir).root()).unwrap()
}

pub fn read_entries(archive: &Path) -> Vec<(String, Vec<u8>)> {
    let mut zip = ZipArchive::new(File::open(archive).unwrap()).unwrap();
    let mut out = Vec::new();
    for idx in 0..zip.len() {
        let mut entry = zip.by_index(idx).unwrap();
        let mut bytes = Vec::new();
        entry.read_to_end(&mut bytes).unwrap();
        out.push((entry.name().to_string(), bytes));
    }
    out
}

pub fn write_zip(path: &Path, entries: &[(String, Vec<u8>)]) {
    let mut writer = ZipWriter::new(File::create(path).unwrap());
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);
    for (name, bytes) in entries {
        if name.ends_with('/') {
            writer.add_directory(name.as_str(), options).unwrap();
        } else {
            writer.start_file(name.as_str(), options).unwrap();
            writer.write_all(bytes).unwrap();
        }
    }
    writer.finish().unwrap();
}

/// Checksum file for `entries`, covering every file but itself.
pub fn checksums_for(entries: &[(String, Vec<u8>)]) -> Vec<u8> {
    let mut set = ChecksumSet::new();
    for (name, bytes) in entries {
        if name != CHECKSUMS_PATH && !name.ends_with('/') {
            set.insert(name.clone(), sha256_hex(bytes));
        }
    }
    set.render().into_bytes()
}

/// Copy `source` to `target`, letting `edit` change entries. With
/// `reseal`, the checksum file is regenerated afterwards.
pub fn rewrite_archive<F>(source: &Path, target: &Path, reseal: bool, mut edit: F)
where
    F: FnMut(&mut Vec<(String, Vec<u8>)>),
{
    let mut entries = read_entries(source);
    edit(&mut entries);
    if reseal {
        let sums = checksums_for(&entries);
        for (name, bytes) in entries.iter_mut() {
            if name == CHECKSUMS_PATH {
                *bytes = sums.clone();
            }
        }
    }
    write_zip(target, &entries);
}

pub fn set_entry(entries: &mut [(String, Vec<u8>)], name: &str, bytes: Vec<u8>) {
    let slot = entries
        .iter_mut()
        .find(|(entry, _)| entry == name)
        .unwrap_or_else(|| panic!("no entry {name}"));
    slot.1 = bytes;
}

pub fn entry<'a>(entries: &'a [(String, Vec<u8>)], name: &str) -> &'a [u8] {
    &entries
        .iter()
        .find(|(entry, _)| entry == name)
        .unwrap_or_else(|| panic!("no entry {name}"))
        .1
}

pub fn archive_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}.codictatebackup"))
}
