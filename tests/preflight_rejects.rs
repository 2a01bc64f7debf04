#![allow(clippy::unwrap_used, clippy::expect_used)]

mod util;

use std::fs;
use std::path::{Path, PathBuf};

use codictate_backup::archive::{
    Scope, CHECKSUMS_PATH, DICTIONARY_PATH, HISTORY_PATH, MANIFEST_PATH, SETTINGS_PATH, STATS_PATH,
};
use codictate_backup::config::ResourceLimits;
use codictate_backup::error::codes;
use codictate_backup::export::{self, ExportOptions};
use codictate_backup::ops::report::PreflightReport;
use codictate_backup::ops::Progress;
use codictate_backup::paths::DataLayout;
use codictate_backup::preflight;
use codictate_backup::restore::{self, RestoreOptions};
use codictate_backup::store::{dictionary, settings, HistoryStore};
use serde_json::{json, Value};
use tempfile::{tempdir, TempDir};

struct Fixture {
    _source: TempDir,
    out: TempDir,
    archive: PathBuf,
}

fn exported() -> Fixture {
    let source = tempdir().unwrap();
    let out = tempdir().unwrap();
    util::seed_dataset(source.path());
    let archive = util::archive_path(out.path(), "baseline");
    let engine = util::engine(source.path());
    export::create_backup(engine.context(), Scope::Full, &archive, &ExportOptions::default())
        .expect("export");
    Fixture {
        _source: source,
        out,
        archive,
    }
}

fn inspect_with(archive: &Path, limits: ResourceLimits, min_major: u64) -> PreflightReport {
    preflight::inspect(archive, &limits, min_major, &Progress::silent())
        .expect("inspect")
        .report
}

fn inspect(archive: &Path) -> PreflightReport {
    inspect_with(archive, ResourceLimits::default(), 1)
}

fn codes_of(report: &PreflightReport) -> Vec<String> {
    report.findings.iter().map(|finding| finding.code.clone()).collect()
}

fn assert_restore_never_stages(archive: &Path, expected: &str) {
    let target = tempdir().unwrap();
    util::seed_dataset(target.path());
    let before = util::dataset_digest(target.path());
    let engine = util::engine(target.path());

    let err = restore::apply_restore(engine.context(), archive, true, &RestoreOptions::default())
        .expect_err("restore must be refused");
    assert_eq!(err.code(), expected);
    assert!(!DataLayout::new(target.path()).restore_root().exists());
    assert_eq!(util::dataset_digest(target.path()), before);
}

#[test]
fn untouched_export_passes_preflight() {
    let fixture = exported();
    let report = inspect(&fixture.archive);
    assert!(report.restorable, "{:?}", report.findings);
    assert!(report.findings.is_empty());
    assert_eq!(report.detail.verified_files, 7);
    assert!(report.detail.migrations.is_empty());
}

#[test]
fn flipped_bit_is_a_checksum_mismatch() {
    let fixture = exported();
    let tampered = fixture.out.path().join("tampered.codictatebackup");
    util::rewrite_archive(&fixture.archive, &tampered, false, |entries| {
        let (_, bytes) = entries.iter_mut().find(|(name, _)| name == HISTORY_PATH).unwrap();
        bytes[10] ^= 0x01;
    });

    let report = inspect(&tampered);
    assert!(!report.restorable);
    let first = report.first_blocking().unwrap();
    assert_eq!(first.code, codes::PREFLIGHT_CHECKSUM_MISMATCH);
    assert_eq!(first.path.as_deref(), Some(HISTORY_PATH));
    assert_restore_never_stages(&tampered, codes::PREFLIGHT_CHECKSUM_MISMATCH);
}

#[test]
fn tampered_media_is_detected_too() {
    let fixture = exported();
    let tampered = fixture.out.path().join("media.codictatebackup");
    util::rewrite_archive(&fixture.archive, &tampered, false, |entries| {
        let (_, bytes) = entries
            .iter_mut()
            .find(|(name, _)| name == "recordings/codictate-1.wav")
            .unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x80;
    });
    assert!(codes_of(&inspect(&tampered)).contains(&codes::PREFLIGHT_CHECKSUM_MISMATCH.to_string()));
}

#[test]
fn traversal_entry_is_rejected_before_extraction() {
    let fixture = exported();
    let evil = fixture.out.path().join("evil.codictatebackup");
    util::rewrite_archive(&fixture.archive, &evil, true, |entries| {
        entries.push(("../escaped.txt".into(), b"gotcha".to_vec()));
    });

    let report = inspect(&evil);
    assert_eq!(report.first_blocking().unwrap().code, codes::PREFLIGHT_UNSAFE_ENTRY);
    assert_eq!(report.detail.verified_files, 0);
    assert_restore_never_stages(&evil, codes::PREFLIGHT_UNSAFE_ENTRY);
    assert!(!fixture.out.path().join("escaped.txt").exists());
}

#[test]
fn absolute_entry_is_rejected() {
    let fixture = exported();
    let evil = fixture.out.path().join("absolute.codictatebackup");
    util::rewrite_archive(&fixture.archive, &evil, false, |entries| {
        entries.push(("/etc/codictate".into(), b"x".to_vec()));
    });
    assert_eq!(
        inspect(&evil).first_blocking().unwrap().code,
        codes::PREFLIGHT_UNSAFE_ENTRY
    );
}

#[test]
fn entry_count_ceiling_blocks_without_reading_content() {
    let fixture = exported();
    let limits = ResourceLimits {
        max_entries: 4,
        ..ResourceLimits::default()
    };
    let report = inspect_with(&fixture.archive, limits, 1);
    assert_eq!(codes_of(&report), vec![codes::PREFLIGHT_LIMIT_EXCEEDED.to_string()]);
    assert!(report.headline.is_none());
    assert_eq!(report.detail.verified_files, 0);

    let target = tempdir().unwrap();
    let engine = codictate_backup::BackupEngine::new(util::config(target.path()).with_limits(limits));
    let err = restore::apply_restore(engine.context(), &fixture.archive, true, &RestoreOptions::default())
        .expect_err("limits apply to restore too");
    assert_eq!(err.code(), codes::PREFLIGHT_LIMIT_EXCEEDED);
    assert!(!DataLayout::new(target.path()).restore_root().exists());
}

#[test]
fn single_entry_ceiling_blocks() {
    let fixture = exported();
    let limits = ResourceLimits {
        max_entry_bytes: 64,
        ..ResourceLimits::default()
    };
    let report = inspect_with(&fixture.archive, limits, 1);
    assert!(!report.restorable);
    assert!(report
        .blocking()
        .all(|finding| finding.code == codes::PREFLIGHT_LIMIT_EXCEEDED));
    assert_eq!(report.detail.verified_files, 0);
}

#[test]
fn newer_format_major_asks_for_an_update() {
    let fixture = exported();
    let newer = fixture.out.path().join("newer.codictatebackup");
    util::rewrite_archive(&fixture.archive, &newer, true, |entries| {
        let mut manifest: Value = serde_json::from_slice(util::entry(entries, MANIFEST_PATH)).unwrap();
        manifest["formatVersion"] = json!("3.0.0");
        util::set_entry(entries, MANIFEST_PATH, serde_json::to_vec(&manifest).unwrap());
    });

    let report = inspect(&newer);
    let first = report.first_blocking().unwrap();
    assert_eq!(first.code, codes::PREFLIGHT_FORMAT_TOO_NEW);
    assert!(first.message.contains("Update the app first"));
    assert!(report.summary().starts_with("Cannot restore this backup"));
    assert_restore_never_stages(&newer, codes::PREFLIGHT_FORMAT_TOO_NEW);
}

#[test]
fn count_disagreeing_with_manifest_is_blocking() {
    let fixture = exported();
    let short = fixture.out.path().join("short.codictatebackup");
    util::rewrite_archive(&fixture.archive, &short, true, |entries| {
        let text = String::from_utf8(util::entry(entries, HISTORY_PATH).to_vec()).unwrap();
        let kept: String = text.lines().skip(1).map(|line| format!("{line}\n")).collect();
        util::set_entry(entries, HISTORY_PATH, kept.into_bytes());
    });
    assert!(codes_of(&inspect(&short)).contains(&codes::PREFLIGHT_COUNT_MISMATCH.to_string()));
}

#[test]
fn unlisted_and_missing_entries_are_blocking() {
    let fixture = exported();
    let extra = fixture.out.path().join("extra.codictatebackup");
    util::rewrite_archive(&fixture.archive, &extra, false, |entries| {
        entries.push(("notes.txt".into(), b"smuggled".to_vec()));
    });
    assert!(codes_of(&inspect(&extra)).contains(&codes::PREFLIGHT_CHECKSUM_UNLISTED.to_string()));

    let missing = fixture.out.path().join("missing.codictatebackup");
    util::rewrite_archive(&fixture.archive, &missing, true, |entries| {
        entries.retain(|(name, _)| name != DICTIONARY_PATH);
    });
    let report = inspect(&missing);
    assert!(report
        .blocking()
        .any(|finding| finding.code == codes::PREFLIGHT_MISSING_ENTRY
            && finding.path.as_deref() == Some(DICTIONARY_PATH)));
}

#[test]
fn corrupt_record_aborts_restore_before_the_swap() {
    let fixture = exported();
    let broken = fixture.out.path().join("broken.codictatebackup");
    util::rewrite_archive(&fixture.archive, &broken, true, |entries| {
        let text = String::from_utf8(util::entry(entries, HISTORY_PATH).to_vec()).unwrap();
        let mut lines: Vec<String> = text.lines().map(str::to_string).collect();
        lines[1] = r#"{"id":2,"timestamp":"yesterday"}"#.to_string();
        util::set_entry(entries, HISTORY_PATH, format!("{}\n", lines.join("\n")).into_bytes());
    });
    assert!(inspect(&broken).restorable);

    let target = tempdir().unwrap();
    util::seed_dataset(target.path());
    let before = util::dataset_digest(target.path());
    let engine = util::engine(target.path());
    let err = restore::apply_restore(engine.context(), &broken, true, &RestoreOptions::default())
        .expect_err("corrupt record");
    assert_eq!(err.code(), codes::IMPORT_CORRUPT_RECORD);
    assert_eq!(util::dataset_digest(target.path()), before);
    let restore_root = DataLayout::new(target.path()).restore_root();
    let left = fs::read_dir(&restore_root).map(|dir| dir.count()).unwrap_or(0);
    assert_eq!(left, 0);
}

#[test]
fn unportable_media_name_is_sanitized_not_blocking() {
    let fixture = exported();
    let odd = fixture.out.path().join("odd.codictatebackup");
    util::rewrite_archive(&fixture.archive, &odd, true, |entries| {
        entries.push(("recordings/CON.wav".into(), util::fake_wav("con")));
    });
    let report = inspect(&odd);
    assert!(report.restorable, "{:?}", report.findings);
    assert!(codes_of(&report).contains(&codes::PREFLIGHT_MEDIA_NAME_SANITIZED.to_string()));
    let plan = report
        .detail
        .media
        .iter()
        .find(|plan| plan.archive_name == "CON.wav")
        .unwrap();
    assert_eq!(plan.target_name.as_deref(), Some("_CON.wav"));
}

fn v1_archive(dir: &Path) -> PathBuf {
    let history = [
        json!({"id": 7, "timestamp": 1_600_000_000_000_i64, "title": "Old", "transcription_text": "from the old days", "file_name": "old.wav"}),
        json!({"id": 8, "timestamp": 1_600_000_500_000_i64, "saved": true, "title": "Older", "transcription_text": "no audio here", "file_name": ""}),
    ]
    .iter()
    .map(|line| format!("{line}\n"))
    .collect::<String>();
    let manifest = json!({
        "formatVersion": "1.3.0",
        "createdAt": "2024-03-01T10:00:00.000Z",
        "appVersion": "0.9.2",
        "platform": {"os": "windows", "arch": "x86_64"},
        "scope": "full",
        "components": {
            "history": {"payloadVersion": 1, "count": 2},
            "dictionary": {"payloadVersion": 1, "count": 2},
            "settings": {"payloadVersion": 1, "count": 4}
        }
    });

    let mut entries: Vec<(String, Vec<u8>)> = vec![
        (MANIFEST_PATH.into(), serde_json::to_vec(&manifest).unwrap()),
        (CHECKSUMS_PATH.into(), Vec::new()),
        (HISTORY_PATH.into(), history.into_bytes()),
        (STATS_PATH.into(), b"{}".to_vec()),
        (DICTIONARY_PATH.into(), br#"["Codictate","Tauri"]"#.to_vec()),
        (
            SETTINGS_PATH.into(),
            br#"{"language":"fr","audio_feedback_volume":40,"history_limit":9,"retired_option":true}"#
                .to_vec(),
        ),
        ("recordings/".into(), Vec::new()),
        ("recordings/old.wav".into(), util::fake_wav("old")),
    ];
    let sums = util::checksums_for(&entries);
    util::set_entry(&mut entries, CHECKSUMS_PATH, sums);
    let path = util::archive_path(dir, "v1");
    util::write_zip(&path, &entries);
    path
}

#[test]
fn previous_major_is_upgraded_on_restore() {
    let out = tempdir().unwrap();
    let archive = v1_archive(out.path());

    let report = inspect(&archive);
    assert!(report.restorable, "{:?}", report.findings);
    assert!(codes_of(&report).contains(&codes::PREFLIGHT_FORMAT_DEPRECATED.to_string()));
    assert!(report.detail.migrations.contains(&"history v1 -> v2".to_string()));
    assert!(report.detail.migrations.contains(&"settings v1 -> v2".to_string()));

    let target = tempdir().unwrap();
    let engine = util::engine(target.path());
    let restored = restore::apply_restore(engine.context(), &archive, true, &RestoreOptions::default())
        .expect("v1 restore");
    assert_eq!(restored.counts.history, 2);
    assert_eq!(restored.settings.dropped, vec!["retired_option".to_string()]);

    let active = util::active(target.path());
    let entries = HistoryStore::open_read_only(&active.history_db()).unwrap().list().unwrap();
    assert_eq!(entries[0].file_name.as_deref(), Some("old.wav"));
    assert_eq!(entries[0].duration_ms, 0);
    assert_eq!(entries[1].file_name, None);
    assert!(entries[1].saved);

    let words = dictionary::load(&active.dictionary()).unwrap();
    assert_eq!(words.len(), 2);
    assert_eq!(words[1].input, "Tauri");

    let prefs = settings::load(&active.settings()).unwrap();
    assert_eq!(prefs.selected_language, "fr");
    assert!((prefs.audio_feedback_volume - 0.4).abs() < 1e-6);
    assert_eq!(prefs.history_limit, 9);
}

#[test]
fn dropped_major_is_refused_with_guidance() {
    let out = tempdir().unwrap();
    let archive = v1_archive(out.path());
    let report = inspect_with(&archive, ResourceLimits::default(), 2);
    let first = report.first_blocking().unwrap();
    assert_eq!(first.code, codes::PREFLIGHT_FORMAT_TOO_OLD);
    assert!(first.message.contains("older version"));
}
