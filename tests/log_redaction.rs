#![allow(clippy::unwrap_used, clippy::expect_used)]

mod util;

use std::sync::{Arc, Mutex};

use codictate_backup::archive::Scope;
use codictate_backup::export::{self, ExportOptions};
use codictate_backup::restore::{self, RestoreOptions};
use tempfile::tempdir;
use tracing_subscriber::{fmt, EnvFilter};

#[test]
fn backup_and_restore_logs_carry_no_paths_or_content() {
    let buf = Arc::new(Mutex::new(Vec::<u8>::new()));
    let writer = buf.clone();
    let _ = fmt()
        .with_env_filter(EnvFilter::new("codictate_backup=trace"))
        .with_writer(move || Redactor(writer.clone()))
        .json()
        .try_init();

    let source = tempdir().unwrap();
    let target = tempdir().unwrap();
    let out = tempdir().unwrap();
    let paths = util::seed_dataset(source.path());
    std::fs::remove_file(paths.recording("codictate-3.wav")).unwrap();

    let archive = util::archive_path(out.path(), "logged");
    export::create_backup(
        util::engine(source.path()).context(),
        Scope::Full,
        &archive,
        &ExportOptions::default(),
    )
    .expect("export");
    restore::apply_restore(
        util::engine(target.path()).context(),
        &archive,
        true,
        &RestoreOptions::default(),
    )
    .expect("restore");
    let _ = restore::apply_restore(
        util::engine(target.path()).context(),
        &archive,
        false,
        &RestoreOptions::default(),
    );

    let s = String::from_utf8(buf.lock().unwrap().clone()).unwrap();
    for event in [
        "\"event\":\"export_started\"",
        "\"event\":\"export_complete\"",
        "\"event\":\"preflight_complete\"",
        "\"event\":\"rollback_snapshot_verified\"",
        "\"event\":\"restore_complete\"",
    ] {
        assert!(s.contains(event), "missing {event}");
    }
    for dir in [source.path(), target.path(), out.path()] {
        assert!(!s.contains(dir.to_string_lossy().as_ref()), "log leaked a raw path");
    }
    assert!(!s.contains("logged.codictatebackup"), "log leaked the archive name");
    assert!(!s.contains("codictate-3.wav"), "log leaked a media name");
    assert!(!s.contains("hello world from codictate"), "log leaked transcription text");
    assert!(!s.contains("sk-live-secret"), "log leaked a secret");
}

struct Redactor(Arc<Mutex<Vec<u8>>>);
impl std::io::Write for Redactor {
    fn write(&mut self, b: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(b);
        Ok(b.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
