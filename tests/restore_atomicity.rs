#![allow(clippy::unwrap_used, clippy::expect_used)]

mod util;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use codictate_backup::archive::Scope;
use codictate_backup::error::codes;
use codictate_backup::export::{self, ExportOptions};
use codictate_backup::ops::report::ReconcileAction;
use codictate_backup::ops::{Phase, Progress, ProgressEvent};
use codictate_backup::paths::{DataLayout, RollbackPaths};
use codictate_backup::restore::marker::{MarkerPhase, RestoreMarker};
use codictate_backup::restore::swap::{SwapManager, SwapPlan};
use codictate_backup::restore::{self, RestoreOptions};
use codictate_backup::store::settings as app_settings;
use codictate_backup::store::HistoryStore;
use codictate_backup::{AppError, BackupEngine};
use tempfile::{tempdir, TempDir};

const INJECTED: &str = "TEST/INJECTED";

/// A target machine with its own data plus an archive of different data.
struct Scenario {
    target: TempDir,
    _source: TempDir,
    _out: TempDir,
    archive: PathBuf,
    before: String,
}

fn scenario() -> Scenario {
    let source = tempdir().unwrap();
    let target = tempdir().unwrap();
    let out = tempdir().unwrap();

    util::seed_dataset(source.path());
    let archive = util::archive_path(out.path(), "incoming");
    export::create_backup(
        util::engine(source.path()).context(),
        Scope::Full,
        &archive,
        &ExportOptions::default(),
    )
    .unwrap();

    let local = util::empty_dataset(target.path());
    fs::create_dir_all(local.recordings()).unwrap();
    fs::write(local.recording("local.wav"), util::fake_wav("local")).unwrap();
    let before = util::dataset_digest(target.path());
    Scenario {
        target,
        _source: source,
        _out: out,
        archive,
        before,
    }
}

fn fail_at(phase: MarkerPhase) -> RestoreOptions {
    RestoreOptions {
        after_phase: Some(Arc::new(move |reached| {
            if reached == phase {
                Err(AppError::new(INJECTED, "injected failure"))
            } else {
                Ok(())
            }
        })),
        ..RestoreOptions::default()
    }
}

fn restore_leftovers(data_dir: &Path) -> Vec<String> {
    match fs::read_dir(DataLayout::new(data_dir).restore_root()) {
        Ok(entries) => entries
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect(),
        Err(_) => Vec::new(),
    }
}

#[test]
fn failure_at_every_phase_rolls_back() {
    for phase in [
        MarkerPhase::SnapshotReady,
        MarkerPhase::ActiveMoved,
        MarkerPhase::StagedActivated,
    ] {
        let scenario = scenario();
        let engine = util::engine(scenario.target.path());

        let err = restore::apply_restore(engine.context(), &scenario.archive, true, &fail_at(phase))
            .expect_err("injected failure");
        assert_eq!(err.code(), codes::RESTORE_ROLLED_BACK, "{phase:?}");
        assert_eq!(
            err.context().get("phase").map(String::as_str),
            Some(phase.as_str())
        );
        assert_eq!(err.cause().map(AppError::code), Some(INJECTED));

        assert_eq!(util::dataset_digest(scenario.target.path()), scenario.before, "{phase:?}");
        assert!(!DataLayout::new(scenario.target.path()).marker().exists());
        assert_eq!(restore_leftovers(scenario.target.path()), Vec::<String>::new());
        assert!(!engine.write_gate().is_quiesced());
    }
}

#[test]
fn engine_is_usable_after_a_rollback() {
    let scenario = scenario();
    let engine = util::engine(scenario.target.path());
    restore::apply_restore(
        engine.context(),
        &scenario.archive,
        true,
        &fail_at(MarkerPhase::ActiveMoved),
    )
    .expect_err("injected failure");

    let report = restore::apply_restore(engine.context(), &scenario.archive, true, &RestoreOptions::default())
        .expect("second attempt");
    assert_eq!(report.counts.history, 3);
    let store = HistoryStore::open_read_only(&util::active(scenario.target.path()).history_db()).unwrap();
    assert_eq!(store.count().unwrap(), 3);
    assert!(!util::active(scenario.target.path()).recording("local.wav").exists());
}

#[test]
fn restore_needs_confirmation() {
    let scenario = scenario();
    let engine = util::engine(scenario.target.path());
    let err = restore::apply_restore(engine.context(), &scenario.archive, false, &RestoreOptions::default())
        .expect_err("unconfirmed");
    assert_eq!(err.code(), codes::RESTORE_CONFIRMATION_REQUIRED);
    assert_eq!(util::dataset_digest(scenario.target.path()), scenario.before);
    assert!(restore_leftovers(scenario.target.path()).is_empty());
}

#[test]
fn cancel_before_swap_changes_nothing() {
    let scenario = scenario();
    let engine = util::engine(scenario.target.path());

    let canceled = RestoreOptions::default();
    canceled.cancel.cancel();
    let err = restore::apply_restore(engine.context(), &scenario.archive, true, &canceled)
        .expect_err("canceled up front");
    assert_eq!(err.code(), codes::OPERATION_CANCELED);
    assert_eq!(util::dataset_digest(scenario.target.path()), scenario.before);
    assert!(restore_leftovers(scenario.target.path()).is_empty());
}

#[test]
fn cancel_at_the_last_checkpoint_rolls_back_quietly() {
    let scenario = scenario();
    let engine = util::engine(scenario.target.path());

    let mut opts = RestoreOptions::default();
    let token = opts.cancel.clone();
    opts.after_phase = Some(Arc::new(move |phase| {
        if phase == MarkerPhase::SnapshotReady {
            token.cancel();
        }
        Ok(())
    }));
    let err = restore::apply_restore(engine.context(), &scenario.archive, true, &opts)
        .expect_err("canceled after snapshot");
    assert_eq!(err.code(), codes::OPERATION_CANCELED);
    assert_eq!(util::dataset_digest(scenario.target.path()), scenario.before);
    assert!(restore_leftovers(scenario.target.path()).is_empty());
}

#[test]
fn writers_are_rejected_while_the_swap_runs() {
    let scenario = scenario();
    let engine = util::engine(scenario.target.path());
    let gate = engine.write_gate();
    let db = util::active(scenario.target.path()).history_db();

    let seen: Arc<Mutex<Vec<String>>> = Arc::default();
    let recorder = seen.clone();
    let opts = RestoreOptions {
        after_phase: Some(Arc::new(move |phase| {
            if phase == MarkerPhase::SnapshotReady {
                let mut store = HistoryStore::open(&db)?;
                let outcome = store.insert(&gate, &util::record(42, "late write", None));
                recorder
                    .lock()
                    .unwrap()
                    .push(outcome.err().map(|err| err.code().to_string()).unwrap_or_default());
            }
            Ok(())
        })),
        ..RestoreOptions::default()
    };

    restore::apply_restore(engine.context(), &scenario.archive, true, &opts).expect("restore");
    assert_eq!(*seen.lock().unwrap(), vec![codes::STORE_RESTORE_IN_PROGRESS.to_string()]);

    // Writers are accepted again once the restore returns.
    let mut store = HistoryStore::open(&util::active(scenario.target.path()).history_db()).unwrap();
    store.insert(&engine.write_gate(), &util::record(43, "after", None)).unwrap();
    assert_eq!(store.count().unwrap(), 4);
}

#[test]
fn pending_marker_requires_reconcile_first() {
    let scenario = scenario();
    let engine = util::engine(scenario.target.path());
    let layout = DataLayout::new(scenario.target.path());
    fs::create_dir_all(layout.restore_root()).unwrap();
    RestoreMarker::new(
        "stale",
        layout.active(),
        layout.staging("stale"),
        layout.rollback("stale"),
        scenario.before.clone(),
        String::new(),
    )
    .persist(&layout.marker())
    .unwrap();

    let err = restore::apply_restore(engine.context(), &scenario.archive, true, &RestoreOptions::default())
        .expect_err("marker pending");
    assert_eq!(err.code(), codes::RESTORE_RECONCILE_REQUIRED);
    assert_eq!(util::dataset_digest(scenario.target.path()), scenario.before);
}

#[tokio::test]
async fn async_front_door_reports_the_same_rollback() {
    let scenario = scenario();
    let engine: BackupEngine = util::engine(scenario.target.path());
    let err = engine
        .apply_restore(scenario.archive.clone(), true, fail_at(MarkerPhase::StagedActivated))
        .await
        .expect_err("injected failure");
    assert_eq!(err.code(), codes::RESTORE_ROLLED_BACK);
    assert_eq!(util::dataset_digest(scenario.target.path()), scenario.before);
}

/// Leaves the target exactly as a process killed right after moving the
/// active dataset aside would.
fn cut_after_active_moved(data_dir: &Path) {
    let layout = DataLayout::new(data_dir);
    let plan = SwapPlan::new(&layout, "cut");
    fs::create_dir_all(&plan.staged).unwrap();
    fs::write(plan.staged.join("history.db"), b"half-restored").unwrap();
    let mut manager = SwapManager::begin(plan, String::new()).unwrap();
    manager.move_active().unwrap();
    assert!(!layout.active().exists());
}

#[tokio::test]
async fn export_waits_for_an_interrupted_swap_to_be_recovered() {
    let scenario = scenario();
    let out = tempdir().unwrap();
    let engine = util::engine(scenario.target.path());
    cut_after_active_moved(scenario.target.path());

    let archive = util::archive_path(out.path(), "too-early");
    let err = export::create_backup(engine.context(), Scope::Full, &archive, &ExportOptions::default())
        .expect_err("marker pending");
    assert_eq!(err.code(), codes::RESTORE_RECONCILE_REQUIRED);
    assert!(!archive.exists());

    let report = engine.reconcile_if_pending().await.unwrap().expect("marker was pending");
    assert_eq!(report.action, ReconcileAction::ReinstatedDisplaced);
    assert_eq!(util::dataset_digest(scenario.target.path()), scenario.before);
    assert!(engine.reconcile_if_pending().await.unwrap().is_none());

    let report = export::create_backup(engine.context(), Scope::Full, &archive, &ExportOptions::default())
        .expect("export after recovery");
    assert_eq!(report.counts.history, 0);
    assert_eq!(report.counts.recordings, 0);
}

#[tokio::test]
async fn unfinished_bookkeeping_keeps_restored_data_for_reconcile() {
    let scenario = scenario();
    let engine = util::engine(scenario.target.path());
    let layout = DataLayout::new(scenario.target.path());

    let blocker: Arc<Mutex<Option<PathBuf>>> = Arc::default();
    let slot = blocker.clone();
    let marker_path = layout.marker();
    let opts = RestoreOptions {
        after_phase: Some(Arc::new(move |phase| {
            if phase == MarkerPhase::StagedActivated {
                // A directory where the snapshot metadata belongs makes the
                // final bookkeeping write fail.
                let marker = RestoreMarker::load(&marker_path)?.expect("marker persisted");
                let meta = RollbackPaths::new(&marker.rollback).meta();
                fs::create_dir_all(&meta)?;
                fs::write(meta.join("occupied"), b"x")?;
                *slot.lock().unwrap() = Some(meta);
            }
            Ok(())
        })),
        ..RestoreOptions::default()
    };

    let err = restore::apply_restore(engine.context(), &scenario.archive, true, &opts)
        .expect_err("bookkeeping blocked");
    assert_eq!(err.code(), codes::RESTORE_FINALIZE_PENDING);
    assert!(err.cause().is_some());
    assert!(layout.marker().exists());
    assert!(!engine.write_gate().is_quiesced());
    let store = HistoryStore::open_read_only(&util::active(scenario.target.path()).history_db()).unwrap();
    assert_eq!(store.count().unwrap(), 3);
    store.close().unwrap();

    fs::remove_dir_all(blocker.lock().unwrap().take().unwrap()).unwrap();
    let report = engine.reconcile().await.unwrap();
    assert_eq!(report.action, ReconcileAction::Finalized);
    assert!(!layout.marker().exists());
    let store = HistoryStore::open_read_only(&util::active(scenario.target.path()).history_db()).unwrap();
    assert_eq!(store.count().unwrap(), 3);
}

#[test]
fn device_settings_changed_during_staging_survive_the_swap() {
    let scenario = scenario();
    let engine = util::engine(scenario.target.path());
    let settings_path = util::active(scenario.target.path()).settings();
    let mut local = app_settings::load(&settings_path).unwrap();
    local.selected_microphone = Some("Old Mic".into());
    app_settings::save(&engine.write_gate(), &settings_path, &local).unwrap();

    let gate = engine.write_gate();
    let path = settings_path.clone();
    let progress = Progress::new(Arc::new(move |event: ProgressEvent| {
        if event.phase == Phase::Validate && event.current == 0 {
            let mut newer = app_settings::load(&path).unwrap();
            newer.selected_microphone = Some("New Mic".into());
            newer
                .post_process_api_keys
                .insert("anthropic".into(), "sk-fresh".into());
            app_settings::save(&gate, &path, &newer).unwrap();
        }
    }));
    let opts = RestoreOptions {
        progress,
        ..RestoreOptions::default()
    };
    restore::apply_restore(engine.context(), &scenario.archive, true, &opts).expect("restore");

    let restored = app_settings::load(&settings_path).unwrap();
    assert_eq!(restored.selected_microphone.as_deref(), Some("New Mic"));
    assert_eq!(
        restored.post_process_api_keys.get("anthropic").map(String::as_str),
        Some("sk-fresh")
    );
    assert_eq!(restored.selected_language, "de");
    assert_eq!(restored.history_limit, 25);
}

