use std::collections::HashSet;
use std::fs;
use std::thread;

use slice_circuit::SliceId;
use slice_pipeline::run::RUN_RESULTS_FILE;
use slice_pipeline::{PipelineError, RunManager, RunResults, SliceStatus, SliceUpdate};

#[test]
fn concurrent_create_run_never_collides() {
    let root = tempfile::tempdir().expect("tempdir");
    let manager = RunManager::new(root.path());

    let ids: Vec<_> = thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let manager = &manager;
                scope.spawn(move || {
                    (0..4)
                        .map(|_| *manager.create_run().expect("create run").id())
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        handles
            .into_iter()
            .flat_map(|handle| handle.join().expect("worker"))
            .collect()
    });

    let unique: HashSet<_> = ids.iter().collect();
    assert_eq!(unique.len(), 32);
    assert_eq!(manager.list_runs().expect("list").len(), 32);
    let dirs = fs::read_dir(root.path())
        .expect("read root")
        .filter(|entry| {
            entry
                .as_ref()
                .map(|entry| entry.path().is_dir())
                .unwrap_or(false)
        })
        .count();
    assert_eq!(dirs, 32);
}

#[test]
fn results_survive_reopening_the_run() {
    let root = tempfile::tempdir().expect("tempdir");
    let manager = RunManager::new(root.path());
    let mut run = manager.create_run().expect("create run");
    let id = *run.id();
    manager
        .record_result(
            &mut run,
            SliceId(0),
            SliceUpdate::status(SliceStatus::InputGenerated),
        )
        .expect("record");
    drop(run);

    let reopened = manager.open_run(&id).expect("reopen");
    assert_eq!(
        reopened.results().latest_status(SliceId(0)),
        Some(SliceStatus::InputGenerated)
    );
    let on_disk: RunResults = serde_json::from_slice(
        &fs::read(reopened.dir().join(RUN_RESULTS_FILE)).expect("read results"),
    )
    .expect("parse results");
    assert_eq!(&on_disk, reopened.results());
    assert!(!manager.check_run_completion(&reopened, &[SliceId(0)]));
}

#[test]
fn backwards_update_is_out_of_order_and_not_persisted() {
    let root = tempfile::tempdir().expect("tempdir");
    let manager = RunManager::new(root.path());
    let mut run = manager.create_run().expect("create run");
    for status in [SliceStatus::InputGenerated, SliceStatus::WitnessGenerated] {
        run.record(SliceId(1), SliceUpdate::status(status))
            .expect("advance");
    }
    let before = fs::read(run.results_path()).expect("results");

    let err = run
        .record(SliceId(1), SliceUpdate::status(SliceStatus::InputGenerated))
        .expect_err("backwards");
    assert!(matches!(
        err,
        PipelineError::OutOfOrder {
            actual: SliceStatus::WitnessGenerated,
            ..
        }
    ));
    assert_eq!(fs::read(run.results_path()).expect("results"), before);
}

#[test]
fn cleanup_all_leaves_locked_runs_in_place() {
    let root = tempfile::tempdir().expect("tempdir");
    let manager = RunManager::new(root.path());
    let held = manager.create_run().expect("held run");
    let released = *manager.create_run().expect("released run").id();

    assert_eq!(manager.cleanup_all().expect("cleanup"), 1);
    let remaining = manager.list_runs().expect("list");
    assert_eq!(remaining, vec![*held.id()]);
    assert!(!remaining.contains(&released));
    assert!(matches!(
        manager.open_run(&released),
        Err(PipelineError::NotFound(_))
    ));
}
