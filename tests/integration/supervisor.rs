#[path = "common/mod.rs"]
mod common;

use std::{
    fs,
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use bansuri::runner::RunnerStatus;
use bansuri::supervisor::{Supervisor, runner_map};
use common::wait_until;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tempfile::tempdir;

fn write_config(path: &Path, contents: &str) {
    fs::write(path, contents).unwrap();
}

fn supervisor_at(path: &Path) -> Supervisor {
    Supervisor::new(
        path.to_path_buf(),
        Duration::from_secs(1),
        runner_map(),
        Arc::new(AtomicBool::new(false)),
    )
}

#[test]
fn config_change_replaces_the_runner() {
    let dir = tempdir().unwrap();
    let config_path = dir.path().join("scripts.json");
    write_config(
        &config_path,
        r#"{"scripts": [{"name": "E", "command": "true", "timer": "5s"}]}"#,
    );

    let supervisor = supervisor_at(&config_path);
    supervisor.sync_tasks();

    let first = supervisor.runners().read().unwrap()["E"].clone();
    assert!(wait_until(Duration::from_secs(10), || {
        first.attempts() >= 1
    }));

    write_config(
        &config_path,
        r#"{"scripts": [{"name": "E", "command": "false", "timer": "5s"}]}"#,
    );
    supervisor.sync_tasks();

    let second = supervisor.runners().read().unwrap()["E"].clone();
    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(first.status(), RunnerStatus::Stopped);
    assert_eq!(second.config().command, "false");

    supervisor.stop_all();
}

#[test]
fn reloading_identical_config_is_idempotent() {
    let dir = tempdir().unwrap();
    let config_path = dir.path().join("scripts.json");
    write_config(
        &config_path,
        r#"{"scripts": [
            {"name": "a", "command": "true", "schedule-cron": "0 0 1 1 *"},
            {"name": "b", "command": "true", "schedule-cron": "0 0 1 1 *"}
        ]}"#,
    );

    let supervisor = supervisor_at(&config_path);
    supervisor.sync_tasks();
    let a1 = supervisor.runners().read().unwrap()["a"].clone();
    let b1 = supervisor.runners().read().unwrap()["b"].clone();

    supervisor.sync_tasks();
    let a2 = supervisor.runners().read().unwrap()["a"].clone();
    let b2 = supervisor.runners().read().unwrap()["b"].clone();

    assert!(Arc::ptr_eq(&a1, &a2));
    assert!(Arc::ptr_eq(&b1, &b2));

    supervisor.stop_all();
}

#[test]
fn run_loop_exits_on_shutdown_and_stops_tasks() {
    let dir = tempdir().unwrap();
    let config_path = dir.path().join("scripts.json");
    write_config(
        &config_path,
        r#"{"scripts": [{"name": "svc", "command": "sleep 30", "timer": "none", "depends-on": ["x"]}]}"#,
    );

    let supervisor = Arc::new(supervisor_at(&config_path));
    let shutdown = supervisor.shutdown_handle();
    let runners = supervisor.runners();

    let worker = {
        let supervisor = Arc::clone(&supervisor);
        thread::spawn(move || supervisor.run())
    };

    assert!(wait_until(Duration::from_secs(10), || {
        runners
            .read()
            .unwrap()
            .get("svc")
            .is_some_and(|r| r.status() == RunnerStatus::Executing)
    }));

    shutdown.store(true, Ordering::SeqCst);
    worker.join().unwrap();

    assert!(runners.read().unwrap().is_empty());
}

#[test]
fn help_describes_the_supervisor() {
    let mut cmd = assert_cmd::Command::new(assert_cmd::cargo::cargo_bin!("bansuri"));
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicates::str::contains("task supervisor"));
}

#[test]
fn sigterm_shuts_the_binary_down_cleanly() {
    let dir = tempdir().unwrap();
    let config_path = dir.path().join("scripts.json");
    write_config(
        &config_path,
        r#"{"scripts": [{"name": "svc", "command": "sleep 30", "timer": "none", "depends-on": ["x"]}]}"#,
    );

    let mut child = std::process::Command::new(assert_cmd::cargo::cargo_bin!("bansuri"))
        .arg("--config")
        .arg(&config_path)
        .arg("--check-interval")
        .arg("1")
        .arg("--no-dashboard")
        .spawn()
        .expect("spawn bansuri");

    // Let the supervisor pick the task up.
    thread::sleep(Duration::from_secs(2));

    kill(Pid::from_raw(child.id() as i32), Signal::SIGTERM).expect("signal bansuri");

    let status = child.wait().expect("wait for bansuri");
    assert!(status.success(), "expected clean exit, got {status:?}");
}
