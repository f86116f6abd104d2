#[path = "common/mod.rs"]
mod common;

use std::{
    fs,
    sync::Arc,
    time::{Duration, Instant},
};

use bansuri::notify::Notifier;
use bansuri::runner::{RunnerStatus, TaskRunner};
use common::{RecordingNotifier, base_task, wait_until};
use tempfile::tempdir;

#[test]
fn failing_task_without_restart_stops_after_one_attempt() {
    let mut task = base_task("one-shot", "false");
    task.times = 3;

    let runner = TaskRunner::new(task, None);
    runner.start();

    assert!(wait_until(Duration::from_secs(10), || {
        runner.status() == RunnerStatus::Failed
    }));
    assert_eq!(runner.attempts(), 1);
    assert_eq!(runner.failed_attempts(), 1);

    runner.stop();
    assert_eq!(runner.status(), RunnerStatus::Stopped);
}

#[test]
fn restart_policy_retries_until_max_attempts() {
    let mut task = base_task("retry", "false");
    task.times = 3;
    task.max_attempts = 3;
    task.on_fail = bansuri::config::OnFail::Restart;

    let runner = TaskRunner::new(task, None);
    runner.start();

    // Three executions separated by the 5 s retry backoff.
    assert!(wait_until(Duration::from_secs(30), || {
        runner.status() == RunnerStatus::Failed
    }));
    assert_eq!(runner.attempts(), 3);
    assert_eq!(runner.failed_attempts(), 3);

    runner.stop();
}

#[test]
fn max_attempts_of_one_means_no_retry() {
    let mut task = base_task("no-retry", "false");
    task.on_fail = bansuri::config::OnFail::Restart;
    task.max_attempts = 1;

    let runner = TaskRunner::new(task, None);
    runner.start();

    assert!(wait_until(Duration::from_secs(10), || {
        runner.status() == RunnerStatus::Failed
    }));
    assert_eq!(runner.attempts(), 1);

    runner.stop();
}

#[test]
fn timer_task_runs_exactly_times_executions() {
    let mut task = base_task("ticker", "true");
    task.timer = Some("1s".into());
    task.times = 2;

    let runner = TaskRunner::new(task, None);
    runner.start();

    assert!(wait_until(Duration::from_secs(15), || {
        runner.status() == RunnerStatus::Completed
    }));
    assert_eq!(runner.attempts(), 2);
    assert_eq!(runner.failed_attempts(), 0);

    runner.stop();
}

#[test]
fn timer_loop_survives_failures() {
    let mut task = base_task("flaky-ticker", "false");
    task.timer = Some("1s".into());
    task.times = 2;

    let runner = TaskRunner::new(task, None);
    runner.start();

    assert!(wait_until(Duration::from_secs(15), || {
        runner.status() == RunnerStatus::Failed
    }));
    // Both executions ran despite the first failing.
    assert_eq!(runner.attempts(), 2);
    assert_eq!(runner.failed_attempts(), 2);

    runner.stop();
}

#[test]
fn timeout_kills_the_child_group_and_notifies() {
    let notifier = Arc::new(RecordingNotifier::new());
    let mut task = base_task("slow", "sleep 30");
    task.timeout = Some("1s".into());
    task.times = 1;

    let runner = TaskRunner::with_notifier(
        task,
        Some(Arc::clone(&notifier) as Arc<dyn Notifier>),
    );
    let started = Instant::now();
    runner.start();

    assert!(wait_until(Duration::from_secs(20), || {
        runner.status() == RunnerStatus::Failed
    }));
    // SIGTERM suffices for sleep, so the kill is fast despite the watchdog.
    assert!(started.elapsed() < Duration::from_secs(20));
    assert_eq!(runner.attempts(), 1);

    let records = notifier.records();
    assert_eq!(records.len(), 1);
    assert!(records[0].return_code < 0);
    assert!(records[0].stderr.contains("Timeout exceeded"));

    runner.stop();
}

#[test]
fn notifier_receives_captured_output() {
    let notifier = Arc::new(RecordingNotifier::new());
    let mut task = base_task("noisy", "echo boom 1>&2; echo partial; exit 3");
    task.times = 1;
    task.description = "noisy task".into();

    let runner = TaskRunner::with_notifier(
        task,
        Some(Arc::clone(&notifier) as Arc<dyn Notifier>),
    );
    runner.start();

    assert!(wait_until(Duration::from_secs(10), || {
        runner.status() == RunnerStatus::Failed
    }));

    let records = notifier.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].return_code, 3);
    assert_eq!(records[0].attempt, 1);
    assert_eq!(records[0].description, "noisy task");
    assert!(records[0].stderr.contains("boom"));
    assert!(records[0].stdout.contains("partial"));

    runner.stop();
}

#[test]
fn custom_success_codes_classify_exits() {
    let mut task = base_task("lenient", "exit 2");
    task.times = 1;
    task.success_codes = vec![0, 2];

    let runner = TaskRunner::new(task, None);
    runner.start();

    assert!(wait_until(Duration::from_secs(10), || {
        runner.status() == RunnerStatus::Completed
    }));
    assert_eq!(runner.failed_attempts(), 0);

    runner.stop();
}

#[test]
fn stop_kills_a_long_running_service() {
    let task = base_task("service", "sleep 30");
    let runner = TaskRunner::new(task, None);
    runner.start();

    assert!(wait_until(Duration::from_secs(10), || {
        runner.status() == RunnerStatus::Executing
    }));

    let stopping = Instant::now();
    runner.stop();
    assert!(stopping.elapsed() < Duration::from_secs(10));
    assert_eq!(runner.status(), RunnerStatus::Stopped);
    assert_eq!(runner.attempts(), 1);

    // Second stop is a no-op.
    runner.stop();
    assert_eq!(runner.status(), RunnerStatus::Stopped);
}

#[test]
fn combined_stderr_merges_into_stdout_file() {
    let dir = tempdir().unwrap();
    let mut task = base_task("merger", "echo to-out; echo to-err 1>&2");
    task.working_directory = Some(dir.path().to_string_lossy().into_owned());
    task.stdout = Some("merged.log".into());
    task.stderr = Some("combined".into());
    task.times = 1;

    let runner = TaskRunner::new(task, None);
    runner.start();

    assert!(wait_until(Duration::from_secs(10), || {
        runner.status() == RunnerStatus::Completed
    }));
    runner.stop();

    // Relative path resolved under the working directory.
    let contents = fs::read_to_string(dir.path().join("merged.log")).unwrap();
    assert!(contents.contains("to-out"));
    assert!(contents.contains("to-err"));
}

#[test]
fn separate_log_files_keep_streams_apart() {
    let dir = tempdir().unwrap();
    let mut task = base_task("splitter", "echo only-out; echo only-err 1>&2");
    task.working_directory = Some(dir.path().to_string_lossy().into_owned());
    task.stdout = Some("out.log".into());
    task.stderr = Some("err.log".into());
    task.times = 1;

    let runner = TaskRunner::new(task, None);
    runner.start();

    assert!(wait_until(Duration::from_secs(10), || {
        runner.status() == RunnerStatus::Completed
    }));
    runner.stop();

    let out = fs::read_to_string(dir.path().join("out.log")).unwrap();
    let err = fs::read_to_string(dir.path().join("err.log")).unwrap();
    assert!(out.contains("only-out"));
    assert!(!out.contains("only-err"));
    assert!(err.contains("only-err"));
}

#[test]
fn invalid_cron_expression_fails_the_runner() {
    let mut task = base_task("bad-cron", "true");
    task.schedule_cron = Some("definitely not cron".into());

    let runner = TaskRunner::new(task, None);
    runner.start();

    assert!(wait_until(Duration::from_secs(5), || {
        runner.status() == RunnerStatus::Failed
    }));
    assert_eq!(runner.attempts(), 0);

    runner.stop();
}

#[test]
fn cron_runner_waits_with_next_run_scheduled() {
    let mut task = base_task("scheduled", "true");
    task.schedule_cron = Some("*/5 * * * *".into());
    // `times` has no effect under cron.
    task.times = 1;

    let runner = TaskRunner::new(task, None);
    runner.start();

    assert!(wait_until(Duration::from_secs(5), || {
        runner.status() == RunnerStatus::Waiting
    }));
    let snapshot = runner.snapshot();
    assert!(snapshot.next_run.is_some());
    assert_eq!(snapshot.attempts, 0);

    runner.stop();
    assert_eq!(runner.status(), RunnerStatus::Stopped);
}

#[test]
fn invalid_timer_value_runs_once() {
    let mut task = base_task("odd-timer", "true");
    task.timer = Some("every-so-often".into());

    let runner = TaskRunner::new(task, None);
    runner.start();

    assert!(wait_until(Duration::from_secs(10), || {
        runner.status() == RunnerStatus::Completed
    }));
    assert_eq!(runner.attempts(), 1);

    runner.stop();
}

#[test]
fn restart_after_completion_resets_counters() {
    let mut task = base_task("rerun", "true");
    task.times = 1;

    let runner = TaskRunner::new(task, None);
    runner.start();
    assert!(wait_until(Duration::from_secs(10), || {
        runner.status() == RunnerStatus::Completed
    }));
    assert_eq!(runner.attempts(), 1);

    runner.start();
    assert!(wait_until(Duration::from_secs(10), || {
        runner.attempts() == 1 && runner.status() == RunnerStatus::Completed
    }));

    runner.stop();
}

#[test]
fn resource_sample_is_zero_without_a_child() {
    let task = base_task("idle", "true");
    let runner = TaskRunner::new(task, None);

    let usage = runner.sample_resources();
    assert_eq!(usage.cpu_percent, 0.0);
    assert_eq!(usage.memory_bytes, 0);
}
