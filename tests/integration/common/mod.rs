#![allow(dead_code)]

use std::{
    sync::Mutex,
    thread,
    time::{Duration, Instant},
};

use bansuri::config::{NotifyMode, OnFail, TaskConfig};
use bansuri::notify::{FailureRecord, Notifier};

/// A minimal task descriptor the tests mutate field-by-field.
pub fn base_task(name: &str, command: &str) -> TaskConfig {
    TaskConfig {
        name: name.into(),
        command: command.into(),
        user: None,
        working_directory: None,
        schedule_cron: None,
        timer: None,
        timeout: None,
        times: 0,
        max_attempts: 1,
        on_fail: OnFail::Stop,
        depends_on: vec![],
        success_codes: vec![0],
        environment_file: None,
        priority: None,
        stdout: None,
        stderr: None,
        notify: NotifyMode::None,
        description: String::new(),
    }
}

/// Notifier that records every failure it is handed.
#[derive(Default)]
pub struct RecordingNotifier {
    records: Mutex<Vec<FailureRecord>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<FailureRecord> {
        self.records.lock().unwrap().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, record: &FailureRecord) -> bool {
        self.records.lock().unwrap().push(record.clone());
        true
    }
}

/// Polls `cond` until it holds or `timeout` elapses; returns the final value.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(50));
    }
    cond()
}
