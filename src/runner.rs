//! Per-task runner: scheduling loop, process lifecycle, retry policy, IO
//! redirection, timeout watchdog, and failure notification.
use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use std::{
    fs::{File, OpenOptions},
    io::{self, PipeReader, Read},
    os::fd::AsRawFd,
    os::unix::process::{CommandExt, ExitStatusExt},
    path::Path,
    process::{Child, Command, ExitStatus, Stdio},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};
use strum_macros::AsRefStr;
use tracing::{debug, error, info, warn};

use crate::{
    config::{OnFail, TaskConfig},
    error::RunnerError,
    notify::{FailureRecord, Notifier, notifier_for},
    process::{WATCHDOG_TIMEOUT, kill_process_group},
    sampler::{ResourceSampler, ResourceUsage},
};

/// Fixed backoff between failed executions in simple mode.
const RETRY_BACKOFF: Duration = Duration::from_secs(5);

/// Cadence at which a live child is polled.
const CHILD_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Bound on draining piped output after a failure.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Bound on waiting for the worker thread during `stop()`.
const STOP_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Sentinel return code recorded for timeouts and spawn failures.
const SENTINEL_RETURN_CODE: i32 = -1;

/// Lifecycle states of a task runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, AsRefStr)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunnerStatus {
    /// No worker is running.
    Stopped,
    /// `start()` was called; the worker has not entered its loop yet.
    Starting,
    /// The worker loop is active but not executing or waiting.
    Running,
    /// A child process is being driven.
    Executing,
    /// Waiting for the next timer or cron fire.
    Waiting,
    /// Waiting out the retry backoff after a failure.
    WaitingRetry,
    /// The last execution succeeded.
    Completed,
    /// The failure policy gave up.
    Failed,
    /// `stop()` is in flight.
    Stopping,
}

/// Scheduler mode, chosen once when the worker starts.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ScheduleMode {
    /// Long-lived service or bounded retry loop.
    Simple,
    /// Fixed interval between executions; `None` means the configured value
    /// did not parse and the task runs once.
    Timer(Option<Duration>),
    /// Cron expression, validated when the loop starts.
    Cron(String),
}

fn schedule_mode(config: &TaskConfig) -> ScheduleMode {
    if let Some(expr) = &config.schedule_cron {
        return ScheduleMode::Cron(expr.clone());
    }
    if !config.timer_disabled() {
        return ScheduleMode::Timer(config.timer_interval());
    }
    ScheduleMode::Simple
}

/// Mutable runner state shared between the worker and readers.
#[derive(Debug)]
struct RunnerState {
    status: RunnerStatus,
    attempts: u32,
    failed_attempts: u32,
    last_run: Option<DateTime<Utc>>,
    next_run: Option<DateTime<Utc>>,
    child_pid: Option<u32>,
}

impl RunnerState {
    fn new() -> Self {
        Self {
            status: RunnerStatus::Stopped,
            attempts: 0,
            failed_attempts: 0,
            last_run: None,
            next_run: None,
            child_pid: None,
        }
    }
}

/// Read-only view of a runner for the dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSnapshot {
    /// Task name.
    pub name: String,
    /// Current lifecycle state.
    pub status: RunnerStatus,
    /// When the last execution started.
    pub last_run: Option<DateTime<Utc>>,
    /// When the next execution is due, if known.
    pub next_run: Option<DateTime<Utc>>,
    /// Total executions started since the last `start()`.
    pub attempts: u32,
    /// Consecutive failures; resets on success.
    pub failed_attempts: u32,
    /// The configured command line.
    pub command: String,
}

/// Outcome of one child execution.
#[derive(Debug, Clone, Copy)]
struct ExecOutcome {
    success: bool,
    interrupted: bool,
}

impl ExecOutcome {
    fn success() -> Self {
        Self {
            success: true,
            interrupted: false,
        }
    }

    fn failure() -> Self {
        Self {
            success: false,
            interrupted: false,
        }
    }

    fn interrupted() -> Self {
        Self {
            success: false,
            interrupted: true,
        }
    }
}

/// Supervises one task's lifecycle on a dedicated worker thread.
pub struct TaskRunner {
    config: Arc<TaskConfig>,
    state: Arc<Mutex<RunnerState>>,
    child: Arc<Mutex<Option<Child>>>,
    stop: Arc<AtomicBool>,
    notifier: Option<Arc<dyn Notifier>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    sampler: Mutex<ResourceSampler>,
    watchdog_timeout: Duration,
}

impl TaskRunner {
    /// Creates a runner, building the notifier per the task's notify policy.
    pub fn new(config: TaskConfig, notify_command: Option<&str>) -> Self {
        let notifier = notifier_for(&config, notify_command);
        Self::with_notifier(config, notifier)
    }

    /// Creates a runner with an explicit notifier (or none).
    pub fn with_notifier(
        config: TaskConfig,
        notifier: Option<Arc<dyn Notifier>>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            state: Arc::new(Mutex::new(RunnerState::new())),
            child: Arc::new(Mutex::new(None)),
            stop: Arc::new(AtomicBool::new(false)),
            notifier,
            worker: Mutex::new(None),
            sampler: Mutex::new(ResourceSampler::new()),
            watchdog_timeout: WATCHDOG_TIMEOUT,
        }
    }

    /// The task configuration this runner was built from.
    pub fn config(&self) -> &TaskConfig {
        &self.config
    }

    /// Current lifecycle state.
    pub fn status(&self) -> RunnerStatus {
        self.state.lock().unwrap().status
    }

    /// Total executions started since the last `start()`.
    pub fn attempts(&self) -> u32 {
        self.state.lock().unwrap().attempts
    }

    /// Consecutive failures since the last success.
    pub fn failed_attempts(&self) -> u32 {
        self.state.lock().unwrap().failed_attempts
    }

    /// Builds a point-in-time view for the dashboard.
    pub fn snapshot(&self) -> TaskSnapshot {
        let state = self.state.lock().unwrap();
        TaskSnapshot {
            name: self.config.name.clone(),
            status: state.status,
            last_run: state.last_run,
            next_run: state.next_run,
            attempts: state.attempts,
            failed_attempts: state.failed_attempts,
            command: self.config.command.clone(),
        }
    }

    /// Samples CPU and memory of the live child and its descendants.
    pub fn sample_resources(&self) -> ResourceUsage {
        let pid = self.state.lock().unwrap().child_pid;
        self.sampler.lock().unwrap().sample(pid)
    }

    /// Starts the worker thread. A no-op while the worker is alive; starting
    /// a finished runner resets its counters and runs it again.
    pub fn start(&self) {
        let mut worker = self.worker.lock().unwrap();
        if let Some(handle) = worker.as_ref()
            && !handle.is_finished()
        {
            debug!("Runner '{}' already running", self.config.name);
            return;
        }

        self.stop.store(false, Ordering::SeqCst);
        {
            let mut state = self.state.lock().unwrap();
            state.status = RunnerStatus::Starting;
            state.attempts = 0;
            state.failed_attempts = 0;
            state.next_run = None;
        }

        let inner = Worker {
            config: Arc::clone(&self.config),
            state: Arc::clone(&self.state),
            child: Arc::clone(&self.child),
            stop: Arc::clone(&self.stop),
            notifier: self.notifier.clone(),
            watchdog_timeout: self.watchdog_timeout,
        };
        *worker = Some(thread::spawn(move || inner.run()));
        info!("Runner '{}' started", self.config.name);
    }

    /// Raises the stop signal, kills the live child (if any), and waits for
    /// the worker with a bounded join. Idempotent; after it returns no child
    /// owned by this runner remains alive.
    pub fn stop(&self) {
        info!("Stopping task '{}'", self.config.name);
        self.state.lock().unwrap().status = RunnerStatus::Stopping;
        self.stop.store(true, Ordering::SeqCst);

        {
            let mut guard = self.child.lock().unwrap();
            if let Some(child) = guard.as_mut() {
                kill_process_group(child, self.watchdog_timeout);
            }
            *guard = None;
        }

        let handle = self.worker.lock().unwrap().take();
        if let Some(handle) = handle {
            let deadline = Instant::now() + STOP_JOIN_TIMEOUT;
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(50));
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                warn!(
                    "Runner '{}' worker did not finish within {}s; detaching",
                    self.config.name,
                    STOP_JOIN_TIMEOUT.as_secs()
                );
            }
        }

        {
            let mut state = self.state.lock().unwrap();
            state.status = RunnerStatus::Stopped;
            state.child_pid = None;
            state.next_run = None;
        }
        info!("Task '{}' stopped", self.config.name);
    }
}

impl Drop for TaskRunner {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Ok(mut guard) = self.child.lock()
            && let Some(child) = guard.as_mut()
        {
            kill_process_group(child, self.watchdog_timeout);
        }
    }
}

/// The worker half of a runner; owns the scheduling loop.
struct Worker {
    config: Arc<TaskConfig>,
    state: Arc<Mutex<RunnerState>>,
    child: Arc<Mutex<Option<Child>>>,
    stop: Arc<AtomicBool>,
    notifier: Option<Arc<dyn Notifier>>,
    watchdog_timeout: Duration,
}

impl Worker {
    fn run(&self) {
        self.set_status(RunnerStatus::Running);
        match schedule_mode(&self.config) {
            ScheduleMode::Cron(expr) => self.cron_loop(&expr),
            ScheduleMode::Timer(interval) => self.timer_loop(interval),
            ScheduleMode::Simple => self.simple_loop(),
        }
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    fn set_status(&self, status: RunnerStatus) {
        self.state.lock().unwrap().status = status;
    }

    fn update_state<F: FnOnce(&mut RunnerState)>(&self, update: F) {
        update(&mut self.state.lock().unwrap());
    }

    /// Sleeps for `duration` in sub-second steps; returns true when the stop
    /// signal fired before the duration elapsed.
    fn wait(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.stopped() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            thread::sleep((deadline - now).min(Duration::from_millis(100)));
        }
    }

    /// Whether `times` caps further executions. Never consulted under cron.
    fn reached_execution_cap(&self) -> bool {
        if self.config.times == 0 {
            return false;
        }
        let attempts = self.state.lock().unwrap().attempts;
        if attempts >= self.config.times {
            info!(
                "Task '{}' reached its execution limit ({}); giving up",
                self.config.name, self.config.times
            );
            return true;
        }
        false
    }

    fn simple_loop(&self) {
        while !self.stopped() {
            if self.reached_execution_cap() {
                break;
            }

            let outcome = self.execute_once();
            if self.stopped() || outcome.interrupted {
                break;
            }

            if outcome.success {
                self.update_state(|s| {
                    s.failed_attempts = 0;
                    s.status = RunnerStatus::Completed;
                });
                continue;
            }

            let failed = {
                let mut state = self.state.lock().unwrap();
                state.failed_attempts += 1;
                state.failed_attempts
            };

            if self.config.on_fail != OnFail::Restart {
                info!(
                    "Task '{}' stopped; no automatic restart configured",
                    self.config.name
                );
                self.set_status(RunnerStatus::Failed);
                break;
            }

            if failed >= self.config.max_attempts {
                info!(
                    "Task '{}' failed {} consecutive time(s); giving up",
                    self.config.name, failed
                );
                self.set_status(RunnerStatus::Failed);
                break;
            }

            self.set_status(RunnerStatus::WaitingRetry);
            info!("Restarting '{}' in 5 secs", self.config.name);
            if self.wait(RETRY_BACKOFF) {
                break;
            }
        }
    }

    fn timer_loop(&self, interval: Option<Duration>) {
        let Some(interval) = interval else {
            error!(
                "Task '{}' has an invalid timer value '{}'; running once",
                self.config.name,
                self.config.timer.as_deref().unwrap_or_default()
            );
            let outcome = self.execute_once();
            if !outcome.interrupted {
                self.set_status(if outcome.success {
                    RunnerStatus::Completed
                } else {
                    RunnerStatus::Failed
                });
            }
            return;
        };

        info!(
            "Timer for '{}': running every {}s",
            self.config.name,
            interval.as_secs()
        );

        let mut last = ExecOutcome::success();
        while !self.stopped() {
            if self.reached_execution_cap() {
                self.set_status(if last.success {
                    RunnerStatus::Completed
                } else {
                    RunnerStatus::Failed
                });
                break;
            }

            last = self.execute_once();
            if self.stopped() || last.interrupted {
                break;
            }

            // Failures never break a timer loop; the notifier already fired.
            self.update_state(|s| {
                if last.success {
                    s.failed_attempts = 0;
                } else {
                    s.failed_attempts += 1;
                }
                s.next_run = Some(Utc::now() + interval);
                s.status = RunnerStatus::Waiting;
            });

            if self.wait(interval) {
                break;
            }
        }
    }

    fn cron_loop(&self, expr: &str) {
        let schedule = match crate::cron::CronSchedule::parse(expr) {
            Ok(schedule) => schedule,
            Err(err) => {
                error!("Task '{}': {err}", self.config.name);
                self.set_status(RunnerStatus::Failed);
                return;
            }
        };

        info!("Cron for '{}': '{}'", self.config.name, expr);

        while !self.stopped() {
            let now = Local::now();
            let Some(next) = schedule.next_after(&now) else {
                error!(
                    "Cron expression for '{}' yields no future fire times",
                    self.config.name
                );
                self.set_status(RunnerStatus::Failed);
                return;
            };

            self.update_state(|s| {
                s.next_run = Some(next.with_timezone(&Utc));
                s.status = RunnerStatus::Waiting;
            });

            let delay = (next - now).to_std().unwrap_or_default();
            info!(
                "Next run of '{}' at {} (in {}s)",
                self.config.name,
                next.format("%Y-%m-%d %H:%M:%S"),
                delay.as_secs()
            );
            if self.wait(delay) {
                break;
            }

            let outcome = self.execute_once();
            if self.stopped() || outcome.interrupted {
                break;
            }
            self.update_state(|s| {
                if outcome.success {
                    s.failed_attempts = 0;
                } else {
                    s.failed_attempts += 1;
                }
            });
        }
    }

    /// Counts the execution and drives one child to completion.
    fn execute_once(&self) -> ExecOutcome {
        self.update_state(|s| {
            s.attempts += 1;
            s.status = RunnerStatus::Executing;
            s.last_run = Some(Utc::now());
        });
        self.run_child()
    }

    /// Spawns the child and polls it until exit, timeout, or stop. On every
    /// exit path the child is reaped or killed and IO handles are released.
    fn run_child(&self) -> ExecOutcome {
        debug!(
            "Executing shell command for '{}': {}",
            self.config.name, self.config.command
        );

        let (child, mut capture) = match self.spawn_child() {
            Ok(spawned) => spawned,
            Err(err) => {
                error!("{err}");
                self.handle_notify(SENTINEL_RETURN_CODE, "", &err.to_string());
                return ExecOutcome::failure();
            }
        };

        let pid = child.id();
        self.child.lock().unwrap().replace(child);
        self.update_state(|s| s.child_pid = Some(pid));

        let started = Instant::now();
        let timeout = self.config.timeout_duration();

        let outcome = loop {
            let exit = {
                let mut guard = self.child.lock().unwrap();
                match guard.as_mut() {
                    Some(child) => match child.try_wait() {
                        Ok(exit) => exit,
                        Err(err) => {
                            warn!(
                                "Failed to poll child of '{}': {err}",
                                self.config.name
                            );
                            break ExecOutcome::failure();
                        }
                    },
                    // stop() reaped the child from under us
                    None => break ExecOutcome::interrupted(),
                }
            };

            if let Some(status) = exit {
                let code = exit_code(status);
                info!(
                    "Process for '{}' finished with code {code}",
                    self.config.name
                );
                if self.config.is_success(code) {
                    break ExecOutcome::success();
                }
                let (out, err) = capture.drain(DRAIN_TIMEOUT);
                self.handle_notify(code, &out, &err);
                break ExecOutcome::failure();
            }

            if self.stopped() {
                break ExecOutcome::interrupted();
            }

            if let Some(limit) = timeout
                && started.elapsed() > limit
            {
                let label = self.config.timeout.as_deref().unwrap_or_default();
                warn!(
                    "Timeout exceeded ({label}) for '{}'; killing process",
                    self.config.name
                );
                {
                    let mut guard = self.child.lock().unwrap();
                    if let Some(child) = guard.as_mut() {
                        kill_process_group(child, self.watchdog_timeout);
                    }
                }
                self.handle_notify(
                    SENTINEL_RETURN_CODE,
                    "",
                    &format!("Timeout exceeded ({label})"),
                );
                break ExecOutcome::failure();
            }

            if self.wait(CHILD_POLL_INTERVAL) {
                break ExecOutcome::interrupted();
            }
        };

        // Whatever path got us here: reap or kill, then release the slot.
        {
            let mut guard = self.child.lock().unwrap();
            if let Some(mut child) = guard.take() {
                match child.try_wait() {
                    Ok(Some(_)) => {}
                    _ => kill_process_group(&mut child, self.watchdog_timeout),
                }
            }
        }
        self.update_state(|s| s.child_pid = None);

        outcome
    }

    /// Spawns `sh -c <command>` in a fresh session with IO wired per config.
    fn spawn_child(&self) -> Result<(Child, CaptureHandles), RunnerError> {
        let task = &self.config.name;
        let io_error = |e: io::Error| RunnerError::Redirect {
            task: task.clone(),
            source: e,
        };

        let mut capture = CaptureHandles::default();
        let combined = self.config.stderr_combined();

        // Build the stdout destination plus a duplicate for `combined`
        // stderr, so both streams share one file or one pipe write end.
        let (stdout_stdio, combined_dup): (Stdio, Option<Stdio>) =
            if let Some(path) = self.config.stdout_path() {
                debug!("Redirecting stdout of '{task}' to {}", path.display());
                let file = open_append(task, &path)?;
                let dup = combined
                    .then(|| file.try_clone().map(Stdio::from))
                    .transpose()
                    .map_err(io_error)?;
                (Stdio::from(file), dup)
            } else {
                let (read, write) = io::pipe().map_err(io_error)?;
                capture.stdout = Some(read);
                let dup = combined
                    .then(|| write.try_clone().map(Stdio::from))
                    .transpose()
                    .map_err(io_error)?;
                (Stdio::from(write), dup)
            };

        let stderr_stdio = if let Some(dup) = combined_dup {
            debug!("Redirecting stderr of '{task}' to stdout");
            dup
        } else if let Some(path) = self.config.stderr_path() {
            debug!("Redirecting stderr of '{task}' to {}", path.display());
            Stdio::from(open_append(task, &path)?)
        } else {
            let (read, write) = io::pipe().map_err(io_error)?;
            capture.stderr = Some(read);
            Stdio::from(write)
        };

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&self.config.command)
            .stdin(Stdio::null())
            .stdout(stdout_stdio)
            .stderr(stderr_stdio);
        if let Some(cwd) = &self.config.working_directory {
            cmd.current_dir(cwd);
        }
        // Detach into a new session so the child leads a process group that
        // covers its whole subtree.
        unsafe {
            cmd.pre_exec(|| {
                nix::unistd::setsid()
                    .map(|_| ())
                    .map_err(|e| io::Error::from_raw_os_error(e as i32))
            });
        }

        let child = cmd.spawn().map_err(|e| RunnerError::Spawn {
            task: task.clone(),
            source: e,
        })?;

        Ok((child, capture))
    }

    fn handle_notify(&self, return_code: i32, stdout: &str, stderr: &str) {
        let Some(notifier) = &self.notifier else {
            return;
        };

        let attempt = self.state.lock().unwrap().attempts;
        let record = FailureRecord {
            task_name: self.config.name.clone(),
            command: self.config.command.clone(),
            working_directory: self.config.working_directory.clone(),
            return_code,
            attempt,
            max_attempts: self.config.max_attempts,
            timestamp: Local::now(),
            description: self.config.description.clone(),
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
        };

        info!("Sending failure notification for '{}'", self.config.name);
        if notifier.notify(&record) {
            debug!("Notification for '{}' sent", self.config.name);
        } else {
            warn!("Failed to send notification for '{}'", self.config.name);
        }
    }
}

fn open_append(task: &str, path: &Path) -> Result<File, RunnerError> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| RunnerError::Redirect {
            task: task.to_string(),
            source: e,
        })
}

/// Maps an exit status to a Unix-style return code; signal terminations come
/// back negative.
fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|sig| -sig))
        .unwrap_or(SENTINEL_RETURN_CODE)
}

/// Read ends of the capture pipes for an execution without file redirection.
#[derive(Default)]
struct CaptureHandles {
    stdout: Option<PipeReader>,
    stderr: Option<PipeReader>,
}

impl CaptureHandles {
    /// Reads whatever the pipes still hold. Descendants of the child may keep
    /// the write ends open, so each read is bounded by `timeout`.
    fn drain(&mut self, timeout: Duration) -> (String, String) {
        (
            drain_pipe(self.stdout.take(), timeout),
            drain_pipe(self.stderr.take(), timeout),
        )
    }
}

fn drain_pipe(pipe: Option<PipeReader>, timeout: Duration) -> String {
    let Some(mut pipe) = pipe else {
        return String::new();
    };

    if let Err(err) = set_nonblocking(&pipe) {
        debug!("Failed to prepare capture pipe for draining: {err}");
        return String::new();
    }

    let mut collected = Vec::new();
    let mut chunk = [0u8; 4096];
    let deadline = Instant::now() + timeout;

    loop {
        match pipe.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => collected.extend_from_slice(&chunk[..n]),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    break;
                }
                thread::sleep(Duration::from_millis(50));
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }

    String::from_utf8_lossy(&collected).into_owned()
}

fn set_nonblocking(pipe: &PipeReader) -> io::Result<()> {
    let fd = pipe.as_raw_fd();
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
