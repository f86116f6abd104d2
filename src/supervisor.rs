//! Supervisor: keeps the set of running tasks in sync with the config file.
use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{
        Arc, RwLock,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};
use tracing::{error, info};

use crate::{config::load_config, runner::TaskRunner};

/// Default pause between configuration reconciliation passes.
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Shared name → runner map. Only the supervisor mutates it; the dashboard
/// reads it and invokes runner methods.
pub type RunnerMap = Arc<RwLock<HashMap<String, Arc<TaskRunner>>>>;

/// Creates an empty runner map.
pub fn runner_map() -> RunnerMap {
    Arc::new(RwLock::new(HashMap::new()))
}

/// Top-level loop diffing configuration against running tasks.
pub struct Supervisor {
    config_path: PathBuf,
    check_interval: Duration,
    runners: RunnerMap,
    shutdown: Arc<AtomicBool>,
}

impl Supervisor {
    /// Creates a supervisor over a shared runner map.
    pub fn new(
        config_path: PathBuf,
        check_interval: Duration,
        runners: RunnerMap,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            config_path,
            check_interval,
            runners,
            shutdown,
        }
    }

    /// The shared runner map (for the dashboard).
    pub fn runners(&self) -> RunnerMap {
        Arc::clone(&self.runners)
    }

    /// The flag that ends `run()` when set.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Runs reconciliation ticks until shutdown, then stops every task.
    pub fn run(&self) {
        info!(
            "Supervisor started; monitoring {}",
            self.config_path.display()
        );

        while !self.shutdown.load(Ordering::SeqCst) {
            self.sync_tasks();
            self.wait(self.check_interval);
        }

        self.stop_all();
    }

    /// One reconciliation pass. A load error logs and keeps the current
    /// runner set untouched until the next tick.
    pub fn sync_tasks(&self) {
        let config = match load_config(&self.config_path) {
            Ok(config) => config,
            Err(err) => {
                error!("Error loading config: {err}");
                return;
            }
        };

        let notify_command = config.notify_command;
        let mut incoming: HashMap<String, _> = config
            .scripts
            .into_iter()
            .map(|task| (task.name.clone(), task))
            .collect();

        // Detach runners whose name vanished or whose descriptor changed;
        // unchanged tasks are dropped from `incoming` and left alone.
        let mut outgoing = Vec::new();
        {
            let mut runners = self.runners.write().unwrap();
            let names: Vec<String> = runners.keys().cloned().collect();
            for name in names {
                let unchanged = runners
                    .get(&name)
                    .is_some_and(|runner| incoming.get(&name) == Some(runner.config()));
                if unchanged {
                    incoming.remove(&name);
                    continue;
                }

                if incoming.contains_key(&name) {
                    info!("Task definition changed: {name}");
                } else {
                    info!("Task removed from config: {name}");
                }
                if let Some(runner) = runners.remove(&name) {
                    outgoing.push(runner);
                }
            }
        }

        // Stopping can block on a live child; do it outside the map lock so
        // dashboard reads stay responsive.
        for runner in outgoing {
            runner.stop();
        }

        if incoming.is_empty() {
            return;
        }

        let mut runners = self.runners.write().unwrap();
        for (name, task) in incoming {
            info!("Starting task: {name}");
            let runner = Arc::new(TaskRunner::new(task, notify_command.as_deref()));
            runner.start();
            runners.insert(name, runner);
        }
    }

    /// Stops and discards every runner.
    pub fn stop_all(&self) {
        info!("Stopping all tasks");
        let runners: Vec<_> = self.runners.write().unwrap().drain().collect();
        for (_, runner) in runners {
            runner.stop();
        }
    }

    fn wait(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                return;
            }
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            thread::sleep((deadline - now).min(Duration::from_millis(100)));
        }
    }
}
