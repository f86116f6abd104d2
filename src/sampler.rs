//! Resource usage sampling for runner children.
use serde::Serialize;
use std::collections::HashSet;
use sysinfo::{Pid, ProcessesToUpdate, System};

/// CPU and memory usage aggregated over a process tree.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ResourceUsage {
    /// Summed CPU usage as a percentage of one core.
    pub cpu_percent: f32,
    /// Summed resident set size in bytes.
    pub memory_bytes: u64,
}

/// Samples a process and its transitive descendants.
///
/// CPU usage requires two consecutive refreshes of the same process handle,
/// so the sampler keeps its `System` alive between calls and tracks which
/// PIDs it has already seen: a freshly discovered PID contributes 0% CPU on
/// its first sighting and real numbers from the next call on. PIDs that
/// disappeared are evicted from the tracking set on every call.
pub struct ResourceSampler {
    system: System,
    primed: HashSet<Pid>,
}

impl ResourceSampler {
    /// Creates an empty sampler.
    pub fn new() -> Self {
        Self {
            system: System::new(),
            primed: HashSet::new(),
        }
    }

    /// Aggregates usage for `root` and everything below it.
    ///
    /// Returns zeros when `root` is absent or no longer alive; missing or
    /// inaccessible processes contribute nothing.
    pub fn sample(&mut self, root: Option<u32>) -> ResourceUsage {
        let Some(root) = root else {
            self.primed.clear();
            return ResourceUsage::default();
        };

        self.system
            .refresh_processes(ProcessesToUpdate::All, true);

        let root_pid = Pid::from_u32(root);
        if self.system.process(root_pid).is_none() {
            self.primed.clear();
            return ResourceUsage::default();
        }

        let mut usage = ResourceUsage::default();
        let mut seen = HashSet::new();

        for pid in self.collect_tree(root_pid) {
            if let Some(process) = self.system.process(pid) {
                usage.memory_bytes += process.memory();
                if self.primed.contains(&pid) {
                    usage.cpu_percent += process.cpu_usage();
                }
                seen.insert(pid);
            }
        }

        self.primed = seen;
        usage
    }

    /// Collects `root` plus every process whose parent chain reaches it.
    fn collect_tree(&self, root: Pid) -> Vec<Pid> {
        let mut members = vec![root];

        'candidates: for (pid, process) in self.system.processes() {
            if *pid == root {
                continue;
            }

            let mut current = process.parent();
            let mut depth = 0;
            while let Some(parent) = current {
                if parent == root {
                    members.push(*pid);
                    continue 'candidates;
                }
                depth += 1;
                if depth > 64 {
                    break;
                }
                current = self.system.process(parent).and_then(|p| p.parent());
            }
        }

        members
    }
}

impl Default for ResourceSampler {
    fn default() -> Self {
        Self::new()
    }
}
