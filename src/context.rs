//! Shared state threaded through the redaction passes.
//!
//! The collect pass mutates a [`ContextBuilder`]; freezing it produces the
//! read-only [`Context`] every transform receives. The split makes the
//! "mutable while collecting, immutable while transforming" discipline a
//! property of the types instead of a convention.

use crate::timeline::ProcessThreadTimeline;

/// Placeholder thread ids substituted for threads outside the target
/// package: one process, one thread per CPU. Synthetic threads never exit,
/// so a trace reader sees a stable per-CPU "other work" thread.
#[derive(Debug, Clone)]
pub struct SyntheticThreads {
    pub tgid: i32,
    pub tids: Vec<i32>,
}

impl SyntheticThreads {
    /// Allocates the synthetic process and one tid per CPU starting just
    /// past `first_free_pid`, so placeholders cannot collide with real
    /// threads seen by the timeline.
    fn new(first_free_pid: i32, last_cpu: u32) -> SyntheticThreads {
        let tgid = first_free_pid;
        let tids = (0..=last_cpu).map(|cpu| tgid + 1 + cpu as i32).collect();
        SyntheticThreads { tgid, tids }
    }
}

/// System-level facts observed while collecting.
#[derive(Debug, Clone, Copy)]
pub struct SystemInfo {
    /// Highest CPU index seen in any ftrace event bundle.
    pub last_cpu: u32,
}

/// Mutable collect-pass state. Only collectors write to it.
#[derive(Debug, Default)]
pub struct ContextBuilder {
    pub package_name: Option<String>,
    pub package_uid: Option<u64>,
    pub timeline: ProcessThreadTimeline,
    pub last_cpu: Option<u32>,
}

impl ContextBuilder {
    pub fn new() -> ContextBuilder {
        ContextBuilder::default()
    }

    pub fn with_package(mut self, uid: u64, name: Option<String>) -> ContextBuilder {
        self.package_uid = Some(uid);
        self.package_name = name;
        self
    }

    /// Raise the highest-seen CPU index.
    pub fn observe_cpu(&mut self, cpu: u32) {
        self.last_cpu = Some(self.last_cpu.map_or(cpu, |c| c.max(cpu)));
    }

    /// Ends the collect pass: sorts the timeline, resolves and trims it to
    /// the target package when one is known, and derives the synthetic
    /// thread table from the observed CPU count.
    pub fn freeze(mut self) -> Context {
        let first_free_pid = self.timeline.max_pid() + 1;

        self.timeline.sort();
        if let Some(uid) = self.package_uid {
            self.timeline.flatten();
            self.timeline.reduce(uid);
        }

        let system_info = self.last_cpu.map(|last_cpu| SystemInfo { last_cpu });
        let synthetic_threads = system_info
            .as_ref()
            .map(|info| SyntheticThreads::new(first_free_pid, info.last_cpu));

        Context {
            package_name: self.package_name,
            package_uid: self.package_uid,
            timeline: self.timeline,
            synthetic_threads,
            system_info,
        }
    }
}

/// Frozen transform-pass state. Transforms hold it by shared reference and
/// can only read.
#[derive(Debug)]
pub struct Context {
    pub package_name: Option<String>,
    pub package_uid: Option<u64>,
    pub timeline: ProcessThreadTimeline,
    pub synthetic_threads: Option<SyntheticThreads>,
    pub system_info: Option<SystemInfo>,
}
