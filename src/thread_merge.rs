//! Pid remapping into per-CPU synthetic threads.
//!
//! Threads outside the target package keep their scheduling footprint
//! (something ran on CPU N) but lose their identity: every foreign pid on a
//! CPU collapses into that CPU's single placeholder tid. Any missing
//! precondition is a hard error rather than a guess, since guessing in a
//! redaction path risks leaking data.

use anyhow::{bail, Context as _, Result};

use crate::context::Context;
use crate::redact_ftrace_events::FtraceEventRedaction;
use crate::timeline::ProcessThreadTimeline;

use perfetto_protos::ftrace_event::FtraceEvent;
use perfetto_protos::ftrace_event_bundle::FtraceEventBundle;

/// Validated inputs shared by every remap handler.
struct MergeScope<'a> {
    package_uid: u64,
    timeline: &'a ProcessThreadTimeline,
    tids: &'a [i32],
    cpu: usize,
    ts: u64,
}

impl<'a> MergeScope<'a> {
    fn new(
        context: &'a Context,
        bundle: &FtraceEventBundle,
        event: &FtraceEvent,
    ) -> Result<MergeScope<'a>> {
        let package_uid = context
            .package_uid
            .context("ThreadMerge: missing package uid")?;
        let synthetic = context
            .synthetic_threads
            .as_ref()
            .context("ThreadMerge: missing synthetic threads")?;
        if !bundle.has_cpu() {
            bail!("ThreadMerge: bundle without cpu");
        }
        let cpu = bundle.cpu() as usize;
        if cpu >= synthetic.tids.len() {
            bail!(
                "ThreadMerge: cpu {cpu} outside synthetic thread table of {}",
                synthetic.tids.len()
            );
        }
        if !event.has_timestamp() {
            bail!("ThreadMerge: event without timestamp");
        }
        Ok(MergeScope {
            package_uid,
            timeline: &context.timeline,
            tids: &synthetic.tids,
            cpu,
            ts: event.timestamp(),
        })
    }

    /// The pid to write out: unchanged for idle (0) and for threads
    /// connected to the target package, the CPU's synthetic tid otherwise.
    fn remap_pid(&self, pid: i32) -> i32 {
        if pid == 0 {
            return 0;
        }
        if self
            .timeline
            .pid_connects_to_uid(self.ts, pid, self.package_uid)
        {
            pid
        } else {
            self.tids[self.cpu]
        }
    }
}

/// Rewrites the ftrace event's own `pid` field.
pub struct ThreadMergeRemapFtraceEventPid;

impl FtraceEventRedaction for ThreadMergeRemapFtraceEventPid {
    fn redact(
        &self,
        context: &Context,
        bundle: &FtraceEventBundle,
        event: &FtraceEvent,
        output: &mut FtraceEvent,
    ) -> Result<()> {
        let scope = MergeScope::new(context, bundle, event)?;
        if !event.has_pid() {
            bail!("ThreadMerge: event without pid");
        }
        output.set_pid(scope.remap_pid(event.pid() as i32) as u32);
        Ok(())
    }
}

/// Rewrites `sched_switch.prev_pid` and `sched_switch.next_pid`
/// independently; either side may resolve to a different outcome. All other
/// sched_switch fields pass through unchanged.
pub struct ThreadMergeRemapSchedSwitchPid;

impl FtraceEventRedaction for ThreadMergeRemapSchedSwitchPid {
    fn redact(
        &self,
        context: &Context,
        bundle: &FtraceEventBundle,
        event: &FtraceEvent,
        output: &mut FtraceEvent,
    ) -> Result<()> {
        let scope = MergeScope::new(context, bundle, event)?;

        let sched_switch = event.sched_switch();
        if !sched_switch.has_prev_pid() {
            bail!("ThreadMerge: sched_switch without prev_pid");
        }
        if !sched_switch.has_next_pid() {
            bail!("ThreadMerge: sched_switch without next_pid");
        }

        let mut merged = sched_switch.clone();
        merged.set_prev_pid(scope.remap_pid(sched_switch.prev_pid()));
        merged.set_next_pid(scope.remap_pid(sched_switch.next_pid()));
        output.set_sched_switch(merged);
        Ok(())
    }
}

/// Rewrites the woken thread's pid in `sched_waking`. The waker's pid lives
/// in the enclosing event and is deliberately left to the event-pid handler.
pub struct ThreadMergeRemapSchedWakingPid;

impl FtraceEventRedaction for ThreadMergeRemapSchedWakingPid {
    fn redact(
        &self,
        context: &Context,
        bundle: &FtraceEventBundle,
        event: &FtraceEvent,
        output: &mut FtraceEvent,
    ) -> Result<()> {
        let scope = MergeScope::new(context, bundle, event)?;

        let sched_waking = event.sched_waking();
        if !sched_waking.has_pid() {
            bail!("ThreadMerge: sched_waking without pid");
        }

        let mut merged = sched_waking.clone();
        merged.set_pid(scope.remap_pid(sched_waking.pid()));
        output.set_sched_waking(merged);
        Ok(())
    }
}

/// Removes its field entirely. Registered for `task_newtask` and
/// `sched_process_free`: merged threads never start or end, and the
/// bookkeeping would leak real foreign pids.
pub struct ThreadMergeDropField;

impl FtraceEventRedaction for ThreadMergeDropField {
    fn redact(
        &self,
        _context: &Context,
        _bundle: &FtraceEventBundle,
        _event: &FtraceEvent,
        _output: &mut FtraceEvent,
    ) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::SyntheticThreads;
    use crate::timeline::Event;
    use perfetto_protos::sched::{SchedSwitchFtraceEvent, SchedWakingFtraceEvent};

    const CPU: u32 = 3;
    const TIMESTAMP: u64 = 123456789;

    // Connected to the target package.
    const PACKAGE_UID: u64 = 12;
    const PACKAGE_PID: i32 = 7;
    const PACKAGE_PID_B: i32 = 8;

    // Not connected to the target package.
    const OTHER_UID: u64 = 120;
    const OTHER_PID: i32 = 70;

    fn test_context() -> Context {
        let mut timeline = ProcessThreadTimeline::new();
        timeline.append(Event::open(0, PACKAGE_PID, 5, PACKAGE_UID));
        timeline.append(Event::open(0, PACKAGE_PID_B, 5, PACKAGE_UID));
        timeline.append(Event::open(0, OTHER_PID, 50, OTHER_UID));
        timeline.sort();

        Context {
            package_name: None,
            package_uid: Some(PACKAGE_UID),
            timeline,
            // cpu 3 means four cpus (0, 1, 2, 3).
            synthetic_threads: Some(SyntheticThreads {
                tgid: 99,
                tids: vec![100, 101, 102, 103],
            }),
            system_info: None,
        }
    }

    fn bundle_with_cpu() -> FtraceEventBundle {
        let mut bundle = FtraceEventBundle::default();
        bundle.set_cpu(CPU);
        bundle
    }

    fn event_with_pid(pid: i32) -> FtraceEvent {
        let mut event = FtraceEvent::default();
        event.set_timestamp(TIMESTAMP);
        event.set_pid(pid as u32);
        event
    }

    #[test]
    fn test_missing_cpu_is_an_error() {
        let context = test_context();
        let bundle = FtraceEventBundle::default();
        let event = event_with_pid(PACKAGE_PID);

        let mut output = FtraceEvent::default();
        let result =
            ThreadMergeRemapFtraceEventPid.redact(&context, &bundle, &event, &mut output);
        assert!(result.is_err());
    }

    #[test]
    fn test_missing_timestamp_is_an_error() {
        let context = test_context();
        let bundle = bundle_with_cpu();
        let mut event = FtraceEvent::default();
        event.set_pid(PACKAGE_PID as u32);

        let mut output = FtraceEvent::default();
        let result =
            ThreadMergeRemapFtraceEventPid.redact(&context, &bundle, &event, &mut output);
        assert!(result.is_err());
    }

    #[test]
    fn test_missing_synthetic_threads_is_an_error() {
        let mut context = test_context();
        context.synthetic_threads = None;

        let bundle = bundle_with_cpu();
        let event = event_with_pid(PACKAGE_PID);

        let mut output = FtraceEvent::default();
        let result =
            ThreadMergeRemapFtraceEventPid.redact(&context, &bundle, &event, &mut output);
        assert!(result.is_err());
    }

    #[test]
    fn test_cpu_outside_table_is_an_error() {
        let mut context = test_context();
        context.synthetic_threads = Some(SyntheticThreads {
            tgid: 99,
            tids: vec![100],
        });

        let bundle = bundle_with_cpu();
        let event = event_with_pid(PACKAGE_PID);

        let mut output = FtraceEvent::default();
        let result =
            ThreadMergeRemapFtraceEventPid.redact(&context, &bundle, &event, &mut output);
        assert!(result.is_err());
    }

    #[test]
    fn test_event_pid_in_package_is_unchanged() {
        let context = test_context();
        let bundle = bundle_with_cpu();
        let event = event_with_pid(PACKAGE_PID);

        let mut output = FtraceEvent::default();
        ThreadMergeRemapFtraceEventPid
            .redact(&context, &bundle, &event, &mut output)
            .unwrap();

        assert!(output.has_pid());
        assert_eq!(output.pid() as i32, PACKAGE_PID);
    }

    #[test]
    fn test_event_pid_outside_package_becomes_synthetic() {
        let context = test_context();
        let bundle = bundle_with_cpu();
        let event = event_with_pid(OTHER_PID);

        let mut output = FtraceEvent::default();
        ThreadMergeRemapFtraceEventPid
            .redact(&context, &bundle, &event, &mut output)
            .unwrap();

        assert_eq!(output.pid() as i32, 103);
    }

    #[test]
    fn test_idle_pid_passes_through() {
        let context = test_context();
        let bundle = bundle_with_cpu();
        let event = event_with_pid(0);

        let mut output = FtraceEvent::default();
        ThreadMergeRemapFtraceEventPid
            .redact(&context, &bundle, &event, &mut output)
            .unwrap();

        assert_eq!(output.pid(), 0);
    }

    #[test]
    fn test_substitution_is_deterministic_per_cpu() {
        let context = test_context();
        let bundle = bundle_with_cpu();

        // Two different foreign pids on the same CPU at different times both
        // collapse into the same synthetic tid.
        let mut first = event_with_pid(OTHER_PID);
        first.set_timestamp(TIMESTAMP);
        let mut second = event_with_pid(OTHER_PID + 1);
        second.set_timestamp(TIMESTAMP + 1000);

        let mut out_first = FtraceEvent::default();
        let mut out_second = FtraceEvent::default();
        ThreadMergeRemapFtraceEventPid
            .redact(&context, &bundle, &first, &mut out_first)
            .unwrap();
        ThreadMergeRemapFtraceEventPid
            .redact(&context, &bundle, &second, &mut out_second)
            .unwrap();

        assert_eq!(out_first.pid(), out_second.pid());
        assert_eq!(out_first.pid() as i32, 103);
    }

    fn switch_event(prev_pid: i32, next_pid: i32) -> FtraceEvent {
        let mut sched_switch = SchedSwitchFtraceEvent::default();
        sched_switch.set_prev_comm("prev".to_string());
        sched_switch.set_prev_pid(prev_pid);
        sched_switch.set_prev_prio(120);
        sched_switch.set_prev_state(0);
        sched_switch.set_next_comm("next".to_string());
        sched_switch.set_next_pid(next_pid);
        sched_switch.set_next_prio(120);

        let mut event = event_with_pid(PACKAGE_PID);
        event.set_sched_switch(sched_switch);
        event
    }

    #[test]
    fn test_switch_pids_in_package_are_unchanged() {
        let context = test_context();
        let bundle = bundle_with_cpu();
        let event = switch_event(PACKAGE_PID, PACKAGE_PID_B);

        let mut output = FtraceEvent::default();
        ThreadMergeRemapSchedSwitchPid
            .redact(&context, &bundle, &event, &mut output)
            .unwrap();

        assert_eq!(output.sched_switch().prev_pid(), PACKAGE_PID);
        assert_eq!(output.sched_switch().next_pid(), PACKAGE_PID_B);
        // The rest of the event passes through untouched.
        assert_eq!(output.sched_switch().prev_prio(), 120);
        assert_eq!(output.sched_switch().next_comm(), "next");
    }

    #[test]
    fn test_switch_prev_pid_remaps_independently() {
        let context = test_context();
        let bundle = bundle_with_cpu();
        let event = switch_event(OTHER_PID, PACKAGE_PID_B);

        let mut output = FtraceEvent::default();
        ThreadMergeRemapSchedSwitchPid
            .redact(&context, &bundle, &event, &mut output)
            .unwrap();

        assert_eq!(output.sched_switch().prev_pid(), 103);
        assert_eq!(output.sched_switch().next_pid(), PACKAGE_PID_B);
    }

    #[test]
    fn test_switch_next_pid_remaps_independently() {
        let context = test_context();
        let bundle = bundle_with_cpu();
        let event = switch_event(PACKAGE_PID, OTHER_PID);

        let mut output = FtraceEvent::default();
        ThreadMergeRemapSchedSwitchPid
            .redact(&context, &bundle, &event, &mut output)
            .unwrap();

        assert_eq!(output.sched_switch().prev_pid(), PACKAGE_PID);
        assert_eq!(output.sched_switch().next_pid(), 103);
    }

    #[test]
    fn test_switch_missing_pids_is_an_error() {
        let context = test_context();
        let bundle = bundle_with_cpu();

        let mut event = event_with_pid(PACKAGE_PID);
        event.set_sched_switch(SchedSwitchFtraceEvent::default());

        let mut output = FtraceEvent::default();
        let result =
            ThreadMergeRemapSchedSwitchPid.redact(&context, &bundle, &event, &mut output);
        assert!(result.is_err());
    }

    fn waking_event(wakee_pid: i32) -> FtraceEvent {
        let mut sched_waking = SchedWakingFtraceEvent::default();
        sched_waking.set_comm("wakee".to_string());
        sched_waking.set_pid(wakee_pid);
        sched_waking.set_prio(120);
        sched_waking.set_success(1);
        sched_waking.set_target_cpu(CPU as i32);

        let mut event = event_with_pid(PACKAGE_PID);
        event.set_sched_waking(sched_waking);
        event
    }

    #[test]
    fn test_waking_wakee_in_package_is_unchanged() {
        let context = test_context();
        let bundle = bundle_with_cpu();
        let event = waking_event(PACKAGE_PID_B);

        let mut output = FtraceEvent::default();
        ThreadMergeRemapSchedWakingPid
            .redact(&context, &bundle, &event, &mut output)
            .unwrap();

        assert_eq!(output.sched_waking().pid(), PACKAGE_PID_B);
    }

    #[test]
    fn test_waking_wakee_outside_package_becomes_synthetic() {
        let context = test_context();
        let bundle = bundle_with_cpu();
        let event = waking_event(OTHER_PID);

        let mut output = FtraceEvent::default();
        ThreadMergeRemapSchedWakingPid
            .redact(&context, &bundle, &event, &mut output)
            .unwrap();

        assert_eq!(output.sched_waking().pid(), 103);
    }

    #[test]
    fn test_waking_leaves_waker_untouched() {
        let context = test_context();
        let bundle = bundle_with_cpu();
        let event = waking_event(PACKAGE_PID_B);

        let mut output = FtraceEvent::default();
        ThreadMergeRemapSchedWakingPid
            .redact(&context, &bundle, &event, &mut output)
            .unwrap();

        // The waker pid lives in the enclosing event; this handler must not
        // write it.
        assert!(!output.has_pid());
    }

    #[test]
    fn test_drop_field_writes_nothing() {
        let context = test_context();
        let bundle = bundle_with_cpu();
        let event = event_with_pid(PACKAGE_PID);

        let mut output = FtraceEvent::default();
        ThreadMergeDropField
            .redact(&context, &bundle, &event, &mut output)
            .unwrap();

        assert_eq!(output, FtraceEvent::default());
    }
}
