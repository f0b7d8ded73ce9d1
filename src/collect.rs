//! Collect-pass primitives that populate the context.

use anyhow::Result;

use crate::context::ContextBuilder;
use crate::pipeline::{CollectPrimitive, ContinueCollection};
use crate::timeline::Event;

use perfetto_protos::trace_packet::TracePacket;

/// Builds the process/thread ancestry timeline.
///
/// Process-tree snapshots open every listed process (with its uid) and
/// thread (uid left unresolved, to be climbed through the parent later).
/// The snapshot is stamped with the packet's timestamp: the tree existed no
/// later than "now". Inside ftrace bundles, `task_newtask` opens the new
/// thread under the emitting pid and `sched_process_free` closes the freed
/// one, each at the event's own timestamp.
pub struct BuildTimeline;

impl CollectPrimitive for BuildTimeline {
    fn collect(
        &mut self,
        packet: &TracePacket,
        context: &mut ContextBuilder,
    ) -> Result<ContinueCollection> {
        if packet.has_process_tree() {
            let ts = packet.timestamp();
            let tree = packet.process_tree();

            for process in &tree.processes {
                let uid = process.uid().max(0) as u64;
                context
                    .timeline
                    .append(Event::open(ts, process.pid(), process.ppid(), uid));
            }
            for thread in &tree.threads {
                context
                    .timeline
                    .append(Event::open(ts, thread.tid(), thread.tgid(), 0));
            }
        } else if packet.has_ftrace_events() {
            for event in &packet.ftrace_events().event {
                if event.has_task_newtask() {
                    let new_task = event.task_newtask();
                    context.timeline.append(Event::open(
                        event.timestamp(),
                        new_task.pid(),
                        event.pid() as i32,
                        0,
                    ));
                } else if event.has_sched_process_free() {
                    let free = event.sched_process_free();
                    context
                        .timeline
                        .append(Event::close(event.timestamp(), free.pid()));
                }
            }
        }

        Ok(ContinueCollection::NextPacket)
    }
}

/// Records system-level facts: the highest CPU index seen in any ftrace
/// bundle, which later sizes the synthetic thread table.
#[derive(Default)]
pub struct CollectSystemInfo;

impl CollectPrimitive for CollectSystemInfo {
    fn collect(
        &mut self,
        packet: &TracePacket,
        context: &mut ContextBuilder,
    ) -> Result<ContinueCollection> {
        if packet.has_ftrace_events() {
            let bundle = packet.ftrace_events();
            if bundle.has_cpu() {
                context.observe_cpu(bundle.cpu());
            }
        }
        Ok(ContinueCollection::NextPacket)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use perfetto_protos::ftrace_event::FtraceEvent;
    use perfetto_protos::ftrace_event_bundle::FtraceEventBundle;
    use perfetto_protos::process_tree::process_tree::{Process, Thread};
    use perfetto_protos::process_tree::ProcessTree;
    use perfetto_protos::sched::SchedProcessFreeFtraceEvent;
    use perfetto_protos::task::TaskNewtaskFtraceEvent;

    const UID_A: u64 = 10_001;
    const PID_A: i32 = 11;
    const TID_B: i32 = 12;
    const PID_NEW: i32 = 20;

    fn process_tree_packet(ts: u64) -> TracePacket {
        let mut process = Process::default();
        process.set_pid(PID_A);
        process.set_ppid(1);
        process.set_uid(UID_A as i32);

        let mut thread = Thread::default();
        thread.set_tid(TID_B);
        thread.set_tgid(PID_A);

        let mut tree = ProcessTree::default();
        tree.processes.push(process);
        tree.threads.push(thread);

        let mut packet = TracePacket::default();
        packet.set_timestamp(ts);
        packet.set_process_tree(tree);
        packet
    }

    #[test]
    fn test_process_tree_opens_processes_and_threads() {
        let mut builder = ContextBuilder::new();
        BuildTimeline
            .collect(&process_tree_packet(1000), &mut builder)
            .unwrap();

        let context = builder.with_package(UID_A, None).freeze();

        // The process resolves directly; the thread resolves through it.
        assert!(context.timeline.pid_connects_to_uid(1000, PID_A, UID_A));
        assert!(context.timeline.pid_connects_to_uid(1000, TID_B, UID_A));

        // The snapshot is stamped with the packet timestamp, so nothing
        // exists before it.
        assert!(!context.timeline.pid_connects_to_uid(999, PID_A, UID_A));
    }

    #[test]
    fn test_newtask_opens_under_emitting_pid() {
        let mut new_task = TaskNewtaskFtraceEvent::default();
        new_task.set_pid(PID_NEW);
        new_task.set_comm("worker".to_string());

        let mut event = FtraceEvent::default();
        event.set_timestamp(2000);
        event.set_pid(PID_A as u32);
        event.set_task_newtask(new_task);

        let mut bundle = FtraceEventBundle::default();
        bundle.set_cpu(0);
        bundle.event.push(event);

        let mut ftrace_packet = TracePacket::default();
        ftrace_packet.set_ftrace_events(bundle);

        let mut builder = ContextBuilder::new();
        BuildTimeline
            .collect(&process_tree_packet(1000), &mut builder)
            .unwrap();
        BuildTimeline.collect(&ftrace_packet, &mut builder).unwrap();

        let context = builder.with_package(UID_A, None).freeze();
        assert!(context.timeline.pid_connects_to_uid(2000, PID_NEW, UID_A));
        assert!(!context.timeline.pid_connects_to_uid(1999, PID_NEW, UID_A));
    }

    #[test]
    fn test_process_free_closes_pid() {
        let mut free = SchedProcessFreeFtraceEvent::default();
        free.set_pid(PID_A);
        free.set_comm("app".to_string());
        free.set_prio(120);

        let mut event = FtraceEvent::default();
        event.set_timestamp(3000);
        event.set_pid(0);
        event.set_sched_process_free(free);

        let mut bundle = FtraceEventBundle::default();
        bundle.set_cpu(0);
        bundle.event.push(event);

        let mut ftrace_packet = TracePacket::default();
        ftrace_packet.set_ftrace_events(bundle);

        let mut builder = ContextBuilder::new();
        BuildTimeline
            .collect(&process_tree_packet(1000), &mut builder)
            .unwrap();
        BuildTimeline.collect(&ftrace_packet, &mut builder).unwrap();

        let context = builder.with_package(UID_A, None).freeze();
        assert!(context.timeline.pid_connects_to_uid(2000, PID_A, UID_A));
        assert!(!context.timeline.pid_connects_to_uid(3000, PID_A, UID_A));
    }

    #[test]
    fn test_system_info_tracks_highest_cpu() {
        let mut builder = ContextBuilder::new();
        let mut collector = CollectSystemInfo::default();

        for cpu in [2u32, 0, 5, 1] {
            let mut bundle = FtraceEventBundle::default();
            bundle.set_cpu(cpu);
            let mut packet = TracePacket::default();
            packet.set_ftrace_events(bundle);
            collector.collect(&packet, &mut builder).unwrap();
        }

        assert_eq!(builder.last_cpu, Some(5));
    }

    #[test]
    fn test_unrelated_packets_are_ignored() {
        let mut builder = ContextBuilder::new();
        let mut packet = TracePacket::default();
        packet.set_timestamp(1);

        let verdict = BuildTimeline.collect(&packet, &mut builder).unwrap();
        assert_eq!(verdict, ContinueCollection::NextPacket);

        let verdict = CollectSystemInfo::default()
            .collect(&packet, &mut builder)
            .unwrap();
        assert_eq!(verdict, ContinueCollection::NextPacket);
        assert!(builder.last_cpu.is_none());
    }
}
