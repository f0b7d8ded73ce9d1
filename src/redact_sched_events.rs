//! Comm scrubbing and row filtering over scheduling data.
//!
//! Scheduling data arrives in two encodings that must end up agreeing: one
//! message per event, and the columnar compact encoding where many rows on a
//! CPU share delta-encoded timestamps and an interned comm table. What to do
//! to a row is delegated to two capabilities: a [`PidCommModifier`] rewrites
//! the pid/comm of a scheduling participant, and a [`WakingFilter`] decides
//! which compact waking rows survive at all.

use std::collections::HashMap;

use anyhow::{bail, ensure, Context as _, Result};
use protobuf::Message;

use crate::context::Context;
use crate::pipeline::TransformPrimitive;
use crate::wire::{field_number, FieldReader, MessageBuffer};

use perfetto_protos::ftrace_event::FtraceEvent;
use perfetto_protos::ftrace_event_bundle::ftrace_event_bundle::CompactSched;
use perfetto_protos::ftrace_event_bundle::FtraceEventBundle;
use perfetto_protos::sched::{SchedSwitchFtraceEvent, SchedWakingFtraceEvent};
use perfetto_protos::trace_packet::TracePacket;

/// Rewrites one scheduling participant's pid and/or comm.
pub trait PidCommModifier {
    fn modify(&self, context: &Context, ts: u64, cpu: i32, pid: &mut i32, comm: &mut String);
}

/// Blanks the comm of any participant not connected to the target package.
/// With no target package configured every comm is blanked; unknown means
/// foreign.
pub struct ClearComms;

impl PidCommModifier for ClearComms {
    fn modify(&self, context: &Context, ts: u64, _cpu: i32, pid: &mut i32, comm: &mut String) {
        match context.package_uid {
            Some(uid) if context.timeline.pid_connects_to_uid(ts, *pid, uid) => {}
            _ => comm.clear(),
        }
    }
}

/// Leaves every row untouched.
pub struct DoNothing;

impl PidCommModifier for DoNothing {
    fn modify(&self, _context: &Context, _ts: u64, _cpu: i32, _pid: &mut i32, _comm: &mut String) {
    }
}

/// Decides whether a compact waking row is kept.
pub trait WakingFilter {
    fn includes(&self, context: &Context, ts: u64, pid: i32) -> bool;
}

/// Keeps every row.
pub struct AllowAll;

impl WakingFilter for AllowAll {
    fn includes(&self, _context: &Context, _ts: u64, _pid: i32) -> bool {
        true
    }
}

/// Keeps a row only when the woken thread belongs to the target package.
pub struct ConnectedToPackage;

impl WakingFilter for ConnectedToPackage {
    fn includes(&self, context: &Context, ts: u64, pid: i32) -> bool {
        match context.package_uid {
            Some(uid) => context.timeline.pid_connects_to_uid(ts, pid, uid),
            None => false,
        }
    }
}

/// Intern-table handling for the compact encoding. Entries are shared by
/// index across rows, so an entry is never rewritten in place; a changed
/// comm is looked up and appended when new, and only the changed row's index
/// moves.
struct InternTable {
    entries: Vec<String>,
    index: HashMap<String, u32>,
}

impl InternTable {
    fn new(entries: &[String]) -> InternTable {
        let mut index = HashMap::new();
        for (i, entry) in entries.iter().enumerate() {
            index.entry(entry.clone()).or_insert(i as u32);
        }
        InternTable {
            entries: entries.to_vec(),
            index,
        }
    }

    fn get(&self, index: u32) -> Result<&str> {
        self.entries
            .get(index as usize)
            .map(String::as_str)
            .with_context(|| format!("comm index {index} outside intern table"))
    }

    fn intern(&mut self, comm: String) -> u32 {
        if let Some(&i) = self.index.get(&comm) {
            return i;
        }
        let i = self.entries.len() as u32;
        self.entries.push(comm.clone());
        self.index.insert(comm, i);
        i
    }

    fn into_entries(self) -> Vec<String> {
        self.entries
    }
}

/// Scrubs comms (and optionally pids) out of scheduling events in both
/// encodings and filters compact waking rows.
pub struct RedactSchedEvents {
    modifier: Box<dyn PidCommModifier>,
    waking_filter: Box<dyn WakingFilter>,
}

impl Default for RedactSchedEvents {
    /// The production policy: blank foreign comms and drop waking rows for
    /// threads outside the target package.
    fn default() -> RedactSchedEvents {
        RedactSchedEvents::new(Box::new(ClearComms), Box::new(ConnectedToPackage))
    }
}

impl RedactSchedEvents {
    pub fn new(
        modifier: Box<dyn PidCommModifier>,
        waking_filter: Box<dyn WakingFilter>,
    ) -> RedactSchedEvents {
        RedactSchedEvents {
            modifier,
            waking_filter,
        }
    }

    fn on_ftrace_events(&self, context: &Context, bundle_bytes: &[u8]) -> Result<Vec<u8>> {
        let cpu_field = field_number::<FtraceEventBundle>("cpu");
        let event_field = field_number::<FtraceEventBundle>("event");
        let compact_field = field_number::<FtraceEventBundle>("compact_sched");

        // The cpu can appear after the events in the encoded bundle, so find
        // it before walking.
        let mut cpu = None;
        let mut reader = FieldReader::new(bundle_bytes);
        while let Some(field) = reader.read_field()? {
            if field.id == cpu_field {
                cpu = Some(field.varint()? as i32);
            }
        }

        let mut out = MessageBuffer::new();
        let mut reader = FieldReader::new(bundle_bytes);
        while let Some(field) = reader.read_field()? {
            if field.id == event_field {
                let cpu = cpu.context("RedactSchedEvents: bundle without cpu")?;
                let event = self.on_ftrace_event(context, cpu, field.payload)?;
                out.append_len_field(event_field, &event);
            } else if field.id == compact_field {
                let cpu = cpu.context("RedactSchedEvents: bundle without cpu")?;
                let compact = self.on_compact_sched(context, cpu, field.payload)?;
                out.append_len_field(compact_field, &compact);
            } else {
                out.append_raw(field.raw);
            }
        }
        Ok(out.into_bytes())
    }

    fn on_ftrace_event(&self, context: &Context, cpu: i32, event_bytes: &[u8]) -> Result<Vec<u8>> {
        let event =
            FtraceEvent::parse_from_bytes(event_bytes).context("malformed ftrace event")?;

        if !event.has_sched_switch() && !event.has_sched_waking() {
            return Ok(event_bytes.to_vec());
        }
        if !event.has_timestamp() {
            bail!("RedactSchedEvents: event without timestamp");
        }
        let ts = event.timestamp();

        let switch_field = field_number::<FtraceEvent>("sched_switch");
        let waking_field = field_number::<FtraceEvent>("sched_waking");

        let mut out = MessageBuffer::new();
        let mut reader = FieldReader::new(event_bytes);
        while let Some(field) = reader.read_field()? {
            if field.id == switch_field {
                let merged = self.on_sched_switch(context, ts, cpu, event.sched_switch())?;
                out.append_message(switch_field, &merged)?;
            } else if field.id == waking_field {
                let merged = self.on_sched_waking(context, ts, cpu, event.sched_waking())?;
                out.append_message(waking_field, &merged)?;
            } else {
                out.append_raw(field.raw);
            }
        }
        Ok(out.into_bytes())
    }

    /// Both sides of a context switch are judged independently; either comm
    /// may be blanked while the other survives.
    fn on_sched_switch(
        &self,
        context: &Context,
        ts: u64,
        cpu: i32,
        sched_switch: &SchedSwitchFtraceEvent,
    ) -> Result<SchedSwitchFtraceEvent> {
        if !sched_switch.has_prev_pid() || !sched_switch.has_prev_comm() {
            bail!("RedactSchedEvents: sched_switch without prev pid/comm");
        }
        if !sched_switch.has_next_pid() || !sched_switch.has_next_comm() {
            bail!("RedactSchedEvents: sched_switch without next pid/comm");
        }

        let mut merged = sched_switch.clone();

        let mut prev_pid = sched_switch.prev_pid();
        let mut prev_comm = sched_switch.prev_comm().to_string();
        self.modifier
            .modify(context, ts, cpu, &mut prev_pid, &mut prev_comm);
        merged.set_prev_pid(prev_pid);
        merged.set_prev_comm(prev_comm);

        let mut next_pid = sched_switch.next_pid();
        let mut next_comm = sched_switch.next_comm().to_string();
        self.modifier
            .modify(context, ts, cpu, &mut next_pid, &mut next_comm);
        merged.set_next_pid(next_pid);
        merged.set_next_comm(next_comm);

        Ok(merged)
    }

    /// Only the woken thread is described here; the waker pid lives in the
    /// enclosing event and belongs to another primitive.
    fn on_sched_waking(
        &self,
        context: &Context,
        ts: u64,
        cpu: i32,
        sched_waking: &SchedWakingFtraceEvent,
    ) -> Result<SchedWakingFtraceEvent> {
        if !sched_waking.has_pid() || !sched_waking.has_comm() {
            bail!("RedactSchedEvents: sched_waking without pid/comm");
        }

        let mut merged = sched_waking.clone();

        let mut pid = sched_waking.pid();
        let mut comm = sched_waking.comm().to_string();
        self.modifier.modify(context, ts, cpu, &mut pid, &mut comm);
        merged.set_pid(pid);
        merged.set_comm(comm);

        Ok(merged)
    }

    fn on_compact_sched(&self, context: &Context, cpu: i32, bytes: &[u8]) -> Result<Vec<u8>> {
        let compact =
            CompactSched::parse_from_bytes(bytes).context("malformed compact sched")?;

        let mut intern = InternTable::new(&compact.intern_table);
        let mut out = CompactSched::new();

        self.on_compact_switch(context, cpu, &compact, &mut intern, &mut out)?;
        self.on_compact_waking(context, cpu, &compact, &mut intern, &mut out)?;

        out.intern_table = intern.into_entries();
        Ok(out.write_to_bytes()?)
    }

    fn on_compact_switch(
        &self,
        context: &Context,
        cpu: i32,
        compact: &CompactSched,
        intern: &mut InternTable,
        out: &mut CompactSched,
    ) -> Result<()> {
        let rows = compact.switch_timestamp.len();
        ensure!(
            compact.switch_next_pid.len() == rows
                && compact.switch_prev_state.len() == rows
                && compact.switch_next_prio.len() == rows
                && compact.switch_next_comm_index.len() == rows,
            "RedactSchedEvents: misaligned compact switch arrays"
        );

        let mut ts: u64 = 0;
        for i in 0..rows {
            // Timestamps are deltas; the modifier sees absolute time.
            ts += compact.switch_timestamp[i];

            let mut pid = compact.switch_next_pid[i];
            let mut comm = intern.get(compact.switch_next_comm_index[i])?.to_string();
            self.modifier.modify(context, ts, cpu, &mut pid, &mut comm);

            out.switch_timestamp.push(compact.switch_timestamp[i]);
            out.switch_prev_state.push(compact.switch_prev_state[i]);
            out.switch_next_prio.push(compact.switch_next_prio[i]);
            out.switch_next_pid.push(pid);
            out.switch_next_comm_index.push(intern.intern(comm));
        }
        Ok(())
    }

    /// Waking rows can be dropped entirely. Because each row's timestamp is
    /// a delta from the previous row, a dropped row's delta is carried
    /// forward and absorbed by the next kept row; the carry resets only on
    /// an emitted row, and a trailing run of drops has nothing left to
    /// absorb it.
    fn on_compact_waking(
        &self,
        context: &Context,
        cpu: i32,
        compact: &CompactSched,
        intern: &mut InternTable,
        out: &mut CompactSched,
    ) -> Result<()> {
        let rows = compact.waking_timestamp.len();
        ensure!(
            compact.waking_pid.len() == rows
                && compact.waking_target_cpu.len() == rows
                && compact.waking_prio.len() == rows
                && compact.waking_comm_index.len() == rows
                && compact.waking_common_flags.len() == rows,
            "RedactSchedEvents: misaligned compact waking arrays"
        );

        let mut ts: u64 = 0;
        let mut pending: u64 = 0;
        for i in 0..rows {
            let delta = compact.waking_timestamp[i];
            ts += delta;

            let pid = compact.waking_pid[i];
            if !self.waking_filter.includes(context, ts, pid) {
                pending += delta;
                continue;
            }

            let mut pid = pid;
            let mut comm = intern.get(compact.waking_comm_index[i])?.to_string();
            self.modifier.modify(context, ts, cpu, &mut pid, &mut comm);

            out.waking_timestamp.push(delta + pending);
            pending = 0;
            out.waking_pid.push(pid);
            out.waking_target_cpu.push(compact.waking_target_cpu[i]);
            out.waking_prio.push(compact.waking_prio[i]);
            out.waking_comm_index.push(intern.intern(comm));
            out.waking_common_flags.push(compact.waking_common_flags[i]);
        }
        Ok(())
    }
}

impl TransformPrimitive for RedactSchedEvents {
    fn transform(&self, context: &Context, packet: &mut Vec<u8>) -> Result<()> {
        if packet.is_empty() {
            bail!("RedactSchedEvents: empty packet");
        }
        if context.package_uid.is_none() {
            bail!("RedactSchedEvents: missing package uid");
        }

        let ftrace_events_field = field_number::<TracePacket>("ftrace_events");

        let mut out = MessageBuffer::new();
        let mut reader = FieldReader::new(packet);
        while let Some(field) = reader.read_field()? {
            if field.id == ftrace_events_field {
                let bundle = self.on_ftrace_events(context, field.payload)?;
                out.append_len_field(ftrace_events_field, &bundle);
            } else {
                out.append_raw(field.raw);
            }
        }

        *packet = out.into_bytes();
        Ok(())
    }
}
