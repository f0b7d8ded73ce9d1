//! Generic per-field redaction over ftrace events.
//!
//! A trace packet's ftrace bundle is walked field by field. Fields with a
//! registered handler are rewritten (or dropped, if the handler writes
//! nothing); every other field is copied byte-for-byte. Copy-not-drop is the
//! safe default for anything nobody claimed.

use std::collections::HashMap;

use anyhow::{bail, Context as _, Result};
use protobuf::Message;

use crate::context::Context;
use crate::pipeline::TransformPrimitive;
use crate::wire::{field_number, FieldReader, MessageBuffer};

use perfetto_protos::ftrace_event::FtraceEvent;
use perfetto_protos::ftrace_event_bundle::FtraceEventBundle;
use perfetto_protos::trace_packet::TracePacket;

/// A handler claiming one ftrace-event field.
///
/// The handler sees the whole decoded event (and the enclosing bundle, for
/// per-CPU context) and may write at most one field into `output`,
/// conventionally the field it was registered for. Writing nothing drops the
/// field from the output.
pub trait FtraceEventRedaction {
    fn redact(
        &self,
        context: &Context,
        bundle: &FtraceEventBundle,
        event: &FtraceEvent,
        output: &mut FtraceEvent,
    ) -> Result<()>;
}

/// Walks packet → bundle → event and dispatches event fields to their
/// registered handlers.
pub struct RedactFtraceEvents {
    redactions: HashMap<u32, Box<dyn FtraceEventRedaction>>,
}

impl Default for RedactFtraceEvents {
    fn default() -> RedactFtraceEvents {
        RedactFtraceEvents::new()
    }
}

impl RedactFtraceEvents {
    pub fn new() -> RedactFtraceEvents {
        RedactFtraceEvents {
            redactions: HashMap::new(),
        }
    }

    /// The production registration set: merge foreign pids into per-CPU
    /// synthetic threads and drop thread creation/free bookkeeping (which
    /// would leak real pids for threads that no longer exist in the output).
    pub fn with_thread_merging() -> Result<RedactFtraceEvents> {
        use crate::thread_merge::{
            ThreadMergeDropField, ThreadMergeRemapFtraceEventPid, ThreadMergeRemapSchedSwitchPid,
            ThreadMergeRemapSchedWakingPid,
        };

        let mut redact = RedactFtraceEvents::new();
        redact.register(
            field_number::<FtraceEvent>("pid"),
            Box::new(ThreadMergeRemapFtraceEventPid),
        )?;
        redact.register(
            field_number::<FtraceEvent>("sched_switch"),
            Box::new(ThreadMergeRemapSchedSwitchPid),
        )?;
        redact.register(
            field_number::<FtraceEvent>("sched_waking"),
            Box::new(ThreadMergeRemapSchedWakingPid),
        )?;
        redact.register(
            field_number::<FtraceEvent>("task_newtask"),
            Box::new(ThreadMergeDropField),
        )?;
        redact.register(
            field_number::<FtraceEvent>("sched_process_free"),
            Box::new(ThreadMergeDropField),
        )?;
        Ok(redact)
    }

    /// Registers `redaction` for `field_id`. Exactly one handler may claim a
    /// field; a second registration is rejected.
    pub fn register(
        &mut self,
        field_id: u32,
        redaction: Box<dyn FtraceEventRedaction>,
    ) -> Result<()> {
        if self.redactions.contains_key(&field_id) {
            bail!("field {field_id} already has a registered redaction");
        }
        self.redactions.insert(field_id, redaction);
        Ok(())
    }

    fn on_ftrace_events(&self, context: &Context, bundle_bytes: &[u8]) -> Result<Vec<u8>> {
        let bundle = FtraceEventBundle::parse_from_bytes(bundle_bytes)
            .context("malformed ftrace event bundle")?;
        let event_field = field_number::<FtraceEventBundle>("event");

        let mut out = MessageBuffer::new();
        let mut reader = FieldReader::new(bundle_bytes);
        while let Some(field) = reader.read_field()? {
            if field.id == event_field {
                let event = self.on_ftrace_event(context, &bundle, field.payload)?;
                out.append_len_field(event_field, &event);
            } else {
                out.append_raw(field.raw);
            }
        }
        Ok(out.into_bytes())
    }

    fn on_ftrace_event(
        &self,
        context: &Context,
        bundle: &FtraceEventBundle,
        event_bytes: &[u8],
    ) -> Result<Vec<u8>> {
        let event =
            FtraceEvent::parse_from_bytes(event_bytes).context("malformed ftrace event")?;

        // Handler-written fields accumulate here and are appended after the
        // verbatim copies; encoded fields concatenate, so ordering within
        // the message does not matter.
        let mut patched = FtraceEvent::default();

        let mut out = MessageBuffer::new();
        let mut reader = FieldReader::new(event_bytes);
        while let Some(field) = reader.read_field()? {
            match self.redactions.get(&field.id) {
                Some(redaction) => redaction.redact(context, bundle, &event, &mut patched)?,
                None => out.append_raw(field.raw),
            }
        }

        let mut bytes = out.into_bytes();
        bytes.extend_from_slice(&patched.write_to_bytes()?);
        Ok(bytes)
    }
}

impl TransformPrimitive for RedactFtraceEvents {
    fn transform(&self, context: &Context, packet: &mut Vec<u8>) -> Result<()> {
        if packet.is_empty() {
            bail!("RedactFtraceEvents: empty packet");
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
