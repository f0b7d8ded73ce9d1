//! Two-pass redaction pipeline.
//!
//! Pass 1 (collect) walks every packet and populates the context. Pass 2
//! (transform) rewrites each packet's bytes through the registered
//! transforms and reassembles the trace with identical container framing.
//! A transform error is fatal for the whole run: a partially redacted trace
//! is worse than no trace.

use anyhow::{Context as _, Result};
use protobuf::Message;
use tracing::debug;

use crate::context::{Context, ContextBuilder};
use crate::wire::{field_number, FieldReader, MessageBuffer};

use perfetto_protos::trace::Trace;
use perfetto_protos::trace_packet::TracePacket;

/// A collector's verdict after seeing one packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContinueCollection {
    /// Keep feeding this collector packets.
    NextPacket,
    /// This collector has everything it needs.
    Retire,
}

/// A collect-pass primitive: reads packets, writes context.
pub trait CollectPrimitive {
    fn collect(
        &mut self,
        packet: &TracePacket,
        context: &mut ContextBuilder,
    ) -> Result<ContinueCollection>;
}

/// A transform-pass primitive: rewrites one packet's bytes in place against
/// the frozen context.
pub trait TransformPrimitive {
    fn transform(&self, context: &Context, packet: &mut Vec<u8>) -> Result<()>;
}

/// Owns the registered primitives and runs the two passes over a serialized
/// trace.
#[derive(Default)]
pub struct TraceRedactor {
    collectors: Vec<Box<dyn CollectPrimitive>>,
    transforms: Vec<Box<dyn TransformPrimitive>>,
}

impl TraceRedactor {
    pub fn new() -> TraceRedactor {
        TraceRedactor::default()
    }

    /// The production pipeline: timeline + system info collectors, comm
    /// scrubbing and waking-row filtering, then pid merging into synthetic
    /// threads. Comm scrubbing runs before the pid remap so package
    /// connectivity is judged on real pids.
    pub fn standard() -> Result<TraceRedactor> {
        use crate::collect::{BuildTimeline, CollectSystemInfo};
        use crate::redact_ftrace_events::RedactFtraceEvents;
        use crate::redact_sched_events::RedactSchedEvents;

        let mut redactor = TraceRedactor::new();
        redactor.add_collect(Box::new(CollectSystemInfo::default()));
        redactor.add_collect(Box::new(BuildTimeline));
        redactor.add_transform(Box::new(RedactSchedEvents::default()));
        redactor.add_transform(Box::new(RedactFtraceEvents::with_thread_merging()?));
        Ok(redactor)
    }

    pub fn add_collect(&mut self, collector: Box<dyn CollectPrimitive>) {
        self.collectors.push(collector);
    }

    pub fn add_transform(&mut self, transform: Box<dyn TransformPrimitive>) {
        self.transforms.push(transform);
    }

    /// Runs every active collector over every packet. Collectors that retire
    /// stop receiving packets; the pass ends early once all have retired.
    pub fn collect(&mut self, trace: &[u8], context: &mut ContextBuilder) -> Result<()> {
        let packet_field = field_number::<Trace>("packet");

        let mut active: Vec<bool> = vec![true; self.collectors.len()];
        let mut packets = 0usize;

        let mut reader = FieldReader::new(trace);
        while let Some(field) = reader.read_field().context("malformed trace")? {
            if field.id != packet_field {
                continue;
            }
            packets += 1;

            let packet = TracePacket::parse_from_bytes(field.payload)
                .context("malformed trace packet")?;

            let mut any_active = false;
            for (i, collector) in self.collectors.iter_mut().enumerate() {
                if !active[i] {
                    continue;
                }
                if collector.collect(&packet, context)? == ContinueCollection::Retire {
                    active[i] = false;
                } else {
                    any_active = true;
                }
            }
            if !any_active {
                break;
            }
        }

        debug!(packets, "collect pass complete");
        Ok(())
    }

    /// Rewrites each packet through every transform, in registration order,
    /// and returns the reassembled trace.
    pub fn transform(&self, trace: &[u8], context: &Context) -> Result<Vec<u8>> {
        let packet_field = field_number::<Trace>("packet");

        let mut out = MessageBuffer::new();
        let mut reader = FieldReader::new(trace);
        while let Some(field) = reader.read_field().context("malformed trace")? {
            if field.id != packet_field {
                out.append_raw(field.raw);
                continue;
            }

            let mut packet = field.payload.to_vec();
            for transform in &self.transforms {
                transform.transform(context, &mut packet)?;
            }
            out.append_len_field(packet_field, &packet);
        }

        Ok(out.into_bytes())
    }

    /// Convenience wrapper: collect, freeze, transform.
    pub fn redact(&mut self, trace: &[u8], mut context: ContextBuilder) -> Result<Vec<u8>> {
        self.collect(trace, &mut context)?;
        let context = context.freeze();
        self.transform(trace, &context)
    }
}
