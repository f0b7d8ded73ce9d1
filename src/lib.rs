//! Trace redaction library.
//!
//! Rewrites a Perfetto trace so that only data belonging to one target
//! package (identified by uid) leaves the device, while preserving enough
//! scheduling structure for the trace to stay useful.
//!
//! Redaction runs in two passes. The collect pass scans every packet and
//! builds a [`context::Context`]: a process/thread ancestry timeline and the
//! per-CPU synthetic thread table. The transform pass then rewrites each
//! packet's bytes against that frozen context.
//!
//! # Modules
//!
//! - [`timeline`] - pid/uid ancestry resolution over time
//! - [`context`] - shared state threaded through both passes
//! - [`pipeline`] - collect/transform primitives and the pass driver
//! - [`collect`] - timeline and system-info collectors
//! - [`redact_ftrace_events`] - per-field redaction dispatch over ftrace events
//! - [`thread_merge`] - foreign-pid remapping into synthetic threads
//! - [`redact_sched_events`] - sched comm scrubbing and waking-row filtering
//! - [`wire`] - untyped protobuf field walking for verbatim pass-through
//!
//! # Example
//!
//! ```no_run
//! use trace_redactor::{ContextBuilder, TraceRedactor};
//!
//! let trace = std::fs::read("input.pftrace").expect("trace file");
//! let mut redactor = TraceRedactor::standard().expect("pipeline");
//! let context = ContextBuilder::new().with_package(10001, None);
//! let redacted = redactor.redact(&trace, context).expect("redaction");
//! std::fs::write("output.pftrace", redacted).expect("write");
//! ```

pub mod collect;
pub mod context;
pub mod pipeline;
pub mod redact_ftrace_events;
pub mod redact_sched_events;
pub mod thread_merge;
pub mod timeline;
pub mod wire;

// Re-export for convenience
pub use context::{Context, ContextBuilder};
pub use pipeline::TraceRedactor;
pub use timeline::ProcessThreadTimeline;
