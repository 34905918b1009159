//!
//! Trace-driven I/O engine for NVMe and NVMe ZNS namespaces behind the
//! polled-mode driver layer.
//!
//! The crate records per-command submit/complete events from the driver's
//! tracepoint ring into fixed-width trace files, streams such files back,
//! and re-issues the recorded commands against a namespace while honoring
//! the zone state machine and queue-depth backpressure. A read-only
//! analyzer derives performance and locality statistics from a trace file.

#[macro_use]
extern crate tracing;

pub mod core;
pub mod logger;
pub mod trace;
pub mod workload;
