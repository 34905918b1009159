//!
//! Polled-mode user-space driver layer for NVMe and NVMe ZNS namespaces.
//!
//! The crate exposes the surface a trace/replay engine needs from a driver:
//! controller probing and attachment, per-namespace geometry, queue pairs
//! with polled completions, DMA buffer allocation and the tracepoint ring
//! that records per-command submit/complete events. Devices are RAM-backed
//! emulations; command semantics (bounds checks, the ZNS zone state machine,
//! open/active resource limits) are enforced, media timing is not.

use snafu::Snafu;

pub use bus::{probe, BusConfig, DeviceConfig, NamespaceConfig, ZnsConfig};
pub use controller::Controller;
pub use dma::{DmaBuf, DmaError};
pub use namespace::Namespace;
pub use nvme::{
    Csi,
    NvmeOpc,
    NvmeStatus,
    ZoneReportDescriptor,
    ZoneRecvAction,
    ZoneSendAction,
    ZoneState,
    ZoneType,
};
pub use qpair::{
    IoCompletion,
    IoCompletionCb,
    QueuePair,
    QueuePairOpts,
    ZoneReportCb,
};
pub use trace::{
    current_core,
    shm_path,
    ticks,
    ticks_hz,
    validate_tpoint_group,
    RawTracepoint,
    TraceCursor,
    TraceRing,
    TracepointId,
    OBJECT_START_UNMATCHED,
    TRACE_ENTRY_SIZE,
};
pub use uri::parse_device_uri;

mod bus;
mod controller;
mod dma;
mod namespace;
mod nvme;
mod qpair;
mod trace;
mod uri;

/// Errors raised by the driver layer.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub enum DriverError {
    #[snafu(display("no free request slots available on the queue pair"))]
    NoFreeSlots {},
    #[snafu(display("controller {} is no longer attached", name))]
    DeviceLost {
        name: String,
    },
    #[snafu(display("invalid device URI {}: {}", uri, reason))]
    InvalidUri {
        uri: String,
        reason: String,
    },
    #[snafu(display("unknown tracepoint group {}", group))]
    InvalidTraceGroup {
        group: String,
    },
    #[snafu(display("failed to open trace ring {}: {}", path, source))]
    TraceOpen {
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("failed to write trace ring: {}", source))]
    TraceWrite {
        source: std::io::Error,
    },
    #[snafu(display("malformed trace ring {}: {}", path, reason))]
    TraceParse {
        path: String,
        reason: String,
    },
    #[snafu(display("namespace {} not found on controller {}", nsid, name))]
    NamespaceNotFound {
        name: String,
        nsid: u32,
    },
}
