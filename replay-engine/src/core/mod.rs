//!
//! The replay core: opcode classification, the host-side zone state model
//! and the dispatcher driving a queue pair from a trace stream.

use snafu::Snafu;

pub use dispatcher::{
    ReplayDispatcher,
    ReplayOpts,
    ReplayOutcome,
    ReplayStats,
};
pub use opcode::{lookup_opcode, OpcodeEntry, ReplayAction, RwClass};
pub use zone::{ZoneCommand, ZoneDescriptor, ZoneModel};

mod dispatcher;
mod opcode;
mod zone;

/// Errors raised by the engine. Fatal ones unwind the current tool after
/// releasing the queue pair and any live DMA buffers; everything else is
/// counted and summarized at shutdown.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub enum EngineError {
    #[snafu(display("{}", msg))]
    Argument {
        msg: String,
    },
    #[snafu(display("no NVMe controllers found"))]
    NoControllers {},
    #[snafu(display("device lost: {}", source))]
    DeviceLost {
        source: pmd_rs::DriverError,
    },
    #[snafu(display("driver call failed: {}", source))]
    Driver {
        source: pmd_rs::DriverError,
    },
    #[snafu(display(
        "Failed to dispatch {:#04x}h at slba {:#x} nlb {}: {}",
        opcode,
        slba,
        nlb,
        source
    ))]
    Dispatch {
        source: pmd_rs::DriverError,
        opcode: u16,
        slba: u64,
        nlb: u32,
    },
    #[snafu(display("Failed to allocate DMA buffer: {}", source))]
    Dma {
        source: pmd_rs::DmaError,
    },
    #[snafu(display("failed to read trace file {}: {}", path, source))]
    TraceFileIo {
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("failed to write trace file {}: {}", path, source))]
    TraceFileWrite {
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("malformed trace file {}: {}", path, reason))]
    MalformedFile {
        path: String,
        reason: String,
    },
    #[snafu(display("failed to read trace ring: {}", source))]
    TraceRing {
        source: pmd_rs::DriverError,
    },
}

impl EngineError {
    /// Exit code of a tool failing with this error: argument problems exit
    /// with 1, everything else with 2.
    pub fn exit_code(&self) -> i32 {
        match self {
            EngineError::Argument { .. } => 1,
            _ => 2,
        }
    }
}

/// Probe the bus described by the device URIs and attach the first
/// namespace of the first controller found.
pub fn attach_first_namespace(
    uris: &[String],
) -> Result<(pmd_rs::Controller, std::rc::Rc<pmd_rs::Namespace>), EngineError>
{
    use snafu::ResultExt;

    info!("Initializing NVMe Controllers");
    // A bad device URI is an argument problem, not a device failure.
    let cfg = pmd_rs::BusConfig::from_uris(uris).map_err(|e| match e {
        e @ pmd_rs::DriverError::InvalidUri { .. } => EngineError::Argument {
            msg: e.to_string(),
        },
        source => EngineError::Driver {
            source,
        },
    })?;
    let mut controllers = pmd_rs::probe(&cfg).context(Driver)?;
    if controllers.is_empty() {
        return NoControllers {}.fail();
    }
    let controller = controllers.remove(0);
    info!("Attached to {}", controller.name());
    let ns = match controller.attach().into_iter().next() {
        Some(ns) => ns,
        None => return NoControllers {}.fail(),
    };
    info!("Initialization complete");
    Ok((controller, ns))
}
