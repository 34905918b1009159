//! Explicit device bus. Instead of a process-wide registry, callers build a
//! `BusConfig` (usually from `emu://` URIs on the command line) and `probe()`
//! constructs the controllers it describes.

use crate::{controller::Controller, uri::parse_device_uri, DriverError};

/// Zoned-namespace geometry of an emulated device.
#[derive(Debug, Clone)]
pub struct ZnsConfig {
    /// Zone size in sectors.
    pub zone_size: u64,
    /// Writable capacity per zone, `zone_cap <= zone_size`.
    pub zone_cap: u64,
    pub num_zones: u64,
    /// 0 means unlimited.
    pub max_open: u32,
    /// 0 means unlimited.
    pub max_active: u32,
    /// Largest zone append payload in sectors.
    pub max_append_blocks: u64,
}

#[derive(Debug, Clone)]
pub struct NamespaceConfig {
    pub block_size: u32,
    /// Sector count for conventional namespaces; ignored for zoned ones
    /// where it follows from the zone layout.
    pub num_blocks: u64,
    pub zns: Option<ZnsConfig>,
}

#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub name: String,
    pub ns: NamespaceConfig,
}

/// The set of devices a probe will find.
#[derive(Debug, Clone, Default)]
pub struct BusConfig {
    devices: Vec<DeviceConfig>,
}

impl BusConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_device(mut self, device: DeviceConfig) -> Self {
        self.devices.push(device);
        self
    }

    /// Build a config from `emu://` URIs.
    pub fn from_uris<S: AsRef<str>>(uris: &[S]) -> Result<Self, DriverError> {
        let mut cfg = Self::new();
        for uri in uris {
            cfg.devices.push(parse_device_uri(uri.as_ref())?);
        }
        Ok(cfg)
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

/// Enumerate and construct the controllers on the bus.
pub fn probe(cfg: &BusConfig) -> Result<Vec<Controller>, DriverError> {
    let mut controllers = Vec::with_capacity(cfg.devices.len());
    for device in &cfg.devices {
        tracing::info!("Attaching to {}", device.name);
        controllers.push(Controller::new(device));
    }
    Ok(controllers)
}
