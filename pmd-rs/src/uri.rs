//! `emu://` device URIs. The path names the device, the query string sets
//! the namespace geometry:
//!
//! ```text
//! emu:///nvm0?blocks=0x10000&block_size=512
//! emu:///zns0?zones=64&zone_size=0x4000&zone_cap=0x4000&max_open=8&max_active=16&max_append=0x100
//! ```
//!
//! Any zone parameter makes the namespace zoned. Numbers accept a `0x`
//! prefix.

use std::collections::HashMap;

use url::Url;

use crate::{
    bus::{DeviceConfig, NamespaceConfig, ZnsConfig},
    DriverError,
    InvalidUri,
};

const DEFAULT_BLOCK_SIZE: u32 = 512;
const DEFAULT_NUM_BLOCKS: u64 = 0x20000;
const DEFAULT_ZONE_SIZE: u64 = 0x4000;
const DEFAULT_NUM_ZONES: u64 = 16;
const DEFAULT_MAX_APPEND_BLOCKS: u64 = 0x100;

fn parse_num(value: &str) -> Option<u64> {
    if let Some(hex) = value.strip_prefix("0x") {
        u64::from_str_radix(hex, 16).ok()
    } else {
        value.parse().ok()
    }
}

pub fn parse_device_uri(uri: &str) -> Result<DeviceConfig, DriverError> {
    let fail = |reason: &str| {
        InvalidUri {
            uri: uri.to_string(),
            reason: reason.to_string(),
        }
        .build()
    };

    let url = Url::parse(uri).map_err(|e| fail(&e.to_string()))?;
    if url.scheme() != "emu" {
        return Err(fail("unsupported scheme"));
    }

    let name = url.path().trim_start_matches('/').to_string();
    if name.is_empty() {
        return Err(fail("device name missing"));
    }

    let mut params: HashMap<String, u64> = HashMap::new();
    for (key, value) in url.query_pairs() {
        let num = parse_num(&value)
            .ok_or_else(|| fail(&format!("bad number for {}", key)))?;
        params.insert(key.to_string(), num);
    }

    let block_size =
        params.get("block_size").copied().unwrap_or(u64::from(
            DEFAULT_BLOCK_SIZE,
        )) as u32;
    if !block_size.is_power_of_two() {
        return Err(fail("block_size must be a power of two"));
    }

    let zoned = ["zones", "zone_size", "zone_cap", "max_open", "max_active"]
        .iter()
        .any(|k| params.contains_key(*k));

    let zns = if zoned {
        let zone_size =
            params.get("zone_size").copied().unwrap_or(DEFAULT_ZONE_SIZE);
        if zone_size == 0 {
            return Err(fail("zone_size must be non-zero"));
        }
        Some(ZnsConfig {
            zone_size,
            zone_cap: params
                .get("zone_cap")
                .copied()
                .unwrap_or(zone_size)
                .min(zone_size),
            num_zones: params
                .get("zones")
                .copied()
                .unwrap_or(DEFAULT_NUM_ZONES),
            max_open: params.get("max_open").copied().unwrap_or(0) as u32,
            max_active: params.get("max_active").copied().unwrap_or(0) as u32,
            max_append_blocks: params
                .get("max_append")
                .copied()
                .unwrap_or(DEFAULT_MAX_APPEND_BLOCKS),
        })
    } else {
        None
    };

    Ok(DeviceConfig {
        name,
        ns: NamespaceConfig {
            block_size,
            num_blocks: params
                .get("blocks")
                .copied()
                .unwrap_or(DEFAULT_NUM_BLOCKS),
            zns,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zoned_uri() {
        let cfg = parse_device_uri(
            "emu:///zns0?zones=8&zone_size=0x4000&max_open=8&max_active=16",
        )
        .unwrap();
        assert_eq!(cfg.name, "zns0");
        let z = cfg.ns.zns.unwrap();
        assert_eq!(z.num_zones, 8);
        assert_eq!(z.zone_size, 0x4000);
        assert_eq!(z.zone_cap, 0x4000);
        assert_eq!(z.max_open, 8);
    }

    #[test]
    fn conventional_uri() {
        let cfg =
            parse_device_uri("emu:///nvm0?blocks=4096&block_size=4096")
                .unwrap();
        assert!(cfg.ns.zns.is_none());
        assert_eq!(cfg.ns.num_blocks, 4096);
        assert_eq!(cfg.ns.block_size, 4096);
    }

    #[test]
    fn bad_uris() {
        assert!(parse_device_uri("malloc:///x").is_err());
        assert!(parse_device_uri("emu:///").is_err());
        assert!(parse_device_uri("emu:///x?blocks=nope").is_err());
    }
}
