//! Shared helpers for the end-to-end tests: emulated device construction
//! and crafted trace records.

use std::rc::Rc;

use pmd_rs::{
    BusConfig,
    Controller,
    DeviceConfig,
    Namespace,
    NamespaceConfig,
    NvmeOpc,
    ZnsConfig,
};
use replay_engine::trace::{TraceRecord, Tracepoint};

pub fn zns_bus(
    zones: u64,
    zone_size: u64,
    zone_cap: u64,
    max_open: u32,
) -> BusConfig {
    BusConfig::new().with_device(DeviceConfig {
        name: "zns0".into(),
        ns: NamespaceConfig {
            block_size: 512,
            num_blocks: 0,
            zns: Some(ZnsConfig {
                zone_size,
                zone_cap,
                num_zones: zones,
                max_open,
                max_active: 0,
                max_append_blocks: 0x40,
            }),
        },
    })
}

pub fn nvm_bus(num_blocks: u64) -> BusConfig {
    BusConfig::new().with_device(DeviceConfig {
        name: "nvm0".into(),
        ns: NamespaceConfig {
            block_size: 512,
            num_blocks,
            zns: None,
        },
    })
}

pub fn attach(cfg: &BusConfig) -> (Controller, Rc<Namespace>) {
    let ctrlr = pmd_rs::probe(cfg).unwrap().remove(0);
    let ns = ctrlr.attach().remove(0);
    (ctrlr, ns)
}

/// A crafted submit record, sequenced by `seq`.
pub fn submit(seq: u64, opc: NvmeOpc, slba: u64, nlb: u32) -> TraceRecord {
    TraceRecord {
        lcore: 0,
        tsc_rate: 1_000_000_000,
        tsc_timestamp: seq,
        obj_id: seq,
        tsc_sc_time: 0,
        tpoint: Tracepoint::Submit,
        opc: opc as u16,
        cid: seq as u16,
        nsid: 1,
        cpl: 0,
        cdw10: slba as u32,
        cdw11: (slba >> 32) as u32,
        cdw12: nlb.saturating_sub(1) & 0xffff,
        cdw13: 0,
    }
}

/// A crafted zone management send record.
pub fn zone_mgmt(
    seq: u64,
    zsa: u8,
    slba: u64,
    select_all: bool,
) -> TraceRecord {
    TraceRecord {
        cdw13: u32::from(zsa) | (u32::from(select_all) << 8),
        ..submit(seq, NvmeOpc::ZoneMgmtSend, slba, 1)
    }
}
