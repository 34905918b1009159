//! Synthetic workload front-ends. Generators emit a stream of submit
//! records in the trace schema and hand it to the dispatcher, so a
//! generated workload and a recorded one replay through exactly the same
//! path.

use std::rc::Rc;

use rand::Rng;
use strum_macros::{Display, EnumString};

use pmd_rs::{Namespace, NvmeOpc};

use crate::{
    core::EngineError,
    trace::{TraceRecord, Tracepoint},
};

/// Access pattern of the generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum Pattern {
    Seq,
    Rand,
}

#[derive(Debug, Clone, Copy)]
pub struct WorkloadOpts {
    pub pattern: Pattern,
    /// Blocks per command; must be a power of two.
    pub blocks: u32,
    /// Fraction of reads in the random pattern, 0.0 ..= 1.0.
    pub read_ratio: f64,
    /// Commands to generate in the random pattern.
    pub count: u64,
}

fn submit_record(
    ns: &Namespace,
    seq: u64,
    opc: NvmeOpc,
    slba: u64,
    nlb: u32,
) -> TraceRecord {
    TraceRecord {
        lcore: pmd_rs::current_core(),
        tsc_rate: pmd_rs::ticks_hz(),
        tsc_timestamp: seq,
        obj_id: seq,
        tsc_sc_time: 0,
        tpoint: Tracepoint::Submit,
        opc: opc as u16,
        cid: seq as u16,
        nsid: ns.id(),
        cpl: 0,
        cdw10: slba as u32,
        cdw11: (slba >> 32) as u32,
        cdw12: (nlb - 1) & 0xffff,
        cdw13: 0,
    }
}

fn validate(ns: &Namespace, opts: &WorkloadOpts) -> Result<(), EngineError> {
    let argument = |msg: String| EngineError::Argument {
        msg,
    };
    if opts.blocks == 0 || !opts.blocks.is_power_of_two() {
        return Err(argument(format!(
            "block count {} is not a power of two",
            opts.blocks
        )));
    }
    let bytes = u64::from(opts.blocks) * u64::from(ns.sector_size());
    if bytes > ns.max_io_xfer_size() {
        return Err(argument(format!(
            "transfer of {} bytes exceeds the maximum transfer size {}",
            bytes,
            ns.max_io_xfer_size()
        )));
    }
    if ns.is_zoned() && bytes > ns.max_zone_append_size() {
        return Err(argument(format!(
            "append of {} bytes exceeds the maximum zone append size {}",
            bytes,
            ns.max_zone_append_size()
        )));
    }
    if !(0.0 ..= 1.0).contains(&opts.read_ratio) {
        return Err(argument(format!(
            "read ratio {} is not within 0..1",
            opts.read_ratio
        )));
    }
    Ok(())
}

/// Generate the submit stream for a namespace.
///
/// Sequential on a zoned namespace fills the first `max_open` zones (all of
/// them when the device does not limit open zones) with appends until every
/// zone reaches its capacity. Sequential on a conventional namespace writes
/// the namespace front to back. Random issues `count` commands, each a read
/// with probability `read_ratio`, writes landing on a zone that still has
/// room.
pub fn generate(
    ns: &Rc<Namespace>,
    opts: &WorkloadOpts,
) -> Result<Vec<TraceRecord>, EngineError> {
    validate(ns, opts)?;
    let recs = match opts.pattern {
        Pattern::Seq if ns.is_zoned() => seq_zoned(ns, opts),
        Pattern::Seq => seq_conventional(ns, opts),
        Pattern::Rand => random(ns, opts),
    };
    Ok(recs)
}

fn seq_zoned(ns: &Rc<Namespace>, opts: &WorkloadOpts) -> Vec<TraceRecord> {
    let zone_size = ns.zone_size_sectors();
    let zone_cap = ns.zone_capacity();
    let blocks = u64::from(opts.blocks);
    let zones = match ns.max_open_zones() {
        0 => ns.num_zones(),
        n => u64::from(n).min(ns.num_zones()),
    };

    let mut recs = Vec::new();
    let mut seq = 0;
    for zone in 0 .. zones {
        let zslba = zone * zone_size;
        let mut filled = 0;
        while filled < zone_cap {
            let nlb = blocks.min(zone_cap - filled) as u32;
            recs.push(submit_record(
                ns,
                seq,
                NvmeOpc::ZoneAppend,
                zslba,
                nlb,
            ));
            seq += 1;
            filled += u64::from(nlb);
        }
    }
    recs
}

fn seq_conventional(
    ns: &Rc<Namespace>,
    opts: &WorkloadOpts,
) -> Vec<TraceRecord> {
    let blocks = u64::from(opts.blocks);
    let mut recs = Vec::new();
    let mut seq = 0;
    let mut slba = 0;
    while slba < ns.num_sectors() {
        let nlb = blocks.min(ns.num_sectors() - slba) as u32;
        recs.push(submit_record(ns, seq, NvmeOpc::Write, slba, nlb));
        seq += 1;
        slba += u64::from(nlb);
    }
    recs
}

fn random(ns: &Rc<Namespace>, opts: &WorkloadOpts) -> Vec<TraceRecord> {
    let mut rng = rand::thread_rng();
    let blocks = u64::from(opts.blocks);
    let mut recs = Vec::new();

    if ns.is_zoned() {
        let zone_size = ns.zone_size_sectors();
        let zone_cap = ns.zone_capacity();
        let zones = ns.num_zones();
        let mut fill = vec![0u64; zones as usize];

        for seq in 0 .. opts.count {
            if rng.gen::<f64>() < opts.read_ratio {
                let slba = rng.gen_range(0 .. ns.num_sectors() - blocks);
                recs.push(submit_record(
                    ns,
                    seq,
                    NvmeOpc::Read,
                    slba,
                    blocks as u32,
                ));
                continue;
            }
            // Pick a zone that still has room; linear probe from a random
            // start, stop generating writes once the namespace is full.
            let start = rng.gen_range(0 .. zones);
            let zone = (0 .. zones)
                .map(|i| (start + i) % zones)
                .find(|z| fill[*z as usize] + blocks <= zone_cap);
            let zone = match zone {
                Some(zone) => zone,
                None => continue,
            };
            fill[zone as usize] += blocks;
            recs.push(submit_record(
                ns,
                seq,
                NvmeOpc::ZoneAppend,
                zone * zone_size,
                blocks as u32,
            ));
        }
    } else {
        for seq in 0 .. opts.count {
            let slba = rng.gen_range(0 .. ns.num_sectors() - blocks);
            let opc = if rng.gen::<f64>() < opts.read_ratio {
                NvmeOpc::Read
            } else {
                NvmeOpc::Write
            };
            recs.push(submit_record(ns, seq, opc, slba, blocks as u32));
        }
    }
    recs
}
