//! Read-only two-pass aggregation over a trace file.
//!
//! The first pass derives IOPS, completion latency, read/write counts and
//! the request-size histogram. The second pass, only run when a locality
//! histogram was asked for, builds the per-LBA and per-zone access
//! counters.

use std::{collections::BTreeMap, path::Path};

use pmd_rs::{NvmeOpc, NvmeStatus, ZoneRecvAction, ZoneSendAction};

use crate::{
    core::{lookup_opcode, EngineError, RwClass},
    trace::{
        reader::TraceReader,
        schema::{TraceRecord, Tracepoint},
    },
};

#[derive(Debug, Clone, Copy, Default)]
pub struct AnalyzerOpts {
    /// Build the per-LBA read/write histogram.
    pub lba_hist: bool,
    /// Build the per-zone read/write histogram.
    pub zone_hist: bool,
    /// Zone size in sectors, required for the zone histogram.
    pub zone_size: Option<u64>,
}

/// Latency sum that survives arbitrarily long traces: when adding the next
/// sample would overflow the running sum, the sum is parked in a bucket and
/// a fresh accumulator starts. The buckets are combined at the end in
/// floating point.
#[derive(Debug, Default)]
pub struct LatencyAccumulator {
    buckets: Vec<u64>,
    current: u64,
    samples: u64,
}

impl LatencyAccumulator {
    pub fn add(&mut self, ticks: u64) {
        match self.current.checked_add(ticks) {
            Some(sum) => self.current = sum,
            None => {
                self.buckets.push(self.current);
                self.current = ticks;
            }
        }
        self.samples += 1;
    }

    pub fn samples(&self) -> u64 {
        self.samples
    }

    pub fn average(&self) -> f64 {
        if self.samples == 0 {
            return 0.0;
        }
        let total: f64 = self
            .buckets
            .iter()
            .map(|b| *b as f64)
            .sum::<f64>()
            + self.current as f64;
        total / self.samples as f64
    }
}

/// Everything the analyzer derives from one file.
#[derive(Debug, Default)]
pub struct Analysis {
    pub tsc_rate: u64,
    pub submits: u64,
    pub completes: u64,
    pub reads: u64,
    pub writes: u64,
    /// Submissions for which no completion latency was recorded.
    pub no_latency: u64,
    pub first_submit_tsc: Option<u64>,
    pub last_complete_tsc: Option<u64>,
    pub latency_min_ticks: u64,
    pub latency_max_ticks: u64,
    pub latency: LatencyAccumulator,
    /// Request size in blocks -> (reads, writes).
    pub size_hist: BTreeMap<u32, (u64, u64)>,
    /// LBA -> (reads, writes); only when requested.
    pub lba_hist: BTreeMap<u64, (u64, u64)>,
    /// Zone index -> (reads, writes); only when requested.
    pub zone_hist: BTreeMap<u64, (u64, u64)>,
}

fn us_from_tsc(ticks: u64, tsc_rate: u64) -> f64 {
    if tsc_rate == 0 {
        return 0.0;
    }
    ticks as f64 * 1_000_000.0 / tsc_rate as f64
}

impl Analysis {
    /// Completed requests per second over the span between the first
    /// submission and the last completion.
    pub fn iops(&self) -> f64 {
        let (first, last) =
            match (self.first_submit_tsc, self.last_complete_tsc) {
                (Some(first), Some(last)) if last > first => (first, last),
                _ => return 0.0,
            };
        let secs = (last - first) as f64 / self.tsc_rate.max(1) as f64;
        self.completes as f64 / secs
    }

    /// Read percentage of the classified read/write submissions.
    pub fn rw_ratio(&self) -> f64 {
        let total = self.reads + self.writes;
        if total == 0 {
            0.0
        } else {
            self.reads as f64 * 100.0 / total as f64
        }
    }

    pub fn latency_min_us(&self) -> f64 {
        us_from_tsc(self.latency_min_ticks, self.tsc_rate)
    }

    pub fn latency_max_us(&self) -> f64 {
        us_from_tsc(self.latency_max_ticks, self.tsc_rate)
    }

    pub fn latency_avg_us(&self) -> f64 {
        self.latency.average() * 1_000_000.0 / self.tsc_rate.max(1) as f64
    }
}

/// Whether an opcode writes media, for the locality histograms. Unlike the
/// R/W ratio classification this includes write-zeroes.
fn touches_media_write(opc: NvmeOpc) -> bool {
    matches!(
        opc,
        NvmeOpc::Write | NvmeOpc::ZoneAppend | NvmeOpc::WriteZeroes
    )
}

fn data_op(opc: NvmeOpc) -> bool {
    matches!(
        opc,
        NvmeOpc::Read
            | NvmeOpc::Compare
            | NvmeOpc::Write
            | NvmeOpc::ZoneAppend
            | NvmeOpc::WriteZeroes
            | NvmeOpc::Verify
    )
}

#[derive(Debug)]
pub struct TraceAnalyzer {
    opts: AnalyzerOpts,
}

impl TraceAnalyzer {
    pub fn new(opts: AnalyzerOpts) -> Result<Self, EngineError> {
        if opts.zone_hist && opts.zone_size.unwrap_or(0) == 0 {
            return Err(EngineError::Argument {
                msg: "zone histogram requires a non-zero zone size"
                    .to_string(),
            });
        }
        Ok(Self {
            opts,
        })
    }

    pub fn analyze(&self, path: &Path) -> Result<Analysis, EngineError> {
        let mut analysis = Analysis::default();

        for rec in TraceReader::open(path)? {
            self.pass1(&rec?, &mut analysis)?;
        }
        analysis.no_latency =
            analysis.submits.saturating_sub(analysis.latency.samples());

        if self.opts.lba_hist || self.opts.zone_hist {
            for rec in TraceReader::open(path)? {
                self.pass2(&rec?, &mut analysis);
            }
        }
        Ok(analysis)
    }

    fn pass1(
        &self,
        rec: &TraceRecord,
        analysis: &mut Analysis,
    ) -> Result<(), EngineError> {
        if analysis.tsc_rate == 0 {
            analysis.tsc_rate = rec.tsc_rate;
        }

        match rec.tpoint {
            Tracepoint::Submit => {
                analysis.submits += 1;
                analysis.first_submit_tsc = Some(
                    analysis
                        .first_submit_tsc
                        .map_or(rec.tsc_timestamp, |t| {
                            t.min(rec.tsc_timestamp)
                        }),
                );

                let entry = lookup_opcode(rec.opc).ok_or_else(|| {
                    EngineError::MalformedFile {
                        path: String::new(),
                        reason: format!("unknown opcode {:#04x}", rec.opc),
                    }
                })?;
                match entry.class {
                    RwClass::Read => analysis.reads += 1,
                    RwClass::Write => analysis.writes += 1,
                    RwClass::Other => {}
                }
                if data_op(entry.opc) {
                    let slot = analysis
                        .size_hist
                        .entry(rec.nlb())
                        .or_insert((0, 0));
                    match entry.class {
                        RwClass::Read => slot.0 += 1,
                        _ if touches_media_write(entry.opc) => slot.1 += 1,
                        _ => {}
                    }
                }
            }
            Tracepoint::Complete => {
                analysis.completes += 1;
                analysis.last_complete_tsc = Some(
                    analysis
                        .last_complete_tsc
                        .map_or(rec.tsc_timestamp, |t| {
                            t.max(rec.tsc_timestamp)
                        }),
                );
                if rec.tsc_sc_time > 0 {
                    if analysis.latency_min_ticks == 0
                        || rec.tsc_sc_time < analysis.latency_min_ticks
                    {
                        analysis.latency_min_ticks = rec.tsc_sc_time;
                    }
                    analysis.latency_max_ticks =
                        analysis.latency_max_ticks.max(rec.tsc_sc_time);
                    analysis.latency.add(rec.tsc_sc_time);
                }
            }
        }
        Ok(())
    }

    fn pass2(&self, rec: &TraceRecord, analysis: &mut Analysis) {
        if rec.tpoint != Tracepoint::Submit {
            return;
        }
        let entry = match lookup_opcode(rec.opc) {
            Some(entry) => entry,
            None => return,
        };
        if !data_op(entry.opc) {
            return;
        }
        let slba = rec.slba();
        let nlb = rec.nlb();
        let is_read = entry.class == RwClass::Read;
        let is_write = touches_media_write(entry.opc);
        if !is_read && !is_write {
            return;
        }

        if self.opts.lba_hist {
            for lba in slba .. slba + u64::from(nlb) {
                let slot = analysis.lba_hist.entry(lba).or_insert((0, 0));
                if is_read {
                    slot.0 += 1;
                } else {
                    slot.1 += 1;
                }
            }
        }
        if self.opts.zone_hist {
            let zone_size = self.opts.zone_size.unwrap();
            let slot = analysis
                .zone_hist
                .entry(slba / zone_size)
                .or_insert((0, 0));
            if is_read {
                slot.0 += 1;
            } else {
                slot.1 += 1;
            }
        }
    }
}

/// Render one record as a single per-event dump line.
pub fn format_event(rec: &TraceRecord, with_tsc: bool) -> String {
    let mut line = format!(
        "core{:2}: {:16.3}  ",
        rec.lcore,
        us_from_tsc(rec.tsc_timestamp, rec.tsc_rate)
    );
    if with_tsc {
        line.push_str(&format!("({:10})  ", rec.tsc_timestamp));
    }
    line.push_str(&format!(
        "{:20} object: {:#x} ",
        rec.tpoint.tag(),
        rec.obj_id
    ));

    match rec.tpoint {
        Tracepoint::Submit => {
            let name = NvmeOpc::from_u16(rec.opc)
                .map_or_else(|| "unknown".to_string(), |o| o.to_string());
            line.push_str(&format!(
                "{:20} cid: {:5} nsid: {:#x} ",
                name, rec.cid, rec.nsid
            ));
            match NvmeOpc::from_u16(rec.opc) {
                Some(NvmeOpc::DatasetManagement) => {
                    line.push_str(&format!("nr: {} ", rec.dsm_ranges()));
                }
                Some(NvmeOpc::Copy) => {
                    line.push_str(&format!(
                        "slba: {:#x} range: {} ",
                        rec.slba(),
                        rec.copy_ranges()
                    ));
                }
                Some(NvmeOpc::ZoneMgmtRecv) => {
                    let action = match rec.zra() {
                        0 => ZoneRecvAction::Report.to_string(),
                        1 => ZoneRecvAction::ExtReport.to_string(),
                        other => format!("unknown ({:#x})", other),
                    };
                    line.push_str(&format!(
                        "slba: {:#x} dword: {} {} ",
                        rec.slba(),
                        rec.zmr_dwords(),
                        action
                    ));
                }
                Some(NvmeOpc::ZoneMgmtSend) => {
                    let action = ZoneSendAction::from_u8(rec.zsa())
                        .map_or_else(
                            || format!("unknown ({:#x})", rec.zsa()),
                            |a| a.to_string(),
                        );
                    line.push_str(&format!(
                        "slba: {:#x} {} ",
                        rec.slba(),
                        action
                    ));
                }
                Some(NvmeOpc::ZoneAppend) => {
                    line.push_str(&format!(
                        "zslba: {:#x} block: {} ",
                        rec.slba(),
                        rec.nlb()
                    ));
                }
                Some(NvmeOpc::Flush) | None => {}
                Some(_) => {
                    line.push_str(&format!(
                        "slba: {:#x} block: {} ",
                        rec.slba(),
                        rec.nlb()
                    ));
                }
            }
        }
        Tracepoint::Complete => {
            if rec.tsc_sc_time > 0 {
                line.push_str(&format!(
                    "time: {:13.3} ",
                    us_from_tsc(rec.tsc_sc_time, rec.tsc_rate)
                ));
            }
            let status = NvmeStatus::from_raw_cpl(rec.cpl);
            line.push_str(&format!(
                "cid: {:5} comp: {:#x} status: {}",
                rec.cid,
                rec.cpl & 0x1,
                status.status_string()
            ));
        }
    }
    line
}
