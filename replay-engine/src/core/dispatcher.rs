//! The replay engine. Drives a single queue pair from an ordered stream of
//! trace records: classifies each submit record, allocates a DMA buffer
//! sized to the command, submits the matching primitive and polls
//! completions so that the number of commands in flight never exceeds the
//! configured queue depth.
//!
//! Every submitted command is represented by an [`IoTask`] that owns its
//! buffer. The task is moved into the completion callback, so the buffer is
//! released exactly once on every path: completion (successful or failing),
//! submission refusal, and teardown of the queue pair on a lost device.

use std::{
    cell::{Cell, RefCell},
    rc::Rc,
};

use byte_unit::Byte;
use snafu::ResultExt;

use pmd_rs::{
    DmaBuf,
    DriverError,
    IoCompletion,
    Namespace,
    NvmeOpc,
    QueuePair,
    ZoneReportDescriptor,
    ZoneSendAction,
};

use crate::{
    core::{
        opcode::{lookup_opcode, ReplayAction},
        zone::{ZoneCommand, ZoneDescriptor, ZoneModel},
        EngineError,
    },
    trace::{TraceRecord, Tracepoint},
};

/// Payload written into replayed write buffers. The data itself carries no
/// meaning; integrity of replayed payloads is out of scope.
const WRITE_PAYLOAD: &[u8] = b"Hello World!\n";

#[derive(Debug, Clone, Copy, Default)]
pub struct ReplayOpts {
    /// Commands kept in flight; defaults to the queue pair's depth.
    pub queue_depth: Option<u32>,
    /// Report the first N zones after the replay (0 = all zones).
    pub zone_report: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReplayStats {
    /// Commands submitted to the device.
    pub replayed: u64,
    /// Records not replayed: completion records are free, everything else
    /// lands here.
    pub skipped: u64,
    /// Commands the device completed with an error status.
    pub errors: u64,
    /// Highest number of commands in flight at any point.
    pub max_outstanding: u32,
    pub duration_ticks: u64,
    pub tsc_rate: u64,
}

/// What a finished replay hands back to the tool.
#[derive(Debug)]
pub struct ReplayOutcome {
    pub stats: ReplayStats,
    /// Device-side zone report, when requested.
    pub zone_report: Option<Vec<ZoneReportDescriptor>>,
    /// Final host-side zone table, when the namespace is zoned.
    pub zones: Option<Vec<ZoneDescriptor>>,
}

/// Why a submission attempt did not stick.
enum SubmitError {
    /// Transient backpressure; poll once and retry the same command.
    Retry,
    Fatal(EngineError),
}

/// Per-in-flight-command context. Owns the DMA buffer; dropped in the
/// completion callback.
struct IoTask {
    opc: NvmeOpc,
    slba: u64,
    nlb: u32,
    buf: Option<DmaBuf>,
}

pub struct ReplayDispatcher {
    ns: Rc<Namespace>,
    qp: QueuePair,
    opts: ReplayOpts,
    queue_depth: u32,
    outstanding: Rc<Cell<u32>>,
    errors: Rc<Cell<u64>>,
    zones: Option<Rc<RefCell<ZoneModel>>>,
}

impl ReplayDispatcher {
    pub fn new(ns: Rc<Namespace>, qp: QueuePair, opts: ReplayOpts) -> Self {
        let queue_depth = opts.queue_depth.unwrap_or_else(|| qp.depth()).max(1);
        let zones =
            ZoneModel::discover(&ns).map(|m| Rc::new(RefCell::new(m)));
        Self {
            ns,
            qp,
            opts,
            queue_depth,
            outstanding: Rc::new(Cell::new(0)),
            errors: Rc::new(Cell::new(0)),
            zones,
        }
    }

    pub fn queue_depth(&self) -> u32 {
        self.queue_depth
    }

    /// Log the namespace identify information before a run.
    pub fn identify(&self) {
        let ns = &self.ns;
        info!(
            "Namespace ID: {} size: {}",
            ns.id(),
            Byte::from_bytes(u128::from(ns.size_in_bytes()))
                .get_appropriate_unit(true)
        );
        info!("Size of namespace: {} (blocks)", ns.num_sectors());
        info!("Size of LBA: {} (bytes)", ns.sector_size());
        if ns.is_zoned() {
            info!("Number of Zone: {}", ns.num_zones());
            info!("Size of Zone: {:#x} (blocks)", ns.zone_size_sectors());
            info!(
                "Max Zone Append Size: {} (blocks)",
                ns.max_zone_append_size() / u64::from(ns.sector_size())
            );
            info!("Max Open Zone: {}", ns.max_open_zones());
            info!("Max Active Zone: {}", ns.max_active_zones());
        }
    }

    /// Replay a stream of records. Consumes the dispatcher; the queue pair
    /// is released before this returns, successfully or not.
    pub fn replay<S>(mut self, stream: S) -> Result<ReplayOutcome, EngineError>
    where
        S: IntoIterator<Item = Result<TraceRecord, EngineError>>,
    {
        let mut stats = ReplayStats {
            tsc_rate: pmd_rs::ticks_hz(),
            ..Default::default()
        };

        self.reset_namespace()?;

        let start_tsc = pmd_rs::ticks();
        for rec in stream {
            let rec = rec?;
            if rec.tpoint == Tracepoint::Complete {
                continue;
            }
            self.dispatch(&rec, &mut stats)?;
        }
        self.drain()?;
        stats.duration_ticks = pmd_rs::ticks() - start_tsc;
        stats.errors = self.errors.get();

        let zone_report = match self.opts.zone_report {
            Some(limit) if self.ns.is_zoned() => {
                Some(self.report_zones(limit)?)
            }
            _ => None,
        };

        let zones = self
            .zones
            .take()
            .map(|m| m.borrow().snapshot().to_vec());

        Ok(ReplayOutcome {
            stats,
            zone_report,
            zones,
        })
    }

    /// One poll round; maps a vanished controller to the fatal error.
    fn poll(&self, max: u32) -> Result<u32, EngineError> {
        self.qp.poll(max).context(crate::core::DeviceLost)
    }

    /// Map a driver refusal outside the record dispatch path.
    fn driver_err(source: DriverError) -> EngineError {
        match source {
            source @ DriverError::DeviceLost { .. } => {
                EngineError::DeviceLost {
                    source,
                }
            }
            source => EngineError::Driver {
                source,
            },
        }
    }

    /// Block until a submission slot below the queue-depth gate is free.
    fn wait_for_slot(&self) -> Result<(), EngineError> {
        while self.outstanding.get() >= self.queue_depth {
            self.poll(0)?;
        }
        Ok(())
    }

    fn drain(&self) -> Result<(), EngineError> {
        while self.outstanding.get() > 0 {
            self.poll(0)?;
        }
        Ok(())
    }

    fn zslba_of(&self, slba: u64) -> u64 {
        let zone_size = self.ns.zone_size_sectors();
        (slba / zone_size) * zone_size
    }

    fn dispatch(
        &mut self,
        rec: &TraceRecord,
        stats: &mut ReplayStats,
    ) -> Result<(), EngineError> {
        let entry = match lookup_opcode(rec.opc) {
            Some(entry) => entry,
            None => {
                warn!("skipping unknown opcode {:#04x}", rec.opc);
                stats.skipped += 1;
                return Ok(());
            }
        };

        let slba = rec.slba();
        let nlb = rec.nlb();

        let action = match entry.action {
            ReplayAction::Skip => {
                debug!("not replaying {}", entry.opc);
                stats.skipped += 1;
                return Ok(());
            }
            ReplayAction::ZoneMgmtSend | ReplayAction::ZoneAppend
                if !self.ns.is_zoned() =>
            {
                stats.skipped += 1;
                return Ok(());
            }
            // A recorded write against a zoned namespace cannot be issued
            // in place: the write pointer has moved on. Coerce it to an
            // append at the start of its zone.
            ReplayAction::Write if self.ns.is_zoned() => {
                ReplayAction::ZoneAppend
            }
            action => action,
        };

        if nlb == 0 || slba >= self.ns.num_sectors() {
            warn!(
                "skipping malformed record: opc {:#04x} slba {:#x} nlb {}",
                rec.opc, slba, nlb
            );
            stats.skipped += 1;
            return Ok(());
        }

        let block_size = u64::from(self.ns.sector_size());
        if action == ReplayAction::ZoneAppend
            && u64::from(nlb) * block_size > self.ns.max_zone_append_size()
        {
            warn!(
                "skipping append of {} blocks: exceeds max zone append size",
                nlb
            );
            stats.skipped += 1;
            return Ok(());
        }

        if action == ReplayAction::ZoneMgmtSend
            && matches!(
                ZoneSendAction::from_u8(rec.zsa()),
                Some(ZoneSendAction::SetZde) | None
            )
        {
            // Unknown or unsupported action; there is no descriptor
            // payload to restore.
            warn!("not replaying zone send action {:#x}", rec.zsa());
            stats.skipped += 1;
            return Ok(());
        }

        self.wait_for_slot()?;

        // Resubmit loop: a refused submission is transient backpressure;
        // poll once and retry the same command. Everything else is fatal to
        // the replay.
        loop {
            match self.try_submit(rec, action, slba, nlb) {
                Ok(()) => break,
                Err(SubmitError::Retry) => {
                    self.poll(1)?;
                }
                Err(SubmitError::Fatal(e)) => return Err(e),
            }
        }

        stats.replayed += 1;
        self.outstanding.set(self.outstanding.get() + 1);
        stats.max_outstanding =
            stats.max_outstanding.max(self.outstanding.get());
        Ok(())
    }

    /// Classify a driver refusal.
    fn submit_error(
        source: DriverError,
        opcode: u16,
        slba: u64,
        nlb: u32,
    ) -> SubmitError {
        match source {
            DriverError::NoFreeSlots {} => SubmitError::Retry,
            source @ DriverError::DeviceLost { .. } => {
                SubmitError::Fatal(EngineError::DeviceLost {
                    source,
                })
            }
            source => SubmitError::Fatal(EngineError::Dispatch {
                source,
                opcode,
                slba,
                nlb,
            }),
        }
    }

    /// Build the per-command task and hand the command to the driver. Each
    /// attempt owns a fresh task, so a refused submission cannot leak a
    /// buffer.
    fn try_submit(
        &self,
        rec: &TraceRecord,
        action: ReplayAction,
        slba: u64,
        nlb: u32,
    ) -> Result<(), SubmitError> {
        let result = match action {
            ReplayAction::Read => {
                let mut task = self.io_task(NvmeOpc::Read, slba, nlb, false)?;
                let ptr = task.buf.as_mut().unwrap().as_mut_ptr();
                let cb = self.completion_cb(task, None);
                self.qp.read(&self.ns, ptr, slba, nlb, cb)
            }
            ReplayAction::Write => {
                let mut task = self.io_task(NvmeOpc::Write, slba, nlb, true)?;
                let ptr = task.buf.as_mut().unwrap().as_mut_ptr();
                let cb = self.completion_cb(task, None);
                self.qp.write(&self.ns, ptr, slba, nlb, cb)
            }
            ReplayAction::ZoneAppend => {
                let zslba = self.zslba_of(slba);
                let mut task =
                    self.io_task(NvmeOpc::ZoneAppend, zslba, nlb, true)?;
                let ptr = task.buf.as_mut().unwrap().as_mut_ptr();
                let cb = self.completion_cb(
                    task,
                    Some(ZoneCommand::Write {
                        slba: zslba,
                        nlb,
                    }),
                );
                self.qp.zone_append(&self.ns, ptr, zslba, nlb, cb)
            }
            ReplayAction::WriteZeroes => {
                let task = IoTask {
                    opc: NvmeOpc::WriteZeroes,
                    slba,
                    nlb,
                    buf: None,
                };
                let zone_cmd = self.zones.as_ref().map(|_| {
                    ZoneCommand::Write {
                        slba,
                        nlb,
                    }
                });
                let cb = self.completion_cb(task, zone_cmd);
                self.qp.write_zeroes(&self.ns, slba, nlb, cb)
            }
            ReplayAction::ZoneMgmtSend => {
                return self.try_submit_zone_mgmt(rec, slba);
            }
            ReplayAction::Skip => unreachable!("skips never reach submit"),
        };
        result.map_err(|e| Self::submit_error(e, rec.opc, slba, nlb))
    }

    fn try_submit_zone_mgmt(
        &self,
        rec: &TraceRecord,
        slba: u64,
    ) -> Result<(), SubmitError> {
        let action = match ZoneSendAction::from_u8(rec.zsa()) {
            Some(action) if action != ZoneSendAction::SetZde => action,
            // Filtered in dispatch().
            _ => unreachable!("unsupported zone send action"),
        };
        let select_all = rec.select_all();
        let zslba = self.zslba_of(slba);
        let task = IoTask {
            opc: NvmeOpc::ZoneMgmtSend,
            slba: zslba,
            nlb: 0,
            buf: None,
        };
        let cb = self.completion_cb(
            task,
            Some(ZoneCommand::Mgmt {
                action,
                slba: zslba,
                select_all,
            }),
        );
        let result = match action {
            ZoneSendAction::Open => {
                self.qp.zone_open(&self.ns, zslba, select_all, cb)
            }
            ZoneSendAction::Close => {
                self.qp.zone_close(&self.ns, zslba, select_all, cb)
            }
            ZoneSendAction::Finish => {
                self.qp.zone_finish(&self.ns, zslba, select_all, cb)
            }
            ZoneSendAction::Reset => {
                self.qp.zone_reset(&self.ns, zslba, select_all, cb)
            }
            ZoneSendAction::Offline => {
                self.qp.zone_offline(&self.ns, zslba, select_all, cb)
            }
            ZoneSendAction::SetZde => unreachable!("filtered above"),
        };
        result.map_err(|e| Self::submit_error(e, rec.opc, zslba, 0))
    }

    /// Allocate the task for a data command; write buffers get the constant
    /// payload stamped into them.
    fn io_task(
        &self,
        opc: NvmeOpc,
        slba: u64,
        nlb: u32,
        payload: bool,
    ) -> Result<IoTask, SubmitError> {
        let block_size = u64::from(self.ns.sector_size());
        let mut buf = DmaBuf::new(u64::from(nlb) * block_size, block_size)
            .map_err(|source| {
                SubmitError::Fatal(EngineError::Dma {
                    source,
                })
            })?;
        if payload {
            let data = buf.as_mut_slice();
            let n = WRITE_PAYLOAD.len().min(data.len());
            data[.. n].copy_from_slice(&WRITE_PAYLOAD[.. n]);
        }
        Ok(IoTask {
            opc,
            slba,
            nlb,
            buf: Some(buf),
        })
    }

    /// The completion callback: logs device errors, folds successful zone
    /// commands into the model, releases the task and decrements the
    /// outstanding count. It never blocks and never submits.
    fn completion_cb(
        &self,
        task: IoTask,
        zone_cmd: Option<ZoneCommand>,
    ) -> pmd_rs::IoCompletionCb {
        let outstanding = self.outstanding.clone();
        let errors = self.errors.clone();
        let zones = self.zones.clone();
        Box::new(move |cpl: IoCompletion| {
            if cpl.status.is_error() {
                errors.set(errors.get() + 1);
                error!(
                    "Replay error - opc = {:#04x}, slba = {:#x}, nlb = {}, \
                     status = {}",
                    task.opc as u16,
                    task.slba,
                    task.nlb,
                    cpl.status.status_string()
                );
            } else if let (Some(zones), Some(cmd)) = (&zones, &zone_cmd) {
                zones.borrow_mut().apply(cmd, true);
            }
            outstanding.set(outstanding.get() - 1);
            drop(task);
        })
    }

    /// Bring the namespace to a known state before the first replayed
    /// command: a Reset-All on zoned namespaces, a chunked write-zeroes
    /// sweep on conventional ones.
    fn reset_namespace(&self) -> Result<(), EngineError> {
        if self.ns.is_zoned() {
            let task = IoTask {
                opc: NvmeOpc::ZoneMgmtSend,
                slba: 0,
                nlb: 0,
                buf: None,
            };
            let cb = self.completion_cb(task, None);
            self.qp
                .zone_reset(&self.ns, 0, true, cb)
                .map_err(Self::driver_err)?;
            self.outstanding.set(self.outstanding.get() + 1);
            self.drain()?;
        } else {
            let xfer_blocks =
                self.ns.max_io_xfer_size() / u64::from(self.ns.sector_size());
            let mut slba = 0;
            while slba < self.ns.num_sectors() {
                let nlb =
                    xfer_blocks.min(self.ns.num_sectors() - slba) as u32;
                let task = IoTask {
                    opc: NvmeOpc::WriteZeroes,
                    slba,
                    nlb,
                    buf: None,
                };
                let cb = self.completion_cb(task, None);
                self.qp
                    .write_zeroes(&self.ns, slba, nlb, cb)
                    .map_err(Self::driver_err)?;
                self.outstanding.set(self.outstanding.get() + 1);
                self.drain()?;
                slba += u64::from(nlb);
            }
        }
        info!("Reset namespace complete");
        Ok(())
    }

    /// Device-side zone report after the replay, first `limit` zones
    /// (0 = all).
    fn report_zones(
        &self,
        limit: u64,
    ) -> Result<Vec<ZoneReportDescriptor>, EngineError> {
        let out = Rc::new(RefCell::new(Vec::new()));
        let sink = out.clone();
        let outstanding = self.outstanding.clone();
        self.qp
            .report_zones(
                &self.ns,
                0,
                limit,
                false,
                Box::new(move |status, report| {
                    if status.is_error() {
                        error!(
                            "Zone report error - status = {}",
                            status.status_string()
                        );
                    } else {
                        *sink.borrow_mut() = report;
                    }
                    outstanding.set(outstanding.get() - 1);
                }),
            )
            .map_err(Self::driver_err)?;
        self.outstanding.set(self.outstanding.get() + 1);
        self.drain()?;
        Ok(Rc::try_unwrap(out)
            .expect("report sink still shared")
            .into_inner())
    }
}
