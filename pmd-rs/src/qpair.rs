//! The polled I/O queue pair. Submission primitives enqueue work and return
//! immediately; `poll()` executes queued commands against the namespace and
//! fires their completion callbacks. Payload buffers are passed as raw
//! pointers, exactly like a hardware submission queue entry would carry
//! them: the buffer must stay alive until the command's completion callback
//! has fired.

use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    rc::Rc,
    slice::{from_raw_parts, from_raw_parts_mut},
};

use crate::{
    namespace::Namespace,
    nvme::{NvmeOpc, NvmeStatus, ZoneReportDescriptor, ZoneSendAction},
    trace::{
        current_core,
        ticks,
        RawTracepoint,
        TraceRing,
        TracepointId,
        OBJECT_START_UNMATCHED,
    },
    DriverError,
};

/// Options used when allocating a queue pair.
#[derive(Debug, Clone, Copy)]
pub struct QueuePairOpts {
    /// Number of submission slots; also the upper bound on commands in
    /// flight.
    pub io_queue_size: u32,
}

impl Default for QueuePairOpts {
    fn default() -> Self {
        Self {
            io_queue_size: 256,
        }
    }
}

/// Completion of a single I/O command.
#[derive(Debug, Clone, Copy)]
pub struct IoCompletion {
    pub cid: u16,
    pub status: NvmeStatus,
    /// Command specific result; for zone append the LBA the data landed on.
    pub result: u64,
}

pub type IoCompletionCb = Box<dyn FnOnce(IoCompletion)>;
pub type ZoneReportCb = Box<dyn FnOnce(NvmeStatus, Vec<ZoneReportDescriptor>)>;

enum IoCmd {
    Read {
        slba: u64,
        nlb: u32,
        buf: *mut u8,
    },
    Write {
        slba: u64,
        nlb: u32,
        buf: *const u8,
    },
    WriteZeroes {
        slba: u64,
        nlb: u32,
    },
    ZoneAppend {
        zslba: u64,
        nlb: u32,
        buf: *const u8,
    },
    ZoneMgmtSend {
        action: ZoneSendAction,
        slba: u64,
        select_all: bool,
    },
    ZoneMgmtRecv {
        slba: u64,
        max: u64,
        extended: bool,
    },
}

impl IoCmd {
    fn opc(&self) -> NvmeOpc {
        match self {
            IoCmd::Read { .. } => NvmeOpc::Read,
            IoCmd::Write { .. } => NvmeOpc::Write,
            IoCmd::WriteZeroes { .. } => NvmeOpc::WriteZeroes,
            IoCmd::ZoneAppend { .. } => NvmeOpc::ZoneAppend,
            IoCmd::ZoneMgmtSend { .. } => NvmeOpc::ZoneMgmtSend,
            IoCmd::ZoneMgmtRecv { .. } => NvmeOpc::ZoneMgmtRecv,
        }
    }

    /// The command dwords as they would appear in the submission queue
    /// entry; this is what the submit tracepoint records.
    fn dwords(&self) -> (u32, u32, u32, u32) {
        match *self {
            IoCmd::Read { slba, nlb, .. }
            | IoCmd::Write { slba, nlb, .. }
            | IoCmd::WriteZeroes { slba, nlb } => (
                slba as u32,
                (slba >> 32) as u32,
                nlb.saturating_sub(1) & 0xffff,
                0,
            ),
            IoCmd::ZoneAppend { zslba, nlb, .. } => (
                zslba as u32,
                (zslba >> 32) as u32,
                nlb.saturating_sub(1) & 0xffff,
                0,
            ),
            IoCmd::ZoneMgmtSend {
                action,
                slba,
                select_all,
            } => (
                slba as u32,
                (slba >> 32) as u32,
                0,
                u32::from(action as u8) | (u32::from(select_all) << 8),
            ),
            IoCmd::ZoneMgmtRecv { slba, extended, .. } => (
                slba as u32,
                (slba >> 32) as u32,
                0,
                u32::from(extended),
            ),
        }
    }
}

enum CompletionSink {
    Io(IoCompletionCb),
    Report(ZoneReportCb),
}

struct Pending {
    ns: Rc<Namespace>,
    cmd: IoCmd,
    cid: u16,
    obj_id: u64,
    submit_tsc: u64,
    traced: bool,
    sink: CompletionSink,
}

/// A paired submission/completion ring bound to one controller.
pub struct QueuePair {
    ctrlr: String,
    qid: u16,
    depth: u32,
    alive: Rc<Cell<bool>>,
    pending: RefCell<VecDeque<Pending>>,
    next_cid: Cell<u16>,
    next_obj: Cell<u64>,
    ring: RefCell<Option<Rc<RefCell<TraceRing>>>>,
}

impl QueuePair {
    pub(crate) fn new(
        ctrlr: String,
        qid: u16,
        opts: QueuePairOpts,
        alive: Rc<Cell<bool>>,
    ) -> Self {
        Self {
            ctrlr,
            qid,
            depth: opts.io_queue_size.max(1),
            alive,
            pending: RefCell::new(VecDeque::new()),
            next_cid: Cell::new(0),
            next_obj: Cell::new(u64::from(qid) << 48),
            ring: RefCell::new(None),
        }
    }

    pub fn qid(&self) -> u16 {
        self.qid
    }

    /// The configured submission queue size.
    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// Commands submitted but not yet completed by `poll()`.
    pub fn outstanding(&self) -> u32 {
        self.pending.borrow().len() as u32
    }

    /// Route submit/complete tracepoints of this queue pair into `ring`.
    pub fn enable_tracing(&self, ring: Rc<RefCell<TraceRing>>) {
        self.emit(
            &ring,
            TracepointId::QpCreate,
            RawTracepoint {
                obj_id: u64::from(self.qid),
                ..Default::default()
            },
        );
        *self.ring.borrow_mut() = Some(ring);
    }

    fn emit(
        &self,
        ring: &Rc<RefCell<TraceRing>>,
        id: TracepointId,
        partial: RawTracepoint,
    ) {
        let tp = RawTracepoint {
            lcore: current_core(),
            tpoint_id: id as u16,
            tsc: ticks(),
            ..partial
        };
        if let Err(error) = ring.borrow_mut().record(&tp) {
            tracing::error!(?error, "dropping tracepoint");
        }
    }

    fn submit(
        &self,
        ns: &Rc<Namespace>,
        cmd: IoCmd,
        sink: CompletionSink,
    ) -> Result<(), DriverError> {
        if !self.alive.get() {
            return crate::DeviceLost {
                name: self.ctrlr.clone(),
            }
            .fail();
        }
        if self.outstanding() >= self.depth {
            return crate::NoFreeSlots {}.fail();
        }

        let cid = self.next_cid.get();
        self.next_cid.set(cid.wrapping_add(1));
        let obj_id = self.next_obj.get();
        self.next_obj.set(obj_id + 1);
        let submit_tsc = ticks();

        let ring = self.ring.borrow();
        let traced = ring.is_some();
        if let Some(ring) = ring.as_ref() {
            let (cdw10, cdw11, cdw12, cdw13) = cmd.dwords();
            self.emit(
                ring,
                TracepointId::NvmeIoSubmit,
                RawTracepoint {
                    obj_id,
                    object_start: submit_tsc,
                    opc: cmd.opc() as u16,
                    cid,
                    nsid: ns.id(),
                    cdw10,
                    cdw11,
                    cdw12,
                    cdw13,
                    ..Default::default()
                },
            );
        }
        drop(ring);

        self.pending.borrow_mut().push_back(Pending {
            ns: ns.clone(),
            cmd,
            cid,
            obj_id,
            submit_tsc,
            traced,
            sink,
        });
        Ok(())
    }

    pub fn read(
        &self,
        ns: &Rc<Namespace>,
        buf: *mut u8,
        slba: u64,
        nlb: u32,
        cb: IoCompletionCb,
    ) -> Result<(), DriverError> {
        self.submit(
            ns,
            IoCmd::Read {
                slba,
                nlb,
                buf,
            },
            CompletionSink::Io(cb),
        )
    }

    pub fn write(
        &self,
        ns: &Rc<Namespace>,
        buf: *const u8,
        slba: u64,
        nlb: u32,
        cb: IoCompletionCb,
    ) -> Result<(), DriverError> {
        self.submit(
            ns,
            IoCmd::Write {
                slba,
                nlb,
                buf,
            },
            CompletionSink::Io(cb),
        )
    }

    pub fn write_zeroes(
        &self,
        ns: &Rc<Namespace>,
        slba: u64,
        nlb: u32,
        cb: IoCompletionCb,
    ) -> Result<(), DriverError> {
        self.submit(
            ns,
            IoCmd::WriteZeroes {
                slba,
                nlb,
            },
            CompletionSink::Io(cb),
        )
    }

    pub fn zone_append(
        &self,
        ns: &Rc<Namespace>,
        buf: *const u8,
        zslba: u64,
        nlb: u32,
        cb: IoCompletionCb,
    ) -> Result<(), DriverError> {
        self.submit(
            ns,
            IoCmd::ZoneAppend {
                zslba,
                nlb,
                buf,
            },
            CompletionSink::Io(cb),
        )
    }

    fn zone_mgmt(
        &self,
        ns: &Rc<Namespace>,
        action: ZoneSendAction,
        slba: u64,
        select_all: bool,
        cb: IoCompletionCb,
    ) -> Result<(), DriverError> {
        self.submit(
            ns,
            IoCmd::ZoneMgmtSend {
                action,
                slba,
                select_all,
            },
            CompletionSink::Io(cb),
        )
    }

    pub fn zone_open(
        &self,
        ns: &Rc<Namespace>,
        slba: u64,
        select_all: bool,
        cb: IoCompletionCb,
    ) -> Result<(), DriverError> {
        self.zone_mgmt(ns, ZoneSendAction::Open, slba, select_all, cb)
    }

    pub fn zone_close(
        &self,
        ns: &Rc<Namespace>,
        slba: u64,
        select_all: bool,
        cb: IoCompletionCb,
    ) -> Result<(), DriverError> {
        self.zone_mgmt(ns, ZoneSendAction::Close, slba, select_all, cb)
    }

    pub fn zone_finish(
        &self,
        ns: &Rc<Namespace>,
        slba: u64,
        select_all: bool,
        cb: IoCompletionCb,
    ) -> Result<(), DriverError> {
        self.zone_mgmt(ns, ZoneSendAction::Finish, slba, select_all, cb)
    }

    pub fn zone_reset(
        &self,
        ns: &Rc<Namespace>,
        slba: u64,
        select_all: bool,
        cb: IoCompletionCb,
    ) -> Result<(), DriverError> {
        self.zone_mgmt(ns, ZoneSendAction::Reset, slba, select_all, cb)
    }

    pub fn zone_offline(
        &self,
        ns: &Rc<Namespace>,
        slba: u64,
        select_all: bool,
        cb: IoCompletionCb,
    ) -> Result<(), DriverError> {
        self.zone_mgmt(ns, ZoneSendAction::Offline, slba, select_all, cb)
    }

    /// Zone report starting at `slba`; `max` of zero reports every zone.
    pub fn report_zones(
        &self,
        ns: &Rc<Namespace>,
        slba: u64,
        max: u64,
        extended: bool,
        cb: ZoneReportCb,
    ) -> Result<(), DriverError> {
        self.submit(
            ns,
            IoCmd::ZoneMgmtRecv {
                slba,
                max,
                extended,
            },
            CompletionSink::Report(cb),
        )
    }

    /// Process up to `max` queued commands (0 = all), firing their
    /// completion callbacks. Returns the number of completions consumed.
    pub fn poll(&self, max: u32) -> Result<u32, DriverError> {
        if !self.alive.get() {
            return crate::DeviceLost {
                name: self.ctrlr.clone(),
            }
            .fail();
        }

        let mut done = 0u32;
        while max == 0 || done < max {
            let p = match self.pending.borrow_mut().pop_front() {
                Some(p) => p,
                None => break,
            };
            self.complete(p);
            done += 1;
        }
        Ok(done)
    }

    fn complete(&self, p: Pending) {
        let bs = u64::from(p.ns.sector_size());
        let (status, result, report) = match p.cmd {
            IoCmd::Read {
                slba,
                nlb,
                buf,
            } => {
                let out = unsafe {
                    from_raw_parts_mut(buf, (u64::from(nlb) * bs) as usize)
                };
                (p.ns.execute_read(slba, nlb, out), 0, None)
            }
            IoCmd::Write {
                slba,
                nlb,
                buf,
            } => {
                let data = unsafe {
                    from_raw_parts(buf, (u64::from(nlb) * bs) as usize)
                };
                let (st, res) = p.ns.execute_write(slba, nlb, Some(data));
                (st, res, None)
            }
            IoCmd::WriteZeroes {
                slba,
                nlb,
            } => {
                let (st, res) = p.ns.execute_write_zeroes(slba, nlb);
                (st, res, None)
            }
            IoCmd::ZoneAppend {
                zslba,
                nlb,
                buf,
            } => {
                let data = unsafe {
                    from_raw_parts(buf, (u64::from(nlb) * bs) as usize)
                };
                let (st, res) = p.ns.execute_zone_append(zslba, nlb, Some(data));
                (st, res, None)
            }
            IoCmd::ZoneMgmtSend {
                action,
                slba,
                select_all,
            } => (p.ns.execute_zone_mgmt(action, slba, select_all), 0, None),
            IoCmd::ZoneMgmtRecv {
                slba,
                max,
                ..
            } => (
                NvmeStatus::SUCCESS,
                0,
                Some(p.ns.report(slba, max)),
            ),
        };

        if let Some(ring) = self.ring.borrow().as_ref() {
            let object_start = if p.traced {
                p.submit_tsc
            } else {
                p.submit_tsc | OBJECT_START_UNMATCHED
            };
            self.emit(
                ring,
                TracepointId::NvmeIoComplete,
                RawTracepoint {
                    obj_id: p.obj_id,
                    object_start,
                    opc: p.cmd.opc() as u16,
                    cid: p.cid,
                    nsid: p.ns.id(),
                    cpl: status.as_raw_cpl(),
                    ..Default::default()
                },
            );
        }

        match p.sink {
            CompletionSink::Io(cb) => cb(IoCompletion {
                cid: p.cid,
                status,
                result,
            }),
            CompletionSink::Report(cb) => {
                cb(status, report.unwrap_or_default())
            }
        }
    }
}

impl Drop for QueuePair {
    fn drop(&mut self) {
        let ring = self.ring.borrow_mut().take();
        if let Some(ring) = ring {
            self.emit(
                &ring,
                TracepointId::QpDestroy,
                RawTracepoint {
                    obj_id: u64::from(self.qid),
                    ..Default::default()
                },
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusConfig, NamespaceConfig, ZnsConfig};

    fn zns_controller() -> crate::Controller {
        let cfg = BusConfig::new().with_device(crate::DeviceConfig {
            name: "zns0".into(),
            ns: NamespaceConfig {
                block_size: 512,
                num_blocks: 0,
                zns: Some(ZnsConfig {
                    zone_size: 0x100,
                    zone_cap: 0x100,
                    num_zones: 4,
                    max_open: 0,
                    max_active: 0,
                    max_append_blocks: 0x40,
                }),
            },
        });
        crate::probe(&cfg).unwrap().remove(0)
    }

    #[test]
    fn backpressure_then_poll_drains() {
        let ctrlr = zns_controller();
        let ns = ctrlr.attach().remove(0);
        let qp = ctrlr
            .alloc_io_qpair(QueuePairOpts {
                io_queue_size: 2,
            })
            .unwrap();

        let data = vec![1u8; 512];
        for _ in 0 .. 2 {
            qp.zone_append(&ns, data.as_ptr(), 0, 1, Box::new(|c| {
                assert!(!c.status.is_error());
            }))
            .unwrap();
        }
        let err = qp
            .zone_append(&ns, data.as_ptr(), 0, 1, Box::new(|_| {}))
            .unwrap_err();
        assert!(matches!(err, DriverError::NoFreeSlots {}));

        assert_eq!(qp.poll(0).unwrap(), 2);
        assert_eq!(qp.outstanding(), 0);
    }

    #[test]
    fn append_result_carries_assigned_lba() {
        let ctrlr = zns_controller();
        let ns = ctrlr.attach().remove(0);
        let qp = ctrlr.alloc_io_qpair(Default::default()).unwrap();

        let data = vec![9u8; 2 * 512];
        let lbas = Rc::new(RefCell::new(Vec::new()));
        for _ in 0 .. 3 {
            let lbas = lbas.clone();
            qp.zone_append(
                &ns,
                data.as_ptr(),
                0,
                2,
                Box::new(move |c| lbas.borrow_mut().push(c.result)),
            )
            .unwrap();
        }
        qp.poll(0).unwrap();
        assert_eq!(*lbas.borrow(), vec![0, 2, 4]);
    }

    #[test]
    fn poll_fails_once_detached() {
        let ctrlr = zns_controller();
        let ns = ctrlr.attach().remove(0);
        let qp = ctrlr.alloc_io_qpair(Default::default()).unwrap();
        let data = vec![0u8; 512];
        qp.zone_append(&ns, data.as_ptr(), 0, 1, Box::new(|_| {}))
            .unwrap();
        ctrlr.detach();
        assert!(matches!(
            qp.poll(0).unwrap_err(),
            DriverError::DeviceLost { .. }
        ));
    }
}
