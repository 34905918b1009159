//! The trace recorder: drains the driver's tracepoint ring and serializes
//! the NVMe submit/complete events into a trace file. Everything else in
//! the ring — other tracepoints, admin-queue entries, completions whose
//! submission was never observed — is dropped.

use std::{
    fs::File,
    io::{BufWriter, Write},
    path::Path,
};

use snafu::ResultExt;

use pmd_rs::{RawTracepoint, TracepointId, OBJECT_START_UNMATCHED};

use crate::{
    core::{EngineError, TraceFileWrite},
    trace::schema::{Tracepoint, TraceRecord},
};

#[derive(Debug, Clone, Copy, Default)]
pub struct RecorderOpts {
    /// Print every record written, one line per record.
    pub debug_dump: bool,
}

pub struct TraceRecorder {
    out: BufWriter<File>,
    path: String,
    opts: RecorderOpts,
    /// Original timestamp of the first retained entry; subtracted from
    /// every timestamp written.
    tsc_base: Option<u64>,
    written: u64,
    skipped: u64,
}

impl TraceRecorder {
    pub fn create(path: &Path, opts: RecorderOpts) -> Result<Self, EngineError> {
        let display = path.display().to_string();
        let file = File::create(path).context(TraceFileWrite {
            path: display.clone(),
        })?;
        Ok(Self {
            out: BufWriter::new(file),
            path: display,
            opts,
            tsc_base: None,
            written: 0,
            skipped: 0,
        })
    }

    /// Whether a raw entry makes it into the file at all.
    fn retain(tp: &RawTracepoint) -> Option<Tracepoint> {
        let kind = match tp.tpoint() {
            Some(TracepointId::NvmeIoSubmit) => Tracepoint::Submit,
            Some(TracepointId::NvmeIoComplete) => Tracepoint::Complete,
            _ => return None,
        };
        if tp.admin != 0 {
            return None;
        }
        if tp.object_start & OBJECT_START_UNMATCHED != 0 {
            return None;
        }
        Some(kind)
    }

    /// Serialize one raw tracepoint, if it passes the filter.
    pub fn process(
        &mut self,
        tp: &RawTracepoint,
        tsc_rate: u64,
    ) -> Result<(), EngineError> {
        let kind = match Self::retain(tp) {
            Some(kind) => kind,
            None => {
                self.skipped += 1;
                return Ok(());
            }
        };

        let tsc_base = *self.tsc_base.get_or_insert(tp.tsc);

        let rec = TraceRecord {
            lcore: tp.lcore,
            tsc_rate,
            tsc_timestamp: tp.tsc - tsc_base,
            obj_id: tp.obj_id,
            tsc_sc_time: match kind {
                Tracepoint::Complete => tp.tsc - tp.object_start,
                Tracepoint::Submit => 0,
            },
            tpoint: kind,
            opc: tp.opc,
            cid: tp.cid,
            nsid: tp.nsid,
            cpl: tp.cpl,
            cdw10: tp.cdw10,
            cdw11: tp.cdw11,
            cdw12: tp.cdw12,
            cdw13: tp.cdw13,
        };

        self.out.write_all(&rec.to_bytes()).context(TraceFileWrite {
            path: self.path.clone(),
        })?;
        self.written += 1;

        if self.opts.debug_dump {
            println!(
                "tsc_timestamp: {:20}  tpoint_name: {:16}  opc: {:2}  \
                 cid: {:3}  obj_id: {}  tsc_sc_time: {:15}",
                rec.tsc_timestamp,
                rec.tpoint.tag(),
                rec.opc,
                rec.cid,
                rec.obj_id,
                rec.tsc_sc_time,
            );
        }
        Ok(())
    }

    /// Drain a whole cursor into the file.
    pub fn consume<I>(
        &mut self,
        cursor: I,
        tsc_rate: u64,
    ) -> Result<(), EngineError>
    where
        I: IntoIterator<Item = Result<RawTracepoint, pmd_rs::DriverError>>,
    {
        for tp in cursor {
            let tp = tp.context(crate::core::TraceRing)?;
            self.process(&tp, tsc_rate)?;
        }
        Ok(())
    }

    /// Flush and close, returning (written, skipped) counts.
    pub fn finish(mut self) -> Result<(u64, u64), EngineError> {
        self.out.flush().context(TraceFileWrite {
            path: self.path.clone(),
        })?;
        Ok((self.written, self.skipped))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::reader::TraceReader;

    fn submit(tsc: u64, obj: u64) -> RawTracepoint {
        RawTracepoint {
            tpoint_id: TracepointId::NvmeIoSubmit as u16,
            tsc,
            obj_id: obj,
            object_start: tsc,
            opc: 0x01,
            nsid: 1,
            ..Default::default()
        }
    }

    fn complete(tsc: u64, obj: u64, submitted: u64) -> RawTracepoint {
        RawTracepoint {
            tpoint_id: TracepointId::NvmeIoComplete as u16,
            tsc,
            obj_id: obj,
            object_start: submitted,
            opc: 0x01,
            nsid: 1,
            cpl: 1,
            ..Default::default()
        }
    }

    #[test]
    fn epoch_and_latency_are_derived() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        let mut rec =
            TraceRecorder::create(&path, RecorderOpts::default()).unwrap();

        rec.process(&submit(1000, 1), 7).unwrap();
        rec.process(&complete(1500, 1, 1000), 7).unwrap();
        let (written, skipped) = rec.finish().unwrap();
        assert_eq!((written, skipped), (2, 0));

        let recs: Vec<_> = TraceReader::open(&path)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(recs[0].tsc_timestamp, 0);
        assert_eq!(recs[0].tsc_sc_time, 0);
        assert_eq!(recs[1].tsc_timestamp, 500);
        assert_eq!(recs[1].tsc_sc_time, 500);
        assert!(recs.iter().all(|r| r.tsc_rate == 7));
    }

    #[test]
    fn filters_admin_foreign_and_unmatched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        let mut rec =
            TraceRecorder::create(&path, RecorderOpts::default()).unwrap();

        // Foreign tracepoint.
        rec.process(
            &RawTracepoint {
                tpoint_id: TracepointId::QpCreate as u16,
                ..Default::default()
            },
            7,
        )
        .unwrap();
        // Admin queue entry.
        rec.process(
            &RawTracepoint {
                admin: 1,
                ..submit(10, 1)
            },
            7,
        )
        .unwrap();
        // Completion with the unmatched sentinel.
        rec.process(
            &RawTracepoint {
                object_start: 10 | OBJECT_START_UNMATCHED,
                ..complete(20, 2, 10)
            },
            7,
        )
        .unwrap();
        rec.process(&submit(30, 3), 7).unwrap();

        let (written, skipped) = rec.finish().unwrap();
        assert_eq!((written, skipped), (1, 3));
    }
}
