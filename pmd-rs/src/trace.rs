//! Driver tracepoints. When tracing is enabled on a queue pair, every
//! submission and completion is appended as a fixed-width entry to a
//! file-backed ring under `/dev/shm`, where an external recorder picks them
//! up. The entry layout is native-endian; trace files are not expected to
//! travel between architectures.

use std::{
    convert::TryInto,
    fs::{File, OpenOptions},
    io::{BufReader, BufWriter, ErrorKind, Read, Write},
    path::{Path, PathBuf},
    time::Instant,
};

use once_cell::sync::Lazy;
use snafu::ResultExt;

use crate::{DriverError, InvalidTraceGroup, TraceOpen, TraceParse, TraceWrite};

/// Tick source for timestamps, monotonic within the process.
static TICK_EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Current tick count. The first caller defines the epoch.
pub fn ticks() -> u64 {
    TICK_EPOCH.elapsed().as_nanos() as u64
}

/// Tick rate of the clock behind `ticks()`.
pub fn ticks_hz() -> u64 {
    1_000_000_000
}

/// Logical core the caller currently runs on.
pub fn current_core() -> u32 {
    let cpu = unsafe { libc::sched_getcpu() };
    if cpu < 0 {
        0
    } else {
        cpu as u32
    }
}

/// Identifiers of the tracepoints the driver can emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum TracepointId {
    NvmeIoSubmit = 0x10,
    NvmeIoComplete = 0x11,
    QpCreate = 0x20,
    QpDestroy = 0x21,
}

impl TracepointId {
    pub fn from_u16(id: u16) -> Option<Self> {
        let id = match id {
            0x10 => TracepointId::NvmeIoSubmit,
            0x11 => TracepointId::NvmeIoComplete,
            0x20 => TracepointId::QpCreate,
            0x21 => TracepointId::QpDestroy,
            _ => return None,
        };
        Some(id)
    }

    /// The ASCII tag recorders store in their fixed-width name field.
    pub fn name(&self) -> &'static str {
        match self {
            TracepointId::NvmeIoSubmit => "NVME_IO_SUBMIT",
            TracepointId::NvmeIoComplete => "NVME_IO_COMPLETE",
            TracepointId::QpCreate => "NVME_QP_CREATE",
            TracepointId::QpDestroy => "NVME_QP_DESTROY",
        }
    }
}

/// Set in `object_start` when the submission of the traced object was never
/// observed (the ring was enabled mid-flight). Consumers discard such
/// entries.
pub const OBJECT_START_UNMATCHED: u64 = 1 << 63;

/// Size of one serialized ring entry.
pub const TRACE_ENTRY_SIZE: usize = 64;

const TRACE_MAGIC: u64 = 0x504d_4454_5241_4345; // "PMDTRACE"
const TRACE_HEADER_SIZE: usize = 16;

/// One raw tracepoint entry as emitted by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RawTracepoint {
    pub lcore: u32,
    pub tpoint_id: u16,
    /// Non-zero when the command went to the admin queue.
    pub admin: u8,
    pub tsc: u64,
    pub obj_id: u64,
    /// Submission tick of the traced object; carries
    /// [`OBJECT_START_UNMATCHED`] in the top bit.
    pub object_start: u64,
    pub opc: u16,
    pub cid: u16,
    pub nsid: u32,
    pub cpl: u32,
    pub cdw10: u32,
    pub cdw11: u32,
    pub cdw12: u32,
    pub cdw13: u32,
}

impl RawTracepoint {
    pub fn tpoint(&self) -> Option<TracepointId> {
        TracepointId::from_u16(self.tpoint_id)
    }

    pub fn to_bytes(&self) -> [u8; TRACE_ENTRY_SIZE] {
        let mut b = [0u8; TRACE_ENTRY_SIZE];
        b[0 .. 4].copy_from_slice(&self.lcore.to_ne_bytes());
        b[4 .. 6].copy_from_slice(&self.tpoint_id.to_ne_bytes());
        b[6] = self.admin;
        b[8 .. 16].copy_from_slice(&self.tsc.to_ne_bytes());
        b[16 .. 24].copy_from_slice(&self.obj_id.to_ne_bytes());
        b[24 .. 32].copy_from_slice(&self.object_start.to_ne_bytes());
        b[32 .. 34].copy_from_slice(&self.opc.to_ne_bytes());
        b[34 .. 36].copy_from_slice(&self.cid.to_ne_bytes());
        b[36 .. 40].copy_from_slice(&self.nsid.to_ne_bytes());
        b[40 .. 44].copy_from_slice(&self.cpl.to_ne_bytes());
        b[44 .. 48].copy_from_slice(&self.cdw10.to_ne_bytes());
        b[48 .. 52].copy_from_slice(&self.cdw11.to_ne_bytes());
        b[52 .. 56].copy_from_slice(&self.cdw12.to_ne_bytes());
        b[56 .. 60].copy_from_slice(&self.cdw13.to_ne_bytes());
        b
    }

    pub fn from_bytes(b: &[u8; TRACE_ENTRY_SIZE]) -> Self {
        let ne_u16 = |r: std::ops::Range<usize>| {
            u16::from_ne_bytes(b[r].try_into().unwrap())
        };
        let ne_u32 = |r: std::ops::Range<usize>| {
            u32::from_ne_bytes(b[r].try_into().unwrap())
        };
        let ne_u64 = |r: std::ops::Range<usize>| {
            u64::from_ne_bytes(b[r].try_into().unwrap())
        };
        Self {
            lcore: ne_u32(0 .. 4),
            tpoint_id: ne_u16(4 .. 6),
            admin: b[6],
            tsc: ne_u64(8 .. 16),
            obj_id: ne_u64(16 .. 24),
            object_start: ne_u64(24 .. 32),
            opc: ne_u16(32 .. 34),
            cid: ne_u16(34 .. 36),
            nsid: ne_u32(36 .. 40),
            cpl: ne_u32(40 .. 44),
            cdw10: ne_u32(44 .. 48),
            cdw11: ne_u32(48 .. 52),
            cdw12: ne_u32(52 .. 56),
            cdw13: ne_u32(56 .. 60),
        }
    }
}

/// Tracepoint groups an application may enable. There is a single group
/// today; the set exists so the `-e` flag can be validated.
const TPOINT_GROUPS: &[&str] = &["nvme_io"];

pub fn validate_tpoint_group(group: &str) -> Result<(), DriverError> {
    if TPOINT_GROUPS.contains(&group) {
        Ok(())
    } else {
        InvalidTraceGroup {
            group: group.to_string(),
        }
        .fail()
    }
}

/// Compose the ring path for an application, by shared memory id or pid,
/// the same way the recorder locates it.
pub fn shm_path(app_name: &str, shm_id: Option<i32>, pid: Option<u32>) -> PathBuf {
    let file = match (shm_id, pid) {
        (Some(id), _) => format!("{}_trace.{}", app_name, id),
        (None, Some(pid)) => format!("{}_trace.pid{}", app_name, pid),
        (None, None) => format!("{}_trace.pid{}", app_name, std::process::id()),
    };
    Path::new("/dev/shm").join(file)
}

/// Append-only ring of raw tracepoints, file backed.
#[derive(Debug)]
pub struct TraceRing {
    out: BufWriter<File>,
    path: PathBuf,
    entries: u64,
}

impl TraceRing {
    /// Create the ring at an explicit path, truncating a previous run.
    pub fn create(path: &Path) -> Result<Self, DriverError> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .context(TraceOpen {
                path: path.display().to_string(),
            })?;
        let mut out = BufWriter::new(file);
        out.write_all(&TRACE_MAGIC.to_ne_bytes())
            .and_then(|_| out.write_all(&ticks_hz().to_ne_bytes()))
            .context(TraceWrite)?;
        Ok(Self {
            out,
            path: path.to_path_buf(),
            entries: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entries(&self) -> u64 {
        self.entries
    }

    pub fn record(&mut self, tp: &RawTracepoint) -> Result<(), DriverError> {
        self.out.write_all(&tp.to_bytes()).context(TraceWrite)?;
        self.entries += 1;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), DriverError> {
        self.out.flush().context(TraceWrite)
    }
}

impl Drop for TraceRing {
    fn drop(&mut self) {
        if let Err(error) = self.out.flush() {
            tracing::error!(?error, "failed to flush trace ring");
        }
    }
}

/// Cursor over a ring file, yielding raw tracepoints in the order the
/// driver emitted them.
#[derive(Debug)]
pub struct TraceCursor {
    input: BufReader<File>,
    path: PathBuf,
    tsc_rate: u64,
    lcore: Option<u32>,
}

impl TraceCursor {
    /// Open a ring file; `lcore` limits the cursor to entries of a single
    /// logical core.
    pub fn open(path: &Path, lcore: Option<u32>) -> Result<Self, DriverError> {
        let file = File::open(path).context(TraceOpen {
            path: path.display().to_string(),
        })?;
        let mut input = BufReader::new(file);
        let mut header = [0u8; TRACE_HEADER_SIZE];
        input.read_exact(&mut header).map_err(|_| {
            TraceParse {
                path: path.display().to_string(),
                reason: "short header".to_string(),
            }
            .build()
        })?;
        let magic = u64::from_ne_bytes(header[0 .. 8].try_into().unwrap());
        if magic != TRACE_MAGIC {
            return TraceParse {
                path: path.display().to_string(),
                reason: "bad magic".to_string(),
            }
            .fail();
        }
        let tsc_rate = u64::from_ne_bytes(header[8 .. 16].try_into().unwrap());
        Ok(Self {
            input,
            path: path.to_path_buf(),
            tsc_rate,
            lcore,
        })
    }

    /// Ticks per second on the producing side, from the ring header.
    pub fn tsc_rate(&self) -> u64 {
        self.tsc_rate
    }
}

impl Iterator for TraceCursor {
    type Item = Result<RawTracepoint, DriverError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let mut raw = [0u8; TRACE_ENTRY_SIZE];
            match self.input.read_exact(&mut raw) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                    return None;
                }
                Err(_) => {
                    return Some(
                        TraceParse {
                            path: self.path.display().to_string(),
                            reason: "truncated entry".to_string(),
                        }
                        .fail(),
                    );
                }
            }
            let tp = RawTracepoint::from_bytes(&raw);
            match self.lcore {
                Some(lcore) if tp.lcore != lcore => continue,
                _ => return Some(Ok(tp)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_codec_round_trip() {
        let tp = RawTracepoint {
            lcore: 3,
            tpoint_id: TracepointId::NvmeIoSubmit as u16,
            admin: 0,
            tsc: 12345,
            obj_id: 7,
            object_start: 12000,
            opc: 0x7d,
            cid: 42,
            nsid: 1,
            cpl: 0,
            cdw10: 0x1000,
            cdw11: 0,
            cdw12: 15,
            cdw13: 0,
        };
        assert_eq!(RawTracepoint::from_bytes(&tp.to_bytes()), tp);
    }

    #[test]
    fn ring_and_cursor_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ring");
        let mut ring = TraceRing::create(&path).unwrap();
        for i in 0 .. 10u64 {
            ring.record(&RawTracepoint {
                lcore: (i % 2) as u32,
                tpoint_id: TracepointId::NvmeIoComplete as u16,
                tsc: i,
                obj_id: i,
                ..Default::default()
            })
            .unwrap();
        }
        ring.flush().unwrap();
        drop(ring);

        let all: Vec<_> = TraceCursor::open(&path, None)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(all.len(), 10);
        assert_eq!(all[4].tsc, 4);

        let even: Vec<_> = TraceCursor::open(&path, Some(0))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(even.len(), 5);
    }

    #[test]
    fn unknown_group_is_rejected() {
        assert!(validate_tpoint_group("nvme_io").is_ok());
        assert!(validate_tpoint_group("bdev").is_err());
    }
}
