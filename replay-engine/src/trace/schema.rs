//! The on-disk trace record. Records are fixed width so that a file is a
//! plain concatenation with no header; byte order is the producer's native
//! order. The ASCII tracepoint tag is preserved verbatim on the wire but is
//! parsed exactly once on read, so downstream logic dispatches on the
//! [`Tracepoint`] variants rather than on strings.

use std::convert::TryInto;

use crate::core::EngineError;

/// Size of one serialized trace record.
pub const TRACE_RECORD_SIZE: usize = 96;

/// Width of the fixed ASCII tracepoint tag.
pub const TPOINT_NAME_LEN: usize = 32;

const TAG_SUBMIT: &str = "NVME_IO_SUBMIT";
const TAG_COMPLETE: &str = "NVME_IO_COMPLETE";

/// The two event kinds a trace file may contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tracepoint {
    Submit,
    Complete,
}

impl Tracepoint {
    pub fn tag(&self) -> &'static str {
        match self {
            Tracepoint::Submit => TAG_SUBMIT,
            Tracepoint::Complete => TAG_COMPLETE,
        }
    }

    fn from_tag(tag: &[u8]) -> Option<Self> {
        let end = tag.iter().position(|b| *b == 0).unwrap_or(tag.len());
        match &tag[.. end] {
            b if b == TAG_SUBMIT.as_bytes() => Some(Tracepoint::Submit),
            b if b == TAG_COMPLETE.as_bytes() => Some(Tracepoint::Complete),
            _ => None,
        }
    }
}

/// One trace event record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceRecord {
    /// Logical core that submitted or completed the command.
    pub lcore: u32,
    /// Ticks per second on the producing core; invariant within a file.
    pub tsc_rate: u64,
    /// Ticks since the file's epoch; the first event is 0.
    pub tsc_timestamp: u64,
    /// Correlation handle matching a submit to its completion.
    pub obj_id: u64,
    /// Submit-to-complete latency in ticks; 0 on submit records.
    pub tsc_sc_time: u64,
    pub tpoint: Tracepoint,
    pub opc: u16,
    pub cid: u16,
    pub nsid: u32,
    /// Raw completion status word; completion records only.
    pub cpl: u32,
    pub cdw10: u32,
    pub cdw11: u32,
    pub cdw12: u32,
    pub cdw13: u32,
}

impl TraceRecord {
    pub fn to_bytes(&self) -> [u8; TRACE_RECORD_SIZE] {
        let mut b = [0u8; TRACE_RECORD_SIZE];
        b[0 .. 4].copy_from_slice(&self.lcore.to_ne_bytes());
        b[4 .. 12].copy_from_slice(&self.tsc_rate.to_ne_bytes());
        b[12 .. 20].copy_from_slice(&self.tsc_timestamp.to_ne_bytes());
        b[20 .. 28].copy_from_slice(&self.obj_id.to_ne_bytes());
        b[28 .. 36].copy_from_slice(&self.tsc_sc_time.to_ne_bytes());
        let tag = self.tpoint.tag().as_bytes();
        b[36 .. 36 + tag.len()].copy_from_slice(tag);
        b[68 .. 70].copy_from_slice(&self.opc.to_ne_bytes());
        b[70 .. 72].copy_from_slice(&self.cid.to_ne_bytes());
        b[72 .. 76].copy_from_slice(&self.nsid.to_ne_bytes());
        b[76 .. 80].copy_from_slice(&self.cpl.to_ne_bytes());
        b[80 .. 84].copy_from_slice(&self.cdw10.to_ne_bytes());
        b[84 .. 88].copy_from_slice(&self.cdw11.to_ne_bytes());
        b[88 .. 92].copy_from_slice(&self.cdw12.to_ne_bytes());
        b[92 .. 96].copy_from_slice(&self.cdw13.to_ne_bytes());
        b
    }

    pub fn from_bytes(
        b: &[u8; TRACE_RECORD_SIZE],
    ) -> Result<Self, EngineError> {
        let ne_u16 = |r: std::ops::Range<usize>| {
            u16::from_ne_bytes(b[r].try_into().unwrap())
        };
        let ne_u32 = |r: std::ops::Range<usize>| {
            u32::from_ne_bytes(b[r].try_into().unwrap())
        };
        let ne_u64 = |r: std::ops::Range<usize>| {
            u64::from_ne_bytes(b[r].try_into().unwrap())
        };
        let tpoint = Tracepoint::from_tag(&b[36 .. 36 + TPOINT_NAME_LEN])
            .ok_or_else(|| {
                crate::core::MalformedFile {
                    path: String::new(),
                    reason: "unknown tracepoint tag".to_string(),
                }
                .build()
            })?;
        Ok(Self {
            lcore: ne_u32(0 .. 4),
            tsc_rate: ne_u64(4 .. 12),
            tsc_timestamp: ne_u64(12 .. 20),
            obj_id: ne_u64(20 .. 28),
            tsc_sc_time: ne_u64(28 .. 36),
            tpoint,
            opc: ne_u16(68 .. 70),
            cid: ne_u16(70 .. 72),
            nsid: ne_u32(72 .. 76),
            cpl: ne_u32(76 .. 80),
            cdw10: ne_u32(80 .. 84),
            cdw11: ne_u32(84 .. 88),
            cdw12: ne_u32(88 .. 92),
            cdw13: ne_u32(92 .. 96),
        })
    }

    /// Starting LBA for the opcodes that carry one in cdw10/cdw11.
    pub fn slba(&self) -> u64 {
        u64::from(self.cdw10) | (u64::from(self.cdw11) << 32)
    }

    /// Number of logical blocks; the on-wire field is 0-based.
    pub fn nlb(&self) -> u32 {
        (self.cdw12 & 0xffff) + 1
    }

    /// Number of ranges of a dataset management command.
    pub fn dsm_ranges(&self) -> u32 {
        (self.cdw10 & 0xff) + 1
    }

    /// Number of ranges of a copy command.
    pub fn copy_ranges(&self) -> u32 {
        (self.cdw12 & 0xff) + 1
    }

    /// Response dwords of a zone management receive command.
    pub fn zmr_dwords(&self) -> u64 {
        u64::from(self.cdw12) + 1
    }

    /// Zone send action of a zone management send command.
    pub fn zsa(&self) -> u8 {
        (self.cdw13 & 0xff) as u8
    }

    /// Zone receive action of a zone management receive command.
    pub fn zra(&self) -> u8 {
        (self.cdw13 & 0xff) as u8
    }

    /// Select-all flag of a zone management send command.
    pub fn select_all(&self) -> bool {
        self.cdw13 & (1 << 8) != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> TraceRecord {
        TraceRecord {
            lcore: 1,
            tsc_rate: 1_000_000_000,
            tsc_timestamp: 42,
            obj_id: 0x1_0000_0007,
            tsc_sc_time: 0,
            tpoint: Tracepoint::Submit,
            opc: 0x7d,
            cid: 9,
            nsid: 1,
            cpl: 0,
            cdw10: 0x4000,
            cdw11: 0x2,
            cdw12: 31,
            cdw13: 0,
        }
    }

    #[test]
    fn codec_round_trip() {
        let rec = sample();
        let bytes = rec.to_bytes();
        assert_eq!(bytes.len(), TRACE_RECORD_SIZE);
        assert_eq!(TraceRecord::from_bytes(&bytes).unwrap(), rec);
    }

    #[test]
    fn derived_fields() {
        let rec = sample();
        assert_eq!(rec.slba(), 0x2_0000_4000);
        assert_eq!(rec.nlb(), 32);

        let mgmt = TraceRecord {
            opc: 0x79,
            cdw13: 0x104,
            ..sample()
        };
        assert_eq!(mgmt.zsa(), 0x4);
        assert!(mgmt.select_all());
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let mut bytes = sample().to_bytes();
        bytes[36 .. 44].copy_from_slice(b"GARBAGE\0");
        assert!(TraceRecord::from_bytes(&bytes).is_err());
    }
}
