//! The single opcode routing table. Every consumer that needs to know what
//! a recorded command means — the dispatcher, the analyzer, the event dump —
//! resolves the opcode here instead of keeping its own switch.

use pmd_rs::NvmeOpc;

/// How the dispatcher re-issues a recorded command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayAction {
    /// Read into a scratch buffer at the recorded LBA.
    Read,
    /// Write a constant payload at the recorded LBA; coerced to a zone
    /// append on zoned namespaces.
    Write,
    /// Write-zeroes at the recorded LBA, no buffer.
    WriteZeroes,
    /// Zone append at the start of the recorded LBA's zone.
    ZoneAppend,
    /// Decode the zone send action and dispatch it.
    ZoneMgmtSend,
    /// Not replayed; counted.
    Skip,
}

/// Read/write classification used by the analyzer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RwClass {
    Read,
    Write,
    Other,
}

#[derive(Debug, Clone, Copy)]
pub struct OpcodeEntry {
    pub opc: NvmeOpc,
    pub action: ReplayAction,
    pub class: RwClass,
    pub needs_buffer: bool,
}

const fn entry(
    opc: NvmeOpc,
    action: ReplayAction,
    class: RwClass,
    needs_buffer: bool,
) -> OpcodeEntry {
    OpcodeEntry {
        opc,
        action,
        class,
        needs_buffer,
    }
}

static OPCODE_TABLE: &[OpcodeEntry] = &[
    entry(NvmeOpc::Flush, ReplayAction::Skip, RwClass::Other, false),
    entry(NvmeOpc::Write, ReplayAction::Write, RwClass::Write, true),
    entry(NvmeOpc::Read, ReplayAction::Read, RwClass::Read, true),
    entry(
        NvmeOpc::WriteUncorrectable,
        ReplayAction::Skip,
        RwClass::Other,
        false,
    ),
    entry(NvmeOpc::Compare, ReplayAction::Read, RwClass::Read, true),
    entry(
        NvmeOpc::WriteZeroes,
        ReplayAction::WriteZeroes,
        RwClass::Other,
        false,
    ),
    entry(
        NvmeOpc::DatasetManagement,
        ReplayAction::Skip,
        RwClass::Other,
        false,
    ),
    entry(NvmeOpc::Verify, ReplayAction::Skip, RwClass::Other, false),
    entry(
        NvmeOpc::ReservationRegister,
        ReplayAction::Skip,
        RwClass::Other,
        false,
    ),
    entry(
        NvmeOpc::ReservationReport,
        ReplayAction::Skip,
        RwClass::Other,
        false,
    ),
    entry(
        NvmeOpc::ReservationAcquire,
        ReplayAction::Skip,
        RwClass::Other,
        false,
    ),
    entry(
        NvmeOpc::ReservationRelease,
        ReplayAction::Skip,
        RwClass::Other,
        false,
    ),
    entry(NvmeOpc::Copy, ReplayAction::Skip, RwClass::Other, false),
    entry(
        NvmeOpc::ZoneMgmtSend,
        ReplayAction::ZoneMgmtSend,
        RwClass::Other,
        false,
    ),
    entry(
        NvmeOpc::ZoneMgmtRecv,
        ReplayAction::Skip,
        RwClass::Other,
        false,
    ),
    entry(
        NvmeOpc::ZoneAppend,
        ReplayAction::ZoneAppend,
        RwClass::Write,
        true,
    ),
];

/// Look a raw opcode up in the routing table. `None` marks the record as
/// malformed.
pub fn lookup_opcode(opc: u16) -> Option<&'static OpcodeEntry> {
    let opc = NvmeOpc::from_u16(opc)?;
    OPCODE_TABLE.iter().find(|e| e.opc == opc)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_known_opcode_is_routed() {
        for opc in [
            0x00u16, 0x01, 0x02, 0x04, 0x05, 0x08, 0x09, 0x0c, 0x0d, 0x0e,
            0x11, 0x15, 0x19, 0x79, 0x7a, 0x7d,
        ] {
            assert!(lookup_opcode(opc).is_some(), "opcode {:#x}", opc);
        }
        assert!(lookup_opcode(0x42).is_none());
    }

    #[test]
    fn classification_matches_replay_semantics() {
        assert_eq!(lookup_opcode(0x02).unwrap().class, RwClass::Read);
        assert_eq!(lookup_opcode(0x05).unwrap().class, RwClass::Read);
        assert_eq!(lookup_opcode(0x01).unwrap().class, RwClass::Write);
        assert_eq!(lookup_opcode(0x7d).unwrap().class, RwClass::Write);
        assert_eq!(lookup_opcode(0x08).unwrap().class, RwClass::Other);
        assert!(!lookup_opcode(0x08).unwrap().needs_buffer);
    }
}
