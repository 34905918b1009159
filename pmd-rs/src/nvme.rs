//! NVM and Zoned Namespace command-set constants shared between the driver
//! and its consumers: opcodes, zone management actions, zone states and the
//! completion status word.

use strum_macros::Display;

/// Command set identifier of a namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Csi {
    /// Conventional NVM command set.
    Nvm,
    /// Zoned namespace command set.
    Zns,
}

/// NVM and ZNS I/O command opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[repr(u16)]
pub enum NvmeOpc {
    #[strum(serialize = "FLUSH")]
    Flush = 0x00,
    #[strum(serialize = "WRITE")]
    Write = 0x01,
    #[strum(serialize = "READ")]
    Read = 0x02,
    #[strum(serialize = "WRITE UNCORRECTABLE")]
    WriteUncorrectable = 0x04,
    #[strum(serialize = "COMPARE")]
    Compare = 0x05,
    #[strum(serialize = "WRITE ZEROES")]
    WriteZeroes = 0x08,
    #[strum(serialize = "DATASET MGMT")]
    DatasetManagement = 0x09,
    #[strum(serialize = "VERIFY")]
    Verify = 0x0c,
    #[strum(serialize = "RESERVATION REGISTER")]
    ReservationRegister = 0x0d,
    #[strum(serialize = "RESERVATION REPORT")]
    ReservationReport = 0x0e,
    #[strum(serialize = "RESERVATION ACQUIRE")]
    ReservationAcquire = 0x11,
    #[strum(serialize = "RESERVATION RELEASE")]
    ReservationRelease = 0x15,
    #[strum(serialize = "COPY")]
    Copy = 0x19,
    #[strum(serialize = "ZONE MGMT SEND")]
    ZoneMgmtSend = 0x79,
    #[strum(serialize = "ZONE MGMT RECV")]
    ZoneMgmtRecv = 0x7a,
    #[strum(serialize = "ZONE APPEND")]
    ZoneAppend = 0x7d,
}

impl NvmeOpc {
    /// Map a raw opcode from the wire. Unknown opcodes are the caller's
    /// problem; a recorded trace may legitimately contain them.
    pub fn from_u16(opc: u16) -> Option<Self> {
        let opc = match opc {
            0x00 => NvmeOpc::Flush,
            0x01 => NvmeOpc::Write,
            0x02 => NvmeOpc::Read,
            0x04 => NvmeOpc::WriteUncorrectable,
            0x05 => NvmeOpc::Compare,
            0x08 => NvmeOpc::WriteZeroes,
            0x09 => NvmeOpc::DatasetManagement,
            0x0c => NvmeOpc::Verify,
            0x0d => NvmeOpc::ReservationRegister,
            0x0e => NvmeOpc::ReservationReport,
            0x11 => NvmeOpc::ReservationAcquire,
            0x15 => NvmeOpc::ReservationRelease,
            0x19 => NvmeOpc::Copy,
            0x79 => NvmeOpc::ZoneMgmtSend,
            0x7a => NvmeOpc::ZoneMgmtRecv,
            0x7d => NvmeOpc::ZoneAppend,
            _ => return None,
        };
        Some(opc)
    }
}

/// Zone Send Action (cdw13 bits 7:0 of a Zone Management Send command).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[repr(u8)]
pub enum ZoneSendAction {
    #[strum(serialize = "CLOSE ZONE")]
    Close = 0x1,
    #[strum(serialize = "FINISH ZONE")]
    Finish = 0x2,
    #[strum(serialize = "OPEN ZONE")]
    Open = 0x3,
    #[strum(serialize = "RESET ZONE")]
    Reset = 0x4,
    #[strum(serialize = "OFFLINE ZONE")]
    Offline = 0x5,
    #[strum(serialize = "SET ZONE DESC")]
    SetZde = 0x10,
}

impl ZoneSendAction {
    pub fn from_u8(zsa: u8) -> Option<Self> {
        let zsa = match zsa {
            0x1 => ZoneSendAction::Close,
            0x2 => ZoneSendAction::Finish,
            0x3 => ZoneSendAction::Open,
            0x4 => ZoneSendAction::Reset,
            0x5 => ZoneSendAction::Offline,
            0x10 => ZoneSendAction::SetZde,
            _ => return None,
        };
        Some(zsa)
    }
}

/// Zone Receive Action (cdw13 bits 7:0 of a Zone Management Receive command).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[repr(u8)]
pub enum ZoneRecvAction {
    #[strum(serialize = "REPORT ZONE")]
    Report = 0x0,
    #[strum(serialize = "EXT REPORT ZONE")]
    ExtReport = 0x1,
}

/// State of a single zone as reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ZoneState {
    #[strum(serialize = "Empty")]
    Empty,
    #[strum(serialize = "Implicit open")]
    ImplicitOpen,
    #[strum(serialize = "Explicit open")]
    ExplicitOpen,
    #[strum(serialize = "Closed")]
    Closed,
    #[strum(serialize = "Read only")]
    ReadOnly,
    #[strum(serialize = "Full")]
    Full,
    #[strum(serialize = "Offline")]
    Offline,
}

impl ZoneState {
    /// A zone counts as open (towards the max-open limit) in either open
    /// state.
    pub fn is_open(&self) -> bool {
        matches!(self, ZoneState::ImplicitOpen | ZoneState::ExplicitOpen)
    }

    /// A zone counts as active (towards the max-active limit) when open or
    /// closed.
    pub fn is_active(&self) -> bool {
        self.is_open() || *self == ZoneState::Closed
    }
}

/// Zone type. Only sequential-write-required zones exist in ZNS today.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ZoneType {
    #[strum(serialize = "SWR")]
    SeqWriteRequired,
}

/// One entry of a zone report, already parsed out of the wire format.
#[derive(Debug, Clone, Copy)]
pub struct ZoneReportDescriptor {
    pub zslba: u64,
    pub zcap: u64,
    pub wp: u64,
    pub state: ZoneState,
    pub zt: ZoneType,
}

/// Completion status as carried in the completion queue entry: a status code
/// type selecting the code set and the status code itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NvmeStatus {
    pub sct: u8,
    pub sc: u8,
}

/// Generic command status codes (SCT 0).
pub mod generic_status {
    pub const SUCCESS: u8 = 0x00;
    pub const INVALID_OPCODE: u8 = 0x01;
    pub const INVALID_FIELD: u8 = 0x02;
    pub const INTERNAL_DEVICE_ERROR: u8 = 0x06;
    pub const LBA_OUT_OF_RANGE: u8 = 0x80;
}

/// Command specific status codes (SCT 1) added by the ZNS command set.
pub mod zns_status {
    pub const ZONE_BOUNDARY_ERROR: u8 = 0xb8;
    pub const ZONE_IS_FULL: u8 = 0xb9;
    pub const ZONE_IS_READ_ONLY: u8 = 0xba;
    pub const ZONE_IS_OFFLINE: u8 = 0xbb;
    pub const ZONE_INVALID_WRITE: u8 = 0xbc;
    pub const TOO_MANY_ACTIVE_ZONES: u8 = 0xbd;
    pub const TOO_MANY_OPEN_ZONES: u8 = 0xbe;
    pub const INVALID_ZONE_STATE_TRANSITION: u8 = 0xbf;
}

impl NvmeStatus {
    pub const SUCCESS: NvmeStatus = NvmeStatus {
        sct: 0,
        sc: generic_status::SUCCESS,
    };

    pub fn generic(sc: u8) -> Self {
        Self {
            sct: 0,
            sc,
        }
    }

    pub fn zns(sc: u8) -> Self {
        Self {
            sct: 1,
            sc,
        }
    }

    pub fn is_error(&self) -> bool {
        self.sct != 0 || self.sc != 0
    }

    /// Pack into the raw completion word as recorded in a trace: bit 0 is
    /// the phase tag, bits 8:1 the status code, bits 11:9 the status code
    /// type.
    pub fn as_raw_cpl(&self) -> u32 {
        1 | (u32::from(self.sc) << 1) | (u32::from(self.sct) << 9)
    }

    pub fn from_raw_cpl(cpl: u32) -> Self {
        Self {
            sc: ((cpl >> 1) & 0xff) as u8,
            sct: ((cpl >> 9) & 0x7) as u8,
        }
    }

    /// Human readable status, mirroring the strings the NVMe base and ZNS
    /// specifications use.
    pub fn status_string(&self) -> &'static str {
        match (self.sct, self.sc) {
            (0, generic_status::SUCCESS) => "SUCCESS",
            (0, generic_status::INVALID_OPCODE) => "INVALID OPCODE",
            (0, generic_status::INVALID_FIELD) => "INVALID FIELD IN COMMAND",
            (0, generic_status::INTERNAL_DEVICE_ERROR) => {
                "INTERNAL DEVICE ERROR"
            }
            (0, generic_status::LBA_OUT_OF_RANGE) => "LBA OUT OF RANGE",
            (1, zns_status::ZONE_BOUNDARY_ERROR) => "ZONE BOUNDARY ERROR",
            (1, zns_status::ZONE_IS_FULL) => "ZONE IS FULL",
            (1, zns_status::ZONE_IS_READ_ONLY) => "ZONE IS READ ONLY",
            (1, zns_status::ZONE_IS_OFFLINE) => "ZONE IS OFFLINE",
            (1, zns_status::ZONE_INVALID_WRITE) => "ZONE INVALID WRITE",
            (1, zns_status::TOO_MANY_ACTIVE_ZONES) => "TOO MANY ACTIVE ZONES",
            (1, zns_status::TOO_MANY_OPEN_ZONES) => "TOO MANY OPEN ZONES",
            (1, zns_status::INVALID_ZONE_STATE_TRANSITION) => {
                "INVALID ZONE STATE TRANSITION"
            }
            _ => "UNKNOWN STATUS",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_word_round_trip() {
        let st = NvmeStatus::zns(zns_status::ZONE_IS_FULL);
        let raw = st.as_raw_cpl();
        assert_eq!(raw & 1, 1);
        assert_eq!(NvmeStatus::from_raw_cpl(raw), st);
        assert_eq!(st.status_string(), "ZONE IS FULL");
    }

    #[test]
    fn opcode_round_trip() {
        for opc in [0x01u16, 0x02, 0x08, 0x79, 0x7a, 0x7d] {
            assert_eq!(NvmeOpc::from_u16(opc).unwrap() as u16, opc);
        }
        assert!(NvmeOpc::from_u16(0xff).is_none());
    }
}
