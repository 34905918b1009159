//! Namespace geometry and the RAM-backed media behind it. For zoned
//! namespaces the device-side zone state machine lives here: write-pointer
//! tracking, zone transitions, open/active resource accounting and the
//! status codes a real ZNS device returns on violations.

use std::cell::RefCell;

use crate::{
    bus::NamespaceConfig,
    nvme::{
        generic_status,
        zns_status,
        Csi,
        NvmeStatus,
        ZoneReportDescriptor,
        ZoneSendAction,
        ZoneState,
        ZoneType,
    },
};

/// Largest single transfer the emulated controller accepts, in bytes.
const MAX_IO_XFER_SIZE: u64 = 128 * 1024;

#[derive(Debug, Clone)]
struct ZnsGeometry {
    /// Zone size in sectors; zones are laid out back to back.
    zone_size: u64,
    /// Writable capacity of each zone, `zone_cap <= zone_size`.
    zone_cap: u64,
    num_zones: u64,
    max_open: u32,
    max_active: u32,
    /// Largest zone append payload in bytes.
    max_append_bytes: u64,
}

#[derive(Debug, Clone, Copy)]
struct DeviceZone {
    wp: u64,
    state: ZoneState,
}

/// An active namespace on an attached controller.
#[derive(Debug)]
pub struct Namespace {
    nsid: u32,
    csi: Csi,
    block_size: u32,
    num_blocks: u64,
    zns: Option<ZnsGeometry>,
    media: RefCell<Vec<u8>>,
    zones: RefCell<Vec<DeviceZone>>,
}

impl Namespace {
    pub(crate) fn new(cfg: &NamespaceConfig, nsid: u32) -> Self {
        let (csi, num_blocks, zns) = match &cfg.zns {
            Some(z) => {
                let geometry = ZnsGeometry {
                    zone_size: z.zone_size,
                    zone_cap: z.zone_cap.min(z.zone_size),
                    num_zones: z.num_zones,
                    max_open: z.max_open,
                    max_active: z.max_active,
                    max_append_bytes: z.max_append_blocks
                        * u64::from(cfg.block_size),
                };
                (Csi::Zns, z.num_zones * z.zone_size, Some(geometry))
            }
            None => (Csi::Nvm, cfg.num_blocks, None),
        };

        let zones = match &zns {
            Some(g) => (0 .. g.num_zones)
                .map(|i| DeviceZone {
                    wp: i * g.zone_size,
                    state: ZoneState::Empty,
                })
                .collect(),
            None => Vec::new(),
        };

        Self {
            nsid,
            csi,
            block_size: cfg.block_size,
            num_blocks,
            zns,
            media: RefCell::new(vec![
                0;
                (num_blocks * u64::from(cfg.block_size))
                    as usize
            ]),
            zones: RefCell::new(zones),
        }
    }

    pub fn id(&self) -> u32 {
        self.nsid
    }

    pub fn csi(&self) -> Csi {
        self.csi
    }

    pub fn is_zoned(&self) -> bool {
        self.csi == Csi::Zns
    }

    pub fn sector_size(&self) -> u32 {
        self.block_size
    }

    pub fn num_sectors(&self) -> u64 {
        self.num_blocks
    }

    pub fn size_in_bytes(&self) -> u64 {
        self.num_blocks * u64::from(self.block_size)
    }

    /// Largest transfer for a single read/write/write-zeroes command, in
    /// bytes.
    pub fn max_io_xfer_size(&self) -> u64 {
        MAX_IO_XFER_SIZE
    }

    pub fn zone_size_sectors(&self) -> u64 {
        self.zns.as_ref().map_or(0, |g| g.zone_size)
    }

    pub fn zone_capacity(&self) -> u64 {
        self.zns.as_ref().map_or(0, |g| g.zone_cap)
    }

    pub fn num_zones(&self) -> u64 {
        self.zns.as_ref().map_or(0, |g| g.num_zones)
    }

    /// Maximum number of zones in an open state; 0 means unlimited.
    pub fn max_open_zones(&self) -> u32 {
        self.zns.as_ref().map_or(0, |g| g.max_open)
    }

    /// Maximum number of active (open or closed) zones; 0 means unlimited.
    pub fn max_active_zones(&self) -> u32 {
        self.zns.as_ref().map_or(0, |g| g.max_active)
    }

    /// Largest zone append payload in bytes.
    pub fn max_zone_append_size(&self) -> u64 {
        self.zns.as_ref().map_or(0, |g| g.max_append_bytes)
    }

    fn byte_range(&self, slba: u64, nlb: u32) -> std::ops::Range<usize> {
        let bs = u64::from(self.block_size);
        let start = (slba * bs) as usize;
        let end = ((slba + u64::from(nlb)) * bs) as usize;
        start .. end
    }

    fn in_bounds(&self, slba: u64, nlb: u32) -> bool {
        slba.checked_add(u64::from(nlb))
            .map_or(false, |end| end <= self.num_blocks)
    }

    fn zone_of(&self, slba: u64) -> Option<DeviceZone> {
        let g = self.zns.as_ref()?;
        self.zones
            .borrow()
            .get((slba / g.zone_size) as usize)
            .copied()
    }

    pub(crate) fn execute_read(
        &self,
        slba: u64,
        nlb: u32,
        buf: &mut [u8],
    ) -> NvmeStatus {
        if !self.in_bounds(slba, nlb) {
            return NvmeStatus::generic(generic_status::LBA_OUT_OF_RANGE);
        }
        if let Some(zone) = self.zone_of(slba) {
            if zone.state == ZoneState::Offline {
                return NvmeStatus::zns(zns_status::ZONE_IS_OFFLINE);
            }
        }
        let range = self.byte_range(slba, nlb);
        buf[.. range.len()].copy_from_slice(&self.media.borrow()[range]);
        NvmeStatus::SUCCESS
    }

    pub(crate) fn execute_write(
        &self,
        slba: u64,
        nlb: u32,
        buf: Option<&[u8]>,
    ) -> (NvmeStatus, u64) {
        if !self.in_bounds(slba, nlb) {
            return (
                NvmeStatus::generic(generic_status::LBA_OUT_OF_RANGE),
                0,
            );
        }
        match self.csi {
            Csi::Nvm => {
                self.copy_in(slba, nlb, buf);
                (NvmeStatus::SUCCESS, 0)
            }
            Csi::Zns => self.zns_write(slba, nlb, buf, false),
        }
    }

    pub(crate) fn execute_zone_append(
        &self,
        zslba: u64,
        nlb: u32,
        buf: Option<&[u8]>,
    ) -> (NvmeStatus, u64) {
        let g = match &self.zns {
            Some(g) => g,
            None => {
                return (
                    NvmeStatus::generic(generic_status::INVALID_OPCODE),
                    0,
                );
            }
        };
        if zslba % g.zone_size != 0 || !self.in_bounds(zslba, nlb) {
            return (NvmeStatus::generic(generic_status::INVALID_FIELD), 0);
        }
        if u64::from(nlb) * u64::from(self.block_size) > g.max_append_bytes {
            return (NvmeStatus::generic(generic_status::INVALID_FIELD), 0);
        }
        self.zns_write(zslba, nlb, buf, true)
    }

    /// The shared ZNS write path. For appends the data lands at the write
    /// pointer; for writes `slba` must equal it.
    fn zns_write(
        &self,
        slba: u64,
        nlb: u32,
        buf: Option<&[u8]>,
        append: bool,
    ) -> (NvmeStatus, u64) {
        let g = self.zns.as_ref().unwrap();
        let zidx = (slba / g.zone_size) as usize;
        let zslba = zidx as u64 * g.zone_size;

        let zone = self.zones.borrow()[zidx];
        match zone.state {
            ZoneState::Offline => {
                return (NvmeStatus::zns(zns_status::ZONE_IS_OFFLINE), 0);
            }
            ZoneState::ReadOnly => {
                return (NvmeStatus::zns(zns_status::ZONE_IS_READ_ONLY), 0);
            }
            ZoneState::Full => {
                return (NvmeStatus::zns(zns_status::ZONE_IS_FULL), 0);
            }
            _ => {}
        }

        let wp = zone.wp;
        let target = if append { wp } else { slba };
        if !append && slba != wp {
            return (NvmeStatus::zns(zns_status::ZONE_INVALID_WRITE), 0);
        }
        if target + u64::from(nlb) > zslba + g.zone_cap {
            return (NvmeStatus::zns(zns_status::ZONE_BOUNDARY_ERROR), 0);
        }
        if !zone.state.is_open() {
            if let Some(err) = self.check_zone_resources(zone.state) {
                return (err, 0);
            }
        }

        self.copy_in(target, nlb, buf);

        let mut zones = self.zones.borrow_mut();
        let zone = &mut zones[zidx];
        zone.wp = target + u64::from(nlb);
        zone.state = if zone.wp == zslba + g.zone_cap {
            ZoneState::Full
        } else if zone.state.is_open() {
            zone.state
        } else {
            ZoneState::ImplicitOpen
        };
        (NvmeStatus::SUCCESS, target)
    }

    pub(crate) fn execute_write_zeroes(
        &self,
        slba: u64,
        nlb: u32,
    ) -> (NvmeStatus, u64) {
        self.execute_write(slba, nlb, None)
    }

    fn copy_in(&self, slba: u64, nlb: u32, buf: Option<&[u8]>) {
        let range = self.byte_range(slba, nlb);
        let mut media = self.media.borrow_mut();
        match buf {
            Some(data) => {
                let len = range.len();
                media[range].copy_from_slice(&data[.. len]);
            }
            None => media[range].iter_mut().for_each(|b| *b = 0),
        }
    }

    /// Open/active accounting for a zone about to leave `state` for an open
    /// state.
    fn check_zone_resources(&self, state: ZoneState) -> Option<NvmeStatus> {
        let g = self.zns.as_ref().unwrap();
        let zones = self.zones.borrow();
        let open = zones.iter().filter(|z| z.state.is_open()).count() as u32;
        let active =
            zones.iter().filter(|z| z.state.is_active()).count() as u32;
        if g.max_open != 0 && open + 1 > g.max_open {
            return Some(NvmeStatus::zns(zns_status::TOO_MANY_OPEN_ZONES));
        }
        if g.max_active != 0 && !state.is_active() && active + 1 > g.max_active
        {
            return Some(NvmeStatus::zns(zns_status::TOO_MANY_ACTIVE_ZONES));
        }
        None
    }

    pub(crate) fn execute_zone_mgmt(
        &self,
        action: ZoneSendAction,
        slba: u64,
        select_all: bool,
    ) -> NvmeStatus {
        let g = match &self.zns {
            Some(g) => g,
            None => return NvmeStatus::generic(generic_status::INVALID_OPCODE),
        };
        if select_all {
            return self.zone_mgmt_all(action);
        }
        if slba % g.zone_size != 0 || slba >= self.num_blocks {
            return NvmeStatus::generic(generic_status::INVALID_FIELD);
        }
        let zidx = (slba / g.zone_size) as usize;
        self.zone_mgmt_one(action, zidx)
    }

    fn zone_mgmt_one(&self, action: ZoneSendAction, zidx: usize) -> NvmeStatus {
        let g = self.zns.as_ref().unwrap();
        let zslba = zidx as u64 * g.zone_size;
        let state = self.zones.borrow()[zidx].state;

        let invalid =
            NvmeStatus::zns(zns_status::INVALID_ZONE_STATE_TRANSITION);

        let next = match action {
            ZoneSendAction::Open => match state {
                ZoneState::ExplicitOpen => return NvmeStatus::SUCCESS,
                ZoneState::Empty
                | ZoneState::ImplicitOpen
                | ZoneState::Closed => {
                    if !state.is_open() {
                        if let Some(err) = self.check_zone_resources(state) {
                            return err;
                        }
                    }
                    (ZoneState::ExplicitOpen, None)
                }
                _ => return invalid,
            },
            ZoneSendAction::Close => match state {
                ZoneState::Closed => return NvmeStatus::SUCCESS,
                ZoneState::ImplicitOpen | ZoneState::ExplicitOpen => {
                    (ZoneState::Closed, None)
                }
                _ => return invalid,
            },
            ZoneSendAction::Finish => match state {
                ZoneState::Full => return NvmeStatus::SUCCESS,
                ZoneState::Empty
                | ZoneState::ImplicitOpen
                | ZoneState::ExplicitOpen
                | ZoneState::Closed => {
                    (ZoneState::Full, Some(zslba + g.zone_cap))
                }
                _ => return invalid,
            },
            ZoneSendAction::Reset => match state {
                ZoneState::Empty => return NvmeStatus::SUCCESS,
                ZoneState::ImplicitOpen
                | ZoneState::ExplicitOpen
                | ZoneState::Closed
                | ZoneState::Full => (ZoneState::Empty, Some(zslba)),
                _ => return invalid,
            },
            ZoneSendAction::Offline => match state {
                ZoneState::Offline => return NvmeStatus::SUCCESS,
                ZoneState::ReadOnly => (ZoneState::Offline, None),
                _ => return invalid,
            },
            ZoneSendAction::SetZde => {
                // No zone descriptor extensions on the emulated device.
                return NvmeStatus::generic(generic_status::INVALID_FIELD);
            }
        };

        let mut zones = self.zones.borrow_mut();
        zones[zidx].state = next.0;
        if let Some(wp) = next.1 {
            zones[zidx].wp = wp;
        }
        drop(zones);

        if action == ZoneSendAction::Reset {
            // A reset deallocates the zone; reads return zeroes again.
            self.copy_in(zslba, g.zone_cap as u32, None);
        }
        NvmeStatus::SUCCESS
    }

    /// Select-all variant: the action applies to every zone in an eligible
    /// state and never fails on a per-zone basis.
    fn zone_mgmt_all(&self, action: ZoneSendAction) -> NvmeStatus {
        let g = self.zns.as_ref().unwrap();
        let eligible: Vec<usize> = {
            let zones = self.zones.borrow();
            zones
                .iter()
                .enumerate()
                .filter(|(_, z)| match action {
                    ZoneSendAction::Open => z.state == ZoneState::Closed,
                    ZoneSendAction::Close => z.state.is_open(),
                    ZoneSendAction::Finish => z.state.is_active(),
                    ZoneSendAction::Reset => {
                        z.state.is_active() || z.state == ZoneState::Full
                    }
                    ZoneSendAction::Offline => {
                        z.state == ZoneState::ReadOnly
                    }
                    ZoneSendAction::SetZde => false,
                })
                .map(|(i, _)| i)
                .collect()
        };
        if action == ZoneSendAction::Open
            && g.max_open != 0
            && eligible.len() as u32 > g.max_open
        {
            return NvmeStatus::zns(zns_status::TOO_MANY_OPEN_ZONES);
        }
        for zidx in eligible {
            let status = self.zone_mgmt_one(action, zidx);
            debug_assert!(!status.is_error());
        }
        NvmeStatus::SUCCESS
    }

    /// Zone report starting at the zone containing `slba`; `max` of zero
    /// reports to the end of the namespace.
    pub(crate) fn report(
        &self,
        slba: u64,
        max: u64,
    ) -> Vec<ZoneReportDescriptor> {
        let g = match &self.zns {
            Some(g) => g,
            None => return Vec::new(),
        };
        let first = (slba / g.zone_size) as usize;
        let zones = self.zones.borrow();
        let limit = if max == 0 { zones.len() } else { max as usize };
        zones
            .iter()
            .enumerate()
            .skip(first)
            .take(limit)
            .map(|(i, z)| ZoneReportDescriptor {
                zslba: i as u64 * g.zone_size,
                zcap: g.zone_cap,
                wp: z.wp,
                state: z.state,
                zt: ZoneType::SeqWriteRequired,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{NamespaceConfig, ZnsConfig};

    fn zns_ns() -> Namespace {
        Namespace::new(
            &NamespaceConfig {
                block_size: 512,
                num_blocks: 0,
                zns: Some(ZnsConfig {
                    zone_size: 0x100,
                    zone_cap: 0x80,
                    num_zones: 4,
                    max_open: 2,
                    max_active: 3,
                    max_append_blocks: 0x40,
                }),
            },
            1,
        )
    }

    #[test]
    fn append_advances_wp_until_full() {
        let ns = zns_ns();
        let data = vec![7u8; 0x40 * 512];
        let mut wp = 0;
        for _ in 0 .. 2 {
            let (st, lba) = ns.execute_zone_append(0, 0x40, Some(&data));
            assert!(!st.is_error());
            assert_eq!(lba, wp);
            wp += 0x40;
        }
        let report = ns.report(0, 1);
        assert_eq!(report[0].state, ZoneState::Full);
        assert_eq!(report[0].wp, 0x80);

        let (st, _) = ns.execute_zone_append(0, 1, Some(&data));
        assert_eq!(st, NvmeStatus::zns(zns_status::ZONE_IS_FULL));
    }

    #[test]
    fn write_must_match_wp() {
        let ns = zns_ns();
        let data = vec![1u8; 512];
        let (st, _) = ns.execute_write(0x101, 1, Some(&data));
        assert_eq!(st, NvmeStatus::zns(zns_status::ZONE_INVALID_WRITE));
        let (st, _) = ns.execute_write(0x100, 1, Some(&data));
        assert!(!st.is_error());
    }

    #[test]
    fn open_limit_is_enforced() {
        let ns = zns_ns();
        let data = vec![1u8; 512];
        assert!(!ns.execute_write(0x000, 1, Some(&data)).0.is_error());
        assert!(!ns.execute_write(0x100, 1, Some(&data)).0.is_error());
        let (st, _) = ns.execute_write(0x200, 1, Some(&data));
        assert_eq!(st, NvmeStatus::zns(zns_status::TOO_MANY_OPEN_ZONES));
    }

    #[test]
    fn reset_all_empties_every_zone() {
        let ns = zns_ns();
        let data = vec![3u8; 512];
        ns.execute_write(0, 1, Some(&data));
        ns.execute_write(0x100, 1, Some(&data));
        let st = ns.execute_zone_mgmt(ZoneSendAction::Reset, 0, true);
        assert!(!st.is_error());
        assert!(ns
            .report(0, 0)
            .iter()
            .all(|z| z.state == ZoneState::Empty && z.wp == z.zslba));

        let mut out = vec![0xffu8; 512];
        ns.execute_read(0, 1, &mut out);
        assert!(out.iter().all(|b| *b == 0));
    }

    #[test]
    fn finish_moves_wp_to_capacity() {
        let ns = zns_ns();
        let st = ns.execute_zone_mgmt(ZoneSendAction::Finish, 0x100, false);
        assert!(!st.is_error());
        let z = ns.report(0x100, 1)[0];
        assert_eq!(z.state, ZoneState::Full);
        assert_eq!(z.wp, 0x100 + 0x80);
    }

    #[test]
    fn conventional_ns_bounds_check() {
        let ns = Namespace::new(
            &NamespaceConfig {
                block_size: 512,
                num_blocks: 0x100,
                zns: None,
            },
            1,
        );
        let data = vec![9u8; 512];
        let (st, _) = ns.execute_write(0xff, 1, Some(&data));
        assert!(!st.is_error());
        let (st, _) = ns.execute_write(0x100, 1, Some(&data));
        assert_eq!(
            st,
            NvmeStatus::generic(generic_status::LBA_OUT_OF_RANGE)
        );
        let mut out = vec![0u8; 512];
        assert!(!ns.execute_read(0xff, 1, &mut out).is_error());
        assert_eq!(out[0], 9);
    }
}
