//! Host-side projection of a zoned namespace: the zone table and the
//! device-advertised limits. The dispatcher feeds every successful command
//! through [`ZoneModel::apply`] so that the final snapshot reflects what
//! the device must look like; a failed command leaves the model unchanged.

use std::rc::Rc;

use pmd_rs::{Namespace, ZoneSendAction, ZoneState, ZoneType};

/// One zone as tracked by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZoneDescriptor {
    pub zslba: u64,
    pub zcap: u64,
    /// Next LBA that may be written, absolute.
    pub wp: u64,
    pub state: ZoneState,
    pub zt: ZoneType,
}

/// A zone-touching command, as far as the model is concerned.
#[derive(Debug, Clone, Copy)]
pub enum ZoneCommand {
    /// Write or zone append of `nlb` blocks into the zone holding `slba`.
    Write { slba: u64, nlb: u32 },
    Mgmt {
        action: ZoneSendAction,
        slba: u64,
        select_all: bool,
    },
}

#[derive(Debug)]
pub struct ZoneModel {
    zone_size: u64,
    zone_cap: u64,
    zone_count: u64,
    max_open: u32,
    max_active: u32,
    /// Largest zone append payload in bytes.
    max_append_size: u64,
    zones: Vec<ZoneDescriptor>,
}

impl ZoneModel {
    /// Populate the model from an attached namespace; `None` when the
    /// namespace is not zoned. Every zone starts out Empty with the write
    /// pointer at the zone start.
    pub fn discover(ns: &Rc<Namespace>) -> Option<Self> {
        if !ns.is_zoned() {
            return None;
        }
        let zone_size = ns.zone_size_sectors();
        let zone_cap = ns.zone_capacity();
        let zones = (0 .. ns.num_zones())
            .map(|i| ZoneDescriptor {
                zslba: i * zone_size,
                zcap: zone_cap,
                wp: i * zone_size,
                state: ZoneState::Empty,
                zt: ZoneType::SeqWriteRequired,
            })
            .collect();
        Some(Self {
            zone_size,
            zone_cap,
            zone_count: ns.num_zones(),
            max_open: ns.max_open_zones(),
            max_active: ns.max_active_zones(),
            max_append_size: ns.max_zone_append_size(),
            zones,
        })
    }

    pub fn zone_size(&self) -> u64 {
        self.zone_size
    }

    pub fn zone_count(&self) -> u64 {
        self.zone_count
    }

    pub fn max_open(&self) -> u32 {
        self.max_open
    }

    pub fn max_active(&self) -> u32 {
        self.max_active
    }

    pub fn max_append_size(&self) -> u64 {
        self.max_append_size
    }

    pub fn zone_index(&self, slba: u64) -> u64 {
        slba / self.zone_size
    }

    pub fn zone(&self, index: u64) -> Option<&ZoneDescriptor> {
        self.zones.get(index as usize)
    }

    /// The whole zone table, for reports and assertions.
    pub fn snapshot(&self) -> &[ZoneDescriptor] {
        &self.zones
    }

    /// Fold the outcome of one command into the table. Only successful
    /// commands mutate state.
    pub fn apply(&mut self, cmd: &ZoneCommand, success: bool) {
        if !success {
            return;
        }
        match *cmd {
            ZoneCommand::Write { slba, nlb } => {
                self.apply_write(slba, nlb);
            }
            ZoneCommand::Mgmt {
                action,
                slba,
                select_all,
            } => {
                if select_all {
                    for i in 0 .. self.zones.len() {
                        if Self::mgmt_applies_to(
                            action,
                            self.zones[i].state,
                        ) {
                            self.apply_mgmt(action, i);
                        }
                    }
                } else if (slba / self.zone_size) < self.zone_count {
                    self.apply_mgmt(action, (slba / self.zone_size) as usize);
                }
            }
        }
    }

    fn apply_write(&mut self, slba: u64, nlb: u32) {
        let idx = (slba / self.zone_size) as usize;
        let zone = match self.zones.get_mut(idx) {
            Some(z) => z,
            None => return,
        };
        match zone.state {
            ZoneState::Full | ZoneState::ReadOnly | ZoneState::Offline => {}
            state => {
                zone.wp += u64::from(nlb);
                zone.state = if zone.wp >= zone.zslba + zone.zcap {
                    zone.wp = zone.zslba + zone.zcap;
                    ZoneState::Full
                } else if state.is_open() {
                    state
                } else {
                    ZoneState::ImplicitOpen
                };
            }
        }
    }

    /// Eligibility of a zone for a select-all action.
    fn mgmt_applies_to(action: ZoneSendAction, state: ZoneState) -> bool {
        match action {
            ZoneSendAction::Open => state == ZoneState::Closed,
            ZoneSendAction::Close => state.is_open(),
            ZoneSendAction::Finish => state.is_active(),
            ZoneSendAction::Reset => {
                state.is_active() || state == ZoneState::Full
            }
            ZoneSendAction::Offline => state == ZoneState::ReadOnly,
            ZoneSendAction::SetZde => false,
        }
    }

    fn apply_mgmt(&mut self, action: ZoneSendAction, idx: usize) {
        let zone = &mut self.zones[idx];
        match action {
            ZoneSendAction::Open => match zone.state {
                ZoneState::Empty
                | ZoneState::ImplicitOpen
                | ZoneState::ExplicitOpen
                | ZoneState::Closed => {
                    zone.state = ZoneState::ExplicitOpen;
                }
                _ => {}
            },
            ZoneSendAction::Close => {
                if zone.state.is_open() {
                    zone.state = ZoneState::Closed;
                }
            }
            ZoneSendAction::Finish => {
                if zone.state.is_active() || zone.state == ZoneState::Empty {
                    zone.state = ZoneState::Full;
                    zone.wp = zone.zslba + zone.zcap;
                }
            }
            ZoneSendAction::Reset => {
                if zone.state.is_active() || zone.state == ZoneState::Full {
                    zone.state = ZoneState::Empty;
                    zone.wp = zone.zslba;
                }
            }
            ZoneSendAction::Offline => {
                if zone.state == ZoneState::ReadOnly {
                    zone.state = ZoneState::Offline;
                }
            }
            ZoneSendAction::SetZde => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pmd_rs::{BusConfig, DeviceConfig, NamespaceConfig, ZnsConfig};

    fn model() -> ZoneModel {
        let cfg = BusConfig::new().with_device(DeviceConfig {
            name: "zns0".into(),
            ns: NamespaceConfig {
                block_size: 512,
                num_blocks: 0,
                zns: Some(ZnsConfig {
                    zone_size: 0x100,
                    zone_cap: 0x80,
                    num_zones: 4,
                    max_open: 2,
                    max_active: 4,
                    max_append_blocks: 0x40,
                }),
            },
        });
        let ctrlr = pmd_rs::probe(&cfg).unwrap().remove(0);
        let ns = ctrlr.attach().remove(0);
        ZoneModel::discover(&ns).unwrap()
    }

    #[test]
    fn discover_initializes_empty_zones() {
        let m = model();
        assert_eq!(m.zone_count(), 4);
        assert_eq!(m.max_open(), 2);
        assert!(m
            .snapshot()
            .iter()
            .all(|z| z.state == ZoneState::Empty && z.wp == z.zslba));
    }

    #[test]
    fn write_advances_wp_to_full() {
        let mut m = model();
        m.apply(
            &ZoneCommand::Write {
                slba: 0x100,
                nlb: 0x40,
            },
            true,
        );
        let z = m.zone(1).unwrap();
        assert_eq!(z.state, ZoneState::ImplicitOpen);
        assert_eq!(z.wp, 0x140);

        m.apply(
            &ZoneCommand::Write {
                slba: 0x140,
                nlb: 0x40,
            },
            true,
        );
        let z = m.zone(1).unwrap();
        assert_eq!(z.state, ZoneState::Full);
        assert_eq!(z.wp, 0x180);
    }

    #[test]
    fn failed_command_leaves_state_unchanged() {
        let mut m = model();
        m.apply(
            &ZoneCommand::Write {
                slba: 0,
                nlb: 8,
            },
            false,
        );
        assert_eq!(m.zone(0).unwrap().state, ZoneState::Empty);
        assert_eq!(m.zone(0).unwrap().wp, 0);
    }

    #[test]
    fn mgmt_transitions() {
        let mut m = model();
        let open = |slba| ZoneCommand::Mgmt {
            action: ZoneSendAction::Open,
            slba,
            select_all: false,
        };
        m.apply(&open(0), true);
        assert_eq!(m.zone(0).unwrap().state, ZoneState::ExplicitOpen);

        m.apply(
            &ZoneCommand::Mgmt {
                action: ZoneSendAction::Close,
                slba: 0,
                select_all: false,
            },
            true,
        );
        assert_eq!(m.zone(0).unwrap().state, ZoneState::Closed);

        m.apply(
            &ZoneCommand::Mgmt {
                action: ZoneSendAction::Finish,
                slba: 0,
                select_all: false,
            },
            true,
        );
        let z = m.zone(0).unwrap();
        assert_eq!(z.state, ZoneState::Full);
        assert_eq!(z.wp, 0x80);

        m.apply(
            &ZoneCommand::Mgmt {
                action: ZoneSendAction::Reset,
                slba: 0,
                select_all: false,
            },
            true,
        );
        let z = m.zone(0).unwrap();
        assert_eq!(z.state, ZoneState::Empty);
        assert_eq!(z.wp, 0);
    }

    #[test]
    fn reset_all_covers_full_zones() {
        let mut m = model();
        m.apply(
            &ZoneCommand::Write {
                slba: 0,
                nlb: 0x80,
            },
            true,
        );
        m.apply(
            &ZoneCommand::Write {
                slba: 0x100,
                nlb: 8,
            },
            true,
        );
        m.apply(
            &ZoneCommand::Mgmt {
                action: ZoneSendAction::Reset,
                slba: 0,
                select_all: true,
            },
            true,
        );
        assert!(m
            .snapshot()
            .iter()
            .all(|z| z.state == ZoneState::Empty && z.wp == z.zslba));
    }
}
