//! Controller objects as handed out by `probe()`. A controller owns its
//! namespaces; queue pairs are allocated from it and stop completing once
//! the controller is detached.

use std::{cell::Cell, rc::Rc};

use crate::{
    bus::DeviceConfig,
    namespace::Namespace,
    qpair::{QueuePair, QueuePairOpts},
    DriverError,
};

#[derive(Debug)]
pub struct Controller {
    name: String,
    model: String,
    serial: String,
    namespaces: Vec<Rc<Namespace>>,
    alive: Rc<Cell<bool>>,
    next_qid: Cell<u16>,
}

impl Controller {
    pub(crate) fn new(cfg: &DeviceConfig) -> Self {
        // Namespace ids start at 1, not 0.
        let namespaces = vec![Rc::new(Namespace::new(&cfg.ns, 1))];
        Self {
            name: cfg.name.clone(),
            model: format!("PMD emulated ctrlr ({})", cfg.name),
            serial: format!("PMDEMU-{:08x}", fnv1a(&cfg.name)),
            namespaces,
            alive: Rc::new(Cell::new(true)),
            next_qid: Cell::new(1),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    /// The active namespaces of this controller.
    pub fn attach(&self) -> Vec<Rc<Namespace>> {
        self.namespaces.clone()
    }

    pub fn namespace(&self, nsid: u32) -> Result<Rc<Namespace>, DriverError> {
        self.namespaces
            .iter()
            .find(|ns| ns.id() == nsid)
            .cloned()
            .ok_or_else(|| {
                crate::NamespaceNotFound {
                    name: self.name.clone(),
                    nsid,
                }
                .build()
            })
    }

    /// Drop the attachment. Outstanding commands on any queue pair of this
    /// controller can no longer complete; polling reports the loss.
    pub fn detach(&self) {
        self.alive.set(false);
    }

    pub fn is_attached(&self) -> bool {
        self.alive.get()
    }

    pub fn default_io_qpair_opts() -> QueuePairOpts {
        QueuePairOpts::default()
    }

    /// Allocate an I/O queue pair.
    pub fn alloc_io_qpair(
        &self,
        opts: QueuePairOpts,
    ) -> Result<QueuePair, DriverError> {
        if !self.alive.get() {
            return crate::DeviceLost {
                name: self.name.clone(),
            }
            .fail();
        }
        let qid = self.next_qid.get();
        self.next_qid.set(qid + 1);
        Ok(QueuePair::new(
            self.name.clone(),
            qid,
            opts,
            self.alive.clone(),
        ))
    }
}

/// Cheap stable hash for synthetic serial numbers.
fn fnv1a(s: &str) -> u32 {
    s.bytes()
        .fold(0x811c_9dc5u32, |h, b| (h ^ u32::from(b)).wrapping_mul(0x0100_0193))
}
