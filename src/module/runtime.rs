//! Module runtime state
//!
//! The open-count / draining state machine a module process runs. Owned by
//! the single service loop; every transition happens inside `handle`.

use tracing::{debug, info};

use crate::module::ipc::protocol::{RequestPayload, ResponsePayload};
use crate::module::tables::ExportTable;
use crate::module::traits::{ModuleState, OpenStatus};

/// Lifecycle state of one module process
#[derive(Debug)]
pub struct ModuleRuntime {
    calling_convention: u32,
    max_open_count: u32,
    open_count: u32,
    draining: bool,
    state: ModuleState,
    exports: ExportTable,
}

impl ModuleRuntime {
    pub fn new(exports: ExportTable, calling_convention: u32, max_open_count: u32) -> Self {
        Self {
            calling_convention,
            max_open_count,
            open_count: 0,
            draining: false,
            state: ModuleState::Starting,
            exports,
        }
    }

    pub fn state(&self) -> ModuleState {
        self.state
    }

    pub fn open_count(&self) -> u32 {
        self.open_count
    }

    pub fn is_draining(&self) -> bool {
        self.draining
    }

    pub fn exports(&self) -> &ExportTable {
        &self.exports
    }

    /// Starting → Active, once imports are resolved and the channel is up
    pub fn activate(&mut self) {
        if self.state == ModuleState::Starting {
            self.state = ModuleState::Active;
        }
    }

    /// Draining → Terminated; only valid once the loop found nothing pending
    pub fn terminate(&mut self) {
        self.state = ModuleState::Terminated;
    }

    /// The loop is about to block with no request pending
    pub fn should_terminate(&self) -> bool {
        self.draining && self.state != ModuleState::Terminated
    }

    /// Apply one request and produce its reply
    pub fn handle(&mut self, request: &RequestPayload) -> ResponsePayload {
        match request {
            RequestPayload::Open { calling_convention } => ResponsePayload::Opened {
                status: self.open(*calling_convention),
            },
            RequestPayload::Close => {
                self.close();
                ResponsePayload::Closed {
                    open_count: self.open_count,
                }
            }
            RequestPayload::SymbolQuery { name } => {
                let capability = self.exports.lookup(name);
                debug!("SymbolQuery {} -> {:?}", name, capability);
                ResponsePayload::Symbol(capability)
            }
            RequestPayload::Kill => {
                info!("Kill requested with open_count={}", self.open_count);
                self.start_draining();
                ResponsePayload::Killed
            }
        }
    }

    fn open(&mut self, calling_convention: u32) -> OpenStatus {
        if calling_convention != self.calling_convention {
            debug!(
                "Rejecting Open: calling convention {:#x} != {:#x}",
                calling_convention, self.calling_convention
            );
            return OpenStatus::ConventionMismatch;
        }
        if self.open_count >= self.max_open_count {
            debug!("Rejecting Open: open_count at limit {}", self.max_open_count);
            return OpenStatus::ResourceExhausted;
        }

        self.open_count += 1;
        if self.draining {
            info!("Reactivated by Open while draining");
        }
        self.draining = false;
        self.state = ModuleState::Active;
        debug!("Open accepted, open_count={}", self.open_count);
        OpenStatus::Success
    }

    fn close(&mut self) {
        self.open_count = self.open_count.saturating_sub(1);
        debug!("Close, open_count={}", self.open_count);
        if self.open_count == 0 {
            self.start_draining();
        }
    }

    fn start_draining(&mut self) {
        if !self.draining {
            info!("Module draining");
        }
        self.draining = true;
        self.state = ModuleState::Draining;
    }
}
