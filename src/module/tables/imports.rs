//! Import tables
//!
//! A client's declarative list of capabilities to resolve at startup. Each
//! entry names the symbol, the module that owns it, and the slot the
//! resolved capability is stored into.

use std::sync::{Arc, OnceLock};

use crate::module::traits::Capability;

/// Shared write-once cell receiving one resolved capability
#[derive(Debug, Clone, Default)]
pub struct ImportSlot(Arc<OnceLock<Capability>>);

impl ImportSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolved capability, if resolution has run
    pub fn get(&self) -> Option<Capability> {
        self.0.get().copied()
    }

    /// Store a capability; a slot resolved earlier keeps its first value
    pub fn store(&self, capability: Capability) -> bool {
        self.0.set(capability).is_ok()
    }

    pub fn is_resolved(&self) -> bool {
        self.0.get().is_some()
    }
}

/// One import declaration
#[derive(Debug, Clone)]
pub struct ImportEntry {
    pub slot: ImportSlot,
    pub symbol: String,
    pub module: String,
}

/// Ordered list of imports
#[derive(Debug, Clone, Default)]
pub struct ImportTable {
    entries: Vec<ImportEntry>,
}

impl ImportTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare `symbol` from `module`, resolved into `slot`
    pub fn import(
        mut self,
        slot: &ImportSlot,
        symbol: impl Into<String>,
        module: impl Into<String>,
    ) -> Self {
        self.entries.push(ImportEntry {
            slot: slot.clone(),
            symbol: symbol.into(),
            module: module.into(),
        });
        self
    }

    pub fn entries(&self) -> &[ImportEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
