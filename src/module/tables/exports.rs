//! Export tables
//!
//! The static name → capability mapping a module serves through SymbolQuery.
//! Built once when the module starts and never mutated afterwards.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

use crate::module::traits::{Capability, ModuleError};

/// Capabilities every loadable module exports by default
pub const MANDATORY_EXPORTS: [&str; 3] = ["dylink_init", "dylink_fini", "dylink_version"];

/// Immutable name → capability table
#[derive(Debug, Clone, Default)]
pub struct ExportTable {
    entries: HashMap<String, Capability>,
}

/// `[exports]` section of an export file
#[derive(Debug, Deserialize)]
struct ExportFile {
    #[serde(default)]
    exports: HashMap<String, u64>,
}

impl ExportTable {
    /// Build from (name, capability) pairs, rejecting duplicate names
    pub fn new<I, S>(exports: I) -> Result<Self, ModuleError>
    where
        I: IntoIterator<Item = (S, Capability)>,
        S: Into<String>,
    {
        let mut entries = HashMap::new();
        for (name, capability) in exports {
            let name = name.into();
            if name.is_empty() {
                return Err(ModuleError::InvalidExportTable(
                    "export name cannot be empty".to_string(),
                ));
            }
            if entries.insert(name.clone(), capability).is_some() {
                return Err(ModuleError::InvalidExportTable(format!(
                    "duplicate export {}",
                    name
                )));
            }
        }
        Ok(Self { entries })
    }

    /// Parse a TOML document with an `[exports]` table of `name = value`
    pub fn from_toml_str(contents: &str) -> Result<Self, ModuleError> {
        let file: ExportFile = toml::from_str(contents)?;
        let mut pairs = Vec::with_capacity(file.exports.len());
        for (name, raw) in file.exports {
            let capability = Capability::new(raw).ok_or_else(|| {
                ModuleError::InvalidExportTable(format!("export {} has value zero", name))
            })?;
            pairs.push((name, capability));
        }
        Self::new(pairs)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ModuleError> {
        let contents = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            ModuleError::ConfigError(format!(
                "Failed to read export table {:?}: {}",
                path.as_ref(),
                e
            ))
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn lookup(&self, name: &str) -> Option<Capability> {
        self.entries.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}
