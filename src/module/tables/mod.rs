//! Export and import tables

pub mod exports;
pub mod imports;

pub use exports::{ExportTable, MANDATORY_EXPORTS};
pub use imports::{ImportEntry, ImportSlot, ImportTable};
