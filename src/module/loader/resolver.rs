//! Eager import resolver
//!
//! Walks an import table at startup, loading each owning module and storing
//! the queried capability into the entry's slot. The loads taken here are
//! never released by the resolver; they live as long as the process.

use tracing::{debug, info};

use crate::module::manager::ModuleRegistry;
use crate::module::tables::ImportTable;
use crate::module::traits::ModuleError;

/// Resolve every entry of `imports` through `registry`, in order
///
/// Fails on the first entry whose module cannot be loaded or whose symbol is
/// not exported. Entries resolved before the failure keep their values, but
/// the table as a whole must be treated as unusable.
pub async fn resolve_imports(
    registry: &ModuleRegistry,
    imports: &ImportTable,
) -> Result<(), ModuleError> {
    info!("Resolving {} imports", imports.len());

    for entry in imports.entries() {
        let handle = registry
            .load(&entry.module)
            .await
            .map_err(|e| ModuleError::ImportUnresolved {
                symbol: entry.symbol.clone(),
                module: entry.module.clone(),
                reason: e.to_string(),
            })?;

        let capability = registry
            .get_capability(&handle, &entry.symbol)
            .await
            .map_err(|e| ModuleError::ImportUnresolved {
                symbol: entry.symbol.clone(),
                module: entry.module.clone(),
                reason: e.to_string(),
            })?
            .ok_or_else(|| ModuleError::ImportUnresolved {
                symbol: entry.symbol.clone(),
                module: entry.module.clone(),
                reason: "symbol not exported".to_string(),
            })?;

        entry.slot.store(capability);
        debug!("Imported {} from {} = {}", entry.symbol, entry.module, capability);
    }

    Ok(())
}
