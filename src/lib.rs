//! ipc-dylink - dynamic linking emulated over module processes
//!
//! On a host with no native shared-library loader, each "library" runs as an
//! independent module process. Loading a module spawns it (or attaches to the
//! running instance), resolving a symbol is a request over its channel, and
//! unloading drops a refcount that eventually lets the module drain and exit.
//!
//! ## Client side
//!
//! ```no_run
//! use ipc_dylink::{DylinkConfig, ModuleRegistry};
//!
//! # async fn example() -> Result<(), ipc_dylink::ModuleError> {
//! let registry = ModuleRegistry::from_config(&DylinkConfig::default());
//! let audio = registry.load("audio").await?;
//! let play = registry.get_capability(&audio, "Play").await?;
//! registry.unload(&audio).await?;
//! # let _ = play;
//! # Ok(())
//! # }
//! ```
//!
//! ## Module side
//!
//! A module process builds an `ExportTable` and runs a `ModuleService` until
//! every client has closed it.
//!
//! Unix only: channels are Unix domain sockets.

pub mod config;
pub mod module;
pub mod utils;

pub use config::{DylinkConfig, LoaderConfig, LoggingConfig, ModuleEntry, ServiceConfig};
pub use module::{
    resolve_imports, Capability, ExportTable, ImportSlot, ImportTable, LoadedModule,
    ModuleError, ModuleHandle, ModuleRegistry, ModuleService, ModuleSpawner, ModuleState,
    OpenStatus, ProcessSpawner, SocketNamespace, SpawnedModule, CALLING_CONVENTION,
    MANDATORY_EXPORTS,
};
