//! Module system for ipc-dylink
//!
//! Emulates dynamic linking with process-isolated modules: a module is a
//! process that publishes a rendezvous channel under its identity and answers
//! four requests (Open, Close, SymbolQuery, Kill). Clients load, query and
//! unload modules through a refcounting registry.
//!
//! ## Architecture
//!
//! - **Protocol** (`ipc::protocol`): the closed set of request/reply messages
//! - **Tables** (`tables`): static export tables and client import lists
//! - **Service** (`ipc::server`, `runtime`): the module-side request loop
//! - **Registry** (`manager`): client-side load/unload/query/kill
//! - **Resolver** (`loader`): eager import resolution at startup

pub mod ipc;
pub mod loader;
pub mod manager;
pub mod process;
pub mod rendezvous;
pub mod runtime;
pub mod tables;
pub mod traits;

pub use ipc::ModuleService;
pub use loader::resolve_imports;
pub use manager::{LoadedModule, ModuleHandle, ModuleRegistry};
pub use process::{ModuleSpawner, ProcessSpawner, SpawnedModule};
pub use rendezvous::SocketNamespace;
pub use runtime::ModuleRuntime;
pub use tables::{ExportTable, ImportSlot, ImportTable, MANDATORY_EXPORTS};
pub use traits::{Capability, ModuleError, ModuleState, OpenStatus, CALLING_CONVENTION};
