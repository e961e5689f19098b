//! Process management for modules
//!
//! Handles spawning module processes on first load.

pub mod spawner;

pub use spawner::{ModuleSpawner, ProcessSpawner, SpawnedModule};
