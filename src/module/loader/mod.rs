//! Startup-time loading of declared imports

pub mod resolver;

pub use resolver::resolve_imports;
