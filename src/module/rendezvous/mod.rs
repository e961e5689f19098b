//! Rendezvous channel namespace
//!
//! The host-wide directory in which modules publish their channels under
//! their identity and clients discover them.

pub mod namespace;

pub use namespace::SocketNamespace;
