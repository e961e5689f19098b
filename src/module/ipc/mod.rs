//! IPC (Inter-Process Communication) layer for modules
//!
//! Handles communication between clients and module processes using
//! Unix domain sockets and length-delimited binary messages.

pub mod client;
pub mod protocol;
pub mod server;

pub use client::{ModuleIpcClient, Release};
pub use protocol::{
    ModuleMessage, ProtocolFault, RequestKind, RequestMessage, RequestPayload, ResponseMessage,
    ResponsePayload,
};
pub use server::ModuleService;
