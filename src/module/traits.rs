//! Module system core types
//!
//! Defines the values both sides of the protocol agree on (capabilities,
//! handshake status codes, lifecycle states) and the error taxonomy shared by
//! the client registry and the module service.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::num::NonZeroU64;
use thiserror::Error;

/// Calling-convention tag negotiated by every Open handshake.
///
/// A module built against a different layout of this protocol rejects the
/// handshake instead of serving capabilities it cannot honour.
pub const CALLING_CONVENTION: u32 = 0x444c_0001;

/// Opaque value a module exports under a name
///
/// Conceptually a function or resource handle inside the module process.
/// Never zero, so a resolved capability is always distinguishable from an
/// empty slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Capability(NonZeroU64);

impl Capability {
    /// Wrap a raw value; `None` for zero
    pub fn new(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(Self)
    }

    /// Raw capability value
    pub fn get(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Result code of an Open handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpenStatus {
    /// Module accepted the client and counted the open
    Success,
    /// Client and module disagree on the calling-convention tag
    ConventionMismatch,
    /// Module cannot accept another open reference
    ResourceExhausted,
}

impl OpenStatus {
    /// Numeric error code as reported to callers
    pub fn code(self) -> u32 {
        match self {
            OpenStatus::Success => 0,
            OpenStatus::ConventionMismatch => 1,
            OpenStatus::ResourceExhausted => 2,
        }
    }

    pub fn is_success(self) -> bool {
        self == OpenStatus::Success
    }
}

/// Module lifecycle state (module side)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModuleState {
    /// Resolving imports and publishing the channel
    Starting,
    /// Serving at least the prospect of open clients
    Active,
    /// Will terminate once no request is pending, unless reopened
    Draining,
    /// Channel withdrawn, loop exited
    Terminated,
}

/// Module system errors
#[derive(Debug, Error)]
pub enum ModuleError {
    #[error("Failed to spawn module {identity}: {reason}")]
    SpawnFailed { identity: String, reason: String },

    #[error("Module {identity} did not publish its channel after {attempts} attempts")]
    DiscoveryTimeout { identity: String, attempts: u32 },

    #[error("Module {identity} rejected handshake with code {}", .status.code())]
    HandshakeRejected { identity: String, status: OpenStatus },

    #[error("Module {identity} is missing mandatory capability {name}")]
    MandatoryCapabilityMissing { identity: String, name: String },

    #[error("Failed to create communication endpoint: {0}")]
    ChannelCreationFailed(String),

    #[error("Module {0} is already published by a live process")]
    AlreadyPublished(String),

    #[error("Invalid module identity: {0:?}")]
    InvalidIdentity(String),

    #[error("Unknown module handle: {0}")]
    UnknownHandle(String),

    #[error("Module channel closed")]
    ChannelClosed,

    #[error("Resource limit exceeded: {0}")]
    ResourceLimitExceeded(String),

    #[error("IPC communication error: {0}")]
    IpcError(String),

    #[error("Protocol violation: {0}")]
    ProtocolError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid export table: {0}")]
    InvalidExportTable(String),

    #[error("Import {symbol} from {module} could not be resolved: {reason}")]
    ImportUnresolved {
        symbol: String,
        module: String,
        reason: String,
    },
}

impl ModuleError {
    /// The peer went away mid-conversation
    pub fn is_disconnect(&self) -> bool {
        matches!(self, ModuleError::ChannelClosed)
    }
}

impl From<bincode::Error> for ModuleError {
    fn from(e: bincode::Error) -> Self {
        ModuleError::SerializationError(e.to_string())
    }
}

impl From<toml::de::Error> for ModuleError {
    fn from(e: toml::de::Error) -> Self {
        ModuleError::ConfigError(e.to_string())
    }
}
