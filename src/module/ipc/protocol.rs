//! IPC message protocol
//!
//! Defines the four request kinds a client can send to a module and the
//! replies it gets back. Both sides compile against these types; frames are
//! bincode-encoded `ModuleMessage` values inside a length-delimited stream.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::module::traits::{Capability, ModuleError, OpenStatus};

/// Correlation ID for matching requests with responses
pub type CorrelationId = u64;

/// Main IPC message wrapper
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ModuleMessage {
    /// Request from client to module
    Request(RequestMessage),
    /// Response from module to client
    Response(ResponseMessage),
}

impl ModuleMessage {
    pub fn correlation_id(&self) -> CorrelationId {
        match self {
            ModuleMessage::Request(req) => req.correlation_id,
            ModuleMessage::Response(resp) => resp.correlation_id,
        }
    }

    /// Encode as a single frame body
    pub fn encode(&self) -> Result<Bytes, ModuleError> {
        Ok(Bytes::from(bincode::serialize(self)?))
    }
}

/// Request kind, for logging and dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestKind {
    Open,
    Close,
    SymbolQuery,
    Kill,
}

/// Request message from client to module
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestMessage {
    pub correlation_id: CorrelationId,
    pub payload: RequestPayload,
}

/// Request payload types
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestPayload {
    /// Negotiate compatibility and take an open reference
    Open { calling_convention: u32 },
    /// Release an open reference
    Close,
    /// Look up an exported capability by name
    SymbolQuery { name: String },
    /// Force draining regardless of open references
    Kill,
}

impl RequestPayload {
    pub fn kind(&self) -> RequestKind {
        match self {
            RequestPayload::Open { .. } => RequestKind::Open,
            RequestPayload::Close => RequestKind::Close,
            RequestPayload::SymbolQuery { .. } => RequestKind::SymbolQuery,
            RequestPayload::Kill => RequestKind::Kill,
        }
    }
}

/// Response message from module to client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseMessage {
    pub correlation_id: CorrelationId,
    pub success: bool,
    pub payload: Option<ResponsePayload>,
    pub error: Option<ProtocolFault>,
}

/// Response payload types
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponsePayload {
    /// Handshake outcome; rejections leave module state untouched
    Opened { status: OpenStatus },
    /// Close acknowledgment with the open-count after the close
    Closed { open_count: u32 },
    /// Symbol lookup result; `None` means not exported
    Symbol(Option<Capability>),
    /// Kill acknowledgment
    Killed,
}

/// Distinguishable failure for frames the module could not service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolFault {
    /// Request carried a kind this module does not understand
    UnknownRequest,
    /// Client sent something other than a request
    UnexpectedMessage,
}

/// Helper to create request messages
impl RequestMessage {
    pub fn open(correlation_id: CorrelationId, calling_convention: u32) -> Self {
        Self {
            correlation_id,
            payload: RequestPayload::Open { calling_convention },
        }
    }

    pub fn close(correlation_id: CorrelationId) -> Self {
        Self {
            correlation_id,
            payload: RequestPayload::Close,
        }
    }

    pub fn symbol_query(correlation_id: CorrelationId, name: impl Into<String>) -> Self {
        Self {
            correlation_id,
            payload: RequestPayload::SymbolQuery { name: name.into() },
        }
    }

    pub fn kill(correlation_id: CorrelationId) -> Self {
        Self {
            correlation_id,
            payload: RequestPayload::Kill,
        }
    }
}

/// Helper to create response messages
impl ResponseMessage {
    pub fn success(correlation_id: CorrelationId, payload: ResponsePayload) -> Self {
        Self {
            correlation_id,
            success: true,
            payload: Some(payload),
            error: None,
        }
    }

    pub fn fault(correlation_id: CorrelationId, fault: ProtocolFault) -> Self {
        Self {
            correlation_id,
            success: false,
            payload: None,
            error: Some(fault),
        }
    }

    /// Payload of a successful reply, or the fault as an error
    pub fn into_payload(self) -> Result<ResponsePayload, ModuleError> {
        match (self.success, self.payload) {
            (true, Some(payload)) => Ok(payload),
            _ => Err(ModuleError::ProtocolError(format!(
                "module reported {:?} for request {}",
                self.error, self.correlation_id
            ))),
        }
    }
}

/// Classified inbound frame on the module side
#[derive(Debug)]
pub enum Inbound {
    /// Well-formed request
    Request(RequestMessage),
    /// Frame the module can answer only with a fault
    Faulted(CorrelationId, ProtocolFault),
    /// Frame with no replyable shape; dropped
    Unreadable,
}

/// Decode a frame received by a module
///
/// A request whose payload kind is unknown still carries its correlation id
/// right after the `Request` variant tag, so it gets a fault reply instead of
/// being silently dropped.
pub fn decode_inbound(bytes: &[u8]) -> Inbound {
    match bincode::deserialize::<ModuleMessage>(bytes) {
        Ok(ModuleMessage::Request(request)) => Inbound::Request(request),
        Ok(ModuleMessage::Response(response)) => {
            Inbound::Faulted(response.correlation_id, ProtocolFault::UnexpectedMessage)
        }
        Err(_) => match bincode::deserialize::<(u32, CorrelationId)>(bytes) {
            Ok((0, correlation_id)) => {
                Inbound::Faulted(correlation_id, ProtocolFault::UnknownRequest)
            }
            _ => Inbound::Unreadable,
        },
    }
}
