//! IPC client for module channels
//!
//! One connection to one module. Requests are strictly sequential: each call
//! sends a frame and waits for the matching reply before returning.

use futures::{SinkExt, StreamExt};
use tokio::net::UnixStream;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::{debug, warn};

use crate::module::ipc::protocol::{
    CorrelationId, ModuleMessage, RequestMessage, RequestPayload, ResponseMessage,
    ResponsePayload,
};
use crate::module::traits::{Capability, ModuleError, OpenStatus};
use crate::utils::RetryConfig;

/// How a best-effort Close/Kill ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// Module acknowledged in time
    Acknowledged,
    /// Connection went away; the module is gone or going
    ChannelGone,
    /// Budget spent without either
    TimedOut,
}

/// IPC client connected to a module's rendezvous channel
pub struct ModuleIpcClient {
    /// Framed reader for receiving messages
    reader: FramedRead<tokio::net::unix::OwnedReadHalf, LengthDelimitedCodec>,
    /// Framed writer for sending messages
    writer: FramedWrite<tokio::net::unix::OwnedWriteHalf, LengthDelimitedCodec>,
    /// Next correlation ID to use
    next_correlation_id: CorrelationId,
}

impl ModuleIpcClient {
    /// Wrap a connected stream
    pub fn new(stream: UnixStream) -> Self {
        let (read_half, write_half) = stream.into_split();
        Self {
            reader: FramedRead::new(read_half, LengthDelimitedCodec::new()),
            writer: FramedWrite::new(write_half, LengthDelimitedCodec::new()),
            next_correlation_id: 1,
        }
    }

    /// Get next correlation ID
    fn next_correlation_id(&mut self) -> CorrelationId {
        let id = self.next_correlation_id;
        self.next_correlation_id = self.next_correlation_id.wrapping_add(1);
        id
    }

    async fn send(&mut self, request: RequestMessage) -> Result<CorrelationId, ModuleError> {
        let correlation_id = request.correlation_id;
        let kind = request.payload.kind();
        let bytes = ModuleMessage::Request(request).encode()?;

        self.writer.send(bytes).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::ConnectionReset => {
                ModuleError::ChannelClosed
            }
            _ => ModuleError::IpcError(format!("Failed to send request: {}", e)),
        })?;

        debug!("Sent {:?} with correlation_id={}", kind, correlation_id);
        Ok(correlation_id)
    }

    /// Read until the reply to `correlation_id` arrives
    ///
    /// Replies to earlier requests whose callers stopped waiting are skipped,
    /// so a dropped request future leaves the connection usable.
    async fn receive(&mut self, correlation_id: CorrelationId) -> Result<ResponseMessage, ModuleError> {
        loop {
            let bytes = match self.reader.next().await {
                Some(Ok(bytes)) => bytes,
                Some(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionReset => {
                    return Err(ModuleError::ChannelClosed)
                }
                Some(Err(e)) => {
                    return Err(ModuleError::IpcError(format!("Failed to read response: {}", e)))
                }
                None => return Err(ModuleError::ChannelClosed),
            };

            let message = bincode::deserialize::<ModuleMessage>(&bytes)?;
            let received = message.correlation_id();
            match message {
                ModuleMessage::Response(resp) if received == correlation_id => return Ok(resp),
                ModuleMessage::Response(_) if received < correlation_id => {
                    debug!(
                        "Skipping stale reply correlation_id={} (waiting for {})",
                        received, correlation_id
                    );
                }
                ModuleMessage::Response(_) => {
                    return Err(ModuleError::ProtocolError(format!(
                        "Correlation ID mismatch: expected {}, got {}",
                        correlation_id, received
                    )))
                }
                ModuleMessage::Request(_) => {
                    return Err(ModuleError::ProtocolError(
                        "Received request from module".to_string(),
                    ))
                }
            }
        }
    }

    /// Send a request and wait for its reply
    pub async fn request(&mut self, payload: RequestPayload) -> Result<ResponsePayload, ModuleError> {
        let correlation_id = self.next_correlation_id();
        self.send(RequestMessage {
            correlation_id,
            payload,
        })
        .await?;
        self.receive(correlation_id).await?.into_payload()
    }

    /// Open handshake
    pub async fn open(&mut self, calling_convention: u32) -> Result<OpenStatus, ModuleError> {
        match self
            .request(RequestPayload::Open { calling_convention })
            .await?
        {
            ResponsePayload::Opened { status } => Ok(status),
            other => Err(unexpected("Open", other)),
        }
    }

    /// Look up an exported capability; `None` when not exported
    pub async fn query(&mut self, name: &str) -> Result<Option<Capability>, ModuleError> {
        match self
            .request(RequestPayload::SymbolQuery {
                name: name.to_string(),
            })
            .await?
        {
            ResponsePayload::Symbol(capability) => Ok(capability),
            other => Err(unexpected("SymbolQuery", other)),
        }
    }

    /// Send Close, then wait at most `budget` for the ack or the channel to go
    pub async fn close(&mut self, budget: &RetryConfig) -> Release {
        self.release(RequestPayload::Close, budget).await
    }

    /// Send Kill, then wait at most `budget` for the ack or the channel to go
    pub async fn kill(&mut self, budget: &RetryConfig) -> Release {
        self.release(RequestPayload::Kill, budget).await
    }

    /// Fire a request whose reply is optional
    ///
    /// The wait is a series of short reads, one per attempt, so a module that
    /// crashed or already exited never holds the caller for longer than the
    /// budget.
    async fn release(&mut self, payload: RequestPayload, budget: &RetryConfig) -> Release {
        let kind = payload.kind();
        let correlation_id = self.next_correlation_id();
        match self
            .send(RequestMessage {
                correlation_id,
                payload,
            })
            .await
        {
            Ok(_) => {}
            Err(ModuleError::ChannelClosed) => return Release::ChannelGone,
            Err(e) => {
                warn!("Failed to send {:?}: {}", kind, e);
                return Release::ChannelGone;
            }
        }

        let mut delay = budget.initial_delay;
        for attempt in 1..=budget.max_attempts {
            match tokio::time::timeout(delay, self.receive(correlation_id)).await {
                Ok(Ok(_)) => return Release::Acknowledged,
                Ok(Err(ModuleError::ChannelClosed)) => return Release::ChannelGone,
                Ok(Err(e)) => {
                    warn!("Bad reply to {:?}: {}", kind, e);
                    return Release::ChannelGone;
                }
                Err(_) => {
                    debug!(
                        "No reply to {:?} yet (attempt {}/{})",
                        kind, attempt, budget.max_attempts
                    );
                }
            }
            delay = budget.next_delay(delay);
        }
        Release::TimedOut
    }
}

fn unexpected(request: &str, payload: ResponsePayload) -> ModuleError {
    ModuleError::ProtocolError(format!("Unexpected reply to {}: {:?}", request, payload))
}
