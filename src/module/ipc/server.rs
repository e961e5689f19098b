//! Module service loop
//!
//! Runs inside each module process. Connection tasks only read and classify
//! frames; a single loop owns the `ModuleRuntime`, applies each request and
//! writes its reply before looking at the next one. Termination is checked
//! only when that loop finds the queue empty.

use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::{debug, error, info, warn};

use crate::config::ServiceConfig;
use crate::module::ipc::protocol::{decode_inbound, Inbound, ModuleMessage, ResponseMessage};
use crate::module::loader::resolve_imports;
use crate::module::manager::ModuleRegistry;
use crate::module::rendezvous::SocketNamespace;
use crate::module::runtime::ModuleRuntime;
use crate::module::tables::{ExportTable, ImportTable};
use crate::module::traits::{ModuleError, ModuleState};

type ReplyWriter = Arc<Mutex<FramedWrite<OwnedWriteHalf, LengthDelimitedCodec>>>;

/// A classified frame plus where its reply goes
struct Pending {
    connection: u64,
    reply_to: ReplyWriter,
    inbound: Inbound,
}

/// Module-side service for one identity
pub struct ModuleService {
    identity: String,
    namespace: SocketNamespace,
    config: ServiceConfig,
    runtime: ModuleRuntime,
    imports: Option<(ImportTable, Arc<ModuleRegistry>)>,
}

impl ModuleService {
    pub fn new(
        identity: impl Into<String>,
        namespace: SocketNamespace,
        exports: ExportTable,
        config: ServiceConfig,
    ) -> Self {
        let runtime = ModuleRuntime::new(exports, config.calling_convention, config.max_open_count);
        Self {
            identity: identity.into(),
            namespace,
            config,
            runtime,
            imports: None,
        }
    }

    /// Imports this module resolves before publishing its channel
    pub fn with_imports(mut self, imports: ImportTable, registry: Arc<ModuleRegistry>) -> Self {
        self.imports = Some((imports, registry));
        self
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Start, serve until drained, and tear down
    ///
    /// Returns the final state, `Terminated` on a normal exit.
    pub async fn run(mut self) -> Result<ModuleState, ModuleError> {
        info!("Starting module {}", self.identity);

        if let Some((imports, registry)) = &self.imports {
            if let Err(e) = resolve_imports(registry, imports).await {
                error!("Module {} failed to resolve imports: {}", self.identity, e);
                registry.shutdown().await;
                return Err(e);
            }
        }

        let listener = self.namespace.publish(&self.identity).await?;
        self.runtime.activate();
        info!(
            "Module {} active with {} exports",
            self.identity,
            self.runtime.exports().len()
        );

        let (tx, mut rx) = mpsc::channel::<Pending>(self.config.queue_depth);
        let acceptor = tokio::spawn(accept_loop(listener, tx, self.identity.clone()));

        loop {
            let pending = match rx.try_recv() {
                Ok(pending) => pending,
                Err(mpsc::error::TryRecvError::Empty) => {
                    if self.runtime.should_terminate() {
                        break;
                    }
                    match rx.recv().await {
                        Some(pending) => pending,
                        None => break,
                    }
                }
                Err(mpsc::error::TryRecvError::Disconnected) => break,
            };
            self.dispatch(pending).await;
        }

        acceptor.abort();
        self.namespace.withdraw(&self.identity);
        self.runtime.terminate();

        if let Some((_, registry)) = &self.imports {
            registry.shutdown().await;
        }

        info!("Module {} terminated", self.identity);
        Ok(self.runtime.state())
    }

    async fn dispatch(&mut self, pending: Pending) {
        let reply = match pending.inbound {
            Inbound::Request(request) => {
                debug!(
                    "Request {:?} (correlation_id={}) on connection {}",
                    request.payload.kind(),
                    request.correlation_id,
                    pending.connection
                );
                let payload = self.runtime.handle(&request.payload);
                ResponseMessage::success(request.correlation_id, payload)
            }
            Inbound::Faulted(correlation_id, fault) => {
                warn!(
                    "Protocol fault {:?} on connection {} (correlation_id={})",
                    fault, pending.connection, correlation_id
                );
                ResponseMessage::fault(correlation_id, fault)
            }
            Inbound::Unreadable => return,
        };

        let bytes = match ModuleMessage::Response(reply).encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("Failed to encode reply: {}", e);
                return;
            }
        };

        let write = async {
            let mut writer = pending.reply_to.lock().await;
            writer.send(bytes).await
        };
        match tokio::time::timeout(self.config.reply_timeout(), write).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("Client on connection {} gone: {}", pending.connection, e),
            Err(_) => warn!(
                "Reply to connection {} timed out after {:?}",
                pending.connection,
                self.config.reply_timeout()
            ),
        }
    }
}

/// Accept clients until aborted; dropping the `JoinSet` stops every reader
async fn accept_loop(listener: UnixListener, tx: mpsc::Sender<Pending>, identity: String) {
    let mut readers = JoinSet::new();
    let mut next_connection: u64 = 0;

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    next_connection += 1;
                    debug!("Module {} accepted connection {}", identity, next_connection);
                    readers.spawn(read_connection(stream, next_connection, tx.clone()));
                }
                Err(e) => {
                    error!("Failed to accept connection for {}: {}", identity, e);
                }
            },
            Some(_) = readers.join_next(), if !readers.is_empty() => {}
        }
    }
}

async fn read_connection(stream: UnixStream, connection: u64, tx: mpsc::Sender<Pending>) {
    let (read_half, write_half) = stream.into_split();
    let mut reader = FramedRead::new(read_half, LengthDelimitedCodec::new());
    let reply_to: ReplyWriter = Arc::new(Mutex::new(FramedWrite::new(
        write_half,
        LengthDelimitedCodec::new(),
    )));

    while let Some(frame) = reader.next().await {
        let bytes = match frame {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!("Error reading connection {}: {}", connection, e);
                break;
            }
        };

        let inbound = decode_inbound(&bytes);
        if matches!(inbound, Inbound::Unreadable) {
            warn!("Dropping unreadable frame on connection {}", connection);
            continue;
        }

        let pending = Pending {
            connection,
            reply_to: Arc::clone(&reply_to),
            inbound,
        };
        if tx.send(pending).await.is_err() {
            break;
        }
    }

    debug!("Connection {} closed", connection);
}
