//! Test utilities for registry and service tests
//!
//! Provides an in-process spawner that runs module services as tasks, fast
//! poll budgets, and helpers for waiting on module termination.

#![allow(dead_code)]

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use ipc_dylink::config::PollConfig;
use ipc_dylink::module::ipc::{ModuleMessage, RequestPayload, ResponseMessage};
use ipc_dylink::module::ModuleRuntime;
use ipc_dylink::{
    Capability, ExportTable, LoaderConfig, ModuleError, ModuleRegistry, ModuleService,
    ModuleSpawner, ModuleState, ServiceConfig, SocketNamespace, SpawnedModule,
    CALLING_CONVENTION,
};

pub type ServiceTask = JoinHandle<Result<ModuleState, ModuleError>>;

pub fn cap(raw: u64) -> Capability {
    Capability::new(raw).expect("non-zero capability")
}

/// Mandatory set plus `Foo`
pub fn standard_exports() -> ExportTable {
    ExportTable::new([
        ("dylink_init", cap(0x1000)),
        ("dylink_fini", cap(0x1010)),
        ("dylink_version", cap(0x1020)),
        ("Foo", cap(0xf00)),
    ])
    .unwrap()
}

/// Loader config with short budgets rooted at `dir`
pub fn fast_loader(dir: &Path) -> LoaderConfig {
    let mut config = LoaderConfig::with_channel_dir(dir);
    config.discovery = PollConfig {
        max_attempts: 100,
        delay_millis: 10,
    };
    config.release = PollConfig {
        max_attempts: 20,
        delay_millis: 25,
    };
    config
}

/// Spawner that runs each module as a task in the test runtime
#[derive(Default)]
pub struct InProcessSpawner {
    exports: HashMap<String, ExportTable>,
    service: ServiceConfig,
    publish: bool,
    spawns: AtomicUsize,
    tasks: Mutex<Vec<(String, ServiceTask)>>,
}

impl InProcessSpawner {
    pub fn new() -> Self {
        Self {
            publish: true,
            ..Self::default()
        }
    }

    /// A spawner whose "processes" never publish a channel
    pub fn silent() -> Self {
        Self::default()
    }

    pub fn with_exports(mut self, identity: &str, exports: ExportTable) -> Self {
        self.exports.insert(identity.to_string(), exports);
        self
    }

    pub fn with_service(mut self, service: ServiceConfig) -> Self {
        self.service = service;
        self
    }

    pub fn spawn_count(&self) -> usize {
        self.spawns.load(Ordering::SeqCst)
    }

    /// Remove the task serving `identity`
    pub fn take_task(&self, identity: &str) -> Option<ServiceTask> {
        let mut tasks = self.tasks.lock().unwrap();
        let index = tasks.iter().position(|(id, _)| id == identity)?;
        Some(tasks.remove(index).1)
    }
}

#[async_trait]
impl ModuleSpawner for InProcessSpawner {
    async fn spawn(
        &self,
        identity: &str,
        channel_dir: &Path,
    ) -> Result<SpawnedModule, ModuleError> {
        self.spawns.fetch_add(1, Ordering::SeqCst);
        if self.publish {
            let exports = self
                .exports
                .get(identity)
                .cloned()
                .unwrap_or_else(standard_exports);
            let service = ModuleService::new(
                identity,
                SocketNamespace::new(channel_dir),
                exports,
                self.service.clone(),
            );
            let task = tokio::spawn(service.run());
            self.tasks.lock().unwrap().push((identity.to_string(), task));
        }
        Ok(SpawnedModule::detached(identity))
    }
}

/// Registry plus the spawner and directory it runs against
pub struct Fixture {
    pub dir: TempDir,
    pub spawner: Arc<InProcessSpawner>,
    pub registry: ModuleRegistry,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_spawner(InProcessSpawner::new())
    }

    pub fn with_spawner(spawner: InProcessSpawner) -> Self {
        let dir = TempDir::new().unwrap();
        let spawner = Arc::new(spawner);
        let registry = ModuleRegistry::new(fast_loader(dir.path()), spawner.clone());
        Self {
            dir,
            spawner,
            registry,
        }
    }

    /// A second, independent registry over the same namespace
    ///
    /// Stands in for another client process sharing the running modules.
    pub fn peer_registry(&self) -> ModuleRegistry {
        ModuleRegistry::new(fast_loader(self.dir.path()), self.spawner.clone())
    }

    pub fn namespace(&self) -> SocketNamespace {
        SocketNamespace::new(self.dir.path())
    }
}

/// Run a module service for `identity` directly, outside any spawner
pub fn start_service(dir: &Path, identity: &str, exports: ExportTable) -> ServiceTask {
    let service = ModuleService::new(
        identity,
        SocketNamespace::new(dir),
        exports,
        ServiceConfig::default(),
    );
    tokio::spawn(service.run())
}

/// Wait until `identity` answers on its channel
pub async fn wait_published(namespace: &SocketNamespace, identity: &str) {
    for _ in 0..200 {
        if namespace.is_published(identity).await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{} never published", identity);
}

/// Await a service task, failing the test if it does not end promptly
pub async fn expect_terminated(task: ServiceTask) {
    let state = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("module did not terminate")
        .expect("service task panicked")
        .expect("service failed");
    assert_eq!(state, ModuleState::Terminated);
}

/// Assert a service task is still running after a short grace period
pub async fn expect_running(task: &ServiceTask) {
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!task.is_finished(), "module terminated unexpectedly");
}

/// How a `ScriptedModule` misbehaves
#[derive(Debug, Clone, Copy, Default)]
pub struct Script {
    /// Connections accepted and immediately dropped before serving any
    pub drop_connections: usize,
    /// Leave every SymbolQuery unanswered
    pub ignore_queries: bool,
}

/// Module stand-in serving one connection at a time through a
/// `ModuleRuntime`, reporting every request it reads
pub struct ScriptedModule {
    task: JoinHandle<()>,
    requests: mpsc::UnboundedReceiver<RequestPayload>,
}

impl ScriptedModule {
    /// Publish `identity` in `dir` and start serving
    pub async fn start(dir: &Path, identity: &str, script: Script) -> Self {
        let listener = SocketNamespace::new(dir).publish(identity).await.unwrap();
        let (tx, requests) = mpsc::unbounded_channel();

        let task = tokio::spawn(async move {
            let mut runtime = ModuleRuntime::new(standard_exports(), CALLING_CONVENTION, 1024);
            runtime.activate();
            let mut dropped = 0;

            while let Ok((stream, _)) = listener.accept().await {
                if dropped < script.drop_connections {
                    dropped += 1;
                    drop(stream);
                    continue;
                }

                let mut channel = Framed::new(stream, LengthDelimitedCodec::new());
                while let Some(Ok(frame)) = channel.next().await {
                    let Ok(ModuleMessage::Request(request)) = bincode::deserialize::<ModuleMessage>(&frame) else {
                        continue;
                    };
                    let _ = tx.send(request.payload.clone());
                    if script.ignore_queries
                        && matches!(request.payload, RequestPayload::SymbolQuery { .. })
                    {
                        continue;
                    }
                    let reply = ResponseMessage::success(
                        request.correlation_id,
                        runtime.handle(&request.payload),
                    );
                    let frame = ModuleMessage::Response(reply).encode().unwrap();
                    if channel.send(frame).await.is_err() {
                        break;
                    }
                }
            }
        });

        Self { task, requests }
    }

    /// Next request the module read, in arrival order
    pub async fn next_request(&mut self) -> RequestPayload {
        tokio::time::timeout(Duration::from_secs(5), self.requests.recv())
            .await
            .expect("no request reached the module")
            .expect("module task ended")
    }
}

impl Drop for ScriptedModule {
    fn drop(&mut self) {
        self.task.abort();
    }
}
