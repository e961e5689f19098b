//! Client registry and loader
//!
//! The process-local table of loaded modules. `load` attaches to a running
//! module or spawns one, performs the Open handshake and resolves the
//! mandatory capabilities; `unload` drops references and closes the module
//! when the last one goes. The whole table sits behind one async mutex, so
//! refcount changes and slot creation/destruction are serialised.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{DylinkConfig, LoaderConfig};
use crate::module::ipc::client::{ModuleIpcClient, Release};
use crate::module::process::{ModuleSpawner, ProcessSpawner, SpawnedModule};
use crate::module::rendezvous::SocketNamespace;
use crate::module::traits::{Capability, ModuleError};
use crate::utils::{poll_until, RetryConfig};

/// Reference to a loaded module, as returned by `load`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModuleHandle {
    identity: String,
    instance: Uuid,
}

impl ModuleHandle {
    fn new(identity: &str) -> Self {
        Self {
            identity: identity.to_string(),
            instance: Uuid::new_v4(),
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }
}

impl fmt::Display for ModuleHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.identity, self.instance)
    }
}

/// Read-only view of a registry slot
#[derive(Debug, Clone)]
pub struct LoadedModule {
    pub handle: ModuleHandle,
    pub refcount: usize,
    /// Tag the module accepted at Open
    pub calling_convention: u32,
    /// Mandatory capabilities cached at load time
    pub mandatory: Vec<(String, Capability)>,
    /// Pid of the module process, when this process spawned it
    pub spawned_pid: Option<u32>,
}

/// Client-side proxy for one remote module
struct ModuleInstance {
    client: ModuleIpcClient,
    calling_convention: u32,
    mandatory: Vec<(String, Capability)>,
    /// Present when this process started the module
    spawned: Option<SpawnedModule>,
}

/// One locally loaded identity
struct RegistrySlot {
    handle: ModuleHandle,
    instance: ModuleInstance,
    refcount: usize,
}

/// Process-wide registry of loaded modules
pub struct ModuleRegistry {
    config: LoaderConfig,
    namespace: SocketNamespace,
    spawner: Arc<dyn ModuleSpawner>,
    slots: Mutex<HashMap<String, RegistrySlot>>,
}

impl ModuleRegistry {
    pub fn new(config: LoaderConfig, spawner: Arc<dyn ModuleSpawner>) -> Self {
        let namespace = SocketNamespace::new(config.channel_dir());
        Self {
            config,
            namespace,
            spawner,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Registry spawning module executables as configured
    pub fn from_config(config: &DylinkConfig) -> Self {
        Self::new(
            config.loader.clone(),
            Arc::new(ProcessSpawner::from_config(config)),
        )
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    pub fn namespace(&self) -> &SocketNamespace {
        &self.namespace
    }

    /// Load `identity`, attaching to or spawning its module
    ///
    /// A second load of an identity this process already holds only bumps the
    /// refcount and returns the same handle.
    pub async fn load(&self, identity: &str) -> Result<ModuleHandle, ModuleError> {
        let mut slots = self.slots.lock().await;

        if let Some(slot) = slots.get_mut(identity) {
            slot.refcount += 1;
            debug!("Module {} refcount -> {}", identity, slot.refcount);
            return Ok(slot.handle.clone());
        }

        if slots.len() >= self.config.max_modules {
            return Err(ModuleError::ResourceLimitExceeded(format!(
                "registry holds {} modules (max {})",
                slots.len(),
                self.config.max_modules
            )));
        }

        let instance = self.open_instance(identity).await?;
        let handle = ModuleHandle::new(identity);
        info!(
            "Loaded module {} ({} mandatory capabilities{})",
            handle,
            instance.mandatory.len(),
            match instance.spawned.as_ref().and_then(SpawnedModule::id) {
                Some(pid) => format!(", spawned pid {}", pid),
                None => String::new(),
            }
        );
        slots.insert(
            identity.to_string(),
            RegistrySlot {
                handle: handle.clone(),
                instance,
                refcount: 1,
            },
        );
        Ok(handle)
    }

    /// Query a capability by name; `Ok(None)` when not exported
    pub async fn get_capability(
        &self,
        handle: &ModuleHandle,
        name: &str,
    ) -> Result<Option<Capability>, ModuleError> {
        let mut slots = self.slots.lock().await;
        let slot = live_slot(&mut slots, handle)?;
        slot.instance.client.query(name).await
    }

    /// Snapshot of the slot behind `handle`
    pub async fn describe(&self, handle: &ModuleHandle) -> Result<LoadedModule, ModuleError> {
        let mut slots = self.slots.lock().await;
        let slot = live_slot(&mut slots, handle)?;
        Ok(LoadedModule {
            handle: slot.handle.clone(),
            refcount: slot.refcount,
            calling_convention: slot.instance.calling_convention,
            mandatory: slot.instance.mandatory.clone(),
            spawned_pid: slot.instance.spawned.as_ref().and_then(SpawnedModule::id),
        })
    }

    /// Drop one reference; returns the remaining refcount
    ///
    /// At zero the slot is destroyed and Close is sent best-effort: the slot
    /// goes away whether or not the module acknowledged in time.
    pub async fn unload(&self, handle: &ModuleHandle) -> Result<usize, ModuleError> {
        let mut slots = self.slots.lock().await;
        let slot = live_slot(&mut slots, handle)?;
        slot.refcount -= 1;
        let remaining = slot.refcount;
        debug!("Module {} refcount -> {}", handle.identity, remaining);

        if remaining == 0 {
            if let Some(slot) = slots.remove(&handle.identity) {
                self.release(slot).await;
            }
        }
        Ok(remaining)
    }

    /// Force the module published under `identity` to drain
    ///
    /// Bypasses the local table; the target need not have been loaded by this
    /// process. Returns whether a live channel was found.
    pub async fn kill(&self, identity: &str) -> Result<bool, ModuleError> {
        let Some(stream) = self.namespace.discover(identity).await? else {
            debug!("Kill {}: no channel published", identity);
            return Ok(false);
        };

        let mut client = ModuleIpcClient::new(stream);
        let outcome = client.kill(&self.config.release.to_retry()).await;
        match outcome {
            Release::TimedOut => warn!("Kill {}: no acknowledgment, proceeding", identity),
            _ => info!("Kill {}: {:?}", identity, outcome),
        }
        Ok(true)
    }

    /// Poll until no module answers on `identity`, within the release budget
    pub async fn wait_for_withdrawal(&self, identity: &str) -> bool {
        let namespace = &self.namespace;
        poll_until(&self.config.release.to_retry(), |_| async move {
            (!namespace.is_published(identity).await).then_some(())
        })
        .await
        .is_some()
    }

    /// Current refcount for `identity`, if loaded
    pub async fn refcount(&self, identity: &str) -> Option<usize> {
        let slots = self.slots.lock().await;
        slots.get(identity).map(|slot| slot.refcount)
    }

    pub async fn contains(&self, identity: &str) -> bool {
        self.slots.lock().await.contains_key(identity)
    }

    /// Identities currently loaded
    pub async fn loaded(&self) -> Vec<String> {
        let slots = self.slots.lock().await;
        let mut identities: Vec<String> = slots.keys().cloned().collect();
        identities.sort();
        identities
    }

    /// Close every loaded module and empty the table
    pub async fn shutdown(&self) {
        let drained: Vec<RegistrySlot> = {
            let mut slots = self.slots.lock().await;
            slots.drain().map(|(_, slot)| slot).collect()
        };
        if !drained.is_empty() {
            info!("Shutting down registry with {} modules", drained.len());
        }
        for slot in drained {
            self.release(slot).await;
        }
    }

    async fn release(&self, mut slot: RegistrySlot) {
        let outcome = slot
            .instance
            .client
            .close(&self.config.release.to_retry())
            .await;
        match outcome {
            Release::TimedOut => warn!(
                "Module {} did not acknowledge Close, dropping slot anyway",
                slot.handle
            ),
            _ => info!("Unloaded module {} ({:?})", slot.handle, outcome),
        }
    }

    /// Attach or spawn, handshake, and resolve the mandatory set
    async fn open_instance(&self, identity: &str) -> Result<ModuleInstance, ModuleError> {
        let calling_convention = self.config.calling_convention;
        let mut retried = false;

        loop {
            let (stream, spawned) = self.attach_or_spawn(identity).await?;
            let mut client = ModuleIpcClient::new(stream);

            match client.open(calling_convention).await {
                Ok(status) if status.is_success() => {}
                Ok(status) => {
                    return Err(ModuleError::HandshakeRejected {
                        identity: identity.to_string(),
                        status,
                    })
                }
                // The module was terminating as we attached; look again once
                Err(e) if e.is_disconnect() && !retried => {
                    warn!("Module {} closed during handshake, retrying", identity);
                    retried = true;
                    continue;
                }
                Err(e) => return Err(e),
            }

            let reference = OpenReference {
                namespace: self.namespace.clone(),
                identity: identity.to_string(),
                release: self.config.release.to_retry(),
                armed: true,
            };
            let mandatory = match self.resolve_mandatory(identity, &mut client).await {
                Ok(mandatory) => mandatory,
                Err(e) => {
                    // Open already counted us; give that reference back
                    reference.disarm();
                    client.close(&self.config.release.to_retry()).await;
                    return Err(e);
                }
            };
            reference.disarm();

            return Ok(ModuleInstance {
                client,
                calling_convention,
                mandatory,
                spawned,
            });
        }
    }

    async fn resolve_mandatory(
        &self,
        identity: &str,
        client: &mut ModuleIpcClient,
    ) -> Result<Vec<(String, Capability)>, ModuleError> {
        let mut resolved = Vec::with_capacity(self.config.mandatory_capabilities.len());
        for name in &self.config.mandatory_capabilities {
            match client.query(name).await? {
                Some(capability) => resolved.push((name.clone(), capability)),
                None => {
                    return Err(ModuleError::MandatoryCapabilityMissing {
                        identity: identity.to_string(),
                        name: name.clone(),
                    })
                }
            }
        }
        Ok(resolved)
    }

    /// Connect to a published channel, spawning the module if there is none
    ///
    /// Two processes racing here may both spawn; the namespace lets only one
    /// of the new modules publish, and both clients attach to that one.
    async fn attach_or_spawn(
        &self,
        identity: &str,
    ) -> Result<(UnixStream, Option<SpawnedModule>), ModuleError> {
        if let Some(stream) = self.namespace.discover(identity).await? {
            debug!("Attaching to running module {}", identity);
            return Ok((stream, None));
        }

        let mut spawned = self.spawner.spawn(identity, self.namespace.dir()).await?;
        let budget: RetryConfig = self.config.discovery.to_retry();

        let mut delay = budget.initial_delay;
        for attempt in 1..=budget.max_attempts {
            tokio::time::sleep(delay).await;
            if let Some(stream) = self.namespace.discover(identity).await? {
                debug!("Module {} published after {} attempts", identity, attempt);
                return Ok((stream, Some(spawned)));
            }
            if let Some(status) = spawned.exited() {
                return Err(ModuleError::SpawnFailed {
                    identity: identity.to_string(),
                    reason: format!("exited with {} before publishing", status),
                });
            }
            delay = budget.next_delay(delay);
        }

        // Nobody will Open a module that publishes after we give up
        warn!(
            "Module {} did not publish in time, killing pid {:?}",
            spawned.identity(),
            spawned.id()
        );
        spawned.kill();

        Err(ModuleError::DiscoveryTimeout {
            identity: identity.to_string(),
            attempts: budget.max_attempts,
        })
    }
}

/// An accepted Open that no slot owns yet
///
/// Dropped while armed, i.e. when a `load` future is abandoned between the
/// handshake and slot creation, it gives the reference back with a Close sent
/// from a background task over a fresh connection.
struct OpenReference {
    namespace: SocketNamespace,
    identity: String,
    release: RetryConfig,
    armed: bool,
}

impl OpenReference {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for OpenReference {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(
                "Load of {} abandoned outside a runtime, open reference leaked",
                self.identity
            );
            return;
        };

        warn!("Load of {} abandoned after Open, closing", self.identity);
        let namespace = self.namespace.clone();
        let identity = std::mem::take(&mut self.identity);
        let release = self.release.clone();
        runtime.spawn(async move {
            match namespace.discover(&identity).await {
                Ok(Some(stream)) => {
                    let outcome = ModuleIpcClient::new(stream).close(&release).await;
                    debug!("Abandoned load of {}: Close {:?}", identity, outcome);
                }
                _ => debug!("Abandoned load of {}: module already gone", identity),
            }
        });
    }
}

fn live_slot<'a>(
    slots: &'a mut HashMap<String, RegistrySlot>,
    handle: &ModuleHandle,
) -> Result<&'a mut RegistrySlot, ModuleError> {
    slots
        .get_mut(&handle.identity)
        .filter(|slot| slot.handle == *handle)
        .ok_or_else(|| ModuleError::UnknownHandle(handle.to_string()))
}

impl fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleRegistry")
            .field("channel_dir", &self.namespace.dir())
            .field("max_modules", &self.config.max_modules)
            .finish()
    }
}
