//! Module process spawning
//!
//! Starts the process expected to publish a module's channel. The spawner
//! does not wait for the channel; the registry polls discovery afterwards.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use tokio::process::{Child, Command};
use tracing::{debug, info};

use crate::config::{DylinkConfig, ModuleEntry};
use crate::module::traits::ModuleError;

/// Seam between the registry and whatever starts module processes
#[async_trait]
pub trait ModuleSpawner: Send + Sync {
    /// Start the module for `identity`, publishing into `channel_dir`
    async fn spawn(&self, identity: &str, channel_dir: &Path)
        -> Result<SpawnedModule, ModuleError>;
}

/// A started module, possibly without a child handle
#[derive(Debug)]
pub struct SpawnedModule {
    identity: String,
    child: Option<Child>,
}

impl SpawnedModule {
    /// Wrap a child process
    pub fn from_child(identity: impl Into<String>, child: Child) -> Self {
        Self {
            identity: identity.into(),
            child: Some(child),
        }
    }

    /// A module started by some means with no process to observe
    pub fn detached(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            child: None,
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn id(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    /// Send SIGKILL to the process, if there is one
    pub fn kill(&mut self) {
        if let Some(child) = self.child.as_mut() {
            if let Err(e) = child.start_kill() {
                debug!("Module {} process already gone: {}", self.identity, e);
            }
        }
    }

    /// Exit status if the process has already exited
    pub fn exited(&mut self) -> Option<ExitStatus> {
        self.child.as_mut().and_then(|child| child.try_wait().ok().flatten())
    }
}

/// Spawns module executables as child processes
pub struct ProcessSpawner {
    /// Base directory for module executables
    modules_dir: PathBuf,
    /// Per-identity overrides
    modules: HashMap<String, ModuleEntry>,
}

impl ProcessSpawner {
    pub fn new<P: AsRef<Path>>(modules_dir: P, modules: HashMap<String, ModuleEntry>) -> Self {
        Self {
            modules_dir: modules_dir.as_ref().to_path_buf(),
            modules,
        }
    }

    pub fn from_config(config: &DylinkConfig) -> Self {
        Self::new(&config.loader.modules_dir, config.modules.clone())
    }

    /// Executable that provides `identity`
    pub fn executable_for(&self, identity: &str) -> PathBuf {
        self.modules
            .get(identity)
            .and_then(|entry| entry.executable.as_ref())
            .map(PathBuf::from)
            .unwrap_or_else(|| self.modules_dir.join(identity))
    }
}

#[async_trait]
impl ModuleSpawner for ProcessSpawner {
    async fn spawn(
        &self,
        identity: &str,
        channel_dir: &Path,
    ) -> Result<SpawnedModule, ModuleError> {
        let executable = self.executable_for(identity);
        info!("Spawning module process for {}: {:?}", identity, executable);

        if !executable.is_file() {
            return Err(ModuleError::SpawnFailed {
                identity: identity.to_string(),
                reason: format!("executable not found: {:?}", executable),
            });
        }

        let mut command = Command::new(&executable);
        command
            .arg("--identity")
            .arg(identity)
            .arg("--channel-dir")
            .arg(channel_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(false);
        if let Some(entry) = self.modules.get(identity) {
            command.args(&entry.args);
        }

        debug!("Spawning process: {:?}", command);

        let child = command.spawn().map_err(|e| ModuleError::SpawnFailed {
            identity: identity.to_string(),
            reason: e.to_string(),
        })?;

        debug!("Module {} started with pid {:?}", identity, child.id());
        Ok(SpawnedModule::from_child(identity, child))
    }
}
