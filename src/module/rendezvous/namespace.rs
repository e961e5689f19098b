//! Socket-directory rendezvous namespace
//!
//! Maps a module identity to `<dir>/<identity>.sock`. Publishing binds a Unix
//! listener there, discovery connects to it, withdrawal removes the file.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};

use crate::module::traits::ModuleError;

/// Directory of rendezvous sockets
#[derive(Debug, Clone)]
pub struct SocketNamespace {
    dir: PathBuf,
}

impl SocketNamespace {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Socket path for `identity`
    pub fn socket_path(&self, identity: &str) -> Result<PathBuf, ModuleError> {
        validate_identity(identity)?;
        Ok(self.dir.join(format!("{}.sock", identity)))
    }

    /// Publish a channel under `identity`
    ///
    /// Fails with `AlreadyPublished` when a live module already answers on
    /// the socket. A socket file nobody listens on is stale and replaced.
    pub async fn publish(&self, identity: &str) -> Result<UnixListener, ModuleError> {
        let path = self.socket_path(identity)?;

        std::fs::create_dir_all(&self.dir).map_err(|e| {
            ModuleError::ChannelCreationFailed(format!(
                "Failed to create channel directory {:?}: {}",
                self.dir, e
            ))
        })?;

        if path.exists() {
            match UnixStream::connect(&path).await {
                Ok(_) => return Err(ModuleError::AlreadyPublished(identity.to_string())),
                Err(e) => {
                    debug!("Removing stale channel {:?} ({})", path, e);
                    remove_stale(&path)?;
                }
            }
        }

        let listener = UnixListener::bind(&path).map_err(|e| match e.kind() {
            ErrorKind::AddrInUse => ModuleError::AlreadyPublished(identity.to_string()),
            _ => ModuleError::ChannelCreationFailed(format!(
                "Failed to bind socket {:?}: {}",
                path, e
            )),
        })?;

        info!("Published channel for {} at {:?}", identity, path);
        Ok(listener)
    }

    /// Connect to the channel published under `identity`, if any
    pub async fn discover(&self, identity: &str) -> Result<Option<UnixStream>, ModuleError> {
        let path = self.socket_path(identity)?;
        match UnixStream::connect(&path).await {
            Ok(stream) => {
                debug!("Discovered channel for {}", identity);
                Ok(Some(stream))
            }
            Err(e) if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::ConnectionRefused) => {
                Ok(None)
            }
            Err(e) => Err(ModuleError::ChannelCreationFailed(format!(
                "Failed to connect to {:?}: {}",
                path, e
            ))),
        }
    }

    /// Whether some process currently answers on `identity`
    pub async fn is_published(&self, identity: &str) -> bool {
        matches!(self.discover(identity).await, Ok(Some(_)))
    }

    /// Remove the channel for `identity`; only its publisher calls this
    pub fn withdraw(&self, identity: &str) {
        let Ok(path) = self.socket_path(identity) else {
            return;
        };
        if let Err(e) = std::fs::remove_file(&path) {
            if e.kind() != ErrorKind::NotFound {
                warn!("Failed to remove socket file {:?}: {}", path, e);
            }
        }
        info!("Withdrew channel for {}", identity);
    }
}

/// Identities become file names, so keep them to one plain path component
/// Remove a socket file nobody answers on; already gone counts as removed
fn remove_stale(path: &Path) -> Result<(), ModuleError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(ModuleError::ChannelCreationFailed(format!(
            "Failed to remove stale socket {:?}: {}",
            path, e
        ))),
    }
}

fn validate_identity(identity: &str) -> Result<(), ModuleError> {
    if identity.is_empty()
        || identity.starts_with('.')
        || identity.contains('/')
        || identity.contains('\0')
    {
        return Err(ModuleError::InvalidIdentity(identity.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_identity_validation() {
        let ns = SocketNamespace::new("/tmp");
        assert!(ns.socket_path("audio").is_ok());
        for bad in ["", ".hidden", "a/b", "nul\0"] {
            assert!(matches!(
                ns.socket_path(bad),
                Err(ModuleError::InvalidIdentity(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_discover_absent() {
        let dir = TempDir::new().unwrap();
        let ns = SocketNamespace::new(dir.path());
        assert!(ns.discover("audio").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_publish_discover_withdraw() {
        let dir = TempDir::new().unwrap();
        let ns = SocketNamespace::new(dir.path().join("channels"));

        let _listener = ns.publish("audio").await.unwrap();
        assert!(ns.is_published("audio").await);

        ns.withdraw("audio");
        assert!(!ns.socket_path("audio").unwrap().exists());
        assert!(ns.discover("audio").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_second_publisher_loses() {
        let dir = TempDir::new().unwrap();
        let ns = SocketNamespace::new(dir.path());

        let _winner = ns.publish("audio").await.unwrap();
        assert!(matches!(
            ns.publish("audio").await,
            Err(ModuleError::AlreadyPublished(_))
        ));
    }

    #[tokio::test]
    async fn test_stale_socket_is_replaced() {
        let dir = TempDir::new().unwrap();
        let ns = SocketNamespace::new(dir.path());

        drop(ns.publish("audio").await.unwrap());
        assert!(ns.socket_path("audio").unwrap().exists());

        let _listener = ns.publish("audio").await.unwrap();
        assert!(ns.is_published("audio").await);
    }

    #[test]
    fn test_stale_socket_removed_by_someone_else() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("audio.sock");

        std::fs::write(&path, b"").unwrap();
        remove_stale(&path).unwrap();
        assert!(!path.exists());

        // A racing publisher already removed it
        remove_stale(&path).unwrap();
    }
}
