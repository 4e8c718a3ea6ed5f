//! Persisted per-PF state
//!
//! The engine records the last spec it applied to every PF so it can tell
//! devices it configured itself from devices set up by something else, and
//! skip devices whose spec did not change.

use crate::error::HostError;
use crate::models::PersistedPfStatus;
use crds::InterfaceSpec;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

const PCI_STORE_DIR: &str = "etc/sriov-operator/pci";

/// Storage of last-applied PF status
///
/// Every PF is stored independently, so concurrent saves for different PCI
/// addresses are safe.
#[async_trait::async_trait]
pub trait StoreManager: Send + Sync {
    /// Loads the persisted status of a PF, `None` when never applied.
    async fn load_pf_status(&self, pci_address: &str) -> Result<Option<PersistedPfStatus>, HostError>;

    /// Records `spec` as the last applied configuration of its PF.
    async fn save_last_pf_applied_status(&self, spec: &InterfaceSpec) -> Result<(), HostError>;

    /// Forgets every persisted PF.
    async fn clear_pci_address_folder(&self) -> Result<(), HostError>;
}

/// One JSON file per PCI address under `<host>/etc/sriov-operator/pci`.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Creates a store rooted at the host filesystem mount.
    pub fn new(host_root: impl AsRef<Path>) -> Self {
        Self {
            dir: host_root.as_ref().join(PCI_STORE_DIR),
        }
    }

    fn file(&self, pci_address: &str) -> PathBuf {
        self.dir.join(pci_address)
    }
}

#[async_trait::async_trait]
impl StoreManager for FileStore {
    async fn load_pf_status(&self, pci_address: &str) -> Result<Option<PersistedPfStatus>, HostError> {
        let path = self.file(pci_address);
        let raw = match fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(HostError::io(&path, e)),
        };
        Ok(Some(serde_json::from_slice(&raw)?))
    }

    async fn save_last_pf_applied_status(&self, spec: &InterfaceSpec) -> Result<(), HostError> {
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| HostError::io(&self.dir, e))?;

        let path = self.file(&spec.pci_address);
        let raw = serde_json::to_vec(&PersistedPfStatus::from_spec(spec))?;
        debug!("Persisting applied status of {}", spec.pci_address);
        fs::write(&path, raw).await.map_err(|e| HostError::io(&path, e))
    }

    async fn clear_pci_address_folder(&self) -> Result<(), HostError> {
        match fs::remove_dir_all(&self.dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(HostError::io(&self.dir, e)),
        }
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| HostError::io(&self.dir, e))
    }
}
