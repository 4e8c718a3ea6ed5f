//! Files exchanged with the `sriov-config` systemd service.
//!
//! In systemd mode the daemon does not touch devices itself. It writes the
//! desired configuration to the host, reboots, and the one-shot service
//! applies it early during boot and leaves a result file behind.

use crate::error::DaemonError;
use crds::{SriovNetworkNodeState, SriovNetworkNodeStateSpec, SyncResult};
use serde::{Deserialize, Serialize};
use sriov_host::SupportedNics;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

const OPERATOR_DIR: &str = "etc/sriov-operator";
const CONFIG_FILE: &str = "sriov-interface-config.yaml";
const RESULT_FILE: &str = "sriov-interface-result.yaml";
const SUPPORTED_NICS_FILE: &str = "sriov-supported-nics-ids.yaml";
const SERVICE_UNIT: &str = "etc/systemd/system/sriov-config.service";

/// Desired configuration handed to the service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct SriovConfig {
    #[serde(default)]
    pub generation: i64,
    #[serde(default)]
    pub spec: SriovNetworkNodeStateSpec,
    /// Configure NICs missing from the supported list
    #[serde(default)]
    pub unsupported_nics: bool,
}

impl SriovConfig {
    /// Whether applying `other` instead of `self` changes anything on the host.
    fn same_configuration(&self, other: &SriovConfig) -> bool {
        self.spec == other.spec && self.unsupported_nics == other.unsupported_nics
    }
}

/// The service's files under a host root.
#[derive(Debug, Clone)]
pub struct SystemdFiles {
    dir: PathBuf,
    service_unit: PathBuf,
}

impl SystemdFiles {
    pub fn new(host_root: impl AsRef<Path>) -> Self {
        let host_root = host_root.as_ref();
        Self {
            dir: host_root.join(OPERATOR_DIR),
            service_unit: host_root.join(SERVICE_UNIT),
        }
    }

    fn config_path(&self) -> PathBuf {
        self.dir.join(CONFIG_FILE)
    }

    fn result_path(&self) -> PathBuf {
        self.dir.join(RESULT_FILE)
    }

    fn supported_nics_path(&self) -> PathBuf {
        self.dir.join(SUPPORTED_NICS_FILE)
    }

    /// Whether the service unit is installed on the host.
    pub async fn service_enabled(&self) -> bool {
        fs::try_exists(&self.service_unit).await.unwrap_or(false)
    }

    /// Writes the desired configuration of `state`.
    ///
    /// Returns whether the configuration differs from the one already on
    /// disk; a new generation alone does not count. A state without
    /// interfaces removes the configuration and result files instead.
    pub async fn write_config(&self, state: &SriovNetworkNodeState, unsupported_nics: bool) -> Result<bool, DaemonError> {
        if state.spec.interfaces.is_empty() {
            debug!("No interfaces requested, removing service configuration");
            remove_if_exists(&self.config_path()).await?;
            remove_if_exists(&self.result_path()).await?;
            return Ok(false);
        }

        let config = SriovConfig {
            generation: state.generation(),
            spec: state.spec.clone(),
            unsupported_nics,
        };
        let existing = self.read_config().await?;
        let changed = !existing.as_ref().is_some_and(|existing| existing.same_configuration(&config));
        if existing.as_ref() == Some(&config) {
            return Ok(false);
        }

        write_yaml(&self.dir, &self.config_path(), &config).await?;
        if changed {
            info!("Wrote new service configuration for generation {}", config.generation);
        }
        Ok(changed)
    }

    /// Reads the desired configuration; `None` when there is none.
    pub async fn read_config(&self) -> Result<Option<SriovConfig>, DaemonError> {
        read_yaml(&self.config_path()).await
    }

    /// Reads the service result; `None` when the service has not run.
    pub async fn read_result(&self) -> Result<Option<SyncResult>, DaemonError> {
        read_yaml(&self.result_path()).await
    }

    /// Writes the service result.
    pub async fn write_result(&self, result: &SyncResult) -> Result<(), DaemonError> {
        write_yaml(&self.dir, &self.result_path(), result).await
    }

    /// Removes the service result.
    pub async fn remove_result(&self) -> Result<(), DaemonError> {
        remove_if_exists(&self.result_path()).await
    }

    /// Writes the supported NIC list for the service.
    pub async fn write_supported_nics(&self, supported: &SupportedNics) -> Result<(), DaemonError> {
        write_yaml(&self.dir, &self.supported_nics_path(), &supported.to_entries()).await
    }

    /// Reads the supported NIC list written by the daemon.
    pub async fn read_supported_nics(&self) -> Result<SupportedNics, DaemonError> {
        let entries: Vec<String> = read_yaml(&self.supported_nics_path())
            .await?
            .ok_or_else(|| DaemonError::Systemd(format!("{} does not exist", self.supported_nics_path().display())))?;
        Ok(SupportedNics::from_entries(entries)?)
    }

    /// Removes every file of the service.
    pub async fn clean(&self) -> Result<(), DaemonError> {
        remove_if_exists(&self.config_path()).await?;
        remove_if_exists(&self.result_path()).await?;
        remove_if_exists(&self.supported_nics_path()).await
    }
}

async fn read_yaml<T>(path: &Path) -> Result<Option<T>, DaemonError>
where
    T: serde::de::DeserializeOwned,
{
    match fs::read_to_string(path).await {
        Ok(content) => Ok(Some(serde_yaml::from_str(&content)?)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn write_yaml<T: Serialize>(dir: &Path, path: &Path, value: &T) -> Result<(), DaemonError> {
    fs::create_dir_all(dir).await?;
    fs::write(path, serde_yaml::to_string(value)?).await?;
    Ok(())
}

async fn remove_if_exists(path: &Path) -> Result<(), DaemonError> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::create_test_node_state;
    use crds::{InterfaceSpec, SyncStatus};
    use tempfile::TempDir;

    fn spec(num_vfs: u32) -> InterfaceSpec {
        InterfaceSpec {
            pci_address: "0000:01:00.0".to_string(),
            num_vfs,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_write_config_reports_changes() {
        let dir = TempDir::new().unwrap();
        let files = SystemdFiles::new(dir.path());

        let state = create_test_node_state("worker-0", 2, vec![spec(4)], vec![]);
        assert!(files.write_config(&state, false).await.unwrap());
        assert!(!files.write_config(&state, false).await.unwrap());

        let bumped = create_test_node_state("worker-0", 3, vec![spec(4)], vec![]);
        assert!(!files.write_config(&bumped, false).await.unwrap(), "Generation alone is no change");
        assert_eq!(files.read_config().await.unwrap().unwrap().generation, 3);

        let changed = create_test_node_state("worker-0", 4, vec![spec(8)], vec![]);
        assert!(files.write_config(&changed, false).await.unwrap());
        assert!(files.write_config(&changed, true).await.unwrap());
    }

    #[tokio::test]
    async fn test_empty_spec_removes_files() {
        let dir = TempDir::new().unwrap();
        let files = SystemdFiles::new(dir.path());
        files
            .write_config(&create_test_node_state("worker-0", 2, vec![spec(4)], vec![]), false)
            .await
            .unwrap();
        files.write_result(&SyncResult::default()).await.unwrap();

        let empty = create_test_node_state("worker-0", 3, vec![], vec![]);
        assert!(!files.write_config(&empty, false).await.unwrap());

        assert!(files.read_config().await.unwrap().is_none());
        assert!(files.read_result().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_result_round_trip_and_removal() {
        let dir = TempDir::new().unwrap();
        let files = SystemdFiles::new(dir.path());
        assert!(files.read_result().await.unwrap().is_none());

        let result = SyncResult {
            generation: 5,
            sync_status: SyncStatus::Failed,
            last_sync_error: "VF count 16 exceeds capacity".to_string(),
        };
        files.write_result(&result).await.unwrap();
        assert_eq!(files.read_result().await.unwrap(), Some(result));

        files.remove_result().await.unwrap();
        files.remove_result().await.unwrap();
        assert!(files.read_result().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_result_file_written_by_older_service() {
        let dir = TempDir::new().unwrap();
        let files = SystemdFiles::new(dir.path());
        std::fs::create_dir_all(dir.path().join(OPERATOR_DIR)).unwrap();
        std::fs::write(
            dir.path().join(OPERATOR_DIR).join(RESULT_FILE),
            "syncStatus: In Progress\nlastSyncError: \"\"\n",
        )
        .unwrap();

        let result = files.read_result().await.unwrap().unwrap();
        assert_eq!(result.sync_status, SyncStatus::InProgress);
        assert_eq!(result.generation, 0);
    }

    #[tokio::test]
    async fn test_supported_nics_and_clean() {
        let dir = TempDir::new().unwrap();
        let files = SystemdFiles::new(dir.path());
        assert!(matches!(files.read_supported_nics().await, Err(DaemonError::Systemd(_))));

        let supported = SupportedNics::default();
        files.write_supported_nics(&supported).await.unwrap();
        assert_eq!(files.read_supported_nics().await.unwrap(), supported);

        files.clean().await.unwrap();
        assert!(files.read_supported_nics().await.is_err());
    }

    #[tokio::test]
    async fn test_service_enabled() {
        let dir = TempDir::new().unwrap();
        let files = SystemdFiles::new(dir.path());
        assert!(!files.service_enabled().await);

        std::fs::create_dir_all(dir.path().join("etc/systemd/system")).unwrap();
        std::fs::write(dir.path().join(SERVICE_UNIT), "[Unit]\n").unwrap();
        assert!(files.service_enabled().await);
    }
}
