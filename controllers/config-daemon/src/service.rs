//! One-shot `service` mode.
//!
//! Run by the `sriov-config` systemd unit early during boot. Applies the
//! configuration the daemon left on the host and records the outcome in the
//! result file, which the daemon publishes once it is running again.

use crate::config::{DaemonConfig, PlatformType};
use crate::plugins::{PrimaryPlugin, VendorPlugin};
use crate::systemd::SystemdFiles;
use anyhow::{Context, Result};
use crds::{SriovNetworkNodeState, SriovNetworkNodeStateStatus, SyncResult, SyncStatus};
use sriov_host::{kernel, DeviceEngine, EngineSettings, FileStore, HostInterface, Inventory, StoreManager, SysfsHost};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Runs the service against the real host.
pub async fn run(config: &DaemonConfig) -> Result<()> {
    let host: Arc<dyn HostInterface> = Arc::new(SysfsHost::new(&config.sysfs_root, &config.host_root));
    let store: Arc<dyn StoreManager> = Arc::new(FileStore::new(&config.host_root));
    let files = SystemdFiles::new(&config.host_root);
    run_with(config, &files, host, store).await
}

/// Runs the service with explicit collaborators.
pub async fn run_with(
    config: &DaemonConfig,
    files: &SystemdFiles,
    host: Arc<dyn HostInterface>,
    store: Arc<dyn StoreManager>,
) -> Result<()> {
    info!("Starting sriov-config service");

    let supported = match files.read_supported_nics().await {
        Ok(supported) => supported,
        Err(e) => {
            let message = format!("failed to read the supported NIC list: {}", e);
            write_result(files, 0, SyncStatus::Failed, &message).await?;
            anyhow::bail!(message);
        }
    };

    let sriov_config = files
        .read_config()
        .await
        .context("failed to read the service configuration")?
        .unwrap_or_default();
    let generation = sriov_config.generation;

    for (module, result) in [
        ("rdma", kernel::try_enable_rdma(host.as_ref()).await),
        ("tun", kernel::try_enable_tun(host.as_ref()).await),
        ("vhost_net", kernel::try_enable_vhost_net(host.as_ref()).await),
    ] {
        if let Err(e) = result {
            warn!("Failed to enable {}: {}", module, e);
        }
    }

    let inventory = Inventory::new(
        host.clone(),
        store.clone(),
        supported,
        config.dev_mode || sriov_config.unsupported_nics,
    );
    let discovered = match config.platform {
        PlatformType::Baremetal => inventory.discover().await,
        PlatformType::Virtual => inventory.discover_virtual().await,
    };
    let observed = match discovered {
        Ok(observed) => observed,
        Err(e) => {
            let message = format!("failed to discover SR-IOV devices: {}", e);
            write_result(files, generation, SyncStatus::Failed, &message).await?;
            anyhow::bail!(message);
        }
    };

    write_result(files, generation, SyncStatus::InProgress, "").await?;

    let engine = DeviceEngine::new(
        host,
        store,
        &observed,
        EngineSettings {
            parallel: config.parallel_nic_config,
            ..Default::default()
        },
    );
    let mut plugin = PrimaryPlugin::for_platform(config, engine);

    let mut state = SriovNetworkNodeState::new(&config.node_name, sriov_config.spec);
    state.metadata.generation = Some(generation);
    state.status = Some(SriovNetworkNodeStateStatus {
        interfaces: observed,
        ..Default::default()
    });

    let applied = async {
        plugin.on_node_state_change(&state).await?;
        plugin.apply().await
    }
    .await;

    match applied {
        Ok(()) => {
            info!("Configuration of generation {} applied", generation);
            write_result(files, generation, SyncStatus::Succeeded, "").await
        }
        Err(e) => {
            error!("Failed to apply configuration of generation {}: {}", generation, e);
            write_result(files, generation, SyncStatus::Failed, &e.to_string()).await?;
            Err(e).context("failed to apply the SR-IOV configuration")
        }
    }
}

async fn write_result(files: &SystemdFiles, generation: i64, sync_status: SyncStatus, error: &str) -> Result<()> {
    files
        .write_result(&SyncResult {
            generation,
            sync_status,
            last_sync_error: error.to_string(),
        })
        .await
        .context("failed to write the service result")
}
