//! Main controller implementation.
//!
//! This module contains the `Controller` struct that wires the host, the
//! cluster client and the daemon's tasks together: three watchers, the
//! single reconcile worker, the status writer and the udev rule refresher.

use crate::cluster::{ClusterClient, KubeCluster};
use crate::config::{DaemonConfig, PlatformType};
use crate::error::DaemonError;
use crate::logging::LogLevelHandle;
use crate::queue::WorkQueue;
use crate::reconciler::NodeReconciler;
use crate::status::StatusWriter;
use crate::systemd::SystemdFiles;
use crate::udev::UdevRefresher;
use crate::watcher::{WatchHandlers, Watcher};
use crds::{SriovNetworkNodeState, SriovOperatorConfig};
use k8s_openapi::api::core::v1::Node;
use kube::{Api, Client};
use sriov_host::{kernel, DeviceEngine, EngineSettings, FileStore, HostInterface, Inventory, StoreManager, SysfsHost};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// The running daemon.
#[derive(Debug)]
pub struct Controller {
    node_state_watcher: JoinHandle<Result<(), DaemonError>>,
    operator_config_watcher: JoinHandle<Result<(), DaemonError>>,
    node_watcher: JoinHandle<Result<(), DaemonError>>,
    reconciler: JoinHandle<Result<(), DaemonError>>,
    status_writer: JoinHandle<Result<(), DaemonError>>,
    udev_refresher: JoinHandle<Result<(), DaemonError>>,
    queue: Arc<WorkQueue>,
    stop: watch::Receiver<bool>,
}

impl Controller {
    /// Prepares the host and starts every task.
    pub async fn new(
        config: DaemonConfig,
        log_level: LogLevelHandle,
        stop: watch::Receiver<bool>,
    ) -> Result<Self, DaemonError> {
        info!("Initializing SR-IOV config daemon for node {}", config.node_name);

        let kube_client = Client::try_default().await?;
        let cluster: Arc<dyn ClusterClient> =
            Arc::new(KubeCluster::new(kube_client.clone(), &config.node_name, &config.namespace));

        let host: Arc<dyn HostInterface> = Arc::new(SysfsHost::new(&config.sysfs_root, &config.host_root));
        let store: Arc<dyn StoreManager> = Arc::new(FileStore::new(&config.host_root));

        if !config.use_systemd_service {
            prepare_host(host.as_ref(), &config).await;
        }

        let inventory = Inventory::new(
            host.clone(),
            store.clone(),
            config.supported_nics.clone(),
            config.dev_mode,
        );
        let discovered = match config.platform {
            PlatformType::Baremetal => inventory.discover().await,
            PlatformType::Virtual => inventory.discover_virtual().await,
        };
        let initial = discovered.unwrap_or_else(|e| {
            warn!("Initial device discovery failed, starting without a snapshot: {}", e);
            Vec::new()
        });
        info!("Discovered {} SR-IOV capable interfaces", initial.len());

        let engine = DeviceEngine::new(
            host.clone(),
            store.clone(),
            &initial,
            EngineSettings {
                parallel: config.parallel_nic_config,
                ..Default::default()
            },
        );

        let (writer, publisher) = StatusWriter::new(cluster.clone(), inventory, config.platform);
        let status_writer = tokio::spawn(writer.run(stop.clone()));

        let config = Arc::new(config);
        let queue = Arc::new(WorkQueue::new());
        let reconciler_instance =
            NodeReconciler::new(config.clone(), cluster.clone(), engine, store, publisher, stop.clone());
        let handlers = Arc::new(WatchHandlers::new(
            queue.clone(),
            reconciler_instance.disable_drain_flag(),
            log_level,
        ));
        let reconciler = tokio::spawn(reconciler_instance.run(queue.clone()));

        let watcher_instance = Arc::new(Watcher::new(
            handlers,
            &config.node_name,
            Api::<SriovNetworkNodeState>::namespaced(kube_client.clone(), &config.namespace),
            Api::<SriovOperatorConfig>::namespaced(kube_client.clone(), &config.namespace),
            Api::<Node>::all(kube_client),
        ));

        let node_state_watcher = {
            let watcher = watcher_instance.clone();
            let stop = stop.clone();
            tokio::spawn(async move { watcher.watch_node_state(stop).await })
        };

        let operator_config_watcher = {
            let watcher = watcher_instance.clone();
            let stop = stop.clone();
            tokio::spawn(async move { watcher.watch_operator_config(stop).await })
        };

        let node_watcher = {
            let watcher = watcher_instance;
            let stop = stop.clone();
            tokio::spawn(async move { watcher.watch_node(stop).await })
        };

        let udev_refresher = tokio::spawn(UdevRefresher::new(cluster, host).run(stop.clone()));

        Ok(Self {
            node_state_watcher,
            operator_config_watcher,
            node_watcher,
            reconciler,
            status_writer,
            udev_refresher,
            queue,
            stop,
        })
    }

    /// Runs until the stop signal or until a task fails.
    pub async fn run(mut self) -> Result<(), DaemonError> {
        info!("SR-IOV config daemon running");

        let stopped = tokio::select! {
            result = &mut self.node_state_watcher => {
                result.map_err(|e| DaemonError::Watch(format!("SriovNetworkNodeState watcher panicked: {}", e)))?
                    .map_err(|e| DaemonError::Watch(format!("SriovNetworkNodeState watcher error: {}", e)))?;
                false
            }
            result = &mut self.operator_config_watcher => {
                result.map_err(|e| DaemonError::Watch(format!("SriovOperatorConfig watcher panicked: {}", e)))?
                    .map_err(|e| DaemonError::Watch(format!("SriovOperatorConfig watcher error: {}", e)))?;
                false
            }
            result = &mut self.node_watcher => {
                result.map_err(|e| DaemonError::Watch(format!("Node watcher panicked: {}", e)))?
                    .map_err(|e| DaemonError::Watch(format!("Node watcher error: {}", e)))?;
                false
            }
            result = &mut self.reconciler => {
                result.map_err(|e| DaemonError::Watch(format!("Reconciler panicked: {}", e)))??;
                false
            }
            result = &mut self.status_writer => {
                result.map_err(|e| DaemonError::Watch(format!("Status writer panicked: {}", e)))??;
                false
            }
            result = &mut self.udev_refresher => {
                result.map_err(|e| DaemonError::Watch(format!("Udev refresher panicked: {}", e)))??;
                false
            }
            _ = wait_for_stop(&mut self.stop) => true,
        };

        // Tasks that noticed the stop first end the select too.
        if stopped || *self.stop.borrow() {
            info!("Stop requested, waiting for the reconciler to finish");
            self.queue.shutdown();
            match self.reconciler.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Reconciler stopped with an error: {}", e),
                Err(e) => warn!("Reconciler did not stop cleanly: {}", e),
            }
        }

        Ok(())
    }
}

/// Loads the kernel modules the devices need and removes files left over
/// from systemd mode.
async fn prepare_host(host: &dyn HostInterface, config: &DaemonConfig) {
    for (module, result) in [
        ("rdma", kernel::try_enable_rdma(host).await),
        ("tun", kernel::try_enable_tun(host).await),
        ("vhost_net", kernel::try_enable_vhost_net(host).await),
    ] {
        if let Err(e) = result {
            warn!("Failed to enable {}: {}", module, e);
        }
    }

    if let Err(e) = SystemdFiles::new(&config.host_root).clean().await {
        warn!("Failed to remove stale sriov-config service files: {}", e);
    }
}

async fn wait_for_stop(stop: &mut watch::Receiver<bool>) {
    while !*stop.borrow() {
        if stop.changed().await.is_err() {
            return;
        }
    }
}
