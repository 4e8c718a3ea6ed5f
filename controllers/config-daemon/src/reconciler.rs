//! Node state reconciler.
//!
//! Applies the node's `SriovNetworkNodeState` one generation at a time:
//! asks the plugins what the change requires, drains (or waits for a drain
//! slot) when needed, applies the plugins, then either reboots or restarts
//! the device plugin and releases the node. Every pass ends with a status
//! hand-off to the status writer.

use crate::cluster::{node_drain_state, node_has_drain_state, ClusterClient};
use crate::config::{ClusterType, DaemonConfig};
use crate::drain::{pod_key, DrainSettings, Drainer};
use crate::error::DaemonError;
use crate::mcp::{McpPauser, McpSettings};
use crate::plugins::Plugins;
use crate::queue::WorkQueue;
use crate::status::StatusPublisher;
use crate::systemd::SystemdFiles;
use crds::{DrainState, SriovNetworkNodeState, SyncStatus};
use k8s_openapi::api::core::v1::Node;
use sriov_host::{DeviceEngine, StoreManager};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Event reason for reboots.
pub const REBOOT_EVENT_REASON: &str = "RebootNode";

const SERVICE_UNAVAILABLE: &str = "sriov-config systemd service is not available on the node";

/// Poll interval while waiting for a deleted device plugin pod to go away.
pub const DEVICE_PLUGIN_POLL_INTERVAL: Duration = Duration::from_secs(3);

/// Timing of the reconciler's waits.
#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    /// Eviction retries and the overall drain timeout.
    pub drain: DrainSettings,
    /// Machine config pool poll interval and timeout.
    pub mcp: McpSettings,
    /// Poll interval while a deleted device plugin pod terminates.
    pub device_plugin_poll: Duration,
}

impl ReconcilerSettings {
    /// Default timings with the configured drain timeout.
    pub fn from_config(config: &DaemonConfig) -> Self {
        Self {
            drain: DrainSettings::with_timeout(config.drain_timeout),
            mcp: McpSettings::default(),
            device_plugin_poll: DEVICE_PLUGIN_POLL_INTERVAL,
        }
    }
}

/// Reconciles the daemon's node state.
pub struct NodeReconciler {
    config: Arc<DaemonConfig>,
    cluster: Arc<dyn ClusterClient>,
    engine: DeviceEngine,
    store: Arc<dyn StoreManager>,
    plugins: Option<Plugins>,
    publisher: StatusPublisher,
    systemd: SystemdFiles,
    drainer: Drainer,
    mcp: McpPauser,
    disable_drain: Arc<AtomicBool>,
    device_plugin_poll: Duration,
    last_generation: i64,
    stop: watch::Receiver<bool>,
}

impl std::fmt::Debug for NodeReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeReconciler")
            .field("node", &self.config.node_name)
            .field("last_generation", &self.last_generation)
            .field("plugins", &self.plugins)
            .finish()
    }
}

impl NodeReconciler {
    pub fn new(
        config: Arc<DaemonConfig>,
        cluster: Arc<dyn ClusterClient>,
        engine: DeviceEngine,
        store: Arc<dyn StoreManager>,
        publisher: StatusPublisher,
        stop: watch::Receiver<bool>,
    ) -> Self {
        let settings = ReconcilerSettings::from_config(&config);
        Self {
            systemd: SystemdFiles::new(&config.host_root),
            drainer: Drainer::new(cluster.clone(), settings.drain),
            mcp: McpPauser::new(cluster.clone(), settings.mcp),
            device_plugin_poll: settings.device_plugin_poll,
            config,
            cluster,
            engine,
            store,
            plugins: None,
            publisher,
            disable_drain: Arc::new(AtomicBool::new(false)),
            last_generation: 0,
            stop,
        }
    }

    /// Overrides the timing of drains, pool pauses and pod restarts.
    pub fn with_settings(mut self, settings: ReconcilerSettings) -> Self {
        self.drainer = Drainer::new(self.cluster.clone(), settings.drain);
        self.mcp = McpPauser::new(self.cluster.clone(), settings.mcp);
        self.device_plugin_poll = settings.device_plugin_poll;
        self
    }

    /// Flag the operator config watcher flips to disable drains.
    pub fn disable_drain_flag(&self) -> Arc<AtomicBool> {
        self.disable_drain.clone()
    }

    /// Works through queued generations until the queue shuts down.
    pub async fn run(mut self, queue: Arc<WorkQueue>) -> Result<(), DaemonError> {
        info!("Starting node reconciler for {}", self.config.node_name);
        while let Some(generation) = queue.get().await {
            self.process_next_item(&queue, generation).await;
        }
        info!("Node reconciler stopped");
        Ok(())
    }

    /// Reconciles once. A failure is published and the generation requeued
    /// with backoff; a success clears the backoff.
    pub async fn process_next_item(&mut self, queue: &WorkQueue, generation: i64) {
        debug!("Processing generation {}", generation);
        match self.sync().await {
            Ok(()) => queue.forget(),
            Err(e) => {
                error!("Failed to reconcile generation {}: {}", generation, e);
                if let Err(publish_err) = self.publisher.publish(SyncStatus::Failed, &e.to_string()).await {
                    error!("Failed to publish the sync failure: {}", publish_err);
                }
                queue.add_rate_limited(generation);
            }
        }
    }

    /// Brings the node to the latest generation of its node state.
    pub async fn sync(&mut self) -> Result<(), DaemonError> {
        let state = self.cluster.get_node_state().await?;
        let latest = state.generation();
        let current = state.status.as_ref().and_then(|status| status.sync_status);
        let current_error = state
            .status
            .as_ref()
            .and_then(|status| status.last_sync_error.clone())
            .unwrap_or_default();

        if self.config.use_systemd_service && !self.systemd.service_enabled().await {
            error!("{}", SERVICE_UNAVAILABLE);
            if current != Some(SyncStatus::Failed) || current_error != SERVICE_UNAVAILABLE {
                self.publisher.publish(SyncStatus::Failed, SERVICE_UNAVAILABLE).await?;
            }
            return Ok(());
        }

        if latest == self.last_generation {
            debug!("Generation {} already applied", latest);
            let (sync_status, sync_error) = self.settled_status().await?;
            if current != Some(sync_status) || current_error != sync_error {
                self.publisher.publish(sync_status, &sync_error).await?;
            }
            return Ok(());
        }

        if latest == 1 && state.spec.interfaces.is_empty() {
            info!("Node state has no interfaces yet, nothing to apply");
            self.store.clear_pci_address_folder().await?;
            self.last_generation = latest;
            if current != Some(SyncStatus::Succeeded) {
                self.publisher.publish(SyncStatus::Succeeded, "").await?;
            }
            return Ok(());
        }

        info!("Applying generation {} (last applied {})", latest, self.last_generation);
        self.publisher.publish(SyncStatus::InProgress, "").await?;
        // The status write above carries a fresh scan of the devices.
        let state = self.cluster.get_node_state().await?;

        let mut plugins = match self.plugins.take() {
            Some(plugins) => plugins,
            None => Plugins::load(&self.config, self.engine.clone()),
        };
        let result = self.apply_generation(&state, &mut plugins).await;
        self.plugins = Some(plugins);
        result
    }

    async fn apply_generation(&mut self, state: &SriovNetworkNodeState, plugins: &mut Plugins) -> Result<(), DaemonError> {
        let systemd_mode = self.config.use_systemd_service;

        let mut verdict = plugins.on_node_state_change(state, !systemd_mode).await?;
        if systemd_mode {
            if self.systemd.write_config(state, self.config.dev_mode).await? {
                info!("Service configuration changed, the node must reboot to apply it");
                self.systemd.remove_result().await?;
                verdict.drain_required = true;
                verdict.reboot_required = true;
            }
            self.systemd.write_supported_nics(&self.config.supported_nics).await?;
        }
        info!(
            "Drain required: {}, reboot required: {}",
            verdict.drain_required, verdict.reboot_required
        );

        let node = self.cluster.get_node().await?;
        if node_has_drain_state(&node, DrainState::DrainRequired) {
            info!("Waiting for the drain request to be granted");
            return Ok(());
        }

        if verdict.drain_required && !self.drain_node(node).await? {
            return Ok(());
        }

        plugins.apply_auxiliary().await?;
        if !verdict.reboot_required && !systemd_mode {
            plugins.apply_primary().await?;
        }

        if verdict.reboot_required {
            info!("Rebooting node {}", self.config.node_name);
            if let Err(e) = self
                .cluster
                .publish_event(REBOOT_EVENT_REASON, "Reboot node has been initiated")
                .await
            {
                warn!("Failed to record reboot event: {}", e);
            }
            self.engine.host().reboot_node().await?;
            return Ok(());
        }

        self.restart_device_plugin().await?;

        let node = self.cluster.get_node().await?;
        if node_drain_state(&node).is_draining() {
            self.complete_drain(node).await?;
        } else if !node_has_drain_state(&node, DrainState::Idle) {
            self.cluster.annotate_node(&node, DrainState::Idle).await?;
        }

        self.last_generation = state.generation();
        let (sync_status, sync_error) = self.settled_status().await?;
        info!("Generation {} done: {}", self.last_generation, sync_status);
        self.publisher.publish(sync_status, &sync_error).await
    }

    /// Status of an applied generation.
    ///
    /// In systemd mode this mirrors the service's result file.
    async fn settled_status(&self) -> Result<(SyncStatus, String), DaemonError> {
        if !self.config.use_systemd_service {
            return Ok((SyncStatus::Succeeded, String::new()));
        }
        if !self.systemd.service_enabled().await {
            return Ok((SyncStatus::Failed, SERVICE_UNAVAILABLE.to_string()));
        }
        match self.systemd.read_result().await? {
            Some(result) if result.is_failed() || !result.last_sync_error.is_empty() => {
                Ok((SyncStatus::Failed, result.last_sync_error))
            }
            Some(result) => Ok((result.sync_status, String::new())),
            None => Ok((SyncStatus::InProgress, String::new())),
        }
    }

    /// Drains the node. Returns false when the node only asked for a drain
    /// slot and the reconcile has to wait for it.
    async fn drain_node(&self, mut node: Node) -> Result<bool, DaemonError> {
        let disable_drain = self.disable_drain.load(Ordering::Relaxed);
        let draining = node_drain_state(&node).is_draining();

        if !draining && !disable_drain && self.config.cluster_type == ClusterType::Kubernetes {
            info!("Requesting a drain for node {}", self.config.node_name);
            self.cluster.annotate_node(&node, DrainState::DrainRequired).await?;
            return Ok(false);
        }

        if self.config.uses_machine_config_pools() {
            let pool = self.mcp.pool_name(&node).await?;
            node = self.mcp.pause(&pool, node).await?;
        }

        if disable_drain {
            info!("Drain is disabled, skipping it");
            return Ok(true);
        }

        if !node_drain_state(&node).is_draining() {
            self.cluster.annotate_node(&node, DrainState::Draining).await?;
        }
        self.drainer.drain().await?;
        Ok(true)
    }

    /// Uncordons the node, resumes its pool and marks it idle.
    async fn complete_drain(&self, node: Node) -> Result<(), DaemonError> {
        if !self.disable_drain.load(Ordering::Relaxed) {
            self.drainer.uncordon().await?;
        }

        if self.config.uses_machine_config_pools() && node_has_drain_state(&node, DrainState::McpPaused) {
            let pool = self.mcp.pool_name(&node).await?;
            self.mcp.resume(&pool).await?;
        }

        let node = self.cluster.get_node().await?;
        self.cluster.annotate_node(&node, DrainState::Idle).await?;
        info!("Node {} is idle again", self.config.node_name);
        Ok(())
    }

    /// Deletes the device plugin pods on the node and waits for them to go
    /// away, so the device plugin is recreated and picks up the new VFs.
    async fn restart_device_plugin(&self) -> Result<(), DaemonError> {
        let pods = self.cluster.list_device_plugin_pods().await?;
        if pods.is_empty() {
            info!("No device plugin pod on the node");
            return Ok(());
        }

        let mut stop = self.stop.clone();
        for pod in pods.iter() {
            let (namespace, name) = pod_key(pod);
            info!("Restarting device plugin pod {}/{}", namespace, name);
            self.cluster.delete_pod(namespace, name).await?;

            while self.cluster.pod_exists(namespace, name).await? {
                if *stop.borrow() {
                    info!("Stop requested while waiting for pod {}/{}", namespace, name);
                    return Ok(());
                }
                debug!("Waiting for device plugin pod {}/{} to go away", namespace, name);
                tokio::select! {
                    _ = sleep(self.device_plugin_poll) => {}
                    changed = stop.changed() => {
                        if changed.is_err() {
                            return Ok(());
                        }
                    }
                }
            }
        }
        Ok(())
    }
}
