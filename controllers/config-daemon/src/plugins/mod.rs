//! Vendor plugins.
//!
//! A plugin inspects a desired node state, tells the reconciler whether
//! applying it needs a drain or a reboot, and then applies it. Exactly one
//! primary plugin is active, picked by platform. Auxiliary plugins handle
//! vendor specifics on top of it and are always applied first.

mod generic;
mod rdma;
mod virtual_plugin;

pub use generic::GenericPlugin;
pub use rdma::RdmaPlugin;
pub use virtual_plugin::VirtualPlugin;

use crate::config::{DaemonConfig, PlatformType};
use crate::error::DaemonError;
use async_trait::async_trait;
use crds::SriovNetworkNodeState;
use sriov_host::DeviceEngine;
use tracing::{debug, info};

/// What applying a node state demands from the node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PluginVerdict {
    /// Workloads must be evicted first
    pub drain_required: bool,
    /// The node must reboot for the change to take effect
    pub reboot_required: bool,
}

impl PluginVerdict {
    /// Combines two verdicts; any plugin can demand a drain or reboot.
    pub fn merge(self, other: PluginVerdict) -> PluginVerdict {
        PluginVerdict {
            drain_required: self.drain_required || other.drain_required,
            reboot_required: self.reboot_required || other.reboot_required,
        }
    }
}

/// A plugin configuring part of the node.
///
/// `on_node_state_change` records the state to apply; `apply` applies the
/// most recently recorded one.
#[async_trait]
pub trait VendorPlugin: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Inspects the desired state and reports what applying it requires.
    async fn on_node_state_change(&mut self, state: &SriovNetworkNodeState) -> Result<PluginVerdict, DaemonError>;

    /// Applies the last inspected state.
    async fn apply(&mut self) -> Result<(), DaemonError>;
}

/// The primary plugin, selected once by platform.
pub enum PrimaryPlugin {
    Generic(GenericPlugin),
    Virtual(VirtualPlugin),
}

impl PrimaryPlugin {
    /// Primary plugin for the configured platform.
    pub fn for_platform(config: &DaemonConfig, engine: DeviceEngine) -> Self {
        match config.platform {
            PlatformType::Baremetal => {
                PrimaryPlugin::Generic(GenericPlugin::new(engine, config.required_kernel_args.clone()))
            }
            PlatformType::Virtual => PrimaryPlugin::Virtual(VirtualPlugin::new(engine)),
        }
    }
}

#[async_trait]
impl VendorPlugin for PrimaryPlugin {
    fn name(&self) -> &str {
        match self {
            PrimaryPlugin::Generic(plugin) => plugin.name(),
            PrimaryPlugin::Virtual(plugin) => plugin.name(),
        }
    }

    async fn on_node_state_change(&mut self, state: &SriovNetworkNodeState) -> Result<PluginVerdict, DaemonError> {
        match self {
            PrimaryPlugin::Generic(plugin) => plugin.on_node_state_change(state).await,
            PrimaryPlugin::Virtual(plugin) => plugin.on_node_state_change(state).await,
        }
    }

    async fn apply(&mut self) -> Result<(), DaemonError> {
        match self {
            PrimaryPlugin::Generic(plugin) => plugin.apply().await,
            PrimaryPlugin::Virtual(plugin) => plugin.apply().await,
        }
    }
}

/// The plugins loaded for this node.
pub struct Plugins {
    pub primary: PrimaryPlugin,
    pub auxiliary: Vec<Box<dyn VendorPlugin>>,
}

impl std::fmt::Debug for Plugins {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let auxiliary: Vec<&str> = self.auxiliary.iter().map(|plugin| plugin.name()).collect();
        f.debug_struct("Plugins")
            .field("primary", &self.primary.name())
            .field("auxiliary", &auxiliary)
            .finish()
    }
}

impl Plugins {
    /// Loads the primary plugin and the auxiliary plugins registered for the platform.
    pub fn load(config: &DaemonConfig, engine: DeviceEngine) -> Self {
        let mut auxiliary: Vec<Box<dyn VendorPlugin>> = Vec::new();
        if config.platform == PlatformType::Baremetal {
            auxiliary.push(Box::new(RdmaPlugin::new(engine.host().clone())));
        }
        let primary = PrimaryPlugin::for_platform(config, engine);

        let plugins = Self { primary, auxiliary };
        info!("Loaded plugins: {:?}", plugins);
        plugins
    }

    /// Runs `on_node_state_change` on the auxiliary plugins, and on the
    /// primary one when `include_primary` is set. Verdicts are OR-combined.
    pub async fn on_node_state_change(
        &mut self,
        state: &SriovNetworkNodeState,
        include_primary: bool,
    ) -> Result<PluginVerdict, DaemonError> {
        let mut verdict = PluginVerdict::default();
        for plugin in self.auxiliary.iter_mut() {
            let plugin_verdict = plugin.on_node_state_change(state).await?;
            debug!("Plugin {} verdict: {:?}", plugin.name(), plugin_verdict);
            verdict = verdict.merge(plugin_verdict);
        }
        if include_primary {
            let plugin_verdict = self.primary.on_node_state_change(state).await?;
            debug!("Plugin {} verdict: {:?}", self.primary.name(), plugin_verdict);
            verdict = verdict.merge(plugin_verdict);
        }
        Ok(verdict)
    }

    /// Applies every auxiliary plugin.
    pub async fn apply_auxiliary(&mut self) -> Result<(), DaemonError> {
        for plugin in self.auxiliary.iter_mut() {
            info!("Applying plugin {}", plugin.name());
            plugin.apply().await?;
        }
        Ok(())
    }

    /// Applies the primary plugin.
    pub async fn apply_primary(&mut self) -> Result<(), DaemonError> {
        info!("Applying plugin {}", self.primary.name());
        self.primary.apply().await
    }
}
