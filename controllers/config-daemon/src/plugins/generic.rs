//! Generic plugin for bare metal hosts.
//!
//! Drives the device engine: the engine's plan decides whether a drain is
//! needed, and configured kernel arguments decide whether DPDK VF groups
//! need a reboot first.

use super::{PluginVerdict, VendorPlugin};
use crate::error::DaemonError;
use async_trait::async_trait;
use crds::{InterfaceSpec, InterfaceStatus, SriovNetworkNodeState};
use sriov_host::{kernel, ConfigurationPlan, DeviceEngine};
use tracing::{debug, info, warn};

pub struct GenericPlugin {
    engine: DeviceEngine,
    required_kernel_args: Vec<String>,
    desired: Vec<InterfaceSpec>,
    observed: Vec<InterfaceStatus>,
    plan: ConfigurationPlan,
}

impl std::fmt::Debug for GenericPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenericPlugin")
            .field("required_kernel_args", &self.required_kernel_args)
            .field("desired", &self.desired.len())
            .field("plan", &self.plan)
            .finish()
    }
}

impl GenericPlugin {
    pub fn new(engine: DeviceEngine, required_kernel_args: Vec<String>) -> Self {
        Self {
            engine,
            required_kernel_args,
            desired: Vec::new(),
            observed: Vec::new(),
            plan: ConfigurationPlan::default(),
        }
    }

    /// Adds the required kernel arguments missing from the running kernel.
    /// Returns whether any had to be added.
    async fn sync_kernel_args(&self) -> Result<bool, DaemonError> {
        if self.required_kernel_args.is_empty() || !self.desired.iter().any(InterfaceSpec::uses_dpdk_driver) {
            return Ok(false);
        }

        let cmdline = self.engine.host().kernel_cmdline().await?;
        let missing: Vec<String> = self
            .required_kernel_args
            .iter()
            .filter(|arg| !cmdline.split_whitespace().any(|current| current == arg.as_str()))
            .cloned()
            .collect();
        if missing.is_empty() {
            debug!("Required kernel arguments already active");
            return Ok(false);
        }

        info!("Kernel arguments {} are missing, a reboot is required", missing.join(" "));
        self.engine.host().add_kernel_args(&missing).await?;
        Ok(true)
    }
}

#[async_trait]
impl VendorPlugin for GenericPlugin {
    fn name(&self) -> &str {
        "generic"
    }

    async fn on_node_state_change(&mut self, state: &SriovNetworkNodeState) -> Result<PluginVerdict, DaemonError> {
        self.desired = state.spec.interfaces.clone();
        self.observed = state.observed_interfaces().to_vec();

        for spec in self.desired.iter() {
            for (first, second) in spec.overlapping_vf_groups() {
                warn!(
                    "VF groups {} and {} of {} overlap, the first one wins",
                    spec.vf_groups[first].vf_range, spec.vf_groups[second].vf_range, spec.pci_address
                );
            }
        }

        self.plan = self.engine.plan(&self.desired, &self.observed).await?;
        let mut verdict = PluginVerdict {
            drain_required: self.plan.requires_drain(),
            reboot_required: false,
        };

        if self.sync_kernel_args().await? {
            verdict.drain_required = true;
            verdict.reboot_required = true;
        }

        debug!(
            "Generic plugin: {} to configure, {} to reset, {} unchanged",
            self.plan.to_configure.len(),
            self.plan.to_reset.len(),
            self.plan.unchanged.len()
        );
        Ok(verdict)
    }

    async fn apply(&mut self) -> Result<(), DaemonError> {
        if self.desired.iter().any(InterfaceSpec::uses_dpdk_driver) {
            kernel::try_enable_vfio_pci(self.engine.host().as_ref()).await?;
        }

        if self.plan.is_empty() {
            info!("Interfaces already match the last applied configuration, nothing to apply");
            return Ok(());
        }

        self.engine.configure_all(&self.desired, &self.observed).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::create_test_node_state;
    use crds::{InterfaceStatus, VfGroup};
    use sriov_host::{EngineSettings, HostCall, Inventory, MockDevice, MockHost, MockStore, SupportedNics};
    use std::sync::Arc;

    const PF: &str = "0000:01:00.0";

    fn spec(num_vfs: u32, device_type: &str) -> InterfaceSpec {
        InterfaceSpec {
            pci_address: PF.to_string(),
            num_vfs,
            name: "ens1f0".to_string(),
            vf_groups: vec![VfGroup {
                resource_name: "intel_nics".to_string(),
                device_type: device_type.to_string(),
                vf_range: format!("0-{}", num_vfs.saturating_sub(1)),
                policy_name: "policy-1".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    async fn fixture(kernel_args: &[&str]) -> (MockHost, MockStore, GenericPlugin, Vec<InterfaceStatus>) {
        let host = MockHost::new();
        host.add_device(MockDevice::pf(PF, "8086", "158b", "ens1f0", 8));
        let store = MockStore::new();
        let inventory = Inventory::new(Arc::new(host.clone()), Arc::new(store.clone()), SupportedNics::default(), false);
        let observed = inventory.discover().await.unwrap();
        let engine = DeviceEngine::new(
            Arc::new(host.clone()),
            Arc::new(store.clone()),
            &observed,
            EngineSettings::default(),
        );
        let plugin = GenericPlugin::new(engine, kernel_args.iter().map(|a| a.to_string()).collect());
        (host, store, plugin, observed)
    }

    #[tokio::test]
    async fn test_new_vfs_require_drain_and_apply_writes_them() {
        let (host, store, mut plugin, observed) = fixture(&[]).await;
        let state = create_test_node_state("worker-0", 2, vec![spec(4, "netdevice")], observed);

        let verdict = plugin.on_node_state_change(&state).await.unwrap();
        assert_eq!(
            verdict,
            PluginVerdict {
                drain_required: true,
                reboot_required: false
            }
        );

        plugin.apply().await.unwrap();
        assert!(host.calls().contains(&HostCall::SetNumVfs {
            pf: PF.to_string(),
            num_vfs: 4
        }));
        assert!(store.status(PF).is_some(), "Applied spec is persisted");
    }

    #[tokio::test]
    async fn test_applied_spec_is_not_reapplied() {
        let (host, store, mut plugin, observed) = fixture(&[]).await;
        let state = create_test_node_state("worker-0", 2, vec![spec(4, "netdevice")], observed);
        plugin.on_node_state_change(&state).await.unwrap();
        plugin.apply().await.unwrap();

        let inventory = Inventory::new(Arc::new(host.clone()), Arc::new(store), SupportedNics::default(), false);
        let observed = inventory.discover().await.unwrap();
        host.clear_calls();
        let state = create_test_node_state("worker-0", 3, vec![spec(4, "netdevice")], observed);

        let verdict = plugin.on_node_state_change(&state).await.unwrap();
        assert!(!verdict.drain_required);
        plugin.apply().await.unwrap();
        assert!(host.calls().is_empty(), "Unexpected host mutations: {:?}", host.calls());
    }

    #[tokio::test]
    async fn test_missing_kernel_args_require_reboot() {
        let (host, _store, mut plugin, observed) = fixture(&["intel_iommu=on", "iommu=pt"]).await;
        host.set_cmdline("BOOT_IMAGE=/vmlinuz root=/dev/sda1 iommu=pt");
        let state = create_test_node_state("worker-0", 2, vec![spec(2, "vfio-pci")], observed);

        let verdict = plugin.on_node_state_change(&state).await.unwrap();

        assert!(verdict.reboot_required);
        assert!(verdict.drain_required);
        assert!(host
            .calls()
            .contains(&HostCall::AddKernelArgs(vec!["intel_iommu=on".to_string()])));
    }

    #[tokio::test]
    async fn test_kernel_args_ignored_without_dpdk_groups() {
        let (host, _store, mut plugin, observed) = fixture(&["intel_iommu=on"]).await;
        let state = create_test_node_state("worker-0", 2, vec![spec(2, "netdevice")], observed);

        let verdict = plugin.on_node_state_change(&state).await.unwrap();

        assert!(!verdict.reboot_required);
        assert!(!host.calls().iter().any(|call| matches!(call, HostCall::AddKernelArgs(_))));
    }

    #[tokio::test]
    async fn test_dpdk_groups_load_vfio() {
        let (host, _store, mut plugin, observed) = fixture(&[]).await;
        let state = create_test_node_state("worker-0", 2, vec![spec(2, "vfio-pci")], observed);

        plugin.on_node_state_change(&state).await.unwrap();
        plugin.apply().await.unwrap();

        assert!(host.module_loaded("vfio_pci"));
    }
}
