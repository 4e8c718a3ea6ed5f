//! Plugin for virtual machines.
//!
//! The hypervisor fixes the VF layout, so the only thing left to do is bind
//! each device to the driver its single VF group asks for. Nothing here
//! disrupts workloads enough to need a drain or a reboot.

use super::{PluginVerdict, VendorPlugin};
use crate::error::DaemonError;
use async_trait::async_trait;
use crds::{InterfaceSpec, InterfaceStatus, SriovNetworkNodeState};
use sriov_host::{kernel, DeviceEngine};
use tracing::{debug, info, warn};

pub struct VirtualPlugin {
    engine: DeviceEngine,
    desired: Vec<InterfaceSpec>,
    observed: Vec<InterfaceStatus>,
}

impl std::fmt::Debug for VirtualPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualPlugin")
            .field("desired", &self.desired.len())
            .field("observed", &self.observed.len())
            .finish()
    }
}

impl VirtualPlugin {
    pub fn new(engine: DeviceEngine) -> Self {
        Self {
            engine,
            desired: Vec::new(),
            observed: Vec::new(),
        }
    }
}

#[async_trait]
impl VendorPlugin for VirtualPlugin {
    fn name(&self) -> &str {
        "virtual"
    }

    async fn on_node_state_change(&mut self, state: &SriovNetworkNodeState) -> Result<PluginVerdict, DaemonError> {
        self.desired = state.spec.interfaces.clone();
        self.observed = state.observed_interfaces().to_vec();
        Ok(PluginVerdict::default())
    }

    async fn apply(&mut self) -> Result<(), DaemonError> {
        if self.desired.iter().any(InterfaceSpec::uses_dpdk_driver) {
            kernel::try_enable_vfio_pci(self.engine.host().as_ref()).await?;
        }

        for spec in self.desired.iter() {
            let Some(status) = self.observed.iter().find(|status| status.pci_address == spec.pci_address) else {
                warn!("Interface {} is not present on this machine, skipping", spec.pci_address);
                continue;
            };
            if !spec.needs_update(status) {
                debug!("Interface {} is up to date", spec.pci_address);
                continue;
            }
            info!("Configuring virtual interface {}", spec.pci_address);
            self.engine.configure_virtual(spec).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::create_test_node_state;
    use crds::VfGroup;
    use sriov_host::{EngineSettings, HostCall, Inventory, MockDevice, MockHost, MockStore, SupportedNics};
    use std::sync::Arc;

    const DEV: &str = "0000:00:05.0";

    fn spec(num_vfs: u32, device_type: &str) -> InterfaceSpec {
        InterfaceSpec {
            pci_address: DEV.to_string(),
            num_vfs,
            vf_groups: vec![VfGroup {
                resource_name: "virt_nics".to_string(),
                device_type: device_type.to_string(),
                vf_range: "0".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    async fn fixture() -> (MockHost, VirtualPlugin, Vec<InterfaceStatus>) {
        let host = MockHost::new();
        host.add_device(MockDevice::pf(DEV, "8086", "154c", "eth1", 0));
        let store = Arc::new(MockStore::new());
        let inventory = Inventory::new(Arc::new(host.clone()), store.clone(), SupportedNics::default(), true);
        let observed = inventory.discover_virtual().await.unwrap();
        let engine = DeviceEngine::new(Arc::new(host.clone()), store, &observed, EngineSettings::default());
        (host, VirtualPlugin::new(engine), observed)
    }

    #[tokio::test]
    async fn test_never_drains_and_binds_dpdk_driver() {
        let (host, mut plugin, observed) = fixture().await;
        let state = create_test_node_state("vm-0", 2, vec![spec(1, "vfio-pci")], observed);

        assert_eq!(plugin.on_node_state_change(&state).await.unwrap(), PluginVerdict::default());
        plugin.apply().await.unwrap();

        assert!(host.calls().contains(&HostCall::BindDpdk {
            address: DEV.to_string(),
            driver: "vfio-pci".to_string()
        }));
    }

    #[tokio::test]
    async fn test_matching_interface_is_left_alone() {
        let (host, mut plugin, observed) = fixture().await;
        let state = create_test_node_state("vm-0", 2, vec![spec(1, "netdevice")], observed);

        plugin.on_node_state_change(&state).await.unwrap();
        plugin.apply().await.unwrap();

        assert!(host.calls().is_empty(), "Unexpected host mutations: {:?}", host.calls());
    }

    #[tokio::test]
    async fn test_more_than_one_vf_fails() {
        let (_host, mut plugin, observed) = fixture().await;
        let state = create_test_node_state("vm-0", 2, vec![spec(2, "netdevice")], observed);

        plugin.on_node_state_change(&state).await.unwrap();
        assert!(plugin.apply().await.is_err());
    }
}
