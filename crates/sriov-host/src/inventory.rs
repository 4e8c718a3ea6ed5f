//! Device inventory
//!
//! Builds the observed `InterfaceStatus` list from the host. Only physical
//! functions become top-level entries; their VFs are nested inside.

use crate::error::HostError;
use crate::host_trait::HostInterface;
use crate::models::PciDevice;
use crate::store::StoreManager;
use crate::supported::SupportedNics;
use crds::{InterfaceStatus, VirtualFunctionStatus};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Discovers SR-IOV capable network devices on the host.
#[derive(Clone)]
pub struct Inventory {
    host: Arc<dyn HostInterface>,
    store: Arc<dyn StoreManager>,
    supported: SupportedNics,
    dev_mode: bool,
}

impl Inventory {
    /// Creates an inventory. With `dev_mode` set, devices outside the
    /// supported NIC list are reported too.
    pub fn new(
        host: Arc<dyn HostInterface>,
        store: Arc<dyn StoreManager>,
        supported: SupportedNics,
        dev_mode: bool,
    ) -> Self {
        Self {
            host,
            store,
            supported,
            dev_mode,
        }
    }

    /// Replaces the supported NIC list.
    pub fn set_supported(&mut self, supported: SupportedNics) {
        self.supported = supported;
    }

    /// Supported NIC list in use.
    pub fn supported(&self) -> &SupportedNics {
        &self.supported
    }

    /// Enumerates physical functions on a bare-metal host.
    ///
    /// Fails only when no PCI device can be listed at all. Devices whose
    /// class, driver or net device cannot be read are skipped.
    pub async fn discover(&self) -> Result<Vec<InterfaceStatus>, HostError> {
        let devices = self.host.list_pci_devices().await?;
        if devices.is_empty() {
            return Err(HostError::NotFound("no PCI devices found".to_string()));
        }

        let mut interfaces = Vec::new();
        for device in devices.iter() {
            if device.class.is_none() {
                warn!("Unable to parse class of PCI device {}, skipping", device.address);
                continue;
            }
            if !device.is_network() || self.host.is_sriov_vf(&device.address).await {
                continue;
            }

            let Some(driver) = self.host.driver_name(&device.address).await else {
                debug!("Device {} has no driver bound, skipping", device.address);
                continue;
            };
            let names = self.host.net_names(&device.address).await;
            let Some(name) = names.first() else {
                debug!("Device {} has no net device, skipping", device.address);
                continue;
            };

            if !self.dev_mode && !self.supported.is_supported(&device.vendor, &device.device) {
                info!(
                    "Unsupported device {} ({}:{}), skipping",
                    device.address, device.vendor, device.device
                );
                continue;
            }

            let mut iface = InterfaceStatus {
                name: name.clone(),
                driver,
                pci_address: device.address.clone(),
                vendor: device.vendor.clone(),
                device_id: device.device.clone(),
                ..Default::default()
            };
            iface.mtu = self.host.netdev_mtu(name).await.unwrap_or_default();
            iface.mac = self.host.netdev_mac(name).await.unwrap_or_default();
            iface.link_speed = self.host.netdev_speed(name).await.unwrap_or_default();
            iface.link_type = self.host.link_type(name).await;

            match self.store.load_pf_status(&device.address).await {
                Ok(Some(persisted)) => iface.externally_managed = persisted.externally_managed,
                Ok(None) => {}
                Err(e) => warn!("Failed to load persisted status of PF {}: {}", device.address, e),
            }

            if self.host.is_sriov_pf(&device.address).await {
                iface.total_vfs = self.host.total_vfs(&device.address).await;
                iface.num_vfs = self.host.num_vfs(&device.address).await;
                iface.eswitch_mode = self.host.eswitch_mode(&device.address).await;

                if iface.num_vfs > 0 {
                    let vf_addresses = match self.host.vf_list(&device.address).await {
                        Ok(list) => list,
                        Err(e) => {
                            warn!("Unable to list VFs of {}, skipping: {}", device.address, e);
                            continue;
                        }
                    };
                    for vf_address in vf_addresses.iter() {
                        iface
                            .vfs
                            .push(self.vf_status(&device.address, vf_address, &devices).await);
                    }
                }
            }

            interfaces.push(iface);
        }

        debug!("Discovered {} SR-IOV interfaces", interfaces.len());
        Ok(interfaces)
    }

    /// Enumerates network devices of a virtual machine.
    ///
    /// The hypervisor already handed out the VF, so every network device is
    /// reported as an interface holding exactly one VF: itself, at index 0.
    pub async fn discover_virtual(&self) -> Result<Vec<InterfaceStatus>, HostError> {
        let devices = self.host.list_pci_devices().await?;
        if devices.is_empty() {
            return Err(HostError::NotFound("no PCI devices found".to_string()));
        }

        let mut interfaces = Vec::new();
        for device in devices.iter().filter(|d| d.is_network()) {
            let Some(driver) = self.host.driver_name(&device.address).await else {
                debug!("Device {} has no driver bound, skipping", device.address);
                continue;
            };

            let mut iface = InterfaceStatus {
                driver: driver.clone(),
                pci_address: device.address.clone(),
                vendor: device.vendor.clone(),
                device_id: device.device.clone(),
                total_vfs: 1,
                num_vfs: 1,
                ..Default::default()
            };
            let mut vf = VirtualFunctionStatus {
                driver,
                pci_address: device.address.clone(),
                vendor: device.vendor.clone(),
                device_id: device.device.clone(),
                vf_id: 0,
                ..Default::default()
            };

            if let Some(name) = self.host.net_names(&device.address).await.first() {
                iface.name = name.clone();
                iface.mac = self.host.netdev_mac(name).await.unwrap_or_default();
                iface.mtu = self.host.netdev_mtu(name).await.unwrap_or_default();
                iface.link_speed = self.host.netdev_speed(name).await.unwrap_or_default();
                iface.link_type = self.host.link_type(name).await;
                vf.name = iface.name.clone();
                vf.mac = iface.mac.clone();
                vf.mtu = iface.mtu;
            }

            iface.vfs.push(vf);
            interfaces.push(iface);
        }

        Ok(interfaces)
    }

    async fn vf_status(&self, pf_address: &str, vf_address: &str, devices: &[PciDevice]) -> VirtualFunctionStatus {
        let mut vf = VirtualFunctionStatus {
            pci_address: vf_address.to_string(),
            driver: self.host.driver_name(vf_address).await.unwrap_or_default(),
            ..Default::default()
        };

        match self.host.vf_index(pf_address, vf_address).await {
            Ok(index) => vf.vf_id = index,
            Err(e) => warn!("Unable to get VF index of {}: {}", vf_address, e),
        }

        if let Some(name) = self.host.net_names(vf_address).await.first() {
            vf.mtu = self.host.netdev_mtu(name).await.unwrap_or_default();
            vf.mac = self.host.netdev_mac(name).await.unwrap_or_default();
            vf.name = name.clone();
        }

        if let Some(device) = devices.iter().find(|d| d.address == vf_address) {
            vf.vendor = device.vendor.clone();
            vf.device_id = device.device.clone();
        }
        vf
    }
}
