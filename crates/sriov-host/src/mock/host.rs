//! HostInterface implementation for MockHost

use super::{HostCall, MockHost};
use crate::error::HostError;
use crate::host_trait::HostInterface;
use crate::models::PciDevice;
use crds::{is_dpdk_driver, EswitchMode, LinkType};

#[async_trait::async_trait]
impl HostInterface for MockHost {
    async fn list_pci_devices(&self) -> Result<Vec<PciDevice>, HostError> {
        Ok(self
            .state()
            .devices
            .values()
            .map(|d| PciDevice {
                address: d.address.clone(),
                class: d.class,
                vendor: d.vendor.clone(),
                device: d.device.clone(),
            })
            .collect())
    }

    async fn is_sriov_vf(&self, pci_address: &str) -> bool {
        self.state()
            .devices
            .get(pci_address)
            .map(|d| d.physfn.is_some())
            .unwrap_or(false)
    }

    async fn is_sriov_pf(&self, pci_address: &str) -> bool {
        self.state()
            .devices
            .get(pci_address)
            .map(|d| d.total_vfs > 0)
            .unwrap_or(false)
    }

    async fn driver_name(&self, pci_address: &str) -> Option<String> {
        self.state().devices.get(pci_address)?.driver.clone()
    }

    async fn net_names(&self, pci_address: &str) -> Vec<String> {
        let state = self.state();
        if state.unready_vfs.contains(pci_address) {
            return Vec::new();
        }
        let Some(device) = state.devices.get(pci_address) else {
            return Vec::new();
        };
        match (&device.driver, &device.netdev) {
            (Some(driver), Some(netdev)) if !is_dpdk_driver(driver) => vec![netdev.name.clone()],
            _ => Vec::new(),
        }
    }

    async fn total_vfs(&self, pf_address: &str) -> u32 {
        self.state()
            .devices
            .get(pf_address)
            .map(|d| d.total_vfs)
            .unwrap_or(0)
    }

    async fn num_vfs(&self, pf_address: &str) -> u32 {
        self.state().vfs_of(pf_address).len() as u32
    }

    async fn vf_list(&self, pf_address: &str) -> Result<Vec<String>, HostError> {
        Ok(self
            .state()
            .vfs_of(pf_address)
            .into_iter()
            .map(|d| d.address.clone())
            .collect())
    }

    async fn vf_index(&self, pf_address: &str, vf_address: &str) -> Result<u32, HostError> {
        self.state()
            .devices
            .get(vf_address)
            .filter(|d| d.physfn.as_deref() == Some(pf_address))
            .map(|d| d.vf_index)
            .ok_or_else(|| HostError::NotFound(format!("VF {} on PF {}", vf_address, pf_address)))
    }

    async fn eswitch_mode(&self, pf_address: &str) -> Option<EswitchMode> {
        self.state().devices.get(pf_address)?.eswitch_mode
    }

    async fn netdev_mtu(&self, name: &str) -> Option<u32> {
        self.state().find_netdev(name).map(|n| n.mtu)
    }

    async fn netdev_mac(&self, name: &str) -> Option<String> {
        self.state().find_netdev(name).map(|n| n.mac.clone())
    }

    async fn netdev_speed(&self, name: &str) -> Option<String> {
        self.state().find_netdev(name)?.speed.clone()
    }

    async fn link_type(&self, name: &str) -> Option<LinkType> {
        self.state().find_netdev(name)?.link_type
    }

    async fn is_link_up(&self, name: &str) -> bool {
        self.state().find_netdev(name).map(|n| n.up).unwrap_or(false)
    }

    async fn phys_switch_id(&self, name: &str) -> Option<String> {
        self.state().find_netdev(name)?.phys_switch_id.clone()
    }

    async fn phys_port_name(&self, name: &str) -> Option<String> {
        self.state().find_netdev(name)?.phys_port_name.clone()
    }

    async fn set_num_vfs(&self, pf_address: &str, num_vfs: u32) -> Result<(), HostError> {
        let mut state = self.state();
        state.calls.push(HostCall::SetNumVfs {
            pf: pf_address.to_string(),
            num_vfs,
        });
        if state.failing_pfs.contains(pf_address) {
            return Err(HostError::Command {
                command: format!("echo {} > sriov_numvfs", num_vfs),
                stderr: "Device or resource busy".to_string(),
            });
        }
        state.recreate_vfs(pf_address, num_vfs);
        Ok(())
    }

    async fn set_netdev_mtu(&self, name: &str, mtu: u32) -> Result<(), HostError> {
        let mut state = self.state();
        let netdev = state
            .find_netdev_mut(name)
            .ok_or_else(|| HostError::NotFound(format!("net device {}", name)))?;
        netdev.mtu = mtu;
        state.calls.push(HostCall::SetMtu {
            name: name.to_string(),
            mtu,
        });
        Ok(())
    }

    async fn set_link_up(&self, name: &str) -> Result<(), HostError> {
        let mut state = self.state();
        let netdev = state
            .find_netdev_mut(name)
            .ok_or_else(|| HostError::NotFound(format!("net device {}", name)))?;
        netdev.up = true;
        state.calls.push(HostCall::SetLinkUp(name.to_string()));
        Ok(())
    }

    async fn set_vf_admin_mac(&self, pf_name: &str, vf_index: u32, mac: &str) -> Result<(), HostError> {
        self.state().calls.push(HostCall::SetVfAdminMac {
            pf_name: pf_name.to_string(),
            vf_index,
            mac: mac.to_string(),
        });
        Ok(())
    }

    async fn set_vf_guid(&self, pf_name: &str, vf_index: u32, _guid: u64) -> Result<(), HostError> {
        self.state().calls.push(HostCall::SetVfGuid {
            pf_name: pf_name.to_string(),
            vf_index,
        });
        Ok(())
    }

    async fn set_eswitch_mode(&self, pf_address: &str, mode: EswitchMode) -> Result<(), HostError> {
        let mut state = self.state();
        let device = state
            .devices
            .get_mut(pf_address)
            .ok_or_else(|| HostError::NotFound(pf_address.to_string()))?;
        device.eswitch_mode = Some(mode);
        state.calls.push(HostCall::SetEswitchMode {
            pf: pf_address.to_string(),
            mode,
        });
        Ok(())
    }

    async fn unbind_driver(&self, pci_address: &str) -> Result<(), HostError> {
        let mut state = self.state();
        let Some(device) = state.devices.get_mut(pci_address) else {
            return Err(HostError::NotFound(pci_address.to_string()));
        };
        if device.driver.take().is_some() {
            state.calls.push(HostCall::Unbind(pci_address.to_string()));
        }
        Ok(())
    }

    async fn bind_default_driver(&self, pci_address: &str) -> Result<(), HostError> {
        let mut state = self.state();
        let Some(device) = state.devices.get_mut(pci_address) else {
            return Err(HostError::NotFound(pci_address.to_string()));
        };
        if matches!(&device.driver, Some(driver) if !is_dpdk_driver(driver)) {
            return Ok(());
        }
        device.driver = Some(device.default_driver().to_string());
        state.unready_vfs.remove(pci_address);
        state.calls.push(HostCall::BindDefault(pci_address.to_string()));
        Ok(())
    }

    async fn bind_dpdk_driver(&self, pci_address: &str, driver: &str) -> Result<(), HostError> {
        let mut state = self.state();
        let Some(device) = state.devices.get_mut(pci_address) else {
            return Err(HostError::NotFound(pci_address.to_string()));
        };
        if device.driver.as_deref() == Some(driver) {
            return Ok(());
        }
        device.driver = Some(driver.to_string());
        state.calls.push(HostCall::BindDpdk {
            address: pci_address.to_string(),
            driver: driver.to_string(),
        });
        Ok(())
    }

    async fn add_udev_rule(&self, pf_address: &str) -> Result<(), HostError> {
        let mut state = self.state();
        state.udev_rules.insert(pf_address.to_string());
        state.calls.push(HostCall::AddUdevRule(pf_address.to_string()));
        Ok(())
    }

    async fn remove_udev_rule(&self, pf_address: &str) -> Result<(), HostError> {
        let mut state = self.state();
        state.udev_rules.remove(pf_address);
        state.calls.push(HostCall::RemoveUdevRule(pf_address.to_string()));
        Ok(())
    }

    async fn write_switchdev_udev_rules(&self, content: &str) -> Result<bool, HostError> {
        let mut state = self.state();
        if state.switchdev_rules == content {
            return Ok(false);
        }
        state.switchdev_rules = content.to_string();
        Ok(true)
    }

    async fn is_kernel_lockdown_mode(&self) -> bool {
        self.state().lockdown
    }

    async fn is_module_loaded(&self, name: &str) -> Result<bool, HostError> {
        Ok(self.state().loaded_modules.contains(name))
    }

    async fn load_kernel_module(&self, name: &str, _args: &[&str]) -> Result<(), HostError> {
        let mut state = self.state();
        state.loaded_modules.insert(name.to_string());
        state.calls.push(HostCall::LoadModule(name.to_string()));
        Ok(())
    }

    async fn kernel_cmdline(&self) -> Result<String, HostError> {
        Ok(self.state().cmdline.clone())
    }

    async fn add_kernel_args(&self, args: &[String]) -> Result<(), HostError> {
        let mut state = self.state();
        for arg in args {
            state.cmdline.push(' ');
            state.cmdline.push_str(arg);
        }
        state.calls.push(HostCall::AddKernelArgs(args.to_vec()));
        Ok(())
    }

    async fn reboot_node(&self) -> Result<(), HostError> {
        self.state().calls.push(HostCall::Reboot);
        Ok(())
    }
}
