//! HostInterface trait for mocking
//!
//! This trait abstracts every host primitive the inventory and the
//! configuration engine need. `SysfsHost` implements it against the real
//! host; `MockHost` keeps an in-memory device model for unit tests.

use crate::error::HostError;
use crate::models::PciDevice;
use crds::{EswitchMode, LinkType};

/// Host primitives used to discover and configure SR-IOV devices
///
/// Read accessors that describe optional hardware properties return `Option`
/// or an empty value rather than an error: a missing link or attribute is
/// normal during discovery.
/// All async methods must be `Send` to work with Tokio's work-stealing runtime.
#[async_trait::async_trait]
pub trait HostInterface: Send + Sync {
    // PCI inventory
    async fn list_pci_devices(&self) -> Result<Vec<PciDevice>, HostError>;
    async fn is_sriov_vf(&self, pci_address: &str) -> bool;
    async fn is_sriov_pf(&self, pci_address: &str) -> bool;
    async fn driver_name(&self, pci_address: &str) -> Option<String>;
    async fn net_names(&self, pci_address: &str) -> Vec<String>;
    async fn total_vfs(&self, pf_address: &str) -> u32;
    async fn num_vfs(&self, pf_address: &str) -> u32;
    async fn vf_list(&self, pf_address: &str) -> Result<Vec<String>, HostError>;
    async fn vf_index(&self, pf_address: &str, vf_address: &str) -> Result<u32, HostError>;
    async fn eswitch_mode(&self, pf_address: &str) -> Option<EswitchMode>;

    // Net devices
    async fn netdev_mtu(&self, name: &str) -> Option<u32>;
    async fn netdev_mac(&self, name: &str) -> Option<String>;
    async fn netdev_speed(&self, name: &str) -> Option<String>;
    async fn link_type(&self, name: &str) -> Option<LinkType>;
    async fn is_link_up(&self, name: &str) -> bool;
    async fn phys_switch_id(&self, name: &str) -> Option<String>;
    async fn phys_port_name(&self, name: &str) -> Option<String>;

    // Device mutation
    async fn set_num_vfs(&self, pf_address: &str, num_vfs: u32) -> Result<(), HostError>;
    async fn set_netdev_mtu(&self, name: &str, mtu: u32) -> Result<(), HostError>;
    async fn set_link_up(&self, name: &str) -> Result<(), HostError>;
    async fn set_vf_admin_mac(&self, pf_name: &str, vf_index: u32, mac: &str) -> Result<(), HostError>;
    async fn set_vf_guid(&self, pf_name: &str, vf_index: u32, guid: u64) -> Result<(), HostError>;
    async fn set_eswitch_mode(&self, pf_address: &str, mode: EswitchMode) -> Result<(), HostError>;
    async fn unbind_driver(&self, pci_address: &str) -> Result<(), HostError>;
    async fn bind_default_driver(&self, pci_address: &str) -> Result<(), HostError>;
    async fn bind_dpdk_driver(&self, pci_address: &str, driver: &str) -> Result<(), HostError>;

    // Udev
    async fn add_udev_rule(&self, pf_address: &str) -> Result<(), HostError>;
    async fn remove_udev_rule(&self, pf_address: &str) -> Result<(), HostError>;
    /// Replaces the switchdev naming rules, returns whether the file changed.
    async fn write_switchdev_udev_rules(&self, content: &str) -> Result<bool, HostError>;

    // Kernel and node
    async fn is_kernel_lockdown_mode(&self) -> bool;
    async fn is_module_loaded(&self, name: &str) -> Result<bool, HostError>;
    async fn load_kernel_module(&self, name: &str, args: &[&str]) -> Result<(), HostError>;
    async fn kernel_cmdline(&self) -> Result<String, HostError>;
    async fn add_kernel_args(&self, args: &[String]) -> Result<(), HostError>;
    async fn reboot_node(&self) -> Result<(), HostError>;
}
