//! In-memory host for unit testing
//!
//! `MockHost` models PCI devices, VFs and net devices in memory and applies
//! every mutation to that model, so the engine and the daemon can be tested
//! end to end without sysfs. Each effective mutation is also recorded as a
//! `HostCall`.
//!
//! The mock is organized into modules:
//! - `host.rs` - `HostInterface` implementation
//! - `store.rs` - in-memory `StoreManager`

mod host;
mod store;

pub use store::MockStore;

use crds::{EswitchMode, LinkType, VENDOR_MELLANOX};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

/// A mutation performed on the mock host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostCall {
    SetNumVfs { pf: String, num_vfs: u32 },
    SetMtu { name: String, mtu: u32 },
    SetLinkUp(String),
    SetVfAdminMac { pf_name: String, vf_index: u32, mac: String },
    SetVfGuid { pf_name: String, vf_index: u32 },
    SetEswitchMode { pf: String, mode: EswitchMode },
    Unbind(String),
    BindDefault(String),
    BindDpdk { address: String, driver: String },
    AddUdevRule(String),
    RemoveUdevRule(String),
    LoadModule(String),
    AddKernelArgs(Vec<String>),
    Reboot,
}

/// Net device attached to a mock PCI device.
#[derive(Debug, Clone, Default)]
pub struct MockNetdev {
    pub name: String,
    pub mac: String,
    pub mtu: u32,
    pub speed: Option<String>,
    pub link_type: Option<LinkType>,
    pub up: bool,
    pub phys_switch_id: Option<String>,
    pub phys_port_name: Option<String>,
}

/// A mock PCI device, PF or VF.
#[derive(Debug, Clone, Default)]
pub struct MockDevice {
    pub address: String,
    pub class: Option<u32>,
    pub vendor: String,
    pub device: String,
    pub driver: Option<String>,
    pub netdev: Option<MockNetdev>,
    /// Non-zero marks the device as SR-IOV capable
    pub total_vfs: u32,
    pub eswitch_mode: Option<EswitchMode>,
    /// Parent PF address for VFs
    pub physfn: Option<String>,
    pub vf_index: u32,
}

impl MockDevice {
    /// An SR-IOV capable Ethernet PF with MTU 1500 and its link up.
    pub fn pf(address: &str, vendor: &str, device: &str, name: &str, total_vfs: u32) -> Self {
        Self {
            address: address.to_string(),
            class: Some(0x020000),
            vendor: vendor.to_string(),
            device: device.to_string(),
            driver: Some(default_pf_driver(vendor).to_string()),
            netdev: Some(MockNetdev {
                name: name.to_string(),
                mac: "3c:fd:fe:00:00:01".to_string(),
                mtu: 1500,
                speed: Some("25000 Mb/s".to_string()),
                link_type: Some(LinkType::Ethernet),
                up: true,
                ..Default::default()
            }),
            total_vfs,
            ..Default::default()
        }
    }

    /// Sets the net device MTU.
    pub fn with_mtu(mut self, mtu: u32) -> Self {
        if let Some(netdev) = self.netdev.as_mut() {
            netdev.mtu = mtu;
        }
        self
    }

    /// Sets the link type.
    pub fn with_link_type(mut self, link_type: LinkType) -> Self {
        if let Some(netdev) = self.netdev.as_mut() {
            netdev.link_type = Some(link_type);
        }
        self
    }

    /// Marks the link administratively down.
    pub fn with_link_down(mut self) -> Self {
        if let Some(netdev) = self.netdev.as_mut() {
            netdev.up = false;
        }
        self
    }

    /// Sets the eswitch mode.
    pub fn with_eswitch_mode(mut self, mode: EswitchMode) -> Self {
        self.eswitch_mode = Some(mode);
        self
    }

    fn default_driver(&self) -> &'static str {
        if self.physfn.is_some() {
            default_vf_driver(&self.vendor)
        } else {
            default_pf_driver(&self.vendor)
        }
    }
}

fn default_pf_driver(vendor: &str) -> &'static str {
    if vendor == VENDOR_MELLANOX { "mlx5_core" } else { "i40e" }
}

fn default_vf_driver(vendor: &str) -> &'static str {
    if vendor == VENDOR_MELLANOX { "mlx5_core" } else { "iavf" }
}

fn vf_device_id(vendor: &str) -> &'static str {
    if vendor == VENDOR_MELLANOX { "1018" } else { "154c" }
}

#[derive(Debug, Default)]
pub(crate) struct MockHostState {
    pub(crate) devices: BTreeMap<String, MockDevice>,
    pub(crate) calls: Vec<HostCall>,
    pub(crate) lockdown: bool,
    pub(crate) failing_pfs: HashSet<String>,
    pub(crate) unready_vfs: HashSet<String>,
    pub(crate) loaded_modules: HashSet<String>,
    pub(crate) udev_rules: HashSet<String>,
    pub(crate) switchdev_rules: String,
    pub(crate) cmdline: String,
}

impl MockHostState {
    pub(crate) fn find_netdev_mut(&mut self, name: &str) -> Option<&mut MockNetdev> {
        self.devices
            .values_mut()
            .filter_map(|d| d.netdev.as_mut())
            .find(|n| n.name == name)
    }

    pub(crate) fn find_netdev(&self, name: &str) -> Option<&MockNetdev> {
        self.devices
            .values()
            .filter_map(|d| d.netdev.as_ref())
            .find(|n| n.name == name)
    }

    pub(crate) fn vfs_of(&self, pf: &str) -> Vec<&MockDevice> {
        let mut vfs: Vec<&MockDevice> = self
            .devices
            .values()
            .filter(|d| d.physfn.as_deref() == Some(pf))
            .collect();
        vfs.sort_by_key(|d| d.vf_index);
        vfs
    }

    pub(crate) fn recreate_vfs(&mut self, pf: &str, count: u32) {
        self.devices.retain(|_, d| d.physfn.as_deref() != Some(pf));

        let Some(parent) = self.devices.get(pf).cloned() else {
            return;
        };
        let (bus, function) = pf.rsplit_once(':').unwrap_or(("0000:00", "00.0"));
        let function: u32 = function
            .rsplit('.')
            .next()
            .and_then(|f| f.parse().ok())
            .unwrap_or(0);
        let parent_name = parent
            .netdev
            .as_ref()
            .map(|n| n.name.clone())
            .unwrap_or_else(|| "pf".to_string());
        let link_type = parent.netdev.as_ref().and_then(|n| n.link_type);

        for index in 0..count {
            let address = format!("{}:{:02x}.{}", bus, 0x10 + function * 4 + index / 8, index % 8);
            let vf = MockDevice {
                address: address.clone(),
                class: Some(0x020000),
                vendor: parent.vendor.clone(),
                device: vf_device_id(&parent.vendor).to_string(),
                driver: Some(default_vf_driver(&parent.vendor).to_string()),
                netdev: Some(MockNetdev {
                    name: format!("{}v{}", parent_name, index),
                    mac: format!("02:00:00:{:02x}:{:02x}:{:02x}", function, index / 256, index % 256),
                    mtu: 1500,
                    link_type,
                    ..Default::default()
                }),
                physfn: Some(pf.to_string()),
                vf_index: index,
                ..Default::default()
            };
            self.devices.insert(address, vf);
        }
    }
}

/// Mock host for testing
///
/// Cloning shares the same underlying model.
#[derive(Clone, Default)]
pub struct MockHost {
    pub(crate) state: Arc<Mutex<MockHostState>>,
}

impl std::fmt::Debug for MockHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockHost").finish_non_exhaustive()
    }
}

impl MockHost {
    /// Creates an empty mock host
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, MockHostState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Adds a device (for test setup)
    pub fn add_device(&self, device: MockDevice) {
        self.state().devices.insert(device.address.clone(), device);
    }

    /// Adds a PF that already carries `num_vfs` VFs (for test setup)
    pub fn add_pf_with_vfs(&self, device: MockDevice, num_vfs: u32) {
        let address = device.address.clone();
        let mut state = self.state();
        state.devices.insert(address.clone(), device);
        state.recreate_vfs(&address, num_vfs);
    }

    /// Turns kernel lockdown mode on or off
    pub fn set_lockdown(&self, enabled: bool) {
        self.state().lockdown = enabled;
    }

    /// Makes VF count writes on `pf` fail
    pub fn fail_set_num_vfs(&self, pf: &str) {
        self.state().failing_pfs.insert(pf.to_string());
    }

    /// Hides the VF net device until the VF is rebound
    pub fn set_vf_unready(&self, vf_address: &str) {
        self.state().unready_vfs.insert(vf_address.to_string());
    }

    /// Marks a kernel module as loaded
    pub fn set_module_loaded(&self, name: &str) {
        self.state().loaded_modules.insert(name.to_string());
    }

    /// Sets the kernel command line
    pub fn set_cmdline(&self, cmdline: &str) {
        self.state().cmdline = cmdline.to_string();
    }

    /// Mutations recorded so far
    pub fn calls(&self) -> Vec<HostCall> {
        self.state().calls.clone()
    }

    /// Forgets recorded mutations
    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    /// Snapshot of a device
    pub fn device(&self, address: &str) -> Option<MockDevice> {
        self.state().devices.get(address).cloned()
    }

    /// Snapshot of the VFs of a PF, ordered by index
    pub fn vfs(&self, pf: &str) -> Vec<MockDevice> {
        self.state().vfs_of(pf).into_iter().cloned().collect()
    }

    /// Whether a NetworkManager udev rule exists for the PF
    pub fn has_udev_rule(&self, pf: &str) -> bool {
        self.state().udev_rules.contains(pf)
    }

    /// Current switchdev udev rules content
    pub fn switchdev_rules(&self) -> String {
        self.state().switchdev_rules.clone()
    }

    /// Whether a kernel module is loaded
    pub fn module_loaded(&self, name: &str) -> bool {
        self.state().loaded_modules.contains(name)
    }
}
