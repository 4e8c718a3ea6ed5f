//! SriovNetworkNodeState CRD
//!
//! Desired SR-IOV layout for a single node (spec) paired with the hardware
//! state the config daemon observed on that node (status). The object is
//! named after the node it describes.

use crate::sync::SyncStatus;
use crate::vf_range::VfRange;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Device type meaning "keep the in-kernel default driver".
pub const DEVICE_TYPE_NETDEVICE: &str = "netdevice";

/// User-space (DPDK-class) drivers a VF can be bound to.
pub const DPDK_DRIVERS: &[&str] = &["igb_uio", "vfio-pci", "uio_pci_generic"];

/// Mellanox PCI vendor ID.
pub const VENDOR_MELLANOX: &str = "15b3";

/// Returns true when `driver` is a user-space (DPDK-class) driver.
pub fn is_dpdk_driver(driver: &str) -> bool {
    DPDK_DRIVERS.contains(&driver)
}

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[kube(
    group = "sriovnetwork.openshift.io",
    version = "v1",
    kind = "SriovNetworkNodeState",
    namespaced,
    status = "SriovNetworkNodeStateStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct SriovNetworkNodeStateSpec {
    /// Physical functions the node should be configured with
    #[serde(default)]
    pub interfaces: Vec<InterfaceSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SriovNetworkNodeStateStatus {
    /// Physical functions discovered on the node
    #[serde(default)]
    pub interfaces: Vec<InterfaceStatus>,

    /// Outcome of the last reconciliation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_status: Option<SyncStatus>,

    /// Error text of the last failed reconciliation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync_error: Option<String>,

    /// Last time the status was written by the daemon
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<chrono::DateTime<chrono::Utc>>,
}

/// Desired configuration of one physical function.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InterfaceSpec {
    /// PCI address of the PF (e.g. "0000:01:00.0")
    pub pci_address: String,

    /// Requested number of VFs
    #[serde(default)]
    pub num_vfs: u32,

    /// Requested PF MTU
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u32>,

    /// Interface name, informational
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,

    /// Link type the PF is expected to run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_type: Option<LinkType>,

    /// Requested eswitch mode
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eswitch_mode: Option<EswitchMode>,

    /// VF groups, matched by VF index
    #[serde(default)]
    pub vf_groups: Vec<VfGroup>,

    /// VF count and MTU are owned by something else on the host
    #[serde(default)]
    pub externally_managed: bool,
}

/// A range of VFs sharing a driver binding and MTU policy.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VfGroup {
    /// Device plugin resource the VFs are exposed as
    #[serde(default)]
    pub resource_name: String,

    /// `netdevice` or a DPDK-class driver name
    #[serde(default = "default_device_type")]
    pub device_type: String,

    /// Inclusive VF index range ("0-3" or "5")
    pub vf_range: String,

    /// Policy that produced this group
    #[serde(default)]
    pub policy_name: String,

    /// VF MTU, only applied to VFs on the default driver
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u32>,

    /// VFs are used for RDMA
    #[serde(default)]
    pub is_rdma: bool,
}

fn default_device_type() -> String {
    DEVICE_TYPE_NETDEVICE.to_string()
}

/// Observed state of one physical function.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InterfaceStatus {
    /// Kernel interface name
    #[serde(default)]
    pub name: String,

    /// Permanent MAC address
    #[serde(default)]
    pub mac: String,

    /// Bound driver
    #[serde(default)]
    pub driver: String,

    /// PCI address
    pub pci_address: String,

    /// PCI vendor ID
    #[serde(default)]
    pub vendor: String,

    /// PCI device ID
    #[serde(default, rename = "deviceID")]
    pub device_id: String,

    /// Current MTU
    #[serde(default)]
    pub mtu: u32,

    /// Current VF count
    #[serde(default)]
    pub num_vfs: u32,

    /// Link speed, e.g. "25000 Mb/s"
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub link_speed: String,

    /// Detected link type
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_type: Option<LinkType>,

    /// Current eswitch mode
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eswitch_mode: Option<EswitchMode>,

    /// Copied from the persisted store entry
    #[serde(default)]
    pub externally_managed: bool,

    /// Maximum VF count supported by the device
    #[serde(default, rename = "totalvfs")]
    pub total_vfs: u32,

    /// Virtual functions currently present
    #[serde(default, rename = "Vfs")]
    pub vfs: Vec<VirtualFunctionStatus>,
}

/// Observed state of one virtual function.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VirtualFunctionStatus {
    /// Kernel interface name, empty when bound to a DPDK driver
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,

    /// MAC address
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mac: String,

    /// Bound driver
    #[serde(default)]
    pub driver: String,

    /// PCI address
    pub pci_address: String,

    /// PCI vendor ID
    #[serde(default)]
    pub vendor: String,

    /// PCI device ID
    #[serde(default, rename = "deviceID")]
    pub device_id: String,

    /// Current MTU
    #[serde(default)]
    pub mtu: u32,

    /// Index of the VF on its PF
    #[serde(default, rename = "vfID")]
    pub vf_id: u32,
}

/// Link layer of a physical function.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum LinkType {
    /// Ethernet
    #[serde(rename = "ETH", alias = "eth")]
    Ethernet,

    /// InfiniBand
    #[serde(rename = "IB", alias = "ib")]
    Infiniband,
}

/// Switching mode of a physical function.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum EswitchMode {
    /// Legacy SR-IOV
    #[default]
    Legacy,

    /// Hardware offloaded switchdev
    Switchdev,
}

impl EswitchMode {
    /// Value understood by `devlink dev eswitch set`
    pub fn as_str(&self) -> &'static str {
        match self {
            EswitchMode::Legacy => "legacy",
            EswitchMode::Switchdev => "switchdev",
        }
    }
}

impl InterfaceSpec {
    /// Returns the first VF group whose range contains `vf_index`.
    ///
    /// Groups with an unparsable range never match.
    pub fn find_vf_group(&self, vf_index: u32) -> Option<&VfGroup> {
        self.vf_groups.iter().find(|group| {
            VfRange::parse(&group.vf_range)
                .map(|range| range.contains(vf_index))
                .unwrap_or(false)
        })
    }

    /// Pairs of group indexes whose VF ranges overlap.
    pub fn overlapping_vf_groups(&self) -> Vec<(usize, usize)> {
        let ranges: Vec<Option<VfRange>> = self
            .vf_groups
            .iter()
            .map(|group| VfRange::parse(&group.vf_range).ok())
            .collect();

        let mut overlaps = Vec::new();
        for (i, a) in ranges.iter().enumerate() {
            for (j, b) in ranges.iter().enumerate().skip(i + 1) {
                if let (Some(a), Some(b)) = (a, b) {
                    if a.overlaps(b) {
                        overlaps.push((i, j));
                    }
                }
            }
        }
        overlaps
    }

    /// Whether any VF group asks for a DPDK-class driver.
    pub fn uses_dpdk_driver(&self) -> bool {
        self.vf_groups.iter().any(|group| is_dpdk_driver(&group.device_type))
    }

    /// Whether the observed state differs from this spec.
    ///
    /// Compares VF count, eswitch mode, a PF MTU below the requested one, and
    /// for every VF that belongs to a group the bound driver and the VF MTU.
    /// A PF MTU above the requested one is left alone.
    pub fn needs_update(&self, status: &InterfaceStatus) -> bool {
        if let Some(mtu) = self.mtu {
            if mtu > status.mtu {
                return true;
            }
        }

        if self.num_vfs != status.num_vfs {
            return true;
        }

        if let Some(mode) = self.eswitch_mode {
            if mode != status.eswitch_mode.unwrap_or_default() {
                return true;
            }
        }

        if self.num_vfs == 0 {
            return false;
        }

        status.vfs.iter().any(|vf| match self.find_vf_group(vf.vf_id) {
            None => false,
            Some(group) if group.device_type != DEVICE_TYPE_NETDEVICE => {
                group.device_type != vf.driver
            }
            Some(group) => {
                if is_dpdk_driver(&vf.driver) {
                    return true;
                }
                matches!(group.mtu, Some(mtu) if mtu > 0 && mtu != vf.mtu)
            }
        })
    }
}

impl SriovNetworkNodeState {
    /// Generation of the desired spec, 0 when unset.
    pub fn generation(&self) -> i64 {
        self.metadata.generation.unwrap_or_default()
    }

    /// Observed interfaces, empty when no status was written yet.
    pub fn observed_interfaces(&self) -> &[InterfaceStatus] {
        self.status
            .as_ref()
            .map(|status| status.interfaces.as_slice())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(range: &str, device_type: &str, mtu: Option<u32>) -> VfGroup {
        VfGroup {
            resource_name: "sriov_nics".to_string(),
            device_type: device_type.to_string(),
            vf_range: range.to_string(),
            policy_name: "policy-1".to_string(),
            mtu,
            is_rdma: false,
        }
    }

    fn vf(index: u32, driver: &str, mtu: u32) -> VirtualFunctionStatus {
        VirtualFunctionStatus {
            driver: driver.to_string(),
            pci_address: format!("0000:01:10.{}", index),
            mtu,
            vf_id: index,
            ..Default::default()
        }
    }

    fn spec(num_vfs: u32, groups: Vec<VfGroup>) -> InterfaceSpec {
        InterfaceSpec {
            pci_address: "0000:01:00.0".to_string(),
            num_vfs,
            vf_groups: groups,
            ..Default::default()
        }
    }

    fn status(num_vfs: u32, vfs: Vec<VirtualFunctionStatus>) -> InterfaceStatus {
        InterfaceStatus {
            pci_address: "0000:01:00.0".to_string(),
            mtu: 1500,
            num_vfs,
            total_vfs: 8,
            vfs,
            ..Default::default()
        }
    }

    #[test]
    fn test_find_vf_group_first_match_wins() {
        let spec = spec(8, vec![group("0-3", "netdevice", None), group("2-7", "vfio-pci", None)]);

        assert_eq!(spec.find_vf_group(2).map(|g| g.device_type.as_str()), Some("netdevice"));
        assert_eq!(spec.find_vf_group(5).map(|g| g.device_type.as_str()), Some("vfio-pci"));
        assert!(spec.find_vf_group(8).is_none(), "Index outside every range should not match");
        assert_eq!(spec.overlapping_vf_groups(), vec![(0, 1)]);
    }

    #[test]
    fn test_needs_update_vf_count() {
        let spec = spec(4, vec![group("0-3", "netdevice", None)]);
        assert!(spec.needs_update(&status(0, vec![])), "Missing VFs must trigger an update");
    }

    #[test]
    fn test_needs_update_matching_state() {
        let spec = spec(2, vec![group("0-1", "netdevice", Some(9000))]);
        let observed = status(2, vec![vf(0, "iavf", 9000), vf(1, "iavf", 9000)]);
        assert!(!spec.needs_update(&observed), "Matching state should not need an update");
    }

    #[test]
    fn test_needs_update_driver_and_mtu_drift() {
        let spec = spec(2, vec![group("0", "vfio-pci", None), group("1", "netdevice", Some(9000))]);

        let wrong_driver = status(2, vec![vf(0, "iavf", 1500), vf(1, "iavf", 9000)]);
        assert!(spec.needs_update(&wrong_driver));

        let wrong_mtu = status(2, vec![vf(0, "vfio-pci", 0), vf(1, "iavf", 1500)]);
        assert!(spec.needs_update(&wrong_mtu));

        let dpdk_on_netdevice = status(2, vec![vf(0, "vfio-pci", 0), vf(1, "vfio-pci", 0)]);
        assert!(spec.needs_update(&dpdk_on_netdevice));
    }

    #[test]
    fn test_needs_update_ignores_ungrouped_vfs() {
        let spec = spec(2, vec![group("0", "netdevice", None)]);
        let observed = status(2, vec![vf(0, "iavf", 1500), vf(1, "vfio-pci", 0)]);
        assert!(!spec.needs_update(&observed), "VFs outside every group are left alone");
    }

    #[test]
    fn test_needs_update_pf_mtu_only_raises() {
        let mut spec = spec(0, vec![]);
        spec.mtu = Some(9000);
        assert!(spec.needs_update(&status(0, vec![])), "Lower PF MTU must be raised");

        spec.mtu = Some(1400);
        assert!(!spec.needs_update(&status(0, vec![])), "Higher PF MTU is kept");
    }

    #[test]
    fn test_needs_update_eswitch_mode() {
        let mut spec = spec(0, vec![]);
        spec.eswitch_mode = Some(EswitchMode::Switchdev);
        assert!(spec.needs_update(&status(0, vec![])));

        spec.eswitch_mode = Some(EswitchMode::Legacy);
        assert!(!spec.needs_update(&status(0, vec![])), "Unset observed mode counts as legacy");
    }

    #[test]
    fn test_interface_status_wire_names() {
        let observed = status(1, vec![vf(0, "iavf", 1500)]);
        let json = serde_json::to_value(&observed).unwrap();

        assert_eq!(json["totalvfs"], 8);
        assert_eq!(json["Vfs"][0]["vfID"], 0);
        assert!(json.get("deviceID").is_some());
    }
}
