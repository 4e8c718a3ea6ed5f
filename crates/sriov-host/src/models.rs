//! Host-side data types

use crds::InterfaceSpec;
use serde::{Deserialize, Serialize};

/// PCI class code of network controllers (upper byte of the class).
pub const NET_CLASS: u32 = 0x02;

/// A PCI device as listed under `/sys/bus/pci/devices`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PciDevice {
    /// PCI address, e.g. "0000:01:00.0"
    pub address: String,
    /// Full 24-bit class code, `None` when the class file could not be parsed
    pub class: Option<u32>,
    /// Vendor ID without the `0x` prefix
    pub vendor: String,
    /// Device ID without the `0x` prefix
    pub device: String,
}

impl PciDevice {
    /// Whether the device is a network controller.
    pub fn is_network(&self) -> bool {
        self.class.map(|class| class >> 16 == NET_CLASS).unwrap_or(false)
    }
}

/// Last-applied configuration of a PF, as persisted on the host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PersistedPfStatus {
    /// Spec applied last
    pub spec: InterfaceSpec,
    /// PF is managed by something other than the operator
    #[serde(default)]
    pub externally_managed: bool,
}

impl PersistedPfStatus {
    /// Record for a freshly applied spec.
    pub fn from_spec(spec: &InterfaceSpec) -> Self {
        Self {
            spec: spec.clone(),
            externally_managed: spec.externally_managed,
        }
    }
}
