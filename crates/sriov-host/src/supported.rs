//! Supported NIC allow-list
//!
//! Entries use the `"<vendor> <pf device> <vf device>"` format of the
//! operator's supported NIC ID list, e.g. `"8086 158b 154c"`.

use crate::error::HostError;

/// One supported NIC model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NicId {
    /// PCI vendor ID
    pub vendor: String,
    /// PF device ID
    pub device: String,
    /// VF device ID
    pub vf_device: String,
}

impl NicId {
    /// Parses `"<vendor> <device> <vf device>"`.
    pub fn parse(entry: &str) -> Result<Self, HostError> {
        let fields: Vec<&str> = entry.split_whitespace().collect();
        match fields.as_slice() {
            [vendor, device, vf_device] => Ok(Self {
                vendor: vendor.to_lowercase(),
                device: device.to_lowercase(),
                vf_device: vf_device.to_lowercase(),
            }),
            _ => Err(HostError::InvalidConfig(format!(
                "supported NIC entry {:?} must be \"<vendor> <device> <vf device>\"",
                entry
            ))),
        }
    }

    /// Entry in the list format.
    pub fn to_entry(&self) -> String {
        format!("{} {} {}", self.vendor, self.device, self.vf_device)
    }
}

/// Allow-list of NIC models the daemon configures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupportedNics {
    nics: Vec<NicId>,
}

const DEFAULT_NIC_IDS: &[&str] = &[
    "8086 158a 154c",
    "8086 158b 154c",
    "8086 1572 154c",
    "8086 0d58 154c",
    "8086 1583 154c",
    "8086 1592 1889",
    "8086 1593 1889",
    "8086 159b 1889",
    "8086 1563 1565",
    "15b3 1013 1014",
    "15b3 1015 1016",
    "15b3 1017 1018",
    "15b3 1019 101a",
    "15b3 101b 101c",
    "15b3 101d 101e",
    "15b3 a2d6 101e",
    "14e4 16d7 16dc",
    "14e4 1750 1806",
    "1af4 1000 1000",
];

impl Default for SupportedNics {
    fn default() -> Self {
        Self {
            nics: DEFAULT_NIC_IDS
                .iter()
                .filter_map(|entry| NicId::parse(entry).ok())
                .collect(),
        }
    }
}

impl SupportedNics {
    /// Builds the list from entries.
    pub fn from_entries<I, S>(entries: I) -> Result<Self, HostError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let nics = entries
            .into_iter()
            .filter(|entry| !entry.as_ref().trim().is_empty())
            .map(|entry| NicId::parse(entry.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { nics })
    }

    /// Entries in the list format.
    pub fn to_entries(&self) -> Vec<String> {
        self.nics.iter().map(NicId::to_entry).collect()
    }

    /// Whether a PF with this vendor/device ID is supported.
    pub fn is_supported(&self, vendor: &str, device: &str) -> bool {
        self.nics
            .iter()
            .any(|nic| nic.vendor.eq_ignore_ascii_case(vendor) && nic.device.eq_ignore_ascii_case(device))
    }

    /// Whether the list is empty.
    pub fn is_empty(&self) -> bool {
        self.nics.is_empty()
    }
}
