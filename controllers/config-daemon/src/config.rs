//! Daemon configuration.
//!
//! Everything the daemon needs to know about its node and cluster is read
//! from the environment once at startup and passed down explicitly.

use crate::error::DaemonError;
use sriov_host::SupportedNics;
use std::path::PathBuf;
use std::time::Duration;

/// Namespace the operator runs in when `NAMESPACE` is unset.
pub const DEFAULT_NAMESPACE: &str = "sriov-network-operator";

/// Where the host filesystem is mounted when `HOST_ROOT` is unset.
pub const DEFAULT_HOST_ROOT: &str = "/host";

/// Default eviction timeout for a drain.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(90);

/// Kind of machine the daemon runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformType {
    /// Physical host, PFs are configured directly
    Baremetal,
    /// Virtual machine, each device is a single VF handed out by the hypervisor
    Virtual,
}

/// Flavor of cluster the node belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterType {
    /// Plain Kubernetes
    Kubernetes,
    /// OpenShift, nodes belong to machine config pools
    Openshift,
}

/// Daemon configuration.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Name of the node the daemon runs on
    pub node_name: String,
    /// Namespace holding the node state and operator config objects
    pub namespace: String,
    /// Platform the node runs on
    pub platform: PlatformType,
    /// Cluster flavor
    pub cluster_type: ClusterType,
    /// OpenShift hosted control plane; machine config pools are not used
    pub hypershift: bool,
    /// Devices are configured by the one-shot `sriov-config` systemd service
    pub use_systemd_service: bool,
    /// Report and configure NICs outside the supported list
    pub dev_mode: bool,
    /// Configure devices concurrently
    pub parallel_nic_config: bool,
    /// Host filesystem mount point
    pub host_root: PathBuf,
    /// Prefix of `/sys` and `/proc`
    pub sysfs_root: PathBuf,
    /// Kernel arguments DPDK VF groups need; a missing one triggers a reboot
    pub required_kernel_args: Vec<String>,
    /// Supported NIC list
    pub supported_nics: SupportedNics,
    /// Give up evicting pods after this long
    pub drain_timeout: Duration,
}

impl DaemonConfig {
    /// Builds the configuration from process environment variables.
    pub fn from_env() -> Result<Self, DaemonError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, DaemonError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let node_name = var("NODE_NAME").ok_or_else(|| {
            DaemonError::InvalidConfig("NODE_NAME environment variable is required".to_string())
        })?;

        let platform = match var("PLATFORM_TYPE").as_deref() {
            None | Some("baremetal") | Some("Baremetal") => PlatformType::Baremetal,
            Some("virtual") | Some("Virtual") | Some("openstack") => PlatformType::Virtual,
            Some(other) => {
                return Err(DaemonError::InvalidConfig(format!(
                    "PLATFORM_TYPE must be baremetal or virtual, got {}",
                    other
                )));
            }
        };

        let cluster_type = match var("CLUSTER_TYPE").as_deref() {
            None | Some("kubernetes") => ClusterType::Kubernetes,
            Some("openshift") => ClusterType::Openshift,
            Some(other) => {
                return Err(DaemonError::InvalidConfig(format!(
                    "CLUSTER_TYPE must be kubernetes or openshift, got {}",
                    other
                )));
            }
        };

        let supported_nics = match var("SUPPORTED_NIC_IDS") {
            Some(raw) => SupportedNics::from_entries(raw.split([',', '\n']))
                .map_err(|e| DaemonError::InvalidConfig(format!("SUPPORTED_NIC_IDS: {}", e)))?,
            None => SupportedNics::default(),
        };

        let drain_timeout = match var("DRAIN_TIMEOUT_SECS") {
            Some(raw) => Duration::from_secs(raw.parse().map_err(|_| {
                DaemonError::InvalidConfig(format!("DRAIN_TIMEOUT_SECS must be a number of seconds, got {}", raw))
            })?),
            None => DEFAULT_DRAIN_TIMEOUT,
        };

        Ok(Self {
            node_name,
            namespace: var("NAMESPACE").unwrap_or_else(|| DEFAULT_NAMESPACE.to_string()),
            platform,
            cluster_type,
            hypershift: var("OPENSHIFT_FLAVOR").as_deref() == Some("hypershift"),
            use_systemd_service: parse_bool(&var, "USE_SYSTEMD_SERVICE")?,
            dev_mode: parse_bool(&var, "DEV_MODE")?,
            parallel_nic_config: parse_bool(&var, "PARALLEL_NIC_CONFIG")?,
            host_root: PathBuf::from(var("HOST_ROOT").unwrap_or_else(|| DEFAULT_HOST_ROOT.to_string())),
            sysfs_root: PathBuf::from(var("SYSFS_ROOT").unwrap_or_else(|| "/".to_string())),
            required_kernel_args: var("REQUIRED_KERNEL_ARGS")
                .map(|raw| raw.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default(),
            supported_nics,
            drain_timeout,
        })
    }

    /// Whether the node's machine config pool must be paused while draining.
    pub fn uses_machine_config_pools(&self) -> bool {
        self.cluster_type == ClusterType::Openshift && !self.hypershift
    }
}

fn parse_bool<F>(var: &F, key: &str) -> Result<bool, DaemonError>
where
    F: Fn(&str) -> Option<String>,
{
    match var(key).as_deref() {
        None => Ok(false),
        Some("true") | Some("1") | Some("yes") => Ok(true),
        Some("false") | Some("0") | Some("no") => Ok(false),
        Some(other) => Err(DaemonError::InvalidConfig(format!(
            "{} must be true or false, got {}",
            key, other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<DaemonConfig, DaemonError> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        DaemonConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config(&[("NODE_NAME", "worker-0")]).unwrap();

        assert_eq!(config.node_name, "worker-0");
        assert_eq!(config.namespace, DEFAULT_NAMESPACE);
        assert_eq!(config.platform, PlatformType::Baremetal);
        assert_eq!(config.cluster_type, ClusterType::Kubernetes);
        assert!(!config.use_systemd_service);
        assert!(!config.parallel_nic_config);
        assert_eq!(config.host_root, PathBuf::from("/host"));
        assert_eq!(config.sysfs_root, PathBuf::from("/"));
        assert!(config.required_kernel_args.is_empty());
        assert_eq!(config.drain_timeout, Duration::from_secs(90));
        assert!(!config.uses_machine_config_pools());
    }

    #[test]
    fn test_node_name_required() {
        let result = config(&[("NAMESPACE", "sriov")]);
        assert!(matches!(result, Err(DaemonError::InvalidConfig(_))));
    }

    #[test]
    fn test_full_configuration() {
        let config = config(&[
            ("NODE_NAME", "worker-1"),
            ("NAMESPACE", "openshift-sriov-network-operator"),
            ("PLATFORM_TYPE", "virtual"),
            ("CLUSTER_TYPE", "openshift"),
            ("USE_SYSTEMD_SERVICE", "true"),
            ("PARALLEL_NIC_CONFIG", "1"),
            ("REQUIRED_KERNEL_ARGS", "intel_iommu=on iommu=pt"),
            ("SUPPORTED_NIC_IDS", "8086 158b 154c,15b3 1017 1018"),
            ("DRAIN_TIMEOUT_SECS", "300"),
        ])
        .unwrap();

        assert_eq!(config.platform, PlatformType::Virtual);
        assert!(config.uses_machine_config_pools());
        assert!(config.use_systemd_service);
        assert!(config.parallel_nic_config);
        assert_eq!(config.required_kernel_args, vec!["intel_iommu=on", "iommu=pt"]);
        assert_eq!(config.supported_nics.to_entries().len(), 2);
        assert!(config.supported_nics.is_supported("15b3", "1017"));
        assert_eq!(config.drain_timeout, Duration::from_secs(300));
    }

    #[test]
    fn test_hypershift_disables_pools() {
        let config = config(&[
            ("NODE_NAME", "worker-1"),
            ("CLUSTER_TYPE", "openshift"),
            ("OPENSHIFT_FLAVOR", "hypershift"),
        ])
        .unwrap();
        assert!(!config.uses_machine_config_pools());
    }

    #[test]
    fn test_invalid_values() {
        assert!(config(&[("NODE_NAME", "n"), ("PLATFORM_TYPE", "mainframe")]).is_err());
        assert!(config(&[("NODE_NAME", "n"), ("CLUSTER_TYPE", "nomad")]).is_err());
        assert!(config(&[("NODE_NAME", "n"), ("DEV_MODE", "maybe")]).is_err());
        assert!(config(&[("NODE_NAME", "n"), ("DRAIN_TIMEOUT_SECS", "soon")]).is_err());
        assert!(config(&[("NODE_NAME", "n"), ("SUPPORTED_NIC_IDS", "8086 158b")]).is_err());
    }
}
