//! Switchdev VF representor naming.
//!
//! PFs in switchdev mode get a udev rule naming their VF representors
//! `<pf>_<vf index>`. The rule file is rebuilt from the desired state on a
//! timer and only rewritten when its content changes.

use crate::cluster::ClusterClient;
use crate::error::DaemonError;
use crds::{EswitchMode, InterfaceSpec};
use sriov_host::HostInterface;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Interval between rule refreshes.
pub const UDEV_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

/// Builds the rule file content for the switchdev PFs in `interfaces`.
pub async fn switchdev_rules(host: &dyn HostInterface, interfaces: &[InterfaceSpec]) -> String {
    let mut content = String::new();
    for spec in interfaces
        .iter()
        .filter(|spec| spec.eswitch_mode == Some(EswitchMode::Switchdev) && !spec.name.is_empty())
    {
        let Some(switch_id) = host.phys_switch_id(&spec.name).await else {
            debug!("{} has no phys_switch_id, skipping", spec.name);
            continue;
        };
        let Some(port_name) = host.phys_port_name(&spec.name).await else {
            debug!("{} has no phys_port_name, skipping", spec.name);
            continue;
        };
        let port = port_name.trim_start_matches('p');
        content.push_str(&format!(
            "SUBSYSTEM==\"net\", ACTION==\"add|move\", ATTRS{{phys_switch_id}}==\"{}\", ATTR{{phys_port_name}}==\"pf{}vf*\", IMPORT{{program}}=\"/etc/udev/switchdev-vf-link-name.sh $attr{{phys_port_name}}\", NAME=\"{}_$env{{NUMBER}}\"\n",
            switch_id, port, spec.name
        ));
    }
    content
}

/// Periodically rewrites the switchdev rules from the node state.
pub struct UdevRefresher {
    cluster: Arc<dyn ClusterClient>,
    host: Arc<dyn HostInterface>,
    interval: Duration,
}

impl UdevRefresher {
    pub fn new(cluster: Arc<dyn ClusterClient>, host: Arc<dyn HostInterface>) -> Self {
        Self {
            cluster,
            host,
            interval: UDEV_REFRESH_INTERVAL,
        }
    }

    /// Rewrites the rules once. Returns whether the file changed.
    pub async fn refresh(&self) -> Result<bool, DaemonError> {
        let state = self.cluster.get_node_state().await?;
        let content = switchdev_rules(self.host.as_ref(), &state.spec.interfaces).await;
        let changed = self.host.write_switchdev_udev_rules(&content).await?;
        if changed {
            info!("Switchdev udev rules updated");
        }
        Ok(changed)
    }

    /// Refreshes on every tick until `stop` flips.
    pub async fn run(self, mut stop: watch::Receiver<bool>) -> Result<(), DaemonError> {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.refresh().await {
                        warn!("Failed to refresh switchdev udev rules: {}", e);
                    }
                }
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        info!("Stopping udev rule refresh");
                        return Ok(());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{create_test_node, create_test_node_state, MockCluster};
    use sriov_host::{MockDevice, MockHost};

    fn switchdev_spec(name: &str, address: &str) -> InterfaceSpec {
        InterfaceSpec {
            pci_address: address.to_string(),
            name: name.to_string(),
            num_vfs: 2,
            eswitch_mode: Some(EswitchMode::Switchdev),
            ..Default::default()
        }
    }

    fn host_with_switchdev_pf() -> MockHost {
        let host = MockHost::new();
        let mut pf = MockDevice::pf("0000:3b:00.0", "15b3", "1017", "ens2f0", 8);
        if let Some(netdev) = pf.netdev.as_mut() {
            netdev.phys_switch_id = Some("a2c4f3000003cc30".to_string());
            netdev.phys_port_name = Some("p0".to_string());
        }
        host.add_device(pf);
        host.add_device(MockDevice::pf("0000:01:00.0", "8086", "158b", "ens1f0", 8));
        host
    }

    #[tokio::test]
    async fn test_rules_only_for_switchdev_pfs() {
        let host = host_with_switchdev_pf();
        let legacy = InterfaceSpec {
            pci_address: "0000:01:00.0".to_string(),
            name: "ens1f0".to_string(),
            ..Default::default()
        };

        let content = switchdev_rules(&host, &[switchdev_spec("ens2f0", "0000:3b:00.0"), legacy]).await;

        assert_eq!(content.lines().count(), 1);
        assert!(content.contains("ATTRS{phys_switch_id}==\"a2c4f3000003cc30\""));
        assert!(content.contains("ATTR{phys_port_name}==\"pf0vf*\""));
        assert!(content.contains("NAME=\"ens2f0_$env{NUMBER}\""));
    }

    #[tokio::test]
    async fn test_refresh_writes_only_on_change() {
        let host = host_with_switchdev_pf();
        let cluster = MockCluster::new(create_test_node("worker-0", None));
        cluster.set_node_state(create_test_node_state(
            "worker-0",
            2,
            vec![switchdev_spec("ens2f0", "0000:3b:00.0")],
            vec![],
        ));
        let refresher = UdevRefresher::new(Arc::new(cluster.clone()), Arc::new(host.clone()));

        assert!(refresher.refresh().await.unwrap());
        assert!(!refresher.refresh().await.unwrap());
        assert!(host.switchdev_rules().contains("ens2f0"));

        cluster.set_node_state(create_test_node_state("worker-0", 3, vec![], vec![]));
        assert!(refresher.refresh().await.unwrap());
        assert!(host.switchdev_rules().is_empty());
    }
}
