//! Device configuration engine
//!
//! Applies the desired VF layout to physical functions. Every call to
//! [`DeviceEngine::configure_all`] partitions the observed PFs into devices
//! that need configuring, devices that are already in shape, and devices
//! that were configured by an earlier generation and must be reset.
//!
//! A device that fails half way through is reset before the error is
//! returned, unless something else owns its VFs.

use crate::error::HostError;
use crate::host_trait::HostInterface;
use crate::store::StoreManager;
use crds::{
    is_dpdk_driver, EswitchMode, InterfaceSpec, InterfaceStatus, LinkType, VfGroup, VENDOR_MELLANOX,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

const DEFAULT_ETH_MTU: u32 = 1500;
const DEFAULT_IB_MTU: u32 = 2048;

/// Engine tuning.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Configure and reset devices concurrently, one task per device
    pub parallel: bool,
    /// How long to wait for a VF net device to show up
    pub vf_ready_timeout: Duration,
    /// Poll interval while waiting for a VF net device
    pub vf_ready_interval: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            parallel: false,
            vf_ready_timeout: Duration::from_secs(10),
            vf_ready_interval: Duration::from_secs(1),
        }
    }
}

/// A PF that must be configured, with the state it was observed in.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceChange {
    pub spec: InterfaceSpec,
    pub status: InterfaceStatus,
}

/// Outcome of comparing desired and observed state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigurationPlan {
    /// PFs whose configuration must be (re)applied
    pub to_configure: Vec<DeviceChange>,
    /// PFs already matching their spec
    pub unchanged: Vec<InterfaceSpec>,
    /// PFs dropped from the desired interfaces that the engine configured earlier
    pub to_reset: Vec<InterfaceStatus>,
}

impl ConfigurationPlan {
    /// Whether applying the plan disturbs running workloads.
    pub fn requires_drain(&self) -> bool {
        !self.to_configure.is_empty() || !self.to_reset.is_empty()
    }

    /// Whether there is nothing to apply.
    pub fn is_empty(&self) -> bool {
        !self.requires_drain()
    }
}

/// Applies desired interface specs to the host.
///
/// Cloning is cheap and shares the host, the store and the initial state
/// snapshot.
#[derive(Clone)]
pub struct DeviceEngine {
    host: Arc<dyn HostInterface>,
    store: Arc<dyn StoreManager>,
    initial_state: Arc<HashMap<String, InterfaceStatus>>,
    settings: EngineSettings,
}

impl DeviceEngine {
    /// Creates an engine. `initial` is the state discovered when the daemon
    /// started; reset restores PF MTUs from it.
    pub fn new(
        host: Arc<dyn HostInterface>,
        store: Arc<dyn StoreManager>,
        initial: &[InterfaceStatus],
        settings: EngineSettings,
    ) -> Self {
        let initial_state = initial
            .iter()
            .map(|iface| (iface.pci_address.clone(), iface.clone()))
            .collect();
        Self {
            host,
            store,
            initial_state: Arc::new(initial_state),
            settings,
        }
    }

    /// Host the engine operates on.
    pub fn host(&self) -> &Arc<dyn HostInterface> {
        &self.host
    }

    /// Partitions `observed` against `desired` without touching the host.
    pub async fn plan(
        &self,
        desired: &[InterfaceSpec],
        observed: &[InterfaceStatus],
    ) -> Result<ConfigurationPlan, HostError> {
        let mut plan = ConfigurationPlan::default();

        for status in observed.iter() {
            match desired.iter().find(|spec| spec.pci_address == status.pci_address) {
                Some(spec) => {
                    if self.needs_update(spec, status).await {
                        plan.to_configure.push(DeviceChange {
                            spec: spec.clone(),
                            status: status.clone(),
                        });
                    } else {
                        debug!("Interface {} is up to date", spec.pci_address);
                        plan.unchanged.push(spec.clone());
                    }
                }
                None if status.num_vfs > 0 => match self.store.load_pf_status(&status.pci_address).await? {
                    None => info!(
                        "PF {} ({}) has VFs that were not created by the daemon, leaving it alone",
                        status.name, status.pci_address
                    ),
                    Some(persisted) if persisted.externally_managed => info!(
                        "PF {} ({}) is externally managed, leaving it alone",
                        status.name, status.pci_address
                    ),
                    Some(_) => plan.to_reset.push(status.clone()),
                },
                None => {}
            }
        }

        Ok(plan)
    }

    /// Applies `desired` to the host.
    ///
    /// Fails before touching any device when the kernel is in lockdown mode
    /// and a Mellanox device is part of the desired state.
    pub async fn configure_all(&self, desired: &[InterfaceSpec], observed: &[InterfaceStatus]) -> Result<(), HostError> {
        if has_mellanox_in_spec(desired, observed) && self.host.is_kernel_lockdown_mode().await {
            error!("Cannot use Mellanox devices when the kernel is in lockdown mode");
            return Err(HostError::LockdownMode);
        }

        for spec in desired.iter() {
            for (first, second) in spec.overlapping_vf_groups() {
                warn!(
                    "VF groups {} and {} of {} overlap, the first matching group wins",
                    spec.vf_groups[first].vf_range, spec.vf_groups[second].vf_range, spec.pci_address
                );
            }
        }

        let plan = self.plan(desired, observed).await?;
        info!(
            "Configuring {} interfaces, resetting {}, {} unchanged",
            plan.to_configure.len(),
            plan.to_reset.len(),
            plan.unchanged.len()
        );

        for spec in plan.unchanged.iter() {
            self.store.save_last_pf_applied_status(spec).await?;
        }

        if self.settings.parallel {
            let mut tasks = JoinSet::new();
            for change in plan.to_configure {
                let engine = self.clone();
                tasks.spawn(async move { engine.configure_device(&change.spec, &change.status).await });
            }
            join_all(tasks).await?;

            let mut tasks = JoinSet::new();
            for status in plan.to_reset {
                let engine = self.clone();
                tasks.spawn(async move { engine.reset_unused_device(&status).await });
            }
            join_all(tasks).await?;
        } else {
            for change in plan.to_configure.iter() {
                self.configure_device(&change.spec, &change.status).await?;
            }
            for status in plan.to_reset.iter() {
                self.reset_unused_device(status).await?;
            }
        }

        info!("SR-IOV configuration finished");
        Ok(())
    }

    /// Configures one PF and records its spec as applied.
    ///
    /// On failure the PF is reset (unless externally managed) and the
    /// original error is returned.
    pub async fn configure_device(&self, spec: &InterfaceSpec, status: &InterfaceStatus) -> Result<(), HostError> {
        info!("Configuring SR-IOV device {} with {} VFs", spec.pci_address, spec.num_vfs);

        if spec.num_vfs > status.total_vfs {
            error!(
                "Cannot configure {}: {} VFs requested, {} supported",
                spec.pci_address, spec.num_vfs, status.total_vfs
            );
            return Err(HostError::VfCountExceedsCapacity {
                pci_address: spec.pci_address.clone(),
                requested: spec.num_vfs,
                total: status.total_vfs,
            });
        }

        if let Err(e) = self.apply_device(spec, status).await {
            error!("Failed to configure {}: {}", spec.pci_address, e);
            if spec.externally_managed {
                info!("Skipping reset of {}, it is externally managed", spec.pci_address);
            } else if let Err(reset_err) = self.reset_device(status).await {
                error!("Failed to reset {} after error: {}", spec.pci_address, reset_err);
            }
            return Err(e);
        }

        self.store.save_last_pf_applied_status(spec).await
    }

    async fn apply_device(&self, spec: &InterfaceSpec, status: &InterfaceStatus) -> Result<(), HostError> {
        let address = spec.pci_address.as_str();
        let pf_name = if status.name.is_empty() { spec.name.as_str() } else { status.name.as_str() };
        let current_mode = status.eswitch_mode.unwrap_or_default();
        let desired_mode = spec.eswitch_mode.unwrap_or_default();

        if spec.num_vfs != status.num_vfs && spec.externally_managed {
            return Err(HostError::ExternallyManaged {
                pci_address: address.to_string(),
                reason: format!(
                    "{} VFs requested but {} are configured",
                    spec.num_vfs, status.num_vfs
                ),
            });
        }

        if current_mode == EswitchMode::Switchdev && desired_mode == EswitchMode::Legacy {
            info!("Switching {} back to legacy mode", address);
            self.host.set_eswitch_mode(address, EswitchMode::Legacy).await?;
        }

        if spec.num_vfs != status.num_vfs {
            self.host.add_udev_rule(address).await?;
            if let Err(e) = self.host.set_num_vfs(address, spec.num_vfs).await {
                error!("Failed to set {} VFs on {}: {}", spec.num_vfs, address, e);
                if let Err(remove_err) = self.host.remove_udev_rule(address).await {
                    error!("Failed to remove udev rule of {}: {}", address, remove_err);
                }
                return Err(e);
            }
        }

        if let Some(mtu) = spec.mtu {
            if mtu > status.mtu {
                if spec.externally_managed {
                    return Err(HostError::ExternallyManaged {
                        pci_address: address.to_string(),
                        reason: format!("requested MTU {} is above the configured {}", mtu, status.mtu),
                    });
                }
                self.host.set_netdev_mtu(pf_name, mtu).await?;
            }
        }

        if spec.num_vfs > 0 {
            let vfs = self.host.vf_list(address).await?;

            if desired_mode == EswitchMode::Switchdev && current_mode != EswitchMode::Switchdev {
                info!("Switching {} to switchdev mode", address);
                for vf in vfs.iter() {
                    self.host.unbind_driver(vf).await?;
                }
                self.host.set_eswitch_mode(address, EswitchMode::Switchdev).await?;
            }

            let link_type = spec.link_type.or(status.link_type);
            for vf in vfs.iter() {
                let index = self.host.vf_index(address, vf).await?;
                let Some(group) = spec.find_vf_group(index) else {
                    continue;
                };
                self.configure_vf(pf_name, vf, index, group, link_type).await?;
            }
        }

        if !pf_name.is_empty() && !self.host.is_link_up(pf_name).await {
            debug!("Bringing link {} up", pf_name);
            self.host.set_link_up(pf_name).await?;
        }

        Ok(())
    }

    async fn configure_vf(
        &self,
        pf_name: &str,
        vf: &str,
        index: u32,
        group: &VfGroup,
        link_type: Option<LinkType>,
    ) -> Result<(), HostError> {
        let kernel_driver = self
            .host
            .driver_name(vf)
            .await
            .filter(|driver| !is_dpdk_driver(driver));

        // Admin MAC/GUID are programmed while the kernel driver still owns the VF.
        if kernel_driver.is_some() {
            if link_type == Some(LinkType::Infiniband) {
                let guid: u64 = rand::random();
                self.host.set_vf_guid(pf_name, index, guid).await?;
                self.host.unbind_driver(vf).await?;
            } else {
                let vf_name = self.wait_vf_ready(vf).await?;
                let mac = self
                    .host
                    .netdev_mac(&vf_name)
                    .await
                    .ok_or_else(|| HostError::NotFound(format!("MAC address of {}", vf_name)))?;
                self.host.set_vf_admin_mac(pf_name, index, &mac).await?;
            }
        }

        if group.is_rdma {
            self.host.unbind_driver(vf).await?;
        }

        if is_dpdk_driver(&group.device_type) {
            self.host.bind_dpdk_driver(vf, &group.device_type).await?;
            return Ok(());
        }

        self.host.bind_default_driver(vf).await?;
        if let Some(mtu) = group.mtu.filter(|mtu| *mtu > 0) {
            let vf_name = self.wait_vf_ready(vf).await?;
            self.host.set_netdev_mtu(&vf_name, mtu).await?;
        }
        Ok(())
    }

    /// Waits for the VF net device, rebinding the default driver once if it
    /// never shows up.
    async fn wait_vf_ready(&self, vf: &str) -> Result<String, HostError> {
        if let Some(name) = self.poll_vf_netdev(vf).await {
            return Ok(name);
        }

        warn!("VF {} has no net device, rebinding to the default driver", vf);
        self.host.unbind_driver(vf).await?;
        self.host.bind_default_driver(vf).await?;

        self.poll_vf_netdev(vf)
            .await
            .ok_or_else(|| HostError::VfNotReady(vf.to_string()))
    }

    async fn poll_vf_netdev(&self, vf: &str) -> Option<String> {
        let deadline = Instant::now() + self.settings.vf_ready_timeout;
        loop {
            if let Some(name) = self.host.net_names(vf).await.into_iter().next() {
                return Some(name);
            }
            if Instant::now() >= deadline {
                return None;
            }
            sleep(self.settings.vf_ready_interval).await;
        }
    }

    /// Removes VFs from a PF the engine configured earlier.
    async fn reset_unused_device(&self, status: &InterfaceStatus) -> Result<(), HostError> {
        info!("Resetting {} ({}), it is no longer in the desired state", status.name, status.pci_address);
        self.host.remove_udev_rule(&status.pci_address).await?;
        self.reset_device(status).await
    }

    /// Returns a PF to legacy mode with no VFs and its original MTU.
    ///
    /// The MTU comes from the state captured at startup, falling back to
    /// 1500 for Ethernet and 2048 for InfiniBand.
    pub async fn reset_device(&self, status: &InterfaceStatus) -> Result<(), HostError> {
        let address = status.pci_address.as_str();

        if status.eswitch_mode == Some(EswitchMode::Switchdev) {
            self.host.set_eswitch_mode(address, EswitchMode::Legacy).await?;
        }
        self.host.set_num_vfs(address, 0).await?;

        let snapshot_mtu = self
            .initial_state
            .get(address)
            .map(|initial| initial.mtu)
            .filter(|mtu| *mtu > 0);
        let mtu = match (snapshot_mtu, status.link_type) {
            (Some(mtu), _) => mtu,
            (None, Some(LinkType::Infiniband)) => DEFAULT_IB_MTU,
            (None, Some(LinkType::Ethernet)) => DEFAULT_ETH_MTU,
            (None, None) => return Ok(()),
        };

        if !status.name.is_empty() && status.mtu != mtu {
            debug!("Restoring MTU {} on {}", mtu, status.name);
            self.host.set_netdev_mtu(&status.name, mtu).await?;
        }
        Ok(())
    }

    /// Configures a PF in a virtual machine, where the device itself is the
    /// only VF.
    pub async fn configure_virtual(&self, spec: &InterfaceSpec) -> Result<(), HostError> {
        debug!("Configuring virtual interface {}", spec.pci_address);
        if spec.num_vfs == 0 {
            return Ok(());
        }
        if spec.num_vfs > 1 {
            return Err(HostError::InvalidConfig(format!(
                "{}: only one VF per interface is possible in a virtual environment, {} requested",
                spec.pci_address, spec.num_vfs
            )));
        }
        if spec.vf_groups.len() != 1 {
            return Err(HostError::InvalidConfig(format!(
                "{}: exactly one VF group is required, found {}",
                spec.pci_address,
                spec.vf_groups.len()
            )));
        }

        let driver = spec
            .find_vf_group(0)
            .map(|group| group.device_type.as_str())
            .filter(|driver| is_dpdk_driver(driver));
        match driver {
            Some(driver) => self.host.bind_dpdk_driver(&spec.pci_address, driver).await,
            None => self.host.bind_default_driver(&spec.pci_address).await,
        }
    }

    /// Whether the PF needs its spec applied.
    ///
    /// Live drift always counts, since VFs do not survive a reboot. Without
    /// drift the desired interface is compared with the last applied one.
    async fn needs_update(&self, spec: &InterfaceSpec, status: &InterfaceStatus) -> bool {
        if spec.needs_update(status) {
            return true;
        }
        match self.store.load_pf_status(&spec.pci_address).await {
            Ok(Some(persisted)) => persisted.spec != *spec,
            Ok(None) => false,
            Err(e) => {
                warn!("Failed to load persisted status of {}: {}", spec.pci_address, e);
                true
            }
        }
    }
}

/// Whether a Mellanox device is part of the desired state.
pub fn has_mellanox_in_spec(desired: &[InterfaceSpec], observed: &[InterfaceStatus]) -> bool {
    observed.iter().any(|status| {
        status.vendor == VENDOR_MELLANOX && desired.iter().any(|spec| spec.pci_address == status.pci_address)
    })
}

async fn join_all(mut tasks: JoinSet<Result<(), HostError>>) -> Result<(), HostError> {
    let mut errors = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => errors.push(e),
            Err(e) => errors.push(HostError::Task(e.to_string())),
        }
    }
    HostError::join(errors)
}
