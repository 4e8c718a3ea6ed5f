//! Sysfs-backed host implementation
//!
//! Reads PCI and net device state from sysfs, writes VF counts and driver
//! bindings through sysfs, and shells out to `ip` and `devlink` for the
//! operations sysfs does not expose. Kernel, boot and reboot commands run
//! chrooted into the host root.

use crate::command::CommandRunner;
use crate::error::HostError;
use crate::host_trait::HostInterface;
use crate::models::PciDevice;
use crds::{is_dpdk_driver, EswitchMode, LinkType};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

const ARPHRD_ETHER: u32 = 1;
const ARPHRD_INFINIBAND: u32 = 32;
const IFF_UP: u32 = 0x1;
const UDEV_RULES_DIR: &str = "etc/udev/rules.d";
const SWITCHDEV_UDEV_RULES: &str = "20-switchdev.rules";
const REBOOT_UNIT: &str = "sriov-network-config-daemon-reboot";

/// Host access through sysfs and host tools.
#[derive(Debug, Clone)]
pub struct SysfsHost {
    fs_root: PathBuf,
    host_root: PathBuf,
    runner: CommandRunner,
    host_runner: CommandRunner,
}

impl SysfsHost {
    /// Creates a host accessor.
    ///
    /// `fs_root` prefixes `/sys` and `/proc` paths (normally `/`), `host_root`
    /// is where the host filesystem is mounted (`/host` in a container, `/`
    /// when running on the host).
    pub fn new(fs_root: impl Into<PathBuf>, host_root: impl Into<PathBuf>) -> Self {
        let host_root = host_root.into();
        Self {
            fs_root: fs_root.into(),
            host_runner: CommandRunner::chrooted(host_root.clone()),
            host_root,
            runner: CommandRunner::direct(),
        }
    }

    fn pci_devices_dir(&self) -> PathBuf {
        self.fs_root.join("sys/bus/pci/devices")
    }

    fn pci_device(&self, pci_address: &str) -> PathBuf {
        self.pci_devices_dir().join(pci_address)
    }

    fn pci_driver(&self, driver: &str) -> PathBuf {
        self.fs_root.join("sys/bus/pci/drivers").join(driver)
    }

    fn netdev(&self, name: &str) -> PathBuf {
        self.fs_root.join("sys/class/net").join(name)
    }

    fn nm_udev_rule(&self, pf_address: &str) -> PathBuf {
        self.host_root
            .join(UDEV_RULES_DIR)
            .join(format!("10-nm-disable-{}.rules", pf_address))
    }

    async fn virtfn_links(&self, pf_address: &str) -> Result<Vec<(u32, String)>, HostError> {
        let dir = self.pci_device(pf_address);
        let mut entries = fs::read_dir(&dir).await.map_err(|e| HostError::io(&dir, e))?;

        let mut vfs = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| HostError::io(&dir, e))? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(index) = name.strip_prefix("virtfn").and_then(|i| i.parse::<u32>().ok()) else {
                continue;
            };
            if let Some(address) = link_target_name(&entry.path()).await {
                vfs.push((index, address));
            }
        }
        vfs.sort_by_key(|(index, _)| *index);
        Ok(vfs)
    }
}

async fn read_trimmed(path: &Path) -> Result<String, HostError> {
    fs::read_to_string(path)
        .await
        .map(|s| s.trim().to_string())
        .map_err(|e| HostError::io(path, e))
}

async fn read_u32(path: &Path) -> Option<u32> {
    read_trimmed(path).await.ok()?.parse().ok()
}

async fn write_sysfs(path: &Path, value: &str) -> Result<(), HostError> {
    debug!("Writing {:?} to {}", value, path.display());
    fs::write(path, value).await.map_err(|e| HostError::io(path, e))
}

async fn link_target_name(path: &Path) -> Option<String> {
    let target = fs::read_link(path).await.ok()?;
    target.file_name()?.to_str().map(String::from)
}

fn parse_hex(raw: &str) -> Option<u32> {
    u32::from_str_radix(raw.trim().trim_start_matches("0x"), 16).ok()
}

fn strip_hex_prefix(raw: String) -> String {
    raw.trim_start_matches("0x").to_string()
}

/// Extracts the mode from `devlink dev eswitch show` output.
fn parse_eswitch_mode(output: &str) -> Option<EswitchMode> {
    let mut tokens = output.split_whitespace();
    tokens.find(|t| *t == "mode")?;
    match tokens.next()? {
        "switchdev" => Some(EswitchMode::Switchdev),
        "legacy" => Some(EswitchMode::Legacy),
        _ => None,
    }
}

/// Formats a GUID the way `ip link` expects it (`00:11:22:33:44:55:66:77`).
fn format_guid(guid: u64) -> String {
    guid.to_be_bytes()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}

fn nm_udev_rule_content(pf_address: &str) -> String {
    format!(
        "ACTION==\"add|change|move\", SUBSYSTEM==\"net\", KERNELS==\"{}\", ENV{{NM_UNMANAGED}}=\"1\"\n",
        pf_address
    )
}

#[async_trait::async_trait]
impl HostInterface for SysfsHost {
    async fn list_pci_devices(&self) -> Result<Vec<PciDevice>, HostError> {
        let dir = self.pci_devices_dir();
        let mut entries = fs::read_dir(&dir).await.map_err(|e| HostError::io(&dir, e))?;

        let mut devices = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| HostError::io(&dir, e))? {
            let path = entry.path();
            let class = read_trimmed(&path.join("class"))
                .await
                .ok()
                .and_then(|raw| parse_hex(&raw));
            devices.push(PciDevice {
                address: entry.file_name().to_string_lossy().into_owned(),
                class,
                vendor: read_trimmed(&path.join("vendor")).await.map(strip_hex_prefix).unwrap_or_default(),
                device: read_trimmed(&path.join("device")).await.map(strip_hex_prefix).unwrap_or_default(),
            });
        }
        devices.sort_by(|a, b| a.address.cmp(&b.address));
        Ok(devices)
    }

    async fn is_sriov_vf(&self, pci_address: &str) -> bool {
        fs::symlink_metadata(self.pci_device(pci_address).join("physfn")).await.is_ok()
    }

    async fn is_sriov_pf(&self, pci_address: &str) -> bool {
        fs::metadata(self.pci_device(pci_address).join("sriov_totalvfs")).await.is_ok()
    }

    async fn driver_name(&self, pci_address: &str) -> Option<String> {
        link_target_name(&self.pci_device(pci_address).join("driver")).await
    }

    async fn net_names(&self, pci_address: &str) -> Vec<String> {
        let dir = self.pci_device(pci_address).join("net");
        let Ok(mut entries) = fs::read_dir(&dir).await else {
            return Vec::new();
        };

        let mut names = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        names
    }

    async fn total_vfs(&self, pf_address: &str) -> u32 {
        read_u32(&self.pci_device(pf_address).join("sriov_totalvfs")).await.unwrap_or(0)
    }

    async fn num_vfs(&self, pf_address: &str) -> u32 {
        read_u32(&self.pci_device(pf_address).join("sriov_numvfs")).await.unwrap_or(0)
    }

    async fn vf_list(&self, pf_address: &str) -> Result<Vec<String>, HostError> {
        Ok(self
            .virtfn_links(pf_address)
            .await?
            .into_iter()
            .map(|(_, address)| address)
            .collect())
    }

    async fn vf_index(&self, pf_address: &str, vf_address: &str) -> Result<u32, HostError> {
        self.virtfn_links(pf_address)
            .await?
            .into_iter()
            .find(|(_, address)| address == vf_address)
            .map(|(index, _)| index)
            .ok_or_else(|| HostError::NotFound(format!("VF {} on PF {}", vf_address, pf_address)))
    }

    async fn eswitch_mode(&self, pf_address: &str) -> Option<EswitchMode> {
        let device = format!("pci/{}", pf_address);
        let output = self
            .runner
            .run("devlink", &["dev", "eswitch", "show", &device])
            .await
            .ok()?;
        parse_eswitch_mode(&output)
    }

    async fn netdev_mtu(&self, name: &str) -> Option<u32> {
        read_u32(&self.netdev(name).join("mtu")).await
    }

    async fn netdev_mac(&self, name: &str) -> Option<String> {
        read_trimmed(&self.netdev(name).join("address"))
            .await
            .ok()
            .filter(|mac| !mac.is_empty())
    }

    async fn netdev_speed(&self, name: &str) -> Option<String> {
        let raw = read_trimmed(&self.netdev(name).join("speed")).await.ok()?;
        let speed: i64 = raw.parse().ok()?;
        (speed > 0).then(|| format!("{} Mb/s", speed))
    }

    async fn link_type(&self, name: &str) -> Option<LinkType> {
        match read_u32(&self.netdev(name).join("type")).await? {
            ARPHRD_ETHER => Some(LinkType::Ethernet),
            ARPHRD_INFINIBAND => Some(LinkType::Infiniband),
            _ => None,
        }
    }

    async fn is_link_up(&self, name: &str) -> bool {
        read_trimmed(&self.netdev(name).join("flags"))
            .await
            .ok()
            .and_then(|raw| parse_hex(&raw))
            .map(|flags| flags & IFF_UP != 0)
            .unwrap_or(false)
    }

    async fn phys_switch_id(&self, name: &str) -> Option<String> {
        read_trimmed(&self.netdev(name).join("phys_switch_id"))
            .await
            .ok()
            .filter(|id| !id.is_empty())
    }

    async fn phys_port_name(&self, name: &str) -> Option<String> {
        read_trimmed(&self.netdev(name).join("phys_port_name"))
            .await
            .ok()
            .filter(|port| !port.is_empty())
    }

    async fn set_num_vfs(&self, pf_address: &str, num_vfs: u32) -> Result<(), HostError> {
        info!("Setting {} VFs on {}", num_vfs, pf_address);
        let path = self.pci_device(pf_address).join("sriov_numvfs");
        // The kernel refuses to change a non-zero VF count directly.
        write_sysfs(&path, "0").await?;
        if num_vfs > 0 {
            write_sysfs(&path, &num_vfs.to_string()).await?;
        }
        Ok(())
    }

    async fn set_netdev_mtu(&self, name: &str, mtu: u32) -> Result<(), HostError> {
        info!("Setting MTU {} on {}", mtu, name);
        write_sysfs(&self.netdev(name).join("mtu"), &mtu.to_string()).await
    }

    async fn set_link_up(&self, name: &str) -> Result<(), HostError> {
        info!("Setting link {} up", name);
        self.runner.run("ip", &["link", "set", "dev", name, "up"]).await.map(|_| ())
    }

    async fn set_vf_admin_mac(&self, pf_name: &str, vf_index: u32, mac: &str) -> Result<(), HostError> {
        let vf = vf_index.to_string();
        self.runner
            .run("ip", &["link", "set", "dev", pf_name, "vf", &vf, "mac", mac])
            .await
            .map(|_| ())
    }

    async fn set_vf_guid(&self, pf_name: &str, vf_index: u32, guid: u64) -> Result<(), HostError> {
        let vf = vf_index.to_string();
        let guid = format_guid(guid);
        self.runner
            .run("ip", &["link", "set", "dev", pf_name, "vf", &vf, "node_guid", &guid])
            .await?;
        self.runner
            .run("ip", &["link", "set", "dev", pf_name, "vf", &vf, "port_guid", &guid])
            .await
            .map(|_| ())
    }

    async fn set_eswitch_mode(&self, pf_address: &str, mode: EswitchMode) -> Result<(), HostError> {
        info!("Setting eswitch mode {} on {}", mode.as_str(), pf_address);
        let device = format!("pci/{}", pf_address);
        self.runner
            .run("devlink", &["dev", "eswitch", "set", &device, "mode", mode.as_str()])
            .await
            .map(|_| ())
    }

    async fn unbind_driver(&self, pci_address: &str) -> Result<(), HostError> {
        let Some(driver) = self.driver_name(pci_address).await else {
            debug!("Device {} has no driver bound", pci_address);
            return Ok(());
        };
        debug!("Unbinding {} from {}", pci_address, driver);
        write_sysfs(&self.pci_driver(&driver).join("unbind"), pci_address).await
    }

    async fn bind_default_driver(&self, pci_address: &str) -> Result<(), HostError> {
        if let Some(driver) = self.driver_name(pci_address).await {
            if !is_dpdk_driver(&driver) {
                return Ok(());
            }
            self.unbind_driver(pci_address).await?;
        }
        debug!("Binding {} to its default driver", pci_address);
        write_sysfs(&self.pci_device(pci_address).join("driver_override"), "\n").await?;
        write_sysfs(&self.fs_root.join("sys/bus/pci/drivers_probe"), pci_address).await
    }

    async fn bind_dpdk_driver(&self, pci_address: &str, driver: &str) -> Result<(), HostError> {
        if let Some(current) = self.driver_name(pci_address).await {
            if current == driver {
                return Ok(());
            }
            self.unbind_driver(pci_address).await?;
        }
        debug!("Binding {} to {}", pci_address, driver);
        let override_path = self.pci_device(pci_address).join("driver_override");
        write_sysfs(&override_path, driver).await?;
        write_sysfs(&self.pci_driver(driver).join("bind"), pci_address).await?;
        write_sysfs(&override_path, "\n").await
    }

    async fn add_udev_rule(&self, pf_address: &str) -> Result<(), HostError> {
        let path = self.nm_udev_rule(pf_address);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).await.map_err(|e| HostError::io(dir, e))?;
        }
        fs::write(&path, nm_udev_rule_content(pf_address))
            .await
            .map_err(|e| HostError::io(&path, e))
    }

    async fn remove_udev_rule(&self, pf_address: &str) -> Result<(), HostError> {
        let path = self.nm_udev_rule(pf_address);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(HostError::io(&path, e)),
        }
    }

    async fn write_switchdev_udev_rules(&self, content: &str) -> Result<bool, HostError> {
        let path = self.host_root.join(UDEV_RULES_DIR).join(SWITCHDEV_UDEV_RULES);
        let existing = fs::read_to_string(&path).await.ok();

        if content.is_empty() {
            if existing.is_none() {
                return Ok(false);
            }
            fs::remove_file(&path).await.map_err(|e| HostError::io(&path, e))?;
            return Ok(true);
        }

        if existing.as_deref() == Some(content) {
            return Ok(false);
        }
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).await.map_err(|e| HostError::io(dir, e))?;
        }
        fs::write(&path, content).await.map_err(|e| HostError::io(&path, e))?;
        Ok(true)
    }

    async fn is_kernel_lockdown_mode(&self) -> bool {
        read_trimmed(&self.fs_root.join("sys/kernel/security/lockdown"))
            .await
            .map(|mode| mode.contains("[integrity]") || mode.contains("[confidentiality]"))
            .unwrap_or(false)
    }

    async fn is_module_loaded(&self, name: &str) -> Result<bool, HostError> {
        let wanted = name.replace('-', "_");
        let output = self.host_runner.run("lsmod", &[]).await?;
        Ok(output
            .lines()
            .filter_map(|line| line.split_whitespace().next())
            .any(|module| module == wanted))
    }

    async fn load_kernel_module(&self, name: &str, args: &[&str]) -> Result<(), HostError> {
        info!("Loading kernel module {}", name);
        let mut modprobe_args = vec![name];
        modprobe_args.extend_from_slice(args);
        self.host_runner.run("modprobe", &modprobe_args).await.map(|_| ())
    }

    async fn kernel_cmdline(&self) -> Result<String, HostError> {
        read_trimmed(&self.fs_root.join("proc/cmdline")).await
    }

    async fn add_kernel_args(&self, args: &[String]) -> Result<(), HostError> {
        if args.is_empty() {
            return Ok(());
        }
        info!("Adding kernel arguments: {}", args.join(" "));
        let joined = format!("--args={}", args.join(" "));
        self.host_runner
            .run("grubby", &["--update-kernel=ALL", &joined])
            .await
            .map(|_| ())
    }

    async fn reboot_node(&self) -> Result<(), HostError> {
        info!("Rebooting node through transient unit {}", REBOOT_UNIT);
        self.host_runner
            .run(
                "systemd-run",
                &[
                    "--unit",
                    REBOOT_UNIT,
                    "--description",
                    "sriov-network-config-daemon reboot node",
                    "/bin/sh",
                    "-c",
                    "systemctl stop kubelet.service; reboot",
                ],
            )
            .await
            .map(|_| ())
    }
}
