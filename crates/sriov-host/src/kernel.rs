//! Kernel module setup
//!
//! Best-effort loading of the modules SR-IOV workloads rely on. Failures are
//! logged by the callers; none of them stops the daemon.

use crate::error::HostError;
use crate::host_trait::HostInterface;
use tracing::{debug, info};

/// Modules whose presence means the host has RDMA capable NICs.
const RDMA_NIC_MODULES: &[&str] = &["mlx4_en", "mlx5_core"];

/// Modules loaded to enable RDMA.
const RDMA_MODULES: &[&str] = &["ib_core", "rdma_ucm"];

/// Loads `name` unless it is already loaded. Returns true when it was loaded now.
pub async fn ensure_module(host: &dyn HostInterface, name: &str, args: &[&str]) -> Result<bool, HostError> {
    if host.is_module_loaded(name).await? {
        debug!("Kernel module {} already loaded", name);
        return Ok(false);
    }
    info!("Loading kernel module {}", name);
    host.load_kernel_module(name, args).await?;
    Ok(true)
}

/// Loads the `tun` module.
pub async fn try_enable_tun(host: &dyn HostInterface) -> Result<(), HostError> {
    ensure_module(host, "tun", &[]).await.map(|_| ())
}

/// Loads the `vhost_net` module.
pub async fn try_enable_vhost_net(host: &dyn HostInterface) -> Result<(), HostError> {
    ensure_module(host, "vhost_net", &[]).await.map(|_| ())
}

/// Loads the RDMA core modules when an RDMA capable NIC driver is loaded.
pub async fn try_enable_rdma(host: &dyn HostInterface) -> Result<(), HostError> {
    let mut has_rdma_nic = false;
    for module in RDMA_NIC_MODULES {
        if host.is_module_loaded(module).await? {
            has_rdma_nic = true;
            break;
        }
    }
    if !has_rdma_nic {
        debug!("No RDMA capable NIC driver loaded, skipping RDMA setup");
        return Ok(());
    }

    for module in RDMA_MODULES {
        ensure_module(host, module, &[]).await?;
    }
    Ok(())
}

/// Loads the `vfio-pci` module used by DPDK VF groups.
pub async fn try_enable_vfio_pci(host: &dyn HostInterface) -> Result<(), HostError> {
    ensure_module(host, "vfio_pci", &[]).await.map(|_| ())
}
