//! SR-IOV Config Daemon
//!
//! Runs on every node and applies the node's `SriovNetworkNodeState` to its
//! SR-IOV devices: VF counts, MTUs, driver bindings and eswitch modes.
//! Disruptive changes are coordinated with the cluster by draining the node
//! and, on OpenShift, pausing its machine config pool.
//!
//! `sriov-config-daemon service` runs the one-shot systemd service mode
//! instead, applying the configuration the daemon left on the host.

mod backoff;
mod cluster;
mod config;
mod controller;
mod drain;
mod error;
mod logging;
mod mcp;
mod plugins;
mod queue;
mod reconciler;
mod service;
mod status;
mod systemd;
mod udev;
mod watcher;

#[cfg(test)]
mod test_utils;

use crate::config::DaemonConfig;
use controller::Controller;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let log_level = logging::init();

    // Install the rustls crypto provider before any TLS client is built.
    if rustls::crypto::ring::default_provider().install_default().is_err() {
        warn!("A rustls crypto provider was already installed");
    }

    let service_mode = std::env::args().nth(1).as_deref() == Some("service");
    let config = if service_mode {
        // The service runs on the host itself, before the kubelet starts.
        DaemonConfig::from_lookup(|key| {
            std::env::var(key).ok().or_else(|| match key {
                "NODE_NAME" => hostname(),
                "HOST_ROOT" => Some("/".to_string()),
                _ => None,
            })
        })?
    } else {
        DaemonConfig::from_env()?
    };

    info!("Configuration:");
    info!("  Node: {}", config.node_name);
    info!("  Namespace: {}", config.namespace);
    info!("  Platform: {:?}", config.platform);
    info!("  Cluster type: {:?} (hypershift: {})", config.cluster_type, config.hypershift);
    info!("  Systemd service mode: {}", config.use_systemd_service);
    info!("  Parallel NIC config: {}", config.parallel_nic_config);
    info!("  Host root: {}", config.host_root.display());
    info!("  Drain timeout: {}s", config.drain_timeout.as_secs());

    if service_mode {
        info!("Starting SR-IOV config service");
        return service::run(&config).await;
    }

    info!("Starting SR-IOV config daemon");
    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received");
        let _ = stop_tx.send(true);
    });

    let controller = Controller::new(config, log_level, stop_rx).await?;
    controller.run().await?;

    info!("SR-IOV config daemon stopped");
    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

fn hostname() -> Option<String> {
    std::fs::read_to_string("/etc/hostname")
        .ok()
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
}
