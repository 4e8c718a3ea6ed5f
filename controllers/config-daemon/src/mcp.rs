//! Machine config pool pausing on OpenShift.
//!
//! The machine config operator must not roll out a new rendered config while
//! the daemon drains the node and reconfigures devices, so the node's pool is
//! paused for the duration. Pausing waits for the pool to settle first: a
//! pool that is still updating is never paused, and a pause taken by the
//! daemon is given back if the pool starts updating anyway.

use crate::cluster::{node_has_drain_state, ClusterClient};
use crate::error::DaemonError;
use crds::{DrainState, DESIRED_MACHINE_CONFIG_ANNOTATION};
use k8s_openapi::api::core::v1::Node;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

/// Pool polling tuning.
#[derive(Debug, Clone)]
pub struct McpSettings {
    /// Delay between pool reads
    pub poll_interval: Duration,
    /// Give up pausing after this long
    pub timeout: Duration,
}

impl Default for McpSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            timeout: Duration::from_secs(600),
        }
    }
}

/// Pauses and resumes the node's machine config pool.
#[derive(Clone)]
pub struct McpPauser {
    cluster: Arc<dyn ClusterClient>,
    settings: McpSettings,
}

impl std::fmt::Debug for McpPauser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpPauser").field("settings", &self.settings).finish()
    }
}

impl McpPauser {
    pub fn new(cluster: Arc<dyn ClusterClient>, settings: McpSettings) -> Self {
        Self { cluster, settings }
    }

    /// Name of the pool the node belongs to.
    ///
    /// Found through the owner of the node's desired rendered MachineConfig.
    pub async fn pool_name(&self, node: &Node) -> Result<String, DaemonError> {
        let desired_config = node
            .metadata
            .annotations
            .as_ref()
            .and_then(|annotations| annotations.get(DESIRED_MACHINE_CONFIG_ANNOTATION))
            .ok_or_else(|| {
                DaemonError::NotFound(format!("node annotation {}", DESIRED_MACHINE_CONFIG_ANNOTATION))
            })?;

        let machine_config = self.cluster.get_machine_config(desired_config).await?;
        machine_config.owning_pool().ok_or_else(|| {
            DaemonError::NotFound(format!("MachineConfigPool owning MachineConfig {}", desired_config))
        })
    }

    /// Pauses `pool` on behalf of the node and records it with the
    /// `Draining_MCP_Paused` annotation. Returns the latest node.
    pub async fn pause(&self, pool: &str, node: Node) -> Result<Node, DaemonError> {
        if node_has_drain_state(&node, DrainState::McpPaused) {
            debug!("Machine config pool {} already paused by this node", pool);
            return Ok(node);
        }

        info!("Pausing machine config pool {}", pool);
        let deadline = Instant::now() + self.settings.timeout;
        loop {
            let mcp = self.cluster.get_machine_config_pool(pool).await?;
            let node = self.cluster.get_node().await?;
            let paused_by_us = node_has_drain_state(&node, DrainState::McpPaused);

            if mcp.is_ready() {
                if mcp.is_paused() && paused_by_us {
                    info!("Machine config pool {} paused", pool);
                    return Ok(node);
                }
                if mcp.is_paused() {
                    debug!("Machine config pool {} is paused by someone else, waiting", pool);
                } else {
                    self.cluster.set_machine_config_pool_paused(pool, true).await?;
                    self.cluster.annotate_node(&node, DrainState::McpPaused).await?;
                    continue;
                }
            } else if mcp.is_paused() && paused_by_us {
                warn!("Machine config pool {} started updating, releasing the pause", pool);
                self.cluster.set_machine_config_pool_paused(pool, false).await?;
                self.cluster.annotate_node(&node, DrainState::Draining).await?;
            } else {
                debug!("Machine config pool {} is updating, waiting", pool);
            }

            if Instant::now() >= deadline {
                return Err(DaemonError::McpPauseTimeout(pool.to_string()));
            }
            sleep(self.settings.poll_interval).await;
        }
    }

    /// Unpauses `pool`.
    pub async fn resume(&self, pool: &str) -> Result<(), DaemonError> {
        info!("Resuming machine config pool {}", pool);
        self.cluster.set_machine_config_pool_paused(pool, false).await
    }
}
