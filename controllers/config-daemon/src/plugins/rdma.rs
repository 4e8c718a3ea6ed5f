//! Auxiliary plugin preparing the RDMA stack for RDMA VF groups.

use super::{PluginVerdict, VendorPlugin};
use crate::error::DaemonError;
use async_trait::async_trait;
use crds::SriovNetworkNodeState;
use sriov_host::{kernel, HostInterface};
use std::sync::Arc;
use tracing::debug;

pub struct RdmaPlugin {
    host: Arc<dyn HostInterface>,
    rdma_requested: bool,
}

impl RdmaPlugin {
    pub fn new(host: Arc<dyn HostInterface>) -> Self {
        Self {
            host,
            rdma_requested: false,
        }
    }
}

#[async_trait]
impl VendorPlugin for RdmaPlugin {
    fn name(&self) -> &str {
        "rdma"
    }

    async fn on_node_state_change(&mut self, state: &SriovNetworkNodeState) -> Result<PluginVerdict, DaemonError> {
        self.rdma_requested = state
            .spec
            .interfaces
            .iter()
            .flat_map(|spec| spec.vf_groups.iter())
            .any(|group| group.is_rdma);
        Ok(PluginVerdict::default())
    }

    async fn apply(&mut self) -> Result<(), DaemonError> {
        if !self.rdma_requested {
            debug!("No RDMA VF groups requested");
            return Ok(());
        }
        kernel::try_enable_rdma(self.host.as_ref()).await?;
        Ok(())
    }
}
