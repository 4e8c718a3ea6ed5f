//! Kubernetes API access.
//!
//! Every API call the daemon makes goes through `ClusterClient`, scoped to
//! the daemon's own node. `KubeCluster` talks to the API server;
//! `test_utils::MockCluster` keeps the objects in memory for unit tests.

use crate::error::DaemonError;
use async_trait::async_trait;
use crds::{
    DrainState, MachineConfig, MachineConfigPool, SriovNetworkNodeState, SriovNetworkNodeStateStatus,
    DRAIN_STATE_ANNOTATION,
};
use k8s_openapi::api::core::v1::{Node, ObjectReference, Pod};
use kube::api::{DeleteParams, EvictParams, ListParams, Patch, PatchParams};
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Api, Client};
use tracing::{debug, info, warn};

/// Label selecting the SR-IOV device plugin pods.
pub const DEVICE_PLUGIN_SELECTOR: &str = "app=sriov-device-plugin";

/// Name the daemon reports events under.
pub const EVENT_REPORTER: &str = "sriov-network-config-daemon";

/// Annotation marking static (mirror) pods.
pub const MIRROR_POD_ANNOTATION: &str = "kubernetes.io/config.mirror";

/// Cluster operations used by the daemon, scoped to its node.
///
/// All async methods must be `Send` to work with Tokio's work-stealing runtime.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Fetches the node's `SriovNetworkNodeState`.
    async fn get_node_state(&self) -> Result<SriovNetworkNodeState, DaemonError>;

    /// Replaces the status of the node's `SriovNetworkNodeState`.
    async fn update_node_state_status(&self, status: &SriovNetworkNodeStateStatus) -> Result<(), DaemonError>;

    /// Fetches the Node object.
    async fn get_node(&self) -> Result<Node, DaemonError>;

    /// Sets the drain state annotation.
    ///
    /// The patch carries the `resourceVersion` of `node`, so a write based on
    /// a stale copy fails with a conflict. Returns the updated node.
    async fn annotate_node(&self, node: &Node, state: DrainState) -> Result<Node, DaemonError>;

    /// Cordons (`true`) or uncordons (`false`) the node.
    async fn set_unschedulable(&self, unschedulable: bool) -> Result<(), DaemonError>;

    /// Pods scheduled on the node, in every namespace.
    async fn list_node_pods(&self) -> Result<Vec<Pod>, DaemonError>;

    /// Evicts a pod. A pod that is already gone counts as evicted.
    async fn evict_pod(&self, namespace: &str, name: &str) -> Result<(), DaemonError>;

    /// Device plugin pods running on the node.
    async fn list_device_plugin_pods(&self) -> Result<Vec<Pod>, DaemonError>;

    /// Deletes a pod. A pod that is already gone counts as deleted.
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), DaemonError>;

    /// Whether a pod still exists.
    async fn pod_exists(&self, namespace: &str, name: &str) -> Result<bool, DaemonError>;

    /// Fetches a MachineConfig.
    async fn get_machine_config(&self, name: &str) -> Result<MachineConfig, DaemonError>;

    /// Fetches a MachineConfigPool.
    async fn get_machine_config_pool(&self, name: &str) -> Result<MachineConfigPool, DaemonError>;

    /// Sets `spec.paused` of a MachineConfigPool.
    async fn set_machine_config_pool_paused(&self, name: &str, paused: bool) -> Result<(), DaemonError>;

    /// Records a Normal event against the node state.
    async fn publish_event(&self, reason: &str, message: &str) -> Result<(), DaemonError>;
}

/// Drain state recorded on a node.
pub fn node_drain_state(node: &Node) -> DrainState {
    DrainState::from_annotation(
        node.metadata
            .annotations
            .as_ref()
            .and_then(|annotations| annotations.get(DRAIN_STATE_ANNOTATION))
            .map(String::as_str),
    )
}

/// Whether the drain state annotation is set to exactly `state`.
pub fn node_has_drain_state(node: &Node, state: DrainState) -> bool {
    node.metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(DRAIN_STATE_ANNOTATION))
        .is_some_and(|value| value == state.as_annotation())
}

/// `ClusterClient` backed by the Kubernetes API.
pub struct KubeCluster {
    client: Client,
    node_name: String,
    namespace: String,
    node_states: Api<SriovNetworkNodeState>,
    nodes: Api<Node>,
    pods: Api<Pod>,
    namespaced_pods: Api<Pod>,
    machine_configs: Api<MachineConfig>,
    machine_config_pools: Api<MachineConfigPool>,
    recorder: Recorder,
}

impl std::fmt::Debug for KubeCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeCluster")
            .field("node_name", &self.node_name)
            .field("namespace", &self.namespace)
            .finish()
    }
}

impl KubeCluster {
    /// Creates API handles for `node_name`, with namespaced objects in `namespace`.
    pub fn new(client: Client, node_name: &str, namespace: &str) -> Self {
        let reporter = Reporter {
            controller: EVENT_REPORTER.to_string(),
            instance: Some(node_name.to_string()),
        };
        Self {
            client: client.clone(),
            node_name: node_name.to_string(),
            namespace: namespace.to_string(),
            node_states: Api::namespaced(client.clone(), namespace),
            nodes: Api::all(client.clone()),
            pods: Api::all(client.clone()),
            namespaced_pods: Api::namespaced(client.clone(), namespace),
            machine_configs: Api::all(client.clone()),
            machine_config_pools: Api::all(client.clone()),
            recorder: Recorder::new(client, reporter),
        }
    }

    fn node_state_reference(&self) -> ObjectReference {
        ObjectReference {
            api_version: Some("sriovnetwork.openshift.io/v1".to_string()),
            kind: Some("SriovNetworkNodeState".to_string()),
            name: Some(self.node_name.clone()),
            namespace: Some(self.namespace.clone()),
            ..Default::default()
        }
    }

    fn pod_api(&self, namespace: &str) -> Api<Pod> {
        if namespace == self.namespace {
            return self.namespaced_pods.clone();
        }
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl ClusterClient for KubeCluster {
    async fn get_node_state(&self) -> Result<SriovNetworkNodeState, DaemonError> {
        self.node_states.get_opt(&self.node_name).await?.ok_or_else(|| {
            DaemonError::NotFound(format!("SriovNetworkNodeState {}/{}", self.namespace, self.node_name))
        })
    }

    async fn update_node_state_status(&self, status: &SriovNetworkNodeStateStatus) -> Result<(), DaemonError> {
        let status_patch = serde_json::json!({
            "status": status
        });
        let pp = PatchParams::default();
        self.node_states
            .patch_status(&self.node_name, &pp, &Patch::Merge(&status_patch))
            .await?;
        debug!("Updated status of SriovNetworkNodeState {}", self.node_name);
        Ok(())
    }

    async fn get_node(&self) -> Result<Node, DaemonError> {
        Ok(self.nodes.get(&self.node_name).await?)
    }

    async fn annotate_node(&self, node: &Node, state: DrainState) -> Result<Node, DaemonError> {
        if node_has_drain_state(node, state) {
            return Ok(node.clone());
        }
        info!("Annotating node {} with {}={}", self.node_name, DRAIN_STATE_ANNOTATION, state);

        let patch = serde_json::json!({
            "metadata": {
                "resourceVersion": node.metadata.resource_version,
                "annotations": {
                    DRAIN_STATE_ANNOTATION: state.as_annotation()
                }
            }
        });
        let pp = PatchParams::default();
        Ok(self.nodes.patch(&self.node_name, &pp, &Patch::Merge(&patch)).await?)
    }

    async fn set_unschedulable(&self, unschedulable: bool) -> Result<(), DaemonError> {
        let patch = serde_json::json!({
            "spec": {
                "unschedulable": unschedulable
            }
        });
        let pp = PatchParams::default();
        self.nodes.patch(&self.node_name, &pp, &Patch::Merge(&patch)).await?;
        Ok(())
    }

    async fn list_node_pods(&self) -> Result<Vec<Pod>, DaemonError> {
        let lp = ListParams::default().fields(&format!("spec.nodeName={}", self.node_name));
        Ok(self.pods.list(&lp).await?.items)
    }

    async fn evict_pod(&self, namespace: &str, name: &str) -> Result<(), DaemonError> {
        match self.pod_api(namespace).evict(name, &EvictParams::default()).await {
            Ok(_) => Ok(()),
            Err(e) => {
                let err = DaemonError::from(e);
                if err.is_not_found() {
                    return Ok(());
                }
                Err(err)
            }
        }
    }

    async fn list_device_plugin_pods(&self) -> Result<Vec<Pod>, DaemonError> {
        let lp = ListParams::default()
            .labels(DEVICE_PLUGIN_SELECTOR)
            .fields(&format!("spec.nodeName={}", self.node_name));
        Ok(self.namespaced_pods.list(&lp).await?.items)
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), DaemonError> {
        match self.pod_api(namespace).delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(e) => {
                let err = DaemonError::from(e);
                if err.is_not_found() {
                    return Ok(());
                }
                Err(err)
            }
        }
    }

    async fn pod_exists(&self, namespace: &str, name: &str) -> Result<bool, DaemonError> {
        Ok(self.pod_api(namespace).get_opt(name).await?.is_some())
    }

    async fn get_machine_config(&self, name: &str) -> Result<MachineConfig, DaemonError> {
        Ok(self.machine_configs.get(name).await?)
    }

    async fn get_machine_config_pool(&self, name: &str) -> Result<MachineConfigPool, DaemonError> {
        Ok(self.machine_config_pools.get(name).await?)
    }

    async fn set_machine_config_pool_paused(&self, name: &str, paused: bool) -> Result<(), DaemonError> {
        let patch = serde_json::json!({
            "spec": {
                "paused": paused
            }
        });
        let pp = PatchParams::default();
        self.machine_config_pools.patch(name, &pp, &Patch::Merge(&patch)).await?;
        Ok(())
    }

    async fn publish_event(&self, reason: &str, message: &str) -> Result<(), DaemonError> {
        let event = Event {
            type_: EventType::Normal,
            reason: reason.to_string(),
            note: Some(message.to_string()),
            action: reason.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, &self.node_state_reference()).await {
            warn!("Failed to publish {} event: {}", reason, e);
            return Err(e.into());
        }
        Ok(())
    }
}
