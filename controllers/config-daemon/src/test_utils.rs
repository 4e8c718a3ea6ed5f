//! Test utilities for unit testing the daemon
//!
//! This module provides an in-memory `ClusterClient` and helpers for
//! creating test objects.

use crate::cluster::{ClusterClient, DEVICE_PLUGIN_SELECTOR};
use crate::config::DaemonConfig;
use crate::error::DaemonError;
use async_trait::async_trait;
use crds::*;
use k8s_openapi::api::core::v1::{Node, NodeSpec, Pod, PodSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

/// Helper to create the configuration of a bare metal Kubernetes node
pub fn create_test_config(node_name: &str) -> DaemonConfig {
    DaemonConfig::from_lookup(|key| match key {
        "NODE_NAME" => Some(node_name.to_string()),
        _ => None,
    })
    .unwrap()
}

/// Helper to create a test Node, optionally carrying a drain state
pub fn create_test_node(name: &str, state: Option<DrainState>) -> Node {
    let annotations = state.map(|state| {
        BTreeMap::from([(DRAIN_STATE_ANNOTATION.to_string(), state.as_annotation().to_string())])
    });
    Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            resource_version: Some("1".to_string()),
            annotations,
            ..Default::default()
        },
        spec: Some(NodeSpec::default()),
        status: None,
    }
}

/// Helper to create a test SriovNetworkNodeState
pub fn create_test_node_state(
    name: &str,
    generation: i64,
    interfaces: Vec<InterfaceSpec>,
    observed: Vec<InterfaceStatus>,
) -> SriovNetworkNodeState {
    let mut state = SriovNetworkNodeState::new(name, SriovNetworkNodeStateSpec { interfaces });
    state.metadata.namespace = Some("sriov-network-operator".to_string());
    state.metadata.generation = Some(generation);
    state.status = Some(SriovNetworkNodeStateStatus {
        interfaces: observed,
        ..Default::default()
    });
    state
}

/// Helper to create a test pod on a node
pub fn create_test_pod(namespace: &str, name: &str, node: &str, labels: &[(&str, &str)]) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()),
            ..Default::default()
        },
        spec: Some(PodSpec {
            node_name: Some(node.to_string()),
            ..Default::default()
        }),
        status: None,
    }
}

/// Helper to create a pod owned by a DaemonSet
pub fn create_test_daemonset_pod(namespace: &str, name: &str, node: &str) -> Pod {
    let mut pod = create_test_pod(namespace, name, node, &[]);
    pod.metadata.owner_references = Some(vec![OwnerReference {
        api_version: "apps/v1".to_string(),
        kind: "DaemonSet".to_string(),
        name: format!("{}-ds", name),
        uid: "uid".to_string(),
        ..Default::default()
    }]);
    pod
}

/// Helper to create a MachineConfig owned by a pool
pub fn create_test_machine_config(name: &str, pool: &str) -> MachineConfig {
    let mut config = MachineConfig::new(name, MachineConfigSpec::default());
    config.metadata.owner_references = Some(vec![OwnerReference {
        api_version: "machineconfiguration.openshift.io/v1".to_string(),
        kind: "MachineConfigPool".to_string(),
        name: pool.to_string(),
        uid: "uid".to_string(),
        ..Default::default()
    }]);
    config
}

/// Helper to create a MachineConfigPool, ready or still rolling out
pub fn create_test_pool(name: &str, ready: bool, paused: bool) -> MachineConfigPool {
    let conditions = if ready {
        [("Degraded", "False"), ("Updated", "True"), ("Updating", "False")]
    } else {
        [("Degraded", "False"), ("Updated", "False"), ("Updating", "True")]
    };
    let mut pool = MachineConfigPool::new(name, MachineConfigPoolSpec { paused });
    pool.status = Some(MachineConfigPoolStatus {
        conditions: conditions
            .iter()
            .map(|(t, s)| MachineConfigPoolCondition {
                type_: t.to_string(),
                status: s.to_string(),
            })
            .collect(),
    });
    pool
}

/// A cluster write recorded by `MockCluster`.
#[derive(Debug, Clone, PartialEq)]
pub enum ClusterCall {
    Annotate(DrainState),
    SetUnschedulable(bool),
    Evict(String),
    DeletePod(String),
    PausePool { name: String, paused: bool },
    Event { reason: String, message: String },
}

#[derive(Debug, Default)]
struct MockClusterState {
    node_state: Option<SriovNetworkNodeState>,
    node: Option<Node>,
    pods: Vec<Pod>,
    machine_configs: HashMap<String, MachineConfig>,
    pools: HashMap<String, MachineConfigPool>,
    pool_sequence: Vec<MachineConfigPool>,
    status_updates: Vec<SriovNetworkNodeStateStatus>,
    calls: Vec<ClusterCall>,
    evict_failures: u32,
    cordon_failures: u32,
    fail_status_updates: bool,
    keep_deleted_pods: bool,
}

/// In-memory `ClusterClient`.
#[derive(Debug, Clone, Default)]
pub struct MockCluster {
    state: Arc<Mutex<MockClusterState>>,
}

impl MockCluster {
    /// Cluster holding `node`.
    pub fn new(node: Node) -> Self {
        let cluster = Self::default();
        cluster.lock().node = Some(node);
        cluster
    }

    fn lock(&self) -> MutexGuard<'_, MockClusterState> {
        self.state.lock().unwrap()
    }

    pub fn set_node_state(&self, state: SriovNetworkNodeState) {
        self.lock().node_state = Some(state);
    }

    pub fn node_state(&self) -> Option<SriovNetworkNodeState> {
        self.lock().node_state.clone()
    }

    pub fn add_pod(&self, pod: Pod) {
        self.lock().pods.push(pod);
    }

    pub fn pod_names(&self) -> Vec<String> {
        self.lock().pods.iter().filter_map(|p| p.metadata.name.clone()).collect()
    }

    pub fn add_machine_config(&self, config: MachineConfig) {
        let name = config.metadata.name.clone().unwrap_or_default();
        self.lock().machine_configs.insert(name, config);
    }

    pub fn set_pool(&self, pool: MachineConfigPool) {
        let name = pool.metadata.name.clone().unwrap_or_default();
        self.lock().pools.insert(name, pool);
    }

    /// Pool states returned by successive `get_machine_config_pool` calls,
    /// before falling back to the stored pool.
    pub fn queue_pool_states(&self, states: Vec<MachineConfigPool>) {
        self.lock().pool_sequence = states;
    }

    pub fn pool(&self, name: &str) -> Option<MachineConfigPool> {
        self.lock().pools.get(name).cloned()
    }

    pub fn fail_evictions(&self, times: u32) {
        self.lock().evict_failures = times;
    }

    pub fn fail_cordons(&self, times: u32) {
        self.lock().cordon_failures = times;
    }

    pub fn fail_status_updates(&self) {
        self.lock().fail_status_updates = true;
    }

    /// Deleted or evicted pods stay listed, as if stuck terminating.
    pub fn keep_deleted_pods(&self) {
        self.lock().keep_deleted_pods = true;
    }

    pub fn calls(&self) -> Vec<ClusterCall> {
        self.lock().calls.clone()
    }

    pub fn status_updates(&self) -> Vec<SriovNetworkNodeStateStatus> {
        self.lock().status_updates.clone()
    }

    pub fn last_status(&self) -> Option<SriovNetworkNodeStateStatus> {
        self.lock().status_updates.last().cloned()
    }

    pub fn drain_state(&self) -> DrainState {
        self.lock()
            .node
            .as_ref()
            .map(crate::cluster::node_drain_state)
            .unwrap_or_default()
    }

    pub fn set_drain_state(&self, state: DrainState) {
        let mut guard = self.lock();
        if let Some(node) = guard.node.as_mut() {
            node.metadata
                .annotations
                .get_or_insert_with(BTreeMap::new)
                .insert(DRAIN_STATE_ANNOTATION.to_string(), state.as_annotation().to_string());
        }
    }

    pub fn is_unschedulable(&self) -> bool {
        self.lock()
            .node
            .as_ref()
            .and_then(|node| node.spec.as_ref())
            .and_then(|spec| spec.unschedulable)
            .unwrap_or(false)
    }

    pub fn events(&self) -> Vec<(String, String)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                ClusterCall::Event { reason, message } => Some((reason, message)),
                _ => None,
            })
            .collect()
    }

    fn remove_pod(state: &mut MockClusterState, namespace: &str, name: &str) {
        if state.keep_deleted_pods {
            return;
        }
        state.pods.retain(|pod| {
            !(pod.metadata.namespace.as_deref() == Some(namespace) && pod.metadata.name.as_deref() == Some(name))
        });
    }
}

#[async_trait]
impl ClusterClient for MockCluster {
    async fn get_node_state(&self) -> Result<SriovNetworkNodeState, DaemonError> {
        self.lock()
            .node_state
            .clone()
            .ok_or_else(|| DaemonError::NotFound("SriovNetworkNodeState".to_string()))
    }

    async fn update_node_state_status(&self, status: &SriovNetworkNodeStateStatus) -> Result<(), DaemonError> {
        let mut state = self.lock();
        if state.fail_status_updates {
            return Err(DaemonError::Watch("status update rejected".to_string()));
        }
        state.status_updates.push(status.clone());
        if let Some(node_state) = state.node_state.as_mut() {
            node_state.status = Some(status.clone());
        }
        Ok(())
    }

    async fn get_node(&self) -> Result<Node, DaemonError> {
        self.lock()
            .node
            .clone()
            .ok_or_else(|| DaemonError::NotFound("node".to_string()))
    }

    async fn annotate_node(&self, node: &Node, drain_state: DrainState) -> Result<Node, DaemonError> {
        let mut state = self.lock();
        let current = state
            .node
            .as_mut()
            .ok_or_else(|| DaemonError::NotFound("node".to_string()))?;
        if current.metadata.resource_version != node.metadata.resource_version {
            return Err(DaemonError::InvalidConfig("conflict: node was modified".to_string()));
        }
        current
            .metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(DRAIN_STATE_ANNOTATION.to_string(), drain_state.as_annotation().to_string());
        let version: u64 = current
            .metadata
            .resource_version
            .as_deref()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        current.metadata.resource_version = Some((version + 1).to_string());
        let updated = current.clone();
        state.calls.push(ClusterCall::Annotate(drain_state));
        Ok(updated)
    }

    async fn set_unschedulable(&self, unschedulable: bool) -> Result<(), DaemonError> {
        let mut state = self.lock();
        if unschedulable && state.cordon_failures > 0 {
            state.cordon_failures -= 1;
            return Err(DaemonError::DrainFailed("cordon rejected".to_string()));
        }
        if let Some(node) = state.node.as_mut() {
            node.spec.get_or_insert_with(NodeSpec::default).unschedulable = Some(unschedulable);
        }
        state.calls.push(ClusterCall::SetUnschedulable(unschedulable));
        Ok(())
    }

    async fn list_node_pods(&self) -> Result<Vec<Pod>, DaemonError> {
        Ok(self.lock().pods.clone())
    }

    async fn evict_pod(&self, namespace: &str, name: &str) -> Result<(), DaemonError> {
        let mut state = self.lock();
        if state.evict_failures > 0 {
            state.evict_failures -= 1;
            return Err(DaemonError::DrainFailed(format!("eviction of {} blocked by disruption budget", name)));
        }
        state.calls.push(ClusterCall::Evict(name.to_string()));
        Self::remove_pod(&mut state, namespace, name);
        Ok(())
    }

    async fn list_device_plugin_pods(&self) -> Result<Vec<Pod>, DaemonError> {
        let (key, value) = DEVICE_PLUGIN_SELECTOR.split_once('=').unwrap();
        Ok(self
            .lock()
            .pods
            .iter()
            .filter(|pod| {
                pod.metadata
                    .labels
                    .as_ref()
                    .and_then(|labels| labels.get(key))
                    .is_some_and(|v| v == value)
            })
            .cloned()
            .collect())
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), DaemonError> {
        let mut state = self.lock();
        state.calls.push(ClusterCall::DeletePod(name.to_string()));
        Self::remove_pod(&mut state, namespace, name);
        Ok(())
    }

    async fn pod_exists(&self, namespace: &str, name: &str) -> Result<bool, DaemonError> {
        Ok(self.lock().pods.iter().any(|pod| {
            pod.metadata.namespace.as_deref() == Some(namespace) && pod.metadata.name.as_deref() == Some(name)
        }))
    }

    async fn get_machine_config(&self, name: &str) -> Result<MachineConfig, DaemonError> {
        self.lock()
            .machine_configs
            .get(name)
            .cloned()
            .ok_or_else(|| DaemonError::NotFound(format!("MachineConfig {}", name)))
    }

    async fn get_machine_config_pool(&self, name: &str) -> Result<MachineConfigPool, DaemonError> {
        let mut state = self.lock();
        if !state.pool_sequence.is_empty() {
            let mut next = state.pool_sequence.remove(0);
            if let Some(stored) = state.pools.get(name) {
                next.spec.paused = stored.spec.paused;
            }
            return Ok(next);
        }
        state
            .pools
            .get(name)
            .cloned()
            .ok_or_else(|| DaemonError::NotFound(format!("MachineConfigPool {}", name)))
    }

    async fn set_machine_config_pool_paused(&self, name: &str, paused: bool) -> Result<(), DaemonError> {
        let mut state = self.lock();
        let pool = state
            .pools
            .get_mut(name)
            .ok_or_else(|| DaemonError::NotFound(format!("MachineConfigPool {}", name)))?;
        pool.spec.paused = paused;
        state.calls.push(ClusterCall::PausePool {
            name: name.to_string(),
            paused,
        });
        Ok(())
    }

    async fn publish_event(&self, reason: &str, message: &str) -> Result<(), DaemonError> {
        self.lock().calls.push(ClusterCall::Event {
            reason: reason.to_string(),
            message: message.to_string(),
        });
        Ok(())
    }
}
