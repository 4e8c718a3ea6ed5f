//! Node drain.
//!
//! Cordons the node and evicts its workloads before disruptive device
//! changes. DaemonSet pods and static (mirror) pods are left running. Both
//! steps are retried together on the drain schedule; running out of
//! attempts fails the reconcile.

use crate::backoff::RetrySchedule;
use crate::cluster::{ClusterClient, MIRROR_POD_ANNOTATION};
use crate::error::DaemonError;
use k8s_openapi::api::core::v1::Pod;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

/// Event reason for drain progress.
pub const DRAIN_EVENT_REASON: &str = "DrainNode";

/// Drain tuning.
#[derive(Debug, Clone)]
pub struct DrainSettings {
    /// Attempts and delays for cordon plus eviction
    pub schedule: RetrySchedule,
    /// Give up waiting for evicted pods after this long
    pub timeout: Duration,
    /// Poll interval while waiting for evicted pods to go away
    pub poll_interval: Duration,
}

impl DrainSettings {
    /// Default schedule with the given eviction timeout.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            schedule: RetrySchedule::DRAIN,
            timeout,
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// Cordons and drains the daemon's node.
#[derive(Clone)]
pub struct Drainer {
    cluster: Arc<dyn ClusterClient>,
    settings: DrainSettings,
}

impl std::fmt::Debug for Drainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Drainer").field("settings", &self.settings).finish()
    }
}

impl Drainer {
    pub fn new(cluster: Arc<dyn ClusterClient>, settings: DrainSettings) -> Self {
        Self { cluster, settings }
    }

    /// Cordons the node and evicts its pods, retrying on the drain schedule.
    pub async fn drain(&self) -> Result<(), DaemonError> {
        info!("Start draining node");
        self.event("Drain node has been initiated").await;

        let mut backoff = self.settings.schedule.backoff();
        let mut last_error = None;
        for attempt in 1..=self.settings.schedule.steps {
            match self.cordon_and_evict().await {
                Ok(()) => {
                    self.event("Drain node completed").await;
                    info!("Drain complete");
                    return Ok(());
                }
                Err(e) => {
                    error!("Drain attempt {}/{} failed: {}", attempt, self.settings.schedule.steps, e);
                    last_error = Some(e);
                }
            }
            if attempt < self.settings.schedule.steps {
                sleep(backoff.next_backoff()).await;
            }
        }

        self.event("Drain node failed").await;
        let last_error = last_error.map(|e| e.to_string()).unwrap_or_default();
        Err(DaemonError::DrainFailed(format!(
            "giving up after {} attempts: {}",
            self.settings.schedule.steps, last_error
        )))
    }

    /// Makes the node schedulable again.
    pub async fn uncordon(&self) -> Result<(), DaemonError> {
        info!("Uncordoning node");
        self.cluster.set_unschedulable(false).await
    }

    async fn cordon_and_evict(&self) -> Result<(), DaemonError> {
        self.cluster.set_unschedulable(true).await?;

        timeout(self.settings.timeout, self.evict_all())
            .await
            .map_err(|_| {
                DaemonError::DrainFailed(format!(
                    "pods were not evicted within {}s",
                    self.settings.timeout.as_secs()
                ))
            })?
    }

    async fn evict_all(&self) -> Result<(), DaemonError> {
        let pods: Vec<Pod> = self
            .cluster
            .list_node_pods()
            .await?
            .into_iter()
            .filter(is_evictable)
            .collect();
        debug!("Evicting {} pods", pods.len());

        for pod in pods.iter() {
            let (namespace, name) = pod_key(pod);
            self.cluster.evict_pod(namespace, name).await?;
        }

        for pod in pods.iter() {
            let (namespace, name) = pod_key(pod);
            while self.cluster.pod_exists(namespace, name).await? {
                debug!("Waiting for pod {}/{} to terminate", namespace, name);
                sleep(self.settings.poll_interval).await;
            }
        }
        Ok(())
    }

    async fn event(&self, message: &str) {
        if let Err(e) = self.cluster.publish_event(DRAIN_EVENT_REASON, message).await {
            warn!("Failed to record drain event: {}", e);
        }
    }
}

pub(crate) fn pod_key(pod: &Pod) -> (&str, &str) {
    (
        pod.metadata.namespace.as_deref().unwrap_or("default"),
        pod.metadata.name.as_deref().unwrap_or_default(),
    )
}

/// Whether a drain evicts this pod.
///
/// DaemonSet pods would be recreated on the node, mirror pods cannot be
/// evicted through the API, and finished pods hold no workload.
pub fn is_evictable(pod: &Pod) -> bool {
    let owned_by_daemonset = pod
        .metadata
        .owner_references
        .as_ref()
        .is_some_and(|owners| owners.iter().any(|owner| owner.kind == "DaemonSet"));
    let mirror = pod
        .metadata
        .annotations
        .as_ref()
        .is_some_and(|annotations| annotations.contains_key(MIRROR_POD_ANNOTATION));
    let finished = pod
        .status
        .as_ref()
        .and_then(|status| status.phase.as_deref())
        .is_some_and(|phase| phase == "Succeeded" || phase == "Failed");

    !owned_by_daemonset && !mirror && !finished
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{create_test_daemonset_pod, create_test_node, create_test_pod, ClusterCall, MockCluster};
    use std::collections::BTreeMap;

    fn fast_settings(steps: u32) -> DrainSettings {
        DrainSettings {
            schedule: RetrySchedule {
                steps,
                base: Duration::from_millis(1),
                factor: 2,
            },
            timeout: Duration::from_millis(100),
            poll_interval: Duration::from_millis(5),
        }
    }

    fn cluster_with_pods() -> MockCluster {
        let cluster = MockCluster::new(create_test_node("worker-0", None));
        cluster.add_pod(create_test_pod("apps", "web-0", "worker-0", &[]));
        cluster.add_pod(create_test_daemonset_pod("kube-system", "kube-proxy-x", "worker-0"));
        let mut mirror = create_test_pod("kube-system", "etcd-worker-0", "worker-0", &[]);
        mirror.metadata.annotations = Some(BTreeMap::from([(MIRROR_POD_ANNOTATION.to_string(), "x".to_string())]));
        cluster.add_pod(mirror);
        cluster
    }

    #[tokio::test]
    async fn test_drain_cordons_and_evicts_workloads() {
        let cluster = cluster_with_pods();
        let drainer = Drainer::new(Arc::new(cluster.clone()), fast_settings(5));

        drainer.drain().await.unwrap();

        assert!(cluster.is_unschedulable());
        assert_eq!(cluster.pod_names(), vec!["kube-proxy-x", "etcd-worker-0"]);
        let reasons: Vec<String> = cluster.events().into_iter().map(|(_, m)| m).collect();
        assert_eq!(reasons, vec!["Drain node has been initiated", "Drain node completed"]);
    }

    #[tokio::test]
    async fn test_drain_retries_failed_evictions() {
        let cluster = cluster_with_pods();
        cluster.fail_evictions(2);
        cluster.fail_cordons(1);
        let drainer = Drainer::new(Arc::new(cluster.clone()), fast_settings(5));

        drainer.drain().await.unwrap();
        assert!(cluster.calls().contains(&ClusterCall::Evict("web-0".to_string())));
    }

    #[tokio::test]
    async fn test_drain_gives_up_after_schedule() {
        let cluster = cluster_with_pods();
        cluster.fail_evictions(10);
        let drainer = Drainer::new(Arc::new(cluster.clone()), fast_settings(3));

        let result = drainer.drain().await;

        assert!(matches!(result, Err(DaemonError::DrainFailed(_))));
        let messages: Vec<String> = cluster.events().into_iter().map(|(_, m)| m).collect();
        assert_eq!(messages.last().map(String::as_str), Some("Drain node failed"));
    }

    #[tokio::test]
    async fn test_drain_times_out_on_stuck_pod() {
        let cluster = cluster_with_pods();
        cluster.keep_deleted_pods();
        let drainer = Drainer::new(Arc::new(cluster.clone()), fast_settings(1));

        let err = drainer.drain().await.unwrap_err();
        assert!(err.to_string().contains("not evicted"), "unexpected error: {}", err);
    }

    #[tokio::test]
    async fn test_uncordon() {
        let cluster = cluster_with_pods();
        let drainer = Drainer::new(Arc::new(cluster.clone()), fast_settings(1));
        drainer.drain().await.unwrap();

        drainer.uncordon().await.unwrap();
        assert!(!cluster.is_unschedulable());
    }

    #[test]
    fn test_finished_pods_are_not_evicted() {
        let mut pod = create_test_pod("apps", "job-1", "worker-0", &[]);
        assert!(is_evictable(&pod));
        pod.status = Some(k8s_openapi::api::core::v1::PodStatus {
            phase: Some("Succeeded".to_string()),
            ..Default::default()
        });
        assert!(!is_evictable(&pod));
    }
}
