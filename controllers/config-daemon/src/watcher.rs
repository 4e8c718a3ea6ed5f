//! Kubernetes resource watchers.
//!
//! This module watches the daemon's node state, the operator config and the
//! node object. Watch callbacks never block: they enqueue a generation or
//! update shared settings, and the reconciler does the rest.

use crate::cluster::node_drain_state;
use crate::error::DaemonError;
use crate::logging::LogLevelHandle;
use crate::queue::WorkQueue;
use crds::{DrainState, SriovNetworkNodeState, SriovOperatorConfig, OPERATOR_CONFIG_NAME};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Node;
use kube::Api;
use kube_runtime::{watcher, WatchStreamExt};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// What the watch callbacks act on.
#[derive(Debug)]
pub struct WatchHandlers {
    queue: Arc<WorkQueue>,
    disable_drain: Arc<AtomicBool>,
    log_level: LogLevelHandle,
    latest_generation: AtomicI64,
    last_drain_state: Mutex<Option<DrainState>>,
    last_log_level: Mutex<Option<i32>>,
}

impl WatchHandlers {
    pub fn new(queue: Arc<WorkQueue>, disable_drain: Arc<AtomicBool>, log_level: LogLevelHandle) -> Self {
        Self {
            queue,
            disable_drain,
            log_level,
            latest_generation: AtomicI64::new(0),
            last_drain_state: Mutex::new(None),
            last_log_level: Mutex::new(None),
        }
    }

    /// Queues the generation of a node state update.
    pub fn on_node_state(&self, state: &SriovNetworkNodeState) {
        let generation = state.generation();
        self.latest_generation.fetch_max(generation, Ordering::Relaxed);
        debug!("Node state generation {} observed", generation);
        self.queue.add(generation);
    }

    /// Applies the operator config settings.
    pub fn on_operator_config(&self, config: &SriovOperatorConfig) {
        let disable_drain = config.spec.disable_drain;
        if self.disable_drain.swap(disable_drain, Ordering::Relaxed) != disable_drain {
            info!("Drain disabled: {}", disable_drain);
        }

        let level = config.spec.log_level;
        let mut last = self.last_log_level.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if *last == Some(level) {
            return;
        }
        match self.log_level.set_level(level) {
            Ok(()) => *last = Some(level),
            Err(e) => warn!("Failed to apply log level {}: {}", level, e),
        }
    }

    /// Queues the latest generation when the node's drain state changed,
    /// so a reconcile waiting for a drain slot resumes.
    pub fn on_node(&self, node: &Node) {
        let current = node_drain_state(node);
        let previous = self
            .last_drain_state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .replace(current);

        if previous.is_none_or(|previous| previous == current) {
            return;
        }
        info!("Node drain state changed to {}", current);
        let generation = self.latest_generation.load(Ordering::Relaxed);
        if generation > 0 {
            self.queue.add(generation);
        }
    }
}

/// Watches the daemon's Kubernetes resources.
pub struct Watcher {
    handlers: Arc<WatchHandlers>,
    node_name: String,
    node_state_api: Api<SriovNetworkNodeState>,
    operator_config_api: Api<SriovOperatorConfig>,
    node_api: Api<Node>,
}

impl std::fmt::Debug for Watcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watcher").field("node_name", &self.node_name).finish()
    }
}

impl Watcher {
    /// Creates a new watcher instance.
    pub fn new(
        handlers: Arc<WatchHandlers>,
        node_name: &str,
        node_state_api: Api<SriovNetworkNodeState>,
        operator_config_api: Api<SriovOperatorConfig>,
        node_api: Api<Node>,
    ) -> Self {
        Self {
            handlers,
            node_name: node_name.to_string(),
            node_state_api,
            operator_config_api,
            node_api,
        }
    }

    /// Watches the node state named after the node.
    pub async fn watch_node_state(&self, stop: watch::Receiver<bool>) -> Result<(), DaemonError> {
        info!("Starting SriovNetworkNodeState watcher");
        let config = watcher::Config::default().fields(&format!("metadata.name={}", self.node_name));
        let handlers = self.handlers.clone();

        run_watch(self.node_state_api.clone(), config, "SriovNetworkNodeState", stop, move |event| match event {
            watcher::Event::Apply(state) | watcher::Event::InitApply(state) => handlers.on_node_state(&state),
            watcher::Event::Delete(_) => warn!("SriovNetworkNodeState of this node was deleted"),
            watcher::Event::Init => debug!("SriovNetworkNodeState watcher initialized"),
            watcher::Event::InitDone => info!("SriovNetworkNodeState watcher initialization complete"),
        })
        .await
    }

    /// Watches the `default` operator config.
    pub async fn watch_operator_config(&self, stop: watch::Receiver<bool>) -> Result<(), DaemonError> {
        info!("Starting SriovOperatorConfig watcher");
        let config = watcher::Config::default().fields(&format!("metadata.name={}", OPERATOR_CONFIG_NAME));
        let handlers = self.handlers.clone();

        run_watch(self.operator_config_api.clone(), config, "SriovOperatorConfig", stop, move |event| match event {
            watcher::Event::Apply(config) | watcher::Event::InitApply(config) => handlers.on_operator_config(&config),
            watcher::Event::Delete(_) => info!("SriovOperatorConfig deleted, keeping the last settings"),
            watcher::Event::Init => debug!("SriovOperatorConfig watcher initialized"),
            watcher::Event::InitDone => debug!("SriovOperatorConfig watcher initialization complete"),
        })
        .await
    }

    /// Watches the node object for drain state changes.
    pub async fn watch_node(&self, stop: watch::Receiver<bool>) -> Result<(), DaemonError> {
        info!("Starting Node watcher");
        let config = watcher::Config::default().fields(&format!("metadata.name={}", self.node_name));
        let handlers = self.handlers.clone();

        run_watch(self.node_api.clone(), config, "Node", stop, move |event| match event {
            watcher::Event::Apply(node) | watcher::Event::InitApply(node) => handlers.on_node(&node),
            watcher::Event::Delete(_) => warn!("Node object was deleted"),
            watcher::Event::Init | watcher::Event::InitDone => {}
        })
        .await
    }
}

/// Feeds watch events to `handle` until `stop` flips. Stream errors are
/// logged and retried with the watcher's default backoff.
async fn run_watch<K, F>(
    api: Api<K>,
    config: watcher::Config,
    kind: &str,
    mut stop: watch::Receiver<bool>,
    mut handle: F,
) -> Result<(), DaemonError>
where
    K: kube::Resource + Clone + serde::de::DeserializeOwned + std::fmt::Debug + Send + 'static,
    F: FnMut(watcher::Event<K>),
{
    let mut stream = Box::pin(watcher(api, config).default_backoff());

    loop {
        tokio::select! {
            event = stream.next() => match event {
                Some(Ok(event)) => handle(event),
                Some(Err(e)) => warn!("{} watch error, retrying: {}", kind, e),
                None => {
                    return Err(DaemonError::Watch(format!("{} watch stream ended", kind)));
                }
            },
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    info!("Stopping {} watcher", kind);
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{create_test_node, create_test_node_state};
    use crds::SriovOperatorConfigSpec;

    fn handlers() -> (WatchHandlers, Arc<WorkQueue>, Arc<AtomicBool>) {
        let queue = Arc::new(WorkQueue::new());
        let disable_drain = Arc::new(AtomicBool::new(false));
        let handlers = WatchHandlers::new(queue.clone(), disable_drain.clone(), LogLevelHandle::disabled());
        (handlers, queue, disable_drain)
    }

    #[test]
    fn test_node_state_update_queues_generation() {
        let (handlers, queue, _) = handlers();

        handlers.on_node_state(&create_test_node_state("worker-0", 3, vec![], vec![]));
        handlers.on_node_state(&create_test_node_state("worker-0", 2, vec![], vec![]));

        assert_eq!(queue.pending(), Some(3));
    }

    #[test]
    fn test_operator_config_toggles_drain() {
        let (handlers, _, disable_drain) = handlers();

        let config = SriovOperatorConfig::new(
            OPERATOR_CONFIG_NAME,
            SriovOperatorConfigSpec {
                disable_drain: true,
                log_level: 2,
            },
        );
        handlers.on_operator_config(&config);
        assert!(disable_drain.load(Ordering::Relaxed));

        handlers.on_operator_config(&SriovOperatorConfig::new(OPERATOR_CONFIG_NAME, SriovOperatorConfigSpec::default()));
        assert!(!disable_drain.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn test_drain_state_change_requeues_latest_generation() {
        let (handlers, queue, _) = handlers();

        handlers.on_node(&create_test_node("worker-0", Some(DrainState::DrainRequired)));
        assert_eq!(queue.pending(), None, "First observation only records the state");

        handlers.on_node_state(&create_test_node_state("worker-0", 4, vec![], vec![]));
        assert_eq!(queue.get().await, Some(4));
        assert_eq!(queue.pending(), None);

        handlers.on_node(&create_test_node("worker-0", Some(DrainState::DrainRequired)));
        handlers.on_node(&create_test_node("worker-0", Some(DrainState::Draining)));
        assert_eq!(queue.pending(), Some(4));
    }

    #[test]
    fn test_unrelated_node_update_is_ignored() {
        let (handlers, queue, _) = handlers();
        handlers.on_node(&create_test_node("worker-0", Some(DrainState::Idle)));
        handlers.on_node(&create_test_node("worker-0", None));

        assert_eq!(queue.pending(), None);
    }
}
