//! Node state status writer.
//!
//! A single task owns writes to the node state status. The reconciler hands
//! it a sync status over a bounded channel and waits for the acknowledgment,
//! so the next work item is not processed before the status of the previous
//! one was written. Between messages the task refreshes the observed
//! interfaces every 30 seconds.

use crate::cluster::ClusterClient;
use crate::config::PlatformType;
use crate::error::DaemonError;
use chrono::Utc;
use crds::{InterfaceStatus, SriovNetworkNodeStateStatus, SyncStatus};
use sriov_host::Inventory;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

/// Interval between status refreshes.
pub const STATUS_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

const CHANNEL_CAPACITY: usize = 1;

/// A sync status to publish.
#[derive(Debug)]
struct StatusUpdate {
    sync_status: SyncStatus,
    last_sync_error: String,
    ack: oneshot::Sender<()>,
}

/// Sending side of the status writer.
#[derive(Debug, Clone)]
pub struct StatusPublisher {
    tx: mpsc::Sender<StatusUpdate>,
}

impl StatusPublisher {
    /// Publishes a sync status and waits until the writer handled it.
    pub async fn publish(&self, sync_status: SyncStatus, last_sync_error: &str) -> Result<(), DaemonError> {
        let (ack, acked) = oneshot::channel();
        self.tx
            .send(StatusUpdate {
                sync_status,
                last_sync_error: last_sync_error.to_string(),
                ack,
            })
            .await
            .map_err(|_| DaemonError::StatusWriterClosed)?;
        acked.await.map_err(|_| DaemonError::StatusWriterClosed)
    }
}

/// Task writing the node state status.
pub struct StatusWriter {
    cluster: Arc<dyn ClusterClient>,
    inventory: Inventory,
    platform: PlatformType,
    rx: mpsc::Receiver<StatusUpdate>,
    refresh_interval: Duration,
    sync_status: SyncStatus,
    last_sync_error: String,
    interfaces: Vec<InterfaceStatus>,
}

impl std::fmt::Debug for StatusWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusWriter")
            .field("platform", &self.platform)
            .field("sync_status", &self.sync_status)
            .finish()
    }
}

impl StatusWriter {
    /// Creates the writer and the publisher feeding it.
    pub fn new(
        cluster: Arc<dyn ClusterClient>,
        inventory: Inventory,
        platform: PlatformType,
    ) -> (Self, StatusPublisher) {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let writer = Self {
            cluster,
            inventory,
            platform,
            rx,
            refresh_interval: STATUS_REFRESH_INTERVAL,
            sync_status: SyncStatus::InProgress,
            last_sync_error: String::new(),
            interfaces: Vec::new(),
        };
        (writer, StatusPublisher { tx })
    }

    /// Overrides the refresh interval.
    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    /// Runs until every publisher is dropped or `stop` flips.
    pub async fn run(mut self, mut stop: watch::Receiver<bool>) -> Result<(), DaemonError> {
        info!("Starting status writer");
        self.seed_from_cluster().await;

        let mut ticker = tokio::time::interval(self.refresh_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                update = self.rx.recv() => {
                    let Some(update) = update else {
                        info!("Status writer channel closed");
                        return Ok(());
                    };
                    self.sync_status = update.sync_status;
                    self.last_sync_error = update.last_sync_error;
                    if let Err(e) = self.write().await {
                        error!("Failed to update node state status to {}: {}", self.sync_status, e);
                    }
                    // The reconciler only waits for the hand-off, not for success.
                    if update.ack.send(()).is_err() {
                        debug!("Status {} publisher went away before the acknowledgment", self.sync_status);
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.write().await {
                        warn!("Periodic node state status refresh failed: {}", e);
                    }
                }
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        info!("Stopping status writer");
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Starts from the sync status already recorded on the node state.
    async fn seed_from_cluster(&mut self) {
        match self.cluster.get_node_state().await {
            Ok(state) => {
                if let Some(status) = state.status {
                    if let Some(sync_status) = status.sync_status {
                        self.sync_status = sync_status;
                    }
                    self.last_sync_error = status.last_sync_error.unwrap_or_default();
                    self.interfaces = status.interfaces;
                }
            }
            Err(e) => debug!("No node state to seed the status writer from: {}", e),
        }
    }

    async fn discover(&self) -> Result<Vec<InterfaceStatus>, DaemonError> {
        let interfaces = match self.platform {
            PlatformType::Baremetal => self.inventory.discover().await?,
            PlatformType::Virtual => self.inventory.discover_virtual().await?,
        };
        Ok(interfaces)
    }

    /// Scans the host and writes interfaces plus the current sync status.
    ///
    /// When the scan fails the last known interfaces are written instead.
    async fn write(&mut self) -> Result<(), DaemonError> {
        match self.discover().await {
            Ok(interfaces) => self.interfaces = interfaces,
            Err(e) => warn!("Failed to discover interfaces, keeping the last known ones: {}", e),
        }

        let status = SriovNetworkNodeStateStatus {
            interfaces: self.interfaces.clone(),
            sync_status: Some(self.sync_status),
            last_sync_error: Some(self.last_sync_error.clone()),
            last_updated: Some(Utc::now()),
        };
        self.cluster.update_node_state_status(&status).await?;
        debug!("Node state status written: {}", self.sync_status);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{create_test_node, create_test_node_state, MockCluster};
    use sriov_host::{MockDevice, MockHost, MockStore, SupportedNics};

    fn writer(cluster: &MockCluster, host: &MockHost) -> (StatusWriter, StatusPublisher) {
        let inventory = Inventory::new(
            Arc::new(host.clone()),
            Arc::new(MockStore::new()),
            SupportedNics::default(),
            false,
        );
        StatusWriter::new(Arc::new(cluster.clone()), inventory, PlatformType::Baremetal)
    }

    #[tokio::test]
    async fn test_publish_waits_for_write() {
        let cluster = MockCluster::new(create_test_node("worker-0", None));
        cluster.set_node_state(create_test_node_state("worker-0", 1, vec![], vec![]));
        let host = MockHost::new();
        host.add_device(MockDevice::pf("0000:01:00.0", "8086", "158b", "ens1f0", 8));
        let (writer, publisher) = writer(&cluster, &host);
        let (_stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(writer.run(stop_rx));

        publisher.publish(SyncStatus::InProgress, "").await.unwrap();
        let status = cluster.last_status().unwrap();
        assert_eq!(status.sync_status, Some(SyncStatus::InProgress));
        assert_eq!(status.interfaces.len(), 1, "Status carries a fresh scan");

        publisher.publish(SyncStatus::Failed, "boom").await.unwrap();
        let status = cluster.last_status().unwrap();
        assert_eq!(status.sync_status, Some(SyncStatus::Failed));
        assert_eq!(status.last_sync_error.as_deref(), Some("boom"));

        drop(publisher);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_failed_write_is_still_acknowledged() {
        let cluster = MockCluster::new(create_test_node("worker-0", None));
        cluster.fail_status_updates();
        let (writer, publisher) = writer(&cluster, &MockHost::new());
        let (_stop_tx, stop_rx) = watch::channel(false);
        tokio::spawn(writer.run(stop_rx));

        publisher.publish(SyncStatus::Succeeded, "").await.unwrap();
        assert!(cluster.status_updates().is_empty());
    }

    #[tokio::test]
    async fn test_abandoned_publish_does_not_stop_writer() {
        let cluster = MockCluster::new(create_test_node("worker-0", None));
        cluster.set_node_state(create_test_node_state("worker-0", 1, vec![], vec![]));
        let (writer, publisher) = writer(&cluster, &MockHost::new());
        let (_stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(writer.run(stop_rx));

        let (ack, acked) = oneshot::channel();
        drop(acked);
        publisher
            .tx
            .send(StatusUpdate {
                sync_status: SyncStatus::InProgress,
                last_sync_error: String::new(),
                ack,
            })
            .await
            .unwrap();

        publisher.publish(SyncStatus::Succeeded, "").await.unwrap();
        assert_eq!(cluster.last_status().unwrap().sync_status, Some(SyncStatus::Succeeded));
        assert!(!task.is_finished());
    }

    #[tokio::test]
    async fn test_periodic_refresh_keeps_sync_status() {
        let cluster = MockCluster::new(create_test_node("worker-0", None));
        let host = MockHost::new();
        host.add_device(MockDevice::pf("0000:01:00.0", "8086", "158b", "ens1f0", 8));
        let (writer, publisher) = writer(&cluster, &host);
        let writer = writer.with_refresh_interval(Duration::from_millis(20));
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(writer.run(stop_rx));

        publisher.publish(SyncStatus::Succeeded, "").await.unwrap();
        tokio::time::sleep(Duration::from_millis(70)).await;

        let updates = cluster.status_updates();
        assert!(updates.len() >= 2, "Expected periodic refreshes, got {}", updates.len());
        assert!(updates.iter().skip(1).all(|s| s.sync_status == Some(SyncStatus::Succeeded)));

        stop_tx.send(true).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_closed_writer_is_an_error() {
        let cluster = MockCluster::new(create_test_node("worker-0", None));
        let (writer, publisher) = writer(&cluster, &MockHost::new());
        drop(writer);

        let result = publisher.publish(SyncStatus::Succeeded, "").await;
        assert!(matches!(result, Err(DaemonError::StatusWriterClosed)));
    }
}
