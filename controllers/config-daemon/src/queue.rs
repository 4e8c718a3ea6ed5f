//! Deduplicating rate-limited work queue.
//!
//! The daemon only ever reconciles one object, its own node state, so the
//! queue holds a single slot with the newest generation seen. Bursts of
//! updates collapse into one work item. Failed items come back after an
//! exponential delay that is cleared by `forget`.

use crate::backoff::ExponentialBackoff;
use std::sync::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug)]
struct QueueState {
    pending: Option<i64>,
    last_taken: Option<i64>,
    not_before: Option<Instant>,
    backoff: ExponentialBackoff,
    shutdown: bool,
}

/// Work queue keyed by node state generation.
#[derive(Debug)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkQueue {
    /// Queue with the 1s..60s requeue backoff.
    pub fn new() -> Self {
        Self::with_backoff(ExponentialBackoff::for_requeue())
    }

    /// Queue with a custom requeue backoff.
    pub fn with_backoff(backoff: ExponentialBackoff) -> Self {
        Self {
            state: Mutex::new(QueueState {
                pending: None,
                last_taken: None,
                not_before: None,
                backoff,
                shutdown: false,
            }),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Queues `generation` for processing.
    ///
    /// An older generation never replaces a newer pending one. Only a
    /// generation newer than any pending or handed out skips a running
    /// requeue delay; re-adding a failed generation waits it out.
    pub fn add(&self, generation: i64) {
        {
            let mut state = self.lock();
            if state.shutdown {
                return;
            }
            let newest = state.pending.max(state.last_taken);
            if newest.is_none_or(|newest| generation > newest) {
                state.not_before = None;
            }
            state.pending = Some(state.pending.map_or(generation, |pending| pending.max(generation)));
        }
        self.notify.notify_one();
    }

    /// Queues `generation` again after the next backoff delay.
    pub fn add_rate_limited(&self, generation: i64) {
        {
            let mut state = self.lock();
            if state.shutdown {
                return;
            }
            let delay = state.backoff.next_backoff();
            debug!("Requeueing generation {} in {:?}", generation, delay);
            state.pending = Some(state.pending.map_or(generation, |pending| pending.max(generation)));
            let ready = Instant::now() + delay;
            state.not_before = Some(state.not_before.map_or(ready, |current| current.max(ready)));
        }
        self.notify.notify_one();
    }

    /// Clears the failure backoff after a successful reconcile.
    pub fn forget(&self) {
        self.lock().backoff.reset();
    }

    /// Number of consecutive requeues since the last `forget`.
    pub fn failures(&self) -> u32 {
        self.lock().backoff.attempts()
    }

    /// Generation waiting to be processed, if any.
    pub fn pending(&self) -> Option<i64> {
        self.lock().pending
    }

    /// Stops the queue; `get` returns `None` from now on.
    pub fn shutdown(&self) {
        self.lock().shutdown = true;
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    /// Waits for the next generation to process. `None` once shut down.
    pub async fn get(&self) -> Option<i64> {
        loop {
            let wait = {
                let mut state = self.lock();
                if state.shutdown {
                    return None;
                }
                match (state.pending, state.not_before) {
                    (Some(_), Some(ready)) if ready > Instant::now() => Some(ready - Instant::now()),
                    (Some(generation), _) => {
                        state.pending = None;
                        state.last_taken = Some(generation);
                        state.not_before = None;
                        return Some(generation);
                    }
                    (None, _) => None,
                }
            };

            match wait {
                Some(delay) => {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.notify.notified() => {}
                    }
                }
                None => self.notify.notified().await,
            }
        }
    }

    /// Like `get`, but gives up after `timeout`.
    #[cfg(test)]
    pub async fn get_timeout(&self, timeout: std::time::Duration) -> Option<i64> {
        tokio::time::timeout(timeout, self.get()).await.ok().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn fast_queue() -> WorkQueue {
        WorkQueue::with_backoff(ExponentialBackoff::new(Duration::from_millis(20), Duration::from_millis(100)))
    }

    #[tokio::test]
    async fn test_bursts_collapse_to_newest_generation() {
        let queue = fast_queue();
        queue.add(4);
        queue.add(5);
        queue.add(3);

        assert_eq!(queue.get().await, Some(5));
        assert_eq!(queue.get_timeout(Duration::from_millis(50)).await, None);
    }

    #[tokio::test]
    async fn test_add_wakes_waiting_worker() {
        let queue = Arc::new(fast_queue());
        let worker = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.add(7);

        assert_eq!(worker.await.unwrap(), Some(7));
    }

    #[tokio::test]
    async fn test_rate_limited_item_is_delayed() {
        let queue = fast_queue();
        queue.add_rate_limited(2);

        assert_eq!(queue.get_timeout(Duration::from_millis(5)).await, None);
        assert_eq!(queue.get_timeout(Duration::from_millis(200)).await, Some(2));
        assert_eq!(queue.failures(), 1);

        queue.forget();
        assert_eq!(queue.failures(), 0);
    }

    #[tokio::test]
    async fn test_new_generation_skips_backoff() {
        let queue = WorkQueue::with_backoff(ExponentialBackoff::new(Duration::from_secs(30), Duration::from_secs(60)));
        queue.add_rate_limited(2);
        queue.add(3);

        assert_eq!(queue.get_timeout(Duration::from_millis(50)).await, Some(3));
    }

    #[tokio::test]
    async fn test_same_generation_keeps_backoff() {
        let queue = WorkQueue::with_backoff(ExponentialBackoff::new(Duration::from_secs(30), Duration::from_secs(60)));
        queue.add_rate_limited(2);
        queue.add(2);

        assert_eq!(queue.get_timeout(Duration::from_millis(50)).await, None);
        assert_eq!(queue.pending(), Some(2));
    }

    #[tokio::test]
    async fn test_failed_generation_readded_after_get_keeps_backoff() {
        let queue = WorkQueue::with_backoff(ExponentialBackoff::new(Duration::from_secs(30), Duration::from_secs(60)));
        queue.add(2);
        assert_eq!(queue.get().await, Some(2));

        queue.add_rate_limited(2);
        queue.add(2);
        assert_eq!(queue.get_timeout(Duration::from_millis(50)).await, None);

        queue.add(3);
        assert_eq!(queue.get_timeout(Duration::from_millis(50)).await, Some(3));
    }

    #[tokio::test]
    async fn test_shutdown_releases_worker() {
        let queue = Arc::new(fast_queue());
        let worker = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.shutdown();

        assert_eq!(worker.await.unwrap(), None);
        queue.add(1);
        assert_eq!(queue.pending(), None);
    }
}
