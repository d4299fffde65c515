use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use vmt_models::ObjectKey;

use crate::config::BackoffConfig;
use crate::retry::backoff_delay;

/// Unit of reconciliation work. Keys are re-read on dequeue, so the queue only
/// carries identity, never object snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WorkItem {
    Template(ObjectKey),
    Version(ObjectKey),
}

impl fmt::Display for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkItem::Template(k) => write!(f, "template:{k}"),
            WorkItem::Version(k) => write!(f, "version:{k}"),
        }
    }
}

#[derive(Default)]
struct QueueState {
    queue: VecDeque<WorkItem>,
    /// Items waiting to be processed, queued or parked behind an in-flight run.
    dirty: HashSet<WorkItem>,
    processing: HashSet<WorkItem>,
    failures: HashMap<WorkItem, u32>,
    shutting_down: bool,
}

/// Keyed, coalescing work queue.
///
/// An item is handed to at most one worker at a time. Adding an item that is
/// already queued is a no-op; adding one that is being processed parks it
/// until [`WorkQueue::done`] is called, after which it is queued again.
#[derive(Clone)]
pub struct WorkQueue {
    state: Arc<Mutex<QueueState>>,
    notify: Arc<Notify>,
    backoff: BackoffConfig,
}

impl WorkQueue {
    pub fn new(backoff: BackoffConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState::default())),
            notify: Arc::new(Notify::new()),
            backoff,
        }
    }

    pub async fn add(&self, item: WorkItem) {
        let mut st = self.state.lock().await;
        if st.shutting_down || !st.dirty.insert(item.clone()) {
            return;
        }
        if st.processing.contains(&item) {
            return;
        }
        st.queue.push_back(item);
        drop(st);
        self.notify.notify_one();
    }

    pub fn add_after(&self, item: WorkItem, delay: Duration) {
        if delay.is_zero() {
            let q = self.clone();
            tokio::spawn(async move { q.add(item).await });
            return;
        }
        let q = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            q.add(item).await;
        });
    }

    /// Requeue after the item's next backoff step.
    pub async fn add_rate_limited(&self, item: WorkItem) -> Duration {
        let failures = {
            let mut st = self.state.lock().await;
            let n = st.failures.entry(item.clone()).or_insert(0);
            *n = n.saturating_add(1);
            *n
        };
        let delay = backoff_delay(&self.backoff, failures);
        self.add_after(item, delay);
        delay
    }

    /// Reset the item's backoff.
    pub async fn forget(&self, item: &WorkItem) {
        self.state.lock().await.failures.remove(item);
    }

    pub async fn failures(&self, item: &WorkItem) -> u32 {
        self.state
            .lock()
            .await
            .failures
            .get(item)
            .copied()
            .unwrap_or(0)
    }

    /// Wait for the next item. Returns `None` once the queue is shut down.
    pub async fn next(&self) -> Option<WorkItem> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut st = self.state.lock().await;
                if st.shutting_down {
                    return None;
                }
                if let Some(item) = st.queue.pop_front() {
                    st.dirty.remove(&item);
                    st.processing.insert(item.clone());
                    return Some(item);
                }
            }
            notified.await;
        }
    }

    /// Mark processing of `item` finished, re-queueing it if it was added
    /// again in the meantime.
    pub async fn done(&self, item: &WorkItem) {
        let mut st = self.state.lock().await;
        st.processing.remove(item);
        if st.dirty.contains(item) && !st.shutting_down {
            st.queue.push_back(item.clone());
            drop(st);
            self.notify.notify_one();
        }
    }

    pub async fn shutdown(&self) {
        self.state.lock().await.shutting_down = true;
        self.notify.notify_waiters();
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.queue.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(name: &str) -> WorkItem {
        WorkItem::Template(ObjectKey::new("ns", name))
    }

    fn queue() -> WorkQueue {
        WorkQueue::new(BackoffConfig {
            base_ms: 5,
            max_secs: 1,
        })
    }

    #[tokio::test]
    async fn duplicate_adds_are_coalesced() {
        let q = queue();
        q.add(item("a")).await;
        q.add(item("a")).await;
        q.add(item("b")).await;
        assert_eq!(q.len().await, 2);
        assert_eq!(q.next().await, Some(item("a")));
        assert_eq!(q.next().await, Some(item("b")));
    }

    #[tokio::test]
    async fn add_while_processing_is_parked_until_done() {
        let q = queue();
        q.add(item("a")).await;
        let got = q.next().await.unwrap();

        q.add(item("a")).await;
        assert!(q.is_empty().await, "in-flight key must not be handed out twice");

        q.done(&got).await;
        assert_eq!(q.len().await, 1);
        assert_eq!(q.next().await, Some(item("a")));
    }

    #[tokio::test]
    async fn rate_limited_requeue_backs_off_and_forget_resets() {
        let q = queue();
        let it = item("flaky");
        let first = q.add_rate_limited(it.clone()).await;
        let second = q.add_rate_limited(it.clone()).await;
        assert_eq!(q.failures(&it).await, 2);
        assert!(first <= Duration::from_millis(8));
        assert!(second <= Duration::from_millis(15));

        let got = tokio::time::timeout(Duration::from_secs(1), q.next())
            .await
            .unwrap();
        assert_eq!(got, Some(it.clone()));
        q.forget(&it).await;
        assert_eq!(q.failures(&it).await, 0);
    }

    #[tokio::test]
    async fn shutdown_wakes_waiting_workers() {
        let q = queue();
        let waiter = {
            let q = q.clone();
            tokio::spawn(async move { q.next().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        q.shutdown().await;
        let res = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(res, None);
        q.add(item("late")).await;
        assert!(q.is_empty().await);
    }
}
