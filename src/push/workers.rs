//! Per-kind update workers. Push notifications become jobs on bounded queues
//! (drop-oldest on overflow, a sentinel stops the worker) and the workers
//! drive the synchronizer. Workers are idempotent: a target change number at
//! or below storage is a no-op inside the sync loop.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, error, warn};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::synchronizer::Synchronizer;

pub const UPDATE_QUEUE_CAPACITY: usize = 1000;

enum QueueItem<T> {
    Job(T),
    Sentinel,
}

/// Bounded FIFO with non-blocking put. Overflow drops the oldest job (a
/// later fetch covers whatever the dropped one targeted) and counts it.
pub struct UpdateQueue<T> {
    items: Mutex<VecDeque<QueueItem<T>>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
}

impl<T> UpdateQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            notify: Notify::new(),
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    pub fn push(&self, job: T) {
        {
            let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
            if items.len() >= self.capacity {
                items.pop_front();
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!("[UpdateQueue] Overflow, dropped oldest job (total dropped: {})", dropped);
            }
            items.push_back(QueueItem::Job(job));
        }
        self.notify.notify_one();
    }

    /// Stop signal. Queued jobs ahead of it still run.
    pub fn push_sentinel(&self) {
        self.items
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(QueueItem::Sentinel);
        self.notify.notify_one();
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    async fn pop(&self) -> QueueItem<T> {
        loop {
            if let Some(item) =
                self.items.lock().unwrap_or_else(|e| e.into_inner()).pop_front()
            {
                return item;
            }
            self.notify.notified().await;
        }
    }
}

/// Worker draining flag-update jobs (target change numbers).
pub struct SplitUpdateWorker {
    queue: Arc<UpdateQueue<i64>>,
    synchronizer: Arc<Synchronizer>,
}

impl SplitUpdateWorker {
    pub fn new(queue: Arc<UpdateQueue<i64>>, synchronizer: Arc<Synchronizer>) -> Self {
        Self { queue, synchronizer }
    }

    pub fn start(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match self.queue.pop().await {
                    QueueItem::Sentinel => break,
                    QueueItem::Job(target) => {
                        debug!("[SplitWorker] Fetching up to cn {}", target);
                        if let Err(e) = self.synchronizer.synchronize_splits(Some(target)).await {
                            error!("[SplitWorker] Fetch to cn {} failed: {}", target, e);
                        }
                    }
                }
            }
            debug!("[SplitWorker] Exited");
        })
    }
}

/// Worker draining segment-update jobs.
pub struct SegmentUpdateWorker {
    queue: Arc<UpdateQueue<(String, i64)>>,
    synchronizer: Arc<Synchronizer>,
}

impl SegmentUpdateWorker {
    pub fn new(queue: Arc<UpdateQueue<(String, i64)>>, synchronizer: Arc<Synchronizer>) -> Self {
        Self { queue, synchronizer }
    }

    pub fn start(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match self.queue.pop().await {
                    QueueItem::Sentinel => break,
                    QueueItem::Job((name, target)) => {
                        debug!("[SegmentWorker] Fetching `{}` up to cn {}", name, target);
                        if let Err(e) =
                            self.synchronizer.synchronize_segment(&name, Some(target)).await
                        {
                            error!("[SegmentWorker] Fetch of `{}` failed: {}", name, e);
                        }
                    }
                }
            }
            debug!("[SegmentWorker] Exited");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overflow_drops_oldest() {
        let queue: UpdateQueue<i64> = UpdateQueue::new(2);
        queue.push(1);
        queue.push(2);
        queue.push(3);
        assert_eq!(queue.dropped(), 1);
        let items = queue.items.lock().unwrap();
        let remaining: Vec<i64> = items
            .iter()
            .filter_map(|item| match item {
                QueueItem::Job(v) => Some(*v),
                QueueItem::Sentinel => None,
            })
            .collect();
        assert_eq!(remaining, vec![2, 3]);
    }

    #[tokio::test]
    async fn test_pop_waits_then_yields() {
        let queue: Arc<UpdateQueue<i64>> = Arc::new(UpdateQueue::new(8));
        let popper = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        queue.push(7);
        match popper.await.unwrap() {
            QueueItem::Job(v) => assert_eq!(v, 7),
            QueueItem::Sentinel => panic!("expected job"),
        }
    }

    #[tokio::test]
    async fn test_sentinel_passes_through() {
        let queue: Arc<UpdateQueue<i64>> = Arc::new(UpdateQueue::new(8));
        queue.push_sentinel();
        assert!(matches!(queue.pop().await, QueueItem::Sentinel));
    }
}
