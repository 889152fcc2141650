//! 有界快照队列
//!
//! 满时淘汰最旧的快照以保留最新数据，入队从不阻塞。

use ds_telemetry::record_mqtt_dropped;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// 待发布的快照。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedSnapshot {
    pub sequence: u64,
    pub timestamp_ms: i64,
    pub payload: Vec<u8>,
}

#[derive(Debug)]
pub struct SnapshotQueue {
    items: Mutex<VecDeque<QueuedSnapshot>>,
    capacity: usize,
    dropped: AtomicU64,
}

impl SnapshotQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<QueuedSnapshot>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn count_drop(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        record_mqtt_dropped(1);
    }

    /// 入队；队列已满时淘汰并返回最旧的快照。
    pub fn push(&self, snapshot: QueuedSnapshot) -> Option<QueuedSnapshot> {
        let mut items = self.lock();
        let evicted = if items.len() >= self.capacity {
            items.pop_front()
        } else {
            None
        };
        items.push_back(snapshot);
        drop(items);
        if evicted.is_some() {
            self.count_drop();
        }
        evicted
    }

    /// 发布失败的快照放回队首；若期间队列已被填满，它就是最旧的一条，直接丢弃。
    pub fn requeue(&self, snapshot: QueuedSnapshot) {
        let mut items = self.lock();
        if items.len() >= self.capacity {
            drop(items);
            self.count_drop();
            return;
        }
        items.push_front(snapshot);
    }

    pub fn pop(&self) -> Option<QueuedSnapshot> {
        self.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 累计丢弃数。
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// 队列中各快照的序号（队首在前）。
    pub fn sequences(&self) -> Vec<u64> {
        self.lock().iter().map(|item| item.sequence).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(sequence: u64) -> QueuedSnapshot {
        QueuedSnapshot {
            sequence,
            timestamp_ms: 0,
            payload: b"{}".to_vec(),
        }
    }

    #[test]
    fn full_queue_evicts_oldest() {
        let queue = SnapshotQueue::new(3);
        for sequence in 1..=3 {
            assert!(queue.push(snapshot(sequence)).is_none());
        }
        let evicted = queue.push(snapshot(4)).expect("evicted");
        assert_eq!(evicted.sequence, 1);
        assert_eq!(queue.sequences(), [2, 3, 4]);
        assert_eq!(queue.dropped(), 1);
    }

    #[test]
    fn requeue_restores_order_or_drops_when_full() {
        let queue = SnapshotQueue::new(2);
        queue.push(snapshot(1));
        queue.push(snapshot(2));
        let head = queue.pop().expect("head");
        queue.requeue(head);
        assert_eq!(queue.sequences(), [1, 2]);

        let head = queue.pop().expect("head");
        queue.push(snapshot(3));
        queue.requeue(head);
        assert_eq!(queue.sequences(), [2, 3]);
        assert_eq!(queue.dropped(), 1);
    }
}
