//! Offset waiters
//!
//! Each waiter is an event parked on a min-heap keyed by offset. When the
//! append frontier advances, every waiter below the new frontier is fired
//! in ascending offset order.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

use loam_core::Offset;

/// A one-shot event signaled when a sequence offset becomes readable.
pub struct OffsetEvent {
    set: AtomicBool,
    notify: Notify,
}

impl OffsetEvent {
    pub(crate) fn new(set: bool) -> Self {
        Self {
            set: AtomicBool::new(set),
            notify: Notify::new(),
        }
    }

    pub fn is_set(&self) -> bool {
        self.set.load(Ordering::SeqCst)
    }

    pub(crate) fn fire(&self) {
        self.set.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Wait until the event fires. Returns immediately if already set.
    pub async fn wait(&self) {
        loop {
            if self.is_set() {
                return;
            }
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register in the waiter list before re-checking, so a fire
            // between the check and the await cannot be missed.
            notified.as_mut().enable();
            if self.is_set() {
                return;
            }
            notified.await;
        }
    }
}

struct Waiter {
    offset: Offset,
    event: Arc<OffsetEvent>,
}

impl PartialEq for Waiter {
    fn eq(&self, other: &Self) -> bool {
        self.offset == other.offset
    }
}

impl Eq for Waiter {}

impl PartialOrd for Waiter {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Waiter {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reversed: BinaryHeap is a max-heap, we want the lowest offset
        // on top.
        other.offset.cmp(&self.offset)
    }
}

#[derive(Default)]
pub(crate) struct WaiterHeap {
    heap: BinaryHeap<Waiter>,
}

impl WaiterHeap {
    pub(crate) fn park(&mut self, offset: Offset, event: Arc<OffsetEvent>) {
        self.heap.push(Waiter { offset, event });
    }

    /// Fire every waiter whose offset is now below the frontier, lowest
    /// first.
    pub(crate) fn fire_through(&mut self, frontier: Offset) {
        while let Some(top) = self.heap.peek() {
            if top.offset >= frontier {
                break;
            }
            if let Some(waiter) = self.heap.pop() {
                waiter.event.fire();
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.heap.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fire_in_ascending_order() {
        let mut heap = WaiterHeap::default();
        let ev5 = Arc::new(OffsetEvent::new(false));
        let ev1 = Arc::new(OffsetEvent::new(false));
        let ev3 = Arc::new(OffsetEvent::new(false));
        heap.park(5, ev5.clone());
        heap.park(1, ev1.clone());
        heap.park(3, ev3.clone());

        heap.fire_through(4);
        assert!(ev1.is_set());
        assert!(ev3.is_set());
        assert!(!ev5.is_set());
        assert_eq!(heap.len(), 1);

        heap.fire_through(6);
        assert!(ev5.is_set());
        assert_eq!(heap.len(), 0);
    }

    #[tokio::test]
    async fn test_wait_already_set() {
        let ev = OffsetEvent::new(true);
        ev.wait().await;
    }

    #[tokio::test]
    async fn test_wait_fires() {
        let ev = Arc::new(OffsetEvent::new(false));
        let waiter = ev.clone();
        let handle = tokio::spawn(async move { waiter.wait().await });
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        ev.fire();
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .expect("waiter should wake")
            .expect("waiter should not panic");
    }
}
