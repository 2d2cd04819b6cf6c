//! Bounded multi-producer single-consumer event queue
//!
//! Pushing never waits. At the high-water mark the oldest event that is not a full
//! refresh is dropped and counted.

use super::PublishEvent;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::Notify;
use tracing::warn;

pub struct EventQueue {
    events: Mutex<VecDeque<PublishEvent>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
    closed: AtomicBool,
}

impl EventQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn push(&self, event: PublishEvent) {
        {
            let mut events = self.events.lock();
            self.make_room(&mut events);
            events.push_back(event);
        }
        self.notify.notify_one();
    }

    /// Put an event at the head of the queue
    pub fn push_front(&self, event: PublishEvent) {
        {
            let mut events = self.events.lock();
            self.make_room(&mut events);
            events.push_front(event);
        }
        self.notify.notify_one();
    }

    /// Drop the oldest non-refresh event when at the high-water mark
    fn make_room(&self, events: &mut VecDeque<PublishEvent>) {
        if events.len() < self.capacity {
            return;
        }
        let victim = events.iter().position(|e| !e.is_refresh()).unwrap_or(0);
        if let Some(dropped) = events.remove(victim) {
            let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(
                "Publish queue full ({}), dropped {:?} ({} dropped so far)",
                self.capacity, dropped, total
            );
        }
    }

    pub fn pop(&self) -> Option<PublishEvent> {
        self.events.lock().pop_front()
    }

    /// Next event, waiting for one. `None` once closed and empty.
    pub async fn recv(&self) -> Option<PublishEvent> {
        loop {
            if let Some(event) = self.pop() {
                return Some(event);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            self.notify.notified().await;
        }
    }

    /// Keep only the events matching `keep`, returning how many were removed
    pub fn retain<F>(&self, keep: F) -> usize
    where
        F: FnMut(&PublishEvent) -> bool,
    {
        let mut events = self.events.lock();
        let before = events.len();
        events.retain(keep);
        before - events.len()
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use uuid::Uuid;

    fn scoped(network: &str) -> PublishEvent {
        PublishEvent::PeerUpdate {
            network: Some(network.to_string()),
            force: false,
        }
    }

    #[test]
    fn test_overflow_drops_oldest_non_refresh() {
        let queue = EventQueue::new(3);
        queue.push(PublishEvent::full_refresh());
        queue.push(scoped("a"));
        queue.push(scoped("b"));
        queue.push(scoped("c"));

        assert_eq!(queue.dropped(), 1);
        assert_eq!(queue.pop(), Some(PublishEvent::full_refresh()));
        assert_eq!(queue.pop(), Some(scoped("b")));
        assert_eq!(queue.pop(), Some(scoped("c")));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_requeue_respects_capacity() {
        let queue = EventQueue::new(2);
        queue.push(scoped("a"));
        queue.push(scoped("b"));
        queue.push_front(scoped("retry"));

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.dropped(), 1);
        assert_eq!(queue.pop(), Some(scoped("retry")));
        assert_eq!(queue.pop(), Some(scoped("b")));
    }

    #[test]
    fn test_retain_and_push_front() {
        let queue = EventQueue::new(10);
        let host_id = Uuid::new_v4();
        queue.push(scoped("a"));
        queue.push(PublishEvent::SingleHostPeerUpdate {
            host_id,
            force: false,
        });
        queue.push(PublishEvent::ServerUpdate(wgmesh_common::ServerUpdate {
            action: wgmesh_common::HostAction::Upgrade,
            version: "1".into(),
        }));

        assert_eq!(queue.retain(PublishEvent::survives_refresh), 2);
        queue.push_front(PublishEvent::full_refresh());
        assert_eq!(queue.len(), 2);
        assert!(queue.pop().unwrap().is_refresh());
    }

    #[tokio::test]
    async fn test_recv_waits_for_push() {
        let queue = Arc::new(EventQueue::new(10));
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.recv().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.push(scoped("a"));
        assert_eq!(consumer.await.unwrap(), Some(scoped("a")));
    }

    #[tokio::test]
    async fn test_close_ends_recv() {
        let queue = EventQueue::new(10);
        queue.push(scoped("a"));
        queue.close();
        assert!(queue.recv().await.is_some());
        assert!(queue.recv().await.is_none());
    }
}
