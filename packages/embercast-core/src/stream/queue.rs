//! The per-source broadcast queue.
//!
//! A producer-only singly linked chain of [`Refbuf`] nodes. The source
//! appends at the tail; every listener owns a [`Cursor`] that only moves
//! forward. Nodes stay alive as long as any cursor still references them,
//! so evicting the head never invalidates a slow reader; the reader is
//! instead dropped by lag policy.
//!
//! Two byte bounds are maintained on append:
//!
//! - head..tail stays within `queue_size_limit` (plus the newest refbuf),
//! - the burst point advances so burst..tail stays within `burst_size`
//!   (plus one refbuf); fresh cursors start at the burst point.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;

use crate::buffer::Refbuf;

#[derive(Debug)]
struct Node {
    buf: Refbuf,
    /// Stream offset of this node's first byte.
    start: u64,
    next: RwLock<Option<Arc<Node>>>,
}

#[derive(Debug)]
struct Inner {
    head: Option<Arc<Node>>,
    tail: Option<Arc<Node>>,
    burst: Option<Arc<Node>>,
    /// Total bytes ever produced; the stream offset just past the tail.
    end: u64,
}

/// Byte-bounded broadcast queue for one source.
#[derive(Debug)]
pub struct BroadcastQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    closed: AtomicBool,
    burst_size: usize,
    queue_size_limit: usize,
}

impl BroadcastQueue {
    #[must_use]
    pub fn new(burst_size: usize, queue_size_limit: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                head: None,
                tail: None,
                burst: None,
                end: 0,
            }),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            burst_size,
            queue_size_limit,
        }
    }

    /// Appends a refbuf at the tail and wakes waiting readers.
    ///
    /// Only the source task calls this; nodes are never re-linked.
    pub fn append(&self, buf: Refbuf) {
        if buf.is_empty() {
            return;
        }
        let mut inner = self.inner.lock();
        let node = Arc::new(Node {
            start: inner.end,
            buf,
            next: RwLock::new(None),
        });
        inner.end += node.buf.len() as u64;

        match inner.tail.take() {
            Some(tail) => {
                *tail.next.write() = Some(Arc::clone(&node));
            }
            None => {
                inner.head = Some(Arc::clone(&node));
            }
        }
        inner.tail = Some(Arc::clone(&node));
        if inner.burst.is_none() {
            inner.burst = Some(node);
        }

        // Detach overflowing history; the chain stays intact for cursors
        // already holding older nodes.
        let end = inner.end;
        while let Some(head) = inner.head.clone() {
            if (end - head.start) as usize <= self.queue_size_limit {
                break;
            }
            let Some(next) = head.next.read().clone() else {
                break;
            };
            inner.head = Some(next);
        }

        // Advance the burst point to keep the replay window bounded.
        while let Some(burst) = inner.burst.clone() {
            if (end - burst.start) as usize <= self.burst_size {
                break;
            }
            let Some(next) = burst.next.read().clone() else {
                break;
            };
            inner.burst = Some(next);
        }
        if let (Some(burst), Some(head)) = (inner.burst.clone(), inner.head.clone()) {
            if burst.start < head.start {
                inner.burst = Some(head);
            }
        }
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Creates a cursor positioned at the burst point.
    #[must_use]
    pub fn attach(&self) -> Cursor {
        let inner = self.inner.lock();
        match inner.burst.clone() {
            Some(node) => Cursor {
                delivered: node.start,
                pending: Some(node),
                last: None,
            },
            None => Cursor {
                delivered: inner.end,
                pending: None,
                last: None,
            },
        }
    }

    /// Total bytes produced so far.
    #[must_use]
    pub fn total_produced(&self) -> u64 {
        self.inner.lock().end
    }

    /// Bytes currently retained from head to tail.
    #[must_use]
    pub fn depth_bytes(&self) -> usize {
        let inner = self.inner.lock();
        match &inner.head {
            Some(head) => (inner.end - head.start) as usize,
            None => 0,
        }
    }

    /// Bytes from the burst point to the tail.
    #[must_use]
    pub fn burst_depth(&self) -> usize {
        let inner = self.inner.lock();
        match &inner.burst {
            Some(burst) => (inner.end - burst.start) as usize,
            None => 0,
        }
    }

    /// Future resolving at the next append or close.
    pub fn wait(&self) -> tokio::sync::futures::Notified<'_> {
        self.notify.notified()
    }

    /// Marks the stream finished and wakes every reader.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn queue_size_limit(&self) -> usize {
        self.queue_size_limit
    }
}

impl Drop for BroadcastQueue {
    fn drop(&mut self) {
        // Unlink iteratively; a recursive Arc chain drop could overflow the
        // stack on long queues.
        let mut inner = self.inner.lock();
        inner.tail = None;
        inner.burst = None;
        let mut cur = inner.head.take();
        while let Some(node) = cur {
            cur = node.next.write().take();
        }
    }
}

/// A listener's forward-only position in the queue.
pub struct Cursor {
    /// Next node to deliver, when already resolved.
    pending: Option<Arc<Node>>,
    /// Last delivered node; its `next` link resolves the successor.
    last: Option<Arc<Node>>,
    /// Stream offset delivered so far. Strictly monotone.
    delivered: u64,
}

impl Cursor {
    /// Takes the next refbuf, or `None` when the reader has caught up.
    pub fn pop(&mut self, queue: &BroadcastQueue) -> Option<Refbuf> {
        if self.pending.is_none() {
            match &self.last {
                Some(last) => self.pending = last.next.read().clone(),
                None => {
                    // Attached to an empty queue; begin at whatever the
                    // head is now, skipping nothing older than the attach.
                    let inner = queue.inner.lock();
                    if let Some(head) = inner.head.clone() {
                        if head.start >= self.delivered {
                            self.delivered = head.start;
                            self.pending = Some(head);
                        }
                    }
                }
            }
        }
        let node = self.pending.take()?;
        self.delivered = node.start + node.buf.len() as u64;
        let buf = node.buf.clone();
        self.last = Some(node);
        Some(buf)
    }

    /// Bytes this cursor trails behind the tail.
    #[must_use]
    pub fn lag(&self, queue: &BroadcastQueue) -> u64 {
        queue.total_produced().saturating_sub(self.delivered)
    }

    /// Stream offset delivered so far.
    #[must_use]
    pub fn delivered(&self) -> u64 {
        self.delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn refbuf(len: usize) -> Refbuf {
        Refbuf::new(Bytes::from(vec![0u8; len]))
    }

    fn drain(cursor: &mut Cursor, queue: &BroadcastQueue) -> usize {
        let mut total = 0;
        while let Some(buf) = cursor.pop(queue) {
            total += buf.len();
        }
        total
    }

    #[test]
    fn late_cursor_starts_at_burst_point() {
        let queue = BroadcastQueue::new(100, 1000);
        for _ in 0..10 {
            queue.append(refbuf(50));
        }
        // 500 bytes produced; burst window holds the last 100.
        let mut cursor = queue.attach();
        assert_eq!(drain(&mut cursor, &queue), 100);
        assert_eq!(cursor.delivered(), 500);
    }

    #[test]
    fn burst_depth_stays_bounded() {
        let queue = BroadcastQueue::new(100, 1000);
        for _ in 0..50 {
            queue.append(refbuf(30));
            // bound: burst_size plus at most one refbuf
            assert!(queue.burst_depth() <= 100 + 30);
        }
    }

    #[test]
    fn queue_depth_stays_bounded() {
        let queue = BroadcastQueue::new(64, 256);
        for _ in 0..100 {
            queue.append(refbuf(32));
            assert!(queue.depth_bytes() <= 256 + 32);
        }
    }

    #[test]
    fn cursor_sees_bytes_in_order_and_only_forward() {
        let queue = BroadcastQueue::new(1024, 4096);
        let mut cursor = queue.attach();
        let mut last_delivered = cursor.delivered();
        for round in 0..20 {
            queue.append(refbuf(10 + round));
            while cursor.pop(&queue).is_some() {
                assert!(cursor.delivered() > last_delivered);
                last_delivered = cursor.delivered();
            }
        }
        assert_eq!(last_delivered, queue.total_produced());
    }

    #[test]
    fn empty_attach_catches_first_append() {
        let queue = BroadcastQueue::new(100, 1000);
        let mut cursor = queue.attach();
        assert!(cursor.pop(&queue).is_none());
        queue.append(refbuf(40));
        assert_eq!(drain(&mut cursor, &queue), 40);
    }

    #[test]
    fn slow_cursor_survives_eviction_and_reports_lag() {
        let queue = BroadcastQueue::new(32, 128);
        let mut cursor = queue.attach();
        queue.append(refbuf(64));
        assert_eq!(drain(&mut cursor, &queue), 64);
        // Push far past the queue limit without reading.
        for _ in 0..20 {
            queue.append(refbuf(64));
        }
        let lag = cursor.lag(&queue);
        assert_eq!(lag, 20 * 64);
        assert!(lag as usize > queue.queue_size_limit());
        // The chain is still walkable from the cursor's node.
        assert_eq!(drain(&mut cursor, &queue), 20 * 64);
        assert_eq!(cursor.lag(&queue), 0);
    }

    #[test]
    fn two_cursors_see_identical_suffixes() {
        let queue = BroadcastQueue::new(64, 1024);
        for i in 0..8 {
            queue.append(Refbuf::new(Bytes::from(vec![i as u8; 16])));
        }
        let mut a = queue.attach();
        let mut b = queue.attach();
        let mut bytes_a = Vec::new();
        let mut bytes_b = Vec::new();
        while let Some(buf) = a.pop(&queue) {
            bytes_a.extend_from_slice(&buf.data);
        }
        while let Some(buf) = b.pop(&queue) {
            bytes_b.extend_from_slice(&buf.data);
        }
        assert_eq!(bytes_a, bytes_b);
        assert!(bytes_a.len() <= 64 + 16);
    }

    #[test]
    fn close_is_observable() {
        let queue = BroadcastQueue::new(64, 128);
        assert!(!queue.is_closed());
        queue.close();
        assert!(queue.is_closed());
    }

    #[tokio::test]
    async fn append_wakes_waiters() {
        let queue = Arc::new(BroadcastQueue::new(64, 1024));
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                let notified = queue.wait();
                notified.await;
            })
        };
        tokio::task::yield_now().await;
        queue.append(refbuf(1));
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("waiter woke")
            .unwrap();
    }
}
