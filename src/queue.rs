//! Bounded outbound message queue
//!
//! Many producers, one consumer. Producers never block: [`OutboundQueue::enqueue`]
//! rejects when the queue is at capacity. The delivery worker peeks the head,
//! and removes it only after the broker has confirmed the publish, so a message
//! stays queued across any number of failed attempts.

use crate::observability::metrics::metrics;
use std::collections::{TryReserveError, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

/// Largest payload a [`Message`] can carry.
///
/// 48 bytes base64-encode to exactly 64 bytes, the encode buffer capacity.
pub const MAX_PAYLOAD_SIZE: usize = 48;

/// Default bounded wait for [`OutboundQueue::peek_head`]
pub const DEFAULT_PEEK_TIMEOUT: Duration = Duration::from_millis(1000);

/// Queue construction errors
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Queue capacity must be greater than zero")]
    ZeroCapacity,
    #[error("Could not allocate queue storage for {capacity} messages")]
    Allocation {
        capacity: usize,
        #[source]
        source: TryReserveError,
    },
}

/// One outbound telemetry record
///
/// Immutable once built. `port` is the routing tag and becomes the last
/// segment of the destination topic. Equality compares content only; the
/// queue tells identical records apart by [`Message::seq`].
#[derive(Clone)]
pub struct Message {
    payload: [u8; MAX_PAYLOAD_SIZE],
    len: usize,
    port: u8,
    seq: u64,
}

impl Message {
    /// Build a message, or `None` when `payload` exceeds [`MAX_PAYLOAD_SIZE`]
    pub fn new(payload: &[u8], port: u8) -> Option<Self> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return None;
        }
        let mut buf = [0u8; MAX_PAYLOAD_SIZE];
        buf[..payload.len()].copy_from_slice(payload);
        Some(Self {
            payload: buf,
            len: payload.len(),
            port,
            seq: 0,
        })
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn port(&self) -> u8 {
        self.port
    }

    /// Position assigned at enqueue, unique for the life of the queue.
    /// Zero until the message has been accepted.
    pub fn seq(&self) -> u64 {
        self.seq
    }
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.port == other.port && self.payload() == other.payload()
    }
}

impl Eq for Message {}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("port", &self.port)
            .field("len", &self.len)
            .field("seq", &self.seq)
            .field("payload", &hex::encode(self.payload()))
            .finish()
    }
}

/// Fixed-capacity FIFO of pending messages
pub struct OutboundQueue {
    items: Mutex<VecDeque<Message>>,
    next_seq: AtomicU64,
    capacity: usize,
    available: Notify,
}

impl OutboundQueue {
    /// Allocate storage for `capacity` messages up front.
    ///
    /// Failure here is the only fatal error of the bridge.
    pub fn new(capacity: usize) -> Result<Self, QueueError> {
        if capacity == 0 {
            return Err(QueueError::ZeroCapacity);
        }

        let mut items = VecDeque::new();
        items
            .try_reserve_exact(capacity)
            .map_err(|source| QueueError::Allocation { capacity, source })?;

        info!(
            capacity,
            bytes = capacity * MAX_PAYLOAD_SIZE,
            "Outbound queue created"
        );

        Ok(Self {
            items: Mutex::new(items),
            next_seq: AtomicU64::new(1),
            capacity,
            available: Notify::new(),
        })
    }

    // A poisoned lock only means a producer panicked mid-call; every operation
    // leaves the deque consistent, so keep going with the inner value.
    fn lock(&self) -> MutexGuard<'_, VecDeque<Message>> {
        self.items
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append `message` without blocking. Returns false if the queue is full.
    pub fn enqueue(&self, mut message: Message) -> bool {
        let depth = {
            let mut items = self.lock();
            if items.len() >= self.capacity {
                drop(items);
                warn!(capacity = self.capacity, "Outbound queue is full, message rejected");
                metrics().record_enqueue_rejected();
                return false;
            }
            // Assigned under the lock so sequence order matches queue order
            message.seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
            items.push_back(message);
            items.len()
        };

        metrics().record_enqueued(depth);
        self.available.notify_one();
        true
    }

    /// Wait up to `timeout` for a message and return a copy of the head.
    ///
    /// The message stays queued. Intended for the single consumer.
    pub async fn peek_head(&self, timeout: Duration) -> Option<Message> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(head) = self.lock().front().cloned() {
                return Some(head);
            }
            // notify_one stores a permit, so an enqueue between the check
            // above and this wait is not missed.
            if tokio::time::timeout_at(deadline, self.available.notified())
                .await
                .is_err()
            {
                return self.lock().front().cloned();
            }
        }
    }

    /// Non-waiting variant of [`peek_head`](Self::peek_head)
    pub fn try_peek_head(&self) -> Option<Message> {
        self.lock().front().cloned()
    }

    /// Remove the head after its delivery has been confirmed.
    pub fn remove_head(&self) -> Option<Message> {
        let (removed, depth) = {
            let mut items = self.lock();
            let removed = items.pop_front();
            (removed, items.len())
        };

        match removed {
            Some(message) => {
                metrics().set_queue_depth(depth);
                Some(message)
            }
            None => {
                error!("remove_head called on an empty outbound queue");
                None
            }
        }
    }

    /// Remove the head only if it is still the very entry that was `delivered`.
    ///
    /// A flush between peek and commit means the delivered entry is no longer
    /// queued, and whatever sits at the head now has not been sent yet, even
    /// when its content is identical.
    pub fn commit_head(&self, delivered: &Message) -> bool {
        let depth = {
            let mut items = self.lock();
            if items.front().map(Message::seq) != Some(delivered.seq) {
                drop(items);
                debug!("Delivered message no longer at queue head, nothing to commit");
                return false;
            }
            items.pop_front();
            items.len()
        };

        metrics().set_queue_depth(depth);
        true
    }

    /// Discard everything queued. Returns how many messages were dropped.
    pub fn reset(&self) -> usize {
        let dropped = {
            let mut items = self.lock();
            let dropped = items.len();
            items.clear();
            dropped
        };

        if dropped > 0 {
            info!(dropped, "Outbound queue flushed");
        } else {
            debug!("Outbound queue flush requested on empty queue");
        }
        metrics().record_flushed(dropped);
        dropped
    }

    pub fn depth(&self) -> usize {
        self.lock().len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.depth() >= self.capacity
    }
}

impl std::fmt::Debug for OutboundQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundQueue")
            .field("depth", &self.depth())
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    fn msg(tag: u8) -> Message {
        Message::new(&[tag, tag.wrapping_add(1)], tag).unwrap()
    }

    #[test]
    fn test_zero_capacity_rejected() {
        assert!(matches!(OutboundQueue::new(0), Err(QueueError::ZeroCapacity)));
    }

    #[test]
    fn test_message_rejects_oversized_payload() {
        assert!(Message::new(&[0u8; MAX_PAYLOAD_SIZE], 1).is_some());
        assert!(Message::new(&[0u8; MAX_PAYLOAD_SIZE + 1], 1).is_none());
    }

    #[test]
    fn test_message_accessors() {
        let message = Message::new(&[1, 2, 3], 9).unwrap();
        assert_eq!(message.payload(), &[1, 2, 3]);
        assert_eq!(message.len(), 3);
        assert_eq!(message.port(), 9);
        assert!(!message.is_empty());
    }

    #[test]
    fn test_enqueue_until_full() {
        let queue = OutboundQueue::new(3).unwrap();
        for i in 0..3 {
            assert!(queue.enqueue(msg(i)));
            assert_eq!(queue.depth(), i as usize + 1);
        }
        assert!(queue.is_full());
        assert!(!queue.enqueue(msg(3)));
        assert_eq!(queue.depth(), 3);
    }

    #[test]
    fn test_reject_leaves_contents_untouched() {
        let queue = OutboundQueue::new(2).unwrap();
        queue.enqueue(msg(1));
        queue.enqueue(msg(2));
        let head_before = queue.try_peek_head();

        let started = Instant::now();
        assert!(!queue.enqueue(msg(3)));
        assert!(started.elapsed() < Duration::from_millis(100));

        assert_eq!(queue.depth(), 2);
        assert_eq!(queue.try_peek_head(), head_before);
    }

    #[test]
    fn test_remove_head_is_fifo() {
        let queue = OutboundQueue::new(4).unwrap();
        for i in 0..4 {
            queue.enqueue(msg(i));
        }
        for i in 0..4 {
            assert_eq!(queue.remove_head(), Some(msg(i)));
        }
        assert_eq!(queue.depth(), 0);
    }

    #[test]
    fn test_remove_head_on_empty_returns_none() {
        let queue = OutboundQueue::new(1).unwrap();
        assert_eq!(queue.remove_head(), None);
    }

    #[test]
    fn test_commit_head_skips_after_flush() {
        let queue = OutboundQueue::new(4).unwrap();
        queue.enqueue(msg(1));
        let delivered = queue.try_peek_head().unwrap();

        queue.reset();
        queue.enqueue(msg(2));
        assert!(!queue.commit_head(&delivered));
        assert_eq!(queue.depth(), 1);

        let head = queue.try_peek_head().unwrap();
        assert!(queue.commit_head(&head));
        assert_eq!(queue.depth(), 0);
    }

    #[test]
    fn test_commit_head_skips_identical_message_enqueued_after_flush() {
        let queue = OutboundQueue::new(4).unwrap();
        let counter = Message::new(&[5, 0], 1).unwrap();
        queue.enqueue(counter.clone());
        let delivered = queue.try_peek_head().unwrap();

        queue.reset();
        queue.enqueue(counter.clone());
        assert_eq!(queue.try_peek_head(), Some(delivered.clone()));
        assert!(!queue.commit_head(&delivered));
        assert_eq!(queue.depth(), 1);
    }

    #[test]
    fn test_enqueue_assigns_increasing_seq() {
        let queue = OutboundQueue::new(4).unwrap();
        assert_eq!(msg(1).seq(), 0);
        queue.enqueue(msg(1));
        queue.enqueue(msg(1));
        let first = queue.remove_head().unwrap();
        let second = queue.remove_head().unwrap();
        assert!(first.seq() > 0);
        assert!(second.seq() > first.seq());
        assert_eq!(first, second);
    }

    #[test]
    fn test_reset_discards_everything() {
        let queue = OutboundQueue::new(4).unwrap();
        queue.enqueue(msg(1));
        queue.enqueue(msg(2));
        assert_eq!(queue.reset(), 2);
        assert_eq!(queue.depth(), 0);
        assert!(queue.try_peek_head().is_none());
        assert!(queue.enqueue(msg(3)));
    }

    #[tokio::test]
    async fn test_peek_does_not_remove() {
        let queue = OutboundQueue::new(2).unwrap();
        queue.enqueue(msg(7));
        let first = queue.peek_head(Duration::from_millis(10)).await;
        let second = queue.peek_head(Duration::from_millis(10)).await;
        assert_eq!(first, Some(msg(7)));
        assert_eq!(first, second);
        assert_eq!(queue.depth(), 1);
    }

    #[tokio::test]
    async fn test_peek_times_out_on_empty_queue() {
        let queue = OutboundQueue::new(2).unwrap();
        let started = tokio::time::Instant::now();
        assert!(queue.peek_head(Duration::from_millis(50)).await.is_none());
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_peek_wakes_on_enqueue() {
        let queue = Arc::new(OutboundQueue::new(2).unwrap());
        let producer = queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.enqueue(msg(5));
        });

        let head = queue.peek_head(Duration::from_secs(5)).await;
        assert_eq!(head, Some(msg(5)));
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        #[derive(Debug, Clone)]
        enum Op {
            Enqueue(Vec<u8>, u8),
            Commit,
        }

        fn op() -> impl Strategy<Value = Op> {
            prop_oneof![
                3 => (proptest::collection::vec(any::<u8>(), 0..=MAX_PAYLOAD_SIZE), any::<u8>())
                    .prop_map(|(payload, port)| Op::Enqueue(payload, port)),
                1 => Just(Op::Commit),
            ]
        }

        proptest! {
            // Property: the queue behaves like a bounded FIFO that rejects when full
            #[test]
            fn queue_matches_bounded_fifo_model(
                capacity in 1usize..8,
                ops in proptest::collection::vec(op(), 0..64)
            ) {
                let queue = OutboundQueue::new(capacity).unwrap();
                let mut model: VecDeque<Message> = VecDeque::new();

                for op in ops {
                    match op {
                        Op::Enqueue(payload, port) => {
                            let message = Message::new(&payload, port).unwrap();
                            let accepted = queue.enqueue(message.clone());
                            prop_assert_eq!(accepted, model.len() < capacity);
                            if accepted {
                                model.push_back(message);
                            }
                        }
                        Op::Commit => {
                            if let Some(head) = queue.try_peek_head() {
                                prop_assert_eq!(Some(&head), model.front());
                                prop_assert!(queue.commit_head(&head));
                                model.pop_front();
                            }
                        }
                    }
                    prop_assert!(queue.depth() <= capacity);
                    prop_assert_eq!(queue.depth(), model.len());
                }
            }
        }
    }

    #[test]
    fn test_concurrent_producers_never_exceed_capacity() {
        let queue = Arc::new(OutboundQueue::new(16).unwrap());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let queue = queue.clone();
                std::thread::spawn(move || (0..10).filter(|i| queue.enqueue(msg(t * 10 + i))).count())
            })
            .collect();

        let accepted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(accepted, 16);
        assert_eq!(queue.depth(), 16);
    }
}
