//! In-process peek-lock queue.
//!
//! [`InMemoryQueue`] backs `memory://` connection strings and the tests. It keeps the parts of a
//! managed queue the claim-check protocol relies on: lock tokens with a fixed lock duration,
//! redelivery of expired locks with a delivery counter, and a hard cap on the message size.
//! Locks are measured with [`tokio::time::Instant`] so tests can run with paused time.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use super::{Delivery, LockHandle, QueueTransport};
use crate::error::{TransportError, TransportResult};
use crate::message::Message;

/// How long a delivery stays locked before it is handed out again.
pub const DEFAULT_LOCK_DURATION: Duration = Duration::from_secs(30);

/// Hard cap on the wire size of a single message.
///
/// This mirrors the limit of common managed queues and sits above the claim-check threshold.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 256 * 1024;

/// Tuning for an [`InMemoryQueue`].
#[derive(Clone, Copy, Debug)]
pub struct QueueOptions {
    /// How long a delivery stays locked.
    pub lock_duration: Duration,
    /// The largest message accepted by [`enqueue`](QueueTransport::enqueue).
    pub max_message_size: usize,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            lock_duration: DEFAULT_LOCK_DURATION,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

/// A [`QueueTransport`] living in process memory.
///
/// Clones share the same queue.
#[derive(Clone, Debug)]
pub struct InMemoryQueue(Arc<Inner>);

#[derive(Debug)]
struct Inner {
    name: String,
    options: QueueOptions,
    state: Mutex<State>,
    changed: Notify,
}

#[derive(Debug)]
struct Pending {
    message: Message,
    delivery_count: u32,
}

#[derive(Debug)]
struct Locked {
    message: Message,
    delivery_count: u32,
    deadline: Instant,
}

#[derive(Debug, Default)]
struct State {
    ready: VecDeque<Pending>,
    locked: HashMap<LockHandle, Locked>,
    closed: bool,
    completed: usize,
}

impl State {
    /// Moves deliveries with expired locks back onto the queue.
    fn reclaim_expired(&mut self, now: Instant) {
        let expired: Vec<_> = self
            .locked
            .iter()
            .filter(|(_, locked)| locked.deadline <= now)
            .map(|(lock, _)| *lock)
            .collect();

        for lock in expired {
            if let Some(locked) = self.locked.remove(&lock) {
                tracing::debug!(message_id = %locked.message.id(), %lock, "lock expired");
                self.ready.push_back(Pending {
                    message: locked.message,
                    delivery_count: locked.delivery_count,
                });
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.locked.values().map(|locked| locked.deadline).min()
    }
}

impl InMemoryQueue {
    /// Creates an empty queue with default options.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_options(name, QueueOptions::default())
    }

    /// Creates an empty queue.
    pub fn with_options(name: impl Into<String>, options: QueueOptions) -> Self {
        Self(Arc::new(Inner {
            name: name.into(),
            options,
            state: Mutex::new(State::default()),
            changed: Notify::new(),
        }))
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.0.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stops handing out deliveries. Pending [`receive`](QueueTransport::receive) calls return
    /// `None` and further enqueues fail.
    pub fn close(&self) {
        self.state().closed = true;
        self.0.changed.notify_waiters();
    }

    /// Returns clones of the messages waiting to be delivered, in queue order.
    ///
    /// Locked deliveries are not included.
    pub fn pending_messages(&self) -> Vec<Message> {
        let mut state = self.state();
        state.reclaim_expired(Instant::now());
        state
            .ready
            .iter()
            .map(|pending| pending.message.clone())
            .collect()
    }

    /// Number of deliveries currently locked by a receiver.
    pub fn locked_count(&self) -> usize {
        self.state().locked.len()
    }

    /// Number of deliveries completed so far.
    pub fn completed_count(&self) -> usize {
        self.state().completed
    }
}

#[async_trait::async_trait]
impl QueueTransport for InMemoryQueue {
    fn queue(&self) -> &str {
        &self.0.name
    }

    async fn enqueue(&self, message: Message) -> TransportResult<()> {
        let size = message.wire_size();
        let max = self.0.options.max_message_size;
        if size > max {
            return Err(TransportError::MessageTooLarge { size, max });
        }

        {
            let mut state = self.state();
            if state.closed {
                return Err(TransportError::Closed {
                    queue: self.0.name.clone(),
                });
            }
            tracing::trace!(message_id = %message.id(), queue = %self.0.name, "enqueued");
            state.ready.push_back(Pending {
                message,
                delivery_count: 0,
            });
        }

        self.0.changed.notify_waiters();
        Ok(())
    }

    async fn receive(&self) -> TransportResult<Option<Delivery>> {
        loop {
            // Registered before inspecting the state so no wakeup is missed in between.
            let changed = self.0.changed.notified();

            let next_deadline = {
                let now = Instant::now();
                let mut state = self.state();
                if state.closed {
                    return Ok(None);
                }

                state.reclaim_expired(now);
                if let Some(pending) = state.ready.pop_front() {
                    let lock = LockHandle::new();
                    let delivery_count = pending.delivery_count + 1;
                    state.locked.insert(
                        lock,
                        Locked {
                            message: pending.message.clone(),
                            delivery_count,
                            deadline: now + self.0.options.lock_duration,
                        },
                    );

                    return Ok(Some(Delivery {
                        message: pending.message,
                        lock,
                        delivery_count,
                    }));
                }

                state.next_deadline()
            };

            match next_deadline {
                Some(deadline) => {
                    tokio::select! {
                        _ = changed => {}
                        _ = tokio::time::sleep_until(deadline) => {}
                    }
                }
                None => changed.await,
            }
        }
    }

    async fn complete(&self, lock: &LockHandle) -> TransportResult<()> {
        let mut state = self.state();
        state.reclaim_expired(Instant::now());

        if state.locked.remove(lock).is_none() {
            return Err(TransportError::LockLost { lock: *lock });
        }

        state.completed += 1;
        Ok(())
    }

    async fn is_lock_valid(&self, lock: &LockHandle) -> bool {
        let now = Instant::now();
        self.state()
            .locked
            .get(lock)
            .is_some_and(|locked| locked.deadline > now)
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    fn short_locks() -> QueueOptions {
        QueueOptions {
            lock_duration: Duration::from_secs(5),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn delivers_and_completes() {
        let queue = InMemoryQueue::new("orders");
        queue.enqueue(Message::with_id("m-1", "hello")).await.unwrap();

        let delivery = queue.receive().await.unwrap().unwrap();
        assert_eq!(delivery.message.id().as_str(), "m-1");
        assert_eq!(delivery.message.body(), &Bytes::from_static(b"hello"));
        assert_eq!(delivery.delivery_count, 1);
        assert_eq!(queue.locked_count(), 1);
        assert!(queue.is_lock_valid(&delivery.lock).await);

        queue.complete(&delivery.lock).await.unwrap();
        assert_eq!(queue.locked_count(), 0);
        assert_eq!(queue.completed_count(), 1);
        assert!(queue.pending_messages().is_empty());
    }

    #[tokio::test]
    async fn completing_twice_fails() {
        let queue = InMemoryQueue::new("orders");
        queue.enqueue(Message::new("hello")).await.unwrap();

        let delivery = queue.receive().await.unwrap().unwrap();
        queue.complete(&delivery.lock).await.unwrap();

        let result = queue.complete(&delivery.lock).await;
        assert!(matches!(result, Err(TransportError::LockLost { .. })));
        assert!(!queue.is_lock_valid(&delivery.lock).await);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_lock_is_redelivered() {
        let queue = InMemoryQueue::with_options("orders", short_locks());
        queue.enqueue(Message::with_id("m-1", "hello")).await.unwrap();

        let first = queue.receive().await.unwrap().unwrap();

        // Blocks until the lock of the first attempt runs out.
        let second = queue.receive().await.unwrap().unwrap();
        assert_eq!(second.message.id().as_str(), "m-1");
        assert_eq!(second.delivery_count, 2);
        assert_ne!(first.lock, second.lock);

        assert!(!queue.is_lock_valid(&first.lock).await);
        let result = queue.complete(&first.lock).await;
        assert!(matches!(result, Err(TransportError::LockLost { .. })));

        queue.complete(&second.lock).await.unwrap();
        assert_eq!(queue.completed_count(), 1);
    }

    #[tokio::test]
    async fn receive_waits_for_enqueue() {
        let queue = InMemoryQueue::new("orders");

        let receiver = tokio::spawn({
            let queue = queue.clone();
            async move { queue.receive().await }
        });
        tokio::task::yield_now().await;

        queue.enqueue(Message::with_id("late", "x")).await.unwrap();

        let delivery = receiver.await.unwrap().unwrap().unwrap();
        assert_eq!(delivery.message.id().as_str(), "late");
    }

    #[tokio::test]
    async fn rejects_oversized_messages() {
        let queue = InMemoryQueue::new("orders");
        let body = vec![0u8; DEFAULT_MAX_MESSAGE_SIZE + 1];

        let result = queue.enqueue(Message::new(body)).await;
        assert!(matches!(result, Err(TransportError::MessageTooLarge { .. })));
        assert!(queue.pending_messages().is_empty());
    }

    #[tokio::test]
    async fn close_ends_receive() {
        let queue = InMemoryQueue::new("orders");

        let receiver = tokio::spawn({
            let queue = queue.clone();
            async move { queue.receive().await }
        });
        tokio::task::yield_now().await;

        queue.close();
        assert!(receiver.await.unwrap().unwrap().is_none());

        let result = queue.enqueue(Message::new("x")).await;
        assert!(matches!(result, Err(TransportError::Closed { .. })));
    }
}
