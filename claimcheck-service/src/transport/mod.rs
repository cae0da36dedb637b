//! Queue transports carrying claim checks and inline messages.
//!
//! The [`QueueTransport`] trait is the consumed interface of the external queuing service. It
//! follows peek-lock semantics: [`receive`](QueueTransport::receive) hands out a [`Delivery`]
//! together with a [`LockHandle`], and the message stays on the queue until
//! [`complete`](QueueTransport::complete) is called with that handle. Deliveries whose lock
//! expires are handed out again by the transport.

use std::fmt::{self, Debug};
use std::sync::Arc;

use uuid::Uuid;

use crate::error::TransportResult;
use crate::message::Message;

pub mod in_memory;

pub use in_memory::{InMemoryQueue, QueueOptions};

/// A transport shared between all senders and receivers of a process.
pub type SharedTransport = Arc<dyn QueueTransport>;

/// Transport-issued handle required to complete one delivery attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct LockHandle(Uuid);

impl LockHandle {
    /// Issues a fresh, unique handle.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for LockHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LockHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// One delivery attempt of a message.
#[derive(Debug)]
pub struct Delivery {
    /// The message as it sits on the queue.
    pub message: Message,
    /// The handle needed to complete this attempt.
    pub lock: LockHandle,
    /// How often this message has been handed out, including this attempt.
    pub delivery_count: u32,
}

/// A peek-lock message queue.
///
/// Implementations must be safe for concurrent use: a single instance serves every in-flight
/// send and delivery.
#[async_trait::async_trait]
pub trait QueueTransport: Debug + Send + Sync + 'static {
    /// The queue name, used for diagnostics.
    fn queue(&self) -> &str;

    /// Places a message on the queue.
    async fn enqueue(&self, message: Message) -> TransportResult<()>;

    /// Waits for the next delivery and locks it.
    ///
    /// Returns `None` once the queue has been closed.
    async fn receive(&self) -> TransportResult<Option<Delivery>>;

    /// Removes a delivered message from the queue.
    ///
    /// Fails with [`TransportError::LockLost`](crate::error::TransportError::LockLost) if the
    /// lock expired or the delivery was already completed.
    async fn complete(&self, lock: &LockHandle) -> TransportResult<()>;

    /// Returns `true` if `lock` is still held and may be used to complete its delivery.
    async fn is_lock_valid(&self, lock: &LockHandle) -> bool;
}
