//! The receiving half of the claim-check protocol.
//!
//! The [`Receiver`] turns a [`Delivery`] back into the message the sender was given. Inline
//! messages pass through untouched, offloaded ones get their payload fetched from the blob store
//! and written into the body. Only then is the application [`MessageHandler`] called, and only
//! after it succeeds is the delivery completed. Every failure leaves the delivery locked on the
//! queue so the transport redelivers it once the lock runs out.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use claimcheck_types::MessageType;
use tokio_util::sync::CancellationToken;

use crate::error::{ReceiveError, TransportError};
use crate::message::Message;
use crate::payload::PayloadStore;
use crate::transport::{Delivery, SharedTransport};

/// Application callback invoked with every fully materialized message.
///
/// This is implemented for async closures taking a [`Message`], so most callers never implement
/// it by hand.
#[async_trait::async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// Processes one message. Returning an error leaves the delivery unacknowledged.
    async fn handle(&self, message: Message) -> anyhow::Result<()>;
}

#[async_trait::async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, message: Message) -> anyhow::Result<()> {
        self(message).await
    }
}

/// Why a processed delivery was not completed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnackReason {
    /// Shutdown was requested before the delivery could be completed.
    Cancelled,
    /// The delivery lock expired while the message was processed.
    LockExpired,
}

/// Terminal state of one delivery attempt that did not fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The message was handled and removed from the queue.
    Completed,
    /// The message was handled but stays on the queue and will be redelivered.
    Unacknowledged(UnackReason),
}

/// Rehydrates deliveries and completes them after the handler succeeded.
///
/// The receiver is cheap to clone. Clones share the transport and the payload store, and
/// processing distinct deliveries concurrently is safe.
#[derive(Clone, Debug)]
pub struct Receiver(Arc<ReceiverInner>);

#[derive(Debug)]
struct ReceiverInner {
    transport: SharedTransport,
    payloads: PayloadStore,
}

impl Receiver {
    /// Creates a receiver on top of a shared transport and payload store.
    pub fn new(transport: SharedTransport, payloads: PayloadStore) -> Self {
        Self(Arc::new(ReceiverInner {
            transport,
            payloads,
        }))
    }

    pub(crate) fn transport(&self) -> &SharedTransport {
        &self.0.transport
    }

    /// Restores the message the sender was given.
    ///
    /// Reads the claim-check tag and, for offloaded messages, replaces the empty on-queue body
    /// with the stored payload.
    pub async fn rehydrate(&self, message: &mut Message) -> Result<MessageType, ReceiveError> {
        let message_type = match message.message_type() {
            Ok(message_type) => message_type,
            Err(err) => {
                merni::counter!(
                    "receive.protocol_violation": 1,
                    "queue" => self.0.transport.queue()
                );
                tracing::warn!(
                    message_id = %message.id(),
                    error = &err as &dyn std::error::Error,
                    "delivery without a valid message type"
                );
                return Err(err.into());
            }
        };

        if message_type.is_offloaded() {
            let payload = self
                .0
                .payloads
                .get(message.id())
                .await
                .map_err(ReceiveError::BlobRead)?;
            message.replace_body(payload);
        }

        Ok(message_type)
    }

    /// Runs one delivery through the protocol.
    ///
    /// The delivery is completed only if rehydration and `handler` both succeed, `cancel` has not
    /// fired and the transport still holds the lock. A lock lost between the check and the
    /// completion is reported as [`UnackReason::LockExpired`], not as an error.
    pub async fn process_delivery(
        &self,
        delivery: Delivery,
        handler: &dyn MessageHandler,
        cancel: &CancellationToken,
    ) -> Result<DeliveryOutcome, ReceiveError> {
        let start = Instant::now();
        let Delivery {
            mut message,
            lock,
            delivery_count,
        } = delivery;

        let message_type = self.rehydrate(&mut message).await?;
        let id = message.id().clone();
        tracing::debug!(message_id = %id, %message_type, delivery_count, "processing delivery");

        handler.handle(message).await.map_err(ReceiveError::Handler)?;

        if cancel.is_cancelled() {
            tracing::debug!(message_id = %id, "cancelled, leaving delivery unacknowledged");
            return Ok(DeliveryOutcome::Unacknowledged(UnackReason::Cancelled));
        }

        let transport = &self.0.transport;
        if !transport.is_lock_valid(&lock).await {
            tracing::debug!(message_id = %id, %lock, "lock expired before completion");
            return Ok(DeliveryOutcome::Unacknowledged(UnackReason::LockExpired));
        }

        match transport.complete(&lock).await {
            Ok(()) => {}
            Err(TransportError::LockLost { .. }) => {
                tracing::debug!(message_id = %id, %lock, "lock lost during completion");
                return Ok(DeliveryOutcome::Unacknowledged(UnackReason::LockExpired));
            }
            Err(err) => return Err(ReceiveError::Transport(err)),
        }

        merni::distribution!(
            "receive.latency"@s: start.elapsed(),
            "message_type" => message_type.as_str()
        );

        Ok(DeliveryOutcome::Completed)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use bytes::Bytes;
    use claimcheck_types::MESSAGE_TYPE_KEY;

    use super::*;
    use crate::blob::InMemoryBlobStore;
    use crate::transport::{InMemoryQueue, LockHandle, QueueTransport};

    fn make_receiver() -> (Receiver, InMemoryQueue, InMemoryBlobStore) {
        let queue = InMemoryQueue::new("orders");
        let blobs = InMemoryBlobStore::new();
        let payloads = PayloadStore::new(Arc::new(blobs.clone()), "payloads");
        let receiver = Receiver::new(Arc::new(queue.clone()), payloads);
        (receiver, queue, blobs)
    }

    async fn deliver(queue: &InMemoryQueue, message: Message) -> Delivery {
        queue.enqueue(message).await.unwrap();
        queue.receive().await.unwrap().unwrap()
    }

    fn tagged(id: &str, body: &'static [u8], tag: &str) -> Message {
        let mut message = Message::with_id(id, body);
        message.set_property(MESSAGE_TYPE_KEY, tag);
        message
    }

    #[tokio::test]
    async fn inline_delivery_is_completed() {
        let (receiver, queue, blobs) = make_receiver();
        let delivery = deliver(&queue, tagged("m-1", b"hello", "SERVICE")).await;

        let seen = Arc::new(Mutex::new(Vec::new()));
        let handler = {
            let seen = seen.clone();
            move |message: Message| {
                seen.lock().unwrap().push(message.body().clone());
                async { anyhow::Ok(()) }
            }
        };

        let outcome = receiver
            .process_delivery(delivery, &handler, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome, DeliveryOutcome::Completed);
        assert_eq!(*seen.lock().unwrap(), vec![Bytes::from_static(b"hello")]);
        assert_eq!(queue.completed_count(), 1);
        assert_eq!(blobs.get_count(), 0);
    }

    #[tokio::test]
    async fn offloaded_body_replaces_empty_body() {
        let (receiver, _queue, blobs) = make_receiver();
        let payloads = PayloadStore::new(Arc::new(blobs), "payloads");
        payloads.ensure_container().await.unwrap();
        payloads
            .put(&"m-1".into(), Bytes::from_static(b"stored payload"))
            .await
            .unwrap();

        let mut message = tagged("m-1", b"", "STORAGE");
        let message_type = receiver.rehydrate(&mut message).await.unwrap();

        assert_eq!(message_type, MessageType::Offloaded);
        assert_eq!(message.body().as_ref(), b"stored payload");
    }

    #[tokio::test]
    async fn missing_tag_is_a_protocol_violation() {
        let (receiver, queue, _blobs) = make_receiver();
        let delivery = deliver(&queue, Message::with_id("m-1", "hello")).await;

        let handler = |_message: Message| async { anyhow::Ok(()) };
        let result = receiver
            .process_delivery(delivery, &handler, &CancellationToken::new())
            .await;

        assert!(matches!(result, Err(ReceiveError::ProtocolViolation(_))));
        assert_eq!(queue.completed_count(), 0);
        assert_eq!(queue.locked_count(), 1);
    }

    #[tokio::test]
    async fn unknown_tag_is_a_protocol_violation() {
        let (receiver, _queue, _blobs) = make_receiver();
        let mut message = tagged("m-1", b"hello", "CARRIER_PIGEON");

        let result = receiver.rehydrate(&mut message).await;
        assert!(matches!(result, Err(ReceiveError::ProtocolViolation(_))));
    }

    #[tokio::test]
    async fn handler_failure_skips_completion() {
        let (receiver, queue, _blobs) = make_receiver();
        let delivery = deliver(&queue, tagged("m-1", b"hello", "SERVICE")).await;

        let handler = |_message: Message| async { Err::<(), _>(anyhow::anyhow!("nope")) };
        let result = receiver
            .process_delivery(delivery, &handler, &CancellationToken::new())
            .await;

        assert!(matches!(result, Err(ReceiveError::Handler(_))));
        assert_eq!(queue.completed_count(), 0);
    }

    #[tokio::test]
    async fn cancelled_delivery_is_not_completed() {
        let (receiver, queue, _blobs) = make_receiver();
        let delivery = deliver(&queue, tagged("m-1", b"hello", "SERVICE")).await;

        let cancel = CancellationToken::new();
        cancel.cancel();

        let handler = |_message: Message| async { anyhow::Ok(()) };
        let outcome = receiver
            .process_delivery(delivery, &handler, &cancel)
            .await
            .unwrap();

        assert_eq!(outcome, DeliveryOutcome::Unacknowledged(UnackReason::Cancelled));
        assert_eq!(queue.completed_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_lock_is_not_an_error() {
        let (receiver, queue, _blobs) = make_receiver();
        let delivery = deliver(&queue, tagged("m-1", b"hello", "SERVICE")).await;

        let handler = |_message: Message| async {
            tokio::time::sleep(crate::transport::in_memory::DEFAULT_LOCK_DURATION * 2).await;
            anyhow::Ok(())
        };
        let outcome = receiver
            .process_delivery(delivery, &handler, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome, DeliveryOutcome::Unacknowledged(UnackReason::LockExpired));
        assert_eq!(queue.completed_count(), 0);
    }

    /// Reports every lock as valid but loses it when the delivery is completed.
    #[derive(Debug)]
    struct LockLostOnComplete(InMemoryQueue);

    #[async_trait::async_trait]
    impl QueueTransport for LockLostOnComplete {
        fn queue(&self) -> &str {
            self.0.queue()
        }

        async fn enqueue(&self, message: Message) -> crate::error::TransportResult<()> {
            self.0.enqueue(message).await
        }

        async fn receive(&self) -> crate::error::TransportResult<Option<Delivery>> {
            self.0.receive().await
        }

        async fn complete(&self, lock: &LockHandle) -> crate::error::TransportResult<()> {
            Err(TransportError::LockLost { lock: *lock })
        }

        async fn is_lock_valid(&self, _lock: &LockHandle) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn lock_lost_on_completion_is_not_an_error() {
        let queue = InMemoryQueue::new("orders");
        let payloads = PayloadStore::new(Arc::new(InMemoryBlobStore::new()), "payloads");
        let receiver = Receiver::new(Arc::new(LockLostOnComplete(queue.clone())), payloads);
        let delivery = deliver(&queue, tagged("m-1", b"hello", "SERVICE")).await;

        let handled = Arc::new(Mutex::new(0));
        let handler = {
            let handled = Arc::clone(&handled);
            move |_message: Message| {
                *handled.lock().unwrap() += 1;
                async { anyhow::Ok(()) }
            }
        };

        let outcome = receiver
            .process_delivery(delivery, &handler, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome, DeliveryOutcome::Unacknowledged(UnackReason::LockExpired));
        assert_eq!(*handled.lock().unwrap(), 1);
        assert_eq!(queue.completed_count(), 0);
        assert_eq!(queue.locked_count(), 1);
    }
}
