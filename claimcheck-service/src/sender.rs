//! The sending half of the claim-check protocol.

use std::sync::Arc;
use std::time::Instant;

use claimcheck_types::MessageType;
use serde::Serialize;

use crate::classify;
use crate::error::SendError;
use crate::message::Message;
use crate::payload::PayloadStore;
use crate::transport::SharedTransport;

/// Places messages on the queue, offloading large payloads to the blob store.
///
/// Small messages are tagged [`MessageType::Inline`] and enqueued as they are. Messages whose
/// body reaches [`MAX_MESSAGE_SIZE`](claimcheck_types::MAX_MESSAGE_SIZE) are tagged
/// [`MessageType::Offloaded`]: their body is written to the blob store under the message id and
/// an empty claim check is enqueued in its place. The blob write always finishes before the claim
/// check is enqueued.
///
/// The sender is cheap to clone and safe to use from many tasks at once.
#[derive(Clone, Debug)]
pub struct Sender(Arc<SenderInner>);

#[derive(Debug)]
struct SenderInner {
    transport: SharedTransport,
    payloads: PayloadStore,
}

impl Sender {
    /// Creates a sender on top of a shared transport and payload store.
    pub fn new(transport: SharedTransport, payloads: PayloadStore) -> Self {
        Self(Arc::new(SenderInner {
            transport,
            payloads,
        }))
    }

    /// Returns `true` if `message` would travel inline.
    pub fn can_send_inline(&self, message: &Message) -> bool {
        classify::fits_inline(message.size())
    }

    /// Returns `true` if `value`, serialized as JSON, would travel inline.
    pub fn can_send_inline_json<T>(&self, value: &T) -> serde_json::Result<bool>
    where
        T: Serialize + ?Sized,
    {
        let body = serde_json::to_vec(value)?;
        Ok(classify::fits_inline(body.len()))
    }

    /// Serializes `value` as JSON and sends it as a new message.
    pub async fn send_json<T>(&self, value: &T) -> Result<MessageType, SendError>
    where
        T: Serialize + ?Sized,
    {
        let message = Message::from_json(value)?;
        self.send(message).await
    }

    /// Sends a message and returns how it travelled.
    ///
    /// On [`SendError::BlobWrite`] nothing was enqueued. On [`SendError::Transport`] the message
    /// did not reach the queue, but its payload may have been stored already. The error hands the
    /// message back through [`SendError::into_message`].
    pub async fn send(&self, mut message: Message) -> Result<MessageType, SendError> {
        let start = Instant::now();
        let size = message.size();
        let message_type = classify::route(size);
        message.set_message_type(message_type);

        let id = message.id().clone();
        // Shares the body buffer, the transport consumes `message` even when it fails.
        let retained = message.clone();
        tracing::debug!(message_id = %id, %message_type, size, "routing message");

        if message_type.is_offloaded() {
            let payload = message.take_body();
            let payloads = &self.0.payloads;

            let written = async {
                payloads.ensure_container().await?;
                payloads.put(&id, payload).await
            }
            .await;

            if let Err(source) = written {
                tracing::debug!(
                    message_id = %id,
                    error = &source as &dyn std::error::Error,
                    "payload write failed"
                );
                return Err(SendError::BlobWrite { id, source });
            }
        }

        if let Err(source) = self.0.transport.enqueue(message).await {
            let orphaned_blob = message_type.is_offloaded();
            if orphaned_blob {
                merni::counter!("send.orphaned_blob": 1, "queue" => self.0.transport.queue());
                tracing::error!(
                    message_id = %id,
                    container = %self.0.payloads.container(),
                    error = &source as &dyn std::error::Error,
                    "orphaned blob: payload stored but claim check was not enqueued"
                );
            }
            return Err(SendError::Transport {
                id,
                orphaned_blob,
                message: Box::new(retained),
                source,
            });
        }

        merni::distribution!(
            "send.latency"@s: start.elapsed(),
            "message_type" => message_type.as_str()
        );
        merni::distribution!(
            "send.size"@b: size as u64,
            "message_type" => message_type.as_str()
        );

        Ok(message_type)
    }
}

#[cfg(test)]
mod tests {
    use claimcheck_types::{MAX_MESSAGE_SIZE, MESSAGE_TYPE_KEY};

    use super::*;
    use crate::blob::InMemoryBlobStore;
    use crate::error::TransportError;
    use crate::transport::InMemoryQueue;

    fn make_sender() -> (Sender, InMemoryQueue, InMemoryBlobStore) {
        let queue = InMemoryQueue::new("orders");
        let blobs = InMemoryBlobStore::new();
        let payloads = PayloadStore::new(Arc::new(blobs.clone()), "payloads");
        let sender = Sender::new(Arc::new(queue.clone()), payloads);
        (sender, queue, blobs)
    }

    #[tokio::test]
    async fn small_message_goes_inline() {
        let (sender, queue, blobs) = make_sender();

        let message = Message::with_id("m-1", "hello");
        assert_eq!(sender.send(message).await.unwrap(), MessageType::Inline);

        let pending = queue.pending_messages();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].body().as_ref(), b"hello");
        assert_eq!(pending[0].property(MESSAGE_TYPE_KEY), Some("SERVICE"));
        assert_eq!(blobs.put_count(), 0);
    }

    #[tokio::test]
    async fn large_message_is_offloaded() {
        let (sender, queue, blobs) = make_sender();
        let body = vec![7u8; MAX_MESSAGE_SIZE];

        let message = Message::with_id("m-1", body.clone());
        assert_eq!(sender.send(message).await.unwrap(), MessageType::Offloaded);

        let pending = queue.pending_messages();
        assert_eq!(pending.len(), 1);
        assert!(pending[0].body().is_empty());
        assert_eq!(pending[0].property(MESSAGE_TYPE_KEY), Some("STORAGE"));

        assert_eq!(blobs.put_count(), 1);
        assert_eq!(blobs.get_stored("payloads", "m-1").unwrap().as_ref(), &body[..]);
    }

    #[tokio::test]
    async fn caller_cannot_forge_the_tag() {
        let (sender, queue, _blobs) = make_sender();

        let mut message = Message::new("tiny");
        message.set_property(MESSAGE_TYPE_KEY, "STORAGE");
        sender.send(message).await.unwrap();

        let pending = queue.pending_messages();
        assert_eq!(pending[0].property(MESSAGE_TYPE_KEY), Some("SERVICE"));
    }

    #[tokio::test]
    async fn closed_queue_reports_orphaned_blob() {
        let (sender, queue, blobs) = make_sender();
        queue.close();

        let err = sender
            .send(Message::with_id("big", vec![0u8; MAX_MESSAGE_SIZE + 1]))
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
        assert!(err.orphaned_blob());
        assert!(blobs.contains("payloads", "big"));

        let err = sender.send(Message::new("small")).await.unwrap_err();
        assert!(!err.is_retryable());
        assert!(!err.orphaned_blob());
    }

    #[tokio::test]
    async fn oversized_inline_message_is_not_retryable() {
        let (sender, queue, blobs) = make_sender();

        // The body alone stays inline, the properties push it past the transport cap.
        let mut message = Message::with_id("m-1", vec![0u8; MAX_MESSAGE_SIZE - 1]);
        message.set_property("attachment", "a".repeat(60 * 1024));

        let err = sender.send(message).await.unwrap_err();
        assert!(matches!(
            err,
            SendError::Transport {
                source: TransportError::MessageTooLarge { .. },
                orphaned_blob: false,
                ..
            }
        ));
        assert!(!err.is_retryable());
        assert!(queue.pending_messages().is_empty());
        assert_eq!(blobs.put_count(), 0);
    }

    #[tokio::test]
    async fn failed_enqueue_returns_the_full_message() {
        let (sender, queue, _blobs) = make_sender();
        queue.close();

        let body = vec![3u8; MAX_MESSAGE_SIZE];
        let err = sender
            .send(Message::with_id("big", body.clone()))
            .await
            .unwrap_err();

        let message = err.into_message().unwrap();
        assert_eq!(message.id().as_str(), "big");
        assert_eq!(message.body().as_ref(), &body[..]);

        let (retry_sender, retry_queue, retry_blobs) = make_sender();
        let sent = retry_sender.send(message).await.unwrap();
        assert_eq!(sent, MessageType::Offloaded);
        assert_eq!(retry_queue.pending_messages()[0].id().as_str(), "big");
        assert_eq!(
            retry_blobs.get_stored("payloads", "big").unwrap().as_ref(),
            &body[..]
        );
    }

    #[test]
    fn typed_preflight() {
        let (sender, _queue, _blobs) = make_sender();

        assert!(sender.can_send_inline_json(&serde_json::json!({"x": 1})).unwrap());

        let large = "a".repeat(MAX_MESSAGE_SIZE);
        assert!(!sender.can_send_inline_json(&large).unwrap());
        assert!(!sender.can_send_inline(&Message::new(large)));
    }
}
