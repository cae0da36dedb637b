//! Error types for every stage of the claim-check protocol.

use claimcheck_types::UnknownMessageType;
use thiserror::Error;

use crate::message::{Message, MessageId};
use crate::transport::LockHandle;

/// Errors raised by blob store backends and the payload adapter.
#[derive(Debug, Error)]
pub enum BlobError {
    /// IO errors related to payload streaming or file operations.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The container was never created.
    #[error("container {container:?} does not exist")]
    ContainerNotFound {
        /// The container that was addressed.
        container: String,
    },

    /// No blob is stored under the key.
    #[error("blob {key:?} not found in container {container:?}")]
    NotFound {
        /// The container that was searched.
        container: String,
        /// The missing key.
        key: String,
    },

    /// The key cannot be used as a blob name.
    #[error("invalid blob key {key:?}")]
    InvalidKey {
        /// The rejected key.
        key: String,
    },

    /// The downloaded payload does not match the length advertised by the store.
    #[error("blob {key:?} has {actual} bytes, expected {expected}")]
    LengthMismatch {
        /// The blob key.
        key: String,
        /// The length reported before the download.
        expected: u64,
        /// The number of bytes actually read.
        actual: u64,
    },

    /// Any other error stemming from a blob store, which might be specific to that store or to a
    /// certain operation.
    #[error("blob store error: {context}")]
    Generic {
        /// What the store was doing.
        context: String,
        /// The underlying error.
        #[source]
        cause: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// Result type for blob store operations.
pub type BlobResult<T> = Result<T, BlobError>;

/// Errors raised by a queue transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The queue no longer accepts or hands out messages.
    #[error("queue {queue:?} is closed")]
    Closed {
        /// The queue name.
        queue: String,
    },

    /// The transport refused a message above its hard size cap.
    #[error("message of {size} bytes exceeds the transport limit of {max} bytes")]
    MessageTooLarge {
        /// The size of the rejected message.
        size: usize,
        /// The transport's limit.
        max: usize,
    },

    /// The lock has expired or was already used to complete the delivery.
    #[error("lock {lock} is no longer held")]
    LockLost {
        /// The stale lock handle.
        lock: LockHandle,
    },

    /// Any other error stemming from the transport.
    #[error("transport error: {context}")]
    Generic {
        /// What the transport was doing.
        context: String,
        /// The underlying error.
        #[source]
        cause: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl TransportError {
    /// Returns `true` if the same operation may succeed when attempted again.
    ///
    /// Only [`TransportError::Generic`] qualifies. A closed queue stays closed, an oversized
    /// message stays oversized and a lost lock cannot be regained.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Generic { .. })
    }
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// A delivery that does not carry a valid type tag.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// The `MessageType` property is absent.
    #[error("message carries no MessageType property")]
    MissingType,

    /// The `MessageType` property holds an unknown value.
    #[error(transparent)]
    UnknownType(#[from] UnknownMessageType),
}

/// Errors returned from [`Sender::send`](crate::Sender::send).
///
/// Blob failures happen before anything reaches the queue. Transport failures may leave an
/// orphaned blob behind, see [`SendError::orphaned_blob`], and hand the unsent message back, see
/// [`SendError::into_message`].
#[derive(Debug, Error)]
pub enum SendError {
    /// The typed payload could not be serialized.
    #[error("failed to serialize message body: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Writing the offloaded payload failed. Nothing was enqueued.
    #[error("failed to store payload of message {id}: {source}")]
    BlobWrite {
        /// The message that was being sent.
        id: MessageId,
        /// The blob store error.
        #[source]
        source: BlobError,
    },

    /// The transport rejected the message.
    #[error("failed to enqueue message {id}: {source}")]
    Transport {
        /// The message that was being sent.
        id: MessageId,
        /// Whether the payload had already been written to the blob store.
        orphaned_blob: bool,
        /// The message as it was passed to the sender, including its full body.
        message: Box<Message>,
        /// The transport error.
        #[source]
        source: TransportError,
    },
}

impl SendError {
    /// Returns `true` if sending the same message again may succeed.
    ///
    /// This holds for transient transport failures only, see [`TransportError::is_transient`].
    /// Serialization and blob write failures are final, as are a closed queue and a message the
    /// transport refuses for its size.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { source, .. } => source.is_transient(),
            _ => false,
        }
    }

    /// Returns the message that failed to reach the queue, ready to be sent again.
    pub fn into_message(self) -> Option<Message> {
        match self {
            Self::Transport { message, .. } => Some(*message),
            _ => None,
        }
    }

    /// Returns `true` if the payload was stored but the claim check never reached the queue.
    pub fn orphaned_blob(&self) -> bool {
        matches!(
            self,
            Self::Transport {
                orphaned_blob: true,
                ..
            }
        )
    }
}

/// Errors raised while processing a single delivery.
///
/// None of these complete the delivery. The transport redelivers it once the lock expires.
#[derive(Debug, Error)]
pub enum ReceiveError {
    /// The delivery has no usable type tag.
    #[error("protocol violation: {0}")]
    ProtocolViolation(#[from] ProtocolError),

    /// The offloaded payload could not be fetched.
    #[error("failed to fetch offloaded payload: {0}")]
    BlobRead(#[source] BlobError),

    /// The application handler returned an error.
    #[error("message handler failed: {0}")]
    Handler(#[source] anyhow::Error),

    /// Processing the delivery panicked, most likely inside the application handler.
    #[error("message handler panicked: {0}")]
    Panicked(String),

    /// The transport failed to hand out or complete a delivery.
    #[error("transport failure: {0}")]
    Transport(#[source] TransportError),
}

/// Errors raised when registering a handler with the dispatch loop.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    /// Completion is owned by the receiver and cannot be delegated to the transport.
    #[error("auto-completion must be disabled")]
    AutoCompleteEnabled,

    /// At least one delivery has to be allowed in flight.
    #[error("max_concurrent_calls must be at least 1")]
    ZeroConcurrency,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport_failure(source: TransportError) -> SendError {
        SendError::Transport {
            id: MessageId::from("m-1"),
            orphaned_blob: false,
            message: Box::new(Message::with_id("m-1", "x")),
            source,
        }
    }

    #[test]
    fn only_transient_transport_failures_are_retryable() {
        let generic = TransportError::Generic {
            context: "enqueue".into(),
            cause: "connection reset".into(),
        };
        assert!(transport_failure(generic).is_retryable());

        let closed = TransportError::Closed {
            queue: "orders".into(),
        };
        assert!(!transport_failure(closed).is_retryable());

        let too_large = TransportError::MessageTooLarge {
            size: 300 * 1024,
            max: 256 * 1024,
        };
        assert!(!transport_failure(too_large).is_retryable());

        let lost = TransportError::LockLost {
            lock: LockHandle::new(),
        };
        assert!(!transport_failure(lost).is_retryable());
    }
}
