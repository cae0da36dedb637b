//! Shared wire contract between claim-check senders and receivers.
//!
//! Everything in this crate is observable on the queue: the property key that carries the
//! [`MessageType`] tag, the string values that tag takes, and the size threshold that decides
//! whether a payload travels inline or through the blob store. Both halves of the protocol must
//! agree on these values, so they live in one place.
#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

pub mod message_type;

pub use message_type::{MessageType, UnknownMessageType};

/// The user property key under which the [`MessageType`] tag is stored.
pub const MESSAGE_TYPE_KEY: &str = "MessageType";

/// The exclusive upper bound for bodies that may travel inline on the queue.
///
/// This sits below the transport's own hard cap to leave room for the envelope and user
/// properties. A body of exactly this size is offloaded.
pub const MAX_MESSAGE_SIZE: usize = 200 * 1024;
