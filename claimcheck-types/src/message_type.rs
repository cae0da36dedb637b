//! The inline/offloaded discriminator carried in message properties.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// How a message's payload traveled from the sender to the receiver.
///
/// On the wire this is stored as a string under [`MESSAGE_TYPE_KEY`](crate::MESSAGE_TYPE_KEY).
/// The string values are kept from the first deployments of the protocol and must not change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    /// The full payload is the message body (`"SERVICE"`).
    #[serde(rename = "SERVICE")]
    Inline,
    /// The payload lives in the blob store under the message id (`"STORAGE"`).
    ///
    /// The body on the queue is empty.
    #[serde(rename = "STORAGE")]
    Offloaded,
}

impl MessageType {
    /// Returns the wire representation of this tag.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Inline => "SERVICE",
            Self::Offloaded => "STORAGE",
        }
    }

    /// Returns `true` if the payload must be fetched from the blob store.
    pub const fn is_offloaded(self) -> bool {
        matches!(self, Self::Offloaded)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a tag value is not one of the agreed wire strings.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("unknown message type {0:?}, expected \"SERVICE\" or \"STORAGE\"")]
pub struct UnknownMessageType(pub String);

impl FromStr for MessageType {
    type Err = UnknownMessageType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Matching is exact. Tags are written by senders, never typed by hand.
        match s {
            "SERVICE" => Ok(Self::Inline),
            "STORAGE" => Ok(Self::Offloaded),
            other => Err(UnknownMessageType(other.to_owned())),
        }
    }
}
