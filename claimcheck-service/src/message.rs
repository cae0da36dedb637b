//! Messages and their identifiers.
//!
//! A [`Message`] is what callers hand to the [`Sender`](crate::Sender) and what handlers receive
//! from the [`Receiver`](crate::Receiver). It carries an id, a byte body and string-keyed user
//! properties. The claim-check tag lives in the properties under
//! [`MESSAGE_TYPE_KEY`](claimcheck_types::MESSAGE_TYPE_KEY) and is only ever written by the
//! sender.

use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;
use claimcheck_types::{MESSAGE_TYPE_KEY, MessageType};
use serde::Serialize;
use serde::de::DeserializeOwned;
use uuid::Uuid;

use crate::error::ProtocolError;

/// Identifier of a message, stable across redeliveries.
///
/// When the payload is offloaded, the id is used verbatim as the blob key.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(String);

impl MessageId {
    /// Generates a fresh, time-ordered id.
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for MessageId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for MessageId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

/// A message travelling through the queue.
#[derive(Clone, Debug)]
pub struct Message {
    id: MessageId,
    body: Bytes,
    properties: BTreeMap<String, String>,
}

impl Message {
    /// Creates a message with a freshly generated id.
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self::with_id(MessageId::new(), body)
    }

    /// Creates a message with a caller-assigned id.
    pub fn with_id(id: impl Into<MessageId>, body: impl Into<Bytes>) -> Self {
        Self {
            id: id.into(),
            body: body.into(),
            properties: BTreeMap::new(),
        }
    }

    /// Serializes `value` as JSON into the body of a new message.
    pub fn from_json<T>(value: &T) -> serde_json::Result<Self>
    where
        T: Serialize + ?Sized,
    {
        Ok(Self::new(serde_json::to_vec(value)?))
    }

    /// Reassembles a message from its transport representation.
    ///
    /// This is meant for [`QueueTransport`](crate::transport::QueueTransport) implementations
    /// that decode messages off the wire.
    pub fn from_parts(id: MessageId, body: Bytes, properties: BTreeMap<String, String>) -> Self {
        Self {
            id,
            body,
            properties,
        }
    }

    /// The message id.
    pub fn id(&self) -> &MessageId {
        &self.id
    }

    /// The message body.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Consumes the message and returns its body.
    pub fn into_body(self) -> Bytes {
        self.body
    }

    /// Length of the body in bytes.
    pub fn size(&self) -> usize {
        self.body.len()
    }

    /// Approximate size of the message on the wire, including id and properties.
    pub fn wire_size(&self) -> usize {
        let properties: usize = self
            .properties
            .iter()
            .map(|(key, value)| key.len() + value.len())
            .sum();
        self.id.as_str().len() + self.body.len() + properties
    }

    /// Deserializes the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.body)
    }

    /// All user properties.
    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }

    /// Returns a single user property.
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// Sets a user property.
    ///
    /// The `MessageType` property is overwritten by the sender, whatever the caller puts there.
    pub fn set_property(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Reads the claim-check tag.
    pub fn message_type(&self) -> Result<MessageType, ProtocolError> {
        let value = self
            .property(MESSAGE_TYPE_KEY)
            .ok_or(ProtocolError::MissingType)?;
        Ok(value.parse::<MessageType>()?)
    }

    pub(crate) fn set_message_type(&mut self, message_type: MessageType) {
        self.properties
            .insert(MESSAGE_TYPE_KEY.to_owned(), message_type.as_str().to_owned());
    }

    /// Moves the body out, leaving an empty one in its place.
    pub(crate) fn take_body(&mut self) -> Bytes {
        std::mem::take(&mut self.body)
    }

    pub(crate) fn replace_body(&mut self, body: Bytes) {
        self.body = body;
    }
}
