//! Read/write adapter between the claim-check protocol and a [`BlobStore`].
//!
//! [`PayloadStore`] binds a shared blob store to the configured container and speaks in message
//! ids and whole payloads. Reads follow the store's contract literally: look up the blob length,
//! download the full byte sequence and check that both agree.

use std::sync::Arc;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use futures_util::{StreamExt, TryStreamExt};

use crate::blob::SharedBlobStore;
use crate::error::{BlobError, BlobResult};
use crate::message::MessageId;

/// Upper bound for the read buffer reserved up front from the advertised blob length.
const MAX_PREALLOC: u64 = 4 * 1024 * 1024;

/// Offloaded payloads of one container, keyed by message id.
#[derive(Clone, Debug)]
pub struct PayloadStore(Arc<PayloadStoreInner>);

#[derive(Debug)]
struct PayloadStoreInner {
    store: SharedBlobStore,
    container: String,
}

impl PayloadStore {
    /// Creates an adapter storing payloads in `container`.
    pub fn new(store: SharedBlobStore, container: impl Into<String>) -> Self {
        Self(Arc::new(PayloadStoreInner {
            store,
            container: container.into(),
        }))
    }

    /// The container holding the payloads.
    pub fn container(&self) -> &str {
        &self.0.container
    }

    /// Creates the container if it does not exist yet.
    pub async fn ensure_container(&self) -> BlobResult<()> {
        self.0.store.ensure_container(&self.0.container).await
    }

    /// Writes the full payload of message `id`.
    pub async fn put(&self, id: &MessageId, payload: Bytes) -> BlobResult<()> {
        let start = Instant::now();
        let size = payload.len() as u64;

        let stream = futures_util::stream::once(async move { Ok::<_, std::io::Error>(payload) });
        self.0
            .store
            .put_blob(&self.0.container, id.as_str(), stream.boxed())
            .await?;

        merni::distribution!(
            "blob.put.latency"@s: start.elapsed(),
            "store" => self.0.store.name()
        );
        merni::distribution!(
            "blob.put.size"@b: size,
            "store" => self.0.store.name()
        );

        tracing::debug!(message_id = %id, container = %self.0.container, size, "stored payload");
        Ok(())
    }

    /// Reads the full payload of message `id`.
    ///
    /// A missing blob is an error here: a claim check always refers to a stored payload.
    pub async fn get(&self, id: &MessageId) -> BlobResult<Bytes> {
        let start = Instant::now();
        let container = &self.0.container;
        let key = id.as_str();
        let not_found = || BlobError::NotFound {
            container: container.clone(),
            key: key.to_owned(),
        };

        let expected = self
            .0
            .store
            .blob_length(container, key)
            .await?
            .ok_or_else(not_found)?;

        let mut stream = self
            .0
            .store
            .get_blob(container, key)
            .await?
            .ok_or_else(not_found)?;

        // The advertised length is only a hint until the download has been checked against it.
        let capacity = usize::try_from(expected.min(MAX_PREALLOC)).unwrap_or_default();
        let mut payload = BytesMut::with_capacity(capacity);
        while let Some(chunk) = stream.try_next().await? {
            payload.extend_from_slice(&chunk);
        }

        let actual = payload.len() as u64;
        if actual != expected {
            return Err(BlobError::LengthMismatch {
                key: key.to_owned(),
                expected,
                actual,
            });
        }

        merni::distribution!(
            "blob.get.latency"@s: start.elapsed(),
            "store" => self.0.store.name()
        );

        tracing::debug!(message_id = %id, container = %container, size = actual, "fetched payload");
        Ok(payload.freeze())
    }
}
