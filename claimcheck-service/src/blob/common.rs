use std::fmt::Debug;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::stream::BoxStream;

use crate::error::{BlobError, BlobResult};

/// Type alias for payload streams exchanged with blob stores.
pub type PayloadStream = BoxStream<'static, std::io::Result<Bytes>>;

/// A blob store shared between all senders and receivers of a process.
pub type SharedBlobStore = Arc<dyn BlobStore>;

/// The object store that holds offloaded payloads.
///
/// Implementations must be safe for concurrent use: a single instance serves every in-flight
/// send and delivery.
#[async_trait::async_trait]
pub trait BlobStore: Debug + Send + Sync + 'static {
    /// The store name, used for diagnostics.
    fn name(&self) -> &'static str;

    /// Creates the container if it does not exist yet.
    async fn ensure_container(&self, container: &str) -> BlobResult<()>;

    /// Stores or overwrites the blob at `key`.
    ///
    /// Returns only once the blob is visible to readers.
    async fn put_blob(
        &self,
        container: &str,
        key: &str,
        stream: PayloadStream,
    ) -> BlobResult<()>;

    /// Returns the length of the blob at `key`, or `None` if it does not exist.
    async fn blob_length(&self, container: &str, key: &str) -> BlobResult<Option<u64>>;

    /// Streams the contents of the blob at `key`, or returns `None` if it does not exist.
    async fn get_blob(&self, container: &str, key: &str) -> BlobResult<Option<PayloadStream>>;
}

/// Rejects names that cannot be used as a single path segment.
pub(crate) fn validate_name(name: &str) -> BlobResult<()> {
    let invalid = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0']);

    if invalid {
        return Err(BlobError::InvalidKey {
            key: name.to_owned(),
        });
    }

    Ok(())
}
