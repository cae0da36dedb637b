//! In-memory blob store.
//!
//! This provides a [`BlobStore`] backed by a `HashMap`, used for `memory://` connection strings
//! and throughout the tests. The store is [`Clone`] so tests can hold a handle for direct
//! inspection while senders and receivers share another. Every [`put_blob`](BlobStore::put_blob)
//! and [`get_blob`](BlobStore::get_blob) call is counted.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::{Bytes, BytesMut};
use futures_util::{StreamExt, TryStreamExt};

use super::common::{BlobStore, PayloadStream, validate_name};
use crate::error::{BlobError, BlobResult};

type Containers = BTreeMap<String, HashMap<String, Bytes>>;

/// A [`BlobStore`] that keeps all blobs in process memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBlobStore {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    containers: Mutex<Containers>,
    puts: AtomicUsize,
    gets: AtomicUsize,
}

impl InMemoryBlobStore {
    /// Creates an empty store without containers.
    pub fn new() -> Self {
        Self::default()
    }

    fn containers(&self) -> MutexGuard<'_, Containers> {
        self.inner
            .containers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of `put_blob` calls observed so far, including failed ones.
    pub fn put_count(&self) -> usize {
        self.inner.puts.load(Ordering::Acquire)
    }

    /// Number of `get_blob` calls observed so far, including misses.
    pub fn get_count(&self) -> usize {
        self.inner.gets.load(Ordering::Acquire)
    }

    /// Returns a clone of the stored bytes, if present.
    pub fn get_stored(&self, container: &str, key: &str) -> Option<Bytes> {
        self.containers()
            .get(container)
            .and_then(|blobs| blobs.get(key))
            .cloned()
    }

    /// Returns `true` if the container holds a blob at `key`.
    pub fn contains(&self, container: &str, key: &str) -> bool {
        self.get_stored(container, key).is_some()
    }

    /// Returns `true` if no blob is stored in any container.
    pub fn is_empty(&self) -> bool {
        self.containers().values().all(HashMap::is_empty)
    }

    /// Removes a blob directly, bypassing the `BlobStore` trait.
    ///
    /// Useful for simulating blobs that vanished between send and receive.
    pub fn remove(&self, container: &str, key: &str) {
        if let Some(blobs) = self.containers().get_mut(container) {
            blobs.remove(key);
        }
    }
}

#[async_trait::async_trait]
impl BlobStore for InMemoryBlobStore {
    fn name(&self) -> &'static str {
        "in-memory"
    }

    async fn ensure_container(&self, container: &str) -> BlobResult<()> {
        validate_name(container)?;
        self.containers().entry(container.to_owned()).or_default();
        Ok(())
    }

    async fn put_blob(
        &self,
        container: &str,
        key: &str,
        stream: PayloadStream,
    ) -> BlobResult<()> {
        self.inner.puts.fetch_add(1, Ordering::AcqRel);
        validate_name(key)?;

        let bytes: BytesMut = stream.try_collect().await?;
        let mut containers = self.containers();
        let blobs = containers
            .get_mut(container)
            .ok_or_else(|| BlobError::ContainerNotFound {
                container: container.to_owned(),
            })?;
        blobs.insert(key.to_owned(), bytes.freeze());

        Ok(())
    }

    async fn blob_length(&self, container: &str, key: &str) -> BlobResult<Option<u64>> {
        Ok(self
            .get_stored(container, key)
            .map(|bytes| bytes.len() as u64))
    }

    async fn get_blob(&self, container: &str, key: &str) -> BlobResult<Option<PayloadStream>> {
        self.inner.gets.fetch_add(1, Ordering::AcqRel);

        let entry = self.get_stored(container, key);
        Ok(entry.map(|bytes| futures_util::stream::once(async move { Ok(bytes) }).boxed()))
    }
}
