//! Blob store backends holding offloaded payloads.
//!
//! The [`BlobStore`] trait is the consumed interface of the external object store. Payloads
//! are addressed by container and key; the claim-check protocol uses the message id as key.

pub mod common;
pub mod in_memory;
pub mod local_fs;

pub use common::{BlobStore, PayloadStream, SharedBlobStore};
pub use in_memory::InMemoryBlobStore;
pub use local_fs::LocalFsBlobStore;
