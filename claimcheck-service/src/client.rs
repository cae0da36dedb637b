//! Wiring of transport and blob store from [`Config`].

use std::path::Path;
use std::sync::Arc;

use secrecy::ExposeSecret;

use crate::blob::{InMemoryBlobStore, LocalFsBlobStore, SharedBlobStore};
use crate::config::{Config, MEMORY_CONNECTION_STRING};
use crate::dispatch::{DispatchHandle, ExceptionObserver, HandlerOptions};
use crate::error::DispatchError;
use crate::payload::PayloadStore;
use crate::receiver::{MessageHandler, Receiver};
use crate::sender::Sender;
use crate::transport::{InMemoryQueue, SharedTransport};

/// A backend selected by a connection string.
#[derive(Debug, PartialEq, Eq)]
enum Endpoint<'a> {
    Memory,
    File(&'a Path),
}

fn parse_endpoint(connection_string: &str) -> anyhow::Result<Endpoint<'_>> {
    if connection_string == MEMORY_CONNECTION_STRING {
        return Ok(Endpoint::Memory);
    }

    if let Some(path) = connection_string.strip_prefix("file://") {
        if path.is_empty() {
            anyhow::bail!("file:// connection string without a path");
        }
        return Ok(Endpoint::File(Path::new(path)));
    }

    // Only the scheme is reported, the rest may contain credentials.
    match connection_string.split_once("://") {
        Some((scheme, _)) => anyhow::bail!("unsupported connection string scheme {scheme:?}"),
        None => anyhow::bail!("malformed connection string"),
    }
}

/// One shared transport and one shared blob store, with the sender and receiver built on them.
///
/// Every clone of the handles returned here talks to the same queue and the same container.
#[derive(Clone, Debug)]
pub struct ClaimCheck {
    transport: SharedTransport,
    sender: Sender,
    receiver: Receiver,
    max_concurrent_deliveries: usize,
}

impl ClaimCheck {
    /// Builds sender and receiver on top of already connected backends.
    pub fn new(
        transport: SharedTransport,
        blobs: SharedBlobStore,
        container: impl Into<String>,
        max_concurrent_deliveries: usize,
    ) -> Self {
        let payloads = PayloadStore::new(blobs, container);

        Self {
            sender: Sender::new(Arc::clone(&transport), payloads.clone()),
            receiver: Receiver::new(Arc::clone(&transport), payloads),
            transport,
            max_concurrent_deliveries,
        }
    }

    /// Connects the backends named by the connection strings in `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if a connection string is malformed or names a backend that is not
    /// available for its role.
    pub fn connect(config: &Config) -> anyhow::Result<Self> {
        let transport: SharedTransport =
            match parse_endpoint(config.queue_connection_string.expose_secret().as_str())? {
                Endpoint::Memory => Arc::new(InMemoryQueue::new(config.queue_name.as_str())),
                Endpoint::File(_) => anyhow::bail!("file:// is not supported for queues"),
            };

        let blobs: SharedBlobStore =
            match parse_endpoint(config.blob_connection_string.expose_secret().as_str())? {
                Endpoint::Memory => Arc::new(InMemoryBlobStore::new()),
                Endpoint::File(path) => Arc::new(LocalFsBlobStore::new(path)),
            };

        tracing::debug!(
            queue = %config.queue_name,
            container = %config.container_name,
            blob_store = blobs.name(),
            "connected"
        );

        Ok(Self::new(
            transport,
            blobs,
            config.container_name.as_str(),
            config.max_concurrent_deliveries,
        ))
    }

    /// The shared queue transport.
    pub fn transport(&self) -> &SharedTransport {
        &self.transport
    }

    /// A sender for the configured queue.
    pub fn sender(&self) -> &Sender {
        &self.sender
    }

    /// A receiver for the configured queue.
    pub fn receiver(&self) -> &Receiver {
        &self.receiver
    }

    /// Registers `handler` with the configured concurrency and manual completion.
    ///
    /// See [`Receiver::register_handler`].
    pub fn register_handler<H, O>(
        &self,
        handler: H,
        observer: O,
    ) -> Result<DispatchHandle, DispatchError>
    where
        H: MessageHandler,
        O: ExceptionObserver,
    {
        let options = HandlerOptions::new(self.max_concurrent_deliveries);
        self.receiver.register_handler(handler, options, observer)
    }
}
