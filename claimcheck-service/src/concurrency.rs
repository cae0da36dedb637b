//! Concurrency limiter for in-flight deliveries.
//!
//! [`ConcurrencyLimiter`] caps the number of deliveries processed at once using a tokio
//! semaphore. Each [`ConcurrencyPermit`] notifies waiters on drop, so
//! [`ConcurrencyLimiter::wait_all`] resolves once every permit has been returned.

use std::sync::Arc;

use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};

/// Limits concurrent deliveries and tracks the in-flight count.
#[derive(Clone, Debug)]
pub(crate) struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    max: usize,
    released: Arc<Notify>,
}

impl ConcurrencyLimiter {
    /// Creates a new limiter with the given maximum number of permits.
    pub(crate) fn new(max: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max)),
            max,
            released: Arc::new(Notify::new()),
        }
    }

    /// Waits for a free permit.
    pub(crate) async fn acquire(&self) -> ConcurrencyPermit {
        // The semaphore is owned by the limiter and never closed.
        let permit = self.semaphore.clone().acquire_owned().await.ok();

        ConcurrencyPermit {
            permit,
            released: Arc::clone(&self.released),
        }
    }

    /// Returns the number of permits currently held.
    pub(crate) fn used_permits(&self) -> usize {
        self.max - self.semaphore.available_permits()
    }

    /// Waits until all permits have been returned.
    pub(crate) async fn wait_all(&self) {
        loop {
            let notified = self.released.notified();
            if self.used_permits() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// RAII guard for a concurrency permit.
///
/// Dropping this permit releases it back to the [`ConcurrencyLimiter`] and notifies any task
/// waiting in [`ConcurrencyLimiter::wait_all`].
#[derive(Debug)]
pub(crate) struct ConcurrencyPermit {
    permit: Option<OwnedSemaphorePermit>,
    released: Arc<Notify>,
}

impl Drop for ConcurrencyPermit {
    fn drop(&mut self) {
        drop(self.permit.take());
        self.released.notify_waiters();
    }
}
