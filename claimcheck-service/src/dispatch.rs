//! Dispatch loop pumping deliveries from the transport into a [`Receiver`].
//!
//! [`Receiver::register_handler`] spawns a background task that receives deliveries and runs each
//! on its own task, bounded by [`HandlerOptions::max_concurrent_calls`]. Failures of individual
//! deliveries are forwarded to an [`ExceptionObserver`] and never stop the loop.

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::concurrency::ConcurrencyLimiter;
use crate::error::{DispatchError, ReceiveError};
use crate::message::MessageId;
use crate::receiver::{DeliveryOutcome, MessageHandler, Receiver};

/// Pause after a failed receive before the transport is polled again.
const RECEIVE_BACKOFF: Duration = Duration::from_millis(500);

/// Options for [`Receiver::register_handler`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HandlerOptions {
    /// Upper bound on deliveries processed at the same time.
    pub max_concurrent_calls: usize,
    /// Whether the transport should complete deliveries on its own.
    ///
    /// Completion is owned by the receiver, so registration fails if this is set.
    pub auto_complete: bool,
}

impl HandlerOptions {
    /// Manual completion with the given concurrency.
    pub fn new(max_concurrent_calls: usize) -> Self {
        Self {
            max_concurrent_calls,
            auto_complete: false,
        }
    }
}

impl Default for HandlerOptions {
    fn default() -> Self {
        Self::new(1)
    }
}

/// What the dispatch loop was doing when an error occurred.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    /// Waiting for the next delivery.
    Receive,
    /// Running a delivery through the [`Receiver`].
    ProcessDelivery,
}

impl Action {
    /// Returns the action as a static string.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Receive => "receive",
            Self::ProcessDelivery => "process_delivery",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Describes where an error reported to an [`ExceptionObserver`] happened.
#[derive(Clone, Debug)]
pub struct ExceptionContext {
    /// The queue the dispatch loop reads from.
    pub queue: String,
    /// What the loop was doing.
    pub action: Action,
    /// The affected message, if a delivery was involved.
    pub message_id: Option<MessageId>,
    /// The delivery count of the affected message, if a delivery was involved.
    pub delivery_count: Option<u32>,
}

/// Receives every error raised by the dispatch loop.
///
/// Implemented for closures taking an [`ExceptionContext`] and a [`ReceiveError`].
pub trait ExceptionObserver: Send + Sync + 'static {
    /// Called once per failed receive or delivery.
    fn on_exception(&self, context: &ExceptionContext, error: &ReceiveError);
}

impl<F> ExceptionObserver for F
where
    F: Fn(&ExceptionContext, &ReceiveError) + Send + Sync + 'static,
{
    fn on_exception(&self, context: &ExceptionContext, error: &ReceiveError) {
        self(context, error)
    }
}

/// An [`ExceptionObserver`] that logs every error.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogObserver;

impl ExceptionObserver for LogObserver {
    fn on_exception(&self, context: &ExceptionContext, error: &ReceiveError) {
        tracing::error!(
            queue = %context.queue,
            action = %context.action,
            message_id = context.message_id.as_ref().map(MessageId::as_str),
            delivery_count = context.delivery_count,
            error = error as &dyn std::error::Error,
            "failed to process delivery"
        );
    }
}

/// Handle to a running dispatch loop.
///
/// Dropping the handle leaves the loop running in the background.
#[derive(Debug)]
pub struct DispatchHandle {
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl DispatchHandle {
    /// Stops taking new deliveries and waits for in-flight ones to finish.
    ///
    /// Deliveries still running when this is called are not completed and will be redelivered by
    /// the transport.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        self.join().await;
    }

    /// Waits until the loop stops on its own, which happens once the transport is closed.
    pub async fn join(self) {
        if let Err(err) = self.task.await {
            tracing::error!(error = &err as &dyn std::error::Error, "dispatch loop panicked");
        }
    }

    /// Returns `true` if the loop has stopped.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Receiver {
    /// Starts pumping deliveries into `handler`.
    ///
    /// Every delivery runs through [`process_delivery`](Self::process_delivery) on its own task,
    /// with at most `options.max_concurrent_calls` in flight. Errors go to `observer`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn register_handler<H, O>(
        &self,
        handler: H,
        options: HandlerOptions,
        observer: O,
    ) -> Result<DispatchHandle, DispatchError>
    where
        H: MessageHandler,
        O: ExceptionObserver,
    {
        if options.auto_complete {
            return Err(DispatchError::AutoCompleteEnabled);
        }
        if options.max_concurrent_calls == 0 {
            return Err(DispatchError::ZeroConcurrency);
        }

        let shutdown = CancellationToken::new();
        let pump = Pump {
            receiver: self.clone(),
            handler: Arc::new(handler),
            observer: Arc::new(observer),
            limiter: ConcurrencyLimiter::new(options.max_concurrent_calls),
            shutdown: shutdown.clone(),
        };

        let task = tokio::spawn(pump.run());
        Ok(DispatchHandle { shutdown, task })
    }
}

struct Pump {
    receiver: Receiver,
    handler: Arc<dyn MessageHandler>,
    observer: Arc<dyn ExceptionObserver>,
    limiter: ConcurrencyLimiter,
    shutdown: CancellationToken,
}

impl Pump {
    async fn run(self) {
        let queue = self.receiver.transport().queue().to_owned();
        tracing::debug!(%queue, "dispatch loop started");

        loop {
            let permit = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                permit = self.limiter.acquire() => permit,
            };

            let received = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                received = self.receiver.transport().receive() => received,
            };

            let delivery = match received {
                Ok(Some(delivery)) => delivery,
                Ok(None) => {
                    tracing::debug!(%queue, "queue closed");
                    break;
                }
                Err(err) => {
                    drop(permit);
                    let context = ExceptionContext {
                        queue: queue.clone(),
                        action: Action::Receive,
                        message_id: None,
                        delivery_count: None,
                    };
                    self.observer
                        .on_exception(&context, &ReceiveError::Transport(err));

                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(RECEIVE_BACKOFF) => continue,
                    }
                }
            };

            let receiver = self.receiver.clone();
            let handler = Arc::clone(&self.handler);
            let observer = Arc::clone(&self.observer);
            let cancel = self.shutdown.child_token();
            let queue = queue.clone();

            tokio::spawn(async move {
                let _permit = permit;
                let message_id = delivery.message.id().clone();
                let delivery_count = delivery.delivery_count;

                let processed =
                    AssertUnwindSafe(receiver.process_delivery(delivery, &*handler, &cancel))
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|panic| Err(ReceiveError::Panicked(panic_detail(panic))));

                match processed {
                    Ok(DeliveryOutcome::Completed) => {
                        tracing::trace!(%message_id, "delivery completed");
                    }
                    Ok(DeliveryOutcome::Unacknowledged(reason)) => {
                        tracing::debug!(%message_id, ?reason, "delivery left unacknowledged");
                    }
                    Err(err) => {
                        let context = ExceptionContext {
                            queue,
                            action: Action::ProcessDelivery,
                            message_id: Some(message_id),
                            delivery_count: Some(delivery_count),
                        };
                        observer.on_exception(&context, &err);
                    }
                }
            });
        }

        self.limiter.wait_all().await;
        tracing::debug!(%queue, "dispatch loop stopped");
    }
}

fn panic_detail(panic: Box<dyn Any + Send + 'static>) -> String {
    if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "no error details".to_owned()
    }
}
