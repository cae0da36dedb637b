//! Claim-check messaging on top of a peek-lock queue and a blob store.
//!
//! Messages whose body stays below [`MAX_MESSAGE_SIZE`] travel on the queue as they are. Larger
//! bodies are written to a blob store under the message id, and only an empty, tagged claim check
//! is enqueued. The [`Receiver`] recognizes claim checks by their [`MessageType`] tag, fetches the
//! payload and hands the application the message it would have received without offloading.
//!
//! Delivery is at-least-once. A delivery is completed only after the payload was fetched and the
//! handler succeeded, every other outcome leaves it for the transport to redeliver.
//!
//! ```no_run
//! # async fn run() -> anyhow::Result<()> {
//! use claimcheck_service::{ClaimCheck, Config, LogObserver, Message};
//!
//! let claim_check = ClaimCheck::connect(&Config::load(None)?)?;
//!
//! let handle = claim_check.register_handler(
//!     |message: Message| async move {
//!         println!("received {} bytes", message.size());
//!         anyhow::Ok(())
//!     },
//!     LogObserver,
//! )?;
//!
//! claim_check.sender().send_json(&serde_json::json!({"x": 1})).await?;
//! handle.shutdown().await;
//! # Ok(())
//! # }
//! ```
#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

pub mod blob;
pub mod classify;
pub mod client;
mod concurrency;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod message;
pub mod payload;
pub mod receiver;
pub mod sender;
pub mod transport;

pub use claimcheck_types::{MAX_MESSAGE_SIZE, MESSAGE_TYPE_KEY, MessageType};

pub use client::ClaimCheck;
pub use config::Config;
pub use dispatch::{
    Action, DispatchHandle, ExceptionContext, ExceptionObserver, HandlerOptions, LogObserver,
};
pub use error::{ReceiveError, SendError};
pub use message::{Message, MessageId};
pub use receiver::{DeliveryOutcome, MessageHandler, Receiver, UnackReason};
pub use sender::Sender;
