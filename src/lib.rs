//! Outbound leg of a broker transport.
//!
//! Accepts messages for one remote endpoint, keeps at most
//! [`MAX_OUTSTANDING`] sends in flight, and resubmits failed sends after a
//! fixed backoff. Delivery is at-least-once; retry state lives in memory only.

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod address;
pub mod classify;
pub mod config;
pub mod connection;
pub mod error;
pub mod message;
pub mod retry;

mod dispatch;
mod gate;
mod transport;

/// Default cap on sends issued and not yet completed.
pub const MAX_OUTSTANDING: usize = 100;
/// Default pause before a failed send is resubmitted.
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 1_000;
/// Application property carrying how many times a message has been retried.
pub const RETRY_COUNT_KEY: &str = "busy-retries";

pub use address::{AddressMetricsSnapshot, BrokerAddress, EndpointAddress};
pub use classify::{classify, SendOutcome};
pub use config::TransportConfig;
pub use connection::{ConnectionHandler, MessageSender, SharedConnectionHandler};
pub use dispatch::MetricsSnapshot;
pub use error::{SendError, TransportError};
pub use message::{normalize_id, JsonSendContext, OutboundMessage, SendContext};
pub use retry::{DeadLetter, DeadLetterReason, DeadLetterSink, RetryPolicy};
pub use transport::{OutboundTransport, TransportBuilder};
