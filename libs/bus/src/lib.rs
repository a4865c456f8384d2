//! # dea-bus
//!
//! Client for the text-based publish/subscribe bus the agent talks to.
//!
//! ## Wire Protocol
//!
//! Commands sent to the broker:
//!
//! ```text
//! CONNECT {"verbose":false,"pedantic":false,"user":"u","pass":"p"}\r\n
//! PUB <subject> [reply-to] <#bytes>\r\n<payload>\r\n
//! SUB <subject> [queue group] <sid>\r\n
//! UNSUB <sid> [max msgs]\r\n
//! PING\r\n / PONG\r\n
//! ```
//!
//! Operations received from the broker: `MSG`, `+OK`, `-ERR`, `PING`, `PONG`
//! and `INFO`. See [`protocol`] for the incremental parser.
//!
//! ## Client
//!
//! [`Client`] owns one TCP connection with a reader task and a writer task.
//! Publishes issued while the connection is down are buffered and flushed in
//! order after the next successful handshake. Subscriptions survive
//! reconnects. Publish callbacks are tied to PING/PONG round trips and fire in
//! the order they were queued.

mod client;
mod error;
mod options;
pub mod protocol;

pub use client::{Client, ErrorCallback, MessageCallback, Status, SubscribeOptions};
pub use error::{BusError, ProtocolError};
pub use options::ConnectOptions;
pub use protocol::Message;
