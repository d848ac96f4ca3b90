//! Switchyard: sequenced broadcast, resilient requests and worker dispatch
//!
//! Four cooperating services over addressable async sockets:
//! - [`broadcast`]: append-only event log with live fan-out and catch-up replay
//! - [`channel`]: request/reply with per-attempt deadlines, reconnect and retry
//! - [`dispatch`]: worker registration and round-robin routing
//! - [`aggregate`]: correlation of asynchronous worker results
//!
//! [`frontend::Frontend`] couples dispatch and aggregation into a single
//! call. The socket layer lives in [`transport`], the wire encodings in
//! [`protocol`].

pub mod aggregate;
pub mod broadcast;
pub mod channel;
pub mod cli;
pub mod config;
pub mod demo;
pub mod dispatch;
pub mod error;
pub mod frontend;
pub mod logging;
pub mod protocol;
pub mod transport;
pub mod types;
pub mod version;

pub use error::{Error, ErrorCode, Result};
