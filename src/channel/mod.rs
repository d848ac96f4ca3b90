//! Resilient request channel
//!
//! A strict-alternation request/reply exchange with per-attempt deadlines,
//! reconnect on timeout, and a bounded number of attempts.

mod req;
mod resilient;
mod server;

pub use req::{ReqSocket, ReqState};
pub use resilient::{ChannelPhase, ResilientChannel, RetryPolicy};
pub use server::{PongHandler, ReplyServer, RequestHandler};
