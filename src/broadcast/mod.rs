//! Broadcast log and replay service
//!
//! Producers append to a sequenced log that publishes every event live.
//! Subscribers that missed part of the stream ask the replay service for
//! whatever is still retained.
//!
//! - [`ReplayBuffer`]: bounded ring of the most recent events
//! - [`BroadcastLog`] / [`LogHandle`]: the task that owns the buffer and the publisher
//! - [`ReplayResponder`] / [`ReplayClient`]: catch-up queries
//! - [`LogSubscriber`]: live stream with ordering checks and catch-up
//! - [`EventProducer`]: periodic `{seq, ts}` events

mod buffer;
mod log;
mod producer;
mod replay;
mod subscriber;

pub use buffer::ReplayBuffer;
pub use log::{BroadcastLog, BroadcastLogConfig, LogHandle, LogWindow};
pub use producer::EventProducer;
pub use replay::{ReplayClient, ReplayResponder, DEFAULT_REPLAY_TIMEOUT};
pub use subscriber::LogSubscriber;
