//! The broadcast log task
//!
//! One task owns the replay buffer and the publisher socket. Appends,
//! snapshots and window queries are commands on a channel, so every replay
//! sees a consistent copy and appends are published in seq order.

use std::net::SocketAddr;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, trace, warn, Instrument};

use super::ReplayBuffer;
use crate::config::{parse_addr, BroadcastSettings};
use crate::error::{Error, Result};
use crate::protocol::BroadcastFrame;
use crate::transport::PubSocket;
use crate::types::{EventPayload, ReplayOutcome};

// ─────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────

/// Broadcast log configuration
#[derive(Debug, Clone)]
pub struct BroadcastLogConfig {
    /// Where live events are published
    pub publish_addr: SocketAddr,

    /// Topic tag on every broadcast frame
    pub topic: Bytes,

    /// Events retained for replay
    pub capacity: usize,

    /// Pending commands before callers wait
    pub command_queue: usize,
}

impl Default for BroadcastLogConfig {
    fn default() -> Self {
        Self {
            publish_addr: SocketAddr::from(([127, 0, 0, 1], 5556)),
            topic: Bytes::from_static(b"kv"),
            capacity: 1000,
            command_queue: 256,
        }
    }
}

impl BroadcastLogConfig {
    pub fn from_settings(settings: &BroadcastSettings) -> Result<Self> {
        Ok(Self {
            publish_addr: parse_addr("broadcast.publish_addr", &settings.publish_addr)?,
            topic: Bytes::from(settings.topic.clone()),
            capacity: settings.capacity,
            ..Self::default()
        })
    }
}

// ─────────────────────────────────────────────────────────────────
// Commands
// ─────────────────────────────────────────────────────────────────

/// Retained range of the log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogWindow {
    /// Oldest retained seq, `None` before the first append
    pub first_seq: Option<u64>,
    /// Seq the next append will get
    pub next_seq: u64,
    pub len: usize,
    pub capacity: usize,
}

enum LogCommand {
    Append {
        payload: Bytes,
        reply: oneshot::Sender<u64>,
    },
    /// Append an `EventPayload` stamped with the assigned seq
    AppendStamped { reply: oneshot::Sender<Result<u64>> },
    Snapshot {
        start: u64,
        reply: oneshot::Sender<ReplayOutcome>,
    },
    Window(oneshot::Sender<LogWindow>),
    Shutdown,
}

// ─────────────────────────────────────────────────────────────────
// Handle
// ─────────────────────────────────────────────────────────────────

/// Cloneable handle to a running broadcast log
#[derive(Clone)]
pub struct LogHandle {
    command_tx: mpsc::Sender<LogCommand>,
    publish_addr: SocketAddr,
}

impl LogHandle {
    /// Append an event; returns its seq once it has been published
    pub async fn append(&self, payload: impl Into<Bytes>) -> Result<u64> {
        let (reply, rx) = oneshot::channel();
        self.send_command(LogCommand::Append {
            payload: payload.into(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| Error::channel_closed("broadcast log"))
    }

    /// Append a `{seq, ts}` payload carrying the assigned seq
    pub async fn append_stamped(&self) -> Result<u64> {
        let (reply, rx) = oneshot::channel();
        self.send_command(LogCommand::AppendStamped { reply }).await?;
        rx.await.map_err(|_| Error::channel_closed("broadcast log"))?
    }

    /// Consistent copy of retained events with `seq >= start`
    pub async fn snapshot(&self, start: u64) -> Result<ReplayOutcome> {
        let (reply, rx) = oneshot::channel();
        self.send_command(LogCommand::Snapshot { start, reply }).await?;
        rx.await.map_err(|_| Error::channel_closed("broadcast log"))
    }

    pub async fn window(&self) -> Result<LogWindow> {
        let (reply, rx) = oneshot::channel();
        self.send_command(LogCommand::Window(reply)).await?;
        rx.await.map_err(|_| Error::channel_closed("broadcast log"))
    }

    /// Stop the log; dependent tasks wind down once it is gone
    pub async fn shutdown(&self) -> Result<()> {
        self.send_command(LogCommand::Shutdown).await
    }

    /// Resolves once the log task has stopped
    pub async fn closed(&self) {
        self.command_tx.closed().await
    }

    pub fn publish_addr(&self) -> SocketAddr {
        self.publish_addr
    }

    async fn send_command(&self, command: LogCommand) -> Result<()> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| Error::channel_closed("broadcast log"))
    }
}

// ─────────────────────────────────────────────────────────────────
// Log Task
// ─────────────────────────────────────────────────────────────────

/// Append-only sequenced event stream with live broadcast
pub struct BroadcastLog;

impl BroadcastLog {
    /// Bind the publisher and start the log task
    pub async fn start(config: BroadcastLogConfig) -> Result<(LogHandle, JoinHandle<()>)> {
        let publisher = PubSocket::bind(config.publish_addr).await?;
        let publish_addr = publisher.local_addr();
        let (command_tx, command_rx) = mpsc::channel(config.command_queue);

        info!(
            addr = %publish_addr,
            topic = %String::from_utf8_lossy(&config.topic),
            capacity = config.capacity,
            "Broadcast log started"
        );

        let buffer = ReplayBuffer::new(config.capacity);
        let span = info_span!("log", topic = %String::from_utf8_lossy(&config.topic));
        let task = tokio::spawn(run_log(buffer, publisher, config.topic, command_rx).instrument(span));

        Ok((
            LogHandle {
                command_tx,
                publish_addr,
            },
            task,
        ))
    }
}

async fn run_log(
    mut buffer: ReplayBuffer,
    publisher: PubSocket,
    topic: Bytes,
    mut command_rx: mpsc::Receiver<LogCommand>,
) {
    while let Some(command) = command_rx.recv().await {
        match command {
            LogCommand::Append { payload, reply } => {
                let seq = publish(&mut buffer, &publisher, &topic, payload);
                let _ = reply.send(seq);
            }
            LogCommand::AppendStamped { reply } => {
                let result = EventPayload::now(buffer.next_seq())
                    .encode()
                    .map(|payload| publish(&mut buffer, &publisher, &topic, payload));
                let _ = reply.send(result);
            }
            LogCommand::Snapshot { start, reply } => {
                let _ = reply.send(buffer.snapshot_from(start));
            }
            LogCommand::Window(reply) => {
                let _ = reply.send(LogWindow {
                    first_seq: buffer.first_seq(),
                    next_seq: buffer.next_seq(),
                    len: buffer.len(),
                    capacity: buffer.capacity(),
                });
            }
            LogCommand::Shutdown => {
                debug!("Broadcast log shutdown requested");
                break;
            }
        }
    }

    info!(next_seq = buffer.next_seq(), "Broadcast log stopped");
}

fn publish(buffer: &mut ReplayBuffer, publisher: &PubSocket, topic: &Bytes, payload: Bytes) -> u64 {
    let event = buffer.append(payload);
    let frame = BroadcastFrame {
        topic: topic.clone(),
        seq: event.seq,
        payload: event.payload.clone(),
    };

    match frame.to_frames() {
        Ok(frames) => {
            let delivered = publisher.send(frames);
            trace!(seq = event.seq, subscribers = delivered, "Event published");
        }
        Err(e) => warn!(seq = event.seq, error = %e, "Event retained but not published"),
    }
    event.seq
}
