//! Catch-up replay over a router socket
//!
//! Query: one 8-byte big-endian start seq. Response: an optional gap frame,
//! then `[seq, payload]` for every retained event at or after the start, then
//! the end sentinel. A malformed query gets a single rejection frame.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};

use super::LogHandle;
use crate::error::{Error, Result};
use crate::protocol::{ReplayFrame, ReplayQuery};
use crate::transport::{DealerSocket, RouterSocket};
use crate::types::{Event, Identity, ReplayGap, ReplayOutcome};

/// Default bound on a whole replay exchange
pub const DEFAULT_REPLAY_TIMEOUT: Duration = Duration::from_secs(5);

// ─────────────────────────────────────────────────────────────────
// Responder
// ─────────────────────────────────────────────────────────────────

/// Answers replay queries from a snapshot of the log
pub struct ReplayResponder {
    socket: RouterSocket,
    log: LogHandle,
    signal_gaps: bool,
}

impl ReplayResponder {
    pub async fn bind(addr: SocketAddr, log: LogHandle, signal_gaps: bool) -> Result<Self> {
        let socket = RouterSocket::bind(addr).await?;
        info!(addr = %socket.local_addr(), signal_gaps, "Replay service listening");
        Ok(Self {
            socket,
            log,
            signal_gaps,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr()
    }

    pub fn spawn(self) -> JoinHandle<()> {
        let span = info_span!("replay", addr = %self.local_addr());
        tokio::spawn(self.run().instrument(span))
    }

    /// Serve queries one at a time until the log stops
    pub async fn run(mut self) {
        loop {
            let (peer, frames) = tokio::select! {
                _ = self.log.closed() => break,
                inbound = self.socket.recv() => match inbound {
                    Some(inbound) => inbound,
                    None => break,
                },
            };

            if let Err(e) = self.answer(&peer, &frames).await {
                match e {
                    Error::ChannelClosed(_) => break,
                    e => debug!(peer = %peer, error = %e, "Replay response not delivered"),
                }
            }
        }
        info!("Replay service stopped");
    }

    async fn answer(&self, peer: &Identity, frames: &[Bytes]) -> Result<()> {
        let query = match ReplayQuery::parse(frames) {
            Ok(query) => query,
            Err(e) => {
                warn!(peer = %peer, error = %e, "Rejecting malformed replay query");
                let rejected = ReplayFrame::Rejected {
                    reason: e.to_string(),
                };
                return self.socket.send(peer, rejected.to_frames()?).await;
            }
        };

        let outcome = self.log.snapshot(query.start).await?;
        if let Some(gap) = outcome.gap {
            warn!(
                peer = %peer,
                requested = gap.requested,
                first_available = gap.first_available,
                "Replay starts before retained window"
            );
            if self.signal_gaps {
                let frame = ReplayFrame::Gap {
                    first_available: gap.first_available,
                };
                self.socket.send(peer, frame.to_frames()?).await?;
            }
        }

        let count = outcome.events.len();
        for event in outcome.events {
            let frame = ReplayFrame::Event {
                seq: event.seq,
                payload: event.payload,
            };
            self.socket.send(peer, frame.to_frames()?).await?;
        }
        self.socket.send(peer, ReplayFrame::End.to_frames()?).await?;

        debug!(peer = %peer, start = query.start, count, "Replay served");
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────
// Client
// ─────────────────────────────────────────────────────────────────

/// Issues replay queries, one at a time
///
/// A query that fails or times out drops the connection; the next query
/// opens a fresh one.
pub struct ReplayClient {
    addr: SocketAddr,
    timeout: Duration,
    dealer: Option<DealerSocket>,
}

impl ReplayClient {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            timeout: DEFAULT_REPLAY_TIMEOUT,
            dealer: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Every retained event with `seq >= start`
    pub async fn replay(&mut self, start: u64) -> Result<ReplayOutcome> {
        let mut dealer = match self.dealer.take() {
            Some(dealer) => dealer,
            None => DealerSocket::connect(self.addr, None).await?,
        };

        let timeout_ms = self.timeout.as_millis() as u64;
        let outcome = tokio::time::timeout(self.timeout, exchange(&mut dealer, start))
            .await
            .map_err(|_| Error::Timeout { timeout_ms })??;

        // Only a cleanly finished exchange leaves the stream reusable
        self.dealer = Some(dealer);
        Ok(outcome)
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

async fn exchange(dealer: &mut DealerSocket, start: u64) -> Result<ReplayOutcome> {
    dealer.send(&ReplayQuery { start }.to_frames()).await?;

    let mut outcome = ReplayOutcome::default();
    loop {
        match ReplayFrame::from_frames(&dealer.recv().await?)? {
            ReplayFrame::Event { seq, payload } => outcome.events.push(Event::received(seq, payload)),
            ReplayFrame::Gap { first_available } => {
                outcome.gap = Some(ReplayGap {
                    requested: start,
                    first_available,
                });
            }
            ReplayFrame::End => return Ok(outcome),
            ReplayFrame::Rejected { reason } => {
                // Rejections end the exchange without a sentinel
                return Err(Error::ReplayRejected { reason });
            }
        }
    }
}
