//! Live subscriber with catch-up

use std::net::SocketAddr;

use bytes::Bytes;
use tracing::{debug, warn};

use super::ReplayClient;
use crate::error::Result;
use crate::protocol::BroadcastFrame;
use crate::transport::SubSocket;
use crate::types::{Event, ReplayOutcome};

/// Receives live events and fills holes through the replay service
///
/// Live events come out in strictly increasing seq order; anything at or
/// below the last delivered seq is dropped.
pub struct LogSubscriber {
    sub: SubSocket,
    replay: ReplayClient,
    last_seq: Option<u64>,
}

impl LogSubscriber {
    pub async fn connect(publish_addr: SocketAddr, replay_addr: SocketAddr, topic: impl Into<Bytes>) -> Result<Self> {
        let sub = SubSocket::connect(publish_addr, topic).await?;
        Ok(Self {
            sub,
            replay: ReplayClient::new(replay_addr),
            last_seq: None,
        })
    }

    /// Next live event
    pub async fn recv(&mut self) -> Result<Event> {
        loop {
            let frames = self.sub.recv().await?;
            let frame = match BroadcastFrame::from_frames(&frames) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(error = %e, "Dropping malformed broadcast frame");
                    continue;
                }
            };

            if let Some(last) = self.last_seq {
                if frame.seq <= last {
                    warn!(seq = frame.seq, last, "Dropping out-of-order broadcast");
                    continue;
                }
                if frame.seq > last + 1 {
                    debug!(seq = frame.seq, missed = frame.seq - last - 1, "Live stream skipped events");
                }
            }

            self.last_seq = Some(frame.seq);
            return Ok(Event::received(frame.seq, frame.payload));
        }
    }

    /// Replay retained events from `start`
    pub async fn catch_up(&mut self, start: u64) -> Result<ReplayOutcome> {
        let outcome = self.replay.replay(start).await?;
        if let Some(gap) = outcome.gap {
            warn!(
                requested = gap.requested,
                first_available = gap.first_available,
                missing = gap.missing(),
                "Catch-up could not cover the full range"
            );
        }
        Ok(outcome)
    }

    /// Highest live seq delivered so far
    pub fn last_seq(&self) -> Option<u64> {
        self.last_seq
    }
}
