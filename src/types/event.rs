//! Sequenced events and replay results

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// One entry of the broadcast log; immutable once appended
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// Position in the log, strictly increasing
    pub seq: u64,

    /// When the log accepted the event
    ///
    /// Wire frames carry no timestamp, so events rebuilt on the client side
    /// (live or replayed) hold their local receive time instead. Payloads
    /// that need the origin time carry it themselves, as [`EventPayload`] does.
    pub timestamp: DateTime<Utc>,

    /// Opaque payload bytes
    pub payload: Bytes,
}

impl Event {
    pub fn new(seq: u64, payload: impl Into<Bytes>) -> Self {
        Self {
            seq,
            timestamp: Utc::now(),
            payload: payload.into(),
        }
    }

    /// Event decoded from a broadcast or replay frame, stamped on arrival
    pub fn received(seq: u64, payload: impl Into<Bytes>) -> Self {
        Self::new(seq, payload)
    }
}

/// Payload map appended by the periodic producer
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EventPayload {
    pub seq: u64,
    /// Seconds since the Unix epoch
    pub ts: f64,
}

impl EventPayload {
    pub fn now(seq: u64) -> Self {
        let now = Utc::now();
        Self {
            seq,
            ts: now.timestamp_micros() as f64 / 1_000_000.0,
        }
    }

    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(raw)?)
    }
}

/// Replay asked for history older than the retained window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayGap {
    pub requested: u64,
    pub first_available: u64,
}

impl ReplayGap {
    /// Number of events lost between the request and the window
    pub fn missing(&self) -> u64 {
        self.first_available.saturating_sub(self.requested)
    }
}

/// Everything a replay query produced
#[derive(Debug, Clone, Default)]
pub struct ReplayOutcome {
    /// Retained events with `seq >= start`, in increasing order
    pub events: Vec<Event>,

    /// Set when the start preceded the retained window
    pub gap: Option<ReplayGap>,
}

impl ReplayOutcome {
    pub fn seqs(&self) -> Vec<u64> {
        self.events.iter().map(|e| e.seq).collect()
    }

    /// Events only if nothing was lost before them
    pub fn into_contiguous(self) -> Result<Vec<Event>> {
        match self.gap {
            Some(gap) => Err(Error::BufferGap {
                requested: gap.requested,
                first_available: gap.first_available,
            }),
            None => Ok(self.events),
        }
    }
}
