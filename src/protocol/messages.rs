//! Typed message encodings
//!
//! Sequence numbers travel as 8-byte big-endian integers. Negative values are
//! reserved for replay stream markers.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::Multipart;
use crate::error::{Error, Result};
use crate::types::{CorrelationId, Identity};

// ─────────────────────────────────────────────────────────────────
// Constants
// ─────────────────────────────────────────────────────────────────

/// End of a replay stream
pub const END_SEQ: i64 = -1;

/// Replay start preceded the retained window
pub const GAP_SEQ: i64 = -2;

/// Replay query could not be parsed
pub const REJECTED_SEQ: i64 = -3;

/// Type tag of dispatched work
pub const TAG_ADD: &[u8] = b"ADD";

/// Type tag of worker results
pub const TAG_OUTPUT: &[u8] = b"OUTPUT";

/// Control frame asking a worker to exit
pub const TAG_STOP: &[u8] = b"STOP";

/// Acknowledges a live subscription
pub const TAG_SUBSCRIBED: &[u8] = b"SUBSCRIBED";

pub fn encode_seq(seq: i64) -> Bytes {
    Bytes::copy_from_slice(&seq.to_be_bytes())
}

pub fn decode_seq(frame: &[u8]) -> Result<i64> {
    let raw: [u8; 8] = frame
        .try_into()
        .map_err(|_| Error::malformed(format!("sequence frame is {} bytes, expected 8", frame.len())))?;
    Ok(i64::from_be_bytes(raw))
}

fn to_wire_seq(seq: u64) -> Result<i64> {
    i64::try_from(seq).map_err(|_| Error::malformed(format!("sequence {} out of range", seq)))
}

// ─────────────────────────────────────────────────────────────────
// Broadcast
// ─────────────────────────────────────────────────────────────────

/// Live event as published: `[topic, seq, payload]`
#[derive(Debug, Clone, PartialEq)]
pub struct BroadcastFrame {
    pub topic: Bytes,
    pub seq: u64,
    pub payload: Bytes,
}

impl BroadcastFrame {
    pub fn to_frames(&self) -> Result<Multipart> {
        Ok(vec![
            self.topic.clone(),
            encode_seq(to_wire_seq(self.seq)?),
            self.payload.clone(),
        ])
    }

    pub fn from_frames(frames: &[Bytes]) -> Result<Self> {
        let [topic, seq, payload] = frames else {
            return Err(Error::malformed(format!(
                "broadcast frame has {} parts, expected 3",
                frames.len()
            )));
        };
        let seq = decode_seq(seq)?;
        let seq = u64::try_from(seq)
            .map_err(|_| Error::malformed(format!("negative broadcast seq {}", seq)))?;
        Ok(Self {
            topic: topic.clone(),
            seq,
            payload: payload.clone(),
        })
    }
}

// ─────────────────────────────────────────────────────────────────
// Replay
// ─────────────────────────────────────────────────────────────────

/// Catch-up query: a single 8-byte big-endian start seq
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayQuery {
    pub start: u64,
}

impl ReplayQuery {
    pub fn to_frames(&self) -> Multipart {
        vec![Bytes::copy_from_slice(&self.start.to_be_bytes())]
    }

    pub fn parse(frames: &[Bytes]) -> Result<Self> {
        match frames {
            [start] if start.len() == 8 => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(start);
                Ok(Self {
                    start: u64::from_be_bytes(raw),
                })
            }
            [other] => Err(Error::malformed(format!(
                "replay query is {} bytes, expected 8",
                other.len()
            ))),
            _ => Err(Error::malformed(format!(
                "replay query has {} frames, expected 1",
                frames.len()
            ))),
        }
    }
}

/// One message of a replay response stream
#[derive(Debug, Clone, PartialEq)]
pub enum ReplayFrame {
    /// A retained event
    Event { seq: u64, payload: Bytes },
    /// History before `first_available` is gone
    Gap { first_available: u64 },
    /// Stream terminator
    End,
    /// Query refused; no terminator follows
    Rejected { reason: String },
}

impl ReplayFrame {
    pub fn to_frames(&self) -> Result<Multipart> {
        Ok(match self {
            ReplayFrame::Event { seq, payload } => {
                vec![encode_seq(to_wire_seq(*seq)?), payload.clone()]
            }
            ReplayFrame::Gap { first_available } => vec![
                encode_seq(GAP_SEQ),
                Bytes::copy_from_slice(&first_available.to_be_bytes()),
            ],
            ReplayFrame::End => vec![encode_seq(END_SEQ), Bytes::new()],
            ReplayFrame::Rejected { reason } => {
                vec![encode_seq(REJECTED_SEQ), Bytes::from(reason.clone())]
            }
        })
    }

    pub fn from_frames(frames: &[Bytes]) -> Result<Self> {
        let [seq, payload] = frames else {
            return Err(Error::malformed(format!(
                "replay frame has {} parts, expected 2",
                frames.len()
            )));
        };

        match decode_seq(seq)? {
            END_SEQ => Ok(ReplayFrame::End),
            GAP_SEQ => {
                let first = decode_seq(payload)?;
                Ok(ReplayFrame::Gap {
                    first_available: first as u64,
                })
            }
            REJECTED_SEQ => Ok(ReplayFrame::Rejected {
                reason: String::from_utf8_lossy(payload).into_owned(),
            }),
            seq if seq >= 0 => Ok(ReplayFrame::Event {
                seq: seq as u64,
                payload: payload.clone(),
            }),
            other => Err(Error::malformed(format!("unknown replay marker {}", other))),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Dispatch
// ─────────────────────────────────────────────────────────────────

/// Work routed to a worker: `[typeTag, payload, auxiliary?]`
///
/// The router prepends the target identity when it sends.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestEnvelope {
    pub correlation_id: CorrelationId,
    pub type_tag: Bytes,
    pub body: serde_json::Value,
    /// Carried through untouched
    pub auxiliary: Option<Bytes>,
}

/// JSON map in the payload frame of a request
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RequestPayload {
    request_id: CorrelationId,
    #[serde(default)]
    body: serde_json::Value,
}

impl RequestEnvelope {
    /// `ADD` request with a JSON body
    pub fn new(correlation_id: impl Into<CorrelationId>, body: serde_json::Value) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            type_tag: Bytes::from_static(TAG_ADD),
            body,
            auxiliary: None,
        }
    }

    pub fn with_auxiliary(mut self, auxiliary: impl Into<Bytes>) -> Self {
        self.auxiliary = Some(auxiliary.into());
        self
    }

    pub fn to_frames(&self) -> Result<Multipart> {
        let payload = serde_json::to_vec(&RequestPayload {
            request_id: self.correlation_id.clone(),
            body: self.body.clone(),
        })?;
        let mut frames = vec![self.type_tag.clone(), Bytes::from(payload)];
        if let Some(aux) = &self.auxiliary {
            frames.push(aux.clone());
        }
        Ok(frames)
    }

    pub fn from_frames(frames: &[Bytes]) -> Result<Self> {
        let (type_tag, payload, auxiliary) = match frames {
            [tag, payload] => (tag, payload, None),
            [tag, payload, aux] => (tag, payload, Some(aux.clone())),
            _ => {
                return Err(Error::malformed(format!(
                    "request has {} frames, expected 2 or 3",
                    frames.len()
                )))
            }
        };
        let payload: RequestPayload = serde_json::from_slice(payload)?;
        Ok(Self {
            correlation_id: payload.request_id,
            type_tag: type_tag.clone(),
            body: payload.body,
            auxiliary,
        })
    }
}

/// Anything a worker can receive from the router
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerInbound {
    Request(RequestEnvelope),
    Control(ControlMessage),
}

impl WorkerInbound {
    pub fn parse(frames: &[Bytes]) -> Result<Self> {
        if let Some(control) = ControlMessage::parse(frames) {
            return Ok(WorkerInbound::Control(control));
        }
        Ok(WorkerInbound::Request(RequestEnvelope::from_frames(frames)?))
    }
}

/// Single-frame control messages broadcast to workers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
    Stop,
}

impl ControlMessage {
    pub fn to_frames(&self) -> Multipart {
        match self {
            ControlMessage::Stop => vec![Bytes::from_static(TAG_STOP)],
        }
    }

    pub fn parse(frames: &[Bytes]) -> Option<Self> {
        match frames {
            [tag] if tag.as_ref() == TAG_STOP => Some(ControlMessage::Stop),
            _ => None,
        }
    }
}

/// Registration announcement: an empty body
pub fn registration_frames() -> Multipart {
    vec![Bytes::new()]
}

pub fn is_registration(frames: &[Bytes]) -> bool {
    match frames {
        [] => true,
        [only] => only.is_empty(),
        _ => false,
    }
}

// ─────────────────────────────────────────────────────────────────
// Results
// ─────────────────────────────────────────────────────────────────

/// Completion pushed by a worker: `[OUTPUT, json]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    #[serde(rename = "request_id")]
    pub correlation_id: CorrelationId,

    /// Hex identity of the worker that ran the request
    #[serde(rename = "worker")]
    pub worker_identity: String,

    #[serde(default)]
    pub result: serde_json::Value,

    /// Handler failure, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Worker-side completion time, seconds since the Unix epoch
    pub ts: f64,
}

impl ResponseEnvelope {
    pub fn success(correlation_id: CorrelationId, worker: &Identity, result: serde_json::Value) -> Self {
        Self {
            correlation_id,
            worker_identity: worker.to_hex(),
            result,
            error: None,
            ts: now_ts(),
        }
    }

    pub fn failure(correlation_id: CorrelationId, worker: &Identity, error: impl Into<String>) -> Self {
        Self {
            correlation_id,
            worker_identity: worker.to_hex(),
            result: serde_json::Value::Null,
            error: Some(error.into()),
            ts: now_ts(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Turn a reported failure into an error
    pub fn into_result(self) -> Result<serde_json::Value> {
        match self.error {
            None => Ok(self.result),
            Some(message) => Err(Error::WorkFailed {
                correlation_id: self.correlation_id.to_string(),
                worker: self.worker_identity,
                message,
            }),
        }
    }

    pub fn to_frames(&self) -> Result<Multipart> {
        Ok(vec![
            Bytes::from_static(TAG_OUTPUT),
            Bytes::from(serde_json::to_vec(self)?),
        ])
    }

    pub fn from_frames(frames: &[Bytes]) -> Result<Self> {
        match frames {
            [tag, payload] if tag.as_ref() == TAG_OUTPUT => Ok(serde_json::from_slice(payload)?),
            [tag, _] => Err(Error::malformed(format!(
                "unexpected result tag {}",
                String::from_utf8_lossy(tag)
            ))),
            _ => Err(Error::malformed(format!(
                "result has {} frames, expected 2",
                frames.len()
            ))),
        }
    }
}

fn now_ts() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_end_sentinel_is_signed_minus_one() {
        let frames = ReplayFrame::End.to_frames().unwrap();
        assert_eq!(frames[0].as_ref(), &[0xff; 8]);
        assert!(frames[1].is_empty());
        assert_eq!(ReplayFrame::from_frames(&frames).unwrap(), ReplayFrame::End);
    }

    #[test]
    fn test_broadcast_frame_layout() {
        let frame = BroadcastFrame {
            topic: Bytes::from_static(b"kv"),
            seq: 258,
            payload: Bytes::from_static(b"{}"),
        };
        let frames = frame.to_frames().unwrap();
        assert_eq!(frames[0].as_ref(), b"kv");
        assert_eq!(frames[1].as_ref(), &[0, 0, 0, 0, 0, 0, 1, 2]);
        assert_eq!(BroadcastFrame::from_frames(&frames).unwrap(), frame);
    }

    #[test]
    fn test_replay_query_parse() {
        let query = ReplayQuery { start: 47 };
        assert_eq!(ReplayQuery::parse(&query.to_frames()).unwrap(), query);

        assert!(ReplayQuery::parse(&[Bytes::from_static(b"short")]).is_err());
        assert!(ReplayQuery::parse(&[]).is_err());
        assert!(ReplayQuery::parse(&[Bytes::from(vec![0u8; 8]), Bytes::new()]).is_err());
    }

    #[test]
    fn test_gap_and_rejected_frames() {
        let gap = ReplayFrame::Gap { first_available: 950 };
        assert_eq!(ReplayFrame::from_frames(&gap.to_frames().unwrap()).unwrap(), gap);

        let rejected = ReplayFrame::Rejected { reason: "bad".into() };
        assert_eq!(
            ReplayFrame::from_frames(&rejected.to_frames().unwrap()).unwrap(),
            rejected
        );

        let unknown = vec![encode_seq(-9), Bytes::new()];
        assert!(ReplayFrame::from_frames(&unknown).is_err());
    }

    #[test]
    fn test_request_carries_auxiliary_untouched() {
        let aux = Bytes::from(vec![7u8; 256 * 1024]);
        let request = RequestEnvelope::new("r1", json!({"i": 1})).with_auxiliary(aux.clone());

        let frames = request.to_frames().unwrap();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].as_ref(), TAG_ADD);

        let payload: serde_json::Value = serde_json::from_slice(&frames[1]).unwrap();
        assert_eq!(payload["request_id"], "r1");

        let parsed = RequestEnvelope::from_frames(&frames).unwrap();
        assert_eq!(parsed.auxiliary, Some(aux));
        assert_eq!(parsed, request);
    }

    #[test]
    fn test_worker_inbound_classification() {
        let stop = ControlMessage::Stop.to_frames();
        assert_eq!(
            WorkerInbound::parse(&stop).unwrap(),
            WorkerInbound::Control(ControlMessage::Stop)
        );

        let request = RequestEnvelope::new("r2", json!(null)).to_frames().unwrap();
        assert!(matches!(
            WorkerInbound::parse(&request).unwrap(),
            WorkerInbound::Request(r) if r.correlation_id.as_str() == "r2"
        ));
    }

    #[test]
    fn test_registration_is_empty_body() {
        assert!(is_registration(&registration_frames()));
        assert!(is_registration(&[]));
        assert!(!is_registration(&[Bytes::from_static(b"x")]));
        assert!(!is_registration(&[Bytes::new(), Bytes::new()]));
    }

    #[test]
    fn test_response_envelope_wire_names() {
        let worker = Identity::from_index(1);
        let response = ResponseEnvelope::success("r3".into(), &worker, json!({"sum": 3}));
        let frames = response.to_frames().unwrap();

        let payload: serde_json::Value = serde_json::from_slice(&frames[1]).unwrap();
        assert_eq!(payload["request_id"], "r3");
        assert_eq!(payload["worker"], "0100");
        assert!(payload.get("error").is_none());

        assert_eq!(ResponseEnvelope::from_frames(&frames).unwrap(), response);
    }

    #[test]
    fn test_failed_response_into_error() {
        let worker = Identity::from_index(0);
        let response = ResponseEnvelope::failure("r4".into(), &worker, "boom");
        assert!(!response.is_success());
        assert!(matches!(response.into_result(), Err(Error::WorkFailed { .. })));
    }
}
