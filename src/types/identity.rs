//! Peer identities and correlation ids

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ─────────────────────────────────────────────────────────────────
// Identity
// ─────────────────────────────────────────────────────────────────

/// Opaque byte identity of a connected peer
///
/// Workers pick their own identity when they connect; peers that send an
/// empty identity get one assigned by the accepting socket.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identity(Bytes);

/// Identity of a registered worker
pub type WorkerIdentity = Identity;

impl Identity {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    /// Two-byte little-endian identity derived from a worker index
    pub fn from_index(index: u16) -> Self {
        Self(Bytes::copy_from_slice(&index.to_le_bytes()))
    }

    /// Identity handed out to peers that connect without one
    pub(crate) fn generated(counter: u32) -> Self {
        let mut raw = Vec::with_capacity(5);
        raw.push(0u8);
        raw.extend_from_slice(&counter.to_be_bytes());
        Self(Bytes::from(raw))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_bytes(&self) -> Bytes {
        self.0.clone()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({})", self.to_hex())
    }
}

impl From<&[u8]> for Identity {
    fn from(raw: &[u8]) -> Self {
        Self(Bytes::copy_from_slice(raw))
    }
}

impl From<Bytes> for Identity {
    fn from(raw: Bytes) -> Self {
        Self(raw)
    }
}

// ─────────────────────────────────────────────────────────────────
// Correlation id
// ─────────────────────────────────────────────────────────────────

/// Links an asynchronous worker result back to the request that caused it
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh random id
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Sequential id in the `r{n}` form
    pub fn numbered(n: usize) -> Self {
        Self(format!("r{}", n))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CorrelationId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for CorrelationId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_from_index_is_little_endian() {
        assert_eq!(Identity::from_index(0).as_bytes(), &[0, 0]);
        assert_eq!(Identity::from_index(1).as_bytes(), &[1, 0]);
        assert_eq!(Identity::from_index(258).as_bytes(), &[2, 1]);
        assert_eq!(Identity::from_index(1).to_string(), "0100");
    }

    #[test]
    fn test_generated_identity_has_zero_prefix() {
        let id = Identity::generated(7);
        assert_eq!(id.as_bytes(), &[0, 0, 0, 0, 7]);
        assert_ne!(id, Identity::generated(8));
    }

    #[test]
    fn test_correlation_ids() {
        assert_eq!(CorrelationId::numbered(3).as_str(), "r3");
        assert_ne!(CorrelationId::random(), CorrelationId::random());

        let json = serde_json::to_string(&CorrelationId::from("r9")).unwrap();
        assert_eq!(json, "\"r9\"");
    }
}
