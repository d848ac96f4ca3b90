//! Pending request table

use std::collections::HashMap;

use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::protocol::ResponseEnvelope;
use crate::types::{CorrelationId, WorkerIdentity};

/// A dispatched request waiting for its response
#[derive(Debug)]
pub struct PendingRequest {
    pub correlation_id: CorrelationId,
    /// Worker the request was sent to, when known
    pub target: Option<WorkerIdentity>,
    pub tracked_at: Instant,
    pub deadline: Instant,
    pub(crate) reply: oneshot::Sender<Result<ResponseEnvelope>>,
}

impl PendingRequest {
    /// Resolve the caller; a caller that stopped waiting is ignored
    pub(crate) fn complete(self, outcome: Result<ResponseEnvelope>) {
        let _ = self.reply.send(outcome);
    }
}

/// Correlation id to pending request, at most one record per id
#[derive(Debug, Default)]
pub struct PendingTable {
    entries: HashMap<CorrelationId, PendingRequest>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, request: PendingRequest) -> Result<()> {
        if self.entries.contains_key(&request.correlation_id) {
            return Err(Error::DuplicateCorrelation {
                correlation_id: request.correlation_id.to_string(),
            });
        }
        self.entries.insert(request.correlation_id.clone(), request);
        Ok(())
    }

    /// Remove and return the record for `id`
    pub fn take(&mut self, id: &CorrelationId) -> Option<PendingRequest> {
        self.entries.remove(id)
    }

    pub fn contains(&self, id: &CorrelationId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.values().map(|p| p.deadline).min()
    }

    /// Remove every record whose deadline is at or before `now`
    pub fn take_expired(&mut self, now: Instant) -> Vec<PendingRequest> {
        let expired: Vec<CorrelationId> = self
            .entries
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        expired.iter().filter_map(|id| self.entries.remove(id)).collect()
    }

    /// Remove every record
    pub fn drain(&mut self) -> Vec<PendingRequest> {
        self.entries.drain().map(|(_, p)| p).collect()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn pending(id: &str, deadline: Instant) -> (PendingRequest, oneshot::Receiver<Result<ResponseEnvelope>>) {
        let (reply, rx) = oneshot::channel();
        let request = PendingRequest {
            correlation_id: CorrelationId::from(id),
            target: None,
            tracked_at: Instant::now(),
            deadline,
            reply,
        };
        (request, rx)
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let mut table = PendingTable::new();
        let later = Instant::now() + Duration::from_secs(5);
        table.insert(pending("r1", later).0).unwrap();

        let err = table.insert(pending("r1", later).0).unwrap_err();
        assert!(matches!(err, Error::DuplicateCorrelation { .. }));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_take_expired_only_takes_due_records() {
        let mut table = PendingTable::new();
        let now = Instant::now();
        table.insert(pending("due", now).0).unwrap();
        table.insert(pending("later", now + Duration::from_secs(5)).0).unwrap();

        let expired = table.take_expired(now);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].correlation_id.as_str(), "due");
        assert!(table.contains(&CorrelationId::from("later")));
        assert_eq!(table.next_deadline(), Some(now + Duration::from_secs(5)));
    }

    #[tokio::test]
    async fn test_complete_resolves_caller() {
        let mut table = PendingTable::new();
        let (request, rx) = pending("r2", Instant::now() + Duration::from_secs(5));
        table.insert(request).unwrap();

        let record = table.take(&CorrelationId::from("r2")).unwrap();
        record.complete(Err(Error::channel_closed("test")));
        assert!(matches!(rx.await.unwrap(), Err(Error::ChannelClosed(_))));
        assert!(table.is_empty());
    }
}
