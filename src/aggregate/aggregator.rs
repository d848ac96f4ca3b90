//! Result aggregator task
//!
//! Collects completion envelopes pushed by workers, matches each to the
//! pending request with the same correlation id, and tracks bulk waits that
//! complete once a given number of distinct requests have been resolved.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, info_span, trace, warn, Instrument};

use super::{PendingRequest, PendingTable};
use crate::config::{parse_addr, AggregatorSettings};
use crate::error::{Error, Result};
use crate::protocol::{Multipart, ResponseEnvelope};
use crate::transport::PullSocket;
use crate::types::{CorrelationId, WorkerIdentity};

// ─────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────

/// Result aggregator configuration
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// Address workers push results to
    pub bind_addr: SocketAddr,

    /// How long a tracked request may stay unresolved
    pub pending_timeout: Duration,

    /// Pending commands before callers wait
    pub command_queue: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 5561)),
            pending_timeout: Duration::from_secs(10),
            command_queue: 256,
        }
    }
}

impl AggregatorConfig {
    pub fn from_settings(settings: &AggregatorSettings) -> Result<Self> {
        Ok(Self {
            bind_addr: parse_addr("aggregator.bind_addr", &settings.bind_addr)?,
            pending_timeout: Duration::from_millis(settings.pending_timeout_ms),
            ..Self::default()
        })
    }
}

// ─────────────────────────────────────────────────────────────────
// Results
// ─────────────────────────────────────────────────────────────────

/// Outcome of a completed bulk wait
#[derive(Debug, Clone, PartialEq)]
pub struct BatchSummary {
    /// Correlation ids in the order they were resolved, failures included
    pub resolved: Vec<CorrelationId>,
    /// Ids among `resolved` whose caller got an error instead of a response
    pub failed: Vec<CorrelationId>,
    pub elapsed: Duration,
}

/// Aggregator counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregatorStats {
    pub pending: usize,
    pub resolved: u64,
    pub unknown: u64,
    pub malformed: u64,
    pub expired: u64,
    pub batches_completed: u64,
    pub batches_failed: u64,
}

/// Caller side of a tracked request
#[derive(Debug)]
pub struct PendingResponse {
    correlation_id: CorrelationId,
    rx: oneshot::Receiver<Result<ResponseEnvelope>>,
}

impl PendingResponse {
    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    /// Wait for the matching response, a failure, or the pending timeout
    pub async fn wait(self) -> Result<ResponseEnvelope> {
        self.rx
            .await
            .map_err(|_| Error::channel_closed("result aggregator"))?
    }
}

/// Caller side of a bulk wait
#[derive(Debug)]
pub struct PendingBatch {
    expected: usize,
    rx: oneshot::Receiver<Result<BatchSummary>>,
}

impl PendingBatch {
    pub fn expected(&self) -> usize {
        self.expected
    }

    pub async fn wait(self) -> Result<BatchSummary> {
        self.rx
            .await
            .map_err(|_| Error::channel_closed("result aggregator"))?
    }
}

struct BatchWaiter {
    expected: usize,
    seen: HashSet<CorrelationId>,
    resolved: Vec<CorrelationId>,
    failed: Vec<CorrelationId>,
    started: Instant,
    deadline: Instant,
    reply: oneshot::Sender<Result<BatchSummary>>,
}

impl BatchWaiter {
    fn record(&mut self, correlation_id: &CorrelationId, failed: bool) {
        if self.seen.insert(correlation_id.clone()) {
            self.resolved.push(correlation_id.clone());
            if failed {
                self.failed.push(correlation_id.clone());
            }
        }
    }

    fn is_complete(&self) -> bool {
        self.resolved.len() >= self.expected
    }

    fn finish(self) -> bool {
        let elapsed = self.started.elapsed();
        let complete = self.is_complete();
        let outcome = if complete {
            info!(
                resolved = self.resolved.len(),
                failed = self.failed.len(),
                elapsed_ms = elapsed.as_millis() as u64,
                "Batch complete"
            );
            Ok(BatchSummary {
                resolved: self.resolved,
                failed: self.failed,
                elapsed,
            })
        } else {
            warn!(
                expected = self.expected,
                resolved = self.resolved.len(),
                "Batch deadline passed"
            );
            Err(Error::BatchTimeout {
                expected: self.expected,
                resolved: self.resolved.len(),
            })
        };
        let _ = self.reply.send(outcome);
        complete
    }
}

// ─────────────────────────────────────────────────────────────────
// Commands
// ─────────────────────────────────────────────────────────────────

enum AggregatorCommand {
    Track {
        correlation_id: CorrelationId,
        target: Option<WorkerIdentity>,
        reply: oneshot::Sender<Result<ResponseEnvelope>>,
        ack: oneshot::Sender<Result<()>>,
    },
    Fail {
        correlation_id: CorrelationId,
        error: Error,
        ack: oneshot::Sender<bool>,
    },
    Expect {
        count: usize,
        timeout: Duration,
        reply: oneshot::Sender<Result<BatchSummary>>,
        ack: oneshot::Sender<()>,
    },
    Stats(oneshot::Sender<AggregatorStats>),
    Shutdown,
}

// ─────────────────────────────────────────────────────────────────
// Handle
// ─────────────────────────────────────────────────────────────────

/// Cloneable handle to a running result aggregator
#[derive(Clone)]
pub struct AggregatorHandle {
    command_tx: mpsc::Sender<AggregatorCommand>,
    local_addr: SocketAddr,
}

impl AggregatorHandle {
    /// Start waiting for the response to `correlation_id`
    ///
    /// Must be called before the request is dispatched so a fast response
    /// cannot arrive ahead of its record. Fails with `DuplicateCorrelation`
    /// if the id is already pending.
    pub async fn track(
        &self,
        correlation_id: CorrelationId,
        target: Option<WorkerIdentity>,
    ) -> Result<PendingResponse> {
        let (reply, rx) = oneshot::channel();
        let (ack, ack_rx) = oneshot::channel();
        self.send_command(AggregatorCommand::Track {
            correlation_id: correlation_id.clone(),
            target,
            reply,
            ack,
        })
        .await?;
        ack_rx
            .await
            .map_err(|_| Error::channel_closed("result aggregator"))??;
        Ok(PendingResponse { correlation_id, rx })
    }

    /// Resolve a pending request with an error; returns whether it was pending
    pub async fn fail(&self, correlation_id: CorrelationId, error: Error) -> Result<bool> {
        let (ack, rx) = oneshot::channel();
        self.send_command(AggregatorCommand::Fail {
            correlation_id,
            error,
            ack,
        })
        .await?;
        rx.await.map_err(|_| Error::channel_closed("result aggregator"))
    }

    /// Register a bulk wait for `count` distinct resolutions within `timeout`
    ///
    /// Only resolutions after this call count toward the batch.
    pub async fn expect(&self, count: usize, timeout: Duration) -> Result<PendingBatch> {
        let (reply, rx) = oneshot::channel();
        let (ack, ack_rx) = oneshot::channel();
        self.send_command(AggregatorCommand::Expect {
            count,
            timeout,
            reply,
            ack,
        })
        .await?;
        ack_rx
            .await
            .map_err(|_| Error::channel_closed("result aggregator"))?;
        Ok(PendingBatch {
            expected: count,
            rx,
        })
    }

    pub async fn stats(&self) -> Result<AggregatorStats> {
        let (reply, rx) = oneshot::channel();
        self.send_command(AggregatorCommand::Stats(reply)).await?;
        rx.await.map_err(|_| Error::channel_closed("result aggregator"))
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.send_command(AggregatorCommand::Shutdown).await
    }

    /// Address workers push results to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn send_command(&self, command: AggregatorCommand) -> Result<()> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| Error::channel_closed("result aggregator"))
    }
}

// ─────────────────────────────────────────────────────────────────
// Aggregator Task
// ─────────────────────────────────────────────────────────────────

/// Correlates worker results with their callers
pub struct ResultAggregator {
    socket: PullSocket,
    pending: PendingTable,
    batches: Vec<BatchWaiter>,
    pending_timeout: Duration,
    stats: AggregatorStats,
}

impl ResultAggregator {
    /// Bind the collection socket and start the aggregator task
    pub async fn start(config: AggregatorConfig) -> Result<(AggregatorHandle, JoinHandle<()>)> {
        let socket = PullSocket::bind(config.bind_addr).await?;
        let local_addr = socket.local_addr();
        let (command_tx, command_rx) = mpsc::channel(config.command_queue);

        info!(
            addr = %local_addr,
            pending_timeout_ms = config.pending_timeout.as_millis() as u64,
            "Result aggregator started"
        );

        let aggregator = Self {
            socket,
            pending: PendingTable::new(),
            batches: Vec::new(),
            pending_timeout: config.pending_timeout,
            stats: AggregatorStats::default(),
        };
        let task = tokio::spawn(aggregator.run(command_rx).instrument(info_span!("aggregator", addr = %local_addr)));

        Ok((
            AggregatorHandle {
                command_tx,
                local_addr,
            },
            task,
        ))
    }

    async fn run(mut self, mut command_rx: mpsc::Receiver<AggregatorCommand>) {
        loop {
            let next_deadline = self.next_deadline();

            tokio::select! {
                command = command_rx.recv() => match command {
                    Some(AggregatorCommand::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                inbound = self.socket.recv() => match inbound {
                    Some(frames) => self.handle_result(frames),
                    None => break,
                },
                _ = sleep_until(next_deadline) => self.expire(Instant::now()),
            }
        }

        for record in self.pending.drain() {
            record.complete(Err(Error::channel_closed("result aggregator")));
        }
        for batch in self.batches.drain(..) {
            let _ = batch.reply.send(Err(Error::channel_closed("result aggregator")));
        }
        info!(
            resolved = self.stats.resolved,
            unknown = self.stats.unknown,
            "Result aggregator stopped"
        );
    }

    fn handle_command(&mut self, command: AggregatorCommand) {
        match command {
            AggregatorCommand::Track {
                correlation_id,
                target,
                reply,
                ack,
            } => {
                let now = Instant::now();
                let result = self.pending.insert(PendingRequest {
                    correlation_id,
                    target,
                    tracked_at: now,
                    deadline: now + self.pending_timeout,
                    reply,
                });
                if let Err(e) = &result {
                    warn!(error = %e, "Rejected tracking request");
                }
                let _ = ack.send(result);
            }
            AggregatorCommand::Fail {
                correlation_id,
                error,
                ack,
            } => {
                let found = match self.pending.take(&correlation_id) {
                    Some(record) => {
                        debug!(request_id = %correlation_id, error = %error, "Pending request failed");
                        record.complete(Err(error));
                        self.settle_batches(&correlation_id, true);
                        true
                    }
                    None => false,
                };
                let _ = ack.send(found);
            }
            AggregatorCommand::Expect {
                count,
                timeout,
                reply,
                ack,
            } => {
                let now = Instant::now();
                let batch = BatchWaiter {
                    expected: count,
                    seen: HashSet::new(),
                    resolved: Vec::new(),
                    failed: Vec::new(),
                    started: now,
                    deadline: now + timeout,
                    reply,
                };
                if batch.is_complete() {
                    self.record_batch(batch.finish());
                } else {
                    debug!(expected = count, timeout_ms = timeout.as_millis() as u64, "Batch registered");
                    self.batches.push(batch);
                }
                let _ = ack.send(());
            }
            AggregatorCommand::Stats(reply) => {
                let _ = reply.send(AggregatorStats {
                    pending: self.pending.len(),
                    ..self.stats.clone()
                });
            }
            // Handled in the loop
            AggregatorCommand::Shutdown => {}
        }
    }

    fn handle_result(&mut self, frames: Multipart) {
        let response = match ResponseEnvelope::from_frames(&frames) {
            Ok(response) => response,
            Err(e) => {
                self.stats.malformed += 1;
                warn!(error = %e, "Dropping malformed result");
                return;
            }
        };

        let correlation_id = response.correlation_id.clone();
        let Some(record) = self.pending.take(&correlation_id) else {
            self.stats.unknown += 1;
            let e = Error::UnknownCorrelation {
                correlation_id: correlation_id.to_string(),
            };
            warn!(worker = %response.worker_identity, error = %e, "Dropping result");
            return;
        };

        trace!(
            request_id = %correlation_id,
            worker = %response.worker_identity,
            latency_ms = record.tracked_at.elapsed().as_millis() as u64,
            "Result matched"
        );
        if let Some(target) = &record.target {
            if target.to_hex() != response.worker_identity {
                debug!(
                    request_id = %correlation_id,
                    expected = %target,
                    actual = %response.worker_identity,
                    "Result came from a different worker than dispatched to"
                );
            }
        }
        self.stats.resolved += 1;
        record.complete(Ok(response));
        self.settle_batches(&correlation_id, false);
    }

    fn expire(&mut self, now: Instant) {
        for record in self.pending.take_expired(now) {
            self.stats.expired += 1;
            let timeout_ms = now.duration_since(record.tracked_at).as_millis() as u64;
            warn!(request_id = %record.correlation_id, timeout_ms, "Pending request expired");
            let correlation_id = record.correlation_id.clone();
            record.complete(Err(Error::Timeout { timeout_ms }));
            self.settle_batches(&correlation_id, true);
        }
        self.finish_batches(|batch| batch.deadline <= now);
    }

    /// Count one settled request toward every open batch
    ///
    /// Called once per pending record, whichever way it was settled.
    fn settle_batches(&mut self, correlation_id: &CorrelationId, failed: bool) {
        if self.batches.is_empty() {
            return;
        }
        for batch in &mut self.batches {
            batch.record(correlation_id, failed);
        }
        self.finish_batches(|batch| batch.is_complete());
    }

    /// Resolve and remove every batch matching `done`
    fn finish_batches(&mut self, done: impl Fn(&BatchWaiter) -> bool) {
        let (finished, open): (Vec<_>, Vec<_>) = std::mem::take(&mut self.batches)
            .into_iter()
            .partition(|batch| done(batch));
        self.batches = open;
        for batch in finished {
            let completed = batch.finish();
            self.record_batch(completed);
        }
    }

    fn record_batch(&mut self, completed: bool) {
        if completed {
            self.stats.batches_completed += 1;
        } else {
            self.stats.batches_failed += 1;
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        let batch_deadline = self.batches.iter().map(|b| b.deadline).min();
        match (self.pending.next_deadline(), batch_deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::transport::PushSocket;
    use crate::types::Identity;

    fn test_config(pending_timeout: Duration) -> AggregatorConfig {
        AggregatorConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            pending_timeout,
            ..Default::default()
        }
    }

    async fn push_result(push: &mut PushSocket, id: &str) {
        let response = ResponseEnvelope::success(CorrelationId::from(id), &Identity::from_index(0), json!(id));
        push.send(&response.to_frames().unwrap()).await.unwrap();
    }

    #[tokio::test]
    async fn test_track_resolves_on_matching_result() {
        let (aggregator, _task) = ResultAggregator::start(test_config(Duration::from_secs(5)))
            .await
            .unwrap();
        let pending = aggregator.track("r1".into(), None).await.unwrap();
        let mut push = PushSocket::connect(aggregator.local_addr()).await.unwrap();

        push_result(&mut push, "r1").await;
        let response = pending.wait().await.unwrap();
        assert_eq!(response.correlation_id.as_str(), "r1");
        assert_eq!(response.worker_identity, "0000");
    }

    #[tokio::test]
    async fn test_pending_request_expires() {
        let (aggregator, _task) = ResultAggregator::start(test_config(Duration::from_millis(50)))
            .await
            .unwrap();
        let pending = aggregator.track("slow".into(), None).await.unwrap();

        assert!(matches!(pending.wait().await, Err(Error::Timeout { .. })));
        let stats = aggregator.stats().await.unwrap();
        assert_eq!(stats.expired, 1);
        assert_eq!(stats.pending, 0);
    }

    #[tokio::test]
    async fn test_fail_resolves_caller_with_error() {
        let (aggregator, _task) = ResultAggregator::start(test_config(Duration::from_secs(5)))
            .await
            .unwrap();
        let pending = aggregator.track("r9".into(), None).await.unwrap();

        assert!(aggregator
            .fail("r9".into(), Error::RegistryEmpty { waited_ms: 1 })
            .await
            .unwrap());
        assert!(!aggregator.fail("r9".into(), Error::Internal("x".into())).await.unwrap());
        assert!(matches!(pending.wait().await, Err(Error::RegistryEmpty { .. })));
    }

    #[tokio::test]
    async fn test_zero_count_batch_completes_immediately() {
        let (aggregator, _task) = ResultAggregator::start(test_config(Duration::from_secs(5)))
            .await
            .unwrap();
        let summary = aggregator
            .expect(0, Duration::from_secs(1))
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert!(summary.resolved.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_fails_outstanding_callers() {
        let (aggregator, task) = ResultAggregator::start(test_config(Duration::from_secs(5)))
            .await
            .unwrap();
        let pending = aggregator.track("r1".into(), None).await.unwrap();
        aggregator.shutdown().await.unwrap();
        task.await.unwrap();

        assert!(matches!(pending.wait().await, Err(Error::ChannelClosed(_))));
    }
}
