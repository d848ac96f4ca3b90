//! Worker runtime
//!
//! The engine side of dispatch: connects to the router with a fixed
//! identity, announces itself, runs each request through a [`WorkHandler`]
//! and pushes the outcome to the aggregator. Exits on `STOP`, when the
//! router goes away, or after an idle timeout.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::{parse_addr, SwitchyardConfig};
use crate::error::{Error, Result};
use crate::protocol::{
    registration_frames, ControlMessage, RequestEnvelope, ResponseEnvelope, WorkerInbound,
};
use crate::transport::{DealerSocket, PushSocket};
use crate::types::WorkerIdentity;

// ─────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────

/// Worker runtime configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Dispatch router to register with
    pub router_addr: SocketAddr,

    /// Aggregator results are pushed to
    pub results_addr: SocketAddr,

    pub identity: WorkerIdentity,

    /// Exit after this long without a message
    pub idle_timeout: Duration,
}

impl WorkerConfig {
    pub fn new(router_addr: SocketAddr, results_addr: SocketAddr, index: u16) -> Self {
        Self {
            router_addr,
            results_addr,
            identity: WorkerIdentity::from_index(index),
            idle_timeout: Duration::from_secs(10),
        }
    }

    pub fn from_config(config: &SwitchyardConfig) -> Result<Self> {
        Ok(Self {
            router_addr: parse_addr("router.bind_addr", &config.router.bind_addr)?,
            results_addr: parse_addr("aggregator.bind_addr", &config.aggregator.bind_addr)?,
            identity: WorkerIdentity::from_index(config.worker.index),
            idle_timeout: Duration::from_millis(config.worker.idle_timeout_ms),
        })
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }
}

// ─────────────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────────────

/// Executes one dispatched request
#[async_trait]
pub trait WorkHandler: Send + Sync + 'static {
    async fn handle(&self, request: &RequestEnvelope) -> Result<serde_json::Value>;
}

/// Echoes the request body and reports the auxiliary buffer size
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoHandler;

#[async_trait]
impl WorkHandler for EchoHandler {
    async fn handle(&self, request: &RequestEnvelope) -> Result<serde_json::Value> {
        Ok(json!({
            "echo": request.body,
            "aux_len": request.auxiliary.as_ref().map_or(0, |aux| aux.len()),
        }))
    }
}

// ─────────────────────────────────────────────────────────────────
// Runtime
// ─────────────────────────────────────────────────────────────────

/// Why a worker stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    Stopped,
    IdleTimeout,
    RouterClosed,
}

/// What a worker did before it stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerReport {
    pub identity: WorkerIdentity,
    pub exit: WorkerExit,
    pub handled: u64,
    pub failed: u64,
    pub malformed: u64,
}

pub struct Worker {
    config: WorkerConfig,
    handler: Arc<dyn WorkHandler>,
}

impl Worker {
    pub fn new(config: WorkerConfig, handler: Arc<dyn WorkHandler>) -> Self {
        Self { config, handler }
    }

    pub fn echo(config: WorkerConfig) -> Self {
        Self::new(config, Arc::new(EchoHandler))
    }

    pub fn identity(&self) -> &WorkerIdentity {
        &self.config.identity
    }

    pub fn spawn(self) -> JoinHandle<Result<WorkerReport>> {
        let span = info_span!("worker", id = %self.config.identity);
        tokio::spawn(self.run().instrument(span))
    }

    /// Register, then serve requests until told to stop
    pub async fn run(self) -> Result<WorkerReport> {
        let identity = self.config.identity.clone();
        let mut dealer = DealerSocket::connect(self.config.router_addr, Some(identity.clone())).await?;
        let mut results = PushSocket::connect(self.config.results_addr).await?;

        dealer.send(&registration_frames()).await?;
        info!(worker = %identity, router = %self.config.router_addr, "Worker registered");

        let mut report = WorkerReport {
            identity: identity.clone(),
            exit: WorkerExit::Stopped,
            handled: 0,
            failed: 0,
            malformed: 0,
        };

        loop {
            // The dealer is abandoned on timeout, never read again
            let frames = match tokio::time::timeout(self.config.idle_timeout, dealer.recv()).await {
                Ok(Ok(frames)) => frames,
                Ok(Err(Error::ConnectionLost { .. })) => {
                    info!(worker = %identity, "Router closed the connection, exiting");
                    report.exit = WorkerExit::RouterClosed;
                    break;
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    info!(
                        worker = %identity,
                        idle_ms = self.config.idle_timeout.as_millis() as u64,
                        "No request within idle timeout, exiting"
                    );
                    report.exit = WorkerExit::IdleTimeout;
                    break;
                }
            };

            let request = match WorkerInbound::parse(&frames) {
                Ok(WorkerInbound::Control(ControlMessage::Stop)) => {
                    info!(worker = %identity, "Got STOP, exiting");
                    report.exit = WorkerExit::Stopped;
                    break;
                }
                Ok(WorkerInbound::Request(request)) => request,
                Err(e) => {
                    report.malformed += 1;
                    warn!(worker = %identity, error = %e, "Dropping malformed request");
                    continue;
                }
            };

            debug!(worker = %identity, request_id = %request.correlation_id, "Handling request");
            let response = match self.handler.handle(&request).await {
                Ok(result) => {
                    report.handled += 1;
                    ResponseEnvelope::success(request.correlation_id, &identity, result)
                }
                Err(e) => {
                    report.failed += 1;
                    warn!(
                        worker = %identity,
                        request_id = %request.correlation_id,
                        error = %e,
                        "Handler failed"
                    );
                    ResponseEnvelope::failure(request.correlation_id, &identity, e.to_string())
                }
            };
            results.send(&response.to_frames()?).await?;
        }

        info!(
            worker = %identity,
            handled = report.handled,
            failed = report.failed,
            exit = ?report.exit,
            "Worker stopped"
        );
        Ok(report)
    }
}
