//! Request frontend
//!
//! Couples a dispatch router with a result aggregator: every request is
//! tracked by correlation id first, then dispatched, and the caller gets a
//! handle that resolves once the worker's result arrives.
//! [`FrontendHandler`] exposes the same flow to request channels.

use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::aggregate::{AggregatorConfig, AggregatorHandle, BatchSummary, PendingResponse, ResultAggregator};
use crate::channel::RequestHandler;
use crate::dispatch::{DispatchHandle, DispatchRouter, DispatchRouterConfig};
use crate::error::Result;
use crate::protocol::{Multipart, RequestEnvelope, ResponseEnvelope};

/// Responses of a completed batch
#[derive(Debug, Clone)]
pub struct BatchOutcome {
    pub summary: BatchSummary,
    /// In submission order
    pub responses: Vec<ResponseEnvelope>,
}

#[derive(Clone)]
pub struct Frontend {
    router: DispatchHandle,
    aggregator: AggregatorHandle,
}

impl Frontend {
    pub fn new(router: DispatchHandle, aggregator: AggregatorHandle) -> Self {
        Self { router, aggregator }
    }

    /// Start a router and an aggregator and couple them
    pub async fn start(
        router_config: DispatchRouterConfig,
        aggregator_config: AggregatorConfig,
    ) -> Result<(Self, Vec<JoinHandle<()>>)> {
        let (router, router_task) = DispatchRouter::start(router_config).await?;
        let (aggregator, aggregator_task) = ResultAggregator::start(aggregator_config).await?;
        info!(
            router = %router.local_addr(),
            results = %aggregator.local_addr(),
            "Frontend ready"
        );
        Ok((Self::new(router, aggregator), vec![router_task, aggregator_task]))
    }

    pub fn router(&self) -> &DispatchHandle {
        &self.router
    }

    pub fn aggregator(&self) -> &AggregatorHandle {
        &self.aggregator
    }

    /// Track and dispatch one request
    ///
    /// A dispatch failure is delivered through the returned handle, so
    /// callers have a single place to observe the outcome.
    pub async fn submit(&self, request: RequestEnvelope) -> Result<PendingResponse> {
        let correlation_id = request.correlation_id.clone();
        let pending = self.aggregator.track(correlation_id.clone(), None).await?;

        match self.router.dispatch(&request).await {
            Ok(receipt) => {
                debug!(
                    request_id = %correlation_id,
                    worker = %receipt.worker,
                    dispatch_index = receipt.dispatch_index,
                    "Request submitted"
                );
            }
            Err(e) => {
                self.aggregator.fail(correlation_id, e).await?;
            }
        }
        Ok(pending)
    }

    /// Submit one request and wait for its response
    pub async fn call(&self, request: RequestEnvelope) -> Result<ResponseEnvelope> {
        self.submit(request).await?.wait().await
    }

    /// Submit every request and wait until all of them are resolved
    ///
    /// A request that failed (dispatch error or pending timeout) still
    /// settles the batch; its error is returned once every request has
    /// settled. Fails with `BatchTimeout` if `timeout` passes first.
    pub async fn submit_all(&self, requests: Vec<RequestEnvelope>, timeout: Duration) -> Result<BatchOutcome> {
        let batch = self.aggregator.expect(requests.len(), timeout).await?;

        let mut pending = Vec::with_capacity(requests.len());
        for request in requests {
            pending.push(self.submit(request).await?);
        }

        let summary = batch.wait().await?;
        let mut responses = Vec::with_capacity(pending.len());
        for handle in pending {
            responses.push(handle.wait().await?);
        }

        info!(
            requests = responses.len(),
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "Batch resolved"
        );
        Ok(BatchOutcome { summary, responses })
    }

    /// Stop both tasks, sending `STOP` to workers if asked
    pub async fn shutdown(&self, stop_workers: bool) -> Result<usize> {
        let stopped = self.router.shutdown(stop_workers).await?;
        self.aggregator.shutdown().await?;
        Ok(stopped)
    }
}

/// Answers request channels by running each request through a [`Frontend`]
///
/// Request frames are a `RequestEnvelope`, the reply is the worker's
/// `ResponseEnvelope`.
pub struct FrontendHandler {
    frontend: Frontend,
}

impl FrontendHandler {
    pub fn new(frontend: Frontend) -> Self {
        Self { frontend }
    }
}

#[async_trait]
impl RequestHandler for FrontendHandler {
    async fn handle(&self, request: Multipart) -> Result<Multipart> {
        let request = RequestEnvelope::from_frames(&request)?;
        debug!(request_id = %request.correlation_id, "Forwarding channel request");
        let response = self.frontend.call(request).await?;
        response.to_frames()
    }
}
