//! Shared fixtures for the integration tests
//!
//! Everything binds loopback port 0 so tests can run in parallel.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use switchyard::aggregate::AggregatorConfig;
use switchyard::broadcast::{BroadcastLog, BroadcastLogConfig, LogHandle, ReplayResponder};
use switchyard::dispatch::{DispatchRouterConfig, Worker, WorkerConfig, WorkerReport};
use switchyard::frontend::Frontend;
use switchyard::Result;
use tokio::task::JoinHandle;

pub fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

/// A running broadcast log with its replay service
pub struct LogFixture {
    pub log: LogHandle,
    pub replay_addr: SocketAddr,
    pub task: JoinHandle<()>,
}

pub async fn start_log(capacity: usize, signal_gaps: bool) -> LogFixture {
    let (log, task) = BroadcastLog::start(BroadcastLogConfig {
        publish_addr: loopback(),
        capacity,
        ..Default::default()
    })
    .await
    .unwrap();
    let responder = ReplayResponder::bind(loopback(), log.clone(), signal_gaps)
        .await
        .unwrap();
    let replay_addr = responder.local_addr();
    responder.spawn();

    LogFixture {
        log,
        replay_addr,
        task,
    }
}

pub async fn start_frontend(registration_wait: Duration, pending_timeout: Duration) -> Frontend {
    let (frontend, _tasks) = Frontend::start(
        DispatchRouterConfig {
            bind_addr: loopback(),
            registration_wait,
            poll_interval: Duration::from_millis(100),
            ..Default::default()
        },
        AggregatorConfig {
            bind_addr: loopback(),
            pending_timeout,
            ..Default::default()
        },
    )
    .await
    .unwrap();
    frontend
}

/// Start echo workers one by one so registration order follows the index
pub async fn start_workers(frontend: &Frontend, count: u16) -> Vec<JoinHandle<Result<WorkerReport>>> {
    let mut handles = Vec::new();
    for index in 0..count {
        let config = WorkerConfig::new(
            frontend.router().local_addr(),
            frontend.aggregator().local_addr(),
            index,
        )
        .with_idle_timeout(Duration::from_secs(10));
        handles.push(Worker::echo(config).spawn());
        frontend
            .router()
            .wait_for_workers(index as usize + 1, Duration::from_secs(5))
            .await
            .unwrap();
    }
    handles
}
