//! In-process walkthroughs of the three messaging patterns
//!
//! Each demo binds everything on loopback ephemeral ports, so it runs next
//! to a live `serve` without clashing. Output goes to stdout for the user;
//! the components log through `tracing` as usual.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde_json::json;

use crate::aggregate::AggregatorConfig;
use crate::broadcast::{BroadcastLog, BroadcastLogConfig, EventProducer, LogSubscriber, ReplayResponder};
use crate::channel::{PongHandler, ReplyServer, ResilientChannel, RetryPolicy};
use crate::config::SwitchyardConfig;
use crate::dispatch::{DispatchRouterConfig, Worker, WorkerConfig};
use crate::frontend::Frontend;
use crate::protocol::RequestEnvelope;
use crate::types::{CorrelationId, EventPayload};

fn ephemeral() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 0))
}

/// Live events, then a catch-up replay of the last few
pub async fn run_pubsub(config: &SwitchyardConfig, live: usize) -> Result<()> {
    let settings = &config.broadcast;
    let log_config = BroadcastLogConfig {
        publish_addr: ephemeral(),
        ..BroadcastLogConfig::from_settings(settings)?
    };
    let topic = log_config.topic.clone();

    let (log, log_task) = BroadcastLog::start(log_config).await?;
    let responder = ReplayResponder::bind(ephemeral(), log.clone(), settings.signal_gaps).await?;
    let replay_addr = responder.local_addr();
    responder.spawn();

    let interval = settings.publish_interval().unwrap_or(Duration::from_millis(50));
    EventProducer::new(log.clone(), interval).spawn();

    let mut subscriber = LogSubscriber::connect(log.publish_addr(), replay_addr, topic).await?;

    let mut last_seq = 0;
    for _ in 0..live {
        let event = subscriber.recv().await.context("live stream ended")?;
        let payload = EventPayload::decode(&event.payload)?;
        println!("[sub] live: seq={} ts={:.3}", payload.seq, payload.ts);
        last_seq = event.seq;
    }

    // Pretend the last few were missed and ask for them again
    let need_from = last_seq.saturating_sub(3);
    println!("[sub] replaying from seq={}", need_from);
    let outcome = subscriber.catch_up(need_from).await?;
    if let Some(gap) = &outcome.gap {
        println!(
            "[sub] gap: {} events before seq={} are gone",
            gap.missing(),
            gap.first_available
        );
    }
    for event in &outcome.events {
        let payload = EventPayload::decode(&event.payload)?;
        println!("[sub] replay: seq={} ts={:.3}", payload.seq, payload.ts);
    }
    println!("[sub] replay complete, {} events", outcome.events.len());

    log.shutdown().await?;
    log_task.await.context("broadcast log task panicked")?;
    Ok(())
}

/// Resilient request against a server that stalls its first replies
pub async fn run_reqrep(config: &SwitchyardConfig, delay_first: usize, delay: Duration) -> Result<()> {
    let handler = Arc::new(PongHandler::with_delayed_replies(delay_first, delay));
    let server = ReplyServer::bind(ephemeral(), handler.clone()).await?;
    let policy = RetryPolicy::from_settings(&config.channel);
    println!(
        "[client] timeout={}ms retries={} backoff={}ms, server stalls first {} replies by {}ms",
        policy.timeout.as_millis(),
        policy.max_retries,
        policy.backoff.as_millis(),
        delay_first,
        delay.as_millis()
    );

    let mut channel = ResilientChannel::new(server.local_addr(), policy);
    let result = channel
        .request_with(|attempt| {
            let ts = chrono::Utc::now().timestamp_millis() as f64 / 1000.0;
            vec![format!("ping attempt={} ts={:.3}", attempt, ts).into()]
        })
        .await;

    match result {
        Ok(reply) => {
            let text = reply
                .first()
                .map(|frame| String::from_utf8_lossy(frame).into_owned())
                .unwrap_or_default();
            println!("[client] recv: {}", text);
            println!(
                "[client] attempts={} reconnects={} server saw {} requests",
                channel.attempts_made(),
                channel.reconnects(),
                handler.requests_seen()
            );
            Ok(())
        }
        Err(e) => bail!("request failed: {}", e),
    }
}

/// Round-robin dispatch to in-process workers, results through the aggregator
pub async fn run_round_robin(config: &SwitchyardConfig, workers: usize, requests: usize) -> Result<()> {
    if workers == 0 {
        bail!("at least one worker is needed");
    }
    if workers > u16::MAX as usize {
        bail!("at most {} workers are supported", u16::MAX);
    }

    let router_config = DispatchRouterConfig {
        bind_addr: ephemeral(),
        ..DispatchRouterConfig::from_settings(&config.router)?
    };
    let aggregator_config = AggregatorConfig {
        bind_addr: ephemeral(),
        ..AggregatorConfig::from_settings(&config.aggregator)?
    };
    let (frontend, tasks) = Frontend::start(router_config, aggregator_config).await?;
    let router_addr = frontend.router().local_addr();
    let results_addr = frontend.aggregator().local_addr();

    // Start workers one at a time so registration order matches their index
    let mut handles = Vec::with_capacity(workers);
    for index in 0..workers {
        let worker_config = WorkerConfig::new(router_addr, results_addr, index as u16)
            .with_idle_timeout(Duration::from_millis(config.worker.idle_timeout_ms));
        handles.push(Worker::echo(worker_config).spawn());
        frontend
            .router()
            .wait_for_workers(index + 1, Duration::from_secs(5))
            .await
            .with_context(|| format!("worker {} did not register", index))?;
    }
    println!("[frontend] {} workers registered", workers);

    let batch = (0..requests)
        .map(|i| RequestEnvelope::new(CorrelationId::numbered(i), json!({ "i": i })))
        .collect();
    let outcome = frontend.submit_all(batch, Duration::from_secs(10)).await?;

    for response in &outcome.responses {
        println!(
            "[frontend] {} -> worker {}",
            response.correlation_id, response.worker_identity
        );
    }
    println!(
        "[frontend] {} results in {}ms",
        outcome.responses.len(),
        outcome.summary.elapsed.as_millis()
    );

    let stopped = frontend.shutdown(true).await?;
    println!("[frontend] sent STOP to {} workers", stopped);

    for handle in handles {
        let report = handle.await.context("worker task panicked")??;
        println!(
            "[worker {}] handled {} requests, exit={:?}",
            report.identity, report.handled, report.exit
        );
    }
    for task in tasks {
        task.await.context("frontend task panicked")?;
    }
    Ok(())
}
