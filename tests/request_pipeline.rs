//! Requests entering through the resilient channel and coming back from a worker

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use switchyard::channel::{ReplyServer, ResilientChannel, RetryPolicy};
use switchyard::frontend::FrontendHandler;
use switchyard::protocol::{RequestEnvelope, ResponseEnvelope};
use switchyard::types::CorrelationId;

use common::{loopback, start_frontend, start_workers};

fn policy(timeout: Duration) -> RetryPolicy {
    RetryPolicy {
        timeout,
        max_retries: 3,
        backoff: Duration::from_millis(50),
    }
}

#[tokio::test]
async fn test_channel_request_reaches_worker_and_returns() {
    let frontend = start_frontend(Duration::from_secs(1), Duration::from_secs(5)).await;
    let _workers = start_workers(&frontend, 2).await;
    let server = ReplyServer::bind(loopback(), Arc::new(FrontendHandler::new(frontend.clone())))
        .await
        .unwrap();

    let mut channel = ResilientChannel::new(server.local_addr(), policy(Duration::from_secs(2)));
    for n in 0..4 {
        let request = RequestEnvelope::new(CorrelationId::numbered(n), json!({ "n": n }));
        let reply = channel.request(request.to_frames().unwrap()).await.unwrap();

        let response = ResponseEnvelope::from_frames(&reply).unwrap();
        assert_eq!(response.correlation_id, CorrelationId::numbered(n));
        let expected = if n % 2 == 0 { "0000" } else { "0100" };
        assert_eq!(response.worker_identity, expected);
        assert_eq!(response.into_result().unwrap()["echo"]["n"], n);
    }
    assert_eq!(channel.attempts_made(), 1);
    assert_eq!(frontend.aggregator().stats().await.unwrap().resolved, 4);

    frontend.shutdown(true).await.unwrap();
}

#[tokio::test]
async fn test_channel_request_without_workers_gets_error_reply() {
    let frontend = start_frontend(Duration::from_millis(100), Duration::from_secs(5)).await;
    let server = ReplyServer::bind(loopback(), Arc::new(FrontendHandler::new(frontend.clone())))
        .await
        .unwrap();

    let mut channel = ResilientChannel::new(server.local_addr(), policy(Duration::from_secs(2)));
    let request = RequestEnvelope::new("nobody-home", json!(null));
    let reply = channel.request(request.to_frames().unwrap()).await.unwrap();

    let text = String::from_utf8_lossy(&reply[0]).into_owned();
    assert!(text.starts_with("error: "), "{}", text);
    assert!(text.contains("No workers registered"), "{}", text);
}

#[tokio::test]
async fn test_garbage_request_is_answered_with_error() {
    let frontend = start_frontend(Duration::from_millis(100), Duration::from_secs(5)).await;
    let server = ReplyServer::bind(loopback(), Arc::new(FrontendHandler::new(frontend.clone())))
        .await
        .unwrap();

    let mut channel = ResilientChannel::new(server.local_addr(), policy(Duration::from_secs(1)));
    let reply = channel.request(vec!["not an envelope".into()]).await.unwrap();
    assert!(String::from_utf8_lossy(&reply[0]).starts_with("error: "));
    assert_eq!(frontend.router().stats().await.unwrap().dispatched, 0);
}
