//! Resilient request channel tests against a live reply server

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use switchyard::channel::{ChannelPhase, PongHandler, ReplyServer, ReqSocket, ReqState, ResilientChannel, RetryPolicy};
use switchyard::Error;

use common::loopback;

async fn slow_server(delay_first: usize, delay: Duration) -> (ReplyServer, Arc<PongHandler>) {
    let handler = Arc::new(PongHandler::with_delayed_replies(delay_first, delay));
    let server = ReplyServer::bind(loopback(), handler.clone()).await.unwrap();
    (server, handler)
}

// ─────────────────────────────────────────────────────────────────
// Retry Behaviour
// ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_slow_server_succeeds_on_third_attempt() {
    let (server, handler) = slow_server(2, Duration::from_millis(1500)).await;
    let policy = RetryPolicy {
        timeout: Duration::from_millis(500),
        max_retries: 5,
        backoff: Duration::from_millis(200),
    };
    let mut channel = ResilientChannel::new(server.local_addr(), policy);

    let started = Instant::now();
    let reply = channel
        .request_with(|attempt| vec![Bytes::from(format!("ping attempt={}", attempt))])
        .await
        .unwrap();

    assert_eq!(reply, vec![Bytes::from("pong: ping attempt=3")]);
    assert_eq!(channel.attempts_made(), 3);
    assert_eq!(channel.reconnects(), 2);
    assert_eq!(channel.phase(), ChannelPhase::Idle);
    assert_eq!(handler.requests_seen(), 3);

    // Two timeouts plus two backoffs
    assert!(started.elapsed() >= Duration::from_millis(1400));
}

#[tokio::test]
async fn test_retries_exhausted_when_every_reply_is_late() {
    let (server, handler) = slow_server(5, Duration::from_millis(600)).await;
    let policy = RetryPolicy {
        timeout: Duration::from_millis(100),
        max_retries: 3,
        backoff: Duration::from_millis(20),
    };
    let mut channel = ResilientChannel::new(server.local_addr(), policy);

    let err = channel.request(vec![Bytes::from("ping")]).await.unwrap_err();
    assert!(matches!(err, Error::RetriesExhausted { attempts: 3 }));
    assert!(!err.is_retryable());
    assert_eq!(channel.attempts_made(), 3);
    assert_eq!(handler.requests_seen(), 3);
}

#[tokio::test]
async fn test_channel_recovers_after_server_restart() {
    let (server, _) = slow_server(0, Duration::ZERO).await;
    let addr = server.local_addr();
    let mut channel = ResilientChannel::new(
        addr,
        RetryPolicy {
            timeout: Duration::from_millis(200),
            max_retries: 10,
            backoff: Duration::from_millis(100),
        },
    );
    channel.request(vec![Bytes::from("before")]).await.unwrap();

    server.shutdown();
    let restart = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(250)).await;
        ReplyServer::bind(addr, Arc::new(PongHandler::new())).await.unwrap()
    });

    let reply = channel.request(vec![Bytes::from("after")]).await.unwrap();
    assert_eq!(reply, vec![Bytes::from("pong: after")]);
    assert!(channel.attempts_made() > 1);
    drop(restart.await.unwrap());
}

// ─────────────────────────────────────────────────────────────────
// Socket Alternation
// ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_req_socket_rejects_out_of_turn_calls() {
    let (server, _) = slow_server(0, Duration::ZERO).await;
    let mut socket = ReqSocket::connect(server.local_addr()).await.unwrap();
    assert_eq!(socket.state(), ReqState::Idle);

    let err = socket.recv().await.unwrap_err();
    assert!(matches!(err, Error::ProtocolViolation { .. }));

    socket.send(&[Bytes::from("one")]).await.unwrap();
    assert_eq!(socket.state(), ReqState::AwaitingReply);
    let err = socket.send(&[Bytes::from("two")]).await.unwrap_err();
    assert!(matches!(err, Error::ProtocolViolation { .. }));

    let reply = socket.recv().await.unwrap();
    assert_eq!(reply, vec![Bytes::from("pong: one")]);
    assert_eq!(socket.state(), ReqState::Idle);
}
