//! Request channel that survives a stalled or vanished server
//!
//! Every attempt waits a bounded time for its reply. A timed-out connection
//! can never be reused (its reply may still arrive later and would be taken
//! for the answer to the next request), so it is dropped and the next
//! attempt opens a fresh one after a fixed backoff.

use std::net::SocketAddr;
use std::time::Duration;

use backoff::backoff::{Backoff, Constant};
use tracing::{debug, error, info, trace, warn};

use super::ReqSocket;
use crate::config::{parse_addr, ChannelSettings};
use crate::error::{Error, Result};
use crate::protocol::Multipart;

/// Retry behaviour of a [`ResilientChannel`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Deadline for one attempt, connecting and sending included
    pub timeout: Duration,
    /// Total attempts, the first one included
    pub max_retries: u32,
    /// Pause between a failed attempt and the next
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(500),
            max_retries: 5,
            backoff: Duration::from_millis(200),
        }
    }
}

impl RetryPolicy {
    pub fn from_settings(settings: &ChannelSettings) -> Self {
        Self {
            timeout: settings.timeout(),
            max_retries: settings.max_retries.max(1),
            backoff: settings.backoff(),
        }
    }
}

/// Phase of the exchange in flight
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelPhase {
    Idle,
    Sent,
    Replied,
    TimedOut,
}

/// Request/reply channel with per-attempt deadline and reconnect
pub struct ResilientChannel {
    endpoint: SocketAddr,
    policy: RetryPolicy,
    socket: Option<ReqSocket>,
    phase: ChannelPhase,
    attempts: u32,
    reconnects: u64,
}

impl ResilientChannel {
    /// Create a channel; the first connection is opened by the first request
    pub fn new(endpoint: SocketAddr, policy: RetryPolicy) -> Self {
        Self {
            endpoint,
            policy,
            socket: None,
            phase: ChannelPhase::Idle,
            attempts: 0,
            reconnects: 0,
        }
    }

    pub fn from_settings(settings: &ChannelSettings) -> Result<Self> {
        let endpoint = parse_addr("channel.endpoint", &settings.endpoint)?;
        Ok(Self::new(endpoint, RetryPolicy::from_settings(settings)))
    }

    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn phase(&self) -> ChannelPhase {
        self.phase
    }

    /// Attempts used by the most recent request
    pub fn attempts_made(&self) -> u32 {
        self.attempts
    }

    /// Connections discarded over the channel's lifetime
    pub fn reconnects(&self) -> u64 {
        self.reconnects
    }

    /// Send the same request on every attempt
    pub async fn request(&mut self, frames: Multipart) -> Result<Multipart> {
        self.request_with(|_| frames.clone()).await
    }

    /// Send a request built per attempt (attempt numbers start at 1)
    ///
    /// Returns the first reply received. Fails with `RetriesExhausted` once
    /// every attempt has timed out or lost its connection; errors that a new
    /// attempt cannot fix are returned straight away.
    pub async fn request_with<F>(&mut self, mut build: F) -> Result<Multipart>
    where
        F: FnMut(u32) -> Multipart,
    {
        let mut backoff = Constant::new(self.policy.backoff);
        self.attempts = 0;

        for attempt in 1..=self.policy.max_retries {
            self.attempts = attempt;

            match self.attempt(build(attempt)).await {
                Ok(reply) => {
                    debug!(attempt, endpoint = %self.endpoint, "Reply received");
                    self.set_phase(ChannelPhase::Idle);
                    return Ok(reply);
                }
                Err(e) if e.is_retryable() => {
                    self.discard_socket();
                    if attempt == self.policy.max_retries {
                        break;
                    }
                    let pause = backoff.next_backoff().unwrap_or(self.policy.backoff);
                    warn!(
                        attempt,
                        max = self.policy.max_retries,
                        error = %e,
                        "No reply, reconnecting after {}ms",
                        pause.as_millis()
                    );
                    tokio::time::sleep(pause).await;
                    self.set_phase(ChannelPhase::Idle);
                }
                Err(e) => {
                    self.discard_socket();
                    self.set_phase(ChannelPhase::Idle);
                    return Err(e);
                }
            }
        }

        self.set_phase(ChannelPhase::Idle);
        error!(
            attempts = self.attempts,
            endpoint = %self.endpoint,
            "Server seems to be offline, abandoning"
        );
        Err(Error::RetriesExhausted {
            attempts: self.attempts,
        })
    }

    /// One attempt: connect if needed, send, then receive, all under one deadline
    async fn attempt(&mut self, frames: Multipart) -> Result<Multipart> {
        let timeout = self.policy.timeout;
        match tokio::time::timeout(timeout, self.exchange(frames)).await {
            Ok(Ok(reply)) => {
                self.set_phase(ChannelPhase::Replied);
                Ok(reply)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                self.set_phase(ChannelPhase::TimedOut);
                Err(Error::Timeout {
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    async fn exchange(&mut self, frames: Multipart) -> Result<Multipart> {
        if self.socket.is_none() {
            let socket = ReqSocket::connect(self.endpoint).await?;
            info!(endpoint = %self.endpoint, "Connected to reply server");
            self.socket = Some(socket);
        }
        let Some(socket) = self.socket.as_mut() else {
            return Err(Error::Internal("request socket missing after connect".into()));
        };

        socket.send(&frames).await?;
        self.phase = ChannelPhase::Sent;
        trace!(phase = ?self.phase, "Channel phase");

        socket.recv().await
    }

    fn discard_socket(&mut self) {
        if self.socket.take().is_some() {
            self.reconnects += 1;
        }
    }

    fn set_phase(&mut self, phase: ChannelPhase) {
        trace!(from = ?self.phase, to = ?phase, "Channel phase");
        self.phase = phase;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::Bytes;

    use super::*;
    use crate::channel::{PongHandler, ReplyServer};

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            timeout: Duration::from_millis(100),
            max_retries,
            backoff: Duration::from_millis(20),
        }
    }

    #[test]
    fn test_policy_from_settings() {
        let policy = RetryPolicy::from_settings(&ChannelSettings::default());
        assert_eq!(policy, RetryPolicy::default());
    }

    #[tokio::test]
    async fn test_first_attempt_succeeds() {
        let server = ReplyServer::bind("127.0.0.1:0".parse().unwrap(), Arc::new(PongHandler::new()))
            .await
            .unwrap();
        let mut channel = ResilientChannel::new(server.local_addr(), fast_policy(3));

        let reply = channel.request(vec![Bytes::from("hello")]).await.unwrap();
        assert_eq!(reply, vec![Bytes::from("pong: hello")]);
        assert_eq!(channel.attempts_made(), 1);
        assert_eq!(channel.phase(), ChannelPhase::Idle);
        assert_eq!(channel.reconnects(), 0);
    }

    #[tokio::test]
    async fn test_connection_is_reused_after_reply() {
        let handler = Arc::new(PongHandler::new());
        let server = ReplyServer::bind("127.0.0.1:0".parse().unwrap(), handler.clone())
            .await
            .unwrap();
        let mut channel = ResilientChannel::new(server.local_addr(), fast_policy(3));

        for i in 0..3 {
            channel.request(vec![Bytes::from(format!("{}", i))]).await.unwrap();
        }
        assert_eq!(handler.requests_seen(), 3);
        assert_eq!(channel.reconnects(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_server_exhausts_attempts() {
        // Bind and release a port so nothing is listening on it
        let addr = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let mut channel = ResilientChannel::new(addr, fast_policy(3));

        let err = channel.request(vec![Bytes::from("hello")]).await.unwrap_err();
        assert!(matches!(err, Error::RetriesExhausted { attempts: 3 }));
        assert_eq!(channel.attempts_made(), 3);
    }

    #[tokio::test]
    async fn test_stalled_connect_is_bounded_by_deadline() {
        // A listener that never accepts, with its accept queue filled up
        let socket = tokio::net::TcpSocket::new_v4().unwrap();
        socket.bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let listener = socket.listen(0).unwrap();
        let addr = listener.local_addr().unwrap();

        let mut queued = Vec::new();
        for _ in 0..8 {
            let connect = tokio::net::TcpStream::connect(addr);
            if let Ok(Ok(stream)) = tokio::time::timeout(Duration::from_millis(50), connect).await {
                queued.push(stream);
            }
        }

        let policy = RetryPolicy {
            timeout: Duration::from_millis(200),
            max_retries: 2,
            backoff: Duration::from_millis(20),
        };
        let mut channel = ResilientChannel::new(addr, policy);
        let started = std::time::Instant::now();

        let outcome = tokio::time::timeout(
            Duration::from_secs(3),
            channel.request(vec![Bytes::from("hello")]),
        )
        .await
        .expect("channel did not give up on its own");

        assert!(matches!(outcome, Err(Error::RetriesExhausted { attempts: 2 })));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(channel.phase(), ChannelPhase::Idle);
        drop(listener);
    }
}
