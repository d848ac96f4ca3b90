//! Topic fan-out sockets
//!
//! A [`PubSocket`] delivers each published multipart to every subscriber
//! whose topic prefix matches the first frame. Subscribers that fall too far
//! behind lose messages rather than slow the publisher down.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

use super::{connect_with_greeting, read_greeting, GREETING_TIMEOUT};
use crate::error::{Error, Result};
use crate::protocol::{read_multipart, write_multipart, Multipart, TAG_SUBSCRIBED};

/// Messages a slow subscriber may fall behind before it starts losing them
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 1024;

// ─────────────────────────────────────────────────────────────────
// Publisher
// ─────────────────────────────────────────────────────────────────

/// Bound publisher socket
pub struct PubSocket {
    local_addr: SocketAddr,
    tx: broadcast::Sender<Multipart>,
    subscribers: Arc<AtomicUsize>,
    shutdown_tx: watch::Sender<bool>,
}

impl PubSocket {
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        Self::bind_with_buffer(addr, DEFAULT_SUBSCRIBER_BUFFER).await
    }

    pub async fn bind_with_buffer(addr: SocketAddr, buffer: usize) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::connection_failed(addr, e))?;
        let local_addr = listener.local_addr()?;

        let (tx, _) = broadcast::channel(buffer.max(1));
        let subscribers = Arc::new(AtomicUsize::new(0));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tokio::spawn(accept_loop(
            listener,
            tx.clone(),
            Arc::clone(&subscribers),
            shutdown_rx,
        ));
        info!(addr = %local_addr, "Publisher socket listening");

        Ok(Self {
            local_addr,
            tx,
            subscribers,
            shutdown_tx,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Publish to every matching subscriber; returns how many were live
    ///
    /// Never blocks. With no subscribers the message is simply dropped.
    pub fn send(&self, frames: Multipart) -> usize {
        self.tx.send(frames).unwrap_or(0)
    }

    /// Subscribers with a live subscription
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.load(Ordering::Relaxed)
    }
}

impl Drop for PubSocket {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

async fn accept_loop(
    listener: TcpListener,
    tx: broadcast::Sender<Multipart>,
    subscribers: Arc<AtomicUsize>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer_addr)) => {
                    let tx = tx.clone();
                    let subscribers = Arc::clone(&subscribers);
                    let shutdown_rx = shutdown_rx.clone();
                    tokio::spawn(async move {
                        if let Err(e) = serve_subscriber(stream, tx, subscribers, shutdown_rx).await {
                            debug!(addr = %peer_addr, error = %e, "Subscriber connection ended with error");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "Accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
}

async fn serve_subscriber(
    mut stream: TcpStream,
    tx: broadcast::Sender<Multipart>,
    subscribers: Arc<AtomicUsize>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<()> {
    stream.set_nodelay(true)?;
    let greeting = read_greeting(&mut stream).await?;
    let prefix = greeting.into_iter().next().unwrap_or_default();

    // Subscribe before acknowledging so nothing published after the ack is missed
    let mut rx = tx.subscribe();
    write_multipart(&mut stream, &[Bytes::from_static(TAG_SUBSCRIBED)]).await?;
    subscribers.fetch_add(1, Ordering::Relaxed);
    debug!(topic = %String::from_utf8_lossy(&prefix), "Subscriber attached");

    let result = loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break Ok(()),
            msg = rx.recv() => match msg {
                Ok(frames) => {
                    let matches = frames
                        .first()
                        .map_or(prefix.is_empty(), |topic| topic.starts_with(prefix.as_ref()));
                    if matches {
                        if let Err(e) = write_multipart(&mut stream, &frames).await {
                            break Err(e);
                        }
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Slow subscriber fell behind, messages dropped");
                }
                Err(RecvError::Closed) => break Ok(()),
            }
        }
    };

    subscribers.fetch_sub(1, Ordering::Relaxed);
    result
}

// ─────────────────────────────────────────────────────────────────
// Subscriber
// ─────────────────────────────────────────────────────────────────

/// Connection to a publisher, filtered by topic prefix
pub struct SubSocket {
    stream: TcpStream,
    topic: Bytes,
}

impl SubSocket {
    /// Connect and wait until the subscription is live
    pub async fn connect(addr: SocketAddr, topic: impl Into<Bytes>) -> Result<Self> {
        let topic = topic.into();
        let mut stream = connect_with_greeting(addr, &vec![topic.clone()]).await?;

        let ack = tokio::time::timeout(GREETING_TIMEOUT, read_multipart(&mut stream))
            .await
            .map_err(|_| Error::connection_failed(addr, "subscription not acknowledged"))??;
        match ack.as_deref() {
            Some([tag]) if tag.as_ref() == TAG_SUBSCRIBED => {}
            _ => return Err(Error::malformed("unexpected subscription acknowledgement")),
        }

        Ok(Self { stream, topic })
    }

    pub fn topic(&self) -> &Bytes {
        &self.topic
    }

    /// Next published message matching the topic
    pub async fn recv(&mut self) -> Result<Multipart> {
        read_multipart(&mut self.stream)
            .await?
            .ok_or_else(|| Error::connection_lost("publisher closed the connection"))
    }
}
