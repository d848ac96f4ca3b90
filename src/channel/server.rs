//! Reply side of the request channel

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, debug_span, error, info, warn, Instrument};

use crate::error::{Error, Result};
use crate::protocol::{read_multipart, write_multipart, Multipart};
use crate::transport::read_greeting;

// ─────────────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────────────

/// Produces the reply for one request
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle(&self, request: Multipart) -> Result<Multipart>;
}

/// Replies `pong: <msg>`, optionally stalling the first few replies
#[derive(Debug, Default)]
pub struct PongHandler {
    delay: Duration,
    delay_first: usize,
    seen: AtomicUsize,
}

impl PongHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold the first `count` replies back by `delay` each
    pub fn with_delayed_replies(count: usize, delay: Duration) -> Self {
        Self {
            delay,
            delay_first: count,
            seen: AtomicUsize::new(0),
        }
    }

    pub fn requests_seen(&self) -> usize {
        self.seen.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RequestHandler for PongHandler {
    async fn handle(&self, request: Multipart) -> Result<Multipart> {
        let n = self.seen.fetch_add(1, Ordering::SeqCst) + 1;
        let msg = request
            .first()
            .map(|frame| String::from_utf8_lossy(frame).into_owned())
            .unwrap_or_default();

        if n <= self.delay_first {
            info!(request = n, delay_ms = self.delay.as_millis() as u64, msg = %msg, "Simulating slow reply");
            tokio::time::sleep(self.delay).await;
        } else {
            debug!(request = n, msg = %msg, "Replying");
        }

        Ok(vec![Bytes::from(format!("pong: {}", msg))])
    }
}

// ─────────────────────────────────────────────────────────────────
// Server
// ─────────────────────────────────────────────────────────────────

/// Serves request channels until dropped
///
/// Each connection is served on its own task with strict alternation, so a
/// stalled reply on one connection does not hold up the others.
pub struct ReplyServer {
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
}

impl ReplyServer {
    pub async fn bind(addr: SocketAddr, handler: Arc<dyn RequestHandler>) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::connection_failed(addr, e))?;
        let local_addr = listener.local_addr()?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tokio::spawn(accept_loop(listener, handler, shutdown_rx));
        info!(addr = %local_addr, "Reply server listening");

        Ok(Self {
            local_addr,
            shutdown_tx,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown(self) {
        drop(self)
    }
}

impl Drop for ReplyServer {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

async fn accept_loop(
    listener: TcpListener,
    handler: Arc<dyn RequestHandler>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer_addr)) => {
                    let handler = Arc::clone(&handler);
                    let shutdown_rx = shutdown_rx.clone();
                    let span = debug_span!("request_conn", peer = %peer_addr);
                    tokio::spawn(async move {
                        if let Err(e) = serve_client(stream, handler, shutdown_rx).await {
                            debug!(error = %e, "Request connection ended with error");
                        }
                    }.instrument(span));
                }
                Err(e) => {
                    error!(error = %e, "Accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
    info!("Reply server stopped");
}

async fn serve_client(
    mut stream: TcpStream,
    handler: Arc<dyn RequestHandler>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<()> {
    stream.set_nodelay(true)?;
    read_greeting(&mut stream).await?;

    loop {
        let request = tokio::select! {
            _ = shutdown_rx.changed() => return Ok(()),
            request = read_multipart(&mut stream) => match request? {
                Some(request) => request,
                None => return Ok(()),
            },
        };

        let reply = match handler.handle(request).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(error = %e, "Request handler failed");
                vec![Bytes::from(format!("error: {}", e))]
            }
        };

        // The client may have given up on this request already
        write_multipart(&mut stream, &reply).await?;
    }
}
