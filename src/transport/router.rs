//! Identity-addressed sockets
//!
//! A [`RouterSocket`] accepts many peers and tags every inbound message with
//! the sender's identity; replies are addressed back by identity. A
//! [`DealerSocket`] is the peer side: one connection, free-form send and
//! receive.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use super::{connect_with_greeting, read_greeting, INBOUND_QUEUE, WRITE_QUEUE};
use crate::error::{Error, Result};
use crate::protocol::{read_multipart, write_multipart, Multipart};
use crate::types::Identity;

/// Live route to one connected peer
struct Route {
    conn_id: u64,
    write_tx: mpsc::Sender<Multipart>,
}

type Routes = Arc<RwLock<HashMap<Identity, Route>>>;

// ─────────────────────────────────────────────────────────────────
// Router
// ─────────────────────────────────────────────────────────────────

/// Bound socket that routes by peer identity
pub struct RouterSocket {
    local_addr: SocketAddr,
    routes: Routes,
    inbound_rx: mpsc::Receiver<(Identity, Multipart)>,
    shutdown_tx: watch::Sender<bool>,
}

impl RouterSocket {
    /// Bind and start accepting peers
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::connection_failed(addr, e))?;
        let local_addr = listener.local_addr()?;

        let routes: Routes = Arc::new(RwLock::new(HashMap::new()));
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tokio::spawn(accept_loop(listener, Arc::clone(&routes), inbound_tx, shutdown_rx));
        info!(addr = %local_addr, "Router socket listening");

        Ok(Self {
            local_addr,
            routes,
            inbound_rx,
            shutdown_tx,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Next inbound message and the identity of its sender
    ///
    /// Cancel safe. Returns `None` once the socket has shut down.
    pub async fn recv(&mut self) -> Option<(Identity, Multipart)> {
        self.inbound_rx.recv().await
    }

    /// Queue a message for one peer, waiting for room in its queue
    pub async fn send(&self, identity: &Identity, frames: Multipart) -> Result<()> {
        let write_tx = self.route(identity)?;
        write_tx.send(frames).await.map_err(|_| Error::PeerUnreachable {
            identity: identity.to_hex(),
        })
    }

    /// Queue a message for one peer without waiting
    ///
    /// Fails with `PeerSaturated` when the peer's queue is full, which
    /// happens once a connected peer stops reading.
    pub fn try_send(&self, identity: &Identity, frames: Multipart) -> Result<()> {
        let write_tx = self.route(identity)?;
        write_tx.try_send(frames).map_err(|e| match e {
            TrySendError::Full(_) => Error::PeerSaturated {
                identity: identity.to_hex(),
            },
            TrySendError::Closed(_) => Error::PeerUnreachable {
                identity: identity.to_hex(),
            },
        })
    }

    fn route(&self, identity: &Identity) -> Result<mpsc::Sender<Multipart>> {
        self.routes
            .read()
            .get(identity)
            .map(|route| route.write_tx.clone())
            .ok_or_else(|| Error::PeerUnreachable {
                identity: identity.to_hex(),
            })
    }

    /// Identities with a live connection
    pub fn peers(&self) -> Vec<Identity> {
        self.routes.read().keys().cloned().collect()
    }

    pub fn is_connected(&self, identity: &Identity) -> bool {
        self.routes.read().contains_key(identity)
    }
}

impl Drop for RouterSocket {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

async fn accept_loop(
    listener: TcpListener,
    routes: Routes,
    inbound_tx: mpsc::Sender<(Identity, Multipart)>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut next_conn_id: u64 = 0;

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer_addr)) => {
                    next_conn_id += 1;
                    let conn_id = next_conn_id;
                    let routes = Arc::clone(&routes);
                    let inbound_tx = inbound_tx.clone();
                    let shutdown_rx = shutdown_rx.clone();
                    tokio::spawn(async move {
                        if let Err(e) = serve_peer(stream, conn_id, routes, inbound_tx, shutdown_rx).await {
                            debug!(addr = %peer_addr, error = %e, "Router connection ended with error");
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

    // Dropping the senders ends every writer task
    routes.write().clear();
}

async fn serve_peer(
    mut stream: TcpStream,
    conn_id: u64,
    routes: Routes,
    inbound_tx: mpsc::Sender<(Identity, Multipart)>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<()> {
    stream.set_nodelay(true)?;
    let greeting = read_greeting(&mut stream).await?;
    let identity = match greeting.first() {
        Some(raw) if !raw.is_empty() => Identity::from(raw.clone()),
        _ => Identity::generated(conn_id as u32),
    };

    let (mut reader, writer) = stream.into_split();
    let (write_tx, write_rx) = mpsc::channel(WRITE_QUEUE);
    tokio::spawn(write_loop(identity.clone(), writer, write_rx));

    let previous = routes
        .write()
        .insert(identity.clone(), Route { conn_id, write_tx });
    if previous.is_some() {
        warn!(peer = %identity, "Identity reconnected, replacing previous connection");
    }
    debug!(peer = %identity, conn_id, "Peer connected");

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            msg = read_multipart(&mut reader) => match msg {
                Ok(Some(frames)) => {
                    if inbound_tx.send((identity.clone(), frames)).await.is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    debug!(peer = %identity, "Peer closed connection");
                    break;
                }
                Err(e) => {
                    debug!(peer = %identity, error = %e, "Peer read error");
                    break;
                }
            }
        }
    }

    // A newer connection may own the identity by now
    let mut routes = routes.write();
    if routes.get(&identity).map(|r| r.conn_id) == Some(conn_id) {
        routes.remove(&identity);
    }
    Ok(())
}

async fn write_loop(identity: Identity, mut writer: OwnedWriteHalf, mut write_rx: mpsc::Receiver<Multipart>) {
    while let Some(frames) = write_rx.recv().await {
        if let Err(e) = write_multipart(&mut writer, &frames).await {
            debug!(peer = %identity, error = %e, "Peer write error");
            break;
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Dealer
// ─────────────────────────────────────────────────────────────────

/// Single connection to a router, free-form send and receive
pub struct DealerSocket {
    identity: Option<Identity>,
    peer_addr: SocketAddr,
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
}

impl DealerSocket {
    /// Connect, optionally announcing a fixed identity
    pub async fn connect(addr: SocketAddr, identity: Option<Identity>) -> Result<Self> {
        let greeting = vec![identity.as_ref().map(Identity::to_bytes).unwrap_or_default()];
        let stream = connect_with_greeting(addr, &greeting).await?;
        let (reader, writer) = stream.into_split();

        Ok(Self {
            identity,
            peer_addr: addr,
            reader,
            writer,
        })
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub async fn send(&mut self, frames: &[Bytes]) -> Result<()> {
        write_multipart(&mut self.writer, frames).await
    }

    /// Next message from the router
    ///
    /// Not cancel safe: abandoning a receive mid-message desynchronizes the
    /// stream, so a timed-out dealer should be dropped.
    pub async fn recv(&mut self) -> Result<Multipart> {
        read_multipart(&mut self.reader)
            .await?
            .ok_or_else(|| Error::connection_lost(format!("router at {} closed the connection", self.peer_addr)))
    }
}
