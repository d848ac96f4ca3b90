//! Many-to-one fan-in sockets

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info};

use super::{connect_with_greeting, read_greeting, INBOUND_QUEUE};
use crate::error::{Error, Result};
use crate::protocol::{read_multipart, write_multipart, Multipart};

/// Bound collection point; any number of pushers may connect
pub struct PullSocket {
    local_addr: SocketAddr,
    inbound_rx: mpsc::Receiver<Multipart>,
    shutdown_tx: watch::Sender<bool>,
}

impl PullSocket {
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::connection_failed(addr, e))?;
        let local_addr = listener.local_addr()?;

        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(accept_loop(listener, inbound_tx, shutdown_rx));
        info!(addr = %local_addr, "Pull socket listening");

        Ok(Self {
            local_addr,
            inbound_rx,
            shutdown_tx,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Next pushed message from any connection; cancel safe
    pub async fn recv(&mut self) -> Option<Multipart> {
        self.inbound_rx.recv().await
    }
}

impl Drop for PullSocket {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

async fn accept_loop(
    listener: TcpListener,
    inbound_tx: mpsc::Sender<Multipart>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer_addr)) => {
                    let inbound_tx = inbound_tx.clone();
                    let shutdown_rx = shutdown_rx.clone();
                    tokio::spawn(async move {
                        if let Err(e) = serve_pusher(stream, inbound_tx, shutdown_rx).await {
                            debug!(addr = %peer_addr, error = %e, "Push connection ended with error");
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

async fn serve_pusher(
    mut stream: TcpStream,
    inbound_tx: mpsc::Sender<Multipart>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<()> {
    read_greeting(&mut stream).await?;

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => return Ok(()),
            msg = read_multipart(&mut stream) => match msg? {
                Some(frames) => {
                    if inbound_tx.send(frames).await.is_err() {
                        return Ok(());
                    }
                }
                None => return Ok(()),
            }
        }
    }
}

/// Sending side of a fan-in pipeline
pub struct PushSocket {
    stream: TcpStream,
}

impl PushSocket {
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = connect_with_greeting(addr, &Vec::new()).await?;
        Ok(Self { stream })
    }

    pub async fn send(&mut self, frames: &[Bytes]) -> Result<()> {
        write_multipart(&mut self.stream, frames).await
    }
}
