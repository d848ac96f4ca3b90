//! Addressable asynchronous sockets over TCP
//!
//! Each socket type mirrors a messaging pattern:
//! - [`RouterSocket`] / [`DealerSocket`]: identity-addressed, bidirectional
//! - [`PubSocket`] / [`SubSocket`]: topic-prefix fan-out
//! - [`PushSocket`] / [`PullSocket`]: many-to-one fan-in
//!
//! Every client connection opens with a greeting multipart (its identity or
//! its topic filter). Bound sockets accept connections in a background task
//! and stop accepting when dropped.

mod pipeline;
mod pubsub;
mod router;

pub use pipeline::*;
pub use pubsub::*;
pub use router::*;

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpStream;

use crate::error::{Error, Result};
use crate::protocol::{read_multipart, write_multipart, Multipart};

/// How long an accepted connection may take to send its greeting
pub const GREETING_TIMEOUT: Duration = Duration::from_secs(5);

/// Messages buffered per outbound connection
pub(crate) const WRITE_QUEUE: usize = 256;

/// Messages buffered between connection readers and the socket owner
pub(crate) const INBOUND_QUEUE: usize = 1024;

/// Open a connection and send its greeting
pub(crate) async fn connect_with_greeting(addr: SocketAddr, greeting: &Multipart) -> Result<TcpStream> {
    let mut stream = TcpStream::connect(addr)
        .await
        .map_err(|e| Error::connection_failed(addr, e))?;
    stream.set_nodelay(true)?;
    write_multipart(&mut stream, greeting).await?;
    Ok(stream)
}

/// Read the greeting of a freshly accepted connection
pub(crate) async fn read_greeting(stream: &mut TcpStream) -> Result<Multipart> {
    match tokio::time::timeout(GREETING_TIMEOUT, read_multipart(stream)).await {
        Ok(Ok(Some(greeting))) => Ok(greeting),
        Ok(Ok(None)) => Err(Error::connection_lost("peer closed before greeting")),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(Error::malformed("no greeting received")),
    }
}
