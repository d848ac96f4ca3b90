//! Strict-alternation request socket

use std::net::SocketAddr;

use bytes::Bytes;
use tokio::net::TcpStream;
use tracing::trace;

use crate::error::{Error, Result};
use crate::protocol::{read_multipart, write_multipart, Multipart};
use crate::transport::connect_with_greeting;

/// Where a request socket is in its send/receive cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReqState {
    /// May send
    Idle,
    /// Sent; must receive before sending again
    AwaitingReply,
}

/// Client side of a request/reply exchange
///
/// Exactly one reply must be received for every request sent. A receive
/// that is abandoned (for example by a timeout) leaves the socket in
/// `AwaitingReply` for good; such a socket should be dropped.
pub struct ReqSocket {
    stream: TcpStream,
    state: ReqState,
    peer_addr: SocketAddr,
}

impl ReqSocket {
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = connect_with_greeting(addr, &vec![Bytes::new()]).await?;
        Ok(Self {
            stream,
            state: ReqState::Idle,
            peer_addr: addr,
        })
    }

    pub fn state(&self) -> ReqState {
        self.state
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub async fn send(&mut self, frames: &[Bytes]) -> Result<()> {
        if self.state == ReqState::AwaitingReply {
            return Err(Error::protocol_violation(
                "cannot send while a reply is outstanding",
            ));
        }
        write_multipart(&mut self.stream, frames).await?;
        self.state = ReqState::AwaitingReply;
        trace!(peer = %self.peer_addr, "Request sent");
        Ok(())
    }

    pub async fn recv(&mut self) -> Result<Multipart> {
        if self.state == ReqState::Idle {
            return Err(Error::protocol_violation(
                "cannot receive without an outstanding request",
            ));
        }
        let reply = read_multipart(&mut self.stream)
            .await?
            .ok_or_else(|| Error::connection_lost(format!("{} closed the connection", self.peer_addr)))?;
        self.state = ReqState::Idle;
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::channel::{PongHandler, ReplyServer};

    #[tokio::test]
    async fn test_alternation_is_enforced() {
        let server = ReplyServer::bind("127.0.0.1:0".parse().unwrap(), Arc::new(PongHandler::new()))
            .await
            .unwrap();
        let mut socket = ReqSocket::connect(server.local_addr()).await.unwrap();

        assert!(matches!(
            socket.recv().await,
            Err(Error::ProtocolViolation { .. })
        ));

        socket.send(&[Bytes::from("one")]).await.unwrap();
        assert_eq!(socket.state(), ReqState::AwaitingReply);
        assert!(matches!(
            socket.send(&[Bytes::from("two")]).await,
            Err(Error::ProtocolViolation { .. })
        ));

        let reply = socket.recv().await.unwrap();
        assert_eq!(reply[0].as_ref(), b"pong: one");
        assert_eq!(socket.state(), ReqState::Idle);
    }
}
