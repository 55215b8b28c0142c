//! TCP transport
//!
//! Frames are `MAGIC | u32 big-endian length | JSON body`. Outbound traffic
//! is request/response: [`request`] opens a connection, sends one frame and
//! waits for one reply, every step bounded by a timeout. Inbound connections
//! are served by [`serve_connection`], which answers each frame in turn.

use crate::network::message::{Message, MAGIC, MAX_MESSAGE_SIZE};
use bytes::{Buf, BufMut, BytesMut};
use futures::sink::SinkExt;
use futures::stream::StreamExt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::codec::{Decoder, Encoder, Framed};

const HEADER_LEN: usize = 8;

/// Peer connection errors
#[derive(Error, Debug)]
pub enum PeerError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    #[error("Timed out: {0}")]
    Timeout(String),
    #[error("Peer disconnected")]
    Disconnected,
    #[error("Unexpected reply: {0}")]
    UnexpectedReply(String),
    #[error("Peer rejected request: {0}")]
    Rejected(String),
}

impl PeerError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, PeerError::Timeout(_))
    }
}

/// Bounds on outbound requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub connect: Duration,
    pub request: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(3),
            request: Duration::from_secs(10),
        }
    }
}

fn invalid_data(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

/// Message codec for length-prefixed framing
#[derive(Debug, Default)]
pub struct MessageCodec;

impl Encoder<Message> for MessageCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let data = item.to_bytes().map_err(|e| invalid_data(e.to_string()))?;
        if data.len() > MAX_MESSAGE_SIZE {
            return Err(invalid_data(format!(
                "Message too large: {} bytes (max: {})",
                data.len(),
                MAX_MESSAGE_SIZE
            )));
        }

        // Magic (4) + Length (4) + Data
        dst.reserve(HEADER_LEN + data.len());
        dst.put_slice(&MAGIC);
        dst.put_u32(data.len() as u32);
        dst.put_slice(&data);

        Ok(())
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        if src[..4] != MAGIC {
            return Err(invalid_data("Invalid magic bytes"));
        }

        let len = u32::from_be_bytes([src[4], src[5], src[6], src[7]]) as usize;
        if len > MAX_MESSAGE_SIZE {
            return Err(invalid_data(format!(
                "Message too large: {} bytes (max: {})",
                len, MAX_MESSAGE_SIZE
            )));
        }

        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let data = src.split_to(len);

        let msg = Message::from_bytes(&data).map_err(|e| invalid_data(e.to_string()))?;
        Ok(Some(msg))
    }
}

/// TCP server for accepting peer connections
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Server {
    /// Bind to `addr`; port 0 picks a free port
    pub async fn bind(addr: &str) -> Result<Self, io::Error> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        log::info!("Server listening on {}", local_addr);

        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// The address actually bound
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept incoming connections
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr), io::Error> {
        self.listener.accept().await
    }
}

async fn exchange(framed: &mut Framed<TcpStream, MessageCodec>, msg: Message) -> Result<Message, PeerError> {
    framed.send(msg).await?;
    match framed.next().await {
        Some(Ok(reply)) => Ok(reply),
        Some(Err(e)) => Err(PeerError::IoError(e)),
        None => Err(PeerError::Disconnected),
    }
}

/// Send one message to `addr` and wait for its reply
pub async fn request(addr: &str, msg: Message, timeouts: Timeouts) -> Result<Message, PeerError> {
    let kind = msg.type_name();
    let stream = timeout(timeouts.connect, TcpStream::connect(addr))
        .await
        .map_err(|_| PeerError::Timeout(format!("connecting to {}", addr)))?
        .map_err(|e| PeerError::ConnectionFailed(format!("{}: {}", addr, e)))?;

    let mut framed = Framed::new(stream, MessageCodec);
    let reply = timeout(timeouts.request, exchange(&mut framed, msg))
        .await
        .map_err(|_| PeerError::Timeout(format!("{} to {}", kind, addr)))??;

    log::debug!("{} to {} answered with {}", kind, addr, reply.type_name());
    match reply {
        Message::Reject(reason) => Err(PeerError::Rejected(reason)),
        reply => Ok(reply),
    }
}

/// Answer frames on an inbound connection until it closes or stays idle
/// for longer than `idle`
pub async fn serve_connection<F, Fut>(stream: TcpStream, addr: SocketAddr, idle: Duration, handler: F)
where
    F: Fn(Message) -> Fut,
    Fut: Future<Output = Message>,
{
    let mut framed = Framed::new(stream, MessageCodec);

    loop {
        let msg = match timeout(idle, framed.next()).await {
            Ok(Some(Ok(msg))) => msg,
            Ok(Some(Err(e))) => {
                log::warn!("Error reading from {}: {}", addr, e);
                break;
            }
            Ok(None) => break,
            Err(_) => {
                log::debug!("Closing idle connection from {}", addr);
                break;
            }
        };

        log::debug!("Received {} from {}", msg.type_name(), addr);
        let reply = handler(msg).await;
        if let Err(e) = framed.send(reply).await {
            log::warn!("Error writing to {}: {}", addr, e);
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_codec() {
        let mut codec = MessageCodec;
        let mut buf = BytesMut::new();
        codec.encode(Message::Ping(12345), &mut buf).unwrap();

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, Message::Ping(12345));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_frame_waits() {
        let mut codec = MessageCodec;
        let mut full = BytesMut::new();
        codec.encode(Message::Ping(1), &mut full).unwrap();

        let mut partial = BytesMut::from(&full[..full.len() - 1]);
        assert!(codec.decode(&mut partial).unwrap().is_none());
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut codec = MessageCodec;
        let mut buf = BytesMut::from(&b"XXXX\x00\x00\x00\x02{}"[..]);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut codec = MessageCodec;
        let mut buf = BytesMut::new();
        buf.put_slice(&MAGIC);
        buf.put_u32(MAX_MESSAGE_SIZE as u32 + 1);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[tokio::test]
    async fn test_request_roundtrip() {
        let server = Server::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().to_string();

        tokio::spawn(async move {
            let (stream, peer) = server.accept().await.unwrap();
            serve_connection(stream, peer, Duration::from_secs(5), |msg| async move {
                match msg {
                    Message::Ping(nonce) => Message::Pong {
                        nonce,
                        chain_length: 1,
                        tip_hash: String::new(),
                    },
                    _ => Message::Reject("unsupported".into()),
                }
            })
            .await;
        });

        let reply = request(&addr, Message::Ping(7), Timeouts::default()).await.unwrap();
        assert!(matches!(reply, Message::Pong { nonce: 7, .. }));
    }

    #[tokio::test]
    async fn test_silent_peer_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let timeouts = Timeouts {
            connect: Duration::from_secs(1),
            request: Duration::from_millis(100),
        };
        let err = request(&addr, Message::Ping(1), timeouts).await.unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_refused_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let err = request(&addr, Message::Ping(1), Timeouts::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PeerError::ConnectionFailed(_)));
    }
}
