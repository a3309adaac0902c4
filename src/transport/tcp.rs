//! TCP implementation of [PeerLink].

use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::warn;
use url::Url;

use super::frame;
use super::{InboundListener, PeerConn, PeerLink, TransportError, WireMessage};

const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(2);

/// Gossips over plain TCP, one short-lived connection per exchange, with
/// length + crc32c framed bincode messages.
pub struct TcpPeerLink {
    dial_timeout: Duration,
    max_frame_bytes: usize,
}

impl TcpPeerLink {
    pub fn new() -> Self {
        Self {
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            max_frame_bytes: frame::MAX_FRAME_BYTES,
        }
    }

    pub fn with_dial_timeout(mut self, dial_timeout: Duration) -> Self {
        self.dial_timeout = dial_timeout;
        self
    }
}

impl Default for TcpPeerLink {
    fn default() -> Self {
        Self::new()
    }
}

/// Extracts a `host:port` dial target from a peer URL.
fn dial_target(url: &Url) -> Result<String, TransportError> {
    let port = url
        .port()
        .ok_or_else(|| TransportError::UnsupportedAddress(url.clone()))?;
    match url.host() {
        Some(url::Host::Domain(host)) => Ok(format!("{host}:{port}")),
        Some(url::Host::Ipv4(ip)) => Ok(format!("{ip}:{port}")),
        Some(url::Host::Ipv6(ip)) => Ok(format!("[{ip}]:{port}")),
        None => Err(TransportError::UnsupportedAddress(url.clone())),
    }
}

struct TcpConn {
    stream: TcpStream,
    max_frame_bytes: usize,
}

#[async_trait]
impl PeerConn for TcpConn {
    async fn send(&mut self, msg: WireMessage) -> Result<(), TransportError> {
        let bytes = bincode::serde::encode_to_vec(&msg, bincode::config::standard())
            .map_err(|e| TransportError::Encode(e.to_string()))?;
        frame::write_frame(&mut self.stream, &bytes, self.max_frame_bytes).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<WireMessage, TransportError> {
        let bytes = frame::read_frame(&mut self.stream, self.max_frame_bytes)
            .await?
            .ok_or(TransportError::ConnectionClosed)?;
        let (msg, _) = bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
            .map_err(|e| TransportError::Decode(e.to_string()))?;
        Ok(msg)
    }
}

#[async_trait]
impl PeerLink for TcpPeerLink {
    async fn dial(&self, addr: &Url) -> Result<Box<dyn PeerConn>, TransportError> {
        let target = dial_target(addr)?;
        let stream = tokio::time::timeout(self.dial_timeout, TcpStream::connect(&target))
            .await
            .map_err(|_| {
                TransportError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "dial timed out",
                ))
            })??;
        let _ = stream.set_nodelay(true);
        Ok(Box::new(TcpConn {
            stream,
            max_frame_bytes: self.max_frame_bytes,
        }))
    }

    async fn listen(&self, bind: &Url) -> Result<InboundListener, TransportError> {
        let target = dial_target(bind)?;
        let listener = TcpListener::bind(&target).await?;
        let local = listener.local_addr()?;
        let local_addr = Url::parse(&format!("{}://{}", bind.scheme(), local))
            .map_err(|_| TransportError::UnsupportedAddress(bind.clone()))?;

        let (conn_tx, conn_rx) = mpsc::channel::<Box<dyn PeerConn>>(16);
        let max_frame_bytes = self.max_frame_bytes;
        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        let _ = stream.set_nodelay(true);
                        let conn = Box::new(TcpConn {
                            stream,
                            max_frame_bytes,
                        });
                        if conn_tx.send(conn).await.is_err() {
                            break;
                        }
                    }
                    Err(error) => {
                        warn!(%error, "accept failed");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                }
            }
        });

        Ok(InboundListener::new(local_addr, conn_rx, accept_task))
    }
}
