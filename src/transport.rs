use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use url::Url;

use crate::node::NodeId;
use crate::store::{MetaInfo, StoreDiff, StoreNodes};

pub mod frame;
pub mod tcp;

pub use tcp::TcpPeerLink;

/// Messages of the two-phase reconciliation exchange.
///
/// The initiator opens with [Meta](WireMessage::Meta). The responder answers
/// with a [DiffResponse](WireMessage::DiffResponse) carrying both the entries
/// it holds newer and the ids it wants in return; the initiator replies with
/// a second `DiffResponse` materializing those, and the responder closes the
/// exchange with [Ack](WireMessage::Ack).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WireMessage {
    Meta(MetaEnvelope),
    DiffResponse(DiffPayload),
    Ack,
}

/// Digest of the initiator's store plus its identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaEnvelope {
    pub sender_id: NodeId,
    pub sender_addr: Url,
    pub cluster_size: u32,
    pub version: String,
    pub digest: MetaInfo,
}

/// Materialized entries, optionally with the ids the sender wants in return.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffPayload {
    pub sender_id: NodeId,
    pub cluster_size: u32,
    pub version: String,
    pub entries: StoreDiff,
    pub want: Option<StoreNodes>,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Frame(#[from] frame::FrameError),
    #[error("failed to encode wire message: {0}")]
    Encode(String),
    #[error("failed to decode wire message: {0}")]
    Decode(String),
    #[error("connection closed by peer")]
    ConnectionClosed,
    #[error("address not dialable: {0}")]
    UnsupportedAddress(Url),
}

/// A single short-lived connection carrying one exchange.
#[async_trait]
pub trait PeerConn: Send {
    async fn send(&mut self, msg: WireMessage) -> Result<(), TransportError>;
    async fn recv(&mut self) -> Result<WireMessage, TransportError>;
}

/// The transport the engine gossips over. Implementations must deliver a sent
/// message structurally intact to the other end of the connection.
#[async_trait]
pub trait PeerLink: Send + Sync + 'static {
    /// Opens a connection for one outbound exchange.
    async fn dial(&self, addr: &Url) -> Result<Box<dyn PeerConn>, TransportError>;

    /// Binds an inbound listener. Fails fast on unusable addresses so the
    /// caller can refuse to start.
    async fn listen(&self, bind: &Url) -> Result<InboundListener, TransportError>;
}

/// Accept side of a [PeerLink]: a stream of inbound connections plus the
/// address the listener actually bound, which matters when binding port 0.
pub struct InboundListener {
    pub local_addr: Url,
    pub connections: mpsc::Receiver<Box<dyn PeerConn>>,
    accept_task: JoinHandle<()>,
}

impl InboundListener {
    pub fn new(
        local_addr: Url,
        connections: mpsc::Receiver<Box<dyn PeerConn>>,
        accept_task: JoinHandle<()>,
    ) -> Self {
        Self {
            local_addr,
            connections,
            accept_task,
        }
    }

    pub fn shutdown(&self) {
        self.accept_task.abort();
    }
}

impl Drop for InboundListener {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}
