//! Seam between the connection state machine and whatever negotiates the actual
//! peer-to-peer transport.
//!
//! A [`NegotiatorFactory`] builds one [`Negotiator`] per connection. The negotiator
//! is driven through async calls; everything it wants to report (local candidates,
//! state changes, channel traffic) comes back as [`CapabilityEvent`]s pushed into
//! an [`EventSink`] tagged with the owning [`ConnectionId`].

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::MeshResult;

pub mod scripted;
pub mod webrtc;

/// Label of the single pre-negotiated data channel each connection carries.
pub const DATA_CHANNEL_LABEL: &str = "meshDataChannel";
/// Stream id both sides agree on out of band.
pub const DATA_CHANNEL_ID: u16 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Offering,
    Answering,
}

/// Coarse connection / ICE state as reported by the capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    New,
    Checking,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CapabilityEvent {
    /// The capability is ready for a local offer.
    NegotiationNeeded,
    /// Browser-shaped candidate object to relay to the remote peer.
    LocalCandidate(Value),
    ConnectionState(LinkState),
    IceConnectionState(LinkState),
    ChannelOpen,
    ChannelClose,
    ChannelError(String),
    ChannelMessage(String),
}

pub type EventEnvelope = (ConnectionId, CapabilityEvent);

#[derive(Debug, Clone)]
pub struct EventSink {
    id: ConnectionId,
    tx: mpsc::UnboundedSender<EventEnvelope>,
}

impl EventSink {
    pub fn new(id: ConnectionId, tx: mpsc::UnboundedSender<EventEnvelope>) -> Self {
        Self { id, tx }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Events emitted after the receiving side is gone are discarded.
    pub fn emit(&self, event: CapabilityEvent) {
        let _ = self.tx.send((self.id, event));
    }
}

#[async_trait]
pub trait Negotiator: Send + Sync {
    /// Creates a local offer, applies it locally and returns it for relaying.
    async fn create_offer(&self) -> MeshResult<Value>;
    /// Applies a remote offer and returns the local answer.
    async fn accept_offer(&self, offer: Value) -> MeshResult<Value>;
    async fn accept_answer(&self, answer: Value) -> MeshResult<()>;
    async fn add_remote_candidate(&self, candidate: Value) -> MeshResult<()>;
    async fn send_text(&self, text: String) -> MeshResult<()>;
    async fn close(&self) -> MeshResult<()>;
}

#[async_trait]
pub trait NegotiatorFactory: Send + Sync {
    async fn create(&self, role: Role, sink: EventSink) -> MeshResult<Arc<dyn Negotiator>>;
}
