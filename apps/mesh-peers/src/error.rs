use mesh_proto::PeerId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MeshError {
    #[error("setup failed: {0}")]
    Setup(String),
    #[error("signaling channel closed")]
    ChannelClosed,
    #[error("local peer {0} already exists")]
    DuplicateLocalPeer(PeerId),
    #[error("connection from {local} to {remote} already exists")]
    DuplicatePeer { local: PeerId, remote: PeerId },
    #[error("unknown local peer {0}")]
    UnknownPeer(PeerId),
    #[error("operation not valid in {0} state")]
    InvalidState(&'static str),
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error("invalid signaling payload: {0}")]
    InvalidPayload(String),
    #[error("data channel is not open")]
    ChannelNotReady,
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    WebRtc(#[from] webrtc::Error),
}

pub type MeshResult<T> = Result<T, MeshError>;
