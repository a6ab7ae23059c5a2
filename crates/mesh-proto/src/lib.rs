//! Signaling wire format spoken between mesh peers and the rendezvous service.
//!
//! Every frame is a single JSON object carried in a WebSocket text message. The
//! shapes are kept flat and untagged so that browser peers speaking the same
//! protocol interoperate without a translation layer.

pub mod frame;
pub mod peer;

pub use frame::{
    Assign, ClientFrame, ErrorCode, ErrorReply, Register, RelayEnvelope, RelayPayload,
    ServerFrame, ERROR_CODE,
};
pub use peer::{PeerId, PeerIdError};

/// Query parameter that carries the session id on the signaling connection URL.
pub const SESSION_QUERY_PARAM: &str = "sessionId";
