use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::peer::PeerId;

/// Value of the `code` field on every error frame.
pub const ERROR_CODE: &str = "ERROR";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// The connection URL did not carry a session id; the socket is closed after this.
    IdNotGivenInConnectionUrl,
    MalformedJson,
    UnknownTargetPeerId,
    DuplicatePeerId,
    /// Another live connection already holds this session id; the socket is closed.
    SessionAlreadyConnected,
    /// A peer was registered on a session the service no longer tracks.
    SessionNotConnected,
    /// Any code this build does not know about.
    #[serde(other)]
    Unrecognized,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::IdNotGivenInConnectionUrl => "ID_NOT_GIVEN_IN_CONNECTION_URL",
            ErrorCode::MalformedJson => "MALFORMED_JSON",
            ErrorCode::UnknownTargetPeerId => "UNKNOWN_TARGET_PEER_ID",
            ErrorCode::DuplicatePeerId => "DUPLICATE_PEER_ID",
            ErrorCode::SessionAlreadyConnected => "SESSION_ALREADY_CONNECTED",
            ErrorCode::SessionNotConnected => "SESSION_NOT_CONNECTED",
            ErrorCode::Unrecognized => "UNRECOGNIZED",
        }
    }
}

/// Client → service: announce a freshly created virtual peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Register {
    #[serde(rename = "new")]
    pub peer_id: PeerId,
}

/// Service → client: the newly registered `node_id` should open a connection to
/// `connect`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assign {
    #[serde(rename = "nodeId")]
    pub node_id: PeerId,
    pub connect: PeerId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReply {
    pub code: String,
    #[serde(rename = "errorCode")]
    pub error_code: ErrorCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
}

impl ErrorReply {
    pub fn new(error_code: ErrorCode) -> Self {
        Self {
            code: ERROR_CODE.to_string(),
            error_code,
            destination: None,
        }
    }

    pub fn unknown_target(destination: Option<String>) -> Self {
        Self {
            destination,
            ..Self::new(ErrorCode::UnknownTargetPeerId)
        }
    }
}

/// Negotiation payload carried by a relay envelope. The contents are opaque to the
/// rendezvous service.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayPayload {
    Offer(Value),
    Answer(Value),
    Candidate(Value),
}

impl RelayPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            RelayPayload::Offer(_) => "offer",
            RelayPayload::Answer(_) => "answer",
            RelayPayload::Candidate(_) => "candidate",
        }
    }
}

/// Peer-to-peer signaling message routed by `destination`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayEnvelope {
    pub source: PeerId,
    pub destination: PeerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offer: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate: Option<Value>,
}

impl RelayEnvelope {
    pub fn new(source: PeerId, destination: PeerId, payload: RelayPayload) -> Self {
        let mut envelope = Self {
            source,
            destination,
            offer: None,
            answer: None,
            candidate: None,
        };
        match payload {
            RelayPayload::Offer(value) => envelope.offer = Some(value),
            RelayPayload::Answer(value) => envelope.answer = Some(value),
            RelayPayload::Candidate(value) => envelope.candidate = Some(value),
        }
        envelope
    }

    /// Extracts the payload. When several are present the first of offer, answer,
    /// candidate wins.
    pub fn into_payload(self) -> Option<RelayPayload> {
        if let Some(offer) = self.offer {
            return Some(RelayPayload::Offer(offer));
        }
        if let Some(answer) = self.answer {
            return Some(RelayPayload::Answer(answer));
        }
        self.candidate.map(RelayPayload::Candidate)
    }
}

/// Frames a peer session sends to the rendezvous service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ClientFrame {
    Register(Register),
    Relay(RelayEnvelope),
}

/// Frames the rendezvous service delivers to a peer session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerFrame {
    Assign(Assign),
    Error(ErrorReply),
    Relay(RelayEnvelope),
}

impl ServerFrame {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}
