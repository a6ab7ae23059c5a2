use std::borrow::Borrow;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

const SEQUENCE_SEPARATOR: char = '-';

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PeerIdError {
    #[error("peer id must not be empty")]
    Empty,
}

/// Identity of one virtual peer, formatted as `<sessionId>-<sequence>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(session_id: &str, sequence: u64) -> Self {
        Self(format!("{session_id}{SEQUENCE_SEPARATOR}{sequence}"))
    }

    pub fn parse(raw: impl Into<String>) -> Result<Self, PeerIdError> {
        let raw = raw.into();
        if raw.trim().is_empty() {
            return Err(PeerIdError::Empty);
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Session portion of the id: everything before the last separator. Ids without
    /// a separator are their own session.
    pub fn session_prefix(&self) -> &str {
        self.0
            .rsplit_once(SEQUENCE_SEPARATOR)
            .map(|(session, _)| session)
            .unwrap_or(&self.0)
    }

    pub fn shares_session_with(&self, other: &PeerId) -> bool {
        self.session_prefix() == other.session_prefix()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for PeerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for PeerId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PeerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for PeerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}
