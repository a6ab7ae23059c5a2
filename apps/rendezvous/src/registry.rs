use std::collections::{BTreeMap, HashMap};

use mesh_proto::{Assign, ErrorCode, PeerId};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Outbound text queue for one session's signaling socket.
pub type Outbox = mpsc::UnboundedSender<String>;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("session {0} already has a live signaling connection")]
    SessionAlreadyConnected(String),
    #[error("session {0} is not connected")]
    UnknownSession(String),
    #[error("peer {0} is already registered")]
    DuplicatePeer(PeerId),
    #[error("no registered peer with id {0}")]
    UnknownDestination(String),
}

impl RegistryError {
    pub fn error_code(&self) -> ErrorCode {
        match self {
            RegistryError::SessionAlreadyConnected(_) => ErrorCode::SessionAlreadyConnected,
            RegistryError::UnknownSession(_) => ErrorCode::SessionNotConnected,
            RegistryError::DuplicatePeer(_) => ErrorCode::DuplicatePeerId,
            RegistryError::UnknownDestination(_) => ErrorCode::UnknownTargetPeerId,
        }
    }
}

struct SessionEntry {
    outbox: Outbox,
    peers: Vec<PeerId>,
}

struct PeerEntry {
    session_id: String,
    neighbor: Option<PeerId>,
    /// Registration order; also the key into `unassigned` while unpaired.
    seq: u64,
}

/// Result of registering a peer. `assignment` is present when a neighbor was found.
#[derive(Debug)]
pub struct Registration {
    pub assignment: Option<Assign>,
    pub registered_peers: usize,
}

#[derive(Debug, Default)]
pub struct Disconnected {
    pub removed: Vec<PeerId>,
    /// Former neighbors that lost their pairing and are unassigned again.
    pub released: Vec<PeerId>,
    pub active_sessions: usize,
    pub registered_peers: usize,
}

#[derive(Debug, Serialize)]
pub struct RegistryStats {
    pub active_sessions: usize,
    pub registered_peers: usize,
    pub paired_peers: usize,
    pub unassigned_peers: usize,
    pub sessions: Vec<SessionStatsEntry>,
}

#[derive(Debug, Serialize)]
pub struct SessionStatsEntry {
    pub session_id: String,
    pub peers: usize,
}

/// Routing index for the rendezvous service: live sessions, the peer → session
/// map and the neighbor pairing. Guarded as a single unit by the caller.
#[derive(Default)]
pub struct Registry {
    sessions: HashMap<String, SessionEntry>,
    peers: HashMap<PeerId, PeerEntry>,
    /// Peers without a neighbor, ordered by registration.
    unassigned: BTreeMap<u64, PeerId>,
    next_seq: u64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&mut self, session_id: &str, outbox: Outbox) -> Result<usize, RegistryError> {
        if self.sessions.contains_key(session_id) {
            return Err(RegistryError::SessionAlreadyConnected(
                session_id.to_string(),
            ));
        }
        self.sessions.insert(
            session_id.to_string(),
            SessionEntry {
                outbox,
                peers: Vec::new(),
            },
        );
        Ok(self.sessions.len())
    }

    /// Adds `peer_id` to the index and pairs it with the earliest-registered
    /// unassigned peer from another session, if any.
    pub fn register(
        &mut self,
        session_id: &str,
        peer_id: PeerId,
    ) -> Result<Registration, RegistryError> {
        if self.peers.contains_key(&peer_id) {
            return Err(RegistryError::DuplicatePeer(peer_id));
        }
        let session = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| RegistryError::UnknownSession(session_id.to_string()))?;
        session.peers.push(peer_id.clone());

        let seq = self.next_seq;
        self.next_seq += 1;

        let neighbor = self
            .unassigned
            .iter()
            .find(|(_, candidate)| {
                !candidate.shares_session_with(&peer_id)
                    && self
                        .peers
                        .get(*candidate)
                        .is_some_and(|entry| entry.session_id != session_id)
            })
            .map(|(candidate_seq, candidate)| (*candidate_seq, candidate.clone()));

        let assignment = match neighbor {
            Some((neighbor_seq, neighbor_id)) => {
                self.unassigned.remove(&neighbor_seq);
                if let Some(entry) = self.peers.get_mut(&neighbor_id) {
                    entry.neighbor = Some(peer_id.clone());
                }
                debug!(
                    target: "rendezvous",
                    peer = %peer_id,
                    neighbor = %neighbor_id,
                    "paired peers"
                );
                Some(Assign {
                    node_id: peer_id.clone(),
                    connect: neighbor_id,
                })
            }
            None => {
                self.unassigned.insert(seq, peer_id.clone());
                None
            }
        };

        self.peers.insert(
            peer_id,
            PeerEntry {
                session_id: session_id.to_string(),
                neighbor: assignment.as_ref().map(|assign| assign.connect.clone()),
                seq,
            },
        );

        Ok(Registration {
            assignment,
            registered_peers: self.peers.len(),
        })
    }

    /// Forwards `text` verbatim to the session owning `destination`.
    pub fn route(&self, destination: &str, text: String) -> Result<(), RegistryError> {
        let session = self
            .peers
            .get(destination)
            .and_then(|entry| self.sessions.get(&entry.session_id))
            .ok_or_else(|| RegistryError::UnknownDestination(destination.to_string()))?;
        if session.outbox.send(text).is_err() {
            warn!(
                target: "rendezvous",
                destination,
                "destination session writer is gone; dropping frame"
            );
        }
        Ok(())
    }

    /// Drops the session and every peer it owns. Neighbors of removed peers become
    /// eligible for pairing again but are not re-paired or notified here.
    pub fn disconnect(&mut self, session_id: &str) -> Disconnected {
        let Some(session) = self.sessions.remove(session_id) else {
            return Disconnected {
                active_sessions: self.sessions.len(),
                registered_peers: self.peers.len(),
                ..Disconnected::default()
            };
        };

        let mut released = Vec::new();
        for peer_id in &session.peers {
            let Some(entry) = self.peers.remove(peer_id) else {
                continue;
            };
            self.unassigned.remove(&entry.seq);
            let Some(neighbor_id) = entry.neighbor else {
                continue;
            };
            if let Some(neighbor) = self.peers.get_mut(&neighbor_id) {
                neighbor.neighbor = None;
                self.unassigned.insert(neighbor.seq, neighbor_id.clone());
                released.push(neighbor_id);
            }
        }

        Disconnected {
            removed: session.peers,
            released,
            active_sessions: self.sessions.len(),
            registered_peers: self.peers.len(),
        }
    }

    pub fn neighbor_of(&self, peer_id: &str) -> Option<&PeerId> {
        self.peers.get(peer_id)?.neighbor.as_ref()
    }

    pub fn is_registered(&self, peer_id: &str) -> bool {
        self.peers.contains_key(peer_id)
    }

    pub fn stats(&self) -> RegistryStats {
        let mut sessions: Vec<SessionStatsEntry> = self
            .sessions
            .iter()
            .map(|(session_id, entry)| SessionStatsEntry {
                session_id: session_id.clone(),
                peers: entry.peers.len(),
            })
            .collect();
        sessions.sort_by(|a, b| a.session_id.cmp(&b.session_id));

        RegistryStats {
            active_sessions: self.sessions.len(),
            registered_peers: self.peers.len(),
            paired_peers: self.peers.len() - self.unassigned.len(),
            unassigned_peers: self.unassigned.len(),
            sessions,
        }
    }
}
