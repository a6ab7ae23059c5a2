use std::fmt;
use std::sync::Arc;

use mesh_proto::{PeerId, RelayEnvelope, RelayPayload};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::capability::{CapabilityEvent, ConnectionId, LinkState, Negotiator, Role};
use crate::counters::{Counter, MeshCounters};
use crate::error::{MeshError, MeshResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NegotiationState {
    Idle,
    Offering,
    AwaitingOffer,
    AnswerPending,
    AnswerSent,
    Connected,
    Failed,
    Closed,
}

impl NegotiationState {
    pub fn as_str(self) -> &'static str {
        match self {
            NegotiationState::Idle => "idle",
            NegotiationState::Offering => "offering",
            NegotiationState::AwaitingOffer => "awaiting_offer",
            NegotiationState::AnswerPending => "answer_pending",
            NegotiationState::AnswerSent => "answer_sent",
            NegotiationState::Connected => "connected",
            NegotiationState::Failed => "failed",
            NegotiationState::Closed => "closed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, NegotiationState::Failed | NegotiationState::Closed)
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Negotiation state for one (local peer, remote peer) pair. Owns the negotiator
/// exclusively; everything it wants relayed is returned to the caller.
pub struct Connection {
    id: ConnectionId,
    local: PeerId,
    remote: PeerId,
    role: Role,
    state: NegotiationState,
    channel_ready: bool,
    negotiator: Arc<dyn Negotiator>,
}

impl Connection {
    pub fn new(
        id: ConnectionId,
        local: PeerId,
        remote: PeerId,
        role: Role,
        negotiator: Arc<dyn Negotiator>,
    ) -> Self {
        Self {
            id,
            local,
            remote,
            role,
            state: NegotiationState::Idle,
            channel_ready: false,
            negotiator,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn local(&self) -> &PeerId {
        &self.local
    }

    pub fn remote(&self) -> &PeerId {
        &self.remote
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn is_channel_ready(&self) -> bool {
        self.channel_ready
    }

    /// Leaves `Idle` according to the role: offering waits for the capability to
    /// ask for an offer, answering waits for the remote offer.
    pub fn begin(&mut self) {
        if self.state != NegotiationState::Idle {
            return;
        }
        let next = match self.role {
            Role::Offering => NegotiationState::Offering,
            Role::Answering => NegotiationState::AwaitingOffer,
        };
        self.transition(next);
    }

    pub async fn accept_offer(&mut self, offer: Value) -> MeshResult<RelayEnvelope> {
        if self.state != NegotiationState::AwaitingOffer {
            return Err(MeshError::InvalidState(self.state.as_str()));
        }
        match self.negotiator.accept_offer(offer).await {
            Ok(answer) => {
                self.transition(NegotiationState::AnswerSent);
                Ok(self.envelope(RelayPayload::Answer(answer)))
            }
            Err(err) => {
                self.transition(NegotiationState::Failed);
                Err(err)
            }
        }
    }

    /// Applies the remote answer. Returns whether this call moved the connection
    /// to `Connected`; answers outside `AnswerPending` are ignored.
    pub async fn accept_answer(&mut self, answer: Value) -> MeshResult<bool> {
        if self.state != NegotiationState::AnswerPending {
            debug!(
                target: "mesh",
                local = %self.local,
                remote = %self.remote,
                state = %self.state,
                "ignoring answer"
            );
            return Ok(false);
        }
        match self.negotiator.accept_answer(answer).await {
            Ok(()) => {
                self.transition(NegotiationState::Connected);
                Ok(true)
            }
            Err(err) => {
                self.transition(NegotiationState::Failed);
                Err(err)
            }
        }
    }

    pub async fn add_remote_candidate(&mut self, candidate: Value) -> MeshResult<()> {
        if self.state == NegotiationState::Closed {
            return Err(MeshError::InvalidState(self.state.as_str()));
        }
        self.negotiator.add_remote_candidate(candidate).await
    }

    /// Applies one capability event. Returns a frame to relay when the event
    /// produced one (local offer or candidate).
    pub async fn handle_event(
        &mut self,
        event: CapabilityEvent,
        counters: &MeshCounters,
    ) -> Option<RelayEnvelope> {
        if self.state == NegotiationState::Closed {
            return None;
        }

        match event {
            CapabilityEvent::NegotiationNeeded => {
                if self.state != NegotiationState::Offering {
                    return None;
                }
                match self.negotiator.create_offer().await {
                    Ok(offer) => {
                        self.transition(NegotiationState::AnswerPending);
                        return Some(self.envelope(RelayPayload::Offer(offer)));
                    }
                    Err(err) => {
                        warn!(
                            target: "mesh",
                            local = %self.local,
                            remote = %self.remote,
                            error = %err,
                            "failed to create offer"
                        );
                        self.transition(NegotiationState::Failed);
                    }
                }
            }
            CapabilityEvent::LocalCandidate(candidate) => {
                return Some(self.envelope(RelayPayload::Candidate(candidate)));
            }
            CapabilityEvent::ConnectionState(link) => match link {
                LinkState::Connected => self.confirm_answered(),
                LinkState::Failed => self.fail(counters, Counter::FailedConnections),
                _ => {}
            },
            CapabilityEvent::IceConnectionState(link) => {
                if link == LinkState::Failed {
                    self.fail(counters, Counter::FailedIceConnections);
                }
            }
            CapabilityEvent::ChannelOpen => {
                self.channel_ready = true;
                counters.incr(Counter::DataChannelsOpened);
                info!(target: "mesh", local = %self.local, remote = %self.remote, "data channel open");
                self.confirm_answered();
            }
            CapabilityEvent::ChannelClose => {
                self.channel_ready = false;
                counters.incr(Counter::DataChannelsClosed);
                info!(target: "mesh", local = %self.local, remote = %self.remote, "data channel closed");
            }
            CapabilityEvent::ChannelError(error) => {
                counters.incr(Counter::DataChannelErrors);
                warn!(target: "mesh", local = %self.local, remote = %self.remote, %error, "data channel error");
            }
            CapabilityEvent::ChannelMessage(payload) => {
                counters.incr(Counter::ReceivedMessages);
                debug!(
                    target: "mesh",
                    local = %self.local,
                    remote = %self.remote,
                    %payload,
                    "data channel message"
                );
            }
        }
        None
    }

    /// Sends `text` over the data channel if it is open. Returns whether it was sent.
    pub async fn send_heartbeat(&self, text: &str) -> MeshResult<bool> {
        if !self.channel_ready || self.state.is_terminal() {
            return Ok(false);
        }
        self.negotiator.send_text(text.to_string()).await?;
        Ok(true)
    }

    pub async fn close(&mut self) {
        if self.state == NegotiationState::Closed {
            return;
        }
        self.channel_ready = false;
        self.transition(NegotiationState::Closed);
        if let Err(err) = self.negotiator.close().await {
            debug!(target: "mesh", local = %self.local, remote = %self.remote, error = %err, "close");
        }
    }

    fn confirm_answered(&mut self) {
        if self.state == NegotiationState::AnswerSent {
            self.transition(NegotiationState::Connected);
        }
    }

    fn fail(&mut self, counters: &MeshCounters, counter: Counter) {
        counters.incr(counter);
        if !self.state.is_terminal() {
            warn!(
                target: "mesh",
                local = %self.local,
                remote = %self.remote,
                state = %self.state,
                ?counter,
                "connection failed"
            );
            self.transition(NegotiationState::Failed);
        }
    }

    fn transition(&mut self, next: NegotiationState) {
        debug!(
            target: "mesh",
            connection = %self.id,
            local = %self.local,
            remote = %self.remote,
            from = %self.state,
            to = %next,
            "negotiation state"
        );
        self.state = next;
    }

    fn envelope(&self, payload: RelayPayload) -> RelayEnvelope {
        RelayEnvelope::new(self.local.clone(), self.remote.clone(), payload)
    }
}
