use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use mesh_proto::{
    Assign, ClientFrame, ErrorReply, PeerId, Register, RelayEnvelope, RelayPayload, ServerFrame,
};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::capability::{
    CapabilityEvent, ConnectionId, EventEnvelope, EventSink, NegotiatorFactory, Role,
};
use crate::connection::{Connection, NegotiationState};
use crate::counters::{Counter, MeshCounters};
use crate::error::{MeshError, MeshResult};
use crate::signaling::SignalSender;

/// Data channel heartbeat: an opaque string plus the send time in unix millis.
#[derive(Debug, Serialize)]
pub struct Heartbeat<'a> {
    #[serde(rename = "str")]
    pub text: &'a str,
    pub time: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSummary {
    pub local: PeerId,
    pub remote: PeerId,
    pub role: Role,
    pub state: NegotiationState,
    pub ready: bool,
}

struct LocalPeer {
    links: HashMap<PeerId, ConnectionId>,
    liveness: JoinHandle<()>,
}

/// Receivers the orchestrator's owner must drain and feed back in.
pub struct OrchestratorInbox {
    pub events: mpsc::UnboundedReceiver<EventEnvelope>,
    pub ticks: mpsc::UnboundedReceiver<PeerId>,
}

/// Owns the local virtual peers of one session and every connection they hold.
///
/// Connections live in an arena keyed by [`ConnectionId`]; each peer keeps only a
/// remote-peer → id index into it. Capability events and liveness ticks arrive
/// through [`OrchestratorInbox`] and are applied one at a time by the owner, so an
/// event for a connection that has already been torn down simply finds nothing.
pub struct Orchestrator {
    factory: Arc<dyn NegotiatorFactory>,
    signal: SignalSender,
    counters: Arc<MeshCounters>,
    publish_interval: Duration,
    heartbeat_text: String,
    peers: HashMap<PeerId, LocalPeer>,
    connections: HashMap<ConnectionId, Connection>,
    next_connection: u64,
    events_tx: mpsc::UnboundedSender<EventEnvelope>,
    ticks_tx: mpsc::UnboundedSender<PeerId>,
}

impl Orchestrator {
    /// Fails with [`MeshError::Setup`] when `publish_interval` is zero.
    pub fn new(
        factory: Arc<dyn NegotiatorFactory>,
        signal: SignalSender,
        counters: Arc<MeshCounters>,
        publish_interval: Duration,
        heartbeat_text: impl Into<String>,
    ) -> MeshResult<(Self, OrchestratorInbox)> {
        if publish_interval.is_zero() {
            return Err(MeshError::Setup("publish interval must be non-zero".into()));
        }
        let (events_tx, events) = mpsc::unbounded_channel();
        let (ticks_tx, ticks) = mpsc::unbounded_channel();
        let orchestrator = Self {
            factory,
            signal,
            counters,
            publish_interval,
            heartbeat_text: heartbeat_text.into(),
            peers: HashMap::new(),
            connections: HashMap::new(),
            next_connection: 0,
            events_tx,
            ticks_tx,
        };
        Ok((orchestrator, OrchestratorInbox { events, ticks }))
    }

    pub fn peer_ids(&self) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = self.peers.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Adds a local peer, starts its liveness task and registers it with the
    /// rendezvous service.
    pub fn create_peer(&mut self, peer_id: PeerId) -> MeshResult<()> {
        if self.peers.contains_key(&peer_id) {
            return Err(MeshError::DuplicateLocalPeer(peer_id));
        }

        // A peer that never reached the rendezvous service could never be paired.
        self.signal.send(ClientFrame::Register(Register {
            peer_id: peer_id.clone(),
        }))?;

        let liveness = spawn_liveness(peer_id.clone(), self.publish_interval, self.ticks_tx.clone());
        info!(target: "mesh", peer = %peer_id, "created peer");
        self.peers.insert(
            peer_id,
            LocalPeer {
                links: HashMap::new(),
                liveness,
            },
        );
        Ok(())
    }

    /// Opens the offering side of a connection from `local` to `remote`. A second
    /// call for the same pair is a no-op.
    pub async fn initiate(&mut self, local: &PeerId, remote: &PeerId) -> MeshResult<()> {
        let peer = self
            .peers
            .get(local)
            .ok_or_else(|| MeshError::UnknownPeer(local.clone()))?;
        if peer.links.contains_key(remote) {
            debug!(target: "mesh", local = %local, remote = %remote, "already connecting");
            return Ok(());
        }
        self.open_connection(local, remote, Role::Offering).await?;
        Ok(())
    }

    pub async fn handle_signal(&mut self, frame: ServerFrame) {
        match frame {
            ServerFrame::Assign(Assign { node_id, connect }) => {
                info!(target: "mesh", peer = %node_id, neighbor = %connect, "assigned neighbor");
                if let Err(err) = self.initiate(&node_id, &connect).await {
                    warn!(target: "mesh", peer = %node_id, error = %err, "cannot initiate");
                }
            }
            ServerFrame::Error(reply) => self.handle_error_reply(reply),
            ServerFrame::Relay(envelope) => self.handle_relay(envelope).await,
        }
    }

    fn handle_error_reply(&self, reply: ErrorReply) {
        self.counters.incr(Counter::SignalingErrors);
        warn!(
            target: "mesh",
            code = reply.error_code.as_str(),
            destination = reply.destination.as_deref().unwrap_or(""),
            "rendezvous reported an error"
        );
    }

    async fn handle_relay(&mut self, envelope: RelayEnvelope) {
        let local = envelope.destination.clone();
        let remote = envelope.source.clone();
        let Some(payload) = envelope.into_payload() else {
            debug!(target: "mesh", local = %local, remote = %remote, "relay frame without payload");
            return;
        };

        let result = match payload {
            RelayPayload::Offer(offer) => self.accept_offer(&local, &remote, offer).await,
            RelayPayload::Answer(answer) => match self.connection_mut(&local, &remote) {
                Some(connection) => connection.accept_answer(answer).await.map(|_| ()),
                None => {
                    warn!(target: "mesh", local = %local, remote = %remote, "answer for unknown connection");
                    Ok(())
                }
            },
            RelayPayload::Candidate(candidate) => match self.connection_mut(&local, &remote) {
                Some(connection) => connection.add_remote_candidate(candidate).await,
                None => {
                    warn!(target: "mesh", local = %local, remote = %remote, "candidate for unknown connection");
                    Ok(())
                }
            },
        };

        if let Err(err) = result {
            warn!(target: "mesh", local = %local, remote = %remote, error = %err, "signal not applied");
        }
    }

    async fn accept_offer(
        &mut self,
        local: &PeerId,
        remote: &PeerId,
        offer: serde_json::Value,
    ) -> MeshResult<()> {
        let peer = self
            .peers
            .get(local)
            .ok_or_else(|| MeshError::UnknownPeer(local.clone()))?;
        if peer.links.contains_key(remote) {
            // Never recreate an existing connection.
            return Err(MeshError::DuplicatePeer {
                local: local.clone(),
                remote: remote.clone(),
            });
        }

        let id = self.open_connection(local, remote, Role::Answering).await?;
        let Some(connection) = self.connections.get_mut(&id) else {
            return Ok(());
        };
        let answer = connection.accept_offer(offer).await?;
        self.relay(answer);
        Ok(())
    }

    async fn open_connection(
        &mut self,
        local: &PeerId,
        remote: &PeerId,
        role: Role,
    ) -> MeshResult<ConnectionId> {
        let id = ConnectionId(self.next_connection);
        self.next_connection += 1;

        let sink = EventSink::new(id, self.events_tx.clone());
        let negotiator = self.factory.create(role, sink).await?;
        let mut connection = Connection::new(id, local.clone(), remote.clone(), role, negotiator);
        connection.begin();

        // The peer may have been torn down while the factory was running.
        let Some(peer) = self.peers.get_mut(local) else {
            connection.close().await;
            return Err(MeshError::UnknownPeer(local.clone()));
        };
        peer.links.insert(remote.clone(), id);
        self.connections.insert(id, connection);
        info!(target: "mesh", local = %local, remote = %remote, ?role, connection = %id, "connection opened");
        Ok(id)
    }

    pub async fn handle_capability_event(&mut self, id: ConnectionId, event: CapabilityEvent) {
        let Some(connection) = self.connections.get_mut(&id) else {
            debug!(target: "mesh", connection = %id, ?event, "event for removed connection");
            return;
        };
        if let Some(envelope) = connection.handle_event(event, &self.counters).await {
            self.relay(envelope);
        }
    }

    /// Sends a heartbeat on every ready channel of `peer_id`. Send failures are
    /// logged and otherwise ignored.
    pub async fn publish(&self, peer_id: &PeerId) {
        let Some(peer) = self.peers.get(peer_id) else {
            return;
        };
        let heartbeat = Heartbeat {
            text: &self.heartbeat_text,
            time: chrono::Utc::now().timestamp_millis(),
        };
        let text = match serde_json::to_string(&heartbeat) {
            Ok(text) => text,
            Err(err) => {
                warn!(target: "mesh", error = %err, "encode heartbeat");
                return;
            }
        };

        for id in peer.links.values() {
            let Some(connection) = self.connections.get(id) else {
                continue;
            };
            match connection.send_heartbeat(&text).await {
                Ok(true) => {
                    debug!(target: "mesh", local = %peer_id, remote = %connection.remote(), "heartbeat sent")
                }
                Ok(false) => {}
                Err(err) => warn!(
                    target: "mesh",
                    local = %peer_id,
                    remote = %connection.remote(),
                    error = %err,
                    "heartbeat failed"
                ),
            }
        }
    }

    /// Closes every connection of `peer_id`, stops its liveness task and forgets it.
    pub async fn teardown_peer(&mut self, peer_id: &PeerId) -> MeshResult<()> {
        let peer = self
            .peers
            .remove(peer_id)
            .ok_or_else(|| MeshError::UnknownPeer(peer_id.clone()))?;
        peer.liveness.abort();
        for id in peer.links.into_values() {
            if let Some(mut connection) = self.connections.remove(&id) {
                connection.close().await;
            }
        }
        info!(target: "mesh", peer = %peer_id, "peer torn down");
        Ok(())
    }

    pub async fn teardown_all(&mut self) {
        for peer_id in self.peer_ids() {
            let _ = self.teardown_peer(&peer_id).await;
        }
    }

    pub fn connections(&self) -> Vec<ConnectionSummary> {
        let mut summaries: Vec<ConnectionSummary> = self
            .connections
            .values()
            .map(|connection| ConnectionSummary {
                local: connection.local().clone(),
                remote: connection.remote().clone(),
                role: connection.role(),
                state: connection.state(),
                ready: connection.is_channel_ready(),
            })
            .collect();
        summaries.sort_by(|a, b| (&a.local, &a.remote).cmp(&(&b.local, &b.remote)));
        summaries
    }

    fn connection_mut(&mut self, local: &PeerId, remote: &PeerId) -> Option<&mut Connection> {
        let id = self.peers.get(local)?.links.get(remote)?;
        self.connections.get_mut(id)
    }

    fn relay(&self, envelope: RelayEnvelope) {
        if let Err(err) = self.signal.send(ClientFrame::Relay(envelope)) {
            warn!(target: "mesh", error = %err, "dropping outbound signal");
        }
    }
}

fn spawn_liveness(
    peer_id: PeerId,
    period: Duration,
    ticks: mpsc::UnboundedSender<PeerId>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if ticks.send(peer_id.clone()).is_err() {
                break;
            }
        }
    })
}
