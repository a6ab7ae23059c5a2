#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use mesh_peers::capability::scripted::{ScriptedFactory, ScriptedHandle};
use mesh_peers::capability::ConnectionId;
use mesh_peers::orchestrator::{Orchestrator, OrchestratorInbox};
use mesh_peers::signaling::{Outgoing, SignalSender};
use mesh_peers::MeshCounters;
use mesh_proto::{Assign, ClientFrame, PeerId, RelayEnvelope, RelayPayload, ServerFrame};
use serde_json::{json, Value};
use tokio::sync::mpsc;

pub const HEARTBEAT_TEXT: &str = "Hello world!";

/// Orchestrator wired to a scripted capability and an in-memory signaling queue.
pub struct Harness {
    pub orchestrator: Orchestrator,
    pub inbox: OrchestratorInbox,
    pub outgoing: mpsc::UnboundedReceiver<Outgoing>,
    pub factory: Arc<ScriptedFactory>,
    pub counters: Arc<MeshCounters>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_publish_interval(Duration::from_secs(3600))
    }

    pub fn with_publish_interval(publish_interval: Duration) -> Self {
        let factory = ScriptedFactory::new();
        let counters = Arc::new(MeshCounters::new());
        let (signal, outgoing) = SignalSender::channel();
        let (orchestrator, inbox) = Orchestrator::new(
            factory.clone(),
            signal,
            counters.clone(),
            publish_interval,
            HEARTBEAT_TEXT,
        )
        .unwrap();
        Self {
            orchestrator,
            inbox,
            outgoing,
            factory,
            counters,
        }
    }

    /// Applies every capability event queued so far.
    pub async fn pump(&mut self) {
        while let Ok((id, event)) = self.inbox.events.try_recv() {
            self.orchestrator.handle_capability_event(id, event).await;
        }
    }

    /// Drains the frames the orchestrator queued for the rendezvous service.
    pub fn sent(&mut self) -> Vec<ClientFrame> {
        let mut frames = Vec::new();
        while let Ok(outgoing) = self.outgoing.try_recv() {
            if let Outgoing::Frame(frame) = outgoing {
                frames.push(frame);
            }
        }
        frames
    }

    pub fn sent_relays(&mut self) -> Vec<RelayEnvelope> {
        self.sent()
            .into_iter()
            .filter_map(|frame| match frame {
                ClientFrame::Relay(envelope) => Some(envelope),
                ClientFrame::Register(_) => None,
            })
            .collect()
    }

    pub fn handle(&self, id: u64) -> ScriptedHandle {
        self.factory
            .handle(ConnectionId(id))
            .expect("scripted negotiator for connection")
    }
}

pub fn peer(id: &str) -> PeerId {
    PeerId::from(id)
}

pub fn assign(node: &str, connect: &str) -> ServerFrame {
    ServerFrame::Assign(Assign {
        node_id: peer(node),
        connect: peer(connect),
    })
}

pub fn relay(source: &str, destination: &str, payload: RelayPayload) -> ServerFrame {
    ServerFrame::Relay(RelayEnvelope::new(peer(source), peer(destination), payload))
}

pub fn offer() -> Value {
    json!({ "type": "offer", "sdp": "remote-offer" })
}

pub fn answer() -> Value {
    json!({ "type": "answer", "sdp": "remote-answer" })
}

pub fn candidate() -> Value {
    json!({
        "candidate": "candidate:1 1 udp 2122260223 192.168.1.7 53000 typ host",
        "sdpMid": "0",
        "sdpMLineIndex": 0
    })
}
