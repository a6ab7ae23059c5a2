use std::future::pending;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mesh_proto::{PeerId, ServerFrame};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::capability::webrtc::WebRtcFactory;
use crate::capability::NegotiatorFactory;
use crate::config::MeshConfig;
use crate::counters::{CounterSnapshot, MeshCounters};
use crate::error::{MeshError, MeshResult};
use crate::orchestrator::{ConnectionSummary, Orchestrator, OrchestratorInbox};
use crate::signaling::{SignalSender, SignalingClient};

enum Command {
    CreatePeer {
        peer_id: PeerId,
        reply: oneshot::Sender<MeshResult<()>>,
    },
    TeardownPeer {
        peer_id: PeerId,
        reply: oneshot::Sender<MeshResult<()>>,
    },
    Connections {
        reply: oneshot::Sender<Vec<ConnectionSummary>>,
    },
    Teardown {
        reply: oneshot::Sender<()>,
    },
}

/// One browser-tab-equivalent: a signaling connection plus the virtual peers
/// created on it.
///
/// All peer and connection state lives in a single actor task; this handle only
/// sends it commands. Dropping the handle tears the session down in the background.
pub struct MeshSession {
    session_id: String,
    commands: mpsc::UnboundedSender<Command>,
    counters: Arc<MeshCounters>,
    next_peer: AtomicU64,
    actor: Mutex<Option<JoinHandle<()>>>,
}

impl MeshSession {
    /// Connects to the rendezvous service and negotiates real WebRTC data channels.
    pub async fn connect(config: MeshConfig) -> MeshResult<Self> {
        let factory = Arc::new(WebRtcFactory::new(config.ice_servers.clone()));
        Self::connect_with_factory(config, factory).await
    }

    /// Connects to the rendezvous service with a caller-chosen capability.
    pub async fn connect_with_factory(
        config: MeshConfig,
        factory: Arc<dyn NegotiatorFactory>,
    ) -> MeshResult<Self> {
        config.validate()?;
        let (client, frames) =
            SignalingClient::connect(&config.signaller_url, &config.session_id).await?;
        info!(
            target: "mesh",
            session = %config.session_id,
            signaller = %config.signaller_url,
            "session connected"
        );
        let signal = client.sender();
        Self::spawn(config, factory, signal, frames, Some(client))
    }

    /// Runs a session over an already established signaling transport: frames the
    /// session sends go to `signal`, frames it receives come from `frames`.
    pub fn with_transport(
        config: MeshConfig,
        factory: Arc<dyn NegotiatorFactory>,
        signal: SignalSender,
        frames: mpsc::UnboundedReceiver<ServerFrame>,
    ) -> MeshResult<Self> {
        config.validate()?;
        Self::spawn(config, factory, signal, frames, None)
    }

    fn spawn(
        config: MeshConfig,
        factory: Arc<dyn NegotiatorFactory>,
        signal: SignalSender,
        frames: mpsc::UnboundedReceiver<ServerFrame>,
        client: Option<SignalingClient>,
    ) -> MeshResult<Self> {
        let counters = Arc::new(MeshCounters::new());
        let (orchestrator, inbox) = Orchestrator::new(
            factory,
            signal.clone(),
            counters.clone(),
            config.publish_interval,
            config.heartbeat_text,
        )?;
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let actor = SessionActor {
            orchestrator,
            inbox,
            commands: commands_rx,
            frames: Some(frames),
            signal,
            client,
        };
        let handle = tokio::spawn(actor.run());

        Ok(Self {
            session_id: config.session_id,
            commands,
            counters,
            next_peer: AtomicU64::new(0),
            actor: Mutex::new(Some(handle)),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Creates the next local peer, named `<sessionId>-<n>`.
    pub async fn create_peer(&self) -> MeshResult<PeerId> {
        let sequence = self.next_peer.fetch_add(1, Ordering::SeqCst);
        let peer_id = PeerId::new(&self.session_id, sequence);
        let (reply, rx) = oneshot::channel();
        self.send(Command::CreatePeer {
            peer_id: peer_id.clone(),
            reply,
        })?;
        rx.await.map_err(|_| MeshError::ChannelClosed)??;
        Ok(peer_id)
    }

    /// Creates `count` peers, pausing `interval` between consecutive creations.
    pub async fn spawn_peers(&self, count: usize, interval: Duration) -> MeshResult<Vec<PeerId>> {
        let mut created = Vec::with_capacity(count);
        for index in 0..count {
            if index > 0 && !interval.is_zero() {
                tokio::time::sleep(interval).await;
            }
            created.push(self.create_peer().await?);
        }
        Ok(created)
    }

    pub async fn teardown_peer(&self, peer_id: &PeerId) -> MeshResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::TeardownPeer {
            peer_id: peer_id.clone(),
            reply,
        })?;
        rx.await.map_err(|_| MeshError::ChannelClosed)?
    }

    pub async fn connections(&self) -> MeshResult<Vec<ConnectionSummary>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Connections { reply })?;
        rx.await.map_err(|_| MeshError::ChannelClosed)
    }

    pub fn counters(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }

    /// Tears down every peer and closes the signaling connection. Safe to call more
    /// than once.
    pub async fn teardown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.send(Command::Teardown { reply }).is_ok() {
            let _ = rx.await;
        }
        let actor = self.actor.lock().take();
        if let Some(actor) = actor {
            let _ = actor.await;
        }
    }

    fn send(&self, command: Command) -> MeshResult<()> {
        self.commands
            .send(command)
            .map_err(|_| MeshError::ChannelClosed)
    }
}

struct SessionActor {
    orchestrator: Orchestrator,
    inbox: OrchestratorInbox,
    commands: mpsc::UnboundedReceiver<Command>,
    frames: Option<mpsc::UnboundedReceiver<ServerFrame>>,
    signal: SignalSender,
    client: Option<SignalingClient>,
}

impl SessionActor {
    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::CreatePeer { peer_id, reply }) => {
                        let _ = reply.send(self.orchestrator.create_peer(peer_id));
                    }
                    Some(Command::TeardownPeer { peer_id, reply }) => {
                        let _ = reply.send(self.orchestrator.teardown_peer(&peer_id).await);
                    }
                    Some(Command::Connections { reply }) => {
                        let _ = reply.send(self.orchestrator.connections());
                    }
                    Some(Command::Teardown { reply }) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        return;
                    }
                    None => {
                        self.shutdown().await;
                        return;
                    }
                },
                Some((id, event)) = self.inbox.events.recv() => {
                    self.orchestrator.handle_capability_event(id, event).await;
                }
                Some(peer_id) = self.inbox.ticks.recv() => {
                    self.orchestrator.publish(&peer_id).await;
                }
                frame = next_frame(&mut self.frames), if self.frames.is_some() => match frame {
                    Some(frame) => self.orchestrator.handle_signal(frame).await,
                    None => {
                        warn!(target: "mesh", "signaling connection closed");
                        self.frames = None;
                    }
                },
            }
        }
    }

    async fn shutdown(&mut self) {
        self.orchestrator.teardown_all().await;
        match self.client.take() {
            Some(client) => client.shutdown().await,
            None => self.signal.close(),
        }
        debug!(target: "mesh", "session torn down");
    }
}

async fn next_frame(
    frames: &mut Option<mpsc::UnboundedReceiver<ServerFrame>>,
) -> Option<ServerFrame> {
    match frames {
        Some(rx) => rx.recv().await,
        None => pending().await,
    }
}
