use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use mesh_peers::capability::scripted::ScriptedFactory;
use mesh_peers::capability::{CapabilityEvent, Role};
use mesh_peers::connection::NegotiationState;
use mesh_peers::orchestrator::ConnectionSummary;
use mesh_peers::{MeshConfig, MeshError, MeshSession};
use mesh_rendezvous::{build_router, telemetry::detached_metrics_handle, AppState};
use mesh_proto::PeerId;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::time::{sleep, Instant};

const WAIT: Duration = Duration::from_secs(5);

struct Rendezvous {
    addr: SocketAddr,
    state: Arc<AppState>,
    _shutdown: oneshot::Sender<()>,
}

impl Rendezvous {
    async fn start() -> Self {
        let state = AppState::new(detached_metrics_handle());
        let router = build_router(state.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown, shutdown_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .unwrap();
        });
        Self {
            addr,
            state,
            _shutdown: shutdown,
        }
    }

    fn config(&self, session_id: &str) -> MeshConfig {
        MeshConfig {
            signaller_url: format!("http://{}", self.addr),
            session_id: session_id.to_string(),
            ice_servers: Vec::new(),
            ..MeshConfig::default()
        }
    }

    async fn wait_until(&self, what: &str, check: impl Fn(&AppState) -> bool) {
        let deadline = Instant::now() + WAIT;
        while !check(&self.state) {
            assert!(Instant::now() < deadline, "rendezvous never reached: {what}");
            sleep(Duration::from_millis(10)).await;
        }
    }
}

async fn wait_for_connection(
    session: &MeshSession,
    expected: NegotiationState,
) -> ConnectionSummary {
    let deadline = Instant::now() + WAIT;
    loop {
        let connections = session.connections().await.unwrap();
        if let Some(found) = connections.iter().find(|c| c.state == expected) {
            return found.clone();
        }
        assert!(
            Instant::now() < deadline,
            "{} never reached {expected}: {connections:?}",
            session.session_id()
        );
        sleep(Duration::from_millis(10)).await;
    }
}

#[test_timeout::tokio_timeout_test(30, multi_thread)]
async fn two_sessions_negotiate_through_rendezvous() {
    let rendezvous = Rendezvous::start().await;
    let first_factory = ScriptedFactory::new();
    let second_factory = ScriptedFactory::new();

    let first = MeshSession::connect_with_factory(rendezvous.config("S1"), first_factory.clone())
        .await
        .unwrap();
    let second =
        MeshSession::connect_with_factory(rendezvous.config("S2"), second_factory.clone())
            .await
            .unwrap();

    assert_eq!(first.create_peer().await.unwrap(), PeerId::from("S1-0"));
    rendezvous
        .wait_until("one registered peer", |state| state.stats().registered_peers == 1)
        .await;
    assert_eq!(second.create_peer().await.unwrap(), PeerId::from("S2-0"));

    // S2-0 is told to connect to S1-0 and offers; S1-0 answers on demand.
    let offering = wait_for_connection(&second, NegotiationState::Connected).await;
    assert_eq!(offering.local, PeerId::from("S2-0"));
    assert_eq!(offering.remote, PeerId::from("S1-0"));
    assert_eq!(offering.role, Role::Offering);

    let answering = wait_for_connection(&first, NegotiationState::AnswerSent).await;
    assert_eq!(answering.local, PeerId::from("S1-0"));
    assert_eq!(answering.remote, PeerId::from("S2-0"));
    assert_eq!(answering.role, Role::Answering);

    first_factory.handles()[0].emit(CapabilityEvent::ChannelOpen);
    let ready = wait_for_connection(&first, NegotiationState::Connected).await;
    assert!(ready.ready);
    assert_eq!(first.counters().data_channels_opened, 1);
    assert_eq!(second.counters().signaling_errors, 0);

    second.teardown().await;
    rendezvous
        .wait_until("second session released", |state| {
            let stats = state.stats();
            stats.active_sessions == 1 && stats.registered_peers == 1 && stats.paired_peers == 0
        })
        .await;
    assert!(matches!(
        second.create_peer().await,
        Err(MeshError::ChannelClosed)
    ));

    first.teardown().await;
    rendezvous
        .wait_until("all sessions gone", |state| state.stats().active_sessions == 0)
        .await;
}

#[test_timeout::tokio_timeout_test]
async fn peers_in_one_session_are_never_paired() {
    let rendezvous = Rendezvous::start().await;
    let factory = ScriptedFactory::new();
    let session = MeshSession::connect_with_factory(rendezvous.config("solo"), factory.clone())
        .await
        .unwrap();

    let peers = session
        .spawn_peers(3, Duration::from_millis(5))
        .await
        .unwrap();
    assert_eq!(
        peers,
        vec![
            PeerId::from("solo-0"),
            PeerId::from("solo-1"),
            PeerId::from("solo-2")
        ]
    );
    rendezvous
        .wait_until("three registered peers", |state| {
            state.stats().registered_peers == 3
        })
        .await;

    sleep(Duration::from_millis(100)).await;
    assert!(session.connections().await.unwrap().is_empty());
    assert!(factory.handles().is_empty());
    session.teardown().await;
}

#[test_timeout::tokio_timeout_test]
async fn connect_fails_without_rendezvous() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let config = MeshConfig {
        signaller_url: format!("ws://{addr}"),
        session_id: "S1".into(),
        ..MeshConfig::default()
    };
    let result = MeshSession::connect_with_factory(config, ScriptedFactory::new()).await;
    assert!(matches!(result, Err(MeshError::Setup(_))));
}
