//! In-memory capability that records every call and lets the caller inject events.
//! No network is touched; offers and answers are placeholder descriptions.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use super::{CapabilityEvent, ConnectionId, EventSink, Negotiator, NegotiatorFactory, Role};
use crate::error::{MeshError, MeshResult};

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    CreateOffer,
    AcceptOffer(Value),
    AcceptAnswer(Value),
    RemoteCandidate(Value),
    SendText(String),
    Close,
}

#[derive(Default)]
pub struct ScriptedNegotiator {
    calls: Mutex<Vec<Call>>,
    offers: AtomicU64,
    closed: AtomicBool,
    reject_remote: AtomicBool,
    fail_offers: AtomicBool,
}

impl ScriptedNegotiator {
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn sent_texts(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                Call::SendText(text) => Some(text.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Makes every later remote description fail to apply.
    pub fn reject_remote_descriptions(&self) {
        self.reject_remote.store(true, Ordering::SeqCst);
    }

    pub fn fail_offers(&self) {
        self.fail_offers.store(true, Ordering::SeqCst);
    }

    fn record(&self, call: Call) {
        self.calls.lock().push(call);
    }

    fn check_remote(&self) -> MeshResult<()> {
        if self.reject_remote.load(Ordering::SeqCst) {
            return Err(MeshError::Negotiation(
                "scripted rejection of remote description".into(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl Negotiator for ScriptedNegotiator {
    async fn create_offer(&self) -> MeshResult<Value> {
        self.record(Call::CreateOffer);
        if self.fail_offers.load(Ordering::SeqCst) {
            return Err(MeshError::Negotiation("scripted offer failure".into()));
        }
        let n = self.offers.fetch_add(1, Ordering::SeqCst);
        Ok(json!({ "type": "offer", "sdp": format!("scripted-offer-{n}") }))
    }

    async fn accept_offer(&self, offer: Value) -> MeshResult<Value> {
        self.record(Call::AcceptOffer(offer));
        self.check_remote()?;
        Ok(json!({ "type": "answer", "sdp": "scripted-answer" }))
    }

    async fn accept_answer(&self, answer: Value) -> MeshResult<()> {
        self.record(Call::AcceptAnswer(answer));
        self.check_remote()
    }

    async fn add_remote_candidate(&self, candidate: Value) -> MeshResult<()> {
        self.record(Call::RemoteCandidate(candidate));
        Ok(())
    }

    async fn send_text(&self, text: String) -> MeshResult<()> {
        if self.is_closed() {
            return Err(MeshError::ChannelNotReady);
        }
        self.record(Call::SendText(text));
        Ok(())
    }

    async fn close(&self) -> MeshResult<()> {
        self.record(Call::Close);
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Handle on one negotiator produced by [`ScriptedFactory`].
#[derive(Clone)]
pub struct ScriptedHandle {
    pub role: Role,
    pub sink: EventSink,
    pub negotiator: Arc<ScriptedNegotiator>,
}

impl ScriptedHandle {
    pub fn id(&self) -> ConnectionId {
        self.sink.id()
    }

    pub fn emit(&self, event: CapabilityEvent) {
        self.sink.emit(event);
    }
}

/// Factory whose offering negotiators announce readiness immediately, the way a
/// real peer connection does once its data channel is declared.
#[derive(Default)]
pub struct ScriptedFactory {
    created: Mutex<Vec<ScriptedHandle>>,
}

impl ScriptedFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn handles(&self) -> Vec<ScriptedHandle> {
        self.created.lock().clone()
    }

    pub fn handle(&self, id: ConnectionId) -> Option<ScriptedHandle> {
        self.created
            .lock()
            .iter()
            .find(|handle| handle.id() == id)
            .cloned()
    }
}

#[async_trait]
impl NegotiatorFactory for ScriptedFactory {
    async fn create(&self, role: Role, sink: EventSink) -> MeshResult<Arc<dyn Negotiator>> {
        let negotiator = Arc::new(ScriptedNegotiator::default());
        if role == Role::Offering {
            sink.emit(CapabilityEvent::NegotiationNeeded);
        }
        self.created.lock().push(ScriptedHandle {
            role,
            sink,
            negotiator: negotiator.clone(),
        });
        Ok(negotiator)
    }
}
