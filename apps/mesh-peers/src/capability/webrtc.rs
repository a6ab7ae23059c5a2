use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, trace, warn};
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use super::{
    CapabilityEvent, EventSink, LinkState, Negotiator, NegotiatorFactory, Role, DATA_CHANNEL_ID,
    DATA_CHANNEL_LABEL,
};
use crate::error::{MeshError, MeshResult};

/// `{type, sdp}` as exchanged by browsers.
#[derive(Debug, Serialize, Deserialize)]
struct SessionDescriptionJson {
    #[serde(rename = "type")]
    kind: String,
    sdp: String,
}

/// `RTCIceCandidateInit` in its browser JSON form.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CandidateJson {
    candidate: String,
    #[serde(default)]
    sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    sdp_mline_index: Option<u16>,
    #[serde(default)]
    username_fragment: Option<String>,
}

impl From<RTCIceCandidateInit> for CandidateJson {
    fn from(init: RTCIceCandidateInit) -> Self {
        Self {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
            username_fragment: init.username_fragment,
        }
    }
}

impl From<CandidateJson> for RTCIceCandidateInit {
    fn from(json: CandidateJson) -> Self {
        RTCIceCandidateInit {
            candidate: json.candidate,
            sdp_mid: json.sdp_mid,
            sdp_mline_index: json.sdp_mline_index,
            username_fragment: json.username_fragment,
        }
    }
}

/// Builds one `RTCPeerConnection` per mesh connection, each carrying the shared
/// pre-negotiated data channel.
pub struct WebRtcFactory {
    api: API,
    ice_servers: Vec<String>,
}

impl WebRtcFactory {
    pub fn new(ice_servers: Vec<String>) -> Self {
        Self {
            api: APIBuilder::new().build(),
            ice_servers,
        }
    }

    fn rtc_configuration(&self) -> RTCConfiguration {
        let ice_servers = if self.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }]
        };
        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }
}

#[async_trait]
impl NegotiatorFactory for WebRtcFactory {
    async fn create(&self, role: Role, sink: EventSink) -> MeshResult<Arc<dyn Negotiator>> {
        let peer_connection = Arc::new(
            self.api
                .new_peer_connection(self.rtc_configuration())
                .await?,
        );
        wire_peer_connection(&peer_connection, role, &sink);

        let channel = peer_connection
            .create_data_channel(
                DATA_CHANNEL_LABEL,
                Some(RTCDataChannelInit {
                    ordered: Some(true),
                    negotiated: Some(DATA_CHANNEL_ID),
                    ..Default::default()
                }),
            )
            .await?;
        wire_data_channel(&channel, &sink);

        // Pre-negotiated channels do not always raise negotiation-needed; the
        // state machine ignores the duplicate when they do.
        if role == Role::Offering {
            sink.emit(CapabilityEvent::NegotiationNeeded);
        }

        debug!(
            target: "mesh::webrtc",
            connection = %sink.id(),
            ?role,
            "peer connection created"
        );

        Ok(Arc::new(WebRtcNegotiator {
            peer_connection,
            channel,
        }))
    }
}

fn wire_peer_connection(pc: &Arc<RTCPeerConnection>, role: Role, sink: &EventSink) {
    if role == Role::Offering {
        let negotiation_sink = sink.clone();
        pc.on_negotiation_needed(Box::new(move || {
            let sink = negotiation_sink.clone();
            Box::pin(async move {
                sink.emit(CapabilityEvent::NegotiationNeeded);
            })
        }));
    }

    let candidate_sink = sink.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let sink = candidate_sink.clone();
        Box::pin(async move {
            let Some(candidate) = candidate else {
                return;
            };
            match candidate.to_json() {
                Ok(init) => match serde_json::to_value(CandidateJson::from(init)) {
                    Ok(value) => sink.emit(CapabilityEvent::LocalCandidate(value)),
                    Err(err) => warn!(target: "mesh::webrtc", error = %err, "encode candidate"),
                },
                Err(err) => warn!(target: "mesh::webrtc", error = %err, "serialize candidate"),
            }
        })
    }));

    let state_sink = sink.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let sink = state_sink.clone();
        Box::pin(async move {
            trace!(target: "mesh::webrtc", connection = %sink.id(), ?state, "peer connection state");
            if let Some(link) = peer_link_state(state) {
                sink.emit(CapabilityEvent::ConnectionState(link));
            }
        })
    }));

    let ice_sink = sink.clone();
    pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
        let sink = ice_sink.clone();
        Box::pin(async move {
            trace!(target: "mesh::webrtc", connection = %sink.id(), ?state, "ice connection state");
            if let Some(link) = ice_link_state(state) {
                sink.emit(CapabilityEvent::IceConnectionState(link));
            }
        })
    }));
}

fn wire_data_channel(channel: &Arc<RTCDataChannel>, sink: &EventSink) {
    let open_sink = sink.clone();
    channel.on_open(Box::new(move || {
        let sink = open_sink.clone();
        Box::pin(async move {
            sink.emit(CapabilityEvent::ChannelOpen);
        })
    }));

    let close_sink = sink.clone();
    channel.on_close(Box::new(move || {
        let sink = close_sink.clone();
        Box::pin(async move {
            sink.emit(CapabilityEvent::ChannelClose);
        })
    }));

    let error_sink = sink.clone();
    channel.on_error(Box::new(move |err: webrtc::Error| {
        let sink = error_sink.clone();
        Box::pin(async move {
            sink.emit(CapabilityEvent::ChannelError(err.to_string()));
        })
    }));

    let message_sink = sink.clone();
    channel.on_message(Box::new(move |message: DataChannelMessage| {
        let sink = message_sink.clone();
        Box::pin(async move {
            let text = String::from_utf8_lossy(&message.data).into_owned();
            sink.emit(CapabilityEvent::ChannelMessage(text));
        })
    }));
}

fn peer_link_state(state: RTCPeerConnectionState) -> Option<LinkState> {
    match state {
        RTCPeerConnectionState::New => Some(LinkState::New),
        RTCPeerConnectionState::Connecting => Some(LinkState::Checking),
        RTCPeerConnectionState::Connected => Some(LinkState::Connected),
        RTCPeerConnectionState::Disconnected => Some(LinkState::Disconnected),
        RTCPeerConnectionState::Failed => Some(LinkState::Failed),
        RTCPeerConnectionState::Closed => Some(LinkState::Closed),
        _ => None,
    }
}

fn ice_link_state(state: RTCIceConnectionState) -> Option<LinkState> {
    match state {
        RTCIceConnectionState::New => Some(LinkState::New),
        RTCIceConnectionState::Checking => Some(LinkState::Checking),
        RTCIceConnectionState::Connected | RTCIceConnectionState::Completed => {
            Some(LinkState::Connected)
        }
        RTCIceConnectionState::Disconnected => Some(LinkState::Disconnected),
        RTCIceConnectionState::Failed => Some(LinkState::Failed),
        RTCIceConnectionState::Closed => Some(LinkState::Closed),
        _ => None,
    }
}

fn parse_description(value: Value, expected: &str) -> MeshResult<String> {
    let description: SessionDescriptionJson = serde_json::from_value(value)
        .map_err(|err| MeshError::InvalidPayload(format!("session description: {err}")))?;
    if description.kind != expected {
        return Err(MeshError::InvalidPayload(format!(
            "expected {expected} description, got {}",
            description.kind
        )));
    }
    Ok(description.sdp)
}

fn description_value(kind: &str, description: RTCSessionDescription) -> MeshResult<Value> {
    Ok(serde_json::to_value(SessionDescriptionJson {
        kind: kind.to_string(),
        sdp: description.sdp,
    })?)
}

struct WebRtcNegotiator {
    peer_connection: Arc<RTCPeerConnection>,
    channel: Arc<RTCDataChannel>,
}

#[async_trait]
impl Negotiator for WebRtcNegotiator {
    async fn create_offer(&self) -> MeshResult<Value> {
        let offer = self.peer_connection.create_offer(None).await?;
        self.peer_connection
            .set_local_description(offer.clone())
            .await?;
        description_value("offer", offer)
    }

    async fn accept_offer(&self, offer: Value) -> MeshResult<Value> {
        let sdp = parse_description(offer, "offer")?;
        self.peer_connection
            .set_remote_description(RTCSessionDescription::offer(sdp)?)
            .await?;
        let answer = self.peer_connection.create_answer(None).await?;
        self.peer_connection
            .set_local_description(answer.clone())
            .await?;
        description_value("answer", answer)
    }

    async fn accept_answer(&self, answer: Value) -> MeshResult<()> {
        let sdp = parse_description(answer, "answer")?;
        self.peer_connection
            .set_remote_description(RTCSessionDescription::answer(sdp)?)
            .await?;
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: Value) -> MeshResult<()> {
        let candidate: CandidateJson = serde_json::from_value(candidate)
            .map_err(|err| MeshError::InvalidPayload(format!("candidate: {err}")))?;
        // End-of-candidates marker.
        if candidate.candidate.is_empty() {
            return Ok(());
        }
        self.peer_connection
            .add_ice_candidate(candidate.into())
            .await?;
        Ok(())
    }

    async fn send_text(&self, text: String) -> MeshResult<()> {
        self.channel.send_text(text).await?;
        Ok(())
    }

    async fn close(&self) -> MeshResult<()> {
        if let Err(err) = self.channel.close().await {
            debug!(target: "mesh::webrtc", error = %err, "data channel close");
        }
        self.peer_connection.close().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test_timeout::timeout]
    fn candidate_json_uses_browser_field_names() {
        let init = RTCIceCandidateInit {
            candidate: "candidate:1 1 udp 2130706431 192.168.1.4 50000 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: Some("abcd".into()),
        };
        let value = serde_json::to_value(CandidateJson::from(init)).unwrap();
        assert_eq!(
            value,
            json!({
                "candidate": "candidate:1 1 udp 2130706431 192.168.1.4 50000 typ host",
                "sdpMid": "0",
                "sdpMLineIndex": 0,
                "usernameFragment": "abcd"
            })
        );
    }

    #[test_timeout::timeout]
    fn candidate_json_tolerates_missing_optionals() {
        let parsed: CandidateJson =
            serde_json::from_value(json!({ "candidate": "candidate:2 1 udp 1 10.0.0.1 9 typ host" }))
                .unwrap();
        let init: RTCIceCandidateInit = parsed.into();
        assert_eq!(init.sdp_mid, None);
        assert_eq!(init.sdp_mline_index, None);
    }

    #[test_timeout::timeout]
    fn description_kind_is_checked() {
        let err = parse_description(json!({ "type": "answer", "sdp": "v=0" }), "offer").unwrap_err();
        assert!(matches!(err, MeshError::InvalidPayload(_)));
        assert_eq!(
            parse_description(json!({ "type": "offer", "sdp": "v=0" }), "offer").unwrap(),
            "v=0"
        );
    }

    #[test_timeout::tokio_timeout_test(30)]
    async fn offering_connection_announces_negotiation() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let factory = WebRtcFactory::new(Vec::new());
        let sink = EventSink::new(crate::capability::ConnectionId(7), tx);
        let negotiator = factory.create(Role::Offering, sink).await.unwrap();

        let (id, event) = rx.recv().await.unwrap();
        assert_eq!(id.0, 7);
        assert_eq!(event, CapabilityEvent::NegotiationNeeded);

        let offer = negotiator.create_offer().await.unwrap();
        assert_eq!(offer["type"], "offer");
        assert!(offer["sdp"].is_string());
        negotiator.close().await.unwrap();
    }
}
