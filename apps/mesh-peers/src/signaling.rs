use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use mesh_proto::{ClientFrame, ServerFrame, SESSION_QUERY_PARAM};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{error::ProtocolError, Error as WsError, Message},
};
use url::Url;

use crate::error::{MeshError, MeshResult};

const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug)]
pub enum Outgoing {
    Frame(ClientFrame),
    /// Flush everything queued before this, then close the socket.
    Close,
}

/// Cloneable handle for queueing frames to the rendezvous service.
#[derive(Debug, Clone)]
pub struct SignalSender {
    tx: mpsc::UnboundedSender<Outgoing>,
}

impl SignalSender {
    /// Sender paired with the receiving end of its queue, for callers that drain
    /// frames themselves.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Outgoing>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn send(&self, frame: ClientFrame) -> MeshResult<()> {
        self.tx
            .send(Outgoing::Frame(frame))
            .map_err(|_| MeshError::ChannelClosed)
    }

    pub fn close(&self) {
        let _ = self.tx.send(Outgoing::Close);
    }
}

/// WebSocket connection to the rendezvous service for one session.
pub struct SignalingClient {
    sender: SignalSender,
    writer: Mutex<Option<JoinHandle<()>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl SignalingClient {
    /// Opens the signaling socket. Inbound frames are parsed and delivered on the
    /// returned receiver; it closes when the socket does.
    pub async fn connect(
        signaller_url: &str,
        session_id: &str,
    ) -> MeshResult<(Self, mpsc::UnboundedReceiver<ServerFrame>)> {
        let websocket_url = derive_websocket_url(signaller_url, session_id)?;
        let (ws_stream, _) = connect_async(websocket_url.as_str())
            .await
            .map_err(|err| MeshError::Setup(format!("websocket connect failed: {err}")))?;
        tracing::debug!(
            target: "mesh::signaling",
            url = %websocket_url,
            "signaling websocket connected"
        );
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let (sender, mut send_rx) = SignalSender::channel();
        let (frames_tx, frames_rx) = mpsc::unbounded_channel::<ServerFrame>();

        let writer = tokio::spawn(async move {
            while let Some(outgoing) = send_rx.recv().await {
                match outgoing {
                    Outgoing::Frame(frame) => {
                        let text = match serde_json::to_string(&frame) {
                            Ok(text) => text,
                            Err(err) => {
                                tracing::warn!(target: "mesh::signaling", error = %err, "encode frame");
                                continue;
                            }
                        };
                        if ws_write.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Outgoing::Close => {
                        let _ = ws_write.close().await;
                        break;
                    }
                }
            }
            tracing::debug!(target: "mesh::signaling", "writer task finished");
        });

        let reader = tokio::spawn(async move {
            while let Some(message) = ws_read.next().await {
                let text = match message {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Binary(data)) => match String::from_utf8(data) {
                        Ok(text) => text,
                        Err(_) => continue,
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => {
                        match &err {
                            WsError::ConnectionClosed
                            | WsError::AlreadyClosed
                            | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                                tracing::debug!(target: "mesh::signaling", "signaling websocket closed: {err}");
                            }
                            _ => {
                                tracing::warn!(target: "mesh::signaling", "signaling websocket error: {err}");
                            }
                        }
                        break;
                    }
                };
                tracing::trace!(target: "mesh::signaling", len = text.len(), "frame in");
                match ServerFrame::parse(&text) {
                    Ok(frame) => {
                        if frames_tx.send(frame).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        tracing::warn!(
                            target: "mesh::signaling",
                            error = %err,
                            frame = %text,
                            "unparseable signaling frame"
                        );
                    }
                }
            }
        });

        Ok((
            Self {
                sender,
                writer: Mutex::new(Some(writer)),
                reader: Mutex::new(Some(reader)),
            },
            frames_rx,
        ))
    }

    pub fn sender(&self) -> SignalSender {
        self.sender.clone()
    }

    /// Closes the socket after queued frames are written.
    pub async fn shutdown(&self) {
        self.sender.close();
        let writer = self.writer.lock().take();
        if let Some(writer) = writer {
            if tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, writer).await.is_err() {
                tracing::debug!(target: "mesh::signaling", "writer did not flush before timeout");
            }
        }
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        for task in [self.writer.get_mut().take(), self.reader.get_mut().take()]
            .into_iter()
            .flatten()
        {
            task.abort();
        }
    }
}

/// `http(s)://host/path` → `ws(s)://host/path?sessionId=<id>`.
fn derive_websocket_url(signaller_url: &str, session_id: &str) -> MeshResult<Url> {
    let mut url = Url::parse(signaller_url).map_err(|err| {
        MeshError::Setup(format!("invalid signaller url {signaller_url}: {err}"))
    })?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(MeshError::Setup(format!(
                "unsupported signaller scheme: {other}"
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| MeshError::Setup("invalid websocket scheme".into()))?;
    url.query_pairs_mut()
        .append_pair(SESSION_QUERY_PARAM, session_id);
    Ok(url)
}
