//! Transport seam of the event channel.
//!
//! The manager talks to a [`SocketTransport`] rather than a concrete socket,
//! so the reconnect policy can be exercised against a mock. The production
//! implementation speaks a small JSON frame protocol over WebSocket:
//! the client sends `auth`/`subscribe`/`unsubscribe` frames, the server
//! answers with `auth`/`ack` frames and pushes `event` frames.

use futures_util::{SinkExt, StreamExt};
use log::{debug, warn};
#[cfg(feature = "mock")]
use mockall::automock;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{self, Message},
};
use trait_variant::make;

use crate::config::SocketConfig;

#[derive(Debug, Error)]
pub enum SocketError {
    /// The token was rejected; reconnecting with the same credentials is
    /// pointless, the caller must refresh and connect again
    #[error("authentication rejected: {0}")]
    Auth(String),

    #[error("connection failed: {0}")]
    Transport(String),
}

impl SocketError {
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth(_))
    }
}

/// Frames the client sends
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Auth { token: String },
    Subscribe { id: u64, topic: String },
    Unsubscribe { topic: String },
    // Transport-internal reply to a ping; never serialized as JSON
    #[serde(skip)]
    Pong(Vec<u8>),
}

/// Frames the server sends, already stripped of transport concerns
#[derive(Clone, Debug, PartialEq)]
pub enum ServerFrame {
    Event { name: String, data: serde_json::Value },
    Ack { id: u64, ok: bool, error: Option<String> },
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireFrame {
    Auth {
        ok: bool,
        #[serde(default)]
        error: Option<String>,
    },
    Ack {
        id: u64,
        ok: bool,
        #[serde(default)]
        error: Option<String>,
    },
    Event {
        event: String,
        data: serde_json::Value,
    },
}

/// An open channel connection: a sink for client frames and a stream of
/// server frames. The incoming side closing means the connection is gone.
pub struct Connection {
    pub outgoing: mpsc::Sender<ClientFrame>,
    pub incoming: mpsc::Receiver<ServerFrame>,
}

#[make(Send + Sync)]
#[cfg_attr(feature = "mock", automock)]
pub trait SocketTransport {
    async fn open(&self, url: &str, access_token: &str) -> Result<Connection, SocketError>;
}

/// WebSocket transport over tokio-tungstenite
#[derive(Clone, Debug)]
pub struct WsTransport {
    connect_timeout: Duration,
}

impl WsTransport {
    pub fn new(config: &SocketConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout,
        }
    }
}

impl SocketTransport for WsTransport {
    async fn open(&self, url: &str, access_token: &str) -> Result<Connection, SocketError> {
        let (mut ws, _response) = tokio::time::timeout(self.connect_timeout, connect_async(url))
            .await
            .map_err(|_| SocketError::Transport("connect timed out".to_string()))?
            .map_err(classify_connect_error)?;

        authenticate(&mut ws, access_token, self.connect_timeout).await?;

        let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<ClientFrame>(64);
        let (incoming_tx, incoming_rx) = mpsc::channel::<ServerFrame>(64);
        let (mut sink, mut stream) = ws.split();

        tokio::spawn(async move {
            while let Some(frame) = outgoing_rx.recv().await {
                let message = match frame {
                    ClientFrame::Pong(payload) => Message::Pong(payload),
                    frame => match serde_json::to_string(&frame) {
                        Ok(json) => Message::Text(json),
                        Err(e) => {
                            warn!("failed to serialize client frame: {e}");
                            continue;
                        }
                    },
                };
                if let Err(e) = sink.send(message).await {
                    debug!("socket send failed: {e}");
                    break;
                }
            }
        });

        let pong_tx = outgoing_tx.clone();
        tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                match message {
                    Ok(Message::Text(text)) => match serde_json::from_str::<WireFrame>(&text) {
                        Ok(WireFrame::Event { event, data }) => {
                            if incoming_tx
                                .send(ServerFrame::Event { name: event, data })
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                        Ok(WireFrame::Ack { id, ok, error }) => {
                            if incoming_tx
                                .send(ServerFrame::Ack { id, ok, error })
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                        // Auth frames only occur during the handshake
                        Ok(WireFrame::Auth { .. }) => {}
                        Err(e) => warn!("dropping unparseable server frame: {e}"),
                    },
                    Ok(Message::Ping(payload)) => {
                        let _ = pong_tx.send(ClientFrame::Pong(payload)).await;
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
            // incoming_tx drops here; the manager observes the closed channel
        });

        Ok(Connection {
            outgoing: outgoing_tx,
            incoming: incoming_rx,
        })
    }
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Send the auth frame and wait for the server's verdict
async fn authenticate(
    ws: &mut WsStream,
    access_token: &str,
    timeout: Duration,
) -> Result<(), SocketError> {
    let auth = serde_json::to_string(&ClientFrame::Auth {
        token: access_token.to_string(),
    })
    .map_err(|e| SocketError::Transport(format!("failed to serialize auth frame: {e}")))?;

    ws.send(Message::Text(auth))
        .await
        .map_err(|e| SocketError::Transport(format!("auth send failed: {e}")))?;

    let verdict = tokio::time::timeout(timeout, async {
        while let Some(message) = ws.next().await {
            match message {
                Ok(Message::Text(text)) => {
                    if let Ok(WireFrame::Auth { ok, error }) = serde_json::from_str(&text) {
                        return Some((ok, error));
                    }
                }
                Ok(_) => {}
                Err(_) => return None,
            }
        }
        None
    })
    .await
    .map_err(|_| SocketError::Transport("timed out waiting for auth reply".to_string()))?;

    match verdict {
        Some((true, _)) => Ok(()),
        Some((false, error)) => Err(SocketError::Auth(
            error.unwrap_or_else(|| "token rejected".to_string()),
        )),
        None => Err(SocketError::Transport(
            "connection closed during auth".to_string(),
        )),
    }
}

fn classify_connect_error(error: tungstenite::Error) -> SocketError {
    match error {
        tungstenite::Error::Http(response)
            if response.status() == tungstenite::http::StatusCode::UNAUTHORIZED
                || response.status() == tungstenite::http::StatusCode::FORBIDDEN =>
        {
            SocketError::Auth(format!("handshake rejected: HTTP {}", response.status()))
        }
        other => SocketError::Transport(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn client_frames_serialize_to_tagged_json() {
        let frame = ClientFrame::Subscribe {
            id: 3,
            topic: "ops".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({"type": "subscribe", "id": 3, "topic": "ops"})
        );
    }

    #[test]
    fn server_event_frame_parses() {
        let frame: WireFrame = serde_json::from_str(
            r#"{"type":"event","event":"incidents:new","data":{"id":"a"}}"#,
        )
        .unwrap();
        let WireFrame::Event { event, data } = frame else {
            panic!("wrong variant");
        };
        assert_eq!(event, "incidents:new");
        assert_eq!(data, json!({"id": "a"}));
    }

    #[test]
    fn ack_frame_parses_without_error_field() {
        let frame: WireFrame = serde_json::from_str(r#"{"type":"ack","id":1,"ok":true}"#).unwrap();
        let WireFrame::Ack { id, ok, error } = frame else {
            panic!("wrong variant");
        };
        assert_eq!((id, ok, error), (1, true, None));
    }
}
