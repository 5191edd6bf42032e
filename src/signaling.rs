//! Wire protocol spoken between clients and the relay, and the client side
//! of the WebSocket connection.
//!
//! Every frame is a JSON object of the form `{"event": "<name>", "data": {..}}`.
//! Messages a client sends are [`ClientMessage`]s and carry the recipient in
//! `to`; the relay rewrites them into [`ServerMessage`]s carrying the sender
//! in `from`.

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Relay-assigned participant identifier.
pub type PeerId = String;

const CHANNEL_CAPACITY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Pranswer,
    Answer,
    Rollback,
}

/// Session description in the shape browsers exchange: `{type, sdp}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }

    pub fn rollback() -> Self {
        Self {
            sdp_type: SdpType::Rollback,
            sdp: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            ..Default::default()
        }
    }
}

/// Payload of `room:join`, echoed back by the relay as the join ack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRequest {
    pub email: String,
    pub room: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientMessage {
    #[serde(rename = "room:join")]
    JoinRoom(JoinRequest),
    #[serde(rename = "user:welcome")]
    Welcome {
        to: PeerId,
        email: String,
        #[serde(default)]
        name: String,
    },
    #[serde(rename = "user:call")]
    Call {
        to: PeerId,
        offer: SessionDescription,
        #[serde(default)]
        name: String,
    },
    #[serde(rename = "call:accepted")]
    CallAccepted {
        to: PeerId,
        ans: SessionDescription,
        #[serde(default)]
        name: String,
    },
    #[serde(rename = "peer:nego:needed")]
    NegoNeeded {
        to: PeerId,
        offer: SessionDescription,
    },
    #[serde(rename = "peer:nego:done")]
    NegoDone { to: PeerId, ans: SessionDescription },
    #[serde(rename = "peer:ice-candidate")]
    IceCandidate { to: PeerId, candidate: IceCandidate },
    #[serde(rename = "user:toggle-audio", rename_all = "camelCase")]
    ToggleAudio { room: String, is_muted: bool },
    #[serde(rename = "user:toggle-video", rename_all = "camelCase")]
    ToggleVideo { room: String, is_video_off: bool },
    #[serde(rename = "call:ended")]
    CallEnded { to: PeerId },
}

impl ClientMessage {
    pub fn event_name(&self) -> &'static str {
        match self {
            ClientMessage::JoinRoom(_) => "room:join",
            ClientMessage::Welcome { .. } => "user:welcome",
            ClientMessage::Call { .. } => "user:call",
            ClientMessage::CallAccepted { .. } => "call:accepted",
            ClientMessage::NegoNeeded { .. } => "peer:nego:needed",
            ClientMessage::NegoDone { .. } => "peer:nego:done",
            ClientMessage::IceCandidate { .. } => "peer:ice-candidate",
            ClientMessage::ToggleAudio { .. } => "user:toggle-audio",
            ClientMessage::ToggleVideo { .. } => "user:toggle-video",
            ClientMessage::CallEnded { .. } => "call:ended",
        }
    }

    /// Recipient of a directed message; `None` for room-level requests.
    pub fn recipient(&self) -> Option<&str> {
        match self {
            ClientMessage::Welcome { to, .. }
            | ClientMessage::Call { to, .. }
            | ClientMessage::CallAccepted { to, .. }
            | ClientMessage::NegoNeeded { to, .. }
            | ClientMessage::NegoDone { to, .. }
            | ClientMessage::IceCandidate { to, .. }
            | ClientMessage::CallEnded { to } => Some(to),
            ClientMessage::JoinRoom(_)
            | ClientMessage::ToggleAudio { .. }
            | ClientMessage::ToggleVideo { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerMessage {
    /// First frame on every connection: the id the relay assigned.
    #[serde(rename = "session:ready")]
    Ready { id: PeerId },
    #[serde(rename = "room:join")]
    Joined(JoinRequest),
    #[serde(rename = "room:full")]
    RoomFull { room: String },
    #[serde(rename = "user:joined")]
    UserJoined {
        email: String,
        id: PeerId,
        #[serde(default)]
        name: String,
    },
    #[serde(rename = "user:welcome")]
    Welcome {
        from: PeerId,
        email: String,
        #[serde(default)]
        name: String,
    },
    #[serde(rename = "user:call")]
    IncomingCall {
        from: PeerId,
        offer: SessionDescription,
        #[serde(default)]
        name: String,
    },
    #[serde(rename = "call:accepted")]
    CallAccepted {
        from: PeerId,
        ans: SessionDescription,
        #[serde(default)]
        name: String,
    },
    #[serde(rename = "peer:nego:needed")]
    NegoNeeded {
        from: PeerId,
        offer: SessionDescription,
    },
    #[serde(rename = "peer:nego:final")]
    NegoFinal { from: PeerId, ans: SessionDescription },
    #[serde(rename = "peer:ice-candidate")]
    IceCandidate {
        from: PeerId,
        candidate: IceCandidate,
    },
    #[serde(rename = "user:toggled-audio", rename_all = "camelCase")]
    ToggledAudio { id: PeerId, is_muted: bool },
    #[serde(rename = "user:toggled-video", rename_all = "camelCase")]
    ToggledVideo { id: PeerId, is_video_off: bool },
    #[serde(rename = "call:ended")]
    CallEnded { from: PeerId },
    #[serde(rename = "user:left")]
    UserLeft { id: PeerId },
}

impl ServerMessage {
    pub fn event_name(&self) -> &'static str {
        match self {
            ServerMessage::Ready { .. } => "session:ready",
            ServerMessage::Joined(_) => "room:join",
            ServerMessage::RoomFull { .. } => "room:full",
            ServerMessage::UserJoined { .. } => "user:joined",
            ServerMessage::Welcome { .. } => "user:welcome",
            ServerMessage::IncomingCall { .. } => "user:call",
            ServerMessage::CallAccepted { .. } => "call:accepted",
            ServerMessage::NegoNeeded { .. } => "peer:nego:needed",
            ServerMessage::NegoFinal { .. } => "peer:nego:final",
            ServerMessage::IceCandidate { .. } => "peer:ice-candidate",
            ServerMessage::ToggledAudio { .. } => "user:toggled-audio",
            ServerMessage::ToggledVideo { .. } => "user:toggled-video",
            ServerMessage::CallEnded { .. } => "call:ended",
            ServerMessage::UserLeft { .. } => "user:left",
        }
    }
}

/// Parses one text frame, mapping decode failures to [`Error::MalformedMessage`].
pub fn decode<T: serde::de::DeserializeOwned>(frame: &str) -> Result<T> {
    serde_json::from_str(frame).map_err(|e| Error::MalformedMessage(e.to_string()))
}

/// WebSocket connection to the relay.
///
/// Reading and writing run on their own tasks; the client only holds the two
/// channel ends, so it can be split and handed to the session loop.
pub struct SignalingClient {
    tx: mpsc::Sender<ClientMessage>,
    rx: mpsc::Receiver<ServerMessage>,
}

impl SignalingClient {
    pub async fn connect(url: &str) -> Result<Self> {
        let (ws_stream, _) = connect_async(url).await?;
        info!("Connected to relay at {}", url);
        let (mut write, mut read) = ws_stream.split();

        let (incoming_tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (tx, mut outgoing_rx) = mpsc::channel::<ClientMessage>(CHANNEL_CAPACITY);

        // Handle outgoing messages
        tokio::spawn(async move {
            while let Some(msg) = outgoing_rx.recv().await {
                let json = match serde_json::to_string(&msg) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!("Failed to encode {}: {}", msg.event_name(), e);
                        continue;
                    }
                };
                if let Err(e) = write.send(Message::Text(json)).await {
                    warn!("Relay write failed: {}", e);
                    break;
                }
            }
            let _ = write.close().await;
        });

        // Handle incoming messages
        tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        warn!("Relay read failed: {}", e);
                        break;
                    }
                };
                match decode::<ServerMessage>(&text) {
                    Ok(msg) => {
                        debug!("<- {}", msg.event_name());
                        if incoming_tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("Ignoring relay frame: {}", e),
                }
            }
            info!("Relay connection closed");
        });

        Ok(Self { tx, rx })
    }

    pub async fn send(&self, msg: ClientMessage) -> Result<()> {
        self.tx
            .send(msg)
            .await
            .map_err(|e| Error::Signaling(format!("Failed to send message: {}", e)))
    }

    pub async fn receive(&mut self) -> Option<ServerMessage> {
        self.rx.recv().await
    }

    /// Separates the outbound sender from the inbound stream.
    pub fn split(self) -> (mpsc::Sender<ClientMessage>, mpsc::Receiver<ServerMessage>) {
        (self.tx, self.rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_call_wire_shape() {
        let msg = ClientMessage::Call {
            to: "b".to_string(),
            offer: SessionDescription::offer("v=0"),
            name: "Alice".to_string(),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({
                "event": "user:call",
                "data": {"to": "b", "offer": {"type": "offer", "sdp": "v=0"}, "name": "Alice"}
            })
        );
    }

    #[test]
    fn test_toggle_fields_are_camel_case() {
        let msg = ClientMessage::ToggleVideo {
            room: "r1".to_string(),
            is_video_off: true,
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["data"]["isVideoOff"], json!(true));

        let delivered: ServerMessage = decode(
            r#"{"event":"user:toggled-audio","data":{"id":"a","isMuted":true}}"#,
        )
        .unwrap();
        assert_eq!(
            delivered,
            ServerMessage::ToggledAudio {
                id: "a".to_string(),
                is_muted: true
            }
        );
    }

    #[test]
    fn test_browser_candidate_decodes() {
        let msg: ServerMessage = decode(
            r#"{"event":"peer:ice-candidate","data":{"from":"a","candidate":{
                "candidate":"candidate:1 1 udp 2130706431 10.0.0.2 50000 typ host",
                "sdpMid":"0","sdpMLineIndex":0,"usernameFragment":null}}}"#,
        )
        .unwrap();
        match msg {
            ServerMessage::IceCandidate { from, candidate } => {
                assert_eq!(from, "a");
                assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
                assert_eq!(candidate.sdp_mline_index, Some(0));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_join_without_name_defaults_to_empty() {
        let msg: ClientMessage =
            decode(r#"{"event":"room:join","data":{"email":"a@x.io","room":"r1"}}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::JoinRoom(JoinRequest {
                email: "a@x.io".to_string(),
                room: "r1".to_string(),
                name: String::new(),
            })
        );
    }

    #[test]
    fn test_unknown_event_is_malformed() {
        let err = decode::<ClientMessage>(r#"{"event":"room:destroy","data":{}}"#).unwrap_err();
        assert!(matches!(err, Error::MalformedMessage(_)));
    }

    #[test]
    fn test_recipient() {
        let msg = ClientMessage::NegoDone {
            to: "c".to_string(),
            ans: SessionDescription::answer("v=0"),
        };
        assert_eq!(msg.recipient(), Some("c"));
        assert_eq!(msg.event_name(), "peer:nego:done");

        let msg = ClientMessage::ToggleAudio {
            room: "r1".to_string(),
            is_muted: false,
        };
        assert_eq!(msg.recipient(), None);
    }
}
