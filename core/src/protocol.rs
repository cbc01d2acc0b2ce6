//! Signalling wire protocol — typed events and JSON framing
//!
//! Every frame is a JSON text message `{"event": <name>, "data": <payload>}`.
//! Each event kind has exactly one payload schema. Clients address events
//! with `recipientName`; the relay delivers them with `senderName` in its
//! place and the payload untouched.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Session descriptions and ICE candidates travel through the relay as
/// opaque JSON; only the endpoints interpret them.
pub type OpaquePayload = Value;

/// Answer to a chat request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatResponse {
    Accept,
    Reject,
}

/// Events a client sends to the relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    /// Ask a peer to start a conversation
    #[serde(rename_all = "camelCase")]
    ChatRequest { recipient_name: String },
    /// Withdraw an outstanding chat request
    #[serde(rename_all = "camelCase")]
    ChatRequestCancelled { recipient_name: String },
    /// Accept or reject a peer's request
    #[serde(rename_all = "camelCase")]
    ChatResponse {
        recipient_name: String,
        response: ChatResponse,
    },
    #[serde(rename_all = "camelCase")]
    RtcOffer {
        recipient_name: String,
        offer: OpaquePayload,
    },
    #[serde(rename_all = "camelCase")]
    RtcAnswer {
        recipient_name: String,
        answer: OpaquePayload,
    },
    #[serde(rename = "rtc-icecandidate", rename_all = "camelCase")]
    RtcIceCandidate {
        recipient_name: String,
        ice_candidate: OpaquePayload,
    },
}

/// Events the relay sends to a client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    /// The pseudonym for this connection, sent once
    AssignName(String),
    /// Current presence list, sent on every presence change
    UserList(Vec<String>),
    #[serde(rename_all = "camelCase")]
    ChatRequest { sender_name: String },
    #[serde(rename_all = "camelCase")]
    ChatRequestCancelled { sender_name: String },
    #[serde(rename_all = "camelCase")]
    ChatResponse {
        sender_name: String,
        response: ChatResponse,
    },
    #[serde(rename_all = "camelCase")]
    RtcOffer {
        sender_name: String,
        offer: OpaquePayload,
    },
    #[serde(rename_all = "camelCase")]
    RtcAnswer {
        sender_name: String,
        answer: OpaquePayload,
    },
    #[serde(rename = "rtc-icecandidate", rename_all = "camelCase")]
    RtcIceCandidate {
        sender_name: String,
        ice_candidate: OpaquePayload,
    },
    /// The addressed recipient is not connected
    PeerNotFound(String),
    /// The sender exceeded its event budget; the event was dropped
    #[serde(rename_all = "camelCase")]
    Blocked { retry_after_ms: u64 },
}

/// Wire protocol errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
}

impl ClientEvent {
    /// Parse a client frame
    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }

    /// Encode as a JSON text frame
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Name of the addressed peer
    pub fn recipient_name(&self) -> &str {
        match self {
            ClientEvent::ChatRequest { recipient_name }
            | ClientEvent::ChatRequestCancelled { recipient_name }
            | ClientEvent::ChatResponse { recipient_name, .. }
            | ClientEvent::RtcOffer { recipient_name, .. }
            | ClientEvent::RtcAnswer { recipient_name, .. }
            | ClientEvent::RtcIceCandidate { recipient_name, .. } => recipient_name,
        }
    }

    /// Re-address this event for delivery: the recipient name is replaced
    /// by the sender's and the payload is moved across unchanged.
    pub fn into_delivery(self, sender_name: String) -> ServerEvent {
        match self {
            ClientEvent::ChatRequest { .. } => ServerEvent::ChatRequest { sender_name },
            ClientEvent::ChatRequestCancelled { .. } => {
                ServerEvent::ChatRequestCancelled { sender_name }
            }
            ClientEvent::ChatResponse { response, .. } => ServerEvent::ChatResponse {
                sender_name,
                response,
            },
            ClientEvent::RtcOffer { offer, .. } => ServerEvent::RtcOffer { sender_name, offer },
            ClientEvent::RtcAnswer { answer, .. } => ServerEvent::RtcAnswer {
                sender_name,
                answer,
            },
            ClientEvent::RtcIceCandidate { ice_candidate, .. } => ServerEvent::RtcIceCandidate {
                sender_name,
                ice_candidate,
            },
        }
    }

    /// Wire name of the event
    pub fn event_name(&self) -> &'static str {
        match self {
            ClientEvent::ChatRequest { .. } => "chat-request",
            ClientEvent::ChatRequestCancelled { .. } => "chat-request-cancelled",
            ClientEvent::ChatResponse { .. } => "chat-response",
            ClientEvent::RtcOffer { .. } => "rtc-offer",
            ClientEvent::RtcAnswer { .. } => "rtc-answer",
            ClientEvent::RtcIceCandidate { .. } => "rtc-icecandidate",
        }
    }
}

impl ServerEvent {
    /// Parse a server frame
    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }

    /// Encode as a JSON text frame
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Wire name of the event
    pub fn event_name(&self) -> &'static str {
        match self {
            ServerEvent::AssignName(_) => "assign-name",
            ServerEvent::UserList(_) => "user-list",
            ServerEvent::ChatRequest { .. } => "chat-request",
            ServerEvent::ChatRequestCancelled { .. } => "chat-request-cancelled",
            ServerEvent::ChatResponse { .. } => "chat-response",
            ServerEvent::RtcOffer { .. } => "rtc-offer",
            ServerEvent::RtcAnswer { .. } => "rtc-answer",
            ServerEvent::RtcIceCandidate { .. } => "rtc-icecandidate",
            ServerEvent::PeerNotFound(_) => "peer-not-found",
            ServerEvent::Blocked { .. } => "blocked",
        }
    }
}

/// SDP type of a session description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// Offer or answer as produced by the browser (`RTCSessionDescriptionInit`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    #[serde(default)]
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

    pub fn from_payload(payload: OpaquePayload) -> Result<Self, ProtocolError> {
        serde_json::from_value(payload)
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }

    pub fn to_payload(&self) -> Result<OpaquePayload, ProtocolError> {
        serde_json::to_value(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }
}

/// A remote network path descriptor (`RTCIceCandidateInit`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex", skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
            username_fragment: None,
        }
    }

    pub fn from_payload(payload: OpaquePayload) -> Result<Self, ProtocolError> {
        serde_json::from_value(payload)
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }

    pub fn to_payload(&self) -> Result<OpaquePayload, ProtocolError> {
        serde_json::to_value(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_event_wire_shape() {
        let event = ClientEvent::ChatResponse {
            recipient_name: "B".to_string(),
            response: ChatResponse::Accept,
        };
        let value: Value = serde_json::from_str(&event.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"event": "chat-response", "data": {"recipientName": "B", "response": "accept"}})
        );
    }

    #[test]
    fn test_ice_candidate_event_name() {
        let text = r#"{"event":"rtc-icecandidate","data":{"recipientName":"B","iceCandidate":{"candidate":"c1"}}}"#;
        let event = ClientEvent::from_json(text).expect("Failed to parse");
        assert_eq!(event.event_name(), "rtc-icecandidate");
        assert_eq!(event.recipient_name(), "B");
    }

    #[test]
    fn test_newtype_server_events() {
        let assign = ServerEvent::AssignName("quiet-heron".to_string());
        assert_eq!(
            assign.to_json().unwrap(),
            r#"{"event":"assign-name","data":"quiet-heron"}"#
        );

        let not_found = ServerEvent::from_json(r#"{"event":"peer-not-found","data":"ghost"}"#)
            .expect("Failed to parse");
        assert_eq!(not_found, ServerEvent::PeerNotFound("ghost".to_string()));
    }

    #[test]
    fn test_blocked_payload() {
        let blocked = ServerEvent::Blocked { retry_after_ms: 250 };
        let value: Value = serde_json::from_str(&blocked.to_json().unwrap()).unwrap();
        assert_eq!(value["data"]["retryAfterMs"], 250);
    }

    #[test]
    fn test_delivery_keeps_payload_untouched() {
        let offer = json!({"type": "offer", "sdp": "v=0", "x-vendor": {"nested": [1, 2]}});
        let event = ClientEvent::RtcOffer {
            recipient_name: "B".to_string(),
            offer: offer.clone(),
        };

        match event.into_delivery("A".to_string()) {
            ServerEvent::RtcOffer {
                sender_name,
                offer: delivered,
            } => {
                assert_eq!(sender_name, "A");
                assert_eq!(delivered, offer);
            }
            other => panic!("Wrong event: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_event_rejected() {
        let result = ClientEvent::from_json(r#"{"event":"assign-name","data":"me"}"#);
        assert!(result.is_err());

        let result = ClientEvent::from_json("not json");
        assert!(result.is_err());
    }

    #[test]
    fn test_browser_candidate_shape() {
        let payload = json!({
            "candidate": "candidate:1 1 udp 2122260223 10.0.0.2 54321 typ host",
            "sdpMid": "0",
            "sdpMLineIndex": 0,
            "usernameFragment": "abcd"
        });
        let candidate = IceCandidate::from_payload(payload.clone()).expect("Failed to parse");
        assert_eq!(candidate.sdp_m_line_index, Some(0));
        assert_eq!(candidate.to_payload().unwrap(), payload);
    }

    #[test]
    fn test_session_description_shape() {
        let desc = SessionDescription::from_payload(json!({"type": "answer", "sdp": "v=0"}))
            .expect("Failed to parse");
        assert_eq!(desc, SessionDescription::answer("v=0"));
    }
}
