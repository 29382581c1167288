//! Signaling wire protocol.
//!
//! Every frame on the signaling socket is one JSON envelope:
//!
//! ```json
//! { "type": "...", "from": "...", "to": "...", "namespace": "...",
//!   "payload": { }, "ts": 1712345678901 }
//! ```
//!
//! Payloads are schema-polymorphic: servers may send them pre-parsed or
//! as JSON strings, and [`Envelope::payload_as`] normalizes both forms.
//! Unknown message types deserialize to [`MessageType::Unknown`] and are
//! ignored by the dispatcher.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Register,
    Registered,
    Join,
    Leave,
    Signal,
    Discover,
    PeerList,
    Match,
    Matched,
    Relay,
    Broadcast,
    PeerJoined,
    PeerLeft,
    Metadata,
    Ping,
    Pong,
    Error,
    CreateRoom,
    RoomCreated,
    JoinRoom,
    RoomInfo,
    RoomClosed,
    Kick,
    #[serde(other)]
    Unknown,
}

/// One signaling frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<i64>,
}

impl Envelope {
    pub fn new(kind: MessageType) -> Self {
        Self {
            kind,
            from: None,
            to: None,
            namespace: None,
            payload: None,
            ts: None,
        }
    }

    pub fn with_to(mut self, to: impl Into<String>) -> Self {
        self.to = Some(to.into());
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn with_payload<T: Serialize>(mut self, payload: &T) -> Result<Self, ProtocolError> {
        self.payload = Some(serde_json::to_value(payload)?);
        Ok(self)
    }

    pub fn with_payload_value(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Parse one inbound text frame.
    pub fn parse(frame: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(frame)?)
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    /// The payload with string-encoded JSON unwrapped to a value.
    pub fn normalized_payload(&self) -> Option<Value> {
        normalize_payload(self.payload.clone())
    }

    /// Deserialize the (normalized) payload into a typed form.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        let payload = self
            .normalized_payload()
            .ok_or(ProtocolError::MissingPayload)?;
        Ok(serde_json::from_value(payload)?)
    }

    /// The human-readable message of an `error` frame, which arrives
    /// either as a bare string or as `{ "message": ... }`.
    pub fn error_message(&self) -> String {
        match self.normalized_payload() {
            Some(Value::String(s)) => s,
            Some(Value::Object(map)) => map
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown signaling error")
                .to_string(),
            _ => "unknown signaling error".to_string(),
        }
    }
}

/// Unwrap payloads that arrive as JSON-encoded strings.
pub fn normalize_payload(payload: Option<Value>) -> Option<Value> {
    match payload {
        Some(Value::String(s)) => match serde_json::from_str::<Value>(&s) {
            Ok(parsed @ (Value::Object(_) | Value::Array(_))) => Some(parsed),
            _ => Some(Value::String(s)),
        },
        other => other,
    }
}

// ── Payload bodies ─────────────────────────────────────────────────

/// A peer as reported by discover/join/match and `peer_joined`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub fingerprint: String,
    #[serde(default)]
    pub alias: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterPayload {
    pub public_key: String,
    pub alias: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisteredPayload {
    pub fingerprint: String,
    #[serde(default)]
    pub alias: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinPayload {
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeavePayload {
    pub namespace: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoverPayload {
    pub namespace: String,
    pub limit: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerListPayload {
    pub namespace: String,
    #[serde(default)]
    pub peers: Vec<PeerInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalType {
    Offer,
    Answer,
    Candidate,
}

/// The opaque body of a `signal` frame. The ICE candidate is carried
/// JSON-serialized as a string, matching the wire contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalPayload {
    pub signal_type: SignalType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchPayload {
    pub namespace: String,
    pub criteria: Value,
    pub group_size: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchedPayload {
    pub namespace: String,
    pub session_id: String,
    #[serde(default)]
    pub peers: Vec<PeerInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastPayload {
    pub namespace: String,
    pub data: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataPayload {
    pub meta: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRoomPayload {
    pub room_id: String,
    pub max_size: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomCreatedPayload {
    pub room_id: String,
    pub max_size: u32,
    pub owner: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinRoomPayload {
    pub room_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomInfoPayload {
    pub room_id: String,
    pub peer_count: u32,
    pub max_size: u32,
    pub owner: String,
}

/// Outbound owner form carries the target fingerprint; the inbound
/// server→target form only names the room.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KickPayload {
    pub room_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame has no payload")]
    MissingPayload,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_roundtrip() {
        let env = Envelope::new(MessageType::Join)
            .with_namespace("lobby")
            .with_payload(&JoinPayload {
                namespace: "lobby".into(),
                app_type: None,
                version: None,
            })
            .unwrap();
        let text = env.encode().unwrap();
        assert!(text.contains("\"type\":\"join\""));

        let parsed = Envelope::parse(&text).unwrap();
        assert_eq!(parsed.kind, MessageType::Join);
        let body: JoinPayload = parsed.payload_as().unwrap();
        assert_eq!(body.namespace, "lobby");
    }

    #[test]
    fn unknown_type_is_tolerated() {
        let parsed =
            Envelope::parse(r#"{"type":"totally_new_thing","payload":{"x":1}}"#).unwrap();
        assert_eq!(parsed.kind, MessageType::Unknown);
    }

    #[test]
    fn string_payload_is_normalized() {
        let parsed = Envelope::parse(
            r#"{"type":"peer_list","payload":"{\"namespace\":\"ns\",\"peers\":[]}"}"#,
        )
        .unwrap();
        let body: PeerListPayload = parsed.payload_as().unwrap();
        assert_eq!(body.namespace, "ns");
        assert!(body.peers.is_empty());
    }

    #[test]
    fn plain_string_payload_stays_a_string() {
        let parsed =
            Envelope::parse(r#"{"type":"error","payload":"room is full"}"#).unwrap();
        assert_eq!(parsed.error_message(), "room is full");
    }

    #[test]
    fn object_error_payload() {
        let parsed =
            Envelope::parse(r#"{"type":"error","payload":{"message":"bad key"}}"#).unwrap();
        assert_eq!(parsed.error_message(), "bad key");
    }

    #[test]
    fn signal_payload_carries_candidate_as_string() {
        let payload = SignalPayload {
            signal_type: SignalType::Candidate,
            sdp: None,
            candidate: Some(r#"{"candidate":"candidate:1 1 udp ...","sdpMid":"0"}"#.into()),
        };
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["signal_type"], "candidate");
        assert!(value["candidate"].is_string());
        assert!(value.get("sdp").is_none());
    }
}
