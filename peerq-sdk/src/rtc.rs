//! The WebRTC engine seam.
//!
//! `PeerConnection`, `DataChannel`, and media tracks are platform
//! primitives: the SDK drives them through the traits below and never
//! links an engine itself. [`crate::loopback`] provides an in-process
//! implementation; embedders adapt webrtc-rs, a browser binding, or any
//! other engine by implementing these traits.
//!
//! Engine events flow through unbounded channels handed over once via
//! `take_events`; the owning peer session pumps them on its own task.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Default public STUN servers, used when the config names none.
pub const DEFAULT_STUN_SERVERS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

/// One ICE server entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }

    pub fn turn(
        url: impl Into<String>,
        username: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            urls: vec![url.into()],
            username: Some(username.into()),
            credential: Some(credential.into()),
        }
    }
}

/// Engine-level configuration for one peer connection.
#[derive(Debug, Clone)]
pub struct RtcConfig {
    pub ice_servers: Vec<IceServer>,
}

impl Default for RtcConfig {
    fn default() -> Self {
        Self {
            ice_servers: DEFAULT_STUN_SERVERS
                .iter()
                .map(|&url| IceServer::stun(url))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// A local or remote session description.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

/// An ICE candidate in the browser JSON shape, which is what travels
/// (string-serialized) inside `signal` payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Configuration for a data channel created on a session.
#[derive(Debug, Clone)]
pub struct DataChannelConfig {
    pub label: String,
    pub ordered: bool,
}

impl Default for DataChannelConfig {
    fn default() -> Self {
        Self {
            label: "extra".to_string(),
            ordered: true,
        }
    }
}

impl DataChannelConfig {
    pub fn ordered(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ordered: true,
        }
    }
}

/// An opaque media track handle forwarded to the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaTrack {
    pub id: String,
    pub kind: MediaTrackKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaTrackKind {
    Audio,
    Video,
}

/// A media stream: an id plus its tracks, all forwarded as-is.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaStream {
    pub id: String,
    pub tracks: Vec<MediaTrack>,
}

/// Events the engine reports for one peer connection.
pub enum PeerConnectionEvent {
    ConnectionState(PeerConnectionState),
    IceConnectionState(IceConnectionState),
    IceCandidate(IceCandidate),
    NegotiationNeeded,
    /// The remote side opened a data channel.
    DataChannel(Arc<dyn RtcDataChannel>),
}

/// Events the engine reports for one data channel.
#[derive(Debug, Clone)]
pub enum DataChannelEvent {
    Open,
    Close,
    Text(String),
    Binary(Vec<u8>),
    BufferedAmountLow,
}

#[async_trait]
pub trait RtcEngine: Send + Sync {
    async fn create_peer_connection(
        &self,
        config: &RtcConfig,
    ) -> Result<Arc<dyn RtcPeerConnection>, RtcError>;
}

#[async_trait]
pub trait RtcPeerConnection: Send + Sync {
    /// Hand over the event stream. Yields `Some` exactly once.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<PeerConnectionEvent>>;

    async fn create_offer(&self) -> Result<SessionDescription, RtcError>;
    async fn create_answer(&self) -> Result<SessionDescription, RtcError>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), RtcError>;
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), RtcError>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), RtcError>;

    async fn create_data_channel(
        &self,
        config: DataChannelConfig,
    ) -> Result<Arc<dyn RtcDataChannel>, RtcError>;

    async fn restart_ice(&self) -> Result<(), RtcError>;

    async fn add_track(&self, stream_id: &str, track: MediaTrack) -> Result<(), RtcError>;
    async fn remove_track(&self, stream_id: &str, track_id: &str) -> Result<(), RtcError>;

    fn connection_state(&self) -> PeerConnectionState;
    fn ice_connection_state(&self) -> IceConnectionState;

    async fn close(&self);
}

#[async_trait]
pub trait RtcDataChannel: Send + Sync {
    fn label(&self) -> String;
    fn ready_state(&self) -> DataChannelState;

    /// Hand over the event stream. Yields `Some` exactly once.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<DataChannelEvent>>;

    async fn send_text(&self, text: &str) -> Result<(), RtcError>;
    async fn send_binary(&self, data: &[u8]) -> Result<(), RtcError>;

    fn buffered_amount(&self) -> u64;
    fn set_buffered_amount_low_threshold(&self, threshold: u64);

    async fn close(&self);
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum RtcError {
    #[error("channel is not open")]
    NotOpen,
    #[error("peer connection is closed")]
    Closed,
    #[error("invalid session description: {0}")]
    InvalidDescription(String),
    #[error("engine error: {0}")]
    Engine(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidate_uses_browser_field_names() {
        let candidate = IceCandidate {
            candidate: "candidate:0 1 UDP 2122252543 192.0.2.1 54321 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        };
        let value = serde_json::to_value(&candidate).unwrap();
        assert!(value.get("sdpMid").is_some());
        assert!(value.get("sdpMLineIndex").is_some());
        assert!(value.get("usernameFragment").is_none());

        let back: IceCandidate = serde_json::from_value(value).unwrap();
        assert_eq!(back, candidate);
    }

    #[test]
    fn default_config_has_stun() {
        let config = RtcConfig::default();
        assert_eq!(config.ice_servers.len(), DEFAULT_STUN_SERVERS.len());
        assert!(config.ice_servers[0].urls[0].starts_with("stun:"));
    }
}
