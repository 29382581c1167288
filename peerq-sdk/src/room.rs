//! Room abstractions: "send over P2P when possible, fall back to
//! server relay", packaged behind a single `send` contract.
//!
//! [`DirectRoom`] binds exactly one remote peer (max size 2).
//! [`GroupRoom`] keeps up to [`RELAY_THRESHOLD`] peers on direct
//! connections and parks the rest in a relay set, promoting them as
//! direct slots free up.
//!
//! Relay fallback frames are addressed `{ "_room": <room-id>, "data": … }`
//! so receivers can route them to the right room. P2P frames carrying
//! subsystem markers (`_ft`, `_sync`) belong to the transfer and sync
//! layers and are not surfaced as room data.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde_json::{Value, json};

use crate::client::{Client, ClientEvent, ClientEventKind};
use crate::emitter::{BusEvent, Emitter};
use crate::error::Error;
use crate::peer::{DataPayload, PeerEvent, PeerEventKind, PeerSession};
use crate::protocol::{PeerInfo, RoomCreatedPayload};
use crate::rtc::PeerConnectionState;

/// P2P fan-out cap for a group room; peers beyond it use relay.
pub const RELAY_THRESHOLD: usize = 10;

#[derive(Debug, Clone)]
pub enum RoomEvent {
    PeerJoined(PeerInfo),
    PeerLeft(String),
    /// A direct connection to this peer became usable.
    PeerConnected(String),
    Data { from: String, data: Value },
    Closed,
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoomEventKind {
    PeerJoined,
    PeerLeft,
    PeerConnected,
    Data,
    Closed,
    Error,
}

impl BusEvent for RoomEvent {
    type Kind = RoomEventKind;

    fn kind(&self) -> RoomEventKind {
        match self {
            RoomEvent::PeerJoined(_) => RoomEventKind::PeerJoined,
            RoomEvent::PeerLeft(_) => RoomEventKind::PeerLeft,
            RoomEvent::PeerConnected(_) => RoomEventKind::PeerConnected,
            RoomEvent::Data { .. } => RoomEventKind::Data,
            RoomEvent::Closed => RoomEventKind::Closed,
            RoomEvent::Error(_) => RoomEventKind::Error,
        }
    }
}

/// True for frames owned by the transfer or sync subsystems.
fn is_subsystem_frame(value: &Value) -> bool {
    value.get("_ft").is_some() || value.get("_sync").is_some() || value.get("_osr").is_some()
}

fn relay_frame(room_id: &str, data: &Value) -> Value {
    json!({ "_room": room_id, "data": data })
}

// ── DirectRoom ─────────────────────────────────────────────────────

/// A 1:1 room: one bound remote peer, P2P preferred, relay fallback.
#[derive(Clone)]
pub struct DirectRoom {
    inner: Arc<DirectInner>,
}

struct DirectInner {
    client: Client,
    room_id: String,
    remote: Mutex<Option<String>>,
    events: Emitter<RoomEvent>,
    closed: AtomicBool,
}

impl DirectRoom {
    pub fn new(client: Client, room_id: impl Into<String>) -> Self {
        let inner = Arc::new(DirectInner {
            client,
            room_id: room_id.into(),
            remote: Mutex::new(None),
            events: Emitter::new(),
            closed: AtomicBool::new(false),
        });
        DirectInner::install_listeners(&inner);
        Self { inner }
    }

    pub fn room_id(&self) -> &str {
        &self.inner.room_id
    }

    pub fn events(&self) -> &Emitter<RoomEvent> {
        &self.inner.events
    }

    /// The bound remote peer, once one has joined.
    pub fn remote(&self) -> Option<String> {
        self.inner.remote.lock().clone()
    }

    pub fn client(&self) -> &Client {
        &self.inner.client
    }

    /// Create the room on the server (owner side), capped at two members.
    pub async fn create(&self) -> Result<RoomCreatedPayload, Error> {
        self.inner.client.create_room(&self.inner.room_id, 2).await
    }

    /// Join the room; if the other member is already present, initiate
    /// the P2P connection right away.
    pub async fn join(&self) -> Result<(), Error> {
        let peers = self.inner.client.join_room(&self.inner.room_id).await?;
        if let Some(first) = peers.first() {
            DirectInner::bind_remote(&self.inner, &first.fingerprint, &first.alias).await;
        }
        Ok(())
    }

    /// Send to the bound remote: P2P when connected, relay otherwise.
    pub async fn send(&self, data: Value) -> Result<(), Error> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::PeerNotConnected("room closed".to_string()));
        }
        let Some(remote) = self.remote() else {
            return Err(Error::PeerNotConnected("no peer in room".to_string()));
        };

        if let Some(peer) = self.inner.client.peer(&remote)
            && peer.connection_state() == PeerConnectionState::Connected
            && peer.send_json(&data, None).await.is_ok()
        {
            return Ok(());
        }
        self.inner
            .client
            .relay(&remote, relay_frame(&self.inner.room_id, &data))
    }

    /// Idempotent: closes the P2P session, leaves the room namespace,
    /// emits `Closed`, and drops every listener.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let remote = self.inner.remote.lock().take();
        if let Some(remote) = remote {
            self.inner.client.close_peer(&remote).await;
        }
        let _ = self.inner.client.leave(&self.inner.room_id);
        self.inner.events.emit(&RoomEvent::Closed);
        self.inner.events.remove_all(None);
    }
}

impl DirectInner {
    fn install_listeners(inner: &Arc<DirectInner>) {
        let client_events = inner.client.events().clone();
        {
            let inner = inner.clone();
            client_events.on(ClientEventKind::PeerJoined, move |ev| {
                if let ClientEvent::PeerJoined { namespace, peer } = ev
                    && namespace == &inner.room_id
                    && !inner.closed.load(Ordering::SeqCst)
                {
                    inner.events.emit(&RoomEvent::PeerJoined(peer.clone()));
                    let inner = inner.clone();
                    let fingerprint = peer.fingerprint.clone();
                    let alias = peer.alias.clone();
                    tokio::spawn(async move {
                        DirectInner::bind_remote(&inner, &fingerprint, &alias).await;
                    });
                }
                Ok(())
            });
        }
        {
            let inner = inner.clone();
            client_events.on(ClientEventKind::PeerLeft, move |ev| {
                if let ClientEvent::PeerLeft {
                    namespace,
                    fingerprint,
                } = ev
                    && namespace == &inner.room_id
                    && !inner.closed.load(Ordering::SeqCst)
                {
                    let mut remote = inner.remote.lock();
                    if remote.as_deref() == Some(fingerprint.as_str()) {
                        *remote = None;
                    }
                    drop(remote);
                    inner.events.emit(&RoomEvent::PeerLeft(fingerprint.clone()));
                }
                Ok(())
            });
        }
        {
            let inner = inner.clone();
            client_events.on(ClientEventKind::Relay, move |ev| {
                if let ClientEvent::Relay { from, payload } = ev
                    && !inner.closed.load(Ordering::SeqCst)
                    && payload.get("_room").and_then(Value::as_str)
                        == Some(inner.room_id.as_str())
                    && inner.remote.lock().as_deref() == Some(from.as_str())
                {
                    inner.events.emit(&RoomEvent::Data {
                        from: from.clone(),
                        data: payload.get("data").cloned().unwrap_or(Value::Null),
                    });
                }
                Ok(())
            });
        }
        {
            let inner = inner.clone();
            client_events.on(ClientEventKind::Kicked, move |ev| {
                if let ClientEvent::Kicked { room_id } = ev
                    && room_id == &inner.room_id
                {
                    let room = DirectRoom {
                        inner: inner.clone(),
                    };
                    tokio::spawn(async move { room.close().await });
                }
                Ok(())
            });
        }
    }

    /// Bind (or rebind) the remote peer and ensure a P2P attempt.
    async fn bind_remote(inner: &Arc<DirectInner>, fingerprint: &str, alias: &str) {
        if inner.closed.load(Ordering::SeqCst) {
            return;
        }
        {
            let mut remote = inner.remote.lock();
            if remote.as_deref() == Some(fingerprint) {
                return;
            }
            *remote = Some(fingerprint.to_string());
        }
        match inner.client.connect_peer(fingerprint, alias).await {
            Ok(peer) => DirectInner::attach_peer(inner, &peer),
            Err(err) => inner.events.emit(&RoomEvent::Error(err.to_string())),
        }
    }

    fn attach_peer(inner: &Arc<DirectInner>, peer: &PeerSession) {
        let fingerprint = peer.fingerprint().to_string();
        {
            let inner = inner.clone();
            let fp = fingerprint.clone();
            peer.events().on(PeerEventKind::ConnectionState, move |ev| {
                if let PeerEvent::ConnectionState(PeerConnectionState::Connected) = ev
                    && !inner.closed.load(Ordering::SeqCst)
                {
                    inner.events.emit(&RoomEvent::PeerConnected(fp.clone()));
                }
                Ok(())
            });
        }
        {
            let inner = inner.clone();
            peer.events().on(PeerEventKind::Data, move |ev| {
                if let PeerEvent::Data { payload, label } = ev
                    && label == crate::peer::DEFAULT_CHANNEL
                    && !inner.closed.load(Ordering::SeqCst)
                    && inner.remote.lock().as_deref() == Some(fingerprint.as_str())
                {
                    let data = match payload {
                        DataPayload::Json(value) => {
                            if is_subsystem_frame(value) {
                                return Ok(());
                            }
                            value.clone()
                        }
                        DataPayload::Text(text) => Value::String(text.clone()),
                        DataPayload::Binary(_) => return Ok(()),
                    };
                    inner.events.emit(&RoomEvent::Data {
                        from: fingerprint.clone(),
                        data,
                    });
                }
                Ok(())
            });
        }
    }
}

// ── GroupRoom ──────────────────────────────────────────────────────

/// An N:N room with a bounded direct fan-out and relay overflow.
#[derive(Clone)]
pub struct GroupRoom {
    inner: Arc<GroupInner>,
}

struct GroupInner {
    client: Client,
    room_id: String,
    /// Peers we hold (or are establishing) a direct connection with.
    connected: Mutex<HashSet<String>>,
    /// Overflow peers reached via server relay.
    relay_peers: Mutex<HashSet<String>>,
    events: Emitter<RoomEvent>,
    closed: AtomicBool,
}

impl GroupRoom {
    pub fn new(client: Client, room_id: impl Into<String>) -> Self {
        let inner = Arc::new(GroupInner {
            client,
            room_id: room_id.into(),
            connected: Mutex::new(HashSet::new()),
            relay_peers: Mutex::new(HashSet::new()),
            events: Emitter::new(),
            closed: AtomicBool::new(false),
        });
        GroupInner::install_listeners(&inner);
        Self { inner }
    }

    pub fn room_id(&self) -> &str {
        &self.inner.room_id
    }

    pub fn events(&self) -> &Emitter<RoomEvent> {
        &self.inner.events
    }

    pub fn connected_peers(&self) -> Vec<String> {
        self.inner.connected.lock().iter().cloned().collect()
    }

    pub fn relay_peers(&self) -> Vec<String> {
        self.inner.relay_peers.lock().iter().cloned().collect()
    }

    pub async fn create(&self, max_size: u32) -> Result<RoomCreatedPayload, Error> {
        self.inner
            .client
            .create_room(&self.inner.room_id, max_size)
            .await
    }

    pub async fn join(&self) -> Result<(), Error> {
        let peers = self.inner.client.join_room(&self.inner.room_id).await?;
        for peer in peers {
            GroupInner::consider_peer(&self.inner, &peer.fingerprint, &peer.alias).await;
        }
        Ok(())
    }

    /// Targeted send (P2P preferred, relay fallback) or broadcast to the
    /// whole room when `to` is `None`.
    pub async fn send(&self, data: Value, to: Option<&str>) -> Result<(), Error> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::PeerNotConnected("room closed".to_string()));
        }
        match to {
            Some(target) => self.inner.send_to(target, &data).await,
            None => {
                let direct: Vec<String> = self.connected_peers();
                for fingerprint in direct {
                    if let Err(err) = self.inner.send_to(&fingerprint, &data).await {
                        tracing::debug!(peer = %fingerprint, error = %err, "room send failed");
                    }
                }
                for fingerprint in self.relay_peers() {
                    let _ = self
                        .inner
                        .client
                        .relay(&fingerprint, relay_frame(&self.inner.room_id, &data));
                }
                Ok(())
            }
        }
    }

    /// Deliver to all members through the server's broadcast path.
    pub fn broadcast_via_server(&self, data: Value) -> Result<(), Error> {
        self.inner.client.broadcast(&self.inner.room_id, data)
    }

    /// Kick a member (owner capability).
    pub fn kick(&self, fingerprint: &str) -> Result<(), Error> {
        self.inner.client.kick(&self.inner.room_id, fingerprint)
    }

    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let members: Vec<String> = self.inner.connected.lock().drain().collect();
        for fingerprint in members {
            self.inner.client.close_peer(&fingerprint).await;
        }
        self.inner.relay_peers.lock().clear();
        let _ = self.inner.client.leave(&self.inner.room_id);
        self.inner.events.emit(&RoomEvent::Closed);
        self.inner.events.remove_all(None);
    }
}

impl GroupInner {
    async fn send_to(&self, fingerprint: &str, data: &Value) -> Result<(), Error> {
        if let Some(peer) = self.client.peer(fingerprint)
            && peer.connection_state() == PeerConnectionState::Connected
            && peer.send_json(data, None).await.is_ok()
        {
            return Ok(());
        }
        self.client
            .relay(fingerprint, relay_frame(&self.room_id, data))
    }

    fn install_listeners(inner: &Arc<GroupInner>) {
        let client_events = inner.client.events().clone();
        {
            let inner = inner.clone();
            client_events.on(ClientEventKind::PeerJoined, move |ev| {
                if let ClientEvent::PeerJoined { namespace, peer } = ev
                    && namespace == &inner.room_id
                    && !inner.closed.load(Ordering::SeqCst)
                {
                    inner.events.emit(&RoomEvent::PeerJoined(peer.clone()));
                    let inner = inner.clone();
                    let fingerprint = peer.fingerprint.clone();
                    let alias = peer.alias.clone();
                    tokio::spawn(async move {
                        GroupInner::consider_peer(&inner, &fingerprint, &alias).await;
                    });
                }
                Ok(())
            });
        }
        {
            let inner = inner.clone();
            client_events.on(ClientEventKind::PeerLeft, move |ev| {
                if let ClientEvent::PeerLeft {
                    namespace,
                    fingerprint,
                } = ev
                    && namespace == &inner.room_id
                    && !inner.closed.load(Ordering::SeqCst)
                {
                    inner.connected.lock().remove(fingerprint);
                    inner.relay_peers.lock().remove(fingerprint);
                    inner.events.emit(&RoomEvent::PeerLeft(fingerprint.clone()));
                    let inner = inner.clone();
                    tokio::spawn(async move { GroupInner::promote_relay_peers(&inner).await });
                }
                Ok(())
            });
        }
        {
            let inner = inner.clone();
            client_events.on(ClientEventKind::Relay, move |ev| {
                if let ClientEvent::Relay { from, payload } = ev
                    && !inner.closed.load(Ordering::SeqCst)
                    && payload.get("_room").and_then(Value::as_str)
                        == Some(inner.room_id.as_str())
                {
                    inner.events.emit(&RoomEvent::Data {
                        from: from.clone(),
                        data: payload.get("data").cloned().unwrap_or(Value::Null),
                    });
                }
                Ok(())
            });
        }
        {
            let inner = inner.clone();
            client_events.on(ClientEventKind::Broadcast, move |ev| {
                if let ClientEvent::Broadcast {
                    from,
                    namespace,
                    data,
                } = ev
                    && namespace == &inner.room_id
                    && !inner.closed.load(Ordering::SeqCst)
                    && !is_subsystem_frame(data)
                {
                    inner.events.emit(&RoomEvent::Data {
                        from: from.clone(),
                        data: data.clone(),
                    });
                }
                Ok(())
            });
        }
        {
            let inner = inner.clone();
            client_events.on(ClientEventKind::Kicked, move |ev| {
                if let ClientEvent::Kicked { room_id } = ev
                    && room_id == &inner.room_id
                {
                    let room = GroupRoom {
                        inner: inner.clone(),
                    };
                    tokio::spawn(async move { room.close().await });
                }
                Ok(())
            });
        }
    }

    /// Place a peer: direct connection while under the fan-out cap,
    /// relay set otherwise.
    async fn consider_peer(inner: &Arc<GroupInner>, fingerprint: &str, alias: &str) {
        if inner.closed.load(Ordering::SeqCst) {
            return;
        }
        let direct = {
            let mut connected = inner.connected.lock();
            if connected.contains(fingerprint) {
                return;
            }
            if connected.len() < RELAY_THRESHOLD {
                connected.insert(fingerprint.to_string());
                true
            } else {
                inner.relay_peers.lock().insert(fingerprint.to_string());
                false
            }
        };
        if !direct {
            return;
        }
        match inner.client.connect_peer(fingerprint, alias).await {
            Ok(peer) => GroupInner::attach_peer(inner, &peer),
            Err(err) => {
                inner.connected.lock().remove(fingerprint);
                inner.relay_peers.lock().insert(fingerprint.to_string());
                inner.events.emit(&RoomEvent::Error(err.to_string()));
            }
        }
    }

    /// Fill freed direct slots from the relay set.
    async fn promote_relay_peers(inner: &Arc<GroupInner>) {
        loop {
            let candidate = {
                let connected = inner.connected.lock();
                if connected.len() >= RELAY_THRESHOLD {
                    break;
                }
                let mut relay = inner.relay_peers.lock();
                let Some(fingerprint) = relay.iter().next().cloned() else {
                    break;
                };
                relay.remove(&fingerprint);
                fingerprint
            };
            GroupInner::consider_peer(inner, &candidate, "").await;
        }
    }

    fn attach_peer(inner: &Arc<GroupInner>, peer: &PeerSession) {
        let fingerprint = peer.fingerprint().to_string();
        {
            let inner = inner.clone();
            let fp = fingerprint.clone();
            peer.events().on(PeerEventKind::ConnectionState, move |ev| {
                if let PeerEvent::ConnectionState(PeerConnectionState::Connected) = ev
                    && !inner.closed.load(Ordering::SeqCst)
                {
                    inner.events.emit(&RoomEvent::PeerConnected(fp.clone()));
                }
                Ok(())
            });
        }
        {
            let inner = inner.clone();
            peer.events().on(PeerEventKind::Data, move |ev| {
                if let PeerEvent::Data { payload, label } = ev
                    && label == crate::peer::DEFAULT_CHANNEL
                    && !inner.closed.load(Ordering::SeqCst)
                {
                    let data = match payload {
                        DataPayload::Json(value) => {
                            if is_subsystem_frame(value) {
                                return Ok(());
                            }
                            value.clone()
                        }
                        DataPayload::Text(text) => Value::String(text.clone()),
                        DataPayload::Binary(_) => return Ok(()),
                    };
                    inner.events.emit(&RoomEvent::Data {
                        from: fingerprint.clone(),
                        data,
                    });
                }
                Ok(())
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relay_frames_carry_room_and_data() {
        let frame = relay_frame("room-1", &json!({"x": 1}));
        assert_eq!(frame["_room"], "room-1");
        assert_eq!(frame["data"]["x"], 1);
    }

    #[test]
    fn subsystem_frames_are_recognized() {
        assert!(is_subsystem_frame(&json!({"_ft": true, "type": "offer"})));
        assert!(is_subsystem_frame(&json!({"_sync": true, "type": "update"})));
        assert!(is_subsystem_frame(&json!({"_osr": true})));
        assert!(!is_subsystem_frame(&json!({"_encrypted": true, "data": "…"})));
        assert!(!is_subsystem_frame(&json!({"hello": "world"})));
    }
}
