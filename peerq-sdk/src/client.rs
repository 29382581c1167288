//! The client coordinator.
//!
//! Owns the identity, the signaling transport, the peer-session map,
//! the joined-namespace set, and the pending-request registry. A single
//! dispatch task consumes transport events in server order: it resolves
//! correlated requests (join, discover, match, room ops), routes WebRTC
//! signals to per-peer sessions (creating them on demand for the
//! answering side), and replays registration and namespace membership
//! after every reconnect.
//!
//! Request correlation turns one-shot server exchanges into awaitable
//! calls: each request parks a oneshot sender under a `(kind, key)`
//! entry, with a timeout on the caller side and cleanup on every exit
//! path. A new `match` for a namespace supersedes the previous one, as
//! does a second in-flight `register`; `disconnect()` sweeps everything
//! with `Disconnected`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::emitter::{BusEvent, Emitter};
use crate::error::Error;
use crate::hlc::now_millis;
use crate::identity::{Identity, IdentityKeys};
use crate::peer::{PeerEvent, PeerEventKind, PeerSession, SignalSender};
use crate::protocol::{
    BroadcastPayload, CreateRoomPayload, DiscoverPayload, Envelope, JoinPayload, JoinRoomPayload,
    KickPayload, LeavePayload, MatchPayload, MatchedPayload, MessageType, MetadataPayload,
    PeerInfo, PeerListPayload, RegisterPayload, RegisteredPayload, RoomCreatedPayload,
    RoomInfoPayload, SignalPayload,
};
use crate::rtc::{IceServer, PeerConnectionState, RtcConfig, RtcEngine};
use crate::socket::SocketConnector;
use crate::transport::{Transport, TransportConfig, TransportEvent, TransportEventKind};

/// Timeout for `join` and `discover`.
pub const JOIN_TIMEOUT: Duration = Duration::from_secs(10);
/// Timeout for `match` (matchmaking waits on other parties).
pub const MATCH_TIMEOUT: Duration = Duration::from_secs(30);
/// Timeout for room create/join/info.
pub const ROOM_OP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub url: String,
    pub ice_servers: Vec<IceServer>,
    pub alias: String,
    pub meta: Option<Value>,
    pub auto_reconnect: bool,
    pub reconnect_delay: Duration,
    pub reconnect_max_delay: Duration,
    pub max_reconnect_attempts: u32,
    pub ping_interval: Duration,
    pub identity_keys: Option<IdentityKeys>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let transport = TransportConfig::default();
        Self {
            url: String::new(),
            ice_servers: RtcConfig::default().ice_servers,
            alias: "anonymous".to_string(),
            meta: None,
            auto_reconnect: transport.auto_reconnect,
            reconnect_delay: transport.reconnect_delay,
            reconnect_max_delay: transport.reconnect_max_delay,
            max_reconnect_attempts: transport.max_reconnect_attempts,
            ping_interval: transport.ping_interval,
            identity_keys: None,
        }
    }
}

impl ClientConfig {
    fn transport(&self) -> TransportConfig {
        TransportConfig {
            url: self.url.clone(),
            auto_reconnect: self.auto_reconnect,
            reconnect_delay: self.reconnect_delay,
            reconnect_max_delay: self.reconnect_max_delay,
            max_reconnect_attempts: self.max_reconnect_attempts,
            ping_interval: self.ping_interval,
        }
    }

    fn rtc(&self) -> RtcConfig {
        RtcConfig {
            ice_servers: self.ice_servers.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum ClientEvent {
    Registered {
        fingerprint: String,
        alias: String,
    },
    Reconnected,
    PeerList {
        namespace: String,
        peers: Vec<PeerInfo>,
    },
    PeerJoined {
        namespace: String,
        peer: PeerInfo,
    },
    PeerLeft {
        namespace: String,
        fingerprint: String,
    },
    /// A peer session was created (either side of the handshake).
    PeerCreated {
        fingerprint: String,
    },
    Matched {
        namespace: String,
        session_id: String,
        peers: Vec<PeerInfo>,
    },
    Relay {
        from: String,
        payload: Value,
    },
    Broadcast {
        from: String,
        namespace: String,
        data: Value,
    },
    RoomCreated {
        room_id: String,
        max_size: u32,
        owner: String,
    },
    RoomClosed {
        room_id: String,
    },
    Kicked {
        room_id: String,
    },
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientEventKind {
    Registered,
    Reconnected,
    PeerList,
    PeerJoined,
    PeerLeft,
    PeerCreated,
    Matched,
    Relay,
    Broadcast,
    RoomCreated,
    RoomClosed,
    Kicked,
    Error,
}

impl BusEvent for ClientEvent {
    type Kind = ClientEventKind;

    fn kind(&self) -> ClientEventKind {
        match self {
            ClientEvent::Registered { .. } => ClientEventKind::Registered,
            ClientEvent::Reconnected => ClientEventKind::Reconnected,
            ClientEvent::PeerList { .. } => ClientEventKind::PeerList,
            ClientEvent::PeerJoined { .. } => ClientEventKind::PeerJoined,
            ClientEvent::PeerLeft { .. } => ClientEventKind::PeerLeft,
            ClientEvent::PeerCreated { .. } => ClientEventKind::PeerCreated,
            ClientEvent::Matched { .. } => ClientEventKind::Matched,
            ClientEvent::Relay { .. } => ClientEventKind::Relay,
            ClientEvent::Broadcast { .. } => ClientEventKind::Broadcast,
            ClientEvent::RoomCreated { .. } => ClientEventKind::RoomCreated,
            ClientEvent::RoomClosed { .. } => ClientEventKind::RoomClosed,
            ClientEvent::Kicked { .. } => ClientEventKind::Kicked,
            ClientEvent::Error(_) => ClientEventKind::Error,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum PendingKind {
    Join,
    Discover,
    Match,
    CreateRoom,
    JoinRoom,
    RoomInfo,
}

type PendingKey = (PendingKind, String);

struct PendingEntry {
    id: u64,
    tx: oneshot::Sender<Result<Value, Error>>,
}

enum DispatchMsg {
    Opened,
    Inbound(Envelope),
    /// A peer session reported failed/closed; drop it from the map.
    PeerDown(String),
}

static REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Handle to one signaling client. Cheap to clone.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: ClientConfig,
    identity: Mutex<Identity>,
    transport: Transport,
    engine: Arc<dyn RtcEngine>,
    peers: Mutex<HashMap<String, PeerSession>>,
    namespaces: Mutex<HashSet<String>>,
    pending: Mutex<HashMap<PendingKey, Vec<PendingEntry>>>,
    register: Mutex<Option<oneshot::Sender<Result<RegisteredPayload, Error>>>>,
    /// Set after the first successful registration; an `open` after this
    /// means reconnect and triggers the resync flow.
    registered_before: AtomicBool,
    /// Armed while a reconnect resync waits for its `registered` ack.
    resync_pending: AtomicBool,
    events: Emitter<ClientEvent>,
    dispatch_tx: mpsc::UnboundedSender<DispatchMsg>,
}

impl Client {
    pub fn new(
        connector: Arc<dyn SocketConnector>,
        engine: Arc<dyn RtcEngine>,
        config: ClientConfig,
    ) -> Self {
        let transport = Transport::new(connector, config.transport());
        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(ClientInner {
            config,
            identity: Mutex::new(Identity::new()),
            transport,
            engine,
            peers: Mutex::new(HashMap::new()),
            namespaces: Mutex::new(HashSet::new()),
            pending: Mutex::new(HashMap::new()),
            register: Mutex::new(None),
            registered_before: AtomicBool::new(false),
            resync_pending: AtomicBool::new(false),
            events: Emitter::new(),
            dispatch_tx,
        });

        {
            let tx = inner.dispatch_tx.clone();
            inner
                .transport
                .events()
                .on(TransportEventKind::Message, move |ev| {
                    if let TransportEvent::Message(env) = ev {
                        let _ = tx.send(DispatchMsg::Inbound(env.clone()));
                    }
                    Ok(())
                });
        }
        {
            let tx = inner.dispatch_tx.clone();
            inner
                .transport
                .events()
                .on(TransportEventKind::Open, move |_| {
                    let _ = tx.send(DispatchMsg::Opened);
                    Ok(())
                });
        }

        tokio::spawn(ClientInner::run_dispatch(inner.clone(), dispatch_rx));

        Self { inner }
    }

    pub fn events(&self) -> &Emitter<ClientEvent> {
        &self.inner.events
    }

    pub fn transport(&self) -> &Transport {
        &self.inner.transport
    }

    pub fn fingerprint(&self) -> Option<String> {
        self.inner.identity.lock().fingerprint().map(str::to_string)
    }

    /// Export the identity keypair for durable storage.
    pub fn export_identity(&self) -> Option<IdentityKeys> {
        self.inner.identity.lock().export()
    }

    /// Namespaces and rooms currently remembered for rejoin.
    pub fn joined_namespaces(&self) -> Vec<String> {
        self.inner.namespaces.lock().iter().cloned().collect()
    }

    /// Open the signaling stream.
    pub async fn connect(&self) -> Result<(), Error> {
        self.inner.transport.connect().await
    }

    /// Register with the server and await the fingerprint binding.
    ///
    /// A second call while one is in flight supersedes the first.
    pub async fn register(&self) -> Result<RegisteredPayload, Error> {
        {
            let mut identity = self.inner.identity.lock();
            identity
                .ensure_keys(self.inner.config.identity_keys.as_ref())
                .map_err(|e| Error::Config(e.to_string()))?;
        }
        let rx = self.inner.start_register()?;
        rx.await.map_err(|_| Error::Disconnected)?
    }

    /// Join a namespace; resolves with the current peer list.
    pub async fn join(&self, namespace: &str) -> Result<Vec<PeerInfo>, Error> {
        // Eagerly remembered so a reconnect during the round trip rejoins.
        self.inner
            .namespaces
            .lock()
            .insert(namespace.to_string());

        let message = Envelope::new(MessageType::Join)
            .with_namespace(namespace)
            .with_payload(&JoinPayload {
                namespace: namespace.to_string(),
                app_type: None,
                version: None,
            })
            .map_err(|e| Error::Protocol(e.to_string()))?;

        let result = self
            .inner
            .request(
                PendingKind::Join,
                namespace.to_string(),
                message,
                JOIN_TIMEOUT,
                "join",
            )
            .await;
        match result {
            Ok(value) => {
                let list: PeerListPayload =
                    serde_json::from_value(value).map_err(|e| Error::Protocol(e.to_string()))?;
                Ok(list.peers)
            }
            Err(err) => {
                self.inner.namespaces.lock().remove(namespace);
                Err(err)
            }
        }
    }

    /// Leave a namespace and forget it for rejoin purposes.
    pub fn leave(&self, namespace: &str) -> Result<(), Error> {
        self.inner.namespaces.lock().remove(namespace);
        let message = Envelope::new(MessageType::Leave)
            .with_namespace(namespace)
            .with_payload(&LeavePayload {
                namespace: namespace.to_string(),
            })
            .map_err(|e| Error::Protocol(e.to_string()))?;
        self.inner.send(message)
    }

    /// List peers in a namespace without joining it.
    pub async fn discover(&self, namespace: &str, limit: u32) -> Result<Vec<PeerInfo>, Error> {
        let message = Envelope::new(MessageType::Discover)
            .with_namespace(namespace)
            .with_payload(&DiscoverPayload {
                namespace: namespace.to_string(),
                limit,
            })
            .map_err(|e| Error::Protocol(e.to_string()))?;
        let value = self
            .inner
            .request(
                PendingKind::Discover,
                namespace.to_string(),
                message,
                JOIN_TIMEOUT,
                "discover",
            )
            .await?;
        let list: PeerListPayload =
            serde_json::from_value(value).map_err(|e| Error::Protocol(e.to_string()))?;
        Ok(list.peers)
    }

    /// Request a matchmaking session. A newer call for the same
    /// namespace supersedes this one.
    pub async fn match_peers(
        &self,
        namespace: &str,
        criteria: Value,
        group_size: u32,
    ) -> Result<MatchedPayload, Error> {
        // Supersede any pending match for this namespace.
        self.inner.reject_pending(
            PendingKind::Match,
            namespace,
            || Error::Superseded,
        );

        let message = Envelope::new(MessageType::Match)
            .with_namespace(namespace)
            .with_payload(&MatchPayload {
                namespace: namespace.to_string(),
                criteria,
                group_size,
            })
            .map_err(|e| Error::Protocol(e.to_string()))?;
        let value = self
            .inner
            .request(
                PendingKind::Match,
                namespace.to_string(),
                message,
                MATCH_TIMEOUT,
                "match",
            )
            .await?;
        serde_json::from_value(value).map_err(|e| Error::Protocol(e.to_string()))
    }

    /// Cancel the pending match for a namespace, if any.
    pub fn cancel_match(&self, namespace: &str) {
        self.inner
            .reject_pending(PendingKind::Match, namespace, || Error::Cancelled);
    }

    pub async fn create_room(&self, room_id: &str, max_size: u32) -> Result<RoomCreatedPayload, Error> {
        let message = Envelope::new(MessageType::CreateRoom)
            .with_payload(&CreateRoomPayload {
                room_id: room_id.to_string(),
                max_size,
            })
            .map_err(|e| Error::Protocol(e.to_string()))?;
        let value = self
            .inner
            .request(
                PendingKind::CreateRoom,
                room_id.to_string(),
                message,
                ROOM_OP_TIMEOUT,
                "create_room",
            )
            .await?;
        serde_json::from_value(value).map_err(|e| Error::Protocol(e.to_string()))
    }

    pub async fn join_room(&self, room_id: &str) -> Result<Vec<PeerInfo>, Error> {
        self.inner.namespaces.lock().insert(room_id.to_string());
        let message = Envelope::new(MessageType::JoinRoom)
            .with_payload(&JoinRoomPayload {
                room_id: room_id.to_string(),
            })
            .map_err(|e| Error::Protocol(e.to_string()))?;
        let result = self
            .inner
            .request(
                PendingKind::JoinRoom,
                room_id.to_string(),
                message,
                ROOM_OP_TIMEOUT,
                "join_room",
            )
            .await;
        match result {
            Ok(value) => {
                let list: PeerListPayload =
                    serde_json::from_value(value).map_err(|e| Error::Protocol(e.to_string()))?;
                Ok(list.peers)
            }
            Err(err) => {
                self.inner.namespaces.lock().remove(room_id);
                Err(err)
            }
        }
    }

    pub async fn room_info(&self, room_id: &str) -> Result<RoomInfoPayload, Error> {
        let message = Envelope::new(MessageType::RoomInfo)
            .with_payload(&JoinRoomPayload {
                room_id: room_id.to_string(),
            })
            .map_err(|e| Error::Protocol(e.to_string()))?;
        let value = self
            .inner
            .request(
                PendingKind::RoomInfo,
                room_id.to_string(),
                message,
                ROOM_OP_TIMEOUT,
                "room_info",
            )
            .await?;
        serde_json::from_value(value).map_err(|e| Error::Protocol(e.to_string()))
    }

    /// Kick a peer from a room this client owns.
    pub fn kick(&self, room_id: &str, fingerprint: &str) -> Result<(), Error> {
        let message = Envelope::new(MessageType::Kick)
            .with_payload(&KickPayload {
                room_id: room_id.to_string(),
                fingerprint: Some(fingerprint.to_string()),
            })
            .map_err(|e| Error::Protocol(e.to_string()))?;
        self.inner.send(message)
    }

    /// Server-mediated addressed message to one peer.
    pub fn relay(&self, to: &str, payload: Value) -> Result<(), Error> {
        let message = Envelope::new(MessageType::Relay)
            .with_to(to)
            .with_payload_value(payload);
        self.inner.send(message)
    }

    /// Server-mediated delivery to all members of a namespace.
    pub fn broadcast(&self, namespace: &str, data: Value) -> Result<(), Error> {
        let message = Envelope::new(MessageType::Broadcast)
            .with_namespace(namespace)
            .with_payload(&BroadcastPayload {
                namespace: namespace.to_string(),
                data,
            })
            .map_err(|e| Error::Protocol(e.to_string()))?;
        self.inner.send(message)
    }

    /// Update the metadata the server echoes to other peers.
    pub fn set_metadata(&self, meta: Value) -> Result<(), Error> {
        let message = Envelope::new(MessageType::Metadata)
            .with_payload(&MetadataPayload { meta })
            .map_err(|e| Error::Protocol(e.to_string()))?;
        self.inner.send(message)
    }

    pub fn peer(&self, fingerprint: &str) -> Option<PeerSession> {
        self.inner.peers.lock().get(fingerprint).cloned()
    }

    pub fn peer_count(&self) -> usize {
        self.inner.peers.lock().len()
    }

    /// Existing session for `fingerprint`, or a fresh one; a closed
    /// session is evicted first.
    pub async fn get_or_create_peer(
        &self,
        fingerprint: &str,
        alias: &str,
    ) -> Result<PeerSession, Error> {
        ClientInner::get_or_create_peer(&self.inner, fingerprint, alias).await
    }

    /// Ensure a session exists and initiate the P2P handshake if it is
    /// not already connected.
    pub async fn connect_peer(&self, fingerprint: &str, alias: &str) -> Result<PeerSession, Error> {
        let peer = ClientInner::get_or_create_peer(&self.inner, fingerprint, alias).await?;
        if peer.connection_state() != PeerConnectionState::Connected {
            peer.create_offer(None).await?;
        }
        Ok(peer)
    }

    /// Close one peer session and drop it from the map.
    pub async fn close_peer(&self, fingerprint: &str) {
        let peer = self.inner.peers.lock().remove(fingerprint);
        if let Some(peer) = peer {
            peer.close().await;
        }
    }

    /// Tear everything down: peers, namespaces, pending requests, and
    /// the transport.
    pub async fn disconnect(&self) {
        let peers: Vec<PeerSession> = self
            .inner
            .peers
            .lock()
            .drain()
            .map(|(_, peer)| peer)
            .collect();
        for peer in peers {
            peer.close().await;
        }
        self.inner.namespaces.lock().clear();
        self.inner.sweep_pending(Error::Disconnected);
        self.inner.reject_register(Error::Disconnected);
        self.inner.transport.close();
    }
}

impl ClientInner {
    fn send(&self, mut message: Envelope) -> Result<(), Error> {
        message.ts = Some(now_millis());
        self.transport.send(message)
    }

    fn start_register(
        &self,
    ) -> Result<oneshot::Receiver<Result<RegisteredPayload, Error>>, Error> {
        let (tx, rx) = oneshot::channel();
        {
            let mut slot = self.register.lock();
            if let Some(previous) = slot.take() {
                let _ = previous.send(Err(Error::Superseded));
            }
            *slot = Some(tx);
        }

        let (public_key, alias) = {
            let identity = self.identity.lock();
            let key = identity
                .public_key_b64()
                .ok_or(Error::Config("identity keys missing".to_string()))?;
            (key, self.config.alias.clone())
        };
        let message = Envelope::new(MessageType::Register)
            .with_payload(&RegisterPayload {
                public_key,
                alias,
                meta: self.config.meta.clone(),
            })
            .map_err(|e| Error::Protocol(e.to_string()))?;
        self.send(message)?;
        Ok(rx)
    }

    fn reject_register(&self, err: Error) {
        if let Some(tx) = self.register.lock().take() {
            let _ = tx.send(Err(err));
        }
    }

    async fn request(
        &self,
        kind: PendingKind,
        key: String,
        message: Envelope,
        timeout: Duration,
        label: &'static str,
    ) -> Result<Value, Error> {
        let (tx, rx) = oneshot::channel();
        let id = REQUEST_ID.fetch_add(1, Ordering::Relaxed);
        self.pending
            .lock()
            .entry((kind, key.clone()))
            .or_default()
            .push(PendingEntry { id, tx });

        if let Err(err) = self.send(message) {
            self.remove_pending(kind, &key, id);
            return Err(err);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Disconnected),
            Err(_) => {
                self.remove_pending(kind, &key, id);
                Err(Error::Timeout(label))
            }
        }
    }

    fn remove_pending(&self, kind: PendingKind, key: &str, id: u64) {
        let mut pending = self.pending.lock();
        if let Some(entries) = pending.get_mut(&(kind, key.to_string())) {
            entries.retain(|entry| entry.id != id);
            if entries.is_empty() {
                pending.remove(&(kind, key.to_string()));
            }
        }
    }

    /// Resolve every pending entry under `(kind, key)` with `value`.
    fn resolve_pending(&self, kind: PendingKind, key: &str, value: &Value) {
        let entries = self.pending.lock().remove(&(kind, key.to_string()));
        if let Some(entries) = entries {
            for entry in entries {
                let _ = entry.tx.send(Ok(value.clone()));
            }
        }
    }

    fn reject_pending(&self, kind: PendingKind, key: &str, err: impl Fn() -> Error) {
        let entries = self.pending.lock().remove(&(kind, key.to_string()));
        if let Some(entries) = entries {
            for entry in entries {
                let _ = entry.tx.send(Err(err()));
            }
        }
    }

    fn sweep_pending(&self, err: Error) {
        let all: Vec<PendingEntry> = self
            .pending
            .lock()
            .drain()
            .flat_map(|(_, entries)| entries)
            .collect();
        for entry in all {
            let _ = entry.tx.send(Err(err.clone()));
        }
    }

    async fn get_or_create_peer(
        inner: &Arc<ClientInner>,
        fingerprint: &str,
        alias: &str,
    ) -> Result<PeerSession, Error> {
        if let Some(existing) = inner.peers.lock().get(fingerprint) {
            if !existing.is_closed() {
                return Ok(existing.clone());
            }
        }
        // Either absent or closed; a closed session is evicted.
        inner.peers.lock().remove(fingerprint);

        let pc = inner
            .engine
            .create_peer_connection(&inner.config.rtc())
            .await
            .map_err(|e| Error::Rtc(e.to_string()))?;

        let send_signal: SignalSender = {
            let inner = inner.clone();
            let to = fingerprint.to_string();
            Arc::new(move |payload: SignalPayload| {
                let message = Envelope::new(MessageType::Signal)
                    .with_to(&to)
                    .with_payload(&payload);
                match message {
                    Ok(message) => {
                        if let Err(err) = inner.send(message) {
                            tracing::warn!(error = %err, "signal send failed");
                        }
                    }
                    Err(err) => tracing::warn!(error = %err, "signal encode failed"),
                }
            })
        };

        let peer = PeerSession::new(fingerprint, alias, pc, send_signal);

        // Lost the race to another creator? Keep theirs.
        let lost_race_to = {
            let mut peers = inner.peers.lock();
            if let Some(existing) = peers.get(fingerprint) {
                if !existing.is_closed() {
                    Some(existing.clone())
                } else {
                    peers.insert(fingerprint.to_string(), peer.clone());
                    None
                }
            } else {
                peers.insert(fingerprint.to_string(), peer.clone());
                None
            }
        };
        if let Some(existing) = lost_race_to {
            peer.close().await;
            return Ok(existing);
        }

        {
            let tx = inner.dispatch_tx.clone();
            let fp = fingerprint.to_string();
            peer.events().on(PeerEventKind::Disconnected, move |ev| {
                if let PeerEvent::Disconnected(state) = ev
                    && matches!(
                        state,
                        PeerConnectionState::Failed | PeerConnectionState::Closed
                    )
                {
                    let _ = tx.send(DispatchMsg::PeerDown(fp.clone()));
                }
                Ok(())
            });
        }

        inner.events.emit(&ClientEvent::PeerCreated {
            fingerprint: fingerprint.to_string(),
        });
        Ok(peer)
    }

    async fn run_dispatch(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<DispatchMsg>) {
        while let Some(msg) = rx.recv().await {
            match msg {
                DispatchMsg::Opened => ClientInner::handle_open(&self).await,
                DispatchMsg::Inbound(env) => ClientInner::handle_message(&self, env).await,
                DispatchMsg::PeerDown(fingerprint) => {
                    let peer = self.peers.lock().remove(&fingerprint);
                    if let Some(peer) = peer {
                        peer.close().await;
                    }
                }
            }
        }
    }

    /// First open: nothing (registration is caller-driven). Later opens
    /// are reconnects: evict dead peers and re-register; the rejoin and
    /// `reconnected` emission continue once `registered` arrives.
    async fn handle_open(inner: &Arc<ClientInner>) {
        if !inner.registered_before.load(Ordering::SeqCst) {
            return;
        }
        let stale: Vec<PeerSession> = {
            let mut peers = inner.peers.lock();
            let dead: Vec<String> = peers
                .iter()
                .filter(|(_, peer)| {
                    matches!(
                        peer.connection_state(),
                        PeerConnectionState::Failed | PeerConnectionState::Closed
                    )
                })
                .map(|(fp, _)| fp.clone())
                .collect();
            dead.into_iter()
                .filter_map(|fp| peers.remove(&fp))
                .collect()
        };
        for peer in stale {
            peer.close().await;
        }

        inner.resync_pending.store(true, Ordering::SeqCst);
        match inner.start_register() {
            Ok(_rx) => {
                // Resolution continues in the `registered` handler; the
                // receiver is dropped because nobody awaits this one.
            }
            Err(err) => {
                inner.resync_pending.store(false, Ordering::SeqCst);
                inner.events.emit(&ClientEvent::Error(err.to_string()));
            }
        }
    }

    async fn handle_message(inner: &Arc<ClientInner>, env: Envelope) {
        match env.kind {
            MessageType::Registered => {
                let payload: RegisteredPayload = match env.payload_as() {
                    Ok(payload) => payload,
                    Err(err) => {
                        tracing::warn!(error = %err, "bad registered payload");
                        return;
                    }
                };
                inner.identity
                    .lock()
                    .set_registration(payload.fingerprint.clone(), payload.alias.clone());
                inner.registered_before.store(true, Ordering::SeqCst);
                if let Some(tx) = inner.register.lock().take() {
                    let _ = tx.send(Ok(payload.clone()));
                }
                inner.events.emit(&ClientEvent::Registered {
                    fingerprint: payload.fingerprint,
                    alias: payload.alias,
                });

                if inner.resync_pending.swap(false, Ordering::SeqCst) {
                    let namespaces = inner.namespaces.lock().clone();
                    for namespace in namespaces {
                        let message = Envelope::new(MessageType::Join)
                            .with_namespace(&namespace)
                            .with_payload(&JoinPayload {
                                namespace: namespace.clone(),
                                app_type: None,
                                version: None,
                            });
                        match message {
                            Ok(message) => {
                                if let Err(err) = inner.send(message) {
                                    tracing::warn!(error = %err, namespace, "rejoin failed");
                                }
                            }
                            Err(err) => tracing::warn!(error = %err, "rejoin encode failed"),
                        }
                    }
                    inner.events.emit(&ClientEvent::Reconnected);
                }
            }
            MessageType::PeerList => {
                let Ok(payload) = env.payload_as::<PeerListPayload>() else {
                    tracing::warn!("bad peer_list payload");
                    return;
                };
                let value = serde_json::to_value(&payload).unwrap_or(Value::Null);
                inner.resolve_pending(PendingKind::Join, &payload.namespace, &value);
                inner.resolve_pending(PendingKind::Discover, &payload.namespace, &value);
                inner.resolve_pending(PendingKind::JoinRoom, &payload.namespace, &value);
                inner.events.emit(&ClientEvent::PeerList {
                    namespace: payload.namespace,
                    peers: payload.peers,
                });
            }
            MessageType::PeerJoined => {
                let Ok(peer) = env.payload_as::<PeerInfo>() else {
                    tracing::warn!("bad peer_joined payload");
                    return;
                };
                inner.events.emit(&ClientEvent::PeerJoined {
                    namespace: env.namespace.unwrap_or_default(),
                    peer,
                });
            }
            MessageType::PeerLeft => {
                let fingerprint = env
                    .payload_as::<PeerInfo>()
                    .map(|p| p.fingerprint)
                    .ok()
                    .or(env.from)
                    .unwrap_or_default();
                let peer = inner.peers.lock().remove(&fingerprint);
                if let Some(peer) = peer {
                    peer.close().await;
                }
                inner.events.emit(&ClientEvent::PeerLeft {
                    namespace: env.namespace.unwrap_or_default(),
                    fingerprint,
                });
            }
            MessageType::Signal => {
                let Some(from) = env.from.clone() else {
                    tracing::warn!("signal without sender");
                    return;
                };
                let Ok(payload) = env.payload_as::<SignalPayload>() else {
                    tracing::warn!("bad signal payload");
                    return;
                };
                match ClientInner::get_or_create_peer(inner, &from, "").await {
                    Ok(peer) => peer.handle_signal(payload).await,
                    Err(err) => {
                        inner.events.emit(&ClientEvent::Error(err.to_string()));
                    }
                }
            }
            MessageType::Matched => {
                let Ok(payload) = env.payload_as::<MatchedPayload>() else {
                    tracing::warn!("bad matched payload");
                    return;
                };
                let value = serde_json::to_value(&payload).unwrap_or(Value::Null);
                inner.resolve_pending(PendingKind::Match, &payload.namespace, &value);
                inner.events.emit(&ClientEvent::Matched {
                    namespace: payload.namespace,
                    session_id: payload.session_id,
                    peers: payload.peers,
                });
            }
            MessageType::Relay => {
                inner.events.emit(&ClientEvent::Relay {
                    from: env.from.clone().unwrap_or_default(),
                    payload: env.normalized_payload().unwrap_or(Value::Null),
                });
            }
            MessageType::Broadcast => {
                let Ok(payload) = env.payload_as::<BroadcastPayload>() else {
                    tracing::warn!("bad broadcast payload");
                    return;
                };
                inner.events.emit(&ClientEvent::Broadcast {
                    from: env.from.unwrap_or_default(),
                    namespace: payload.namespace,
                    data: payload.data,
                });
            }
            MessageType::RoomCreated => {
                let Ok(payload) = env.payload_as::<RoomCreatedPayload>() else {
                    tracing::warn!("bad room_created payload");
                    return;
                };
                inner.namespaces.lock().insert(payload.room_id.clone());
                let value = serde_json::to_value(&payload).unwrap_or(Value::Null);
                inner.resolve_pending(PendingKind::CreateRoom, &payload.room_id, &value);
                inner.events.emit(&ClientEvent::RoomCreated {
                    room_id: payload.room_id,
                    max_size: payload.max_size,
                    owner: payload.owner,
                });
            }
            MessageType::RoomInfo => {
                let Ok(payload) = env.payload_as::<RoomInfoPayload>() else {
                    tracing::warn!("bad room_info payload");
                    return;
                };
                let value = serde_json::to_value(&payload).unwrap_or(Value::Null);
                inner.resolve_pending(PendingKind::RoomInfo, &payload.room_id, &value);
            }
            MessageType::RoomClosed => {
                let Ok(payload) = env.payload_as::<JoinRoomPayload>() else {
                    tracing::warn!("bad room_closed payload");
                    return;
                };
                inner.namespaces.lock().remove(&payload.room_id);
                inner.events.emit(&ClientEvent::RoomClosed {
                    room_id: payload.room_id,
                });
            }
            MessageType::Kick => {
                let Ok(payload) = env.payload_as::<KickPayload>() else {
                    tracing::warn!("bad kick payload");
                    return;
                };
                inner.namespaces.lock().remove(&payload.room_id);
                inner.events.emit(&ClientEvent::Kicked {
                    room_id: payload.room_id,
                });
            }
            MessageType::Error => {
                let message = env.error_message();
                inner.reject_register(Error::Signaling(message.clone()));
                inner.sweep_pending(Error::Signaling(message.clone()));
                inner.events.emit(&ClientEvent::Error(message));
            }
            MessageType::Ping | MessageType::Pong => {
                // Absorbed by the transport; nothing reaches here.
            }
            MessageType::Register
            | MessageType::Join
            | MessageType::Leave
            | MessageType::Discover
            | MessageType::Match
            | MessageType::CreateRoom
            | MessageType::JoinRoom
            | MessageType::Metadata
            | MessageType::Unknown => {
                tracing::debug!(kind = ?env.kind, "ignoring inbound frame");
            }
        }
    }
}
