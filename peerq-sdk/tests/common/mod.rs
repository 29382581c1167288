//! In-process signaling server for the acceptance suites.
//!
//! Speaks the wire protocol over loopback sockets: register binds
//! fingerprints (stable per public key), join/leave maintain namespace
//! membership with `peer_joined`/`peer_left` fan-out, signal/relay
//! forward by fingerprint, broadcast fans out to a namespace, and the
//! room operations enforce ownership and capacity. Matchmaking fires
//! once enough clients wait on the same namespace.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::mpsc;

use peerq_sdk::client::{Client, ClientConfig};
use peerq_sdk::loopback::{LoopbackConnector, LoopbackEngine};
use peerq_sdk::protocol::{Envelope, MessageType, PeerInfo};
use peerq_sdk::socket::{SocketEvent, SocketHalves};

pub struct TestServer {
    connector: Arc<LoopbackConnector>,
    state: Arc<Mutex<ServerState>>,
}

#[derive(Default)]
struct ServerState {
    /// fingerprint → live connection handles.
    clients: HashMap<String, ClientConn>,
    aliases: HashMap<String, String>,
    /// public key → fingerprint, stable across reconnects.
    known_keys: HashMap<String, String>,
    namespaces: HashMap<String, HashSet<String>>,
    rooms: HashMap<String, RoomMeta>,
    waiting_matches: HashMap<String, Vec<String>>,
    next_fp: u64,
}

struct RoomMeta {
    owner: String,
    max_size: u32,
}

#[derive(Clone)]
struct ClientConn {
    tx: mpsc::UnboundedSender<String>,
    close_tx: mpsc::UnboundedSender<()>,
}

impl TestServer {
    pub fn start() -> Arc<Self> {
        let (connector, mut accept_rx) = LoopbackConnector::new();
        let server = Arc::new(Self {
            connector,
            state: Arc::new(Mutex::new(ServerState::default())),
        });

        let accept_server = server.clone();
        tokio::spawn(async move {
            while let Some(halves) = accept_rx.recv().await {
                tokio::spawn(run_connection(accept_server.clone(), halves));
            }
        });
        server
    }

    pub fn connector(&self) -> Arc<LoopbackConnector> {
        self.connector.clone()
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.connector.set_refuse(refuse);
    }

    /// Drop a client's connection server-side (simulates a dead link).
    pub fn drop_client(&self, fingerprint: &str) {
        let conn = self.state.lock().clients.remove(fingerprint);
        if let Some(conn) = conn {
            let _ = conn.close_tx.send(());
        }
    }

    fn send_to(&self, fingerprint: &str, env: &Envelope) {
        let conn = self.state.lock().clients.get(fingerprint).cloned();
        if let Some(conn) = conn
            && let Ok(frame) = env.encode()
        {
            let _ = conn.tx.send(frame);
        }
    }

    fn peer_info(&self, fingerprint: &str) -> PeerInfo {
        let state = self.state.lock();
        PeerInfo {
            fingerprint: fingerprint.to_string(),
            alias: state.aliases.get(fingerprint).cloned().unwrap_or_default(),
            meta: None,
            app_type: None,
        }
    }

    fn members(&self, namespace: &str, except: &str) -> Vec<String> {
        self.state
            .lock()
            .namespaces
            .get(namespace)
            .map(|set| set.iter().filter(|fp| *fp != except).cloned().collect())
            .unwrap_or_default()
    }
}

async fn run_connection(server: Arc<TestServer>, halves: SocketHalves) {
    let (mut sink, mut stream) = halves;
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let (close_tx, mut close_rx) = mpsc::unbounded_channel::<()>();

    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                frame = rx.recv() => match frame {
                    Some(frame) => {
                        if sink.send(&frame).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                _ = close_rx.recv() => break,
            }
        }
        sink.close(1001, "server dropped connection").await;
    });

    let mut fingerprint: Option<String> = None;
    while let Some(event) = stream.recv().await {
        match event {
            SocketEvent::Message(frame) => {
                let Ok(env) = Envelope::parse(&frame) else { continue };
                handle_frame(&server, &tx, &close_tx, &mut fingerprint, env);
            }
            SocketEvent::Closed { .. } => break,
        }
    }

    if let Some(fp) = fingerprint {
        let namespaces: Vec<String> = {
            let mut state = server.state.lock();
            state.clients.remove(&fp);
            let shared: Vec<String> = state
                .namespaces
                .iter_mut()
                .filter_map(|(ns, members)| members.remove(&fp).then(|| ns.clone()))
                .collect();
            shared
        };
        for namespace in namespaces {
            let info = server.peer_info(&fp);
            for member in server.members(&namespace, &fp) {
                let env = Envelope::new(MessageType::PeerLeft)
                    .with_namespace(&namespace)
                    .with_payload(&info)
                    .unwrap();
                server.send_to(&member, &env);
            }
        }
    }
    writer.abort();
}

fn handle_frame(
    server: &Arc<TestServer>,
    tx: &mpsc::UnboundedSender<String>,
    close_tx: &mpsc::UnboundedSender<()>,
    fingerprint: &mut Option<String>,
    env: Envelope,
) {
    let reply = |env: &Envelope| {
        if let Ok(frame) = env.encode() {
            let _ = tx.send(frame);
        }
    };

    match env.kind {
        MessageType::Register => {
            let payload = env.normalized_payload().unwrap_or(Value::Null);
            let public_key = payload["public_key"].as_str().unwrap_or("").to_string();
            let alias = payload["alias"].as_str().unwrap_or("").to_string();

            let fp = {
                let mut state = server.state.lock();
                let fp = match state.known_keys.get(&public_key).cloned() {
                    Some(fp) => fp,
                    None => {
                        state.next_fp += 1;
                        let fp = format!("fp-{}", state.next_fp);
                        state.known_keys.insert(public_key.clone(), fp.clone());
                        fp
                    }
                };
                state.clients.insert(
                    fp.clone(),
                    ClientConn {
                        tx: tx.clone(),
                        close_tx: close_tx.clone(),
                    },
                );
                state.aliases.insert(fp.clone(), alias.clone());
                fp
            };
            *fingerprint = Some(fp.clone());

            reply(
                &Envelope::new(MessageType::Registered)
                    .with_payload(&json!({ "fingerprint": fp, "alias": alias }))
                    .unwrap(),
            );
        }
        MessageType::Join | MessageType::JoinRoom => {
            let Some(fp) = fingerprint.clone() else { return };
            let payload = env.normalized_payload().unwrap_or(Value::Null);
            let namespace = payload["namespace"]
                .as_str()
                .or(payload["room_id"].as_str())
                .unwrap_or_default()
                .to_string();

            if env.kind == MessageType::JoinRoom {
                let state = server.state.lock();
                let Some(room) = state.rooms.get(&namespace) else {
                    drop(state);
                    reply(
                        &Envelope::new(MessageType::Error)
                            .with_payload(&json!({ "message": "no such room" }))
                            .unwrap(),
                    );
                    return;
                };
                let occupancy = state
                    .namespaces
                    .get(&namespace)
                    .map(HashSet::len)
                    .unwrap_or(0) as u32;
                if occupancy >= room.max_size {
                    drop(state);
                    reply(
                        &Envelope::new(MessageType::Error)
                            .with_payload(&json!({ "message": "room full" }))
                            .unwrap(),
                    );
                    return;
                }
            }

            let others = server.members(&namespace, &fp);
            server
                .state
                .lock()
                .namespaces
                .entry(namespace.clone())
                .or_default()
                .insert(fp.clone());

            let peers: Vec<PeerInfo> = others.iter().map(|m| server.peer_info(m)).collect();
            reply(
                &Envelope::new(MessageType::PeerList)
                    .with_namespace(&namespace)
                    .with_payload(&json!({ "namespace": namespace, "peers": peers }))
                    .unwrap(),
            );

            let info = server.peer_info(&fp);
            for member in others {
                let env = Envelope::new(MessageType::PeerJoined)
                    .with_namespace(&namespace)
                    .with_payload(&info)
                    .unwrap();
                server.send_to(&member, &env);
            }
        }
        MessageType::Leave => {
            let Some(fp) = fingerprint.clone() else { return };
            let payload = env.normalized_payload().unwrap_or(Value::Null);
            let namespace = payload["namespace"].as_str().unwrap_or_default().to_string();
            if let Some(members) = server.state.lock().namespaces.get_mut(&namespace) {
                members.remove(&fp);
            }
            let info = server.peer_info(&fp);
            for member in server.members(&namespace, &fp) {
                let env = Envelope::new(MessageType::PeerLeft)
                    .with_namespace(&namespace)
                    .with_payload(&info)
                    .unwrap();
                server.send_to(&member, &env);
            }
        }
        MessageType::Discover => {
            let payload = env.normalized_payload().unwrap_or(Value::Null);
            let namespace = payload["namespace"].as_str().unwrap_or_default().to_string();
            let except = fingerprint.clone().unwrap_or_default();
            let peers: Vec<PeerInfo> = server
                .members(&namespace, &except)
                .iter()
                .map(|m| server.peer_info(m))
                .collect();
            reply(
                &Envelope::new(MessageType::PeerList)
                    .with_namespace(&namespace)
                    .with_payload(&json!({ "namespace": namespace, "peers": peers }))
                    .unwrap(),
            );
        }
        MessageType::Signal | MessageType::Relay => {
            let Some(from) = fingerprint.clone() else { return };
            let Some(to) = env.to.clone() else { return };
            let mut forward = Envelope::new(env.kind);
            forward.from = Some(from);
            forward.payload = env.payload;
            server.send_to(&to, &forward);
        }
        MessageType::Broadcast => {
            let Some(from) = fingerprint.clone() else { return };
            let payload = env.normalized_payload().unwrap_or(Value::Null);
            let namespace = payload["namespace"].as_str().unwrap_or_default().to_string();
            for member in server.members(&namespace, &from) {
                let mut forward = Envelope::new(MessageType::Broadcast);
                forward.from = Some(from.clone());
                forward.payload = Some(payload.clone());
                server.send_to(&member, &forward);
            }
        }
        MessageType::Match => {
            let Some(fp) = fingerprint.clone() else { return };
            let payload = env.normalized_payload().unwrap_or(Value::Null);
            let namespace = payload["namespace"].as_str().unwrap_or_default().to_string();
            let group_size = payload["group_size"].as_u64().unwrap_or(2) as usize;

            let matched: Option<Vec<String>> = {
                let mut state = server.state.lock();
                let waiting = state.waiting_matches.entry(namespace.clone()).or_default();
                waiting.retain(|w| w != &fp);
                waiting.push(fp);
                (waiting.len() >= group_size)
                    .then(|| waiting.drain(..).collect())
            };

            if let Some(group) = matched {
                let session_id = format!("session-{namespace}");
                for member in &group {
                    let peers: Vec<PeerInfo> = group
                        .iter()
                        .filter(|fp| fp != &member)
                        .map(|fp| server.peer_info(fp))
                        .collect();
                    let env = Envelope::new(MessageType::Matched)
                        .with_namespace(&namespace)
                        .with_payload(&json!({
                            "namespace": namespace,
                            "session_id": session_id,
                            "peers": peers,
                        }))
                        .unwrap();
                    server.send_to(member, &env);
                }
            }
        }
        MessageType::CreateRoom => {
            let Some(fp) = fingerprint.clone() else { return };
            let payload = env.normalized_payload().unwrap_or(Value::Null);
            let room_id = payload["room_id"].as_str().unwrap_or_default().to_string();
            let max_size = payload["max_size"].as_u64().unwrap_or(2) as u32;

            {
                let mut state = server.state.lock();
                state.rooms.insert(
                    room_id.clone(),
                    RoomMeta {
                        owner: fp.clone(),
                        max_size,
                    },
                );
                state
                    .namespaces
                    .entry(room_id.clone())
                    .or_default()
                    .insert(fp.clone());
            }
            reply(
                &Envelope::new(MessageType::RoomCreated)
                    .with_payload(&json!({
                        "room_id": room_id,
                        "max_size": max_size,
                        "owner": fp,
                    }))
                    .unwrap(),
            );
        }
        MessageType::RoomInfo => {
            let payload = env.normalized_payload().unwrap_or(Value::Null);
            let room_id = payload["room_id"].as_str().unwrap_or_default().to_string();
            let state = server.state.lock();
            if let Some(room) = state.rooms.get(&room_id) {
                let peer_count = state
                    .namespaces
                    .get(&room_id)
                    .map(HashSet::len)
                    .unwrap_or(0) as u32;
                let body = json!({
                    "room_id": room_id,
                    "peer_count": peer_count,
                    "max_size": room.max_size,
                    "owner": room.owner,
                });
                drop(state);
                reply(
                    &Envelope::new(MessageType::RoomInfo)
                        .with_payload(&body)
                        .unwrap(),
                );
            }
        }
        MessageType::Kick => {
            let Some(from) = fingerprint.clone() else { return };
            let payload = env.normalized_payload().unwrap_or(Value::Null);
            let room_id = payload["room_id"].as_str().unwrap_or_default().to_string();
            let target = payload["fingerprint"].as_str().unwrap_or_default().to_string();

            let allowed = server
                .state
                .lock()
                .rooms
                .get(&room_id)
                .is_some_and(|room| room.owner == from);
            if !allowed {
                return;
            }
            if let Some(members) = server.state.lock().namespaces.get_mut(&room_id) {
                members.remove(&target);
            }
            let env = Envelope::new(MessageType::Kick)
                .with_payload(&json!({ "room_id": room_id }))
                .unwrap();
            server.send_to(&target, &env);
        }
        MessageType::Ping => {
            reply(&Envelope::new(MessageType::Pong));
        }
        MessageType::Metadata | MessageType::Pong => {}
        _ => {}
    }
}

/// One server plus a shared RTC engine; clients made here can reach
/// each other both through signaling and peer-to-peer.
pub struct TestHarness {
    pub server: Arc<TestServer>,
    pub engine: Arc<LoopbackEngine>,
}

impl TestHarness {
    pub fn new() -> Self {
        Self {
            server: TestServer::start(),
            engine: Arc::new(LoopbackEngine::new()),
        }
    }

    pub fn client(&self, alias: &str) -> Client {
        Client::new(
            self.server.connector(),
            self.engine.clone(),
            ClientConfig {
                url: "loop://signaling".to_string(),
                alias: alias.to_string(),
                reconnect_delay: std::time::Duration::from_millis(20),
                ..ClientConfig::default()
            },
        )
    }

    /// Connect, register, and return the bound fingerprint.
    pub async fn online_client(&self, alias: &str) -> (Client, String) {
        let client = self.client(alias);
        client.connect().await.expect("connect failed");
        let registered = client.register().await.expect("register failed");
        (client, registered.fingerprint)
    }
}
