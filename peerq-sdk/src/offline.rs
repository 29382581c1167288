//! Offline-capable sync room: the replication of [`crate::sync`] with a
//! durable layer underneath.
//!
//! Three store partitions back one room: `state` (entries by key),
//! `pending` (queued operations by id, replayed in `ts` order), and
//! `meta` (restored clock and `lastSync`). Every persisted record is
//! tagged with the schema version; unknown versions are skipped on
//! restore.
//!
//! Writes always apply and persist locally. When the transport is open
//! they replicate immediately; otherwise they join the pending queue,
//! capped at `max_pending_ops` (overflow surfaces an error and the
//! operation is dropped from the queue, never from local state). On
//! reconnect the room catches peers up with full state in bounded
//! batches (10ms yield between batches), replays the queue in `ts`
//! order, stamps `lastSync`, and guards the whole pass against
//! re-entry.
//!
//! With `encryption_enabled`, a per-peer ECDH exchange rides relay
//! frames tagged `_osr`, and replicated entries travel encrypted to
//! each peer with an established key instead of broadcast plaintext.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use p256::ecdh::EphemeralSecret;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::mpsc;

use crate::client::{Client, ClientEvent, ClientEventKind};
use crate::e2e::{decrypt_frame, derive_shared_key, encrypt_frame, generate_exchange_keys};
use crate::emitter::{BusEvent, Emitter};
use crate::error::Error;
use crate::hlc::{Hlc, now_millis};
use crate::ids;
use crate::store::{KvStore, SCHEMA_VERSION};
use crate::sync::{MergeFn, SyncEntry, SyncFrame, lww_apply, parse_sync_frame, sync_frame};
use crate::transport::TransportState;

/// Default cap on queued offline operations.
pub const MAX_PENDING_OPS: usize = 500;
/// Default entries per catch-up batch.
pub const SYNC_BATCH_SIZE: usize = 50;

const BATCH_YIELD: std::time::Duration = std::time::Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpType {
    Set,
    Delete,
}

/// One queued offline operation, durable until replayed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfflineOperation {
    pub id: String,
    #[serde(rename = "type")]
    pub op_type: OpType,
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    pub hlc: Hlc,
    pub ts: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictResolution {
    Lww,
    Merge,
}

#[derive(Clone)]
pub struct OfflineSyncConfig {
    pub conflict_resolution: ConflictResolution,
    pub merge: Option<MergeFn>,
    pub encryption_enabled: bool,
    pub max_pending_ops: usize,
    pub sync_batch_size: usize,
}

impl Default for OfflineSyncConfig {
    fn default() -> Self {
        Self {
            conflict_resolution: ConflictResolution::Lww,
            merge: None,
            encryption_enabled: false,
            max_pending_ops: MAX_PENDING_OPS,
            sync_batch_size: SYNC_BATCH_SIZE,
        }
    }
}

#[derive(Debug, Clone)]
pub enum OfflineSyncEvent {
    StateChanged {
        key: String,
        value: Option<Value>,
        from: String,
    },
    Conflict {
        key: String,
        local: Value,
        remote: Value,
        merged: Value,
    },
    SyncStarted,
    SyncComplete,
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OfflineSyncEventKind {
    StateChanged,
    Conflict,
    SyncStarted,
    SyncComplete,
    Error,
}

impl BusEvent for OfflineSyncEvent {
    type Kind = OfflineSyncEventKind;

    fn kind(&self) -> OfflineSyncEventKind {
        match self {
            OfflineSyncEvent::StateChanged { .. } => OfflineSyncEventKind::StateChanged,
            OfflineSyncEvent::Conflict { .. } => OfflineSyncEventKind::Conflict,
            OfflineSyncEvent::SyncStarted => OfflineSyncEventKind::SyncStarted,
            OfflineSyncEvent::SyncComplete => OfflineSyncEventKind::SyncComplete,
            OfflineSyncEvent::Error(_) => OfflineSyncEventKind::Error,
        }
    }
}

/// Work items applied strictly in arrival order by the worker task.
enum Incoming {
    Update { entry: SyncEntry, from: String },
    FullState { entries: Vec<SyncEntry>, from: String },
    KeyOffer { from: String, public: String },
    KeyAck { from: String, public: String },
    Encrypted { from: String, data: String },
    PeerJoined { fingerprint: String },
    StateRequested { from: String },
    WentOnline,
}

fn versioned(kind: &str, body: Value) -> Value {
    let mut record = serde_json::Map::new();
    record.insert("version".to_string(), json!(SCHEMA_VERSION));
    record.insert(kind.to_string(), body);
    Value::Object(record)
}

fn unversioned(record: &Value, kind: &str) -> Option<Value> {
    if record.get("version").and_then(Value::as_u64) != Some(SCHEMA_VERSION as u64) {
        return None;
    }
    record.get(kind).cloned()
}

/// Durable replicated state for one room.
#[derive(Clone)]
pub struct OfflineSyncRoom {
    inner: Arc<OfflineInner>,
}

struct OfflineInner {
    client: Client,
    room_id: String,
    store: Arc<dyn KvStore>,
    resolution: ConflictResolution,
    merge: Option<MergeFn>,
    encryption_enabled: bool,
    max_pending_ops: usize,
    sync_batch_size: usize,
    hlc: Mutex<Hlc>,
    state: Mutex<HashMap<String, SyncEntry>>,
    syncing: AtomicBool,
    secret: Mutex<Option<EphemeralSecret>>,
    peer_keys: Mutex<HashMap<String, [u8; 32]>>,
    events: Emitter<OfflineSyncEvent>,
    closed: AtomicBool,
    incoming_tx: mpsc::UnboundedSender<Incoming>,
}

impl OfflineSyncRoom {
    /// Restores the clock and state from the store before returning.
    /// `merge` resolution without a merge function fails here.
    pub async fn new(
        client: Client,
        room_id: impl Into<String>,
        store: Arc<dyn KvStore>,
        config: OfflineSyncConfig,
    ) -> Result<Self, Error> {
        if config.conflict_resolution == ConflictResolution::Merge && config.merge.is_none() {
            return Err(Error::Config(
                "merge conflict resolution requires a merge function".to_string(),
            ));
        }

        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(OfflineInner {
            client,
            room_id: room_id.into(),
            store,
            resolution: config.conflict_resolution,
            merge: config.merge,
            encryption_enabled: config.encryption_enabled,
            max_pending_ops: config.max_pending_ops,
            sync_batch_size: config.sync_batch_size,
            hlc: Mutex::new(Hlc::new("")),
            state: Mutex::new(HashMap::new()),
            syncing: AtomicBool::new(false),
            secret: Mutex::new(None),
            peer_keys: Mutex::new(HashMap::new()),
            events: Emitter::new(),
            closed: AtomicBool::new(false),
            incoming_tx,
        });

        inner.restore().await?;
        OfflineInner::install_listeners(&inner);
        tokio::spawn(OfflineInner::run_worker(inner.clone(), incoming_rx));
        Ok(Self { inner })
    }

    pub fn room_id(&self) -> &str {
        &self.inner.room_id
    }

    pub fn events(&self) -> &Emitter<OfflineSyncEvent> {
        &self.inner.events
    }

    /// Write locally, persist, and replicate or queue.
    pub async fn set(&self, key: &str, value: Value) -> Result<(), Error> {
        self.inner.local_write(key, Some(value)).await
    }

    /// Tombstone locally, persist, and replicate or queue.
    pub async fn delete(&self, key: &str) -> Result<(), Error> {
        self.inner.local_write(key, None).await
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner
            .state
            .lock()
            .get(key)
            .filter(|entry| !entry.deleted)
            .map(|entry| entry.value.clone())
    }

    pub fn get_all(&self) -> HashMap<String, Value> {
        self.inner
            .state
            .lock()
            .iter()
            .filter(|(_, entry)| !entry.deleted)
            .map(|(key, entry)| (key.clone(), entry.value.clone()))
            .collect()
    }

    /// Number of queued operations awaiting replay.
    pub async fn pending_count(&self) -> Result<usize, Error> {
        self.inner
            .store
            .count_pending()
            .await
            .map_err(|e| Error::Storage(e.to_string()))
    }

    /// Tell the room the network came back (for embedders whose online
    /// signal is not the coordinator's reconnect event).
    pub fn notify_online(&self) {
        let _ = self.inner.incoming_tx.send(Incoming::WentOnline);
    }

    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.events.remove_all(None);
    }
}

impl OfflineInner {
    fn node(&self) -> String {
        self.client.fingerprint().unwrap_or_default()
    }

    fn online(&self) -> bool {
        self.client.transport().state() == TransportState::Open
    }

    async fn restore(&self) -> Result<(), Error> {
        if let Some(meta) = self
            .store
            .get_meta("hlc")
            .await
            .map_err(|e| Error::Storage(e.to_string()))?
            && let Some(body) = unversioned(&meta, "hlc")
            && let Ok(hlc) = serde_json::from_value::<Hlc>(body)
        {
            *self.hlc.lock() = hlc;
        }

        let records = self
            .store
            .all_state()
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;
        let mut state = self.state.lock();
        for (key, record) in records {
            if let Some(body) = unversioned(&record, "entry")
                && let Ok(entry) = serde_json::from_value::<SyncEntry>(body)
            {
                state.insert(key, entry);
            }
        }
        Ok(())
    }

    /// Tick, apply locally, persist, then replicate or queue.
    async fn local_write(&self, key: &str, value: Option<Value>) -> Result<(), Error> {
        let deleted = value.is_none();
        let entry = {
            let mut hlc = self.hlc.lock();
            hlc.node = self.node();
            hlc.tick();
            SyncEntry {
                key: key.to_string(),
                value: value.clone().unwrap_or(Value::Null),
                hlc: hlc.clone(),
                from: hlc.node.clone(),
                version: hlc.counter,
                deleted,
            }
        };
        self.state.lock().insert(key.to_string(), entry.clone());
        self.persist_entry(&entry).await;
        self.persist_clock().await;

        if self.online() {
            self.publish(&entry).await;
            Ok(())
        } else {
            let op = OfflineOperation {
                id: ids::generate(),
                op_type: if deleted { OpType::Delete } else { OpType::Set },
                key: key.to_string(),
                value,
                hlc: entry.hlc.clone(),
                ts: now_millis(),
            };
            self.queue_pending(op).await
        }
    }

    async fn queue_pending(&self, op: OfflineOperation) -> Result<(), Error> {
        let count = self
            .store
            .count_pending()
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;
        if count >= self.max_pending_ops {
            self.events.emit(&OfflineSyncEvent::Error(
                "Pending operations limit reached".to_string(),
            ));
            return Err(Error::QuotaExceeded);
        }
        let record = versioned("op", serde_json::to_value(&op).unwrap_or(Value::Null));
        self.store
            .put_pending(&op.id, record)
            .await
            .map_err(|e| Error::Storage(e.to_string()))
    }

    async fn persist_entry(&self, entry: &SyncEntry) {
        let record = versioned("entry", serde_json::to_value(entry).unwrap_or(Value::Null));
        if let Err(err) = self.store.put_state(&entry.key, record).await {
            self.events
                .emit(&OfflineSyncEvent::Error(format!("storage error: {err}")));
        }
    }

    async fn persist_clock(&self) {
        let hlc = self.hlc.lock().clone();
        let record = versioned("hlc", serde_json::to_value(&hlc).unwrap_or(Value::Null));
        if let Err(err) = self.store.put_meta("hlc", record).await {
            tracing::warn!(error = %err, "clock persist failed");
        }
    }

    /// Replicate one entry: encrypted per peer when keys exist,
    /// plaintext broadcast otherwise.
    async fn publish(&self, entry: &SyncEntry) {
        if self.encryption_enabled {
            let keys: Vec<(String, [u8; 32])> = self
                .peer_keys
                .lock()
                .iter()
                .map(|(fp, key)| (fp.clone(), *key))
                .collect();
            if !keys.is_empty() {
                let plaintext = serde_json::to_vec(entry).unwrap_or_default();
                for (fingerprint, key) in keys {
                    match encrypt_frame(&key, &plaintext) {
                        Ok(data) => {
                            let frame = json!({
                                "_osr": true,
                                "type": "encrypted_update",
                                "_room": self.room_id,
                                "data": data,
                            });
                            if let Err(err) = self.client.relay(&fingerprint, frame) {
                                tracing::debug!(error = %err, "encrypted update relay failed");
                            }
                        }
                        Err(err) => self
                            .events
                            .emit(&OfflineSyncEvent::Error(err.to_string())),
                    }
                }
                return;
            }
        }
        let frame = sync_frame(&SyncFrame::Update { entry: entry.clone() }, None);
        if let Err(err) = self.client.broadcast(&self.room_id, frame) {
            tracing::debug!(error = %err, "update broadcast failed");
        }
    }

    /// Catch-up pass: full state in batches, then pending replay in
    /// `ts` order, then the `lastSync` stamp. `syncing` guards re-entry.
    async fn run_sync(&self) {
        if self.syncing.swap(true, Ordering::SeqCst) {
            return;
        }
        self.events.emit(&OfflineSyncEvent::SyncStarted);

        let entries: Vec<SyncEntry> = self.state.lock().values().cloned().collect();
        for batch in entries.chunks(self.sync_batch_size.max(1)) {
            let frame = sync_frame(
                &SyncFrame::FullState {
                    state: batch.to_vec(),
                },
                None,
            );
            if let Err(err) = self.client.broadcast(&self.room_id, frame) {
                tracing::debug!(error = %err, "catch-up batch failed");
            }
            tokio::time::sleep(BATCH_YIELD).await;
        }

        match self.store.all_pending().await {
            Ok(records) => {
                let mut ops: Vec<OfflineOperation> = records
                    .iter()
                    .filter_map(|record| unversioned(record, "op"))
                    .filter_map(|body| serde_json::from_value(body).ok())
                    .collect();
                ops.sort_by_key(|op| op.ts);

                for op in ops {
                    let entry = SyncEntry {
                        key: op.key.clone(),
                        value: op.value.clone().unwrap_or(Value::Null),
                        hlc: op.hlc.clone(),
                        from: op.hlc.node.clone(),
                        version: op.hlc.counter,
                        deleted: op.op_type == OpType::Delete,
                    };
                    self.publish(&entry).await;
                    if let Err(err) = self.store.delete_pending(&op.id).await {
                        tracing::warn!(error = %err, id = %op.id, "pending removal failed");
                    }
                }
            }
            Err(err) => self
                .events
                .emit(&OfflineSyncEvent::Error(format!("storage error: {err}"))),
        }

        let stamp = versioned("lastSync", json!(now_millis()));
        if let Err(err) = self.store.put_meta("lastSync", stamp).await {
            tracing::warn!(error = %err, "lastSync persist failed");
        }
        self.syncing.store(false, Ordering::SeqCst);
        self.events.emit(&OfflineSyncEvent::SyncComplete);
    }

    /// Resolve one remote entry, persist the outcome, and emit.
    async fn apply_remote(&self, entry: SyncEntry, from: &str) {
        {
            let mut hlc = self.hlc.lock();
            hlc.node = self.node();
            hlc.merge(&entry.hlc);
        }

        let use_merge = self.resolution == ConflictResolution::Merge;
        let local = self
            .state
            .lock()
            .get(&entry.key)
            .filter(|local| !local.deleted)
            .cloned();

        if use_merge && let Some(local) = local {
            let merge = self.merge.as_ref().expect("guarded at construction");
            let merged = merge(&local.value, &entry.value);
            let resolved = {
                let mut hlc = self.hlc.lock();
                hlc.tick();
                SyncEntry {
                    key: entry.key.clone(),
                    value: merged.clone(),
                    hlc: hlc.clone(),
                    from: self.node(),
                    version: hlc.counter,
                    deleted: false,
                }
            };
            self.state
                .lock()
                .insert(entry.key.clone(), resolved.clone());
            self.persist_entry(&resolved).await;
            self.events.emit(&OfflineSyncEvent::Conflict {
                key: entry.key.clone(),
                local: local.value,
                remote: entry.value,
                merged: merged.clone(),
            });
            self.events.emit(&OfflineSyncEvent::StateChanged {
                key: entry.key,
                value: Some(merged),
                from: from.to_string(),
            });
            if self.online() {
                self.publish(&resolved).await;
            }
            return;
        }

        let key = entry.key.clone();
        let deleted = entry.deleted;
        let value = entry.value.clone();
        let replaced = lww_apply(&mut self.state.lock(), entry);
        if replaced {
            let persisted = self.state.lock().get(&key).cloned();
            if let Some(persisted) = persisted {
                self.persist_entry(&persisted).await;
            }
            self.events.emit(&OfflineSyncEvent::StateChanged {
                key,
                value: if deleted { None } else { Some(value) },
                from: from.to_string(),
            });
        }
        self.persist_clock().await;
    }

    /// Relay the whole state to one peer, encrypted with their key.
    async fn send_encrypted_state(&self, fingerprint: &str) {
        let key = match self.peer_keys.lock().get(fingerprint) {
            Some(key) => *key,
            None => return,
        };
        let entries: Vec<SyncEntry> = self.state.lock().values().cloned().collect();
        for entry in entries {
            let plaintext = serde_json::to_vec(&entry).unwrap_or_default();
            if let Ok(data) = encrypt_frame(&key, &plaintext) {
                let frame = json!({
                    "_osr": true,
                    "type": "encrypted_update",
                    "_room": self.room_id,
                    "data": data,
                });
                let _ = self.client.relay(fingerprint, frame);
            }
        }
    }

    fn ensure_secret(&self) -> String {
        let mut slot = self.secret.lock();
        if slot.is_none() {
            let (secret, public) = generate_exchange_keys();
            *slot = Some(secret);
            return public;
        }
        let secret = slot.as_ref().expect("just checked");
        use base64::Engine;
        base64::engine::general_purpose::STANDARD.encode(secret.public_key().to_sec1_bytes())
    }

    fn derive_peer_key(&self, from: &str, public: &str) -> bool {
        self.ensure_secret();
        let slot = self.secret.lock();
        let secret = slot.as_ref().expect("ensured above");
        match derive_shared_key(secret, public) {
            Ok(key) => {
                self.peer_keys.lock().insert(from.to_string(), key);
                true
            }
            Err(err) => {
                self.events.emit(&OfflineSyncEvent::Error(err.to_string()));
                false
            }
        }
    }

    fn key_exchange_frame(&self, kind: &str) -> Value {
        json!({
            "_osr": true,
            "type": kind,
            "_room": self.room_id,
            "publicKey": self.ensure_secret(),
        })
    }

    async fn run_worker(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<Incoming>) {
        while let Some(item) = rx.recv().await {
            if self.closed.load(Ordering::SeqCst) {
                break;
            }
            match item {
                Incoming::Update { entry, from } => self.apply_remote(entry, &from).await,
                Incoming::FullState { entries, from } => {
                    for entry in entries {
                        self.apply_remote(entry, &from).await;
                    }
                }
                Incoming::KeyOffer { from, public } => {
                    if self.derive_peer_key(&from, &public) {
                        let reply = self.key_exchange_frame("key_ack");
                        let _ = self.client.relay(&from, reply);
                        self.send_encrypted_state(&from).await;
                    }
                }
                Incoming::KeyAck { from, public } => {
                    if self.derive_peer_key(&from, &public) {
                        self.send_encrypted_state(&from).await;
                    }
                }
                Incoming::Encrypted { from, data } => {
                    let key = self.peer_keys.lock().get(&from).copied();
                    let Some(key) = key else {
                        self.events.emit(&OfflineSyncEvent::Error(
                            "encrypted update without a peer key".to_string(),
                        ));
                        continue;
                    };
                    match decrypt_frame(&key, &data)
                        .ok()
                        .and_then(|plain| serde_json::from_slice::<SyncEntry>(&plain).ok())
                    {
                        Some(entry) => self.apply_remote(entry, &from).await,
                        None => self.events.emit(&OfflineSyncEvent::Error(
                            "encrypted update failed to decrypt".to_string(),
                        )),
                    }
                }
                Incoming::PeerJoined { fingerprint } => {
                    if self.encryption_enabled {
                        let offer = self.key_exchange_frame("key_offer");
                        let _ = self.client.relay(&fingerprint, offer);
                    } else {
                        // Plaintext rooms catch the newcomer up directly.
                        let entries: Vec<SyncEntry> =
                            self.state.lock().values().cloned().collect();
                        if !entries.is_empty() {
                            let frame =
                                sync_frame(&SyncFrame::FullState { state: entries }, None);
                            let _ = self.client.broadcast(&self.room_id, frame);
                        }
                    }
                }
                Incoming::StateRequested { from } => {
                    if self.encryption_enabled && self.peer_keys.lock().contains_key(&from) {
                        self.send_encrypted_state(&from).await;
                    } else {
                        let entries: Vec<SyncEntry> =
                            self.state.lock().values().cloned().collect();
                        if !entries.is_empty() {
                            let frame = sync_frame(
                                &SyncFrame::FullState { state: entries },
                                Some(&self.room_id),
                            );
                            let _ = self.client.relay(&from, frame);
                        }
                    }
                }
                Incoming::WentOnline => self.run_sync().await,
            }
        }
    }

    fn install_listeners(inner: &Arc<OfflineInner>) {
        let client_events = inner.client.events().clone();
        {
            let inner = inner.clone();
            client_events.on(ClientEventKind::Reconnected, move |_| {
                if !inner.closed.load(Ordering::SeqCst) {
                    let _ = inner.incoming_tx.send(Incoming::WentOnline);
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
                    && let Some(frame) = parse_sync_frame(data)
                {
                    let item = match frame {
                        SyncFrame::Update { entry } => Incoming::Update {
                            entry,
                            from: from.clone(),
                        },
                        SyncFrame::FullState { state } => Incoming::FullState {
                            entries: state,
                            from: from.clone(),
                        },
                        SyncFrame::RequestState => Incoming::StateRequested {
                            from: from.clone(),
                        },
                    };
                    let _ = inner.incoming_tx.send(item);
                }
                Ok(())
            });
        }
        {
            let inner = inner.clone();
            client_events.on(ClientEventKind::Relay, move |ev| {
                let ClientEvent::Relay { from, payload } = ev else {
                    return Ok(());
                };
                if inner.closed.load(Ordering::SeqCst)
                    || payload.get("_room").and_then(Value::as_str)
                        != Some(inner.room_id.as_str())
                {
                    return Ok(());
                }

                // Targeted sync frames (state-request replies).
                if let Some(frame) = parse_sync_frame(payload) {
                    let item = match frame {
                        SyncFrame::Update { entry } => Incoming::Update {
                            entry,
                            from: from.clone(),
                        },
                        SyncFrame::FullState { state } => Incoming::FullState {
                            entries: state,
                            from: from.clone(),
                        },
                        SyncFrame::RequestState => Incoming::StateRequested {
                            from: from.clone(),
                        },
                    };
                    let _ = inner.incoming_tx.send(item);
                    return Ok(());
                }

                if payload.get("_osr").and_then(Value::as_bool) == Some(true) {
                    let kind = payload.get("type").and_then(Value::as_str).unwrap_or("");
                    let item = match kind {
                        "key_offer" => payload
                            .get("publicKey")
                            .and_then(Value::as_str)
                            .map(|public| Incoming::KeyOffer {
                                from: from.clone(),
                                public: public.to_string(),
                            }),
                        "key_ack" => payload
                            .get("publicKey")
                            .and_then(Value::as_str)
                            .map(|public| Incoming::KeyAck {
                                from: from.clone(),
                                public: public.to_string(),
                            }),
                        "encrypted_update" => payload
                            .get("data")
                            .and_then(Value::as_str)
                            .map(|data| Incoming::Encrypted {
                                from: from.clone(),
                                data: data.to_string(),
                            }),
                        _ => None,
                    };
                    if let Some(item) = item {
                        let _ = inner.incoming_tx.send(item);
                    }
                }
                Ok(())
            });
        }
        {
            let inner = inner.clone();
            client_events.on(ClientEventKind::PeerJoined, move |ev| {
                if let ClientEvent::PeerJoined { namespace, peer } = ev
                    && namespace == &inner.room_id
                    && !inner.closed.load(Ordering::SeqCst)
                {
                    let _ = inner.incoming_tx.send(Incoming::PeerJoined {
                        fingerprint: peer.fingerprint.clone(),
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
    use crate::client::ClientConfig;
    use crate::loopback::{LoopbackConnector, LoopbackEngine};
    use crate::store::MemoryStore;

    fn offline_client() -> Client {
        let (connector, _accept_rx) = LoopbackConnector::new();
        let engine = Arc::new(LoopbackEngine::new());
        // Never connected: every write goes down the offline path.
        Client::new(
            connector,
            engine,
            ClientConfig {
                url: "loop://sig".to_string(),
                ..ClientConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn writes_queue_while_offline_and_survive_restore() {
        let client = offline_client();
        let store = Arc::new(MemoryStore::new());
        let room = OfflineSyncRoom::new(
            client.clone(),
            "notes",
            store.clone(),
            OfflineSyncConfig::default(),
        )
        .await
        .unwrap();

        room.set("title", json!("draft")).await.unwrap();
        room.delete("obsolete").await.unwrap();

        assert_eq!(room.get("title"), Some(json!("draft")));
        assert_eq!(room.get("obsolete"), None);
        assert_eq!(store.count_pending().await.unwrap(), 2);

        // A second instance over the same store sees the state and clock.
        let restored = OfflineSyncRoom::new(
            client,
            "notes",
            store.clone(),
            OfflineSyncConfig::default(),
        )
        .await
        .unwrap();
        assert_eq!(restored.get("title"), Some(json!("draft")));
        assert_eq!(restored.get("obsolete"), None);
    }

    #[tokio::test]
    async fn pending_cap_rejects_overflow() {
        let client = offline_client();
        let store = Arc::new(MemoryStore::new());
        let room = OfflineSyncRoom::new(
            client,
            "notes",
            store.clone(),
            OfflineSyncConfig {
                max_pending_ops: 2,
                ..OfflineSyncConfig::default()
            },
        )
        .await
        .unwrap();

        let errors = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let errors2 = errors.clone();
        room.events().on(OfflineSyncEventKind::Error, move |_| {
            errors2.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        room.set("a", json!(1)).await.unwrap();
        room.set("b", json!(2)).await.unwrap();
        let err = room.set("c", json!(3)).await.unwrap_err();
        assert!(matches!(err, Error::QuotaExceeded));
        assert_eq!(errors.load(Ordering::SeqCst), 1);

        // Local state still applied; only the queue rejected it.
        assert_eq!(room.get("c"), Some(json!(3)));
        assert_eq!(store.count_pending().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn merge_resolution_requires_function() {
        let client = offline_client();
        let store = Arc::new(MemoryStore::new());
        let result = OfflineSyncRoom::new(
            client,
            "notes",
            store,
            OfflineSyncConfig {
                conflict_resolution: ConflictResolution::Merge,
                ..OfflineSyncConfig::default()
            },
        )
        .await;
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn versioned_records_skip_unknown_versions() {
        let good = versioned("entry", json!({"key": "k"}));
        assert!(unversioned(&good, "entry").is_some());

        let future = json!({ "version": 99, "entry": {"key": "k"} });
        assert!(unversioned(&future, "entry").is_none());
        assert!(unversioned(&json!({"entry": {}}), "entry").is_none());
    }
}
