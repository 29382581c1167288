//! HLC-ordered state replication for a room.
//!
//! Replicates a `key → entry` map across every peer joined to the room
//! namespace. All frames are wrapped `{ "_sync": true, "type": … }` and
//! travel over the coordinator's broadcast path; targeted forms
//! (state requests and their replies) go over relay with a `_room` tag.
//!
//! Before any per-key comparison the local clock absorbs the incoming
//! entry's clock, so replicas that never write still advance
//! monotonically. Last-writer-wins replaces an entry only when the
//! incoming clock is strictly greater; operational mode resolves
//! concurrent values through the user merge function and re-publishes
//! the result under a fresh local tick. Deletions are tombstones kept
//! for [`TOMBSTONE_TTL`] and then reaped.
//!
//! The `crdt` mode name is reserved for the external CRDT subsystem:
//! construction rejects it and unknown `_sync` frame types are ignored
//! rather than misapplied.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;

use crate::client::{Client, ClientEvent, ClientEventKind};
use crate::emitter::{BusEvent, Emitter};
use crate::error::Error;
use crate::hlc::{Hlc, now_millis};

/// How long tombstones are retained before the reaper purges them.
pub const TOMBSTONE_TTL: Duration = Duration::from_secs(60);

/// One replicated entry. `version` records the clock counter at write
/// time; `deleted` marks a tombstone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncEntry {
    pub key: String,
    pub value: Value,
    pub hlc: Hlc,
    pub from: String,
    pub version: u32,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    Lww,
    Operational,
}

impl SyncMode {
    /// Parse a configured mode name. The `crdt` name is recognized but
    /// belongs to the CRDT subsystem, so it is rejected here.
    pub fn parse(name: &str) -> Result<Self, Error> {
        match name {
            "lww" => Ok(SyncMode::Lww),
            "operational" => Ok(SyncMode::Operational),
            "crdt" => Err(Error::Config(
                "crdt mode is provided by the CRDT subsystem".to_string(),
            )),
            other => Err(Error::Config(format!("unknown sync mode {other:?}"))),
        }
    }
}

/// User-supplied conflict resolver for operational mode.
pub type MergeFn = Arc<dyn Fn(&Value, &Value) -> Value + Send + Sync>;

#[derive(Clone)]
pub struct SyncConfig {
    pub mode: SyncMode,
    pub merge: Option<MergeFn>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            mode: SyncMode::Lww,
            merge: None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// A key changed through replication. `value` is `None` for deletes.
    StateChanged {
        key: String,
        value: Option<Value>,
        from: String,
    },
    /// Operational merge resolved two concurrent values.
    Conflict {
        key: String,
        local: Value,
        remote: Value,
        merged: Value,
    },
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncEventKind {
    StateChanged,
    Conflict,
    Error,
}

impl BusEvent for SyncEvent {
    type Kind = SyncEventKind;

    fn kind(&self) -> SyncEventKind {
        match self {
            SyncEvent::StateChanged { .. } => SyncEventKind::StateChanged,
            SyncEvent::Conflict { .. } => SyncEventKind::Conflict,
            SyncEvent::Error(_) => SyncEventKind::Error,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum SyncFrame {
    Update { entry: SyncEntry },
    FullState { state: Vec<SyncEntry> },
    RequestState,
}

pub(crate) fn sync_frame(frame: &SyncFrame, room_id: Option<&str>) -> Value {
    let mut value = serde_json::to_value(frame).unwrap_or(Value::Null);
    if let Value::Object(map) = &mut value {
        map.insert("_sync".to_string(), Value::Bool(true));
        if let Some(room_id) = room_id {
            map.insert("_room".to_string(), Value::String(room_id.to_string()));
        }
    }
    value
}

pub(crate) fn parse_sync_frame(value: &Value) -> Option<SyncFrame> {
    if value.get("_sync").and_then(Value::as_bool) != Some(true) {
        return None;
    }
    match serde_json::from_value(value.clone()) {
        Ok(frame) => Some(frame),
        Err(err) => {
            // Unknown types (CRDT payloads included) are not ours to apply.
            tracing::debug!(error = %err, "ignoring unrecognized sync frame");
            None
        }
    }
}

/// Apply `entry` under last-writer-wins. Returns true when it replaced
/// the stored entry (or filled an empty slot).
pub(crate) fn lww_apply(state: &mut HashMap<String, SyncEntry>, entry: SyncEntry) -> bool {
    match state.get(&entry.key) {
        Some(local) if entry.hlc <= local.hlc => false,
        _ => {
            state.insert(entry.key.clone(), entry);
            true
        }
    }
}

/// Replicated key/value state for one room namespace.
#[derive(Clone)]
pub struct SyncRoom {
    inner: Arc<SyncInner>,
}

struct SyncInner {
    client: Client,
    room_id: String,
    mode: SyncMode,
    merge: Option<MergeFn>,
    hlc: Mutex<Hlc>,
    state: Mutex<HashMap<String, SyncEntry>>,
    events: Emitter<SyncEvent>,
    closed: AtomicBool,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl SyncRoom {
    /// Operational mode requires a merge function; construction fails
    /// without one.
    pub fn new(client: Client, room_id: impl Into<String>, config: SyncConfig) -> Result<Self, Error> {
        if config.mode == SyncMode::Operational && config.merge.is_none() {
            return Err(Error::Config(
                "operational mode requires a merge function".to_string(),
            ));
        }
        let inner = Arc::new(SyncInner {
            client,
            room_id: room_id.into(),
            mode: config.mode,
            merge: config.merge,
            hlc: Mutex::new(Hlc::new("")),
            state: Mutex::new(HashMap::new()),
            events: Emitter::new(),
            closed: AtomicBool::new(false),
            reaper: Mutex::new(None),
        });
        SyncInner::install_listeners(&inner);
        SyncInner::start_reaper(&inner);
        Ok(Self { inner })
    }

    pub fn room_id(&self) -> &str {
        &self.inner.room_id
    }

    pub fn events(&self) -> &Emitter<SyncEvent> {
        &self.inner.events
    }

    /// Write a key locally and replicate it.
    pub fn set(&self, key: &str, value: Value) -> Result<(), Error> {
        let entry = self.inner.local_entry(key, value, false);
        self.inner.state.lock().insert(key.to_string(), entry.clone());
        self.inner.broadcast_update(entry)
    }

    /// Delete a key: writes a tombstone and replicates it.
    pub fn delete(&self, key: &str) -> Result<(), Error> {
        let entry = self.inner.local_entry(key, Value::Null, true);
        self.inner.state.lock().insert(key.to_string(), entry.clone());
        self.inner.broadcast_update(entry)
    }

    /// Read a key; tombstones are hidden.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner
            .state
            .lock()
            .get(key)
            .filter(|entry| !entry.deleted)
            .map(|entry| entry.value.clone())
    }

    /// All live keys and values; tombstones are hidden.
    pub fn get_all(&self) -> HashMap<String, Value> {
        self.inner
            .state
            .lock()
            .iter()
            .filter(|(_, entry)| !entry.deleted)
            .map(|(key, entry)| (key.clone(), entry.value.clone()))
            .collect()
    }

    /// Ask one peer for its full state over relay.
    pub fn request_state(&self, from_peer: &str) -> Result<(), Error> {
        self.inner.client.relay(
            from_peer,
            sync_frame(&SyncFrame::RequestState, Some(&self.inner.room_id)),
        )
    }

    /// The current clock, for diagnostics and tests.
    pub fn clock(&self) -> Hlc {
        self.inner.hlc.lock().clone()
    }

    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(reaper) = self.inner.reaper.lock().take() {
            reaper.abort();
        }
        self.inner.events.remove_all(None);
    }
}

impl SyncInner {
    fn node(&self) -> String {
        self.client.fingerprint().unwrap_or_default()
    }

    /// Tick the clock for a local write and build the entry.
    fn local_entry(&self, key: &str, value: Value, deleted: bool) -> SyncEntry {
        let mut hlc = self.hlc.lock();
        hlc.node = self.node();
        hlc.tick();
        SyncEntry {
            key: key.to_string(),
            value,
            hlc: hlc.clone(),
            from: hlc.node.clone(),
            version: hlc.counter,
            deleted,
        }
    }

    fn broadcast_update(&self, entry: SyncEntry) -> Result<(), Error> {
        self.client.broadcast(
            &self.room_id,
            sync_frame(&SyncFrame::Update { entry }, None),
        )
    }

    /// Absorb the remote clock, then resolve per mode.
    fn apply_remote(&self, entry: SyncEntry, from: &str) {
        {
            let mut hlc = self.hlc.lock();
            hlc.node = self.node();
            hlc.merge(&entry.hlc);
        }

        match self.mode {
            SyncMode::Lww => self.apply_lww(entry, from),
            SyncMode::Operational => self.apply_operational(entry, from),
        }
    }

    fn apply_lww(&self, entry: SyncEntry, from: &str) {
        let key = entry.key.clone();
        let deleted = entry.deleted;
        let value = entry.value.clone();
        let replaced = lww_apply(&mut self.state.lock(), entry);
        if replaced {
            self.events.emit(&SyncEvent::StateChanged {
                key,
                value: if deleted { None } else { Some(value) },
                from: from.to_string(),
            });
        }
    }

    fn apply_operational(&self, entry: SyncEntry, from: &str) {
        let key = entry.key.clone();
        let local = self
            .state
            .lock()
            .get(&key)
            .filter(|local| !local.deleted)
            .cloned();

        let Some(local) = local else {
            // Nothing local (or only a tombstone): accept as-is.
            let deleted = entry.deleted;
            let value = entry.value.clone();
            self.state.lock().insert(key.clone(), entry);
            self.events.emit(&SyncEvent::StateChanged {
                key,
                value: if deleted { None } else { Some(value) },
                from: from.to_string(),
            });
            return;
        };

        let Some(merge) = &self.merge else {
            // Guarded at construction; treat as LWW if it ever happens.
            self.apply_lww(entry, from);
            return;
        };

        let merged = merge(&local.value, &entry.value);
        let resolved = self.local_entry(&key, merged.clone(), false);
        self.state.lock().insert(key.clone(), resolved.clone());
        self.events.emit(&SyncEvent::Conflict {
            key: key.clone(),
            local: local.value,
            remote: entry.value,
            merged: merged.clone(),
        });
        self.events.emit(&SyncEvent::StateChanged {
            key,
            value: Some(merged),
            from: from.to_string(),
        });
        // The locally resolved value propagates under its fresh clock.
        if let Err(err) = self.broadcast_update(resolved) {
            tracing::debug!(error = %err, "merged entry broadcast failed");
        }
    }

    fn apply_full_state(&self, entries: Vec<SyncEntry>, from: &str) {
        for entry in entries {
            {
                let mut hlc = self.hlc.lock();
                hlc.node = self.node();
                hlc.merge(&entry.hlc);
            }
            // Full-state exchange always applies per-entry LWW.
            self.apply_lww(entry, from);
        }
    }

    fn send_full_state_to(&self, peer: &str) {
        let state: Vec<SyncEntry> = self.state.lock().values().cloned().collect();
        if state.is_empty() {
            return;
        }
        let frame = sync_frame(&SyncFrame::FullState { state }, Some(&self.room_id));
        if let Err(err) = self.client.relay(peer, frame) {
            tracing::debug!(error = %err, "full state relay failed");
        }
    }

    fn broadcast_full_state(&self) {
        let state: Vec<SyncEntry> = self.state.lock().values().cloned().collect();
        if state.is_empty() {
            return;
        }
        let frame = sync_frame(&SyncFrame::FullState { state }, None);
        if let Err(err) = self.client.broadcast(&self.room_id, frame) {
            tracing::debug!(error = %err, "full state broadcast failed");
        }
    }

    fn install_listeners(inner: &Arc<SyncInner>) {
        let client_events = inner.client.events().clone();
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
                    match frame {
                        SyncFrame::Update { entry } => inner.apply_remote(entry, from),
                        SyncFrame::FullState { state } => inner.apply_full_state(state, from),
                        SyncFrame::RequestState => inner.send_full_state_to(from),
                    }
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
                    && let Some(frame) = parse_sync_frame(payload)
                {
                    match frame {
                        SyncFrame::Update { entry } => inner.apply_remote(entry, from),
                        SyncFrame::FullState { state } => inner.apply_full_state(state, from),
                        SyncFrame::RequestState => inner.send_full_state_to(from),
                    }
                }
                Ok(())
            });
        }
        {
            let inner = inner.clone();
            client_events.on(ClientEventKind::PeerJoined, move |ev| {
                if let ClientEvent::PeerJoined { namespace, .. } = ev
                    && namespace == &inner.room_id
                    && !inner.closed.load(Ordering::SeqCst)
                {
                    inner.broadcast_full_state();
                }
                Ok(())
            });
        }
    }

    fn start_reaper(inner: &Arc<SyncInner>) {
        let weak = Arc::downgrade(inner);
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(TOMBSTONE_TTL);
            tick.tick().await;
            loop {
                tick.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                inner.reap_tombstones(now_millis());
            }
        });
        *inner.reaper.lock() = Some(handle);
    }

    fn reap_tombstones(&self, now: i64) {
        let ttl = TOMBSTONE_TTL.as_millis() as i64;
        self.state
            .lock()
            .retain(|_, entry| !entry.deleted || now - entry.hlc.ts <= ttl);
    }
}
