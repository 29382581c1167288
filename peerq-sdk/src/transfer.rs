//! Chunked file transfer over peer data channels.
//!
//! Control messages travel as JSON on the peer's default `data` channel,
//! tagged `"_ft": true`:
//!
//! ```json
//! { "_ft": true, "type": "offer",  "id": "…", "filename": "…",
//!   "size": 1024, "mime": "application/octet-stream",
//!   "chunkSize": 65536, "totalChunks": 1 }
//! { "_ft": true, "type": "accept", "id": "…" }
//! { "_ft": true, "type": "ack",    "id": "…", "index": 99 }
//! { "_ft": true, "type": "resume", "id": "…", "lastIndex": 99 }
//! { "_ft": true, "type": "cancel" | "complete", "id": "…" }
//! { "_ft": true, "type": "error",  "id": "…", "message": "…" }
//! ```
//!
//! Binary chunks flow on a dedicated ordered channel labeled
//! `ft-<id>`, each frame a 4-byte little-endian chunk index followed by
//! the payload. The sender suspends whenever the channel buffers more
//! than [`BUFFERED_AMOUNT_HIGH`] bytes and resumes on the engine's
//! buffered-amount-low signal; every 50 chunks it yields briefly so
//! other tasks interleave. The receiver tolerates out-of-order and
//! duplicate frames: a slot is written at most once, indexes past the
//! end are dropped, and `received` counts filled slots exactly.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::client::{Client, ClientEvent, ClientEventKind};
use crate::emitter::{BusEvent, Emitter};
use crate::error::Error;
use crate::ids;
use crate::peer::{DataPayload, PeerEvent, PeerEventKind, PeerSession};
use crate::rtc::{DataChannelConfig, PeerConnectionState};

pub const CHUNK_SIZE: u32 = 65536;
pub const BUFFERED_AMOUNT_HIGH: u64 = 4 * 1024 * 1024;
pub const BUFFERED_AMOUNT_LOW: u64 = 1024 * 1024;
/// Send an ack every this many received chunks.
pub const ACK_INTERVAL: u32 = 100;
pub const TRANSFER_CHANNEL_PREFIX: &str = "ft-";

const OFFER_TIMEOUT: Duration = Duration::from_secs(30);
const CHANNEL_OPEN_TIMEOUT: Duration = Duration::from_secs(15);
/// Chunks between cooperative yields in the send loop.
const YIELD_EVERY: u32 = 50;
const YIELD_PAUSE: Duration = Duration::from_millis(10);

/// Transfer metadata as carried in the `offer` frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    pub id: String,
    pub filename: String,
    pub size: u64,
    pub mime: String,
    pub chunk_size: u32,
    pub total_chunks: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Control {
    Offer(FileMetadata),
    Accept {
        id: String,
    },
    Cancel {
        id: String,
    },
    Ack {
        id: String,
        index: u32,
    },
    #[serde(rename_all = "camelCase")]
    Resume {
        id: String,
        last_index: u32,
    },
    Complete {
        id: String,
    },
    Error {
        id: String,
        message: String,
    },
}

fn control_frame(control: &Control) -> Value {
    let mut value = serde_json::to_value(control).unwrap_or(Value::Null);
    if let Value::Object(map) = &mut value {
        map.insert("_ft".to_string(), Value::Bool(true));
    }
    value
}

fn parse_control(value: &Value) -> Option<Control> {
    if value.get("_ft").and_then(Value::as_bool) != Some(true) {
        return None;
    }
    serde_json::from_value(value.clone()).ok()
}

/// Byte source for an outgoing transfer. Reads are offset-addressed so
/// resume can jump without rewinding shared state.
#[async_trait]
pub trait FileSource: Send + Sync {
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>, Error>;
}

/// Whole-buffer source for in-memory payloads.
pub struct MemorySource(Arc<Vec<u8>>);

impl MemorySource {
    pub fn new(data: Vec<u8>) -> Self {
        Self(Arc::new(data))
    }
}

#[async_trait]
impl FileSource for MemorySource {
    fn len(&self) -> u64 {
        self.0.len() as u64
    }

    async fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>, Error> {
        let start = offset as usize;
        let end = (start + len).min(self.0.len());
        if start > self.0.len() {
            return Err(Error::Storage("read past end of source".to_string()));
        }
        Ok(self.0[start..end].to_vec())
    }
}

/// An outgoing file: source bytes plus presentation metadata.
pub struct OutgoingFile {
    pub source: Arc<dyn FileSource>,
    pub filename: String,
    pub mime: String,
}

/// A fully reassembled inbound file.
#[derive(Debug, Clone)]
pub struct ReceivedFile {
    pub data: Vec<u8>,
    pub mime: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Send,
    Receive,
}

#[derive(Debug, Clone)]
pub enum TransferEvent {
    /// A remote peer offered a file; call `accept` or `reject`.
    Incoming { meta: FileMetadata, from: String },
    Progress {
        id: String,
        direction: Direction,
        chunks: u32,
        total: u32,
        percent: f64,
        bytes_per_sec: f64,
    },
    Complete {
        id: String,
        direction: Direction,
        meta: FileMetadata,
        peer: String,
        /// Present on the receiving side only.
        file: Option<ReceivedFile>,
    },
    Cancelled { id: String },
    Error { id: String, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferEventKind {
    Incoming,
    Progress,
    Complete,
    Cancelled,
    Error,
}

impl BusEvent for TransferEvent {
    type Kind = TransferEventKind;

    fn kind(&self) -> TransferEventKind {
        match self {
            TransferEvent::Incoming { .. } => TransferEventKind::Incoming,
            TransferEvent::Progress { .. } => TransferEventKind::Progress,
            TransferEvent::Complete { .. } => TransferEventKind::Complete,
            TransferEvent::Cancelled { .. } => TransferEventKind::Cancelled,
            TransferEvent::Error { .. } => TransferEventKind::Error,
        }
    }
}

struct SendState {
    meta: FileMetadata,
    peer: String,
    accepted: AtomicBool,
    accept_notify: Notify,
    cancelled: AtomicBool,
    cancel_notify: Notify,
    paused: AtomicBool,
    pause_notify: Notify,
    /// Receiver-requested jump target (`lastIndex + 1`).
    resume_to: Mutex<Option<u32>>,
}

#[derive(Clone)]
struct ReceiveState {
    meta: FileMetadata,
    from: String,
    chunks: Vec<Option<Vec<u8>>>,
    received: u32,
    accepted: bool,
    started: Instant,
}

/// Per-client transfer coordinator. Attaches to every peer session the
/// client creates and tracks active sends/receives by transfer id.
#[derive(Clone)]
pub struct FileTransfer {
    inner: Arc<TransferInner>,
}

struct TransferInner {
    client: Client,
    events: Emitter<TransferEvent>,
    sends: Mutex<HashMap<String, Arc<SendState>>>,
    receives: Mutex<HashMap<String, Arc<Mutex<ReceiveState>>>>,
}

impl FileTransfer {
    pub fn new(client: Client) -> Self {
        let inner = Arc::new(TransferInner {
            client: client.clone(),
            events: Emitter::new(),
            sends: Mutex::new(HashMap::new()),
            receives: Mutex::new(HashMap::new()),
        });

        {
            let inner = inner.clone();
            client
                .events()
                .clone()
                .on(ClientEventKind::PeerCreated, move |ev| {
                    if let ClientEvent::PeerCreated { fingerprint } = ev
                        && let Some(peer) = inner.client.peer(fingerprint)
                    {
                        TransferInner::attach_peer(&inner, &peer);
                    }
                    Ok(())
                });
        }

        Self { inner }
    }

    pub fn events(&self) -> &Emitter<TransferEvent> {
        &self.inner.events
    }

    /// Send a file to a connected peer. Resolves with the transfer id
    /// after `complete` goes out; rejects on timeout or cancellation.
    pub async fn send_file(&self, to: &str, file: OutgoingFile) -> Result<String, Error> {
        let peer = self
            .inner
            .client
            .peer(to)
            .filter(|p| p.connection_state() == PeerConnectionState::Connected)
            .ok_or_else(|| Error::PeerNotConnected(to.to_string()))?;

        let id = ids::generate();
        let size = file.source.len();
        let total_chunks = size.div_ceil(CHUNK_SIZE as u64) as u32;
        let meta = FileMetadata {
            id: id.clone(),
            filename: file.filename.clone(),
            size,
            mime: file.mime.clone(),
            chunk_size: CHUNK_SIZE,
            total_chunks,
        };

        let label = format!("{TRANSFER_CHANNEL_PREFIX}{id}");
        peer.create_data_channel(DataChannelConfig::ordered(&label))
            .await?;

        let state = Arc::new(SendState {
            meta: meta.clone(),
            peer: to.to_string(),
            accepted: AtomicBool::new(false),
            accept_notify: Notify::new(),
            cancelled: AtomicBool::new(false),
            cancel_notify: Notify::new(),
            paused: AtomicBool::new(false),
            pause_notify: Notify::new(),
            resume_to: Mutex::new(None),
        });
        self.inner.sends.lock().insert(id.clone(), state.clone());

        let result = self
            .run_send(&peer, &state, &file, &label)
            .await;
        self.inner.sends.lock().remove(&id);
        if result.is_err()
            && let Some(handle) = peer.channel(&label)
        {
            handle.chan.close().await;
        }
        result.map(|_| id)
    }

    async fn run_send(
        &self,
        peer: &PeerSession,
        state: &Arc<SendState>,
        file: &OutgoingFile,
        label: &str,
    ) -> Result<(), Error> {
        let inner = &self.inner;
        let id = state.meta.id.clone();

        peer.send_json(&control_frame(&Control::Offer(state.meta.clone())), None)
            .await?;

        // Offer must be accepted (or progressed via resume) within bound.
        if !state.accepted.load(Ordering::SeqCst) {
            let accepted = tokio::select! {
                _ = tokio::time::timeout(OFFER_TIMEOUT, state.accept_notify.notified()) => {
                    state.accepted.load(Ordering::SeqCst)
                }
                _ = state.cancel_notify.notified() => false,
            };
            if state.cancelled.load(Ordering::SeqCst) {
                return Err(Error::Cancelled);
            }
            if !accepted {
                return Err(Error::Timeout("transfer offer"));
            }
        }

        peer.wait_channel_open(label, CHANNEL_OPEN_TIMEOUT)
            .await
            .map_err(|_| Error::Timeout("transfer channel open"))?;
        let handle = peer
            .channel(label)
            .ok_or_else(|| Error::ChannelNotOpen(label.to_string()))?;
        handle
            .chan
            .set_buffered_amount_low_threshold(BUFFERED_AMOUNT_LOW);

        let started = Instant::now();
        let mut index: u32 = 0;
        let mut bytes_sent: u64 = 0;
        let total = state.meta.total_chunks;
        let size = state.meta.size;

        while index < total {
            if state.cancelled.load(Ordering::SeqCst) {
                return Err(Error::Cancelled);
            }
            if let Some(jump) = state.resume_to.lock().take() {
                index = jump;
                continue;
            }
            if state.paused.load(Ordering::SeqCst) {
                tokio::select! {
                    _ = state.pause_notify.notified() => {}
                    _ = state.cancel_notify.notified() => {}
                }
                continue;
            }
            if handle.chan.buffered_amount() > BUFFERED_AMOUNT_HIGH {
                tokio::select! {
                    _ = handle.buffered_low.notified() => {}
                    _ = state.cancel_notify.notified() => {}
                }
                continue;
            }

            let offset = index as u64 * CHUNK_SIZE as u64;
            let want = ((size - offset).min(CHUNK_SIZE as u64)) as usize;
            let payload = file.source.read_at(offset, want).await?;

            let mut frame = Vec::with_capacity(4 + payload.len());
            frame.extend_from_slice(&index.to_le_bytes());
            frame.extend_from_slice(&payload);
            handle
                .chan
                .send_binary(&frame)
                .await
                .map_err(|_| Error::ChannelNotOpen(label.to_string()))?;

            bytes_sent += payload.len() as u64;
            index += 1;

            let elapsed = started.elapsed().as_secs_f64().max(1e-3);
            inner.events.emit(&TransferEvent::Progress {
                id: id.clone(),
                direction: Direction::Send,
                chunks: index,
                total,
                percent: if total == 0 {
                    100.0
                } else {
                    index as f64 * 100.0 / total as f64
                },
                bytes_per_sec: bytes_sent as f64 / elapsed,
            });

            if index % YIELD_EVERY == 0 {
                tokio::time::sleep(YIELD_PAUSE).await;
            }
        }

        if state.cancelled.load(Ordering::SeqCst) {
            return Err(Error::Cancelled);
        }

        // Drain the channel buffer, then a short flush pause before the
        // completion marker so the last chunk is on the wire first.
        while handle.chan.buffered_amount() > 0 {
            tokio::time::sleep(YIELD_PAUSE).await;
            if state.cancelled.load(Ordering::SeqCst) {
                return Err(Error::Cancelled);
            }
        }
        tokio::time::sleep(YIELD_PAUSE).await;

        peer.send_json(
            &control_frame(&Control::Complete { id: id.clone() }),
            None,
        )
        .await?;

        inner.events.emit(&TransferEvent::Complete {
            id: id.clone(),
            direction: Direction::Send,
            meta: state.meta.clone(),
            peer: state.peer.clone(),
            file: None,
        });
        handle.chan.close().await;
        Ok(())
    }

    /// Accept an offered transfer.
    pub async fn accept(&self, id: &str) -> Result<(), Error> {
        let from = {
            let receives = self.inner.receives.lock();
            let state = receives
                .get(id)
                .ok_or_else(|| Error::Protocol(format!("no incoming transfer {id}")))?;
            let mut state = state.lock();
            state.accepted = true;
            state.started = Instant::now();
            state.from.clone()
        };
        let peer = self
            .inner
            .client
            .peer(&from)
            .ok_or_else(|| Error::PeerNotConnected(from.clone()))?;
        peer.send_json(
            &control_frame(&Control::Accept { id: id.to_string() }),
            None,
        )
        .await
    }

    /// Decline an offered transfer and discard its state.
    pub async fn reject(&self, id: &str) -> Result<(), Error> {
        let state = self.inner.receives.lock().remove(id);
        let Some(state) = state else {
            return Ok(());
        };
        let from = state.lock().from.clone();
        if let Some(peer) = self.inner.client.peer(&from) {
            let _ = peer
                .send_json(
                    &control_frame(&Control::Cancel { id: id.to_string() }),
                    None,
                )
                .await;
        }
        Ok(())
    }

    /// Cancel an outgoing transfer; the pending `send_file` rejects.
    pub async fn cancel_send(&self, id: &str) {
        let state = self.inner.sends.lock().get(id).cloned();
        let Some(state) = state else { return };
        state.cancelled.store(true, Ordering::SeqCst);
        state.cancel_notify.notify_one();
        if let Some(peer) = self.inner.client.peer(&state.peer) {
            let _ = peer
                .send_json(
                    &control_frame(&Control::Cancel { id: id.to_string() }),
                    None,
                )
                .await;
        }
        self.inner.events.emit(&TransferEvent::Cancelled {
            id: id.to_string(),
        });
    }

    /// Cancel an inbound transfer and discard partial chunks.
    pub async fn cancel_receive(&self, id: &str) {
        let state = self.inner.receives.lock().remove(id);
        let Some(state) = state else { return };
        let from = state.lock().from.clone();
        if let Some(peer) = self.inner.client.peer(&from) {
            let _ = peer
                .send_json(
                    &control_frame(&Control::Cancel { id: id.to_string() }),
                    None,
                )
                .await;
        }
        self.inner.events.emit(&TransferEvent::Cancelled {
            id: id.to_string(),
        });
    }

    /// Pause an outgoing transfer after the in-flight chunk.
    pub fn pause(&self, id: &str) {
        if let Some(state) = self.inner.sends.lock().get(id) {
            state.paused.store(true, Ordering::SeqCst);
        }
    }

    /// Resume a paused outgoing transfer.
    pub fn resume(&self, id: &str) {
        if let Some(state) = self.inner.sends.lock().get(id) {
            state.paused.store(false, Ordering::SeqCst);
            state.pause_notify.notify_one();
        }
    }
}

impl TransferInner {
    fn attach_peer(inner: &Arc<TransferInner>, peer: &PeerSession) {
        let fingerprint = peer.fingerprint().to_string();
        let weak = Arc::downgrade(inner);
        peer.events().on(PeerEventKind::Data, move |ev| {
            let Some(inner) = weak.upgrade() else {
                return Ok(());
            };
            if let PeerEvent::Data { payload, label } = ev {
                match payload {
                    DataPayload::Json(value) => {
                        if let Some(control) = parse_control(value) {
                            TransferInner::handle_control(&inner, &fingerprint, control);
                        }
                    }
                    DataPayload::Binary(frame) => {
                        if let Some(id) = label.strip_prefix(TRANSFER_CHANNEL_PREFIX) {
                            TransferInner::handle_chunk(&inner, id, frame);
                        }
                    }
                    DataPayload::Text(_) => {}
                }
            }
            Ok(())
        });
    }

    fn handle_control(inner: &Arc<TransferInner>, from: &str, control: Control) {
        match control {
            Control::Offer(meta) => {
                let total = meta.total_chunks as usize;
                let state = ReceiveState {
                    meta: meta.clone(),
                    from: from.to_string(),
                    chunks: vec![None; total],
                    received: 0,
                    accepted: false,
                    started: Instant::now(),
                };
                inner
                    .receives
                    .lock()
                    .insert(meta.id.clone(), Arc::new(Mutex::new(state)));
                inner.events.emit(&TransferEvent::Incoming {
                    meta,
                    from: from.to_string(),
                });
            }
            Control::Accept { id } => {
                if let Some(state) = inner.sends.lock().get(&id) {
                    state.accepted.store(true, Ordering::SeqCst);
                    state.accept_notify.notify_one();
                }
            }
            Control::Cancel { id } => {
                if let Some(state) = inner.sends.lock().get(&id) {
                    state.cancelled.store(true, Ordering::SeqCst);
                    state.cancel_notify.notify_one();
                    inner
                        .events
                        .emit(&TransferEvent::Cancelled { id: id.clone() });
                }
                if inner.receives.lock().remove(&id).is_some() {
                    inner.events.emit(&TransferEvent::Cancelled { id });
                }
            }
            Control::Ack { id, index } => {
                tracing::trace!(id, index, "transfer ack");
            }
            Control::Resume { id, last_index } => {
                if let Some(state) = inner.sends.lock().get(&id) {
                    *state.resume_to.lock() = Some(last_index + 1);
                    state.accepted.store(true, Ordering::SeqCst);
                    state.accept_notify.notify_one();
                    state.pause_notify.notify_one();
                }
            }
            Control::Complete { id } => {
                TransferInner::finish_receive(inner, &id);
            }
            Control::Error { id, message } => {
                inner.sends.lock().remove(&id);
                inner.receives.lock().remove(&id);
                inner.events.emit(&TransferEvent::Error { id, message });
            }
        }
    }

    fn handle_chunk(inner: &Arc<TransferInner>, id: &str, frame: &[u8]) {
        if frame.len() < 4 {
            return;
        }
        let index = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]);
        let payload = &frame[4..];

        let state = inner.receives.lock().get(id).cloned();
        let Some(state) = state else { return };
        let (progress, ack_peer) = {
            let mut state = state.lock();
            if index >= state.meta.total_chunks {
                return;
            }
            let slot = &mut state.chunks[index as usize];
            if slot.is_some() {
                // Duplicate; the slot is written at most once.
                return;
            }
            *slot = Some(payload.to_vec());
            state.received += 1;

            let elapsed = state.started.elapsed().as_secs_f64().max(1e-3);
            let progress = TransferEvent::Progress {
                id: id.to_string(),
                direction: Direction::Receive,
                chunks: state.received,
                total: state.meta.total_chunks,
                percent: state.received as f64 * 100.0 / state.meta.total_chunks.max(1) as f64,
                bytes_per_sec: state.received as f64 * state.meta.chunk_size as f64 / elapsed,
            };
            let ack_peer = (state.received % ACK_INTERVAL == 0).then(|| state.from.clone());
            (progress, ack_peer)
        };
        inner.events.emit(&progress);

        if let Some(from) = ack_peer {
            // Best-effort ack on the control channel.
            let inner = inner.clone();
            let id = id.to_string();
            tokio::spawn(async move {
                if let Some(peer) = inner.client.peer(&from) {
                    let _ = peer
                        .send_json(&control_frame(&Control::Ack { id, index }), None)
                        .await;
                }
            });
        }
    }

    fn finish_receive(inner: &Arc<TransferInner>, id: &str) {
        let state = inner.receives.lock().remove(id);
        let Some(state) = state else { return };
        let state = state.lock().clone();

        if let Some(missing) = state.chunks.iter().position(Option::is_none) {
            inner.events.emit(&TransferEvent::Error {
                id: id.to_string(),
                message: format!("Missing chunk {missing}"),
            });
            return;
        }

        let mut data = Vec::with_capacity(state.meta.size as usize);
        for chunk in state.chunks.into_iter().flatten() {
            data.extend_from_slice(&chunk);
        }
        inner.events.emit(&TransferEvent::Complete {
            id: id.to_string(),
            direction: Direction::Receive,
            meta: state.meta.clone(),
            peer: state.from.clone(),
            file: Some(ReceivedFile {
                data,
                mime: state.meta.mime,
            }),
        });
    }
}
