//! One WebRTC session per remote peer.
//!
//! Wraps an engine `PeerConnection` and owns everything scoped to it:
//! the data-channel map, the pre-remote-description candidate buffer,
//! and the pump tasks that translate engine events into peer events.
//!
//! Signals travel through the injected `send_signal` callback so the
//! session never knows about the transport. Candidates that arrive
//! before the remote description are buffered and replayed in arrival
//! order once it is installed; they are never discarded. After
//! `close()` the session is inert: no events, and sends fail with
//! `ChannelNotOpen`.
//!
//! Engine call rejections (descriptions, candidates, offers) are caught
//! and surfaced as `Error` events; they never abort the session.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::Notify;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::emitter::{BusEvent, Emitter};
use crate::error::Error;
use crate::protocol::{SignalPayload, SignalType};
use crate::rtc::{
    DataChannelConfig, DataChannelEvent, DataChannelState, IceCandidate, IceConnectionState,
    MediaStream, PeerConnectionEvent, PeerConnectionState, RtcDataChannel, RtcPeerConnection,
    SdpType, SessionDescription,
};

/// Label of the channel every peer session starts with.
pub const DEFAULT_CHANNEL: &str = "data";

/// Callback the session uses to hand a signal to the signaling path.
pub type SignalSender = Arc<dyn Fn(SignalPayload) + Send + Sync>;

/// A payload received on a data channel. JSON text is parsed; other
/// text passes through as a string; binary frames pass through
/// byte-exact.
#[derive(Debug, Clone)]
pub enum DataPayload {
    Json(Value),
    Text(String),
    Binary(Vec<u8>),
}

#[derive(Debug, Clone)]
pub enum PeerEvent {
    ConnectionState(PeerConnectionState),
    /// The engine reports the connection is no longer usable
    /// (disconnected, failed, or closed).
    Disconnected(PeerConnectionState),
    /// The remote side opened a channel toward us.
    DataChannelCreate(String),
    DataChannelOpen(String),
    DataChannelClose(String),
    Data { payload: DataPayload, label: String },
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerEventKind {
    ConnectionState,
    Disconnected,
    DataChannelCreate,
    DataChannelOpen,
    DataChannelClose,
    Data,
    Error,
}

impl BusEvent for PeerEvent {
    type Kind = PeerEventKind;

    fn kind(&self) -> PeerEventKind {
        match self {
            PeerEvent::ConnectionState(_) => PeerEventKind::ConnectionState,
            PeerEvent::Disconnected(_) => PeerEventKind::Disconnected,
            PeerEvent::DataChannelCreate(_) => PeerEventKind::DataChannelCreate,
            PeerEvent::DataChannelOpen(_) => PeerEventKind::DataChannelOpen,
            PeerEvent::DataChannelClose(_) => PeerEventKind::DataChannelClose,
            PeerEvent::Data { .. } => PeerEventKind::Data,
            PeerEvent::Error(_) => PeerEventKind::Error,
        }
    }
}

/// One attached data channel plus its wakeups.
#[derive(Clone)]
pub struct ChannelHandle {
    pub chan: Arc<dyn RtcDataChannel>,
    /// Notified when the channel transitions to open.
    pub opened: Arc<Notify>,
    /// Notified on the engine's buffered-amount-low signal.
    pub buffered_low: Arc<Notify>,
}

/// Cheap to clone; all clones drive the same underlying session.
#[derive(Clone)]
pub struct PeerSession {
    inner: Arc<Inner>,
}

struct Inner {
    fingerprint: String,
    alias: Mutex<String>,
    pc: Arc<dyn RtcPeerConnection>,
    channels: Mutex<HashMap<String, ChannelHandle>>,
    remote_desc_set: AtomicBool,
    pending_candidates: Mutex<Vec<IceCandidate>>,
    closed: AtomicBool,
    events: Emitter<PeerEvent>,
    send_signal: SignalSender,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PeerSession {
    pub fn new(
        fingerprint: impl Into<String>,
        alias: impl Into<String>,
        pc: Arc<dyn RtcPeerConnection>,
        send_signal: SignalSender,
    ) -> Self {
        let inner = Arc::new(Inner {
            fingerprint: fingerprint.into(),
            alias: Mutex::new(alias.into()),
            pc,
            channels: Mutex::new(HashMap::new()),
            remote_desc_set: AtomicBool::new(false),
            pending_candidates: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            events: Emitter::new(),
            send_signal,
            tasks: Mutex::new(Vec::new()),
        });

        if let Some(rx) = inner.pc.take_events() {
            let pump = tokio::spawn(Inner::pump_connection(inner.clone(), rx));
            inner.tasks.lock().push(pump);
        }

        Self { inner }
    }

    pub fn fingerprint(&self) -> &str {
        &self.inner.fingerprint
    }

    pub fn alias(&self) -> String {
        self.inner.alias.lock().clone()
    }

    pub fn set_alias(&self, alias: impl Into<String>) {
        *self.inner.alias.lock() = alias.into();
    }

    pub fn events(&self) -> &Emitter<PeerEvent> {
        &self.inner.events
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn connection_state(&self) -> PeerConnectionState {
        if self.is_closed() {
            PeerConnectionState::Closed
        } else {
            self.inner.pc.connection_state()
        }
    }

    /// Create the initial channel (default label `data`, ordered) and
    /// send an offer through the signal callback.
    pub async fn create_offer(&self, channel: Option<DataChannelConfig>) -> Result<(), Error> {
        if self.is_closed() {
            return Ok(());
        }
        let config = channel.unwrap_or_else(|| DataChannelConfig::ordered(DEFAULT_CHANNEL));
        let chan = self
            .inner
            .pc
            .create_data_channel(config)
            .await
            .map_err(|e| Error::Rtc(e.to_string()))?;
        Inner::attach_channel(&self.inner, chan);
        Inner::negotiate(&self.inner).await;
        Ok(())
    }

    /// Open an additional data channel on this session.
    pub async fn create_data_channel(
        &self,
        config: DataChannelConfig,
    ) -> Result<ChannelHandle, Error> {
        if self.is_closed() {
            return Err(Error::ChannelNotOpen(config.label));
        }
        let chan = self
            .inner
            .pc
            .create_data_channel(config)
            .await
            .map_err(|e| Error::Rtc(e.to_string()))?;
        Ok(Inner::attach_channel(&self.inner, chan))
    }

    /// Dispatch one inbound signal. Engine failures surface as `Error`
    /// events rather than return values so a bad signal cannot kill
    /// the session.
    pub async fn handle_signal(&self, payload: SignalPayload) {
        if self.is_closed() {
            return;
        }
        let inner = &self.inner;
        match payload.signal_type {
            SignalType::Offer => {
                let Some(sdp) = payload.sdp else {
                    inner.emit_error("offer without sdp");
                    return;
                };
                let remote = SessionDescription {
                    kind: SdpType::Offer,
                    sdp,
                };
                if let Err(err) = inner.pc.set_remote_description(remote).await {
                    inner.emit_error(err);
                    return;
                }
                inner.remote_desc_set.store(true, Ordering::SeqCst);
                Inner::flush_candidates(inner).await;

                let answer = match inner.pc.create_answer().await {
                    Ok(answer) => answer,
                    Err(err) => {
                        inner.emit_error(err);
                        return;
                    }
                };
                if let Err(err) = inner.pc.set_local_description(answer.clone()).await {
                    inner.emit_error(err);
                    return;
                }
                (inner.send_signal)(SignalPayload {
                    signal_type: SignalType::Answer,
                    sdp: Some(answer.sdp),
                    candidate: None,
                });
            }
            SignalType::Answer => {
                let Some(sdp) = payload.sdp else {
                    inner.emit_error("answer without sdp");
                    return;
                };
                let remote = SessionDescription {
                    kind: SdpType::Answer,
                    sdp,
                };
                if let Err(err) = inner.pc.set_remote_description(remote).await {
                    inner.emit_error(err);
                    return;
                }
                inner.remote_desc_set.store(true, Ordering::SeqCst);
                Inner::flush_candidates(inner).await;
            }
            SignalType::Candidate => {
                let Some(raw) = payload.candidate else {
                    inner.emit_error("candidate signal without candidate");
                    return;
                };
                let candidate: IceCandidate = match serde_json::from_str(&raw) {
                    Ok(candidate) => candidate,
                    Err(err) => {
                        inner.emit_error(format!("bad candidate: {err}"));
                        return;
                    }
                };
                if inner.remote_desc_set.load(Ordering::SeqCst) {
                    if let Err(err) = inner.pc.add_ice_candidate(candidate).await {
                        inner.emit_error(err);
                    }
                } else {
                    inner.pending_candidates.lock().push(candidate);
                }
            }
        }
    }

    /// Send a JSON value over a channel (default `data`).
    pub async fn send_json(&self, value: &Value, label: Option<&str>) -> Result<(), Error> {
        let text = serde_json::to_string(value).map_err(|e| Error::Protocol(e.to_string()))?;
        self.send_text(&text, label).await
    }

    /// Send raw text over a channel (default `data`).
    pub async fn send_text(&self, text: &str, label: Option<&str>) -> Result<(), Error> {
        let handle = self.open_channel(label)?;
        handle
            .chan
            .send_text(text)
            .await
            .map_err(|_| Error::ChannelNotOpen(label.unwrap_or(DEFAULT_CHANNEL).to_string()))
    }

    /// Send binary data byte-exact over a channel (default `data`).
    pub async fn send_binary(&self, data: &[u8], label: Option<&str>) -> Result<(), Error> {
        let handle = self.open_channel(label)?;
        handle
            .chan
            .send_binary(data)
            .await
            .map_err(|_| Error::ChannelNotOpen(label.unwrap_or(DEFAULT_CHANNEL).to_string()))
    }

    fn open_channel(&self, label: Option<&str>) -> Result<ChannelHandle, Error> {
        let label = label.unwrap_or(DEFAULT_CHANNEL);
        if self.is_closed() {
            return Err(Error::ChannelNotOpen(label.to_string()));
        }
        let handle = self
            .inner
            .channels
            .lock()
            .get(label)
            .cloned()
            .ok_or_else(|| Error::ChannelNotOpen(label.to_string()))?;
        if handle.chan.ready_state() != DataChannelState::Open {
            return Err(Error::ChannelNotOpen(label.to_string()));
        }
        Ok(handle)
    }

    /// Handle for a channel, open or not.
    pub fn channel(&self, label: &str) -> Option<ChannelHandle> {
        self.inner.channels.lock().get(label).cloned()
    }

    /// Wait until `label` is open, up to `timeout`.
    pub async fn wait_channel_open(&self, label: &str, timeout: Duration) -> Result<(), Error> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let Some(handle) = self.channel(label) else {
                return Err(Error::ChannelNotOpen(label.to_string()));
            };
            if handle.chan.ready_state() == DataChannelState::Open {
                return Ok(());
            }
            let notified = handle.opened.notified();
            if handle.chan.ready_state() == DataChannelState::Open {
                return Ok(());
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(Error::Timeout("channel open"));
            }
        }
    }

    /// Forward all tracks of a stream to the connection.
    pub async fn add_stream(&self, stream: &MediaStream) -> Result<(), Error> {
        if self.is_closed() {
            return Ok(());
        }
        for track in &stream.tracks {
            self.inner
                .pc
                .add_track(&stream.id, track.clone())
                .await
                .map_err(|e| Error::Rtc(e.to_string()))?;
        }
        Ok(())
    }

    /// Remove all tracks of a stream from the connection.
    pub async fn remove_stream(&self, stream: &MediaStream) -> Result<(), Error> {
        if self.is_closed() {
            return Ok(());
        }
        for track in &stream.tracks {
            self.inner
                .pc
                .remove_track(&stream.id, &track.id)
                .await
                .map_err(|e| Error::Rtc(e.to_string()))?;
        }
        Ok(())
    }

    /// Idempotent teardown: channels, connection, listeners, pumps.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
        let channels: Vec<ChannelHandle> = self.inner.channels.lock().drain().map(|(_, h)| h).collect();
        for handle in channels {
            handle.chan.close().await;
        }
        self.inner.pc.close().await;
        self.inner.events.remove_all(None);
    }

    #[cfg(test)]
    pub(crate) fn pending_candidate_count(&self) -> usize {
        self.inner.pending_candidates.lock().len()
    }
}

impl Inner {
    fn emit_error(&self, cause: impl ToString) {
        let cause = cause.to_string();
        tracing::debug!(peer = %self.fingerprint, error = %cause, "peer session error");
        self.events.emit(&PeerEvent::Error(cause));
    }

    /// Generate and send a fresh offer (initial or renegotiation).
    async fn negotiate(inner: &Arc<Inner>) {
        let offer = match inner.pc.create_offer().await {
            Ok(offer) => offer,
            Err(err) => return inner.emit_error(err),
        };
        if let Err(err) = inner.pc.set_local_description(offer.clone()).await {
            return inner.emit_error(err);
        }
        (inner.send_signal)(SignalPayload {
            signal_type: SignalType::Offer,
            sdp: Some(offer.sdp),
            candidate: None,
        });
    }

    /// Replay buffered candidates in arrival order.
    async fn flush_candidates(inner: &Arc<Inner>) {
        let buffered: Vec<IceCandidate> = inner.pending_candidates.lock().drain(..).collect();
        for candidate in buffered {
            if let Err(err) = inner.pc.add_ice_candidate(candidate).await {
                inner.emit_error(err);
            }
        }
    }

    fn attach_channel(inner: &Arc<Inner>, chan: Arc<dyn RtcDataChannel>) -> ChannelHandle {
        let handle = ChannelHandle {
            chan: chan.clone(),
            opened: Arc::new(Notify::new()),
            buffered_low: Arc::new(Notify::new()),
        };
        inner
            .channels
            .lock()
            .insert(chan.label(), handle.clone());

        if let Some(rx) = chan.take_events() {
            let pump = tokio::spawn(Inner::pump_channel(
                inner.clone(),
                chan.label(),
                handle.clone(),
                rx,
            ));
            inner.tasks.lock().push(pump);
        }
        handle
    }

    async fn pump_connection(
        inner: Arc<Inner>,
        mut rx: mpsc::UnboundedReceiver<PeerConnectionEvent>,
    ) {
        while let Some(event) = rx.recv().await {
            if inner.closed.load(Ordering::SeqCst) {
                break;
            }
            match event {
                PeerConnectionEvent::ConnectionState(state) => {
                    inner.events.emit(&PeerEvent::ConnectionState(state));
                    if matches!(
                        state,
                        PeerConnectionState::Disconnected
                            | PeerConnectionState::Failed
                            | PeerConnectionState::Closed
                    ) {
                        inner.events.emit(&PeerEvent::Disconnected(state));
                    }
                }
                PeerConnectionEvent::IceConnectionState(state) => {
                    if state == IceConnectionState::Failed {
                        tracing::debug!(peer = %inner.fingerprint, "ice failed, restarting");
                        if let Err(err) = inner.pc.restart_ice().await {
                            inner.emit_error(err);
                        }
                    }
                }
                PeerConnectionEvent::IceCandidate(candidate) => {
                    match serde_json::to_string(&candidate) {
                        Ok(raw) => (inner.send_signal)(SignalPayload {
                            signal_type: SignalType::Candidate,
                            sdp: None,
                            candidate: Some(raw),
                        }),
                        Err(err) => inner.emit_error(err),
                    }
                }
                PeerConnectionEvent::NegotiationNeeded => {
                    Inner::negotiate(&inner).await;
                }
                PeerConnectionEvent::DataChannel(chan) => {
                    let label = chan.label();
                    Inner::attach_channel(&inner, chan);
                    inner.events.emit(&PeerEvent::DataChannelCreate(label));
                }
            }
        }
    }

    async fn pump_channel(
        inner: Arc<Inner>,
        label: String,
        handle: ChannelHandle,
        mut rx: mpsc::UnboundedReceiver<DataChannelEvent>,
    ) {
        while let Some(event) = rx.recv().await {
            if inner.closed.load(Ordering::SeqCst) {
                break;
            }
            match event {
                DataChannelEvent::Open => {
                    handle.opened.notify_one();
                    inner.events.emit(&PeerEvent::DataChannelOpen(label.clone()));
                }
                DataChannelEvent::Close => {
                    inner.channels.lock().remove(&label);
                    inner
                        .events
                        .emit(&PeerEvent::DataChannelClose(label.clone()));
                }
                DataChannelEvent::Text(text) => {
                    let payload = match serde_json::from_str::<Value>(&text) {
                        Ok(value) => DataPayload::Json(value),
                        Err(_) => DataPayload::Text(text),
                    };
                    inner.events.emit(&PeerEvent::Data {
                        payload,
                        label: label.clone(),
                    });
                }
                DataChannelEvent::Binary(data) => {
                    inner.events.emit(&PeerEvent::Data {
                        payload: DataPayload::Binary(data),
                        label: label.clone(),
                    });
                }
                DataChannelEvent::BufferedAmountLow => {
                    handle.buffered_low.notify_one();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackEngine;
    use crate::rtc::{RtcConfig, RtcEngine};
    use std::sync::atomic::AtomicUsize;

    fn collect_signals() -> (SignalSender, Arc<Mutex<Vec<SignalPayload>>>) {
        let sent: Arc<Mutex<Vec<SignalPayload>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = sent.clone();
        let sender: SignalSender = Arc::new(move |payload| sink.lock().push(payload));
        (sender, sent)
    }

    async fn session_pair() -> (PeerSession, PeerSession, Arc<Mutex<Vec<SignalPayload>>>) {
        let engine = LoopbackEngine::new();
        let (a_signals, a_sent) = collect_signals();
        let (b_signals, _b_sent) = collect_signals();
        let a_pc = engine
            .create_peer_connection(&RtcConfig::default())
            .await
            .unwrap();
        let b_pc = engine
            .create_peer_connection(&RtcConfig::default())
            .await
            .unwrap();
        let a = PeerSession::new("fp-a", "alice", a_pc, a_signals);
        let b = PeerSession::new("fp-b", "bob", b_pc, b_signals);
        (a, b, a_sent)
    }

    #[tokio::test]
    async fn offer_answer_candidate_flow_connects() {
        let engine = LoopbackEngine::new();
        let (a_signals, a_sent) = collect_signals();
        let (b_signals, b_sent) = collect_signals();
        let a_pc = engine
            .create_peer_connection(&RtcConfig::default())
            .await
            .unwrap();
        let b_pc = engine
            .create_peer_connection(&RtcConfig::default())
            .await
            .unwrap();
        let a = PeerSession::new("fp-a", "alice", a_pc, a_signals);
        let b = PeerSession::new("fp-b", "bob", b_pc, b_signals);

        a.create_offer(None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        for signal in a_sent.lock().drain(..) {
            b.handle_signal(signal).await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        for signal in b_sent.lock().drain(..) {
            a.handle_signal(signal).await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(a.connection_state(), PeerConnectionState::Connected);
        assert_eq!(b.connection_state(), PeerConnectionState::Connected);

        // The default channel opened on both ends.
        a.wait_channel_open(DEFAULT_CHANNEL, Duration::from_secs(1))
            .await
            .unwrap();
        b.wait_channel_open(DEFAULT_CHANNEL, Duration::from_secs(1))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn candidates_buffer_until_remote_description() {
        let (_a, b, _a_sent) = session_pair().await;

        let candidate = serde_json::to_string(&IceCandidate {
            candidate: "candidate:test".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        })
        .unwrap();

        for _ in 0..3 {
            b.handle_signal(SignalPayload {
                signal_type: SignalType::Candidate,
                sdp: None,
                candidate: Some(candidate.clone()),
            })
            .await;
        }
        assert_eq!(b.pending_candidate_count(), 3);
    }

    #[tokio::test]
    async fn data_roundtrip_json_text_binary() {
        let engine = LoopbackEngine::new();
        let (a_signals, a_sent) = collect_signals();
        let (b_signals, b_sent) = collect_signals();
        let a_pc = engine
            .create_peer_connection(&RtcConfig::default())
            .await
            .unwrap();
        let b_pc = engine
            .create_peer_connection(&RtcConfig::default())
            .await
            .unwrap();
        let a = PeerSession::new("fp-a", "alice", a_pc, a_signals);
        let b = PeerSession::new("fp-b", "bob", b_pc, b_signals);

        a.create_offer(None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        for signal in a_sent.lock().drain(..) {
            b.handle_signal(signal).await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        for signal in b_sent.lock().drain(..) {
            a.handle_signal(signal).await;
        }
        a.wait_channel_open(DEFAULT_CHANNEL, Duration::from_secs(1))
            .await
            .unwrap();

        let received: Arc<Mutex<Vec<DataPayload>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        b.events().on(PeerEventKind::Data, move |ev| {
            if let PeerEvent::Data { payload, .. } = ev {
                sink.lock().push(payload.clone());
            }
            Ok(())
        });

        a.send_json(&serde_json::json!({"kind": "hello"}), None)
            .await
            .unwrap();
        a.send_text("not json at all", None).await.unwrap();
        a.send_binary(&[1, 2, 3, 255], None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let received = received.lock();
        assert_eq!(received.len(), 3);
        assert!(matches!(&received[0], DataPayload::Json(v) if v["kind"] == "hello"));
        assert!(matches!(&received[1], DataPayload::Text(t) if t == "not json at all"));
        assert!(matches!(&received[2], DataPayload::Binary(b) if b == &[1, 2, 3, 255]));
    }

    #[tokio::test]
    async fn send_on_missing_channel_fails() {
        let (a, _b, _sent) = session_pair().await;
        let err = a.send_text("x", Some("nope")).await.unwrap_err();
        assert!(matches!(err, Error::ChannelNotOpen(label) if label == "nope"));
    }

    #[tokio::test]
    async fn closed_session_is_silent_and_rejects_sends() {
        let (a, _b, _sent) = session_pair().await;
        let events = Arc::new(AtomicUsize::new(0));
        let events2 = events.clone();
        a.events().on(PeerEventKind::ConnectionState, move |_| {
            events2.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        a.close().await;
        a.close().await; // idempotent

        assert_eq!(a.connection_state(), PeerConnectionState::Closed);
        assert!(matches!(
            a.send_text("x", None).await.unwrap_err(),
            Error::ChannelNotOpen(_)
        ));
        // Listener table was cleared and pumps stopped.
        assert_eq!(a.events().listener_count(PeerEventKind::ConnectionState), 0);
        assert_eq!(events.load(Ordering::SeqCst), 0);
    }
}
