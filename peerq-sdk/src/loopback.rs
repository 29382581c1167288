//! In-process implementations of the socket and RTC seams.
//!
//! Everything here runs inside one process with no network: socket
//! pairs are mpsc pipes, and "peer connections" are linked through a
//! shared registry by smuggling the connection id through the SDP
//! text. The full SDK stack — signaling, negotiation, data channels,
//! transfers, sync — runs unmodified on top.
//!
//! Used by the test suites and by embedders that want to exercise
//! application logic without a signaling server or an RTC engine.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::mpsc;

use crate::rtc::{
    DataChannelConfig, DataChannelEvent, DataChannelState, IceCandidate, IceConnectionState,
    MediaTrack, PeerConnectionEvent, PeerConnectionState, RtcConfig, RtcDataChannel, RtcEngine,
    RtcError, RtcPeerConnection, SdpType, SessionDescription,
};
use crate::socket::{
    SocketConnector, SocketError, SocketEvent, SocketHalves, SocketSink, SocketStream,
};

// ── Socket pair ────────────────────────────────────────────────────

pub struct LoopbackSink {
    peer_tx: mpsc::UnboundedSender<SocketEvent>,
    local_tx: mpsc::UnboundedSender<SocketEvent>,
    closed: Arc<AtomicBool>,
}

pub struct LoopbackStream {
    rx: mpsc::UnboundedReceiver<SocketEvent>,
    done: bool,
}

#[async_trait]
impl SocketSink for LoopbackSink {
    async fn send(&mut self, frame: &str) -> Result<(), SocketError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SocketError::Closed);
        }
        self.peer_tx
            .send(SocketEvent::Message(frame.to_string()))
            .map_err(|_| SocketError::Closed)
    }

    async fn close(&mut self, code: u16, reason: &str) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let event = SocketEvent::Closed {
            code,
            reason: reason.to_string(),
        };
        let _ = self.peer_tx.send(event.clone());
        let _ = self.local_tx.send(event);
    }
}

#[async_trait]
impl SocketStream for LoopbackStream {
    async fn recv(&mut self) -> Option<SocketEvent> {
        if self.done {
            return None;
        }
        let event = self.rx.recv().await;
        if matches!(event, Some(SocketEvent::Closed { .. }) | None) {
            self.done = true;
        }
        event
    }
}

/// A connected pair of in-process sockets. Closing either side delivers
/// `Closed` to both streams, like a real socket teardown.
pub fn socket_pair() -> (SocketHalves, SocketHalves) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    let closed = Arc::new(AtomicBool::new(false));

    let a: SocketHalves = (
        Box::new(LoopbackSink {
            peer_tx: b_tx.clone(),
            local_tx: a_tx.clone(),
            closed: closed.clone(),
        }),
        Box::new(LoopbackStream {
            rx: a_rx,
            done: false,
        }),
    );
    let b: SocketHalves = (
        Box::new(LoopbackSink {
            peer_tx: a_tx,
            local_tx: b_tx,
            closed,
        }),
        Box::new(LoopbackStream {
            rx: b_rx,
            done: false,
        }),
    );
    (a, b)
}

/// Connector whose accepted ends surface on a queue, so a test server
/// can speak the signaling protocol to every client that connects.
pub struct LoopbackConnector {
    accept_tx: mpsc::UnboundedSender<SocketHalves>,
    refuse: AtomicBool,
}

impl LoopbackConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<SocketHalves>) {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                accept_tx,
                refuse: AtomicBool::new(false),
            }),
            accept_rx,
        )
    }

    /// Make subsequent connects fail, for reconnect/backoff tests.
    pub fn set_refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }
}

#[async_trait]
impl SocketConnector for LoopbackConnector {
    async fn connect(&self, url: &str) -> Result<SocketHalves, SocketError> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(SocketError::Connect {
                url: url.to_string(),
                reason: "refused".to_string(),
            });
        }
        let (client, server) = socket_pair();
        self.accept_tx
            .send(server)
            .map_err(|_| SocketError::Connect {
                url: url.to_string(),
                reason: "acceptor gone".to_string(),
            })?;
        Ok(client)
    }
}

// ── RTC engine ─────────────────────────────────────────────────────

const SDP_PREFIX: &str = "v=0 loopback ";

fn new_id() -> String {
    let mut rng = rand::thread_rng();
    (0..16)
        .map(|_| {
            let n: u8 = rng.gen_range(0..16);
            char::from_digit(n as u32, 16).unwrap_or('0')
        })
        .collect()
}

#[derive(Default)]
struct EngineShared {
    pcs: Mutex<HashMap<String, Arc<LoopbackPeerConnection>>>,
}

/// Engine whose peer connections pair up through a shared registry.
/// Both ends of a session must come from the same engine instance.
#[derive(Clone, Default)]
pub struct LoopbackEngine {
    shared: Arc<EngineShared>,
}

impl LoopbackEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Concrete handles to live connections, for test assertions.
    pub fn connections(&self) -> Vec<Arc<LoopbackPeerConnection>> {
        self.shared.pcs.lock().values().cloned().collect()
    }
}

#[async_trait]
impl RtcEngine for LoopbackEngine {
    async fn create_peer_connection(
        &self,
        _config: &RtcConfig,
    ) -> Result<Arc<dyn RtcPeerConnection>, RtcError> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let pc = Arc::new(LoopbackPeerConnection {
            id: new_id(),
            shared: Arc::downgrade(&self.shared),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            state: Mutex::new(PeerConnectionState::New),
            ice_state: Mutex::new(IceConnectionState::New),
            linked: Mutex::new(None),
            pending_channels: Mutex::new(Vec::new()),
            remote_candidates: AtomicUsize::new(0),
            tracks: Mutex::new(Vec::new()),
        });
        self.shared.pcs.lock().insert(pc.id.clone(), pc.clone());
        Ok(pc)
    }
}

pub struct LoopbackPeerConnection {
    id: String,
    shared: Weak<EngineShared>,
    events_tx: mpsc::UnboundedSender<PeerConnectionEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<PeerConnectionEvent>>>,
    state: Mutex<PeerConnectionState>,
    ice_state: Mutex<IceConnectionState>,
    linked: Mutex<Option<String>>,
    pending_channels: Mutex<Vec<Arc<LoopbackDataChannel>>>,
    remote_candidates: AtomicUsize,
    tracks: Mutex<Vec<(String, MediaTrack)>>,
}

impl LoopbackPeerConnection {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Candidates the remote side has added on us so far.
    pub fn remote_candidate_count(&self) -> usize {
        self.remote_candidates.load(Ordering::SeqCst)
    }

    pub fn track_count(&self) -> usize {
        self.tracks.lock().len()
    }

    fn set_state(&self, state: PeerConnectionState) {
        *self.state.lock() = state;
        let _ = self
            .events_tx
            .send(PeerConnectionEvent::ConnectionState(state));
    }

    fn local_description(&self, kind: SdpType) -> SessionDescription {
        SessionDescription {
            kind,
            sdp: format!("{SDP_PREFIX}{}", self.id),
        }
    }

    fn emit_host_candidate(&self) {
        let _ = self
            .events_tx
            .send(PeerConnectionEvent::IceCandidate(IceCandidate {
                candidate: format!("candidate:0 1 UDP 2122252543 127.0.0.1 0 typ host {}", self.id),
                sdp_mid: Some("0".to_string()),
                sdp_mline_index: Some(0),
                username_fragment: None,
            }));
    }

    fn peer(&self) -> Option<Arc<LoopbackPeerConnection>> {
        let shared = self.shared.upgrade()?;
        let linked = self.linked.lock().clone()?;
        let pcs = shared.pcs.lock();
        pcs.get(&linked).cloned()
    }

    /// Once both sides have installed each other's descriptions, bring
    /// the pair up and deliver every pre-created channel.
    fn try_establish(&self) {
        let Some(peer) = self.peer() else { return };
        let mutual = peer.linked.lock().as_deref() == Some(self.id.as_str());
        if !mutual {
            return;
        }
        for pc in [self, peer.as_ref()] {
            if *pc.state.lock() != PeerConnectionState::Connected {
                pc.set_state(PeerConnectionState::Connecting);
                pc.set_state(PeerConnectionState::Connected);
                *pc.ice_state.lock() = IceConnectionState::Connected;
                let _ = pc.events_tx.send(PeerConnectionEvent::IceConnectionState(
                    IceConnectionState::Connected,
                ));
            }
        }
        for chan in self.pending_channels.lock().drain(..) {
            deliver_channel(&chan, &peer);
        }
        for chan in peer.pending_channels.lock().drain(..) {
            deliver_channel(&chan, self);
        }
    }
}

/// Create the remote half of `local`, wire the pipes, open both, and
/// announce the new channel on `target`'s connection events.
fn deliver_channel(local: &Arc<LoopbackDataChannel>, target: &LoopbackPeerConnection) {
    let remote = Arc::new(LoopbackDataChannel::new(local.label.clone()));
    *local.peer.lock() = Some(Arc::downgrade(&remote));
    *remote.peer.lock() = Some(Arc::downgrade(local));

    let _ = target
        .events_tx
        .send(PeerConnectionEvent::DataChannel(remote.clone()));

    for half in [local, &remote] {
        *half.state.lock() = DataChannelState::Open;
        let _ = half.events_tx.send(DataChannelEvent::Open);
    }
}

#[async_trait]
impl RtcPeerConnection for LoopbackPeerConnection {
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<PeerConnectionEvent>> {
        self.events_rx.lock().take()
    }

    async fn create_offer(&self) -> Result<SessionDescription, RtcError> {
        if *self.state.lock() == PeerConnectionState::Closed {
            return Err(RtcError::Closed);
        }
        self.emit_host_candidate();
        Ok(self.local_description(SdpType::Offer))
    }

    async fn create_answer(&self) -> Result<SessionDescription, RtcError> {
        if *self.state.lock() == PeerConnectionState::Closed {
            return Err(RtcError::Closed);
        }
        self.emit_host_candidate();
        Ok(self.local_description(SdpType::Answer))
    }

    async fn set_local_description(&self, _desc: SessionDescription) -> Result<(), RtcError> {
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), RtcError> {
        let peer_id = desc
            .sdp
            .strip_prefix(SDP_PREFIX)
            .ok_or_else(|| RtcError::InvalidDescription(desc.sdp.clone()))?;
        *self.linked.lock() = Some(peer_id.to_string());
        self.try_establish();
        Ok(())
    }

    async fn add_ice_candidate(&self, _candidate: IceCandidate) -> Result<(), RtcError> {
        self.remote_candidates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn create_data_channel(
        &self,
        config: DataChannelConfig,
    ) -> Result<Arc<dyn RtcDataChannel>, RtcError> {
        if *self.state.lock() == PeerConnectionState::Closed {
            return Err(RtcError::Closed);
        }
        let chan = Arc::new(LoopbackDataChannel::new(config.label));
        let peer = self.peer();
        match peer {
            Some(peer) if peer.linked.lock().as_deref() == Some(self.id.as_str()) => {
                deliver_channel(&chan, &peer);
            }
            _ => self.pending_channels.lock().push(chan.clone()),
        }
        Ok(chan)
    }

    async fn restart_ice(&self) -> Result<(), RtcError> {
        *self.ice_state.lock() = IceConnectionState::Checking;
        Ok(())
    }

    async fn add_track(&self, stream_id: &str, track: MediaTrack) -> Result<(), RtcError> {
        self.tracks.lock().push((stream_id.to_string(), track));
        let _ = self.events_tx.send(PeerConnectionEvent::NegotiationNeeded);
        Ok(())
    }

    async fn remove_track(&self, _stream_id: &str, track_id: &str) -> Result<(), RtcError> {
        self.tracks.lock().retain(|(_, t)| t.id != track_id);
        let _ = self.events_tx.send(PeerConnectionEvent::NegotiationNeeded);
        Ok(())
    }

    fn connection_state(&self) -> PeerConnectionState {
        *self.state.lock()
    }

    fn ice_connection_state(&self) -> IceConnectionState {
        *self.ice_state.lock()
    }

    async fn close(&self) {
        if *self.state.lock() == PeerConnectionState::Closed {
            return;
        }
        let peer = self.peer();
        self.set_state(PeerConnectionState::Closed);
        if let Some(shared) = self.shared.upgrade() {
            shared.pcs.lock().remove(&self.id);
        }
        if let Some(peer) = peer
            && *peer.state.lock() == PeerConnectionState::Connected
        {
            peer.set_state(PeerConnectionState::Disconnected);
        }
    }
}

pub struct LoopbackDataChannel {
    label: String,
    state: Mutex<DataChannelState>,
    events_tx: mpsc::UnboundedSender<DataChannelEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<DataChannelEvent>>>,
    peer: Mutex<Option<Weak<LoopbackDataChannel>>>,
    low_threshold: AtomicU64,
}

impl LoopbackDataChannel {
    fn new(label: String) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            label,
            state: Mutex::new(DataChannelState::Connecting),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            peer: Mutex::new(None),
            low_threshold: AtomicU64::new(0),
        }
    }

    fn peer_half(&self) -> Option<Arc<LoopbackDataChannel>> {
        self.peer.lock().as_ref().and_then(Weak::upgrade)
    }
}

#[async_trait]
impl RtcDataChannel for LoopbackDataChannel {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn ready_state(&self) -> DataChannelState {
        *self.state.lock()
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<DataChannelEvent>> {
        self.events_rx.lock().take()
    }

    async fn send_text(&self, text: &str) -> Result<(), RtcError> {
        if *self.state.lock() != DataChannelState::Open {
            return Err(RtcError::NotOpen);
        }
        let peer = self.peer_half().ok_or(RtcError::NotOpen)?;
        peer.events_tx
            .send(DataChannelEvent::Text(text.to_string()))
            .map_err(|_| RtcError::NotOpen)
    }

    async fn send_binary(&self, data: &[u8]) -> Result<(), RtcError> {
        if *self.state.lock() != DataChannelState::Open {
            return Err(RtcError::NotOpen);
        }
        let peer = self.peer_half().ok_or(RtcError::NotOpen)?;
        peer.events_tx
            .send(DataChannelEvent::Binary(data.to_vec()))
            .map_err(|_| RtcError::NotOpen)
    }

    fn buffered_amount(&self) -> u64 {
        // Delivery is immediate; nothing ever queues.
        0
    }

    fn set_buffered_amount_low_threshold(&self, threshold: u64) {
        self.low_threshold.store(threshold, Ordering::SeqCst);
    }

    async fn close(&self) {
        {
            let mut state = self.state.lock();
            if *state == DataChannelState::Closed {
                return;
            }
            *state = DataChannelState::Closed;
        }
        let _ = self.events_tx.send(DataChannelEvent::Close);
        if let Some(peer) = self.peer_half() {
            let mut state = peer.state.lock();
            if *state != DataChannelState::Closed {
                *state = DataChannelState::Closed;
                drop(state);
                let _ = peer.events_tx.send(DataChannelEvent::Close);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn socket_pair_delivers_and_closes_both_sides() {
        let ((mut a_sink, mut a_stream), (mut b_sink, mut b_stream)) = socket_pair();

        a_sink.send("hello").await.unwrap();
        match b_stream.recv().await {
            Some(SocketEvent::Message(m)) => assert_eq!(m, "hello"),
            other => panic!("unexpected event: {other:?}"),
        }

        b_sink.close(4000, "bye").await;
        assert!(matches!(
            a_stream.recv().await,
            Some(SocketEvent::Closed { code: 4000, .. })
        ));
        assert!(a_stream.recv().await.is_none());
        assert!(a_sink.send("late").await.is_err());
    }

    #[tokio::test]
    async fn refused_connector_errors() {
        let (connector, _accept) = LoopbackConnector::new();
        connector.set_refuse(true);
        assert!(connector.connect("loop://server").await.is_err());
        connector.set_refuse(false);
        assert!(connector.connect("loop://server").await.is_ok());
    }

    async fn linked_pair() -> (Arc<dyn RtcPeerConnection>, Arc<dyn RtcPeerConnection>) {
        let engine = LoopbackEngine::new();
        let a = engine
            .create_peer_connection(&RtcConfig::default())
            .await
            .unwrap();
        let b = engine
            .create_peer_connection(&RtcConfig::default())
            .await
            .unwrap();

        let offer = a.create_offer().await.unwrap();
        a.set_local_description(offer.clone()).await.unwrap();
        b.set_remote_description(offer).await.unwrap();
        let answer = b.create_answer().await.unwrap();
        b.set_local_description(answer.clone()).await.unwrap();
        a.set_remote_description(answer).await.unwrap();
        (a, b)
    }

    #[tokio::test]
    async fn offer_answer_links_and_connects() {
        let (a, b) = linked_pair().await;
        assert_eq!(a.connection_state(), PeerConnectionState::Connected);
        assert_eq!(b.connection_state(), PeerConnectionState::Connected);
    }

    #[tokio::test]
    async fn pre_negotiation_channel_arrives_after_link() {
        let engine = LoopbackEngine::new();
        let a = engine
            .create_peer_connection(&RtcConfig::default())
            .await
            .unwrap();
        let b = engine
            .create_peer_connection(&RtcConfig::default())
            .await
            .unwrap();
        let mut b_events = b.take_events().unwrap();

        // Channel created before any negotiation, like the default `data`
        // channel on the offering side.
        let chan = a
            .create_data_channel(DataChannelConfig::ordered("data"))
            .await
            .unwrap();
        assert_eq!(chan.ready_state(), DataChannelState::Connecting);

        let offer = a.create_offer().await.unwrap();
        b.set_remote_description(offer).await.unwrap();
        let answer = b.create_answer().await.unwrap();
        a.set_remote_description(answer).await.unwrap();

        assert_eq!(chan.ready_state(), DataChannelState::Open);

        let remote = loop {
            match b_events.recv().await.expect("b event stream ended") {
                PeerConnectionEvent::DataChannel(c) => break c,
                _ => continue,
            }
        };
        assert_eq!(remote.label(), "data");

        chan.send_text("ping").await.unwrap();
        let mut remote_events = remote.take_events().unwrap();
        loop {
            match remote_events.recv().await.expect("channel events ended") {
                DataChannelEvent::Text(t) => {
                    assert_eq!(t, "ping");
                    break;
                }
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn close_notifies_the_other_side() {
        let (a, b) = linked_pair().await;
        a.close().await;
        assert_eq!(a.connection_state(), PeerConnectionState::Closed);
        assert_eq!(b.connection_state(), PeerConnectionState::Disconnected);
    }
}
