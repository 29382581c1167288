//! The signaling transport: one logical stream to the server that
//! survives socket churn.
//!
//! A single actor task owns the socket and multiplexes four concerns in
//! one `select!` loop: inbound frames, outbound commands, the ping
//! heartbeat, and the pong deadline. While no socket is open, outbound
//! messages land in a bounded queue (capacity 500) and are flushed FIFO
//! on the next open; overflow is dropped silently.
//!
//! Heartbeat: a `ping` every `ping_interval`; after each ping a check is
//! scheduled `ping_interval × 2.5` later, and if no pong has been seen
//! within that bound the socket is force-closed with code 4000 so the
//! reconnect path takes over. Server pings are answered immediately and
//! neither direction of ping/pong is surfaced to subscribers.
//!
//! Reconnect: unintentional closes schedule a retry with exponential
//! backoff (`delay = min(reconnect_delay × 2^n, reconnect_max_delay)`),
//! emitting `reconnecting` before each attempt and going silent after
//! `max_reconnect_attempts` failures. `close()` clears the queue and
//! suppresses all of it.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::emitter::{BusEvent, Emitter};
use crate::error::Error;
use crate::protocol::{Envelope, MessageType};
use crate::socket::{SocketConnector, SocketEvent, SocketSink, SocketStream};

/// Outbound queue capacity while the socket is down.
pub const OUTBOUND_QUEUE_LIMIT: usize = 500;

/// Close code used when the pong deadline fires.
pub const HEARTBEAT_CLOSE_CODE: u16 = 4000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Idle,
    Connecting,
    Open,
    Reconnecting,
    Closed,
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub url: String,
    pub auto_reconnect: bool,
    pub reconnect_delay: Duration,
    pub reconnect_max_delay: Duration,
    pub max_reconnect_attempts: u32,
    pub ping_interval: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            auto_reconnect: true,
            reconnect_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(30),
            max_reconnect_attempts: 10,
            ping_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub enum TransportEvent {
    Open,
    Close { code: u16, reason: String },
    Message(Envelope),
    Error(String),
    Reconnecting { attempt: u32, delay: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportEventKind {
    Open,
    Close,
    Message,
    Error,
    Reconnecting,
}

impl BusEvent for TransportEvent {
    type Kind = TransportEventKind;

    fn kind(&self) -> TransportEventKind {
        match self {
            TransportEvent::Open => TransportEventKind::Open,
            TransportEvent::Close { .. } => TransportEventKind::Close,
            TransportEvent::Message(_) => TransportEventKind::Message,
            TransportEvent::Error(_) => TransportEventKind::Error,
            TransportEvent::Reconnecting { .. } => TransportEventKind::Reconnecting,
        }
    }
}

enum Cmd {
    Connect(oneshot::Sender<Result<(), Error>>),
    Send(Envelope),
    Close,
}

/// Handle to the transport actor. Cheap to clone.
#[derive(Clone)]
pub struct Transport {
    cmd_tx: mpsc::UnboundedSender<Cmd>,
    events: Emitter<TransportEvent>,
    state: Arc<Mutex<TransportState>>,
}

impl Transport {
    pub fn new(connector: Arc<dyn SocketConnector>, config: TransportConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let events = Emitter::new();
        let state = Arc::new(Mutex::new(TransportState::Idle));

        let actor = Actor {
            connector,
            config,
            events: events.clone(),
            state: state.clone(),
            cmd_rx,
            queue: VecDeque::new(),
            intentional: false,
        };
        tokio::spawn(actor.run());

        Self {
            cmd_tx,
            events,
            state,
        }
    }

    /// Resolves once the socket is open; fails if it closes first.
    pub async fn connect(&self) -> Result<(), Error> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.cmd_tx
            .send(Cmd::Connect(ack_tx))
            .map_err(|_| Error::Disconnected)?;
        ack_rx.await.map_err(|_| Error::Disconnected)?
    }

    /// Write now when open, otherwise queue (bounded, drop on overflow).
    pub fn send(&self, message: Envelope) -> Result<(), Error> {
        self.cmd_tx
            .send(Cmd::Send(message))
            .map_err(|_| Error::Disconnected)
    }

    /// Intentional close: clears the queue and suppresses reconnection.
    pub fn close(&self) {
        let _ = self.cmd_tx.send(Cmd::Close);
    }

    pub fn events(&self) -> &Emitter<TransportEvent> {
        &self.events
    }

    pub fn state(&self) -> TransportState {
        *self.state.lock()
    }
}

enum SessionEnd {
    /// Socket closed (either side); reconnect policy decides what is next.
    Closed,
    /// Every handle is gone; the actor should wind down.
    HandleDropped,
}

struct Actor {
    connector: Arc<dyn SocketConnector>,
    config: TransportConfig,
    events: Emitter<TransportEvent>,
    state: Arc<Mutex<TransportState>>,
    cmd_rx: mpsc::UnboundedReceiver<Cmd>,
    queue: VecDeque<Envelope>,
    intentional: bool,
}

impl Actor {
    fn set_state(&self, state: TransportState) {
        *self.state.lock() = state;
    }

    fn enqueue(&mut self, message: Envelope) {
        if self.queue.len() >= OUTBOUND_QUEUE_LIMIT {
            tracing::warn!("outbound queue full, dropping message");
            return;
        }
        self.queue.push_back(message);
    }

    async fn run(mut self) {
        let mut acks: Vec<oneshot::Sender<Result<(), Error>>> = Vec::new();

        // Idle until the first connect request.
        loop {
            match self.cmd_rx.recv().await {
                Some(Cmd::Connect(ack)) => {
                    acks.push(ack);
                    break;
                }
                Some(Cmd::Send(message)) => self.enqueue(message),
                Some(Cmd::Close) | None => {
                    self.set_state(TransportState::Closed);
                    return;
                }
            }
        }

        let mut attempts: u32 = 0;
        loop {
            self.set_state(TransportState::Connecting);
            match self.connector.connect(&self.config.url).await {
                Ok((sink, stream)) => {
                    attempts = 0;
                    for ack in acks.drain(..) {
                        let _ = ack.send(Ok(()));
                    }
                    match self.run_session(sink, stream).await {
                        SessionEnd::Closed => {}
                        SessionEnd::HandleDropped => {
                            self.set_state(TransportState::Closed);
                            return;
                        }
                    }
                }
                Err(err) => {
                    tracing::debug!(error = %err, "signaling connect failed");
                    for ack in acks.drain(..) {
                        let _ = ack.send(Err(Error::OpenFailed(err.to_string())));
                    }
                    self.events.emit(&TransportEvent::Error(err.to_string()));
                }
            }

            if self.intentional || !self.config.auto_reconnect {
                self.set_state(TransportState::Closed);
                return;
            }
            if attempts >= self.config.max_reconnect_attempts {
                tracing::warn!(attempts, "reconnect attempts exhausted");
                self.set_state(TransportState::Closed);
                return;
            }

            let exp = 2u32.saturating_pow(attempts.min(16));
            let delay = self
                .config
                .reconnect_delay
                .saturating_mul(exp)
                .min(self.config.reconnect_max_delay);
            attempts += 1;
            self.set_state(TransportState::Reconnecting);
            self.events.emit(&TransportEvent::Reconnecting {
                attempt: attempts,
                delay,
            });
            tracing::debug!(attempt = attempts, ?delay, "scheduling reconnect");

            // Sleep out the backoff while still accepting commands. A new
            // connect request cuts the wait short.
            let deadline = Instant::now() + delay;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => break,
                    cmd = self.cmd_rx.recv() => match cmd {
                        Some(Cmd::Send(message)) => self.enqueue(message),
                        Some(Cmd::Connect(ack)) => {
                            acks.push(ack);
                            break;
                        }
                        Some(Cmd::Close) | None => {
                            self.queue.clear();
                            self.set_state(TransportState::Closed);
                            return;
                        }
                    },
                }
            }
        }
    }

    async fn run_session(
        &mut self,
        mut sink: Box<dyn SocketSink>,
        mut stream: Box<dyn SocketStream>,
    ) -> SessionEnd {
        self.set_state(TransportState::Open);
        self.events.emit(&TransportEvent::Open);

        // FIFO flush; a failed send drops that message, it is not re-queued.
        while let Some(message) = self.queue.pop_front() {
            if let Err(err) = self.write(&mut sink, &message).await {
                tracing::warn!(error = %err, "queued message dropped during flush");
            }
        }

        let pong_bound = self.config.ping_interval.mul_f32(2.5);
        let mut last_pong = Instant::now();
        let mut ping_tick = tokio::time::interval_at(
            Instant::now() + self.config.ping_interval,
            self.config.ping_interval,
        );
        let mut pong_check: Option<Instant> = None;

        loop {
            tokio::select! {
                event = stream.recv() => match event {
                    Some(SocketEvent::Message(frame)) => {
                        match Envelope::parse(&frame) {
                            Ok(env) if env.kind == MessageType::Ping => {
                                let pong = Envelope::new(MessageType::Pong);
                                if let Err(err) = self.write(&mut sink, &pong).await {
                                    tracing::warn!(error = %err, "pong reply failed");
                                }
                            }
                            Ok(env) if env.kind == MessageType::Pong => {
                                last_pong = Instant::now();
                            }
                            Ok(env) => self.events.emit(&TransportEvent::Message(env)),
                            Err(err) => {
                                // A bad frame never tears the socket down.
                                self.events.emit(&TransportEvent::Error(err.to_string()));
                            }
                        }
                    }
                    Some(SocketEvent::Closed { code, reason }) => {
                        self.events.emit(&TransportEvent::Close { code, reason });
                        return SessionEnd::Closed;
                    }
                    None => {
                        self.events.emit(&TransportEvent::Close {
                            code: 1006,
                            reason: "stream ended".to_string(),
                        });
                        return SessionEnd::Closed;
                    }
                },
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(Cmd::Send(message)) => {
                        if let Err(err) = self.write(&mut sink, &message).await {
                            self.events.emit(&TransportEvent::Error(err.to_string()));
                        }
                    }
                    Some(Cmd::Connect(ack)) => {
                        let _ = ack.send(Ok(()));
                    }
                    Some(Cmd::Close) => {
                        self.intentional = true;
                        self.queue.clear();
                        sink.close(1000, "client close").await;
                        // Keep draining until the stream reports the close.
                    }
                    None => {
                        sink.close(1000, "handle dropped").await;
                        return SessionEnd::HandleDropped;
                    }
                },
                _ = ping_tick.tick() => {
                    let ping = Envelope::new(MessageType::Ping);
                    if let Err(err) = self.write(&mut sink, &ping).await {
                        tracing::warn!(error = %err, "ping failed");
                    }
                    pong_check = Some(Instant::now() + pong_bound);
                }
                _ = async {
                    tokio::time::sleep_until(pong_check.unwrap_or_else(Instant::now)).await
                }, if pong_check.is_some() => {
                    pong_check = None;
                    if last_pong.elapsed() >= pong_bound {
                        tracing::warn!("pong deadline missed, forcing close");
                        sink.close(HEARTBEAT_CLOSE_CODE, "pong timeout").await;
                    }
                }
            }
        }
    }

    async fn write(&self, sink: &mut Box<dyn SocketSink>, message: &Envelope) -> Result<(), Error> {
        let frame = message
            .encode()
            .map_err(|err| Error::Protocol(err.to_string()))?;
        sink.send(&frame)
            .await
            .map_err(|err| Error::TransportClosed {
                code: 1006,
                reason: err.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackConnector;
    use crate::socket::SocketHalves;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn config(url: &str) -> TransportConfig {
        TransportConfig {
            url: url.to_string(),
            reconnect_delay: Duration::from_millis(10),
            reconnect_max_delay: Duration::from_millis(80),
            max_reconnect_attempts: 3,
            ping_interval: Duration::from_millis(50),
            ..TransportConfig::default()
        }
    }

    async fn accept(accept_rx: &mut mpsc::UnboundedReceiver<SocketHalves>) -> SocketHalves {
        tokio::time::timeout(Duration::from_secs(1), accept_rx.recv())
            .await
            .expect("accept timed out")
            .expect("connector dropped")
    }

    #[tokio::test]
    async fn connect_send_receive() {
        let (connector, mut accept_rx) = LoopbackConnector::new();
        let transport = Transport::new(connector, config("loop://sig"));

        let (messages_tx, mut messages_rx) = mpsc::unbounded_channel();
        transport.events().on(TransportEventKind::Message, move |ev| {
            if let TransportEvent::Message(env) = ev {
                let _ = messages_tx.send(env.clone());
            }
            Ok(())
        });

        transport.connect().await.unwrap();
        assert_eq!(transport.state(), TransportState::Open);
        let (mut server_sink, mut server_stream) = accept(&mut accept_rx).await;

        transport
            .send(Envelope::new(MessageType::Join).with_namespace("ns"))
            .unwrap();
        match server_stream.recv().await {
            Some(SocketEvent::Message(frame)) => {
                let env = Envelope::parse(&frame).unwrap();
                assert_eq!(env.kind, MessageType::Join);
            }
            other => panic!("unexpected: {other:?}"),
        }

        server_sink
            .send(r#"{"type":"peer_list","namespace":"ns","payload":{"namespace":"ns","peers":[]}}"#)
            .await
            .unwrap();
        let inbound = messages_rx.recv().await.unwrap();
        assert_eq!(inbound.kind, MessageType::PeerList);
    }

    #[tokio::test]
    async fn messages_queue_until_open_and_flush_fifo() {
        let (connector, mut accept_rx) = LoopbackConnector::new();
        let transport = Transport::new(connector, config("loop://sig"));

        for i in 0..3 {
            transport
                .send(Envelope::new(MessageType::Join).with_namespace(format!("ns{i}")))
                .unwrap();
        }

        transport.connect().await.unwrap();
        let (_server_sink, mut server_stream) = accept(&mut accept_rx).await;

        for i in 0..3 {
            match server_stream.recv().await {
                Some(SocketEvent::Message(frame)) => {
                    let env = Envelope::parse(&frame).unwrap();
                    assert_eq!(env.namespace.as_deref(), Some(format!("ns{i}").as_str()));
                }
                other => panic!("unexpected: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn server_ping_gets_immediate_pong() {
        let (connector, mut accept_rx) = LoopbackConnector::new();
        let transport = Transport::new(connector, config("loop://sig"));
        transport.connect().await.unwrap();
        let (mut server_sink, mut server_stream) = accept(&mut accept_rx).await;

        server_sink.send(r#"{"type":"ping"}"#).await.unwrap();
        match server_stream.recv().await {
            Some(SocketEvent::Message(frame)) => {
                let env = Envelope::parse(&frame).unwrap();
                assert_eq!(env.kind, MessageType::Pong);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn missed_pongs_force_close_with_4000() {
        let (connector, mut accept_rx) = LoopbackConnector::new();
        let mut cfg = config("loop://sig");
        cfg.auto_reconnect = false;
        let transport = Transport::new(connector, cfg);

        let (closed_tx, mut closed_rx) = mpsc::unbounded_channel();
        transport.events().on(TransportEventKind::Close, move |ev| {
            if let TransportEvent::Close { code, .. } = ev {
                let _ = closed_tx.send(*code);
            }
            Ok(())
        });

        transport.connect().await.unwrap();
        // Server that never answers pings.
        let (_server_sink, mut server_stream) = accept(&mut accept_rx).await;
        tokio::spawn(async move { while server_stream.recv().await.is_some() {} });

        let code = tokio::time::timeout(Duration::from_secs(2), closed_rx.recv())
            .await
            .expect("no close before timeout")
            .unwrap();
        assert_eq!(code, HEARTBEAT_CLOSE_CODE);
    }

    #[tokio::test]
    async fn reconnect_emits_exactly_max_attempts_then_goes_silent() {
        let (connector, mut accept_rx) = LoopbackConnector::new();
        let transport = Transport::new(connector.clone(), config("loop://sig"));

        let attempts = Arc::new(AtomicU32::new(0));
        let attempts2 = attempts.clone();
        transport
            .events()
            .on(TransportEventKind::Reconnecting, move |_| {
                attempts2.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });

        transport.connect().await.unwrap();
        let (mut server_sink, _server_stream) = accept(&mut accept_rx).await;

        // Refuse all further connects, then drop the live socket.
        connector.set_refuse(true);
        server_sink.close(1001, "server going away").await;

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(transport.state(), TransportState::Closed);
    }

    #[tokio::test]
    async fn reconnect_reopens_when_server_returns() {
        let (connector, mut accept_rx) = LoopbackConnector::new();
        let transport = Transport::new(connector, config("loop://sig"));

        let opens = Arc::new(AtomicU32::new(0));
        let opens2 = opens.clone();
        transport.events().on(TransportEventKind::Open, move |_| {
            opens2.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        transport.connect().await.unwrap();
        let (mut server_sink, _stream) = accept(&mut accept_rx).await;
        server_sink.close(1001, "drop").await;

        // The connector accepts again; a second session should open.
        let _second = accept(&mut accept_rx).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(opens.load(Ordering::SeqCst), 2);
        assert_eq!(transport.state(), TransportState::Open);
    }

    #[tokio::test]
    async fn intentional_close_suppresses_reconnect() {
        let (connector, mut accept_rx) = LoopbackConnector::new();
        let transport = Transport::new(connector, config("loop://sig"));
        transport.connect().await.unwrap();
        let _server = accept(&mut accept_rx).await;

        transport.close();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(transport.state(), TransportState::Closed);

        // No further accepts should happen.
        assert!(
            tokio::time::timeout(Duration::from_millis(100), accept_rx.recv())
                .await
                .is_err()
        );
    }
}
