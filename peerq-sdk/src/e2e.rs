//! End-to-end encrypted 1:1 room.
//!
//! Wraps a [`DirectRoom`] with an ephemeral ECDH(P-256) key exchange and
//! AES-256-GCM framing. The exchange rides the room's own send path:
//!
//! ```json
//! { "_e2e_exchange": true, "type": "key_offer", "publicKey": "…", "fingerprint": "…" }
//! { "_e2e_exchange": true, "type": "key_ack",   "publicKey": "…", "fingerprint": "…" }
//! ```
//!
//! Both sides derive the AES key from the ECDH shared secret through
//! HKDF-SHA256. Encrypted frames are `{ "_encrypted": true, "data":
//! base64(iv || ciphertext_with_tag) }` with a fresh 12-byte IV per
//! message; anything sent before the handshake completes goes out as
//! `{ "_plain": true, "data": … }`.
//!
//! State machine: `connecting → exchanging → ready`, back to
//! `connecting` when the peer leaves or the handshake times out
//! ([`KEY_EXCHANGE_TIMEOUT`], retryable), and `closed` terminally.
//! A decrypt failure surfaces `decrypt_error` and re-initiates the
//! handshake.
//!
//! The room key material is ephemeral and distinct from the client's
//! ECDSA identity; neither is ever reused across purposes.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use aes_gcm::aead::{Aead, KeyInit, OsRng as AeadOsRng};
use aes_gcm::{AeadCore, Aes256Gcm};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use p256::PublicKey;
use p256::ecdh::EphemeralSecret;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::task::JoinHandle;

use crate::emitter::{BusEvent, Emitter};
use crate::room::{DirectRoom, RoomEvent, RoomEventKind};

/// Handshake must complete within this bound; a timeout is retryable.
pub const KEY_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum E2eState {
    Connecting,
    Exchanging,
    Ready,
    Closed,
}

#[derive(Debug, Clone)]
pub enum E2eEvent {
    StateChanged(E2eState),
    /// A decrypted (or plaintext-fallback) application payload.
    Data(Value),
    DecryptError(String),
    Error(String),
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum E2eEventKind {
    StateChanged,
    Data,
    DecryptError,
    Error,
    Closed,
}

impl BusEvent for E2eEvent {
    type Kind = E2eEventKind;

    fn kind(&self) -> E2eEventKind {
        match self {
            E2eEvent::StateChanged(_) => E2eEventKind::StateChanged,
            E2eEvent::Data(_) => E2eEventKind::Data,
            E2eEvent::DecryptError(_) => E2eEventKind::DecryptError,
            E2eEvent::Error(_) => E2eEventKind::Error,
            E2eEvent::Closed => E2eEventKind::Closed,
        }
    }
}

// ── Key material helpers (shared with the offline sync layer) ──────

/// Generate an ephemeral ECDH keypair; the public half is SEC1
/// uncompressed, base64.
pub(crate) fn generate_exchange_keys() -> (EphemeralSecret, String) {
    let secret = EphemeralSecret::random(&mut AeadOsRng);
    let public = B64.encode(secret.public_key().to_sec1_bytes());
    (secret, public)
}

/// Derive the AES-256-GCM key: HKDF-SHA256 over the ECDH shared secret.
pub(crate) fn derive_shared_key(
    secret: &EphemeralSecret,
    peer_public_b64: &str,
) -> Result<[u8; 32], E2eError> {
    let raw = B64
        .decode(peer_public_b64)
        .map_err(|_| E2eError::InvalidKey)?;
    let peer = PublicKey::from_sec1_bytes(&raw).map_err(|_| E2eError::InvalidKey)?;
    let shared = secret.diffie_hellman(&peer);

    let hk = hkdf::Hkdf::<sha2::Sha256>::new(None, shared.raw_secret_bytes().as_slice());
    let mut key = [0u8; 32];
    hk.expand(b"peerq-e2e-v1", &mut key)
        .map_err(|_| E2eError::KdfFailed)?;
    Ok(key)
}

/// `base64(iv || ciphertext_with_tag)` with a random 12-byte IV.
pub(crate) fn encrypt_frame(key: &[u8; 32], plaintext: &[u8]) -> Result<String, E2eError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| E2eError::InvalidKey)?;
    let nonce = Aes256Gcm::generate_nonce(&mut AeadOsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|_| E2eError::EncryptFailed)?;

    let mut frame = Vec::with_capacity(12 + ciphertext.len());
    frame.extend_from_slice(nonce.as_slice());
    frame.extend_from_slice(&ciphertext);
    Ok(B64.encode(frame))
}

pub(crate) fn decrypt_frame(key: &[u8; 32], data_b64: &str) -> Result<Vec<u8>, E2eError> {
    let frame = B64.decode(data_b64).map_err(|_| E2eError::DecryptFailed)?;
    if frame.len() < 12 {
        return Err(E2eError::DecryptFailed);
    }
    let (iv, ciphertext) = frame.split_at(12);
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| E2eError::InvalidKey)?;
    cipher
        .decrypt(aes_gcm::Nonce::from_slice(iv), ciphertext)
        .map_err(|_| E2eError::DecryptFailed)
}

#[derive(Debug, thiserror::Error)]
pub enum E2eError {
    #[error("invalid key material")]
    InvalidKey,
    #[error("key derivation failed")]
    KdfFailed,
    #[error("encryption failed")]
    EncryptFailed,
    #[error("decryption failed")]
    DecryptFailed,
}

// ── The room ───────────────────────────────────────────────────────

/// An encrypted 1:1 room over a [`DirectRoom`].
#[derive(Clone)]
pub struct E2eRoom {
    inner: Arc<E2eInner>,
}

struct E2eInner {
    room: DirectRoom,
    state: Mutex<E2eState>,
    secret: Mutex<Option<EphemeralSecret>>,
    peer_key: Mutex<Option<[u8; 32]>>,
    events: Emitter<E2eEvent>,
    closed: AtomicBool,
    timeout_task: Mutex<Option<JoinHandle<()>>>,
}

impl E2eRoom {
    pub fn new(room: DirectRoom) -> Self {
        let inner = Arc::new(E2eInner {
            room,
            state: Mutex::new(E2eState::Connecting),
            secret: Mutex::new(None),
            peer_key: Mutex::new(None),
            events: Emitter::new(),
            closed: AtomicBool::new(false),
            timeout_task: Mutex::new(None),
        });
        E2eInner::install_listeners(&inner);
        Self { inner }
    }

    pub fn events(&self) -> &Emitter<E2eEvent> {
        &self.inner.events
    }

    pub fn state(&self) -> E2eState {
        *self.inner.state.lock()
    }

    pub fn room(&self) -> &DirectRoom {
        &self.inner.room
    }

    /// Start (or restart) the key exchange toward the bound peer.
    pub async fn initiate_handshake(&self) {
        E2eInner::start_handshake(&self.inner, "key_offer").await;
    }

    /// Encrypt and send when the session is ready; plaintext-marked
    /// fallback otherwise.
    pub async fn send(&self, data: Value) -> Result<(), crate::error::Error> {
        let key = {
            let state = *self.inner.state.lock();
            if state == E2eState::Ready {
                *self.inner.peer_key.lock()
            } else {
                None
            }
        };
        match key {
            Some(key) => {
                let plaintext =
                    serde_json::to_vec(&data).map_err(|e| crate::error::Error::Protocol(e.to_string()))?;
                let frame = encrypt_frame(&key, &plaintext)
                    .map_err(|_| crate::error::Error::Decrypt)?;
                self.inner
                    .room
                    .send(json!({ "_encrypted": true, "data": frame }))
                    .await
            }
            None => {
                self.inner
                    .room
                    .send(json!({ "_plain": true, "data": data }))
                    .await
            }
        }
    }

    /// Terminal: tears down the underlying room too.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.inner.timeout_task.lock().take() {
            task.abort();
        }
        self.inner.set_state(E2eState::Closed);
        self.inner.peer_key.lock().take();
        self.inner.secret.lock().take();
        self.inner.room.close().await;
        self.inner.events.emit(&E2eEvent::Closed);
        self.inner.events.remove_all(None);
    }
}

impl E2eInner {
    fn set_state(&self, state: E2eState) {
        let mut slot = self.state.lock();
        if *slot == state || *slot == E2eState::Closed {
            return;
        }
        *slot = state;
        drop(slot);
        self.events.emit(&E2eEvent::StateChanged(state));
    }

    fn own_fingerprint(&self) -> String {
        self.room.client().fingerprint().unwrap_or_default()
    }

    /// Send a `key_offer` or `key_ack` carrying our public key.
    async fn start_handshake(inner: &Arc<E2eInner>, kind: &str) {
        if inner.closed.load(Ordering::SeqCst) {
            return;
        }
        inner.set_state(E2eState::Exchanging);

        let public = {
            let mut slot = inner.secret.lock();
            if slot.is_none() {
                let (secret, public) = generate_exchange_keys();
                *slot = Some(secret);
                public
            } else {
                let secret = slot.as_ref().expect("just checked");
                B64.encode(secret.public_key().to_sec1_bytes())
            }
        };

        let frame = json!({
            "_e2e_exchange": true,
            "type": kind,
            "publicKey": public,
            "fingerprint": inner.own_fingerprint(),
        });
        if let Err(err) = inner.room.send(frame).await {
            inner.events.emit(&E2eEvent::Error(err.to_string()));
        }

        if kind == "key_offer" {
            E2eInner::arm_timeout(inner);
        }
    }

    /// Timeout is reversible: back to `connecting`, key dropped.
    fn arm_timeout(inner: &Arc<E2eInner>) {
        let weak = Arc::downgrade(inner);
        let task = tokio::spawn(async move {
            tokio::time::sleep(KEY_EXCHANGE_TIMEOUT).await;
            let Some(inner) = weak.upgrade() else { return };
            if *inner.state.lock() == E2eState::Exchanging {
                inner
                    .events
                    .emit(&E2eEvent::Error("key exchange timed out".to_string()));
                inner.peer_key.lock().take();
                inner.set_state(E2eState::Connecting);
            }
        });
        if let Some(previous) = inner.timeout_task.lock().replace(task) {
            previous.abort();
        }
    }

    async fn handle_exchange(inner: &Arc<E2eInner>, frame: &Value) {
        let kind = frame.get("type").and_then(Value::as_str).unwrap_or("");
        let Some(peer_public) = frame.get("publicKey").and_then(Value::as_str) else {
            inner
                .events
                .emit(&E2eEvent::Error("exchange frame without key".to_string()));
            return;
        };

        // Make sure we have our own keypair before deriving.
        if inner.secret.lock().is_none() {
            let (secret, _) = generate_exchange_keys();
            *inner.secret.lock() = Some(secret);
        }
        let derived = {
            let slot = inner.secret.lock();
            let secret = slot.as_ref().expect("populated above");
            derive_shared_key(secret, peer_public)
        };

        match derived {
            Ok(key) => {
                *inner.peer_key.lock() = Some(key);
                if kind == "key_offer" {
                    E2eInner::start_handshake(inner, "key_ack").await;
                }
                inner.set_state(E2eState::Ready);
                if let Some(task) = inner.timeout_task.lock().take() {
                    task.abort();
                }
            }
            Err(err) => {
                inner.events.emit(&E2eEvent::Error(err.to_string()));
                inner.set_state(E2eState::Connecting);
            }
        }
    }

    fn handle_data(inner: &Arc<E2eInner>, data: &Value) {
        if data.get("_e2e_exchange").and_then(Value::as_bool) == Some(true) {
            let inner = inner.clone();
            let frame = data.clone();
            tokio::spawn(async move {
                E2eInner::handle_exchange(&inner, &frame).await;
            });
            return;
        }

        if data.get("_encrypted").and_then(Value::as_bool) == Some(true) {
            let Some(payload) = data.get("data").and_then(Value::as_str) else {
                inner
                    .events
                    .emit(&E2eEvent::DecryptError("encrypted frame without data".to_string()));
                return;
            };
            let key = *inner.peer_key.lock();
            let decrypted = key
                .ok_or(E2eError::InvalidKey)
                .and_then(|key| decrypt_frame(&key, payload))
                .and_then(|plain| {
                    serde_json::from_slice::<Value>(&plain).map_err(|_| E2eError::DecryptFailed)
                });
            match decrypted {
                Ok(value) => inner.events.emit(&E2eEvent::Data(value)),
                Err(err) => {
                    // Bad frame or stale key either way: surface and
                    // renegotiate.
                    inner.events.emit(&E2eEvent::DecryptError(err.to_string()));
                    let inner = inner.clone();
                    tokio::spawn(async move {
                        E2eInner::start_handshake(&inner, "key_offer").await;
                    });
                }
            }
            return;
        }

        if data.get("_plain").and_then(Value::as_bool) == Some(true) {
            inner
                .events
                .emit(&E2eEvent::Data(data.get("data").cloned().unwrap_or(Value::Null)));
            return;
        }

        // Unrecognized shapes surface verbatim.
        inner.events.emit(&E2eEvent::Data(data.clone()));
    }

    fn install_listeners(inner: &Arc<E2eInner>) {
        let room_events = inner.room.events().clone();
        {
            let inner = inner.clone();
            room_events.on(RoomEventKind::PeerConnected, move |_| {
                if *inner.state.lock() == E2eState::Connecting {
                    let inner = inner.clone();
                    tokio::spawn(async move {
                        E2eInner::start_handshake(&inner, "key_offer").await;
                    });
                }
                Ok(())
            });
        }
        {
            let inner = inner.clone();
            room_events.on(RoomEventKind::Data, move |ev| {
                if let RoomEvent::Data { data, .. } = ev
                    && !inner.closed.load(Ordering::SeqCst)
                {
                    E2eInner::handle_data(&inner, data);
                }
                Ok(())
            });
        }
        {
            let inner = inner.clone();
            room_events.on(RoomEventKind::PeerLeft, move |_| {
                if !inner.closed.load(Ordering::SeqCst) {
                    inner.peer_key.lock().take();
                    inner.secret.lock().take();
                    inner.set_state(E2eState::Connecting);
                }
                Ok(())
            });
        }
    }
}
