//! Client SDK for peer-to-peer applications over a signaling server.
//!
//! The SDK registers an ECDSA P-256 identity with a signaling server,
//! joins namespaces and rooms, negotiates WebRTC sessions between
//! peers, and layers durable patterns on the resulting data channels:
//! chunked file transfer with backpressure, HLC-ordered state
//! replication (with an offline-capable durable variant), and
//! end-to-end encrypted 1:1 rooms.
//!
//! Platform primitives stay outside the crate: the signaling socket,
//! the WebRTC engine, and the durable key-value store are traits
//! ([`socket::SocketConnector`], [`rtc::RtcEngine`], [`store::KvStore`])
//! the embedder implements. [`loopback`] ships in-process versions of
//! all three seams' needs, which is how the test suites (and quick
//! experiments) run the full stack with no network.
//!
//! ```no_run
//! use std::sync::Arc;
//! use peerq_sdk::client::{Client, ClientConfig};
//! use peerq_sdk::loopback::{LoopbackConnector, LoopbackEngine};
//!
//! # async fn example() -> Result<(), peerq_sdk::error::Error> {
//! let (connector, _accept) = LoopbackConnector::new();
//! let client = Client::new(
//!     connector,
//!     Arc::new(LoopbackEngine::new()),
//!     ClientConfig { url: "wss://signal.example".into(), ..Default::default() },
//! );
//! client.connect().await?;
//! let registered = client.register().await?;
//! let peers = client.join("lobby").await?;
//! # let _ = (registered, peers);
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod e2e;
pub mod emitter;
pub mod error;
pub mod hlc;
pub mod identity;
pub mod ids;
pub mod loopback;
pub mod offline;
pub mod peer;
pub mod protocol;
pub mod room;
pub mod rtc;
pub mod socket;
pub mod store;
pub mod sync;
pub mod transfer;
pub mod transport;

pub use client::{Client, ClientConfig, ClientEvent, ClientEventKind};
pub use error::{Error, Result};
pub use identity::{Identity, IdentityKeys};
pub use peer::{PeerSession, PeerEvent, PeerEventKind};
pub use protocol::PeerInfo;
pub use room::{DirectRoom, GroupRoom, RoomEvent, RoomEventKind};
pub use sync::{SyncMode, SyncRoom};
pub use transfer::{FileTransfer, TransferEvent, TransferEventKind};
