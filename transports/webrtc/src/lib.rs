//! Signaling-mediated WebRTC streaming from exam publishers to proctor viewers
//!
//! Exam takers (publishers) stream their camera to proctors (viewers) over
//! one-way peer connections. Connection setup is coordinated through a
//! shared signaling relay, one named-event channel per exam and role.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  Policy (desired sessions)                               │
//! │  ↓ watch channel                                         │
//! │  ReconciliationLoop                                      │
//! │  ↓ request / stop                                        │
//! │  ViewerService ──── PeerRegistry<SessionId> ── ViewerLink│
//! │  │                                             (actor)   │
//! │  ├─ SignalingChannel (reconnecting WebSocket relay)      │
//! │  └─ StreamStateStore → rendering layer (read-only)       │
//! │                                                          │
//! │  PublisherService ─ PeerRegistry<EndpointRef> ─ Publisher│
//! │  └─ CaptureManager (ref-counted camera)         Link     │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Every link runs its negotiation steps sequentially on its own task. The
//! registries are the only cross-link state; a callback of a torn-down link
//! finds nothing in the registry and does nothing.
//!
//! # Example
//!
//! ```
//! use proctor_link::StreamingConfig;
//!
//! let config = StreamingConfig {
//!     relay_url: "wss://relay.example.com/signaling".to_string(),
//!     ..Default::default()
//! };
//!
//! assert!(config.validate().is_ok());
//! assert_eq!(config.reconnect.max_attempts, 5);
//! ```
//!
//! ## Async Usage
//!
//! ```no_run
//! use proctor_link::{
//!     ChannelRegistry, ReconciliationLoop, Role, RtcTransportFactory, SignalingContext,
//!     StreamStateStore, StreamingConfig, ViewerService,
//! };
//! use std::collections::HashMap;
//! use std::sync::Arc;
//!
//! # async fn example() -> proctor_link::Result<()> {
//! let config = StreamingConfig::default();
//! let registry = ChannelRegistry::from_config(&config)?;
//! let channel = registry.open(&SignalingContext::new("exam-1", Role::Viewer, "proctor-1"));
//!
//! let store = Arc::new(StreamStateStore::new());
//! let factory = Arc::new(RtcTransportFactory::new(&config)?);
//! let viewer = ViewerService::start(channel, store, factory);
//!
//! let (desired_tx, desired_rx) = tokio::sync::watch::channel(HashMap::new());
//! let reconciler = ReconciliationLoop::new(viewer, config.negotiation_deadline());
//! tokio::spawn(async move { reconciler.run(desired_rx).await });
//!
//! desired_tx.send_replace(HashMap::from([("attempt-1".into(), "student-1".into())]));
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod media;
pub mod peer;
pub mod session;
pub mod signaling;

pub use config::{ReconnectSettings, StreamingConfig, VideoTrackSettings};
pub use error::{CaptureError, Error, ErrorKind, Result};
pub use media::{CaptureDevice, CaptureManager, LocalStream, SampleTrackDevice, StreamHandle};
pub use peer::{
    LinkState, PeerLink, PublisherEvent, PublisherService, RtcTransportFactory, TransportFactory,
    ViewerService,
};
pub use session::{
    DesiredSessions, EndpointRef, ParticipantId, ReconciliationLoop, Role, SessionId,
    SignalingContext, StreamState, StreamStateStore, StreamStatus,
};
pub use signaling::{ChannelRegistry, ChannelState, SignalingChannel};

/// Get the version of this crate
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
