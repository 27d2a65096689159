//! Media transport boundary used by peer links
//!
//! [`MediaTransport`] abstracts one peer connection so the negotiation state
//! machines can run against webrtc-rs in production and a scripted fake in
//! tests. Transports report asynchronous happenings through a
//! [`TransportObserver`], which teardown detaches before the transport is
//! closed so late callbacks become no-ops.

use crate::media::{LocalStream, StreamHandle};
use crate::signaling::protocol::{IceCandidate, SdpType, SessionDescription};
use crate::Result;
use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Peer connection state as reported by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Created, nothing exchanged yet
    New,
    /// ICE/DTLS in progress
    Connecting,
    /// Media can flow
    Connected,
    /// Connectivity lost, may or may not recover
    Disconnected,
    /// Could not be established or recovered
    Failed,
    /// Closed
    Closed,
}

/// Asynchronous happenings on a transport
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A local ICE candidate was gathered
    LocalCandidate(IceCandidate),
    /// Connection state changed
    StateChanged(LinkState),
    /// A remote track arrived
    Track(StreamHandle),
    /// The link handed its local description to the relay.
    ///
    /// Emitted by the link rather than the transport; local candidates
    /// gathered before it are held so they never reach the wire ahead of
    /// the description.
    LocalDescriptionSent,
}

/// Detachable sink for transport events
#[derive(Clone)]
pub struct TransportObserver {
    detached: Arc<AtomicBool>,
    sink: Arc<dyn Fn(TransportEvent) + Send + Sync>,
}

impl TransportObserver {
    /// Create an observer forwarding into `sink`
    pub fn new<F>(sink: F) -> Self
    where
        F: Fn(TransportEvent) + Send + Sync + 'static,
    {
        Self {
            detached: Arc::new(AtomicBool::new(false)),
            sink: Arc::new(sink),
        }
    }

    /// Forward an event unless detached
    pub fn emit(&self, event: TransportEvent) {
        if !self.is_detached() {
            (self.sink)(event);
        }
    }

    /// Stop forwarding; shared by every clone
    pub fn detach(&self) {
        self.detached.store(true, Ordering::SeqCst);
    }

    /// Whether teardown already detached this observer
    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for TransportObserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportObserver")
            .field("detached", &self.is_detached())
            .finish()
    }
}

/// One peer media connection
#[async_trait]
pub trait MediaTransport: Send + Sync {
    /// Attach local tracks send-only
    async fn attach_local_stream(&self, stream: &LocalStream) -> Result<()>;

    /// Create an offer and set it as the local description
    async fn create_offer(&self) -> Result<SessionDescription>;

    /// Create an answer and set it as the local description
    async fn create_answer(&self) -> Result<SessionDescription>;

    /// Apply a remote description
    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    /// Type of the applied remote description, if any
    async fn remote_description_type(&self) -> Option<SdpType>;

    /// Apply a remote ICE candidate
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Close the connection
    async fn close(&self) -> Result<()>;
}

/// Creates transports wired to an observer
#[async_trait]
pub trait TransportFactory: Send + Sync + 'static {
    /// Create a fresh transport
    async fn create(&self, observer: TransportObserver) -> Result<Arc<dyn MediaTransport>>;
}
