//! Proctor Link Test Harness
//!
//! Provides infrastructure for integration testing of both streaming roles
//! without a network:
//! - In-memory signaling relay recording every frame a context sent
//! - Scripted media transports that tests drive through their observers
//! - Fake capture device with injectable failures
//!
//! Basic usage pattern:
//!
//! 1. Create a `ProctorHarness`
//! 2. Start a role with `harness.viewer()` or `harness.publisher()`
//! 3. Inject relay frames and transport events
//! 4. Assert on the stream state store, sent frames and transports
//! 5. Drop the fixtures (or call `harness.shutdown()`)

#![allow(dead_code)]

pub mod capture;
pub mod relay;
pub mod transport;

use std::sync::Arc;
use std::time::Duration;

use proctor_link::signaling::protocol::events;
use proctor_link::signaling::{ChannelRegistry, ReconnectionPolicy};
use proctor_link::{
    CaptureManager, ChannelState, LinkState, ParticipantId, PublisherService, Role, SessionId,
    SignalingChannel, SignalingContext, StreamStateStore, StreamStatus, ViewerService,
};
use serde_json::{json, Value};
use tokio::time::Instant;
use tracing::info;

pub use capture::FakeCapture;
pub use relay::MemoryRelay;
pub use transport::{FakeTransport, FakeTransportFactory};

/// Result type for test harness operations
pub type HarnessResult<T> = Result<T, HarnessError>;

/// Error type for test harness operations
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("Relay error: {0}")]
    RelayError(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

/// Default time a condition may take to become true
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(3);

const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Time given to dispatchers before asserting that nothing happened
pub const SETTLE_TIME: Duration = Duration::from_millis(60);

/// Reconnection policy short enough for tests
pub fn fast_policy() -> ReconnectionPolicy {
    ReconnectionPolicy {
        max_retries: 2,
        backoff_initial_ms: 10,
        backoff_max_ms: 20,
        connect_timeout_ms: 500,
    }
}

/// Initialize logging once per test binary
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// Poll `condition` until it holds or [`WAIT_TIMEOUT`] elapses
pub async fn wait_until<F>(what: &str, mut condition: F) -> HarnessResult<()>
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + WAIT_TIMEOUT;
    loop {
        if condition() {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(HarnessError::Timeout(what.to_string()));
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Let queued events drain
pub async fn settle() {
    tokio::time::sleep(SETTLE_TIME).await;
}

/// Viewer role wired to the harness relay
pub struct ViewerFixture {
    pub context: SignalingContext,
    pub channel: Arc<SignalingChannel>,
    pub store: Arc<StreamStateStore>,
    pub service: Arc<ViewerService>,
}

/// Publisher role wired to the harness relay
pub struct PublisherFixture {
    pub context: SignalingContext,
    pub channel: Arc<SignalingChannel>,
    pub capture: Arc<FakeCapture>,
    pub service: Arc<PublisherService>,
}

/// Main test harness
///
/// Owns the in-memory relay, the transport factory and a fresh channel
/// registry per test.
pub struct ProctorHarness {
    pub relay: Arc<MemoryRelay>,
    pub transports: Arc<FakeTransportFactory>,
    pub registry: ChannelRegistry,
}

impl ProctorHarness {
    /// Create a harness with the fast reconnection policy
    pub fn new() -> Self {
        Self::with_policy(fast_policy())
    }

    /// Create a harness with a custom reconnection policy
    pub fn with_policy(policy: ReconnectionPolicy) -> Self {
        init_logging();

        let relay = Arc::new(MemoryRelay::new());
        let registry = ChannelRegistry::new(relay.clone(), policy);

        Self {
            relay,
            transports: Arc::new(FakeTransportFactory::new()),
            registry,
        }
    }

    /// Open a channel and wait for it to connect
    pub async fn connected_channel(
        &self,
        context: &SignalingContext,
    ) -> HarnessResult<Arc<SignalingChannel>> {
        let channel = self.registry.open(context);
        let mut state = channel.watch_state();

        tokio::time::timeout(WAIT_TIMEOUT, state.wait_for(|s| *s == ChannelState::Connected))
            .await
            .map_err(|_| HarnessError::Timeout(format!("{} never connected", context)))?
            .map_err(|e| HarnessError::ConnectionError(e.to_string()))?;

        Ok(channel)
    }

    /// Start a viewer for `proctor` in exam `exam`
    pub async fn viewer(&self, exam: &str, proctor: &str) -> HarnessResult<ViewerFixture> {
        let context = SignalingContext::new(exam, Role::Viewer, proctor);
        let channel = self.connected_channel(&context).await?;
        let store = Arc::new(StreamStateStore::new());
        let service = ViewerService::start(
            Arc::clone(&channel),
            Arc::clone(&store),
            self.transports.clone(),
        );

        info!("Viewer {} ready", context);
        Ok(ViewerFixture {
            context,
            channel,
            store,
            service,
        })
    }

    /// Start a publisher for `participant` in exam `exam`
    pub async fn publisher(&self, exam: &str, participant: &str) -> HarnessResult<PublisherFixture> {
        let context = SignalingContext::new(exam, Role::Publisher, participant);
        let channel = self.connected_channel(&context).await?;
        let capture = Arc::new(FakeCapture::new());
        let service = PublisherService::start(
            Arc::clone(&channel),
            ParticipantId::new(participant),
            Arc::new(CaptureManager::new(capture.clone())),
            self.transports.clone(),
        );

        info!("Publisher {} ready", context);
        Ok(PublisherFixture {
            context,
            channel,
            capture,
            service,
        })
    }

    /// Deliver a publisher offer to `viewer` and drive the link to live.
    ///
    /// Returns the transport answering the offer.
    pub async fn go_live(
        &self,
        viewer: &ViewerFixture,
        session: &SessionId,
        participant: &str,
        endpoint: &str,
    ) -> HarnessResult<Arc<FakeTransport>> {
        let index = self.transports.count();
        self.relay.inject(
            &viewer.context,
            events::WEBRTC_OFFER_RECEIVED,
            &offer_received(endpoint, participant, &format!("offer-from-{}", endpoint)),
        )?;

        wait_until("answer created", || {
            self.transports
                .get(index)
                .map(|t| t.local_description().is_some())
                .unwrap_or(false)
        })
        .await?;

        let transport = self
            .transports
            .get(index)
            .ok_or_else(|| HarnessError::ConnectionError("transport vanished".to_string()))?;
        transport.emit_state(LinkState::Connected);
        transport.emit_track();

        wait_until("session live", || viewer.store.status(session) == StreamStatus::Live).await?;
        Ok(transport)
    }

    /// Close every channel
    pub fn shutdown(&self) {
        self.registry.close_all();
    }
}

impl Default for ProctorHarness {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Relay payload builders
// ============================================================================

/// `webrtc_offer_received` payload
pub fn offer_received(endpoint: &str, participant: &str, sdp: &str) -> Value {
    json!({
        "offer": { "type": "offer", "sdp": sdp },
        "senderSocketId": endpoint,
        "studentId": participant,
    })
}

/// `webrtc_answer_received` payload
pub fn answer_received(endpoint: &str, sdp: &str) -> Value {
    json!({
        "answer": { "type": "answer", "sdp": sdp },
        "senderSocketId": endpoint,
    })
}

/// `webrtc_ice_candidate_received` payload
pub fn candidate_received(endpoint: &str, candidate: &str) -> Value {
    json!({
        "candidate": { "candidate": candidate, "sdpMid": "0", "sdpMLineIndex": 0 },
        "senderSocketId": endpoint,
    })
}

/// `webrtc_offer_request` payload
pub fn offer_request(endpoint: &str, participant: Option<&str>) -> Value {
    match participant {
        Some(participant) => json!({ "proctorSocketId": endpoint, "studentIdToView": participant }),
        None => json!({ "proctorSocketId": endpoint }),
    }
}

/// `user_left` payload
pub fn user_left(user_id: &str) -> Value {
    json!({ "userId": user_id })
}
