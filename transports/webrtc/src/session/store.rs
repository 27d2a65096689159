//! Observable per-session stream state
//!
//! The store is the only data the rendering layer consumes. It is mutated
//! by the reconciliation loop and by peer link callbacks, and enforces the
//! record invariants itself:
//!
//! - `stream` is present only while `live`
//! - `endpoint` is present only while `connecting` or `live`
//! - `error` is present only while `error`

use super::identity::{EndpointRef, SessionId};
use crate::media::StreamHandle;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::time::Instant;
use tokio::sync::broadcast;
use tracing::debug;

const UPDATE_CHANNEL_CAPACITY: usize = 256;

/// Stream status of one session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamStatus {
    /// Nothing requested
    Idle,
    /// Stream requested, waiting for the publisher's offer
    Waiting,
    /// Negotiating with the publisher
    Connecting,
    /// Media is flowing
    Live,
    /// Failed; see the error message
    Error,
}

impl StreamStatus {
    /// Whether a request or link is in flight or established
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Waiting | Self::Connecting | Self::Live)
    }
}

impl fmt::Display for StreamStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Waiting => "waiting",
            Self::Connecting => "connecting",
            Self::Live => "live",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

/// Stream state record of one session
#[derive(Debug, Clone, PartialEq)]
pub struct StreamState {
    /// Current status
    pub status: StreamStatus,
    /// Inbound media, only while live
    pub stream: Option<StreamHandle>,
    /// Last mutation time
    pub updated_at: Instant,
    /// Human-readable failure, only while in error
    pub error: Option<String>,
    /// Publisher endpoint, only while connecting or live
    pub endpoint: Option<EndpointRef>,
}

impl StreamState {
    fn idle() -> Self {
        Self {
            status: StreamStatus::Idle,
            stream: None,
            updated_at: Instant::now(),
            error: None,
            endpoint: None,
        }
    }
}

/// Change notification
#[derive(Debug, Clone)]
pub struct StreamUpdate {
    /// Session that changed
    pub session: SessionId,
    /// Its new state
    pub state: StreamState,
}

/// Observable map of session identity to stream state
pub struct StreamStateStore {
    states: RwLock<HashMap<SessionId, StreamState>>,
    updates: broadcast::Sender<StreamUpdate>,
}

impl Default for StreamStateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamStateStore {
    /// Create an empty store
    pub fn new() -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            states: RwLock::new(HashMap::new()),
            updates,
        }
    }

    /// Subscribe to state changes
    pub fn subscribe(&self) -> broadcast::Receiver<StreamUpdate> {
        self.updates.subscribe()
    }

    /// Current state of a session
    pub fn get(&self, session: &SessionId) -> Option<StreamState> {
        self.states.read().get(session).cloned()
    }

    /// Status of a session, `Idle` if unknown
    pub fn status(&self, session: &SessionId) -> StreamStatus {
        self.states
            .read()
            .get(session)
            .map(|s| s.status)
            .unwrap_or(StreamStatus::Idle)
    }

    /// Copy of every record
    pub fn snapshot(&self) -> HashMap<SessionId, StreamState> {
        self.states.read().clone()
    }

    /// Register a session as idle if it is not known yet
    pub fn ensure(&self, session: &SessionId) -> StreamState {
        let mut states = self.states.write();
        if let Some(state) = states.get(session) {
            return state.clone();
        }
        let state = StreamState::idle();
        states.insert(session.clone(), state.clone());
        drop(states);
        self.publish(session, state.clone());
        state
    }

    /// Stream requested
    pub fn set_waiting(&self, session: &SessionId) {
        self.update(session, |state| {
            state.status = StreamStatus::Waiting;
            state.stream = None;
            state.error = None;
            state.endpoint = None;
            true
        });
    }

    /// Negotiating with the given publisher endpoint
    pub fn set_connecting(&self, session: &SessionId, endpoint: EndpointRef) {
        self.update(session, |state| {
            state.status = StreamStatus::Connecting;
            state.stream = None;
            state.error = None;
            state.endpoint = Some(endpoint);
            true
        });
    }

    /// Attach inbound media and go live.
    ///
    /// A handle without tracks is rejected. A further handle for an already
    /// live session is merged into the existing one. Returns whether the
    /// state changed.
    pub fn set_live(&self, session: &SessionId, handle: StreamHandle) -> bool {
        if !handle.has_tracks() {
            debug!(session = %session, "Ignoring stream handle without tracks");
            return false;
        }

        self.update(session, |state| {
            if state.status == StreamStatus::Live {
                if let Some(existing) = state.stream.as_mut() {
                    existing.merge(handle);
                    return true;
                }
            }
            state.status = StreamStatus::Live;
            state.stream = Some(handle);
            state.error = None;
            true
        })
    }

    /// Transport reports connected.
    ///
    /// Confirms `live` only if a stream handle is already attached; a
    /// connected transport without a track leaves the state untouched.
    pub fn mark_connected(&self, session: &SessionId) -> bool {
        self.update(session, |state| {
            if state.stream.is_none() {
                return false;
            }
            state.status = StreamStatus::Live;
            true
        })
    }

    /// Move to error with a human-readable message
    pub fn set_error(&self, session: &SessionId, message: impl Into<String>) {
        let message = message.into();
        self.update(session, |state| {
            state.status = StreamStatus::Error;
            state.stream = None;
            state.error = Some(message);
            state.endpoint = None;
            true
        });
    }

    /// Back to idle
    pub fn set_idle(&self, session: &SessionId) {
        self.update(session, |state| {
            state.status = StreamStatus::Idle;
            state.stream = None;
            state.error = None;
            state.endpoint = None;
            true
        });
    }

    fn update<F>(&self, session: &SessionId, mutate: F) -> bool
    where
        F: FnOnce(&mut StreamState) -> bool,
    {
        let state = {
            let mut states = self.states.write();
            let state = states
                .entry(session.clone())
                .or_insert_with(StreamState::idle);
            let before = state.status;
            if !mutate(state) {
                return false;
            }
            state.updated_at = Instant::now();
            debug!(session = %session, "Stream state {} -> {}", before, state.status);
            state.clone()
        };

        self.publish(session, state);
        true
    }

    fn publish(&self, session: &SessionId, state: StreamState) {
        // No subscribers is fine
        let _ = self.updates.send(StreamUpdate {
            session: session.clone(),
            state,
        });
    }
}
