//! Reconnecting, named-event signaling channel scoped to one context

use super::lifecycle::ReconnectionPolicy;
use super::protocol::{events, RelayFrame};
use super::relay::{RelayConnection, RelayConnector};
use crate::session::identity::SignalingContext;
use crate::{Error, Result};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Handler invoked for every frame of a subscribed event
pub type EventHandler = Arc<dyn Fn(&serde_json::Value) + Send + Sync>;

/// Connection state of a signaling channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// First connect attempt in flight
    Connecting,
    /// Connected to the relay
    Connected,
    /// Connection lost, reconnection in progress
    Reconnecting,
    /// Reconnection attempts exhausted
    Failed,
    /// Closed locally
    Closed,
}

struct ChannelShared {
    context: SignalingContext,
    handlers: RwLock<HashMap<String, Vec<EventHandler>>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<RelayFrame>>>,
    state_tx: watch::Sender<ChannelState>,
}

impl ChannelShared {
    fn dispatch(&self, event: &str, data: &serde_json::Value) {
        let handlers = match self.handlers.read().get(event) {
            Some(handlers) => handlers.clone(),
            None => {
                debug!(context = %self.context, "No subscriber for event {}", event);
                return;
            }
        };

        for handler in handlers {
            handler(data);
        }
    }

    fn set_state(&self, state: ChannelState) {
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            debug!(context = %self.context, "Channel state {:?} -> {:?}", *current, state);
            *current = state;
            true
        });
    }
}

/// Persistent, reconnecting, bidirectional event channel to the relay.
///
/// One channel exists per [`SignalingContext`]; obtain it through
/// [`ChannelRegistry::open`](super::ChannelRegistry::open). A supervisor task
/// owns the relay connection:
///
/// - every successful (re)connection dispatches `connect`
/// - losing the connection dispatches `disconnect` before any reconnection
///   attempt starts
/// - exhausting the reconnection policy dispatches `reconnect_failed` and
///   leaves the channel in [`ChannelState::Failed`]
pub struct SignalingChannel {
    shared: Arc<ChannelShared>,
    shutdown_tx: watch::Sender<bool>,
}

impl SignalingChannel {
    /// Create the channel and start connecting in the background
    ///
    /// Must be called from within a Tokio runtime.
    pub fn open(
        context: SignalingContext,
        connector: Arc<dyn RelayConnector>,
        policy: ReconnectionPolicy,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ChannelState::Connecting);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let shared = Arc::new(ChannelShared {
            context,
            handlers: RwLock::new(HashMap::new()),
            outbound: Mutex::new(None),
            state_tx,
        });

        tokio::spawn(Self::supervise(
            Arc::clone(&shared),
            connector,
            policy,
            shutdown_rx,
        ));

        Arc::new(Self {
            shared,
            shutdown_tx,
        })
    }

    /// Context this channel is scoped to
    pub fn context(&self) -> &SignalingContext {
        &self.shared.context
    }

    /// Current connection state
    pub fn state(&self) -> ChannelState {
        *self.shared.state_tx.borrow()
    }

    /// Watch connection state changes
    pub fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.shared.state_tx.subscribe()
    }

    /// Send a named event to the relay
    ///
    /// # Errors
    ///
    /// Returns `Error::Connectivity` if the channel is not currently
    /// connected. Frames are never buffered for replay after a reconnect.
    pub fn send<T: Serialize>(&self, event: &str, payload: &T) -> Result<()> {
        let data = serde_json::to_value(payload)?;

        let outbound = self.shared.outbound.lock();
        let tx = outbound.as_ref().ok_or_else(|| {
            Error::Connectivity(format!(
                "signaling channel {} is not connected",
                self.shared.context
            ))
        })?;

        tx.send(RelayFrame::new(event, data)).map_err(|_| {
            Error::Connectivity(format!(
                "signaling channel {} lost its relay connection",
                self.shared.context
            ))
        })
    }

    /// Register a handler for a named event
    ///
    /// Handlers run on the channel's supervisor task and must not block.
    pub fn subscribe<F>(&self, event: &str, handler: F)
    where
        F: Fn(&serde_json::Value) + Send + Sync + 'static,
    {
        self.shared
            .handlers
            .write()
            .entry(event.to_string())
            .or_default()
            .push(Arc::new(handler));
    }

    /// Stop the channel and drop every handler
    pub fn close(&self) {
        info!(context = %self.shared.context, "Closing signaling channel");
        self.shutdown_tx.send_replace(true);
        self.shared.outbound.lock().take();
        self.shared.handlers.write().clear();
        self.shared.set_state(ChannelState::Closed);
    }

    async fn supervise(
        shared: Arc<ChannelShared>,
        connector: Arc<dyn RelayConnector>,
        policy: ReconnectionPolicy,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let mut attempt: u32 = 0;

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let result = tokio::select! {
                _ = shutdown_rx.changed() => break,
                result = tokio::time::timeout(
                    policy.connect_timeout(),
                    connector.connect(&shared.context),
                ) => result,
            };
            let result = result
                .map_err(|_| {
                    Error::OperationTimeout(format!(
                        "relay connect exceeded {:?}",
                        policy.connect_timeout()
                    ))
                })
                .and_then(|connected| connected);

            match result {
                Ok(connection) => {
                    attempt = 0;
                    info!(context = %shared.context, "Signaling channel connected");

                    if Self::pump(&shared, connection, &mut shutdown_rx).await {
                        break;
                    }

                    warn!(context = %shared.context, "Signaling relay connection lost");
                    shared.set_state(ChannelState::Reconnecting);
                    shared.dispatch(events::DISCONNECT, &serde_json::Value::Null);
                }
                Err(e) => {
                    warn!(
                        context = %shared.context,
                        attempt,
                        kind = ?e.kind(),
                        "Relay connect failed: {}",
                        e
                    );
                }
            }

            if !policy.should_retry(attempt) {
                error!(
                    context = %shared.context,
                    "Signaling relay unreachable after {} reconnection attempts",
                    attempt
                );
                shared.set_state(ChannelState::Failed);
                shared.dispatch(
                    events::RECONNECT_FAILED,
                    &serde_json::json!({ "attempts": attempt }),
                );
                break;
            }

            let delay = policy.calculate_backoff(attempt);
            attempt += 1;
            shared.set_state(ChannelState::Reconnecting);
            debug!(context = %shared.context, attempt, "Reconnecting in {:?}", delay);

            tokio::select! {
                _ = shutdown_rx.changed() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        shared.outbound.lock().take();
        debug!(context = %shared.context, "Signaling supervisor terminated");
    }

    /// Dispatch inbound frames until the connection drops.
    ///
    /// Returns true if the channel was closed locally.
    async fn pump(
        shared: &ChannelShared,
        connection: RelayConnection,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> bool {
        let RelayConnection {
            outbound,
            mut inbound,
        } = connection;

        *shared.outbound.lock() = Some(outbound);
        shared.set_state(ChannelState::Connected);
        shared.dispatch(events::CONNECT, &serde_json::Value::Null);

        let closed_locally = loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break true,
                frame = inbound.recv() => match frame {
                    Some(frame) if events::is_local(&frame.event) => {
                        warn!(
                            context = %shared.context,
                            "Dropping relay frame named like local event {}",
                            frame.event
                        );
                    }
                    Some(frame) => shared.dispatch(&frame.event, &frame.data),
                    None => break false,
                },
            }
        };

        shared.outbound.lock().take();
        closed_locally
    }
}

impl Drop for SignalingChannel {
    fn drop(&mut self) {
        self.shutdown_tx.send_replace(true);
    }
}
