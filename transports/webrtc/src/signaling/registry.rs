//! Keyed registry of signaling channels, one per context

use super::channel::{ChannelState, SignalingChannel};
use super::lifecycle::ReconnectionPolicy;
use super::relay::{RelayConnector, WebSocketConnector};
use crate::config::StreamingConfig;
use crate::session::identity::SignalingContext;
use crate::Result;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Owns every open signaling channel of the process.
///
/// Channels are created lazily and reused for all peer links of the same
/// context. Tests build a fresh registry around an in-memory connector.
pub struct ChannelRegistry {
    connector: Arc<dyn RelayConnector>,
    policy: ReconnectionPolicy,
    channels: Mutex<HashMap<SignalingContext, Arc<SignalingChannel>>>,
}

impl ChannelRegistry {
    /// Create a registry around a relay connector
    pub fn new(connector: Arc<dyn RelayConnector>, policy: ReconnectionPolicy) -> Self {
        Self {
            connector,
            policy,
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Create a registry connecting over WebSocket as configured
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidConfig` if the configuration does not validate.
    pub fn from_config(config: &StreamingConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::new(
            Arc::new(WebSocketConnector::new(config.relay_url.clone())),
            ReconnectionPolicy::from(&config.reconnect),
        ))
    }

    /// Return the channel for a context, opening it if needed
    ///
    /// A channel that failed or was closed is replaced by a fresh one.
    /// Services started on the dead channel stay bound to it; shut them
    /// down and start new ones on the returned channel.
    pub fn open(&self, context: &SignalingContext) -> Arc<SignalingChannel> {
        let mut channels = self.channels.lock();

        if let Some(channel) = channels.get(context) {
            if !matches!(channel.state(), ChannelState::Failed | ChannelState::Closed) {
                return Arc::clone(channel);
            }
            info!(context = %context, "Replacing dead signaling channel");
        }

        let channel = SignalingChannel::open(
            context.clone(),
            Arc::clone(&self.connector),
            self.policy.clone(),
        );
        channels.insert(context.clone(), Arc::clone(&channel));
        channel
    }

    /// Look up an open channel without creating one
    pub fn get(&self, context: &SignalingContext) -> Option<Arc<SignalingChannel>> {
        self.channels.lock().get(context).cloned()
    }

    /// Close and forget the channel for a context
    ///
    /// Returns false if no channel was open.
    pub fn close(&self, context: &SignalingContext) -> bool {
        let channel = self.channels.lock().remove(context);
        match channel {
            Some(channel) => {
                channel.close();
                true
            }
            None => false,
        }
    }

    /// Close every channel
    pub fn close_all(&self) {
        let channels: Vec<_> = self.channels.lock().drain().map(|(_, c)| c).collect();
        for channel in channels {
            channel.close();
        }
    }

    /// Number of open channels
    pub fn len(&self) -> usize {
        self.channels.lock().len()
    }

    /// Whether no channel is open
    pub fn is_empty(&self) -> bool {
        self.channels.lock().is_empty()
    }
}
