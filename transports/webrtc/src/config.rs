//! Configuration types for proctor peer streaming

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration shared by the publisher and viewer services
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingConfig {
    /// WebSocket relay URL (ws:// or wss://)
    pub relay_url: String,

    /// The single STUN server used for candidate gathering.
    ///
    /// No TURN relay is configured: connections that need relay traversal
    /// fail to establish.
    pub stun_server: String,

    /// Relay reconnection behavior
    pub reconnect: ReconnectSettings,

    /// Seconds a session may sit in `waiting`/`connecting` before the
    /// reconciliation loop force re-requests it (None disables the sweep)
    pub negotiation_deadline_secs: Option<u64>,

    /// Local video track settings (publisher side)
    pub video: VideoTrackSettings,
}

/// Relay reconnection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectSettings {
    /// Maximum reconnection attempts before the channel is declared dead (default: 5)
    pub max_attempts: u32,

    /// Delay before the first reconnection attempt (default: 1000ms)
    pub backoff_initial_ms: u64,

    /// Upper bound for the reconnection delay (default: 5000ms)
    pub backoff_max_ms: u64,

    /// Timeout for a single connect attempt (default: 20000ms)
    pub connect_timeout_ms: u64,
}

/// Settings for the local video track offered by a publisher
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoTrackSettings {
    /// Codec MIME type (default: video/VP8)
    pub mime_type: String,

    /// RTP clock rate (default: 90000)
    pub clock_rate: u32,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            relay_url: "ws://localhost:5000/signaling".to_string(),
            stun_server: "stun:stun.l.google.com:19302".to_string(),
            reconnect: ReconnectSettings::default(),
            negotiation_deadline_secs: Some(30),
            video: VideoTrackSettings::default(),
        }
    }
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_initial_ms: 1000,
            backoff_max_ms: 5000,
            connect_timeout_ms: 20000,
        }
    }
}

impl Default for VideoTrackSettings {
    fn default() -> Self {
        Self {
            mime_type: "video/VP8".to_string(),
            clock_rate: 90000,
        }
    }
}

impl StreamingConfig {
    /// Negotiation deadline as a Duration, if enabled
    pub fn negotiation_deadline(&self) -> Option<Duration> {
        self.negotiation_deadline_secs.map(Duration::from_secs)
    }

    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `relay_url` is not a WebSocket URL
    /// - `stun_server` is not a `stun:` URL
    /// - `reconnect.max_attempts` is 0
    /// - `reconnect.backoff_initial_ms` exceeds `reconnect.backoff_max_ms`
    /// - `reconnect.connect_timeout_ms` is 0
    /// - `negotiation_deadline_secs` is Some(0)
    pub fn validate(&self) -> crate::Result<()> {
        use crate::Error;

        if !self.relay_url.starts_with("ws://") && !self.relay_url.starts_with("wss://") {
            return Err(Error::InvalidConfig(format!(
                "relay_url must start with ws:// or wss://, got {}",
                self.relay_url
            )));
        }

        if !self.stun_server.starts_with("stun:") {
            return Err(Error::InvalidConfig(format!(
                "stun_server must be a stun: URL, got {}",
                self.stun_server
            )));
        }

        if self.reconnect.max_attempts == 0 {
            return Err(Error::InvalidConfig(
                "reconnect.max_attempts must be at least 1".to_string(),
            ));
        }

        if self.reconnect.backoff_initial_ms > self.reconnect.backoff_max_ms {
            return Err(Error::InvalidConfig(format!(
                "reconnect.backoff_initial_ms ({}) exceeds backoff_max_ms ({})",
                self.reconnect.backoff_initial_ms, self.reconnect.backoff_max_ms
            )));
        }

        if self.reconnect.connect_timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "reconnect.connect_timeout_ms must be positive".to_string(),
            ));
        }

        if self.negotiation_deadline_secs == Some(0) {
            return Err(Error::InvalidConfig(
                "negotiation_deadline_secs must be positive when set".to_string(),
            ));
        }

        Ok(())
    }
}
