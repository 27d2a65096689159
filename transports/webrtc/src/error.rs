//! Error types for proctor peer streaming

/// Result type alias using the crate Error
pub type Result<T> = std::result::Result<T, Error>;

/// Broad classification of failures, used to decide what a failure means
/// for the stream state of the affected session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Relay unreachable, reconnection exhausted, or channel not connected
    Connectivity,
    /// Description/candidate application failures, malformed or out-of-order messages
    Negotiation,
    /// Capture device permission denied, missing or busy
    Capture,
    /// The counterpart left the signaling context
    RemoteDeparture,
    /// Invalid configuration
    Config,
    /// Everything else
    Internal,
}

/// Why the local capture device could not be acquired
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CaptureError {
    /// The user or platform refused access to the device
    #[error("camera permission denied")]
    PermissionDenied,

    /// No capture device is present
    #[error("no camera device found")]
    DeviceNotFound,

    /// The device is held exclusively by another application
    #[error("camera is in use by another application")]
    DeviceBusy,

    /// Any other device failure
    #[error("camera failure: {0}")]
    Other(String),
}

/// Errors that can occur in signaling, negotiation and capture
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Signaling relay unreachable or channel not connected
    #[error("Connectivity error: {0}")]
    Connectivity(String),

    /// Reconnection attempts exhausted
    #[error("Reconnection failed after {0} attempts")]
    ReconnectExhausted(u32),

    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    /// Operation timeout
    #[error("Operation timeout: {0}")]
    OperationTimeout(String),

    /// Malformed or unexpected signaling message
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// SDP negotiation error
    #[error("SDP negotiation error: {0}")]
    SdpError(String),

    /// ICE candidate error
    #[error("ICE candidate error: {0}")]
    IceCandidateError(String),

    /// WebRTC peer connection error
    #[error("Peer connection error: {0}")]
    PeerConnectionError(String),

    /// Local capture failure
    #[error("Capture error: {0}")]
    Capture(#[from] CaptureError),

    /// Remote participant left the context
    #[error("Remote participant disconnected: {0}")]
    RemoteDeparted(String),

    /// Session is not part of the desired set
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// WebRTC library error
    #[error("WebRTC error: {0}")]
    WebRtcError(String),

    /// Any other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Connectivity(_)
            | Error::ReconnectExhausted(_)
            | Error::WebSocketError(_)
            | Error::OperationTimeout(_) => ErrorKind::Connectivity,
            Error::ProtocolViolation(_)
            | Error::SdpError(_)
            | Error::IceCandidateError(_)
            | Error::PeerConnectionError(_)
            | Error::SerializationError(_)
            | Error::WebRtcError(_) => ErrorKind::Negotiation,
            Error::Capture(_) => ErrorKind::Capture,
            Error::RemoteDeparted(_) => ErrorKind::RemoteDeparture,
            Error::InvalidConfig(_) => ErrorKind::Config,
            Error::SessionNotFound(_) | Error::Other(_) => ErrorKind::Internal,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::SerializationError(e.to_string())
    }
}
