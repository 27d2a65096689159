//! Signaling relay client
//!
//! Named-event channels to the relay, one per [`SignalingContext`], with
//! automatic reconnection.
//!
//! [`SignalingContext`]: crate::session::identity::SignalingContext

pub mod channel;
pub mod lifecycle;
pub mod protocol;
pub mod registry;
pub mod relay;

pub use channel::{ChannelState, EventHandler, SignalingChannel};
pub use lifecycle::ReconnectionPolicy;
pub use protocol::{IceCandidate, InboundEvent, RelayFrame, SdpType, SessionDescription};
pub use registry::ChannelRegistry;
pub use relay::{RelayConnection, RelayConnector, WebSocketConnector};
