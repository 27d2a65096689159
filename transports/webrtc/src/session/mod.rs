//! Session identity, observable stream state and reconciliation

pub mod identity;
pub mod reconcile;
pub mod store;

pub use identity::{EndpointRef, ParticipantId, Role, SessionId, SignalingContext};
pub use reconcile::{DesiredSessions, ReconcileReport, ReconciliationLoop};
pub use store::{StreamState, StreamStateStore, StreamStatus, StreamUpdate};
