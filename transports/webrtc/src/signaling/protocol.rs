//! Named-event wire protocol spoken over the signaling relay
//!
//! Every relay message is one JSON text frame of the form
//! `{"event": "<name>", "data": <payload>}`. Event names and payload field
//! names are the interoperability contract with the relay and with browser
//! peers, so payloads use the browser's camelCase JSON shapes.

use crate::session::identity::{EndpointRef, ParticipantId};
use crate::{Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Event names exchanged with the relay
pub mod events {
    /// Viewer asks for the stream of one participant
    pub const PROCTOR_REQUEST_STREAM: &str = "proctor_request_stream";
    /// Publisher sends its offer to a viewer endpoint
    pub const WEBRTC_OFFER: &str = "webrtc_offer";
    /// Viewer sends its answer to a publisher endpoint
    pub const WEBRTC_ANSWER: &str = "webrtc_answer";
    /// Either side sends a local ICE candidate
    pub const WEBRTC_ICE_CANDIDATE: &str = "webrtc_ice_candidate";

    /// Relay forwards a viewer's stream request to the publisher
    pub const WEBRTC_OFFER_REQUEST: &str = "webrtc_offer_request";
    /// Relay forwards a publisher's offer to the viewer
    pub const WEBRTC_OFFER_RECEIVED: &str = "webrtc_offer_received";
    /// Relay forwards a viewer's answer to the publisher
    pub const WEBRTC_ANSWER_RECEIVED: &str = "webrtc_answer_received";
    /// Relay forwards a remote ICE candidate
    pub const WEBRTC_ICE_CANDIDATE_RECEIVED: &str = "webrtc_ice_candidate_received";
    /// A participant left the signaling context
    pub const USER_LEFT: &str = "user_left";

    /// Local: relay connection lost
    pub const DISCONNECT: &str = "disconnect";
    /// Local: relay connection (re)established
    pub const CONNECT: &str = "connect";
    /// Local: reconnection attempts exhausted
    pub const RECONNECT_FAILED: &str = "reconnect_failed";

    /// Events only the channel supervisor may raise; relay frames carrying
    /// these names are dropped
    pub const LOCAL: &[&str] = &[DISCONNECT, CONNECT, RECONNECT_FAILED];

    /// Whether `event` is raised locally rather than by the relay
    pub fn is_local(event: &str) -> bool {
        LOCAL.contains(&event)
    }

    /// Every event a peer service subscribes to
    pub const INBOUND: &[&str] = &[
        WEBRTC_OFFER_REQUEST,
        WEBRTC_OFFER_RECEIVED,
        WEBRTC_ANSWER_RECEIVED,
        WEBRTC_ICE_CANDIDATE_RECEIVED,
        USER_LEFT,
        DISCONNECT,
        CONNECT,
        RECONNECT_FAILED,
    ];
}

/// One relay frame
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RelayFrame {
    /// Event name
    pub event: String,

    /// Event payload
    #[serde(default)]
    pub data: serde_json::Value,
}

impl RelayFrame {
    /// Create a frame
    pub fn new(event: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    /// Serialize to a JSON text frame
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a JSON text frame
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| Error::ProtocolViolation(format!("Malformed relay frame: {}", e)))
    }
}

/// Session description type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    /// Offer
    Offer,
    /// Answer
    Answer,
}

/// Session description in the browser JSON shape `{type, sdp}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Description type
    #[serde(rename = "type")]
    pub sdp_type: SdpType,

    /// Raw SDP
    pub sdp: String,
}

impl SessionDescription {
    /// Create an offer description
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    /// Create an answer description
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate in the browser JSON shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    /// Candidate line
    pub candidate: String,

    /// Media stream identification tag
    #[serde(default)]
    pub sdp_mid: Option<String>,

    /// Media line index
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,

    /// ICE username fragment
    #[serde(default)]
    pub username_fragment: Option<String>,
}

/// `proctor_request_stream`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamRequest {
    /// Participant whose stream is requested
    pub student_id_to_view: ParticipantId,
}

/// `webrtc_offer`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfferMessage {
    /// Local offer
    pub offer: SessionDescription,
    /// Viewer endpoint the offer is for
    pub target_socket_id: EndpointRef,
}

/// `webrtc_answer`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerMessage {
    /// Local answer
    pub answer: SessionDescription,
    /// Publisher endpoint the answer is for
    pub target_socket_id: EndpointRef,
}

/// `webrtc_ice_candidate`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateMessage {
    /// Local candidate
    pub candidate: IceCandidate,
    /// Remote endpoint the candidate is for
    pub target_socket_id: EndpointRef,
}

/// `webrtc_offer_request`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfferRequest {
    /// Requesting viewer endpoint
    pub proctor_socket_id: EndpointRef,
    /// Optional participant filter
    #[serde(default)]
    pub student_id_to_view: Option<ParticipantId>,
}

/// `webrtc_offer_received`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfferReceived {
    /// Remote offer
    pub offer: SessionDescription,
    /// Publisher endpoint
    pub sender_socket_id: EndpointRef,
    /// Participant the publisher claims to be
    pub student_id: ParticipantId,
}

/// `webrtc_answer_received`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerReceived {
    /// Remote answer
    pub answer: SessionDescription,
    /// Viewer endpoint
    pub sender_socket_id: EndpointRef,
}

/// `webrtc_ice_candidate_received`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateReceived {
    /// Remote candidate
    pub candidate: IceCandidate,
    /// Endpoint that produced it
    pub sender_socket_id: EndpointRef,
}

/// `user_left`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserLeft {
    /// Participant (or socket) that left
    pub user_id: String,
}

/// Payload of the local `reconnect_failed` event
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectFailed {
    /// Reconnection attempts made before giving up
    #[serde(default)]
    pub attempts: u32,
}

/// Decoded inbound signaling event
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    /// `webrtc_offer_request`
    OfferRequest(OfferRequest),
    /// `webrtc_offer_received`
    OfferReceived(OfferReceived),
    /// `webrtc_answer_received`
    AnswerReceived(AnswerReceived),
    /// `webrtc_ice_candidate_received`
    CandidateReceived(CandidateReceived),
    /// `user_left`
    UserLeft(UserLeft),
    /// `connect`
    Connected,
    /// `disconnect`
    Disconnected,
    /// `reconnect_failed`
    ReconnectFailed(ReconnectFailed),
}

impl InboundEvent {
    /// Decode a named event.
    ///
    /// Returns `Ok(None)` for event names this protocol does not handle.
    ///
    /// # Errors
    ///
    /// Returns `Error::ProtocolViolation` if the payload does not match the
    /// event's shape.
    pub fn parse(event: &str, data: &serde_json::Value) -> Result<Option<Self>> {
        let parsed = match event {
            events::WEBRTC_OFFER_REQUEST => Self::OfferRequest(decode(event, data)?),
            events::WEBRTC_OFFER_RECEIVED => Self::OfferReceived(decode(event, data)?),
            events::WEBRTC_ANSWER_RECEIVED => Self::AnswerReceived(decode(event, data)?),
            events::WEBRTC_ICE_CANDIDATE_RECEIVED => Self::CandidateReceived(decode(event, data)?),
            events::USER_LEFT => Self::UserLeft(decode(event, data)?),
            events::CONNECT => Self::Connected,
            events::DISCONNECT => Self::Disconnected,
            events::RECONNECT_FAILED => Self::ReconnectFailed(decode(event, data)?),
            _ => return Ok(None),
        };
        Ok(Some(parsed))
    }
}

fn decode<T: DeserializeOwned>(event: &str, data: &serde_json::Value) -> Result<T> {
    T::deserialize(data)
        .map_err(|e| Error::ProtocolViolation(format!("Invalid {} payload: {}", event, e)))
}
