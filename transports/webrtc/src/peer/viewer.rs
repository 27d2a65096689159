//! Viewer side: requests streams, answers publishers' offers and surfaces
//! the inbound media through the [`StreamStateStore`]
//!
//! Links are keyed by [`SessionId`]. The desired set (session to
//! participant) decides which offers are accepted; an offer for a
//! participant with no desired session is dropped without any mutation.

use super::manager::{LinkEntry, PeerRegistry};
use super::transport::{LinkState, MediaTransport, TransportEvent, TransportFactory, TransportObserver};
use super::{spawn_link, subscribe_inbound, LinkCommand, PeerLink, PendingCandidates};
use crate::session::identity::{EndpointRef, ParticipantId, SessionId};
use crate::session::store::{StreamStateStore, StreamStatus};
use crate::signaling::protocol::{
    events, AnswerMessage, CandidateMessage, IceCandidate, InboundEvent, OfferReceived, SdpType,
    SessionDescription, StreamRequest,
};
use crate::signaling::SignalingChannel;
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Viewer-role peer link for one session
pub struct ViewerLink {
    session: SessionId,
    publisher: EndpointRef,
    channel: Arc<SignalingChannel>,
    factory: Arc<dyn TransportFactory>,
    observer: TransportObserver,
    transport: Option<Arc<dyn MediaTransport>>,
    pending: PendingCandidates,
}

impl ViewerLink {
    /// Create a link answering the publisher at `publisher`
    pub fn new(
        session: SessionId,
        publisher: EndpointRef,
        channel: Arc<SignalingChannel>,
        factory: Arc<dyn TransportFactory>,
        observer: TransportObserver,
    ) -> Self {
        Self {
            session,
            publisher,
            channel,
            factory,
            observer,
            transport: None,
            pending: PendingCandidates::default(),
        }
    }
}

#[async_trait]
impl PeerLink for ViewerLink {
    async fn negotiate(&mut self) -> Result<()> {
        let transport = self.factory.create(self.observer.clone()).await?;
        self.transport = Some(transport);
        Ok(())
    }

    async fn apply_remote_description(&mut self, description: SessionDescription) -> Result<()> {
        if description.sdp_type != SdpType::Offer {
            return Err(Error::ProtocolViolation(format!(
                "viewer expected an offer for {}, got {:?}",
                self.session, description.sdp_type
            )));
        }

        let transport = self.transport.clone().ok_or_else(|| {
            Error::PeerConnectionError(format!("no transport for session {}", self.session))
        })?;

        transport.set_remote_description(description).await?;
        if self.observer.is_detached() {
            return Ok(());
        }

        let answer = transport.create_answer().await?;
        if self.observer.is_detached() {
            return Ok(());
        }

        info!(session = %self.session, publisher = %self.publisher, "Sending answer");
        self.channel.send(
            events::WEBRTC_ANSWER,
            &AnswerMessage {
                answer,
                target_socket_id: self.publisher.clone(),
            },
        )?;
        self.observer.emit(TransportEvent::LocalDescriptionSent);

        self.pending.flush(&transport).await
    }

    async fn apply_remote_candidate(&mut self, candidate: IceCandidate) -> Result<()> {
        self.pending
            .apply_or_hold(self.transport.as_ref(), candidate)
            .await
    }

    async fn teardown(&mut self) {
        self.observer.detach();

        if let Some(transport) = self.transport.take() {
            if let Err(e) = transport.close().await {
                warn!(session = %self.session, "Error closing transport: {}", e);
            }
        }
    }
}

enum ViewerInput {
    Signal(InboundEvent),
    Transport {
        session: SessionId,
        generation: u64,
        event: TransportEvent,
    },
    LinkFailed {
        session: SessionId,
        generation: u64,
        error: Error,
    },
}

#[derive(Default)]
struct ViewerState {
    links: PeerRegistry<SessionId>,
    desired: HashMap<SessionId, ParticipantId>,
    requested: HashSet<SessionId>,
    relay_lost: bool,
}

impl ViewerState {
    /// Desired session an offer from `participant` belongs to.
    ///
    /// If several desired sessions share the participant, one with an
    /// outstanding request wins, then the lowest session id.
    fn session_for(&self, participant: &ParticipantId) -> Option<SessionId> {
        self.desired
            .iter()
            .filter(|(_, p)| *p == participant)
            .map(|(s, _)| s)
            .min_by_key(|s| (!self.requested.contains(*s), *s))
            .cloned()
    }
}

/// Drives viewer links for one signaling context.
///
/// Signaling and transport events are handled sequentially on one
/// dispatcher task; every handler checks the link registry before
/// touching the store, so callbacks of torn-down links are no-ops.
pub struct ViewerService {
    channel: Arc<SignalingChannel>,
    store: Arc<StreamStateStore>,
    factory: Arc<dyn TransportFactory>,
    state: Mutex<ViewerState>,
    inputs: mpsc::UnboundedSender<ViewerInput>,
    reconnections: watch::Sender<u64>,
}

impl ViewerService {
    /// Subscribe to the channel and start handling offers
    ///
    /// The service is bound to `channel` for its whole life. Once the
    /// channel reports `reconnect_failed`, start a new service on the
    /// channel [`ChannelRegistry::open`](crate::signaling::ChannelRegistry::open) returns.
    pub fn start(
        channel: Arc<SignalingChannel>,
        store: Arc<StreamStateStore>,
        factory: Arc<dyn TransportFactory>,
    ) -> Arc<Self> {
        let (inputs, rx) = mpsc::unbounded_channel();
        let (reconnections, _) = watch::channel(0);

        subscribe_inbound(&channel, inputs.clone(), ViewerInput::Signal);

        let service = Arc::new(Self {
            channel,
            store,
            factory,
            state: Mutex::new(ViewerState::default()),
            inputs,
            reconnections,
        });

        tokio::spawn(Self::dispatch(Arc::downgrade(&service), rx));
        service
    }

    /// State store this service writes to
    pub fn store(&self) -> &Arc<StreamStateStore> {
        &self.store
    }

    /// Replace the desired set (session to participant)
    pub fn set_desired(&self, desired: HashMap<SessionId, ParticipantId>) {
        self.state.lock().desired = desired;
    }

    /// Current desired set
    pub fn desired(&self) -> HashMap<SessionId, ParticipantId> {
        self.state.lock().desired.clone()
    }

    /// Whether a request for the session is outstanding
    pub fn is_requested(&self, session: &SessionId) -> bool {
        self.state.lock().requested.contains(session)
    }

    /// Whether a link exists for the session
    pub fn has_link(&self, session: &SessionId) -> bool {
        self.state.lock().links.contains(session)
    }

    /// Sessions with a link or an outstanding request
    pub fn active_sessions(&self) -> Vec<SessionId> {
        let state = self.state.lock();
        let mut sessions: HashSet<SessionId> = state.requested.iter().cloned().collect();
        sessions.extend(state.links.keys());
        sessions.into_iter().collect()
    }

    /// Counter bumped every time the relay comes back after a loss
    pub fn watch_reconnections(&self) -> watch::Receiver<u64> {
        self.reconnections.subscribe()
    }

    /// Request the stream of a desired session.
    ///
    /// Without `force` this is a no-op while a request is outstanding. With
    /// `force` any existing link is torn down first and a new request is
    /// sent regardless.
    ///
    /// # Errors
    ///
    /// Returns `Error::SessionNotFound` if the session is not desired, or
    /// `Error::Connectivity` if the relay is not connected (the session is
    /// then in error).
    pub fn request_stream(&self, session: &SessionId, force: bool) -> Result<()> {
        let mut state = self.state.lock();

        let participant = state
            .desired
            .get(session)
            .cloned()
            .ok_or_else(|| Error::SessionNotFound(session.to_string()))?;

        if !force && state.requested.contains(session) {
            debug!(session = %session, "Stream request already outstanding");
            return Ok(());
        }

        if state.links.remove(session).is_some() {
            debug!(session = %session, "Tore down existing link before re-request");
        }

        state.requested.insert(session.clone());
        self.store.set_waiting(session);

        let request = StreamRequest {
            student_id_to_view: participant,
        };
        if let Err(e) = self.channel.send(events::PROCTOR_REQUEST_STREAM, &request) {
            state.requested.remove(session);
            self.store.set_error(session, e.to_string());
            return Err(e);
        }

        info!(session = %session, force, "Requested stream");
        Ok(())
    }

    /// Stop streaming a session and return it to idle
    pub fn stop_stream(&self, session: &SessionId) {
        let mut state = self.state.lock();
        state.links.remove(session);
        state.requested.remove(session);
        self.store.set_idle(session);
        debug!(session = %session, "Stopped stream");
    }

    /// Tear every link down and return their sessions to idle
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        let mut sessions: HashSet<SessionId> = state.links.drain().into_iter().collect();
        sessions.extend(state.requested.drain());
        for session in sessions {
            self.store.set_idle(&session);
        }
    }

    async fn dispatch(service: Weak<Self>, mut rx: mpsc::UnboundedReceiver<ViewerInput>) {
        while let Some(input) = rx.recv().await {
            let Some(service) = service.upgrade() else {
                break;
            };
            service.handle(input);
        }
        debug!("Viewer dispatcher terminated");
    }

    fn handle(&self, input: ViewerInput) {
        match input {
            ViewerInput::Signal(event) => self.handle_signal(event),
            ViewerInput::Transport {
                session,
                generation,
                event,
            } => self.handle_transport(session, generation, event),
            ViewerInput::LinkFailed {
                session,
                generation,
                error,
            } => {
                let mut state = self.state.lock();
                if state.links.is_current(&session, generation) {
                    self.fail_session(&mut state, &session, &error);
                }
            }
        }
    }

    fn handle_signal(&self, event: InboundEvent) {
        match event {
            InboundEvent::OfferReceived(offer) => self.handle_offer(offer),
            InboundEvent::CandidateReceived(candidate) => {
                let state = self.state.lock();
                let entry = state
                    .links
                    .lookup_endpoint(&candidate.sender_socket_id)
                    .and_then(|session| state.links.get(session));
                match entry {
                    Some(entry) => {
                        entry.send(LinkCommand::RemoteCandidate(candidate.candidate));
                    }
                    None => warn!(
                        sender = %candidate.sender_socket_id,
                        "Dropping candidate for endpoint without a link"
                    ),
                }
            }
            InboundEvent::UserLeft(left) => self.handle_user_left(&left.user_id),
            InboundEvent::Disconnected => {
                let mut state = self.state.lock();
                state.relay_lost = true;
                let error =
                    Error::Connectivity("signaling relay connection interrupted".to_string());
                self.fail_active(&mut state, &error);
            }
            InboundEvent::ReconnectFailed(failed) => {
                let mut state = self.state.lock();
                let error = Error::ReconnectExhausted(failed.attempts);
                self.fail_active(&mut state, &error);

                // Sessions the disconnect already failed now carry the terminal cause
                for session in state.desired.keys() {
                    if self.store.status(session) == StreamStatus::Error {
                        self.store.set_error(session, error.to_string());
                    }
                }
            }
            InboundEvent::Connected => {
                let mut state = self.state.lock();
                if std::mem::take(&mut state.relay_lost) {
                    info!("Signaling relay reconnected");
                    self.reconnections.send_modify(|count| *count += 1);
                }
            }
            InboundEvent::AnswerReceived(answer) => {
                debug!(sender = %answer.sender_socket_id, "Viewer ignores answers");
            }
            InboundEvent::OfferRequest(request) => {
                debug!(sender = %request.proctor_socket_id, "Viewer ignores offer requests");
            }
        }
    }

    fn handle_offer(&self, offer: OfferReceived) {
        let mut state = self.state.lock();

        let Some(session) = state.session_for(&offer.student_id) else {
            debug!(
                participant = %offer.student_id,
                "Dropping offer for participant without a desired session"
            );
            return;
        };

        if state.links.remove(&session).is_some() {
            info!(session = %session, "Replacing existing link with fresh offer");
        }

        let publisher = offer.sender_socket_id;
        let generation = state.links.next_generation();
        let observer = self.observer(session.clone(), generation);
        let link = ViewerLink::new(
            session.clone(),
            publisher.clone(),
            Arc::clone(&self.channel),
            Arc::clone(&self.factory),
            observer.clone(),
        );
        let commands = spawn_link(link, observer.clone(), self.failure_reporter(session.clone(), generation));

        let entry = LinkEntry::new(generation, publisher.clone(), commands, observer);
        entry.send(LinkCommand::Negotiate);
        entry.send(LinkCommand::RemoteDescription(offer.offer));

        if let Err(e) = state.links.insert(session.clone(), entry) {
            warn!("Failed to register link: {}", e);
            return;
        }

        state.requested.insert(session.clone());
        self.store.set_connecting(&session, publisher);
        info!(session = %session, generation, "Answering offer");
    }

    fn handle_transport(&self, session: SessionId, generation: u64, event: TransportEvent) {
        let mut state = self.state.lock();
        let Some(entry) = state.links.get_mut(&session).filter(|e| e.generation == generation) else {
            debug!(session = %session, generation, "Dropping event of stale link");
            return;
        };

        match event {
            TransportEvent::LocalCandidate(candidate) => match entry.hold_local_candidate(candidate) {
                Some(candidate) => self.relay_candidate(&session, &entry.endpoint, candidate),
                None => debug!(session = %session, "Holding local candidate until the answer is sent"),
            },
            TransportEvent::LocalDescriptionSent => {
                for candidate in entry.release_local_candidates() {
                    self.relay_candidate(&session, &entry.endpoint, candidate);
                }
            }
            TransportEvent::Track(handle) => {
                if self.store.set_live(&session, handle) {
                    info!(session = %session, "Stream live");
                }
            }
            TransportEvent::StateChanged(LinkState::Connected) => {
                if !self.store.mark_connected(&session) {
                    debug!(session = %session, "Transport connected, waiting for a track");
                }
            }
            TransportEvent::StateChanged(LinkState::Failed) => {
                let error =
                    Error::PeerConnectionError("connection could not be established".to_string());
                self.fail_session(&mut state, &session, &error);
            }
            TransportEvent::StateChanged(LinkState::Disconnected) => {
                let error = Error::Connectivity("peer connection interrupted".to_string());
                self.fail_session(&mut state, &session, &error);
            }
            TransportEvent::StateChanged(LinkState::Closed) => {
                state.links.remove(&session);
                state.requested.remove(&session);
                self.store.set_idle(&session);
            }
            TransportEvent::StateChanged(other) => {
                debug!(session = %session, "Transport state {:?}", other);
            }
        }
    }

    fn handle_user_left(&self, user_id: &str) {
        let mut state = self.state.lock();
        let participant = ParticipantId::from(user_id);
        let endpoint = EndpointRef::from(user_id);

        let mut affected: Vec<SessionId> = state
            .desired
            .iter()
            .filter(|(session, p)| **p == participant && state.links.contains(session))
            .map(|(session, _)| session.clone())
            .collect();
        if let Some(session) = state.links.lookup_endpoint(&endpoint) {
            if !affected.contains(session) {
                affected.push(session.clone());
            }
        }

        let error = Error::RemoteDeparted(user_id.to_string());
        for session in affected {
            info!(session = %session, user = user_id, "Publisher left");
            self.fail_session(&mut state, &session, &error);
        }
    }

    fn relay_candidate(&self, session: &SessionId, publisher: &EndpointRef, candidate: IceCandidate) {
        let message = CandidateMessage {
            candidate,
            target_socket_id: publisher.clone(),
        };
        if let Err(e) = self.channel.send(events::WEBRTC_ICE_CANDIDATE, &message) {
            warn!(session = %session, "Failed to relay local candidate: {}", e);
        }
    }

    fn fail_session(&self, state: &mut ViewerState, session: &SessionId, error: &Error) {
        warn!(session = %session, kind = ?error.kind(), "Session failed: {}", error);
        state.links.remove(session);
        state.requested.remove(session);
        self.store.set_error(session, error.to_string());
    }

    fn fail_active(&self, state: &mut ViewerState, error: &Error) {
        let mut sessions: HashSet<SessionId> = state.links.keys().into_iter().collect();
        sessions.extend(state.requested.iter().cloned());
        sessions.extend(state.desired.keys().cloned());

        for session in sessions {
            if self.store.status(&session).is_active() || state.links.contains(&session) {
                self.fail_session(state, &session, error);
            }
        }
    }

    fn observer(&self, session: SessionId, generation: u64) -> TransportObserver {
        let inputs = self.inputs.clone();
        TransportObserver::new(move |event| {
            let _ = inputs.send(ViewerInput::Transport {
                session: session.clone(),
                generation,
                event,
            });
        })
    }

    fn failure_reporter(&self, session: SessionId, generation: u64) -> impl FnOnce(Error) + Send + 'static {
        let inputs = self.inputs.clone();
        move |error| {
            let _ = inputs.send(ViewerInput::LinkFailed {
                session,
                generation,
                error,
            });
        }
    }
}

impl Drop for ViewerService {
    fn drop(&mut self) {
        self.state.get_mut().links.drain();
    }
}

