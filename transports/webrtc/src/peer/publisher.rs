//! Publisher side: answers viewers' stream requests with an offer
//!
//! The publisher keys its links by the requesting viewer's endpoint. Local
//! media comes from the shared [`CaptureManager`]; a link holds one capture
//! reference from a successful acquire until its teardown.

use super::manager::{LinkEntry, PeerRegistry};
use super::transport::{LinkState, MediaTransport, TransportEvent, TransportFactory, TransportObserver};
use super::{spawn_link, subscribe_inbound, LinkCommand, PeerLink, PendingCandidates};
use crate::error::CaptureError;
use crate::media::CaptureManager;
use crate::session::identity::{EndpointRef, ParticipantId};
use crate::signaling::protocol::{
    events, CandidateMessage, IceCandidate, InboundEvent, OfferMessage, OfferRequest, SdpType,
    SessionDescription,
};
use crate::signaling::SignalingChannel;
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

const NOTICE_CHANNEL_CAPACITY: usize = 64;

/// Lifecycle notices of publisher links
#[derive(Debug, Clone, PartialEq)]
pub enum PublisherEvent {
    /// A viewer requested the stream and negotiation started
    Negotiating {
        /// Requesting viewer
        viewer: EndpointRef,
    },
    /// The transport to a viewer connected
    Connected {
        /// Connected viewer
        viewer: EndpointRef,
    },
    /// A link was torn down
    Closed {
        /// Viewer of the link
        viewer: EndpointRef,
        /// Why
        reason: String,
    },
    /// Local media could not be acquired; no transport was created
    CaptureFailed {
        /// Viewer that requested the stream
        viewer: EndpointRef,
        /// Device failure
        error: CaptureError,
    },
}

/// Publisher-role peer link for one viewer endpoint
pub struct PublisherLink {
    viewer: EndpointRef,
    channel: Arc<SignalingChannel>,
    capture: Arc<CaptureManager>,
    factory: Arc<dyn TransportFactory>,
    observer: TransportObserver,
    transport: Option<Arc<dyn MediaTransport>>,
    holds_capture: bool,
    pending: PendingCandidates,
}

impl PublisherLink {
    /// Create a link; nothing happens until it is negotiated
    pub fn new(
        viewer: EndpointRef,
        channel: Arc<SignalingChannel>,
        capture: Arc<CaptureManager>,
        factory: Arc<dyn TransportFactory>,
        observer: TransportObserver,
    ) -> Self {
        Self {
            viewer,
            channel,
            capture,
            factory,
            observer,
            transport: None,
            holds_capture: false,
            pending: PendingCandidates::default(),
        }
    }
}

#[async_trait]
impl PeerLink for PublisherLink {
    async fn negotiate(&mut self) -> Result<()> {
        let stream = self.capture.acquire().await?;
        self.holds_capture = true;
        if self.observer.is_detached() {
            return Ok(());
        }

        let transport = self.factory.create(self.observer.clone()).await?;
        self.transport = Some(Arc::clone(&transport));
        if self.observer.is_detached() {
            return Ok(());
        }

        transport.attach_local_stream(&stream).await?;
        let offer = transport.create_offer().await?;
        if self.observer.is_detached() {
            return Ok(());
        }

        info!(viewer = %self.viewer, "Sending offer");
        self.channel.send(
            events::WEBRTC_OFFER,
            &OfferMessage {
                offer,
                target_socket_id: self.viewer.clone(),
            },
        )?;
        self.observer.emit(TransportEvent::LocalDescriptionSent);
        Ok(())
    }

    async fn apply_remote_description(&mut self, description: SessionDescription) -> Result<()> {
        if description.sdp_type != SdpType::Answer {
            return Err(Error::ProtocolViolation(format!(
                "publisher expected an answer from {}, got {:?}",
                self.viewer, description.sdp_type
            )));
        }

        let transport = self.transport.clone().ok_or_else(|| {
            Error::ProtocolViolation(format!("answer from {} before any offer", self.viewer))
        })?;

        if transport.remote_description_type().await == Some(SdpType::Answer) {
            debug!(viewer = %self.viewer, "Ignoring duplicate answer");
            return Ok(());
        }

        transport.set_remote_description(description).await?;
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
                warn!(viewer = %self.viewer, "Error closing transport: {}", e);
            }
        }

        if self.holds_capture {
            self.holds_capture = false;
            self.capture.release().await;
        }
    }
}

enum PublisherInput {
    Signal(InboundEvent),
    Transport {
        viewer: EndpointRef,
        generation: u64,
        event: TransportEvent,
    },
    LinkFailed {
        viewer: EndpointRef,
        generation: u64,
        error: Error,
    },
}

/// Serves stream requests for the local participant.
///
/// All signaling and transport events are handled sequentially on one
/// dispatcher task; negotiation itself runs on per-link actors.
pub struct PublisherService {
    participant: ParticipantId,
    channel: Arc<SignalingChannel>,
    capture: Arc<CaptureManager>,
    factory: Arc<dyn TransportFactory>,
    links: Mutex<PeerRegistry<EndpointRef>>,
    inputs: mpsc::UnboundedSender<PublisherInput>,
    notices: broadcast::Sender<PublisherEvent>,
}

impl PublisherService {
    /// Subscribe to the channel and start serving requests
    ///
    /// The service is bound to `channel` for its whole life; after the
    /// channel has failed, start a new one on a freshly opened channel.
    ///
    /// # Arguments
    ///
    /// * `channel` - Signaling channel of the publisher's context
    /// * `participant` - Local participant; requests filtered to anyone else are ignored
    /// * `capture` - Shared capture device owner
    /// * `factory` - Transport factory
    pub fn start(
        channel: Arc<SignalingChannel>,
        participant: ParticipantId,
        capture: Arc<CaptureManager>,
        factory: Arc<dyn TransportFactory>,
    ) -> Arc<Self> {
        let (inputs, rx) = mpsc::unbounded_channel();
        let (notices, _) = broadcast::channel(NOTICE_CHANNEL_CAPACITY);

        subscribe_inbound(&channel, inputs.clone(), PublisherInput::Signal);

        let service = Arc::new(Self {
            participant,
            channel,
            capture,
            factory,
            links: Mutex::new(PeerRegistry::new()),
            inputs,
            notices,
        });

        tokio::spawn(Self::dispatch(Arc::downgrade(&service), rx));
        service
    }

    /// Subscribe to link lifecycle notices
    pub fn subscribe(&self) -> broadcast::Receiver<PublisherEvent> {
        self.notices.subscribe()
    }

    /// Local participant
    pub fn participant(&self) -> &ParticipantId {
        &self.participant
    }

    /// Viewers with a live link
    pub fn active_viewers(&self) -> Vec<EndpointRef> {
        self.links.lock().keys()
    }

    /// Tear every link down
    pub fn shutdown(&self) {
        self.drain_links("publisher stopped");
    }

    async fn dispatch(service: Weak<Self>, mut rx: mpsc::UnboundedReceiver<PublisherInput>) {
        while let Some(input) = rx.recv().await {
            let Some(service) = service.upgrade() else {
                break;
            };
            service.handle(input);
        }
        debug!("Publisher dispatcher terminated");
    }

    fn handle(&self, input: PublisherInput) {
        match input {
            PublisherInput::Signal(event) => self.handle_signal(event),
            PublisherInput::Transport {
                viewer,
                generation,
                event,
            } => self.handle_transport(viewer, generation, event),
            PublisherInput::LinkFailed {
                viewer,
                generation,
                error,
            } => self.handle_link_failed(viewer, generation, error),
        }
    }

    fn handle_signal(&self, event: InboundEvent) {
        match event {
            InboundEvent::OfferRequest(request) => self.handle_offer_request(request),
            InboundEvent::AnswerReceived(answer) => {
                self.forward(
                    &answer.sender_socket_id,
                    LinkCommand::RemoteDescription(answer.answer),
                );
            }
            InboundEvent::CandidateReceived(candidate) => {
                self.forward(
                    &candidate.sender_socket_id,
                    LinkCommand::RemoteCandidate(candidate.candidate),
                );
            }
            InboundEvent::UserLeft(left) => {
                let viewer = EndpointRef::new(left.user_id.as_str());
                self.close_link(&viewer, &Error::RemoteDeparted(left.user_id));
            }
            InboundEvent::Disconnected => self.close_all(&Error::Connectivity(
                "signaling relay connection interrupted".to_string(),
            )),
            InboundEvent::ReconnectFailed(failed) => {
                self.close_all(&Error::ReconnectExhausted(failed.attempts));
            }
            InboundEvent::Connected => debug!("Publisher channel connected"),
            InboundEvent::OfferReceived(offer) => {
                debug!(sender = %offer.sender_socket_id, "Publisher ignores offers");
            }
        }
    }

    fn handle_offer_request(&self, request: OfferRequest) {
        if let Some(filter) = &request.student_id_to_view {
            if filter != &self.participant {
                debug!(filter = %filter, "Ignoring offer request for another participant");
                return;
            }
        }

        let viewer = request.proctor_socket_id;
        let mut links = self.links.lock();

        if links.remove(&viewer).is_some() {
            info!(viewer = %viewer, "Replacing in-flight link for repeated request");
            self.notify(PublisherEvent::Closed {
                viewer: viewer.clone(),
                reason: "superseded by a new request".to_string(),
            });
        }

        let generation = links.next_generation();
        let observer = self.observer(viewer.clone(), generation);
        let link = PublisherLink::new(
            viewer.clone(),
            Arc::clone(&self.channel),
            Arc::clone(&self.capture),
            Arc::clone(&self.factory),
            observer.clone(),
        );
        let commands = spawn_link(link, observer.clone(), self.failure_reporter(viewer.clone(), generation));

        let entry = LinkEntry::new(generation, viewer.clone(), commands, observer);
        entry.send(LinkCommand::Negotiate);

        if let Err(e) = links.insert(viewer.clone(), entry) {
            warn!("Failed to register link: {}", e);
            return;
        }

        info!(viewer = %viewer, generation, "Negotiating stream for viewer");
        self.notify(PublisherEvent::Negotiating { viewer });
    }

    fn handle_transport(&self, viewer: EndpointRef, generation: u64, event: TransportEvent) {
        let mut links = self.links.lock();
        let Some(entry) = links.get_mut(&viewer).filter(|e| e.generation == generation) else {
            debug!(viewer = %viewer, generation, "Dropping event of stale link");
            return;
        };

        match event {
            TransportEvent::LocalCandidate(candidate) => match entry.hold_local_candidate(candidate) {
                Some(candidate) => self.relay_candidate(&viewer, candidate),
                None => debug!(viewer = %viewer, "Holding local candidate until the offer is sent"),
            },
            TransportEvent::LocalDescriptionSent => {
                for candidate in entry.release_local_candidates() {
                    self.relay_candidate(&viewer, candidate);
                }
            }
            TransportEvent::StateChanged(LinkState::Connected) => {
                info!(viewer = %viewer, "Streaming to viewer");
                self.notify(PublisherEvent::Connected { viewer });
            }
            TransportEvent::StateChanged(LinkState::Failed) => {
                let error =
                    Error::PeerConnectionError("connection could not be established".to_string());
                self.remove_link(&mut links, &viewer, &error);
            }
            TransportEvent::StateChanged(LinkState::Disconnected) => {
                let error = Error::Connectivity("peer connection interrupted".to_string());
                self.remove_link(&mut links, &viewer, &error);
            }
            TransportEvent::StateChanged(LinkState::Closed) => {
                let error = Error::PeerConnectionError("connection closed".to_string());
                self.remove_link(&mut links, &viewer, &error);
            }
            TransportEvent::StateChanged(state) => {
                debug!(viewer = %viewer, "Transport state {:?}", state);
            }
            TransportEvent::Track(_) => {
                debug!(viewer = %viewer, "Ignoring inbound track on publisher link");
            }
        }
    }

    fn handle_link_failed(&self, viewer: EndpointRef, generation: u64, error: Error) {
        let mut links = self.links.lock();
        if !links.is_current(&viewer, generation) {
            return;
        }
        links.remove(&viewer);
        drop(links);

        let kind = error.kind();
        match error {
            Error::Capture(capture_error) => {
                warn!(viewer = %viewer, ?kind, "Capture failed: {}", capture_error);
                self.notify(PublisherEvent::CaptureFailed {
                    viewer,
                    error: capture_error,
                });
            }
            other => {
                warn!(viewer = %viewer, ?kind, "Link failed: {}", other);
                self.notify(PublisherEvent::Closed {
                    viewer,
                    reason: other.to_string(),
                });
            }
        }
    }

    fn relay_candidate(&self, viewer: &EndpointRef, candidate: IceCandidate) {
        let message = CandidateMessage {
            candidate,
            target_socket_id: viewer.clone(),
        };
        if let Err(e) = self.channel.send(events::WEBRTC_ICE_CANDIDATE, &message) {
            warn!(viewer = %viewer, "Failed to relay local candidate: {}", e);
        }
    }

    fn forward(&self, viewer: &EndpointRef, command: LinkCommand) {
        let links = self.links.lock();
        match links.lookup_endpoint(viewer).and_then(|key| links.get(key)) {
            Some(entry) => {
                entry.send(command);
            }
            None => warn!(viewer = %viewer, "Dropping message for endpoint without a link"),
        }
    }

    fn close_link(&self, viewer: &EndpointRef, reason: &Error) {
        let mut links = self.links.lock();
        self.remove_link(&mut links, viewer, reason);
    }

    fn remove_link(&self, links: &mut PeerRegistry<EndpointRef>, viewer: &EndpointRef, reason: &Error) {
        if links.remove(viewer).is_none() {
            return;
        }
        info!(viewer = %viewer, kind = ?reason.kind(), "Closing link: {}", reason);
        self.notify(PublisherEvent::Closed {
            viewer: viewer.clone(),
            reason: reason.to_string(),
        });
    }

    fn close_all(&self, reason: &Error) {
        warn!(kind = ?reason.kind(), "Closing every link: {}", reason);
        self.drain_links(&reason.to_string());
    }

    fn drain_links(&self, reason: &str) {
        let viewers = self.links.lock().drain();
        for viewer in viewers {
            info!(viewer = %viewer, "Closing link: {}", reason);
            self.notify(PublisherEvent::Closed {
                viewer,
                reason: reason.to_string(),
            });
        }
    }

    fn observer(&self, viewer: EndpointRef, generation: u64) -> TransportObserver {
        let inputs = self.inputs.clone();
        TransportObserver::new(move |event| {
            let _ = inputs.send(PublisherInput::Transport {
                viewer: viewer.clone(),
                generation,
                event,
            });
        })
    }

    fn failure_reporter(&self, viewer: EndpointRef, generation: u64) -> impl FnOnce(Error) + Send + 'static {
        let inputs = self.inputs.clone();
        move |error| {
            let _ = inputs.send(PublisherInput::LinkFailed {
                viewer,
                generation,
                error,
            });
        }
    }

    fn notify(&self, event: PublisherEvent) {
        let _ = self.notices.send(event);
    }
}

impl Drop for PublisherService {
    fn drop(&mut self) {
        self.links.get_mut().drain();
    }
}
