//! Scripted media transports
//!
//! `FakeTransport` records what the peer links did to it; tests push
//! transport events (candidates, state changes, tracks) through the
//! observer the link registered.

use async_trait::async_trait;
use parking_lot::Mutex;
use proctor_link::media::{LocalStream, MediaTrackInfo, StreamHandle, TrackKind};
use proctor_link::peer::transport::{MediaTransport, TransportObserver};
use proctor_link::signaling::{IceCandidate, SdpType, SessionDescription};
use proctor_link::{Error, LinkState, TransportFactory};
use proctor_link::peer::TransportEvent;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// SDP a fake transport refuses to apply
pub const BAD_SDP: &str = "garbage";

/// Transport recording every call made by a peer link
pub struct FakeTransport {
    pub id: usize,
    observer: TransportObserver,
    /// Candidate gathered while the local description is being set
    gathered: Option<String>,
    local: Mutex<Option<SessionDescription>>,
    remote: Mutex<Option<SessionDescription>>,
    remote_descriptions: Mutex<usize>,
    candidates: Mutex<Vec<IceCandidate>>,
    attached: AtomicBool,
    closed: AtomicBool,
}

impl FakeTransport {
    fn new(id: usize, observer: TransportObserver, gathered: Option<String>) -> Self {
        Self {
            id,
            observer,
            gathered,
            local: Mutex::new(None),
            remote: Mutex::new(None),
            remote_descriptions: Mutex::new(0),
            candidates: Mutex::new(Vec::new()),
            attached: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Push an event as the real transport would
    pub fn emit(&self, event: TransportEvent) {
        self.observer.emit(event);
    }

    /// Report a connection state change
    pub fn emit_state(&self, state: LinkState) {
        self.emit(TransportEvent::StateChanged(state));
    }

    /// Report an inbound video track
    pub fn emit_track(&self) {
        self.emit(TransportEvent::Track(StreamHandle::new(
            format!("remote-{}", self.id),
            vec![MediaTrackInfo::new(format!("video-{}", self.id), TrackKind::Video)],
        )));
    }

    /// Report a gathered local candidate
    pub fn emit_candidate(&self, candidate: &str) {
        self.emit(TransportEvent::LocalCandidate(candidate_for(candidate)));
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.local.lock().clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.remote.lock().clone()
    }

    /// How many remote descriptions were applied
    pub fn remote_description_count(&self) -> usize {
        *self.remote_descriptions.lock()
    }

    /// Remote candidates applied, in order
    pub fn candidates(&self) -> Vec<String> {
        self.candidates
            .lock()
            .iter()
            .map(|c| c.candidate.clone())
            .collect()
    }

    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Gather the scripted candidate, then yield as ICE gathering would
    async fn gather(&self) {
        if let Some(candidate) = &self.gathered {
            self.emit_candidate(candidate);
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }
}

#[async_trait]
impl MediaTransport for FakeTransport {
    async fn attach_local_stream(&self, _stream: &LocalStream) -> proctor_link::Result<()> {
        self.attached.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn create_offer(&self) -> proctor_link::Result<SessionDescription> {
        let offer = SessionDescription::offer(format!("fake-offer-{}", self.id));
        *self.local.lock() = Some(offer.clone());
        self.gather().await;
        Ok(offer)
    }

    async fn create_answer(&self) -> proctor_link::Result<SessionDescription> {
        if self.remote.lock().is_none() {
            return Err(Error::SdpError("answer without remote offer".to_string()));
        }
        let answer = SessionDescription::answer(format!("fake-answer-{}", self.id));
        *self.local.lock() = Some(answer.clone());
        self.gather().await;
        Ok(answer)
    }

    async fn set_remote_description(&self, description: SessionDescription) -> proctor_link::Result<()> {
        if description.sdp == BAD_SDP {
            return Err(Error::SdpError("unparseable description".to_string()));
        }
        *self.remote.lock() = Some(description);
        *self.remote_descriptions.lock() += 1;
        Ok(())
    }

    async fn remote_description_type(&self) -> Option<SdpType> {
        self.remote.lock().as_ref().map(|d| d.sdp_type)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> proctor_link::Result<()> {
        if self.remote.lock().is_none() {
            return Err(Error::IceCandidateError(
                "candidate before remote description".to_string(),
            ));
        }
        self.candidates.lock().push(candidate);
        Ok(())
    }

    async fn close(&self) -> proctor_link::Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Factory handing out [`FakeTransport`]s
#[derive(Default)]
pub struct FakeTransportFactory {
    created: Mutex<Vec<Arc<FakeTransport>>>,
    gathered: Mutex<Option<String>>,
}

impl FakeTransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every later transport gather `candidate` while creating its
    /// offer or answer
    pub fn gather_during_negotiation(&self, candidate: &str) {
        *self.gathered.lock() = Some(candidate.to_string());
    }

    /// Number of transports created so far
    pub fn count(&self) -> usize {
        self.created.lock().len()
    }

    /// Transport by creation order
    pub fn get(&self, index: usize) -> Option<Arc<FakeTransport>> {
        self.created.lock().get(index).cloned()
    }

    /// Most recently created transport
    pub fn last(&self) -> Option<Arc<FakeTransport>> {
        self.created.lock().last().cloned()
    }
}

#[async_trait]
impl TransportFactory for FakeTransportFactory {
    async fn create(&self, observer: TransportObserver) -> proctor_link::Result<Arc<dyn MediaTransport>> {
        let mut created = self.created.lock();
        let gathered = self.gathered.lock().clone();
        let transport = Arc::new(FakeTransport::new(created.len(), observer, gathered));
        created.push(Arc::clone(&transport));
        Ok(transport)
    }
}

/// Build a candidate with only the candidate line set
pub fn candidate_for(candidate: &str) -> IceCandidate {
    IceCandidate {
        candidate: candidate.to_string(),
        sdp_mid: Some("0".to_string()),
        sdp_mline_index: Some(0),
        username_fragment: None,
    }
}
