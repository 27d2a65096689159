//! Peer links: one media connection plus its negotiation state
//!
//! Both roles implement [`PeerLink`]. Each link is driven by its own actor
//! task consuming [`LinkCommand`]s in order, so the negotiation steps of one
//! link never interleave while other links keep progressing.

pub mod connection;
pub mod manager;
pub mod publisher;
pub mod transport;
pub mod viewer;

use crate::signaling::protocol::{events, IceCandidate, InboundEvent, SessionDescription};
use crate::signaling::SignalingChannel;
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use transport::{MediaTransport, TransportObserver};

pub use connection::{RtcTransport, RtcTransportFactory};
pub use manager::{LinkEntry, PeerRegistry};
pub use publisher::{PublisherEvent, PublisherLink, PublisherService};
pub use transport::{LinkState, TransportEvent, TransportFactory};
pub use viewer::{ViewerLink, ViewerService};

/// Negotiation capability shared by both roles
#[async_trait]
pub trait PeerLink: Send {
    /// Start negotiating (publisher: acquire media and offer; viewer: prepare the transport)
    async fn negotiate(&mut self) -> Result<()>;

    /// Apply the remote side's description
    async fn apply_remote_description(&mut self, description: SessionDescription) -> Result<()>;

    /// Apply a remote ICE candidate
    async fn apply_remote_candidate(&mut self, candidate: IceCandidate) -> Result<()>;

    /// Release everything the link holds
    async fn teardown(&mut self);
}

/// Work queued for a link actor
#[derive(Debug)]
pub enum LinkCommand {
    /// Run [`PeerLink::negotiate`]
    Negotiate,
    /// Run [`PeerLink::apply_remote_description`]
    RemoteDescription(SessionDescription),
    /// Run [`PeerLink::apply_remote_candidate`]
    RemoteCandidate(IceCandidate),
    /// Stop the actor
    Teardown,
}

/// Spawn the actor task driving a link.
///
/// The actor stops at the first failed step, at `Teardown`, or once the
/// observer has been detached, and always runs [`PeerLink::teardown`] on
/// the way out. `on_failure` receives the error of a failed step.
pub fn spawn_link<L, F>(
    mut link: L,
    observer: TransportObserver,
    on_failure: F,
) -> mpsc::UnboundedSender<LinkCommand>
where
    L: PeerLink + 'static,
    F: FnOnce(Error) + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Some(command) = rx.recv().await {
            if observer.is_detached() {
                break;
            }

            let result = match command {
                LinkCommand::Negotiate => link.negotiate().await,
                LinkCommand::RemoteDescription(description) => {
                    link.apply_remote_description(description).await
                }
                LinkCommand::RemoteCandidate(candidate) => {
                    link.apply_remote_candidate(candidate).await
                }
                LinkCommand::Teardown => break,
            };

            if let Err(e) = result {
                if !observer.is_detached() {
                    warn!("Link negotiation step failed: {}", e);
                    on_failure(e);
                }
                break;
            }
        }

        observer.detach();
        link.teardown().await;
        debug!("Link actor terminated");
    });

    tx
}

/// Remote candidates that arrived before the remote description
#[derive(Debug, Default)]
pub(crate) struct PendingCandidates {
    candidates: Vec<IceCandidate>,
}

impl PendingCandidates {
    /// Apply a candidate now, or hold it until the remote description is set
    pub(crate) async fn apply_or_hold(
        &mut self,
        transport: Option<&Arc<dyn MediaTransport>>,
        candidate: IceCandidate,
    ) -> Result<()> {
        match transport {
            Some(transport) if transport.remote_description_type().await.is_some() => {
                transport.add_ice_candidate(candidate).await
            }
            _ => {
                debug!("Holding remote candidate until the remote description is set");
                self.candidates.push(candidate);
                Ok(())
            }
        }
    }

    /// Apply every held candidate
    pub(crate) async fn flush(&mut self, transport: &Arc<dyn MediaTransport>) -> Result<()> {
        if !self.candidates.is_empty() {
            debug!("Applying {} held remote candidates", self.candidates.len());
        }
        for candidate in std::mem::take(&mut self.candidates) {
            transport.add_ice_candidate(candidate).await?;
        }
        Ok(())
    }
}

/// Forward every inbound protocol event of a channel into a service queue
pub(crate) fn subscribe_inbound<E, W>(
    channel: &SignalingChannel,
    inputs: mpsc::UnboundedSender<E>,
    wrap: W,
) where
    E: Send + 'static,
    W: Fn(InboundEvent) -> E + Send + Sync + Copy + 'static,
{
    for &name in events::INBOUND {
        let inputs = inputs.clone();
        channel.subscribe(name, move |data| match InboundEvent::parse(name, data) {
            Ok(Some(event)) => {
                let _ = inputs.send(wrap(event));
            }
            Ok(None) => {}
            Err(e) => warn!("Dropping malformed {} event: {}", name, e),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Steps {
        negotiated: AtomicUsize,
        candidates: AtomicUsize,
        torn_down: AtomicUsize,
    }

    struct ScriptedLink {
        steps: Arc<Steps>,
        fail_on_description: bool,
    }

    #[async_trait]
    impl PeerLink for ScriptedLink {
        async fn negotiate(&mut self) -> Result<()> {
            self.steps.negotiated.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn apply_remote_description(&mut self, _description: SessionDescription) -> Result<()> {
            if self.fail_on_description {
                return Err(Error::SdpError("bad answer".to_string()));
            }
            Ok(())
        }

        async fn apply_remote_candidate(&mut self, _candidate: IceCandidate) -> Result<()> {
            self.steps.candidates.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn teardown(&mut self) {
            self.steps.torn_down.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn candidate() -> IceCandidate {
        IceCandidate {
            candidate: "candidate:1 1 udp 1 10.0.0.1 9 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    #[tokio::test]
    async fn test_failure_reported_and_link_torn_down() {
        let steps = Arc::new(Steps::default());
        let (failed_tx, mut failed_rx) = mpsc::unbounded_channel();
        let observer = TransportObserver::new(|_| {});

        let commands = spawn_link(
            ScriptedLink {
                steps: Arc::clone(&steps),
                fail_on_description: true,
            },
            observer.clone(),
            move |e| {
                let _ = failed_tx.send(e.to_string());
            },
        );

        commands.send(LinkCommand::Negotiate).unwrap();
        commands
            .send(LinkCommand::RemoteDescription(SessionDescription::answer("x")))
            .unwrap();
        commands.send(LinkCommand::RemoteCandidate(candidate())).unwrap();

        let message = failed_rx.recv().await.unwrap();
        assert!(message.contains("bad answer"));

        // Actor stopped: the command channel closes
        commands.closed().await;
        assert_eq!(steps.negotiated.load(Ordering::SeqCst), 1);
        assert_eq!(steps.candidates.load(Ordering::SeqCst), 0);
        assert_eq!(steps.torn_down.load(Ordering::SeqCst), 1);
        assert!(observer.is_detached());
    }

    #[tokio::test]
    async fn test_detached_link_skips_queued_commands() {
        let steps = Arc::new(Steps::default());
        let observer = TransportObserver::new(|_| {});
        observer.detach();

        let commands = spawn_link(
            ScriptedLink {
                steps: Arc::clone(&steps),
                fail_on_description: false,
            },
            observer,
            |_| panic!("detached links report nothing"),
        );
        commands.send(LinkCommand::Negotiate).unwrap();
        commands.closed().await;

        assert_eq!(steps.negotiated.load(Ordering::SeqCst), 0);
        assert_eq!(steps.torn_down.load(Ordering::SeqCst), 1);
    }
}
