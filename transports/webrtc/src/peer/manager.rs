//! Registry of live peer links
//!
//! The registry is the arena for peer links: every link is keyed by its
//! stable identity and stamped with a generation. Asynchronous callbacks
//! carry `(key, generation)` and must check [`PeerRegistry::is_current`]
//! before touching shared state; a torn-down link resolves to "not found".

use super::transport::TransportObserver;
use super::LinkCommand;
use crate::session::identity::EndpointRef;
use crate::signaling::protocol::IceCandidate;
use crate::{Error, Result};
use std::collections::HashMap;
use std::fmt::Display;
use std::hash::Hash;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Registry entry of one live link
#[derive(Debug)]
pub struct LinkEntry {
    /// Generation stamped at creation
    pub generation: u64,
    /// Remote endpoint the link negotiates with
    pub endpoint: EndpointRef,
    commands: mpsc::UnboundedSender<LinkCommand>,
    observer: TransportObserver,
    /// Local candidates gathered before the local description went out;
    /// `None` once released
    held_local: Option<Vec<IceCandidate>>,
}

impl LinkEntry {
    /// Create an entry
    pub fn new(
        generation: u64,
        endpoint: EndpointRef,
        commands: mpsc::UnboundedSender<LinkCommand>,
        observer: TransportObserver,
    ) -> Self {
        Self {
            generation,
            endpoint,
            commands,
            observer,
            held_local: Some(Vec::new()),
        }
    }

    /// Queue a command for the link actor
    ///
    /// Returns false if the actor has already stopped.
    pub fn send(&self, command: LinkCommand) -> bool {
        self.commands.send(command).is_ok()
    }

    /// Hold a local candidate until the local description is sent.
    ///
    /// Returns the candidate back if it may go out right away.
    pub fn hold_local_candidate(&mut self, candidate: IceCandidate) -> Option<IceCandidate> {
        match self.held_local.as_mut() {
            Some(held) => {
                held.push(candidate);
                None
            }
            None => Some(candidate),
        }
    }

    /// Mark the local description as sent and take every held candidate
    pub fn release_local_candidates(&mut self) -> Vec<IceCandidate> {
        self.held_local.take().unwrap_or_default()
    }
}

/// Live links by key, plus the remote endpoint index
pub struct PeerRegistry<K> {
    links: HashMap<K, LinkEntry>,
    endpoints: HashMap<EndpointRef, K>,
    next_generation: u64,
}

impl<K> Default for PeerRegistry<K>
where
    K: Eq + Hash + Clone + Display,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> PeerRegistry<K>
where
    K: Eq + Hash + Clone + Display,
{
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            links: HashMap::new(),
            endpoints: HashMap::new(),
            next_generation: 1,
        }
    }

    /// Reserve a generation for a link about to be created
    pub fn next_generation(&mut self) -> u64 {
        let generation = self.next_generation;
        self.next_generation += 1;
        generation
    }

    /// Register a link
    ///
    /// # Errors
    ///
    /// Returns error if a link already exists for the key; callers must
    /// tear the old one down first.
    pub fn insert(&mut self, key: K, entry: LinkEntry) -> Result<()> {
        if self.links.contains_key(&key) {
            return Err(Error::PeerConnectionError(format!(
                "Link for {} already exists",
                key
            )));
        }

        info!("Registering link {} (generation {})", key, entry.generation);
        self.endpoints.insert(entry.endpoint.clone(), key.clone());
        self.links.insert(key, entry);

        Ok(())
    }

    /// Look up a live link
    pub fn get(&self, key: &K) -> Option<&LinkEntry> {
        self.links.get(key)
    }

    /// Look up a live link for mutation
    pub fn get_mut(&mut self, key: &K) -> Option<&mut LinkEntry> {
        self.links.get_mut(key)
    }

    /// Whether a link exists for the key
    pub fn contains(&self, key: &K) -> bool {
        self.links.contains_key(key)
    }

    /// Resolve a remote endpoint to the key of its live link
    pub fn lookup_endpoint(&self, endpoint: &EndpointRef) -> Option<&K> {
        self.endpoints.get(endpoint)
    }

    /// Whether `generation` is still the live link for `key`
    pub fn is_current(&self, key: &K, generation: u64) -> bool {
        self.links
            .get(key)
            .is_some_and(|entry| entry.generation == generation)
    }

    /// Tear a link down.
    ///
    /// Clears the endpoint mapping and detaches the transport observer
    /// before asking the actor to close the transport, so nothing the old
    /// link does afterwards reaches shared state.
    pub fn remove(&mut self, key: &K) -> Option<LinkEntry> {
        let entry = self.links.remove(key)?;

        if self.endpoints.get(&entry.endpoint) == Some(key) {
            self.endpoints.remove(&entry.endpoint);
        }
        entry.observer.detach();
        entry.send(LinkCommand::Teardown);

        debug!("Removed link {} (generation {})", key, entry.generation);
        Some(entry)
    }

    /// Tear every link down, returning their keys
    pub fn drain(&mut self) -> Vec<K> {
        let keys: Vec<K> = self.links.keys().cloned().collect();
        for key in &keys {
            self.remove(key);
        }
        keys
    }

    /// Keys of every live link
    pub fn keys(&self) -> Vec<K> {
        self.links.keys().cloned().collect()
    }

    /// Number of live links
    pub fn len(&self) -> usize {
        self.links.len()
    }

    /// Whether no link is live
    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}
