//! In-memory signaling relay
//!
//! Implements `RelayConnector` so channels connect to queues owned by the
//! test instead of a WebSocket server.

use super::{HarnessError, HarnessResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use proctor_link::signaling::{RelayConnection, RelayConnector, RelayFrame};
use proctor_link::{Error, SignalingContext};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Default)]
struct ContextLog {
    connects: usize,
    inbound: Option<mpsc::UnboundedSender<RelayFrame>>,
    sent: Vec<RelayFrame>,
}

/// Relay keeping one live connection per context
#[derive(Default)]
pub struct MemoryRelay {
    contexts: Arc<Mutex<HashMap<SignalingContext, ContextLog>>>,
    refusing: AtomicBool,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse (or accept again) new connections
    pub fn set_refusing(&self, refusing: bool) {
        self.refusing.store(refusing, Ordering::SeqCst);
    }

    /// Deliver an event to the channel of `context`
    pub fn inject<T: Serialize>(
        &self,
        context: &SignalingContext,
        event: &str,
        data: &T,
    ) -> HarnessResult<()> {
        let frame = RelayFrame::new(event, serde_json::to_value(data)?);
        let contexts = self.contexts.lock();
        let tx = contexts
            .get(context)
            .and_then(|log| log.inbound.as_ref())
            .ok_or_else(|| HarnessError::RelayError(format!("{} is not connected", context)))?;

        tx.send(frame)
            .map_err(|_| HarnessError::RelayError(format!("{} dropped its connection", context)))
    }

    /// Drop the live connection of `context`, as a relay restart would
    pub fn drop_connection(&self, context: &SignalingContext) -> bool {
        self.contexts
            .lock()
            .get_mut(context)
            .and_then(|log| log.inbound.take())
            .is_some()
    }

    /// Number of successful connections made for `context`
    pub fn connects(&self, context: &SignalingContext) -> usize {
        self.contexts
            .lock()
            .get(context)
            .map(|log| log.connects)
            .unwrap_or(0)
    }

    /// Payloads of every `event` frame `context` sent
    pub fn sent(&self, context: &SignalingContext, event: &str) -> Vec<serde_json::Value> {
        self.contexts
            .lock()
            .get(context)
            .map(|log| {
                log.sent
                    .iter()
                    .filter(|frame| frame.event == event)
                    .map(|frame| frame.data.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Names of every frame `context` sent, in wire order
    pub fn sent_events(&self, context: &SignalingContext) -> Vec<String> {
        self.contexts
            .lock()
            .get(context)
            .map(|log| log.sent.iter().map(|frame| frame.event.clone()).collect())
            .unwrap_or_default()
    }

    /// Number of `event` frames `context` sent
    pub fn sent_count(&self, context: &SignalingContext, event: &str) -> usize {
        self.sent(context, event).len()
    }
}

#[async_trait]
impl RelayConnector for MemoryRelay {
    async fn connect(&self, context: &SignalingContext) -> proctor_link::Result<RelayConnection> {
        if self.refusing.load(Ordering::SeqCst) {
            return Err(Error::WebSocketError("connection refused".to_string()));
        }

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<RelayFrame>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        {
            let mut contexts = self.contexts.lock();
            let log = contexts.entry(context.clone()).or_default();
            log.connects += 1;
            log.inbound = Some(inbound_tx);
        }

        let contexts = Arc::clone(&self.contexts);
        let context = context.clone();
        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                if let Some(log) = contexts.lock().get_mut(&context) {
                    log.sent.push(frame);
                }
            }
        });

        Ok(RelayConnection {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}
