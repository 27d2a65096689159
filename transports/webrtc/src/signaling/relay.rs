//! Relay transport: how a signaling channel reaches the relay server
//!
//! A [`RelayConnector`] produces one [`RelayConnection`] per connect attempt.
//! The connection is a pair of frame queues; the inbound queue ending means
//! the relay connection is gone.

use super::protocol::RelayFrame;
use crate::session::identity::SignalingContext;
use crate::{Error, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, instrument, warn};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// One established relay connection
#[derive(Debug)]
pub struct RelayConnection {
    /// Frames to send to the relay
    pub outbound: mpsc::UnboundedSender<RelayFrame>,

    /// Frames received from the relay; yields `None` once the connection drops
    pub inbound: mpsc::UnboundedReceiver<RelayFrame>,
}

/// Establishes relay connections for a signaling context
#[async_trait]
pub trait RelayConnector: Send + Sync + 'static {
    /// Open a connection tagged with the context's exam, role and participant
    async fn connect(&self, context: &SignalingContext) -> Result<RelayConnection>;
}

/// WebSocket relay connector
///
/// WebSocket is the only transport mode; there is no long-polling fallback.
pub struct WebSocketConnector {
    relay_url: String,
}

impl WebSocketConnector {
    /// Create a connector for the given relay URL (ws:// or wss://)
    pub fn new(relay_url: impl Into<String>) -> Self {
        Self {
            relay_url: relay_url.into(),
        }
    }

    /// Build the connection URL for a context
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidConfig` if the relay URL does not parse.
    pub fn connection_url(&self, context: &SignalingContext) -> Result<Url> {
        let mut url = Url::parse(&self.relay_url)
            .map_err(|e| Error::InvalidConfig(format!("Invalid relay URL {}: {}", self.relay_url, e)))?;

        url.query_pairs_mut()
            .append_pair("examId", &context.exam_id)
            .append_pair("role", context.role.as_str())
            .append_pair("userId", context.participant_id.as_str())
            .append_pair("transport", "websocket");

        Ok(url)
    }

    /// Sender task: serializes frames from the queue onto the socket
    async fn sender_task(
        mut write: futures::stream::SplitSink<WsStream, Message>,
        mut rx: mpsc::UnboundedReceiver<RelayFrame>,
    ) {
        while let Some(frame) = rx.recv().await {
            let text = match frame.to_json() {
                Ok(text) => text,
                Err(e) => {
                    warn!("Dropping unserializable frame {}: {}", frame.event, e);
                    continue;
                }
            };

            if let Err(e) = write.send(Message::Text(text)).await {
                error!("Failed to send WebSocket message: {}", e);
                break;
            }
        }

        let _ = write.close().await;
        debug!("Relay sender task terminated");
    }

    /// Receiver task: parses socket messages into frames
    async fn receiver_task(
        mut read: futures::stream::SplitStream<WsStream>,
        tx: mpsc::UnboundedSender<RelayFrame>,
    ) {
        while let Some(msg_result) = read.next().await {
            match msg_result {
                Ok(Message::Text(text)) => match RelayFrame::from_json(&text) {
                    Ok(frame) => {
                        if tx.send(frame).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("Ignoring relay message: {}", e),
                },
                Ok(Message::Close(_)) => {
                    info!("Relay closed the WebSocket connection");
                    break;
                }
                Err(e) => {
                    error!("WebSocket error: {}", e);
                    break;
                }
                _ => {}
            }
        }

        debug!("Relay receiver task terminated");
    }
}

#[async_trait]
impl RelayConnector for WebSocketConnector {
    #[instrument(skip(self), fields(context = %context))]
    async fn connect(&self, context: &SignalingContext) -> Result<RelayConnection> {
        let url = self.connection_url(context)?;
        info!("Connecting to signaling relay: {}", self.relay_url);

        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| Error::WebSocketError(format!("Failed to connect: {}", e)))?;

        let (write, read) = ws_stream.split();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        tokio::spawn(Self::sender_task(write, outbound_rx));
        tokio::spawn(Self::receiver_task(read, inbound_tx));

        Ok(RelayConnection {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}
