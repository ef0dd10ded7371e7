//! WebSocket signal server implementation

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use callrelay_core::DEFAULT_MAX_MESSAGE_BYTES;

use crate::http;
use crate::messages::{ErrorCode, RelayMessage, RequestError};
use crate::registry::{ConnectionHandle, ConnectionRegistry};
use crate::relay::Relay;
use crate::storage::Storage;

/// Frames up to this multiple of `max_message_bytes` are read and answered
/// with `message_too_large`. Larger ones are cut off by the WebSocket layer
/// and close the connection.
const FRAME_CEILING_FACTOR: usize = 4;

/// Server errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// State shared by every connection task
pub(crate) struct ServerState {
    pub(crate) registry: Arc<ConnectionRegistry>,
    pub(crate) relay: Relay,
    pub(crate) storage: Option<Arc<Storage>>,
    pub(crate) max_message_bytes: usize,
    connections: AtomicUsize,
}

impl ServerState {
    pub(crate) fn new(storage: Option<Arc<Storage>>, max_message_bytes: usize) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        Self {
            relay: Relay::new(registry.clone()),
            registry,
            storage,
            max_message_bytes,
            connections: AtomicUsize::new(0),
        }
    }

    /// Open WebSocket connections, registered or not
    pub(crate) fn live_connections(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    /// Largest frame the WebSocket layer will buffer
    pub(crate) fn frame_ceiling(&self) -> usize {
        self.max_message_bytes.saturating_mul(FRAME_CEILING_FACTOR)
    }
}

/// Signal server
#[derive(Clone)]
pub struct SignalServer {
    state: Arc<ServerState>,
}

impl SignalServer {
    /// Relay-only server with the default frame limit
    pub fn new() -> Self {
        Self::with_config(None, DEFAULT_MAX_MESSAGE_BYTES)
    }

    /// Server with optional storage for the HTTP API
    pub fn with_config(storage: Option<Storage>, max_message_bytes: usize) -> Self {
        Self {
            state: Arc::new(ServerState::new(storage.map(Arc::new), max_message_bytes)),
        }
    }

    /// Start the signal server
    pub async fn serve(&self, addr: SocketAddr) -> Result<(), ServerError> {
        let listener = TcpListener::bind(addr).await?;
        info!("Signal server listening on {}", addr);
        self.serve_listener(listener).await
    }

    /// Serve HTTP and WebSocket connections on an already bound listener
    pub async fn serve_listener(&self, listener: TcpListener) -> Result<(), ServerError> {
        axum::serve(listener, http::router(self.state.clone())).await?;
        Ok(())
    }

    /// Number of bound identifiers (for monitoring)
    pub fn identity_count(&self) -> usize {
        self.state.registry.len()
    }

    /// Number of open WebSocket connections (for monitoring)
    pub fn connection_count(&self) -> usize {
        self.state.live_connections()
    }

    /// Whether the HTTP API has storage behind it
    pub fn has_storage(&self) -> bool {
        self.state.storage.is_some()
    }
}

impl Default for SignalServer {
    fn default() -> Self {
        Self::new()
    }
}

/// Drive one upgraded relay connection until it closes
pub(crate) async fn handle_socket(socket: WebSocket, state: Arc<ServerState>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let (handle, mut outbound) = ConnectionHandle::channel();
    let conn_id = handle.id();
    state.connections.fetch_add(1, Ordering::Relaxed);
    debug!("New connection {}", conn_id);

    // Single writer per connection keeps deliveries in enqueue order
    let writer = tokio::spawn(async move {
        while let Some(msg) = outbound.recv().await {
            let json = match msg.to_json() {
                Ok(json) => json,
                Err(e) => {
                    warn!("Failed to encode {} for {}: {}", msg.event_name(), conn_id, e);
                    continue;
                }
            };
            if ws_sender.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    while let Some(frame) = ws_receiver.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Binary(_)) => {
                handle.send(RelayMessage::error(
                    ErrorCode::InvalidMessage,
                    "Binary frames are not supported",
                ));
                continue;
            }
            Ok(Message::Close(_)) => break,
            // Control frames are answered by the WebSocket layer
            Ok(_) => continue,
            Err(e) => {
                debug!("WebSocket error on {}: {}", conn_id, e);
                break;
            }
        };

        if text.len() > state.max_message_bytes {
            warn!("{} sent a {} byte frame, rejecting", conn_id, text.len());
            handle.send(RelayMessage::error(
                ErrorCode::MessageTooLarge,
                format!(
                    "Frame of {} bytes exceeds the {} byte limit",
                    text.len(),
                    state.max_message_bytes
                ),
            ));
            continue;
        }

        let request = match RelayMessage::from_json(&text) {
            Ok(r) => r,
            Err(e) => {
                warn!("Invalid message from {}: {}", conn_id, e);
                handle.send(RelayMessage::error(
                    ErrorCode::InvalidMessage,
                    format!("Invalid message: {}", e),
                ));
                continue;
            }
        };

        if let Some(response) = handle_message(request, &handle, &state) {
            if !handle.send(response) {
                break;
            }
        }
    }

    // Cleanup on disconnect
    let released = state.registry.unregister(conn_id);
    if !released.is_empty() {
        info!("{} closed, released {} identifier(s)", conn_id, released.len());
    }
    drop(handle);
    let _ = writer.await;
    state.connections.fetch_sub(1, Ordering::Relaxed);

    debug!("Connection closed: {}", conn_id);
}

/// Handle a single message
fn handle_message(
    msg: RelayMessage,
    handle: &ConnectionHandle,
    state: &ServerState,
) -> Option<RelayMessage> {
    match msg {
        RelayMessage::Register { identifier } => {
            match state.registry.register(identifier.clone(), handle.clone()) {
                Some(previous) => info!(
                    "{} re-registered on {}, superseding {}",
                    identifier,
                    handle.id(),
                    previous.id()
                ),
                None => info!("Registered {} on {}", identifier, handle.id()),
            }
            Some(RelayMessage::Registered { identifier })
        }

        RelayMessage::Ping { timestamp } => Some(RelayMessage::Pong { timestamp }),

        RelayMessage::Pong { .. } => None,

        other => match other.into_request() {
            Ok(request) => {
                let Some(from) = state
                    .registry
                    .primary_identity(handle.id())
                    .or(request.from)
                else {
                    warn!("{} sent {} before registering", handle.id(), request.kind);
                    return Some(RelayMessage::error(
                        ErrorCode::NotRegistered,
                        format!("Register before sending {}", request.kind),
                    ));
                };
                state
                    .relay
                    .relay(request.kind, from, &request.to, request.payload);
                None
            }
            Err(RequestError::MissingRecipient(kind)) => Some(RelayMessage::error(
                ErrorCode::InvalidMessage,
                format!("{} requires a recipient", kind),
            )),
            Err(RequestError::NotRelayable(name)) => Some(RelayMessage::error(
                ErrorCode::UnexpectedEvent,
                format!("{} is a server event", name),
            )),
        },
    }
}
