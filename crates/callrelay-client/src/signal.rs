//! Signaling connection to the relay server
//!
//! A [`SignalClient`] is an explicit handle to one WebSocket connection.
//! Nothing here is global: whoever needs to send signals gets a
//! [`SignalSender`] cloned from the client.

use std::collections::VecDeque;
use std::time::Duration;

use futures_util::{Sink, SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

use callrelay_core::{Outbound, UserId};
use callrelay_signal::{ErrorCode, RelayMessage};

use crate::error::ClientError;

/// Timeout for connecting and for the registration ack
const WS_TIMEOUT: Duration = Duration::from_secs(30);

/// Cloneable sending half of a signaling connection.
///
/// Messages are written in the order they were queued.
#[derive(Clone, Debug)]
pub struct SignalSender {
    tx: mpsc::UnboundedSender<RelayMessage>,
}

impl SignalSender {
    /// Sender backed by a plain channel instead of a WebSocket
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<RelayMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queue a raw relay message
    pub fn send(&self, msg: RelayMessage) -> Result<(), ClientError> {
        debug!("Queueing {}", msg.event_name());
        self.tx.send(msg).map_err(|_| ClientError::Closed)
    }

    /// Queue a call-session signal, addressed from `from`
    pub fn send_outbound(&self, from: &UserId, out: Outbound) -> Result<(), ClientError> {
        self.send(outbound_message(from, out)?)
    }

    /// Queue a chat message for `to`
    pub fn send_chat(&self, to: &UserId, text: &str) -> Result<(), ClientError> {
        self.send(RelayMessage::SendMessage {
            to: to.clone(),
            message: Value::String(text.to_string()),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Wire form of a call-session signal
pub fn outbound_message(from: &UserId, out: Outbound) -> Result<RelayMessage, ClientError> {
    let from = Some(from.clone());
    let msg = match out {
        Outbound::Offer { to, offer } => RelayMessage::Offer {
            to: Some(to),
            from,
            offer: serde_json::to_value(offer)?,
        },
        Outbound::Answer { to, answer } => RelayMessage::Answer {
            to: Some(to),
            from,
            answer: serde_json::to_value(answer)?,
        },
        Outbound::IceCandidate { to, candidate } => RelayMessage::IceCandidate {
            to: Some(to),
            from,
            candidate: serde_json::to_value(candidate)?,
        },
        Outbound::CallEnded { to } => RelayMessage::CallEnded { to: Some(to), from },
        Outbound::CallRejected { to } => RelayMessage::CallRejected { to: Some(to), from },
    };
    Ok(msg)
}

/// One connection to the signal server
pub struct SignalClient {
    sender: SignalSender,
    inbound: mpsc::UnboundedReceiver<RelayMessage>,
    /// Messages that arrived while waiting for an ack
    pending: VecDeque<RelayMessage>,
    identity: Option<UserId>,
    shutdown: Option<oneshot::Sender<()>>,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
}

impl SignalClient {
    /// Connect to the signal server at `url` (`ws://` or `wss://`)
    pub async fn connect(url: &str) -> Result<Self, ClientError> {
        let url = Url::parse(url)?;
        debug!("Connecting to signal server: {}", url);

        let (ws, _response) = timeout(WS_TIMEOUT, connect_async(url.as_str()))
            .await
            .map_err(|_| ClientError::Timeout)??;
        info!("Connected to signal server {}", url);

        let (mut ws_sender, mut ws_receiver) = ws.split();
        let (sender, mut outbound) = SignalSender::channel();
        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        let (shutdown, mut shutdown_rx) = oneshot::channel::<()>();

        let writer = tokio::spawn(async move {
            loop {
                let msg = tokio::select! {
                    msg = outbound.recv() => match msg {
                        Some(msg) => msg,
                        None => break,
                    },
                    _ = &mut shutdown_rx => {
                        // Flush whatever was queued before the close
                        while let Ok(msg) = outbound.try_recv() {
                            if write_message(&mut ws_sender, &msg).await.is_err() {
                                break;
                            }
                        }
                        break;
                    }
                };
                if write_message(&mut ws_sender, &msg).await.is_err() {
                    break;
                }
            }
            let _ = ws_sender.close().await;
        });

        let reader = tokio::spawn(async move {
            while let Some(frame) = ws_receiver.next().await {
                match frame {
                    Ok(Message::Text(text)) => match RelayMessage::from_json(&text) {
                        Ok(msg) => {
                            if inbound_tx.send(msg).is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!("Ignoring unparseable frame from signal server: {}", e),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        debug!("Signal connection error: {}", e);
                        break;
                    }
                }
            }
            debug!("Signal connection reader finished");
        });

        Ok(Self {
            sender,
            inbound,
            pending: VecDeque::new(),
            identity: None,
            shutdown: Some(shutdown),
            writer,
            reader,
        })
    }

    /// Bind `identifier` to this connection and wait for the ack.
    ///
    /// Registering again (even with another identifier) is allowed; the
    /// latest identifier becomes the one the server stamps on our events.
    /// Errors answering earlier sends are kept for [`recv`](Self::recv).
    pub async fn register(&mut self, identifier: UserId) -> Result<(), ClientError> {
        self.sender.send(RelayMessage::Register {
            identifier: identifier.clone(),
        })?;

        loop {
            let msg = timeout(WS_TIMEOUT, self.inbound.recv())
                .await
                .map_err(|_| ClientError::Timeout)?
                .ok_or(ClientError::Closed)?;

            match msg {
                RelayMessage::Registered { identifier: ack } if ack == identifier => break,
                RelayMessage::Error { code, message }
                    if matches!(code, ErrorCode::InvalidMessage | ErrorCode::MessageTooLarge) =>
                {
                    return Err(ClientError::Server { code, message });
                }
                other => self.pending.push_back(other),
            }
        }

        info!("Registered as {}", identifier);
        self.identity = Some(identifier);
        Ok(())
    }

    /// Identifier this connection last registered
    pub fn identity(&self) -> Option<&UserId> {
        self.identity.as_ref()
    }

    /// A sender sharing this connection
    pub fn sender(&self) -> SignalSender {
        self.sender.clone()
    }

    /// Queue a raw relay message
    pub fn send(&self, msg: RelayMessage) -> Result<(), ClientError> {
        self.sender.send(msg)
    }

    /// Send a chat message from our registered identity
    pub fn send_chat(&self, to: &UserId, text: &str) -> Result<(), ClientError> {
        if self.identity.is_none() {
            return Err(ClientError::NotRegistered);
        }
        self.sender.send_chat(to, text)
    }

    /// Application-level keepalive
    pub fn ping(&self, timestamp: u64) -> Result<(), ClientError> {
        self.sender.send(RelayMessage::Ping { timestamp })
    }

    /// Next message from the server. None once the connection is gone.
    pub async fn recv(&mut self) -> Option<RelayMessage> {
        if let Some(msg) = self.pending.pop_front() {
            return Some(msg);
        }
        self.inbound.recv().await
    }

    /// Flush queued messages, close the WebSocket and stop reading
    pub async fn close(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        let _ = (&mut self.writer).await;
        self.reader.abort();
        debug!("Signal connection closed");
    }
}

impl Drop for SignalClient {
    fn drop(&mut self) {
        self.reader.abort();
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

async fn write_message<S>(sink: &mut S, msg: &RelayMessage) -> Result<(), ()>
where
    S: Sink<Message> + Unpin,
{
    let json = match msg.to_json() {
        Ok(json) => json,
        Err(e) => {
            warn!("Failed to encode {}: {}", msg.event_name(), e);
            return Ok(());
        }
    };
    sink.send(Message::Text(json)).await.map_err(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    use callrelay_core::{IceCandidate, SessionDescription};
    use callrelay_signal::SignalServer;
    use serde_json::json;
    use tokio::net::TcpListener;

    fn id(s: &str) -> UserId {
        UserId::new(s).unwrap()
    }

    async fn start_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = SignalServer::new();
        tokio::spawn(async move { server.serve_listener(listener).await });
        addr
    }

    async fn registered(addr: SocketAddr, identifier: &str) -> SignalClient {
        let mut client = SignalClient::connect(&format!("ws://{}", addr)).await.unwrap();
        client.register(id(identifier)).await.unwrap();
        client
    }

    async fn next(client: &mut SignalClient) -> RelayMessage {
        timeout(Duration::from_secs(2), client.recv())
            .await
            .expect("timed out waiting for a message")
            .expect("connection closed")
    }

    #[test]
    fn test_outbound_wire_shape() {
        let msg = outbound_message(
            &id("a@example.com"),
            Outbound::IceCandidate {
                to: id("b@example.com"),
                candidate: IceCandidate::new("candidate:1"),
            },
        )
        .unwrap();

        let value: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "event": "ice-candidate",
                "to": "b@example.com",
                "from": "a@example.com",
                "candidate": {"candidate": "candidate:1"}
            })
        );

        let ended = outbound_message(&id("a@example.com"), Outbound::CallEnded { to: id("b@example.com") })
            .unwrap();
        assert_eq!(
            ended,
            RelayMessage::CallEnded {
                to: Some(id("b@example.com")),
                from: Some(id("a@example.com")),
            }
        );
    }

    #[test]
    fn test_channel_sender() {
        let (sender, mut rx) = SignalSender::channel();
        sender.send_chat(&id("b@example.com"), "hi").unwrap();
        assert_eq!(
            rx.try_recv().unwrap(),
            RelayMessage::SendMessage {
                to: id("b@example.com"),
                message: json!("hi"),
            }
        );

        drop(rx);
        assert!(sender.is_closed());
        assert!(matches!(sender.send_chat(&id("b@example.com"), "x"), Err(ClientError::Closed)));
    }

    #[tokio::test]
    async fn test_offer_between_two_clients() {
        let addr = start_server().await;
        let alice = registered(addr, "a@example.com").await;
        let mut bob = registered(addr, "b@example.com").await;

        alice
            .sender()
            .send_outbound(
                &id("a@example.com"),
                Outbound::Offer {
                    to: id("b@example.com"),
                    offer: SessionDescription::offer("v=0"),
                },
            )
            .unwrap();

        match next(&mut bob).await {
            RelayMessage::Offer { to, from, offer } => {
                assert!(to.is_none());
                assert_eq!(from, Some(id("a@example.com")));
                let offer: SessionDescription = serde_json::from_value(offer).unwrap();
                assert_eq!(offer, SessionDescription::offer("v=0"));
            }
            other => panic!("expected offer, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_chat_round_trip_and_offline_drop() {
        let addr = start_server().await;
        let mut alice = registered(addr, "a@example.com").await;
        let mut bob = registered(addr, "b@example.com").await;

        // Offline recipients are silently skipped
        alice.send_chat(&id("offline@example.com"), "anyone?").unwrap();
        alice.send_chat(&id("b@example.com"), "hello bob").unwrap();

        assert_eq!(
            next(&mut bob).await,
            RelayMessage::ReceiveMessage {
                from: id("a@example.com"),
                message: json!("hello bob"),
            }
        );

        alice.ping(42).unwrap();
        assert_eq!(next(&mut alice).await, RelayMessage::Pong { timestamp: 42 });
    }

    #[tokio::test]
    async fn test_chat_requires_registration() {
        let addr = start_server().await;
        let client = SignalClient::connect(&format!("ws://{}", addr)).await.unwrap();
        assert!(client.identity().is_none());
        assert!(matches!(
            client.send_chat(&id("b@example.com"), "hi"),
            Err(ClientError::NotRegistered)
        ));
    }

    #[tokio::test]
    async fn test_messages_during_registration_are_kept() {
        let addr = start_server().await;
        let alice = registered(addr, "a@example.com").await;
        let mut bob = registered(addr, "b@example.com").await;

        // The chat may land before or after the second ack; either way it is not lost
        alice.send_chat(&id("b@example.com"), "first").unwrap();
        bob.register(id("bob.alt@example.com")).await.unwrap();
        assert_eq!(bob.identity(), Some(&id("bob.alt@example.com")));

        assert_eq!(
            next(&mut bob).await,
            RelayMessage::ReceiveMessage {
                from: id("a@example.com"),
                message: json!("first"),
            }
        );
    }

    #[tokio::test]
    async fn test_earlier_error_does_not_fail_registration() {
        let addr = start_server().await;
        let mut client = SignalClient::connect(&format!("ws://{}", addr)).await.unwrap();

        // Sent before registering, so the server answers not_registered
        client
            .send(RelayMessage::CallRejected {
                to: Some(id("b@example.com")),
                from: None,
            })
            .unwrap();
        client.register(id("a@example.com")).await.unwrap();
        assert_eq!(client.identity(), Some(&id("a@example.com")));

        match next(&mut client).await {
            RelayMessage::Error { code, .. } => assert_eq!(code, ErrorCode::NotRegistered),
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_close_flushes_queued_messages() {
        let addr = start_server().await;
        let alice = registered(addr, "a@example.com").await;
        let mut bob = registered(addr, "b@example.com").await;

        alice.send_chat(&id("b@example.com"), "bye").unwrap();
        alice.close().await;

        assert!(matches!(next(&mut bob).await, RelayMessage::ReceiveMessage { .. }));
    }

    #[tokio::test]
    async fn test_connect_rejects_bad_url() {
        assert!(matches!(
            SignalClient::connect("not a url").await,
            Err(ClientError::InvalidUrl(_))
        ));
    }
}
