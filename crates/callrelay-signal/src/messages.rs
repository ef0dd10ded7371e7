//! Relay protocol messages

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use callrelay_core::UserId;

/// Messages sent over the signaling WebSocket.
///
/// Relayable events carry `to` when sent by a client. The server drops `to`
/// and stamps `from` before delivering them.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum RelayMessage {
    /// Bind an identifier to this connection
    Register { identifier: UserId },

    /// Registration acknowledged
    Registered { identifier: UserId },

    /// Session description offer
    Offer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<UserId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<UserId>,
        offer: Value,
    },

    /// Session description answer
    Answer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<UserId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<UserId>,
        answer: Value,
    },

    /// Connectivity candidate
    IceCandidate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<UserId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<UserId>,
        candidate: Value,
    },

    /// The sender hung up
    CallEnded {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<UserId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<UserId>,
    },

    /// The sender declined an offer
    CallRejected {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<UserId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<UserId>,
    },

    /// Chat message for another identifier
    SendMessage { to: UserId, message: Value },

    /// Chat message delivered by the relay
    ReceiveMessage { from: UserId, message: Value },

    /// Error response
    Error { code: ErrorCode, message: String },

    /// Ping for keepalive
    Ping { timestamp: u64 },

    /// Pong response
    Pong { timestamp: u64 },
}

/// Error codes
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Unparseable frame or bad field
    InvalidMessage,

    /// A server-to-client event was sent by a client
    UnexpectedEvent,

    /// Frame exceeds the configured limit
    MessageTooLarge,

    /// No identity to send from
    NotRegistered,

    /// Internal server error
    InternalError,
}

/// Relayable event kinds
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    Offer,
    Answer,
    IceCandidate,
    CallEnded,
    CallRejected,
    SendMessage,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Offer => "offer",
            EventKind::Answer => "answer",
            EventKind::IceCandidate => "ice-candidate",
            EventKind::CallEnded => "call-ended",
            EventKind::CallRejected => "call-rejected",
            EventKind::SendMessage => "send-message",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A client event ready for routing
#[derive(Clone, Debug, PartialEq)]
pub struct RelayRequest {
    pub kind: EventKind,
    pub to: UserId,
    /// Sender identity claimed by the client
    pub from: Option<UserId>,
    pub payload: Option<Value>,
}

/// Why a client message cannot be routed
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RequestError {
    /// Relayable event without a `to`
    MissingRecipient(EventKind),
    /// Not a relayable event
    NotRelayable(&'static str),
}

impl RelayMessage {
    /// Create an error message
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
        }
    }

    /// Build the message a recipient sees for a relayed event
    pub fn delivery(kind: EventKind, from: UserId, payload: Option<Value>) -> Self {
        let payload = payload.unwrap_or(Value::Null);
        let from_field = Some(from.clone());
        match kind {
            EventKind::Offer => Self::Offer {
                to: None,
                from: from_field,
                offer: payload,
            },
            EventKind::Answer => Self::Answer {
                to: None,
                from: from_field,
                answer: payload,
            },
            EventKind::IceCandidate => Self::IceCandidate {
                to: None,
                from: from_field,
                candidate: payload,
            },
            EventKind::CallEnded => Self::CallEnded {
                to: None,
                from: from_field,
            },
            EventKind::CallRejected => Self::CallRejected {
                to: None,
                from: from_field,
            },
            EventKind::SendMessage => Self::ReceiveMessage {
                from,
                message: payload,
            },
        }
    }

    /// Split a client event into its routing parts
    pub fn into_request(self) -> Result<RelayRequest, RequestError> {
        let (kind, to, from, payload) = match self {
            Self::Offer { to, from, offer } => (EventKind::Offer, to, from, Some(offer)),
            Self::Answer { to, from, answer } => (EventKind::Answer, to, from, Some(answer)),
            Self::IceCandidate {
                to,
                from,
                candidate,
            } => (EventKind::IceCandidate, to, from, Some(candidate)),
            Self::CallEnded { to, from } => (EventKind::CallEnded, to, from, None),
            Self::CallRejected { to, from } => (EventKind::CallRejected, to, from, None),
            Self::SendMessage { to, message } => {
                (EventKind::SendMessage, Some(to), None, Some(message))
            }
            other => return Err(RequestError::NotRelayable(other.event_name())),
        };

        let to = to.ok_or(RequestError::MissingRecipient(kind))?;
        Ok(RelayRequest {
            kind,
            to,
            from,
            payload,
        })
    }

    /// Wire name of this event
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Register { .. } => "register",
            Self::Registered { .. } => "registered",
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::IceCandidate { .. } => "ice-candidate",
            Self::CallEnded { .. } => "call-ended",
            Self::CallRejected { .. } => "call-rejected",
            Self::SendMessage { .. } => "send-message",
            Self::ReceiveMessage { .. } => "receive-message",
            Self::Error { .. } => "error",
            Self::Ping { .. } => "ping",
            Self::Pong { .. } => "pong",
        }
    }

    /// Parse from JSON
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
