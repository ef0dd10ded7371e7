//! Fire-and-forget event relay

use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use callrelay_core::UserId;

use crate::messages::{EventKind, RelayMessage};
use crate::registry::{ConnectionId, ConnectionRegistry};

/// Result of a relay attempt. Never reported back to the sender.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Enqueued on the recipient's connection
    Delivered(ConnectionId),
    /// Recipient offline or its connection already closing
    Dropped,
}

/// Forwards opaque payloads between registered identifiers
#[derive(Clone)]
pub struct Relay {
    registry: Arc<ConnectionRegistry>,
}

impl Relay {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Deliver `{kind, from, payload}` to whoever holds `to`.
    ///
    /// There is no buffering: an offline recipient means the event is lost.
    pub fn relay(
        &self,
        kind: EventKind,
        from: UserId,
        to: &UserId,
        payload: Option<Value>,
    ) -> RelayOutcome {
        let Some(conn) = self.registry.route(to) else {
            debug!(%kind, %from, %to, "recipient not registered, dropping");
            return RelayOutcome::Dropped;
        };

        if conn.send(RelayMessage::delivery(kind, from.clone(), payload)) {
            debug!(%kind, %from, %to, conn = %conn.id(), "relayed");
            RelayOutcome::Delivered(conn.id())
        } else {
            debug!(%kind, %from, %to, "recipient connection closing, dropping");
            RelayOutcome::Dropped
        }
    }
}
