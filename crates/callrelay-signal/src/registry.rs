//! Connection registry for the signal server

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::mpsc;

use callrelay_core::UserId;

use crate::messages::RelayMessage;

/// Process-unique connection identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Allocate the next identifier
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Sending half of a connection's outbound queue.
///
/// Each connection has exactly one writer draining this queue, so messages
/// reach the client in the order they were enqueued.
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    id: ConnectionId,
    tx: mpsc::UnboundedSender<RelayMessage>,
}

impl ConnectionHandle {
    pub fn new(id: ConnectionId, tx: mpsc::UnboundedSender<RelayMessage>) -> Self {
        Self { id, tx }
    }

    /// New handle with a fresh id, plus the receiver its writer drains
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<RelayMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(ConnectionId::next(), tx), rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Enqueue a message. Returns false if the connection is gone.
    pub fn send(&self, msg: RelayMessage) -> bool {
        self.tx.send(msg).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Identifier to connection bindings, last registration wins
#[derive(Default)]
pub struct ConnectionRegistry {
    /// Active binding per identifier
    bindings: DashMap<UserId, ConnectionHandle>,
    /// Identifiers registered by each connection, oldest first
    identities: DashMap<ConnectionId, Vec<UserId>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `identifier` to `conn`.
    ///
    /// Returns the connection that held the identifier before, if it was a
    /// different one.
    pub fn register(&self, identifier: UserId, conn: ConnectionHandle) -> Option<ConnectionHandle> {
        let conn_id = conn.id();
        let previous = self
            .bindings
            .insert(identifier.clone(), conn)
            .filter(|prev| prev.id() != conn_id);

        if let Some(prev) = &previous {
            if let Some(mut ids) = self.identities.get_mut(&prev.id()) {
                ids.retain(|i| i != &identifier);
            }
        }

        let mut ids = self.identities.entry(conn_id).or_default();
        ids.retain(|i| i != &identifier);
        ids.push(identifier);

        previous
    }

    /// Connection currently bound to `identifier`
    pub fn route(&self, identifier: &UserId) -> Option<ConnectionHandle> {
        self.bindings.get(identifier).map(|entry| entry.value().clone())
    }

    /// Drop every binding still held by `conn_id`.
    ///
    /// Bindings that a newer connection took over are left alone. Returns
    /// the identifiers that were released.
    pub fn unregister(&self, conn_id: ConnectionId) -> Vec<UserId> {
        let Some((_, ids)) = self.identities.remove(&conn_id) else {
            return Vec::new();
        };

        ids.into_iter()
            .filter(|identifier| {
                self.bindings
                    .remove_if(identifier, |_, handle| handle.id() == conn_id)
                    .is_some()
            })
            .collect()
    }

    /// Identifiers bound to `conn_id`, oldest registration first
    pub fn identities(&self, conn_id: ConnectionId) -> Vec<UserId> {
        self.identities
            .get(&conn_id)
            .map(|ids| ids.value().clone())
            .unwrap_or_default()
    }

    /// Most recently registered identifier of `conn_id`
    pub fn primary_identity(&self, conn_id: ConnectionId) -> Option<UserId> {
        self.identities
            .get(&conn_id)
            .and_then(|ids| ids.last().cloned())
    }

    /// Number of bound identifiers
    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Number of connections holding at least one identifier
    pub fn connection_count(&self) -> usize {
        self.identities.iter().filter(|ids| !ids.is_empty()).count()
    }
}
