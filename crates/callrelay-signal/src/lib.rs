//! Callrelay Signal Server
//!
//! Lightweight WebSocket relay that lets browser and native clients set up
//! peer-to-peer calls and exchange chat messages.
//!
//! # Protocol
//!
//! 1. Client registers an identifier (usually an email address)
//! 2. Client sends offer / answer / ice-candidate / call-ended /
//!    call-rejected / send-message events addressed to another identifier
//! 3. Server forwards each event to the recipient's connection, stamped
//!    with the sender's identifier; recipients that are offline are skipped
//! 4. Peers establish a direct media connection
//!
//! Payloads are opaque to the relay. An optional SQLite-backed HTTP API on the
//! same port stores users and chat history.

pub mod http;
pub mod messages;
pub mod registry;
pub mod relay;
pub mod server;
pub mod storage;

pub use messages::{ErrorCode, EventKind, RelayMessage, RelayRequest};
pub use registry::{ConnectionHandle, ConnectionId, ConnectionRegistry};
pub use relay::{Relay, RelayOutcome};
pub use http::HttpError;
pub use server::{ServerError, SignalServer};
pub use storage::{Storage, StorageError, StoredMessage, StoredUser};

pub use callrelay_core::DEFAULT_SIGNAL_PORT as DEFAULT_PORT;
