//! Callrelay Client - Signaling connection, call controller and chat
//!
//! This crate provides:
//! - [`SignalClient`]: an explicit handle to one signal server connection
//! - [`CallController`]: drives a call session from relay messages
//! - [`ApiClient`]: the optional user/message HTTP API
//! - [`ChatHistory`]: in-memory conversations
//!
//! ```text
//!  UI actions ──► CallController ──► CallSession (state machine)
//!                      ▲     │
//!        RelayMessage  │     │ Outbound
//!                      │     ▼
//!                 SignalClient / SignalSender ◄──► signal server
//! ```

pub mod api;
pub mod call;
pub mod chat;
pub mod error;
pub mod signal;

pub use api::{ApiClient, ApiError};
pub use call::{CallController, CallEvent};
pub use chat::{ChatHistory, ChatMessage};
pub use error::ClientError;
pub use signal::{outbound_message, SignalClient, SignalSender};
