//! Callrelay Core - Shared types, the call session state machine and configuration
//!
//! This crate contains the pieces used by both the signaling server and its
//! clients. It has no dependencies on networking code: real-time media is
//! reached only through the traits in [`rtc`].

pub mod config;
pub mod error;
pub mod rtc;
pub mod session;
pub mod types;

#[cfg(any(test, feature = "test-util"))]
pub mod mock;

pub use config::{ClientConfig, Config, ConfigError, SignalConfig};
pub use error::*;
pub use rtc::{LocalMedia, MediaConstraints, MediaDevices, PeerConnection, PeerConnector};
pub use session::{CallSession, CallState, Outbound};
pub use types::*;

/// Default signaling port
pub const DEFAULT_SIGNAL_PORT: u16 = 8080;

/// Candidate-gathering server used when none is configured
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// Maximum identifier length in bytes (an RFC 5321 address fits)
pub const MAX_IDENTIFIER_LEN: usize = 320;

/// Maximum size of a single signaling frame or HTTP body (64 KiB)
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 64 * 1024;
