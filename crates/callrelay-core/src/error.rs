//! Error types for identifiers, media and call sessions

use thiserror::Error;

use crate::session::CallState;

/// Identifier validation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdError {
    #[error("identifier is empty")]
    Empty,

    #[error("identifier too long: {len} bytes (max {max})")]
    TooLong { len: usize, max: usize },
}

/// Local capture failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("camera or microphone permission denied")]
    PermissionDenied,

    #[error("no capture device found: {0}")]
    NotFound(String),

    #[error("media unavailable: {0}")]
    Unavailable(String),
}

/// Failures reported by the platform peer connection
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RtcError {
    #[error("negotiation failed: {0}")]
    Negotiation(String),

    #[error("candidate rejected: {0}")]
    Candidate(String),

    #[error("peer connection closed")]
    Closed,
}

/// Call session errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("cannot {action} while {state}")]
    InvalidTransition {
        state: CallState,
        action: &'static str,
    },

    /// Surfaced to the user as a blocking alert
    #[error("microphone or camera access is required: {0}")]
    MediaUnavailable(#[from] MediaError),

    #[error("local media is not ready")]
    MediaNotReady,

    #[error(transparent)]
    Rtc(#[from] RtcError),
}

impl SessionError {
    pub(crate) fn invalid(state: CallState, action: &'static str) -> Self {
        SessionError::InvalidTransition { state, action }
    }
}
