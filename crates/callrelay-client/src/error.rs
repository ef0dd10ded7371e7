//! Client error types

use thiserror::Error;

use callrelay_core::SessionError;
use callrelay_signal::ErrorCode;

use crate::api::ApiError;

/// Errors from the signaling connection and call controller
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("invalid signal server URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("timed out waiting for the signal server")]
    Timeout,

    #[error("signaling connection closed")]
    Closed,

    #[error("signal server rejected request ({code:?}): {message}")]
    Server { code: ErrorCode, message: String },

    #[error("failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("not registered with the signal server")]
    NotRegistered,

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Api(#[from] ApiError),
}
