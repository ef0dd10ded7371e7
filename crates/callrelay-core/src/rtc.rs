//! Seams onto the platform's real-time media stack
//!
//! A [`CallSession`](crate::session::CallSession) never touches capture
//! devices or ICE agents directly. Platform bindings implement these traits
//! as thin pass-throughs: no retries and no recovery beyond reporting the
//! error back.

use async_trait::async_trait;

use crate::error::{MediaError, RtcError};
use crate::types::{IceCandidate, SessionDescription};

/// Which tracks to capture
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MediaConstraints {
    pub video: bool,
    pub audio: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            video: true,
            audio: true,
        }
    }
}

/// A captured local stream. Owned exclusively by one call session.
pub trait LocalMedia: Send {
    /// Stop every track. Idempotent.
    fn stop_all(&mut self);

    /// Tracks still in the "live" state
    fn live_track_count(&self) -> usize;

    /// Returns false if the stream has no video track
    fn set_video_enabled(&mut self, enabled: bool) -> bool;

    /// Returns false if the stream has no audio track
    fn set_audio_enabled(&mut self, enabled: bool) -> bool;

    fn video_enabled(&self) -> bool;

    fn audio_enabled(&self) -> bool;
}

/// Capture device access
#[async_trait]
pub trait MediaDevices: Send {
    type Media: LocalMedia;

    async fn open(&mut self, constraints: MediaConstraints) -> Result<Self::Media, MediaError>;
}

/// One peer connection
#[async_trait]
pub trait PeerConnection: Send {
    type Media: LocalMedia;

    fn add_local_tracks(&mut self, media: &Self::Media) -> Result<(), RtcError>;

    /// Create an offer and install it as the local description
    async fn create_offer(&mut self) -> Result<SessionDescription, RtcError>;

    /// Create an answer and install it as the local description
    async fn create_answer(&mut self) -> Result<SessionDescription, RtcError>;

    async fn set_remote_description(&mut self, desc: SessionDescription) -> Result<(), RtcError>;

    async fn add_ice_candidate(&mut self, candidate: IceCandidate) -> Result<(), RtcError>;

    /// Close the connection. Idempotent.
    fn close(&mut self);
}

/// Builds peer connections against a set of candidate-gathering servers
#[async_trait]
pub trait PeerConnector: Send {
    type Peer: PeerConnection;

    async fn connect(&mut self, ice_servers: &[String]) -> Result<Self::Peer, RtcError>;
}
