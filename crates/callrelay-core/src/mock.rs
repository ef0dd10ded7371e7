//! Scripted media and peer implementations
//!
//! Each mock hands out a probe sharing its state, so a test can inspect
//! tracks and peer operations after the session has taken ownership.

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::error::{MediaError, RtcError};
use crate::rtc::{LocalMedia, MediaConstraints, MediaDevices, PeerConnection, PeerConnector};
use crate::types::{IceCandidate, SdpKind, SessionDescription};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Default)]
struct Track {
    live: bool,
    enabled: bool,
}

impl Track {
    fn live() -> Self {
        Self {
            live: true,
            enabled: true,
        }
    }
}

#[derive(Debug, Default)]
struct MediaInner {
    video: Option<Track>,
    audio: Option<Track>,
    stop_calls: usize,
}

/// Captured stream with optional video and audio tracks
#[derive(Debug)]
pub struct MockMedia {
    inner: Arc<Mutex<MediaInner>>,
}

/// Observer for a [`MockMedia`]
#[derive(Debug, Clone)]
pub struct MediaProbe {
    inner: Arc<Mutex<MediaInner>>,
}

impl MockMedia {
    pub fn camera_and_mic() -> (Self, MediaProbe) {
        Self::with_tracks(true, true)
    }

    pub fn with_tracks(video: bool, audio: bool) -> (Self, MediaProbe) {
        let inner = Arc::new(Mutex::new(MediaInner {
            video: video.then(Track::live),
            audio: audio.then(Track::live),
            stop_calls: 0,
        }));
        (
            Self {
                inner: inner.clone(),
            },
            MediaProbe { inner },
        )
    }
}

impl LocalMedia for MockMedia {
    fn stop_all(&mut self) {
        let mut guard = lock(&self.inner);
        let inner = &mut *guard;
        inner.stop_calls += 1;
        for track in [&mut inner.video, &mut inner.audio].into_iter().flatten() {
            track.live = false;
        }
    }

    fn live_track_count(&self) -> usize {
        count_live(&lock(&self.inner))
    }

    fn set_video_enabled(&mut self, enabled: bool) -> bool {
        match lock(&self.inner).video.as_mut() {
            Some(track) => {
                track.enabled = enabled;
                true
            }
            None => false,
        }
    }

    fn set_audio_enabled(&mut self, enabled: bool) -> bool {
        match lock(&self.inner).audio.as_mut() {
            Some(track) => {
                track.enabled = enabled;
                true
            }
            None => false,
        }
    }

    fn video_enabled(&self) -> bool {
        lock(&self.inner).video.as_ref().is_some_and(|t| t.enabled)
    }

    fn audio_enabled(&self) -> bool {
        lock(&self.inner).audio.as_ref().is_some_and(|t| t.enabled)
    }
}

fn count_live(inner: &MediaInner) -> usize {
    [&inner.video, &inner.audio]
        .into_iter()
        .flatten()
        .filter(|t| t.live)
        .count()
}

impl MediaProbe {
    pub fn live_track_count(&self) -> usize {
        count_live(&lock(&self.inner))
    }

    pub fn stop_calls(&self) -> usize {
        lock(&self.inner).stop_calls
    }

    pub fn video_enabled(&self) -> bool {
        lock(&self.inner).video.as_ref().is_some_and(|t| t.enabled)
    }

    pub fn audio_enabled(&self) -> bool {
        lock(&self.inner).audio.as_ref().is_some_and(|t| t.enabled)
    }
}

/// Peer operations in call order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerOp {
    AddTracks,
    CreateOffer,
    CreateAnswer,
    SetRemote(SdpKind),
    AddCandidate(String),
    Close,
}

#[derive(Debug, Default)]
struct PeerInner {
    ops: Vec<PeerOp>,
    remote_set: bool,
    closed: bool,
    failed_candidates: usize,
}

/// Peer connection that records every call.
///
/// Like the platform primitive, it refuses candidates until a remote
/// description is installed.
#[derive(Debug)]
pub struct MockPeer {
    inner: Arc<Mutex<PeerInner>>,
    bad_candidates: Vec<String>,
    fail_tracks: bool,
    fail_answer: bool,
}

/// Observer for a [`MockPeer`]
#[derive(Debug, Clone)]
pub struct PeerProbe {
    inner: Arc<Mutex<PeerInner>>,
}

impl MockPeer {
    pub fn new() -> (Self, PeerProbe) {
        let inner = Arc::new(Mutex::new(PeerInner::default()));
        (
            Self {
                inner: inner.clone(),
                bad_candidates: Vec::new(),
                fail_tracks: false,
                fail_answer: false,
            },
            PeerProbe { inner },
        )
    }

    /// Reject this candidate string when it is added
    pub fn failing_candidate(mut self, candidate: &str) -> Self {
        self.bad_candidates.push(candidate.to_string());
        self
    }

    /// Fail when local tracks are attached
    pub fn failing_tracks(mut self) -> Self {
        self.fail_tracks = true;
        self
    }

    /// Fail every answer
    pub fn failing_answer(mut self) -> Self {
        self.fail_answer = true;
        self
    }
}

#[async_trait]
impl PeerConnection for MockPeer {
    type Media = MockMedia;

    fn add_local_tracks(&mut self, _media: &MockMedia) -> Result<(), RtcError> {
        if self.fail_tracks {
            return Err(RtcError::Negotiation("cannot add tracks".into()));
        }
        lock(&self.inner).ops.push(PeerOp::AddTracks);
        Ok(())
    }

    async fn create_offer(&mut self) -> Result<SessionDescription, RtcError> {
        lock(&self.inner).ops.push(PeerOp::CreateOffer);
        Ok(SessionDescription::offer("v=0 mock-offer"))
    }

    async fn create_answer(&mut self) -> Result<SessionDescription, RtcError> {
        let mut inner = lock(&self.inner);
        if !inner.remote_set {
            return Err(RtcError::Negotiation("no remote offer".into()));
        }
        if self.fail_answer {
            return Err(RtcError::Negotiation("cannot create answer".into()));
        }
        inner.ops.push(PeerOp::CreateAnswer);
        Ok(SessionDescription::answer("v=0 mock-answer"))
    }

    async fn set_remote_description(&mut self, desc: SessionDescription) -> Result<(), RtcError> {
        let mut inner = lock(&self.inner);
        if inner.closed {
            return Err(RtcError::Closed);
        }
        inner.remote_set = true;
        inner.ops.push(PeerOp::SetRemote(desc.kind));
        Ok(())
    }

    async fn add_ice_candidate(&mut self, candidate: IceCandidate) -> Result<(), RtcError> {
        let mut inner = lock(&self.inner);
        if !inner.remote_set || self.bad_candidates.contains(&candidate.candidate) {
            inner.failed_candidates += 1;
            return Err(RtcError::Candidate(candidate.candidate));
        }
        inner.ops.push(PeerOp::AddCandidate(candidate.candidate));
        Ok(())
    }

    fn close(&mut self) {
        let mut inner = lock(&self.inner);
        if !inner.closed {
            inner.closed = true;
            inner.ops.push(PeerOp::Close);
        }
    }
}

impl PeerProbe {
    pub fn ops(&self) -> Vec<PeerOp> {
        lock(&self.inner).ops.clone()
    }

    /// Candidates successfully added, in order
    pub fn candidates(&self) -> Vec<String> {
        lock(&self.inner)
            .ops
            .iter()
            .filter_map(|op| match op {
                PeerOp::AddCandidate(c) => Some(c.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn failed_candidates(&self) -> usize {
        lock(&self.inner).failed_candidates
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.inner).closed
    }
}

/// Capture devices that either grant camera+mic or deny permission
#[derive(Debug, Clone, Default)]
pub struct MockDevices {
    deny: bool,
    opened: Arc<Mutex<Vec<MediaProbe>>>,
}

impl MockDevices {
    pub fn granting() -> Self {
        Self::default()
    }

    pub fn denying() -> Self {
        Self {
            deny: true,
            ..Self::default()
        }
    }

    /// Probes for every stream opened so far
    pub fn opened(&self) -> Vec<MediaProbe> {
        lock(&self.opened).clone()
    }
}

#[async_trait]
impl MediaDevices for MockDevices {
    type Media = MockMedia;

    async fn open(&mut self, constraints: MediaConstraints) -> Result<MockMedia, MediaError> {
        if self.deny {
            return Err(MediaError::PermissionDenied);
        }
        let (media, probe) = MockMedia::with_tracks(constraints.video, constraints.audio);
        lock(&self.opened).push(probe);
        Ok(media)
    }
}

/// Connector producing [`MockPeer`]s
#[derive(Debug, Clone, Default)]
pub struct MockConnector {
    created: Arc<Mutex<Vec<PeerProbe>>>,
    ice_servers: Arc<Mutex<Vec<String>>>,
}

impl MockConnector {
    pub fn peers(&self) -> Vec<PeerProbe> {
        lock(&self.created).clone()
    }

    /// ICE servers passed to the most recent connect
    pub fn ice_servers(&self) -> Vec<String> {
        lock(&self.ice_servers).clone()
    }
}

#[async_trait]
impl PeerConnector for MockConnector {
    type Peer = MockPeer;

    async fn connect(&mut self, ice_servers: &[String]) -> Result<MockPeer, RtcError> {
        let (peer, probe) = MockPeer::new();
        lock(&self.created).push(probe);
        *lock(&self.ice_servers) = ice_servers.to_vec();
        Ok(peer)
    }
}
