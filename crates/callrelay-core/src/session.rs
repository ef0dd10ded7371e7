//! Call session state machine
//!
//! One [`CallSession`] models a single call for the local participant:
//!
//! ```text
//! Idle -> AwaitingMedia -> MediaReady -> OfferSent | OfferReceived
//!      -> NegotiationSettled -> Active -> Ended -> (reset) Idle
//! ```
//!
//! The session never talks to the network. Operations return the
//! [`Outbound`] signals the caller must relay to the remote peer, in order.
//! Remote ICE candidates that arrive before the remote description is
//! applied are queued and flushed in receipt order right after it is set.

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{MediaError, SessionError};
use crate::rtc::{LocalMedia, PeerConnection};
use crate::types::{IceCandidate, SessionDescription, UserId};

/// Call lifecycle states
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    Idle,
    AwaitingMedia,
    MediaReady,
    OfferSent,
    OfferReceived,
    NegotiationSettled,
    Active,
    Ended,
}

impl CallState {
    pub fn as_str(self) -> &'static str {
        match self {
            CallState::Idle => "idle",
            CallState::AwaitingMedia => "awaiting media",
            CallState::MediaReady => "media ready",
            CallState::OfferSent => "offer sent",
            CallState::OfferReceived => "offer received",
            CallState::NegotiationSettled => "negotiation settled",
            CallState::Active => "active",
            CallState::Ended => "ended",
        }
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A signal the session wants delivered to the remote peer
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outbound {
    Offer {
        to: UserId,
        offer: SessionDescription,
    },
    Answer {
        to: UserId,
        answer: SessionDescription,
    },
    IceCandidate {
        to: UserId,
        candidate: IceCandidate,
    },
    CallEnded {
        to: UserId,
    },
    CallRejected {
        to: UserId,
    },
}

impl Outbound {
    pub fn recipient(&self) -> &UserId {
        match self {
            Outbound::Offer { to, .. }
            | Outbound::Answer { to, .. }
            | Outbound::IceCandidate { to, .. }
            | Outbound::CallEnded { to }
            | Outbound::CallRejected { to } => to,
        }
    }
}

/// A single call for the local participant
pub struct CallSession<P: PeerConnection> {
    local: UserId,
    state: CallState,
    /// Call counterpart once the call is placed or accepted
    remote: Option<UserId>,
    peer: Option<P>,
    media: Option<P::Media>,
    /// Unanswered incoming offer
    pending_offer: Option<(UserId, SessionDescription)>,
    remote_description_set: bool,
    remote_candidates: VecDeque<IceCandidate>,
    local_candidates: VecDeque<IceCandidate>,
    active_since: Option<Instant>,
}

impl<P: PeerConnection> CallSession<P> {
    pub fn new(local: UserId) -> Self {
        Self {
            local,
            state: CallState::Idle,
            remote: None,
            peer: None,
            media: None,
            pending_offer: None,
            remote_description_set: false,
            remote_candidates: VecDeque::new(),
            local_candidates: VecDeque::new(),
            active_since: None,
        }
    }

    pub fn local(&self) -> &UserId {
        &self.local
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn remote(&self) -> Option<&UserId> {
        self.remote.as_ref()
    }

    /// Caller of the unanswered incoming offer, if any
    pub fn incoming_call(&self) -> Option<&UserId> {
        self.pending_offer.as_ref().map(|(from, _)| from)
    }

    pub fn media(&self) -> Option<&P::Media> {
        self.media.as_ref()
    }

    pub fn has_live_media(&self) -> bool {
        self.media
            .as_ref()
            .is_some_and(|media| media.live_track_count() > 0)
    }

    pub fn queued_remote_candidates(&self) -> usize {
        self.remote_candidates.len()
    }

    pub fn queued_local_candidates(&self) -> usize {
        self.local_candidates.len()
    }

    /// Time since the remote track arrived, while the call is active
    pub fn duration(&self) -> Option<Duration> {
        self.active_since.map(|since| since.elapsed())
    }

    /// Start acquiring local capture. An ended call is cleared first.
    pub fn begin_media(&mut self) -> Result<(), SessionError> {
        self.clear_ended();
        match self.state {
            CallState::Idle => {}
            CallState::OfferReceived if self.media.is_none() => {}
            state => return Err(SessionError::invalid(state, "acquire media")),
        }
        self.state = CallState::AwaitingMedia;
        Ok(())
    }

    /// Attach captured media and a fresh peer connection.
    ///
    /// On any failure both are released before returning.
    pub fn media_ready(&mut self, mut media: P::Media, mut peer: P) -> Result<(), SessionError> {
        if self.state != CallState::AwaitingMedia {
            media.stop_all();
            peer.close();
            return Err(SessionError::invalid(self.state, "attach media"));
        }

        if let Err(e) = peer.add_local_tracks(&media) {
            media.stop_all();
            peer.close();
            self.state = self.resting_state();
            return Err(e.into());
        }

        self.media = Some(media);
        self.peer = Some(peer);
        self.state = self.resting_state();
        info!(local = %self.local, state = %self.state, "local media attached");
        Ok(())
    }

    /// Capture failed. Returns the error to surface to the user.
    pub fn media_failed(&mut self, error: MediaError) -> SessionError {
        self.cancel_media();
        warn!(local = %self.local, error = %error, "media acquisition failed");
        SessionError::MediaUnavailable(error)
    }

    /// Give up on a pending capture without attaching anything
    pub fn cancel_media(&mut self) {
        if self.state == CallState::AwaitingMedia {
            self.state = self.resting_state();
        }
    }

    /// Place a call. Returns the offer followed by any queued local candidates.
    pub async fn start_call(&mut self, to: UserId) -> Result<Vec<Outbound>, SessionError> {
        if self.state != CallState::MediaReady {
            return Err(SessionError::invalid(self.state, "start a call"));
        }
        let Some(peer) = self.peer.as_mut() else {
            return Err(SessionError::MediaNotReady);
        };

        let offer = peer.create_offer().await?;
        self.remote = Some(to.clone());
        self.state = CallState::OfferSent;
        info!(local = %self.local, to = %to, "offer created");

        let mut out = vec![Outbound::Offer { to, offer }];
        out.extend(self.drain_local_candidates());
        Ok(out)
    }

    /// An offer arrived. Returns a rejection when the session is busy.
    ///
    /// An ended call does not make the session busy.
    pub fn on_offer(&mut self, from: UserId, offer: SessionDescription) -> Option<Outbound> {
        self.clear_ended();
        match self.state {
            CallState::Idle | CallState::MediaReady | CallState::AwaitingMedia
                if self.pending_offer.is_none() =>
            {
                info!(local = %self.local, from = %from, "incoming call");
                self.pending_offer = Some((from, offer));
                if self.state != CallState::AwaitingMedia {
                    self.state = CallState::OfferReceived;
                }
                None
            }
            CallState::OfferReceived | CallState::AwaitingMedia
                if self.incoming_call() == Some(&from) =>
            {
                debug!(from = %from, "replacing offer from the same caller");
                self.pending_offer = Some((from, offer));
                None
            }
            state => {
                info!(local = %self.local, from = %from, state = %state, "busy, rejecting call");
                Some(Outbound::CallRejected { to: from })
            }
        }
    }

    /// Accept the incoming call.
    ///
    /// Applies the offer, flushes queued remote candidates, then answers.
    /// The offer stays pending until the answer exists, so a failed accept
    /// can be retried or rejected.
    pub async fn accept(&mut self) -> Result<Vec<Outbound>, SessionError> {
        if self.state != CallState::OfferReceived {
            return Err(SessionError::invalid(self.state, "accept a call"));
        }
        let Some(peer) = self.peer.as_mut() else {
            return Err(SessionError::MediaNotReady);
        };
        let Some((from, offer)) = self.pending_offer.clone() else {
            return Err(SessionError::invalid(self.state, "accept a call"));
        };

        peer.set_remote_description(offer).await?;
        self.remote_description_set = true;
        apply_candidates(peer, &mut self.remote_candidates).await;

        let answer = match peer.create_answer().await {
            Ok(answer) => answer,
            Err(e) => {
                warn!(local = %self.local, from = %from, error = %e, "failed to create answer");
                return Err(e.into());
            }
        };
        self.pending_offer = None;
        self.remote = Some(from.clone());
        self.state = CallState::NegotiationSettled;
        info!(local = %self.local, to = %from, "answer created");

        let mut out = vec![Outbound::Answer { to: from, answer }];
        out.extend(self.drain_local_candidates());
        Ok(out)
    }

    /// Decline the incoming call
    pub fn reject(&mut self) -> Result<Outbound, SessionError> {
        if self.state != CallState::OfferReceived {
            return Err(SessionError::invalid(self.state, "reject a call"));
        }
        let Some((from, _)) = self.pending_offer.take() else {
            return Err(SessionError::invalid(self.state, "reject a call"));
        };

        self.remote_candidates.clear();
        self.remote_description_set = false;
        self.state = self.resting_state();
        info!(local = %self.local, from = %from, "call rejected");
        Ok(Outbound::CallRejected { to: from })
    }

    /// The callee answered our offer
    pub async fn on_answer(
        &mut self,
        from: &UserId,
        answer: SessionDescription,
    ) -> Result<(), SessionError> {
        if self.state != CallState::OfferSent {
            return Err(SessionError::invalid(self.state, "apply an answer"));
        }
        if self.remote.as_ref() != Some(from) {
            warn!(from = %from, "ignoring answer from someone we did not call");
            return Ok(());
        }
        let Some(peer) = self.peer.as_mut() else {
            return Err(SessionError::MediaNotReady);
        };

        peer.set_remote_description(answer).await?;
        self.remote_description_set = true;
        apply_candidates(peer, &mut self.remote_candidates).await;
        self.state = CallState::NegotiationSettled;
        debug!(from = %from, "remote answer applied");
        Ok(())
    }

    /// A connectivity candidate from the counterpart.
    ///
    /// Failures to apply are logged and swallowed.
    pub async fn on_remote_candidate(&mut self, from: &UserId, candidate: IceCandidate) {
        if self.state == CallState::Ended || !self.is_counterpart(from) {
            debug!(from = %from, "ignoring candidate outside the current call");
            return;
        }

        match self.peer.as_mut() {
            Some(peer) if self.remote_description_set => {
                if let Err(e) = peer.add_ice_candidate(candidate).await {
                    warn!(error = %e, "failed to add ICE candidate");
                }
            }
            _ => {
                self.remote_candidates.push_back(candidate);
                debug!(
                    queued = self.remote_candidates.len(),
                    "remote description not set, candidate queued"
                );
            }
        }
    }

    /// A candidate gathered locally. Returned for sending once the call
    /// target is known, queued until then.
    pub fn on_local_candidate(&mut self, candidate: IceCandidate) -> Option<Outbound> {
        match (&self.remote, self.state) {
            (_, CallState::Ended) => None,
            (
                Some(to),
                CallState::OfferSent | CallState::NegotiationSettled | CallState::Active,
            ) => Some(Outbound::IceCandidate {
                to: to.clone(),
                candidate,
            }),
            _ => {
                self.local_candidates.push_back(candidate);
                None
            }
        }
    }

    /// Remote media arrived
    pub fn on_remote_track(&mut self) {
        if self.state == CallState::NegotiationSettled {
            self.state = CallState::Active;
            self.active_since = Some(Instant::now());
            info!(local = %self.local, "call active");
        }
    }

    /// Hang up. Notifies the counterpart at most once.
    pub fn end(&mut self) -> Option<Outbound> {
        if self.state == CallState::Ended {
            return None;
        }
        let notify = self.remote.clone().map(|to| Outbound::CallEnded { to });
        self.teardown();
        info!(local = %self.local, "call ended locally");
        notify
    }

    /// The counterpart hung up. Returns false if the signal was not for this call.
    pub fn on_remote_ended(&mut self, from: &UserId) -> bool {
        if self.state == CallState::Ended || !self.is_counterpart(from) {
            return false;
        }
        self.teardown();
        info!(local = %self.local, from = %from, "call ended by remote");
        true
    }

    /// The callee declined our offer
    pub fn on_remote_rejected(&mut self, from: &UserId) -> bool {
        if self.state != CallState::OfferSent || self.remote.as_ref() != Some(from) {
            return false;
        }
        self.teardown();
        info!(local = %self.local, from = %from, "call rejected by remote");
        true
    }

    /// Return an ended session to Idle so another call can be set up
    pub fn reset(&mut self) -> Result<(), SessionError> {
        if self.state != CallState::Ended {
            return Err(SessionError::invalid(self.state, "reset"));
        }
        self.clear_ended();
        Ok(())
    }

    /// Flip the local video track. None if there is no video track.
    pub fn toggle_video(&mut self) -> Option<bool> {
        let media = self.media.as_mut()?;
        let next = !media.video_enabled();
        media.set_video_enabled(next).then_some(next)
    }

    /// Flip the local audio track. None if there is no audio track.
    pub fn toggle_audio(&mut self) -> Option<bool> {
        let media = self.media.as_mut()?;
        let next = !media.audio_enabled();
        media.set_audio_enabled(next).then_some(next)
    }

    fn clear_ended(&mut self) {
        if self.state == CallState::Ended {
            self.remote = None;
            self.remote_description_set = false;
            self.state = CallState::Idle;
            debug!(local = %self.local, "ended call cleared");
        }
    }

    fn is_counterpart(&self, from: &UserId) -> bool {
        self.remote.as_ref() == Some(from) || self.incoming_call() == Some(from)
    }

    fn resting_state(&self) -> CallState {
        if self.pending_offer.is_some() {
            CallState::OfferReceived
        } else if self.media.is_some() {
            CallState::MediaReady
        } else {
            CallState::Idle
        }
    }

    fn drain_local_candidates(&mut self) -> Vec<Outbound> {
        let Some(to) = self.remote.clone() else {
            return Vec::new();
        };
        self.local_candidates
            .drain(..)
            .map(|candidate| Outbound::IceCandidate {
                to: to.clone(),
                candidate,
            })
            .collect()
    }

    fn teardown(&mut self) {
        self.release();
        self.pending_offer = None;
        self.remote_candidates.clear();
        self.local_candidates.clear();
        self.active_since = None;
        self.state = CallState::Ended;
    }

    fn release(&mut self) {
        if let Some(mut media) = self.media.take() {
            media.stop_all();
        }
        if let Some(mut peer) = self.peer.take() {
            peer.close();
        }
    }
}

impl<P: PeerConnection> Drop for CallSession<P> {
    fn drop(&mut self) {
        self.release();
    }
}

async fn apply_candidates<P: PeerConnection>(peer: &mut P, queue: &mut VecDeque<IceCandidate>) {
    while let Some(candidate) = queue.pop_front() {
        if let Err(e) = peer.add_ice_candidate(candidate).await {
            warn!(error = %e, "failed to add queued ICE candidate");
        }
    }
}
