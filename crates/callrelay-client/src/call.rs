//! Call controller
//!
//! Glues a [`CallSession`] to the signaling connection. Incoming relay
//! messages become session operations, and whatever the session wants sent
//! goes out through the [`SignalSender`] in the order it was produced.

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info, warn};

use callrelay_core::{
    CallSession, CallState, IceCandidate, LocalMedia, MediaConstraints, MediaDevices, Outbound,
    PeerConnection, PeerConnector, SessionDescription, SessionError, UserId,
};
use callrelay_signal::RelayMessage;

use crate::error::ClientError;
use crate::signal::SignalSender;

/// What a relay message meant for the call, for the UI to show
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CallEvent {
    /// Someone is calling: show the incoming call prompt
    Incoming { from: UserId },
    /// A second caller was turned away because we are busy
    Busy { from: UserId },
    /// The callee answered our offer
    Answered { from: UserId },
    /// The counterpart hung up
    Ended { from: UserId },
    /// The callee declined our offer
    Rejected { from: UserId },
}

/// Drives one call session over a signaling connection
pub struct CallController<D, C>
where
    C: PeerConnector,
    D: MediaDevices<Media = <C::Peer as PeerConnection>::Media>,
{
    local: UserId,
    devices: D,
    connector: C,
    ice_servers: Vec<String>,
    constraints: MediaConstraints,
    session: CallSession<C::Peer>,
    signal: SignalSender,
}

impl<D, C> CallController<D, C>
where
    C: PeerConnector,
    D: MediaDevices<Media = <C::Peer as PeerConnection>::Media>,
{
    pub fn new(
        local: UserId,
        signal: SignalSender,
        devices: D,
        connector: C,
        ice_servers: Vec<String>,
    ) -> Self {
        Self {
            session: CallSession::new(local.clone()),
            local,
            devices,
            connector,
            ice_servers,
            constraints: MediaConstraints::default(),
            signal,
        }
    }

    /// Capture only the given tracks (audio-only calls, for example)
    pub fn with_constraints(mut self, constraints: MediaConstraints) -> Self {
        self.constraints = constraints;
        self
    }

    pub fn session(&self) -> &CallSession<C::Peer> {
        &self.session
    }

    pub fn state(&self) -> CallState {
        self.session.state()
    }

    /// Open local capture and a peer connection.
    ///
    /// A capture failure comes back as `SessionError::MediaUnavailable`,
    /// the blocking alert for the user.
    pub async fn prepare_media(&mut self) -> Result<(), ClientError> {
        self.session.begin_media()?;

        let mut media = match self.devices.open(self.constraints).await {
            Ok(media) => media,
            Err(e) => return Err(self.session.media_failed(e).into()),
        };

        let peer = match self.connector.connect(&self.ice_servers).await {
            Ok(peer) => peer,
            Err(e) => {
                media.stop_all();
                self.session.cancel_media();
                return Err(SessionError::from(e).into());
            }
        };

        self.session.media_ready(media, peer)?;
        Ok(())
    }

    /// Call `to`, acquiring media first if needed
    pub async fn call(&mut self, to: UserId) -> Result<(), ClientError> {
        if matches!(self.session.state(), CallState::Idle | CallState::Ended) {
            self.prepare_media().await?;
        }
        let out = self.session.start_call(to).await?;
        self.send_all(out)
    }

    /// Accept the incoming call, acquiring media first if needed
    pub async fn accept(&mut self) -> Result<(), ClientError> {
        if self.session.media().is_none() {
            self.prepare_media().await?;
        }
        let out = self.session.accept().await?;
        self.send_all(out)
    }

    /// Decline the incoming call
    pub fn reject(&mut self) -> Result<(), ClientError> {
        let out = self.session.reject()?;
        self.send(out)
    }

    /// Hang up and release media. The counterpart is told once.
    pub fn hang_up(&mut self) -> Result<(), ClientError> {
        match self.session.end() {
            Some(out) => self.send(out),
            None => Ok(()),
        }
    }

    /// Make an ended call ready for the next one. Optional: a new offer
    /// or call clears an ended session on its own.
    pub fn reset(&mut self) -> Result<(), ClientError> {
        self.session.reset()?;
        Ok(())
    }

    /// A candidate gathered by the local peer connection
    pub fn on_local_candidate(&mut self, candidate: IceCandidate) -> Result<(), ClientError> {
        match self.session.on_local_candidate(candidate) {
            Some(out) => self.send(out),
            None => Ok(()),
        }
    }

    /// Remote media started flowing
    pub fn on_remote_track(&mut self) {
        self.session.on_remote_track();
    }

    pub fn toggle_video(&mut self) -> Option<bool> {
        self.session.toggle_video()
    }

    pub fn toggle_audio(&mut self) -> Option<bool> {
        self.session.toggle_audio()
    }

    /// Apply a relay message. Messages unrelated to calls are ignored.
    pub async fn handle(&mut self, msg: RelayMessage) -> Result<Option<CallEvent>, ClientError> {
        match msg {
            RelayMessage::Offer {
                from: Some(from),
                offer,
                ..
            } => {
                let Some(offer) = decode::<SessionDescription>("offer", offer) else {
                    return Ok(None);
                };
                match self.session.on_offer(from.clone(), offer) {
                    Some(rejection) => {
                        self.send(rejection)?;
                        Ok(Some(CallEvent::Busy { from }))
                    }
                    None => Ok(Some(CallEvent::Incoming { from })),
                }
            }

            RelayMessage::Answer {
                from: Some(from),
                answer,
                ..
            } => {
                let Some(answer) = decode::<SessionDescription>("answer", answer) else {
                    return Ok(None);
                };
                if self.session.remote() != Some(&from) {
                    debug!("Ignoring answer from {}", from);
                    return Ok(None);
                }
                self.session.on_answer(&from, answer).await?;
                Ok(Some(CallEvent::Answered { from }))
            }

            RelayMessage::IceCandidate {
                from: Some(from),
                candidate,
                ..
            } => {
                if let Some(candidate) = decode::<IceCandidate>("ice-candidate", candidate) {
                    self.session.on_remote_candidate(&from, candidate).await;
                }
                Ok(None)
            }

            RelayMessage::CallEnded {
                from: Some(from), ..
            } => {
                let ended = self.session.on_remote_ended(&from);
                Ok(ended.then_some(CallEvent::Ended { from }))
            }

            RelayMessage::CallRejected {
                from: Some(from), ..
            } => {
                let rejected = self.session.on_remote_rejected(&from);
                Ok(rejected.then_some(CallEvent::Rejected { from }))
            }

            other => {
                debug!("Call controller ignoring {}", other.event_name());
                Ok(None)
            }
        }
    }

    fn send(&self, out: Outbound) -> Result<(), ClientError> {
        info!("{} -> {}", self.local, out.recipient());
        self.signal.send_outbound(&self.local, out)
    }

    fn send_all(&self, out: Vec<Outbound>) -> Result<(), ClientError> {
        out.into_iter().try_for_each(|o| self.send(o))
    }
}

fn decode<T: DeserializeOwned>(event: &str, payload: Value) -> Option<T> {
    match serde_json::from_value(payload) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("Dropping {} with malformed payload: {}", event, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use callrelay_core::mock::{MockConnector, MockDevices};
    use callrelay_core::MediaError;
    use tokio::sync::mpsc::UnboundedReceiver;

    type Controller = CallController<MockDevices, MockConnector>;

    struct Side {
        controller: Controller,
        outbox: UnboundedReceiver<RelayMessage>,
        devices: MockDevices,
        connector: MockConnector,
    }

    fn id(s: &str) -> UserId {
        UserId::new(s).unwrap()
    }

    fn side(local: &str, devices: MockDevices) -> Side {
        let (signal, outbox) = SignalSender::channel();
        let connector = MockConnector::default();
        let controller = CallController::new(
            id(local),
            signal,
            devices.clone(),
            connector.clone(),
            vec!["stun:stun.l.google.com:19302".to_string()],
        );
        Side {
            controller,
            outbox,
            devices,
            connector,
        }
    }

    fn drain(side: &mut Side) -> Vec<RelayMessage> {
        std::iter::from_fn(|| side.outbox.try_recv().ok()).collect()
    }

    /// Deliver everything `from` sent to `to`, the way the relay would
    async fn pump(from: &mut Side, to: &mut Side) -> Vec<CallEvent> {
        let mut events = Vec::new();
        for msg in drain(from) {
            if let Some(event) = to.controller.handle(msg).await.unwrap() {
                events.push(event);
            }
        }
        events
    }

    #[tokio::test]
    async fn test_full_call_between_two_controllers() {
        let mut alice = side("a@example.com", MockDevices::granting());
        let mut bob = side("b@example.com", MockDevices::granting());

        alice.controller.call(id("b@example.com")).await.unwrap();
        assert_eq!(alice.controller.state(), CallState::OfferSent);
        assert_eq!(
            alice.connector.ice_servers(),
            vec!["stun:stun.l.google.com:19302".to_string()]
        );

        // Caller candidates are relayed before the callee has applied the offer
        alice
            .controller
            .on_local_candidate(IceCandidate::new("a1"))
            .unwrap();

        let events = pump(&mut alice, &mut bob).await;
        assert_eq!(events, vec![CallEvent::Incoming { from: id("a@example.com") }]);
        assert_eq!(bob.controller.state(), CallState::OfferReceived);
        assert_eq!(bob.controller.session().queued_remote_candidates(), 1);

        bob.controller.accept().await.unwrap();
        assert_eq!(bob.controller.state(), CallState::NegotiationSettled);
        assert_eq!(bob.connector.peers()[0].candidates(), vec!["a1"]);

        let events = pump(&mut bob, &mut alice).await;
        assert_eq!(events, vec![CallEvent::Answered { from: id("b@example.com") }]);
        assert_eq!(alice.controller.state(), CallState::NegotiationSettled);

        alice.controller.on_remote_track();
        bob.controller.on_remote_track();
        assert_eq!(alice.controller.state(), CallState::Active);

        alice.controller.hang_up().unwrap();
        alice.controller.hang_up().unwrap();
        let sent = drain(&mut alice);
        assert_eq!(
            sent,
            vec![RelayMessage::CallEnded {
                to: Some(id("b@example.com")),
                from: Some(id("a@example.com")),
            }]
        );

        for msg in sent {
            let event = bob.controller.handle(msg).await.unwrap();
            assert_eq!(event, Some(CallEvent::Ended { from: id("a@example.com") }));
        }
        assert!(drain(&mut bob).is_empty());

        for probe in alice.devices.opened().iter().chain(bob.devices.opened().iter()) {
            assert_eq!(probe.live_track_count(), 0);
        }
        assert!(alice.connector.peers()[0].is_closed());
        assert!(bob.connector.peers()[0].is_closed());

        alice.controller.reset().unwrap();
        assert_eq!(alice.controller.state(), CallState::Idle);
    }

    #[tokio::test]
    async fn test_rejected_call() {
        let mut alice = side("a@example.com", MockDevices::granting());
        let mut bob = side("b@example.com", MockDevices::granting());

        alice.controller.call(id("b@example.com")).await.unwrap();
        pump(&mut alice, &mut bob).await;

        bob.controller.reject().unwrap();
        assert_eq!(bob.controller.state(), CallState::Idle);

        let events = pump(&mut bob, &mut alice).await;
        assert_eq!(events, vec![CallEvent::Rejected { from: id("b@example.com") }]);
        assert_eq!(alice.controller.state(), CallState::Ended);
        assert_eq!(alice.devices.opened()[0].live_track_count(), 0);
    }

    #[tokio::test]
    async fn test_busy_callee_turns_away_second_caller() {
        let mut alice = side("a@example.com", MockDevices::granting());
        let mut carol = side("c@example.com", MockDevices::granting());
        let mut bob = side("b@example.com", MockDevices::granting());

        alice.controller.call(id("b@example.com")).await.unwrap();
        pump(&mut alice, &mut bob).await;

        carol.controller.call(id("b@example.com")).await.unwrap();
        let events = pump(&mut carol, &mut bob).await;
        assert_eq!(events, vec![CallEvent::Busy { from: id("c@example.com") }]);

        let events = pump(&mut bob, &mut carol).await;
        assert_eq!(events, vec![CallEvent::Rejected { from: id("b@example.com") }]);
        assert_eq!(bob.controller.session().incoming_call(), Some(&id("a@example.com")));
    }

    #[tokio::test]
    async fn test_next_caller_reaches_callee_after_hang_up() {
        let mut alice = side("a@example.com", MockDevices::granting());
        let mut bob = side("b@example.com", MockDevices::granting());
        let mut carol = side("c@example.com", MockDevices::granting());

        alice.controller.call(id("b@example.com")).await.unwrap();
        pump(&mut alice, &mut bob).await;
        bob.controller.accept().await.unwrap();
        pump(&mut bob, &mut alice).await;

        alice.controller.hang_up().unwrap();
        let events = pump(&mut alice, &mut bob).await;
        assert_eq!(events, vec![CallEvent::Ended { from: id("a@example.com") }]);
        assert_eq!(bob.controller.state(), CallState::Ended);

        carol.controller.call(id("b@example.com")).await.unwrap();
        let events = pump(&mut carol, &mut bob).await;
        assert_eq!(events, vec![CallEvent::Incoming { from: id("c@example.com") }]);
        assert_eq!(bob.controller.state(), CallState::OfferReceived);
        assert!(drain(&mut bob).is_empty());

        bob.controller.accept().await.unwrap();
        let events = pump(&mut bob, &mut carol).await;
        assert_eq!(events, vec![CallEvent::Answered { from: id("b@example.com") }]);
        assert_eq!(bob.devices.opened().len(), 2);

        // The caller can place another call without an explicit reset
        alice.controller.call(id("c@example.com")).await.unwrap();
        assert_eq!(alice.controller.state(), CallState::OfferSent);
    }

    #[tokio::test]
    async fn test_media_denied_is_surfaced() {
        let mut alice = side("a@example.com", MockDevices::denying());

        let err = alice.controller.call(id("b@example.com")).await.unwrap_err();
        assert!(matches!(
            err,
            ClientError::Session(SessionError::MediaUnavailable(MediaError::PermissionDenied))
        ));
        assert_eq!(alice.controller.state(), CallState::Idle);
        assert!(drain(&mut alice).is_empty());
        assert!(alice.connector.peers().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_and_unrelated_messages_are_ignored() {
        let mut bob = side("b@example.com", MockDevices::granting());

        let bad_offer = RelayMessage::Offer {
            to: None,
            from: Some(id("a@example.com")),
            offer: Value::String("not an sdp".into()),
        };
        assert_eq!(bob.controller.handle(bad_offer).await.unwrap(), None);
        assert_eq!(bob.controller.state(), CallState::Idle);

        let chat = RelayMessage::ReceiveMessage {
            from: id("a@example.com"),
            message: Value::String("hi".into()),
        };
        assert_eq!(bob.controller.handle(chat).await.unwrap(), None);

        let stray_end = RelayMessage::CallEnded {
            to: None,
            from: Some(id("a@example.com")),
        };
        assert_eq!(bob.controller.handle(stray_end).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_audio_only_call_toggles() {
        let mut alice = side("a@example.com", MockDevices::granting());
        alice.controller = alice.controller.with_constraints(MediaConstraints {
            video: false,
            audio: true,
        });

        alice.controller.prepare_media().await.unwrap();
        assert_eq!(alice.controller.toggle_video(), None);
        assert_eq!(alice.controller.toggle_audio(), Some(false));
        assert!(!alice.devices.opened()[0].audio_enabled());
    }
}
