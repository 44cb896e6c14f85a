//! Local call state: at most one active call, and the resources scoped to it.

use super::media::MediaAcquisition;
use super::negotiation::NegotiationEngine;
use super::poller::SignalingPoller;
use super::{CallKind, CallStatus, Direction, Identity, LocalCallView};

/// Resources and view of the active call.
pub struct ActiveCall {
    view: LocalCallView,
    attempt: u64,
    negotiation: Option<NegotiationEngine>,
    media: Option<MediaAcquisition>,
    poller: Option<SignalingPoller>,
    outbound_launched: bool,
}

impl ActiveCall {
    fn release(&mut self) {
        if let Some(mut engine) = self.negotiation.take() {
            engine.close();
        }
        if let Some(media) = self.media.take() {
            media.cleanup();
        }
        // Dropping the poller aborts its task.
        self.poller = None;
    }
}

pub enum CallState {
    Idle,
    Active(ActiveCall),
}

/// Owns the local call view and everything scoped to it.
pub struct CallSessionController {
    state: CallState,
    next_attempt: u64,
}

impl Default for CallSessionController {
    fn default() -> Self {
        Self::new()
    }
}

impl CallSessionController {
    pub fn new() -> Self {
        Self {
            state: CallState::Idle,
            next_attempt: 1,
        }
    }

    pub fn state(&self) -> &CallState {
        &self.state
    }

    /// Open an outgoing call view. Any active call is torn down first.
    pub fn start(&mut self, peer: Identity, peer_name: String, kind: CallKind) -> u64 {
        self.activate(LocalCallView {
            id: String::new(),
            kind,
            peer,
            peer_name,
            direction: Direction::Outgoing,
            status: CallStatus::Initiated,
            minimized: false,
            muted: false,
        })
    }

    /// Open an incoming call view for an accepted call. Any active call is
    /// torn down first.
    pub fn receive(&mut self, peer: Identity, peer_name: String, kind: CallKind, id: String) -> u64 {
        self.activate(LocalCallView {
            id,
            kind,
            peer,
            peer_name,
            direction: Direction::Incoming,
            status: CallStatus::Ringing,
            minimized: false,
            muted: false,
        })
    }

    fn activate(&mut self, view: LocalCallView) -> u64 {
        if let Some(previous) = self.end() {
            tracing::info!("Replacing active call with {}", previous.peer);
        }
        let attempt = self.next_attempt;
        self.next_attempt += 1;
        tracing::info!(
            "Call attempt {}: {} {} call with {}",
            attempt,
            view.direction.as_str(),
            view.kind.as_str(),
            view.peer
        );
        self.state = CallState::Active(ActiveCall {
            view,
            attempt,
            negotiation: None,
            media: None,
            poller: None,
            outbound_launched: false,
        });
        attempt
    }

    /// Release everything and return to idle. Never fails; returns the view
    /// that was active, if any.
    pub fn end(&mut self) -> Option<LocalCallView> {
        match std::mem::replace(&mut self.state, CallState::Idle) {
            CallState::Idle => None,
            CallState::Active(mut call) => {
                call.release();
                tracing::info!("Call attempt {} ended", call.attempt);
                Some(call.view)
            }
        }
    }

    fn current(&mut self, attempt: u64) -> Option<&mut ActiveCall> {
        match self.state {
            CallState::Active(ref mut call) if call.attempt == attempt => Some(call),
            _ => None,
        }
    }

    fn active_mut(&mut self) -> Option<&mut ActiveCall> {
        match self.state {
            CallState::Active(ref mut call) => Some(call),
            CallState::Idle => None,
        }
    }

    pub fn is_current(&self, attempt: u64) -> bool {
        matches!(self.state, CallState::Active(ref call) if call.attempt == attempt)
    }

    /// Hand the negotiation handle to the call. A stale attempt gets it back.
    pub fn attach_negotiation(
        &mut self,
        attempt: u64,
        engine: NegotiationEngine,
    ) -> Result<(), NegotiationEngine> {
        match self.current(attempt) {
            Some(call) => {
                if let Some(mut old) = call.negotiation.replace(engine) {
                    old.close();
                }
                Ok(())
            }
            None => Err(engine),
        }
    }

    /// Attach the call's media. For a stale attempt the media is released.
    pub fn attach_media(&mut self, attempt: u64, media: MediaAcquisition) -> bool {
        match self.current(attempt) {
            Some(call) => {
                media.set_audio_enabled(!call.view.muted);
                if let Some(old) = call.media.replace(media) {
                    old.cleanup();
                }
                true
            }
            None => {
                media.cleanup();
                false
            }
        }
    }

    /// Attach the call's poller. For a stale attempt the poller is dropped.
    pub fn attach_poller(&mut self, attempt: u64, poller: SignalingPoller) -> bool {
        match self.current(attempt) {
            Some(call) => {
                call.poller = Some(poller);
                true
            }
            None => false,
        }
    }

    pub fn negotiation_mut(&mut self) -> Option<&mut NegotiationEngine> {
        self.active_mut().and_then(|c| c.negotiation.as_mut())
    }

    /// Claim the one outbound setup of the active call. False when there is
    /// no call, it is not outgoing, already launched, or already registered.
    pub fn claim_outbound_launch(&mut self) -> Option<u64> {
        let call = self.active_mut()?;
        if call.view.direction != Direction::Outgoing
            || call.outbound_launched
            || call.view.has_id()
        {
            return None;
        }
        call.outbound_launched = true;
        Some(call.attempt)
    }

    pub fn minimize(&mut self) {
        if let Some(call) = self.active_mut() {
            call.view.minimized = true;
        }
    }

    pub fn restore(&mut self) {
        if let Some(call) = self.active_mut() {
            call.view.minimized = false;
        }
    }

    pub fn toggle_mute(&mut self) {
        if let Some(muted) = self.view().map(|v| v.muted) {
            self.set_muted(!muted);
        }
    }

    pub fn set_muted(&mut self, muted: bool) {
        if let Some(call) = self.active_mut() {
            call.view.muted = muted;
            if let Some(ref media) = call.media {
                media.set_audio_enabled(!muted);
            }
        }
    }

    pub fn update_status(&mut self, status: CallStatus) {
        if let Some(call) = self.active_mut() {
            if call.view.status != status {
                tracing::info!("Call status: {} -> {}", call.view.status, status);
                call.view.status = status;
            }
        }
    }

    pub fn update_id(&mut self, id: &str) {
        if let Some(call) = self.active_mut() {
            call.view.id = id.to_string();
        }
    }

    pub fn view(&self) -> Option<&LocalCallView> {
        match self.state {
            CallState::Active(ref call) => Some(&call.view),
            CallState::Idle => None,
        }
    }

    /// Id of the active call, when it has one.
    pub fn call_id(&self) -> Option<&str> {
        self.view().filter(|v| v.has_id()).map(|v| v.id.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calling::media::CaptureProfile;
    use crate::calling::negotiation::DEFAULT_GATHERING_TIMEOUT;
    use crate::calling::testing::{FakeDevice, FakeTransport};

    fn bob() -> Identity {
        Identity::from("bob")
    }

    #[test]
    fn test_start_opens_outgoing_initiated_view() {
        let mut c = CallSessionController::new();
        c.start(bob(), "Bob".into(), CallKind::Video);
        let view = c.view().unwrap();
        assert_eq!(view.status, CallStatus::Initiated);
        assert_eq!(view.direction, Direction::Outgoing);
        assert!(!view.has_id());
        assert!(c.call_id().is_none());
    }

    #[test]
    fn test_receive_opens_ringing_view_with_id() {
        let mut c = CallSessionController::new();
        c.receive(bob(), "Bob".into(), CallKind::Voice, "c1".into());
        assert_eq!(c.view().unwrap().status, CallStatus::Ringing);
        assert_eq!(c.call_id(), Some("c1"));
    }

    #[tokio::test]
    async fn test_start_while_active_tears_down_previous() {
        let device = FakeDevice::new();
        let transport = FakeTransport::new();
        let mut c = CallSessionController::new();

        let first = c.start(bob(), "Bob".into(), CallKind::Video);
        let media = MediaAcquisition::new(device.clone());
        media.acquire(CaptureProfile { audio: true, video: true }).await.unwrap();
        assert!(c.attach_media(first, media));
        let engine = NegotiationEngine::new(Box::new(transport.clone()), DEFAULT_GATHERING_TIMEOUT);
        assert!(c.attach_negotiation(first, engine).is_ok());

        let second = c.start(Identity::from("carol"), "Carol".into(), CallKind::Voice);
        assert_ne!(first, second);
        assert_eq!(transport.closes(), 1);
        assert!(device.produced()[0].tracks().iter().all(|t| !t.is_live()));
        assert_eq!(c.view().unwrap().peer, Identity::from("carol"));
        assert!(c.negotiation_mut().is_none());
    }

    #[tokio::test]
    async fn test_receive_while_active_tears_down_previous() {
        let device = FakeDevice::new();
        let transport = FakeTransport::new();
        let mut c = CallSessionController::new();

        let first = c.receive(bob(), "Bob".into(), CallKind::Video, "c1".into());
        let media = MediaAcquisition::new(device.clone());
        media.acquire(CaptureProfile { audio: true, video: true }).await.unwrap();
        assert!(c.attach_media(first, media));
        let engine = NegotiationEngine::new(Box::new(transport.clone()), DEFAULT_GATHERING_TIMEOUT);
        assert!(c.attach_negotiation(first, engine).is_ok());
        c.update_status(CallStatus::InProgress);

        let second = c.receive(Identity::from("carol"), "Carol".into(), CallKind::Voice, "c2".into());
        assert_ne!(first, second);
        assert!(!c.is_current(first));
        assert_eq!(transport.closes(), 1);
        assert!(device.produced()[0].tracks().iter().all(|t| !t.is_live()));

        let view = c.view().unwrap();
        assert_eq!(view.peer, Identity::from("carol"));
        assert_eq!(view.direction, Direction::Incoming);
        assert_eq!(view.status, CallStatus::Ringing);
        assert_eq!(c.call_id(), Some("c2"));
        assert!(c.negotiation_mut().is_none());
    }

    #[tokio::test]
    async fn test_stale_attach_is_refused() {
        let device = FakeDevice::new();
        let mut c = CallSessionController::new();
        let stale = c.start(bob(), "Bob".into(), CallKind::Voice);
        c.end();

        let media = MediaAcquisition::new(device.clone());
        media.acquire(CaptureProfile { audio: true, video: false }).await.unwrap();
        assert!(!c.attach_media(stale, media));
        assert!(!device.produced()[0].tracks()[0].is_live());

        let engine = NegotiationEngine::new(Box::new(FakeTransport::new()), DEFAULT_GATHERING_TIMEOUT);
        assert!(c.attach_negotiation(stale, engine).is_err());
    }

    #[test]
    fn test_end_is_idempotent() {
        let mut c = CallSessionController::new();
        assert!(c.end().is_none());
        c.start(bob(), "Bob".into(), CallKind::Voice);
        assert!(c.end().is_some());
        assert!(c.end().is_none());
        assert!(matches!(c.state(), CallState::Idle));
    }

    #[tokio::test]
    async fn test_mute_propagates_to_media() {
        let device = FakeDevice::new();
        let mut c = CallSessionController::new();
        let attempt = c.start(bob(), "Bob".into(), CallKind::Voice);
        c.set_muted(true);

        let media = MediaAcquisition::new(device.clone());
        let stream = media
            .acquire(CaptureProfile { audio: true, video: false })
            .await
            .unwrap()
            .unwrap();
        c.attach_media(attempt, media);
        assert!(!stream.tracks()[0].is_enabled());

        c.toggle_mute();
        assert!(!c.view().unwrap().muted);
        assert!(stream.tracks()[0].is_enabled());
    }

    #[test]
    fn test_idle_commands_are_noops() {
        let mut c = CallSessionController::new();
        c.minimize();
        c.toggle_mute();
        c.update_status(CallStatus::Ended);
        c.update_id("x");
        assert!(c.view().is_none());
    }

    #[test]
    fn test_outbound_launch_claimed_once() {
        let mut c = CallSessionController::new();
        let attempt = c.start(bob(), "Bob".into(), CallKind::Voice);
        assert_eq!(c.claim_outbound_launch(), Some(attempt));
        assert_eq!(c.claim_outbound_launch(), None);

        c.receive(bob(), "Bob".into(), CallKind::Voice, "c1".into());
        assert_eq!(c.claim_outbound_launch(), None);
    }

    #[test]
    fn test_minimize_restore() {
        let mut c = CallSessionController::new();
        c.start(bob(), "Bob".into(), CallKind::Voice);
        c.minimize();
        assert!(c.view().unwrap().minimized);
        c.restore();
        assert!(!c.view().unwrap().minimized);
    }
}
