//! The call engine's event loop.
//!
//! User commands, poller events and setup results all arrive on one loop
//! and are handled synchronously. Network and device steps run in spawned
//! tasks that report back through the loop's own channel, so a command is
//! reflected in the published `CallView` without waiting on the network.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::controller::CallSessionController;
use super::media::{CaptureDevice, MediaAcquisition, MediaError};
use super::negotiation::{
    NegotiationEngine, NegotiationError, NegotiationState, RemoteStream, TransportFactory,
};
use super::poller::{SignalingEvent, SignalingPoller};
use super::watcher::{InboundCall, InboundEvent, IncomingCallWatcher};
use super::{CallError, CallKind, CallSettings, CallStatus, Direction, Identity};
use crate::store::{CallSession, CallSessionStore, StoreError};

const SIGNALING_FETCH_ERROR: &str = "Failed to fetch call session";
const INBOUND_FETCH_ERROR: &str = "Failed to check for incoming calls";

/// Commands accepted from the user side.
#[derive(Debug, Clone)]
enum UserCommand {
    Start {
        peer: Identity,
        peer_name: Option<String>,
        kind: CallKind,
    },
    Accept(String),
    Decline(String),
    End,
    Minimize,
    Restore,
    ToggleMute,
    SetMuted(bool),
    Shutdown,
}

/// Observable state of the call engine.
#[derive(Debug, Clone, Default)]
pub struct CallView {
    pub has_active_call: bool,
    pub call_id: Option<String>,
    pub peer: Option<Identity>,
    pub peer_name: Option<String>,
    pub kind: Option<CallKind>,
    pub status: Option<CallStatus>,
    pub direction: Option<Direction>,
    pub minimized: bool,
    pub muted: bool,
    pub remote_media: Option<RemoteStream>,
    /// Terminal failure of the current attempt (media, negotiation, registration).
    pub diagnostic_error: Option<String>,
    /// Non-fatal signaling trouble for the active call.
    pub signaling_error: Option<String>,
    /// Non-fatal trouble listing incoming calls.
    pub inbound_error: Option<String>,
    /// Why the last accept of an incoming call failed.
    pub accept_error: Option<String>,
    /// The displayed incoming call prompt.
    pub incoming: Option<InboundCall>,
    /// Incoming calls waiting behind the displayed prompt.
    pub queued_incoming: usize,
    /// An accept of the displayed prompt is in flight.
    pub accepting: bool,
}

/// Results of spawned setup work.
enum SetupOutcome {
    OutboundReady {
        attempt: u64,
        engine: NegotiationEngine,
        media: MediaAcquisition,
        session: CallSession,
        ringing: Result<CallSession, StoreError>,
    },
    OutboundFailed {
        attempt: u64,
        error: CallError,
    },
    InboundReady {
        token: u64,
        inbound: InboundCall,
        engine: NegotiationEngine,
        media: MediaAcquisition,
    },
    InboundFailed {
        token: u64,
        call_id: String,
        error: CallError,
    },
}

enum Event {
    Signaling(SignalingEvent),
    Inbound(InboundEvent),
    Setup(SetupOutcome),
    RemoteMedia { attempt: u64, stream: RemoteStream },
}

impl From<SignalingEvent> for Event {
    fn from(e: SignalingEvent) -> Self {
        Event::Signaling(e)
    }
}

impl From<InboundEvent> for Event {
    fn from(e: InboundEvent) -> Self {
        Event::Inbound(e)
    }
}

/// Cloneable front end of a running orchestrator.
///
/// The loop stops when every handle is dropped or on `shutdown()`.
#[derive(Clone)]
pub struct CallHandle {
    commands: mpsc::UnboundedSender<UserCommand>,
    view: watch::Receiver<CallView>,
}

impl CallHandle {
    fn send(&self, command: UserCommand) {
        if self.commands.send(command).is_err() {
            tracing::debug!("Call engine is no longer running");
        }
    }

    /// Place an outgoing call. Any active call is ended first.
    pub fn start(&self, peer: Identity, peer_name: Option<String>, kind: CallKind) {
        self.send(UserCommand::Start {
            peer,
            peer_name,
            kind,
        });
    }

    /// Accept the displayed incoming call.
    pub fn accept(&self, call_id: &str) {
        self.send(UserCommand::Accept(call_id.to_string()));
    }

    pub fn decline(&self, call_id: &str) {
        self.send(UserCommand::Decline(call_id.to_string()));
    }

    pub fn end(&self) {
        self.send(UserCommand::End);
    }

    pub fn minimize(&self) {
        self.send(UserCommand::Minimize);
    }

    pub fn restore(&self) {
        self.send(UserCommand::Restore);
    }

    pub fn toggle_mute(&self) {
        self.send(UserCommand::ToggleMute);
    }

    pub fn set_muted(&self, muted: bool) {
        self.send(UserCommand::SetMuted(muted));
    }

    pub fn shutdown(&self) {
        self.send(UserCommand::Shutdown);
    }

    /// Snapshot of the current view.
    pub fn state(&self) -> CallView {
        self.view.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<CallView> {
        self.view.clone()
    }

    /// Wait until the view satisfies `pred`. Returns the last view if the
    /// engine stops first.
    pub async fn wait_for(&self, pred: impl Fn(&CallView) -> bool) -> CallView {
        let mut rx = self.view.clone();
        loop {
            {
                let view = rx.borrow_and_update();
                if pred(&view) {
                    return view.clone();
                }
            }
            if rx.changed().await.is_err() {
                return rx.borrow().clone();
            }
        }
    }
}

/// Accept in flight for the displayed prompt.
struct PendingAccept {
    token: u64,
    call_id: String,
}

/// Event loop state. Constructed through `spawn`.
pub struct CallOrchestrator {
    store: Arc<dyn CallSessionStore>,
    device: Arc<dyn CaptureDevice>,
    transports: Arc<dyn TransportFactory>,
    settings: CallSettings,
    controller: CallSessionController,
    events: mpsc::UnboundedSender<Event>,
    view: watch::Sender<CallView>,
    incoming: Option<InboundCall>,
    queue: VecDeque<InboundCall>,
    accepting: Option<PendingAccept>,
    next_token: u64,
    remote_media: Option<RemoteStream>,
    diagnostic_error: Option<String>,
    signaling_error: Option<String>,
    inbound_error: Option<String>,
    accept_error: Option<String>,
    watcher: Option<IncomingCallWatcher>,
}

impl CallOrchestrator {
    /// Start the engine for `identity`. Returns the first handle and the
    /// loop task, which finishes after `shutdown()`.
    pub fn spawn(
        identity: Identity,
        store: Arc<dyn CallSessionStore>,
        device: Arc<dyn CaptureDevice>,
        transports: Arc<dyn TransportFactory>,
        settings: CallSettings,
    ) -> (CallHandle, JoinHandle<()>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (view_tx, view_rx) = watch::channel(CallView::default());

        let watcher = IncomingCallWatcher::spawn(
            store.clone(),
            identity.clone(),
            settings.incoming_poll_interval,
            settings.fetch_retry_limit,
            event_tx.clone(),
        );
        tracing::info!("Call engine started for {}", identity);

        let orchestrator = Self {
            store,
            device,
            transports,
            settings,
            controller: CallSessionController::new(),
            events: event_tx,
            view: view_tx,
            incoming: None,
            queue: VecDeque::new(),
            accepting: None,
            next_token: 1,
            remote_media: None,
            diagnostic_error: None,
            signaling_error: None,
            inbound_error: None,
            accept_error: None,
            watcher: Some(watcher),
        };
        let task = tokio::spawn(orchestrator.run(command_rx, event_rx));
        (
            CallHandle {
                commands: command_tx,
                view: view_rx,
            },
            task,
        )
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<UserCommand>,
        mut events: mpsc::UnboundedReceiver<Event>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(UserCommand::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                Some(event) = events.recv() => self.handle_event(event),
            }
            self.publish();
        }
        self.stop();
        self.publish();
        tracing::info!("Call engine stopped");
    }

    fn stop(&mut self) {
        self.watcher = None;
        self.end_local();
        self.incoming = None;
        self.queue.clear();
        self.accepting = None;
    }

    fn publish(&self) {
        let mut view = CallView {
            remote_media: self.remote_media.clone(),
            diagnostic_error: self.diagnostic_error.clone(),
            signaling_error: self.signaling_error.clone(),
            inbound_error: self.inbound_error.clone(),
            accept_error: self.accept_error.clone(),
            incoming: self.incoming.clone(),
            queued_incoming: self.queue.len(),
            accepting: self.accepting.is_some(),
            ..CallView::default()
        };
        if let Some(local) = self.controller.view() {
            view.has_active_call = true;
            view.call_id = local.has_id().then(|| local.id.clone());
            view.peer = Some(local.peer.clone());
            view.peer_name = Some(local.peer_name.clone());
            view.kind = Some(local.kind);
            view.status = Some(local.status);
            view.direction = Some(local.direction);
            view.minimized = local.minimized;
            view.muted = local.muted;
        }
        self.view.send_replace(view);
    }

    fn handle_command(&mut self, command: UserCommand) {
        match command {
            UserCommand::Start {
                peer,
                peer_name,
                kind,
            } => self.start_outbound(peer, peer_name, kind),
            UserCommand::Accept(call_id) => self.accept(call_id),
            UserCommand::Decline(call_id) => self.decline(call_id),
            UserCommand::End => self.end_local(),
            UserCommand::Minimize => self.controller.minimize(),
            UserCommand::Restore => self.controller.restore(),
            UserCommand::ToggleMute => self.controller.toggle_mute(),
            UserCommand::SetMuted(muted) => self.controller.set_muted(muted),
            UserCommand::Shutdown => {}
        }
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Signaling(event) => self.on_signaling(event),
            Event::Inbound(event) => self.on_inbound(event),
            Event::Setup(outcome) => self.on_setup(outcome),
            Event::RemoteMedia { attempt, stream } => {
                if self.controller.is_current(attempt) {
                    tracing::info!("Remote media available ({} tracks)", stream.tracks().len());
                    self.remote_media = Some(stream);
                }
            }
        }
    }

    // --- local call lifecycle ---

    /// End the active call locally and tell the store, best effort.
    fn end_local(&mut self) {
        if let Some(view) = self.controller.end() {
            if view.has_id() && !view.status.is_terminal() {
                self.push_status(view.id, CallStatus::Ended);
            }
        }
        self.clear_call_state();
    }

    /// End the active call because the remote side did.
    fn end_remote(&mut self, reason: &str) {
        if let Some(view) = self.controller.end() {
            tracing::info!("Call with {} ended remotely ({})", view.peer, reason);
        }
        self.clear_call_state();
    }

    fn clear_call_state(&mut self) {
        self.remote_media = None;
        self.signaling_error = None;
        self.diagnostic_error = None;
    }

    fn push_status(&self, call_id: String, status: CallStatus) {
        let store = self.store.clone();
        tokio::spawn(async move {
            if let Err(e) = store.update_status(&call_id, status).await {
                tracing::warn!("Could not mark call {} as {}: {}", call_id, status, e);
            }
        });
    }

    fn start_outbound(&mut self, peer: Identity, peer_name: Option<String>, kind: CallKind) {
        self.end_local();
        self.accept_error = None;
        let peer_name = peer_name.unwrap_or_else(|| peer.short().to_string());
        self.controller.start(peer.clone(), peer_name, kind);

        let attempt = match self.controller.claim_outbound_launch() {
            Some(attempt) => attempt,
            None => return,
        };
        let store = self.store.clone();
        let device = self.device.clone();
        let transports = self.transports.clone();
        let gathering_timeout = self.settings.gathering_timeout;
        let events = self.events.clone();
        tokio::spawn(async move {
            let media = MediaAcquisition::new(device);
            let outcome = match outbound_setup(
                store.as_ref(),
                transports.as_ref(),
                &media,
                gathering_timeout,
                &events,
                attempt,
                &peer,
                kind,
            )
            .await
            {
                Ok((engine, session, ringing)) => SetupOutcome::OutboundReady {
                    attempt,
                    engine,
                    media,
                    session,
                    ringing,
                },
                Err(error) => {
                    tracing::warn!("Outgoing call to {} failed: {}", peer, error);
                    media.cleanup();
                    SetupOutcome::OutboundFailed { attempt, error }
                }
            };
            let _ = events.send(Event::Setup(outcome));
        });
    }

    fn on_setup(&mut self, outcome: SetupOutcome) {
        match outcome {
            SetupOutcome::OutboundReady {
                attempt,
                engine,
                media,
                session,
                ringing,
            } => {
                if !self.controller.is_current(attempt) {
                    tracing::info!("Call {} was abandoned during setup", session.id);
                    drop(engine);
                    media.cleanup();
                    self.push_status(session.id, CallStatus::Ended);
                    return;
                }
                self.controller.update_id(&session.id);
                match ringing {
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!("Failed to mark call {} as ringing: {}", session.id, e);
                        self.signaling_error = Some(format!("Failed to update call status: {}", e));
                    }
                }
                self.controller.update_status(CallStatus::Ringing);
                self.controller.attach_media(attempt, media);
                if let Err(mut engine) = self.controller.attach_negotiation(attempt, engine) {
                    engine.close();
                }
                self.attach_poller(attempt, session.id);
            }
            SetupOutcome::OutboundFailed { attempt, error } => {
                if self.controller.is_current(attempt) {
                    self.diagnostic_error = Some(error.to_string());
                }
            }
            SetupOutcome::InboundReady {
                token,
                inbound,
                mut engine,
                media,
            } => {
                let id = inbound.session.id.clone();
                if !self.take_accept(token) {
                    tracing::info!("Accept of call {} is stale; releasing", id);
                    engine.close();
                    media.cleanup();
                    self.push_status(id, CallStatus::Ended);
                    return;
                }
                self.dismiss(&id);
                self.end_local();
                let session = inbound.session;
                let attempt = self.controller.receive(
                    session.caller.clone(),
                    inbound.caller_name,
                    session.kind,
                    id.clone(),
                );
                self.controller.update_status(CallStatus::InProgress);
                self.remote_media = engine.remote_stream();
                self.controller.attach_media(attempt, media);
                if let Err(mut engine) = self.controller.attach_negotiation(attempt, engine) {
                    engine.close();
                }
                self.attach_poller(attempt, id);
            }
            SetupOutcome::InboundFailed {
                token,
                call_id,
                error,
            } => {
                if !self.take_accept(token) {
                    return;
                }
                tracing::warn!("Accepting call {} failed: {}", call_id, error);
                self.accept_error = Some(error.to_string());
                self.dismiss(&call_id);
                self.push_status(call_id, CallStatus::Ended);
            }
        }
    }

    fn attach_poller(&mut self, attempt: u64, call_id: String) {
        let poller = SignalingPoller::spawn(
            self.store.clone(),
            call_id,
            self.settings.poll_interval,
            self.settings.fetch_retry_limit,
            self.events.clone(),
        );
        self.controller.attach_poller(attempt, poller);
    }

    // --- remote truth ---

    fn on_signaling(&mut self, event: SignalingEvent) {
        if self.controller.call_id() != Some(event.call_id()) {
            tracing::debug!("Dropping event for inactive call {}", event.call_id());
            return;
        }
        match event {
            SignalingEvent::StatusChanged { status, .. } => self.on_remote_status(status),
            SignalingEvent::AnswerAvailable { answer, .. } => self.on_answer(&answer),
            SignalingEvent::OfferAvailable { .. } => {}
            SignalingEvent::FetchFailing { error, .. } => {
                tracing::warn!("{}: {}", SIGNALING_FETCH_ERROR, error);
                self.signaling_error = Some(SIGNALING_FETCH_ERROR.to_string());
            }
            SignalingEvent::FetchRecovered { .. } => self.signaling_error = None,
            SignalingEvent::SessionMissing { .. } => self.end_remote("session missing"),
        }
    }

    fn on_remote_status(&mut self, status: CallStatus) {
        if status.is_terminal() {
            self.end_remote(status.label());
            return;
        }
        let (local, direction) = match self.controller.view() {
            Some(view) => (view.status, view.direction),
            None => return,
        };
        if !status.is_ahead_of(local) {
            return;
        }
        // An outgoing call is in progress only once the answer is applied.
        if status == CallStatus::InProgress && direction == Direction::Outgoing {
            return;
        }
        self.controller.update_status(status);
    }

    fn on_answer(&mut self, answer: &str) {
        let engine = match self.controller.negotiation_mut() {
            Some(engine) if engine.state() == NegotiationState::HaveLocalOffer => engine,
            _ => return,
        };
        match engine.set_remote_answer(answer) {
            Ok(true) => self.controller.update_status(CallStatus::InProgress),
            Ok(false) => {}
            Err(e) => {
                tracing::warn!("Remote answer rejected: {}", e);
                self.diagnostic_error = Some(CallError::from(e).to_string());
            }
        }
    }

    // --- incoming prompts ---

    fn on_inbound(&mut self, event: InboundEvent) {
        match event {
            InboundEvent::NewInbound(call) => {
                if self.incoming.is_none() {
                    self.incoming = Some(call);
                } else {
                    self.queue.push_back(call);
                }
            }
            InboundEvent::InboundClosed { call_id } => {
                if self.accepting.as_ref().map(|a| a.call_id == call_id) == Some(true) {
                    self.accepting = None;
                }
                self.dismiss(&call_id);
            }
            InboundEvent::FetchFailing(error) => {
                tracing::warn!("{}: {}", INBOUND_FETCH_ERROR, error);
                self.inbound_error = Some(INBOUND_FETCH_ERROR.to_string());
            }
            InboundEvent::FetchRecovered => self.inbound_error = None,
        }
    }

    /// Remove a prompt (displayed or queued) and promote the next one.
    fn dismiss(&mut self, call_id: &str) {
        self.queue.retain(|c| c.id() != call_id);
        if self.incoming.as_ref().map(|c| c.id() == call_id) == Some(true) {
            self.incoming = self.queue.pop_front();
        }
    }

    fn take_accept(&mut self, token: u64) -> bool {
        match self.accepting {
            Some(ref pending) if pending.token == token => {
                self.accepting = None;
                true
            }
            _ => false,
        }
    }

    fn accept(&mut self, call_id: String) {
        let inbound = match self.incoming {
            Some(ref call) if call.id() == call_id => call.clone(),
            _ => {
                tracing::debug!("No displayed incoming call {}", call_id);
                return;
            }
        };
        if self.accepting.is_some() {
            return;
        }
        let token = self.next_token;
        self.next_token += 1;
        self.accepting = Some(PendingAccept {
            token,
            call_id: call_id.clone(),
        });
        self.accept_error = None;
        tracing::info!("Accepting call {} from {}", call_id, inbound.caller_name);

        let store = self.store.clone();
        let device = self.device.clone();
        let transports = self.transports.clone();
        let gathering_timeout = self.settings.gathering_timeout;
        let events = self.events.clone();
        tokio::spawn(async move {
            let media = MediaAcquisition::new(device);
            let outcome = match inbound_setup(
                store.as_ref(),
                transports.as_ref(),
                &media,
                gathering_timeout,
                &inbound.session,
            )
            .await
            {
                Ok(engine) => SetupOutcome::InboundReady {
                    token,
                    inbound,
                    engine,
                    media,
                },
                Err(error) => {
                    media.cleanup();
                    SetupOutcome::InboundFailed {
                        token,
                        call_id,
                        error,
                    }
                }
            };
            let _ = events.send(Event::Setup(outcome));
        });
    }

    fn decline(&mut self, call_id: String) {
        if self.accepting.as_ref().map(|a| a.call_id == call_id) == Some(true) {
            self.accepting = None;
        }
        tracing::info!("Declining call {}", call_id);
        self.dismiss(&call_id);
        // A call whose ringing update never landed is still initiated and
        // cannot become missed; end it instead.
        let store = self.store.clone();
        tokio::spawn(async move {
            let result = match store.update_status(&call_id, CallStatus::Missed).await {
                Err(StoreError::InvalidTransition { from, .. }) if !from.is_terminal() => {
                    tracing::info!("Call {} is still {}; ending it instead", call_id, from);
                    store.update_status(&call_id, CallStatus::Ended).await
                }
                result => result,
            };
            if let Err(e) = result {
                tracing::warn!("Could not decline call {}: {}", call_id, e);
            }
        });
    }
}

#[allow(clippy::too_many_arguments)]
async fn outbound_setup(
    store: &dyn CallSessionStore,
    transports: &dyn TransportFactory,
    media: &MediaAcquisition,
    gathering_timeout: std::time::Duration,
    events: &mpsc::UnboundedSender<Event>,
    attempt: u64,
    peer: &Identity,
    kind: CallKind,
) -> Result<(NegotiationEngine, CallSession, Result<CallSession, StoreError>), CallError> {
    let stream = media
        .acquire(kind.capture_profile())
        .await?
        .ok_or(MediaError::Other)?;

    let mut engine = NegotiationEngine::new(transports.create().await?, gathering_timeout);
    let remote_events = events.clone();
    engine.on_remote_stream(move |stream| {
        let _ = remote_events.send(Event::RemoteMedia { attempt, stream });
    });
    engine.add_stream(&stream)?;
    let offer = engine.create_offer().await?;

    let session = store.create_call(peer, kind, &offer).await?;
    tracing::info!("Call {} registered with {}", session.id, peer);
    let ringing = store.update_status(&session.id, CallStatus::Ringing).await;
    Ok((engine, session, ringing))
}

async fn inbound_setup(
    store: &dyn CallSessionStore,
    transports: &dyn TransportFactory,
    media: &MediaAcquisition,
    gathering_timeout: std::time::Duration,
    session: &CallSession,
) -> Result<NegotiationEngine, CallError> {
    let mut engine = NegotiationEngine::new(transports.create().await?, gathering_timeout);
    let stream = media
        .acquire(session.kind.capture_profile())
        .await?
        .ok_or(MediaError::Other)?;
    engine.add_stream(&stream)?;

    let offer = session.offer.as_deref().ok_or_else(|| {
        NegotiationError::InvalidDescription(format!("call {} carries no offer", session.id))
    })?;
    let answer = engine.create_answer(offer).await?;
    store.submit_answer(&session.id, &answer).await?;
    store
        .update_status(&session.id, CallStatus::InProgress)
        .await?;
    tracing::info!("Answered call {}", session.id);
    Ok(engine)
}
