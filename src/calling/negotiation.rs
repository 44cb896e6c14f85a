//! Offer/answer negotiation over a `PeerTransport`.
//!
//! The engine tracks the negotiation state, bounds address gathering, and
//! merges inbound tracks into one shared `RemoteStream`.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use super::ice::IceCandidate;
use super::media::{MediaStream, MediaTrack, TrackKind};

/// Default upper bound on address gathering.
pub const DEFAULT_GATHERING_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NegotiationError {
    #[error("invalid session description: {0}")]
    InvalidDescription(String),

    #[error("cannot {operation} in state {state:?}")]
    InvalidState {
        operation: &'static str,
        state: NegotiationState,
    },

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("negotiation handle is closed")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpType {
    Offer,
    Answer,
}

/// Address gathering progress reported by a transport.
#[derive(Debug, Clone, PartialEq)]
pub enum GatherEvent {
    Candidate(IceCandidate),
    Complete,
}

/// A track the remote side announced it will send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: TrackKind,
}

/// Shared handle to every inbound track of a call.
#[derive(Debug, Clone)]
pub struct RemoteStream {
    id: String,
    tracks: Arc<Mutex<Vec<RemoteTrack>>>,
}

impl RemoteStream {
    fn new() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tracks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> Vec<RemoteTrack> {
        self.tracks.lock().map(|t| t.clone()).unwrap_or_default()
    }

    pub fn has_video(&self) -> bool {
        self.tracks().iter().any(|t| t.kind == TrackKind::Video)
    }

    fn merge(&self, incoming: Vec<RemoteTrack>) {
        if let Ok(mut tracks) = self.tracks.lock() {
            for track in incoming {
                if !tracks.iter().any(|t| t.id == track.id) {
                    tracks.push(track);
                }
            }
        }
    }
}

/// Peer connection primitive the engine drives.
pub trait PeerTransport: Send {
    fn add_track(&mut self, track: &MediaTrack);

    /// Apply a remote description, returning the tracks it announces.
    fn apply_remote(
        &mut self,
        sdp_type: SdpType,
        sdp: &str,
    ) -> Result<Vec<RemoteTrack>, NegotiationError>;

    /// Start gathering local addresses. Events arrive until `Complete` or
    /// until the receiver is dropped.
    fn start_gathering(&mut self) -> mpsc::UnboundedReceiver<GatherEvent>;

    /// Render the local description of `sdp_type` carrying `candidates`.
    fn render_local(
        &mut self,
        sdp_type: SdpType,
        candidates: &[IceCandidate],
    ) -> Result<String, NegotiationError>;

    fn close(&mut self);
}

/// Creates one transport per negotiation.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(&self) -> Result<Box<dyn PeerTransport>, NegotiationError>;
}

type RemoteStreamHandler = Box<dyn FnOnce(RemoteStream) + Send>;

/// Negotiation handle for one call attempt.
pub struct NegotiationEngine {
    transport: Box<dyn PeerTransport>,
    state: NegotiationState,
    gathering_timeout: Duration,
    /// Candidates from the first (and only) gathering round.
    candidates: Option<Vec<IceCandidate>>,
    remote_stream: Option<RemoteStream>,
    on_remote_stream: Option<RemoteStreamHandler>,
}

impl std::fmt::Debug for NegotiationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NegotiationEngine")
            .field("state", &self.state)
            .field("remote_stream", &self.remote_stream)
            .finish()
    }
}

impl NegotiationEngine {
    pub fn new(transport: Box<dyn PeerTransport>, gathering_timeout: Duration) -> Self {
        Self {
            transport,
            state: NegotiationState::Stable,
            gathering_timeout,
            candidates: None,
            remote_stream: None,
            on_remote_stream: None,
        }
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == NegotiationState::Closed
    }

    pub fn remote_stream(&self) -> Option<RemoteStream> {
        self.remote_stream.clone()
    }

    /// Register the handler fired once, when the first inbound track arrives.
    pub fn on_remote_stream(&mut self, handler: impl FnOnce(RemoteStream) + Send + 'static) {
        self.on_remote_stream = Some(Box::new(handler));
    }

    /// Attach every track of the local stream.
    pub fn add_stream(&mut self, stream: &MediaStream) -> Result<(), NegotiationError> {
        self.ensure_open()?;
        for track in stream.tracks() {
            self.transport.add_track(track);
        }
        Ok(())
    }

    /// Produce the local offer, bounded by the gathering timeout.
    pub async fn create_offer(&mut self) -> Result<String, NegotiationError> {
        self.ensure_open()?;
        if self.state != NegotiationState::Stable {
            return Err(NegotiationError::InvalidState {
                operation: "create an offer",
                state: self.state,
            });
        }
        self.state = NegotiationState::HaveLocalOffer;
        let candidates = self.gather().await;
        self.ensure_open()?;
        let offer = self.transport.render_local(SdpType::Offer, &candidates)?;
        tracing::debug!("Created offer with {} candidates", candidates.len());
        Ok(offer)
    }

    /// Apply a remote offer and produce the answer.
    pub async fn create_answer(&mut self, offer: &str) -> Result<String, NegotiationError> {
        self.ensure_open()?;
        if self.state != NegotiationState::Stable {
            return Err(NegotiationError::InvalidState {
                operation: "create an answer",
                state: self.state,
            });
        }
        let tracks = self.transport.apply_remote(SdpType::Offer, offer)?;
        self.state = NegotiationState::HaveRemoteOffer;
        self.deliver_remote_tracks(tracks);

        let candidates = self.gather().await;
        self.ensure_open()?;
        let answer = self.transport.render_local(SdpType::Answer, &candidates)?;
        self.state = NegotiationState::Stable;
        tracing::debug!("Created answer with {} candidates", candidates.len());
        Ok(answer)
    }

    /// Apply the remote answer to our offer.
    ///
    /// Only applies in `HaveLocalOffer`; anything else (a duplicate answer,
    /// no outstanding offer) is a logged no-op returning `Ok(false)`.
    pub fn set_remote_answer(&mut self, answer: &str) -> Result<bool, NegotiationError> {
        if self.state != NegotiationState::HaveLocalOffer {
            tracing::debug!(
                "Ignoring remote answer in state {:?}",
                self.state
            );
            return Ok(false);
        }
        let tracks = self.transport.apply_remote(SdpType::Answer, answer)?;
        self.state = NegotiationState::Stable;
        self.deliver_remote_tracks(tracks);
        tracing::info!("Remote answer applied");
        Ok(true)
    }

    /// Close the transport. Idempotent.
    pub fn close(&mut self) {
        if self.state == NegotiationState::Closed {
            return;
        }
        self.state = NegotiationState::Closed;
        self.on_remote_stream = None;
        self.transport.close();
        tracing::debug!("Negotiation handle closed");
    }

    fn ensure_open(&self) -> Result<(), NegotiationError> {
        if self.state == NegotiationState::Closed {
            return Err(NegotiationError::Closed);
        }
        Ok(())
    }

    fn deliver_remote_tracks(&mut self, tracks: Vec<RemoteTrack>) {
        if tracks.is_empty() {
            return;
        }
        match self.remote_stream {
            Some(ref stream) => stream.merge(tracks),
            None => {
                let stream = RemoteStream::new();
                stream.merge(tracks);
                self.remote_stream = Some(stream.clone());
                if let Some(handler) = self.on_remote_stream.take() {
                    handler(stream);
                }
            }
        }
    }

    /// Collect candidates until gathering completes or the bound elapses.
    async fn gather(&mut self) -> Vec<IceCandidate> {
        if let Some(ref candidates) = self.candidates {
            return candidates.clone();
        }
        let mut rx = self.transport.start_gathering();
        let mut gathered = Vec::new();
        let deadline = tokio::time::sleep(self.gathering_timeout);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Some(GatherEvent::Candidate(c)) => gathered.push(c),
                    Some(GatherEvent::Complete) | None => break,
                },
                _ = &mut deadline => {
                    tracing::warn!(
                        "Address gathering exceeded {:?}; continuing with {} candidates",
                        self.gathering_timeout,
                        gathered.len()
                    );
                    break;
                }
            }
        }
        self.candidates = Some(gathered.clone());
        gathered
    }
}

impl Drop for NegotiationEngine {
    fn drop(&mut self) {
        self.close();
    }
}
