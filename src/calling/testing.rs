//! Test doubles shared by the calling tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, Semaphore};

use super::ice::{self, IceCandidate};
use super::media::{CaptureDevice, CaptureProfile, MediaError, MediaStream, MediaTrack, TrackKind};
use super::negotiation::{
    GatherEvent, NegotiationError, PeerTransport, RemoteTrack, SdpType, TransportFactory,
};
use super::{CallKind, CallStatus, Identity};
use crate::store::{CallSession, CallSessionStore, MemorySessionStore, StoreError};

/// Capture device that hands out fresh tracks and records every stream.
pub struct FakeDevice {
    opens: AtomicUsize,
    failure: Option<MediaError>,
    gate: Option<Semaphore>,
    produced: Mutex<Vec<MediaStream>>,
}

impl FakeDevice {
    fn build(failure: Option<MediaError>, gate: Option<Semaphore>) -> Arc<Self> {
        Arc::new(Self {
            opens: AtomicUsize::new(0),
            failure,
            gate,
            produced: Mutex::new(Vec::new()),
        })
    }

    pub fn new() -> Arc<Self> {
        Self::build(None, None)
    }

    pub fn failing(error: MediaError) -> Arc<Self> {
        Self::build(Some(error), None)
    }

    /// Opens block until `release()`.
    pub fn gated() -> Arc<Self> {
        Self::build(None, Some(Semaphore::new(0)))
    }

    pub fn release(&self) {
        if let Some(ref gate) = self.gate {
            gate.add_permits(1024);
        }
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn produced(&self) -> Vec<MediaStream> {
        self.produced.lock().unwrap().clone()
    }
}

#[async_trait]
impl CaptureDevice for FakeDevice {
    async fn open(&self, profile: CaptureProfile) -> Result<MediaStream, MediaError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if let Some(ref gate) = self.gate {
            let _permit = gate.acquire().await;
        }
        if let Some(e) = self.failure {
            return Err(e);
        }
        let mut tracks = Vec::new();
        if profile.audio {
            tracks.push(MediaTrack::new(TrackKind::Audio, "fake mic"));
        }
        if profile.video {
            tracks.push(MediaTrack::new(TrackKind::Video, "fake camera"));
        }
        let stream = MediaStream::new(tracks);
        self.produced.lock().unwrap().push(stream.clone());
        Ok(stream)
    }
}

#[derive(Default)]
struct FakeTransportState {
    stall: bool,
    local_kinds: Vec<&'static str>,
    applied: Vec<(SdpType, String)>,
    closes: usize,
    /// Keeps a stalled gathering channel open.
    pending_gather: Option<mpsc::UnboundedSender<GatherEvent>>,
}

/// Transport speaking a toy description format: `"<offer|answer> <kinds..>
/// candidates=<n>"`. Clones share state so tests can inspect a transport
/// after handing it to an engine.
#[derive(Clone, Default)]
pub struct FakeTransport {
    state: Arc<Mutex<FakeTransportState>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Gathering reports one candidate and never completes.
    pub fn stalled() -> Self {
        let t = Self::default();
        t.state.lock().unwrap().stall = true;
        t
    }

    pub fn applied(&self) -> Vec<(SdpType, String)> {
        self.state.lock().unwrap().applied.clone()
    }

    pub fn closes(&self) -> usize {
        self.state.lock().unwrap().closes
    }

    fn candidate() -> IceCandidate {
        ice::parse_candidate("candidate:1 1 UDP 2130706431 127.0.0.1 40000 typ host").unwrap()
    }
}

impl PeerTransport for FakeTransport {
    fn add_track(&mut self, track: &MediaTrack) {
        let kind = match track.kind() {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
        };
        let mut state = self.state.lock().unwrap();
        if !state.local_kinds.contains(&kind) {
            state.local_kinds.push(kind);
        }
    }

    fn apply_remote(
        &mut self,
        sdp_type: SdpType,
        sdp: &str,
    ) -> Result<Vec<RemoteTrack>, NegotiationError> {
        let mut words = sdp.split_whitespace();
        let expected = match sdp_type {
            SdpType::Offer => "offer",
            SdpType::Answer => "answer",
        };
        if words.next() != Some(expected) {
            return Err(NegotiationError::InvalidDescription(format!(
                "expected {}, got {:?}",
                expected, sdp
            )));
        }
        let tracks = words
            .filter_map(|w| match w {
                "audio" => Some(TrackKind::Audio),
                "video" => Some(TrackKind::Video),
                _ => None,
            })
            .map(|kind| RemoteTrack {
                id: format!("remote-{:?}", kind).to_lowercase(),
                kind,
            })
            .collect();
        self.state
            .lock()
            .unwrap()
            .applied
            .push((sdp_type, sdp.to_string()));
        Ok(tracks)
    }

    fn start_gathering(&mut self) -> mpsc::UnboundedReceiver<GatherEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(GatherEvent::Candidate(Self::candidate()));
        let mut state = self.state.lock().unwrap();
        if state.stall {
            state.pending_gather = Some(tx);
        } else {
            let _ = tx.send(GatherEvent::Complete);
        }
        rx
    }

    fn render_local(
        &mut self,
        sdp_type: SdpType,
        candidates: &[IceCandidate],
    ) -> Result<String, NegotiationError> {
        let state = self.state.lock().unwrap();
        let prefix = match sdp_type {
            SdpType::Offer => "offer",
            SdpType::Answer => "answer",
        };
        let mut parts = vec![prefix.to_string()];
        parts.extend(state.local_kinds.iter().map(|k| k.to_string()));
        parts.push(format!("candidates={}", candidates.len()));
        Ok(parts.join(" "))
    }

    fn close(&mut self) {
        let mut state = self.state.lock().unwrap();
        state.closes += 1;
        state.pending_gather = None;
    }
}

/// Factory handing out `FakeTransport`s, or failing every creation.
#[derive(Default)]
pub struct FakeTransportFactory {
    fail: bool,
    created: Mutex<Vec<FakeTransport>>,
}

impl FakeTransportFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            fail: true,
            ..Self::default()
        })
    }

    pub fn created(&self) -> Vec<FakeTransport> {
        self.created.lock().unwrap().clone()
    }
}

#[async_trait]
impl TransportFactory for FakeTransportFactory {
    async fn create(&self) -> Result<Box<dyn PeerTransport>, NegotiationError> {
        if self.fail {
            return Err(NegotiationError::Transport("no network".into()));
        }
        let transport = FakeTransport::new();
        self.created.lock().unwrap().push(transport.clone());
        Ok(Box::new(transport))
    }
}

#[derive(Default)]
struct Faults {
    fetch_failures: usize,
    list_failures: usize,
    fail_create: bool,
    fail_status: HashSet<CallStatus>,
    fail_answer: bool,
    lose_sessions: bool,
}

/// `MemorySessionStore` with injectable failures and a log of status pushes.
pub struct FlakyStore {
    inner: MemorySessionStore,
    faults: Mutex<Faults>,
    pushes: Mutex<Vec<(String, CallStatus)>>,
    fetches: AtomicUsize,
}

impl FlakyStore {
    pub fn new(inner: MemorySessionStore) -> Arc<Self> {
        Arc::new(Self {
            inner,
            faults: Mutex::new(Faults::default()),
            pushes: Mutex::new(Vec::new()),
            fetches: AtomicUsize::new(0),
        })
    }

    /// Fail the next `n` session fetches.
    pub fn fail_fetches(&self, n: usize) {
        self.faults.lock().unwrap().fetch_failures = n;
    }

    /// Fail the next `n` inbound listings.
    pub fn fail_lists(&self, n: usize) {
        self.faults.lock().unwrap().list_failures = n;
    }

    pub fn fail_create(&self) {
        self.faults.lock().unwrap().fail_create = true;
    }

    pub fn fail_status(&self, status: CallStatus) {
        self.faults.lock().unwrap().fail_status.insert(status);
    }

    pub fn fail_answer(&self) {
        self.faults.lock().unwrap().fail_answer = true;
    }

    /// Session fetches report the id as unknown from now on.
    pub fn lose_sessions(&self) {
        self.faults.lock().unwrap().lose_sessions = true;
    }

    /// Every status submission that reached this client, failed or not.
    pub fn pushes(&self) -> Vec<(String, CallStatus)> {
        self.pushes.lock().unwrap().clone()
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    fn unavailable() -> StoreError {
        StoreError::Transport("store unavailable".into())
    }
}

#[async_trait]
impl CallSessionStore for FlakyStore {
    async fn create_call(
        &self,
        callee: &Identity,
        kind: CallKind,
        offer: &str,
    ) -> Result<CallSession, StoreError> {
        let fail = self.faults.lock().unwrap().fail_create;
        if fail {
            return Err(Self::unavailable());
        }
        self.inner.create_call(callee, kind, offer).await
    }

    async fn fetch_session(&self, id: &str) -> Result<Option<CallSession>, StoreError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        {
            let mut faults = self.faults.lock().unwrap();
            if faults.fetch_failures > 0 {
                faults.fetch_failures -= 1;
                return Err(Self::unavailable());
            }
            if faults.lose_sessions {
                return Ok(None);
            }
        }
        self.inner.fetch_session(id).await
    }

    async fn update_status(
        &self,
        id: &str,
        status: CallStatus,
    ) -> Result<CallSession, StoreError> {
        self.pushes.lock().unwrap().push((id.to_string(), status));
        let fail = self.faults.lock().unwrap().fail_status.contains(&status);
        if fail {
            return Err(Self::unavailable());
        }
        self.inner.update_status(id, status).await
    }

    async fn submit_answer(&self, id: &str, answer: &str) -> Result<CallSession, StoreError> {
        let fail = self.faults.lock().unwrap().fail_answer;
        if fail {
            return Err(Self::unavailable());
        }
        self.inner.submit_answer(id, answer).await
    }

    async fn list_pending_inbound(
        &self,
        callee: &Identity,
    ) -> Result<Vec<CallSession>, StoreError> {
        {
            let mut faults = self.faults.lock().unwrap();
            if faults.list_failures > 0 {
                faults.list_failures -= 1;
                return Err(Self::unavailable());
            }
        }
        self.inner.list_pending_inbound(callee).await
    }

    async fn display_name(&self, who: &Identity) -> Result<Option<String>, StoreError> {
        self.inner.display_name(who).await
    }
}
