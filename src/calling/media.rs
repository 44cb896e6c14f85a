//! Local media acquisition: capture streams, track control and cleanup.
//!
//! A `MediaAcquisition` is scoped to one call attempt. It owns the capture
//! stream it acquired until `cleanup()`, and discards any acquisition that
//! resolves after it was superseded or cleaned up.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use thiserror::Error;

/// Which capture capabilities a call needs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureProfile {
    pub audio: bool,
    pub video: bool,
}

impl CaptureProfile {
    pub fn is_empty(&self) -> bool {
        !self.audio && !self.video
    }
}

/// Classified media failure. Each class carries exactly one user-facing message.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum MediaError {
    #[error("Permission denied. Please allow access to your camera and microphone.")]
    PermissionDenied,
    #[error("No camera or microphone found. Please connect a device and try again.")]
    NoDevice,
    #[error("Could not access media device. It may be in use by another application.")]
    DeviceBusy,
    #[error("Media capture is not supported on this system.")]
    Unsupported,
    #[error("Could not satisfy media constraints. Please try again.")]
    ConstraintsUnsatisfiable,
    #[error("Media acquisition was aborted.")]
    Aborted,
    #[error("Failed to access media devices.")]
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

type StopHook = Box<dyn FnOnce() + Send>;

struct TrackInner {
    id: String,
    kind: TrackKind,
    label: String,
    enabled: AtomicBool,
    stopped: AtomicBool,
    on_stop: Mutex<Option<StopHook>>,
}

/// Handle to one captured track. Clones share the same underlying track.
#[derive(Clone)]
pub struct MediaTrack {
    inner: Arc<TrackInner>,
}

impl std::fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("enabled", &self.is_enabled())
            .field("live", &self.is_live())
            .finish()
    }
}

impl MediaTrack {
    pub fn new(kind: TrackKind, label: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(TrackInner {
                id: uuid::Uuid::new_v4().to_string(),
                kind,
                label: label.into(),
                enabled: AtomicBool::new(true),
                stopped: AtomicBool::new(false),
                on_stop: Mutex::new(None),
            }),
        }
    }

    /// Track whose `stop()` also runs `hook` (e.g. releasing a device thread).
    pub fn with_stop_hook(
        kind: TrackKind,
        label: impl Into<String>,
        hook: impl FnOnce() + Send + 'static,
    ) -> Self {
        let track = Self::new(kind, label);
        if let Ok(mut slot) = track.inner.on_stop.lock() {
            *slot = Some(Box::new(hook));
        }
        track
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> TrackKind {
        self.inner.kind
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_live(&self) -> bool {
        !self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Stop the track. Idempotent.
    pub fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let hook = self.inner.on_stop.lock().ok().and_then(|mut slot| slot.take());
        if let Some(hook) = hook {
            hook();
        }
        tracing::debug!("Stopped {:?} track {}", self.inner.kind, self.inner.id);
    }
}

/// A set of tracks acquired together.
#[derive(Debug, Clone)]
pub struct MediaStream {
    id: String,
    tracks: Vec<MediaTrack>,
}

impl MediaStream {
    pub fn new(tracks: Vec<MediaTrack>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tracks,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[MediaTrack] {
        &self.tracks
    }

    pub fn audio_tracks(&self) -> impl Iterator<Item = &MediaTrack> {
        self.tracks.iter().filter(|t| t.kind() == TrackKind::Audio)
    }

    pub fn has_video(&self) -> bool {
        self.tracks.iter().any(|t| t.kind() == TrackKind::Video)
    }

    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

/// Source of capture streams. Implementations classify their own failures.
#[async_trait]
pub trait CaptureDevice: Send + Sync {
    async fn open(&self, profile: CaptureProfile) -> Result<MediaStream, MediaError>;
}

struct AcquisitionState {
    profile: CaptureProfile,
    stream: Option<MediaStream>,
    /// Bumped on every new acquisition and on cleanup; results carrying an
    /// older generation are discarded.
    generation: u64,
    acquiring: bool,
    audio_enabled: bool,
    error: Option<MediaError>,
}

impl Drop for AcquisitionState {
    fn drop(&mut self) {
        if let Some(stream) = self.stream.take() {
            stream.stop_all();
        }
    }
}

/// Acquires and releases the local capture stream for one call attempt.
#[derive(Clone)]
pub struct MediaAcquisition {
    device: Arc<dyn CaptureDevice>,
    state: Arc<Mutex<AcquisitionState>>,
}

impl MediaAcquisition {
    pub fn new(device: Arc<dyn CaptureDevice>) -> Self {
        Self {
            device,
            state: Arc::new(Mutex::new(AcquisitionState {
                profile: CaptureProfile::default(),
                stream: None,
                generation: 0,
                acquiring: false,
                audio_enabled: true,
                error: None,
            })),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, AcquisitionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Acquire a stream for `profile`.
    ///
    /// Returns `Ok(None)` when nothing is requested. Asking again for the
    /// profile already held returns the held stream without reacquiring.
    pub async fn acquire(&self, profile: CaptureProfile) -> Result<Option<MediaStream>, MediaError> {
        let generation = {
            let mut state = self.lock();
            if profile.is_empty() {
                if let Some(stream) = state.stream.take() {
                    stream.stop_all();
                }
                state.profile = profile;
                state.generation += 1;
                state.acquiring = false;
                state.error = None;
                return Ok(None);
            }
            if state.profile == profile {
                if let Some(ref stream) = state.stream {
                    return Ok(Some(stream.clone()));
                }
            }
            if let Some(stream) = state.stream.take() {
                tracing::debug!("Capture profile changed, releasing stream {}", stream.id());
                stream.stop_all();
            }
            state.profile = profile;
            state.generation += 1;
            state.acquiring = true;
            state.error = None;
            state.generation
        };

        let result = self.device.open(profile).await;

        let mut state = self.lock();
        if state.generation != generation {
            if let Ok(stream) = result {
                tracing::debug!("Discarding late capture stream {}", stream.id());
                stream.stop_all();
            }
            return Err(MediaError::Aborted);
        }
        state.acquiring = false;
        match result {
            Ok(stream) => {
                for track in stream.audio_tracks() {
                    track.set_enabled(state.audio_enabled);
                }
                tracing::info!(
                    "Acquired capture stream {} ({} tracks)",
                    stream.id(),
                    stream.tracks().len()
                );
                state.stream = Some(stream.clone());
                Ok(Some(stream))
            }
            Err(e) => {
                tracing::warn!("Media acquisition failed: {}", e);
                state.error = Some(e);
                Err(e)
            }
        }
    }

    /// Enable or disable held audio tracks without reacquiring.
    pub fn set_audio_enabled(&self, enabled: bool) {
        let mut state = self.lock();
        state.audio_enabled = enabled;
        if let Some(ref stream) = state.stream {
            for track in stream.audio_tracks() {
                track.set_enabled(enabled);
            }
        }
    }

    /// Stop every held track and invalidate in-flight acquisitions.
    pub fn cleanup(&self) {
        let mut state = self.lock();
        state.generation += 1;
        state.acquiring = false;
        state.profile = CaptureProfile::default();
        if let Some(stream) = state.stream.take() {
            tracing::debug!("Releasing capture stream {}", stream.id());
            stream.stop_all();
        }
    }

    pub fn stream(&self) -> Option<MediaStream> {
        self.lock().stream.clone()
    }

    pub fn is_acquiring(&self) -> bool {
        self.lock().acquiring
    }

    pub fn error(&self) -> Option<MediaError> {
        self.lock().error
    }
}
