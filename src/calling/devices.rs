//! Capture devices.
//!
//! `ToneCaptureDevice` hands out synthetic tracks (a test tone and a test
//! pattern) and needs no hardware. With the `audio` feature, `CpalCaptureDevice`
//! opens the default input device through cpal and classifies its failures.

use async_trait::async_trait;

use super::media::{CaptureDevice, CaptureProfile, MediaError, MediaStream, MediaTrack, TrackKind};

/// Synthetic capture device.
#[derive(Debug, Default, Clone)]
pub struct ToneCaptureDevice {
    /// When set, every open fails with this class (used to exercise error paths).
    failure: Option<MediaError>,
}

impl ToneCaptureDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(error: MediaError) -> Self {
        Self {
            failure: Some(error),
        }
    }
}

#[async_trait]
impl CaptureDevice for ToneCaptureDevice {
    async fn open(&self, profile: CaptureProfile) -> Result<MediaStream, MediaError> {
        if let Some(e) = self.failure {
            return Err(e);
        }
        Ok(MediaStream::new(synthetic_tracks(profile, profile.audio)))
    }
}

/// Synthetic tracks for the kinds in `profile`; `with_audio` false skips audio
/// when a real microphone supplies it.
fn synthetic_tracks(profile: CaptureProfile, with_audio: bool) -> Vec<MediaTrack> {
    let mut tracks = Vec::new();
    if with_audio {
        tracks.push(MediaTrack::new(TrackKind::Audio, "Test tone (1 kHz)"));
    }
    if profile.video {
        tracks.push(MediaTrack::new(TrackKind::Video, "Test pattern"));
    }
    tracks
}

#[cfg(feature = "audio")]
pub use cpal_device::CpalCaptureDevice;

#[cfg(feature = "audio")]
mod cpal_device {
    use std::sync::mpsc;
    use std::thread;

    use async_trait::async_trait;
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use cpal::{BuildStreamError, DefaultStreamConfigError, PlayStreamError, SampleFormat};
    use tokio::sync::oneshot;

    use super::super::media::{
        CaptureDevice, CaptureProfile, MediaError, MediaStream, MediaTrack, TrackKind,
    };
    use super::synthetic_tracks;

    /// Microphone capture through cpal. Video, when requested, is synthetic.
    ///
    /// The cpal Stream is not Send, so it lives on a dedicated OS thread until
    /// the audio track is stopped.
    #[derive(Debug, Default, Clone)]
    pub struct CpalCaptureDevice;

    impl CpalCaptureDevice {
        pub fn new() -> Self {
            Self
        }
    }

    #[async_trait]
    impl CaptureDevice for CpalCaptureDevice {
        async fn open(&self, profile: CaptureProfile) -> Result<MediaStream, MediaError> {
            let mut tracks = Vec::new();
            if profile.audio {
                tracks.push(open_microphone().await?);
            }
            tracks.extend(synthetic_tracks(profile, false));
            Ok(MediaStream::new(tracks))
        }
    }

    async fn open_microphone() -> Result<MediaTrack, MediaError> {
        let (ready_tx, ready_rx) = oneshot::channel::<Result<String, MediaError>>();
        // Dropping keep_tx (on track stop) ends the capture thread.
        let (keep_tx, keep_rx) = mpsc::channel::<()>();

        thread::spawn(move || {
            let host = cpal::default_host();
            let device = match host.default_input_device() {
                Some(d) => d,
                None => {
                    tracing::warn!("No audio input device found");
                    let _ = ready_tx.send(Err(MediaError::NoDevice));
                    return;
                }
            };
            let name = device.name().unwrap_or_else(|_| "unknown".into());

            let config = match device.default_input_config() {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!("No usable input config for {}: {}", name, e);
                    let _ = ready_tx.send(Err(classify_config_error(&e)));
                    return;
                }
            };

            let on_error = |err: cpal::StreamError| {
                tracing::warn!("Audio input stream error: {}", err);
            };
            let stream = match config.sample_format() {
                SampleFormat::F32 => device.build_input_stream(
                    &config.config(),
                    |_data: &[f32], _: &cpal::InputCallbackInfo| {},
                    on_error,
                    None,
                ),
                SampleFormat::I16 => device.build_input_stream(
                    &config.config(),
                    |_data: &[i16], _: &cpal::InputCallbackInfo| {},
                    on_error,
                    None,
                ),
                other => {
                    tracing::warn!("Unsupported input sample format {:?} on {}", other, name);
                    let _ = ready_tx.send(Err(MediaError::ConstraintsUnsatisfiable));
                    return;
                }
            };
            let stream = match stream {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!("Failed to build input stream on {}: {}", name, e);
                    let _ = ready_tx.send(Err(classify_build_error(&e)));
                    return;
                }
            };
            if let Err(e) = stream.play() {
                tracing::warn!("Failed to start input stream on {}: {}", name, e);
                let _ = ready_tx.send(Err(classify_play_error(&e)));
                return;
            }

            tracing::info!("Audio capture started on {}", name);
            if ready_tx.send(Ok(name)).is_err() {
                // Requester went away before the device came up.
                return;
            }
            let _ = keep_rx.recv();
            drop(stream);
            tracing::debug!("Audio capture thread exiting");
        });

        let name = ready_rx.await.map_err(|_| MediaError::Aborted)??;
        Ok(MediaTrack::with_stop_hook(TrackKind::Audio, name, move || {
            drop(keep_tx);
        }))
    }

    fn classify_config_error(e: &DefaultStreamConfigError) -> MediaError {
        match e {
            DefaultStreamConfigError::DeviceNotAvailable => MediaError::NoDevice,
            DefaultStreamConfigError::StreamTypeNotSupported => MediaError::Unsupported,
            DefaultStreamConfigError::BackendSpecific { .. } => MediaError::DeviceBusy,
        }
    }

    fn classify_build_error(e: &BuildStreamError) -> MediaError {
        match e {
            BuildStreamError::DeviceNotAvailable => MediaError::NoDevice,
            BuildStreamError::StreamConfigNotSupported | BuildStreamError::InvalidArgument => {
                MediaError::ConstraintsUnsatisfiable
            }
            BuildStreamError::BackendSpecific { .. } => MediaError::DeviceBusy,
            _ => MediaError::Other,
        }
    }

    fn classify_play_error(e: &PlayStreamError) -> MediaError {
        match e {
            PlayStreamError::DeviceNotAvailable => MediaError::NoDevice,
            PlayStreamError::BackendSpecific { .. } => MediaError::DeviceBusy,
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_build_errors_are_classified() {
            assert_eq!(
                classify_build_error(&BuildStreamError::DeviceNotAvailable),
                MediaError::NoDevice
            );
            assert_eq!(
                classify_build_error(&BuildStreamError::StreamConfigNotSupported),
                MediaError::ConstraintsUnsatisfiable
            );
            assert_eq!(
                classify_config_error(&DefaultStreamConfigError::StreamTypeNotSupported),
                MediaError::Unsupported
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tone_device_tracks_follow_profile() {
        let device = ToneCaptureDevice::new();
        let voice = device
            .open(CaptureProfile {
                audio: true,
                video: false,
            })
            .await
            .unwrap();
        assert_eq!(voice.tracks().len(), 1);
        assert!(!voice.has_video());

        let video = device
            .open(CaptureProfile {
                audio: true,
                video: true,
            })
            .await
            .unwrap();
        assert_eq!(video.tracks().len(), 2);
        assert!(video.has_video());
    }

    #[tokio::test]
    async fn test_failing_device_reports_class() {
        let device = ToneCaptureDevice::failing(MediaError::DeviceBusy);
        let err = device.open(CaptureProfile::default()).await.unwrap_err();
        assert_eq!(err, MediaError::DeviceBusy);
    }
}
