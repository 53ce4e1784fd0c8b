//! Local media acquisition
//!
//! Wraps a platform [`CaptureProvider`] with the call engine's fallback chain.
//! A failed camera degrades an audio/video call to microphone only; a screen
//! share falls back to nothing but tries to add a microphone when the display
//! stream carries no audio.

use crate::types::{CallRole, MediaKind, MediaMode};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Media errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    /// Requested device does not exist
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Capture was denied or the device failed to start
    #[error("Capture failed: {0}")]
    CaptureFailed(String),

    /// Every fallback was exhausted
    #[error("No usable capture device: {0}")]
    DeviceError(String),
}

/// Microphone capture constraints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConstraints {
    /// Echo cancellation
    pub echo_cancellation: bool,
    /// Noise suppression
    pub noise_suppression: bool,
    /// Automatic gain control
    pub auto_gain_control: bool,
    /// Channel count
    pub channel_count: u16,
}

impl Default for AudioConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
            channel_count: 1,
        }
    }
}

/// Device category reported by enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceKind {
    /// Microphone
    AudioInput,
    /// Camera
    VideoInput,
    /// Speaker
    AudioOutput,
}

/// Enumerated capture device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Device id
    pub id: String,
    /// Human readable label
    pub label: String,
    /// Category
    pub kind: DeviceKind,
}

/// A user-media capture request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureRequest {
    /// Microphone constraints, `None` for no audio
    pub audio: Option<AudioConstraints>,
    /// Whether to open the camera
    pub video: bool,
}

impl CaptureRequest {
    /// Camera and microphone
    #[must_use]
    pub fn camera_and_microphone(audio: AudioConstraints) -> Self {
        Self {
            audio: Some(audio),
            video: true,
        }
    }

    /// Microphone only
    #[must_use]
    pub fn microphone(audio: AudioConstraints) -> Self {
        Self {
            audio: Some(audio),
            video: false,
        }
    }
}

/// Where a local track comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrackSource {
    /// Microphone
    Microphone,
    /// Camera
    Camera,
    /// Captured display
    Display,
    /// Audio captured alongside a display
    DisplayAudio,
}

impl TrackSource {
    /// Media kind produced by this source
    #[must_use]
    pub fn kind(self) -> MediaKind {
        match self {
            Self::Microphone | Self::DisplayAudio => MediaKind::Audio,
            Self::Camera | Self::Display => MediaKind::Video,
        }
    }
}

/// Source of the local video track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VideoSource {
    /// Camera capture
    Camera,
    /// Display capture
    Display,
}

/// Platform control over a captured track
pub trait TrackControl: Send + Sync + fmt::Debug {
    /// Enable or disable the track without releasing it
    fn set_enabled(&self, enabled: bool);

    /// Release the underlying device
    fn stop(&self);
}

/// Handle to a captured local track
#[derive(Debug, Clone)]
pub struct MediaTrack {
    id: String,
    source: TrackSource,
    control: Arc<dyn TrackControl>,
}

impl MediaTrack {
    /// Wrap a platform track
    pub fn new(id: impl Into<String>, source: TrackSource, control: Arc<dyn TrackControl>) -> Self {
        Self {
            id: id.into(),
            source,
            control,
        }
    }

    /// Track id
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Track kind
    #[must_use]
    pub fn kind(&self) -> MediaKind {
        self.source.kind()
    }

    /// Track source
    #[must_use]
    pub fn source(&self) -> TrackSource {
        self.source
    }

    /// Enable or disable sending
    pub fn set_enabled(&self, enabled: bool) {
        self.control.set_enabled(enabled);
    }

    /// Release the device
    pub fn stop(&self) {
        self.control.stop();
    }
}

/// Capture device access provided by the platform
#[async_trait]
pub trait CaptureProvider: Send + Sync {
    /// List available devices
    async fn enumerate_devices(&self) -> Result<Vec<DeviceInfo>, MediaError>;

    /// Open microphone and/or camera
    async fn get_user_media(&self, request: CaptureRequest) -> Result<Vec<MediaTrack>, MediaError>;

    /// Open a display capture, optionally with its audio
    async fn get_display_media(&self, with_audio: bool) -> Result<Vec<MediaTrack>, MediaError>;
}

/// Tracks captured for a session
///
/// Owns its tracks exclusively and stops all of them on [`LocalMedia::release`]
/// or drop.
#[derive(Debug, Default)]
pub struct LocalMedia {
    tracks: Vec<MediaTrack>,
    released: bool,
}

impl LocalMedia {
    /// Take ownership of captured tracks
    #[must_use]
    pub fn new(tracks: Vec<MediaTrack>) -> Self {
        Self {
            tracks,
            released: false,
        }
    }

    /// All tracks
    #[must_use]
    pub fn tracks(&self) -> &[MediaTrack] {
        &self.tracks
    }

    /// First audio track
    #[must_use]
    pub fn audio_track(&self) -> Option<&MediaTrack> {
        self.track(MediaKind::Audio)
    }

    /// First video track
    #[must_use]
    pub fn video_track(&self) -> Option<&MediaTrack> {
        self.track(MediaKind::Video)
    }

    /// First track of `kind`
    #[must_use]
    pub fn track(&self, kind: MediaKind) -> Option<&MediaTrack> {
        self.tracks.iter().find(|t| t.kind() == kind)
    }

    /// Whether a local video track was obtained
    #[must_use]
    pub fn has_video(&self) -> bool {
        self.video_track().is_some()
    }

    /// Where local video comes from, if any
    #[must_use]
    pub fn video_source(&self) -> Option<VideoSource> {
        self.video_track().map(|t| match t.source() {
            TrackSource::Display => VideoSource::Display,
            _ => VideoSource::Camera,
        })
    }

    /// Find a track by id
    #[must_use]
    pub fn find(&self, id: &str) -> Option<&MediaTrack> {
        self.tracks.iter().find(|t| t.id() == id)
    }

    fn push(&mut self, track: MediaTrack) {
        self.tracks.push(track);
    }

    /// Stop every track; later calls do nothing
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        for track in &self.tracks {
            track.stop();
        }
        tracing::debug!(tracks = self.tracks.len(), "Local media released");
    }

    /// Whether [`LocalMedia::release`] has run
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.released
    }
}

impl Drop for LocalMedia {
    fn drop(&mut self) {
        self.release();
    }
}

/// A degradation that happened while acquiring media
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquisitionNote {
    /// No camera is present, the call continues audio only
    NoCamera,
    /// The camera failed, the call continues audio only
    CameraFailed(String),
    /// The display stream had no audio and no microphone could be added
    MicrophoneUnavailable(String),
}

impl fmt::Display for AcquisitionNote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoCamera => f.write_str("No camera found, continuing with audio only"),
            Self::CameraFailed(e) => write!(f, "Camera unavailable ({e}), continuing with audio only"),
            Self::MicrophoneUnavailable(e) => {
                write!(f, "Sharing screen without microphone ({e})")
            }
        }
    }
}

/// Result of a successful acquisition
#[derive(Debug)]
pub struct Acquisition {
    /// Captured tracks
    pub media: LocalMedia,
    /// Degradations the user should hear about
    pub notes: Vec<AcquisitionNote>,
}

/// Runs the capture fallback chain
pub struct MediaAcquirer {
    provider: Arc<dyn CaptureProvider>,
    audio: AudioConstraints,
}

impl MediaAcquirer {
    /// Create an acquirer over a capture provider
    #[must_use]
    pub fn new(provider: Arc<dyn CaptureProvider>, audio: AudioConstraints) -> Self {
        Self { provider, audio }
    }

    /// Acquire local media for a session
    ///
    /// # Errors
    ///
    /// Returns [`MediaError::DeviceError`] when every fallback for the mode failed
    #[tracing::instrument(skip(self))]
    pub async fn acquire(&self, mode: MediaMode, role: CallRole) -> Result<Acquisition, MediaError> {
        match (mode, role) {
            (MediaMode::ScreenShare, CallRole::Caller) => self.acquire_display().await,
            (MediaMode::AudioVideo, _) => self.acquire_camera_or_microphone().await,
            (MediaMode::AudioOnly, _) | (MediaMode::ScreenShare, CallRole::Callee) => {
                let media = self.microphone_only().await?;
                Ok(Acquisition {
                    media,
                    notes: Vec::new(),
                })
            }
        }
    }

    async fn microphone_only(&self) -> Result<LocalMedia, MediaError> {
        self.provider
            .get_user_media(CaptureRequest::microphone(self.audio))
            .await
            .map(LocalMedia::new)
            .map_err(|e| {
                tracing::warn!(error = %e, "Microphone capture failed");
                MediaError::DeviceError(e.to_string())
            })
    }

    async fn acquire_camera_or_microphone(&self) -> Result<Acquisition, MediaError> {
        let has_camera = match self.provider.enumerate_devices().await {
            Ok(devices) => devices.iter().any(|d| d.kind == DeviceKind::VideoInput),
            Err(e) => {
                // Enumeration failure is not proof of absence, try the camera anyway.
                tracing::debug!(error = %e, "Device enumeration failed");
                true
            }
        };

        if !has_camera {
            tracing::info!("No video input device, acquiring microphone only");
            let media = self.microphone_only().await?;
            return Ok(Acquisition {
                media,
                notes: vec![AcquisitionNote::NoCamera],
            });
        }

        match self
            .provider
            .get_user_media(CaptureRequest::camera_and_microphone(self.audio))
            .await
        {
            Ok(tracks) => Ok(Acquisition {
                media: LocalMedia::new(tracks),
                notes: Vec::new(),
            }),
            Err(camera_error) => {
                tracing::warn!(error = %camera_error, "Camera capture failed, falling back to microphone");
                let media = self.microphone_only().await?;
                Ok(Acquisition {
                    media,
                    notes: vec![AcquisitionNote::CameraFailed(camera_error.to_string())],
                })
            }
        }
    }

    async fn acquire_display(&self) -> Result<Acquisition, MediaError> {
        let tracks = self.provider.get_display_media(true).await.map_err(|e| {
            tracing::warn!(error = %e, "Display capture failed");
            MediaError::DeviceError(e.to_string())
        })?;
        let mut media = LocalMedia::new(tracks);
        if !media.has_video() {
            return Err(MediaError::DeviceError(
                "display capture returned no video track".to_string(),
            ));
        }

        let mut notes = Vec::new();
        if media.audio_track().is_none() {
            match self
                .provider
                .get_user_media(CaptureRequest::microphone(self.audio))
                .await
            {
                Ok(extra) => {
                    for track in extra.into_iter().filter(|t| t.kind() == MediaKind::Audio) {
                        media.push(track);
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "No microphone for screen share");
                    notes.push(AcquisitionNote::MicrophoneUnavailable(e.to_string()));
                }
            }
        }
        Ok(Acquisition { media, notes })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::sim::{CaptureScript, SimulatedCapture};

    fn acquirer(script: CaptureScript) -> (Arc<SimulatedCapture>, MediaAcquirer) {
        let capture = Arc::new(SimulatedCapture::new(script));
        let acquirer = MediaAcquirer::new(capture.clone(), AudioConstraints::default());
        (capture, acquirer)
    }

    #[tokio::test]
    async fn audio_video_gets_both_tracks() {
        let (_, acq) = acquirer(CaptureScript::default());
        let result = acq.acquire(MediaMode::AudioVideo, CallRole::Caller).await.unwrap();
        assert!(result.media.has_video());
        assert!(result.media.audio_track().is_some());
        assert_eq!(result.media.video_source(), Some(VideoSource::Camera));
        assert!(result.notes.is_empty());
    }

    #[tokio::test]
    async fn camera_failure_degrades_to_microphone() {
        let (_, acq) = acquirer(CaptureScript {
            camera_fails: true,
            ..CaptureScript::default()
        });
        let result = acq.acquire(MediaMode::AudioVideo, CallRole::Callee).await.unwrap();
        assert!(!result.media.has_video());
        assert!(result.media.audio_track().is_some());
        assert!(matches!(result.notes[..], [AcquisitionNote::CameraFailed(_)]));
    }

    #[tokio::test]
    async fn missing_camera_skips_camera_request() {
        let (capture, acq) = acquirer(CaptureScript {
            has_camera: false,
            ..CaptureScript::default()
        });
        let result = acq.acquire(MediaMode::AudioVideo, CallRole::Caller).await.unwrap();
        assert_eq!(result.notes, vec![AcquisitionNote::NoCamera]);
        assert_eq!(capture.camera_requests(), 0);
    }

    #[tokio::test]
    async fn total_failure_is_device_error() {
        let (_, acq) = acquirer(CaptureScript {
            camera_fails: true,
            microphone_fails: true,
            ..CaptureScript::default()
        });
        let err = acq.acquire(MediaMode::AudioVideo, CallRole::Caller).await.unwrap_err();
        assert!(matches!(err, MediaError::DeviceError(_)));
    }

    #[tokio::test]
    async fn screen_share_adds_microphone_when_display_is_silent() {
        let (_, acq) = acquirer(CaptureScript {
            display_has_audio: false,
            ..CaptureScript::default()
        });
        let result = acq.acquire(MediaMode::ScreenShare, CallRole::Caller).await.unwrap();
        assert_eq!(result.media.video_source(), Some(VideoSource::Display));
        assert_eq!(
            result.media.audio_track().map(MediaTrack::source),
            Some(TrackSource::Microphone)
        );
    }

    #[tokio::test]
    async fn screen_share_tolerates_missing_microphone() {
        let (_, acq) = acquirer(CaptureScript {
            display_has_audio: false,
            microphone_fails: true,
            ..CaptureScript::default()
        });
        let result = acq.acquire(MediaMode::ScreenShare, CallRole::Caller).await.unwrap();
        assert!(result.media.audio_track().is_none());
        assert!(matches!(result.notes[..], [AcquisitionNote::MicrophoneUnavailable(_)]));
    }

    #[tokio::test]
    async fn screen_share_callee_only_uses_microphone() {
        let (capture, acq) = acquirer(CaptureScript::default());
        let result = acq.acquire(MediaMode::ScreenShare, CallRole::Callee).await.unwrap();
        assert!(!result.media.has_video());
        assert_eq!(capture.display_requests(), 0);
    }

    #[tokio::test]
    async fn release_stops_tracks_once() {
        let (capture, acq) = acquirer(CaptureScript::default());
        let mut result = acq.acquire(MediaMode::AudioVideo, CallRole::Caller).await.unwrap();
        result.media.release();
        result.media.release();
        assert!(result.media.is_released());
        assert_eq!(capture.live_tracks(), 0);
        assert_eq!(capture.stop_calls(), 2);
    }
}
