//! Local and remote media handles, and the capture-device seam.
//!
//! A `MediaTrack` is a cheap, clonable handle. Stopping any clone stops the
//! track for everyone and runs the device release hook exactly once.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    /// SDP media type (`m=audio`, `m=video`).
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
        }
    }

    pub fn from_media_type(s: &str) -> Option<Self> {
        match s {
            "audio" => Some(TrackKind::Audio),
            "video" => Some(TrackKind::Video),
            _ => None,
        }
    }
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

type ReleaseHook = Box<dyn FnOnce() + Send>;

struct TrackInner {
    ended: AtomicBool,
    release: Mutex<Option<ReleaseHook>>,
}

#[derive(Clone)]
pub struct MediaTrack {
    id: String,
    kind: TrackKind,
    label: String,
    inner: Arc<TrackInner>,
}

impl MediaTrack {
    pub fn new(kind: TrackKind, label: impl Into<String>) -> Self {
        Self::build(kind, label.into(), None)
    }

    /// Track whose `release` hook runs when the track is first stopped.
    pub fn with_release(
        kind: TrackKind,
        label: impl Into<String>,
        release: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self::build(kind, label.into(), Some(Box::new(release)))
    }

    fn build(kind: TrackKind, label: String, release: Option<ReleaseHook>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            label,
            inner: Arc::new(TrackInner {
                ended: AtomicBool::new(false),
                release: Mutex::new(release),
            }),
        }
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn is_live(&self) -> bool {
        !self.inner.ended.load(Ordering::Acquire)
    }

    pub fn stop(&self) {
        if self.inner.ended.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(release) = self.inner.release.lock().take() {
            release();
        }
        tracing::debug!("Stopped {} track {} ({})", self.kind, self.id, self.label);
    }
}

impl fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("label", &self.label)
            .field("live", &self.is_live())
            .finish()
    }
}

/// A group of tracks from one source (local capture or the remote peer).
#[derive(Debug, Clone)]
pub struct MediaStream {
    tracks: Vec<MediaTrack>,
}

impl MediaStream {
    pub fn new(tracks: Vec<MediaTrack>) -> Self {
        Self { tracks }
    }

    pub fn tracks(&self) -> &[MediaTrack] {
        &self.tracks
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn has_kind(&self, kind: TrackKind) -> bool {
        self.tracks.iter().any(|t| t.kind() == kind)
    }

    #[cfg(test)]
    pub fn is_live(&self) -> bool {
        self.tracks.iter().any(MediaTrack::is_live)
    }

    pub fn stop(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

/// What to capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

/// Capture failures. Messages are shown to the user as-is.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MediaAccessError {
    #[error("camera/microphone permission denied; allow access in system settings and try again")]
    PermissionDenied,
    #[error("no {0} device found; connect one and try again")]
    DeviceNotFound(TrackKind),
    #[error("timed out after {0:?} waiting for camera/microphone")]
    Timeout(Duration),
    #[error("media device error: {0}")]
    Device(String),
}

/// OS-level capture device access.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn get_user_media(
        &self,
        constraints: MediaConstraints,
    ) -> Result<MediaStream, MediaAccessError>;
}

/// Owns a captured local stream for the duration of a call. Dropping it
/// stops every track, so the stream cannot outlive the operation that
/// acquired it on any exit path.
pub struct LocalMedia {
    stream: MediaStream,
}

impl LocalMedia {
    pub fn new(stream: MediaStream) -> Self {
        Self { stream }
    }

    pub fn stream(&self) -> &MediaStream {
        &self.stream
    }
}

impl Drop for LocalMedia {
    fn drop(&mut self) {
        self.stream.stop();
    }
}

#[derive(Debug, Default)]
struct DeviceCounters {
    opened: AtomicUsize,
    released: AtomicUsize,
}

/// Synthetic capture devices (tone + test pattern). Each capture opens one
/// track per requested kind and counts device opens/releases.
#[derive(Debug, Clone)]
pub struct SyntheticDevices {
    audio: bool,
    video: bool,
    permission_granted: bool,
    counters: Arc<DeviceCounters>,
}

impl SyntheticDevices {
    pub fn new(audio: bool, video: bool) -> Self {
        Self {
            audio,
            video,
            permission_granted: true,
            counters: Arc::default(),
        }
    }

    /// Devices whose permission prompt is always refused.
    #[cfg(test)]
    pub fn denied() -> Self {
        Self {
            permission_granted: false,
            ..Self::new(true, true)
        }
    }

    /// Tracks currently open (opened minus released).
    #[cfg(test)]
    pub fn live_tracks(&self) -> usize {
        self.opened() - self.released()
    }

    #[cfg(test)]
    pub fn opened(&self) -> usize {
        self.counters.opened.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub fn released(&self) -> usize {
        self.counters.released.load(Ordering::Acquire)
    }

    fn open_track(&self, kind: TrackKind) -> MediaTrack {
        self.counters.opened.fetch_add(1, Ordering::AcqRel);
        let counters = self.counters.clone();
        let label = match kind {
            TrackKind::Audio => "synthetic-tone",
            TrackKind::Video => "synthetic-pattern",
        };
        MediaTrack::with_release(kind, label, move || {
            counters.released.fetch_add(1, Ordering::AcqRel);
        })
    }
}

impl Default for SyntheticDevices {
    fn default() -> Self {
        Self::new(true, true)
    }
}

#[async_trait]
impl MediaDevices for SyntheticDevices {
    async fn get_user_media(
        &self,
        constraints: MediaConstraints,
    ) -> Result<MediaStream, MediaAccessError> {
        if !self.permission_granted {
            return Err(MediaAccessError::PermissionDenied);
        }
        if constraints.audio && !self.audio {
            return Err(MediaAccessError::DeviceNotFound(TrackKind::Audio));
        }
        if constraints.video && !self.video {
            return Err(MediaAccessError::DeviceNotFound(TrackKind::Video));
        }

        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(self.open_track(TrackKind::Audio));
        }
        if constraints.video {
            tracks.push(self.open_track(TrackKind::Video));
        }
        if tracks.is_empty() {
            return Err(MediaAccessError::Device(
                "constraints request neither audio nor video".into(),
            ));
        }

        tracing::debug!("Captured synthetic media ({} tracks)", tracks.len());
        Ok(MediaStream::new(tracks))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_runs_release_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let track = MediaTrack::with_release(TrackKind::Audio, "mic", move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        let clone = track.clone();

        track.stop();
        clone.stop();

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!track.is_live());
        assert!(!clone.is_live());
    }

    #[tokio::test]
    async fn test_synthetic_capture_and_release() {
        let devices = SyntheticDevices::default();
        let stream = devices
            .get_user_media(MediaConstraints::default())
            .await
            .unwrap();
        assert!(stream.has_kind(TrackKind::Audio));
        assert!(stream.has_kind(TrackKind::Video));
        assert_eq!(devices.live_tracks(), 2);

        let owned = LocalMedia::new(stream.clone());
        drop(owned);
        assert_eq!(devices.live_tracks(), 0);
        assert_eq!(devices.released(), 2);
        assert!(!stream.is_live());
    }

    #[tokio::test]
    async fn test_denied_devices() {
        let devices = SyntheticDevices::denied();
        let err = devices
            .get_user_media(MediaConstraints::default())
            .await
            .unwrap_err();
        assert!(matches!(err, MediaAccessError::PermissionDenied));
        assert!(err.to_string().contains("permission"));
        assert_eq!(devices.opened(), 0);
    }

    #[tokio::test]
    async fn test_missing_camera() {
        let devices = SyntheticDevices::new(true, false);
        let err = devices
            .get_user_media(MediaConstraints::default())
            .await
            .unwrap_err();
        assert!(matches!(err, MediaAccessError::DeviceNotFound(TrackKind::Video)));

        let audio_only = devices
            .get_user_media(MediaConstraints {
                audio: true,
                video: false,
            })
            .await
            .unwrap();
        assert_eq!(audio_only.tracks().len(), 1);
    }
}
