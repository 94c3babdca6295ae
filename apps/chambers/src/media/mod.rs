//! Local camera/microphone capture.
//!
//! The device itself sits behind [`CaptureDevice`]; the controller owns the
//! engine-level tracks and the feeder tasks that move captured samples onto
//! them. Mute toggles gate the feeders only; the attached track set never
//! changes, so no renegotiation happens.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

const MEDIA_STREAM_ID: &str = "chambers-media";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("camera/microphone access denied")]
    PermissionDenied,
    #[error("capture device unavailable: {0}")]
    Unavailable(String),
}

/// One source of raw media samples, as handed out by a capture device.
pub struct SourceTrack {
    pub kind: TrackKind,
    pub samples: mpsc::Receiver<Sample>,
}

/// Capability to request camera/microphone access.
///
/// Real hardware capture is owned by the embedding application; the library
/// ships [`SyntheticCapture`] for the CLI and for tests.
#[async_trait]
pub trait CaptureDevice: Send + Sync {
    async fn open(&self) -> Result<Vec<SourceTrack>, CaptureError>;
}

struct LocalTrack {
    kind: TrackKind,
    rtc: Arc<TrackLocalStaticSample>,
    enabled: Arc<AtomicBool>,
    feeder: JoinHandle<()>,
}

/// Owns the acquired capture for one session.
pub struct MediaCaptureController {
    tracks: Vec<LocalTrack>,
    cancel: CancellationToken,
    released: AtomicBool,
}

impl MediaCaptureController {
    /// Request camera+microphone access from `device` and start feeding
    /// samples. Tracks start out disabled: the session begins muted, the
    /// participant opts into transmitting.
    pub async fn acquire(
        device: &dyn CaptureDevice,
        cancel: CancellationToken,
    ) -> Result<Self, CaptureError> {
        let sources = device.open().await?;
        let mut tracks = Vec::with_capacity(sources.len());
        for source in sources {
            tracks.push(spawn_local_track(source, cancel.child_token()));
        }
        tracing::debug!(target: "media", tracks = tracks.len(), "capture acquired");
        Ok(Self {
            tracks,
            cancel,
            released: AtomicBool::new(false),
        })
    }

    /// Engine-level tracks to attach to a peer connection.
    pub fn rtc_tracks(&self) -> Vec<Arc<TrackLocalStaticSample>> {
        self.tracks.iter().map(|t| Arc::clone(&t.rtc)).collect()
    }

    pub fn set_audio_enabled(&self, enabled: bool) {
        self.set_enabled(TrackKind::Audio, enabled);
    }

    pub fn set_video_enabled(&self, enabled: bool) {
        self.set_enabled(TrackKind::Video, enabled);
    }

    pub fn audio_enabled(&self) -> bool {
        self.is_enabled(TrackKind::Audio)
    }

    pub fn video_enabled(&self) -> bool {
        self.is_enabled(TrackKind::Video)
    }

    fn set_enabled(&self, kind: TrackKind, enabled: bool) {
        for track in self.tracks.iter().filter(|t| t.kind == kind) {
            track.enabled.store(enabled, Ordering::SeqCst);
        }
        tracing::debug!(target: "media", ?kind, enabled, "track toggled");
    }

    fn is_enabled(&self, kind: TrackKind) -> bool {
        self.tracks
            .iter()
            .filter(|t| t.kind == kind)
            .all(|t| t.enabled.load(Ordering::SeqCst))
            && self.tracks.iter().any(|t| t.kind == kind)
    }

    /// Stop all feeders and free the device. Called once per acquire on
    /// teardown; extra calls are ignored.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        for track in &self.tracks {
            track.feeder.abort();
        }
        tracing::debug!(target: "media", "capture released");
    }

    pub fn released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

impl Drop for MediaCaptureController {
    fn drop(&mut self) {
        self.release();
    }
}

fn spawn_local_track(source: SourceTrack, cancel: CancellationToken) -> LocalTrack {
    let (codec, id) = match source.kind {
        TrackKind::Audio => (
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: 48_000,
                channels: 2,
                ..Default::default()
            },
            "audio",
        ),
        TrackKind::Video => (
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_string(),
                clock_rate: 90_000,
                ..Default::default()
            },
            "video",
        ),
    };
    let rtc = Arc::new(TrackLocalStaticSample::new(
        codec,
        id.to_string(),
        MEDIA_STREAM_ID.to_string(),
    ));
    let enabled = Arc::new(AtomicBool::new(false));

    let feeder_rtc = Arc::clone(&rtc);
    let feeder_enabled = Arc::clone(&enabled);
    let kind = source.kind;
    let mut samples = source.samples;
    let feeder = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                sample = samples.recv() => {
                    let Some(sample) = sample else { break };
                    if !feeder_enabled.load(Ordering::SeqCst) {
                        // Muted: capture keeps running, transmission stops.
                        continue;
                    }
                    if let Err(err) = feeder_rtc.write_sample(&sample).await {
                        tracing::debug!(target: "media", ?kind, error = %err, "sample write failed");
                    }
                }
            }
        }
    });

    LocalTrack {
        kind: source.kind,
        rtc,
        enabled,
        feeder,
    }
}

/// Deterministic capture device: silence on the audio track, a static
/// pattern on the video track. Used by the CLI and the test suite.
pub struct SyntheticCapture {
    deny: bool,
}

const OPUS_SILENCE: &[u8] = &[0xf8, 0xff, 0xfe];
const VIDEO_PATTERN: &[u8] = &[0x10; 192];

impl SyntheticCapture {
    pub fn new() -> Self {
        Self { deny: false }
    }

    /// A device that refuses access, mirroring a user denying the
    /// browser-style permission prompt.
    pub fn denied() -> Self {
        Self { deny: true }
    }
}

impl Default for SyntheticCapture {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CaptureDevice for SyntheticCapture {
    async fn open(&self) -> Result<Vec<SourceTrack>, CaptureError> {
        if self.deny {
            return Err(CaptureError::PermissionDenied);
        }
        Ok(vec![
            synthetic_source(TrackKind::Audio, Bytes::from_static(OPUS_SILENCE), 20),
            synthetic_source(TrackKind::Video, Bytes::from_static(VIDEO_PATTERN), 33),
        ])
    }
}

fn synthetic_source(kind: TrackKind, payload: Bytes, interval_ms: u64) -> SourceTrack {
    let (tx, rx) = mpsc::channel(32);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let sample = Sample {
                data: payload.clone(),
                duration: Duration::from_millis(interval_ms),
                ..Default::default()
            };
            if tx.send(sample).await.is_err() {
                // Controller released; device stops capturing.
                break;
            }
        }
    });
    SourceTrack { kind, samples: rx }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn denied_device_surfaces_permission_failure() {
        let device = SyntheticCapture::denied();
        let result = MediaCaptureController::acquire(&device, CancellationToken::new()).await;
        assert!(matches!(result, Err(CaptureError::PermissionDenied)));
    }

    #[tokio::test]
    async fn acquire_yields_one_audio_and_one_video_track_starting_muted() {
        let device = SyntheticCapture::new();
        let media = MediaCaptureController::acquire(&device, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(media.rtc_tracks().len(), 2);
        assert!(!media.audio_enabled());
        assert!(!media.video_enabled());
        media.release();
    }

    #[tokio::test]
    async fn mute_toggle_flips_only_the_enabled_gate() {
        let device = SyntheticCapture::new();
        let media = MediaCaptureController::acquire(&device, CancellationToken::new())
            .await
            .unwrap();

        let before = media.rtc_tracks().len();
        media.set_audio_enabled(true);
        assert!(media.audio_enabled());
        assert!(!media.video_enabled());
        media.set_audio_enabled(false);
        assert!(!media.audio_enabled());
        assert_eq!(media.rtc_tracks().len(), before);
        media.release();
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let device = SyntheticCapture::new();
        let media = MediaCaptureController::acquire(&device, CancellationToken::new())
            .await
            .unwrap();
        media.release();
        assert!(media.released());
        media.release();
        assert!(media.released());
    }
}
