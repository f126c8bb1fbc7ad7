//! Local Media Capture
//!
//! Hält genau ein lokales Audio/Video-Handle pro Meeting. Alle Peer
//! Sessions hängen dieselben Tracks an; nur `release()` stoppt sie.

use super::microphone::{MicrophoneCapture, SAMPLE_RATE};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("No audio input device found")]
    NoInputDevice,

    #[error("Unsupported audio configuration: {0}")]
    UnsupportedConfig(String),

    #[error("Failed to build capture stream: {0}")]
    StreamBuild(String),

    #[error("Failed to start capture stream: {0}")]
    StreamPlay(String),

    #[error("Capture worker stopped unexpectedly")]
    WorkerGone,
}

// ============================================================================
// LOCAL MEDIA
// ============================================================================

/// Das geteilte lokale Capture-Handle
pub struct LocalMedia {
    stream_id: String,
    audio: Arc<TrackLocalStaticSample>,
    video: Option<Arc<TrackLocalStaticSample>>,
    microphone: Mutex<Option<MicrophoneCapture>>,
    stopped: AtomicBool,
}

impl LocalMedia {
    /// Erstellt die lokalen Tracks; `microphone` ist optional (z.B. in Tests)
    pub fn new(with_video: bool, microphone: Option<MicrophoneCapture>) -> Self {
        let stream_id = format!("classroom-{}", uuid::Uuid::new_v4());

        let audio = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: SAMPLE_RATE,
                channels: 2,
                ..Default::default()
            },
            "audio".to_string(),
            stream_id.clone(),
        ));

        let video = with_video.then(|| {
            Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_VP8.to_owned(),
                    clock_rate: 90000,
                    ..Default::default()
                },
                "video".to_string(),
                stream_id.clone(),
            ))
        });

        Self {
            stream_id,
            audio,
            video,
            microphone: Mutex::new(microphone),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Tracks zum Anhängen an eine Peer Connection (leer nach dem Stoppen)
    pub fn tracks(&self) -> Vec<Arc<dyn TrackLocal + Send + Sync>> {
        if !self.is_live() {
            return Vec::new();
        }
        let mut tracks: Vec<Arc<dyn TrackLocal + Send + Sync>> =
            vec![Arc::clone(&self.audio) as Arc<dyn TrackLocal + Send + Sync>];
        if let Some(video) = &self.video {
            tracks.push(Arc::clone(video) as Arc<dyn TrackLocal + Send + Sync>);
        }
        tracks
    }

    /// Der Audio-Track, z.B. um Opus-Samples zu schreiben
    pub fn audio_track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.audio)
    }

    pub fn video_track(&self) -> Option<Arc<TrackLocalStaticSample>> {
        self.video.clone()
    }

    pub fn is_live(&self) -> bool {
        !self.stopped.load(Ordering::Acquire)
    }

    pub fn has_microphone(&self) -> bool {
        self.microphone.lock().is_some()
    }

    /// Liest einen PCM-Frame vom Mikrofon (falls vorhanden)
    pub fn read_audio_frame(&self) -> Option<Vec<f32>> {
        self.microphone.lock().as_ref().and_then(|m| m.read_frame())
    }

    pub fn set_muted(&self, muted: bool) {
        if let Some(mic) = self.microphone.lock().as_ref() {
            mic.set_muted(muted);
        }
    }

    pub fn input_level(&self) -> f32 {
        self.microphone
            .lock()
            .as_ref()
            .map(|m| m.input_level())
            .unwrap_or(0.0)
    }

    /// Stoppt alle lokalen Tracks. Nur über `MediaCaptureManager::release`.
    fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(mut mic) = self.microphone.lock().take() {
            mic.stop();
        }
        tracing::info!(stream_id = %self.stream_id, "Local media released");
    }
}

impl std::fmt::Debug for LocalMedia {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalMedia")
            .field("stream_id", &self.stream_id)
            .field("video", &self.video.is_some())
            .field("live", &self.is_live())
            .finish()
    }
}

// ============================================================================
// CAPTURE SOURCES
// ============================================================================

/// Liefert ein neues lokales Capture-Handle
pub trait CaptureSource: Send + Sync {
    fn open(&self) -> Result<LocalMedia, CaptureError>;
}

/// Öffnet das Standard-Mikrofon über cpal
#[derive(Debug, Clone)]
pub struct DeviceCaptureSource {
    pub with_video: bool,
}

impl DeviceCaptureSource {
    pub fn new(with_video: bool) -> Self {
        Self { with_video }
    }
}

impl CaptureSource for DeviceCaptureSource {
    fn open(&self) -> Result<LocalMedia, CaptureError> {
        let microphone = MicrophoneCapture::open()?;
        Ok(LocalMedia::new(self.with_video, Some(microphone)))
    }
}

// ============================================================================
// MEDIA CAPTURE MANAGER
// ============================================================================

/// Erstellt und cached das eine lokale Capture-Handle
pub struct MediaCaptureManager {
    source: Arc<dyn CaptureSource>,
    current: Mutex<Option<Arc<LocalMedia>>>,
    opening: tokio::sync::Mutex<()>,
}

impl MediaCaptureManager {
    pub fn new(source: Arc<dyn CaptureSource>) -> Self {
        Self {
            source,
            current: Mutex::new(None),
            opening: tokio::sync::Mutex::new(()),
        }
    }

    /// Gibt das geteilte Handle zurück und erstellt es beim ersten Aufruf
    pub async fn acquire(&self) -> Result<Arc<LocalMedia>, CaptureError> {
        // Serialisiert parallele erste Aufrufe
        let _opening = self.opening.lock().await;

        if let Some(media) = self.current.lock().clone() {
            return Ok(media);
        }

        let source = Arc::clone(&self.source);
        let media = tokio::task::spawn_blocking(move || source.open())
            .await
            .map_err(|_| CaptureError::WorkerGone)??;
        let media = Arc::new(media);

        tracing::info!(stream_id = %media.stream_id(), "Local media acquired");
        *self.current.lock() = Some(Arc::clone(&media));
        Ok(media)
    }

    /// Das aktuelle Handle, ohne es zu erstellen
    pub fn current(&self) -> Option<Arc<LocalMedia>> {
        self.current.lock().clone()
    }

    /// Stoppt alle lokalen Tracks und verwirft das Handle
    pub fn release(&self) {
        if let Some(media) = self.current.lock().take() {
            media.stop();
        }
    }
}

impl std::fmt::Debug for MediaCaptureManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaCaptureManager")
            .field("current", &self.current.lock().as_ref().map(|m| m.stream_id().to_string()))
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
