//! Media Module - Lokale Aufnahme
//!
//! Dieses Modul verwaltet:
//! - Das eine lokale Audio/Video-Handle pro Meeting
//! - Mikrofon Capture (cpal)
//! - Lokale WebRTC Tracks (Opus, VP8)

mod capture;
mod microphone;

pub use capture::{CaptureError, CaptureSource, DeviceCaptureSource, LocalMedia, MediaCaptureManager};
pub use microphone::{MicrophoneCapture, FRAME_SIZE, SAMPLE_RATE};
