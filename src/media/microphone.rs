//! Mikrofon Capture
//!
//! Verwendet cpal für Cross-Platform Audio Input. Der cpal Stream ist
//! nicht `Send`, deshalb lebt er auf einem eigenen Thread und wird über
//! einen Stop-Channel beendet.

use super::capture::CaptureError;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, StreamConfig, SupportedStreamConfigRange};
use parking_lot::Mutex;
use ringbuf::{traits::*, HeapRb};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Sample Rate (48kHz passt zu Opus)
pub const SAMPLE_RATE: u32 = 48000;

/// Frame Size in Samples (20ms @ 48kHz = 960 samples)
pub const FRAME_SIZE: usize = 960;

/// Buffer Size für den Capture-Ring-Buffer
const RING_BUFFER_SIZE: usize = FRAME_SIZE * 10;

// ============================================================================
// MICROPHONE CAPTURE
// ============================================================================

/// Laufende Mikrofon-Aufnahme
pub struct MicrophoneCapture {
    stop_tx: Option<mpsc::Sender<()>>,
    worker: Option<JoinHandle<()>>,

    /// Ring-Buffer für aufgenommenes Audio (Raw PCM, mono)
    capture_buffer: Arc<Mutex<HeapRb<f32>>>,

    is_muted: Arc<AtomicBool>,

    /// Audio Level (0.0 - 1.0) für die lokale Vorschau
    input_level: Arc<Mutex<f32>>,
}

impl MicrophoneCapture {
    /// Öffnet das Standard-Eingabegerät und startet die Aufnahme
    pub fn open() -> Result<Self, CaptureError> {
        let capture_buffer = Arc::new(Mutex::new(HeapRb::new(RING_BUFFER_SIZE)));
        let is_muted = Arc::new(AtomicBool::new(false));
        let input_level = Arc::new(Mutex::new(0.0));

        let (ready_tx, ready_rx) = mpsc::channel::<Result<(), CaptureError>>();
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        let buffer = Arc::clone(&capture_buffer);
        let muted = Arc::clone(&is_muted);
        let level = Arc::clone(&input_level);

        let worker = std::thread::Builder::new()
            .name("classroom-capture".into())
            .spawn(move || {
                let stream = match build_input_stream(buffer, muted, level) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                // Blockiert bis stop() oder bis der Sender gedroppt wird
                let _ = stop_rx.recv();
                drop(stream);
                tracing::info!("Microphone stream stopped");
            })
            .map_err(|e| CaptureError::StreamBuild(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                stop_tx: Some(stop_tx),
                worker: Some(worker),
                capture_buffer,
                is_muted,
                input_level,
            }),
            Ok(Err(e)) => {
                let _ = worker.join();
                Err(e)
            }
            Err(_) => {
                let _ = worker.join();
                Err(CaptureError::WorkerGone)
            }
        }
    }

    /// Stoppt die Aufnahme. Mehrfacher Aufruf ist erlaubt.
    pub fn stop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::warn!("Capture worker panicked");
            }
        }
    }

    /// Liest einen Frame von aufgenommenem Audio
    pub fn read_frame(&self) -> Option<Vec<f32>> {
        let mut buffer = self.capture_buffer.lock();
        if buffer.occupied_len() < FRAME_SIZE {
            return None;
        }
        Some((0..FRAME_SIZE).filter_map(|_| buffer.try_pop()).collect())
    }

    pub fn set_muted(&self, muted: bool) {
        self.is_muted.store(muted, Ordering::Relaxed);
        tracing::debug!("Microphone muted: {}", muted);
    }

    pub fn is_muted(&self) -> bool {
        self.is_muted.load(Ordering::Relaxed)
    }

    pub fn input_level(&self) -> f32 {
        *self.input_level.lock()
    }
}

impl Drop for MicrophoneCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for MicrophoneCapture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MicrophoneCapture")
            .field("running", &self.worker.is_some())
            .field("is_muted", &self.is_muted())
            .finish()
    }
}

// ============================================================================
// STREAM SETUP
// ============================================================================

fn build_input_stream(
    capture_buffer: Arc<Mutex<HeapRb<f32>>>,
    is_muted: Arc<AtomicBool>,
    input_level: Arc<Mutex<f32>>,
) -> Result<cpal::Stream, CaptureError> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or(CaptureError::NoInputDevice)?;
    let config = find_best_input_config(&device)?;

    tracing::info!(
        "Starting microphone capture: {} Hz, {} channels",
        config.sample_rate.0,
        config.channels
    );

    let channels = config.channels.max(1) as usize;
    let source_rate = config.sample_rate.0;

    let stream = device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                if data.is_empty() {
                    return;
                }
                let rms = (data.iter().map(|s| s * s).sum::<f32>() / data.len() as f32).sqrt();
                *input_level.lock() = rms.min(1.0);

                if is_muted.load(Ordering::Relaxed) {
                    return;
                }

                let mono = downmix(data, channels);
                let samples = resample_linear(&mono, source_rate, SAMPLE_RATE);

                let mut buffer = capture_buffer.lock();
                for sample in samples {
                    let _ = buffer.try_push(sample);
                }
            },
            |err| {
                tracing::error!("Audio capture error: {}", err);
            },
            None,
        )
        .map_err(|e| CaptureError::StreamBuild(e.to_string()))?;

    stream
        .play()
        .map_err(|e| CaptureError::StreamPlay(e.to_string()))?;

    Ok(stream)
}

fn find_best_input_config(device: &Device) -> Result<StreamConfig, CaptureError> {
    let configs = device
        .supported_input_configs()
        .map_err(|e| CaptureError::UnsupportedConfig(e.to_string()))?;

    select_best_config(configs.collect())
}

/// Priorität: 48kHz F32 > F32 mit bester Rate > erste verfügbare
fn select_best_config(
    configs: Vec<SupportedStreamConfigRange>,
) -> Result<StreamConfig, CaptureError> {
    let target_rate = cpal::SampleRate(SAMPLE_RATE);

    if let Some(config) = configs
        .iter()
        .find(|c| supports_rate(c, target_rate) && c.sample_format() == SampleFormat::F32)
    {
        return Ok(config.clone().with_sample_rate(target_rate).into());
    }

    if let Some(config) = configs.iter().find(|c| c.sample_format() == SampleFormat::F32) {
        let rate = if supports_rate(config, target_rate) {
            target_rate
        } else {
            config.max_sample_rate()
        };
        return Ok(config.clone().with_sample_rate(rate).into());
    }

    configs
        .first()
        .map(|c| c.clone().with_max_sample_rate().into())
        .ok_or_else(|| {
            CaptureError::UnsupportedConfig("No suitable audio configuration found".to_string())
        })
}

fn supports_rate(config: &SupportedStreamConfigRange, rate: cpal::SampleRate) -> bool {
    config.min_sample_rate() <= rate && config.max_sample_rate() >= rate
}

/// Mittelt interleavte Kanäle zu Mono
fn downmix(data: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return data.to_vec();
    }
    data.chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// Einfaches Linear-Resampling
fn resample_linear(data: &[f32], source_rate: u32, target_rate: u32) -> Vec<f32> {
    if source_rate == target_rate || source_rate == 0 {
        return data.to_vec();
    }
    let ratio = target_rate as f32 / source_rate as f32;
    let new_len = (data.len() as f32 * ratio) as usize;
    (0..new_len)
        .map(|i| {
            let src_idx = i as f32 / ratio;
            let idx = src_idx as usize;
            let frac = src_idx - idx as f32;
            let s1 = data.get(idx).copied().unwrap_or(0.0);
            let s2 = data.get(idx + 1).copied().unwrap_or(s1);
            s1 + (s2 - s1) * frac
        })
        .collect()
}
