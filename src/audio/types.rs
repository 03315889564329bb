//! Audio frame and capture handle definitions

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::info;

/// One block of captured microphone audio, ready for the streaming channel
///
/// Samples are mono 16-bit signed PCM at the service sample rate (16 kHz).
/// Frames are produced by the capture callback, transmitted once, and
/// discarded; they are never retained.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// PCM 16-bit signed samples (mono)
    pub samples: Vec<i16>,
    /// Sample rate in Hz (16000 after resampling)
    pub sample_rate: u32,
}

impl AudioFrame {
    /// Serialize the samples as little-endian PCM16 bytes for the wire
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.samples.iter().flat_map(|&s| s.to_le_bytes()).collect()
    }
}

/// Handle for controlling microphone capture from outside the capture thread
///
/// Stopping is idempotent, and capture also stops when the handle is
/// dropped. A cpal callback that fires after `stop()` is a no-op.
pub struct CaptureHandle {
    pub(crate) is_capturing: Arc<AtomicBool>,
    pub(crate) thread_handle: Option<JoinHandle<()>>,
}

impl CaptureHandle {
    /// Stop capturing audio and wait for the capture thread to exit
    pub fn stop(&mut self) {
        if !self.is_capturing.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
        info!("Microphone capture stopped");
    }

    /// Check if currently capturing
    pub fn is_capturing(&self) -> bool {
        self.is_capturing.load(Ordering::SeqCst)
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Errors that can occur while acquiring or running the input device
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("No audio input device found")]
    NoInputDevice,

    #[error("No supported audio configuration found")]
    NoSupportedConfig,

    #[error("Audio configuration error: {0}")]
    ConfigError(String),

    #[error("Unsupported audio format: {0}")]
    UnsupportedFormat(String),

    #[error("Audio device error: {0}")]
    DeviceError(#[from] cpal::DevicesError),

    #[error("Audio stream error: {0}")]
    StreamError(#[from] cpal::BuildStreamError),

    #[error("Audio play error: {0}")]
    PlayError(#[from] cpal::PlayStreamError),

    #[error("Default config error: {0}")]
    DefaultConfigError(#[from] cpal::DefaultStreamConfigError),
}
