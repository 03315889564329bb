//! Microphone capture using cpal for cross-platform audio input
//!
//! Captures audio from the default input device, resamples it to the
//! 16 kHz mono PCM format the streaming service expects, and delivers it
//! as fixed-size frames over an async channel.

mod resampler;
mod types;

pub use types::{AudioFrame, CaptureError, CaptureHandle};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::SampleFormat;
use resampler::{process_samples, FRAME_SIZE};
use rubato::{SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Sample rate the streaming service expects (16 kHz)
pub const SERVICE_SAMPLE_RATE: u32 = 16000;

/// Start microphone capture on a dedicated thread
///
/// Acquires the default audio input device and begins capturing. Audio is
/// mixed down to mono, resampled to 16 kHz if necessary, and delivered as
/// 4096-sample `AudioFrame`s.
///
/// # Returns
/// A tuple containing:
/// - `CaptureHandle` - Used to stop capture and check status
/// - `mpsc::Receiver<AudioFrame>` - Receives frames for streaming
///
/// # Errors
/// Returns `CaptureError` if no input device is available, no supported
/// configuration is found, or the stream cannot be started. Acquisition
/// happens on the capture thread; this call waits for its outcome so the
/// caller observes device failures synchronously.
pub fn start_capture() -> Result<(CaptureHandle, mpsc::Receiver<AudioFrame>), CaptureError> {
    let is_capturing = Arc::new(AtomicBool::new(true));
    let is_capturing_clone = is_capturing.clone();

    let (frame_tx, frame_rx) = mpsc::channel(64);
    let (ready_tx, ready_rx) = std::sync::mpsc::channel();

    let thread_handle = thread::spawn(move || {
        run_capture(is_capturing_clone, frame_tx, ready_tx);
    });

    match ready_rx.recv() {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            let _ = thread_handle.join();
            return Err(e);
        }
        Err(_) => {
            // Capture thread died before reporting readiness
            let _ = thread_handle.join();
            return Err(CaptureError::ConfigError(
                "capture thread exited during setup".to_string(),
            ));
        }
    }

    let handle = CaptureHandle {
        is_capturing,
        thread_handle: Some(thread_handle),
    };

    Ok((handle, frame_rx))
}

/// Run capture on the current thread until the handle is stopped (blocking)
///
/// The setup outcome is reported over `ready_tx` once the stream is
/// playing (or as soon as acquisition fails).
fn run_capture(
    is_capturing: Arc<AtomicBool>,
    frame_tx: mpsc::Sender<AudioFrame>,
    ready_tx: std::sync::mpsc::Sender<Result<(), CaptureError>>,
) {
    if let Err(e) = setup_and_run(is_capturing, frame_tx, &ready_tx) {
        error!("Microphone capture error: {}", e);
        // After a successful setup report this send lands on a
        // disconnected channel and is a no-op
        let _ = ready_tx.send(Err(e));
    }
}

fn setup_and_run(
    is_capturing: Arc<AtomicBool>,
    frame_tx: mpsc::Sender<AudioFrame>,
    ready_tx: &std::sync::mpsc::Sender<Result<(), CaptureError>>,
) -> Result<(), CaptureError> {
    let host = cpal::default_host();

    let device = host
        .default_input_device()
        .ok_or(CaptureError::NoInputDevice)?;

    let device_name = device.name().unwrap_or_else(|_| "Unknown".to_string());
    info!("Using audio input device: {}", device_name);

    // Prefer a config that can open directly at the service rate,
    // otherwise take any supported rate and resample
    let supported_configs = device
        .supported_input_configs()
        .map_err(|e| CaptureError::ConfigError(e.to_string()))?;

    let mut best_config = None;
    let mut found_service_rate = false;

    for config in supported_configs {
        if config.channels() == 0 {
            continue;
        }
        if config.min_sample_rate().0 <= SERVICE_SAMPLE_RATE
            && config.max_sample_rate().0 >= SERVICE_SAMPLE_RATE
        {
            best_config = Some(config.with_sample_rate(cpal::SampleRate(SERVICE_SAMPLE_RATE)));
            found_service_rate = true;
            break;
        } else if best_config.is_none() {
            best_config = Some(config.with_max_sample_rate());
        }
    }

    let supported_config = best_config.ok_or(CaptureError::NoSupportedConfig)?;

    if !found_service_rate {
        warn!(
            "{}Hz not supported, capturing at {}Hz and resampling",
            SERVICE_SAMPLE_RATE,
            supported_config.sample_rate().0
        );
    }

    let sample_format = supported_config.sample_format();
    let config: cpal::StreamConfig = supported_config.into();
    let sample_rate = config.sample_rate.0;
    let channels = config.channels as usize;

    info!("Audio config: {} channels, {} Hz", channels, sample_rate);

    // Create resampler if the device rate doesn't match the service rate
    let (resampler, input_frame_size): (Option<Arc<Mutex<SincFixedIn<f32>>>>, usize) =
        if sample_rate != SERVICE_SAMPLE_RATE {
            info!(
                "Creating resampler: {} Hz -> {} Hz",
                sample_rate, SERVICE_SAMPLE_RATE
            );
            let params = SincInterpolationParameters {
                sinc_len: 256,
                f_cutoff: 0.95,
                interpolation: SincInterpolationType::Linear,
                oversampling_factor: 256,
                window: WindowFunction::BlackmanHarris2,
            };
            // Input block size that yields one service-rate frame
            let input_frames = (FRAME_SIZE as f64 * sample_rate as f64
                / SERVICE_SAMPLE_RATE as f64)
                .ceil() as usize;
            match SincFixedIn::<f32>::new(
                SERVICE_SAMPLE_RATE as f64 / sample_rate as f64,
                2.0,
                params,
                input_frames,
                1, // mono
            ) {
                Ok(resampler) => (Some(Arc::new(Mutex::new(resampler))), input_frames),
                Err(e) => {
                    error!("Failed to create resampler: {}", e);
                    (None, FRAME_SIZE)
                }
            }
        } else {
            (None, FRAME_SIZE)
        };

    // Accumulates device-rate samples awaiting resampling
    let input_buffer: Arc<Mutex<Vec<i16>>> =
        Arc::new(Mutex::new(Vec::with_capacity(input_frame_size * 2)));
    // Accumulates service-rate samples awaiting frame assembly
    let output_buffer: Arc<Mutex<Vec<i16>>> =
        Arc::new(Mutex::new(Vec::with_capacity(FRAME_SIZE * 2)));

    let err_callback = |err| {
        error!("Audio stream error: {}", err);
    };

    let stream = match sample_format {
        SampleFormat::I16 => {
            let is_capturing_i16 = is_capturing.clone();
            let input_buffer_i16 = input_buffer.clone();
            let output_buffer_i16 = output_buffer.clone();
            let frame_tx_i16 = frame_tx.clone();
            let resampler_i16 = resampler.clone();
            device.build_input_stream(
                &config,
                move |data: &[i16], _| {
                    if !is_capturing_i16.load(Ordering::SeqCst) {
                        return;
                    }
                    process_samples(
                        data,
                        channels,
                        &input_buffer_i16,
                        input_frame_size,
                        &output_buffer_i16,
                        &frame_tx_i16,
                        &resampler_i16,
                    );
                },
                err_callback,
                None,
            )?
        }
        SampleFormat::F32 => {
            let is_capturing_f32 = is_capturing.clone();
            let input_buffer_f32 = input_buffer.clone();
            let output_buffer_f32 = output_buffer.clone();
            let frame_tx_f32 = frame_tx.clone();
            let resampler_f32 = resampler.clone();
            device.build_input_stream(
                &config,
                move |data: &[f32], _| {
                    if !is_capturing_f32.load(Ordering::SeqCst) {
                        return;
                    }
                    let samples: Vec<i16> = data
                        .iter()
                        .map(|&s| (s.clamp(-1.0, 1.0) * 32767.0) as i16)
                        .collect();
                    process_samples(
                        &samples,
                        channels,
                        &input_buffer_f32,
                        input_frame_size,
                        &output_buffer_f32,
                        &frame_tx_f32,
                        &resampler_f32,
                    );
                },
                err_callback,
                None,
            )?
        }
        sample_format => {
            return Err(CaptureError::UnsupportedFormat(format!(
                "{:?}",
                sample_format
            )));
        }
    };

    stream.play()?;
    info!("Microphone capture started");
    let _ = ready_tx.send(Ok(()));

    // Keep the stream alive until capture is stopped
    while is_capturing.load(Ordering::SeqCst) {
        thread::sleep(std::time::Duration::from_millis(100));
    }

    drop(stream);
    Ok(())
}
