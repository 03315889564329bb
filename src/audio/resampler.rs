//! Sample processing: mono mixdown, resampling, and frame assembly

use super::types::AudioFrame;
use super::SERVICE_SAMPLE_RATE;
use rubato::{Resampler, SincFixedIn};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{error, warn};

/// Frame size in samples (4096 samples at 16 kHz, about 256 ms)
pub(crate) const FRAME_SIZE: usize = 4096;

/// Process incoming audio samples: convert to mono, optionally resample,
/// buffer, and send complete frames
///
/// Runs on the cpal callback thread and must never block; frames are
/// handed off with `try_send` and dropped on overflow.
pub(crate) fn process_samples(
    data: &[i16],
    channels: usize,
    input_buffer: &Arc<Mutex<Vec<i16>>>,
    input_frame_size: usize,
    output_buffer: &Arc<Mutex<Vec<i16>>>,
    sender: &mpsc::Sender<AudioFrame>,
    resampler: &Option<Arc<Mutex<SincFixedIn<f32>>>>,
) {
    // Convert to mono by averaging channels
    let mono_samples: Vec<i16> = if channels > 1 {
        data.chunks(channels)
            .map(|frame| {
                let sum: i32 = frame.iter().map(|&s| s as i32).sum();
                (sum / channels as i32) as i16
            })
            .collect()
    } else {
        data.to_vec()
    };

    if let Some(resampler_arc) = resampler {
        resample_into_output(
            &mono_samples,
            input_buffer,
            input_frame_size,
            output_buffer,
            resampler_arc,
        );
    } else if let Ok(mut output_buf) = output_buffer.lock() {
        output_buf.extend(&mono_samples);
    }

    send_frames(output_buffer, sender);
}

/// Push samples through the resampler into the output buffer
fn resample_into_output(
    mono_samples: &[i16],
    input_buffer: &Arc<Mutex<Vec<i16>>>,
    input_frame_size: usize,
    output_buffer: &Arc<Mutex<Vec<i16>>>,
    resampler_arc: &Arc<Mutex<SincFixedIn<f32>>>,
) {
    let Ok(mut input_buf) = input_buffer.lock() else {
        return;
    };
    input_buf.extend(mono_samples);

    // Process complete blocks through the resampler
    while input_buf.len() >= input_frame_size {
        let input_f32: Vec<f32> = input_buf
            .drain(..input_frame_size)
            .map(|s| s as f32 / 32768.0)
            .collect();

        let Ok(mut resampler) = resampler_arc.lock() else {
            return;
        };
        match resampler.process(&[input_f32], None) {
            Ok(resampled) => {
                let output_i16 = resampled[0]
                    .iter()
                    .map(|&s| (s.clamp(-1.0, 1.0) * 32767.0) as i16);
                if let Ok(mut output_buf) = output_buffer.lock() {
                    output_buf.extend(output_i16);
                }
            }
            Err(e) => {
                error!("Resampling error: {}", e);
            }
        }
    }
}

/// Send complete frames from the output buffer
fn send_frames(output_buffer: &Arc<Mutex<Vec<i16>>>, sender: &mpsc::Sender<AudioFrame>) {
    if let Ok(mut output_buf) = output_buffer.lock() {
        while output_buf.len() >= FRAME_SIZE {
            let frame = AudioFrame {
                samples: output_buf.drain(..FRAME_SIZE).collect(),
                sample_rate: SERVICE_SAMPLE_RATE,
            };
            // try_send keeps the audio callback non-blocking
            if let Err(e) = sender.try_send(frame) {
                warn!("Audio frame buffer full - frame dropped: {}", e);
                return;
            }
        }
    }
}
