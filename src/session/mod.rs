//! Live capture session: microphone to streaming transcript
//!
//! A `LiveSession` owns the microphone and the streaming channel for its
//! lifetime and drives the state machine
//! `Idle -> RequestingDevice -> Connecting -> Active -> {Stopped | Error}`.
//! Both terminal states release the device and the channel; a channel
//! failure is surfaced as `Error` with a reason string and is never
//! retried - the caller decides whether to start a new session.

mod connection;
mod error;
mod helpers;
mod state;
mod wire;

pub use error::SessionError;
pub use state::{SessionState, Speaker, TranscriptLine};
pub use wire::TranscriptEvent;

use crate::audio::{self, CaptureHandle};
use crate::config::SessionConfig;
use connection::{build_ws_request, build_ws_url, send_setup, spawn_receive_task, spawn_send_task};
use error::WS_CONNECT_TIMEOUT_SECS;
use futures_util::{SinkExt, StreamExt};
use state::SessionData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tracing::{info, warn};

/// Completion notification, fired exactly once when the session
/// terminates, whether by `stop()`, an error, or teardown
type StopCallback = Box<dyn FnOnce() + Send>;

/// One live transcription run
///
/// `start()` runs the full session to completion; `stop()` may be called
/// from any other task at any point and always converges the session to
/// `Stopped`.
pub struct LiveSession {
    config: SessionConfig,
    data: Arc<Mutex<SessionData>>,
    event_tx: broadcast::Sender<TranscriptEvent>,
    should_stop: Arc<AtomicBool>,
    capture: Mutex<Option<CaptureHandle>>,
    stop_signal: Mutex<Option<mpsc::Sender<()>>>,
    on_stopped: Mutex<Option<StopCallback>>,
}

impl LiveSession {
    /// Create a session in the `Idle` state
    pub fn new(config: SessionConfig) -> Self {
        let (event_tx, _) = broadcast::channel(100);
        Self {
            config,
            data: Arc::new(Mutex::new(SessionData::default())),
            event_tx,
            should_stop: Arc::new(AtomicBool::new(false)),
            capture: Mutex::new(None),
            stop_signal: Mutex::new(None),
            on_stopped: Mutex::new(None),
        }
    }

    /// Register the completion notification
    pub fn set_stop_callback(&self, callback: StopCallback) {
        if let Ok(mut guard) = self.on_stopped.lock() {
            *guard = Some(callback);
        }
    }

    /// Subscribe to transcript events as they arrive from the channel
    pub fn subscribe(&self) -> broadcast::Receiver<TranscriptEvent> {
        self.event_tx.subscribe()
    }

    /// Current lifecycle state
    pub fn state(&self) -> SessionState {
        self.data
            .lock()
            .map(|d| d.state)
            .unwrap_or(SessionState::Error)
    }

    /// The finalized transcript log in append order
    pub fn transcript(&self) -> Vec<TranscriptLine> {
        self.data
            .lock()
            .map(|d| d.transcript.clone())
            .unwrap_or_default()
    }

    /// Human-readable reason for the `Error` state, if any
    pub fn error_reason(&self) -> Option<String> {
        self.data.lock().ok().and_then(|d| d.error_reason.clone())
    }

    /// Run the session to completion
    ///
    /// Acquires the default input device, connects the streaming channel,
    /// and pumps audio out and transcript events in until the session
    /// terminates. Startup failures release every partially-acquired
    /// resource and leave the session in `Error`; a clean run ends in
    /// `Stopped`.
    pub async fn start(&self) -> Result<(), SessionError> {
        // The credential check precedes any device or network action, so
        // a misconfigured caller never triggers a microphone prompt
        if self.config.api_key.trim().is_empty() {
            return Err(self.fail_start(SessionError::CredentialMissing));
        }

        {
            let Ok(mut d) = self.data.lock() else {
                return Err(self.fail_start(SessionError::AlreadyStarted));
            };
            if d.state != SessionState::Idle {
                return Err(SessionError::AlreadyStarted);
            }
            d.state = SessionState::RequestingDevice;
        }

        // Device acquisition blocks on the audio host; keep it off the
        // async executor
        let capture_result = tokio::task::spawn_blocking(audio::start_capture).await;
        let (capture_handle, mut frame_rx) = match capture_result {
            Ok(Ok(capture)) => capture,
            Ok(Err(e)) => return Err(self.fail_start(SessionError::DeviceUnavailable(e))),
            Err(e) => {
                return Err(self.fail_start(SessionError::ChannelConnectFailed(format!(
                    "capture task failed: {}",
                    e
                ))))
            }
        };

        if let Ok(mut guard) = self.capture.lock() {
            *guard = Some(capture_handle);
        }

        if self.should_stop.load(Ordering::SeqCst) {
            // stop() raced device acquisition
            self.finalize();
            return Ok(());
        }

        if let Ok(mut d) = self.data.lock() {
            d.state = SessionState::Connecting;
        }

        let ws_url = build_ws_url(&self.config.api_key);
        let host = match url::Url::parse(&ws_url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
        {
            Some(host) => host,
            None => {
                return Err(self.fail_start(SessionError::ChannelConnectFailed(
                    "invalid endpoint URL".to_string(),
                )))
            }
        };

        info!(model = %self.config.model, "Connecting to live transcription channel");

        let request = match build_ws_request(&ws_url, &host) {
            Ok(request) => request,
            Err(e) => return Err(self.fail_start(SessionError::ChannelConnectFailed(e))),
        };

        let ws_stream = match timeout(
            Duration::from_secs(WS_CONNECT_TIMEOUT_SECS),
            connect_async(request),
        )
        .await
        {
            Ok(Ok((stream, _response))) => stream,
            Ok(Err(e)) => {
                return Err(self.fail_start(SessionError::ChannelConnectFailed(e.to_string())))
            }
            Err(_) => return Err(self.fail_start(SessionError::ConnectTimeout)),
        };

        let (mut ws_sink, ws_recv) = ws_stream.split();

        if let Err(e) = send_setup(
            &mut ws_sink,
            &self.config.model,
            &self.config.system_instruction,
        )
        .await
        {
            return Err(self.fail_start(SessionError::ChannelConnectFailed(e)));
        }

        // Frames captured while connecting are dropped, never queued
        let mut dropped = 0usize;
        while frame_rx.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            warn!("Dropped {} frames captured before the channel opened", dropped);
        }

        if self.should_stop.load(Ordering::SeqCst) {
            // stop() raced the connect phase
            let _ = ws_sink.close().await;
            self.finalize();
            return Ok(());
        }

        if let Ok(mut d) = self.data.lock() {
            d.state = SessionState::Active;
        }
        info!("Live capture session active");

        let (stop_tx, stop_rx) = mpsc::channel(1);
        if let Ok(mut guard) = self.stop_signal.lock() {
            *guard = Some(stop_tx);
        }

        let recv_task = spawn_receive_task(
            ws_recv,
            self.data.clone(),
            self.event_tx.clone(),
            self.should_stop.clone(),
        );
        let send_task = spawn_send_task(
            ws_sink,
            frame_rx,
            stop_rx,
            self.data.clone(),
            self.should_stop.clone(),
        );

        // The receive half exits on close, error, or stop; then wake the
        // send half so it releases the sink
        let _ = recv_task.await;
        if let Ok(mut guard) = self.stop_signal.lock() {
            if let Some(tx) = guard.take() {
                let _ = tx.try_send(());
            }
        }
        let _ = send_task.await;

        self.finalize();
        Ok(())
    }

    /// Stop the session
    ///
    /// Idempotent and callable from any state: releases the device
    /// immediately, closes the channel if one is open, converges to
    /// `Stopped`, and fires the completion notification exactly once
    /// across all stop paths.
    pub fn stop(&self) {
        self.should_stop.store(true, Ordering::SeqCst);
        self.release_capture();
        if let Ok(mut guard) = self.stop_signal.lock() {
            if let Some(tx) = guard.take() {
                let _ = tx.try_send(());
            }
        }
        if let Ok(mut d) = self.data.lock() {
            d.state = SessionState::Stopped;
        }
        self.notify_stopped();
    }

    /// Stop capture and drop the device handle, if still held
    fn release_capture(&self) {
        if let Ok(mut guard) = self.capture.lock() {
            if let Some(mut handle) = guard.take() {
                handle.stop();
            }
        }
    }

    /// Release resources and settle the terminal state after the channel
    /// tasks have exited
    fn finalize(&self) {
        self.release_capture();
        if let Ok(mut d) = self.data.lock() {
            if !d.state.is_terminal() {
                d.state = SessionState::Stopped;
            }
        }
        self.notify_stopped();
    }

    /// Record a startup failure: release everything acquired so far and
    /// move to `Error` before the error is returned to the caller
    fn fail_start(&self, err: SessionError) -> SessionError {
        self.release_capture();
        if let Ok(mut d) = self.data.lock() {
            d.fail(err.to_string());
        }
        self.notify_stopped();
        err
    }

    /// Fire the completion notification; a no-op after the first call
    fn notify_stopped(&self) {
        let callback = self.on_stopped.lock().ok().and_then(|mut g| g.take());
        if let Some(callback) = callback {
            callback();
        }
    }
}

impl Drop for LiveSession {
    fn drop(&mut self) {
        // Teardown while active behaves like stop()
        self.should_stop.store(true, Ordering::SeqCst);
        self.release_capture();
        self.notify_stopped();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn test_config(api_key: &str) -> SessionConfig {
        SessionConfig {
            api_key: api_key.to_string(),
            model: "models/test-model".to_string(),
            system_instruction: "You are a scribe.".to_string(),
        }
    }

    fn counting_callback(session: &LiveSession) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        session.set_stop_callback(Box::new(move || {
            count_clone.fetch_add(1, Ordering::SeqCst);
        }));
        count
    }

    #[test]
    fn new_session_is_idle_with_empty_transcript() {
        let session = LiveSession::new(test_config("key"));
        assert_eq!(session.state(), SessionState::Idle);
        assert!(session.transcript().is_empty());
        assert!(session.error_reason().is_none());
    }

    #[tokio::test]
    async fn missing_credential_fails_before_device_acquisition() {
        let session = LiveSession::new(test_config(""));
        let notifications = counting_callback(&session);

        let err = session.start().await.unwrap_err();
        assert!(matches!(err, SessionError::CredentialMissing));
        // The device was never requested, so no capture handle exists
        assert!(session.capture.lock().unwrap().is_none());
        assert_eq!(session.state(), SessionState::Error);
        assert_eq!(notifications.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn whitespace_credential_counts_as_missing() {
        let session = LiveSession::new(test_config("   "));
        let err = session.start().await.unwrap_err();
        assert!(matches!(err, SessionError::CredentialMissing));
    }

    #[tokio::test]
    async fn starting_twice_is_rejected() {
        let session = LiveSession::new(test_config("key"));
        session.data.lock().unwrap().state = SessionState::Active;
        let err = session.start().await.unwrap_err();
        assert!(matches!(err, SessionError::AlreadyStarted));
        // The running session is left untouched
        assert_eq!(session.state(), SessionState::Active);
    }

    #[test]
    fn stop_is_idempotent_with_one_notification() {
        let session = LiveSession::new(test_config("key"));
        let notifications = counting_callback(&session);

        session.stop();
        session.stop();
        session.stop();

        assert_eq!(session.state(), SessionState::Stopped);
        assert_eq!(notifications.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stop_before_any_channel_exists_completes_cleanly() {
        let session = LiveSession::new(test_config("key"));
        let notifications = counting_callback(&session);
        // Simulate a session still waiting on the device
        session.data.lock().unwrap().state = SessionState::RequestingDevice;

        session.stop();

        assert_eq!(session.state(), SessionState::Stopped);
        assert!(session.stop_signal.lock().unwrap().is_none());
        assert_eq!(notifications.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stop_after_error_converges_to_stopped_without_renotifying() {
        let session = LiveSession::new(test_config("key"));
        let notifications = counting_callback(&session);

        session.data.lock().unwrap().fail("channel failure");
        session.finalize();
        assert_eq!(session.state(), SessionState::Error);
        assert_eq!(notifications.load(Ordering::SeqCst), 1);

        session.stop();
        assert_eq!(session.state(), SessionState::Stopped);
        assert_eq!(notifications.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn drop_fires_the_completion_notification() {
        let session = LiveSession::new(test_config("key"));
        let notifications = counting_callback(&session);
        drop(session);
        assert_eq!(notifications.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn events_reach_subscribers() {
        let session = LiveSession::new(test_config("key"));
        let mut rx = session.subscribe();
        session
            .event_tx
            .send(TranscriptEvent::FinalInput("Hi".to_string()))
            .unwrap();
        assert_eq!(
            rx.try_recv().unwrap(),
            TranscriptEvent::FinalInput("Hi".to_string())
        );
    }
}
