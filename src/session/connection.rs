//! Gemini Live WebSocket connection handling
//!
//! Builds the upgrade request, sends the setup message, and runs the
//! send and receive halves of the channel as separate tasks. A lost or
//! failed channel is terminal for the session; there is no reconnect.

use super::state::{SessionData, SessionState};
use super::wire::{ClientMessage, ServerMessage, SetupConfig, TranscriptEvent};
use crate::audio::AudioFrame;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::interval;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, trace, warn};

/// Ping interval in seconds to keep the WebSocket connection alive
const PING_INTERVAL_SECS: u64 = 30;

/// Gemini Live bidirectional streaming endpoint
const LIVE_ENDPOINT: &str =
    "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Build the WebSocket URL with key authentication
pub(crate) fn build_ws_url(api_key: &str) -> String {
    format!("{}?key={}", LIVE_ENDPOINT, api_key)
}

/// Build the WebSocket upgrade request
pub(crate) fn build_ws_request(ws_url: &str, host: &str) -> Result<http::Request<()>, String> {
    http::Request::builder()
        .uri(ws_url)
        .header("Host", host)
        .header("Upgrade", "websocket")
        .header("Connection", "Upgrade")
        .header("Sec-WebSocket-Key", super::helpers::generate_ws_key())
        .header("Sec-WebSocket-Version", "13")
        .body(())
        .map_err(|e| e.to_string())
}

/// Send the session setup message that configures the channel for
/// audio-only responses with transcription on both directions
pub(crate) async fn send_setup<S>(
    ws_sink: &mut S,
    model: &str,
    system_instruction: &str,
) -> Result<(), String>
where
    S: SinkExt<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    let msg = ClientMessage::Setup(SetupConfig::new(model, system_instruction));
    let json = serde_json::to_string(&msg).map_err(|e| e.to_string())?;
    debug!("Sending setup: {}", json);

    ws_sink
        .send(Message::Text(json))
        .await
        .map_err(|e| e.to_string())
}

/// Spawn the receive task that turns inbound messages into transcript
/// events, applies them to the session state, and re-broadcasts them
pub(crate) fn spawn_receive_task(
    mut ws_stream: impl StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
        + Unpin
        + Send
        + 'static,
    data: Arc<Mutex<SessionData>>,
    event_tx: broadcast::Sender<TranscriptEvent>,
    should_stop: Arc<AtomicBool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(msg_result) = ws_stream.next().await {
            if should_stop.load(Ordering::SeqCst) {
                break;
            }

            match msg_result {
                Ok(Message::Text(text)) => {
                    handle_server_json(text.as_bytes(), &data, &event_tx);
                }
                Ok(Message::Binary(bytes)) => {
                    // The service may deliver JSON frames as binary
                    handle_server_json(&bytes, &data, &event_tx);
                }
                Ok(Message::Close(frame)) => {
                    info!(?frame, "Channel closed by server");
                    dispatch_event(TranscriptEvent::ChannelClosed, &data, &event_tx);
                    break;
                }
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {
                    trace!("WebSocket keepalive");
                }
                Err(e) => {
                    error!("Channel receive error: {}", e);
                    dispatch_event(TranscriptEvent::ChannelError(e.to_string()), &data, &event_tx);
                    break;
                }
                _ => {}
            }

            // A terminal event ends the session; stop reading
            if data
                .lock()
                .map(|d| d.state.is_terminal())
                .unwrap_or(true)
            {
                break;
            }
        }
    })
}

/// Parse one server JSON frame and dispatch the events it carries
fn handle_server_json(
    raw: &[u8],
    data: &Arc<Mutex<SessionData>>,
    event_tx: &broadcast::Sender<TranscriptEvent>,
) {
    match serde_json::from_slice::<ServerMessage>(raw) {
        Ok(msg) => {
            if msg.is_setup_complete() {
                info!("Channel setup acknowledged");
            }
            for event in msg.into_events() {
                dispatch_event(event, data, event_tx);
            }
        }
        Err(e) => {
            warn!(
                "Failed to parse server message: {} - {}",
                e,
                String::from_utf8_lossy(raw)
            );
        }
    }
}

/// Apply an event to the session state and re-broadcast it to subscribers
fn dispatch_event(
    event: TranscriptEvent,
    data: &Arc<Mutex<SessionData>>,
    event_tx: &broadcast::Sender<TranscriptEvent>,
) {
    if let Ok(mut d) = data.lock() {
        d.apply_event(&event);
    }
    let _ = event_tx.send(event);
}

/// Spawn the send task that forwards captured audio frames
///
/// Frames are base64 enveloped and transmitted in capture order,
/// fire-and-forget. Frames that arrive while the session is not `Active`
/// are dropped, never queued.
pub(crate) fn spawn_send_task<S>(
    mut ws_sink: S,
    mut frame_rx: mpsc::Receiver<AudioFrame>,
    mut stop_rx: mpsc::Receiver<()>,
    data: Arc<Mutex<SessionData>>,
    should_stop: Arc<AtomicBool>,
) -> tokio::task::JoinHandle<()>
where
    S: SinkExt<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        debug!("Send task started");
        let base64_engine = base64::engine::general_purpose::STANDARD;
        let mut frames_sent = 0u64;

        let mut ping_interval = interval(Duration::from_secs(PING_INTERVAL_SECS));
        ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                _ = stop_rx.recv() => {
                    debug!("Send task received stop signal");
                    let _ = ws_sink.close().await;
                    break;
                }
                _ = ping_interval.tick() => {
                    if ws_sink.send(Message::Ping(vec![])).await.is_err() {
                        warn!("Failed to send keepalive ping");
                        break;
                    }
                }
                frame = frame_rx.recv() => {
                    match frame {
                        Some(frame) => {
                            if should_stop.load(Ordering::SeqCst) {
                                let _ = ws_sink.close().await;
                                break;
                            }
                            if !session_is_active(&data) {
                                trace!("Dropping frame: session not active");
                                continue;
                            }
                            let audio_base64 = base64_engine.encode(frame.to_le_bytes());
                            let msg = ClientMessage::audio_input(audio_base64);
                            match serde_json::to_string(&msg) {
                                Ok(json) => {
                                    if ws_sink.send(Message::Text(json)).await.is_err() {
                                        // The receive half reports the failure
                                        warn!("Failed to send audio frame");
                                        break;
                                    }
                                    frames_sent += 1;
                                    if frames_sent == 1 || frames_sent % 100 == 0 {
                                        debug!(
                                            "Sent frame #{} ({} samples)",
                                            frames_sent,
                                            frame.samples.len()
                                        );
                                    }
                                }
                                Err(e) => error!("Failed to encode audio frame: {}", e),
                            }
                        }
                        None => {
                            // Capture stopped; close the channel cleanly
                            debug!("Frame channel closed after {} frames", frames_sent);
                            let _ = ws_sink.close().await;
                            break;
                        }
                    }
                }
            }
        }

        info!("Send task exiting after {} frames", frames_sent);
    })
}

fn session_is_active(data: &Arc<Mutex<SessionData>>) -> bool {
    data.lock()
        .map(|d| d.state == SessionState::Active)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{stream, Sink};
    use std::pin::Pin;
    use std::task::{Context, Poll};

    /// Sink that records everything sent through it
    #[derive(Clone)]
    struct RecordingSink {
        sent: Arc<Mutex<Vec<Message>>>,
    }

    impl RecordingSink {
        fn new() -> Self {
            Self {
                sent: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn sent_texts(&self) -> Vec<String> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter_map(|m| match m {
                    Message::Text(t) => Some(t.clone()),
                    _ => None,
                })
                .collect()
        }
    }

    impl Sink<Message> for RecordingSink {
        type Error = tokio_tungstenite::tungstenite::Error;

        fn poll_ready(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn start_send(self: Pin<&mut Self>, item: Message) -> Result<(), Self::Error> {
            self.sent.lock().unwrap().push(item);
            Ok(())
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn poll_close(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }
    }

    fn test_frame() -> AudioFrame {
        AudioFrame {
            samples: vec![1i16; 4],
            sample_rate: 16000,
        }
    }

    async fn run_send_task_with_state(state: SessionState, frames: usize) -> Vec<String> {
        let sink = RecordingSink::new();
        let data = Arc::new(Mutex::new(SessionData::default()));
        data.lock().unwrap().state = state;

        let (frame_tx, frame_rx) = mpsc::channel(16);
        for _ in 0..frames {
            frame_tx.try_send(test_frame()).unwrap();
        }
        // Closing the frame channel ends the task after the queue drains
        drop(frame_tx);

        let (_stop_tx, stop_rx) = mpsc::channel(1);
        spawn_send_task(
            sink.clone(),
            frame_rx,
            stop_rx,
            data,
            Arc::new(AtomicBool::new(false)),
        )
        .await
        .unwrap();

        sink.sent_texts()
    }

    #[tokio::test]
    async fn frames_before_active_are_dropped_not_queued() {
        let sent = run_send_task_with_state(SessionState::Connecting, 3).await;
        assert!(sent.is_empty(), "no frame may be transmitted before Active");
    }

    #[tokio::test]
    async fn frames_while_active_are_transmitted_in_order() {
        let sent = run_send_task_with_state(SessionState::Active, 2).await;
        assert_eq!(sent.len(), 2);
        for json in &sent {
            assert!(json.contains("\"realtimeInput\""));
            assert!(json.contains("\"mimeType\":\"audio/pcm;rate=16000\""));
        }
    }

    #[tokio::test]
    async fn late_frames_after_an_error_are_a_no_op() {
        let sent = run_send_task_with_state(SessionState::Error, 2).await;
        assert!(sent.is_empty());
    }

    #[test]
    fn ws_url_carries_key_auth() {
        let url = build_ws_url("test-key");
        assert!(url.starts_with("wss://generativelanguage.googleapis.com/"));
        assert!(url.ends_with("?key=test-key"));
    }

    #[test]
    fn ws_request_is_a_valid_upgrade() {
        let url = build_ws_url("test-key");
        let request = build_ws_request(&url, "generativelanguage.googleapis.com").unwrap();
        assert_eq!(request.headers()["Upgrade"], "websocket");
        assert_eq!(request.headers()["Sec-WebSocket-Version"], "13");
    }

    #[tokio::test]
    async fn receive_task_applies_scripted_events_in_order() {
        let frames = vec![
            Ok(Message::Text(
                r#"{"setupComplete":{}}"#.to_string(),
            )),
            Ok(Message::Text(
                r#"{"serverContent":{"outputTranscription":{"text":"Hel"}}}"#.to_string(),
            )),
            Ok(Message::Text(
                r#"{"serverContent":{"outputTranscription":{"text":"lo"}}}"#.to_string(),
            )),
            Ok(Message::Text(
                r#"{"serverContent":{"turnComplete":true}}"#.to_string(),
            )),
            Ok(Message::Text(
                r#"{"serverContent":{"inputTranscription":{"text":"Hi there"}}}"#.to_string(),
            )),
        ];

        let data = Arc::new(Mutex::new(SessionData::default()));
        data.lock().unwrap().state = SessionState::Active;
        let (event_tx, _keep_alive) = broadcast::channel(16);
        let should_stop = Arc::new(AtomicBool::new(false));

        spawn_receive_task(
            stream::iter(frames),
            data.clone(),
            event_tx,
            should_stop,
        )
        .await
        .unwrap();

        let d = data.lock().unwrap();
        assert_eq!(
            d.transcript,
            vec![
                crate::session::TranscriptLine::model("Hello"),
                crate::session::TranscriptLine::user("Hi there"),
            ]
        );
        assert_eq!(d.state, SessionState::Active);
    }

    #[tokio::test]
    async fn receive_task_stops_reading_after_a_channel_error() {
        let frames = vec![
            Err(tokio_tungstenite::tungstenite::Error::ConnectionClosed),
            Ok(Message::Text(
                r#"{"serverContent":{"inputTranscription":{"text":"never seen"}}}"#.to_string(),
            )),
        ];

        let data = Arc::new(Mutex::new(SessionData::default()));
        data.lock().unwrap().state = SessionState::Active;
        let (event_tx, _keep_alive) = broadcast::channel(16);

        spawn_receive_task(
            stream::iter(frames),
            data.clone(),
            event_tx,
            Arc::new(AtomicBool::new(false)),
        )
        .await
        .unwrap();

        let d = data.lock().unwrap();
        assert_eq!(d.state, SessionState::Error);
        assert!(d.transcript.is_empty());
    }

    #[tokio::test]
    async fn receive_task_treats_remote_close_as_stopped() {
        let frames = vec![Ok(Message::Close(None))];

        let data = Arc::new(Mutex::new(SessionData::default()));
        data.lock().unwrap().state = SessionState::Active;
        let (event_tx, _keep_alive) = broadcast::channel(16);

        spawn_receive_task(
            stream::iter(frames),
            data.clone(),
            event_tx,
            Arc::new(AtomicBool::new(false)),
        )
        .await
        .unwrap();

        let d = data.lock().unwrap();
        assert_eq!(d.state, SessionState::Stopped);
        assert!(d.error_reason.is_none());
    }
}
