//! Error types for the live capture session

use crate::audio::CaptureError;

/// WebSocket connection timeout in seconds
pub(super) const WS_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Errors that terminate a session before or during startup
///
/// Mid-session channel failures are not returned from `start()`; they
/// surface as the terminal `Error` state with a reason string.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("No API key configured - set GEMINI_API_KEY")]
    CredentialMissing,

    #[error("Audio input device unavailable: {0}")]
    DeviceUnavailable(#[from] CaptureError),

    #[error("Failed to connect to the streaming service: {0}")]
    ChannelConnectFailed(String),

    #[error("Connection timeout - service did not respond within {WS_CONNECT_TIMEOUT_SECS} seconds")]
    ConnectTimeout,

    #[error("Session was already started")]
    AlreadyStarted,
}
