//! Session state machine and transcript accumulation
//!
//! The state here is mutated only by the session driver; event
//! application is synchronous so the transition rules can be tested
//! without a device or a network connection.

use super::wire::TranscriptEvent;
use tracing::{debug, warn};

/// Lifecycle of one live capture session
///
/// `Error` and `Stopped` are terminal for a session instance; a new run
/// requires a new session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    RequestingDevice,
    Connecting,
    Active,
    Error,
    Stopped,
}

impl SessionState {
    /// Whether the session has reached a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Error | SessionState::Stopped)
    }
}

/// Who authored a transcript line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Speaker {
    /// Transcribed from the user's microphone audio
    User,
    /// Transcribed from the model's spoken reply
    Model,
}

/// One finalized line of the transcript log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptLine {
    pub speaker: Speaker,
    pub text: String,
}

impl TranscriptLine {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            speaker: Speaker::User,
            text: text.into(),
        }
    }

    pub fn model(text: impl Into<String>) -> Self {
        Self {
            speaker: Speaker::Model,
            text: text.into(),
        }
    }
}

/// Mutable session data shared between the driver tasks and the caller
#[derive(Debug)]
pub(crate) struct SessionData {
    pub(crate) state: SessionState,
    /// Accumulates partial model output between turn boundaries
    pub(crate) pending_output: String,
    /// Finalized lines in append order
    pub(crate) transcript: Vec<TranscriptLine>,
    /// Human-readable reason for an `Error` state
    pub(crate) error_reason: Option<String>,
}

impl Default for SessionData {
    fn default() -> Self {
        Self {
            state: SessionState::Idle,
            pending_output: String::new(),
            transcript: Vec::new(),
            error_reason: None,
        }
    }
}

impl SessionData {
    /// Apply one channel event in arrival order
    ///
    /// Partial model output accumulates until a turn boundary; a
    /// non-empty buffer then flushes as exactly one model-authored line.
    /// User lines append directly. Terminal events transition the state
    /// but never override a stop that already happened.
    pub(crate) fn apply_event(&mut self, event: &TranscriptEvent) {
        match event {
            TranscriptEvent::PartialOutput(text) => {
                self.pending_output.push_str(text);
            }
            TranscriptEvent::FinalInput(text) => {
                self.transcript.push(TranscriptLine::user(text.clone()));
            }
            TranscriptEvent::TurnComplete => {
                if !self.pending_output.is_empty() {
                    let line = std::mem::take(&mut self.pending_output);
                    self.transcript.push(TranscriptLine::model(line));
                }
            }
            TranscriptEvent::ChannelError(reason) => {
                if self.state == SessionState::Stopped {
                    debug!("Ignoring channel error after stop: {}", reason);
                } else {
                    warn!("Channel error: {}", reason);
                    self.error_reason = Some(reason.clone());
                    self.state = SessionState::Error;
                }
            }
            TranscriptEvent::ChannelClosed => {
                if !self.state.is_terminal() {
                    self.state = SessionState::Stopped;
                }
            }
            TranscriptEvent::Unknown => {
                debug!("Ignoring unrecognized channel message");
            }
        }
    }

    /// Record a failure reason and move to the terminal `Error` state
    pub(crate) fn fail(&mut self, reason: impl Into<String>) {
        self.error_reason = Some(reason.into());
        self.state = SessionState::Error;
    }
}
