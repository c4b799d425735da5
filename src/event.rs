//! Events and commands crossing the session boundary.

use crate::reconcile::Role;
use crate::session::SessionState;

/// Media produced by the capture threads, consumed by the session loop.
#[derive(Debug, Clone)]
pub enum CaptureEvent {
    /// One microphone frame: f32 samples, mono, 16 kHz.
    AudioFrame { samples: Vec<f32> },
    /// One JPEG-compressed screen frame.
    VideoFrame { jpeg: Vec<u8> },
}

/// Commands the embedding application issues against a running session.
#[derive(Debug, Clone)]
pub enum SessionCommand {
    /// Send a typed message as a complete user turn.
    SendText(String),
    /// Switch periodic screen capture on or off.
    SetVision(bool),
    /// End the session gracefully.
    Stop,
}

/// What the session reports back to the embedding application.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionUpdate {
    State(SessionState),
    /// A conversation log entry was appended or its content grew.
    Transcript { role: Role, content: String },
    /// Out-of-band information (imminent server disconnect, vision
    /// toggles, re-engagement hints).
    Notice(String),
}
