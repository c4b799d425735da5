//! voxlive - live voice-and-vision assistant client
//!
//! Streams microphone audio (and optionally screen frames) to a
//! realtime model over a bidirectional WebSocket, plays the model's
//! audio back gaplessly with barge-in support, and reconciles the two
//! transcription streams into a single conversation log.

#![forbid(unsafe_code)]

/// Float/PCM/base64 audio conversions shared by capture and playback.
pub mod codec;
/// Channel payloads that tie the capture, session, and UI layers together.
pub mod event;
/// Wire protocol and WebSocket client for the live endpoint.
pub mod live;
/// Microphone and screen capture threads.
pub mod media_in;
/// Gapless playback scheduling and the PulseAudio sink.
pub mod playback;
/// Transcription-stream reconciliation into the conversation log.
pub mod reconcile;
/// Optional WAV recording of session media.
pub mod recorder;
/// The async loop that owns a session's resources.
pub mod runner;
/// Session lifecycle state machine and event dispatch.
pub mod session;
/// Last-interaction persistence for the re-engagement nudge.
pub mod store;

pub use event::{SessionCommand, SessionUpdate};
pub use reconcile::{ConversationLog, Message, Role};
pub use session::{SessionConfig, SessionError, SessionState};
