//! Session lifecycle state machine and event dispatch.
//!
//! [`SessionCore`] owns every decision the session makes (state
//! transitions, routing of inbound events, gating of outbound media)
//! but performs no I/O. The runner feeds it and executes the
//! [`Effect`]s it returns, so the whole lifecycle is testable without
//! a device or a socket.

use smallvec::{smallvec, SmallVec};
use tracing::{debug, error, warn};

use crate::codec::{self, OUTPUT_SAMPLE_RATE};
use crate::live::LiveEvent;
use crate::playback::{OutputClock, PlaybackSchedule, PlaybackUnit};
use crate::reconcile::{ConversationLog, Message, Role, Speaker, TranscriptReconciler};

/// Session failure taxonomy.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Microphone, screen, or playback device could not be acquired.
    #[error("device error: {0}")]
    Device(String),

    /// The remote handshake failed.
    #[error("connect error: {0}")]
    Connect(String),

    /// The stream died mid-session.
    #[error("stream error: {0}")]
    Stream(String),

    /// A payload could not be decoded. Never fatal; the chunk is
    /// dropped.
    #[error("codec error: {0}")]
    Codec(String),
}

impl SessionError {
    pub fn device(e: impl std::fmt::Display) -> Self {
        SessionError::Device(e.to_string())
    }

    pub fn connect(e: impl std::fmt::Display) -> Self {
        SessionError::Connect(e.to_string())
    }

    pub fn stream(e: impl std::fmt::Display) -> Self {
        SessionError::Stream(e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Open,
    Closing,
    Closed,
    /// Absorbing failure state; the session ends released and inert.
    Errored,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Open => "open",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
            SessionState::Errored => "errored",
        }
    }

    /// A terminal session never leaves its state again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Errored)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a session is put together.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub api_key: String,
    pub model: String,
    pub system_instruction: Option<String>,
    /// Stream screen frames at 1 Hz while the session is open.
    pub vision: bool,
    /// Write mic and model audio to WAV files for this session.
    pub record: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: "models/gemini-2.0-flash-live-001".to_string(),
            system_instruction: None,
            vision: false,
            record: false,
        }
    }
}

/// Side effects the core asks the runner to perform.
#[derive(Debug)]
pub enum Effect {
    /// Queue a unit on the playback sink.
    Play(PlaybackUnit),
    /// Cancel everything the sink holds from epochs before this one.
    Interrupt { epoch: u64 },
    /// Release every resource; the state is already terminal.
    Teardown,
    /// Keep this resumption handle for a future session.
    Resumption(String),
}

pub type Effects = SmallVec<[Effect; 2]>;

/// Pure session state: lifecycle, conversation log, reconciler and
/// playback bookkeeping.
pub struct SessionCore {
    state: SessionState,
    vision: bool,
    log: ConversationLog,
    reconciler: TranscriptReconciler,
    schedule: PlaybackSchedule,
    fault: Option<SessionError>,
}

impl SessionCore {
    pub fn new(vision: bool) -> Self {
        Self {
            state: SessionState::Idle,
            vision,
            log: ConversationLog::new(),
            reconciler: TranscriptReconciler::new(),
            schedule: PlaybackSchedule::new(),
            fault: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn log(&self) -> &ConversationLog {
        &self.log
    }

    pub fn schedule(&self) -> &PlaybackSchedule {
        &self.schedule
    }

    pub fn vision(&self) -> bool {
        self.vision
    }

    pub fn set_vision(&mut self, on: bool) {
        self.vision = on;
    }

    pub fn fault(&self) -> Option<&SessionError> {
        self.fault.as_ref()
    }

    pub fn begin_connecting(&mut self) {
        if self.state == SessionState::Idle {
            self.state = SessionState::Connecting;
        }
    }

    pub fn mark_open(&mut self) {
        if self.state == SessionState::Connecting {
            self.state = SessionState::Open;
        }
    }

    /// Start a user-initiated close. Returns true the first time, when
    /// teardown should actually run; later calls are no-ops.
    pub fn begin_closing(&mut self) -> bool {
        match self.state {
            SessionState::Closing | SessionState::Closed | SessionState::Errored => false,
            _ => {
                self.state = SessionState::Closing;
                true
            }
        }
    }

    pub fn mark_closed(&mut self) {
        if self.state == SessionState::Closing {
            self.state = SessionState::Closed;
        }
    }

    /// Record a fatal session failure: exactly one error entry lands in
    /// the log and the state becomes terminal. Returns true when the
    /// caller should run teardown; a failure during an ongoing close or
    /// after another failure changes nothing.
    pub fn fail(&mut self, err: SessionError) -> bool {
        if self.fault.is_some() || matches!(self.state, SessionState::Closing | SessionState::Closed)
        {
            debug!("ignoring late failure: {}", err);
            return false;
        }
        error!("{}", err);
        self.log.push(Message::new(Role::Error, err.to_string()));
        self.fault = Some(err);
        self.state = SessionState::Errored;
        true
    }

    /// One microphone frame. While open, returns the base64 payload to
    /// put on the wire; in any other state the frame is dropped.
    pub fn on_mic_frame(&mut self, samples: &[f32]) -> Option<String> {
        if self.state == SessionState::Open {
            Some(codec::encode_base64(samples))
        } else {
            None
        }
    }

    /// Whether a captured video frame should go out right now.
    pub fn forward_video(&self) -> bool {
        self.state == SessionState::Open && self.vision
    }

    /// Record a typed user turn. A typed turn ends the current spoken
    /// turn, so live transcription entries freeze before it lands.
    pub fn push_user_text(&mut self, text: &str, image: Option<String>) {
        self.reconciler.turn_complete();
        let mut message = Message::new(Role::User, text);
        message.image = image;
        self.log.push(message);
    }

    /// The sink finished (or drained) a unit.
    pub fn playback_done(&mut self, id: u64) {
        self.schedule.complete(id);
    }

    /// Route one inbound event to the component that owns it.
    pub fn on_live_event(&mut self, clock: &impl OutputClock, event: LiveEvent) -> Effects {
        match event {
            LiveEvent::SetupComplete => {
                debug!("unexpected setup acknowledgement mid-session");
                SmallVec::new()
            }
            LiveEvent::InputTranscription(text) => {
                self.reconciler.apply(&mut self.log, Speaker::User, &text);
                SmallVec::new()
            }
            LiveEvent::OutputTranscription(text) | LiveEvent::ModelText(text) => {
                self.reconciler.apply(&mut self.log, Speaker::Model, &text);
                SmallVec::new()
            }
            LiveEvent::ModelAudio(data) => self.admit_model_audio(clock, &data),
            LiveEvent::Interrupted => {
                let epoch = self.schedule.interrupt();
                debug!("barge-in, playback cancelled (epoch {})", epoch);
                smallvec![Effect::Interrupt { epoch }]
            }
            LiveEvent::TurnComplete => {
                self.reconciler.turn_complete();
                SmallVec::new()
            }
            LiveEvent::GenerationComplete => SmallVec::new(),
            LiveEvent::ResumptionHandle(handle) => smallvec![Effect::Resumption(handle)],
            LiveEvent::GoAway => self.remote_ended("server asked to disconnect"),
            LiveEvent::Closed => self.remote_ended("stream closed by the server"),
        }
    }

    /// The transport reported an error.
    pub fn on_stream_error(&mut self, why: &str) -> Effects {
        self.remote_ended(why)
    }

    fn remote_ended(&mut self, why: &str) -> Effects {
        if self.fail(SessionError::stream(why)) {
            smallvec![Effect::Teardown]
        } else {
            SmallVec::new()
        }
    }

    fn admit_model_audio(&mut self, clock: &impl OutputClock, data: &str) -> Effects {
        match codec::decode_base64(data, OUTPUT_SAMPLE_RATE, 1) {
            Ok(audio) if audio.frames() > 0 => {
                let samples = audio.channels.into_iter().next().unwrap_or_default();
                let unit = self.schedule.admit(clock, samples, OUTPUT_SAMPLE_RATE);
                smallvec![Effect::Play(unit)]
            }
            Ok(_) => SmallVec::new(),
            Err(e) => {
                // Partial audio beats a dead session; drop the chunk.
                warn!("{}", SessionError::Codec(e.to_string()));
                SmallVec::new()
            }
        }
    }
}
