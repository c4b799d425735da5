//! Session runner - owns the devices, the wire, and the playback sink,
//! and drives the session core from a single select loop.
//!
//! The core stays pure; every decision it makes comes back as an
//! `Effect` that this module executes against the real world. Teardown
//! is reachable from every exit path and safe to hit more than once.

use base64::engine::general_purpose;
use base64::Engine;
use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::event::{CaptureEvent, SessionCommand, SessionUpdate};
use crate::live::{self, Blob, LiveClient, LiveConfig, LiveEvent};
use crate::media_in::{MicCapture, VisionCapture};
use crate::playback::{PlaybackSink, SystemClock};
use crate::recorder::SessionRecorder;
use crate::session::{Effect, Effects, SessionConfig, SessionCore, SessionError, SessionState};
use crate::store::InteractionStore;

/// Store key stamped with the session-end time.
const INTERACTION_KEY: &str = "assistant";

/// Runs one live session to completion.
///
/// Commands arrive on `commands`; conversation and state changes go out
/// on `updates`. The call returns once the session has fully released
/// its resources, whether it ended by request, by remote close, or by
/// failure.
pub async fn run(
    config: SessionConfig,
    mut commands: mpsc::UnboundedReceiver<SessionCommand>,
    updates: mpsc::UnboundedSender<SessionUpdate>,
) {
    let mut session = SessionRuntime::new(config, updates);
    if session.open().await {
        session.drive(&mut commands).await;
    }
}

struct SessionRuntime {
    config: SessionConfig,
    core: SessionCore,
    clock: SystemClock,
    client: LiveClient,
    events: mpsc::Receiver<live::Result<LiveEvent>>,
    capture_tx: mpsc::UnboundedSender<CaptureEvent>,
    capture_rx: mpsc::UnboundedReceiver<CaptureEvent>,
    done_tx: Option<mpsc::UnboundedSender<u64>>,
    done_rx: mpsc::UnboundedReceiver<u64>,
    mic: Option<MicCapture>,
    vision: Option<VisionCapture>,
    sink: Option<PlaybackSink>,
    recorder: SessionRecorder,
    store: InteractionStore,
    updates: mpsc::UnboundedSender<SessionUpdate>,
    last_state: SessionState,
    /// (entries already emitted, content length of the last one).
    log_mark: (usize, usize),
    last_jpeg: Option<Vec<u8>>,
    opened: bool,
}

impl SessionRuntime {
    fn new(config: SessionConfig, updates: mpsc::UnboundedSender<SessionUpdate>) -> Self {
        let mut live_config = LiveConfig::for_api_key(&config.api_key);
        live_config.model = config.model.clone();
        live_config.system_instruction = config.system_instruction.clone();
        let client = LiveClient::new(live_config);

        let (capture_tx, capture_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        // Replaced with the client's stream once setup completes.
        let (_unused, events) = mpsc::channel(1);

        let core = SessionCore::new(config.vision);
        SessionRuntime {
            config,
            core,
            clock: SystemClock::new(),
            client,
            events,
            capture_tx,
            capture_rx,
            done_tx: Some(done_tx),
            done_rx,
            mic: None,
            vision: None,
            sink: None,
            recorder: SessionRecorder::disabled(),
            store: InteractionStore::open_default(),
            updates,
            last_state: SessionState::Idle,
            log_mark: (0, 0),
            last_jpeg: None,
            opened: false,
        }
    }

    /// Acquire the microphone, connect, complete setup, and open the
    /// output device. Any failure releases what was already acquired
    /// and leaves the session errored.
    async fn open(&mut self) -> bool {
        self.core.begin_connecting();
        self.sync_state();

        // Microphone first; a denied device is the cheapest failure.
        let (mic, mic_ready) = MicCapture::spawn(self.capture_tx.clone());
        self.mic = Some(mic);
        match mic_ready.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return self.abort_open(SessionError::device(e)).await,
            Err(_) => {
                return self
                    .abort_open(SessionError::device("microphone thread exited before ready"))
                    .await
            }
        }

        if let Err(e) = self.client.connect().await {
            return self.abort_open(SessionError::connect(e)).await;
        }
        if let Err(e) = self.client.setup().await {
            return self.abort_open(SessionError::connect(e)).await;
        }
        self.events = self.client.take_events();

        let done_tx = match self.done_tx.take() {
            Some(done_tx) => done_tx,
            None => return self.abort_open(SessionError::device("playback already spawned")).await,
        };
        let (sink, sink_ready) = PlaybackSink::spawn(self.clock, done_tx);
        self.sink = Some(sink);
        match sink_ready.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return self.abort_open(SessionError::device(e)).await,
            Err(_) => {
                return self
                    .abort_open(SessionError::device("playback thread exited before ready"))
                    .await
            }
        }

        if self.core.vision() {
            self.enable_vision().await;
        }
        if self.config.record {
            self.recorder = SessionRecorder::start();
        }

        self.discard_capture_backlog();
        self.core.mark_open();
        self.opened = true;
        self.sync_state();
        info!("live session open");
        true
    }

    /// The capture threads start feeding the queue as soon as they are
    /// ready, before setup has finished. Those frames predate the open
    /// stream and must not reach it.
    fn discard_capture_backlog(&mut self) {
        let mut dropped = 0usize;
        while self.capture_rx.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            debug!("dropped {} capture frames queued during setup", dropped);
        }
    }

    async fn abort_open(&mut self, err: SessionError) -> bool {
        self.core.fail(err);
        self.teardown().await;
        false
    }

    async fn drive(&mut self, commands: &mut mpsc::UnboundedReceiver<SessionCommand>) {
        loop {
            tokio::select! {
                Some(event) = self.capture_rx.recv() => {
                    if !self.on_capture(event).await {
                        break;
                    }
                }
                event = self.events.recv() => {
                    match event {
                        Some(Ok(event)) => {
                            if !self.on_live_event(event).await {
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            if !self.on_stream_error(&e.to_string()).await {
                                break;
                            }
                        }
                        None => {
                            self.on_stream_error("event stream ended").await;
                            break;
                        }
                    }
                }
                done = self.done_rx.recv() => {
                    match done {
                        Some(id) => self.core.playback_done(id),
                        None => {
                            self.on_playback_dead().await;
                            break;
                        }
                    }
                }
                command = commands.recv() => {
                    match command {
                        Some(command) => {
                            if !self.on_command(command).await {
                                break;
                            }
                        }
                        None => {
                            // Caller hung up; close out as if asked.
                            self.stop().await;
                            break;
                        }
                    }
                }
            }
        }
    }

    async fn on_capture(&mut self, event: CaptureEvent) -> bool {
        match event {
            CaptureEvent::AudioFrame { samples } => {
                if let Some(payload) = self.core.on_mic_frame(&samples) {
                    self.recorder.write_mic(&samples);
                    if let Err(e) = self.client.send_audio_frame(payload).await {
                        return self.on_stream_error(&e.to_string()).await;
                    }
                }
            }
            CaptureEvent::VideoFrame { jpeg } => {
                if self.core.forward_video() {
                    debug!("forwarding screen frame ({} bytes)", jpeg.len());
                    if let Err(e) = self.client.send_video_frame(&jpeg).await {
                        return self.on_stream_error(&e.to_string()).await;
                    }
                    self.last_jpeg = Some(jpeg);
                }
            }
        }
        true
    }

    async fn on_live_event(&mut self, event: LiveEvent) -> bool {
        let effects = self.core.on_live_event(&self.clock, event);
        self.flush_log();
        self.sync_state();
        self.apply(effects).await
    }

    async fn on_stream_error(&mut self, why: &str) -> bool {
        let effects = self.core.on_stream_error(why);
        self.flush_log();
        self.sync_state();
        self.apply(effects).await
    }

    async fn on_playback_dead(&mut self) {
        let effects = self
            .core
            .on_stream_error("playback output stopped unexpectedly");
        self.flush_log();
        self.sync_state();
        self.apply(effects).await;
    }

    async fn on_command(&mut self, command: SessionCommand) -> bool {
        match command {
            SessionCommand::SendText(text) => {
                if self.core.state() != SessionState::Open {
                    let _ = self
                        .updates
                        .send(SessionUpdate::Notice("no open session to send text to".into()));
                    return true;
                }
                let image = self.vision_attachment();
                self.core
                    .push_user_text(&text, image.as_ref().map(|blob| blob.data.clone()));
                self.flush_log();
                if let Err(e) = self.client.send_text_turn(&text, image).await {
                    return self.on_stream_error(&e.to_string()).await;
                }
                true
            }
            SessionCommand::SetVision(true) => {
                self.core.set_vision(true);
                if self.vision.is_none() && self.core.state() == SessionState::Open {
                    self.enable_vision().await;
                }
                true
            }
            SessionCommand::SetVision(false) => {
                self.core.set_vision(false);
                if let Some(mut vision) = self.vision.take() {
                    vision.stop();
                    info!("screen capture disabled");
                }
                true
            }
            SessionCommand::Stop => self.stop().await,
        }
    }

    /// The most recent forwarded screen frame, as a turn attachment.
    fn vision_attachment(&self) -> Option<Blob> {
        if !self.core.vision() {
            return None;
        }
        self.last_jpeg.as_ref().map(|jpeg| Blob {
            data: general_purpose::STANDARD.encode(jpeg),
            mime_type: "image/jpeg".to_string(),
        })
    }

    /// Screen capture failure is not fatal; the session continues
    /// audio-only with the vision flag back off.
    async fn enable_vision(&mut self) {
        let (vision, ready) = VisionCapture::spawn(self.capture_tx.clone());
        let outcome = match ready.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err("screen capture thread exited before ready".to_string()),
        };
        match outcome {
            Ok(()) => {
                self.vision = Some(vision);
                info!("screen capture enabled");
            }
            Err(why) => {
                warn!("screen capture unavailable: {}", why);
                let _ = self
                    .updates
                    .send(SessionUpdate::Notice(format!("screen capture unavailable: {}", why)));
                self.core.set_vision(false);
            }
        }
    }

    async fn stop(&mut self) -> bool {
        if !self.core.begin_closing() {
            debug!("stop requested but the session is already closed");
            return true;
        }
        self.sync_state();
        self.teardown().await;
        false
    }

    async fn apply(&mut self, effects: Effects) -> bool {
        for effect in effects {
            match effect {
                Effect::Play(unit) => {
                    self.recorder.write_model(&unit.samples);
                    if let Some(sink) = &self.sink {
                        sink.play(unit);
                    }
                }
                Effect::Interrupt { epoch } => {
                    if let Some(sink) = &self.sink {
                        sink.interrupt_to(epoch);
                    }
                }
                Effect::Resumption(handle) => {
                    self.client.set_resumption_handle(handle);
                }
                Effect::Teardown => {
                    self.teardown().await;
                    return false;
                }
            }
        }
        true
    }

    /// Release everything, in capture-to-output order. Every step
    /// tolerates never having been acquired.
    async fn teardown(&mut self) {
        debug!("releasing session resources");
        if let Some(mut mic) = self.mic.take() {
            mic.stop();
        }
        if let Some(mut vision) = self.vision.take() {
            vision.stop();
        }
        if let Some(mut sink) = self.sink.take() {
            sink.stop();
        }
        self.client.close().await;
        self.recorder.finalize();
        if self.opened {
            self.store.set_timestamp(INTERACTION_KEY, Utc::now());
        }
        self.core.mark_closed();
        self.flush_log();
        self.sync_state();
        info!("session {}", self.core.state());
    }

    fn sync_state(&mut self) {
        let state = self.core.state();
        if state != self.last_state {
            self.last_state = state;
            let _ = self.updates.send(SessionUpdate::State(state));
        }
    }

    /// Emit conversation entries added or grown since the last call.
    fn flush_log(&mut self) {
        let entries = self.core.log().entries();
        let (seen, seen_len) = self.log_mark;
        if seen > 0 {
            if let Some(entry) = entries.get(seen - 1) {
                if entry.content.len() != seen_len {
                    let _ = self.updates.send(SessionUpdate::Transcript {
                        role: entry.role,
                        content: entry.content.clone(),
                    });
                }
            }
        }
        for entry in entries.iter().skip(seen) {
            let _ = self.updates.send(SessionUpdate::Transcript {
                role: entry.role,
                content: entry.content.clone(),
            });
        }
        if let Some(last) = entries.last() {
            self.log_mark = (entries.len(), last.content.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stop_without_a_session_is_idempotent() {
        let (updates_tx, mut updates_rx) = mpsc::unbounded_channel();
        let mut session = SessionRuntime::new(SessionConfig::default(), updates_tx);

        assert!(!session.stop().await);
        assert!(session.stop().await);
        assert_eq!(session.core.state(), SessionState::Closed);

        assert_eq!(
            updates_rx.recv().await,
            Some(SessionUpdate::State(SessionState::Closing))
        );
        assert_eq!(
            updates_rx.recv().await,
            Some(SessionUpdate::State(SessionState::Closed))
        );
    }

    #[tokio::test]
    async fn frames_queued_before_open_are_discarded() {
        let (updates_tx, _updates_rx) = mpsc::unbounded_channel();
        let mut session = SessionRuntime::new(SessionConfig::default(), updates_tx);
        session.core.begin_connecting();

        // The microphone keeps producing while connect and setup run;
        // none of that may surface once the stream opens.
        for _ in 0..3 {
            session
                .capture_tx
                .send(CaptureEvent::AudioFrame {
                    samples: vec![0.25; 64],
                })
                .unwrap();
        }
        session
            .capture_tx
            .send(CaptureEvent::VideoFrame {
                jpeg: vec![0xff, 0xd8],
            })
            .unwrap();

        session.discard_capture_backlog();
        session.core.mark_open();
        assert!(session.capture_rx.try_recv().is_err());

        // Frames captured after the open point still flow.
        session
            .capture_tx
            .send(CaptureEvent::AudioFrame {
                samples: vec![0.5; 64],
            })
            .unwrap();
        assert!(session.capture_rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn transcript_updates_follow_the_log() {
        let (updates_tx, mut updates_rx) = mpsc::unbounded_channel();
        let mut session = SessionRuntime::new(SessionConfig::default(), updates_tx);

        session.core.push_user_text("hello", None);
        session.flush_log();
        session.core.push_user_text("again", None);
        session.flush_log();
        // No change since the last flush, so nothing new is emitted.
        session.flush_log();

        let mut seen = Vec::new();
        while let Ok(update) = updates_rx.try_recv() {
            if let SessionUpdate::Transcript { content, .. } = update {
                seen.push(content);
            }
        }
        assert_eq!(seen, vec!["hello".to_string(), "again".to_string()]);
    }
}
