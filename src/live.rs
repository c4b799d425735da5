//! Live API wire protocol and streaming client.
//!
//! Speaks the bidirectional WebSocket protocol: a `setup` handshake,
//! then realtime audio/video input upstream and interleaved
//! audio/transcription content downstream. The read half runs in a
//! spawned task that parses frames into [`LiveEvent`]s on a channel;
//! the write half sits behind a shared sink so sends can come from
//! anywhere.

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose;
use base64::Engine;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{info, warn};

use crate::codec::INPUT_MIME_TYPE;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_messages_serialize_as_single_key_objects() {
        let setup = LiveSetup {
            model: "models/gemini-2.0-flash-live-001".to_string(),
            ..Default::default()
        };
        let json = serde_json::to_value(ClientMessage::Setup { setup }).unwrap();
        assert!(json.get("setup").is_some());
        assert_eq!(json["setup"]["model"], "models/gemini-2.0-flash-live-001");

        let realtime_input = RealtimeInput {
            audio: Some(Blob {
                data: "base64data".to_string(),
                mime_type: INPUT_MIME_TYPE.to_string(),
            }),
            ..Default::default()
        };
        let json = serde_json::to_value(ClientMessage::RealtimeInput { realtime_input }).unwrap();
        assert!(json.get("realtimeInput").is_some());
        assert_eq!(json["realtimeInput"]["audio"]["data"], "base64data");
        assert_eq!(
            json["realtimeInput"]["audio"]["mimeType"],
            "audio/pcm;rate=16000"
        );
        assert!(json["realtimeInput"].get("audioStreamEnd").is_none());
    }

    #[test]
    fn text_turn_carries_turn_complete() {
        let client_content = ClientContent {
            turns: vec![Content {
                role: Some("user".to_string()),
                parts: vec![Part::text("hello")],
            }],
            turn_complete: true,
        };
        let json = serde_json::to_value(ClientMessage::ClientContent { client_content }).unwrap();
        assert_eq!(json["clientContent"]["turnComplete"], true);
        assert_eq!(json["clientContent"]["turns"][0]["role"], "user");
        assert_eq!(json["clientContent"]["turns"][0]["parts"][0]["text"], "hello");
    }

    #[test]
    fn setup_enables_both_transcriptions() {
        let setup = LiveConfig::default().setup_message(None);
        let json = serde_json::to_value(setup).unwrap();
        assert!(json.get("inputAudioTranscription").is_some());
        assert!(json.get("outputAudioTranscription").is_some());
        assert_eq!(json["generationConfig"]["responseModalities"][0], "AUDIO");
        assert!(json.get("sessionResumption").is_some());
    }

    #[test]
    fn resumption_handle_rides_the_setup() {
        let setup = LiveConfig::default().setup_message(Some("handle-1"));
        let json = serde_json::to_value(setup).unwrap();
        assert_eq!(json["sessionResumption"]["handle"], "handle-1");
    }

    #[test]
    fn server_messages_deserialize_untagged() {
        let msg: ServerMessage =
            serde_json::from_value(serde_json::json!({"setupComplete": {}})).unwrap();
        assert!(matches!(msg, ServerMessage::SetupComplete { .. }));

        // Sibling metadata must not confuse the match.
        let msg: ServerMessage = serde_json::from_value(serde_json::json!({
            "serverContent": {"turnComplete": true},
            "usageMetadata": {"totalTokenCount": 12}
        }))
        .unwrap();
        assert!(matches!(msg, ServerMessage::ServerContent { .. }));

        let msg: ServerMessage =
            serde_json::from_value(serde_json::json!({"goAway": {"timeLeft": "2s"}})).unwrap();
        assert!(matches!(msg, ServerMessage::GoAway { .. }));
    }

    #[test]
    fn composite_content_expands_in_payload_order() {
        let msg: ServerMessage = serde_json::from_value(serde_json::json!({
            "serverContent": {
                "inputTranscription": {"text": "Hel"},
                "outputTranscription": {"text": "Sure"},
                "modelTurn": {"parts": [
                    {"text": "Sure."},
                    {"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": "AAAA"}}
                ]},
                "interrupted": true,
                "turnComplete": true
            }
        }))
        .unwrap();
        let events = events_from_message(msg);
        assert_eq!(events.len(), 6);
        assert!(matches!(events[0], LiveEvent::InputTranscription(ref t) if t.as_str() == "Hel"));
        assert!(matches!(events[1], LiveEvent::OutputTranscription(ref t) if t.as_str() == "Sure"));
        assert!(matches!(events[2], LiveEvent::ModelText(ref t) if t.as_str() == "Sure."));
        assert!(matches!(events[3], LiveEvent::ModelAudio(ref d) if d.as_str() == "AAAA"));
        assert!(matches!(events[4], LiveEvent::Interrupted));
        assert!(matches!(events[5], LiveEvent::TurnComplete));
    }

    #[test]
    fn resumption_update_yields_the_new_handle() {
        let msg: ServerMessage = serde_json::from_value(serde_json::json!({
            "sessionResumptionUpdate": {"newHandle": "abc", "resumable": true}
        }))
        .unwrap();
        let events = events_from_message(msg);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], LiveEvent::ResumptionHandle(ref h) if h.as_str() == "abc"));
    }

    #[tokio::test]
    async fn malformed_frames_do_not_end_the_stream() {
        let (tx, mut rx) = mpsc::channel(8);
        assert!(forward_payload("not json at all", &tx).await);
        assert!(rx.try_recv().is_err());

        // The reader keeps going; the next well-formed frame parses.
        let good = serde_json::json!({"serverContent": {"turnComplete": true}}).to_string();
        assert!(forward_payload(&good, &tx).await);
        assert!(matches!(rx.try_recv(), Ok(Ok(LiveEvent::TurnComplete))));
    }

    #[test]
    fn enum_labels() {
        assert_eq!(ResponseModality::Text.as_str(), "TEXT");
        assert_eq!(ResponseModality::Audio.as_str(), "AUDIO");
        assert_eq!(MediaResolution::Low.as_str(), "MEDIA_RESOLUTION_LOW");
        assert_eq!(MediaResolution::Medium.as_str(), "MEDIA_RESOLUTION_MEDIUM");
        assert_eq!(MediaResolution::High.as_str(), "MEDIA_RESOLUTION_HIGH");
    }

    // To run this test, set the GEMINI_API_KEY environment variable.
    #[tokio::test]
    async fn live_connection_smoke() {
        let api_key = match std::env::var("GEMINI_API_KEY") {
            Ok(key) => key,
            Err(_) => {
                println!("GEMINI_API_KEY not set, skipping");
                return;
            }
        };
        let mut client = LiveClient::new(LiveConfig::for_api_key(&api_key));
        client.connect().await.expect("connect failed");
        client.setup().await.expect("setup failed");
        client.close().await;
    }
}

/// Endpoint for bidirectional generation, minus the key query.
pub const LIVE_URL: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

const SETUP_TIMEOUT: Duration = Duration::from_secs(10);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = Arc<Mutex<SplitSink<WsStream, Message>>>;

/// Generation configuration for setup.
#[derive(Debug, Serialize, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub response_modalities: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_resolution: Option<String>,
}

/// Session setup message.
#[derive(Debug, Serialize, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct LiveSetup {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GenerationConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    /// Empty object to turn user speech transcription on.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<serde_json::Value>,
    /// Empty object to turn model speech transcription on.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_audio_transcription: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_resumption: Option<SessionResumption>,
}

#[derive(Debug, Serialize, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SessionResumption {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handle: Option<String>,
}

/// One conversational turn: a role plus its parts.
#[derive(Debug, Serialize, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parts: Vec<Part>,
}

#[derive(Debug, Serialize, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<Blob>,
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Part {
            text: Some(text.into()),
            inline_data: None,
        }
    }

    pub fn inline(blob: Blob) -> Self {
        Part {
            text: None,
            inline_data: Some(blob),
        }
    }
}

/// Base64 payload plus its MIME tag.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    pub data: String,
    pub mime_type: String,
}

/// A chunk of realtime input (audio/video).
#[derive(Debug, Serialize, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio: Option<Blob>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video: Option<Blob>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_stream_end: Option<bool>,
}

/// A complete typed turn.
#[derive(Debug, Serialize, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ClientContent {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub turns: Vec<Content>,
    pub turn_complete: bool,
}

/// Message sent from client to server. Untagged with renamed fields,
/// so each variant serializes as the single-key object the wire wants.
#[derive(Debug, Serialize, Clone)]
#[serde(untagged)]
pub enum ClientMessage {
    Setup {
        setup: LiveSetup,
    },
    RealtimeInput {
        #[serde(rename = "realtimeInput")]
        realtime_input: RealtimeInput,
    },
    ClientContent {
        #[serde(rename = "clientContent")]
        client_content: ClientContent,
    },
}

/// Server -> client messages.
#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerMessage {
    SetupComplete {
        #[serde(rename = "setupComplete")]
        setup_complete: serde_json::Value,
    },
    ServerContent {
        #[serde(rename = "serverContent")]
        server_content: serde_json::Value,
    },
    GoAway {
        #[serde(rename = "goAway")]
        go_away: serde_json::Value,
    },
    SessionResumptionUpdate {
        #[serde(rename = "sessionResumptionUpdate")]
        session_resumption_update: serde_json::Value,
    },
}

/// Error type for live stream operations.
#[derive(Debug, thiserror::Error)]
pub enum LiveError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("setup did not complete")]
    SetupNotComplete,

    #[error("timed out waiting for the server")]
    Timeout,
}

pub type Result<T> = std::result::Result<T, LiveError>;

/// Parsed server traffic. One server message can expand into several
/// events; order within a message is transcriptions, model turn parts,
/// then turn markers.
#[derive(Debug, Clone)]
pub enum LiveEvent {
    SetupComplete,
    /// Transcription fragment of the user's speech.
    InputTranscription(String),
    /// Transcription fragment of the model's speech.
    OutputTranscription(String),
    /// Streamed model text part.
    ModelText(String),
    /// Model audio part, still base64 PCM16 at 24 kHz mono.
    ModelAudio(String),
    /// Barge-in: stop playback now.
    Interrupted,
    TurnComplete,
    GenerationComplete,
    /// Server will drop the connection shortly.
    GoAway,
    /// Fresh resumption handle to stash for the next connect.
    ResumptionHandle(String),
    /// The socket is gone, cleanly or not.
    Closed,
}

/// Expand one server message into the events it carries.
pub fn events_from_message(msg: ServerMessage) -> Vec<LiveEvent> {
    let mut events = Vec::new();
    match msg {
        ServerMessage::SetupComplete { .. } => events.push(LiveEvent::SetupComplete),
        ServerMessage::ServerContent { server_content } => {
            if let Some(text) = server_content
                .get("inputTranscription")
                .and_then(|t| t.get("text"))
                .and_then(|t| t.as_str())
            {
                events.push(LiveEvent::InputTranscription(text.to_string()));
            }
            if let Some(text) = server_content
                .get("outputTranscription")
                .and_then(|t| t.get("text"))
                .and_then(|t| t.as_str())
            {
                events.push(LiveEvent::OutputTranscription(text.to_string()));
            }
            if let Some(parts) = server_content
                .get("modelTurn")
                .and_then(|t| t.get("parts"))
                .and_then(|p| p.as_array())
            {
                for part in parts {
                    if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
                        events.push(LiveEvent::ModelText(text.to_string()));
                    } else if let Some(data) = part
                        .get("inlineData")
                        .and_then(|d| d.get("data"))
                        .and_then(|d| d.as_str())
                    {
                        events.push(LiveEvent::ModelAudio(data.to_string()));
                    }
                }
            }
            if let Some(true) = server_content.get("interrupted").and_then(|v| v.as_bool()) {
                events.push(LiveEvent::Interrupted);
            }
            if let Some(true) = server_content
                .get("generationComplete")
                .and_then(|v| v.as_bool())
            {
                events.push(LiveEvent::GenerationComplete);
            }
            if let Some(true) = server_content.get("turnComplete").and_then(|v| v.as_bool()) {
                events.push(LiveEvent::TurnComplete);
            }
        }
        ServerMessage::GoAway { .. } => events.push(LiveEvent::GoAway),
        ServerMessage::SessionResumptionUpdate {
            session_resumption_update,
        } => {
            if let Some(handle) = session_resumption_update
                .get("newHandle")
                .and_then(|h| h.as_str())
            {
                events.push(LiveEvent::ResumptionHandle(handle.to_string()));
            }
        }
    }
    events
}

/// Configuration for the live client.
#[derive(Debug, Clone)]
pub struct LiveConfig {
    pub url: String,
    pub model: String,
    pub response_modality: ResponseModality,
    pub system_instruction: Option<String>,
    pub temperature: Option<f32>,
    pub media_resolution: Option<MediaResolution>,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            model: "models/gemini-2.0-flash-live-001".to_string(),
            response_modality: ResponseModality::Audio,
            system_instruction: None,
            temperature: Some(0.7),
            media_resolution: Some(MediaResolution::Medium),
        }
    }
}

impl LiveConfig {
    /// Default configuration pointed at the public endpoint.
    pub fn for_api_key(api_key: &str) -> Self {
        LiveConfig {
            url: format!("{}?key={}", LIVE_URL, api_key),
            ..Default::default()
        }
    }

    fn setup_message(&self, resumption_handle: Option<&str>) -> LiveSetup {
        let mut generation_config = GenerationConfig {
            response_modalities: vec![self.response_modality.as_str().to_string()],
            temperature: self.temperature,
            ..Default::default()
        };
        if let Some(resolution) = self.media_resolution {
            generation_config.media_resolution = Some(resolution.as_str().to_string());
        }
        LiveSetup {
            model: self.model.clone(),
            generation_config: Some(generation_config),
            system_instruction: self.system_instruction.as_ref().map(|text| Content {
                role: None,
                parts: vec![Part::text(text.clone())],
            }),
            input_audio_transcription: Some(serde_json::json!({})),
            output_audio_transcription: Some(serde_json::json!({})),
            session_resumption: Some(SessionResumption {
                handle: resumption_handle.map(str::to_string),
            }),
        }
    }
}

/// Response modality options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseModality {
    Text,
    Audio,
}

impl ResponseModality {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "TEXT",
            Self::Audio => "AUDIO",
        }
    }
}

/// Media resolution options for video input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaResolution {
    Low,
    Medium,
    High,
}

impl MediaResolution {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "MEDIA_RESOLUTION_LOW",
            Self::Medium => "MEDIA_RESOLUTION_MEDIUM",
            Self::High => "MEDIA_RESOLUTION_HIGH",
        }
    }
}

/// Async streaming client for the live endpoint.
pub struct LiveClient {
    config: LiveConfig,
    writer: Option<WsSink>,
    events_tx: mpsc::Sender<Result<LiveEvent>>,
    events_rx: mpsc::Receiver<Result<LiveEvent>>,
    resumption_handle: Option<String>,
}

impl LiveClient {
    pub fn new(config: LiveConfig) -> Self {
        let (events_tx, events_rx) = mpsc::channel(100);
        Self {
            config,
            writer: None,
            events_tx,
            events_rx,
            resumption_handle: None,
        }
    }

    /// Open the socket and start the read task.
    pub async fn connect(&mut self) -> Result<()> {
        info!("connecting to the live endpoint");
        let (ws, _response) = connect_async(&self.config.url).await?;
        let (sink, stream) = ws.split();
        self.writer = Some(Arc::new(Mutex::new(sink)));
        tokio::spawn(read_loop(stream, self.events_tx.clone()));
        info!("connected to the live endpoint");
        Ok(())
    }

    /// Send the setup message and wait for the server to acknowledge.
    pub async fn setup(&mut self) -> Result<()> {
        let setup = self.config.setup_message(self.resumption_handle.as_deref());
        self.send(&ClientMessage::Setup { setup }).await?;
        let done = tokio::time::timeout(SETUP_TIMEOUT, self.wait_for_setup_complete())
            .await
            .map_err(|_| LiveError::Timeout)?;
        if done {
            info!("live session setup complete");
            Ok(())
        } else {
            Err(LiveError::SetupNotComplete)
        }
    }

    async fn wait_for_setup_complete(&mut self) -> bool {
        let mut attempts = 0;
        while attempts < 10 {
            match self.events_rx.recv().await {
                Some(Ok(LiveEvent::SetupComplete)) => return true,
                Some(Ok(_)) => {
                    attempts += 1;
                }
                Some(Err(e)) => {
                    warn!("stream error before setup completed: {}", e);
                    return false;
                }
                None => return false,
            }
        }
        false
    }

    /// Hand the inbound event stream to a dispatch loop. The stream
    /// outlives this handle; later calls get an already-closed channel.
    pub fn take_events(&mut self) -> mpsc::Receiver<Result<LiveEvent>> {
        let (dead_tx, dead_rx) = mpsc::channel(1);
        drop(dead_tx);
        std::mem::replace(&mut self.events_rx, dead_rx)
    }

    async fn send(&self, msg: &ClientMessage) -> Result<()> {
        let json = serde_json::to_string(msg)?;
        let writer = self.writer.as_ref().ok_or(LiveError::ConnectionClosed)?;
        writer.lock().await.send(Message::text(json)).await?;
        Ok(())
    }

    /// Send one microphone frame, already base64 PCM16.
    pub async fn send_audio_frame(&self, data: String) -> Result<()> {
        let realtime_input = RealtimeInput {
            audio: Some(Blob {
                data,
                mime_type: INPUT_MIME_TYPE.to_string(),
            }),
            ..Default::default()
        };
        self.send(&ClientMessage::RealtimeInput { realtime_input })
            .await
    }

    /// Send one JPEG video frame.
    pub async fn send_video_frame(&self, jpeg: &[u8]) -> Result<()> {
        let realtime_input = RealtimeInput {
            video: Some(Blob {
                data: general_purpose::STANDARD.encode(jpeg),
                mime_type: "image/jpeg".to_string(),
            }),
            ..Default::default()
        };
        self.send(&ClientMessage::RealtimeInput { realtime_input })
            .await
    }

    /// Send a typed message as one complete user turn.
    pub async fn send_text_turn(&self, text: &str, image: Option<Blob>) -> Result<()> {
        let mut parts = vec![Part::text(text)];
        if let Some(blob) = image {
            parts.push(Part::inline(blob));
        }
        let client_content = ClientContent {
            turns: vec![Content {
                role: Some("user".to_string()),
                parts,
            }],
            turn_complete: true,
        };
        self.send(&ClientMessage::ClientContent { client_content })
            .await
    }

    /// Best-effort goodbye: tell the server the audio stream ended,
    /// then close the socket. Callable more than once.
    pub async fn close(&mut self) {
        if let Some(writer) = self.writer.take() {
            let realtime_input = RealtimeInput {
                audio_stream_end: Some(true),
                ..Default::default()
            };
            let msg = ClientMessage::RealtimeInput { realtime_input };
            let mut sink = writer.lock().await;
            if let Ok(json) = serde_json::to_string(&msg) {
                let _ = sink.send(Message::text(json)).await;
            }
            let _ = sink.close().await;
            info!("live stream closed");
        }
    }

    /// Stash a handle from a previous session to resume it on setup.
    pub fn set_resumption_handle(&mut self, handle: String) {
        self.resumption_handle = Some(handle);
    }
}

async fn read_loop(mut stream: SplitStream<WsStream>, events: mpsc::Sender<Result<LiveEvent>>) {
    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => {
                if !forward_payload(&text, &events).await {
                    return;
                }
            }
            // The server is free to wrap the same JSON in binary frames.
            Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                Ok(text) => {
                    if !forward_payload(&text, &events).await {
                        return;
                    }
                }
                Err(_) => warn!("ignoring non-UTF-8 binary frame ({} bytes)", bytes.len()),
            },
            Ok(Message::Close(frame)) => {
                info!("server closed the stream: {:?}", frame);
                let _ = events.send(Ok(LiveEvent::Closed)).await;
                return;
            }
            Ok(_) => {}
            Err(e) => {
                let _ = events.send(Err(LiveError::WebSocket(e))).await;
                return;
            }
        }
    }
    let _ = events.send(Ok(LiveEvent::Closed)).await;
}

/// Parse one frame and push its events. Returns false once the event
/// channel is gone and the loop should stop.
async fn forward_payload(text: &str, events: &mpsc::Sender<Result<LiveEvent>>) -> bool {
    match serde_json::from_str::<ServerMessage>(text) {
        Ok(msg) => {
            for event in events_from_message(msg) {
                if events.send(Ok(event)).await.is_err() {
                    return false;
                }
            }
        }
        Err(e) => {
            // Unknown frames are survivable; drop them, keep the stream.
            warn!("unrecognized server message ({} bytes): {}", text.len(), e);
        }
    }
    true
}
