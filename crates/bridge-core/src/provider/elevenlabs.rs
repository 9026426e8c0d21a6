//! ElevenLabs Conversational AI driver (spec §4.G).
//!
//! Same two-phase transport as the OpenAI driver, with one twist: the
//! protocol's `ping`/`pong` keepalive must be answered from the reader
//! task, so after the split the write half lives behind a shared mutex
//! that both the driver's send path and the reader's pong path use.

use std::sync::Arc;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        http::header::{HeaderName, HeaderValue},
        Message,
    },
    MaybeTlsStream, WebSocketStream,
};

use super::{EventStream, ProviderConfig, ProviderDriver, ProviderError, ProviderEvent};

const WS_URL_BASE: &str = "wss://api.elevenlabs.io/v1/convai/conversation";
pub const INPUT_SAMPLE_RATE: u32 = 16000;
pub const OUTPUT_SAMPLE_RATE: u32 = 16000;

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;
type SharedSink = Arc<Mutex<SplitSink<WsStream, Message>>>;

enum Transport {
    Idle,
    Whole(WsStream),
    Split {
        sink: SharedSink,
        reader: tokio::task::JoinHandle<()>,
    },
}

pub struct ElevenLabsDriver {
    api_key: String,
    agent_id: String,
    transport: Transport,
}

impl ElevenLabsDriver {
    pub fn new(api_key: impl Into<String>, agent_id: impl Into<String>) -> Self {
        Self { api_key: api_key.into(), agent_id: agent_id.into(), transport: Transport::Idle }
    }

    async fn send_json(&mut self, value: Value) -> Result<(), ProviderError> {
        let text = serde_json::to_string(&value)
            .map_err(|e| ProviderError::ProtocolError(e.to_string()))?;
        let message = Message::Text(text.into());
        match &mut self.transport {
            Transport::Whole(stream) => stream
                .send(message)
                .await
                .map_err(|e| ProviderError::TransportClosed(e.to_string())),
            Transport::Split { sink, .. } => sink
                .lock()
                .await
                .send(message)
                .await
                .map_err(|e| ProviderError::TransportClosed(e.to_string())),
            Transport::Idle => Err(ProviderError::TransportClosed("not connected".into())),
        }
    }
}

#[derive(Deserialize)]
struct ConvaiEvent {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    audio_event: Option<AudioEventBody>,
    #[serde(default)]
    user_transcription_event: Option<TranscriptBody>,
    #[serde(default)]
    agent_response_event: Option<TranscriptBody>,
    #[serde(default)]
    ping_event: Option<PingBody>,
    #[serde(default)]
    client_tool_call: Option<ToolCallBody>,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Deserialize)]
struct AudioEventBody {
    audio_base_64: String,
}

#[derive(Deserialize)]
struct TranscriptBody {
    #[serde(alias = "user_transcript", alias = "agent_response")]
    text: Option<String>,
}

#[derive(Deserialize)]
struct PingBody {
    event_id: u64,
    ping_ms: Option<u64>,
}

#[derive(Deserialize)]
struct ToolCallBody {
    tool_name: String,
    tool_call_id: String,
    #[serde(default)]
    parameters: Value,
}

#[async_trait]
impl ProviderDriver for ElevenLabsDriver {
    async fn connect(&mut self) -> Result<(), ProviderError> {
        let url = format!("{WS_URL_BASE}?agent_id={}", self.agent_id);
        let mut request = url
            .into_client_request()
            .map_err(|e| ProviderError::ConnectFail(e.to_string()))?;
        request.headers_mut().insert(
            HeaderName::from_static("xi-api-key"),
            HeaderValue::from_str(&self.api_key).map_err(|e| ProviderError::AuthFail(e.to_string()))?,
        );

        let (stream, _response) = timeout(Duration::from_secs(15), connect_async(request))
            .await
            .map_err(|_| ProviderError::ConnectFail("connect timeout".into()))?
            .map_err(|e| ProviderError::ConnectFail(e.to_string()))?;
        self.transport = Transport::Whole(stream);

        let Transport::Whole(stream) = &mut self.transport else {
            return Err(ProviderError::ConnectFail("transport vanished during connect".into()));
        };
        timeout(Duration::from_secs(15), async {
            loop {
                match stream.next().await {
                    Some(Ok(Message::Text(text))) => {
                        let event: ConvaiEvent = serde_json::from_str(&text)
                            .map_err(|e| ProviderError::ProtocolError(e.to_string()))?;
                        if event.event_type == "conversation_initiation_metadata" {
                            return Ok(());
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        return Err(ProviderError::TransportClosed("closed during handshake".into()));
                    }
                    Some(Err(e)) => return Err(ProviderError::TransportClosed(e.to_string())),
                    _ => {}
                }
            }
        })
        .await
        .map_err(|_| ProviderError::ConnectFail("timed out waiting for conversation_initiation_metadata".into()))?
    }

    async fn configure(&mut self, config: &ProviderConfig) -> Result<(), ProviderError> {
        self.send_json(json!({
            "type": "conversation_initiation_client_data",
            "conversation_config_override": {
                "agent": {
                    "prompt": {"prompt": config.instructions},
                    "first_message": "",
                    "language": config.language,
                },
                "tts": {"voice_id": config.voice},
            },
        }))
        .await
    }

    async fn send_audio(&mut self, pcm16: &[u8]) -> Result<(), ProviderError> {
        let audio = BASE64.encode(pcm16);
        self.send_json(json!({"user_audio_chunk": audio})).await
    }

    async fn send_text(&mut self, text: &str) -> Result<(), ProviderError> {
        self.send_json(json!({"type": "user_message", "text": text})).await
    }

    async fn send_function_result(
        &mut self,
        _name: &str,
        data: &Value,
        call_id: Option<&str>,
    ) -> Result<(), ProviderError> {
        let call_id = call_id.ok_or_else(|| ProviderError::ProtocolError("missing call_id".into()))?;
        self.send_json(json!({
            "type": "client_tool_result",
            "tool_call_id": call_id,
            "result": data,
            "is_error": false,
        }))
        .await
    }

    async fn request_response(&mut self, _instruction: Option<&str>) -> Result<(), ProviderError> {
        // ElevenLabs generates its next turn automatically after a tool
        // result or user audio; there is no explicit "create response" call.
        Ok(())
    }

    async fn interrupt(&mut self) -> Result<(), ProviderError> {
        self.send_json(json!({"type": "interruption"})).await
    }

    fn start_events(&mut self) -> Result<EventStream, ProviderError> {
        match std::mem::replace(&mut self.transport, Transport::Idle) {
            Transport::Whole(stream) => {
                let (sink, read) = stream.split();
                let sink: SharedSink = Arc::new(Mutex::new(sink));
                let (tx, rx) = mpsc::channel(256);
                let reader = tokio::spawn(reader_loop(read, sink.clone(), tx));
                self.transport = Transport::Split { sink, reader };
                Ok(EventStream::new(rx))
            }
            other => {
                self.transport = other;
                Err(ProviderError::ProtocolError("event stream already started or not connected".into()))
            }
        }
    }

    async fn disconnect(&mut self) {
        match std::mem::replace(&mut self.transport, Transport::Idle) {
            Transport::Whole(mut stream) => {
                let _ = stream.close(None).await;
            }
            Transport::Split { sink, reader } => {
                let _ = sink.lock().await.close().await;
                reader.abort();
            }
            Transport::Idle => {}
        }
    }

    fn input_sample_rate(&self) -> u32 {
        INPUT_SAMPLE_RATE
    }

    fn output_sample_rate(&self) -> u32 {
        OUTPUT_SAMPLE_RATE
    }

    fn name(&self) -> &'static str {
        "elevenlabs"
    }
}

async fn reader_loop(
    mut read: SplitStream<WsStream>,
    sink: SharedSink,
    tx: mpsc::Sender<Result<ProviderEvent, ProviderError>>,
) {
    while let Some(message) = read.next().await {
        let outcome = match message {
            Ok(Message::Text(text)) => match serde_json::from_str::<ConvaiEvent>(&text) {
                Ok(event) if event.event_type == "ping" => {
                    if let Some(ping) = event.ping_event {
                        if let Some(delay) = ping.ping_ms {
                            tokio::time::sleep(Duration::from_millis(delay)).await;
                        }
                        let pong = json!({"type": "pong", "event_id": ping.event_id}).to_string();
                        if sink.lock().await.send(Message::Text(pong.into())).await.is_err() {
                            break;
                        }
                    }
                    None
                }
                Ok(event) => map_event(event).map(Ok),
                Err(e) => Some(Err(ProviderError::ProtocolError(e.to_string()))),
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => None,
            Err(e) => Some(Err(ProviderError::TransportClosed(e.to_string()))),
        };
        if let Some(item) = outcome {
            if tx.send(item).await.is_err() {
                break;
            }
        }
    }
}

fn map_event(event: ConvaiEvent) -> Option<ProviderEvent> {
    match event.event_type.as_str() {
        "audio" => event
            .audio_event
            .and_then(|a| BASE64.decode(a.audio_base_64).ok())
            .map(ProviderEvent::AudioDelta),
        "user_transcript" => event
            .user_transcription_event
            .and_then(|t| t.text)
            .map(ProviderEvent::UserTranscript),
        "agent_response" => event
            .agent_response_event
            .and_then(|t| t.text)
            .map(ProviderEvent::TranscriptDone),
        "vad_score" => None,
        "interruption" => Some(ProviderEvent::SpeechStarted),
        "tool_use" => event.client_tool_call.map(|c| ProviderEvent::FunctionCall {
            name: c.tool_name,
            args: c.parameters,
            call_id: c.tool_call_id,
        }),
        "conversation_ended" => Some(ProviderEvent::SessionEnded {
            reason: event.reason.unwrap_or_else(|| "conversation_ended".into()),
        }),
        _ => None,
    }
}
