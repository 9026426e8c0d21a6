//! OpenAI Realtime driver (spec §4.G).
//!
//! Modeled on `whis-core`'s `openai_realtime` transcription driver, but
//! upgraded from transcription-only to a full bidirectional conversation:
//! `session.update` carries modalities, voice, tool definitions and
//! server-VAD turn detection rather than just a transcription config.
//!
//! The connection lives through two phases. During `connect`/`configure`
//! the driver owns the whole WebSocket and reads acknowledgements inline;
//! `start_events` then splits it, spawns a reader task that maps wire
//! events into [`ProviderEvent`]s, and keeps only the write half here so
//! sending audio never contends with event consumption.

use std::collections::HashMap;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        http::header::{HeaderValue, AUTHORIZATION},
        Message,
    },
    MaybeTlsStream, WebSocketStream,
};

use super::{EventStream, ProviderConfig, ProviderDriver, ProviderError, ProviderEvent};

const WS_URL_BASE: &str = "wss://api.openai.com/v1/realtime";
pub const INPUT_SAMPLE_RATE: u32 = 24000;
pub const OUTPUT_SAMPLE_RATE: u32 = 24000;

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

enum Transport {
    Idle,
    Whole(WsStream),
    Split {
        sink: SplitSink<WsStream, Message>,
        reader: tokio::task::JoinHandle<()>,
    },
}

pub struct OpenAiRealtimeDriver {
    api_key: String,
    model: String,
    transport: Transport,
}

impl OpenAiRealtimeDriver {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: model.into(),
            transport: Transport::Idle,
        }
    }

    async fn send_json(&mut self, value: Value) -> Result<(), ProviderError> {
        let text = serde_json::to_string(&value)
            .map_err(|e| ProviderError::ProtocolError(e.to_string()))?;
        let message = Message::Text(text.into());
        match &mut self.transport {
            Transport::Whole(stream) => stream.send(message).await,
            Transport::Split { sink, .. } => sink.send(message).await,
            Transport::Idle => return Err(ProviderError::TransportClosed("not connected".into())),
        }
        .map_err(|e| ProviderError::TransportClosed(e.to_string()))
    }

    /// Read frames off the whole (pre-split) stream until `want` arrives.
    /// Used for the `session.created`/`session.updated` acknowledgements.
    async fn wait_for_event(&mut self, want: &str, wait: Duration) -> Result<(), ProviderError> {
        let Transport::Whole(stream) = &mut self.transport else {
            return Err(ProviderError::ProtocolError(
                "handshake read after event stream was split off".into(),
            ));
        };
        timeout(wait, async {
            loop {
                match stream.next().await {
                    Some(Ok(Message::Text(text))) => {
                        let event: RealtimeEvent = serde_json::from_str(&text)
                            .map_err(|e| ProviderError::ProtocolError(e.to_string()))?;
                        if event.event_type == want {
                            return Ok(());
                        }
                        if event.event_type == "error" {
                            return Err(map_error_event(event));
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
        .map_err(|_| ProviderError::ConnectFail(format!("timed out waiting for {want}")))?
    }
}

#[derive(Deserialize)]
struct RealtimeEvent {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    delta: Option<String>,
    #[serde(default)]
    transcript: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    call_id: Option<String>,
    #[serde(default)]
    error: Option<RealtimeErrorBody>,
}

#[derive(Deserialize)]
struct RealtimeErrorBody {
    #[serde(default)]
    code: Option<String>,
    message: String,
}

#[derive(Serialize)]
struct FunctionResultItem<'a> {
    #[serde(rename = "type")]
    msg_type: &'static str,
    item: FunctionResultItemBody<'a>,
}

#[derive(Serialize)]
struct FunctionResultItemBody<'a> {
    #[serde(rename = "type")]
    item_type: &'static str,
    call_id: &'a str,
    output: String,
}

#[async_trait]
impl ProviderDriver for OpenAiRealtimeDriver {
    async fn connect(&mut self) -> Result<(), ProviderError> {
        let url = format!("{WS_URL_BASE}?model={}", self.model);
        let mut request = url
            .into_client_request()
            .map_err(|e| ProviderError::ConnectFail(e.to_string()))?;
        request.headers_mut().insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", self.api_key))
                .map_err(|e| ProviderError::AuthFail(e.to_string()))?,
        );

        let (stream, _response) = timeout(Duration::from_secs(15), connect_async(request))
            .await
            .map_err(|_| ProviderError::ConnectFail("connect timeout".into()))?
            .map_err(|e| ProviderError::ConnectFail(e.to_string()))?;

        self.transport = Transport::Whole(stream);

        // Wait for session.created before returning (spec §4.G).
        self.wait_for_event("session.created", Duration::from_secs(15)).await
    }

    async fn configure(&mut self, config: &ProviderConfig) -> Result<(), ProviderError> {
        let tools: Vec<Value> = config
            .tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.schema,
                })
            })
            .collect();

        let update = json!({
            "type": "session.update",
            "session": {
                "modalities": ["audio", "text"],
                "instructions": config.instructions,
                "voice": config.voice,
                "input_audio_format": "pcm16",
                "output_audio_format": "pcm16",
                "input_audio_transcription": {"model": "whisper-1", "language": config.language},
                "turn_detection": {
                    "type": "server_vad",
                    "threshold": config.vad_threshold,
                    "silence_duration_ms": config.vad_silence_ms,
                    "prefix_padding_ms": config.vad_prefix_padding_ms,
                },
                "tools": tools,
                "tool_choice": "auto",
                "max_response_output_tokens": config.max_output_tokens,
            }
        });
        self.send_json(update).await?;
        self.wait_for_event("session.updated", Duration::from_secs(10)).await
    }

    async fn send_audio(&mut self, pcm16: &[u8]) -> Result<(), ProviderError> {
        let audio = BASE64.encode(pcm16);
        self.send_json(json!({"type": "input_audio_buffer.append", "audio": audio}))
            .await
    }

    async fn send_text(&mut self, text: &str) -> Result<(), ProviderError> {
        self.send_json(json!({
            "type": "conversation.item.create",
            "item": {"type": "message", "role": "user", "content": [{"type": "input_text", "text": text}]}
        }))
        .await
    }

    async fn send_function_result(
        &mut self,
        _name: &str,
        data: &Value,
        call_id: Option<&str>,
    ) -> Result<(), ProviderError> {
        let call_id = call_id.ok_or_else(|| ProviderError::ProtocolError("missing call_id".into()))?;
        let item = FunctionResultItem {
            msg_type: "conversation.item.create",
            item: FunctionResultItemBody {
                item_type: "function_call_output",
                call_id,
                output: data.to_string(),
            },
        };
        let value = serde_json::to_value(item)
            .map_err(|e| ProviderError::ProtocolError(e.to_string()))?;
        self.send_json(value).await
    }

    async fn request_response(&mut self, instruction: Option<&str>) -> Result<(), ProviderError> {
        let mut response = json!({"modalities": ["audio", "text"]});
        if let Some(instruction) = instruction {
            response["instructions"] = Value::String(instruction.to_string());
        }
        self.send_json(json!({"type": "response.create", "response": response}))
            .await
    }

    async fn interrupt(&mut self) -> Result<(), ProviderError> {
        self.send_json(json!({"type": "response.cancel"})).await
    }

    fn start_events(&mut self) -> Result<EventStream, ProviderError> {
        match std::mem::replace(&mut self.transport, Transport::Idle) {
            Transport::Whole(stream) => {
                let (sink, read) = stream.split();
                let (tx, rx) = mpsc::channel(256);
                let reader = tokio::spawn(reader_loop(read, tx));
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
            Transport::Split { mut sink, reader } => {
                let _ = sink.close().await;
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
        "openai"
    }
}

async fn reader_loop(
    mut read: SplitStream<WsStream>,
    tx: mpsc::Sender<Result<ProviderEvent, ProviderError>>,
) {
    let mut pending_args: HashMap<String, String> = HashMap::new();
    let mut pending_names: HashMap<String, String> = HashMap::new();

    while let Some(message) = read.next().await {
        let outcome = match message {
            Ok(Message::Text(text)) => match serde_json::from_str::<RealtimeEvent>(&text) {
                Ok(event) => map_event(event, &mut pending_args, &mut pending_names).map(Ok),
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

fn map_error_event(event: RealtimeEvent) -> ProviderError {
    let body = event.error.unwrap_or(RealtimeErrorBody { code: None, message: "unknown error".into() });
    match body.code.as_deref() {
        Some("rate_limit_exceeded") => ProviderError::RateLimited(body.message),
        _ => ProviderError::ProtocolError(body.message),
    }
}

fn map_event(
    event: RealtimeEvent,
    pending_args: &mut HashMap<String, String>,
    pending_names: &mut HashMap<String, String>,
) -> Option<ProviderEvent> {
    match event.event_type.as_str() {
        "response.audio.delta" => event
            .delta
            .and_then(|d| BASE64.decode(d).ok())
            .map(ProviderEvent::AudioDelta),
        "response.audio.done" => Some(ProviderEvent::AudioDone),
        "response.audio_transcript.delta" => event.delta.map(ProviderEvent::TranscriptDelta),
        "response.audio_transcript.done" => event.transcript.map(ProviderEvent::TranscriptDone),
        "conversation.item.input_audio_transcription.completed" => {
            event.transcript.map(ProviderEvent::UserTranscript)
        }
        "input_audio_buffer.speech_started" => Some(ProviderEvent::SpeechStarted),
        "input_audio_buffer.speech_stopped" => Some(ProviderEvent::SpeechStopped),
        "response.created" => Some(ProviderEvent::ResponseStarted),
        "response.done" => Some(ProviderEvent::ResponseDone),
        "response.function_call_arguments.delta" => {
            if let Some(call_id) = event.call_id {
                if let Some(delta) = event.delta {
                    pending_args.entry(call_id.clone()).or_default().push_str(&delta);
                }
                if let Some(name) = event.name {
                    pending_names.insert(call_id, name);
                }
            }
            None
        }
        "response.function_call_arguments.done" => {
            let call_id = event.call_id?;
            let args_str = pending_args.remove(&call_id).unwrap_or_default();
            let name = pending_names.remove(&call_id).or(event.name)?;
            let args = serde_json::from_str(&args_str).unwrap_or(Value::Null);
            Some(ProviderEvent::FunctionCall { name, args, call_id })
        }
        "error" => {
            let body = event
                .error
                .unwrap_or(RealtimeErrorBody { code: None, message: "unknown error".into() });
            if body.code.as_deref() == Some("rate_limit_exceeded") {
                Some(ProviderEvent::RateLimited)
            } else {
                Some(ProviderEvent::Error {
                    kind: body.code.unwrap_or_else(|| "error".into()),
                    message: body.message,
                })
            }
        }
        _ => None,
    }
}
