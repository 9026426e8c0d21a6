//! Provider abstraction and drivers (spec §4.G).
//!
//! `ProviderDriver` is the capability set every realtime AI backend must
//! implement. The session never talks to OpenAI/ElevenLabs wire formats
//! directly — it drives a `Box<dyn ProviderDriver>`, same shape as
//! `whis-core`'s `TranscriptionBackend`/`RealtimeTranscriptionBackend` split.

pub mod elevenlabs;
#[cfg(any(test, feature = "test-util"))]
pub mod fake;
pub mod openai;
pub mod registry;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::tools::ToolDefinition;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("failed to connect to provider: {0}")]
    ConnectFail(String),

    #[error("provider authentication failed: {0}")]
    AuthFail(String),

    #[error("provider protocol error: {0}")]
    ProtocolError(String),

    #[error("provider rate limited: {0}")]
    RateLimited(String),

    #[error("provider timed out")]
    ProviderTimeout,

    #[error("provider transport closed: {0}")]
    TransportClosed(String),

    #[error("unknown provider: {0}")]
    UnknownProvider(String),
}

impl ProviderError {
    /// Only RATE_LIMITED and PROVIDER_TIMEOUT are candidates for failover
    /// (spec §4.G "Errors").
    pub fn is_failover_candidate(&self) -> bool {
        matches!(self, ProviderError::RateLimited(_) | ProviderError::ProviderTimeout)
    }
}

/// Tagged variant mirroring spec §3 `ProviderEvent`.
#[derive(Debug, Clone)]
pub enum ProviderEvent {
    AudioDelta(Vec<u8>),
    AudioDone,
    TranscriptDelta(String),
    TranscriptDone(String),
    UserTranscript(String),
    SpeechStarted,
    SpeechStopped,
    ResponseStarted,
    ResponseDone,
    FunctionCall { name: String, args: Value, call_id: String },
    RateLimited,
    Error { kind: String, message: String },
    SessionEnded { reason: String },
}

/// Everything a driver needs to build its `session.update`/equivalent
/// configuration payload (spec §3 `SessionConfig`, the provider-relevant
/// subset).
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub instructions: String,
    pub voice: String,
    pub language: Option<String>,
    pub tools: Vec<ToolDefinition>,
    pub vad_threshold: f32,
    pub vad_silence_ms: u32,
    pub vad_prefix_padding_ms: u32,
    pub max_output_tokens: Option<u32>,
}

/// Capability set a realtime provider driver must implement.
#[async_trait]
pub trait ProviderDriver: Send + Sync {
    /// Open the provider WS and resolve once the provider signals
    /// session-ready, or fail with [`ProviderError::ConnectFail`]/`AuthFail`.
    async fn connect(&mut self) -> Result<(), ProviderError>;

    /// Send prompt/voice/VAD/tools/turn-detection configuration and wait
    /// for acknowledgement.
    async fn configure(&mut self, config: &ProviderConfig) -> Result<(), ProviderError>;

    /// Encode and push one audio frame at [`ProviderDriver::input_sample_rate`].
    async fn send_audio(&mut self, pcm16: &[u8]) -> Result<(), ProviderError>;

    async fn send_text(&mut self, text: &str) -> Result<(), ProviderError>;

    async fn send_function_result(
        &mut self,
        name: &str,
        data: &Value,
        call_id: Option<&str>,
    ) -> Result<(), ProviderError>;

    /// Request a fresh response generation (e.g. for the greeting or after
    /// a tool result that `requires_response`).
    async fn request_response(&mut self, instruction: Option<&str>) -> Result<(), ProviderError>;

    /// Cancel the in-progress response (barge-in).
    async fn interrupt(&mut self) -> Result<(), ProviderError>;

    /// Split off the receive half of the connection. The driver spawns its
    /// own reader task and hands back the event stream, so the caller can
    /// consume events without holding a lock that would block concurrent
    /// `send_audio` calls. Callable once per connection.
    fn start_events(&mut self) -> Result<EventStream, ProviderError>;

    async fn disconnect(&mut self);

    fn input_sample_rate(&self) -> u32;
    fn output_sample_rate(&self) -> u32;
    fn name(&self) -> &'static str;
}

/// Receive half of a provider connection, detached from the driver by
/// [`ProviderDriver::start_events`]. Yields `None` once the connection closes.
pub struct EventStream {
    rx: mpsc::Receiver<Result<ProviderEvent, ProviderError>>,
}

impl EventStream {
    pub fn new(rx: mpsc::Receiver<Result<ProviderEvent, ProviderError>>) -> Self {
        Self { rx }
    }

    pub async fn next(&mut self) -> Option<Result<ProviderEvent, ProviderError>> {
        self.rx.recv().await
    }
}
