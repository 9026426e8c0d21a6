//! Scripted in-memory provider driver for tests. The controller half lets a
//! test inject [`ProviderEvent`]s as if the provider had sent them, and
//! inspect everything the session pushed toward the provider.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use super::{EventStream, ProviderConfig, ProviderDriver, ProviderError, ProviderEvent};

/// Everything a session can push into a driver, recorded verbatim.
#[derive(Debug, Clone)]
pub enum SentItem {
    Audio(Vec<u8>),
    Text(String),
    FunctionResult { name: String, data: Value, call_id: Option<String> },
    ResponseRequested { instruction: Option<String> },
    Interrupt,
}

#[derive(Default)]
struct Shared {
    sent: Mutex<Vec<SentItem>>,
    configured: Mutex<Option<ProviderConfig>>,
    fail_configure: Mutex<Option<ProviderError>>,
}

/// Test handle paired with a [`FakeDriver`].
#[derive(Clone)]
pub struct FakeProviderController {
    events_tx: mpsc::Sender<Result<ProviderEvent, ProviderError>>,
    shared: Arc<Shared>,
}

impl FakeProviderController {
    /// Inject an event as if the provider had emitted it.
    pub async fn emit(&self, event: ProviderEvent) {
        let _ = self.events_tx.send(Ok(event)).await;
    }

    pub async fn emit_error(&self, error: ProviderError) {
        let _ = self.events_tx.send(Err(error)).await;
    }

    pub fn sent(&self) -> Vec<SentItem> {
        self.shared.sent.lock().unwrap().clone()
    }

    pub fn sent_audio_bytes(&self) -> usize {
        self.shared
            .sent
            .lock()
            .unwrap()
            .iter()
            .map(|i| match i {
                SentItem::Audio(b) => b.len(),
                _ => 0,
            })
            .sum()
    }

    pub fn requested_instructions(&self) -> Vec<Option<String>> {
        self.shared
            .sent
            .lock()
            .unwrap()
            .iter()
            .filter_map(|i| match i {
                SentItem::ResponseRequested { instruction } => Some(instruction.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn interrupt_count(&self) -> usize {
        self.shared
            .sent
            .lock()
            .unwrap()
            .iter()
            .filter(|i| matches!(i, SentItem::Interrupt))
            .count()
    }

    pub fn configured(&self) -> Option<ProviderConfig> {
        self.shared.configured.lock().unwrap().clone()
    }

    /// Make the next `configure` call fail with `error` (consumed once).
    pub fn fail_next_configure(&self, error: ProviderError) {
        *self.shared.fail_configure.lock().unwrap() = Some(error);
    }
}

pub struct FakeDriver {
    input_rate: u32,
    output_rate: u32,
    shared: Arc<Shared>,
    events_rx: Option<mpsc::Receiver<Result<ProviderEvent, ProviderError>>>,
}

impl FakeDriver {
    /// A driver whose event stream the returned controller feeds live.
    pub fn scripted(input_rate: u32, output_rate: u32) -> (Self, FakeProviderController) {
        let (tx, rx) = mpsc::channel(256);
        let shared = Arc::new(Shared::default());
        let driver = Self {
            input_rate,
            output_rate,
            shared: shared.clone(),
            events_rx: Some(rx),
        };
        (driver, FakeProviderController { events_tx: tx, shared })
    }
}

#[async_trait]
impl ProviderDriver for FakeDriver {
    async fn connect(&mut self) -> Result<(), ProviderError> {
        Ok(())
    }

    async fn configure(&mut self, config: &ProviderConfig) -> Result<(), ProviderError> {
        if let Some(error) = self.shared.fail_configure.lock().unwrap().take() {
            return Err(error);
        }
        *self.shared.configured.lock().unwrap() = Some(config.clone());
        Ok(())
    }

    async fn send_audio(&mut self, pcm16: &[u8]) -> Result<(), ProviderError> {
        self.shared.sent.lock().unwrap().push(SentItem::Audio(pcm16.to_vec()));
        Ok(())
    }

    async fn send_text(&mut self, text: &str) -> Result<(), ProviderError> {
        self.shared.sent.lock().unwrap().push(SentItem::Text(text.to_string()));
        Ok(())
    }

    async fn send_function_result(
        &mut self,
        name: &str,
        data: &Value,
        call_id: Option<&str>,
    ) -> Result<(), ProviderError> {
        self.shared.sent.lock().unwrap().push(SentItem::FunctionResult {
            name: name.to_string(),
            data: data.clone(),
            call_id: call_id.map(str::to_string),
        });
        Ok(())
    }

    async fn request_response(&mut self, instruction: Option<&str>) -> Result<(), ProviderError> {
        self.shared
            .sent
            .lock()
            .unwrap()
            .push(SentItem::ResponseRequested { instruction: instruction.map(str::to_string) });
        Ok(())
    }

    async fn interrupt(&mut self) -> Result<(), ProviderError> {
        self.shared.sent.lock().unwrap().push(SentItem::Interrupt);
        Ok(())
    }

    fn start_events(&mut self) -> Result<EventStream, ProviderError> {
        self.events_rx
            .take()
            .map(EventStream::new)
            .ok_or_else(|| ProviderError::ProtocolError("event stream already started".into()))
    }

    async fn disconnect(&mut self) {}

    fn input_sample_rate(&self) -> u32 {
        self.input_rate
    }

    fn output_sample_rate(&self) -> u32 {
        self.output_rate
    }

    fn name(&self) -> &'static str {
        "fake"
    }
}
