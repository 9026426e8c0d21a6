//! End-to-end scenarios driven over a real WebSocket against an in-memory
//! fake switch and scripted provider drivers. The test client plays the
//! part of FreeSWITCH's `mod_audio_stream`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use bridge_core::config::{
    ConfigError, ConfigLoader, ConfigSource, SecretaryConfig, TimeCondition, TransferRules,
};
use bridge_core::metrics::call_logger::CallLogEventKind;
use bridge_core::metrics::BridgeMetrics;
use bridge_core::provider::fake::{FakeDriver, FakeProviderController, SentItem};
use bridge_core::provider::registry::ProviderCredentials;
use bridge_core::provider::{ProviderError, ProviderEvent};
use bridge_core::switch::mock::{Call, MockSwitch};
use bridge_core::switch::AudioStreamAction;
use bridge_core::transfer::{DestinationKind, FallbackAction, TransferDestination};
use bridge_server::router;
use bridge_server::state::{AppState, PortAllocator};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio_tungstenite::tungstenite::Message;

struct StubConfigSource {
    secretary: SecretaryConfig,
    destinations: Vec<TransferDestination>,
}

#[async_trait]
impl ConfigSource for StubConfigSource {
    async fn load_secretary(&self, _tenant_id: &str) -> Result<SecretaryConfig, ConfigError> {
        Ok(self.secretary.clone())
    }
    async fn load_credentials(&self, _tenant_id: &str) -> Result<ProviderCredentials, ConfigError> {
        Ok(ProviderCredentials { api_key: "test-key".into(), model_or_agent_id: "test-model".into() })
    }
    async fn load_transfer_rules(&self, tenant_id: &str) -> Result<TransferRules, ConfigError> {
        Ok(TransferRules { tenant_id: tenant_id.to_string(), destinations: self.destinations.clone() })
    }
    async fn load_time_condition(&self, _tenant_id: &str) -> Result<TimeCondition, ConfigError> {
        // Always open.
        Ok(TimeCondition::SimpleRange {
            start: "00:00".into(),
            end: "23:59".into(),
            days: [true; 7],
            timezone: "UTC".into(),
        })
    }
}

fn secretary() -> SecretaryConfig {
    SecretaryConfig {
        tenant_id: "tenant1".into(),
        prompt: "You are Clara, the receptionist.".into(),
        greeting: Some("Hello, how can I help?".into()),
        voice: "alloy".into(),
        language: "pt-BR".into(),
        provider: "openai".into(),
        fallback_providers: vec![],
        max_turns: 50,
        silence_fallback_seconds: 0,
        barge_in_enabled: true,
        webhook_url: None,
    }
}

fn sales_destination() -> TransferDestination {
    TransferDestination {
        kind: DestinationKind::Extension,
        number: "2001".into(),
        context: "internal".into(),
        aliases: vec!["sales".into()],
        working_hours_only: false,
        fallback_action: FallbackAction::TakeMessage,
        priority: 0,
        is_default: true,
    }
}

struct Harness {
    state: Arc<AppState>,
    switch: Arc<MockSwitch>,
    controllers: Arc<StdMutex<Vec<FakeProviderController>>>,
    base_url: String,
}

impl Harness {
    /// Boot a server on an ephemeral port with scripted drivers.
    async fn start(
        secretary: SecretaryConfig,
        destinations: Vec<TransferDestination>,
        b_leg_ports: Option<PortAllocator>,
        fail_first_configure: bool,
    ) -> Self {
        let controllers: Arc<StdMutex<Vec<FakeProviderController>>> = Arc::new(StdMutex::new(Vec::new()));
        let factory = {
            let controllers = controllers.clone();
            let failed_once = AtomicBool::new(!fail_first_configure);
            Arc::new(move |_name: &str, _creds: &ProviderCredentials| {
                let (driver, controller) = FakeDriver::scripted(16000, 16000);
                if !failed_once.swap(true, Ordering::SeqCst) {
                    controller.fail_next_configure(ProviderError::RateLimited("simulated".into()));
                }
                controllers.lock().unwrap().push(controller);
                Ok(Box::new(driver) as Box<dyn bridge_core::provider::ProviderDriver>)
            })
        };

        let source = StubConfigSource { secretary, destinations };
        let config_loader = Arc::new(ConfigLoader::new(Box::new(source)));
        let metrics = Arc::new(BridgeMetrics::new().unwrap());
        let switch = Arc::new(MockSwitch::new());

        let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let state = AppState::new(
            config_loader,
            metrics,
            switch.clone(),
            factory,
            format!("ws://127.0.0.1:{port}"),
            "127.0.0.1".into(),
            b_leg_ports,
        );

        let app = router(state.clone());
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                eprintln!("test server exited: {e}");
            }
        });

        Self {
            state,
            switch,
            controllers,
            base_url: format!("ws://127.0.0.1:{port}"),
        }
    }

    async fn connect(&self, call_uuid: &str) -> WsClient {
        let url = format!("{}/stream/tenant1/{call_uuid}/5511999990000", self.base_url);
        WsClient::connect(&url).await
    }

    fn controller(&self, index: usize) -> FakeProviderController {
        let controllers = self.controllers.lock().unwrap();
        controllers[index].clone()
    }

    async fn wait_for_controller(&self, count: usize) {
        for _ in 0..100 {
            if self.controllers.lock().unwrap().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("driver #{count} was never constructed");
    }

    async fn wait_for_switch_call<F: Fn(&Call) -> bool>(&self, pred: F) -> Call {
        for _ in 0..100 {
            if let Some(call) = self.switch.calls().into_iter().find(|c| pred(c)) {
                return call;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("expected switch call never happened; saw {:?}", self.switch.calls());
    }
}

struct WsClient {
    stream: tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
}

impl WsClient {
    async fn connect(url: &str) -> Self {
        let (stream, _) = tokio_tungstenite::connect_async(url).await.expect("ws connect failed");
        Self { stream }
    }

    async fn send_json(&mut self, value: Value) {
        self.stream
            .send(Message::Text(value.to_string().into()))
            .await
            .unwrap();
    }

    async fn send_audio(&mut self, bytes: Vec<u8>) {
        self.stream.send(Message::Binary(bytes.into())).await.unwrap();
    }

    /// Read frames until one matches `frame_type`, with an overall timeout.
    async fn expect_frame(&mut self, frame_type: &str) -> Value {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let message = tokio::time::timeout(remaining, self.stream.next())
                .await
                .unwrap_or_else(|_| panic!("timed out waiting for {frame_type} frame"));
            match message {
                Some(Ok(Message::Text(text))) => {
                    let value: Value = serde_json::from_str(&text).unwrap();
                    if value.get("type").and_then(Value::as_str) == Some(frame_type) {
                        return value;
                    }
                }
                Some(Ok(_)) => {}
                other => panic!("connection ended while waiting for {frame_type}: {other:?}"),
            }
        }
    }

    async fn close(mut self) {
        let _ = self.stream.close(None).await;
    }
}

/// One 20 ms frame's worth of PCM16 @ 16 kHz.
fn pcm_frame() -> Vec<u8> {
    vec![0u8; 640]
}

#[tokio::test]
async fn happy_path_greeting_audio_reaches_the_switch() {
    let harness = Harness::start(secretary(), vec![], None, false).await;
    let mut client = harness.connect("call-happy").await;

    harness.wait_for_controller(1).await;
    let controller = harness.controller(0);

    // The greeting was requested as the first utterance.
    for _ in 0..100 {
        if !controller.requested_instructions().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(!controller.requested_instructions().is_empty());

    controller.emit(ProviderEvent::ResponseStarted).await;
    controller.emit(ProviderEvent::AudioDelta(vec![1u8; 1280])).await;
    let frame = client.expect_frame("streamAudio").await;
    assert_eq!(frame["data"]["audioDataType"], "raw");
    assert_eq!(frame["data"]["sampleRate"], 16000);

    controller.emit(ProviderEvent::AudioDone).await;
    controller
        .emit(ProviderEvent::TranscriptDone("Hello, how can I help?".into()))
        .await;
    controller
        .emit(ProviderEvent::UserTranscript("I'd like to book an appointment".into()))
        .await;

    // Caller audio flows through to the provider.
    client.send_audio(pcm_frame()).await;
    for _ in 0..100 {
        if controller.sent_audio_bytes() > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(controller.sent_audio_bytes() > 0);

    // Hang up; the call log records the timeline in order.
    let logger = harness.state.logger("call-happy").await.expect("logger registered");
    client.send_json(json!({"type": "hangup"})).await;
    for _ in 0..100 {
        if logger.snapshot().final_state.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    client.close().await;

    let log = logger.snapshot();
    assert_eq!(log.final_state.as_deref(), Some("caller_hangup"));
    let kinds: Vec<CallLogEventKind> = log.events.iter().map(|e| e.kind).collect();
    assert!(kinds.contains(&CallLogEventKind::SessionStart));
    assert!(kinds.contains(&CallLogEventKind::AudioFirstOutbound));
    assert!(kinds.contains(&CallLogEventKind::TranscriptAssistant));
    assert!(kinds.contains(&CallLogEventKind::TranscriptUser));
    assert!(kinds.contains(&CallLogEventKind::SessionEnd));
    for pair in log.events.windows(2) {
        assert!(pair[0].timestamp <= pair[1].timestamp);
    }
}

#[tokio::test]
async fn barge_in_stops_playback_and_interrupts_the_provider() {
    let harness = Harness::start(secretary(), vec![], None, false).await;
    let mut client = harness.connect("call-barge").await;

    harness.wait_for_controller(1).await;
    let controller = harness.controller(0);

    controller.emit(ProviderEvent::ResponseStarted).await;
    controller.emit(ProviderEvent::AudioDelta(vec![1u8; 1280])).await;
    client.expect_frame("streamAudio").await;

    controller.emit(ProviderEvent::SpeechStarted).await;
    client.expect_frame("stopAudio").await;

    for _ in 0..100 {
        if controller.interrupt_count() > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(controller.interrupt_count(), 1);
    client.close().await;
}

#[tokio::test]
async fn take_message_sends_result_and_exact_confirmation() {
    let harness = Harness::start(secretary(), vec![], None, false).await;
    let client = harness.connect("call-message").await;

    harness.wait_for_controller(1).await;
    let controller = harness.controller(0);

    controller
        .emit(ProviderEvent::FunctionCall {
            name: "take_message".into(),
            args: json!({"caller_name": "Ana", "message": "Please call back at 3pm", "urgency": "normal"}),
            call_id: "fc_msg".into(),
        })
        .await;

    let mut saw_result = false;
    let mut confirmation: Option<String> = None;
    for _ in 0..100 {
        for item in controller.sent() {
            match item {
                SentItem::FunctionResult { name, .. } if name == "take_message" => saw_result = true,
                SentItem::ResponseRequested { instruction: Some(i) } if i.contains("Recado anotado") => {
                    confirmation = Some(i);
                }
                _ => {}
            }
        }
        if saw_result && confirmation.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(saw_result, "take_message result never reached the provider");
    assert!(confirmation.is_some(), "confirmation instruction never requested");

    let logger = harness.state.logger("call-message").await.expect("logger registered");
    let kinds: Vec<CallLogEventKind> = logger.snapshot().events.iter().map(|e| e.kind).collect();
    assert!(kinds.contains(&CallLogEventKind::MessageTaken));
    assert!(kinds.contains(&CallLogEventKind::ToolCalled));
    client.close().await;
}

#[tokio::test]
async fn announced_transfer_accepted_bridges_the_legs() {
    let harness = Harness::start(
        secretary(),
        vec![sales_destination()],
        Some(PortAllocator::new(18120, 18129)),
        false,
    )
    .await;
    let client = harness.connect("call-xfer").await;

    harness.wait_for_controller(1).await;
    let controller = harness.controller(0);
    let logger = harness.state.logger("call-xfer").await.expect("logger registered");

    controller
        .emit(ProviderEvent::FunctionCall {
            name: "request_handoff".into(),
            args: json!({"destination": "sales", "caller_name": "Bob"}),
            call_id: "fc_xfer".into(),
        })
        .await;

    // The transfer manager pauses the a-leg, originates, then starts the
    // b-leg stream; pick up the URL it handed the switch and dial in as
    // the attendant's leg.
    let start_call = harness
        .wait_for_switch_call(|c| {
            matches!(c, Call::UuidAudioStream { action: AudioStreamAction::Start, uuid, .. } if uuid.starts_with("mock-leg"))
        })
        .await;
    let Call::UuidAudioStream { ws_url, .. } = start_call else { unreachable!() };
    let attendant = WsClient::connect(&ws_url).await;

    harness.wait_for_controller(2).await;
    let aux_controller = harness.controller(1);

    // The announcement names the caller and the destination.
    for _ in 0..100 {
        if !aux_controller.requested_instructions().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let announcement = aux_controller.requested_instructions().remove(0).unwrap_or_default();
    assert!(announcement.contains("Bob"), "announcement was: {announcement}");
    assert!(announcement.contains("sales"), "announcement was: {announcement}");

    aux_controller
        .emit(ProviderEvent::UserTranscript("pode passar".into()))
        .await;
    aux_controller
        .emit(ProviderEvent::FunctionCall {
            name: "accept_transfer".into(),
            args: json!({}),
            call_id: "fc_accept".into(),
        })
        .await;

    // The b-leg was dialed presenting the caller's number, not the a-leg uuid.
    let originate = harness.wait_for_switch_call(|c| matches!(c, Call::Originate { .. })).await;
    let Call::Originate { destination, caller_id_number } = originate else { unreachable!() };
    assert_eq!(destination, "2001");
    assert_eq!(caller_id_number, "5511999990000");

    harness.wait_for_switch_call(|c| matches!(c, Call::UuidBridge { .. })).await;

    // The a-leg session releases once the bridge is up.
    for _ in 0..100 {
        if harness.state.session("call-xfer").await.is_none() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(harness.state.session("call-xfer").await.is_none());

    let kinds: Vec<CallLogEventKind> = logger.snapshot().events.iter().map(|e| e.kind).collect();
    assert!(kinds.contains(&CallLogEventKind::TransferInitiated));
    assert!(kinds.contains(&CallLogEventKind::TransferRinging));
    assert!(kinds.contains(&CallLogEventKind::TransferAnswered));
    assert!(kinds.contains(&CallLogEventKind::TransferCompleted));

    attendant.close().await;
    client.close().await;
}

#[tokio::test]
async fn announced_transfer_rejected_resumes_the_caller() {
    let harness = Harness::start(secretary(), vec![sales_destination()], None, false).await;
    let client = harness.connect("call-rej").await;

    harness.wait_for_controller(1).await;
    let controller = harness.controller(0);

    controller
        .emit(ProviderEvent::FunctionCall {
            name: "request_handoff".into(),
            args: json!({"destination": "2001", "caller_name": "Bob"}),
            call_id: "fc_rej".into(),
        })
        .await;

    let start_call = harness
        .wait_for_switch_call(|c| {
            matches!(c, Call::UuidAudioStream { action: AudioStreamAction::Start, uuid, .. } if uuid.starts_with("mock-leg"))
        })
        .await;
    let Call::UuidAudioStream { ws_url, .. } = start_call else { unreachable!() };
    let attendant = WsClient::connect(&ws_url).await;

    harness.wait_for_controller(2).await;
    let aux_controller = harness.controller(1);

    // An explicit refusal token makes the first reject final.
    aux_controller
        .emit(ProviderEvent::UserTranscript("agora não, estou em reunião".into()))
        .await;
    aux_controller
        .emit(ProviderEvent::FunctionCall {
            name: "reject_transfer".into(),
            args: json!({"reason": "em reunião"}),
            call_id: "fc_no".into(),
        })
        .await;

    // Let the farewell "play" so the drain wait completes promptly.
    tokio::time::sleep(Duration::from_millis(300)).await;
    aux_controller.emit(ProviderEvent::AudioDelta(vec![1u8; 640])).await;
    aux_controller.emit(ProviderEvent::AudioDone).await;

    harness
        .wait_for_switch_call(|c| matches!(c, Call::UuidKill { uuid } if uuid.starts_with("mock-leg")))
        .await;
    harness
        .wait_for_switch_call(|c| {
            matches!(c, Call::UuidAudioStream { action: AudioStreamAction::Resume, uuid, .. } if uuid == "call-rej")
        })
        .await;

    // The caller's session survives the rejected transfer.
    assert!(harness.state.session("call-rej").await.is_some());
    let logger = harness.state.logger("call-rej").await.expect("logger registered");
    for _ in 0..100 {
        let kinds: Vec<CallLogEventKind> = logger.snapshot().events.iter().map(|e| e.kind).collect();
        if kinds.contains(&CallLogEventKind::TransferRejected) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let kinds: Vec<CallLogEventKind> = logger.snapshot().events.iter().map(|e| e.kind).collect();
    assert!(kinds.contains(&CallLogEventKind::TransferRejected));

    attendant.close().await;
    client.close().await;
}

#[tokio::test]
async fn rate_limited_primary_falls_back_to_next_provider() {
    let mut config = secretary();
    config.fallback_providers = vec!["elevenlabs".into()];
    let harness = Harness::start(config, vec![], None, true).await;
    let client = harness.connect("call-fb").await;

    // Driver 0 rate-limits on configure; driver 1 is the fallback.
    harness.wait_for_controller(2).await;
    let fallback = harness.controller(1);

    for _ in 0..100 {
        if !fallback.requested_instructions().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    // The greeting went out on the fallback driver.
    assert!(!fallback.requested_instructions().is_empty());
    assert!(fallback.configured().is_some());

    let logger = harness.state.logger("call-fb").await.expect("logger registered");
    let kinds: Vec<CallLogEventKind> = logger.snapshot().events.iter().map(|e| e.kind).collect();
    let error_pos = kinds.iter().position(|k| *k == CallLogEventKind::OpenaiError);
    let connected_pos = kinds.iter().position(|k| *k == CallLogEventKind::OpenaiConnected);
    assert!(error_pos.is_some(), "no provider error recorded: {kinds:?}");
    assert!(connected_pos.is_some(), "no provider connected recorded: {kinds:?}");
    assert!(error_pos < connected_pos);

    client.close().await;
}
