//! Session orchestrator (spec §4.I) — the per-call object that owns the
//! event bus, state machine, heartbeat and provider driver, and drives the
//! provider's event stream into switch-facing audio/text and tool dispatch.
//!
//! The session never touches a socket: the WS layer passes in
//! [`SessionHandlers`] and receives audio/control effects through them.
//! Handlers can be swapped at runtime ([`Session::update_audio_handlers`]),
//! which is how a switch reconnect during a transfer reattaches to the
//! live session instead of rebuilding it.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde_json::{json, Value};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::Duration;

use crate::audio::resample::Resampler;
use crate::bus::{EventBus, VoiceEvent, VoiceEventType};
use crate::error::{BridgeError, Result};
use crate::fsm::{CallState, StateMachine, Trigger, TriggerData};
use crate::heartbeat::Heartbeat;
use crate::provider::registry::{DriverFactory, ProviderCredentials};
use crate::provider::{ProviderConfig, ProviderDriver, ProviderError, ProviderEvent};
use crate::tools::registry::ToolRegistry;
use crate::tools::{SideEffect, ToolContext, ToolDefinition};

pub const SWITCH_AUDIO_RATE: u32 = 16_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SilenceFallbackAction {
    Reprompt,
    Handoff,
    EndCall,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaxTurnsAction {
    EndCall,
    Handoff,
}

/// The provider/tool-relevant subset of the call's configuration (spec §3
/// `SessionConfig`). Admin-facing fields (DB ids, webhook URLs) live in
/// `bridge-server::config`; this is what the session loop itself reads.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub call_id: String,
    pub tenant_id: String,
    pub caller_id: String,
    pub language: String,
    pub secretary_prompt: String,
    pub transfer_rules_prompt: Option<String>,
    pub business_info_prompt: Option<String>,
    pub greeting: Option<String>,
    pub voice: String,
    pub vad_threshold: f32,
    pub vad_silence_ms: u32,
    pub vad_prefix_padding_ms: u32,
    pub max_output_tokens: Option<u32>,
    pub max_turns: u32,
    pub max_turns_action: MaxTurnsAction,
    pub silence_fallback_seconds: u64,
    pub silence_fallback_action: SilenceFallbackAction,
    pub silence_fallback_max_retries: u32,
    pub barge_in_enabled: bool,
    pub rms_target: f32,
    pub rms_min_gate: f32,
    pub rms_max_gain: f32,
    pub outside_business_hours: bool,
    pub outside_hours_message: Option<String>,
    pub post_message_hangup_secs: u64,
    pub fallback_providers: Vec<String>,
    /// Tenant credentials, reused when swapping to a fallback provider.
    pub provider_credentials: ProviderCredentials,
}

#[derive(Debug, Clone)]
pub struct TranscriptEntry {
    pub role: &'static str,
    pub text: String,
}

/// Callbacks the WS layer wires in to receive switch-facing effects (spec
/// §4.K). `on_audio_output` and `on_barge_in` carry the playback generation
/// so the sender task can drop superseded chunks.
#[derive(Clone)]
pub struct SessionHandlers {
    pub on_audio_output: Arc<dyn Fn(u64, Vec<u8>) + Send + Sync>,
    /// Optional G.711 passthrough, used only when a provider emits PCMU
    /// directly instead of linear16.
    pub on_audio_output_pcmu: Option<Arc<dyn Fn(Vec<u8>) + Send + Sync>>,
    pub on_audio_done: Arc<dyn Fn(u64) + Send + Sync>,
    pub on_barge_in: Arc<dyn Fn(u64, &str) + Send + Sync>,
    pub on_transfer: Arc<dyn Fn(&str, Value) + Send + Sync>,
}

struct Mutable {
    fsm: StateMachine,
    inbound_resampler: Resampler,
    outbound_resampler: Resampler,
    transcript: Vec<TranscriptEntry>,
    silence_retries: u32,
    tasks: Vec<JoinHandle<()>>,
}

pub struct Session {
    config: SessionConfig,
    bus: EventBus,
    heartbeat: Arc<Heartbeat>,
    driver: AsyncMutex<Box<dyn ProviderDriver>>,
    driver_factory: DriverFactory,
    tools: Arc<ToolRegistry>,
    handlers: RwLock<SessionHandlers>,
    state: AsyncMutex<Mutable>,
    turns: AtomicU32,
    playback_generation: AtomicU64,
    active: AtomicBool,
    in_transfer: AtomicBool,
    first_audio_out: AtomicBool,
    first_audio_in: AtomicBool,
    last_user_activity_ms: AtomicI64,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl Session {
    pub fn new(
        config: SessionConfig,
        driver: Box<dyn ProviderDriver>,
        tools: Arc<ToolRegistry>,
        handlers: SessionHandlers,
        bus: EventBus,
    ) -> Result<Arc<Self>> {
        Self::with_driver_factory(config, driver, crate::provider::registry::default_factory(), tools, handlers, bus)
    }

    /// Like [`Session::new`], with an explicit driver factory used for
    /// provider fallback swaps.
    pub fn with_driver_factory(
        config: SessionConfig,
        driver: Box<dyn ProviderDriver>,
        driver_factory: DriverFactory,
        tools: Arc<ToolRegistry>,
        handlers: SessionHandlers,
        bus: EventBus,
    ) -> Result<Arc<Self>> {
        let inbound_resampler = Resampler::new(SWITCH_AUDIO_RATE, driver.input_sample_rate())
            .map_err(|e| BridgeError::Audio(e.to_string()))?;
        let outbound_resampler = Resampler::new(driver.output_sample_rate(), SWITCH_AUDIO_RATE)
            .map_err(|e| BridgeError::Audio(e.to_string()))?;
        let heartbeat = Heartbeat::new(
            config.call_id.clone(),
            bus.clone(),
            Duration::from_secs(15),
            Duration::from_secs(30),
        );

        Ok(Arc::new(Self {
            state: AsyncMutex::new(Mutable {
                fsm: StateMachine::new(),
                inbound_resampler,
                outbound_resampler,
                transcript: Vec::new(),
                silence_retries: 0,
                tasks: Vec::new(),
            }),
            config,
            bus,
            heartbeat,
            driver: AsyncMutex::new(driver),
            driver_factory,
            tools,
            handlers: RwLock::new(handlers),
            turns: AtomicU32::new(0),
            playback_generation: AtomicU64::new(0),
            active: AtomicBool::new(false),
            in_transfer: AtomicBool::new(false),
            first_audio_out: AtomicBool::new(false),
            first_audio_in: AtomicBool::new(false),
            last_user_activity_ms: AtomicI64::new(now_ms()),
        }))
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn is_in_transfer(&self) -> bool {
        self.in_transfer.load(Ordering::SeqCst)
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn heartbeat(&self) -> &Arc<Heartbeat> {
        &self.heartbeat
    }

    pub fn playback_generation(&self) -> u64 {
        self.playback_generation.load(Ordering::SeqCst)
    }

    /// Re-point the switch-facing callbacks at a new connection. Used on
    /// reconnect (spec §4.K: the WS server reattaches to the existing
    /// session by `call_uuid`).
    pub fn update_audio_handlers(&self, handlers: SessionHandlers) {
        *self.handlers.write().unwrap() = handlers;
    }

    fn handlers(&self) -> SessionHandlers {
        self.handlers.read().unwrap().clone()
    }

    pub async fn current_state(&self) -> CallState {
        self.state.lock().await.fsm.state()
    }

    fn build_prompt(&self) -> String {
        let mut prompt = self.config.secretary_prompt.clone();
        if let Some(rules) = &self.config.transfer_rules_prompt {
            prompt.push_str("\n\n");
            prompt.push_str(rules);
        }
        if let Some(info) = &self.config.business_info_prompt {
            prompt.push_str("\n\n");
            prompt.push_str(info);
        }
        prompt
    }

    fn tool_definitions(&self) -> Vec<ToolDefinition> {
        self.tools.definitions()
    }

    /// Trigger an FSM transition and, when it succeeds, emit the
    /// corresponding `StateChanged` event.
    async fn fire(&self, trigger: Trigger, data: &TriggerData) -> bool {
        let change = {
            let mut state = self.state.lock().await;
            if state.fsm.trigger(trigger, data) {
                state.fsm.history().last().cloned()
            } else {
                None
            }
        };
        match change {
            Some(change) => {
                self.emit(
                    VoiceEventType::StateChanged,
                    json!({"old": change.old, "new": change.new, "trigger": change.trigger}),
                )
                .await;
                true
            }
            None => false,
        }
    }

    /// Responsibility 1: startup.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.fire(Trigger::Connect, &TriggerData::empty()).await;
        self.emit(VoiceEventType::SessionStarted, json!({})).await;

        let provider_config = ProviderConfig {
            instructions: self.build_prompt(),
            voice: self.config.voice.clone(),
            language: Some(self.config.language.clone()),
            tools: self.tool_definitions(),
            vad_threshold: self.config.vad_threshold,
            vad_silence_ms: self.config.vad_silence_ms,
            vad_prefix_padding_ms: self.config.vad_prefix_padding_ms,
            max_output_tokens: self.config.max_output_tokens,
        };

        match self.connect_and_configure(&provider_config).await {
            Ok(()) => {}
            Err(e) if e.is_failover_candidate() => {
                self.emit(VoiceEventType::ProviderError, json!({"error": e.to_string()})).await;
                self.try_fallback(&provider_config).await?;
            }
            Err(e) => return Err(e.into()),
        }
        let provider_name = { self.driver.lock().await.name() };
        self.emit(VoiceEventType::ProviderConnected, json!({"provider": provider_name})).await;

        self.fire(Trigger::ConnectionEstablished, &TriggerData::empty()).await;
        self.fire(Trigger::StartListening, &TriggerData::empty()).await;
        self.active.store(true, Ordering::SeqCst);

        self.register_transfer_phase_handlers();
        self.spawn_supervisors().await;

        let greeting = if self.config.outside_business_hours {
            self.config.outside_hours_message.clone().or_else(|| self.config.greeting.clone())
        } else {
            self.config.greeting.clone()
        };

        if let Some(greeting) = greeting {
            let mut driver = self.driver.lock().await;
            driver
                .request_response(Some(&greeting))
                .await
                .map_err(BridgeError::from)?;
        }

        Ok(())
    }

    async fn connect_and_configure(&self, config: &ProviderConfig) -> std::result::Result<(), ProviderError> {
        let mut driver = self.driver.lock().await;
        driver.connect().await?;
        driver.configure(config).await
    }

    /// Responsibility 9: transparent fallback on rate-limit/timeout before
    /// the first audio arrives. The swap is a compare-and-set on the single
    /// driver slot: the old driver is disconnected under the same lock that
    /// installs its replacement.
    async fn try_fallback(self: &Arc<Self>, config: &ProviderConfig) -> Result<()> {
        for name in &self.config.fallback_providers {
            tracing::warn!(call_id = %self.config.call_id, provider = %name, "falling back to next provider");
            let mut new_driver = (self.driver_factory)(name, &self.config.provider_credentials)?;
            if new_driver.connect().await.is_ok() && new_driver.configure(config).await.is_ok() {
                let mut driver = self.driver.lock().await;
                driver.disconnect().await;
                *driver = new_driver;
                return Ok(());
            }
        }
        Err(BridgeError::Provider(ProviderError::ConnectFail(
            "all fallback providers exhausted".into(),
        )))
    }

    /// Map the transfer manager's phase events (emitted on this session's
    /// bus) onto FSM transitions, so the call's state always reflects the
    /// in-flight transfer. Weak back-references break the session→bus→session
    /// cycle.
    fn register_transfer_phase_handlers(self: &Arc<Self>) {
        let phases: [(VoiceEventType, &'static [Trigger]); 5] = [
            (VoiceEventType::TransferInitiated, &[Trigger::TransferValidated]),
            (VoiceEventType::TransferRinging, &[Trigger::TransferDialing]),
            (VoiceEventType::TransferAnswered, &[Trigger::TransferAnnouncing]),
            (VoiceEventType::TransferCompleted, &[Trigger::TransferAccepted, Trigger::TransferBridged]),
            (VoiceEventType::TransferRejected, &[Trigger::TransferRejected]),
        ];
        for (kind, triggers) in phases {
            let weak = Arc::downgrade(self);
            self.bus.on(kind, move |_event| {
                let weak = weak.clone();
                async move {
                    let Some(session) = weak.upgrade() else { return };
                    for &trigger in triggers {
                        session.fire(trigger, &TriggerData::empty()).await;
                    }
                    if matches!(kind, VoiceEventType::TransferCompleted | VoiceEventType::TransferRejected) {
                        session.in_transfer.store(false, Ordering::SeqCst);
                    }
                }
            });
        }
    }

    /// Spawn the heartbeat monitor and the user-silence watcher
    /// (responsibility 7). Both are aborted in [`Session::stop`].
    async fn spawn_supervisors(self: &Arc<Self>) {
        let monitor = self.heartbeat.spawn_monitor(Duration::from_secs(5));

        let silence = {
            let weak = Arc::downgrade(self);
            let threshold_ms = self.config.silence_fallback_seconds.saturating_mul(1000) as i64;
            tokio::spawn(async move {
                if threshold_ms == 0 {
                    return;
                }
                let mut ticker = tokio::time::interval(Duration::from_secs(1));
                loop {
                    ticker.tick().await;
                    let Some(session) = weak.upgrade() else { return };
                    if !session.is_active() {
                        return;
                    }
                    if session.is_in_transfer() {
                        continue;
                    }
                    let idle = now_ms() - session.last_user_activity_ms.load(Ordering::Relaxed);
                    if idle >= threshold_ms {
                        session.last_user_activity_ms.store(now_ms(), Ordering::Relaxed);
                        if let Err(e) = session.handle_silence_detected().await {
                            tracing::warn!(call_id = %session.config.call_id, error = %e, "silence fallback failed");
                        }
                    }
                }
            })
        };

        let mut state = self.state.lock().await;
        state.tasks.push(monitor);
        state.tasks.push(silence);
    }

    /// Responsibility 2: inbound audio from the switch.
    pub async fn handle_audio_input(self: &Arc<Self>, pcm16_16k: &[u8]) -> Result<()> {
        self.heartbeat.touch_audio();
        if !self.first_audio_in.swap(true, Ordering::SeqCst) {
            self.emit(VoiceEventType::UserAudioReceived, json!({})).await;
        }
        let normalized = normalize_rms(
            pcm16_16k,
            self.config.rms_target,
            self.config.rms_min_gate,
            self.config.rms_max_gain,
        );

        let resampled = {
            let mut state = self.state.lock().await;
            state
                .inbound_resampler
                .process(&normalized)
                .map_err(|e| BridgeError::Audio(e.to_string()))?
        };
        if resampled.is_empty() {
            return Ok(());
        }

        let mut driver = self.driver.lock().await;
        driver.send_audio(&resampled).await.map_err(BridgeError::from)?;
        Ok(())
    }

    /// Drains the provider event stream. Intended to run as a background
    /// task for the session's lifetime; returns once the driver closes.
    /// Takes the event stream out of the driver first, so consuming events
    /// never holds the driver lock audio sends need.
    pub async fn run_provider_loop(self: Arc<Self>) {
        let mut events = {
            let mut driver = self.driver.lock().await;
            match driver.start_events() {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::error!(call_id = %self.config.call_id, error = %e, "failed to start provider event stream");
                    return;
                }
            }
        };

        while let Some(event) = events.next().await {
            match event {
                Ok(event) => {
                    self.heartbeat.touch_provider();
                    if let Err(e) = self.handle_provider_event(event).await {
                        tracing::error!(call_id = %self.config.call_id, error = %e, "error handling provider event");
                    }
                }
                Err(e) => {
                    tracing::warn!(call_id = %self.config.call_id, error = %e, "provider error");
                    self.emit(VoiceEventType::ProviderError, json!({"error": e.to_string()})).await;
                }
            }
            if !self.is_active() {
                break;
            }
        }
        tracing::info!(call_id = %self.config.call_id, "provider event stream ended");
    }

    async fn handle_provider_event(self: &Arc<Self>, event: ProviderEvent) -> Result<()> {
        match event {
            ProviderEvent::AudioDelta(bytes) => self.handle_audio_delta(bytes).await,
            ProviderEvent::AudioDone => self.handle_audio_done().await,
            ProviderEvent::TranscriptDelta(_) => Ok(()),
            ProviderEvent::TranscriptDone(text) => {
                self.push_transcript("assistant", &text).await;
                self.emit(VoiceEventType::AssistantTranscript, json!({"text": text})).await;
                self.on_turn_completed().await
            }
            ProviderEvent::UserTranscript(text) => {
                self.touch_user_activity();
                self.push_transcript("user", &text).await;
                self.emit(VoiceEventType::UserTranscript, json!({"text": text})).await;
                Ok(())
            }
            ProviderEvent::SpeechStarted => self.handle_speech_started().await,
            ProviderEvent::SpeechStopped => {
                self.emit(VoiceEventType::SpeechStopped, json!({})).await;
                Ok(())
            }
            ProviderEvent::ResponseStarted => {
                self.fire(Trigger::AiStartSpeaking, &TriggerData::empty()).await;
                Ok(())
            }
            ProviderEvent::ResponseDone => {
                self.fire(Trigger::AiStopSpeaking, &TriggerData::empty()).await;
                Ok(())
            }
            ProviderEvent::FunctionCall { name, args, call_id } => self.handle_function_call(name, args, call_id).await,
            ProviderEvent::RateLimited => {
                self.emit(VoiceEventType::ProviderTimeout, json!({"reason": "rate_limited"})).await;
                Ok(())
            }
            ProviderEvent::Error { kind, message } => {
                self.emit(VoiceEventType::ProviderError, json!({"kind": kind, "message": message})).await;
                Ok(())
            }
            ProviderEvent::SessionEnded { reason } => self.stop(&reason).await,
        }
    }

    fn touch_user_activity(&self) {
        self.last_user_activity_ms.store(now_ms(), Ordering::Relaxed);
        let mut state = self.state.try_lock();
        if let Ok(state) = &mut state {
            state.silence_retries = 0;
        }
    }

    /// Responsibility 3: outbound audio. Pacing happens in the WS layer's
    /// sender task (spec §4.K); here we only resample and tag with the
    /// current playback generation.
    async fn handle_audio_delta(&self, bytes: Vec<u8>) -> Result<()> {
        let resampled = {
            let mut state = self.state.lock().await;
            state
                .outbound_resampler
                .process(&bytes)
                .map_err(|e| BridgeError::Audio(e.to_string()))?
        };
        if resampled.is_empty() {
            return Ok(());
        }

        if !self.first_audio_out.swap(true, Ordering::SeqCst) {
            self.emit(VoiceEventType::AudioFirstOutput, json!({})).await;
        }

        let generation = self.playback_generation.load(Ordering::SeqCst);
        (self.handlers().on_audio_output)(generation, resampled);
        Ok(())
    }

    async fn handle_audio_done(&self) -> Result<()> {
        let generation = self.playback_generation.load(Ordering::SeqCst);
        (self.handlers().on_audio_done)(generation);
        self.emit(VoiceEventType::AudioOutputFlushed, json!({"residual_bytes": 0})).await;
        Ok(())
    }

    /// Responsibility 4: barge-in.
    async fn handle_speech_started(self: &Arc<Self>) -> Result<()> {
        self.touch_user_activity();
        self.emit(VoiceEventType::SpeechStarted, json!({})).await;

        let was_speaking = { self.state.lock().await.fsm.state() == CallState::Speaking };
        if !was_speaking || !self.config.barge_in_enabled {
            return Ok(());
        }

        self.fire(Trigger::AiStopSpeaking, &TriggerData::empty()).await;
        let generation = self.playback_generation.fetch_add(1, Ordering::SeqCst) + 1;
        (self.handlers().on_barge_in)(generation, "user_speech_started");

        let mut driver = self.driver.lock().await;
        driver.interrupt().await.map_err(BridgeError::from)?;
        Ok(())
    }

    /// Responsibility 5: function call dispatch.
    pub async fn handle_function_call(self: &Arc<Self>, name: String, args: Value, call_id: String) -> Result<()> {
        self.emit(VoiceEventType::FunctionCallStarted, json!({"name": name, "call_id": call_id})).await;

        let ctx = ToolContext {
            call_id: self.config.call_id.clone(),
            tenant_id: self.config.tenant_id.clone(),
            caller_id: self.config.caller_id.clone(),
            language: self.config.language.clone(),
        };

        let result = self.tools.dispatch(&name, &call_id, &ctx, &args).await;
        let result = match result {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(call_id = %self.config.call_id, tool = %name, error = %e, "tool dispatch failed");
                crate::tools::ToolResult::error(e.to_string())
            }
        };

        {
            let mut driver = self.driver.lock().await;
            let data = result.data.clone().unwrap_or(Value::Null);
            driver
                .send_function_result(&name, &data, Some(&call_id))
                .await
                .map_err(BridgeError::from)?;
        }

        for effect in &result.side_effects {
            self.apply_side_effect(effect, &name).await?;
        }

        if result.should_respond {
            let mut driver = self.driver.lock().await;
            driver
                .request_response(result.instruction.as_deref())
                .await
                .map_err(BridgeError::from)?;
        }

        self.emit(
            VoiceEventType::FunctionCallCompleted,
            json!({
                "name": name,
                "call_id": call_id,
                "args": args,
                "output": result.data,
                "success": result.success,
                "error": result.error,
            }),
        )
        .await;
        Ok(())
    }

    async fn apply_side_effect(self: &Arc<Self>, effect: &SideEffect, tool_name: &str) -> Result<()> {
        match effect {
            SideEffect::EndCall { reason, delay_secs } => {
                let this = self.clone();
                let reason = reason.clone();
                let delay = *delay_secs;
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_secs(delay)).await;
                    let _ = this.stop(&reason).await;
                });
                Ok(())
            }
            SideEffect::RequestHandoff { destination, caller_name } => {
                let data = TriggerData {
                    data: json!({"destination": destination, "caller_name": caller_name}),
                };
                if self.fire(Trigger::RequestTransfer, &data).await {
                    self.in_transfer.store(true, Ordering::SeqCst);
                    // Drop any queued assistant audio so the caller hears
                    // silence, not a half-finished sentence, while on hold.
                    let generation = self.playback_generation.fetch_add(1, Ordering::SeqCst) + 1;
                    let handlers = self.handlers();
                    (handlers.on_barge_in)(generation, "transfer");
                    (handlers.on_transfer)(
                        "request_handoff",
                        json!({"destination": destination, "caller_name": caller_name}),
                    );
                } else {
                    tracing::warn!(call_id = %self.config.call_id, "request_handoff denied by fsm guard");
                }
                Ok(())
            }
            SideEffect::HoldCall => {
                self.fire(Trigger::Hold, &TriggerData::empty()).await;
                self.emit(VoiceEventType::HoldStarted, json!({})).await;
                Ok(())
            }
            SideEffect::UnholdCall => {
                self.fire(Trigger::Unhold, &TriggerData::empty()).await;
                self.emit(VoiceEventType::HoldEnded, json!({})).await;
                Ok(())
            }
            SideEffect::MessageTaken { caller_name, message, urgency } => {
                self.emit(
                    VoiceEventType::MessageTaken,
                    json!({"caller_name": caller_name, "message": message, "urgency": urgency, "tool": tool_name}),
                )
                .await;
                Ok(())
            }
            SideEffect::AcceptTransfer | SideEffect::RejectTransfer { .. } => {
                // Consumed by the transfer manager's decision loop via the
                // FunctionCallCompleted event this method's caller already
                // emits; nothing further to do here.
                Ok(())
            }
        }
    }

    /// Responsibility 6: turn counting.
    async fn on_turn_completed(self: &Arc<Self>) -> Result<()> {
        let turns = self.turns.fetch_add(1, Ordering::SeqCst) + 1;
        if turns >= self.config.max_turns {
            match self.config.max_turns_action {
                MaxTurnsAction::EndCall => self.stop("max_turns_reached").await,
                MaxTurnsAction::Handoff => {
                    (self.handlers().on_transfer)("max_turns_reached", json!({}));
                    Ok(())
                }
            }
        } else {
            Ok(())
        }
    }

    /// Responsibility 7: silence fallback, invoked by the watcher task once
    /// the caller has been quiet past the configured threshold.
    pub async fn handle_silence_detected(self: &Arc<Self>) -> Result<()> {
        let retries = {
            let mut state = self.state.lock().await;
            state.silence_retries += 1;
            state.silence_retries
        };
        if retries > self.config.silence_fallback_max_retries {
            return self.stop("silence_fallback_exhausted").await;
        }
        match self.config.silence_fallback_action {
            SilenceFallbackAction::Reprompt => {
                let mut driver = self.driver.lock().await;
                driver
                    .request_response(Some("The caller has gone quiet; politely check if they are still there."))
                    .await
                    .map_err(BridgeError::from)?;
                Ok(())
            }
            SilenceFallbackAction::Handoff => {
                (self.handlers().on_transfer)("silence_fallback", json!({}));
                Ok(())
            }
            SilenceFallbackAction::EndCall => self.stop("silence_fallback").await,
        }
    }

    /// Ask the assistant for one utterance with an explicit instruction.
    /// Used by the transfer manager's re-prompt path on an ambiguous reject.
    pub async fn prompt(&self, instruction: &str) -> Result<()> {
        let mut driver = self.driver.lock().await;
        driver
            .request_response(Some(instruction))
            .await
            .map_err(BridgeError::from)
    }

    async fn push_transcript(&self, role: &'static str, text: &str) {
        let mut state = self.state.lock().await;
        state.transcript.push(TranscriptEntry { role, text: text.to_string() });
    }

    pub async fn transcript(&self) -> Vec<TranscriptEntry> {
        self.state.lock().await.transcript.clone()
    }

    async fn emit(&self, kind: VoiceEventType, data: Value) {
        self.bus.emit(VoiceEvent::new(kind, &self.config.call_id, data)).await;
    }

    /// Tear down the session. Idempotent: a second call is a no-op.
    pub async fn stop(self: &Arc<Self>, reason: &str) -> Result<()> {
        if !self.active.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.fire(Trigger::EndCall, &TriggerData::empty()).await;
        self.fire(Trigger::ForceEnd, &TriggerData::empty()).await;

        {
            let mut state = self.state.lock().await;
            for task in state.tasks.drain(..) {
                task.abort();
            }
        }

        self.emit(VoiceEventType::CallHangup, json!({"reason": reason})).await;
        self.emit(VoiceEventType::SessionEnded, json!({"reason": reason})).await;

        let mut driver = self.driver.lock().await;
        driver.disconnect().await;
        Ok(())
    }
}

/// RMS-based gain normalization toward `target`, gated by `min_rms` (skip
/// near-silence to avoid amplifying noise) and clipped by `max_gain`
/// (spec §4.I responsibility 2).
fn normalize_rms(pcm16: &[u8], target: f32, min_rms: f32, max_gain: f32) -> Vec<u8> {
    if target <= 0.0 || pcm16.len() < 2 {
        return pcm16.to_vec();
    }
    let samples: Vec<i16> = pcm16.chunks_exact(2).map(|c| i16::from_le_bytes([c[0], c[1]])).collect();
    if samples.is_empty() {
        return pcm16.to_vec();
    }

    let sum_sq: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    let rms = (sum_sq / samples.len() as f64).sqrt() as f32;
    if rms < min_rms {
        return pcm16.to_vec();
    }

    let gain = (target / rms).min(max_gain).max(0.0);
    if (gain - 1.0).abs() < 0.01 {
        return pcm16.to_vec();
    }

    let mut out = Vec::with_capacity(pcm16.len());
    for s in samples {
        let scaled = (s as f32 * gain).clamp(i16::MIN as f32, i16::MAX as f32) as i16;
        out.extend_from_slice(&scaled.to_le_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::fake::FakeDriver;
    use std::sync::atomic::AtomicUsize;

    fn test_config() -> SessionConfig {
        SessionConfig {
            call_id: "call1".into(),
            tenant_id: "tenant1".into(),
            caller_id: "+1000".into(),
            language: "pt-BR".into(),
            secretary_prompt: "You are a receptionist.".into(),
            transfer_rules_prompt: None,
            business_info_prompt: None,
            greeting: None,
            voice: "alloy".into(),
            vad_threshold: 0.5,
            vad_silence_ms: 500,
            vad_prefix_padding_ms: 300,
            max_output_tokens: None,
            max_turns: 50,
            max_turns_action: MaxTurnsAction::EndCall,
            silence_fallback_seconds: 0,
            silence_fallback_action: SilenceFallbackAction::Reprompt,
            silence_fallback_max_retries: 2,
            barge_in_enabled: true,
            rms_target: 0.0,
            rms_min_gate: 0.0,
            rms_max_gain: 1.0,
            outside_business_hours: false,
            outside_hours_message: None,
            post_message_hangup_secs: 10,
            fallback_providers: vec![],
            provider_credentials: ProviderCredentials::default(),
        }
    }

    struct HandlerCounters {
        audio: Arc<AtomicUsize>,
        barge_in: Arc<AtomicUsize>,
    }

    fn counting_handlers() -> (SessionHandlers, HandlerCounters) {
        let audio = Arc::new(AtomicUsize::new(0));
        let barge_in = Arc::new(AtomicUsize::new(0));
        let ac = audio.clone();
        let bc = barge_in.clone();
        (
            SessionHandlers {
                on_audio_output: Arc::new(move |_gen, _bytes| {
                    ac.fetch_add(1, Ordering::SeqCst);
                }),
                on_audio_output_pcmu: None,
                on_audio_done: Arc::new(|_gen| {}),
                on_barge_in: Arc::new(move |_gen, _reason| {
                    bc.fetch_add(1, Ordering::SeqCst);
                }),
                on_transfer: Arc::new(|_reason, _data| {}),
            },
            HandlerCounters { audio, barge_in },
        )
    }

    fn new_session(config: SessionConfig, registry: ToolRegistry) -> (Arc<Session>, HandlerCounters) {
        let (driver, _controller) = FakeDriver::scripted(16000, 16000);
        let (handlers, counters) = counting_handlers();
        let bus = EventBus::new(64);
        let session = Session::new(config, Box::new(driver), Arc::new(registry), handlers, bus).unwrap();
        (session, counters)
    }

    #[tokio::test]
    async fn start_transitions_to_listening_and_emits_state_changes() {
        let (session, _) = new_session(test_config(), ToolRegistry::new());
        session.start().await.unwrap();
        assert!(session.is_active());
        assert_eq!(session.current_state().await, CallState::Listening);

        let state_changes = session
            .bus()
            .history()
            .into_iter()
            .filter(|e| e.kind == VoiceEventType::StateChanged)
            .count();
        assert_eq!(state_changes, 3); // Connect, ConnectionEstablished, StartListening
    }

    #[tokio::test]
    async fn barge_in_advances_playback_generation_and_interrupts() {
        let (session, counters) = new_session(test_config(), ToolRegistry::new());
        session.start().await.unwrap();

        session.fire(Trigger::AiStartSpeaking, &TriggerData::empty()).await;
        assert_eq!(session.current_state().await, CallState::Speaking);

        let before = session.playback_generation();
        session.handle_speech_started().await.unwrap();
        assert_eq!(session.playback_generation(), before + 1);
        assert_eq!(counters.barge_in.load(Ordering::SeqCst), 1);
        assert_eq!(session.current_state().await, CallState::Listening);
    }

    #[tokio::test]
    async fn end_call_tool_stops_session_after_delay() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(crate::tools::builtin::EndCallTool { delay_secs: 0 }));
        let (session, _) = new_session(test_config(), registry);
        session.start().await.unwrap();

        session
            .handle_function_call("end_call".into(), json!({"reason": "caller_done"}), "fc_1".into())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!session.is_active());
        assert_eq!(session.current_state().await, CallState::Ended);
    }

    #[tokio::test]
    async fn audio_delta_reaches_handler_and_marks_first_output() {
        let (session, counters) = new_session(test_config(), ToolRegistry::new());
        session.start().await.unwrap();

        session.handle_provider_event(ProviderEvent::AudioDelta(vec![0u8; 640])).await.unwrap();
        session.handle_provider_event(ProviderEvent::AudioDelta(vec![0u8; 640])).await.unwrap();
        assert_eq!(counters.audio.load(Ordering::SeqCst), 2);

        let first_output_events = session
            .bus()
            .history()
            .into_iter()
            .filter(|e| e.kind == VoiceEventType::AudioFirstOutput)
            .count();
        assert_eq!(first_output_events, 1);
    }

    #[tokio::test]
    async fn transfer_phase_events_drive_the_fsm() {
        let (session, _) = new_session(test_config(), ToolRegistry::new());
        session.start().await.unwrap();

        let data = TriggerData { data: json!({"destination": "sales", "caller_name": "Bob"}) };
        assert!(session.fire(Trigger::RequestTransfer, &data).await);

        let bus = session.bus().clone();
        bus.emit(VoiceEvent::new(VoiceEventType::TransferInitiated, "call1", json!({}))).await;
        assert_eq!(session.current_state().await, CallState::TransferringDialing);
        bus.emit(VoiceEvent::new(VoiceEventType::TransferRinging, "call1", json!({}))).await;
        bus.emit(VoiceEvent::new(VoiceEventType::TransferAnswered, "call1", json!({}))).await;
        assert_eq!(session.current_state().await, CallState::TransferringWaiting);
        bus.emit(VoiceEvent::new(VoiceEventType::TransferCompleted, "call1", json!({}))).await;
        assert_eq!(session.current_state().await, CallState::Bridged);
    }

    #[tokio::test]
    async fn transfer_rejected_returns_to_listening() {
        let (session, _) = new_session(test_config(), ToolRegistry::new());
        session.start().await.unwrap();

        let data = TriggerData { data: json!({"destination": "sales", "caller_name": "Bob"}) };
        session.fire(Trigger::RequestTransfer, &data).await;
        session.in_transfer.store(true, Ordering::SeqCst);

        let bus = session.bus().clone();
        bus.emit(VoiceEvent::new(VoiceEventType::TransferRejected, "call1", json!({}))).await;
        assert_eq!(session.current_state().await, CallState::Listening);
        assert!(!session.is_in_transfer());
    }

    #[tokio::test]
    async fn rms_normalization_is_noop_when_target_is_zero() {
        let pcm = vec![10, 0, 20, 0];
        let out = normalize_rms(&pcm, 0.0, 0.0, 1.0);
        assert_eq!(out, pcm);
    }
}
