//! Announced transfer manager (spec §4.J) — the hardest behavioral piece.
//!
//! The manager does not itself own a provider driver: the auxiliary AI that
//! talks to the attendant on the b-leg is a second `Session` constructed by
//! the WS layer when the switch connects the new leg to the announcement
//! endpoint (spec §4.K "reuse an existing active Session ... otherwise
//! construct a new one"). This type coordinates switch operations and reads
//! the auxiliary session's event bus to drive the decision loop, which
//! keeps it decoupled from `Session` the way the spec keeps the transfer
//! manager a child task rather than a parent of the Session it serves.
//!
//! Phase progress (initiated/ringing/answered/completed/rejected) is
//! reported as events on the a-leg bus; the a-leg session maps those onto
//! its FSM and the call logger turns them into the TRANSFER_* timeline.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::{timeout, Duration, Instant};

use crate::bus::{EventBus, VoiceEvent, VoiceEventType};
use crate::switch::{AudioStreamAction, OriginateVars, SwitchControl, SwitchError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestinationKind {
    Extension,
    External,
    Voicemail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackAction {
    TakeMessage,
    EndCall,
    Retry,
}

/// One entry of `TransferRules` (spec §4.L).
#[derive(Debug, Clone)]
pub struct TransferDestination {
    pub kind: DestinationKind,
    pub number: String,
    pub context: String,
    pub aliases: Vec<String>,
    pub working_hours_only: bool,
    pub fallback_action: FallbackAction,
    pub priority: u32,
    pub is_default: bool,
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("switch error during transfer: {0}")]
    Switch(#[from] SwitchError),

    #[error("a-leg hung up during transfer")]
    ALegHangup,

    #[error("b-leg never answered within {0:?}")]
    OriginateTimeout(StdDuration),

    #[error("transfer decision timed out")]
    DecisionTimeout,
}

/// Outcome of a completed (or aborted) transfer attempt, logged as a
/// `TransferAttempt` for the call log (spec §4.M).
#[derive(Debug, Clone)]
pub struct TransferAttempt {
    pub destination: String,
    pub outcome: TransferOutcome,
    pub duration: StdDuration,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransferOutcome {
    Bridged,
    Rejected { reason: String },
    Timeout,
    ALegHangup,
    Error(String),
}

/// Rejection/acceptance token lists in the caller's configured language,
/// seeded from Portuguese; callers may override per
/// `SessionConfig::language`.
pub struct TransferTokens {
    pub reject: &'static [&'static str],
    pub accept_greeting_like: &'static [&'static str],
}

pub const PT_BR_TOKENS: TransferTokens = TransferTokens {
    reject: &["não", "nao", "ocupado", "depois", "agora não", "não posso"],
    accept_greeting_like: &["alô", "alo", "bom dia", "boa tarde", "boa noite", "querido", "querida"],
};

pub struct TransferConfig {
    pub originate_timeout: Duration,
    pub decision_timeout: Duration,
    pub audio_arrival_timeout: Duration,
    pub generation_done_timeout: Duration,
    pub bytes_per_ms: f64,
    pub drain_margin_ms: u64,
    pub max_drain_ms: u64,
    pub courtesy_farewell: Option<String>,
    pub reprompt_message: String,
    pub tokens: TransferTokens,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            originate_timeout: Duration::from_secs(30),
            decision_timeout: Duration::from_secs(25),
            audio_arrival_timeout: Duration::from_secs(2),
            generation_done_timeout: Duration::from_secs(20),
            bytes_per_ms: 32.0, // 16 kHz * 16-bit mono = 32 bytes/ms
            drain_margin_ms: 150,
            max_drain_ms: 4000,
            courtesy_farewell: Some("Tudo bem, obrigado pelo seu tempo.".into()),
            reprompt_message: "Você consegue atender agora, ou prefere que eu anote um recado?".into(),
            tokens: PT_BR_TOKENS,
        }
    }
}

pub struct TransferContext {
    pub call_id: String,
    pub a_leg_uuid: String,
    /// The caller's phone number, shown on the attendant's handset as the
    /// originating caller id.
    pub caller_number: String,
    pub caller_name: String,
    pub aux_ws_url: String,
    /// The a-leg's own stream URL, used to start a fresh stream if `resume`
    /// fails after a rejected transfer (the WS server reattaches to the
    /// existing session by `call_uuid`).
    pub a_leg_ws_url: String,
    /// Asks the auxiliary session for one more utterance when the first
    /// reject looks like a greeting rather than a refusal.
    pub reprompt: Option<Arc<dyn Fn() + Send + Sync>>,
}

/// Drives one announced-transfer attempt end to end. At most one attempt
/// runs per session (spec §3 invariant 7); cleanup of the b-leg is guarded
/// so it happens exactly once even when the a-leg hangup race fires.
pub struct TransferManager {
    switch: Arc<dyn SwitchControl>,
    config: TransferConfig,
}

impl TransferManager {
    pub fn new(switch: Arc<dyn SwitchControl>, config: TransferConfig) -> Self {
        Self { switch, config }
    }

    /// Run the full transfer, racing the happy path against an a-leg hangup
    /// watcher so a caller hanging up mid-transfer aborts cleanly at any
    /// step (spec §4.J step 8).
    pub async fn execute(
        &self,
        ctx: &TransferContext,
        destination: &TransferDestination,
        a_leg_bus: &EventBus,
        aux_bus: &EventBus,
    ) -> Result<TransferAttempt, TransferError> {
        let started = Instant::now();
        let b_leg = Mutex::new(None::<String>);

        let outcome = tokio::select! {
            biased;
            hangup = self.watch_a_leg_hangup(a_leg_bus) => {
                if hangup {
                    self.abort_on_a_leg_hangup(ctx, &b_leg).await;
                    TransferOutcome::ALegHangup
                } else {
                    TransferOutcome::Error("hangup watcher ended unexpectedly".into())
                }
            }
            result = self.run_steps(ctx, destination, a_leg_bus, aux_bus, &b_leg) => {
                match result {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        // TRANSFER errors always lead to an a-leg resume
                        // attempt (spec §7); ignore failures, the caller may
                        // already be gone.
                        let _ = self
                            .switch
                            .uuid_audio_stream(&ctx.a_leg_uuid, AudioStreamAction::Resume, "")
                            .await;
                        TransferOutcome::Error(e.to_string())
                    }
                }
            }
        };

        match &outcome {
            TransferOutcome::Bridged => {
                self.emit_phase(a_leg_bus, ctx, VoiceEventType::TransferCompleted, json!({})).await;
            }
            TransferOutcome::Rejected { reason } => {
                self.emit_phase(a_leg_bus, ctx, VoiceEventType::TransferRejected, json!({"reason": reason}))
                    .await;
            }
            TransferOutcome::Timeout => {
                self.emit_phase(a_leg_bus, ctx, VoiceEventType::TransferRejected, json!({"reason": "timeout"}))
                    .await;
            }
            TransferOutcome::Error(e) => {
                self.emit_phase(a_leg_bus, ctx, VoiceEventType::TransferRejected, json!({"reason": e})).await;
            }
            TransferOutcome::ALegHangup => {}
        }

        Ok(TransferAttempt {
            destination: destination.number.clone(),
            outcome,
            duration: started.elapsed(),
        })
    }

    async fn emit_phase(&self, bus: &EventBus, ctx: &TransferContext, kind: VoiceEventType, data: Value) {
        bus.emit(VoiceEvent::new(kind, &ctx.call_id, data)).await;
    }

    async fn watch_a_leg_hangup(&self, a_leg_bus: &EventBus) -> bool {
        // An hour is effectively "forever" for one transfer attempt; the
        // outer select is cancelled as soon as `run_steps` finishes.
        a_leg_bus
            .wait_for(VoiceEventType::CallHangup, Duration::from_secs(3600), |_| true)
            .await
            .is_some()
    }

    async fn abort_on_a_leg_hangup(&self, ctx: &TransferContext, b_leg: &Mutex<Option<String>>) {
        tracing::info!(call_id = %ctx.call_id, "a-leg hung up during transfer, killing b-leg");
        if let Some(b_leg_uuid) = b_leg.lock().await.take() {
            let _ = self.switch.uuid_audio_stream(&b_leg_uuid, AudioStreamAction::Stop, "").await;
            let _ = self.switch.uuid_kill(&b_leg_uuid).await;
        }
    }

    async fn run_steps(
        &self,
        ctx: &TransferContext,
        destination: &TransferDestination,
        a_leg_bus: &EventBus,
        aux_bus: &EventBus,
        b_leg: &Mutex<Option<String>>,
    ) -> Result<TransferOutcome, TransferError> {
        // Step 1: pause a-leg audio.
        self.switch
            .uuid_audio_stream(&ctx.a_leg_uuid, AudioStreamAction::Pause, "")
            .await?;
        self.emit_phase(a_leg_bus, ctx, VoiceEventType::TransferInitiated, json!({"destination": destination.number}))
            .await;

        // Step 2: originate b-leg, polling for existence.
        let b_leg_uuid = self.originate_b_leg(ctx, destination).await?;
        *b_leg.lock().await = Some(b_leg_uuid.clone());
        self.emit_phase(a_leg_bus, ctx, VoiceEventType::TransferRinging, json!({"b_leg": b_leg_uuid})).await;

        // Step 3: attach auxiliary AI — the switch is told to start an audio
        // stream bound to the b-leg; the WS layer constructs the auxiliary
        // Session when that connection arrives.
        self.switch
            .uuid_audio_stream(&b_leg_uuid, AudioStreamAction::Start, &ctx.aux_ws_url)
            .await?;
        self.emit_phase(a_leg_bus, ctx, VoiceEventType::TransferAnswered, json!({"b_leg": b_leg_uuid})).await;

        // Step 4: decision loop.
        let decision = self.decision_loop(ctx, aux_bus).await;

        let outcome = match decision {
            Decision::Accept => {
                // Skip residual announcement audio on accept: the caller
                // should be bridged promptly, not kept waiting.
                self.finish_accept(ctx, &b_leg_uuid).await?;
                Ok(TransferOutcome::Bridged)
            }
            Decision::Reject { reason } => {
                // Flush the farewell on reject so the attendant hears a
                // complete sentence before the leg drops.
                self.wait_for_speech_to_drain(aux_bus).await;
                self.finish_reject(ctx, &b_leg_uuid).await?;
                Ok(TransferOutcome::Rejected { reason })
            }
            Decision::Timeout => {
                self.finish_reject(ctx, &b_leg_uuid).await?;
                Ok(TransferOutcome::Timeout)
            }
        };
        *b_leg.lock().await = None;
        outcome
    }

    async fn originate_b_leg(&self, ctx: &TransferContext, destination: &TransferDestination) -> Result<String, TransferError> {
        let vars = OriginateVars {
            caller_id_number: ctx.caller_number.clone(),
            caller_id_name: "Secretaria_Virtual".into(),
            timeout_secs: self.config.originate_timeout.as_secs() as u32,
            hangup_after_bridge: true,
            extra: Default::default(),
        };
        let b_leg_uuid = self.switch.originate(&destination.number, &vars).await?;

        let deadline = Instant::now() + self.config.originate_timeout;
        loop {
            if self.switch.uuid_exists(&b_leg_uuid).await? {
                return Ok(b_leg_uuid);
            }
            if Instant::now() >= deadline {
                let _ = self.switch.uuid_kill(&b_leg_uuid).await;
                return Err(TransferError::OriginateTimeout(self.config.originate_timeout));
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    }

    /// Step 4, with the two safety-net heuristics applied on top of the raw
    /// accept/reject function calls.
    async fn decision_loop(&self, ctx: &TransferContext, aux_bus: &EventBus) -> Decision {
        let deadline = Instant::now() + self.config.decision_timeout;
        let mut rejected_once = false;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Decision::Timeout;
            }

            let event = aux_bus
                .wait_for_any(
                    &[
                        VoiceEventType::FunctionCallCompleted,
                        VoiceEventType::CallHangup,
                        VoiceEventType::TransferAnswered,
                    ],
                    remaining,
                    |_| true,
                )
                .await;

            let Some(event) = event else {
                return Decision::Timeout;
            };

            match event.kind {
                VoiceEventType::CallHangup => return Decision::Reject { reason: "b_leg_hangup".into() },
                VoiceEventType::FunctionCallCompleted => {
                    let name = event.data.get("name").and_then(Value::as_str).unwrap_or_default();
                    let transcript = transcript_so_far(aux_bus);

                    if name == "accept_transfer" {
                        if contains_token(&transcript, self.config.tokens.reject) {
                            tracing::debug!("accept_transfer overridden by rejection token in transcript");
                            return Decision::Reject { reason: "transcript_override".into() };
                        }
                        return Decision::Accept;
                    }

                    if name == "reject_transfer" {
                        let looks_like_greeting = contains_token(&transcript, self.config.tokens.accept_greeting_like)
                            || !contains_token(&transcript, self.config.tokens.reject);
                        if looks_like_greeting && !rejected_once {
                            rejected_once = true;
                            tracing::debug!("first reject_transfer treated as ambiguous, re-prompting");
                            if let Some(reprompt) = &ctx.reprompt {
                                reprompt();
                            }
                            continue;
                        }
                        let reason = event
                            .data
                            .get("args")
                            .and_then(|a| a.get("reason"))
                            .and_then(Value::as_str)
                            .unwrap_or("declined")
                            .to_string();
                        return Decision::Reject { reason };
                    }
                }
                _ => {}
            }
        }
    }

    /// Step 5: three-phase waiter so the last syllable of the attendant's
    /// speech isn't cut off mid-transition.
    async fn wait_for_speech_to_drain(&self, aux_bus: &EventBus) {
        let _ = timeout(
            self.config.audio_arrival_timeout,
            aux_bus.wait_for(VoiceEventType::AudioFirstOutput, self.config.audio_arrival_timeout, |_| true),
        )
        .await;

        let done = aux_bus
            .wait_for(VoiceEventType::AudioOutputFlushed, self.config.generation_done_timeout, |_| true)
            .await;

        if done.is_none() {
            return;
        }

        let residual_bytes = done
            .and_then(|e| e.data.get("residual_bytes").and_then(Value::as_u64))
            .unwrap_or(0) as f64;
        let wait_ms = ((residual_bytes / self.config.bytes_per_ms) as u64 + self.config.drain_margin_ms)
            .min(self.config.max_drain_ms);
        if wait_ms > 0 {
            tokio::time::sleep(Duration::from_millis(wait_ms)).await;
        }
    }

    async fn finish_accept(&self, ctx: &TransferContext, b_leg_uuid: &str) -> Result<(), TransferError> {
        self.switch.uuid_audio_stream(&ctx.a_leg_uuid, AudioStreamAction::Stop, "").await?;
        self.switch.uuid_audio_stream(b_leg_uuid, AudioStreamAction::Stop, "").await?;
        self.switch.uuid_bridge(&ctx.a_leg_uuid, b_leg_uuid).await?;
        Ok(())
    }

    async fn finish_reject(&self, ctx: &TransferContext, b_leg_uuid: &str) -> Result<(), TransferError> {
        if let Some(message) = &self.config.courtesy_farewell {
            let _ = self.switch.uuid_displace(b_leg_uuid, message).await;
        }
        self.switch.uuid_audio_stream(b_leg_uuid, AudioStreamAction::Stop, "").await?;
        self.switch.uuid_kill(b_leg_uuid).await?;

        if self
            .switch
            .uuid_audio_stream(&ctx.a_leg_uuid, AudioStreamAction::Resume, "")
            .await
            .is_err()
        {
            self.switch
                .uuid_audio_stream(&ctx.a_leg_uuid, AudioStreamAction::Start, &ctx.a_leg_ws_url)
                .await?;
        }
        Ok(())
    }
}

enum Decision {
    Accept,
    Reject { reason: String },
    Timeout,
}

fn transcript_so_far(bus: &EventBus) -> String {
    bus.history()
        .into_iter()
        .filter(|e| e.kind == VoiceEventType::UserTranscript)
        .filter_map(|e| e.data.get("text").and_then(Value::as_str).map(str::to_lowercase))
        .collect::<Vec<_>>()
        .join(" ")
}

fn contains_token(haystack: &str, tokens: &[&str]) -> bool {
    tokens.iter().any(|t| haystack.contains(t))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{VoiceEvent, VoiceEventType};
    use crate::switch::mock::{Call, MockSwitch};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn destination() -> TransferDestination {
        TransferDestination {
            kind: DestinationKind::Extension,
            number: "1001".into(),
            context: "internal".into(),
            aliases: vec![],
            working_hours_only: false,
            fallback_action: FallbackAction::TakeMessage,
            priority: 0,
            is_default: true,
        }
    }

    fn ctx() -> TransferContext {
        TransferContext {
            call_id: "call1".into(),
            a_leg_uuid: "a-leg".into(),
            caller_number: "+5511988887777".into(),
            caller_name: "Ana".into(),
            aux_ws_url: "wss://example/stream/aux".into(),
            a_leg_ws_url: "wss://example/stream/a-leg".into(),
            reprompt: None,
        }
    }

    fn spawn_execute(
        manager: TransferManager,
        ctx: TransferContext,
        a_leg_bus: EventBus,
        aux_bus: EventBus,
    ) -> tokio::task::JoinHandle<Result<TransferAttempt, TransferError>> {
        tokio::spawn(async move {
            manager.execute(&ctx, &destination(), &a_leg_bus, &aux_bus).await
        })
    }

    #[tokio::test(start_paused = true)]
    async fn accept_transfer_bridges_legs_and_reports_phases() {
        let switch = Arc::new(MockSwitch::new());
        let manager = TransferManager::new(switch.clone(), TransferConfig::default());
        let a_leg_bus = EventBus::new(32);
        let aux_bus = EventBus::new(32);

        let exec = spawn_execute(manager, ctx(), a_leg_bus.clone(), aux_bus.clone());

        tokio::time::sleep(Duration::from_millis(50)).await;
        aux_bus
            .emit(VoiceEvent::new(
                VoiceEventType::FunctionCallCompleted,
                "call1",
                json!({"name": "accept_transfer"}),
            ))
            .await;

        let attempt = exec.await.unwrap().unwrap();
        assert_eq!(attempt.outcome, TransferOutcome::Bridged);
        assert!(switch.calls().iter().any(|c| matches!(c, Call::UuidBridge { .. })));
        // The attendant's handset sees the caller's number, not the a-leg uuid.
        assert!(switch.calls().iter().any(|c| matches!(
            c,
            Call::Originate { caller_id_number, .. } if caller_id_number == "+5511988887777"
        )));

        let phases: Vec<VoiceEventType> = a_leg_bus.history().into_iter().map(|e| e.kind).collect();
        assert!(phases.contains(&VoiceEventType::TransferInitiated));
        assert!(phases.contains(&VoiceEventType::TransferRinging));
        assert!(phases.contains(&VoiceEventType::TransferAnswered));
        assert!(phases.contains(&VoiceEventType::TransferCompleted));
    }

    #[tokio::test(start_paused = true)]
    async fn reject_transcript_override_rejects_despite_accept_call() {
        let switch = Arc::new(MockSwitch::new());
        let manager = TransferManager::new(switch.clone(), TransferConfig::default());
        let a_leg_bus = EventBus::new(32);
        let aux_bus = EventBus::new(32);

        let exec = spawn_execute(manager, ctx(), a_leg_bus.clone(), aux_bus.clone());

        tokio::time::sleep(Duration::from_millis(50)).await;
        aux_bus
            .emit(VoiceEvent::new(VoiceEventType::UserTranscript, "call1", json!({"text": "não, agora não"})))
            .await;
        aux_bus
            .emit(VoiceEvent::new(
                VoiceEventType::FunctionCallCompleted,
                "call1",
                json!({"name": "accept_transfer"}),
            ))
            .await;
        aux_bus
            .emit(VoiceEvent::new(VoiceEventType::AudioOutputFlushed, "call1", json!({"residual_bytes": 0})))
            .await;

        let attempt = exec.await.unwrap().unwrap();
        assert!(matches!(attempt.outcome, TransferOutcome::Rejected { .. }));
        // Rejection resumes the caller's audio stream.
        assert!(switch.calls().iter().any(|c| matches!(
            c,
            Call::UuidAudioStream { action: AudioStreamAction::Resume, .. }
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn ambiguous_first_reject_triggers_reprompt_before_final_reject() {
        let switch = Arc::new(MockSwitch::new());
        let manager = TransferManager::new(switch.clone(), TransferConfig::default());
        let a_leg_bus = EventBus::new(32);
        let aux_bus = EventBus::new(32);

        let reprompts = Arc::new(AtomicUsize::new(0));
        let mut ctx = ctx();
        let r2 = reprompts.clone();
        ctx.reprompt = Some(Arc::new(move || {
            r2.fetch_add(1, Ordering::SeqCst);
        }));

        let exec = spawn_execute(manager, ctx, a_leg_bus.clone(), aux_bus.clone());

        tokio::time::sleep(Duration::from_millis(50)).await;
        // Attendant only said hello so far; the first reject is ambiguous.
        aux_bus
            .emit(VoiceEvent::new(VoiceEventType::UserTranscript, "call1", json!({"text": "alô, bom dia"})))
            .await;
        aux_bus
            .emit(VoiceEvent::new(
                VoiceEventType::FunctionCallCompleted,
                "call1",
                json!({"name": "reject_transfer", "args": {"reason": "unclear"}}),
            ))
            .await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        aux_bus
            .emit(VoiceEvent::new(
                VoiceEventType::FunctionCallCompleted,
                "call1",
                json!({"name": "reject_transfer", "args": {"reason": "em reunião"}}),
            ))
            .await;
        aux_bus
            .emit(VoiceEvent::new(VoiceEventType::AudioOutputFlushed, "call1", json!({"residual_bytes": 0})))
            .await;

        let attempt = exec.await.unwrap().unwrap();
        assert!(matches!(attempt.outcome, TransferOutcome::Rejected { reason } if reason == "em reunião"));
        assert_eq!(reprompts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn a_leg_hangup_aborts_transfer_and_kills_b_leg() {
        let switch = Arc::new(MockSwitch::new());
        let manager = TransferManager::new(switch.clone(), TransferConfig::default());
        let a_leg_bus = EventBus::new(32);
        let aux_bus = EventBus::new(32);

        let exec = spawn_execute(manager, ctx(), a_leg_bus.clone(), aux_bus.clone());

        // Let the transfer get as far as originating the b-leg.
        tokio::time::sleep(Duration::from_millis(50)).await;
        a_leg_bus
            .emit(VoiceEvent::new(VoiceEventType::CallHangup, "call1", json!({})))
            .await;

        let attempt = exec.await.unwrap().unwrap();
        assert_eq!(attempt.outcome, TransferOutcome::ALegHangup);
        assert!(switch
            .calls()
            .iter()
            .any(|c| matches!(c, Call::UuidKill { uuid } if uuid.starts_with("mock-leg"))));
    }

    #[tokio::test(start_paused = true)]
    async fn decision_timeout_resumes_a_leg() {
        let switch = Arc::new(MockSwitch::new());
        let manager = TransferManager::new(switch.clone(), TransferConfig::default());
        let a_leg_bus = EventBus::new(32);
        let aux_bus = EventBus::new(32);

        let exec = spawn_execute(manager, ctx(), a_leg_bus.clone(), aux_bus.clone());
        // Nobody ever answers the announcement; the decision window expires.
        let attempt = exec.await.unwrap().unwrap();
        assert_eq!(attempt.outcome, TransferOutcome::Timeout);
        assert!(switch.calls().iter().any(|c| matches!(
            c,
            Call::UuidAudioStream { action: AudioStreamAction::Resume, .. }
        )));
    }
}
