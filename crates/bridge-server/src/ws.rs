//! Switch-facing WebSocket endpoint (spec §4.K).
//!
//! `/stream/{secretary_uuid}/{call_uuid}/{caller_id}` — the caller id is
//! carried in the URL, there is no separate metadata handshake. A connection
//! whose `call_uuid` matches a live session reattaches to it (this is how
//! the a-leg reconnects after a rejected transfer); a `call_uuid` matching a
//! pending announcement id builds the auxiliary attendant session instead.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use bridge_core::audio::pacer::AudioPacer;
use bridge_core::bus::{EventBus, VoiceEventType};
use bridge_core::metrics::call_logger::{self, CallLogger};
use bridge_core::session::{
    MaxTurnsAction, Session, SessionConfig, SessionHandlers, SilenceFallbackAction, SWITCH_AUDIO_RATE,
};
use bridge_core::tools::builtin::{
    AcceptTransferTool, CheckAppointmentTool, CheckExtensionAvailableTool, EndCallTool, GetBusinessInfoTool,
    HoldCallTool, LookupCustomerTool, RejectTransferTool, RequestHandoffTool, TakeMessageTool, TransferCallTool,
    UnholdCallTool,
};
use bridge_core::tools::registry::ToolRegistry;
use bridge_core::transfer::{TransferConfig, TransferContext, TransferManager, TransferOutcome};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::state::{AppState, PendingAnnouncement};

/// Warmup before the pacer starts regulating frame delivery (spec §4.K).
const WARMUP_MS: u64 = 40;
/// One 20 ms frame of PCM16 mono at the switch rate.
const FRAME_BYTES: usize = (SWITCH_AUDIO_RATE as usize / 50) * 2;
/// PCM16 mono at 16 kHz is 32 bytes per millisecond.
const BYTES_PER_MS: u64 = (SWITCH_AUDIO_RATE as u64 * 2) / 1000;

pub async fn stream_handler(
    Path((secretary_uuid, call_uuid, caller_id)): Path<(String, String, String)>,
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, secretary_uuid, call_uuid, caller_id))
}

#[derive(Debug, Clone)]
enum OutboundItem {
    Audio { generation: u64, bytes: Vec<u8> },
    Pcmu { bytes: Vec<u8> },
    Stop { generation: u64 },
    Flush,
}

async fn handle_socket(
    socket: WebSocket,
    state: Arc<AppState>,
    secretary_uuid: String,
    call_uuid: String,
    caller_id: String,
) {
    let (mut sender, mut receiver) = socket.split();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<OutboundItem>();

    let (session, is_new) = if let Some(pending) = state.take_announcement(&call_uuid).await {
        match build_announcement_session(&state, &secretary_uuid, &call_uuid, &caller_id, pending, &outbound_tx).await
        {
            Ok(session) => {
                state.insert_session(call_uuid.clone(), session.clone()).await;
                state.metrics.session_started();
                (session, true)
            }
            Err(e) => {
                tracing::error!(call_id = %call_uuid, error = %e, "failed to build announcement session");
                let _ = sender.close().await;
                return;
            }
        }
    } else if let Some(existing) = state.session(&call_uuid).await {
        // Reattach: the switch reconnected (resume after a rejected
        // transfer, or a fresh stream started mid-call). The session keeps
        // its provider connection; only the switch-facing callbacks change.
        tracing::info!(call_id = %call_uuid, "reattaching to existing session");
        let logger = state.logger(&call_uuid).await;
        let stamp = attach_latency_stamp(existing.bus());
        existing.update_audio_handlers(build_handlers(
            &state,
            &secretary_uuid,
            &call_uuid,
            &caller_id,
            logger,
            stamp,
            &outbound_tx,
        ));
        (existing, false)
    } else {
        match build_session(&state, &secretary_uuid, &call_uuid, &caller_id, &outbound_tx).await {
            Ok(session) => {
                state.insert_session(call_uuid.clone(), session.clone()).await;
                state.metrics.session_started();
                (session, true)
            }
            Err(e) => {
                tracing::error!(call_id = %call_uuid, error = %e, "failed to build session, closing socket");
                let _ = sender.close().await;
                return;
            }
        }
    };

    let sender_task = tokio::spawn(run_sender(sender, outbound_rx, call_uuid.clone()));
    // The provider event loop lives for the session, not the connection; a
    // reattached connection must not start a second one.
    let provider_loop = is_new.then(|| tokio::spawn(session.clone().run_provider_loop()));

    while let Some(Ok(message)) = receiver.next().await {
        session.heartbeat().touch_ws();
        match message {
            Message::Binary(bytes) => {
                state
                    .metrics
                    .record_audio_bytes(&secretary_uuid, "inbound", bytes.len());
                if let Err(e) = session.handle_audio_input(&bytes).await {
                    tracing::warn!(call_id = %call_uuid, error = %e, "failed to handle inbound audio");
                }
            }
            Message::Text(text) => handle_control_message(&session, &text).await,
            Message::Close(_) => break,
            _ => {}
        }
    }

    // During a transfer the switch detaches the a-leg stream on purpose;
    // the session stays alive waiting for the post-transfer reconnect
    // (spec §7: switch-side TRANSPORT loss inside a transfer window).
    if session.is_in_transfer() && session.is_active() {
        tracing::info!(call_id = %call_uuid, "ws closed during transfer, keeping session alive");
        sender_task.abort();
        return;
    }

    let _ = session.stop("ws_closed").await;
    finish_call(&state, &call_uuid).await;
    if let Some(task) = provider_loop {
        task.abort();
    }
    sender_task.abort();
}

/// Tear down the per-call registrations and upload the call log once.
/// Idempotent: a second caller finds nothing left to remove.
async fn finish_call(state: &Arc<AppState>, call_uuid: &str) {
    let removed = state.sessions.lock().await.remove(call_uuid).is_some();
    if removed {
        state.metrics.session_ended();
    }
    if let Some(logger) = state.remove_logger(call_uuid).await {
        logger.finish();
    }
}

/// Per-connection outbound pump: re-chunks provider audio into 20 ms
/// frames, paces them against the wall clock, and honors the playback
/// generation so superseded audio is dropped, not played (spec §4.K).
async fn run_sender(
    mut sender: futures_util::stream::SplitSink<WebSocket, Message>,
    mut outbound_rx: mpsc::UnboundedReceiver<OutboundItem>,
    call_uuid: String,
) {
    let mut pacer = AudioPacer::new(60, 10, 300);
    let mut current_generation = 0u64;
    let mut batch: Vec<u8> = Vec::new();
    tokio::time::sleep(std::time::Duration::from_millis(WARMUP_MS)).await;

    while let Some(item) = outbound_rx.recv().await {
        match item {
            OutboundItem::Audio { generation, bytes } => {
                if generation < current_generation {
                    continue;
                }
                if generation > current_generation {
                    current_generation = generation;
                    batch.clear();
                    pacer.reset();
                }
                batch.extend_from_slice(&bytes);
                while batch.len() >= FRAME_BYTES {
                    let frame: Vec<u8> = batch.drain(..FRAME_BYTES).collect();
                    pacer.pace().await;
                    if send_audio_frame(&mut sender, &frame).await.is_err() {
                        return;
                    }
                    pacer.on_sent(20);
                }
            }
            OutboundItem::Pcmu { bytes } => {
                let frame = json!({
                    "type": "streamAudioPCMU",
                    "data": {"audioData": BASE64.encode(&bytes)}
                });
                if sender.send(Message::Text(frame.to_string().into())).await.is_err() {
                    return;
                }
            }
            OutboundItem::Stop { generation } => {
                current_generation = current_generation.max(generation);
                batch.clear();
                pacer.reset();
                if sender
                    .send(Message::Text(json!({"type": "stopAudio"}).to_string().into()))
                    .await
                    .is_err()
                {
                    return;
                }
            }
            OutboundItem::Flush => {
                if !batch.is_empty() {
                    let frame = std::mem::take(&mut batch);
                    pacer.pace().await;
                    if send_audio_frame(&mut sender, &frame).await.is_err() {
                        return;
                    }
                    // Let the switch play out the final partial frame before
                    // anything else happens on this leg.
                    let tail_ms = (frame.len() as u64 / BYTES_PER_MS) + 20;
                    tokio::time::sleep(std::time::Duration::from_millis(tail_ms.min(2000))).await;
                }
            }
        }
    }
    tracing::debug!(call_id = %call_uuid, "outbound sender task shut down");
}

async fn send_audio_frame(
    sender: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    frame: &[u8],
) -> Result<(), axum::Error> {
    let message = json!({
        "type": "streamAudio",
        "data": {
            "audioDataType": "raw",
            "sampleRate": SWITCH_AUDIO_RATE,
            "audioData": BASE64.encode(frame),
        }
    });
    sender.send(Message::Text(message.to_string().into())).await
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ControlMessage {
    Metadata {
        #[serde(default)]
        data: Value,
    },
    Dtmf {
        digit: String,
    },
    Hangup,
}

async fn handle_control_message(session: &Arc<Session>, text: &str) {
    match serde_json::from_str::<ControlMessage>(text) {
        Ok(ControlMessage::Hangup) => {
            let _ = session.stop("caller_hangup").await;
        }
        Ok(ControlMessage::Dtmf { digit }) => {
            tracing::debug!(digit, "received dtmf");
        }
        Ok(ControlMessage::Metadata { .. }) => {}
        Err(e) => tracing::debug!(error = %e, "ignoring unrecognized control frame"),
    }
}

type LatencyStamp = Arc<StdMutex<Option<Instant>>>;

/// Response latency measurement: the bus side stamps when the caller stops
/// speaking, the audio handler observes on the next assistant audio chunk.
fn attach_latency_stamp(bus: &EventBus) -> LatencyStamp {
    let stamp: LatencyStamp = Arc::new(StdMutex::new(None));
    let writer = stamp.clone();
    bus.on(VoiceEventType::SpeechStopped, move |_event| {
        let writer = writer.clone();
        async move {
            *writer.lock().unwrap() = Some(Instant::now());
        }
    });
    stamp
}

/// Build the switch-facing callback set for one connection. Shared by the
/// new-session and reattach paths.
fn build_handlers(
    state: &Arc<AppState>,
    secretary_uuid: &str,
    call_uuid: &str,
    caller_id: &str,
    logger: Option<Arc<CallLogger>>,
    latency_stamp: LatencyStamp,
    tx: &mpsc::UnboundedSender<OutboundItem>,
) -> SessionHandlers {
    let on_audio_output = {
        let tx = tx.clone();
        let metrics = state.metrics.clone();
        let tenant = secretary_uuid.to_string();
        let latency_stamp = latency_stamp.clone();
        let logger = logger.clone();
        Arc::new(move |generation: u64, bytes: Vec<u8>| {
            if let Some(stamp) = latency_stamp.lock().unwrap().take() {
                let elapsed = stamp.elapsed().as_secs_f64();
                metrics
                    .response_latency_seconds
                    .with_label_values(&[&tenant, "provider"])
                    .observe(elapsed);
                if let Some(logger) = &logger {
                    logger.record_metric("response_latency_ms", elapsed * 1000.0);
                }
            }
            metrics.record_audio_bytes(&tenant, "outbound", bytes.len());
            let _ = tx.send(OutboundItem::Audio { generation, bytes });
        })
    };
    let on_audio_done = {
        let tx = tx.clone();
        Arc::new(move |_generation: u64| {
            let _ = tx.send(OutboundItem::Flush);
        })
    };
    let on_barge_in = {
        let tx = tx.clone();
        Arc::new(move |generation: u64, _reason: &str| {
            let _ = tx.send(OutboundItem::Stop { generation });
        })
    };
    let on_audio_output_pcmu = {
        let tx = tx.clone();
        Some(Arc::new(move |bytes: Vec<u8>| {
            let _ = tx.send(OutboundItem::Pcmu { bytes });
        }) as Arc<dyn Fn(Vec<u8>) + Send + Sync>)
    };
    let on_transfer = {
        let state = state.clone();
        let secretary_uuid = secretary_uuid.to_string();
        let call_uuid = call_uuid.to_string();
        let caller_id = caller_id.to_string();
        Arc::new(move |reason: &str, data: Value| {
            if reason != "request_handoff" {
                return;
            }
            let state = state.clone();
            let secretary_uuid = secretary_uuid.clone();
            let call_uuid = call_uuid.clone();
            let caller_id = caller_id.clone();
            tokio::spawn(async move {
                spawn_transfer(state, secretary_uuid, call_uuid, caller_id, data).await;
            });
        })
    };

    SessionHandlers {
        on_audio_output,
        on_audio_output_pcmu,
        on_audio_done,
        on_barge_in,
        on_transfer,
    }
}

async fn build_session(
    state: &Arc<AppState>,
    secretary_uuid: &str,
    call_uuid: &str,
    caller_id: &str,
    tx: &mpsc::UnboundedSender<OutboundItem>,
) -> anyhow::Result<Arc<Session>> {
    let secretary = state.config_loader.secretary(secretary_uuid).await?;
    let credentials = state.config_loader.credentials(secretary_uuid).await?;
    let transfer_rules = state.config_loader.transfer_rules(secretary_uuid).await?;
    let time_condition = state.config_loader.time_condition(secretary_uuid).await?;

    let (is_open, hours_message, _next_open) = time_condition.check(chrono::Utc::now());

    let driver = (state.driver_factory)(&secretary.provider, &credentials)?;

    let config = SessionConfig {
        call_id: call_uuid.to_string(),
        tenant_id: secretary_uuid.to_string(),
        caller_id: caller_id.to_string(),
        language: secretary.language.clone(),
        secretary_prompt: secretary.prompt.clone(),
        transfer_rules_prompt: if transfer_rules.destinations.is_empty() {
            None
        } else {
            Some(format!(
                "You can transfer to: {}",
                transfer_rules
                    .destinations
                    .iter()
                    .map(|d| d.number.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ))
        },
        business_info_prompt: None,
        greeting: Some(
            secretary
                .greeting
                .clone()
                .unwrap_or_else(|| "Hello, how can I help you today?".to_string()),
        ),
        voice: secretary.voice.clone(),
        vad_threshold: 0.5,
        vad_silence_ms: 500,
        vad_prefix_padding_ms: 300,
        max_output_tokens: None,
        max_turns: secretary.max_turns,
        max_turns_action: MaxTurnsAction::EndCall,
        silence_fallback_seconds: secretary.silence_fallback_seconds,
        silence_fallback_action: SilenceFallbackAction::Reprompt,
        silence_fallback_max_retries: 2,
        barge_in_enabled: secretary.barge_in_enabled,
        rms_target: 0.0,
        rms_min_gate: 0.0,
        rms_max_gain: 1.0,
        outside_business_hours: !is_open,
        outside_hours_message: Some(hours_message),
        post_message_hangup_secs: 10,
        fallback_providers: secretary.fallback_providers.clone(),
        provider_credentials: credentials,
    };

    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(RequestHandoffTool));
    registry.register(Arc::new(EndCallTool { delay_secs: 2 }));
    registry.register(Arc::new(TakeMessageTool { hangup_delay_secs: config.post_message_hangup_secs }));
    registry.register(Arc::new(HoldCallTool));
    registry.register(Arc::new(UnholdCallTool));
    registry.register(Arc::new(CheckExtensionAvailableTool { destinations: transfer_rules.destinations.clone() }));
    if !transfer_rules.destinations.is_empty() {
        registry.register(Arc::new(TransferCallTool { destinations: transfer_rules.destinations.clone() }));
    }
    registry.register(Arc::new(LookupCustomerTool));
    registry.register(Arc::new(CheckAppointmentTool));
    registry.register(Arc::new(GetBusinessInfoTool { business_info: secretary.prompt.clone() }));

    let bus = EventBus::new(200);
    let logger = Arc::new(CallLogger::new(
        call_uuid,
        secretary_uuid,
        caller_id,
        secretary.webhook_url.clone(),
    ));
    call_logger::attach(&bus, logger.clone());
    attach_server_metrics(state, secretary_uuid, &bus);
    state.insert_logger(call_uuid.to_string(), logger.clone()).await;

    let stamp = attach_latency_stamp(&bus);
    let handlers = build_handlers(state, secretary_uuid, call_uuid, caller_id, Some(logger), stamp, tx);

    let session = Session::with_driver_factory(
        config,
        driver,
        state.driver_factory.clone(),
        Arc::new(registry),
        handlers,
        bus,
    )?;
    session.start().await?;
    Ok(session)
}

/// Hook the SpeechStopped stamp for response latency plus the per-tool
/// server metrics into a session's bus.
fn attach_server_metrics(state: &Arc<AppState>, secretary_uuid: &str, bus: &EventBus) {
    let metrics = state.metrics.clone();
    let tenant = secretary_uuid.to_string();
    bus.on(VoiceEventType::MessageTaken, move |_event| {
        let metrics = metrics.clone();
        let tenant = tenant.clone();
        async move {
            metrics.callback_requests_total.with_label_values(&[&tenant]).inc();
        }
    });

    let metrics = state.metrics.clone();
    let tenant = secretary_uuid.to_string();
    bus.on(VoiceEventType::FunctionCallCompleted, move |event| {
        let metrics = metrics.clone();
        let tenant = tenant.clone();
        async move {
            if event.data.get("name").and_then(Value::as_str) == Some("check_extension_available") {
                let found = event
                    .data
                    .get("output")
                    .and_then(|o| o.get("available"))
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                metrics
                    .extension_checks_total
                    .with_label_values(&[&tenant, if found { "true" } else { "false" }])
                    .inc();
            }
        }
    });
}

/// Build the auxiliary AI session that talks to the transfer attendant.
/// Its event bus is the same `EventBus` the waiting `TransferManager` reads
/// from, so every tool call and transcript line it emits drives the
/// transfer decision loop directly.
async fn build_announcement_session(
    state: &Arc<AppState>,
    secretary_uuid: &str,
    call_uuid: &str,
    caller_id: &str,
    pending: PendingAnnouncement,
    tx: &mpsc::UnboundedSender<OutboundItem>,
) -> anyhow::Result<Arc<Session>> {
    let secretary = state.config_loader.secretary(secretary_uuid).await?;
    let credentials = state.config_loader.credentials(secretary_uuid).await?;
    let driver = (state.driver_factory)(&secretary.provider, &credentials)?;

    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(AcceptTransferTool));
    registry.register(Arc::new(RejectTransferTool));

    let stamp = attach_latency_stamp(&pending.bus);
    let handlers = build_handlers(state, secretary_uuid, call_uuid, caller_id, None, stamp, tx);

    let config = SessionConfig {
        call_id: call_uuid.to_string(),
        tenant_id: secretary_uuid.to_string(),
        caller_id: caller_id.to_string(),
        language: secretary.language.clone(),
        secretary_prompt: pending.prompt,
        transfer_rules_prompt: None,
        business_info_prompt: None,
        greeting: Some(pending.greeting),
        voice: secretary.voice.clone(),
        vad_threshold: 0.5,
        vad_silence_ms: 500,
        vad_prefix_padding_ms: 300,
        max_output_tokens: None,
        max_turns: 10,
        max_turns_action: MaxTurnsAction::EndCall,
        silence_fallback_seconds: 8,
        silence_fallback_action: SilenceFallbackAction::EndCall,
        silence_fallback_max_retries: 1,
        barge_in_enabled: true,
        rms_target: 0.0,
        rms_min_gate: 0.0,
        rms_max_gain: 1.0,
        outside_business_hours: false,
        outside_hours_message: None,
        post_message_hangup_secs: 5,
        fallback_providers: Vec::new(),
        provider_credentials: credentials,
    };

    let session = Session::with_driver_factory(
        config,
        driver,
        state.driver_factory.clone(),
        Arc::new(registry),
        handlers,
        pending.bus,
    )?;
    session.start().await?;
    Ok(session)
}

/// Drive one announced-transfer attempt: resolve the requested destination,
/// register the pending announcement under a synthetic id the b-leg's WS
/// connection will claim, optionally bind a dedicated listener from the
/// b-leg port range, and run `TransferManager::execute` to completion.
async fn spawn_transfer(
    state: Arc<AppState>,
    secretary_uuid: String,
    call_uuid: String,
    caller_id: String,
    data: Value,
) {
    let Some(session) = state.session(&call_uuid).await else {
        tracing::warn!(call_id = %call_uuid, "transfer requested for unknown session");
        return;
    };
    let a_leg_bus = session.bus().clone();

    let transfer_rules = match state.config_loader.transfer_rules(&secretary_uuid).await {
        Ok(rules) => rules,
        Err(e) => {
            tracing::error!(call_id = %call_uuid, error = %e, "failed to load transfer rules");
            return;
        }
    };

    let requested = data.get("destination").and_then(Value::as_str).unwrap_or_default().to_string();
    let caller_name = data
        .get("caller_name")
        .and_then(Value::as_str)
        .unwrap_or("the caller")
        .to_string();

    let Some(destination) = transfer_rules
        .destinations
        .iter()
        .find(|d| d.number == requested || d.aliases.iter().any(|a| a == &requested))
        .cloned()
    else {
        tracing::warn!(call_id = %call_uuid, requested, "transfer requested for unknown destination");
        return;
    };

    let ann_id = format!("ann-{}", uuid::Uuid::new_v4());
    let aux_bus = EventBus::new(200);
    let announcement = PendingAnnouncement {
        bus: aux_bus.clone(),
        prompt: "You are calling an internal attendant on behalf of a caller. Greet them briefly, \
                 announce who is calling and what about, then ask if they can take the call now. \
                 Call accept_transfer the moment they agree, or reject_transfer the moment they \
                 decline or are unavailable. Speak their language."
            .to_string(),
        greeting: format!("{caller_name} on the line about {requested}."),
    };
    state.register_announcement(ann_id.clone(), announcement).await;

    // Dedicated listener for the b-leg when a port range is configured;
    // otherwise the announcement leg shares the main listener.
    let mut b_leg_listener: Option<(u16, tokio::sync::oneshot::Sender<()>)> = None;
    let aux_base = match &state.b_leg_ports {
        Some(allocator) => match allocator.allocate().await {
            Some(port) => match bind_b_leg_listener(&state, port).await {
                Ok(shutdown) => {
                    b_leg_listener = Some((port, shutdown));
                    state.ws_base_with_port(port)
                }
                Err(e) => {
                    tracing::warn!(error = %e, port, "failed to bind b-leg listener, using main listener");
                    allocator.release(port).await;
                    state.public_ws_base.clone()
                }
            },
            None => {
                tracing::warn!("b-leg port range exhausted, using main listener");
                state.public_ws_base.clone()
            }
        },
        None => state.public_ws_base.clone(),
    };

    let session_for_reprompt = state.clone();
    let ann_id_for_reprompt = ann_id.clone();
    let reprompt_message = TransferConfig::default().reprompt_message.clone();
    let ctx = TransferContext {
        call_id: call_uuid.clone(),
        a_leg_uuid: call_uuid.clone(),
        caller_number: caller_id.clone(),
        caller_name,
        aux_ws_url: state.stream_url(&aux_base, &secretary_uuid, &ann_id, "attendant"),
        a_leg_ws_url: state.stream_url(&state.public_ws_base, &secretary_uuid, &call_uuid, &caller_id),
        reprompt: Some(Arc::new(move || {
            let state = session_for_reprompt.clone();
            let ann_id = ann_id_for_reprompt.clone();
            let message = reprompt_message.clone();
            tokio::spawn(async move {
                if let Some(aux) = state.session(&ann_id).await {
                    if let Err(e) = aux.prompt(&message).await {
                        tracing::warn!(error = %e, "failed to re-prompt attendant");
                    }
                }
            });
        })),
    };

    // Backstop for the whole attempt: if anything wedges past two minutes,
    // TRANSFER_TIMEOUT lands on the a-leg bus for the log/metrics.
    let scope = bridge_core::heartbeat::timeout_scope(call_uuid.clone(), a_leg_bus.clone(), "transfer_attempt", 120);

    let manager = TransferManager::new(state.switch.clone(), TransferConfig::default());
    let attempt = manager.execute(&ctx, &destination, &a_leg_bus, &aux_bus).await;
    scope.complete();

    // Cleanup is idempotent: the announcement may never have been claimed,
    // and the aux session may already be gone.
    state.take_announcement(&ann_id).await;
    if let Some(aux) = state.session(&ann_id).await {
        let _ = aux.stop("transfer_finished").await;
    }
    finish_call(&state, &ann_id).await;
    if let Some((port, shutdown)) = b_leg_listener {
        let _ = shutdown.send(());
        if let Some(allocator) = &state.b_leg_ports {
            allocator.release(port).await;
        }
    }

    match attempt {
        Ok(attempt) => {
            let outcome = match &attempt.outcome {
                TransferOutcome::Bridged => "bridged",
                TransferOutcome::Rejected { .. } => "rejected",
                TransferOutcome::Timeout => "timeout",
                TransferOutcome::ALegHangup => "a_leg_hangup",
                TransferOutcome::Error(_) => "error",
            };
            state
                .metrics
                .record_transfer(&secretary_uuid, outcome, attempt.duration.as_secs_f64());
            tracing::info!(call_id = %call_uuid, destination = %requested, outcome, "transfer attempt finished");
            if attempt.outcome == TransferOutcome::Bridged {
                let _ = session.stop("transferred").await;
                finish_call(&state, &call_uuid).await;
            }
        }
        Err(e) => tracing::error!(call_id = %call_uuid, error = %e, "transfer attempt failed"),
    }
}

/// Bind a short-lived listener for one b-leg stream. Serves the same
/// routes/state as the main listener; shuts down when the returned sender
/// fires.
async fn bind_b_leg_listener(
    state: &Arc<AppState>,
    port: u16,
) -> anyhow::Result<tokio::sync::oneshot::Sender<()>> {
    let router = crate::router(state.clone());
    let listener = tokio::net::TcpListener::bind((state.bind_host.as_str(), port)).await?;
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    tokio::spawn(async move {
        let serve = axum::serve(listener, router).with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        });
        if let Err(e) = serve.await {
            tracing::warn!(error = %e, "b-leg listener exited with error");
        }
    });
    Ok(shutdown_tx)
}
