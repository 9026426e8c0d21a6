//! Per-call timeline logger with a fire-and-forget webhook POST at the end
//! of the call (spec §4.M).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::time::Duration;

use crate::bus::{EventBus, VoiceEventType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallLogEventKind {
    SessionStart,
    SessionEnd,
    OpenaiConnected,
    OpenaiError,
    AudioFirstInbound,
    AudioFirstOutbound,
    TranscriptUser,
    TranscriptAssistant,
    ToolCalled,
    TransferInitiated,
    TransferRinging,
    TransferAnswered,
    TransferCompleted,
    TransferRejected,
    MessageTaken,
    CallHangup,
}

#[derive(Debug, Clone, Serialize)]
pub struct CallLogEvent {
    pub kind: CallLogEventKind,
    pub timestamp: DateTime<Utc>,
    pub data: Value,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricAggregate {
    pub last: f64,
    pub sum: f64,
    pub max: f64,
    pub min: f64,
    pub count: u64,
    pub avg: f64,
}

impl MetricAggregate {
    fn record(&mut self, value: f64) {
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.last = value;
        self.sum += value;
        self.count += 1;
        self.avg = self.sum / self.count as f64;
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolExecutionLog {
    pub tool_name: String,
    pub call_id: String,
    /// Sanitized: secrets/PII-shaped values are redacted by the caller
    /// before this struct is built.
    pub input: Value,
    pub output: Value,
    pub success: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CallLog {
    pub call_id: String,
    pub tenant_id: String,
    pub caller_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub final_state: Option<String>,
    pub events: Vec<CallLogEvent>,
    pub metrics: HashMap<String, MetricAggregate>,
    pub tool_executions: Vec<ToolExecutionLog>,
}

impl CallLog {
    fn new(call_id: String, tenant_id: String, caller_id: String) -> Self {
        Self {
            call_id,
            tenant_id,
            caller_id,
            started_at: Utc::now(),
            ended_at: None,
            final_state: None,
            events: Vec::new(),
            metrics: HashMap::new(),
            tool_executions: Vec::new(),
        }
    }
}

/// Fire-and-forget outbound webhook client (spec §6): short timeout, errors
/// logged and dropped, never allowed to slow the call down.
#[derive(Clone)]
pub struct Webhook {
    url: String,
    http: reqwest::Client,
}

impl Webhook {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into(), http: reqwest::Client::new() }
    }

    /// POST `{event, ...payload}` in a detached task.
    pub fn fire(&self, event: &'static str, mut payload: Value) {
        let url = self.url.clone();
        let http = self.http.clone();
        if let Value::Object(map) = &mut payload {
            map.insert("event".into(), Value::String(event.into()));
        }
        tokio::spawn(async move {
            let result = http
                .post(&url)
                .timeout(Duration::from_secs(8))
                .json(&payload)
                .send()
                .await;
            match result {
                Ok(resp) if resp.status().is_success() => {
                    tracing::debug!(event, "webhook delivered");
                }
                Ok(resp) => {
                    tracing::warn!(event, status = %resp.status(), "webhook rejected");
                }
                Err(e) => {
                    tracing::warn!(event, error = %e, "webhook failed");
                }
            }
        });
    }
}

/// Accumulates one [`CallLog`] and fires it at a webhook on [`CallLogger::finish`].
pub struct CallLogger {
    log: Mutex<CallLog>,
    webhook: Option<Webhook>,
}

impl CallLogger {
    pub fn new(
        call_id: impl Into<String>,
        tenant_id: impl Into<String>,
        caller_id: impl Into<String>,
        webhook_url: Option<String>,
    ) -> Self {
        Self {
            log: Mutex::new(CallLog::new(call_id.into(), tenant_id.into(), caller_id.into())),
            webhook: webhook_url.map(Webhook::new),
        }
    }

    pub fn webhook(&self) -> Option<&Webhook> {
        self.webhook.as_ref()
    }

    pub fn record_event(&self, kind: CallLogEventKind, data: Value) {
        let mut log = self.log.lock().unwrap();
        log.events.push(CallLogEvent { kind, timestamp: Utc::now(), data });
    }

    pub fn record_metric(&self, name: &str, value: f64) {
        let mut log = self.log.lock().unwrap();
        log.metrics.entry(name.to_string()).or_default().record(value);
    }

    pub fn record_tool_execution(&self, entry: ToolExecutionLog) {
        self.log.lock().unwrap().tool_executions.push(entry);
    }

    pub fn set_final_state(&self, state: impl Into<String>) {
        self.log.lock().unwrap().final_state = Some(state.into());
    }

    pub fn snapshot(&self) -> CallLog {
        self.log.lock().unwrap().clone()
    }

    /// Stamp `ended_at` and, if a webhook is configured, POST the call log
    /// once as a `voice_ai_call_log` event.
    pub fn finish(&self) {
        let log = {
            let mut log = self.log.lock().unwrap();
            log.ended_at = Some(Utc::now());
            log.clone()
        };
        if let Some(webhook) = &self.webhook {
            match serde_json::to_value(&log) {
                Ok(payload) => webhook.fire("voice_ai_call_log", payload),
                Err(e) => tracing::warn!(call_id = %log.call_id, error = %e, "failed to serialize call log"),
            }
        }
    }
}

/// Subscribe a logger to a session's event bus, turning `VoiceEvent`s into
/// the CallLog timeline. Also fires the `voice_ai_message` webhook for
/// taken messages, mirroring the original ticketing push.
pub fn attach(bus: &EventBus, logger: Arc<CallLogger>) {
    const MAPPING: &[(VoiceEventType, CallLogEventKind)] = &[
        (VoiceEventType::SessionStarted, CallLogEventKind::SessionStart),
        (VoiceEventType::SessionEnded, CallLogEventKind::SessionEnd),
        (VoiceEventType::ProviderConnected, CallLogEventKind::OpenaiConnected),
        (VoiceEventType::ProviderError, CallLogEventKind::OpenaiError),
        (VoiceEventType::UserAudioReceived, CallLogEventKind::AudioFirstInbound),
        (VoiceEventType::AudioFirstOutput, CallLogEventKind::AudioFirstOutbound),
        (VoiceEventType::UserTranscript, CallLogEventKind::TranscriptUser),
        (VoiceEventType::AssistantTranscript, CallLogEventKind::TranscriptAssistant),
        (VoiceEventType::FunctionCallCompleted, CallLogEventKind::ToolCalled),
        (VoiceEventType::TransferInitiated, CallLogEventKind::TransferInitiated),
        (VoiceEventType::TransferRinging, CallLogEventKind::TransferRinging),
        (VoiceEventType::TransferAnswered, CallLogEventKind::TransferAnswered),
        (VoiceEventType::TransferCompleted, CallLogEventKind::TransferCompleted),
        (VoiceEventType::TransferRejected, CallLogEventKind::TransferRejected),
        (VoiceEventType::MessageTaken, CallLogEventKind::MessageTaken),
        (VoiceEventType::CallHangup, CallLogEventKind::CallHangup),
    ];

    for &(bus_kind, log_kind) in MAPPING {
        let logger = logger.clone();
        bus.on(bus_kind, move |event| {
            let logger = logger.clone();
            async move {
                logger.record_event(log_kind, event.data.clone());

                match event.kind {
                    VoiceEventType::FunctionCallCompleted => {
                        logger.record_tool_execution(ToolExecutionLog {
                            tool_name: event
                                .data
                                .get("name")
                                .and_then(Value::as_str)
                                .unwrap_or_default()
                                .to_string(),
                            call_id: event
                                .data
                                .get("call_id")
                                .and_then(Value::as_str)
                                .unwrap_or_default()
                                .to_string(),
                            input: event.data.get("args").cloned().unwrap_or(Value::Null),
                            output: event.data.get("output").cloned().unwrap_or(Value::Null),
                            success: event.data.get("success").and_then(Value::as_bool).unwrap_or(false),
                        });
                    }
                    VoiceEventType::MessageTaken => {
                        if let Some(webhook) = logger.webhook() {
                            let caller_name =
                                event.data.get("caller_name").and_then(Value::as_str).unwrap_or_default();
                            webhook.fire(
                                "voice_ai_message",
                                json!({
                                    "ticket": {
                                        "type": "message",
                                        "subject": format!("Recado de {caller_name}"),
                                        "message": event.data.get("message").cloned().unwrap_or(Value::Null),
                                        "priority": event.data.get("urgency").cloned().unwrap_or(Value::Null),
                                    }
                                }),
                            );
                        }
                    }
                    VoiceEventType::SessionEnded | VoiceEventType::CallHangup => {
                        if let Some(reason) = event.data.get("reason").and_then(Value::as_str) {
                            logger.set_final_state(reason);
                        }
                    }
                    _ => {}
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::VoiceEvent;

    #[test]
    fn metric_aggregate_tracks_last_sum_min_max_avg() {
        let mut agg = MetricAggregate::default();
        agg.record(10.0);
        agg.record(20.0);
        agg.record(5.0);
        assert_eq!(agg.last, 5.0);
        assert_eq!(agg.sum, 35.0);
        assert_eq!(agg.max, 20.0);
        assert_eq!(agg.min, 5.0);
        assert!((agg.avg - 35.0 / 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn finish_without_webhook_url_is_a_noop() {
        let logger = CallLogger::new("call1", "tenant1", "+1000", None);
        logger.record_event(CallLogEventKind::SessionStart, json!({}));
        logger.finish();
        assert!(logger.snapshot().ended_at.is_some());
    }

    #[tokio::test]
    async fn attached_logger_records_bus_events_in_order() {
        let bus = EventBus::new(32);
        let logger = Arc::new(CallLogger::new("call1", "tenant1", "+1000", None));
        attach(&bus, logger.clone());

        bus.emit(VoiceEvent::new(VoiceEventType::SessionStarted, "call1", json!({}))).await;
        bus.emit(VoiceEvent::new(VoiceEventType::UserTranscript, "call1", json!({"text": "oi"}))).await;
        bus.emit(VoiceEvent::new(VoiceEventType::CallHangup, "call1", json!({"reason": "hangup"}))).await;

        let log = logger.snapshot();
        let kinds: Vec<CallLogEventKind> = log.events.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![CallLogEventKind::SessionStart, CallLogEventKind::TranscriptUser, CallLogEventKind::CallHangup]
        );
        assert_eq!(log.final_state.as_deref(), Some("hangup"));
        for pair in log.events.windows(2) {
            assert!(pair[0].timestamp <= pair[1].timestamp);
        }
    }

    #[tokio::test]
    async fn tool_calls_are_recorded_with_input_and_output() {
        let bus = EventBus::new(32);
        let logger = Arc::new(CallLogger::new("call1", "tenant1", "+1000", None));
        attach(&bus, logger.clone());

        bus.emit(VoiceEvent::new(
            VoiceEventType::FunctionCallCompleted,
            "call1",
            json!({"name": "take_message", "call_id": "fc_1", "args": {"caller_name": "Ana"}, "output": {"recorded": true}, "success": true}),
        ))
        .await;

        let log = logger.snapshot();
        assert_eq!(log.tool_executions.len(), 1);
        assert_eq!(log.tool_executions[0].tool_name, "take_message");
        assert!(log.tool_executions[0].success);
    }
}
