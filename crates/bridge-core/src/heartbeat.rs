//! Liveness monitor and scoped-timeout supervisor (spec §4.F).

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use serde_json::json;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};

use crate::bus::{EventBus, VoiceEvent, VoiceEventType};

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Tracks the last-seen instants the session cares about and periodically
/// checks them against configured thresholds, emitting `ConnectionDegraded`
/// / `ProviderTimeout` (debounced) through the bus.
pub struct Heartbeat {
    call_id: String,
    bus: EventBus,
    last_audio_received_ms: AtomicI64,
    last_provider_response_ms: AtomicI64,
    last_ws_activity_ms: AtomicI64,
    audio_silence_threshold: Duration,
    provider_silence_threshold: Duration,
    degraded_fired: std::sync::atomic::AtomicBool,
    provider_timeout_fired: std::sync::atomic::AtomicBool,
}

impl Heartbeat {
    pub fn new(
        call_id: impl Into<String>,
        bus: EventBus,
        audio_silence_threshold: Duration,
        provider_silence_threshold: Duration,
    ) -> Arc<Self> {
        let now = now_ms();
        Arc::new(Self {
            call_id: call_id.into(),
            bus,
            last_audio_received_ms: AtomicI64::new(now),
            last_provider_response_ms: AtomicI64::new(now),
            last_ws_activity_ms: AtomicI64::new(now),
            audio_silence_threshold,
            provider_silence_threshold,
            degraded_fired: std::sync::atomic::AtomicBool::new(false),
            provider_timeout_fired: std::sync::atomic::AtomicBool::new(false),
        })
    }

    pub fn touch_audio(&self) {
        self.last_audio_received_ms.store(now_ms(), Ordering::Relaxed);
        self.degraded_fired.store(false, Ordering::Relaxed);
    }

    pub fn touch_provider(&self) {
        self.last_provider_response_ms.store(now_ms(), Ordering::Relaxed);
        self.provider_timeout_fired.store(false, Ordering::Relaxed);
    }

    pub fn touch_ws(&self) {
        self.last_ws_activity_ms.store(now_ms(), Ordering::Relaxed);
    }

    /// Spawn the periodic monitor loop. Returns a handle the owner can
    /// abort on session teardown.
    pub fn spawn_monitor(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                this.check_once().await;
            }
        })
    }

    async fn check_once(&self) {
        let now = now_ms();
        let audio_silence = now - self.last_audio_received_ms.load(Ordering::Relaxed);
        if audio_silence as u128 > self.audio_silence_threshold.as_millis()
            && !self.degraded_fired.swap(true, Ordering::Relaxed)
        {
            self.bus
                .emit(VoiceEvent::new(
                    VoiceEventType::ConnectionDegraded,
                    &self.call_id,
                    json!({"audio_silence_ms": audio_silence}),
                ))
                .await;
        }

        let provider_silence = now - self.last_provider_response_ms.load(Ordering::Relaxed);
        if provider_silence as u128 > self.provider_silence_threshold.as_millis()
            && !self.provider_timeout_fired.swap(true, Ordering::Relaxed)
        {
            self.bus
                .emit(VoiceEvent::new(
                    VoiceEventType::ProviderTimeout,
                    &self.call_id,
                    json!({"provider_silence_ms": provider_silence}),
                ))
                .await;
        }
    }
}

/// A guard returned by [`timeout_scope`]; dropping it without calling
/// [`ScopeGuard::complete`] lets the scope's timer keep running in the
/// background task, which will emit `TRANSFER_TIMEOUT` for scopes whose
/// name is prefixed `transfer` once it expires.
pub struct ScopeGuard {
    handle: JoinHandle<()>,
    completed: Arc<std::sync::atomic::AtomicBool>,
}

impl ScopeGuard {
    /// Mark the scope as completed; the pending timer fires nothing further.
    pub fn complete(self) {
        self.completed.store(true, Ordering::SeqCst);
        self.handle.abort();
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        // Idempotent: aborting an already-aborted/finished task is a no-op.
        self.handle.abort();
    }
}

/// Start a named timeout scope. If not completed within `seconds`, emits a
/// bus event: `TransferTimeout` for scopes whose `name` starts with
/// `"transfer"`, `ProviderTimeout` otherwise.
pub fn timeout_scope(call_id: impl Into<String>, bus: EventBus, name: impl Into<String>, seconds: u64) -> ScopeGuard {
    let call_id = call_id.into();
    let name = name.into();
    let completed = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let completed2 = completed.clone();
    let handle = tokio::spawn(async move {
        tokio::time::sleep_until(Instant::now() + Duration::from_secs(seconds)).await;
        if completed2.load(Ordering::SeqCst) {
            return;
        }
        let kind = if name.starts_with("transfer") {
            VoiceEventType::TransferTimeout
        } else {
            VoiceEventType::ProviderTimeout
        };
        bus.emit(VoiceEvent::new(kind, &call_id, json!({"scope": name})))
            .await;
    });
    ScopeGuard { handle, completed }
}
