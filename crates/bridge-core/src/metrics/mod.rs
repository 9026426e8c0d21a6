//! Prometheus metrics registry (spec §4.M), mirroring the original's
//! `prometheus_client`-based exporter (`realtime/utils/metrics.py`).

pub mod call_logger;

use prometheus::{
    register_counter_vec_with_registry, register_gauge_with_registry, register_histogram_vec_with_registry,
    register_int_counter_vec_with_registry, CounterVec, Gauge, HistogramVec, IntCounterVec, Registry,
};

pub struct BridgeMetrics {
    pub registry: Registry,
    pub calls_total: IntCounterVec,
    pub audio_bytes_total: CounterVec,
    pub response_latency_seconds: HistogramVec,
    pub active_sessions: Gauge,
    pub transfer_attempts_total: IntCounterVec,
    pub transfer_duration_seconds: HistogramVec,
    pub callback_requests_total: IntCounterVec,
    pub extension_checks_total: IntCounterVec,
    pub click_to_call_total: IntCounterVec,
}

impl BridgeMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let calls_total = register_int_counter_vec_with_registry!(
            "bridge_calls_total",
            "Completed calls by tenant, provider and outcome",
            &["tenant", "provider", "outcome"],
            registry
        )?;
        let audio_bytes_total = register_counter_vec_with_registry!(
            "bridge_audio_bytes_total",
            "Audio bytes processed by tenant and direction",
            &["tenant", "direction"],
            registry
        )?;
        let response_latency_seconds = register_histogram_vec_with_registry!(
            "bridge_response_latency_seconds",
            "Time from user turn end to first assistant audio byte",
            &["tenant", "provider"],
            registry
        )?;
        let active_sessions = register_gauge_with_registry!("bridge_active_sessions", "Currently active call sessions", registry)?;
        let transfer_attempts_total = register_int_counter_vec_with_registry!(
            "bridge_transfer_attempts_total",
            "Announced transfer attempts by tenant and outcome",
            &["tenant", "outcome"],
            registry
        )?;
        let transfer_duration_seconds = register_histogram_vec_with_registry!(
            "bridge_transfer_duration_seconds",
            "Duration of announced transfer attempts",
            &["tenant", "outcome"],
            registry
        )?;
        let callback_requests_total = register_int_counter_vec_with_registry!(
            "bridge_callback_requests_total",
            "take_message invocations by tenant",
            &["tenant"],
            registry
        )?;
        let extension_checks_total = register_int_counter_vec_with_registry!(
            "bridge_extension_checks_total",
            "check_extension_available invocations by tenant and result",
            &["tenant", "found"],
            registry
        )?;
        let click_to_call_total =
            register_int_counter_vec_with_registry!("bridge_click_to_call_total", "Click-to-call originations by tenant", &["tenant"], registry)?;

        Ok(Self {
            registry,
            calls_total,
            audio_bytes_total,
            response_latency_seconds,
            active_sessions,
            transfer_attempts_total,
            transfer_duration_seconds,
            callback_requests_total,
            extension_checks_total,
            click_to_call_total,
        })
    }

    pub fn record_call_end(&self, tenant: &str, provider: &str, outcome: &str) {
        self.calls_total.with_label_values(&[tenant, provider, outcome]).inc();
    }

    pub fn record_audio_bytes(&self, tenant: &str, direction: &str, bytes: usize) {
        self.audio_bytes_total.with_label_values(&[tenant, direction]).inc_by(bytes as f64);
    }

    pub fn record_transfer(&self, tenant: &str, outcome: &str, duration_secs: f64) {
        self.transfer_attempts_total.with_label_values(&[tenant, outcome]).inc();
        self.transfer_duration_seconds.with_label_values(&[tenant, outcome]).observe(duration_secs);
    }

    pub fn session_started(&self) {
        self.active_sessions.inc();
    }

    pub fn session_ended(&self) {
        self.active_sessions.dec();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn construction_registers_without_panic() {
        let metrics = BridgeMetrics::new().unwrap();
        metrics.record_call_end("tenant1", "openai", "completed");
        metrics.record_audio_bytes("tenant1", "inbound", 3200);
        metrics.session_started();
        metrics.session_ended();
        assert!(!metrics.registry.gather().is_empty());
    }
}
