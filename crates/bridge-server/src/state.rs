use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use bridge_core::bus::EventBus;
use bridge_core::config::ConfigLoader;
use bridge_core::metrics::call_logger::CallLogger;
use bridge_core::metrics::BridgeMetrics;
use bridge_core::provider::registry;
use bridge_core::session::Session;
use bridge_core::switch::SwitchControl;
use tokio::sync::Mutex;

pub use bridge_core::provider::registry::DriverFactory;

pub fn default_driver_factory() -> DriverFactory {
    registry::default_factory()
}

/// Hands out ports from the configured b-leg range, one per in-flight
/// announced transfer (spec §6 CLI surface).
pub struct PortAllocator {
    range: (u16, u16),
    in_use: Mutex<HashSet<u16>>,
}

impl PortAllocator {
    pub fn new(min: u16, max: u16) -> Self {
        Self { range: (min, max), in_use: Mutex::new(HashSet::new()) }
    }

    pub async fn allocate(&self) -> Option<u16> {
        let mut in_use = self.in_use.lock().await;
        let (min, max) = self.range;
        let port = (min..=max).find(|p| !in_use.contains(p))?;
        in_use.insert(port);
        Some(port)
    }

    pub async fn release(&self, port: u16) {
        self.in_use.lock().await.remove(&port);
    }
}

/// Everything the announcement leg's WS connection needs to build its
/// auxiliary session, registered under a synthetic id before the switch
/// dials the attendant (spec §4.J step 3).
pub struct PendingAnnouncement {
    pub bus: EventBus,
    pub prompt: String,
    pub greeting: String,
}

/// Process-wide state shared across every WS connection (spec §5: "no
/// shared mutable state across calls except the tool registry, the
/// config-loader cache, and the metrics registry").
pub struct AppState {
    pub config_loader: Arc<ConfigLoader>,
    pub metrics: Arc<BridgeMetrics>,
    pub switch: Arc<dyn SwitchControl>,
    pub driver_factory: DriverFactory,
    /// Active sessions keyed by `call_uuid`, so a reconnecting WS during a
    /// transfer can reattach instead of constructing a new `Session`
    /// (spec §4.K).
    pub sessions: Mutex<HashMap<String, Arc<Session>>>,
    /// One call logger per a-leg session, kept here so the connection that
    /// ends the call can upload the final log even after a reconnect.
    pub loggers: Mutex<HashMap<String, Arc<CallLogger>>>,
    /// Pending announcement sessions keyed by the synthetic id embedded in
    /// the b-leg's stream URL; the connection for that id claims its entry
    /// instead of building an ordinary secretary `Session`.
    pub announcements: Mutex<HashMap<String, PendingAnnouncement>>,
    /// Base URL the switch can reach this process on, used to build the
    /// announcement leg's `uuid_audio_stream` target (e.g.
    /// `ws://127.0.0.1:8085`).
    pub public_ws_base: String,
    /// Local address per-transfer b-leg listeners bind on.
    pub bind_host: String,
    pub b_leg_ports: Option<PortAllocator>,
}

impl AppState {
    pub fn new(
        config_loader: Arc<ConfigLoader>,
        metrics: Arc<BridgeMetrics>,
        switch: Arc<dyn SwitchControl>,
        driver_factory: DriverFactory,
        public_ws_base: String,
        bind_host: String,
        b_leg_ports: Option<PortAllocator>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config_loader,
            metrics,
            switch,
            driver_factory,
            sessions: Mutex::new(HashMap::new()),
            loggers: Mutex::new(HashMap::new()),
            announcements: Mutex::new(HashMap::new()),
            public_ws_base,
            bind_host,
            b_leg_ports,
        })
    }

    pub async fn session(&self, call_uuid: &str) -> Option<Arc<Session>> {
        self.sessions.lock().await.get(call_uuid).cloned()
    }

    pub async fn insert_session(&self, call_uuid: String, session: Arc<Session>) {
        self.sessions.lock().await.insert(call_uuid, session);
    }

    pub async fn remove_session(&self, call_uuid: &str) {
        self.sessions.lock().await.remove(call_uuid);
    }

    pub async fn insert_logger(&self, call_uuid: String, logger: Arc<CallLogger>) {
        self.loggers.lock().await.insert(call_uuid, logger);
    }

    pub async fn logger(&self, call_uuid: &str) -> Option<Arc<CallLogger>> {
        self.loggers.lock().await.get(call_uuid).cloned()
    }

    pub async fn remove_logger(&self, call_uuid: &str) -> Option<Arc<CallLogger>> {
        self.loggers.lock().await.remove(call_uuid)
    }

    pub async fn register_announcement(&self, id: String, pending: PendingAnnouncement) {
        self.announcements.lock().await.insert(id, pending);
    }

    /// One-shot: the first connection for an announcement id claims it.
    pub async fn take_announcement(&self, id: &str) -> Option<PendingAnnouncement> {
        self.announcements.lock().await.remove(id)
    }

    /// Build the URL the switch should stream a given leg's audio to.
    pub fn stream_url(&self, base: &str, secretary_uuid: &str, leg_id: &str, caller_id: &str) -> String {
        format!("{base}/stream/{secretary_uuid}/{leg_id}/{caller_id}")
    }

    /// Swap the port in `public_ws_base` for a per-transfer listener's port.
    pub fn ws_base_with_port(&self, port: u16) -> String {
        match self.public_ws_base.rsplit_once(':') {
            Some((prefix, maybe_port)) if maybe_port.chars().all(|c| c.is_ascii_digit()) => {
                format!("{prefix}:{port}")
            }
            _ => format!("{}:{port}", self.public_ws_base),
        }
    }
}
