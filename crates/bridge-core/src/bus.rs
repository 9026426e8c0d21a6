//! Per-call typed pub/sub event bus (spec §4.D).
//!
//! Handlers may be sync or async; emission iterates a snapshot of the
//! handler list for that event type so a failing handler never prevents
//! its siblings from running — failures are logged via `tracing`, not
//! propagated.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use futures_util::FutureExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

/// Closed set of event kinds the bus knows how to route (spec §3 `VoiceEvent`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum VoiceEventType {
    SessionStarted,
    SessionEnded,
    AudioFirstOutput,
    AudioOutputFlushed,
    UserAudioReceived,
    UserTranscript,
    AssistantTranscript,
    SpeechStarted,
    SpeechStopped,
    StateChanged,
    ConnectionDegraded,
    ProviderTimeout,
    ProviderConnected,
    ProviderError,
    FunctionCallStarted,
    FunctionCallCompleted,
    TransferInitiated,
    TransferRinging,
    TransferAnswered,
    TransferCompleted,
    TransferRejected,
    TransferTimeout,
    HoldStarted,
    HoldEnded,
    CallHangup,
    MessageTaken,
}

/// A single event flowing through the bus.
#[derive(Debug, Clone)]
pub struct VoiceEvent {
    pub kind: VoiceEventType,
    pub call_id: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub data: Value,
}

impl VoiceEvent {
    pub fn new(kind: VoiceEventType, call_id: impl Into<String>, data: Value) -> Self {
        Self {
            kind,
            call_id: call_id.into(),
            timestamp: chrono::Utc::now(),
            data,
        }
    }
}

type AsyncHandler =
    Arc<dyn Fn(VoiceEvent) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

#[derive(Clone)]
struct Registered {
    handler: AsyncHandler,
    once: bool,
    id: u64,
}

struct Inner {
    handlers: Mutex<HashMap<VoiceEventType, Vec<Registered>>>,
    history: Mutex<VecDeque<VoiceEvent>>,
    history_cap: usize,
    next_id: std::sync::atomic::AtomicU64,
    /// Live `wait_for`/`wait_for_any` callers. Each gets its own channel so
    /// a burst of emits can't overwrite an event before a waiter sees it.
    waiters: Mutex<Vec<(u64, mpsc::UnboundedSender<VoiceEvent>)>>,
}

/// Per-call event bus. Cheap to clone (all state behind `Arc`).
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl EventBus {
    pub fn new(history_cap: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                handlers: Mutex::new(HashMap::new()),
                history: Mutex::new(VecDeque::with_capacity(history_cap)),
                history_cap,
                next_id: std::sync::atomic::AtomicU64::new(0),
                waiters: Mutex::new(Vec::new()),
            }),
        }
    }

    fn next_id(&self) -> u64 {
        self.inner
            .next_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
    }

    /// Register a handler for every event of `kind`. Returns a handler id
    /// usable with [`EventBus::off`].
    pub fn on<F, Fut>(&self, kind: VoiceEventType, handler: F) -> u64
    where
        F: Fn(VoiceEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.register(kind, handler, false)
    }

    /// Register a handler that fires at most once, then deregisters itself.
    pub fn once<F, Fut>(&self, kind: VoiceEventType, handler: F) -> u64
    where
        F: Fn(VoiceEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.register(kind, handler, true)
    }

    fn register<F, Fut>(&self, kind: VoiceEventType, handler: F, once: bool) -> u64
    where
        F: Fn(VoiceEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = self.next_id();
        let boxed: AsyncHandler = Arc::new(move |ev| Box::pin(handler(ev)));
        let mut handlers = self.inner.handlers.lock().unwrap();
        handlers
            .entry(kind)
            .or_default()
            .push(Registered { handler: boxed, once, id });
        id
    }

    /// Remove a previously registered handler by id.
    pub fn off(&self, kind: VoiceEventType, id: u64) {
        let mut handlers = self.inner.handlers.lock().unwrap();
        if let Some(v) = handlers.get_mut(&kind) {
            v.retain(|r| r.id != id);
        }
    }

    /// Emit an event: snapshot the handler list for `event.kind`, run them
    /// all, swallow panics into a `tracing::error!` so one handler's
    /// failure never blocks its siblings, then append to history and wake
    /// any `wait_for`/`wait_for_any` callers.
    pub async fn emit(&self, event: VoiceEvent) {
        let kind = event.kind;
        let snapshot: Vec<Registered> = {
            let mut handlers = self.inner.handlers.lock().unwrap();
            let list = handlers.entry(kind).or_default();
            let snap = list.clone();
            list.retain(|r| !r.once);
            snap
        };

        for reg in snapshot {
            let fut = std::panic::AssertUnwindSafe((reg.handler)(event.clone()));
            if let Err(panic) = fut.catch_unwind().await {
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                tracing::error!(call_id = %event.call_id, kind = ?kind, %msg, "event handler panicked");
            }
        }

        {
            let mut history = self.inner.history.lock().unwrap();
            if history.len() >= self.inner.history_cap {
                history.pop_front();
            }
            history.push_back(event.clone());
        }
        self.inner
            .waiters
            .lock()
            .unwrap()
            .retain(|(_, tx)| tx.send(event.clone()).is_ok());
    }

    /// Wait for the next event of `kind` satisfying `predicate`, or `None`
    /// on timeout.
    pub async fn wait_for(
        &self,
        kind: VoiceEventType,
        timeout_dur: Duration,
        predicate: impl Fn(&VoiceEvent) -> bool,
    ) -> Option<VoiceEvent> {
        self.wait_for_any(&[kind], timeout_dur, predicate).await
    }

    /// Wait for the next event whose kind is in `kinds` and satisfies
    /// `predicate`, or `None` on timeout. Only events emitted after the wait
    /// begins are considered; past events are reachable via [`EventBus::history`].
    pub async fn wait_for_any(
        &self,
        kinds: &[VoiceEventType],
        timeout_dur: Duration,
        predicate: impl Fn(&VoiceEvent) -> bool,
    ) -> Option<VoiceEvent> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = self.next_id();
        self.inner.waiters.lock().unwrap().push((id, tx));

        let result = timeout(timeout_dur, async {
            while let Some(ev) = rx.recv().await {
                if kinds.contains(&ev.kind) && predicate(&ev) {
                    return Some(ev);
                }
            }
            None
        })
        .await
        .unwrap_or(None);

        self.inner.waiters.lock().unwrap().retain(|(i, _)| *i != id);
        result
    }

    pub fn history(&self) -> Vec<VoiceEvent> {
        self.inner.history.lock().unwrap().iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn emit_delivers_to_registered_handlers() {
        let bus = EventBus::new(16);
        let count = Arc::new(AtomicUsize::new(0));
        let c2 = count.clone();
        bus.on(VoiceEventType::StateChanged, move |_ev| {
            let c = c2.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
            }
        });
        bus.emit(VoiceEvent::new(VoiceEventType::StateChanged, "call1", Value::Null))
            .await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn once_handler_fires_a_single_time() {
        let bus = EventBus::new(16);
        let count = Arc::new(AtomicUsize::new(0));
        let c2 = count.clone();
        bus.once(VoiceEventType::CallHangup, move |_ev| {
            let c = c2.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
            }
        });
        bus.emit(VoiceEvent::new(VoiceEventType::CallHangup, "c", Value::Null))
            .await;
        bus.emit(VoiceEvent::new(VoiceEventType::CallHangup, "c", Value::Null))
            .await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn panicking_handler_does_not_block_siblings() {
        let bus = EventBus::new(16);
        bus.on(VoiceEventType::StateChanged, |_ev| async { panic!("boom") });
        let count = Arc::new(AtomicUsize::new(0));
        let c2 = count.clone();
        bus.on(VoiceEventType::StateChanged, move |_ev| {
            let c = c2.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
            }
        });
        bus.emit(VoiceEvent::new(VoiceEventType::StateChanged, "c", Value::Null))
            .await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn wait_for_times_out_with_no_matching_event() {
        let bus = EventBus::new(16);
        let res = bus
            .wait_for(VoiceEventType::TransferAnswered, Duration::from_millis(20), |_| true)
            .await;
        assert!(res.is_none());
    }

    #[tokio::test]
    async fn wait_for_ignores_events_emitted_before_the_wait_began() {
        let bus = EventBus::new(16);
        bus.emit(VoiceEvent::new(VoiceEventType::TransferAnswered, "c", Value::Null))
            .await;
        let res = bus
            .wait_for(VoiceEventType::TransferAnswered, Duration::from_millis(20), |_| true)
            .await;
        assert!(res.is_none());
    }

    #[tokio::test]
    async fn wait_for_sees_event_emitted_while_waiting() {
        let bus = EventBus::new(16);
        let waiter = {
            let bus = bus.clone();
            tokio::spawn(async move {
                bus.wait_for(VoiceEventType::TransferAnswered, Duration::from_secs(1), |_| true)
                    .await
            })
        };
        tokio::task::yield_now().await;
        bus.emit(VoiceEvent::new(VoiceEventType::TransferAnswered, "c", Value::Null))
            .await;
        assert!(waiter.await.unwrap().is_some());
    }

    #[tokio::test]
    async fn history_is_bounded() {
        let bus = EventBus::new(2);
        for _ in 0..5 {
            bus.emit(VoiceEvent::new(VoiceEventType::StateChanged, "c", Value::Null))
                .await;
        }
        assert_eq!(bus.history().len(), 2);
    }
}
