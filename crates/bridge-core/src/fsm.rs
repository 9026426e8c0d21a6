//! Explicit call-lifecycle state machine (spec §4.E).
//!
//! The transition table is a closed `(State, Trigger) -> State` map built
//! once at construction. Transitions are serialized by the caller holding
//! `Session`'s single mutex (spec §5 locking discipline); this type itself
//! is not internally synchronized.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallState {
    Idle,
    Connecting,
    Connected,
    Listening,
    Speaking,
    Processing,
    OnHold,
    TransferringValidating,
    TransferringDialing,
    TransferringAnnouncing,
    TransferringWaiting,
    TransferringBridging,
    Bridged,
    Ending,
    Ended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Trigger {
    Connect,
    ConnectionEstablished,
    StartListening,
    UserSpeechStarted,
    AiStartSpeaking,
    AiStopSpeaking,
    StartProcessing,
    Hold,
    Unhold,
    RequestTransfer,
    TransferValidated,
    TransferDialing,
    TransferAnnouncing,
    TransferWaiting,
    TransferAccepted,
    TransferRejected,
    TransferBridged,
    EndCall,
    ForceEnd,
}

pub struct TriggerData {
    pub data: Value,
}

impl TriggerData {
    pub fn empty() -> Self {
        Self { data: Value::Null }
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }
}

type Guard = Arc<dyn Fn(&TriggerData) -> bool + Send + Sync>;

/// Default guard on `request_transfer`: requires a caller name and
/// destination (spec §4.E).
pub fn default_transfer_guard() -> Guard {
    Arc::new(|data: &TriggerData| {
        data.get_str("caller_name").is_some_and(|s| !s.is_empty())
            && data.get_str("destination").is_some_and(|s| !s.is_empty())
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct StateChange {
    pub old: CallState,
    pub new: CallState,
    pub trigger: Trigger,
}

type TransitionHook = Box<dyn Fn(&StateChange) + Send + Sync>;

/// The closed transition table plus optional per-trigger guards and
/// before/after transition hooks.
pub struct StateMachine {
    state: CallState,
    table: HashMap<(CallState, Trigger), CallState>,
    guards: HashMap<Trigger, Guard>,
    history: Vec<StateChange>,
    before_hook: Option<TransitionHook>,
    after_hook: Option<TransitionHook>,
}

impl StateMachine {
    pub fn new() -> Self {
        let mut table = HashMap::new();
        use CallState::*;
        use Trigger::*;

        let mut add = |from: CallState, trigger: Trigger, to: CallState| {
            table.insert((from, trigger), to);
        };

        add(Idle, Connect, Connecting);
        add(Connecting, ConnectionEstablished, Connected);
        add(Connected, StartListening, Listening);
        add(Listening, UserSpeechStarted, Processing);
        add(Listening, StartProcessing, Processing);
        add(Processing, AiStartSpeaking, Speaking);
        // The greeting and tool-result utterances begin straight from
        // LISTENING, with no user turn in between.
        add(Listening, AiStartSpeaking, Speaking);
        add(Speaking, AiStopSpeaking, Listening);
        add(Processing, StartListening, Listening);
        add(Listening, Hold, OnHold);
        add(Speaking, Hold, OnHold);
        add(OnHold, Unhold, Listening);
        add(Listening, RequestTransfer, TransferringValidating);
        add(Speaking, RequestTransfer, TransferringValidating);
        add(TransferringValidating, TransferValidated, TransferringDialing);
        add(TransferringDialing, TransferDialing, TransferringAnnouncing);
        add(TransferringAnnouncing, TransferAnnouncing, TransferringWaiting);
        add(TransferringWaiting, TransferWaiting, TransferringWaiting);
        add(TransferringWaiting, TransferAccepted, TransferringBridging);
        add(TransferringBridging, TransferBridged, Bridged);
        add(TransferringWaiting, TransferRejected, Listening);
        add(TransferringAnnouncing, TransferRejected, Listening);
        add(TransferringDialing, TransferRejected, Listening);
        add(TransferringValidating, TransferRejected, Listening);
        add(Listening, EndCall, Ending);
        add(Speaking, EndCall, Ending);
        add(Processing, EndCall, Ending);
        add(Bridged, EndCall, Ending);
        add(Ending, ForceEnd, Ended);

        let mut guards = HashMap::new();
        guards.insert(Trigger::RequestTransfer, default_transfer_guard());

        Self {
            state: CallState::Idle,
            table,
            guards,
            history: Vec::new(),
            before_hook: None,
            after_hook: None,
        }
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn history(&self) -> &[StateChange] {
        &self.history
    }

    pub fn set_guard(&mut self, trigger: Trigger, guard: Guard) {
        self.guards.insert(trigger, guard);
    }

    /// Runs just before a validated transition is applied.
    pub fn set_before_hook(&mut self, hook: TransitionHook) {
        self.before_hook = Some(hook);
    }

    /// Runs after a transition has been applied and recorded.
    pub fn set_after_hook(&mut self, hook: TransitionHook) {
        self.after_hook = Some(hook);
    }

    /// Attempt `trigger`. Returns `true` and advances state on success;
    /// returns `false` (and logs) if the transition isn't in the table or
    /// the guard rejects it. `force_end` always succeeds regardless of
    /// current state (spec §4.E: "a force_end trigger from any state goes
    /// to ENDED").
    pub fn trigger(&mut self, trigger: Trigger, data: &TriggerData) -> bool {
        if trigger == Trigger::ForceEnd {
            return self.apply(StateChange { old: self.state, new: CallState::Ended, trigger });
        }

        if let Some(guard) = self.guards.get(&trigger) {
            if !guard(data) {
                tracing::debug!(?trigger, state = ?self.state, "transition denied by guard");
                return false;
            }
        }

        match self.table.get(&(self.state, trigger)) {
            Some(&new_state) => self.apply(StateChange { old: self.state, new: new_state, trigger }),
            None => {
                tracing::debug!(?trigger, state = ?self.state, "no such transition");
                false
            }
        }
    }

    fn apply(&mut self, change: StateChange) -> bool {
        if let Some(hook) = &self.before_hook {
            hook(&change);
        }
        self.state = change.new;
        self.history.push(change.clone());
        if let Some(hook) = &self.after_hook {
            hook(&change);
        }
        true
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_transition_advances_state() {
        let mut fsm = StateMachine::new();
        assert!(fsm.trigger(Trigger::Connect, &TriggerData::empty()));
        assert_eq!(fsm.state(), CallState::Connecting);
    }

    #[test]
    fn invalid_transition_is_rejected() {
        let mut fsm = StateMachine::new();
        assert!(!fsm.trigger(Trigger::TransferBridged, &TriggerData::empty()));
        assert_eq!(fsm.state(), CallState::Idle);
    }

    #[test]
    fn force_end_works_from_any_state() {
        let mut fsm = StateMachine::new();
        assert!(fsm.trigger(Trigger::ForceEnd, &TriggerData::empty()));
        assert_eq!(fsm.state(), CallState::Ended);
    }

    #[test]
    fn transfer_guard_requires_name_and_destination() {
        let mut fsm = StateMachine::new();
        fsm.trigger(Trigger::Connect, &TriggerData::empty());
        fsm.trigger(Trigger::ConnectionEstablished, &TriggerData::empty());
        fsm.trigger(Trigger::StartListening, &TriggerData::empty());
        assert!(!fsm.trigger(Trigger::RequestTransfer, &TriggerData::empty()));
        assert_eq!(fsm.state(), CallState::Listening);

        let data = TriggerData {
            data: serde_json::json!({"caller_name": "Bob", "destination": "sales"}),
        };
        assert!(fsm.trigger(Trigger::RequestTransfer, &data));
        assert_eq!(fsm.state(), CallState::TransferringValidating);
    }

    #[test]
    fn after_hook_fires_on_every_successful_transition() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;
        let fired = Arc::new(AtomicUsize::new(0));
        let f2 = fired.clone();
        let mut fsm = StateMachine::new();
        fsm.set_after_hook(Box::new(move |_change| {
            f2.fetch_add(1, Ordering::SeqCst);
        }));
        fsm.trigger(Trigger::Connect, &TriggerData::empty());
        fsm.trigger(Trigger::TransferBridged, &TriggerData::empty()); // invalid, no hook
        fsm.trigger(Trigger::ConnectionEstablished, &TriggerData::empty());
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn every_successful_transition_is_recorded_in_history() {
        let mut fsm = StateMachine::new();
        fsm.trigger(Trigger::Connect, &TriggerData::empty());
        fsm.trigger(Trigger::ConnectionEstablished, &TriggerData::empty());
        assert_eq!(fsm.history().len(), 2);
        assert_eq!(fsm.history()[0].new, CallState::Connecting);
    }
}
