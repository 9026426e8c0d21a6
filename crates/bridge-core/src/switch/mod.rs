//! Abstraction over the telephony switch's control channel (FreeSWITCH ESL
//! in production; spec §4.J/§6 name the operations a transfer needs).
//!
//! `bridge-core` only depends on this trait — the concrete ESL client lives
//! in `bridge-server` because it owns the TCP connection lifecycle, matching
//! the spec's split between "the core" and the switch-facing transport.

use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SwitchError {
    #[error("switch command failed: {0}")]
    CommandFailed(String),

    #[error("switch channel not found: {0}")]
    NotFound(String),

    #[error("switch transport error: {0}")]
    Transport(String),
}

pub type SwitchResult<T> = Result<T, SwitchError>;

/// Variables passed to `originate` (spec §4.J step 2: caller-id, timeout,
/// `hangup_after_bridge`).
#[derive(Debug, Clone, Default)]
pub struct OriginateVars {
    pub caller_id_number: String,
    pub caller_id_name: String,
    pub timeout_secs: u32,
    pub hangup_after_bridge: bool,
    pub extra: HashMap<String, String>,
}

/// Control-channel capability set a session/transfer manager needs from the
/// switch. One call leg is identified by its `uuid`.
#[async_trait]
pub trait SwitchControl: Send + Sync {
    /// Fire a raw ESL `api` command and return its raw response body.
    async fn execute_api(&self, command: &str) -> SwitchResult<String>;

    async fn uuid_exists(&self, uuid: &str) -> SwitchResult<bool>;

    /// Start/resume/stop the audio-stream endpoint attached to `uuid`.
    async fn uuid_audio_stream(&self, uuid: &str, action: AudioStreamAction, ws_url: &str) -> SwitchResult<()>;

    async fn uuid_transfer(&self, uuid: &str, destination: &str, context: &str) -> SwitchResult<()>;

    /// Bridge two existing legs directly (spec §4.J step 6).
    async fn uuid_bridge(&self, a_uuid: &str, b_uuid: &str) -> SwitchResult<()>;

    async fn uuid_kill(&self, uuid: &str) -> SwitchResult<()>;

    async fn uuid_setvar(&self, uuid: &str, name: &str, value: &str) -> SwitchResult<()>;

    /// Dial `destination` and return the new leg's uuid once FreeSWITCH
    /// accepts the originate request (does not imply the leg answered).
    async fn originate(&self, destination: &str, vars: &OriginateVars) -> SwitchResult<String>;

    /// Play (and optionally record) audio on top of an existing stream
    /// without tearing it down — used for the transfer courtesy farewell.
    async fn uuid_displace(&self, uuid: &str, file_or_tts: &str) -> SwitchResult<()>;

    async fn uuid_broadcast(&self, uuid: &str, app: &str, leg: BroadcastLeg) -> SwitchResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioStreamAction {
    Start,
    Pause,
    Resume,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastLeg {
    ALeg,
    BLeg,
    Both,
}

/// In-memory fake used by unit/integration tests (spec §4.J/§8 scenarios
/// need a switch double that never touches a real FreeSWITCH box).
#[cfg(any(test, feature = "test-util"))]
pub mod mock {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    #[derive(Debug, Clone)]
    pub enum Call {
        ExecuteApi(String),
        UuidAudioStream { uuid: String, action: AudioStreamAction, ws_url: String },
        UuidTransfer { uuid: String, destination: String },
        UuidBridge { a: String, b: String },
        UuidKill { uuid: String },
        Originate { destination: String, caller_id_number: String },
        UuidDisplace { uuid: String, target: String },
    }

    pub struct MockSwitch {
        pub calls: Mutex<Vec<Call>>,
        pub existing_legs: Mutex<std::collections::HashSet<String>>,
        next_leg: AtomicU64,
        pub fail_originate: bool,
    }

    impl MockSwitch {
        pub fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                existing_legs: Mutex::new(std::collections::HashSet::new()),
                next_leg: AtomicU64::new(1),
                fail_originate: false,
            }
        }

        pub fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl Default for MockSwitch {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl SwitchControl for MockSwitch {
        async fn execute_api(&self, command: &str) -> SwitchResult<String> {
            self.calls.lock().unwrap().push(Call::ExecuteApi(command.to_string()));
            Ok("+OK".into())
        }

        async fn uuid_exists(&self, uuid: &str) -> SwitchResult<bool> {
            Ok(self.existing_legs.lock().unwrap().contains(uuid))
        }

        async fn uuid_audio_stream(&self, uuid: &str, action: AudioStreamAction, ws_url: &str) -> SwitchResult<()> {
            self.calls.lock().unwrap().push(Call::UuidAudioStream {
                uuid: uuid.to_string(),
                action,
                ws_url: ws_url.to_string(),
            });
            Ok(())
        }

        async fn uuid_transfer(&self, uuid: &str, destination: &str, _context: &str) -> SwitchResult<()> {
            self.calls
                .lock()
                .unwrap()
                .push(Call::UuidTransfer { uuid: uuid.to_string(), destination: destination.to_string() });
            Ok(())
        }

        async fn uuid_bridge(&self, a_uuid: &str, b_uuid: &str) -> SwitchResult<()> {
            self.calls.lock().unwrap().push(Call::UuidBridge { a: a_uuid.to_string(), b: b_uuid.to_string() });
            Ok(())
        }

        async fn uuid_kill(&self, uuid: &str) -> SwitchResult<()> {
            self.calls.lock().unwrap().push(Call::UuidKill { uuid: uuid.to_string() });
            self.existing_legs.lock().unwrap().remove(uuid);
            Ok(())
        }

        async fn uuid_setvar(&self, _uuid: &str, _name: &str, _value: &str) -> SwitchResult<()> {
            Ok(())
        }

        async fn originate(&self, destination: &str, vars: &OriginateVars) -> SwitchResult<String> {
            self.calls.lock().unwrap().push(Call::Originate {
                destination: destination.to_string(),
                caller_id_number: vars.caller_id_number.clone(),
            });
            if self.fail_originate {
                return Err(SwitchError::CommandFailed("originate rejected".into()));
            }
            let id = self.next_leg.fetch_add(1, Ordering::SeqCst);
            let uuid = format!("mock-leg-{id}");
            self.existing_legs.lock().unwrap().insert(uuid.clone());
            Ok(uuid)
        }

        async fn uuid_displace(&self, uuid: &str, target: &str) -> SwitchResult<()> {
            self.calls
                .lock()
                .unwrap()
                .push(Call::UuidDisplace { uuid: uuid.to_string(), target: target.to_string() });
            Ok(())
        }

        async fn uuid_broadcast(&self, _uuid: &str, _app: &str, _leg: BroadcastLeg) -> SwitchResult<()> {
            Ok(())
        }
    }
}
