use thiserror::Error;

/// Error taxonomy for the realtime bridge core (spec §7).
///
/// Each variant corresponds to one of the propagation-policy buckets: callers
/// that need to decide "reconnect vs. fall back vs. end the call" match on
/// this enum rather than a string.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("validation: {0}")]
    Validation(String),

    #[error("config: {0}")]
    Config(String),

    #[error("transport: {0}")]
    Transport(String),

    #[error("provider error: {0}")]
    Provider(#[from] crate::provider::ProviderError),

    #[error("audio: {0}")]
    Audio(String),

    #[error("timeout: scope {scope} exceeded {seconds}s")]
    Timeout { scope: String, seconds: u64 },

    #[error("illegal state transition: {trigger} from {state}")]
    State { state: String, trigger: String },

    #[error("transfer: {0}")]
    Transfer(#[from] crate::transfer::TransferError),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, BridgeError>;
