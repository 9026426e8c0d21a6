//! Provider name → constructor table (spec §4.G, modeled on the original's
//! `providers/factory.py`).

use std::sync::Arc;

use super::{elevenlabs::ElevenLabsDriver, openai::OpenAiRealtimeDriver, ProviderDriver, ProviderError};

/// Credentials needed to construct any of the supported drivers. Unused
/// fields for a given provider are simply ignored.
#[derive(Debug, Clone, Default)]
pub struct ProviderCredentials {
    pub api_key: String,
    pub model_or_agent_id: String,
}

/// Builds a driver by provider name. The process normally uses
/// [`default_factory`]; tests inject scripted fakes.
pub type DriverFactory =
    Arc<dyn Fn(&str, &ProviderCredentials) -> Result<Box<dyn ProviderDriver>, ProviderError> + Send + Sync>;

pub fn default_factory() -> DriverFactory {
    Arc::new(build)
}

/// Build a boxed driver by provider name, or [`ProviderError::UnknownProvider`].
pub fn build(name: &str, creds: &ProviderCredentials) -> Result<Box<dyn ProviderDriver>, ProviderError> {
    match name {
        "openai" => Ok(Box::new(OpenAiRealtimeDriver::new(
            creds.api_key.clone(),
            if creds.model_or_agent_id.is_empty() {
                "gpt-realtime".to_string()
            } else {
                creds.model_or_agent_id.clone()
            },
        ))),
        "elevenlabs" => Ok(Box::new(ElevenLabsDriver::new(
            creds.api_key.clone(),
            creds.model_or_agent_id.clone(),
        ))),
        other => Err(ProviderError::UnknownProvider(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_provider_name_errors() {
        let err = build("not-a-provider", &ProviderCredentials::default());
        assert!(matches!(err, Err(ProviderError::UnknownProvider(_))));
    }

    #[test]
    fn known_providers_construct() {
        assert!(build("openai", &ProviderCredentials::default()).is_ok());
        assert!(build("elevenlabs", &ProviderCredentials::default()).is_ok());
    }
}
