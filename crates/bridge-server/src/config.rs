//! Default [`bridge_core::config::ConfigSource`]: a single JSON file read
//! once at startup. The real admin-API/DB-backed source is explicitly
//! out of scope (spec.md §1 Non-goals); this is the placeholder the
//! expanded spec calls for.

use std::collections::HashMap;

use async_trait::async_trait;
use bridge_core::config::{ConfigError, ConfigSource, SecretaryConfig, TimeCondition, TransferRules};
use bridge_core::provider::registry::ProviderCredentials;
use bridge_core::transfer::{DestinationKind, FallbackAction, TransferDestination};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct TenantFile {
    tenants: HashMap<String, TenantEntry>,
}

#[derive(Debug, Deserialize)]
struct TenantEntry {
    secretary: SecretaryConfig,
    credentials: ProviderCredentialsFile,
    #[serde(default)]
    destinations: Vec<DestinationFile>,
    time_condition: TimeCondition,
}

#[derive(Debug, Deserialize)]
struct ProviderCredentialsFile {
    api_key: String,
    #[serde(default)]
    model_or_agent_id: String,
}

#[derive(Debug, Deserialize)]
struct DestinationFile {
    kind: String,
    number: String,
    #[serde(default)]
    context: String,
    #[serde(default)]
    aliases: Vec<String>,
    #[serde(default)]
    working_hours_only: bool,
    #[serde(default)]
    fallback_action: String,
    #[serde(default)]
    priority: u32,
    #[serde(default)]
    is_default: bool,
}

fn parse_kind(s: &str) -> DestinationKind {
    match s {
        "external" => DestinationKind::External,
        "voicemail" => DestinationKind::Voicemail,
        _ => DestinationKind::Extension,
    }
}

fn parse_fallback(s: &str) -> FallbackAction {
    match s {
        "end_call" => FallbackAction::EndCall,
        "retry" => FallbackAction::Retry,
        _ => FallbackAction::TakeMessage,
    }
}

pub struct StaticConfigSource {
    tenants: HashMap<String, TenantEntry>,
}

impl StaticConfigSource {
    pub fn load_from_file(path: &str) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let parsed: TenantFile = serde_json::from_str(&text)?;
        Ok(Self { tenants: parsed.tenants })
    }

    fn entry(&self, tenant_id: &str) -> Result<&TenantEntry, ConfigError> {
        self.tenants.get(tenant_id).ok_or_else(|| ConfigError::NotFound(tenant_id.to_string()))
    }
}

#[async_trait]
impl ConfigSource for StaticConfigSource {
    async fn load_secretary(&self, tenant_id: &str) -> Result<SecretaryConfig, ConfigError> {
        Ok(self.entry(tenant_id)?.secretary.clone())
    }

    async fn load_credentials(&self, tenant_id: &str) -> Result<ProviderCredentials, ConfigError> {
        let entry = self.entry(tenant_id)?;
        Ok(ProviderCredentials {
            api_key: entry.credentials.api_key.clone(),
            model_or_agent_id: entry.credentials.model_or_agent_id.clone(),
        })
    }

    async fn load_transfer_rules(&self, tenant_id: &str) -> Result<TransferRules, ConfigError> {
        let entry = self.entry(tenant_id)?;
        let destinations = entry
            .destinations
            .iter()
            .map(|d| TransferDestination {
                kind: parse_kind(&d.kind),
                number: d.number.clone(),
                context: d.context.clone(),
                aliases: d.aliases.clone(),
                working_hours_only: d.working_hours_only,
                fallback_action: parse_fallback(&d.fallback_action),
                priority: d.priority,
                is_default: d.is_default,
            })
            .collect();
        Ok(TransferRules { tenant_id: tenant_id.to_string(), destinations })
    }

    async fn load_time_condition(&self, tenant_id: &str) -> Result<TimeCondition, ConfigError> {
        Ok(self.entry(tenant_id)?.time_condition.clone())
    }
}
