use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

/// Resolved step parameters. Backed by an ordered map, so serializing it is
/// deterministic and usable as a cache key.
pub type Params = Map<String, Value>;

/// A pluggable lookup capability behind a uniform async resolve contract.
#[async_trait]
pub trait EnrichmentProvider: Send + Sync {
    fn id(&self) -> &str;

    /// Provider default cache TTL. `None` falls back to the registry default.
    fn ttl(&self) -> Option<Duration> {
        None
    }

    fn refresh_interval(&self) -> Option<Duration> {
        None
    }

    fn supports_refresh(&self) -> bool {
        false
    }

    /// Custom cache key. The registry prefixes it with the provider id.
    fn cache_key(&self, _params: &Params) -> Option<String> {
        None
    }

    async fn init(&self) -> ProviderResult<()> {
        Ok(())
    }

    async fn refresh(&self) -> ProviderResult<()> {
        Ok(())
    }

    async fn resolve(&self, params: &Params) -> ProviderResult<Value>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderInfo {
    pub id: String,
    pub ttl_ms: Option<u64>,
    pub refresh_interval_ms: Option<u64>,
    pub refreshable: bool,
}

impl ProviderInfo {
    pub fn of(provider: &dyn EnrichmentProvider) -> Self {
        Self {
            id: provider.id().to_string(),
            ttl_ms: provider.ttl().map(|ttl| ttl.as_millis() as u64),
            refresh_interval_ms: provider
                .refresh_interval()
                .map(|interval| interval.as_millis() as u64),
            refreshable: provider.supports_refresh(),
        }
    }
}

/// Cloneable so one single-flight result can be handed to every waiter.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    #[error("unknown_enrichment_source:{0}")]
    UnknownSource(String),

    #[error("http_{status}")]
    Http { status: u16 },

    #[error("Request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Request failed: {0}")]
    Request(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Invalid provider definition: {0}")]
    InvalidDefinition(String),

    #[error("Provider does not support refresh: {0}")]
    RefreshUnsupported(String),

    #[error("Provider failed: {0}")]
    Failed(String),
}

impl ProviderError {
    /// Stable reason code for callers that surface the failure.
    pub fn code(&self) -> String {
        match self {
            ProviderError::UnknownSource(_) => "unknown_enrichment_source".to_string(),
            ProviderError::Http { status } => format!("http_{}", status),
            ProviderError::Timeout { .. } => "timeout".to_string(),
            ProviderError::Request(_) => "request_failed".to_string(),
            ProviderError::InvalidResponse(_) => "invalid_response".to_string(),
            ProviderError::InvalidDefinition(_) => "invalid_provider_definition".to_string(),
            ProviderError::RefreshUnsupported(_) => "refresh_unsupported".to_string(),
            ProviderError::Failed(_) => "provider_failed".to_string(),
        }
    }
}

pub type ProviderResult<T> = Result<T, ProviderError>;
