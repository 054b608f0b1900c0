//! Built-in provider kinds and the JSON definitions that construct them.

pub mod http_get;
pub mod list;
pub mod webhook;

use std::{sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::types::{EnrichmentProvider, ProviderError, ProviderResult};

pub use http_get::{HttpGetConfig, HttpGetProvider};
pub use list::{ListConfig, ListProvider};
pub use webhook::{HttpMethod, WebhookConfig, WebhookProvider};

pub(crate) const DEFAULT_TIMEOUT_MS: u64 = 5000;

/// Dynamic provider definition, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ProviderDefinition {
    List(ListConfig),
    HttpGet(HttpGetConfig),
    Webhook(WebhookConfig),
}

impl ProviderDefinition {
    pub fn from_value(value: Value) -> ProviderResult<Self> {
        serde_json::from_value(value)
            .map_err(|e| ProviderError::InvalidDefinition(e.to_string()))
    }

    pub fn id(&self) -> &str {
        match self {
            ProviderDefinition::List(config) => &config.id,
            ProviderDefinition::HttpGet(config) => &config.id,
            ProviderDefinition::Webhook(config) => &config.id,
        }
    }

    pub fn build(self) -> ProviderResult<Arc<dyn EnrichmentProvider>> {
        if self.id().trim().is_empty() {
            return Err(ProviderError::InvalidDefinition(
                "provider id must not be empty".to_string(),
            ));
        }
        Ok(match self {
            ProviderDefinition::List(config) => Arc::new(ListProvider::new(config)?),
            ProviderDefinition::HttpGet(config) => Arc::new(HttpGetProvider::new(config)?),
            ProviderDefinition::Webhook(config) => Arc::new(WebhookProvider::new(config)?),
        })
    }
}

/// Providers registered when no configuration overrides them.
pub fn default_providers() -> Vec<Arc<dyn EnrichmentProvider>> {
    let prefectures = ListConfig {
        id: "prefectures".to_string(),
        list: Some(serde_json::json!({
            "1": { "code": 1, "name": "北海道" },
            "13": { "code": 13, "name": "東京都" },
            "27": { "code": 27, "name": "大阪府" }
        })),
        key_param: "code".to_string(),
        ttl_ms: Some(10 * 60 * 1000),
        ..ListConfig::default()
    };
    let user = HttpGetConfig {
        id: "jsonplaceholder-user".to_string(),
        url_template: "https://jsonplaceholder.typicode.com/users/{id}".to_string(),
        headers: Default::default(),
        timeout_ms: 4000,
        ttl_ms: Some(5 * 60 * 1000),
        cache_key_template: None,
    };

    let mut providers: Vec<Arc<dyn EnrichmentProvider>> = Vec::new();
    match ListProvider::new(prefectures) {
        Ok(provider) => providers.push(Arc::new(provider)),
        Err(e) => tracing::warn!("Skipping default provider prefectures: {}", e),
    }
    match HttpGetProvider::new(user) {
        Ok(provider) => providers.push(Arc::new(provider)),
        Err(e) => tracing::warn!("Skipping default provider jsonplaceholder-user: {}", e),
    }
    providers
}

pub(crate) fn millis(ms: Option<u64>) -> Option<Duration> {
    ms.map(Duration::from_millis)
}

pub(crate) fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

pub(crate) fn map_send_error(error: reqwest::Error, timeout: Duration) -> ProviderError {
    if error.is_timeout() {
        ProviderError::Timeout {
            timeout_ms: timeout.as_millis() as u64,
        }
    } else {
        ProviderError::Request(error.to_string())
    }
}

/// JSON when the response says so, text otherwise. Non-2xx becomes `http_<status>`.
pub(crate) async fn decode_response(
    response: reqwest::Response,
    timeout: Duration,
) -> ProviderResult<Value> {
    let status = response.status();
    if !status.is_success() {
        return Err(ProviderError::Http {
            status: status.as_u16(),
        });
    }
    let is_json = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|ct| ct.to_str().ok())
        .is_some_and(|ct| ct.contains("application/json"));
    if is_json {
        response
            .json::<Value>()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))
    } else {
        response
            .text()
            .await
            .map(Value::String)
            .map_err(|e| map_send_error(e, timeout))
    }
}

pub(crate) fn build_client(id: &str) -> ProviderResult<reqwest::Client> {
    reqwest::Client::builder()
        .build()
        .map_err(|e| ProviderError::InvalidDefinition(format!("{}: {}", id, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_definition_tagged_by_type() {
        let def = ProviderDefinition::from_value(json!({
            "type": "httpGet",
            "id": "geo",
            "urlTemplate": "https://geo.test/{ip}",
            "ttlMs": 1000
        }))
        .unwrap();
        assert_eq!(def.id(), "geo");
        assert!(matches!(def, ProviderDefinition::HttpGet(_)));

        let provider = def.build().unwrap();
        assert_eq!(provider.ttl(), Some(Duration::from_millis(1000)));
    }

    #[test]
    fn test_unknown_definition_type_rejected() {
        let err = ProviderDefinition::from_value(json!({"type": "graphql", "id": "x"}))
            .unwrap_err();
        assert_eq!(err.code(), "invalid_provider_definition");
    }

    #[test]
    fn test_empty_id_rejected() {
        let def = ProviderDefinition::from_value(json!({"type": "list", "id": " "})).unwrap();
        assert!(matches!(def.build(), Err(ProviderError::InvalidDefinition(_))));
    }

    #[test]
    fn test_default_providers() {
        let ids: Vec<String> = default_providers()
            .iter()
            .map(|p| p.id().to_string())
            .collect();
        assert_eq!(ids, vec!["prefectures", "jsonplaceholder-user"]);
    }
}
