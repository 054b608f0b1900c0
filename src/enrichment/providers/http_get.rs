use std::{collections::BTreeMap, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::{build_client, decode_response, default_timeout_ms, map_send_error, millis};
use crate::enrichment::{
    template::{append_query, apply_template, expand_url},
    types::{EnrichmentProvider, Params, ProviderError, ProviderResult},
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpGetConfig {
    pub id: String,
    pub url_template: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub ttl_ms: Option<u64>,
    #[serde(default)]
    pub cache_key_template: Option<String>,
}

/// GET lookup against a URL template.
pub struct HttpGetProvider {
    config: HttpGetConfig,
    client: reqwest::Client,
}

impl HttpGetProvider {
    pub fn new(config: HttpGetConfig) -> ProviderResult<Self> {
        if config.url_template.trim().is_empty() {
            return Err(ProviderError::InvalidDefinition(format!(
                "{}: urlTemplate is required",
                config.id
            )));
        }
        let client = build_client(&config.id)?;
        Ok(Self { config, client })
    }

    pub fn build_url(&self, params: &Params) -> String {
        let expanded = expand_url(&self.config.url_template, params);
        append_query(&expanded.url, &expanded.remaining)
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.config.timeout_ms)
    }
}

#[async_trait]
impl EnrichmentProvider for HttpGetProvider {
    fn id(&self) -> &str {
        &self.config.id
    }

    fn ttl(&self) -> Option<Duration> {
        millis(self.config.ttl_ms)
    }

    fn cache_key(&self, params: &Params) -> Option<String> {
        Some(match &self.config.cache_key_template {
            Some(template) => apply_template(template, params),
            None => self.build_url(params),
        })
    }

    async fn resolve(&self, params: &Params) -> ProviderResult<Value> {
        let url = self.build_url(params);
        debug!("{} GET {}", self.config.id, url);
        let timeout = self.timeout();
        let mut request = self.client.get(&url).timeout(timeout);
        for (name, value) in &self.config.headers {
            request = request.header(name, value);
        }
        let response = request
            .send()
            .await
            .map_err(|e| map_send_error(e, timeout))?;
        decode_response(response, timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(value: Value) -> Params {
        match value {
            Value::Object(map) => map,
            _ => Params::new(),
        }
    }

    fn provider(cache_key_template: Option<&str>) -> HttpGetProvider {
        HttpGetProvider::new(HttpGetConfig {
            id: "users".to_string(),
            url_template: "https://api.test/users/{id}".to_string(),
            headers: BTreeMap::new(),
            timeout_ms: 100,
            ttl_ms: None,
            cache_key_template: cache_key_template.map(str::to_string),
        })
        .unwrap()
    }

    #[test]
    fn test_build_url_with_query() {
        let url = provider(None).build_url(&params(json!({"id": 3, "fields": "name"})));
        assert_eq!(url, "https://api.test/users/3?fields=name");
    }

    #[test]
    fn test_cache_key_defaults_to_url() {
        let p = params(json!({"id": 3}));
        assert_eq!(
            provider(None).cache_key(&p).as_deref(),
            Some("https://api.test/users/3")
        );
        assert_eq!(provider(Some("user-{id}")).cache_key(&p).as_deref(), Some("user-3"));
    }

    #[test]
    fn test_url_template_required() {
        let result = HttpGetProvider::new(HttpGetConfig {
            id: "broken".to_string(),
            url_template: "".to_string(),
            headers: BTreeMap::new(),
            timeout_ms: 100,
            ttl_ms: None,
            cache_key_template: None,
        });
        assert!(matches!(result, Err(ProviderError::InvalidDefinition(_))));
    }
}
