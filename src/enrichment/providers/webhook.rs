use std::{collections::BTreeMap, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{Display, EnumString};
use tracing::debug;

use super::{build_client, decode_response, default_timeout_ms, map_send_error, millis};
use crate::enrichment::{
    template::{append_query, expand_url},
    types::{EnrichmentProvider, Params, ProviderError, ProviderResult},
};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE", ascii_case_insensitive)]
pub enum HttpMethod {
    Get,
    #[default]
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    /// Methods that carry parameters in the query string instead of a body.
    pub fn uses_query(&self) -> bool {
        matches!(self, HttpMethod::Get | HttpMethod::Delete)
    }

    fn as_reqwest(&self) -> reqwest::Method {
        match self {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Patch => reqwest::Method::PATCH,
            HttpMethod::Delete => reqwest::Method::DELETE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookConfig {
    pub id: String,
    pub url: String,
    #[serde(default)]
    pub method: HttpMethod,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub ttl_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PreparedRequest {
    pub url: String,
    pub body: Option<String>,
    pub headers: BTreeMap<String, String>,
}

/// Calls a user supplied endpoint with the step parameters.
pub struct WebhookProvider {
    config: WebhookConfig,
    client: reqwest::Client,
}

impl WebhookProvider {
    pub fn new(config: WebhookConfig) -> ProviderResult<Self> {
        if config.url.trim().is_empty() {
            return Err(ProviderError::InvalidDefinition(format!(
                "{}: url is required",
                config.id
            )));
        }
        let client = build_client(&config.id)?;
        Ok(Self { config, client })
    }

    pub fn prepare(&self, params: &Params) -> PreparedRequest {
        let expanded = expand_url(&self.config.url, params);
        let mut headers = self.config.headers.clone();
        if self.config.method.uses_query() {
            return PreparedRequest {
                url: append_query(&expanded.url, &expanded.remaining),
                body: None,
                headers,
            };
        }
        let has_content_type = headers
            .keys()
            .any(|name| name.eq_ignore_ascii_case("content-type"));
        if !has_content_type {
            headers.insert("Content-Type".to_string(), "application/json".to_string());
        }
        PreparedRequest {
            url: expanded.url,
            body: Some(Value::Object(expanded.remaining).to_string()),
            headers,
        }
    }
}

#[async_trait]
impl EnrichmentProvider for WebhookProvider {
    fn id(&self) -> &str {
        &self.config.id
    }

    fn ttl(&self) -> Option<Duration> {
        millis(self.config.ttl_ms)
    }

    fn cache_key(&self, params: &Params) -> Option<String> {
        let prepared = self.prepare(params);
        Some(format!(
            "{}:{}:{}",
            self.config.method,
            prepared.url,
            prepared.body.unwrap_or_default()
        ))
    }

    async fn resolve(&self, params: &Params) -> ProviderResult<Value> {
        let prepared = self.prepare(params);
        debug!("{} {} {}", self.config.id, self.config.method, prepared.url);
        let timeout = Duration::from_millis(self.config.timeout_ms);
        let mut request = self
            .client
            .request(self.config.method.as_reqwest(), &prepared.url)
            .timeout(timeout);
        for (name, value) in &prepared.headers {
            request = request.header(name, value);
        }
        if let Some(body) = prepared.body {
            request = request.body(body);
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

    fn provider(method: HttpMethod, headers: BTreeMap<String, String>) -> WebhookProvider {
        WebhookProvider::new(WebhookConfig {
            id: "score".to_string(),
            url: "https://hooks.test/score/{user}".to_string(),
            method,
            headers,
            timeout_ms: 100,
            ttl_ms: None,
        })
        .unwrap()
    }

    #[test]
    fn test_post_sends_json_body() {
        let prepared = provider(HttpMethod::Post, BTreeMap::new())
            .prepare(&params(json!({"user": "u1", "amount": 5})));
        assert_eq!(prepared.url, "https://hooks.test/score/u1");
        assert_eq!(prepared.body.as_deref(), Some(r#"{"amount":5}"#));
        assert_eq!(
            prepared.headers.get("Content-Type").map(String::as_str),
            Some("application/json")
        );
    }

    #[test]
    fn test_existing_content_type_kept() {
        let mut headers = BTreeMap::new();
        headers.insert("content-type".to_string(), "text/plain".to_string());
        let prepared = provider(HttpMethod::Put, headers).prepare(&params(json!({"user": "u1"})));
        assert_eq!(prepared.headers.len(), 1);
        assert_eq!(prepared.body.as_deref(), Some("{}"));
    }

    #[test]
    fn test_get_uses_query_string() {
        let p = params(json!({"user": "u1", "amount": 5}));
        let webhook = provider(HttpMethod::Get, BTreeMap::new());
        let prepared = webhook.prepare(&p);
        assert_eq!(prepared.url, "https://hooks.test/score/u1?amount=5");
        assert_eq!(prepared.body, None);
        assert_eq!(
            webhook.cache_key(&p).as_deref(),
            Some("GET:https://hooks.test/score/u1?amount=5:")
        );
    }

    #[test]
    fn test_method_parsing() {
        let config: WebhookConfig =
            serde_json::from_value(json!({"id": "x", "url": "http://h", "method": "DELETE"}))
                .unwrap();
        assert_eq!(config.method, HttpMethod::Delete);
        let default: WebhookConfig =
            serde_json::from_value(json!({"id": "x", "url": "http://h"})).unwrap();
        assert_eq!(default.method, HttpMethod::Post);
    }
}
