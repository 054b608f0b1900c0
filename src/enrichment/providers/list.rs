use std::{collections::HashMap, sync::RwLock, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::{build_client, decode_response, millis, DEFAULT_TIMEOUT_MS};
use crate::{
    enrichment::{
        template::param_string,
        types::{EnrichmentProvider, Params, ProviderError, ProviderResult},
    },
    event::model::get_path,
    guard::{read, write},
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListConfig {
    pub id: String,
    /// Object (`key -> value`) or array of records.
    #[serde(default)]
    pub list: Option<Value>,
    #[serde(default)]
    pub list_url: Option<String>,
    /// Dotted path to the list inside the remote document.
    #[serde(default)]
    pub list_path: Option<String>,
    #[serde(default)]
    pub key_field: Option<String>,
    #[serde(default)]
    pub value_field: Option<String>,
    #[serde(default = "default_key_param")]
    pub key_param: String,
    #[serde(default)]
    pub ttl_ms: Option<u64>,
    #[serde(default)]
    pub refresh_interval_ms: Option<u64>,
}

impl Default for ListConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            list: None,
            list_url: None,
            list_path: None,
            key_field: None,
            value_field: None,
            key_param: default_key_param(),
            ttl_ms: None,
            refresh_interval_ms: None,
        }
    }
}

fn default_key_param() -> String {
    "key".to_string()
}

/// In-memory key → value lookup, optionally reloaded from `listUrl`.
pub struct ListProvider {
    config: ListConfig,
    entries: RwLock<HashMap<String, Value>>,
    client: reqwest::Client,
}

impl ListProvider {
    pub fn new(config: ListConfig) -> ProviderResult<Self> {
        if let Some(url) = &config.list_url {
            url::Url::parse(url).map_err(|e| {
                ProviderError::InvalidDefinition(format!("{}: listUrl {}", config.id, e))
            })?;
        }
        let client = build_client(&config.id)?;
        let provider = Self {
            entries: RwLock::new(HashMap::new()),
            client,
            config,
        };
        if let Some(list) = provider.config.list.clone() {
            provider.set_list(&list);
        }
        Ok(provider)
    }

    pub fn len(&self) -> usize {
        read(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replaces the whole map. Array items without a key are skipped.
    pub fn set_list(&self, list: &Value) {
        let mut entries = HashMap::new();
        match list {
            Value::Array(items) => {
                let key_field = self.config.key_field.as_deref().unwrap_or("id");
                for item in items {
                    let Some(key) = item.get(key_field).filter(|key| !key.is_null()) else {
                        continue;
                    };
                    let value = match &self.config.value_field {
                        Some(field) => item.get(field).cloned().unwrap_or(Value::Null),
                        None => item.clone(),
                    };
                    entries.insert(param_string(key), value);
                }
            }
            Value::Object(map) => {
                for (key, value) in map {
                    entries.insert(key.clone(), value.clone());
                }
            }
            _ => {}
        }
        debug!("List provider {} loaded {} entries", self.config.id, entries.len());
        *write(&self.entries) = entries;
    }

    fn lookup_key<'a>(&self, params: &'a Params) -> Option<&'a Value> {
        params
            .get(&self.config.key_param)
            .or_else(|| params.values().next())
            .filter(|key| !key.is_null())
    }
}

#[async_trait]
impl EnrichmentProvider for ListProvider {
    fn id(&self) -> &str {
        &self.config.id
    }

    fn ttl(&self) -> Option<Duration> {
        millis(self.config.ttl_ms)
    }

    fn refresh_interval(&self) -> Option<Duration> {
        millis(self.config.refresh_interval_ms)
    }

    fn supports_refresh(&self) -> bool {
        self.config.list_url.is_some()
    }

    async fn init(&self) -> ProviderResult<()> {
        if self.config.list_url.is_some() {
            self.refresh().await?;
        }
        Ok(())
    }

    async fn refresh(&self) -> ProviderResult<()> {
        let Some(url) = &self.config.list_url else {
            return Ok(());
        };
        let timeout = Duration::from_millis(DEFAULT_TIMEOUT_MS);
        let response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| super::map_send_error(e, timeout))?;
        let document = decode_response(response, timeout).await?;
        let list = match &self.config.list_path {
            Some(path) => get_path(&document, path).cloned().unwrap_or(Value::Null),
            None => document,
        };
        self.set_list(&list);
        Ok(())
    }

    async fn resolve(&self, params: &Params) -> ProviderResult<Value> {
        let Some(key) = self.lookup_key(params) else {
            return Ok(Value::Null);
        };
        Ok(read(&self.entries)
            .get(&param_string(key))
            .cloned()
            .unwrap_or(Value::Null))
    }
}
