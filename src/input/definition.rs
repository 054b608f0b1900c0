use std::path::PathBuf;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strum::{Display, EnumString};
use uuid::Uuid;

use super::{codec::Codec, manager::InputError};
use crate::event::model::{Event, Meta, META_INPUT_ID, META_INPUT_TYPE, META_WORKFLOW_ID};

pub const LOOPBACK_INPUT_ID: &str = "loopback";

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum InputType {
    Webhook,
    Udp,
    Tail,
    Timer,
    Loopback,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputDefinition {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub input_type: InputType,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    #[serde(default)]
    pub config: Value,
}

fn default_enabled() -> bool {
    true
}

impl InputDefinition {
    pub fn new(id: &str, input_type: InputType, config: Value) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            input_type,
            enabled: true,
            workflow_id: None,
            topic: None,
            source: None,
            event_type: None,
            config,
        }
    }

    pub fn loopback() -> Self {
        Self {
            name: "loopback".to_string(),
            ..Self::new(LOOPBACK_INPUT_ID, InputType::Loopback, Value::Object(Map::new()))
        }
    }

    /// Parses `config` for this input's type. Configuration errors surface here, at
    /// upsert time.
    pub fn parse_config(&self) -> Result<InputConfig, InputError> {
        let raw = match &self.config {
            Value::Null => Value::Object(Map::new()),
            other => other.clone(),
        };
        let invalid = |e: serde_json::Error| InputError::InvalidConfig {
            id: self.id.clone(),
            message: e.to_string(),
        };
        let config = match self.input_type {
            InputType::Webhook => {
                InputConfig::Webhook(serde_json::from_value(raw).map_err(invalid)?)
            }
            InputType::Udp => InputConfig::Udp(serde_json::from_value(raw).map_err(invalid)?),
            InputType::Tail => {
                let tail: TailInputConfig = serde_json::from_value(raw).map_err(invalid)?;
                if tail.path.is_none() && tail.dir.is_none() {
                    return Err(InputError::InvalidConfig {
                        id: self.id.clone(),
                        message: "tail input requires `path` or `dir`".to_string(),
                    });
                }
                InputConfig::Tail(tail)
            }
            InputType::Timer => {
                InputConfig::Timer(serde_json::from_value(raw).map_err(invalid)?)
            }
            InputType::Loopback => InputConfig::Loopback,
        };
        Ok(config)
    }

    /// Canonical event for a payload produced by this input. `extra` is merged last
    /// and may override the provenance keys.
    pub fn event(&self, payload: Value, extra: Meta) -> Event {
        let mut meta = Meta::new();
        if let Some(workflow_id) = &self.workflow_id {
            meta.insert(META_WORKFLOW_ID.to_string(), Value::String(workflow_id.clone()));
        }
        meta.insert(META_INPUT_ID.to_string(), Value::String(self.id.clone()));
        meta.insert(
            META_INPUT_TYPE.to_string(),
            Value::String(self.input_type.to_string()),
        );
        meta.extend(extra);

        Event {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            source: self
                .source
                .clone()
                .unwrap_or_else(|| format!("input:{}", self.id)),
            topic: self
                .topic
                .clone()
                .unwrap_or_else(|| format!("inputs/{}", self.id)),
            event_type: Some(self.event_type.clone().unwrap_or_else(|| "input".to_string())),
            payload,
            meta,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum InputConfig {
    Webhook(WebhookInputConfig),
    Udp(UdpInputConfig),
    Tail(TailInputConfig),
    Timer(TimerInputConfig),
    Loopback,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookInputConfig {
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub auth_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UdpInputConfig {
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default)]
    pub codec: Codec,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TailFrom {
    #[default]
    End,
    Start,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TailInputConfig {
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub dir: Option<PathBuf>,
    #[serde(default)]
    pub from: TailFrom,
    #[serde(default)]
    pub codec: Codec,
    #[serde(default)]
    pub poll_interval_ms: Option<u64>,
    #[serde(default)]
    pub max_backoff_ms: Option<u64>,
    #[serde(default = "default_watch")]
    pub watch: bool,
    #[serde(default)]
    pub patterns: Vec<String>,
    #[serde(default)]
    pub ignore_patterns: Option<Vec<String>>,
    #[serde(default)]
    pub scan_interval_ms: Option<u64>,
    #[serde(default)]
    pub scan_debounce_ms: Option<u64>,
}

fn default_watch() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerInputConfig {
    #[serde(default)]
    pub interval_ms: Option<i64>,
    #[serde(default)]
    pub emit_on_start: bool,
    #[serde(default)]
    pub payload: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_defaults() {
        let mut def = InputDefinition::new("sensor", InputType::Udp, json!({"port": 9000}));
        def.workflow_id = Some("wf-1".to_string());
        let event = def.event(json!("x"), Meta::new());

        assert_eq!(event.source, "input:sensor");
        assert_eq!(event.topic, "inputs/sensor");
        assert_eq!(event.event_type.as_deref(), Some("input"));
        assert_eq!(event.meta[META_WORKFLOW_ID], json!("wf-1"));
        assert_eq!(event.meta[META_INPUT_ID], json!("sensor"));
        assert_eq!(event.meta[META_INPUT_TYPE], json!("udp"));
        assert_eq!(event.claimed_by(), Some("wf-1"));
    }

    #[test]
    fn test_definition_overrides() {
        let def: InputDefinition = serde_json::from_value(json!({
            "id": "hook",
            "type": "webhook",
            "topic": "orders/new",
            "source": "shop",
            "eventType": "order"
        }))
        .unwrap();
        let event = def.event(json!({}), Meta::new());
        assert!(def.enabled);
        assert_eq!(event.topic, "orders/new");
        assert_eq!(event.source, "shop");
        assert_eq!(event.event_type.as_deref(), Some("order"));
    }

    #[test]
    fn test_config_errors() {
        let udp = InputDefinition::new("u", InputType::Udp, json!({"host": "127.0.0.1"}));
        let err = udp.parse_config().unwrap_err();
        assert_eq!(err.code(), "invalid_input_config");

        let tail = InputDefinition::new("t", InputType::Tail, json!({}));
        assert!(matches!(tail.parse_config(), Err(InputError::InvalidConfig { .. })));

        let timer = InputDefinition::new("tick", InputType::Timer, Value::Null);
        assert!(matches!(timer.parse_config(), Ok(InputConfig::Timer(_))));
    }
}
