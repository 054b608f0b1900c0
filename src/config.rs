use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{collections::HashMap, fs::File, io::BufReader, path::Path, time::Duration};

use crate::{
    event::QueuePolicy, input::InputDefinition, workflow::WorkflowDefinition, Error,
    RelayResult,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConfig {
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,

    /// Capacity of the live update broadcast channel.
    #[serde(default = "default_live_buffer_size")]
    pub live_buffer_size: usize,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub enrichment: EnrichmentConfig,

    #[serde(default)]
    pub bus: BusConfig,

    /// Seed definitions applied by `System::apply_definitions`.
    #[serde(default)]
    pub inputs: Vec<InputDefinition>,

    #[serde(default)]
    pub workflows: Vec<WorkflowDefinition>,

    /// Provider definitions, kept raw so one bad entry is reported on its own.
    #[serde(default)]
    pub providers: Vec<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    /// Upper bound for the `_wfVisited` loop guard list.
    #[serde(default = "default_max_visited")]
    pub max_visited: usize,

    #[serde(default = "default_output_topic")]
    pub default_output_topic: String,

    /// Concurrency for enrich/logic steps that do not set one.
    #[serde(default = "default_concurrency")]
    pub default_concurrency: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_visited: default_max_visited(),
            default_output_topic: default_output_topic(),
            default_concurrency: default_concurrency(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnrichmentConfig {
    #[serde(default = "default_cache_ttl", with = "duration_ms")]
    pub default_ttl: Duration,

    /// Registers the built-in `prefectures` and `jsonplaceholder-user` providers.
    #[serde(default = "default_true")]
    pub builtin_providers: bool,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            default_ttl: default_cache_ttl(),
            builtin_providers: true,
        }
    }
}

/// Per-channel topic policies. Topics not listed dispatch synchronously.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct BusConfig {
    #[serde(default)]
    pub input: HashMap<String, QueuePolicy>,
    #[serde(default)]
    pub output: HashMap<String, QueuePolicy>,
    #[serde(default)]
    pub topics: HashMap<String, QueuePolicy>,
    #[serde(default)]
    pub metrics: HashMap<String, QueuePolicy>,
}

pub fn from_file<T: for<'de> Deserialize<'de>, P: AsRef<Path>>(path: P) -> RelayResult<T> {
    let file = File::open(path)
        .map_err(|e| Error::Config(format!("Failed to open config file: {}", e)))?;
    let reader = BufReader::new(file);
    let config = serde_json::from_reader(reader)
        .map_err(|e| Error::Config(format!("Failed to parse config file: {}", e)))?;
    Ok(config)
}

pub fn from_str<T: for<'de> Deserialize<'de>>(s: &str) -> RelayResult<T> {
    let config = serde_json::from_str(s)
        .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
    Ok(config)
}

fn default_history_capacity() -> usize {
    1000
}
fn default_live_buffer_size() -> usize {
    256
}
fn default_max_visited() -> usize {
    32
}
fn default_output_topic() -> String {
    "outputs/default".to_string()
}
fn default_concurrency() -> usize {
    4
}
fn default_cache_ttl() -> Duration {
    Duration::from_secs(60)
}
fn default_true() -> bool {
    true
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            history_capacity: default_history_capacity(),
            live_buffer_size: default_live_buffer_size(),
            engine: EngineConfig::default(),
            enrichment: EnrichmentConfig::default(),
            bus: BusConfig::default(),
            inputs: Vec::new(),
            workflows: Vec::new(),
            providers: Vec::new(),
        }
    }
}

impl SystemConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> RelayResult<Self> {
        from_file(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{DispatchMode, DropPolicy};
    use std::io::Write;

    #[test]
    fn test_defaults_from_empty_document() {
        let config: SystemConfig = from_str("{}").unwrap();
        assert_eq!(config.history_capacity, 1000);
        assert_eq!(config.live_buffer_size, 256);
        assert_eq!(config.engine, EngineConfig::default());
        assert_eq!(config.enrichment.default_ttl, Duration::from_secs(60));
        assert!(config.enrichment.builtin_providers);
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "history_capacity": 10,
                "enrichment": {{ "default_ttl": 500 }},
                "bus": {{ "topics": {{ "logs/app": {{ "mode": "queue", "maxSize": 2, "drop": "newest" }} }} }},
                "inputs": [{{ "id": "tick", "type": "timer", "config": {{ "intervalMs": 10 }} }}],
                "workflows": [{{ "id": "wf", "steps": [] }}]
            }}"#
        )
        .unwrap();

        let config = SystemConfig::from_file(file.path()).unwrap();
        assert_eq!(config.history_capacity, 10);
        assert_eq!(config.enrichment.default_ttl, Duration::from_millis(500));
        let policy = &config.bus.topics["logs/app"];
        assert_eq!(policy.mode, DispatchMode::Queue);
        assert_eq!(policy.drop, DropPolicy::DropNewest);
        assert_eq!(config.inputs[0].id, "tick");
        assert_eq!(config.workflows[0].id, "wf");
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let err = SystemConfig::from_file("/nonexistent/relayflow.json").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
