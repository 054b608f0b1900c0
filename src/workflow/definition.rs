use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strum::Display;

use super::engine::WorkflowError;

/// Logic id that re-injects the event through the loopback input instead of calling
/// a provider.
pub const LOOPBACK_LOGIC_ID: &str = "loopback";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Empty means "consume the input channel".
    #[serde(default)]
    pub source_topics: Vec<String>,
    #[serde(default)]
    pub accept_all_inputs: bool,
    #[serde(default)]
    pub steps: Vec<StepDefinition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_topic: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<OutputDefinition>,
    /// Deprecated; prefer a `loopback` entry in `outputs`.
    #[serde(default)]
    pub loopback_to_input: bool,
}

fn default_enabled() -> bool {
    true
}

impl WorkflowDefinition {
    pub fn new(id: &str, steps: Vec<StepDefinition>) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            enabled: true,
            description: None,
            source_topics: Vec::new(),
            accept_all_inputs: false,
            steps,
            output_topic: None,
            outputs: Vec::new(),
            loopback_to_input: false,
        }
    }

    pub fn with_source_topics(mut self, topics: &[&str]) -> Self {
        self.source_topics = topics.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn with_outputs(mut self, outputs: Vec<OutputDefinition>) -> Self {
        self.outputs = outputs;
        self
    }

    /// Rejects definitions that could never run.
    pub fn validate(&self) -> Result<(), WorkflowError> {
        if self.id.trim().is_empty() {
            return Err(WorkflowError::InvalidDefinition(
                "workflow id must not be empty".to_string(),
            ));
        }
        for (index, step) in self.steps.iter().enumerate() {
            step.validate().map_err(|message| WorkflowError::InvalidStep {
                workflow_id: self.id.clone(),
                index,
                message,
            })?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum OutputKind {
    Topic,
    Loopback,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputDefinition {
    #[serde(rename = "type")]
    pub kind: OutputKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
}

impl OutputDefinition {
    pub fn topic(topic: &str) -> Self {
        Self {
            kind: OutputKind::Topic,
            topic: Some(topic.to_string()),
        }
    }

    pub fn loopback() -> Self {
        Self {
            kind: OutputKind::Loopback,
            topic: None,
        }
    }
}

/// One pipeline step, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum StepDefinition {
    FilterEquals {
        field: String,
        #[serde(default)]
        value: Value,
    },
    /// `to: from` pairs; the result replaces the payload.
    MapFields { mapping: BTreeMap<String, String> },
    Debounce { ms: u64 },
    Throttle { ms: u64 },
    Delay { ms: u64 },
    AggregateCount(AggregateCountStep),
    Enrich(EnrichStep),
    Logic(EnrichStep),
    SetTopic { topic: String },
    MergeWithTopics { topics: Vec<String> },
    RaceTopics {
        topics: Vec<String>,
        #[serde(default, rename = "windowMs")]
        window_ms: Option<u64>,
    },
    TapLog {
        #[serde(default)]
        label: Option<String>,
    },
    Branch(BranchStep),
}

impl StepDefinition {
    pub fn kind(&self) -> &'static str {
        match self {
            StepDefinition::FilterEquals { .. } => "filterEquals",
            StepDefinition::MapFields { .. } => "mapFields",
            StepDefinition::Debounce { .. } => "debounce",
            StepDefinition::Throttle { .. } => "throttle",
            StepDefinition::Delay { .. } => "delay",
            StepDefinition::AggregateCount(_) => "aggregateCount",
            StepDefinition::Enrich(_) => "enrich",
            StepDefinition::Logic(_) => "logic",
            StepDefinition::SetTopic { .. } => "setTopic",
            StepDefinition::MergeWithTopics { .. } => "mergeWithTopics",
            StepDefinition::RaceTopics { .. } => "raceTopics",
            StepDefinition::TapLog { .. } => "tapLog",
            StepDefinition::Branch(_) => "branch",
        }
    }

    fn validate(&self) -> Result<(), String> {
        match self {
            StepDefinition::Debounce { ms }
            | StepDefinition::Throttle { ms }
            | StepDefinition::Delay { ms }
                if *ms == 0 =>
            {
                Err(format!("{} requires ms > 0", self.kind()))
            }
            StepDefinition::AggregateCount(step) if step.window_ms == 0 => {
                Err("aggregateCount requires windowMs > 0".to_string())
            }
            StepDefinition::Enrich(step) | StepDefinition::Logic(step) => {
                if step.provider_id().is_none() {
                    return Err(format!("{} requires logicId or sourceId", self.kind()));
                }
                if step.concurrency == Some(0) {
                    return Err(format!("{} requires concurrency >= 1", self.kind()));
                }
                Ok(())
            }
            StepDefinition::FilterEquals { field, .. } if field.is_empty() => {
                Err("filterEquals requires a field".to_string())
            }
            StepDefinition::Branch(step) if step.branches.iter().any(|b| b.when.field.is_empty()) => {
                Err("branch conditions require a field".to_string())
            }
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateCountStep {
    pub window_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_topic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum OnError {
    Skip,
    Pass,
    #[default]
    SetError,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrichStep {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logic_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
    /// String values are dotted paths into the event; anything else is passed as is.
    #[serde(default)]
    pub params: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_field: Option<String>,
    #[serde(default)]
    pub on_error: OnError,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_ttl_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<usize>,
}

impl EnrichStep {
    pub fn new(provider_id: &str) -> Self {
        Self {
            logic_id: Some(provider_id.to_string()),
            ..Self::default()
        }
    }

    pub fn provider_id(&self) -> Option<&str> {
        self.logic_id
            .as_deref()
            .or(self.source_id.as_deref())
            .filter(|id| !id.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchCondition {
    pub field: String,
    #[serde(default)]
    pub equals: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchArm {
    pub when: BranchCondition,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub set: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_topic: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchElse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub set: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_topic: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BranchStep {
    #[serde(default)]
    pub branches: Vec<BranchArm>,
    #[serde(default, rename = "else", skip_serializing_if = "Option::is_none")]
    pub otherwise: Option<BranchElse>,
}
