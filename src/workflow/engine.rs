use std::{collections::HashSet, sync::Arc};

use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, instrument, trace};

use super::{
    definition::{OutputDefinition, OutputKind, WorkflowDefinition},
    steps::{apply_step, PipelineContext},
};
use crate::{
    config::EngineConfig,
    enrichment::EnrichmentRegistry,
    event::{
        model::{Event, META_WORKFLOW_ID},
        stream::merge,
        EventBus, EventStream, Subscription,
    },
};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum WorkflowError {
    #[error("Workflow not found: {0}")]
    NotFound(String),
    #[error("Invalid workflow: {0}")]
    InvalidDefinition(String),
    #[error("Invalid step #{index} in workflow {workflow_id}: {message}")]
    InvalidStep {
        workflow_id: String,
        index: usize,
        message: String,
    },
}

impl WorkflowError {
    pub fn code(&self) -> &'static str {
        match self {
            WorkflowError::NotFound(_) => "workflow_not_found",
            WorkflowError::InvalidDefinition(_) => "invalid_workflow",
            WorkflowError::InvalidStep { .. } => "invalid_step",
        }
    }
}

pub type WorkflowResult<T> = Result<T, WorkflowError>;

/// Receives each resolved output. The definition is `None` on the legacy single-output
/// path and for branch emissions.
pub type OutputFn = Arc<dyn Fn(Event, Option<OutputDefinition>) + Send + Sync>;
pub type LoopbackFn = Arc<dyn Fn(Event) + Send + Sync>;
pub type LifecycleFn = Arc<dyn Fn(LifecycleEvent) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum LifecycleEvent {
    WorkflowUpserted { workflow: WorkflowDefinition },
    WorkflowRemoved { id: String },
    WorkflowEnabled { id: String, enabled: bool },
}

/// Where pipeline results go.
#[derive(Clone)]
pub struct WorkflowSinks {
    pub on_output: OutputFn,
    pub on_loopback: LoopbackFn,
    pub on_lifecycle: Option<LifecycleFn>,
}

impl WorkflowSinks {
    pub fn new(on_output: OutputFn, on_loopback: LoopbackFn) -> Self {
        Self {
            on_output,
            on_loopback,
            on_lifecycle: None,
        }
    }

    pub fn with_lifecycle(mut self, on_lifecycle: LifecycleFn) -> Self {
        self.on_lifecycle = Some(on_lifecycle);
        self
    }

    fn lifecycle(&self, event: LifecycleEvent) {
        if let Some(on_lifecycle) = &self.on_lifecycle {
            on_lifecycle(event);
        }
    }
}

struct WorkflowEntry {
    def: WorkflowDefinition,
    /// `None` while disabled.
    subscription: Option<Subscription>,
}

/// Builds one reactive pipeline per enabled workflow definition.
///
/// Every upsert tears the previous pipeline down completely before building the new
/// one; pipelines are never patched in place.
pub struct WorkflowEngine {
    bus: EventBus,
    registry: Arc<EnrichmentRegistry>,
    config: EngineConfig,
    sinks: WorkflowSinks,
    workflows: DashMap<String, WorkflowEntry>,
}

impl WorkflowEngine {
    pub fn new(
        bus: EventBus,
        registry: Arc<EnrichmentRegistry>,
        config: EngineConfig,
        sinks: WorkflowSinks,
    ) -> Self {
        Self {
            bus,
            registry,
            config,
            sinks,
            workflows: DashMap::new(),
        }
    }

    #[instrument(level = "debug", skip(self, def), fields(id = %def.id))]
    pub fn upsert(&self, def: WorkflowDefinition) -> WorkflowResult<()> {
        def.validate()?;
        self.teardown(&def.id);

        let subscription = if def.enabled {
            Some(self.build(&def))
        } else {
            None
        };
        info!(
            "Workflow {} upserted ({} steps, enabled={})",
            def.id,
            def.steps.len(),
            def.enabled
        );
        self.workflows.insert(
            def.id.clone(),
            WorkflowEntry {
                def: def.clone(),
                subscription,
            },
        );
        self.sinks
            .lifecycle(LifecycleEvent::WorkflowUpserted { workflow: def });
        Ok(())
    }

    #[instrument(level = "debug", skip(self))]
    pub fn remove(&self, id: &str) -> WorkflowResult<()> {
        if !self.teardown(id) {
            return Err(WorkflowError::NotFound(id.to_string()));
        }
        info!("Workflow {} removed", id);
        self.sinks.lifecycle(LifecycleEvent::WorkflowRemoved {
            id: id.to_string(),
        });
        Ok(())
    }

    #[instrument(level = "debug", skip(self))]
    pub fn enable(&self, id: &str, enabled: bool) -> WorkflowResult<()> {
        let mut def = self
            .get(id)
            .ok_or_else(|| WorkflowError::NotFound(id.to_string()))?;
        def.enabled = enabled;
        self.upsert(def)?;
        self.sinks.lifecycle(LifecycleEvent::WorkflowEnabled {
            id: id.to_string(),
            enabled,
        });
        Ok(())
    }

    pub fn list(&self) -> Vec<WorkflowDefinition> {
        let mut defs: Vec<WorkflowDefinition> = self
            .workflows
            .iter()
            .map(|entry| entry.def.clone())
            .collect();
        defs.sort_by(|a, b| a.id.cmp(&b.id));
        defs
    }

    pub fn get(&self, id: &str) -> Option<WorkflowDefinition> {
        self.workflows.get(id).map(|entry| entry.def.clone())
    }

    pub fn is_running(&self, id: &str) -> bool {
        self.workflows
            .get(id)
            .is_some_and(|entry| entry.subscription.is_some())
    }

    /// Unsubscribes every pipeline. Definitions stay listed as they were.
    pub fn shutdown(&self) {
        for mut entry in self.workflows.iter_mut() {
            if let Some(subscription) = entry.subscription.take() {
                subscription.unsubscribe();
            }
        }
        info!("Workflow engine shut down");
    }

    /// Returns whether a definition was present.
    fn teardown(&self, id: &str) -> bool {
        match self.workflows.remove(id) {
            Some((_, entry)) => {
                if let Some(subscription) = entry.subscription {
                    debug!("Tearing down workflow {}", id);
                    subscription.unsubscribe();
                }
                true
            }
            None => false,
        }
    }

    fn build(&self, def: &WorkflowDefinition) -> Subscription {
        let ctx = PipelineContext {
            workflow_id: def.id.clone(),
            workflow_name: if def.name.is_empty() {
                def.id.clone()
            } else {
                def.name.clone()
            },
            bus: self.bus.clone(),
            registry: self.registry.clone(),
            sinks: self.sinks.clone(),
            default_concurrency: self.config.default_concurrency,
        };

        let id = def.id.clone();
        let cap = self.config.max_visited;
        let mut stream = self.source_stream(def).filter_map(move |event| {
            if event.has_visited(&id) {
                trace!("Loop guard dropped {} for workflow {}", event.id, id);
                return None;
            }
            Some(event.mark_visited(&id, cap))
        });
        for step in &def.steps {
            stream = apply_step(stream, step, &ctx);
        }

        let dispatcher = OutputDispatcher {
            def: Arc::new(def.clone()),
            default_topic: self.config.default_output_topic.clone(),
            sinks: self.sinks.clone(),
        };
        stream.subscribe(move |event| dispatcher.dispatch(event))
    }

    /// Source topics (minus events other workflows own) plus raw inputs bound to this
    /// workflow on other topics; or the input channel when no topics are given.
    fn source_stream(&self, def: &WorkflowDefinition) -> EventStream {
        let owner = def.id.clone();
        let unclaimed_or_mine =
            move |event: &Event| event.claimed_by().map_or(true, |id| id == owner);

        if def.source_topics.is_empty() {
            let inputs = self.bus.input_stream();
            return if def.accept_all_inputs {
                inputs
            } else {
                inputs.filter(unclaimed_or_mine)
            };
        }

        let topics = self
            .bus
            .merge_topics(&def.source_topics)
            .filter(unclaimed_or_mine);
        let covered: HashSet<String> = def.source_topics.iter().cloned().collect();
        let owner = def.id.clone();
        let bound = self.bus.input_stream().filter(move |event| {
            event.claimed_by() == Some(owner.as_str()) && !covered.contains(&event.topic)
        });
        merge(vec![topics, bound])
    }
}

impl Drop for WorkflowEngine {
    fn drop(&mut self) {
        for entry in self.workflows.iter() {
            if let Some(subscription) = &entry.subscription {
                subscription.unsubscribe();
            }
        }
    }
}

struct OutputDispatcher {
    def: Arc<WorkflowDefinition>,
    default_topic: String,
    sinks: WorkflowSinks,
}

impl OutputDispatcher {
    fn base(&self, event: Event) -> Event {
        let mut out = event.derive();
        if out.topic.is_empty() {
            out.topic = self
                .def
                .output_topic
                .clone()
                .unwrap_or_else(|| self.default_topic.clone());
        }
        if out.event_type.is_none() {
            out.event_type = Some("workflow_output".to_string());
        }
        out.meta.insert(
            META_WORKFLOW_ID.to_string(),
            Value::String(self.def.id.clone()),
        );
        out
    }

    fn dispatch(&self, event: Event) {
        let base = self.base(event);
        if self.def.outputs.is_empty() {
            (self.sinks.on_output)(base.clone(), None);
            if self.def.loopback_to_input {
                (self.sinks.on_loopback)(base.derive());
            }
            return;
        }
        for output in &self.def.outputs {
            let mut derived = base.derive();
            if let Some(topic) = &output.topic {
                derived.topic = topic.clone();
            }
            match output.kind {
                OutputKind::Topic => (self.sinks.on_output)(derived, Some(output.clone())),
                OutputKind::Loopback => (self.sinks.on_loopback)(derived),
            }
        }
    }
}
