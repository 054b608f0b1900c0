use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, info, instrument};

use crate::{
    config::{BusConfig, SystemConfig},
    enrichment::{default_providers, EnrichmentRegistry, ProviderDefinition},
    event::{Event, EventBus, Meta},
    history::EventHistory,
    input::{EmitFn, InputManager},
    workflow::{LifecycleEvent, OutputDefinition, WorkflowEngine, WorkflowSinks},
    Error, RelayResult,
};

/// What live-transport collaborators receive, in emission order.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "channel", content = "data", rename_all = "lowercase")]
pub enum LiveUpdate {
    Input(Event),
    Output(Event),
    Lifecycle(LifecycleEvent),
}

/// Owns one bus, the histories, the input manager, the workflow engine and the
/// enrichment registry, and wires their callbacks together.
pub struct System {
    config: SystemConfig,
    event_bus: EventBus,
    registry: Arc<EnrichmentRegistry>,
    inputs: Arc<InputManager>,
    engine: WorkflowEngine,
    input_history: Arc<EventHistory>,
    output_history: Arc<EventHistory>,
    emit: EmitFn,
    live_tx: broadcast::Sender<LiveUpdate>,
    shutdown_tx: broadcast::Sender<()>,
}

impl System {
    pub fn new(config: SystemConfig) -> RelayResult<Self> {
        let event_bus = EventBus::new();
        apply_bus_policies(&event_bus, &config.bus)?;

        let input_history = Arc::new(EventHistory::new(config.history_capacity)?);
        let output_history = Arc::new(EventHistory::new(config.history_capacity)?);
        let (live_tx, _) = broadcast::channel(config.live_buffer_size.max(1));
        let (shutdown_tx, _) = broadcast::channel(1);

        let emit: EmitFn = {
            let history = input_history.clone();
            let bus = event_bus.clone();
            let live = live_tx.clone();
            Arc::new(move |event: Event| {
                history.push(event.clone());
                bus.publish_input(event.clone());
                // No live subscribers is not an error.
                let _ = live.send(LiveUpdate::Input(event));
            })
        };
        let inputs = Arc::new(InputManager::new(emit.clone()));

        let on_output = {
            let history = output_history.clone();
            let bus = event_bus.clone();
            let live = live_tx.clone();
            Arc::new(move |event: Event, _: Option<OutputDefinition>| {
                history.push(event.clone());
                bus.publish_output(event.clone());
                let _ = live.send(LiveUpdate::Output(event));
            })
        };
        let on_loopback = {
            let inputs = inputs.clone();
            Arc::new(move |event: Event| {
                inputs.loopback(&event);
            })
        };
        let on_lifecycle = {
            let live = live_tx.clone();
            Arc::new(move |event: LifecycleEvent| {
                let _ = live.send(LiveUpdate::Lifecycle(event));
            })
        };

        let registry = Arc::new(EnrichmentRegistry::new(config.enrichment.default_ttl));
        if config.enrichment.builtin_providers {
            for provider in default_providers() {
                registry.register(provider);
            }
        }

        let engine = WorkflowEngine::new(
            event_bus.clone(),
            registry.clone(),
            config.engine.clone(),
            WorkflowSinks::new(on_output, on_loopback).with_lifecycle(on_lifecycle),
        );

        Ok(Self {
            config,
            event_bus,
            registry,
            inputs,
            engine,
            input_history,
            output_history,
            emit,
            live_tx,
            shutdown_tx,
        })
    }

    /// Applies the seed providers, workflows and inputs from the configuration, in
    /// that order, so no input fires before the workflows listening for it exist.
    /// Must run inside a Tokio runtime.
    #[instrument(level = "debug", skip(self))]
    pub async fn apply_definitions(&self) -> RelayResult<()> {
        for raw in self.config.providers.clone() {
            let definition = ProviderDefinition::from_value(raw)?;
            self.registry.install(definition).await?;
        }
        for workflow in self.config.workflows.clone() {
            self.engine.upsert(workflow)?;
        }
        for input in self.config.inputs.clone() {
            self.inputs.upsert(input)?;
        }
        info!(
            "Applied {} providers, {} workflows, {} inputs",
            self.config.providers.len(),
            self.config.workflows.len(),
            self.config.inputs.len()
        );
        Ok(())
    }

    pub async fn start(&self) {
        self.registry.start().await;
        info!("System started");
    }

    /// Stops inputs, tears down every pipeline and cancels provider refresh timers.
    #[instrument(level = "debug", skip(self))]
    pub async fn shutdown(&self) -> RelayResult<()> {
        self.inputs.shutdown();
        self.engine.shutdown();
        self.registry.stop();
        if self.shutdown_tx.send(()).is_err() {
            debug!("No shutdown listeners");
        }
        info!("System shut down");
        Ok(())
    }

    /// Manual ingestion: the event takes the same path as one produced by an input.
    pub fn ingest(
        &self,
        source: &str,
        topic: &str,
        event_type: Option<&str>,
        payload: Value,
        meta: Meta,
    ) -> RelayResult<Event> {
        if source.trim().is_empty() {
            return Err(Error::InvalidIngest("source is required".to_string()));
        }
        if topic.trim().is_empty() {
            return Err(Error::InvalidIngest("topic is required".to_string()));
        }
        let mut event = Event::new(source, topic, payload);
        event.event_type = event_type.map(str::to_string);
        event.meta = meta;
        (self.emit)(event.clone());
        Ok(event)
    }

    pub fn recent_inputs(&self) -> Vec<Event> {
        self.input_history.to_vec()
    }

    pub fn recent_outputs(&self) -> Vec<Event> {
        self.output_history.to_vec()
    }

    pub fn subscribe_live(&self) -> broadcast::Receiver<LiveUpdate> {
        self.live_tx.subscribe()
    }

    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    pub fn config(&self) -> &SystemConfig {
        &self.config
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn inputs(&self) -> &Arc<InputManager> {
        &self.inputs
    }

    pub fn workflows(&self) -> &WorkflowEngine {
        &self.engine
    }

    pub fn enrichment(&self) -> &Arc<EnrichmentRegistry> {
        &self.registry
    }
}

fn apply_bus_policies(bus: &EventBus, config: &BusConfig) -> RelayResult<()> {
    for (topic, policy) in &config.input {
        bus.set_input_policy(topic, policy.clone())?;
    }
    for (topic, policy) in &config.output {
        bus.set_output_policy(topic, policy.clone())?;
    }
    for (topic, policy) in &config.topics {
        bus.set_topic_policy(topic, policy.clone())?;
    }
    for (topic, policy) in &config.metrics {
        bus.set_metrics_policy(topic, policy.clone())?;
    }
    Ok(())
}
