use std::sync::{Arc, Mutex};

use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::{
    definition::{InputConfig, InputDefinition, InputType, LOOPBACK_INPUT_ID},
    runtime::{EmitFn, Emitter, InputStatus, RuntimeHandle},
    tail, timer, udp,
    webhook::{WebhookRoute, WebhookRoutes},
};
use crate::{
    event::model::{Event, Meta, META_INPUT_ID, META_INPUT_TYPE, META_LOOPBACK_FROM, META_WORKFLOW_ID},
    guard::lock,
};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum InputError {
    #[error("Webhook route {key} is already bound to input {owner}")]
    WebhookPathConflict { key: String, owner: String },
    #[error("Invalid config for input {id}: {message}")]
    InvalidConfig { id: String, message: String },
    #[error("Input {0} is read-only")]
    ReadOnly(String),
    #[error("Input not found: {0}")]
    NotFound(String),
    #[error("No webhook route for {method} {path}")]
    WebhookNotFound { method: String, path: String },
    #[error("Input {0} is disabled")]
    Disabled(String),
    #[error("Unauthorized webhook call for input {0}")]
    Unauthorized(String),
}

impl InputError {
    pub fn code(&self) -> &'static str {
        match self {
            InputError::WebhookPathConflict { .. } => "webhook_path_conflict",
            InputError::InvalidConfig { .. } => "invalid_input_config",
            InputError::ReadOnly(_) => "read_only_input",
            InputError::NotFound(_) => "input_not_found",
            InputError::WebhookNotFound { .. } => "webhook_not_found",
            InputError::Disabled(_) => "input_disabled",
            InputError::Unauthorized(_) => "unauthorized",
        }
    }
}

pub type InputResult<T> = Result<T, InputError>;

/// Owns input definitions, their running sources and the webhook route table.
///
/// Spawning sources needs a Tokio runtime, so `upsert`/`enable` must be called from
/// within one.
pub struct InputManager {
    emit: EmitFn,
    loopback: InputDefinition,
    definitions: DashMap<String, InputDefinition>,
    runtimes: DashMap<String, RuntimeHandle>,
    statuses: Arc<DashMap<String, InputStatus>>,
    routes: Mutex<WebhookRoutes>,
}

impl InputManager {
    pub fn new(emit: EmitFn) -> Self {
        Self {
            emit,
            loopback: InputDefinition::loopback(),
            definitions: DashMap::new(),
            runtimes: DashMap::new(),
            statuses: Arc::new(DashMap::new()),
            routes: Mutex::new(WebhookRoutes::default()),
        }
    }

    /// Replaces the definition for `def.id`. Any previous runtime is stopped first;
    /// a webhook route conflict rejects the definition and leaves the previous one,
    /// and its route, untouched.
    #[instrument(level = "debug", skip(self, def), fields(id = %def.id))]
    pub fn upsert(&self, def: InputDefinition) -> InputResult<()> {
        if def.id == LOOPBACK_INPUT_ID {
            return Err(InputError::ReadOnly(def.id));
        }
        if def.id.trim().is_empty() {
            return Err(InputError::InvalidConfig {
                id: def.id,
                message: "input id must not be empty".to_string(),
            });
        }
        if def.input_type == InputType::Loopback {
            return Err(InputError::InvalidConfig {
                id: def.id,
                message: "loopback inputs are built in".to_string(),
            });
        }
        let config = def.parse_config()?;

        {
            let mut routes = lock(&self.routes);
            match &config {
                InputConfig::Webhook(webhook) => {
                    routes.register(WebhookRoute::for_input(&def.id, webhook))?
                }
                _ => routes.clear(&def.id),
            }
        }

        self.stop_runtime(&def.id);
        self.definitions.insert(def.id.clone(), def.clone());

        if !def.enabled {
            self.statuses.insert(def.id.clone(), InputStatus::Stopped);
            info!("Input {} stored (disabled)", def.id);
            return Ok(());
        }

        self.statuses.insert(def.id.clone(), InputStatus::Running);
        if let Some(handle) = self.start_runtime(&def, config) {
            self.runtimes.insert(def.id.clone(), handle);
        }
        info!("Input {} ({}) started", def.id, def.input_type);
        Ok(())
    }

    fn start_runtime(&self, def: &InputDefinition, config: InputConfig) -> Option<RuntimeHandle> {
        let emitter = Emitter::new(def.clone(), self.emit.clone());
        let handle = match config {
            InputConfig::Udp(config) => {
                let statuses = self.statuses.clone();
                RuntimeHandle::spawn(move |stop| udp::run(config, emitter, statuses, stop))
            }
            InputConfig::Timer(config) => {
                RuntimeHandle::spawn(move |stop| timer::run(config, emitter, stop))
            }
            InputConfig::Tail(config) => {
                RuntimeHandle::spawn(move |stop| tail::run(config, emitter, stop))
            }
            // Webhooks are matched at dispatch time.
            InputConfig::Webhook(_) | InputConfig::Loopback => return None,
        };
        Some(handle)
    }

    fn stop_runtime(&self, id: &str) {
        if let Some((_, handle)) = self.runtimes.remove(id) {
            debug!("Stopping input runtime {}", id);
            handle.stop();
        }
    }

    #[instrument(level = "debug", skip(self))]
    pub fn remove(&self, id: &str) -> InputResult<()> {
        if id == LOOPBACK_INPUT_ID {
            return Err(InputError::ReadOnly(id.to_string()));
        }
        self.stop_runtime(id);
        lock(&self.routes).clear(id);
        self.statuses.remove(id);
        match self.definitions.remove(id) {
            Some(_) => {
                info!("Input {} removed", id);
                Ok(())
            }
            None => Err(InputError::NotFound(id.to_string())),
        }
    }

    /// Flips `enabled` and re-applies the definition.
    #[instrument(level = "debug", skip(self))]
    pub fn enable(&self, id: &str, enabled: bool) -> InputResult<()> {
        if id == LOOPBACK_INPUT_ID {
            return Err(InputError::ReadOnly(id.to_string()));
        }
        let mut def = self
            .get(id)
            .ok_or_else(|| InputError::NotFound(id.to_string()))?;
        def.enabled = enabled;
        self.upsert(def)
    }

    /// Every definition, the built-in loopback input first, then by id.
    pub fn list(&self) -> Vec<InputDefinition> {
        let mut defs: Vec<InputDefinition> = self
            .definitions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        defs.sort_by(|a, b| a.id.cmp(&b.id));
        defs.insert(0, self.loopback.clone());
        defs
    }

    pub fn get(&self, id: &str) -> Option<InputDefinition> {
        if id == LOOPBACK_INPUT_ID {
            return Some(self.loopback.clone());
        }
        self.definitions.get(id).map(|entry| entry.value().clone())
    }

    pub fn status(&self, id: &str) -> Option<InputStatus> {
        if id == LOOPBACK_INPUT_ID {
            return Some(InputStatus::Running);
        }
        self.statuses.get(id).map(|entry| entry.value().clone())
    }

    pub fn list_webhook_routes(&self) -> Vec<WebhookRoute> {
        lock(&self.routes).list()
    }

    pub fn match_webhook(&self, path: &str, method: &str) -> Option<WebhookRoute> {
        lock(&self.routes).matching(path, method).cloned()
    }

    /// Turns an inbound webhook call into an event. `auth` is the presented token
    /// (an `Authorization` header value or a raw token).
    pub fn handle_webhook(
        &self,
        path: &str,
        method: &str,
        auth: Option<&str>,
        payload: Value,
    ) -> InputResult<Event> {
        let route = self
            .match_webhook(path, method)
            .ok_or_else(|| InputError::WebhookNotFound {
                method: method.to_ascii_uppercase(),
                path: path.to_string(),
            })?;
        let def = self
            .get(&route.input_id)
            .ok_or_else(|| InputError::NotFound(route.input_id.clone()))?;
        if !def.enabled {
            return Err(InputError::Disabled(def.id));
        }
        if !route.authorizes(auth) {
            warn!("Rejected webhook call for input {}", def.id);
            return Err(InputError::Unauthorized(def.id));
        }

        let mut meta = Meta::new();
        meta.insert("path".to_string(), Value::String(route.path.clone()));
        meta.insert("method".to_string(), Value::String(route.method.clone()));
        Ok(self.emit_from_input(&def, payload, meta))
    }

    /// Builds the canonical event for `def` and hands it to the emit callback.
    pub fn emit_from_input(&self, def: &InputDefinition, payload: Value, meta: Meta) -> Event {
        let event = def.event(payload, meta);
        (self.emit)(event.clone());
        event
    }

    /// Re-injects a workflow output as an input event of the built-in loopback input.
    /// The loop guard list travels with it; the emitting workflow's claim does not.
    pub fn loopback(&self, output: &Event) -> Event {
        let mut meta = output.meta.clone();
        let from = meta.remove(META_WORKFLOW_ID);
        meta.insert(
            META_INPUT_ID.to_string(),
            Value::String(LOOPBACK_INPUT_ID.to_string()),
        );
        meta.insert(
            META_INPUT_TYPE.to_string(),
            Value::String(InputType::Loopback.to_string()),
        );
        if let Some(from) = from {
            meta.insert(META_LOOPBACK_FROM.to_string(), from);
        }

        let event = Event {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            meta,
            ..output.clone()
        };
        debug!("Loopback event {} on {}", event.id, event.topic);
        (self.emit)(event.clone());
        event
    }

    /// Stops every runtime. Definitions are kept.
    pub fn shutdown(&self) {
        let ids: Vec<String> = self.runtimes.iter().map(|entry| entry.key().clone()).collect();
        for id in ids {
            self.stop_runtime(&id);
            self.statuses.insert(id, InputStatus::Stopped);
        }
        info!("Input manager shut down");
    }
}

impl Drop for InputManager {
    fn drop(&mut self) {
        let ids: Vec<String> = self.runtimes.iter().map(|entry| entry.key().clone()).collect();
        for id in ids {
            self.stop_runtime(&id);
        }
    }
}
