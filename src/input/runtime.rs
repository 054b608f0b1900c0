use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::{sync::watch, task::JoinHandle};

use super::definition::InputDefinition;
use crate::event::model::{Event, Meta};

/// Ingestion boundary: receives every canonical event an input produces.
pub type EmitFn = Arc<dyn Fn(Event) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum InputStatus {
    Running,
    Stopped,
    Error { message: String },
}

/// Builds events for one definition and pushes them through the emit callback.
#[derive(Clone)]
pub struct Emitter {
    definition: Arc<InputDefinition>,
    emit: EmitFn,
}

impl Emitter {
    pub fn new(definition: InputDefinition, emit: EmitFn) -> Self {
        Self {
            definition: Arc::new(definition),
            emit,
        }
    }

    pub fn id(&self) -> &str {
        &self.definition.id
    }

    pub fn emit(&self, payload: Value, meta: Meta) -> Event {
        let event = self.definition.event(payload, meta);
        (self.emit)(event.clone());
        event
    }
}

/// A running input task and the signal that stops it.
pub struct RuntimeHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl RuntimeHandle {
    pub fn spawn<F, Fut>(run: F) -> Self
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let (stop, stop_rx) = watch::channel(false);
        let task = tokio::spawn(run(stop_rx));
        Self { stop, task }
    }

    /// Signals the task; it releases its socket, file handles and timers on its way out.
    pub fn stop(self) {
        let _ = self.stop.send(true);
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Resolves once stop is signalled or the handle is gone.
pub async fn stopped(stop: &mut watch::Receiver<bool>) {
    while !*stop.borrow_and_update() {
        if stop.changed().await.is_err() {
            return;
        }
    }
}
