use std::{sync::Arc, time::Duration};

use futures::StreamExt;
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, warn};

use super::{
    definition::{EnrichStep, OnError, LOOPBACK_LOGIC_ID},
    steps::PipelineContext,
};
use crate::{
    enrichment::{EnrichmentRegistry, GetOptions, Params},
    event::{
        model::{Event, META_WORKFLOW_ID},
        EventStream, Subscription,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrichKind {
    Enrich,
    Logic,
}

impl EnrichKind {
    fn target_root(self) -> &'static str {
        match self {
            EnrichKind::Enrich => "payload.enrichment",
            EnrichKind::Logic => "payload.logic",
        }
    }

    fn error_root(self) -> &'static str {
        match self {
            EnrichKind::Enrich => "payload.enrichmentError",
            EnrichKind::Logic => "payload.logicError",
        }
    }
}

/// Resolved step settings shared by every in-flight call.
struct EnrichCall {
    provider_id: String,
    params: Map<String, Value>,
    target_field: String,
    error_field: String,
    on_error: OnError,
    options: GetOptions,
    registry: Arc<EnrichmentRegistry>,
}

impl EnrichCall {
    async fn apply(&self, event: Event) -> Option<Event> {
        let params = resolve_params(&event, &self.params);
        match self
            .registry
            .get(&self.provider_id, &params, self.options)
            .await
        {
            Ok(value) => Some(event.with_field(&self.target_field, value)),
            Err(e) => {
                warn!(
                    "Enrichment {} failed for event {}: {} (onError={})",
                    self.provider_id, event.id, e, self.on_error
                );
                match self.on_error {
                    OnError::Skip => None,
                    OnError::Pass => Some(event),
                    OnError::SetError => Some(event.with_field(
                        &self.error_field,
                        json!({ "message": e.to_string(), "code": e.code() }),
                    )),
                }
            }
        }
    }
}

/// String params are dotted paths into the event (missing → `null`); other values are
/// passed through as literals.
pub fn resolve_params(event: &Event, params: &Map<String, Value>) -> Params {
    params
        .iter()
        .map(|(name, source)| {
            let value = match source {
                Value::String(path) => event.field(path).unwrap_or(Value::Null),
                literal => literal.clone(),
            };
            (name.clone(), value)
        })
        .collect()
}

/// Calls the registry for each event with at most `concurrency` calls in flight; the
/// rest wait in an unbounded queue. `logic` with id `loopback` re-injects the event
/// instead and passes it on unchanged.
pub fn enrich(
    stream: EventStream,
    step: EnrichStep,
    kind: EnrichKind,
    ctx: &PipelineContext,
) -> EventStream {
    let provider_id = step.provider_id().unwrap_or_default().to_string();

    if kind == EnrichKind::Logic && provider_id == LOOPBACK_LOGIC_ID {
        let on_loopback = ctx.sinks.on_loopback.clone();
        let workflow_id = Value::String(ctx.workflow_id.clone());
        return stream.tap(move |event| {
            debug!("Logic loopback for event {}", event.id);
            on_loopback(event.derive().with_meta(META_WORKFLOW_ID, workflow_id.clone()));
        });
    }

    let concurrency = step.concurrency.unwrap_or(ctx.default_concurrency).max(1);
    let call = Arc::new(EnrichCall {
        target_field: step
            .target_field
            .clone()
            .unwrap_or_else(|| format!("{}.{}", kind.target_root(), provider_id)),
        error_field: step
            .error_field
            .clone()
            .unwrap_or_else(|| format!("{}.{}", kind.error_root(), provider_id)),
        provider_id,
        params: step.params,
        on_error: step.on_error,
        options: GetOptions {
            cache_ttl: step.cache_ttl_ms.map(Duration::from_millis),
        },
        registry: ctx.registry.clone(),
    });

    EventStream::new(move |sink| {
        let subscription = Subscription::new();
        let (tx, rx) = mpsc::unbounded_channel::<Event>();
        let guard = subscription.clone();
        let call = call.clone();

        // Ends once the upstream handler, and with it `tx`, is dropped. After
        // unsubscribe, queued events are discarded without a call; calls already
        // issued run to completion and their results are discarded.
        tokio::spawn(async move {
            UnboundedReceiverStream::new(rx)
                .for_each_concurrent(concurrency, |event| {
                    let call = call.clone();
                    let sink = sink.clone();
                    let guard = guard.clone();
                    async move {
                        if guard.is_closed() {
                            return;
                        }
                        let outcome = call.apply(event).await;
                        if guard.is_closed() {
                            return;
                        }
                        if let Some(next) = outcome {
                            sink(next);
                        }
                    }
                })
                .await;
        });

        subscription.add(stream.subscribe(move |event| {
            let _ = tx.send(event);
        }));
        subscription
    })
}
