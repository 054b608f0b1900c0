use std::{sync::Arc, time::Duration};

use serde_json::{Map, Value};
use tracing::info;

use super::{
    aggregate::aggregate_count,
    definition::{BranchStep, StepDefinition},
    enrich::{enrich, EnrichKind},
    engine::WorkflowSinks,
};
use crate::{
    enrichment::EnrichmentRegistry,
    event::{
        model::{get_path, set_path, strict_equals, Event, META_WORKFLOW_ID},
        stream::race,
        EventBus, EventStream,
    },
};

/// What a step needs from the engine while its pipeline is being built.
#[derive(Clone)]
pub struct PipelineContext {
    pub workflow_id: String,
    pub workflow_name: String,
    pub bus: EventBus,
    pub registry: Arc<EnrichmentRegistry>,
    pub sinks: WorkflowSinks,
    pub default_concurrency: usize,
}

/// Wraps `stream` in the operator for `step`.
pub fn apply_step(stream: EventStream, step: &StepDefinition, ctx: &PipelineContext) -> EventStream {
    match step {
        StepDefinition::FilterEquals { field, value } => {
            let field = field.clone();
            let value = value.clone();
            stream.filter(move |event| {
                event
                    .field(&field)
                    .is_some_and(|actual| strict_equals(&actual, &value))
            })
        }
        StepDefinition::MapFields { mapping } => {
            let mapping = mapping.clone();
            stream.map(move |event| {
                let payload = map_fields(&event, &mapping);
                event.with_payload(payload)
            })
        }
        StepDefinition::Debounce { ms } => stream.debounce(Duration::from_millis(*ms)),
        StepDefinition::Throttle { ms } => stream.throttle(Duration::from_millis(*ms)),
        StepDefinition::Delay { ms } => stream.delay(Duration::from_millis(*ms)),
        StepDefinition::AggregateCount(step) => aggregate_count(stream, step.clone()),
        StepDefinition::Enrich(step) => enrich(stream, step.clone(), EnrichKind::Enrich, ctx),
        StepDefinition::Logic(step) => enrich(stream, step.clone(), EnrichKind::Logic, ctx),
        StepDefinition::SetTopic { topic } => {
            let topic = topic.clone();
            stream.map(move |event| event.with_topic(topic.clone()))
        }
        StepDefinition::MergeWithTopics { topics } => {
            stream.merge_with(vec![ctx.bus.merge_topics(topics)])
        }
        StepDefinition::RaceTopics { topics, window_ms } => {
            let mut racers = vec![stream];
            racers.extend(topics.iter().map(|topic| ctx.bus.topic_stream(topic)));
            let window = window_ms
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis);
            race(racers, window)
        }
        StepDefinition::TapLog { label } => {
            let name = ctx.workflow_name.clone();
            let label = label.clone().unwrap_or_else(|| "tap".to_string());
            stream.tap(move |event| {
                info!(
                    "[WF {}] {} id={} topic={} payload={}",
                    name, label, event.id, event.topic, event.payload
                );
            })
        }
        StepDefinition::Branch(step) => {
            let step = step.clone();
            let workflow_id = ctx.workflow_id.clone();
            let on_output = ctx.sinks.on_output.clone();
            stream.tap(move |event| {
                for output in branch_outputs(event, &step, &workflow_id) {
                    on_output(output, None);
                }
            })
        }
    }
}

/// Builds a fresh payload from `to: from` pairs. Targets are relative to the new
/// payload (a leading `payload.` is ignored); sources missing on the event are skipped.
pub fn map_fields(event: &Event, mapping: &std::collections::BTreeMap<String, String>) -> Value {
    let mut payload = Value::Object(Map::new());
    for (to, from) in mapping {
        let value = event
            .field(from)
            .or_else(|| get_path(&event.payload, from).cloned());
        let Some(value) = value else {
            continue;
        };
        let target = to.strip_prefix("payload.").unwrap_or(to);
        set_path(&mut payload, target, value);
    }
    payload
}

/// Every matching arm yields one output; `else` applies only when none matched.
pub fn branch_outputs(event: &Event, step: &BranchStep, workflow_id: &str) -> Vec<Event> {
    let mut outputs: Vec<Event> = step
        .branches
        .iter()
        .filter(|arm| {
            event
                .field(&arm.when.field)
                .is_some_and(|actual| strict_equals(&actual, &arm.when.equals))
        })
        .map(|arm| {
            branched(
                event,
                arm.set.as_ref(),
                arm.output_topic.as_deref(),
                "branch",
                workflow_id,
            )
        })
        .collect();
    if outputs.is_empty() {
        if let Some(otherwise) = &step.otherwise {
            outputs.push(branched(
                event,
                otherwise.set.as_ref(),
                otherwise.output_topic.as_deref(),
                "branch-else",
                workflow_id,
            ));
        }
    }
    outputs
}

fn branched(
    event: &Event,
    set: Option<&Map<String, Value>>,
    topic: Option<&str>,
    event_type: &str,
    workflow_id: &str,
) -> Event {
    let mut payload = match &event.payload {
        Value::Object(map) => map.clone(),
        Value::Null => Map::new(),
        other => {
            let mut wrapped = Map::new();
            wrapped.insert("value".to_string(), other.clone());
            wrapped
        }
    };
    if let Some(set) = set {
        payload.extend(set.iter().map(|(k, v)| (k.clone(), v.clone())));
    }

    let mut out = event.derive();
    out.payload = Value::Object(payload);
    if let Some(topic) = topic {
        out.topic = topic.to_string();
    }
    out.event_type = Some(event_type.to_string());
    out.meta.insert(
        META_WORKFLOW_ID.to_string(),
        Value::String(workflow_id.to_string()),
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::definition::{BranchArm, BranchCondition, BranchElse};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn event(payload: Value) -> Event {
        Event::new("test", "logs", payload)
    }

    fn arm(equals: Value, topic: &str) -> BranchArm {
        BranchArm {
            when: BranchCondition {
                field: "payload.level".to_string(),
                equals,
            },
            set: None,
            output_topic: Some(topic.to_string()),
        }
    }

    #[test]
    fn test_map_fields_builds_fresh_payload() {
        let source = event(json!({"user": {"id": 7, "name": "Ann"}, "noise": true}));
        let mapping: BTreeMap<String, String> = [
            ("payload.userId", "payload.user.id"),
            ("who.name", "user.name"),
            ("topic", "topic"),
            ("missing", "payload.nope"),
        ]
        .into_iter()
        .map(|(to, from)| (to.to_string(), from.to_string()))
        .collect();

        assert_eq!(
            map_fields(&source, &mapping),
            json!({"userId": 7, "who": {"name": "Ann"}, "topic": "logs"})
        );
    }

    #[test]
    fn test_every_matching_arm_emits() {
        let step = BranchStep {
            branches: vec![arm(json!("warn"), "a"), arm(json!("warn"), "b"), arm(json!("x"), "c")],
            otherwise: Some(BranchElse::default()),
        };
        let outputs = branch_outputs(&event(json!({"level": "warn"})), &step, "wf");
        let topics: Vec<&str> = outputs.iter().map(|e| e.topic.as_str()).collect();
        assert_eq!(topics, vec!["a", "b"]);
        assert!(outputs.iter().all(|e| e.meta[META_WORKFLOW_ID] == json!("wf")));
    }

    #[test]
    fn test_else_wraps_scalar_payload() {
        let step = BranchStep {
            branches: vec![arm(json!("warn"), "a")],
            otherwise: Some(BranchElse {
                set: Some(serde_json::from_value(json!({"fallback": true})).unwrap()),
                output_topic: None,
            }),
        };
        let outputs = branch_outputs(&event(json!(42)), &step, "wf");
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].event_type.as_deref(), Some("branch-else"));
        assert_eq!(outputs[0].topic, "logs");
        assert_eq!(outputs[0].payload, json!({"value": 42, "fallback": true}));
    }

    #[test]
    fn test_no_match_without_else() {
        let step = BranchStep {
            branches: vec![arm(json!("warn"), "a")],
            otherwise: None,
        };
        assert!(branch_outputs(&event(json!({"level": 1})), &step, "wf").is_empty());
    }
}
