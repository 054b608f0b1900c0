//! # Canonical Event
//!
//! The normalized record every input source produces and every workflow consumes.
//! Events are treated as immutable values: operators that change a field build a new
//! `Event` (the builder methods below take `self` by value or clone from `&self`), so a
//! payload that was handed to several subscribers is never edited in place.
//!
//! ## Field paths
//!
//! Steps address event fields with dotted paths such as `payload.device.id` or
//! `meta.inputId`. The first segment selects the top-level field (`id`, `timestamp`,
//! `source`, `topic`, `type`, `payload`, `meta`), the rest walks into JSON objects.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

pub type Meta = Map<String, Value>;

/// Workflow that claimed (or emitted) the event.
pub const META_WORKFLOW_ID: &str = "workflowId";
pub const META_INPUT_ID: &str = "inputId";
pub const META_INPUT_TYPE: &str = "inputType";
/// Loop guard: workflow ids the event already passed through.
pub const META_VISITED: &str = "_wfVisited";
pub const META_LOOPBACK_FROM: &str = "loopbackFrom";

/// # Event
///
/// `id` is a v4 UUID assigned at construction and never changed afterwards. Derived
/// events (workflow outputs, branch emissions, window summaries, loopbacks) are created
/// through [`Event::derive`] and receive their own id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    pub topic: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub meta: Meta,
}

impl Event {
    pub fn new(source: impl Into<String>, topic: impl Into<String>, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            source: source.into(),
            topic: topic.into(),
            event_type: None,
            payload,
            meta: Meta::new(),
        }
    }

    pub fn with_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_meta(mut self, key: &str, value: Value) -> Self {
        self.meta.insert(key.to_string(), value);
        self
    }

    pub fn without_meta(mut self, key: &str) -> Self {
        self.meta.remove(key);
        self
    }

    /// Copy of this event under a fresh id. Timestamp and all fields are kept.
    pub fn derive(&self) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            ..self.clone()
        }
    }

    /// Workflow id this event belongs to: the binding of the input that produced it,
    /// or the workflow that emitted it. Other workflows leave claimed events alone;
    /// loopback re-injection drops the claim.
    pub fn claimed_by(&self) -> Option<&str> {
        self.meta.get(META_WORKFLOW_ID).and_then(Value::as_str)
    }

    pub fn visited(&self) -> Vec<String> {
        self.meta
            .get(META_VISITED)
            .and_then(Value::as_array)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| id.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn has_visited(&self, workflow_id: &str) -> bool {
        self.meta
            .get(META_VISITED)
            .and_then(Value::as_array)
            .is_some_and(|ids| ids.iter().any(|id| id.as_str() == Some(workflow_id)))
    }

    /// Returns a copy stamped as visited by `workflow_id`, keeping at most `cap` ids
    /// (oldest dropped first).
    pub fn mark_visited(&self, workflow_id: &str, cap: usize) -> Self {
        let mut visited = self.visited();
        visited.push(workflow_id.to_string());
        if cap > 0 && visited.len() > cap {
            let excess = visited.len() - cap;
            visited.drain(..excess);
        }
        let list = visited.into_iter().map(Value::String).collect();
        self.clone().with_meta(META_VISITED, Value::Array(list))
    }

    /// Reads a dotted path. Missing segments yield `None`.
    pub fn field(&self, path: &str) -> Option<Value> {
        let (head, rest) = split_head(path);
        match head {
            "id" if rest.is_none() => Some(Value::String(self.id.clone())),
            "timestamp" if rest.is_none() => Some(Value::String(self.timestamp.to_rfc3339())),
            "source" if rest.is_none() => Some(Value::String(self.source.clone())),
            "topic" if rest.is_none() => Some(Value::String(self.topic.clone())),
            "type" if rest.is_none() => self.event_type.clone().map(Value::String),
            "payload" => match rest {
                None => Some(self.payload.clone()),
                Some(rest) => get_path(&self.payload, rest).cloned(),
            },
            "meta" => match rest {
                None => Some(Value::Object(self.meta.clone())),
                Some(rest) => {
                    let (key, tail) = split_head(rest);
                    let value = self.meta.get(key)?;
                    match tail {
                        None => Some(value.clone()),
                        Some(tail) => get_path(value, tail).cloned(),
                    }
                }
            },
            _ => None,
        }
    }

    /// Returns a copy with `value` written at `path`. Writable roots are `payload`,
    /// `meta`, and the string fields `topic`, `source`, `type`.
    pub fn with_field(&self, path: &str, value: Value) -> Self {
        let mut next = self.clone();
        let (head, rest) = split_head(path);
        match (head, rest) {
            ("payload", None) => next.payload = value,
            ("payload", Some(rest)) => set_path(&mut next.payload, rest, value),
            ("meta", Some(rest)) => {
                let mut meta = Value::Object(std::mem::take(&mut next.meta));
                set_path(&mut meta, rest, value);
                if let Value::Object(map) = meta {
                    next.meta = map;
                }
            }
            ("topic", None) => {
                if let Value::String(topic) = value {
                    next.topic = topic;
                }
            }
            ("source", None) => {
                if let Value::String(source) = value {
                    next.source = source;
                }
            }
            ("type", None) => next.event_type = value.as_str().map(str::to_string),
            _ => {
                tracing::debug!("Ignoring write to unsupported event path: {}", path);
            }
        }
        next
    }
}

fn split_head(path: &str) -> (&str, Option<&str>) {
    match path.split_once('.') {
        Some((head, rest)) => (head, Some(rest)),
        None => (path, None),
    }
}

/// Walks a dotted path through nested objects. Numeric segments index arrays.
pub fn get_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(value, |current, key| match current {
        Value::Object(map) => map.get(key),
        Value::Array(items) => key.parse::<usize>().ok().and_then(|idx| items.get(idx)),
        _ => None,
    })
}

/// Writes `value` at a dotted path, replacing non-object intermediates with objects.
pub fn set_path(target: &mut Value, path: &str, value: Value) {
    let mut current = target;
    let mut parts = path.split('.').peekable();
    while let Some(part) = parts.next() {
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        let Value::Object(map) = current else {
            return;
        };
        if parts.peek().is_none() {
            map.insert(part.to_string(), value);
            return;
        }
        current = map
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
}

/// Strict equality on JSON values. Numbers compare by value so `1` equals `1.0`.
pub fn strict_equals(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(a), Some(b)) => a == b,
            _ => a == b,
        },
        _ => left == right,
    }
}
