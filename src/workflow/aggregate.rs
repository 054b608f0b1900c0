use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Map, Value};
use tokio::time::Instant;
use tracing::trace;

use super::definition::AggregateCountStep;
use crate::{
    event::{model::Event, stream::EventStream, Subscription},
    guard::lock,
};

struct Bucket {
    key: Value,
    count: u64,
    last: Event,
}

struct Window {
    started: DateTime<Utc>,
    buckets: BTreeMap<String, Bucket>,
}

impl Window {
    fn open() -> Self {
        Self {
            started: Utc::now(),
            buckets: BTreeMap::new(),
        }
    }

    fn add(&mut self, event: Event, key_field: Option<&str>) {
        let key = key_field
            .map(|field| event.field(field).unwrap_or(Value::Null))
            .unwrap_or(Value::Null);
        let slot = key.to_string();
        match self.buckets.get_mut(&slot) {
            Some(bucket) => {
                bucket.count += 1;
                bucket.last = event;
            }
            None => {
                self.buckets.insert(
                    slot,
                    Bucket {
                        key,
                        count: 1,
                        last: event,
                    },
                );
            }
        }
    }

    /// Closes this window and opens the next one.
    fn rotate(&mut self) -> (DateTime<Utc>, BTreeMap<String, Bucket>) {
        let closed = std::mem::replace(self, Window::open());
        (closed.started, closed.buckets)
    }
}

/// One summary per non-empty key (or a single one without `keyField`) every
/// `windowMs`. Windows are tumbling and aligned to the moment of subscription.
pub fn aggregate_count(stream: EventStream, step: AggregateCountStep) -> EventStream {
    let step = Arc::new(step);
    EventStream::new(move |sink| {
        let subscription = Subscription::new();
        let window = Arc::new(Mutex::new(Window::open()));
        let period = Duration::from_millis(step.window_ms);

        let collector = window.clone();
        let key_field = step.key_field.clone();
        let upstream = stream.subscribe(move |event| {
            lock(&collector).add(event, key_field.as_deref());
        });
        subscription.add(upstream);

        let guard = subscription.clone();
        let step = step.clone();
        let ticker = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                if guard.is_closed() {
                    break;
                }
                let (started, buckets) = lock(&window).rotate();
                let ended = Utc::now();
                for bucket in buckets.into_values() {
                    trace!("Window closed key={} count={}", bucket.key, bucket.count);
                    sink(summary(&step, bucket, started, ended));
                }
            }
        });
        subscription.add_teardown(move || ticker.abort());
        subscription
    })
}

fn summary(
    step: &AggregateCountStep,
    bucket: Bucket,
    started: DateTime<Utc>,
    ended: DateTime<Utc>,
) -> Event {
    let mut payload = Map::new();
    payload.insert("count".to_string(), json!(bucket.count));
    if step.key_field.is_some() {
        payload.insert("key".to_string(), bucket.key);
    }
    payload.insert("windowMs".to_string(), json!(step.window_ms));
    payload.insert(
        "windowStart".to_string(),
        json!(started.to_rfc3339_opts(SecondsFormat::Millis, true)),
    );
    payload.insert(
        "windowEnd".to_string(),
        json!(ended.to_rfc3339_opts(SecondsFormat::Millis, true)),
    );

    let mut event = bucket.last.derive();
    event.timestamp = ended;
    event.payload = Value::Object(payload);
    if let Some(topic) = &step.output_topic {
        event.topic = topic.clone();
    }
    if let Some(event_type) = &step.event_type {
        event.event_type = Some(event_type.clone());
    }
    event
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventBus;
    use pretty_assertions::assert_eq;

    fn device(id: &str) -> Event {
        Event::new("test", "telemetry", json!({ "deviceId": id })).with_type("reading")
    }

    #[tokio::test(start_paused = true)]
    async fn test_counts_per_key() {
        let bus = EventBus::new();
        let source = bus.topic_stream("telemetry");
        let step = AggregateCountStep {
            window_ms: 1000,
            key_field: Some("payload.deviceId".to_string()),
            output_topic: Some("telemetry/counts".to_string()),
            event_type: None,
        };
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = aggregate_count(source, step).subscribe(move |e| lock(&sink).push(e));

        for id in ["dev-1", "dev-2", "dev-1", "dev-1", "dev-2"] {
            bus.topics_bus().publish("telemetry", device(id));
        }
        tokio::time::sleep(Duration::from_millis(1100)).await;

        let seen = lock(&seen);
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].payload["key"], json!("dev-1"));
        assert_eq!(seen[0].payload["count"], json!(3));
        assert_eq!(seen[1].payload["key"], json!("dev-2"));
        assert_eq!(seen[1].payload["count"], json!(2));
        assert_eq!(seen[0].topic, "telemetry/counts");
        assert_eq!(seen[0].event_type.as_deref(), Some("reading"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_windows_emit_nothing() {
        let bus = EventBus::new();
        let source = bus.topic_stream("telemetry");
        let step = AggregateCountStep {
            window_ms: 100,
            ..AggregateCountStep::default()
        };
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let sub = aggregate_count(source, step).subscribe(move |e| lock(&sink).push(e));

        bus.topics_bus().publish("telemetry", device("a"));
        tokio::time::sleep(Duration::from_millis(450)).await;
        assert_eq!(lock(&seen).len(), 1);
        assert!(lock(&seen)[0].payload.get("key").is_none());

        sub.unsubscribe();
        bus.topics_bus().publish("telemetry", device("a"));
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(lock(&seen).len(), 1);
    }
}
