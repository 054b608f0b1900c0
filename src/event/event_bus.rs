//! # Event Bus
//!
//! Composes four [`TopicBus`] instances into the channels inputs and workflows use:
//!
//! ```text
//!                      ┌──────────┐
//!   publish_input ────▶│ inputBus │────▶ input_stream()  (workflows without sourceTopics)
//!          │           └──────────┘
//!          │  metrics/*  ┌────────────┐
//!          ├────────────▶│ metricsBus │────▶ topic_stream("metrics/...")
//!          │             └────────────┘
//!          │  other      ┌───────────┐
//!          └────────────▶│ topicsBus │────▶ topic_stream(..) / merge_topics(..)
//!                        └───────────┘
//!   publish_output ─────▶ outputBus + topicsBus  (metrics/* only to metricsBus)
//! ```
//!
//! Topics under the reserved `metrics/` prefix never reach the general topics bus, so
//! telemetry cannot feed back into workflow fan-in.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, trace};

use super::{
    model::Event,
    stream::{merge, EventStream, Sink, Subscription},
    topic_bus::{Handler, QueuePolicy, TopicBus},
};

pub const RESERVED_PREFIX: &str = "metrics/";

pub fn is_reserved(topic: &str) -> bool {
    topic.starts_with(RESERVED_PREFIX)
}

#[derive(Clone)]
pub struct EventBus {
    input: TopicBus,
    output: TopicBus,
    topics: TopicBus,
    metrics: TopicBus,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            input: TopicBus::new("input"),
            output: TopicBus::new("output"),
            topics: TopicBus::new("topics"),
            metrics: TopicBus::new("metrics"),
        }
    }

    pub fn publish_input(&self, event: Event) {
        debug_event("Input", &event);
        let topic = event.topic.clone();
        self.input.publish(&topic, event.clone());
        if is_reserved(&topic) {
            self.metrics.publish(&topic, event);
        } else {
            self.topics.publish(&topic, event);
        }
    }

    pub fn publish_output(&self, event: Event) {
        debug_event("Output", &event);
        let topic = event.topic.clone();
        if is_reserved(&topic) {
            self.metrics.publish(&topic, event);
            return;
        }
        self.output.publish(&topic, event.clone());
        self.topics.publish(&topic, event);
    }

    fn bus_for(&self, topic: &str) -> &TopicBus {
        if is_reserved(topic) {
            &self.metrics
        } else {
            &self.topics
        }
    }

    /// Stream of events published on `topic`. Each subscription registers its own
    /// handler on the underlying bus.
    pub fn topic_stream(&self, topic: &str) -> EventStream {
        let bus = self.bus_for(topic).clone();
        let topic = topic.to_string();
        EventStream::new(move |sink| {
            let subscription = Subscription::new();
            subscription.add(bus.subscribe(&topic, forward_to(sink, subscription.clone())));
            subscription
        })
    }

    pub fn merge_topics(&self, topics: &[String]) -> EventStream {
        merge(topics.iter().map(|topic| self.topic_stream(topic)).collect())
    }

    /// Every raw input event, whatever its topic.
    pub fn input_stream(&self) -> EventStream {
        let bus = self.input.clone();
        EventStream::new(move |sink| {
            let subscription = Subscription::new();
            subscription.add(bus.subscribe_any(forward_to(sink, subscription.clone())));
            subscription
        })
    }

    /// Every output event, whatever its topic. Reserved topics are not included.
    pub fn output_stream(&self) -> EventStream {
        let bus = self.output.clone();
        EventStream::new(move |sink| {
            let subscription = Subscription::new();
            subscription.add(bus.subscribe_any(forward_to(sink, subscription.clone())));
            subscription
        })
    }

    pub fn set_topic_policy(&self, topic: &str, policy: QueuePolicy) -> EventResult<()> {
        self.bus_for(topic).set_policy(topic, policy)
    }

    pub fn set_input_policy(&self, topic: &str, policy: QueuePolicy) -> EventResult<()> {
        self.input.set_policy(topic, policy)
    }

    pub fn set_output_policy(&self, topic: &str, policy: QueuePolicy) -> EventResult<()> {
        self.output.set_policy(topic, policy)
    }

    pub fn set_metrics_policy(&self, topic: &str, policy: QueuePolicy) -> EventResult<()> {
        self.metrics.set_policy(topic, policy)
    }

    pub fn input_bus(&self) -> &TopicBus {
        &self.input
    }

    pub fn output_bus(&self) -> &TopicBus {
        &self.output
    }

    pub fn topics_bus(&self) -> &TopicBus {
        &self.topics
    }

    pub fn metrics_bus(&self) -> &TopicBus {
        &self.metrics
    }
}

// Stops delivery as soon as the stream subscription closes, even if the bus is in the
// middle of dispatching a snapshot that still contains this handler.
fn forward_to(sink: Sink, guard: Subscription) -> Handler {
    Arc::new(move |event: &Event| {
        if !guard.is_closed() {
            sink(event.clone())
        }
    })
}

/// Metrics traffic is high volume, so it is only visible at trace level.
pub fn debug_event(prefix: &str, event: &Event) {
    if is_reserved(&event.topic) {
        trace!("{} Event: {} on {}", prefix, event.id, event.topic);
    } else {
        debug!("{} Event: {} on {}", prefix, event.id, event.topic);
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EventError {
    #[error("Invalid queue policy for {topic}: {message}")]
    InvalidPolicy { topic: String, message: String },
}

pub type EventResult<T> = Result<T, EventError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guard::lock;
    use serde_json::json;
    use std::sync::Mutex;

    fn recorder(stream: &EventStream) -> (Arc<Mutex<Vec<String>>>, Subscription) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let sub = stream.subscribe(move |event| lock(&sink).push(event.topic.clone()));
        (seen, sub)
    }

    #[test]
    fn test_input_routing() {
        let bus = EventBus::new();
        let (inputs, _a) = recorder(&bus.input_stream());
        let (orders, _b) = recorder(&bus.topic_stream("orders/new"));
        let (metrics, _c) = recorder(&bus.topic_stream("metrics/cpu"));

        bus.publish_input(Event::new("s", "orders/new", json!({})));
        bus.publish_input(Event::new("s", "metrics/cpu", json!({})));

        assert_eq!(*lock(&inputs), vec!["orders/new", "metrics/cpu"]);
        assert_eq!(*lock(&orders), vec!["orders/new"]);
        assert_eq!(*lock(&metrics), vec!["metrics/cpu"]);
        assert_eq!(bus.topics_bus().handler_count("metrics/cpu"), 0);
    }

    #[test]
    fn test_reserved_outputs_stay_isolated() {
        let bus = EventBus::new();
        let (outputs, _a) = recorder(&bus.output_stream());
        let (metrics, _b) = recorder(&bus.topic_stream("metrics/summary"));
        let (alerts, _c) = recorder(&bus.topic_stream("alerts"));

        bus.publish_output(Event::new("wf", "metrics/summary", json!({})));
        bus.publish_output(Event::new("wf", "alerts", json!({})));

        assert_eq!(*lock(&outputs), vec!["alerts"]);
        assert_eq!(*lock(&metrics), vec!["metrics/summary"]);
        assert_eq!(*lock(&alerts), vec!["alerts"]);
    }

    #[test]
    fn test_merge_topics_each_subscription_independent() {
        let bus = EventBus::new();
        let merged = bus.merge_topics(&["a".to_string(), "b".to_string()]);
        let (first, sub) = recorder(&merged);
        let (second, _keep) = recorder(&merged);

        bus.publish_input(Event::new("s", "a", json!({})));
        sub.unsubscribe();
        bus.publish_input(Event::new("s", "b", json!({})));

        assert_eq!(*lock(&first), vec!["a"]);
        assert_eq!(*lock(&second), vec!["a", "b"]);
    }
}
