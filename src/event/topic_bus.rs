//! # Topic Bus
//!
//! In-process publish/subscribe keyed by topic string. Each topic carries its own
//! dispatch policy:
//!
//! - **sync** (default): `publish` invokes every topic handler and then every
//!   "any" handler, in registration order, on the caller's task.
//! - **queue**: `publish` appends to a bounded FIFO and schedules a drain on the next
//!   runtime tick. Overflow either evicts the head (`oldest`) or discards the incoming
//!   event (`newest`). This keeps a fast producer (for example a UDP socket) from being
//!   blocked by slow workflow consumers.
//!
//! A panicking handler is logged and skipped; sibling handlers and later drains still
//! run.

use std::{
    collections::VecDeque,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, RwLock,
    },
};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{error, trace};

use super::{
    event_bus::{EventError, EventResult},
    model::Event,
    stream::Subscription,
};
use crate::guard::{lock, read, write};

pub type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DispatchMode {
    #[default]
    Sync,
    Queue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, strum::Display)]
pub enum DropPolicy {
    #[default]
    #[serde(rename = "oldest", alias = "drop-oldest")]
    #[strum(serialize = "drop-oldest")]
    DropOldest,
    #[serde(rename = "newest", alias = "drop-newest")]
    #[strum(serialize = "drop-newest")]
    DropNewest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuePolicy {
    #[serde(default)]
    pub mode: DispatchMode,
    #[serde(default = "default_max_size")]
    pub max_size: usize,
    #[serde(default)]
    pub drop: DropPolicy,
}

impl Default for QueuePolicy {
    fn default() -> Self {
        Self {
            mode: DispatchMode::Sync,
            max_size: default_max_size(),
            drop: DropPolicy::DropOldest,
        }
    }
}

impl QueuePolicy {
    pub fn queued(max_size: usize, drop: DropPolicy) -> Self {
        Self {
            mode: DispatchMode::Queue,
            max_size,
            drop,
        }
    }
}

fn default_max_size() -> usize {
    1024
}

struct TopicState {
    handlers: RwLock<Vec<(u64, Handler)>>,
    queue: Mutex<VecDeque<Event>>,
    draining: AtomicBool,
    policy: RwLock<QueuePolicy>,
}

impl TopicState {
    fn new() -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
            queue: Mutex::new(VecDeque::new()),
            draining: AtomicBool::new(false),
            policy: RwLock::new(QueuePolicy::default()),
        }
    }
}

struct TopicBusInner {
    name: String,
    topics: DashMap<String, Arc<TopicState>>,
    any_handlers: RwLock<Vec<(u64, Handler)>>,
    next_id: AtomicU64,
}

/// Cheap to clone; clones share the same topics and handlers.
#[derive(Clone)]
pub struct TopicBus {
    inner: Arc<TopicBusInner>,
}

impl Default for TopicBus {
    fn default() -> Self {
        Self::new("bus")
    }
}

impl TopicBus {
    /// `name` only labels log lines.
    pub fn new(name: &str) -> Self {
        Self {
            inner: Arc::new(TopicBusInner {
                name: name.to_string(),
                topics: DashMap::new(),
                any_handlers: RwLock::new(Vec::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn subscribe(&self, topic: &str, handler: Handler) -> Subscription {
        let state = self.inner.topic(topic);
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        write(&state.handlers).push((id, handler));
        Subscription::from_teardown(move || {
            write(&state.handlers).retain(|(handler_id, _)| *handler_id != id);
        })
    }

    /// Receives every publish regardless of topic.
    pub fn subscribe_any(&self, handler: Handler) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        write(&self.inner.any_handlers).push((id, handler));
        let inner = self.inner.clone();
        Subscription::from_teardown(move || {
            write(&inner.any_handlers).retain(|(handler_id, _)| *handler_id != id);
        })
    }

    pub fn set_policy(&self, topic: &str, policy: QueuePolicy) -> EventResult<()> {
        if policy.mode == DispatchMode::Queue && policy.max_size == 0 {
            return Err(EventError::InvalidPolicy {
                topic: topic.to_string(),
                message: "queue max size must be greater than 0".to_string(),
            });
        }
        let state = self.inner.topic(topic);
        *write(&state.policy) = policy;
        Ok(())
    }

    pub fn policy(&self, topic: &str) -> QueuePolicy {
        self.inner
            .topics
            .get(topic)
            .map(|state| read(&state.policy).clone())
            .unwrap_or_default()
    }

    /// Number of events waiting for a drain on a queued topic.
    pub fn queued_len(&self, topic: &str) -> usize {
        self.inner
            .topics
            .get(topic)
            .map(|state| lock(&state.queue).len())
            .unwrap_or(0)
    }

    pub fn handler_count(&self, topic: &str) -> usize {
        self.inner
            .topics
            .get(topic)
            .map(|state| read(&state.handlers).len())
            .unwrap_or(0)
    }

    pub fn publish(&self, topic: &str, event: Event) {
        let state = self.inner.topic(topic);
        let policy = read(&state.policy).clone();
        match policy.mode {
            DispatchMode::Sync => self.inner.dispatch(topic, &state, &event),
            DispatchMode::Queue => {
                self.inner.enqueue(topic, &state, event, &policy);
                TopicBusInner::schedule_drain(self.inner.clone(), topic.to_string(), state);
            }
        }
    }
}

impl TopicBusInner {
    fn topic(&self, topic: &str) -> Arc<TopicState> {
        if let Some(state) = self.topics.get(topic) {
            return state.clone();
        }
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| Arc::new(TopicState::new()))
            .clone()
    }

    fn dispatch(&self, topic: &str, state: &TopicState, event: &Event) {
        // Snapshot so handlers may (un)subscribe or publish while being called.
        let topic_handlers: Vec<Handler> = read(&state.handlers)
            .iter()
            .map(|(_, handler)| handler.clone())
            .collect();
        let any_handlers: Vec<Handler> = read(&self.any_handlers)
            .iter()
            .map(|(_, handler)| handler.clone())
            .collect();

        for handler in topic_handlers.iter().chain(any_handlers.iter()) {
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                error!(
                    "Handler panicked on {} bus, topic {}, event {}",
                    self.name, topic, event.id
                );
            }
        }
    }

    fn enqueue(&self, topic: &str, state: &TopicState, event: Event, policy: &QueuePolicy) {
        let mut queue = lock(&state.queue);
        if queue.len() >= policy.max_size {
            match policy.drop {
                DropPolicy::DropOldest => {
                    if let Some(dropped) = queue.pop_front() {
                        trace!("{} bus dropped oldest on {}: {}", self.name, topic, dropped.id);
                    }
                }
                DropPolicy::DropNewest => {
                    trace!("{} bus dropped newest on {}: {}", self.name, topic, event.id);
                    return;
                }
            }
        }
        queue.push_back(event);
    }

    fn schedule_drain(inner: Arc<Self>, topic: String, state: Arc<TopicState>) {
        if state.draining.swap(true, Ordering::SeqCst) {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    Self::drain(inner, topic, state);
                });
            }
            Err(_) => Self::drain(inner, topic, state),
        }
    }

    fn drain(inner: Arc<Self>, topic: String, state: Arc<TopicState>) {
        loop {
            let next = lock(&state.queue).pop_front();
            match next {
                Some(event) => inner.dispatch(&topic, &state, &event),
                None => break,
            }
        }
        state.draining.store(false, Ordering::SeqCst);
        // Events published between the last pop and the flag reset would otherwise sit
        // in the queue until the next publish.
        if !lock(&state.queue).is_empty() {
            Self::schedule_drain(inner, topic, state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(n: i64) -> Event {
        Event::new("test", "t", json!({ "n": n }))
    }

    fn collector() -> (Arc<Mutex<Vec<i64>>>, Handler) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler: Handler = Arc::new(move |ev: &Event| {
            lock(&sink).push(ev.payload["n"].as_i64().unwrap_or(-1));
        });
        (seen, handler)
    }

    #[test]
    fn test_sync_publish_in_order() {
        let bus = TopicBus::new("test");
        let (seen, handler) = collector();
        let _sub = bus.subscribe("t", handler);

        bus.publish("t", event(1));
        bus.publish("t", event(2));

        assert_eq!(*lock(&seen), vec![1, 2]);
    }

    #[test]
    fn test_any_handler_runs_after_topic_handlers() {
        let bus = TopicBus::new("test");
        let order = Arc::new(Mutex::new(Vec::new()));
        let any_order = order.clone();
        let topic_order = order.clone();
        let _any = bus.subscribe_any(Arc::new(move |_: &Event| lock(&any_order).push("any")));
        let _topic = bus.subscribe("t", Arc::new(move |_: &Event| lock(&topic_order).push("topic")));

        bus.publish("t", event(1));
        bus.publish("other", event(2));

        assert_eq!(*lock(&order), vec!["topic", "any", "any"]);
    }

    #[test]
    fn test_panicking_handler_is_isolated() {
        let bus = TopicBus::new("test");
        let _bad = bus.subscribe("t", Arc::new(|_: &Event| panic!("handler failure")));
        let (seen, handler) = collector();
        let _good = bus.subscribe("t", handler);

        bus.publish("t", event(1));
        bus.publish("t", event(2));

        assert_eq!(*lock(&seen), vec![1, 2]);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let bus = TopicBus::new("test");
        let (seen, handler) = collector();
        let sub = bus.subscribe("t", handler);

        bus.publish("t", event(1));
        sub.unsubscribe();
        bus.publish("t", event(2));

        assert_eq!(*lock(&seen), vec![1]);
        assert_eq!(bus.handler_count("t"), 0);
    }

    #[test]
    fn test_zero_sized_queue_rejected() {
        let bus = TopicBus::new("test");
        let result = bus.set_policy("t", QueuePolicy::queued(0, DropPolicy::DropOldest));
        assert!(matches!(result, Err(EventError::InvalidPolicy { .. })));
    }

    #[tokio::test]
    async fn test_queue_drains_on_next_tick() {
        let bus = TopicBus::new("test");
        bus.set_policy("t", QueuePolicy::queued(8, DropPolicy::DropOldest))
            .unwrap();
        let (seen, handler) = collector();
        let _sub = bus.subscribe("t", handler);

        bus.publish("t", event(1));
        bus.publish("t", event(2));
        assert!(lock(&seen).is_empty());
        assert_eq!(bus.queued_len("t"), 2);

        tokio::task::yield_now().await;

        assert_eq!(*lock(&seen), vec![1, 2]);
        assert_eq!(bus.queued_len("t"), 0);
    }

    #[tokio::test]
    async fn test_queue_overflow_policies() {
        let bus = TopicBus::new("test");
        bus.set_policy("old", QueuePolicy::queued(3, DropPolicy::DropOldest))
            .unwrap();
        bus.set_policy("new", QueuePolicy::queued(3, DropPolicy::DropNewest))
            .unwrap();
        let (old_seen, old_handler) = collector();
        let (new_seen, new_handler) = collector();
        let _a = bus.subscribe("old", old_handler);
        let _b = bus.subscribe("new", new_handler);

        for n in 1..=5 {
            bus.publish("old", event(n));
            bus.publish("new", event(n));
        }
        tokio::task::yield_now().await;

        assert_eq!(*lock(&old_seen), vec![3, 4, 5]);
        assert_eq!(*lock(&new_seen), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_drain_continues_after_panic() {
        let bus = TopicBus::new("test");
        bus.set_policy("t", QueuePolicy::queued(8, DropPolicy::DropOldest))
            .unwrap();
        let _bad = bus.subscribe(
            "t",
            Arc::new(|ev: &Event| {
                if ev.payload["n"] == 1 {
                    panic!("first event fails");
                }
            }),
        );
        let (seen, handler) = collector();
        let _good = bus.subscribe("t", handler);

        bus.publish("t", event(1));
        bus.publish("t", event(2));
        tokio::task::yield_now().await;

        assert_eq!(*lock(&seen), vec![1, 2]);
    }
}
