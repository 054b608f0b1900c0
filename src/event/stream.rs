//! # Event Streams
//!
//! A small push-based stream abstraction used to assemble workflow pipelines.
//!
//! An [`EventStream`] is a recipe: nothing happens until [`EventStream::subscribe`] is
//! called, and every subscription builds its own chain of handlers. The returned
//! [`Subscription`] owns the teardown of the whole chain (bus handlers, timers, worker
//! tasks), so dropping a pipeline is a single `unsubscribe()`.
//!
//! ```text
//!   TopicBus ──▶ source ──▶ filter ──▶ debounce ──▶ ... ──▶ sink
//!                  ▲                       │
//!                  └── Subscription ◀──────┘ (teardowns registered on subscribe)
//! ```
//!
//! Time-based operators spawn onto the ambient tokio runtime and therefore must be
//! subscribed from within one.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use tokio::{sync::mpsc, time::Instant};

use super::model::Event;
use crate::guard::lock;

pub type Sink = Arc<dyn Fn(Event) + Send + Sync>;

type Teardown = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct SubscriptionInner {
    closed: AtomicBool,
    teardowns: Mutex<Vec<Teardown>>,
}

/// Handle to an active subscription. Clones refer to the same subscription.
///
/// `unsubscribe` is idempotent. Teardowns added after close run immediately.
#[derive(Clone, Default)]
#[must_use = "dropping a Subscription does not unsubscribe; keep it to stop delivery later"]
pub struct Subscription {
    inner: Arc<SubscriptionInner>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Subscription {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_teardown<F>(teardown: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let subscription = Self::new();
        subscription.add_teardown(teardown);
        subscription
    }

    pub fn add_teardown<F>(&self, teardown: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_closed() {
            teardown();
            return;
        }
        lock(&self.inner.teardowns).push(Box::new(teardown));
    }

    /// Ties a child subscription to this one.
    pub fn add(&self, child: Subscription) {
        self.add_teardown(move || child.unsubscribe());
    }

    pub fn unsubscribe(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let teardowns = std::mem::take(&mut *lock(&self.inner.teardowns));
        for teardown in teardowns {
            teardown();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

type SubscribeFn = dyn Fn(Sink) -> Subscription + Send + Sync;

/// Cold, push-based event stream.
#[derive(Clone)]
pub struct EventStream {
    subscribe_fn: Arc<SubscribeFn>,
}

impl EventStream {
    pub fn new<F>(subscribe_fn: F) -> Self
    where
        F: Fn(Sink) -> Subscription + Send + Sync + 'static,
    {
        Self {
            subscribe_fn: Arc::new(subscribe_fn),
        }
    }

    /// A stream that never emits.
    pub fn empty() -> Self {
        Self::new(|_| Subscription::new())
    }

    pub fn subscribe<F>(&self, on_event: F) -> Subscription
    where
        F: Fn(Event) + Send + Sync + 'static,
    {
        self.subscribe_sink(Arc::new(on_event))
    }

    pub fn subscribe_sink(&self, sink: Sink) -> Subscription {
        (self.subscribe_fn)(sink)
    }

    pub fn filter<P>(self, predicate: P) -> Self
    where
        P: Fn(&Event) -> bool + Send + Sync + 'static,
    {
        let predicate = Arc::new(predicate);
        Self::new(move |sink| {
            let predicate = predicate.clone();
            self.subscribe(move |event| {
                if predicate(&event) {
                    sink(event)
                }
            })
        })
    }

    pub fn map<F>(self, transform: F) -> Self
    where
        F: Fn(Event) -> Event + Send + Sync + 'static,
    {
        self.filter_map(move |event| Some(transform(event)))
    }

    pub fn filter_map<F>(self, transform: F) -> Self
    where
        F: Fn(Event) -> Option<Event> + Send + Sync + 'static,
    {
        let transform = Arc::new(transform);
        Self::new(move |sink| {
            let transform = transform.clone();
            self.subscribe(move |event| {
                if let Some(next) = transform(event) {
                    sink(next)
                }
            })
        })
    }

    /// Runs a side effect for each event and passes it through unchanged.
    pub fn tap<F>(self, effect: F) -> Self
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let effect = Arc::new(effect);
        Self::new(move |sink| {
            let effect = effect.clone();
            self.subscribe(move |event| {
                effect(&event);
                sink(event)
            })
        })
    }

    /// Emits the most recent event once `quiet` has elapsed without another arrival.
    pub fn debounce(self, quiet: Duration) -> Self {
        Self::new(move |sink| {
            let subscription = Subscription::new();
            let generation = Arc::new(AtomicU64::new(0));
            let guard = subscription.clone();
            let upstream = self.subscribe(move |event| {
                let mine = generation.fetch_add(1, Ordering::SeqCst) + 1;
                let generation = generation.clone();
                let guard = guard.clone();
                let sink = sink.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(quiet).await;
                    if generation.load(Ordering::SeqCst) == mine && !guard.is_closed() {
                        sink(event);
                    }
                });
            });
            subscription.add(upstream);
            subscription
        })
    }

    /// Leading-edge throttle: emits an event, then ignores arrivals for `window`.
    pub fn throttle(self, window: Duration) -> Self {
        Self::new(move |sink| {
            let last_emit: Arc<Mutex<Option<Instant>>> = Arc::new(Mutex::new(None));
            self.subscribe(move |event| {
                let now = Instant::now();
                let pass = {
                    let mut last = lock(&last_emit);
                    match *last {
                        Some(at) if now.duration_since(at) < window => false,
                        _ => {
                            *last = Some(now);
                            true
                        }
                    }
                };
                if pass {
                    sink(event)
                }
            })
        })
    }

    /// Shifts each event by `by`, preserving order.
    pub fn delay(self, by: Duration) -> Self {
        Self::new(move |sink| {
            let subscription = Subscription::new();
            let (tx, mut rx) = mpsc::unbounded_channel::<(Instant, Event)>();
            let guard = subscription.clone();
            let worker = tokio::spawn(async move {
                while let Some((due, event)) = rx.recv().await {
                    tokio::time::sleep_until(due).await;
                    if guard.is_closed() {
                        break;
                    }
                    sink(event);
                }
            });
            let upstream = self.subscribe(move |event| {
                let _ = tx.send((Instant::now() + by, event));
            });
            subscription.add(upstream);
            subscription.add_teardown(move || worker.abort());
            subscription
        })
    }

    pub fn merge_with(self, others: Vec<EventStream>) -> Self {
        let mut streams = vec![self];
        streams.extend(others);
        merge(streams)
    }
}

/// Interleaves every stream into one.
pub fn merge(streams: Vec<EventStream>) -> EventStream {
    EventStream::new(move |sink| {
        let subscription = Subscription::new();
        for stream in &streams {
            subscription.add(stream.subscribe_sink(sink.clone()));
        }
        subscription
    })
}

/// Mirrors whichever stream emits first and drops the others. With a `window`, the
/// whole race ends when the window elapses, whether or not anything has won.
pub fn race(streams: Vec<EventStream>, window: Option<Duration>) -> EventStream {
    EventStream::new(move |sink| {
        let subscription = Subscription::new();
        let winner: Arc<Mutex<Option<usize>>> = Arc::new(Mutex::new(None));
        let contenders: Arc<Mutex<Vec<Subscription>>> = Arc::new(Mutex::new(Vec::new()));

        for (index, stream) in streams.iter().enumerate() {
            let winner = winner.clone();
            let contenders_ref = contenders.clone();
            let guard = subscription.clone();
            let sink = sink.clone();
            let child = stream.subscribe(move |event| {
                if guard.is_closed() {
                    return;
                }
                let (wins, first) = {
                    let mut current = lock(&winner);
                    match *current {
                        None => {
                            *current = Some(index);
                            (true, true)
                        }
                        Some(won) => (won == index, false),
                    }
                };
                if first {
                    let losers: Vec<Subscription> = lock(&contenders_ref)
                        .iter()
                        .enumerate()
                        .filter(|(i, _)| *i != index)
                        .map(|(_, sub)| sub.clone())
                        .collect();
                    for loser in losers {
                        loser.unsubscribe();
                    }
                }
                if wins {
                    sink(event);
                }
            });
            lock(&contenders).push(child.clone());
            subscription.add(child);
        }

        if let Some(window) = window {
            let guard = subscription.clone();
            let timer = tokio::spawn(async move {
                tokio::time::sleep(window).await;
                guard.unsubscribe();
            });
            subscription.add_teardown(move || timer.abort());
        }
        subscription
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::topic_bus::TopicBus;
    use serde_json::json;

    fn bus_stream(bus: &TopicBus, topic: &str) -> EventStream {
        let bus = bus.clone();
        let topic = topic.to_string();
        EventStream::new(move |sink| {
            let subscription = Subscription::new();
            let guard = subscription.clone();
            subscription.add(bus.subscribe(
                &topic,
                Arc::new(move |event: &Event| {
                    if !guard.is_closed() {
                        sink(event.clone())
                    }
                }),
            ));
            subscription
        })
    }

    fn event(n: i64) -> Event {
        Event::new("test", "t", json!({ "n": n }))
    }

    fn collect(stream: &EventStream) -> (Arc<Mutex<Vec<i64>>>, Subscription) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let subscription = stream.subscribe(move |event| {
            lock(&sink).push(event.payload["n"].as_i64().unwrap_or(-1));
        });
        (seen, subscription)
    }

    #[test]
    fn test_filter_and_map() {
        let bus = TopicBus::new("test");
        let stream = bus_stream(&bus, "t")
            .filter(|event| event.payload["n"].as_i64().unwrap_or(0) % 2 == 0)
            .map(|event| {
                let n = event.payload["n"].as_i64().unwrap_or(0);
                event.with_payload(json!({ "n": n * 10 }))
            });
        let (seen, _sub) = collect(&stream);

        for n in 1..=4 {
            bus.publish("t", event(n));
        }

        assert_eq!(*lock(&seen), vec![20, 40]);
    }

    #[test]
    fn test_unsubscribe_detaches_chain() {
        let bus = TopicBus::new("test");
        let stream = bus_stream(&bus, "t").tap(|_| {});
        let (seen, sub) = collect(&stream);

        bus.publish("t", event(1));
        sub.unsubscribe();
        sub.unsubscribe();
        bus.publish("t", event(2));

        assert_eq!(*lock(&seen), vec![1]);
        assert_eq!(bus.handler_count("t"), 0);
    }

    #[test]
    fn test_merge_interleaves() {
        let bus = TopicBus::new("test");
        let stream = merge(vec![bus_stream(&bus, "a"), bus_stream(&bus, "b")]);
        let (seen, _sub) = collect(&stream);

        bus.publish("a", event(1));
        bus.publish("b", event(2));
        bus.publish("c", event(3));

        assert_eq!(*lock(&seen), vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_emits_last_after_quiet() {
        let bus = TopicBus::new("test");
        let stream = bus_stream(&bus, "t").debounce(Duration::from_millis(100));
        let (seen, _sub) = collect(&stream);

        bus.publish("t", event(1));
        tokio::time::sleep(Duration::from_millis(50)).await;
        bus.publish("t", event(2));
        tokio::time::sleep(Duration::from_millis(50)).await;
        bus.publish("t", event(3));
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(*lock(&seen), vec![3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_is_leading_edge() {
        let bus = TopicBus::new("test");
        let stream = bus_stream(&bus, "t").throttle(Duration::from_millis(100));
        let (seen, _sub) = collect(&stream);

        bus.publish("t", event(1));
        bus.publish("t", event(2));
        tokio::time::sleep(Duration::from_millis(120)).await;
        bus.publish("t", event(3));

        assert_eq!(*lock(&seen), vec![1, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_preserves_order() {
        let bus = TopicBus::new("test");
        let stream = bus_stream(&bus, "t").delay(Duration::from_millis(100));
        let (seen, _sub) = collect(&stream);

        bus.publish("t", event(1));
        bus.publish("t", event(2));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(lock(&seen).is_empty());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(*lock(&seen), vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_race_first_source_wins() {
        let bus = TopicBus::new("test");
        let stream = race(vec![bus_stream(&bus, "a"), bus_stream(&bus, "b")], None);
        let (seen, _sub) = collect(&stream);

        bus.publish("b", event(1));
        bus.publish("a", event(2));
        bus.publish("b", event(3));

        assert_eq!(*lock(&seen), vec![1, 3]);
        assert_eq!(bus.handler_count("a"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_race_window_closes_everything() {
        let bus = TopicBus::new("test");
        let stream = race(
            vec![bus_stream(&bus, "a"), bus_stream(&bus, "b")],
            Some(Duration::from_millis(100)),
        );
        let (seen, sub) = collect(&stream);

        tokio::time::sleep(Duration::from_millis(150)).await;
        bus.publish("a", event(1));

        assert!(lock(&seen).is_empty());
        assert!(sub.is_closed() || bus.handler_count("a") == 0);
    }
}
