mod common;

use std::sync::{Arc, Mutex};

use proptest::prelude::*;
use relayflow::event::{topic_bus::Handler, DropPolicy, Event, QueuePolicy, TopicBus};
use serde_json::json;

fn collecting_bus(policy: Option<QueuePolicy>) -> (TopicBus, Arc<Mutex<Vec<i64>>>) {
    let bus = TopicBus::new("prop");
    if let Some(policy) = policy {
        bus.set_policy("t", policy).unwrap();
    }
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let handler: Handler = Arc::new(move |event: &Event| {
        sink.lock()
            .unwrap()
            .push(event.payload["n"].as_i64().unwrap_or(-1));
    });
    // Kept for the bus lifetime; dropping a subscription does not detach it.
    let _ = bus.subscribe("t", handler);
    (bus, seen)
}

proptest! {
    #[test]
    fn sync_publish_preserves_order(count in 1usize..50) {
        let (bus, seen) = collecting_bus(None);
        for n in 0..count {
            bus.publish("t", Event::new("prop", "t", json!({ "n": n })));
        }
        let expected: Vec<i64> = (0..count as i64).collect();
        prop_assert_eq!(seen.lock().unwrap().clone(), expected);
    }

    #[test]
    fn queue_overflow_retains_max_size(
        max_size in 1usize..16,
        published in 1usize..64,
        drop_newest in any::<bool>(),
    ) {
        let drop = if drop_newest { DropPolicy::DropNewest } else { DropPolicy::DropOldest };
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let (retained, delivered) = runtime.block_on(async {
            let (bus, seen) = collecting_bus(Some(QueuePolicy::queued(max_size, drop)));
            for n in 0..published {
                bus.publish("t", Event::new("prop", "t", json!({ "n": n })));
            }
            let retained = bus.queued_len("t");
            tokio::task::yield_now().await;
            tokio::task::yield_now().await;
            let delivered = seen.lock().unwrap().clone();
            (retained, delivered)
        });

        let kept = published.min(max_size);
        prop_assert_eq!(retained, kept);
        let expected: Vec<i64> = if drop_newest {
            (0..kept as i64).collect()
        } else {
            ((published - kept) as i64..published as i64).collect()
        };
        prop_assert_eq!(delivered, expected);
    }
}
