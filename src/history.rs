use std::{collections::VecDeque, sync::Mutex};

use crate::{event::Event, guard::lock, Error, RelayResult};

/// Bounded FIFO of recent events. Pushing past capacity evicts the oldest entry.
#[derive(Debug)]
pub struct EventHistory {
    capacity: usize,
    events: Mutex<VecDeque<Event>>,
}

impl EventHistory {
    pub fn new(capacity: usize) -> RelayResult<Self> {
        if capacity == 0 {
            return Err(Error::Config(
                "history capacity must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            capacity,
            events: Mutex::new(VecDeque::with_capacity(capacity)),
        })
    }

    pub fn push(&self, event: Event) {
        let mut events = lock(&self.events);
        if events.len() == self.capacity {
            events.pop_front();
        }
        events.push_back(event);
    }

    /// Oldest first.
    pub fn to_vec(&self) -> Vec<Event> {
        lock(&self.events).iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.events).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&self) {
        lock(&self.events).clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_zero_capacity_rejected() {
        assert!(matches!(EventHistory::new(0), Err(Error::Config(_))));
    }

    #[test]
    fn test_evicts_oldest() {
        let history = EventHistory::new(2).unwrap();
        for n in 0..3 {
            history.push(Event::new("test", "t", json!(n)));
        }
        let payloads: Vec<_> = history.to_vec().into_iter().map(|e| e.payload).collect();
        assert_eq!(payloads, vec![json!(1), json!(2)]);
        assert_eq!(history.len(), 2);
        assert_eq!(history.capacity(), 2);

        history.clear();
        assert!(history.is_empty());
    }
}
