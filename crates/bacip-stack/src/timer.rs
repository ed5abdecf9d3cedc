//! Single-owner timer wheel for the event loop.
//!
//! Scheduling the same key again replaces the previous deadline, so a state
//! machine holds at most one outstanding timer. Cancellation is lazy: stale
//! heap entries are skipped when they surface.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::hash::Hash;
use tokio::time::Instant;

#[derive(Debug)]
pub struct TimerWheel<K> {
    heap: BinaryHeap<Reverse<(Instant, u64)>>,
    live: HashMap<u64, K>,
    by_key: HashMap<K, u64>,
    next_seq: u64,
}

impl<K: Eq + Hash + Clone> TimerWheel<K> {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            live: HashMap::new(),
            by_key: HashMap::new(),
            next_seq: 0,
        }
    }

    /// Arm (or re-arm) the timer for `key`.
    pub fn schedule(&mut self, key: K, deadline: Instant) {
        if let Some(old) = self.by_key.remove(&key) {
            self.live.remove(&old);
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.live.insert(seq, key.clone());
        self.by_key.insert(key, seq);
        self.heap.push(Reverse((deadline, seq)));
    }

    pub fn cancel(&mut self, key: &K) {
        if let Some(seq) = self.by_key.remove(key) {
            self.live.remove(&seq);
        }
    }

    /// Earliest armed deadline, skipping cancelled entries.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse((deadline, seq))) = self.heap.peek().copied() {
            if self.live.contains_key(&seq) {
                return Some(deadline);
            }
            self.heap.pop();
        }
        None
    }

    /// Fire everything due at `now`, in schedule order.
    pub fn pop_due(&mut self, now: Instant) -> Vec<K> {
        let mut due = Vec::new();
        while let Some(Reverse((deadline, seq))) = self.heap.peek().copied() {
            if deadline > now {
                break;
            }
            self.heap.pop();
            if let Some(key) = self.live.remove(&seq) {
                self.by_key.remove(&key);
                due.push(key);
            }
        }
        due
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }
}

impl<K: Eq + Hash + Clone> Default for TimerWheel<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::TimerWheel;
    use std::time::Duration;
    use tokio::time::Instant;

    #[test]
    fn fires_in_deadline_order() {
        let mut wheel = TimerWheel::new();
        let now = Instant::now();
        wheel.schedule("b", now + Duration::from_secs(2));
        wheel.schedule("a", now + Duration::from_secs(1));
        assert_eq!(wheel.next_deadline(), Some(now + Duration::from_secs(1)));
        assert_eq!(wheel.pop_due(now + Duration::from_secs(3)), vec!["a", "b"]);
        assert!(wheel.is_empty());
    }

    #[test]
    fn rescheduling_replaces_the_deadline() {
        let mut wheel = TimerWheel::new();
        let now = Instant::now();
        wheel.schedule("x", now + Duration::from_secs(1));
        wheel.schedule("x", now + Duration::from_secs(5));
        assert!(wheel.pop_due(now + Duration::from_secs(2)).is_empty());
        assert_eq!(wheel.pop_due(now + Duration::from_secs(5)), vec!["x"]);
    }

    #[test]
    fn cancel_suppresses_firing() {
        let mut wheel = TimerWheel::new();
        let now = Instant::now();
        wheel.schedule("x", now + Duration::from_secs(1));
        wheel.cancel(&"x");
        assert!(wheel.pop_due(now + Duration::from_secs(2)).is_empty());
        assert_eq!(wheel.next_deadline(), None);
    }
}
