//! Wake Queue
//!
//! Bounded queue of wake signals from the scheduler to the turn engine.
//! Identical consecutive reasons coalesce so a flapping task cannot
//! flood the engine.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::Utc;

use crate::types::WakeSignal;

/// Default queue capacity; pushes beyond this drop the oldest entry.
const DEFAULT_CAPACITY: usize = 32;

pub struct WakeQueue {
    inner: Mutex<VecDeque<WakeSignal>>,
    capacity: usize,
}

impl WakeQueue {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            capacity,
        }
    }

    /// Append a wake signal. A signal whose reason matches the most
    /// recently queued one is coalesced into it.
    pub fn push(&self, source: &str, reason: &str) {
        let mut queue = self.inner.lock().unwrap();
        if let Some(last) = queue.back() {
            if last.reason == reason {
                return;
            }
        }
        if queue.len() >= self.capacity {
            queue.pop_front();
        }
        queue.push_back(WakeSignal {
            reason: reason.to_string(),
            source: source.to_string(),
            at: Utc::now().to_rfc3339(),
        });
    }

    /// Drain the oldest pending signal.
    pub fn pop(&self) -> Option<WakeSignal> {
        self.inner.lock().unwrap().pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }
}

impl Default for WakeQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coalesces_identical_consecutive_reasons() {
        let queue = WakeQueue::new();
        queue.push("check_credits", "credits low");
        queue.push("check_credits", "credits low");
        queue.push("check_social_inbox", "1 new message");
        queue.push("check_credits", "credits low");
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn drains_in_fifo_order() {
        let queue = WakeQueue::new();
        queue.push("a", "first");
        queue.push("b", "second");
        assert_eq!(queue.pop().unwrap().reason, "first");
        assert_eq!(queue.pop().unwrap().reason, "second");
        assert!(queue.pop().is_none());
    }

    #[test]
    fn bounded_drops_oldest() {
        let queue = WakeQueue::with_capacity(2);
        queue.push("a", "one");
        queue.push("b", "two");
        queue.push("c", "three");
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop().unwrap().reason, "two");
    }
}
