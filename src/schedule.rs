use std::cmp::Ordering;
use std::collections::BinaryHeap;

use tokio::time::Instant;

// Deferred one-shot actions. Due entries come out in deadline order; entries
// sharing a deadline come out in the order they were scheduled.

struct Entry<A> {
    at: Instant,
    seq: u64,
    action: A,
}

impl<A> PartialEq for Entry<A> {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl<A> Eq for Entry<A> {}

impl<A> PartialOrd for Entry<A> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<A> Ord for Entry<A> {
    // Reversed: BinaryHeap is a max-heap and we want the earliest first.
    fn cmp(&self, other: &Self) -> Ordering {
        (other.at, other.seq).cmp(&(self.at, self.seq))
    }
}

pub struct Schedule<A> {
    heap: BinaryHeap<Entry<A>>,
    seq: u64,
}

impl<A> Default for Schedule<A> {
    fn default() -> Self {
        Self { heap: BinaryHeap::new(), seq: 0 }
    }
}

impl<A> Schedule<A> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn at(&mut self, at: Instant, action: A) {
        self.seq += 1;
        self.heap.push(Entry { at, seq: self.seq, action });
    }

    /// Removes and returns every action due at `now`.
    pub fn take_due(&mut self, now: Instant) -> Vec<A> {
        let mut due = Vec::new();
        while self.heap.peek().is_some_and(|e| e.at <= now) {
            if let Some(e) = self.heap.pop() {
                due.push(e.action);
            }
        }
        due
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
