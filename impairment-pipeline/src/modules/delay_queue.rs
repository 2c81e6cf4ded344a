use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use tokio::time::Instant;

/// Items waiting for their release time, released earliest first and in push order on ties
///
/// Evicted items leave stale entries behind in the heap and released ones in the admission
/// order. Both are skipped lazily, and the heap's top always refers to a live item.
pub(crate) struct DelayQueue<T> {
    schedule: BinaryHeap<Reverse<(Instant, u64)>>,
    admitted: VecDeque<u64>,
    items: HashMap<u64, T>,
    next_number: u64,
}

impl<T> DelayQueue<T> {
    pub(crate) fn new() -> Self {
        Self {
            schedule: BinaryHeap::new(),
            admitted: VecDeque::new(),
            items: HashMap::new(),
            next_number: 0,
        }
    }

    pub(crate) fn push(&mut self, item: T, release_at: Instant) {
        let number = self.next_number;
        self.next_number += 1;

        self.schedule.push(Reverse((release_at, number)));
        self.admitted.push_back(number);
        self.items.insert(number, item);
    }

    pub(crate) fn next_release(&self) -> Option<Instant> {
        self.schedule.peek().map(|Reverse((release_at, _))| *release_at)
    }

    pub(crate) fn pop_due(&mut self, now: Instant) -> Option<T> {
        if self.next_release()? > now {
            return None;
        }

        let Reverse((_, number)) = self.schedule.pop()?;
        let item = self.items.remove(&number);
        self.discard_stale();
        item
    }

    /// Removes the item that was pushed first, regardless of its release time
    pub(crate) fn evict_oldest(&mut self) -> Option<T> {
        let item = loop {
            let number = self.admitted.pop_front()?;
            if let Some(item) = self.items.remove(&number) {
                break item;
            }
        };

        self.discard_stale();
        Some(item)
    }

    fn discard_stale(&mut self) {
        while let Some(Reverse((_, number))) = self.schedule.peek() {
            if self.items.contains_key(number) {
                break;
            }
            self.schedule.pop();
        }

        while let Some(number) = self.admitted.front() {
            if self.items.contains_key(number) {
                break;
            }
            self.admitted.pop_front();
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
