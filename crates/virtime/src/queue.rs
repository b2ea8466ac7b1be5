//! Due-time index and timer registry.
//!
//! The index is a red-black tree of due buckets, keyed by due timestamp
//! only; each bucket holds the FIFO of timer ids scheduled for that
//! instant. The registry maps a live timer id to its delay, repeat flag,
//! and callback. Cancellation is lazy: it removes the registry entry and
//! leaves the id behind in its bucket as a tombstone, filtered out at pop
//! time instead of being searched for and spliced eagerly.

use std::cmp::Ordering;
use std::collections::{HashMap, VecDeque};

use virtime_tree::RbTree;

/// Identifier of a scheduled timer. Assigned once, monotonically
/// increasing, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId(pub(crate) u64);

impl TimerId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// A scheduled timer's callback. Arguments travel inside the closure.
pub type TimerCallback = Box<dyn FnMut() + Send>;

struct TimerEntry {
    delay: u64,
    repeat: bool,
    /// Taken out for the duration of an invocation; an entry observed
    /// without its callback is mid-invocation.
    callback: Option<TimerCallback>,
}

struct DueBucket {
    due: u64,
    ids: VecDeque<TimerId>,
}

impl DueBucket {
    fn probe(due: u64) -> Self {
        Self {
            due,
            ids: VecDeque::new(),
        }
    }
}

fn by_due(a: &DueBucket, b: &DueBucket) -> Ordering {
    a.due.cmp(&b.due)
}

/// A timer popped from the index, ready to fire. The callback is lent to
/// the caller; repeating timers hand it back via
/// [`TimerQueue::restore_callback`] once the invocation returns.
pub(crate) struct FiredTimer {
    pub id: TimerId,
    pub due: u64,
    pub repeat: bool,
    pub callback: TimerCallback,
}

pub(crate) struct TimerQueue {
    buckets: RbTree<DueBucket>,
    registry: HashMap<TimerId, TimerEntry>,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self {
            buckets: RbTree::new(by_due),
            registry: HashMap::new(),
        }
    }

    /// Live (scheduled, not cancelled, not fired) timer count.
    pub fn len(&self) -> usize {
        self.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    pub fn schedule(&mut self, id: TimerId, due: u64, delay: u64, repeat: bool, callback: TimerCallback) {
        self.registry.insert(
            id,
            TimerEntry {
                delay,
                repeat,
                callback: Some(callback),
            },
        );
        self.append(due, id);
    }

    fn append(&mut self, due: u64, id: TimerId) {
        if let Some(bucket) = self.buckets.get_mut(&DueBucket::probe(due)) {
            bucket.ids.push_back(id);
        } else {
            let mut bucket = DueBucket::probe(due);
            bucket.ids.push_back(id);
            self.buckets.insert(bucket);
        }
    }

    /// Lazy cancellation: drops the registry entry, leaving the bucket id
    /// as a tombstone. Idempotent.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        self.registry.remove(&id).is_some()
    }

    /// Earliest due timestamp with at least one live timer.
    ///
    /// Buckets holding only tombstones are removed on the way (front
    /// compaction), so a cancel-heavy workload cannot pin the tree minimum.
    pub fn peek_min_due(&mut self) -> Option<u64> {
        loop {
            let (due, any_live) = {
                let bucket = self.buckets.min()?;
                let any_live = bucket.ids.iter().any(|id| self.registry.contains_key(id));
                (bucket.due, any_live)
            };
            if any_live {
                return Some(due);
            }
            self.buckets.remove(&DueBucket::probe(due));
        }
    }

    /// Pops the earliest live timer due at or before `limit`, FIFO among
    /// timers sharing a due timestamp.
    ///
    /// A repeating timer is re-armed at `due + delay` before it is
    /// returned, so it is already visible to the in-progress advance and
    /// to its own callback.
    pub fn pop_due_at_or_before(&mut self, limit: u64) -> Option<FiredTimer> {
        loop {
            let due = self.peek_min_due()?;
            if due > limit {
                return None;
            }

            let popped = {
                let bucket = self
                    .buckets
                    .get_mut(&DueBucket::probe(due))
                    .expect("peeked bucket exists");
                loop {
                    match bucket.ids.pop_front() {
                        Some(id) if self.registry.contains_key(&id) => break Some((id, bucket.ids.is_empty())),
                        Some(_) => continue,
                        None => break None,
                    }
                }
            };

            let Some((id, drained)) = popped else {
                // Tombstones only; peek_min_due said otherwise, so the
                // registry changed under us. Drop the bucket and retry.
                self.buckets.remove(&DueBucket::probe(due));
                continue;
            };
            if drained {
                self.buckets.remove(&DueBucket::probe(due));
            }

            let entry = self.registry.get_mut(&id).expect("popped id is live");
            if entry.repeat {
                let delay = entry.delay;
                let callback = entry.callback.take();
                let next_due = due.saturating_add(delay);
                self.append(next_due, id);
                match callback {
                    Some(callback) => {
                        return Some(FiredTimer {
                            id,
                            due,
                            repeat: true,
                            callback,
                        })
                    }
                    // Mid-invocation under a nested advance; this
                    // occurrence is skipped.
                    None => continue,
                }
            } else {
                let entry = self.registry.remove(&id).expect("popped id is live");
                match entry.callback {
                    Some(callback) => {
                        return Some(FiredTimer {
                            id,
                            due,
                            repeat: false,
                            callback,
                        })
                    }
                    None => continue,
                }
            }
        }
    }

    /// Hands a lent repeating callback back to its entry. A no-op when the
    /// timer was cancelled during the invocation.
    pub fn restore_callback(&mut self, id: TimerId, callback: TimerCallback) {
        if let Some(entry) = self.registry.get_mut(&id) {
            entry.callback = Some(callback);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn noop() -> TimerCallback {
        Box::new(|| {})
    }

    fn drain(queue: &mut TimerQueue, limit: u64) -> Vec<(TimerId, u64)> {
        let mut out = Vec::new();
        while let Some(fired) = queue.pop_due_at_or_before(limit) {
            assert!(!fired.repeat);
            out.push((fired.id, fired.due));
        }
        out
    }

    #[test]
    fn pops_in_due_order() {
        let mut queue = TimerQueue::new();
        queue.schedule(TimerId(1), 300, 300, false, noop());
        queue.schedule(TimerId(2), 100, 100, false, noop());
        queue.schedule(TimerId(3), 200, 200, false, noop());
        let order: Vec<u64> = drain(&mut queue, 1000).iter().map(|(_, due)| *due).collect();
        assert_eq!(order, [100, 200, 300]);
        assert!(queue.is_empty());
    }

    #[test]
    fn same_due_pops_fifo() {
        let mut queue = TimerQueue::new();
        for id in 1..=4u64 {
            queue.schedule(TimerId(id), 50, 50, false, noop());
        }
        let order: Vec<u64> = drain(&mut queue, 50).iter().map(|(id, _)| id.as_u64()).collect();
        assert_eq!(order, [1, 2, 3, 4]);
    }

    #[test]
    fn limit_is_inclusive() {
        let mut queue = TimerQueue::new();
        queue.schedule(TimerId(1), 100, 100, false, noop());
        queue.schedule(TimerId(2), 101, 101, false, noop());
        assert_eq!(drain(&mut queue, 100).len(), 1);
        assert_eq!(queue.peek_min_due(), Some(101));
    }

    #[test]
    fn cancelled_ids_are_skipped_silently() {
        let mut queue = TimerQueue::new();
        queue.schedule(TimerId(1), 100, 100, false, noop());
        queue.schedule(TimerId(2), 100, 100, false, noop());
        queue.schedule(TimerId(3), 100, 100, false, noop());
        assert!(queue.cancel(TimerId(2)));
        assert!(!queue.cancel(TimerId(2)));
        let order: Vec<u64> = drain(&mut queue, 100).iter().map(|(id, _)| id.as_u64()).collect();
        assert_eq!(order, [1, 3]);
    }

    #[test]
    fn tombstone_only_buckets_are_compacted() {
        let mut queue = TimerQueue::new();
        queue.schedule(TimerId(1), 100, 100, false, noop());
        queue.schedule(TimerId(2), 200, 200, false, noop());
        queue.cancel(TimerId(1));
        assert_eq!(queue.peek_min_due(), Some(200));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn repeating_timer_rearms_before_delivery() {
        let mut queue = TimerQueue::new();
        queue.schedule(TimerId(1), 100, 100, true, noop());
        let fired = queue.pop_due_at_or_before(1000).expect("due");
        assert_eq!(fired.due, 100);
        assert!(fired.repeat);
        assert_eq!(queue.peek_min_due(), Some(200));
        queue.restore_callback(fired.id, fired.callback);
        let again = queue.pop_due_at_or_before(1000).expect("re-armed");
        assert_eq!(again.due, 200);
    }

    #[test]
    fn occurrences_due_while_the_callback_is_out_are_skipped() {
        let mut queue = TimerQueue::new();
        queue.schedule(TimerId(1), 100, 100, true, noop());
        let fired = queue.pop_due_at_or_before(1000).expect("due");
        // A nested drain while the callback is lent out skips every
        // occurrence inside its window, re-arming past it.
        assert!(queue.pop_due_at_or_before(500).is_none());
        assert_eq!(queue.peek_min_due(), Some(600));
        queue.restore_callback(fired.id, fired.callback);
        let again = queue.pop_due_at_or_before(1000).expect("next occurrence");
        assert_eq!(again.due, 600);
    }

    #[test]
    fn repeating_timer_cancelled_mid_invocation_stays_dead() {
        let mut queue = TimerQueue::new();
        queue.schedule(TimerId(1), 100, 100, true, noop());
        let fired = queue.pop_due_at_or_before(100).expect("due");
        queue.cancel(TimerId(1));
        queue.restore_callback(fired.id, fired.callback);
        assert!(queue.is_empty());
        assert_eq!(queue.peek_min_due(), None);
    }

    proptest! {
        /// Random schedule/cancel interleavings always drain in
        /// (due, insertion-order) order.
        #[test]
        fn drains_in_due_then_fifo_order(ops in proptest::collection::vec((0u64..64, any::<bool>()), 1..128)) {
            let mut queue = TimerQueue::new();
            let mut expected = Vec::new();
            let mut next_id = 1u64;
            for (due, cancel_previous) in ops {
                let id = TimerId(next_id);
                next_id += 1;
                queue.schedule(id, due, due, false, Box::new(|| {}));
                expected.push((due, id));
                if cancel_previous && expected.len() > 1 {
                    let (_, victim) = expected.remove(expected.len() / 2);
                    queue.cancel(victim);
                }
            }
            expected.sort_by_key(|(due, id)| (*due, id.as_u64()));

            let mut drained = Vec::new();
            while let Some(fired) = queue.pop_due_at_or_before(u64::MAX) {
                drained.push((fired.due, fired.id));
            }
            prop_assert_eq!(drained, expected);
            prop_assert!(queue.is_empty());
        }
    }
}
