#![forbid(unsafe_code)]

//! Deadline bookkeeping for the event loop: key eviction, blocking-pop
//! timeouts and the periodic save check all run off one `TimerQueue`.

use std::collections::{BTreeMap, HashMap};

/// Cancellation handle for a scheduled timer. Unique for the lifetime
/// of the queue that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

/// A monotonic deadline queue. Deadlines are caller-supplied
/// milliseconds on whatever clock the caller uses consistently;
/// same-deadline timers fire in schedule order.
#[derive(Debug)]
pub struct TimerQueue<T> {
    entries: BTreeMap<(u64, u64), T>,
    deadlines: HashMap<TimerId, u64>,
    next_seq: u64,
}

impl<T> Default for TimerQueue<T> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
            deadlines: HashMap::new(),
            next_seq: 0,
        }
    }
}

impl<T> TimerQueue<T> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Schedule `payload` to fire at `deadline_ms`.
    pub fn schedule(&mut self, deadline_ms: u64, payload: T) -> TimerId {
        let seq = self.next_seq;
        self.next_seq += 1;
        let id = TimerId(seq);
        self.entries.insert((deadline_ms, seq), payload);
        self.deadlines.insert(id, deadline_ms);
        id
    }

    /// Cancel a pending timer, returning its payload. `None` when the
    /// timer already fired or was cancelled.
    pub fn cancel(&mut self, id: TimerId) -> Option<T> {
        let deadline = self.deadlines.remove(&id)?;
        self.entries.remove(&(deadline, id.0))
    }

    /// The earliest pending deadline.
    #[must_use]
    pub fn next_deadline(&self) -> Option<u64> {
        self.entries.keys().next().map(|(deadline, _)| *deadline)
    }

    /// Remove and return every timer with `deadline <= now_ms`, in
    /// (deadline, schedule-order) order.
    pub fn pop_due(&mut self, now_ms: u64) -> Vec<(TimerId, T)> {
        let mut due = Vec::new();
        while let Some((&(deadline, seq), _)) = self.entries.iter().next() {
            if deadline > now_ms {
                break;
            }
            let payload = match self.entries.remove(&(deadline, seq)) {
                Some(payload) => payload,
                None => break,
            };
            let id = TimerId(seq);
            self.deadlines.remove(&id);
            due.push((id, payload));
        }
        due
    }
}

#[cfg(test)]
mod tests {
    use super::TimerQueue;

    #[test]
    fn pops_in_deadline_order() {
        let mut queue = TimerQueue::new();
        queue.schedule(30, "c");
        queue.schedule(10, "a");
        queue.schedule(20, "b");
        assert_eq!(queue.next_deadline(), Some(10));
        let due: Vec<_> = queue.pop_due(25).into_iter().map(|(_, v)| v).collect();
        assert_eq!(due, vec!["a", "b"]);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.next_deadline(), Some(30));
    }

    #[test]
    fn same_deadline_fires_in_schedule_order() {
        let mut queue = TimerQueue::new();
        queue.schedule(5, "first");
        queue.schedule(5, "second");
        queue.schedule(5, "third");
        let due: Vec<_> = queue.pop_due(5).into_iter().map(|(_, v)| v).collect();
        assert_eq!(due, vec!["first", "second", "third"]);
    }

    #[test]
    fn cancel_returns_payload_once() {
        let mut queue = TimerQueue::new();
        let id = queue.schedule(100, 7_u32);
        assert_eq!(queue.cancel(id), Some(7));
        assert_eq!(queue.cancel(id), None);
        assert!(queue.is_empty());
        assert!(queue.pop_due(1_000).is_empty());
    }

    #[test]
    fn fired_timer_cannot_be_cancelled() {
        let mut queue = TimerQueue::new();
        let id = queue.schedule(1, ());
        assert_eq!(queue.pop_due(1).len(), 1);
        assert_eq!(queue.cancel(id), None);
    }

    #[test]
    fn nothing_due_before_deadline() {
        let mut queue = TimerQueue::new();
        queue.schedule(50, ());
        assert!(queue.pop_due(49).is_empty());
        assert_eq!(queue.pop_due(50).len(), 1);
    }
}
