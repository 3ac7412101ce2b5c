use chrono::NaiveDateTime;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::Duration;

/// Handle for a scheduled one-shot timer. Used to cancel it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

/// One-shot timers ordered by due time. Timers due at the same instant fire in
/// the order they were scheduled.
///
/// Cancellation is lazy: the heap entry stays behind and is skipped when it
/// surfaces.
#[derive(Debug)]
pub struct TimerQueue<E> {
    heap: BinaryHeap<Reverse<(NaiveDateTime, u64)>>,
    pending: HashMap<u64, E>,
    next_seq: u64,
}

impl<E> TimerQueue<E> {
    pub fn new() -> Self {
        TimerQueue {
            heap: BinaryHeap::new(),
            pending: HashMap::new(),
            next_seq: 1,
        }
    }

    /// Arm a timer that fires `delay` after `now`.
    pub fn schedule(&mut self, now: NaiveDateTime, delay: Duration, event: E) -> TimerId {
        let seq = self.next_seq;
        self.next_seq += 1;
        let delay = chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::days(3650));
        let due = now.checked_add_signed(delay).unwrap_or(now);
        self.heap.push(Reverse((due, seq)));
        self.pending.insert(seq, event);
        TimerId(seq)
    }

    /// Cancel a timer. Returns false if it already fired or was cancelled.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        self.pending.remove(&id.0).is_some()
    }

    pub fn is_pending(&self, id: TimerId) -> bool {
        self.pending.contains_key(&id.0)
    }

    /// Due time of the earliest live timer.
    pub fn next_due(&mut self) -> Option<NaiveDateTime> {
        self.prune();
        self.heap.peek().map(|Reverse((due, _))| *due)
    }

    /// Remove and return the earliest timer due at or before `now`.
    pub fn pop_due(&mut self, now: NaiveDateTime) -> Option<(NaiveDateTime, E)> {
        self.prune();
        let Reverse((due, seq)) = *self.heap.peek()?;
        if due > now {
            return None;
        }
        self.heap.pop();
        self.pending.remove(&seq).map(|event| (due, event))
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Drop every pending timer.
    pub fn clear(&mut self) {
        self.heap.clear();
        self.pending.clear();
    }

    fn prune(&mut self) {
        while let Some(Reverse((_, seq))) = self.heap.peek() {
            if self.pending.contains_key(seq) {
                break;
            }
            self.heap.pop();
        }
    }
}

impl<E> Default for TimerQueue<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn t0() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn pops_in_due_order() {
        let mut q = TimerQueue::new();
        q.schedule(t0(), ms(300), "c");
        q.schedule(t0(), ms(100), "a");
        q.schedule(t0(), ms(200), "b");
        let later = t0() + chrono::Duration::seconds(1);
        let order: Vec<_> = std::iter::from_fn(|| q.pop_due(later).map(|(_, e)| e)).collect();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn same_due_time_is_fifo() {
        let mut q = TimerQueue::new();
        q.schedule(t0(), ms(50), 1);
        q.schedule(t0(), ms(50), 2);
        q.schedule(t0(), ms(50), 3);
        let later = t0() + chrono::Duration::seconds(1);
        let order: Vec<_> = std::iter::from_fn(|| q.pop_due(later).map(|(_, e)| e)).collect();
        assert_eq!(order, vec![1, 2, 3]);
    }

    #[test]
    fn not_due_yet_returns_none() {
        let mut q = TimerQueue::new();
        q.schedule(t0(), ms(500), ());
        assert!(q.pop_due(t0()).is_none());
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn cancelled_timer_never_fires() {
        let mut q = TimerQueue::new();
        let id = q.schedule(t0(), ms(10), "gone");
        q.schedule(t0(), ms(20), "kept");
        assert!(q.cancel(id));
        assert!(!q.cancel(id));
        assert!(!q.is_pending(id));
        let later = t0() + chrono::Duration::seconds(1);
        assert_eq!(q.pop_due(later).map(|(_, e)| e), Some("kept"));
        assert!(q.pop_due(later).is_none());
    }

    #[test]
    fn next_due_skips_cancelled() {
        let mut q = TimerQueue::new();
        let first = q.schedule(t0(), ms(10), ());
        q.schedule(t0(), ms(40), ());
        q.cancel(first);
        assert_eq!(q.next_due(), Some(t0() + chrono::Duration::milliseconds(40)));
    }

    #[test]
    fn clear_drops_everything() {
        let mut q = TimerQueue::new();
        q.schedule(t0(), ms(10), ());
        q.schedule(t0(), ms(20), ());
        q.clear();
        assert!(q.is_empty());
        assert!(q.next_due().is_none());
    }
}
