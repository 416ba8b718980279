//! Discrete-event engine: a time-ordered event queue and a clock.
//!
//! Events scheduled for the same instant fire in scheduling order.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use memcopy_core::SimTime;

struct Scheduled<E> {
    at: f64,
    seq: u64,
    event: E,
}

impl<E> PartialEq for Scheduled<E> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<E> Eq for Scheduled<E> {}

impl<E> PartialOrd for Scheduled<E> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<E> Ord for Scheduled<E> {
    // Reversed: BinaryHeap is a max-heap, we pop the earliest event.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .at
            .total_cmp(&self.at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

pub struct SimEngine<E> {
    now: f64,
    seq: u64,
    queue: BinaryHeap<Scheduled<E>>,
}

impl<E> SimEngine<E> {
    pub fn new() -> Self {
        Self {
            now: 0.0,
            seq: 0,
            queue: BinaryHeap::new(),
        }
    }

    /// Current simulated time.
    pub fn now(&self) -> SimTime {
        SimTime(self.now)
    }

    /// Schedule `event` at `at`. Times in the past are clamped to now.
    pub fn schedule(&mut self, at: SimTime, event: E) {
        let at = at.as_secs().max(self.now);
        self.queue.push(Scheduled {
            at,
            seq: self.seq,
            event,
        });
        self.seq += 1;
    }

    /// Pop the earliest event and advance the clock to its time.
    pub fn next_event(&mut self) -> Option<(SimTime, E)> {
        let s = self.queue.pop()?;
        self.now = s.at;
        Some((SimTime(s.at), s.event))
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn is_idle(&self) -> bool {
        self.queue.is_empty()
    }

    /// Drop all pending events without advancing the clock.
    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

impl<E> Default for SimEngine<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> std::fmt::Debug for SimEngine<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimEngine")
            .field("now", &self.now)
            .field("pending", &self.queue.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_fire_in_time_order() {
        let mut e = SimEngine::new();
        e.schedule(SimTime(3.0), "c");
        e.schedule(SimTime(1.0), "a");
        e.schedule(SimTime(2.0), "b");
        let order: Vec<_> = std::iter::from_fn(|| e.next_event().map(|(_, ev)| ev)).collect();
        assert_eq!(order, vec!["a", "b", "c"]);
        assert_eq!(e.now(), SimTime(3.0));
    }

    #[test]
    fn test_ties_keep_fifo_order() {
        let mut e = SimEngine::new();
        for i in 0..5 {
            e.schedule(SimTime(1.0), i);
        }
        let order: Vec<_> = std::iter::from_fn(|| e.next_event().map(|(_, ev)| ev)).collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_past_events_clamped() {
        let mut e = SimEngine::new();
        e.schedule(SimTime(5.0), 0);
        e.next_event();
        e.schedule(SimTime(1.0), 1);
        let (at, _) = e.next_event().unwrap();
        assert_eq!(at, SimTime(5.0));
    }

    #[test]
    fn test_clock_never_moves_backwards() {
        let mut e = SimEngine::new();
        e.schedule(e.now().after(0.5), ());
        e.schedule(e.now().after(0.25), ());
        let mut last = e.now();
        while let Some((at, _)) = e.next_event() {
            assert!(at >= last);
            last = at;
        }
        assert!(e.is_idle());
    }

    #[test]
    fn test_clear_keeps_time() {
        let mut e = SimEngine::new();
        e.schedule(e.now().after(1.0), ());
        e.next_event();
        e.schedule(e.now().after(1.0), ());
        e.clear();
        assert_eq!(e.pending(), 0);
        assert_eq!(e.now(), SimTime(1.0));
    }
}
