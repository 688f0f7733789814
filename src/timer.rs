use std::collections::BTreeMap;
use std::sync::OnceLock;
use std::time::Instant;

/// Handle returned by timer insertion; used to cancel the timer.
///
/// The handle stays valid after the timer fired; canceling a fired or
/// already-canceled timer is a no-op that returns `false`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerHandle {
    key: (u64, u64),
}

type TimerFn = Box<dyn FnOnce() + Send>;

/// Timers ordered by absolute deadline on the monotonic millisecond clock.
///
/// Entries are keyed by `(deadline, seq)` so two timers with the same
/// deadline fire in insertion order. Firing uses the re-check-head protocol:
/// the loop pops one due entry at a time, so handlers are free to insert or
/// cancel other timers in between.
pub(crate) struct TimerList {
    entries: BTreeMap<(u64, u64), TimerFn>,
    next_seq: u64,
}

impl TimerList {
    pub fn new() -> TimerList {
        TimerList {
            entries: BTreeMap::new(),
            next_seq: 0,
        }
    }

    pub fn insert(&mut self, deadline: u64, f: TimerFn) -> TimerHandle {
        let key = (deadline, self.next_seq);
        self.next_seq += 1;
        self.entries.insert(key, f);
        TimerHandle { key }
    }

    pub fn cancel(&mut self, handle: TimerHandle) -> bool {
        self.entries.remove(&handle.key).is_some()
    }

    /// Milliseconds until the earliest deadline.
    ///
    /// Returns `Some(0)` when a timer is already due (do not block in wait)
    /// and `None` when the list is empty (wait indefinitely).
    pub fn next_timeout(&self, now: u64) -> Option<u64> {
        self.entries
            .keys()
            .next()
            .map(|&(deadline, _)| deadline.saturating_sub(now))
    }

    /// Removes and returns the earliest entry whose deadline has passed.
    pub fn pop_due(&mut self, now: u64) -> Option<TimerFn> {
        let key = *self.entries.keys().next()?;
        if key.0 > now {
            return None;
        }
        self.entries.remove(&key)
    }
}

/// Monotonic milliseconds since the first use in this process.
pub(crate) fn tick_ms() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    let epoch = *EPOCH.get_or_init(Instant::now);
    Instant::now().duration_since(epoch).as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::{tick_ms, TimerList};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn deadline_order() {
        let mut timers = TimerList::new();
        let fired = Arc::new(AtomicUsize::new(0));

        for (i, deadline) in [(1usize, 10u64), (2, 30), (3, 20)] {
            let fired = fired.clone();
            timers.insert(deadline, Box::new(move || {
                // encode fire order in base 10
                fired.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| Some(v * 10 + i))
                    .ok();
            }));
        }

        while let Some(f) = timers.pop_due(100) {
            f();
        }

        assert_eq!(fired.load(Ordering::SeqCst), 132);
    }

    #[test]
    fn next_timeout_semantics() {
        let mut timers = TimerList::new();
        assert_eq!(timers.next_timeout(0), None);

        let h = timers.insert(50, Box::new(|| {}));
        assert_eq!(timers.next_timeout(20), Some(30));
        assert_eq!(timers.next_timeout(50), Some(0));
        assert_eq!(timers.next_timeout(90), Some(0));

        assert!(timers.cancel(h));
        assert!(!timers.cancel(h));
        assert_eq!(timers.next_timeout(0), None);
    }

    #[test]
    fn pop_due_respects_now() {
        let mut timers = TimerList::new();
        timers.insert(10, Box::new(|| {}));
        assert!(timers.pop_due(9).is_none());
        assert!(timers.pop_due(10).is_some());
        assert!(timers.next_timeout(0).is_none());
    }

    #[test]
    fn clock_is_monotonic() {
        let a = tick_ms();
        let b = tick_ms();
        assert!(b >= a);
    }
}
