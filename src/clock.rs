//! Lamport logical clock.
//!
//! Every participant (the coordinator and each node) owns one clock. Local
//! events call [`LamportClock::increment`]; receiving a message calls
//! [`LamportClock::update`] with the sender's timestamp before the message
//! body is handled.
//!
//! # Invariants
//!
//! - The value never decreases.
//! - `update(r)` yields `max(current, r) + 1`, so every causally dependent
//!   event carries a strictly greater timestamp than its cause.
//! - Arithmetic saturates at `u64::MAX`: a peer sending the largest timestamp
//!   pins the clock there instead of wrapping it back to zero.

use std::sync::atomic::{AtomicU64, Ordering};

/// Thread-safe Lamport clock.
#[derive(Debug, Default)]
pub struct LamportClock {
    /// Current logical time. Never decreases.
    time: AtomicU64,
}

impl LamportClock {
    /// Create a clock starting at 0.
    pub const fn new() -> Self {
        LamportClock {
            time: AtomicU64::new(0),
        }
    }

    /// Create a clock starting at `initial`.
    pub fn with_initial(initial: u64) -> Self {
        LamportClock {
            time: AtomicU64::new(initial),
        }
    }

    /// Current value without advancing.
    pub fn current(&self) -> u64 {
        self.time.load(Ordering::SeqCst)
    }

    /// Advance for a local event and return the new timestamp.
    pub fn increment(&self) -> u64 {
        self.advance(|current| current.saturating_add(1))
    }

    /// Merge a remote timestamp: `time = max(time, remote) + 1`.
    ///
    /// Returns the new local value.
    pub fn update(&self, remote: u64) -> u64 {
        self.advance(|current| current.max(remote).saturating_add(1))
    }

    fn advance(&self, step: impl Fn(u64) -> u64) -> u64 {
        let mut current = self.time.load(Ordering::SeqCst);
        loop {
            let next = step(current);
            match self
                .time
                .compare_exchange(current, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return next,
                Err(observed) => current = observed,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    use proptest::prelude::*;

    #[test]
    fn test_increment_is_strictly_increasing() {
        let clock = LamportClock::new();
        assert_eq!(clock.increment(), 1);
        assert_eq!(clock.increment(), 2);
        assert_eq!(clock.current(), 2);
    }

    #[test]
    fn test_update_with_older_remote() {
        let clock = LamportClock::with_initial(10);
        assert_eq!(clock.update(4), 11);
        assert_eq!(clock.update(11), 12);
    }

    #[test]
    fn test_update_with_newer_remote() {
        let clock = LamportClock::with_initial(3);
        assert_eq!(clock.update(20), 21);
        assert_eq!(clock.current(), 21);
    }

    #[test]
    fn test_update_with_max_remote_saturates() {
        let clock = LamportClock::with_initial(5);
        assert_eq!(clock.update(u64::MAX), u64::MAX);
        assert_eq!(clock.current(), u64::MAX);
        assert_eq!(clock.update(7), u64::MAX);
    }

    #[test]
    fn test_increment_at_max_does_not_wrap() {
        let clock = LamportClock::with_initial(u64::MAX - 1);
        assert_eq!(clock.increment(), u64::MAX);
        assert_eq!(clock.increment(), u64::MAX);
        assert_eq!(clock.current(), u64::MAX);
    }

    #[test]
    fn test_concurrent_increments_are_unique() {
        let clock = Arc::new(LamportClock::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let clock = clock.clone();
                thread::spawn(move || (0..500).map(|_| clock.increment()).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for value in handle.join().unwrap() {
                assert!(seen.insert(value), "duplicate timestamp {}", value);
            }
        }
        assert_eq!(seen.len(), 4000);
        assert_eq!(clock.current(), 4000);
    }

    #[test]
    fn test_concurrent_updates_never_regress() {
        let clock = Arc::new(LamportClock::new());
        let handles: Vec<_> = (0..4u64)
            .map(|t| {
                let clock = clock.clone();
                thread::spawn(move || {
                    let mut last = 0;
                    for i in 0..500u64 {
                        let value = clock.update(i * (t + 1));
                        assert!(value > last);
                        last = value;
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(clock.current() >= 2000);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Increment,
        Update(u64),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            Just(Op::Increment),
            (0u64..1_000).prop_map(Op::Update),
        ]
    }

    proptest! {
        #[test]
        fn prop_clock_values_strictly_increase(ops in prop::collection::vec(op_strategy(), 1..200)) {
            let clock = LamportClock::new();
            let mut last = clock.current();
            for op in ops {
                let before = clock.current();
                let value = match op {
                    Op::Increment => {
                        let v = clock.increment();
                        prop_assert_eq!(v, before + 1);
                        v
                    }
                    Op::Update(remote) => {
                        let v = clock.update(remote);
                        if remote <= before {
                            prop_assert_eq!(v, before + 1);
                        } else {
                            prop_assert_eq!(v, remote + 1);
                        }
                        v
                    }
                };
                prop_assert!(value > last);
                last = value;
            }
        }
    }
}
