//! Purpose: Count in-flight sends and let teardown wait for them to finish.
//! Exports: `InFlight`, `InFlightGuard`, `DrainOutcome`.
//! Role: Quiescence signal between send paths and `term()`.
//! Invariants: Every `enter` is paired with exactly one decrement (guard drop).
//! Invariants: The decrement reaching zero wakes every waiter.
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum DrainOutcome {
    Drained,
    TimedOut,
}

#[derive(Debug, Default)]
pub(crate) struct InFlight {
    count: AtomicUsize,
    idle_lock: Mutex<()>,
    idle: Condvar,
}

impl InFlight {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn enter(&self) -> InFlightGuard<'_> {
        self.count.fetch_add(1, Ordering::SeqCst);
        InFlightGuard { in_flight: self }
    }

    pub(crate) fn current(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    pub(crate) fn wait_idle(&self, timeout: Duration) -> DrainOutcome {
        let deadline = Instant::now() + timeout;
        let mut guard = self
            .idle_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        loop {
            if self.count.load(Ordering::SeqCst) == 0 {
                return DrainOutcome::Drained;
            }
            let now = Instant::now();
            if now >= deadline {
                return DrainOutcome::TimedOut;
            }
            guard = self
                .idle
                .wait_timeout(guard, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn leave(&self) {
        if self.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            let _guard = self
                .idle_lock
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            self.idle.notify_all();
        }
    }
}

pub(crate) struct InFlightGuard<'a> {
    in_flight: &'a InFlight,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.in_flight.leave();
    }
}

#[cfg(test)]
mod tests {
    use super::{DrainOutcome, InFlight};
    use std::sync::{Arc, Barrier};
    use std::thread;
    use std::time::{Duration, Instant};

    #[test]
    fn idle_counter_drains_immediately() {
        let in_flight = InFlight::new();
        assert_eq!(
            in_flight.wait_idle(Duration::from_millis(0)),
            DrainOutcome::Drained
        );
    }

    #[test]
    fn guard_drop_releases_count() {
        let in_flight = InFlight::new();
        {
            let _a = in_flight.enter();
            let _b = in_flight.enter();
            assert_eq!(in_flight.current(), 2);
        }
        assert_eq!(in_flight.current(), 0);
    }

    #[test]
    fn held_guard_times_out() {
        let in_flight = InFlight::new();
        let _guard = in_flight.enter();
        let start = Instant::now();
        assert_eq!(
            in_flight.wait_idle(Duration::from_millis(30)),
            DrainOutcome::TimedOut
        );
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn waiter_wakes_when_last_guard_drops() {
        let in_flight = Arc::new(InFlight::new());
        let entered = Arc::new(Barrier::new(4));
        let mut workers = Vec::new();
        for _ in 0..3 {
            let in_flight = Arc::clone(&in_flight);
            let entered = Arc::clone(&entered);
            workers.push(thread::spawn(move || {
                let _guard = in_flight.enter();
                entered.wait();
                thread::sleep(Duration::from_millis(20));
            }));
        }
        entered.wait();
        assert_eq!(
            in_flight.wait_idle(Duration::from_secs(5)),
            DrainOutcome::Drained
        );
        assert_eq!(in_flight.current(), 0);
        for worker in workers {
            worker.join().expect("join");
        }
    }
}
