use std::{
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use outrig_core::error::WorkUnderflow;

/// Lock-free in-flight counter plus the moment work last finished.
#[derive(Debug)]
pub struct WorkTracker {
    in_flight: AtomicUsize,
    epoch: Instant,
    last_active_nanos: AtomicU64,
}

impl Default for WorkTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkTracker {
    pub fn new() -> Self {
        Self {
            in_flight: AtomicUsize::new(0),
            epoch: Instant::now(),
            last_active_nanos: AtomicU64::new(0),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Returns the number of units in flight after this one started.
    pub fn start_work(&self) -> usize {
        self.touch();
        self.in_flight.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Returns the number of units still in flight. Never wraps below zero.
    pub fn stop_work(&self) -> Result<usize, WorkUnderflow> {
        let previous = self
            .in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .map_err(|_| {
                tracing::error!("stop_work called with no work in flight");
                WorkUnderflow
            })?;
        self.touch();
        Ok(previous - 1)
    }

    /// Brackets one unit of work; the unit stops when the guard drops.
    pub fn begin(self: &Arc<Self>) -> WorkGuard {
        self.start_work();
        WorkGuard {
            tracker: self.clone(),
        }
    }

    /// Time since work last started or stopped; zero while anything is in flight.
    pub fn idle_for(&self, now: Instant) -> Duration {
        if self.in_flight() > 0 {
            return Duration::ZERO;
        }
        let last = self.epoch + Duration::from_nanos(self.last_active_nanos.load(Ordering::SeqCst));
        now.saturating_duration_since(last)
    }

    pub fn idle_expired(&self, timeout: Duration, now: Instant) -> bool {
        self.in_flight() == 0 && self.idle_for(now) >= timeout
    }

    fn touch(&self) {
        let nanos = u64::try_from(self.epoch.elapsed().as_nanos()).unwrap_or(u64::MAX);
        self.last_active_nanos.fetch_max(nanos, Ordering::SeqCst);
    }
}

#[derive(Debug)]
pub struct WorkGuard {
    tracker: Arc<WorkTracker>,
}

impl Drop for WorkGuard {
    fn drop(&mut self) {
        let _ = self.tracker.stop_work();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn balanced_work_returns_to_zero() {
        let tracker = WorkTracker::new();
        for expected in 1..=5 {
            assert_eq!(tracker.start_work(), expected);
        }
        for expected in (0..5).rev() {
            assert_eq!(tracker.stop_work().unwrap(), expected);
        }
        assert_eq!(tracker.in_flight(), 0);
    }

    #[test]
    fn extra_stop_is_an_underflow_not_a_wraparound() {
        let tracker = WorkTracker::new();
        tracker.start_work();
        tracker.stop_work().unwrap();
        assert_eq!(tracker.stop_work(), Err(WorkUnderflow));
        assert_eq!(tracker.in_flight(), 0);
    }

    #[test]
    fn guard_stops_work_even_on_panic() {
        let tracker = Arc::new(WorkTracker::new());
        let cloned = tracker.clone();
        let result = std::panic::catch_unwind(move || {
            let _guard = cloned.begin();
            panic!("handler blew up");
        });
        assert!(result.is_err());
        assert_eq!(tracker.in_flight(), 0);
    }

    #[test]
    fn concurrent_guards_balance_out() {
        let tracker = Arc::new(WorkTracker::new());
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let tracker = tracker.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        let _guard = tracker.begin();
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }
        assert_eq!(tracker.in_flight(), 0);
    }

    #[test]
    fn idle_never_expires_while_work_is_in_flight() {
        let tracker = WorkTracker::new();
        let later = Instant::now() + Duration::from_secs(3600);
        tracker.start_work();
        assert!(!tracker.idle_expired(Duration::from_millis(1), later));
        assert_eq!(tracker.idle_for(later), Duration::ZERO);

        tracker.stop_work().unwrap();
        assert!(tracker.idle_expired(Duration::from_secs(60), later));
        assert!(!tracker.idle_expired(Duration::from_secs(7200), later));
    }
}
