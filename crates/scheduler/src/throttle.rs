//! Coalescing of recomputation requests
//!
//! Input changes (camera moves, resizes, layer edits) mark the throttle
//! dirty as often as they like. The owner polls once per scheduler tick and
//! recomputes only when the throttle reports ready, which happens at most
//! once per quantum.
//!
//! # Example
//!
//! ```
//! use chunkstream_scheduler::UpdateThrottle;
//! use std::time::{Duration, Instant};
//!
//! let mut throttle = UpdateThrottle::new(Duration::from_millis(16));
//! let start = Instant::now();
//!
//! throttle.mark_dirty();
//! throttle.mark_dirty();
//! assert!(throttle.poll(start));
//! assert!(!throttle.poll(start));
//! ```

use std::time::{Duration, Instant};

/// One recompute per 60 Hz frame
pub const DEFAULT_QUANTUM: Duration = Duration::from_micros(16_667);

#[derive(Debug, Clone)]
pub struct UpdateThrottle {
    quantum: Duration,
    dirty: bool,
    last_run: Option<Instant>,
    /// Requests absorbed since the last run
    coalesced: u32,
    runs: u64,
}

impl UpdateThrottle {
    pub fn new(quantum: Duration) -> Self {
        Self {
            quantum,
            dirty: false,
            last_run: None,
            coalesced: 0,
            runs: 0,
        }
    }

    pub fn mark_dirty(&mut self) {
        if self.dirty {
            self.coalesced += 1;
        }
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Returns `true` if a recompute should run now, and clears the dirty flag
    pub fn poll(&mut self, now: Instant) -> bool {
        if !self.dirty || self.time_until_ready(now) > Duration::ZERO {
            return false;
        }
        if self.coalesced > 0 {
            log::trace!("coalesced {} recompute requests", self.coalesced);
        }
        self.dirty = false;
        self.coalesced = 0;
        self.last_run = Some(now);
        self.runs += 1;
        true
    }

    /// Time left before the next run is allowed
    ///
    /// Returns `Duration::ZERO` if a run would be allowed now.
    pub fn time_until_ready(&self, now: Instant) -> Duration {
        match self.last_run {
            Some(last) => self
                .quantum
                .saturating_sub(now.saturating_duration_since(last)),
            None => Duration::ZERO,
        }
    }

    pub fn quantum(&self) -> Duration {
        self.quantum
    }

    /// Number of recomputes granted so far
    pub fn runs(&self) -> u64 {
        self.runs
    }
}

impl Default for UpdateThrottle {
    fn default() -> Self {
        Self::new(DEFAULT_QUANTUM)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_throttle_never_runs() {
        let mut throttle = UpdateThrottle::default();
        assert!(!throttle.is_dirty());
        assert!(!throttle.poll(Instant::now()));
        assert_eq!(throttle.runs(), 0);
    }

    #[test]
    fn test_first_dirty_runs_immediately() {
        let mut throttle = UpdateThrottle::new(Duration::from_millis(50));
        throttle.mark_dirty();
        assert!(throttle.poll(Instant::now()));
        assert!(!throttle.is_dirty());
    }

    #[test]
    fn test_at_most_once_per_quantum() {
        let quantum = Duration::from_millis(10);
        let mut throttle = UpdateThrottle::new(quantum);
        let start = Instant::now();

        throttle.mark_dirty();
        assert!(throttle.poll(start));

        for _ in 0..5 {
            throttle.mark_dirty();
        }
        assert!(!throttle.poll(start + Duration::from_millis(3)));
        assert!(!throttle.poll(start + Duration::from_millis(9)));
        assert!(throttle.is_dirty());

        assert!(throttle.poll(start + quantum));
        assert!(!throttle.poll(start + quantum * 3));
        assert_eq!(throttle.runs(), 2);
    }

    #[test]
    fn test_time_until_ready() {
        let quantum = Duration::from_millis(20);
        let mut throttle = UpdateThrottle::new(quantum);
        let start = Instant::now();
        assert_eq!(throttle.time_until_ready(start), Duration::ZERO);

        throttle.mark_dirty();
        throttle.poll(start);
        assert_eq!(
            throttle.time_until_ready(start + Duration::from_millis(5)),
            Duration::from_millis(15)
        );
        assert_eq!(throttle.time_until_ready(start + quantum * 2), Duration::ZERO);
    }

    #[test]
    fn test_clock_going_backwards_does_not_panic() {
        let mut throttle = UpdateThrottle::new(Duration::from_millis(5));
        let later = Instant::now() + Duration::from_millis(100);
        throttle.mark_dirty();
        assert!(throttle.poll(later));
        throttle.mark_dirty();
        assert!(!throttle.poll(later - Duration::from_millis(50)));
    }

    #[test]
    fn test_zero_quantum_runs_every_poll() {
        let mut throttle = UpdateThrottle::new(Duration::ZERO);
        let now = Instant::now();
        for _ in 0..3 {
            throttle.mark_dirty();
            assert!(throttle.poll(now));
        }
        assert_eq!(throttle.runs(), 3);
    }
}
