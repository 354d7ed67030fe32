//! Cooldown gate rationing compliment jobs to one per window.

use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Mutex-protected "last started" timestamp.
///
/// The first acquisition always succeeds. After that, an acquisition succeeds
/// only once `window` has elapsed since the previous successful one.
pub struct CooldownGate {
    window: Duration,
    last: Mutex<Option<Instant>>,
}

/// Proof of a successful acquisition, usable to undo it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CooldownTicket {
    acquired_at: Instant,
    previous: Option<Instant>,
}

impl CooldownTicket {
    pub fn acquired_at(&self) -> Instant {
        self.acquired_at
    }
}

impl CooldownGate {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last: Mutex::new(None),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Open the gate at `now` if the window has elapsed, recording `now` as the
    /// new start of the window.
    pub fn try_acquire(&self, now: Instant) -> Option<CooldownTicket> {
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(prev) = *last {
            if now.saturating_duration_since(prev) < self.window {
                return None;
            }
        }
        let ticket = CooldownTicket {
            acquired_at: now,
            previous: *last,
        };
        *last = Some(now);
        Some(ticket)
    }

    /// Undo an acquisition whose job never started.
    ///
    /// No-op if another acquisition happened since.
    pub fn revert(&self, ticket: CooldownTicket) {
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        if *last == Some(ticket.acquired_at) {
            *last = ticket.previous;
        }
    }

    /// Time left until the gate opens again, zero if already open.
    pub fn remaining(&self, now: Instant) -> Duration {
        let last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        match *last {
            Some(prev) => self
                .window
                .saturating_sub(now.saturating_duration_since(prev)),
            None => Duration::ZERO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(45);

    #[test]
    fn test_first_acquire_succeeds() {
        let gate = CooldownGate::new(WINDOW);
        assert!(gate.try_acquire(Instant::now()).is_some());
    }

    #[test]
    fn test_blocks_inside_window() {
        let gate = CooldownGate::new(WINDOW);
        let t0 = Instant::now();
        assert!(gate.try_acquire(t0).is_some());
        for secs in [0, 1, 10, 44] {
            assert!(gate.try_acquire(t0 + Duration::from_secs(secs)).is_none());
        }
        // Rejected attempts do not extend the window
        assert!(gate.try_acquire(t0 + WINDOW).is_some());
    }

    #[test]
    fn test_one_acquire_per_window() {
        let gate = CooldownGate::new(WINDOW);
        let t0 = Instant::now();
        let granted = (0..300)
            .map(|i| t0 + Duration::from_millis(i * 100))
            .filter(|&t| gate.try_acquire(t).is_some())
            .count();
        // 30s of detections at 10Hz fit in a single window
        assert_eq!(granted, 1);
    }

    #[test]
    fn test_revert_reopens_gate() {
        let gate = CooldownGate::new(WINDOW);
        let t0 = Instant::now();
        let ticket = gate.try_acquire(t0).unwrap();
        gate.revert(ticket);
        assert!(gate.try_acquire(t0 + Duration::from_secs(1)).is_some());
    }

    #[test]
    fn test_revert_restores_previous_window() {
        let gate = CooldownGate::new(WINDOW);
        let t0 = Instant::now();
        gate.try_acquire(t0).unwrap();
        let second = gate.try_acquire(t0 + WINDOW).unwrap();
        gate.revert(second);
        assert_eq!(gate.remaining(t0 + WINDOW), Duration::ZERO);
        assert_eq!(gate.remaining(t0 + Duration::from_secs(5)), Duration::from_secs(40));
    }

    #[test]
    fn test_stale_revert_is_ignored() {
        let gate = CooldownGate::new(WINDOW);
        let t0 = Instant::now();
        let first = gate.try_acquire(t0).unwrap();
        let t1 = t0 + WINDOW;
        gate.try_acquire(t1).unwrap();
        gate.revert(first);
        assert!(gate.try_acquire(t1 + Duration::from_secs(1)).is_none());
    }

    #[test]
    fn test_remaining_counts_down() {
        let gate = CooldownGate::new(WINDOW);
        let t0 = Instant::now();
        assert_eq!(gate.remaining(t0), Duration::ZERO);
        gate.try_acquire(t0).unwrap();
        assert_eq!(gate.remaining(t0 + Duration::from_secs(15)), Duration::from_secs(30));
        assert_eq!(gate.remaining(t0 + Duration::from_secs(60)), Duration::ZERO);
    }
}
