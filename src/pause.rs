//! The two-bit pause/interrupt primitive shared by the worker (global pause) and every
//! controller (per-task pause). Grounded on `macro_creator/pause_state.py`'s `PauseState`.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use bma_ts::Monotonic;

/// `{active, interrupted, started_at}` as a single small atomic record.
///
/// `active` and `interrupted` are plain atomics (no lock needed to read them); `started_at` lives
/// behind a tiny mutex because it is only ever touched on the active/inactive edges, never on the
/// hot read path.
#[derive(Debug)]
pub struct PauseState {
    active: AtomicBool,
    interrupted: AtomicBool,
    started_at: Mutex<Option<Monotonic>>,
}

impl Default for PauseState {
    fn default() -> Self {
        Self::new()
    }
}

impl PauseState {
    /// Creates a new, inactive pause state.
    pub fn new() -> Self {
        Self {
            active: AtomicBool::new(false),
            interrupted: AtomicBool::new(false),
            started_at: Mutex::new(None),
        }
    }

    /// Is a pause (soft or hard) currently in effect.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Is the current pause a hard interrupt.
    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }

    /// Idempotent. Sets `active=true`, `interrupted |= interrupt`, and records `started_at` only
    /// on the `0 -> 1` transition (re-triggering an already-active pause never resets the clock).
    pub fn trigger(&self, interrupt: bool) {
        let was_active = self.active.swap(true, Ordering::AcqRel);
        if interrupt {
            self.interrupted.store(true, Ordering::Release);
        }
        if !was_active {
            *self.started_at.lock() = Some(Monotonic::now());
        }
    }

    /// If active, returns the elapsed pause duration and resets to inactive. Otherwise returns
    /// `None` and leaves the state untouched.
    pub fn clear(&self) -> Option<std::time::Duration> {
        let mut started_at = self.started_at.lock();
        let Some(start) = started_at.take() else {
            return None;
        };
        self.active.store(false, Ordering::Release);
        self.interrupted.store(false, Ordering::Release);
        Some(Monotonic::now() - start)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::thread::sleep;
    use std::time::Duration;

    #[test]
    fn test_soft_trigger_and_clear() {
        let p = PauseState::new();
        assert!(!p.is_active());
        assert!(p.clear().is_none());

        p.trigger(false);
        assert!(p.is_active());
        assert!(!p.is_interrupted());

        sleep(Duration::from_millis(5));
        let elapsed = p.clear().expect("should have been active");
        assert!(elapsed >= Duration::from_millis(5));
        assert!(!p.is_active());
    }

    #[test]
    fn test_interrupt_upgrades_soft_pause() {
        let p = PauseState::new();
        p.trigger(false);
        assert!(!p.is_interrupted());
        p.trigger(true);
        assert!(p.is_active());
        assert!(p.is_interrupted());
    }

    #[test]
    fn test_retrigger_does_not_reset_clock() {
        let p = PauseState::new();
        p.trigger(false);
        sleep(Duration::from_millis(10));
        p.trigger(false);
        let elapsed = p.clear().unwrap();
        assert!(elapsed >= Duration::from_millis(10));
    }
}
