//! A synchronous periodic-tick helper used by the watchdog's heartbeat check. Adapted from
//! `roboplc::time::Interval`, trimmed to the single missed-tick policy (burst: fire every missed
//! tick instantly) this crate's watchdog actually relies on.

use std::{thread, time::Duration};

use bma_ts::Monotonic;

/// A synchronous interval helper, similar to
/// <https://docs.rs/tokio/latest/tokio/time/struct.Interval.html>.
pub struct Interval {
    next_tick: Option<Monotonic>,
    period: Duration,
}

impl Interval {
    /// Creates an interval that fires every `period`, starting from the first [`Interval::tick`]
    /// call.
    pub fn new(period: Duration) -> Self {
        Self {
            next_tick: None,
            period,
        }
    }

    /// Ticks the interval, sleeping until the next scheduled instant.
    ///
    /// Returns `false` if one or more ticks were missed (the caller fell behind); the next tick is
    /// still scheduled immediately, so missed ticks fire back-to-back with no extra delay.
    pub fn tick(&mut self) -> bool {
        let now = Monotonic::now();
        let Some(next_tick) = self.next_tick else {
            self.next_tick = Some(now + self.period);
            return true;
        };
        match now.cmp(&next_tick) {
            std::cmp::Ordering::Less => {
                let to_sleep = next_tick - now;
                self.next_tick = Some(next_tick + self.period);
                thread::sleep(to_sleep);
                true
            }
            std::cmp::Ordering::Equal => {
                self.next_tick = Some(next_tick + self.period);
                true
            }
            std::cmp::Ordering::Greater => {
                self.next_tick = Some(next_tick + self.period);
                false
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_tick_sleeps_until_period_elapses() {
        let mut interval = Interval::new(Duration::from_millis(10));
        assert!(interval.tick(), "first tick fires immediately");
        let start = Monotonic::now();
        interval.tick();
        assert!(Monotonic::now() - start >= Duration::from_millis(9));
    }

    #[test]
    fn test_tick_reports_missed_tick() {
        let mut interval = Interval::new(Duration::from_millis(5));
        interval.tick();
        thread::sleep(Duration::from_millis(20));
        assert!(!interval.tick(), "a tick slept past its deadline should report missed");
    }
}
