//! Deadline-driven retransmission timer. Three fires per timeout slot, then
//! the slot grows by the golden ratio. The worst-case totals (OPEN 60 s,
//! CHALLENGE 15 s, PING 5 s) are part of the protocol; do not replace the
//! backoff curve without reproducing them.

use std::time::{Duration, Instant};

pub const GOLDEN_RATIO: f64 = 1.618_033_988_749_895;

/// Fires per slot before the timeout grows.
pub const FIRES_PER_SLOT: u32 = 3;

pub const OPEN_MAX_MS: u64 = 60_000;
pub const CHALLENGE_MAX_MS: u64 = 15_000;
pub const PING_MAX_MS: u64 = 5_000;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RetryTick {
    /// Nothing to do yet.
    Idle,
    /// Re-run the action now.
    Fire,
    /// The total budget is exhausted.
    TimedOut,
}

/// One outstanding retry loop. The owner polls `due` from its sync tick; at
/// most one of these exists per algorithm per connection, so cancelling is
/// dropping the instance.
#[derive(Debug, Clone)]
pub struct Retry {
    started: Instant,
    deadline: Instant,
    slot: Duration,
    fired_in_slot: u32,
    max_total: Duration,
}

impl Retry {
    /// Arms a retry loop. The caller performs the initial action itself; the
    /// first re-fire comes due one `rtt_ms` later.
    pub fn start(now: Instant, rtt_ms: u64, max_total_ms: u64) -> Retry {
        let slot = Duration::from_millis(rtt_ms.max(1));

        Retry {
            started: now,
            deadline: now + slot,
            slot,
            fired_in_slot: 0,
            max_total: Duration::from_millis(max_total_ms),
        }
    }

    /// Advances the loop. Returns `Fire` when the action should run again,
    /// `TimedOut` once the cumulative budget is exceeded.
    pub fn due(&mut self, now: Instant) -> RetryTick {
        if now.duration_since(self.started) > self.max_total {
            return RetryTick::TimedOut;
        }

        if now < self.deadline {
            return RetryTick::Idle;
        }

        self.fired_in_slot += 1;
        if self.fired_in_slot >= FIRES_PER_SLOT {
            self.fired_in_slot = 0;
            self.slot = self.slot.mul_f64(GOLDEN_RATIO);
        }

        self.deadline = now + self.slot;
        RetryTick::Fire
    }

    /// The next instant at which `due` can report something other than Idle.
    #[inline]
    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_before_deadline() {
        let now = Instant::now();
        let mut retry = Retry::start(now, 500, PING_MAX_MS);

        assert_eq!(retry.due(now), RetryTick::Idle);
        assert_eq!(retry.due(now + Duration::from_millis(499)), RetryTick::Idle);
        assert_eq!(retry.due(now + Duration::from_millis(500)), RetryTick::Fire);
    }

    #[test]
    fn test_slot_grows_after_three_fires() {
        let start = Instant::now();
        let mut retry = Retry::start(start, 100, OPEN_MAX_MS);

        let mut now = start;
        for _ in 0..FIRES_PER_SLOT {
            now = retry.deadline();
            assert_eq!(retry.due(now), RetryTick::Fire);
        }

        // Fourth fire happens one golden-ratio slot later.
        let grown = retry.deadline().duration_since(now);
        assert!(grown > Duration::from_millis(160));
        assert!(grown < Duration::from_millis(163));
    }

    #[test]
    fn test_timeout_after_budget() {
        let start = Instant::now();
        let mut retry = Retry::start(start, 500, PING_MAX_MS);

        let mut now = start;
        let mut fires = 0;

        loop {
            now = retry.deadline();
            match retry.due(now) {
                RetryTick::Fire => fires += 1,
                RetryTick::TimedOut => break,
                RetryTick::Idle => unreachable!(),
            }

            assert!(fires < 64, "retry loop never timed out");
        }

        let total = now.duration_since(start);
        assert!(total >= Duration::from_millis(PING_MAX_MS));
        // The overshoot is bounded by one grown slot.
        assert!(total < Duration::from_millis(PING_MAX_MS + 4_000));
    }

    #[test]
    fn test_open_budget_bounds_fire_count() {
        let start = Instant::now();
        let mut retry = Retry::start(start, 500, OPEN_MAX_MS);

        let mut fires = 0;
        loop {
            let now = retry.deadline();
            match retry.due(now) {
                RetryTick::Fire => fires += 1,
                RetryTick::TimedOut => break,
                RetryTick::Idle => unreachable!(),
            }
            assert!(fires < 256);
        }

        // 500 ms slots growing every third fire cover 60 s in well under 40
        // sends, but need more than a handful.
        assert!(fires > 10);
        assert!(fires < 40);
    }
}
