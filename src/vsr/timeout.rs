//! Tick-counted deadlines with exponential backoff and jitter.

use rand::Rng;
use tracing::{debug, trace};

use crate::constants::{BACKOFF_MAX_TICKS, BACKOFF_MIN_TICKS, RTT_MULTIPLE, RTT_TICKS};

/// Returns a delay in `[min, max]` that grows exponentially with `attempt`.
///
/// The exponential part saturates at `max - min` and the actual delay is drawn
/// uniformly below it, so retries from many clients spread out instead of
/// synchronising.
///
/// # Panics
///
/// Panics if `max <= min`.
pub fn exponential_backoff_with_jitter<R: Rng + ?Sized>(
    prng: &mut R,
    min: u64,
    max: u64,
    attempt: u64,
) -> u64 {
    assert!(max > min);
    let range = max - min;

    // Saturate the exponent; truncating would wrap the delay back to its minimum.
    let exponent = attempt.min(63) as u32;
    let power = 1u64 << exponent;
    let backoff = range.min(min.max(1).saturating_mul(power));
    assert!(backoff > 0);

    let jitter = prng.gen_range(0..backoff);
    let result = min + jitter;

    assert!(result >= min);
    assert!(result <= max);
    result
}

/// A deadline measured in ticks.
///
/// A fired timeout must be acted on (stopped, reset or backed off) before the next
/// tick, or the following [`Timeout::fired`] call panics.
#[derive(Debug, Clone)]
pub struct Timeout {
    name: &'static str,
    id: u128,
    after: u64,
    /// Wraps on purpose: the short period surfaces overflow bugs early, and saturating
    /// would pin round-robin retries to one replica.
    attempts: u8,
    rtt: u64,
    rtt_multiple: u8,
    ticks: u64,
    ticking: bool,
}

impl Timeout {
    pub fn new(name: &'static str, id: u128, after: u64) -> Self {
        assert!(after > 0);
        Self {
            name,
            id,
            after,
            attempts: 0,
            rtt: RTT_TICKS,
            rtt_multiple: RTT_MULTIPLE,
            ticks: 0,
            ticking: false,
        }
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[inline]
    pub fn after(&self) -> u64 {
        self.after
    }

    #[inline]
    pub fn attempts(&self) -> u8 {
        self.attempts
    }

    #[inline]
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    #[inline]
    pub fn ticking(&self) -> bool {
        self.ticking
    }

    pub fn start(&mut self) {
        self.attempts = 0;
        self.ticks = 0;
        self.ticking = true;
        trace!(id = self.id, name = self.name, "timeout started");
    }

    pub fn stop(&mut self) {
        self.attempts = 0;
        self.ticks = 0;
        self.ticking = false;
        trace!(id = self.id, name = self.name, "timeout stopped");
    }

    /// Restarts the count without changing `after`.
    pub fn reset(&mut self) {
        assert!(self.ticking);
        self.attempts = 0;
        self.ticks = 0;
        trace!(id = self.id, name = self.name, "timeout reset");
    }

    pub fn tick(&mut self) {
        if self.ticking {
            self.ticks += 1;
        }
    }

    /// True on exactly the tick the deadline is reached.
    ///
    /// # Panics
    ///
    /// Panics if a previous firing was not acted on.
    pub fn fired(&self) -> bool {
        if self.ticking && self.ticks >= self.after {
            if self.ticks > self.after {
                panic!("{}: timeout was not reset correctly", self.name);
            }
            debug!(id = self.id, name = self.name, "timeout fired");
            true
        } else {
            false
        }
    }

    /// Counts another attempt and pushes the deadline out with exponential backoff.
    pub fn backoff<R: Rng + ?Sized>(&mut self, prng: &mut R) {
        assert!(self.ticking);

        self.ticks = 0;
        self.attempts = self.attempts.wrapping_add(1);

        debug!(id = self.id, name = self.name, attempts = self.attempts, "timeout backing off");
        self.set_after_for_rtt_and_attempts(prng);
    }

    /// Sets `after` from the round trip estimate plus backoff for the attempt count.
    ///
    /// Only valid right after a start, stop, reset or backoff so that `after` never
    /// drops below the ticks already counted.
    pub fn set_after_for_rtt_and_attempts<R: Rng + ?Sized>(&mut self, prng: &mut R) {
        assert!(self.ticks == 0);
        assert!(self.rtt > 0);

        let after = self.rtt * self.rtt_multiple as u64
            + exponential_backoff_with_jitter(
                prng,
                BACKOFF_MIN_TICKS,
                BACKOFF_MAX_TICKS,
                self.attempts as u64,
            );

        trace!(
            id = self.id,
            name = self.name,
            before = self.after,
            after,
            attempts = self.attempts,
            "timeout rescheduled"
        );
        assert!(after > 0);
        self.after = after;
    }

    pub fn set_rtt(&mut self, rtt_ticks: u64) {
        assert!(self.rtt > 0);
        assert!(rtt_ticks > 0);
        self.rtt = rtt_ticks;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::proptest_cases;
    use proptest::prelude::*;
    use rand::{SeedableRng, rngs::StdRng};

    #[test]
    fn fires_exactly_at_after() {
        let mut timeout = Timeout::new("test", 1, 3);
        assert!(!timeout.fired(), "not ticking");

        timeout.start();
        timeout.tick();
        timeout.tick();
        assert!(!timeout.fired());
        timeout.tick();
        assert!(timeout.fired());

        timeout.reset();
        assert!(!timeout.fired());
        assert_eq!(timeout.ticks(), 0);
    }

    #[test]
    fn stopped_timeout_does_not_count() {
        let mut timeout = Timeout::new("test", 1, 1);
        timeout.tick();
        assert_eq!(timeout.ticks(), 0);
        assert!(!timeout.fired());
    }

    #[test]
    #[should_panic(expected = "timeout was not reset correctly")]
    fn ignored_firing_panics() {
        let mut timeout = Timeout::new("ignored", 1, 1);
        timeout.start();
        timeout.tick();
        assert!(timeout.fired());
        timeout.tick();
        let _ = timeout.fired();
    }

    #[test]
    fn backoff_bumps_attempts_and_wraps() {
        let mut prng = StdRng::seed_from_u64(7);
        let mut timeout = Timeout::new("request", 1, 60);
        timeout.start();

        for expected in 1..=255u8 {
            timeout.backoff(&mut prng);
            assert_eq!(timeout.attempts(), expected);
        }
        timeout.backoff(&mut prng);
        assert_eq!(timeout.attempts(), 0);

        timeout.stop();
        assert_eq!(timeout.attempts(), 0);
        assert!(!timeout.ticking());
    }

    #[test]
    fn backoff_after_is_bounded() {
        let mut prng = StdRng::seed_from_u64(11);
        let mut timeout = Timeout::new("request", 1, 60);
        timeout.start();
        let base = RTT_TICKS * RTT_MULTIPLE as u64;

        for _ in 0..64 {
            timeout.backoff(&mut prng);
            assert!(timeout.after() >= base + BACKOFF_MIN_TICKS);
            assert!(timeout.after() <= base + BACKOFF_MAX_TICKS);
        }
    }

    #[test]
    fn backoff_grows_on_average() {
        let mut prng = StdRng::seed_from_u64(3);
        let mean = |prng: &mut StdRng, attempt: u64| -> f64 {
            let total: u64 = (0..2000)
                .map(|_| exponential_backoff_with_jitter(prng, 10, 1000, attempt))
                .sum();
            total as f64 / 2000.0
        };

        let early = mean(&mut prng, 0);
        let later = mean(&mut prng, 4);
        let saturated = mean(&mut prng, 20);
        assert!(early < later, "{early} !< {later}");
        assert!(later < saturated, "{later} !< {saturated}");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(proptest_cases(256)))]

        #[test]
        fn prop_backoff_within_bounds(
            seed: u64,
            min in 0u64..10_000,
            span in 1u64..10_000,
            attempt: u64,
        ) {
            let mut prng = StdRng::seed_from_u64(seed);
            let max = min + span;
            let value = exponential_backoff_with_jitter(&mut prng, min, max, attempt);
            prop_assert!(value >= min && value <= max);
        }

        #[test]
        fn prop_fired_iff_after_reached(after in 1u64..200, ticks in 0u64..200) {
            let mut timeout = Timeout::new("prop", 1, after);
            timeout.start();
            let ticks = ticks.min(after);
            for _ in 0..ticks {
                timeout.tick();
            }
            prop_assert_eq!(timeout.fired(), ticks >= after);
        }
    }
}
