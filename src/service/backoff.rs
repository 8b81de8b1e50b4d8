//! Exponential backoff with jitter for automatic service restarts
//! (spec §4.2, §8 properties 3-4).

use std::time::{Duration, Instant};

use rand::Rng;

use crate::constants::BACKOFF_JITTER_FRACTION;

/// Tracks a service's restart backoff state across consecutive failures.
#[derive(Debug, Clone)]
pub struct Backoff {
    delay: Duration,
    factor: f64,
    limit: Duration,
    reset_after: Duration,
    current: Option<Duration>,
    last_start: Option<Instant>,
}

impl Backoff {
    /// Creates a backoff tracker with the given initial delay, growth
    /// factor, and ceiling.
    pub fn new(delay: Duration, factor: f64, limit: Duration, reset_after: Duration) -> Backoff {
        Backoff {
            delay,
            factor,
            limit,
            reset_after,
            current: None,
            last_start: None,
        }
    }

    /// Records that the service just started; used to decide whether a
    /// later failure should reset the backoff counter.
    pub fn record_start(&mut self) {
        self.last_start = Some(Instant::now());
    }

    /// Computes the next backoff duration (including jitter) following a
    /// failure, advancing the internal counter. If the service had been
    /// running continuously for at least `reset_after`, the counter resets
    /// to the initial delay first.
    pub fn next(&mut self) -> Duration {
        if let Some(started) = self.last_start {
            if started.elapsed() >= self.reset_after {
                self.current = None;
            }
        }
        let base = match self.current {
            None => self.delay,
            Some(prev) => {
                let scaled = prev.mul_f64(self.factor);
                scaled.min(self.limit)
            }
        };
        self.current = Some(base);
        let jitter_max = base.mul_f64(BACKOFF_JITTER_FRACTION);
        let jitter = if jitter_max.is_zero() {
            Duration::ZERO
        } else {
            let millis = rand::thread_rng().gen_range(0..=jitter_max.as_millis().max(1) as u64);
            Duration::from_millis(millis)
        };
        base + jitter
    }

    /// Resets the backoff counter immediately (e.g. on an explicit restart
    /// request rather than an automatic one).
    pub fn reset(&mut self) {
        self.current = None;
        self.last_start = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_by_factor_up_to_limit() {
        let mut b = Backoff::new(
            Duration::from_millis(100),
            2.0,
            Duration::from_millis(350),
            Duration::from_secs(10),
        );
        let d1 = b.next();
        assert!(d1 >= Duration::from_millis(100) && d1 < Duration::from_millis(111));
        let d2 = b.next();
        assert!(d2 >= Duration::from_millis(200) && d2 < Duration::from_millis(221));
        let d3 = b.next();
        assert!(d3 >= Duration::from_millis(350) && d3 < Duration::from_millis(386));
    }

    #[test]
    fn long_run_resets_counter() {
        let mut b = Backoff::new(
            Duration::from_millis(10),
            2.0,
            Duration::from_millis(100),
            Duration::from_millis(20),
        );
        let _ = b.next();
        b.record_start();
        std::thread::sleep(Duration::from_millis(30));
        let d = b.next();
        assert!(d >= Duration::from_millis(10) && d < Duration::from_millis(12));
    }
}
