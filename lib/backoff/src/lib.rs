use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

/// A retry strategy driven by randomized exponential back-off.
///
/// Each interval is drawn uniformly from
/// `[current * (1 - randomization), current * (1 + randomization)]`, after
/// which `current` grows by `multiplier` up to `max_interval`. Once the
/// total elapsed time since the first interval passes `max_elapsed`, the
/// strategy gives up and `next` returns `None`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    randomization: f64,
    multiplier: f64,
    max_interval: Duration,
    max_elapsed: Option<Duration>,

    current: Duration,
    started: Option<Instant>,
}

impl Backoff {
    pub const fn new(initial: Duration) -> Backoff {
        Backoff {
            initial,
            randomization: 0.5,
            multiplier: 1.5,
            max_interval: Duration::from_secs(30),
            max_elapsed: None,
            current: initial,
            started: None,
        }
    }

    pub const fn from_millis(millis: u64) -> Backoff {
        Backoff::new(Duration::from_millis(millis))
    }

    /// The jitter applied to each interval, as a fraction of it. Zero
    /// makes the sequence deterministic.
    pub const fn randomization(mut self, factor: f64) -> Backoff {
        self.randomization = factor;
        self
    }

    pub const fn multiplier(mut self, multiplier: f64) -> Backoff {
        self.multiplier = multiplier;
        self
    }

    /// No interval will be longer than this, jitter included.
    pub const fn max_interval(mut self, duration: Duration) -> Backoff {
        self.max_interval = duration;
        self
    }

    /// Give up once this much wall time has passed since the first call
    /// to `next`.
    pub const fn max_elapsed(mut self, duration: Duration) -> Backoff {
        self.max_elapsed = Some(duration);
        self
    }

    /// The next interval to wait for, or `None` once the elapsed ceiling
    /// has passed.
    pub fn next(&mut self) -> Option<Duration> {
        let started = *self.started.get_or_insert_with(Instant::now);

        if let Some(max_elapsed) = self.max_elapsed {
            if started.elapsed() >= max_elapsed {
                return None;
            }
        }

        let interval = self.randomized(self.current);

        let grown = self.current.as_secs_f64() * self.multiplier;
        self.current = Duration::from_secs_f64(grown).min(self.max_interval);

        Some(interval.min(self.max_interval))
    }

    fn randomized(&self, interval: Duration) -> Duration {
        if self.randomization == 0.0 {
            return interval;
        }

        let delta = interval.as_secs_f64() * self.randomization;
        let low = (interval.as_secs_f64() - delta).max(0.0);
        let high = interval.as_secs_f64() + delta;
        Duration::from_secs_f64(rand::rng().random_range(low..=high))
    }

    /// Sleeps for the next interval. Returns false when the strategy has
    /// given up, in which case no sleep happens.
    pub async fn wait(&mut self) -> bool {
        match self.next() {
            Some(interval) => {
                tokio::time::sleep(interval).await;
                true
            }
            None => false,
        }
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
        self.started = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_by_multiplier() {
        let mut backoff = Backoff::from_millis(50).randomization(0.0).multiplier(1.5);

        assert_eq!(backoff.next(), Some(Duration::from_millis(50)));
        assert_eq!(backoff.next(), Some(Duration::from_millis(75)));
        assert_eq!(backoff.next(), Some(Duration::from_micros(112_500)));
    }

    #[test]
    fn saturates_at_max_interval() {
        let mut backoff = Backoff::from_millis(100)
            .randomization(0.0)
            .multiplier(10.0)
            .max_interval(Duration::from_millis(300));

        assert_eq!(backoff.next(), Some(Duration::from_millis(100)));
        assert_eq!(backoff.next(), Some(Duration::from_millis(300)));
        assert_eq!(backoff.next(), Some(Duration::from_millis(300)));
    }

    #[test]
    fn jitter_stays_in_bounds() {
        let mut backoff = Backoff::from_millis(100).randomization(0.5);
        for _ in 0..100 {
            let interval = backoff.next().expect("no ceiling configured");
            assert!(interval >= Duration::from_millis(50));
            backoff.reset();
        }
    }

    #[test]
    fn gives_up_after_max_elapsed() {
        let mut backoff = Backoff::from_millis(10).max_elapsed(Duration::ZERO);
        assert_eq!(backoff.next(), None);
    }

    #[test]
    fn reset_restarts_the_sequence() {
        let mut backoff = Backoff::from_millis(50).randomization(0.0);
        backoff.next();
        backoff.next();
        backoff.reset();
        assert_eq!(backoff.next(), Some(Duration::from_millis(50)));
    }
}
