use std::time;

use rand::Rng;

/// Default symmetric jitter, as a fraction of the computed delay.
pub const DEFAULT_JITTER: f64 = 0.2;

#[derive(Copy, Clone, Debug)]
/// The policy a streaming client uses to decide how long to sleep before reconnecting.
///
/// The delay is `base * 2^failures`, capped at `maximum_interval`, then jittered by
/// `±jitter` and capped again so that jitter never pushes a delay past the maximum.
/// The policy holds no state: callers own the consecutive-failure counter and reset it
/// to zero after every successful connection.
pub struct BackoffPolicy {
    /// The delay after the first failure, before jitter.
    initial_interval: time::Duration,
    /// The maximum possible delay between reconnects.
    maximum_interval: time::Duration,
    /// Fraction of the delay added or removed at random.
    jitter: f64,
}

impl BackoffPolicy {
    pub fn new(initial_interval: time::Duration, maximum_interval: time::Duration) -> Self {
        Self {
            initial_interval,
            maximum_interval,
            jitter: DEFAULT_JITTER,
        }
    }

    /// Override the jitter fraction. Values are clamped to `[0, 1]`.
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = if jitter.is_finite() {
            jitter.clamp(0.0, 1.0)
        } else {
            DEFAULT_JITTER
        };
        self
    }

    pub fn maximum_interval(&self) -> time::Duration {
        self.maximum_interval
    }

    /// The capped exponential delay for `failures` consecutive failures, without jitter.
    pub fn capped_interval(&self, failures: u32) -> time::Duration {
        2u32.checked_pow(failures)
            .and_then(|factor| self.initial_interval.checked_mul(factor))
            .map_or(self.maximum_interval, |candidate| {
                std::cmp::min(candidate, self.maximum_interval)
            })
    }

    /// Calculate the time to sleep before the next reconnect attempt.
    pub fn next_delay(&self, failures: u32) -> time::Duration {
        self.next_delay_with_rng(failures, &mut rand::thread_rng())
    }

    pub fn next_delay_with_rng<R: Rng + ?Sized>(&self, failures: u32, rng: &mut R) -> time::Duration {
        let delay = self.capped_interval(failures).as_secs_f64();
        let spread = delay * self.jitter;

        if spread <= 0.0 {
            return self.capped_interval(failures);
        }

        let jittered = rng.gen_range((delay - spread)..=(delay + spread));

        std::cmp::min(
            time::Duration::from_secs_f64(jittered.max(0.0)),
            self.maximum_interval,
        )
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(time::Duration::from_secs(1), time::Duration::from_secs(30))
    }
}
