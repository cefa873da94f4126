//! Error backoff handling

use std::time::Duration;

use crate::jitter::{JitterSource, RandomEarlyJitter};

/// Configuration for how to manage backoff when an error is encountered
#[derive(Clone, Debug)]
pub struct ErrorBackoffConfig {
    min_delay: Duration,
    max_delay: Duration,
    multiplier: u32,
    max_retries: Option<u32>,
}

impl Default for ErrorBackoffConfig {
    /// Default backoff configuration
    ///
    /// Delays start from 1 second and double on each error, capped at
    /// 5 minutes. Retries are unlimited.
    fn default() -> Self {
        Self {
            min_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            multiplier: 2,
            max_retries: None,
        }
    }
}

impl ErrorBackoffConfig {
    /// Constructs a new backoff configuration
    ///
    /// Each error multiplies the previous delay by two, starting from
    /// `min_delay` and capped at `max_delay`. A `max_delay` below
    /// `min_delay` is raised to `min_delay`.
    pub fn new(min_delay: Duration, max_delay: Duration) -> Self {
        Self {
            min_delay,
            max_delay: max_delay.max(min_delay),
            ..Self::default()
        }
    }

    /// Limits the number of consecutive errors that will be retried
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Disallows all retries, so that the first error is fatal
    pub fn exit_on_error(self) -> Self {
        self.with_max_retries(0)
    }

    /// The smallest base delay
    pub fn min_delay(&self) -> Duration {
        self.min_delay
    }

    /// The largest delay
    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }
}

/// Utility trait for extending types with a backoff handler
pub trait WithBackoff<J> {
    /// The output of providing backoff
    type Output;

    /// Applies backoff to the current value
    fn with_backoff(self, handler: &mut ErrorBackoffHandler<J>) -> Self::Output;
}

impl<T, E, J: JitterSource> WithBackoff<J> for Result<T, E> {
    type Output = Result<T, (E, Option<Duration>)>;

    fn with_backoff(self, handler: &mut ErrorBackoffHandler<J>) -> Self::Output {
        match self {
            Ok(ok) => {
                handler.success();
                Ok(ok)
            }
            Err(err) => Err((err, handler.error())),
        }
    }
}

/// A stateful handler that manages error backoff state
#[derive(Debug)]
pub struct ErrorBackoffHandler<J = RandomEarlyJitter> {
    config: ErrorBackoffConfig,
    current: Duration,
    retries: u32,
    jitter: J,
}

impl ErrorBackoffHandler {
    /// Constructs a new handler from an [`ErrorBackoffConfig`]
    ///
    /// Delays are jittered to between 75% and 100% of the base delay.
    pub fn new(config: ErrorBackoffConfig) -> Self {
        Self::with_jitter(config, RandomEarlyJitter::new(0.25))
    }
}

impl<J: JitterSource> ErrorBackoffHandler<J> {
    /// Constructs a new handler using a specific jitter source
    pub fn with_jitter(config: ErrorBackoffConfig, jitter: J) -> Self {
        Self {
            current: config.min_delay,
            config,
            retries: 0,
            jitter,
        }
    }

    /// The most recent delay, or the minimum delay if there has been none
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Reports a success
    ///
    /// This resets the internal delay state and the retry budget.
    pub fn success(&mut self) {
        self.current = self.config.min_delay;
        self.retries = 0;
    }

    /// Reports a failure and returns the delay before the next attempt
    ///
    /// Returns `None` once the retry budget is exhausted.
    pub fn error(&mut self) -> Option<Duration> {
        if let Some(max) = self.config.max_retries {
            if self.retries >= max {
                return None;
            }
        }

        self.retries = self.retries.saturating_add(1);

        // Each delay grows from the previous jittered delay
        let next = self.jitter.jitter(
            self.current
                .saturating_mul(self.config.multiplier)
                .min(self.config.max_delay),
        );
        self.current = next;

        Some(next)
    }
}

impl From<ErrorBackoffConfig> for ErrorBackoffHandler {
    fn from(config: ErrorBackoffConfig) -> Self {
        Self::new(config)
    }
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;
    use crate::jitter::NullJitter;

    #[test]
    fn delays_stay_within_jitter_envelope() {
        let max = Duration::from_secs(10);

        for seed in 0..50 {
            let config = ErrorBackoffConfig::new(Duration::from_millis(1), max);
            let jitter = RandomEarlyJitter::with_rng(0.25, StdRng::seed_from_u64(seed));
            let mut handler = ErrorBackoffHandler::with_jitter(config, jitter);

            let mut prev = handler.current();
            for _ in 0..20 {
                let delay = handler.error().unwrap();
                let doubled = prev * 2;

                assert!(delay <= max);
                if doubled <= max {
                    assert!(delay <= doubled, "seed {seed}: {delay:?} > {doubled:?}");
                    assert!(
                        delay >= doubled.mul_f64(0.75),
                        "seed {seed}: {delay:?} < 0.75 * {doubled:?}"
                    );
                }
                prev = delay;
            }
        }
    }

    #[test]
    fn next_delay_grows_from_the_jittered_delay() {
        struct Halving(bool);

        impl JitterSource for Halving {
            fn jitter(&mut self, delay: Duration) -> Duration {
                self.0 = !self.0;
                if self.0 { delay / 2 } else { delay }
            }
        }

        let config = ErrorBackoffConfig::new(Duration::from_secs(1), Duration::from_secs(60));
        let mut handler = ErrorBackoffHandler::with_jitter(config, Halving(false));

        assert_eq!(handler.error(), Some(Duration::from_secs(1)));
        assert_eq!(handler.error(), Some(Duration::from_secs(2)));
        assert_eq!(handler.current(), Duration::from_secs(2));
    }

    #[test]
    fn delays_are_capped_at_max() {
        let config = ErrorBackoffConfig::new(Duration::from_secs(1), Duration::from_secs(5));
        let mut handler = ErrorBackoffHandler::with_jitter(config, NullJitter);

        let delays: Vec<_> = (0..5).map(|_| handler.error().unwrap()).collect();

        assert_eq!(
            delays,
            [2, 4, 5, 5, 5].map(Duration::from_secs),
        );
    }

    #[test]
    fn success_resets_delay() {
        let config = ErrorBackoffConfig::new(Duration::from_secs(1), Duration::from_secs(60));
        let mut handler = ErrorBackoffHandler::with_jitter(config, NullJitter);

        handler.error();
        handler.error();
        handler.success();

        assert_eq!(handler.current(), Duration::from_secs(1));
        assert_eq!(handler.error(), Some(Duration::from_secs(2)));
    }

    #[test]
    fn exit_on_error_allows_no_retries() {
        let config = ErrorBackoffConfig::default().exit_on_error();
        let mut handler = ErrorBackoffHandler::new(config);

        assert_eq!(handler.error(), None);
    }

    #[test]
    fn retry_budget_is_restored_on_success() {
        let config = ErrorBackoffConfig::default().with_max_retries(1);
        let mut handler = ErrorBackoffHandler::with_jitter(config, NullJitter);

        assert!(handler.error().is_some());
        assert!(handler.error().is_none());
        handler.success();
        assert!(handler.error().is_some());
    }

    #[test]
    fn with_backoff_reports_delay_on_error() {
        let mut handler =
            ErrorBackoffHandler::with_jitter(ErrorBackoffConfig::default(), NullJitter);

        let result: Result<(), &str> = Err("boom");
        let (err, delay) = result.with_backoff(&mut handler).unwrap_err();

        assert_eq!(err, "boom");
        assert_eq!(delay, Some(Duration::from_secs(2)));
    }
}
