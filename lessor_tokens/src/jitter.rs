//! Utilities for adding a bit of jitter to reduce stampeding

use std::time::Duration;

use rand::{rngs::StdRng, Rng, SeedableRng};

/// A type that provides some jittering of delays
pub trait JitterSource {
    /// Jitters a given delay
    fn jitter(&mut self, delay: Duration) -> Duration;
}

/// A jitter source that does not do any jittering
#[derive(Debug)]
pub struct NullJitter;

impl JitterSource for NullJitter {
    #[inline]
    fn jitter(&mut self, delay: Duration) -> Duration {
        delay
    }
}

/// Shortens a delay by a random fraction
///
/// Delays jittered by this type have a uniform distribution in the interval
/// `[delay * (1 - max_fraction), delay]`.
#[derive(Debug)]
pub struct RandomEarlyJitter<R = StdRng> {
    max_fraction: f64,
    rand_source: R,
}

impl RandomEarlyJitter<StdRng> {
    /// Constructs a new instance that will shorten delays by up to `max_fraction`
    ///
    /// The fraction is clamped to `[0, 1]`.
    pub fn new(max_fraction: f64) -> Self {
        Self::with_rng(max_fraction, StdRng::from_entropy())
    }
}

impl<R: Rng> RandomEarlyJitter<R> {
    /// Constructs a new instance using the provided random source
    pub fn with_rng(max_fraction: f64, rand_source: R) -> Self {
        Self {
            max_fraction: max_fraction.clamp(0.0, 1.0),
            rand_source,
        }
    }
}

impl<R: Rng> JitterSource for RandomEarlyJitter<R> {
    fn jitter(&mut self, delay: Duration) -> Duration {
        if self.max_fraction == 0.0 {
            return delay;
        }

        let fraction = self.rand_source.gen_range(0.0..=self.max_fraction);
        delay.mul_f64(1.0 - fraction)
    }
}
