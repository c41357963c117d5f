// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt::Debug;
use std::time::Duration;

/// Non-cryptographic random source for retry jitter.
///
/// Tests swap in a deterministic generator.
#[derive(Clone, Default)]
pub(crate) enum Rnd {
    #[default]
    Real,

    #[cfg(test)]
    Test(std::sync::Arc<dyn Fn() -> f64 + Send + Sync>),
}

impl Debug for Rnd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Real => write!(f, "Real"),
            #[cfg(test)]
            Self::Test(_) => write!(f, "Test"),
        }
    }
}

impl Rnd {
    #[cfg(test)]
    pub fn new_fixed(value: f64) -> Self {
        Self::Test(std::sync::Arc::new(move || value))
    }

    #[cfg(test)]
    pub fn new_function<F>(f: F) -> Self
    where
        F: Fn() -> f64 + Send + Sync + 'static,
    {
        Self::Test(std::sync::Arc::new(f))
    }

    pub fn next_f64(&self) -> f64 {
        match self {
            Self::Real => fastrand::f64(),
            #[cfg(test)]
            Self::Test(generator) => generator(),
        }
    }

    /// `delay` shifted by a uniform offset in `[-jitter, +jitter]`, never below zero.
    pub fn jittered(&self, delay: Duration, jitter: Duration) -> Duration {
        if jitter.is_zero() {
            return delay;
        }

        let spread = jitter.as_secs_f64();
        let offset = (2.0 * spread).mul_add(self.next_f64(), -spread);
        let secs = (delay.as_secs_f64() + offset).max(0.0);

        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_jitter_keeps_delay() {
        let rnd = Rnd::new_fixed(0.9);

        assert_eq!(rnd.jittered(Duration::from_millis(100), Duration::ZERO), Duration::from_millis(100));
    }

    fn assert_close(actual: Duration, expected: Duration) {
        assert!(actual.abs_diff(expected) < Duration::from_micros(1), "{actual:?} != {expected:?}");
    }

    #[test]
    fn jitter_spans_both_directions() {
        let delay = Duration::from_millis(100);
        let jitter = Duration::from_millis(50);

        assert_close(Rnd::new_fixed(0.0).jittered(delay, jitter), Duration::from_millis(50));
        assert_close(Rnd::new_fixed(0.5).jittered(delay, jitter), Duration::from_millis(100));
        assert_close(Rnd::new_fixed(1.0).jittered(delay, jitter), Duration::from_millis(150));
    }

    #[test]
    fn jitter_never_goes_negative() {
        let rnd = Rnd::new_function(|| 0.0);

        assert_eq!(rnd.jittered(Duration::from_millis(10), Duration::from_millis(50)), Duration::ZERO);
    }

    #[test]
    fn real_source_stays_in_range() {
        let rnd = Rnd::default();

        for _ in 0..100 {
            let delay = rnd.jittered(Duration::from_millis(100), Duration::from_millis(50));
            assert!(delay >= Duration::from_millis(49) && delay <= Duration::from_millis(151), "{delay:?}");
        }
    }
}
