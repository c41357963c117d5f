// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::time::Duration;

use futures::future::BoxFuture;

use crate::{Context, Middleware, Next};

const DEFAULT_COUNT: u32 = 3;
const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Middleware that re-runs a failing continuation with exponential backoff.
///
/// After the first failed attempt the rest of the chain runs up to `count` more times. The
/// delay before retry `n` (starting at 1) is `base_delay × 2^(n-1)`. The first success is
/// returned immediately; once the retries are exhausted the last error is returned unchanged.
///
/// Every retry re-runs the inner layers and the wrapped operation with a clone of the original
/// input.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use warden_pipeline::Retry;
///
/// let retry = Retry::new(5, Duration::from_millis(200));
///
/// assert_eq!(retry.delay_for(1), Duration::from_millis(200));
/// assert_eq!(retry.delay_for(3), Duration::from_millis(800));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retry {
    count: u32,
    base_delay: Duration,
}

impl Retry {
    /// Creates a retry layer with `count` additional attempts.
    #[must_use]
    pub fn new(count: u32, base_delay: Duration) -> Self {
        Self { count, base_delay }
    }

    /// Sets the number of additional attempts.
    #[must_use]
    pub fn count(mut self, count: u32) -> Self {
        self.count = count;
        self
    }

    /// Sets the delay before the first retry.
    #[must_use]
    pub fn base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    /// Delay before retry number `retry` (starting at 1).
    #[must_use]
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 2_u32.saturating_pow(retry.saturating_sub(1));
        self.base_delay.saturating_mul(factor)
    }
}

impl Default for Retry {
    fn default() -> Self {
        Self::new(DEFAULT_COUNT, DEFAULT_BASE_DELAY)
    }
}

impl<S, In, T, E> Middleware<S, In, Result<T, E>> for Retry
where
    S: Send + Sync + 'static,
    In: Clone + Send + 'static,
    T: Send + 'static,
    E: Send + 'static,
{
    fn handle<'a>(&'a self, input: In, next: Next<'a, S, In, Result<T, E>>, context: &'a Context<S>) -> BoxFuture<'a, Result<T, E>> {
        Box::pin(async move {
            let mut retry = 0;
            loop {
                match next.run(input.clone()).await {
                    Ok(value) => return Ok(value),
                    Err(error) if retry >= self.count => return Err(error),
                    Err(_) => {
                        retry += 1;
                        let delay = self.delay_for(retry);

                        tracing::event!(
                            name: "warden.pipeline.retry",
                            tracing::Level::WARN,
                            operation = %context.target(),
                            retry,
                            delay = delay.as_secs_f32(),
                            "operation failed, retrying"
                        );

                        tokio::time::sleep(delay).await;
                    }
                }
            }
        })
    }
}
