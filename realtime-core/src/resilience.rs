//! Resilience helpers for external services
//!
//! Retry delays come from the `backon` crate; this module only drives the
//! attempt loop so callers can log each failure with their own context.

pub mod retry {
    use std::fmt::Display;
    use std::future::Future;
    use std::time::Duration;

    use backon::{BackoffBuilder, ConstantBuilder};
    use thiserror::Error;
    use tracing::warn;

    /// Fixed-count retry with a constant delay and no backoff growth
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FixedRetry {
        /// Total attempts, including the first one
        pub attempts: u32,
        pub delay: Duration,
    }

    impl FixedRetry {
        #[must_use]
        pub const fn new(attempts: u32, delay: Duration) -> Self {
            Self { attempts, delay }
        }

        fn backoff(&self) -> impl Iterator<Item = Duration> {
            let retries = self.attempts.max(1) as usize - 1;
            ConstantBuilder::default()
                .with_delay(self.delay)
                .with_max_times(retries)
                .build()
        }
    }

    /// Every attempt failed
    #[derive(Debug, Error)]
    #[error("{operation} failed after {attempts} attempt(s): {last_error}")]
    pub struct RetryExhausted<E> {
        pub operation: String,
        pub attempts: u32,
        pub last_error: E,
    }

    /// Run `op` until it succeeds or the attempt budget is spent.
    ///
    /// The first attempt runs immediately; every later attempt waits
    /// `policy.delay`.
    pub async fn retry_fixed<T, E, F, Fut>(
        policy: FixedRetry,
        operation: &str,
        mut op: F,
    ) -> Result<T, RetryExhausted<E>>
    where
        E: Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let max_attempts = policy.attempts.max(1);
        let mut attempts = 1;
        let mut last_error = match op().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        for delay in policy.backoff() {
            warn!(
                operation = operation,
                attempt = attempts,
                max_attempts = max_attempts,
                retry_in_ms = delay.as_millis() as u64,
                error = %last_error,
                "Attempt failed, retrying"
            );
            tokio::time::sleep(delay).await;
            attempts += 1;

            match op().await {
                Ok(value) => return Ok(value),
                Err(e) => last_error = e,
            }
        }

        Err(RetryExhausted {
            operation: operation.to_string(),
            attempts,
            last_error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::retry::{retry_fixed, FixedRetry};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_fixed_attempts() {
        let calls = AtomicU32::new(0);
        let started = tokio::time::Instant::now();

        let result: Result<(), _> = retry_fixed(
            FixedRetry::new(10, Duration::from_secs(1)),
            "connect",
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>("connection refused") }
            },
        )
        .await;

        let err = result.unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 10);
        assert_eq!(err.attempts, 10);
        assert_eq!(err.last_error, "connection refused");
        // Nine constant waits between ten attempts, no growth
        assert_eq!(started.elapsed(), Duration::from_secs(9));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_on_first_success() {
        let calls = AtomicU32::new(0);

        let result = retry_fixed(
            FixedRetry::new(10, Duration::from_secs(1)),
            "connect",
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n < 3 {
                        Err("not yet")
                    } else {
                        Ok(n)
                    }
                }
            },
        )
        .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_attempts_still_tries_once() {
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = retry_fixed(
            FixedRetry::new(0, Duration::from_secs(1)),
            "connect",
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>("down") }
            },
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
