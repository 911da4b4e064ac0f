//! Generic retry combinator with exponential backoff.
//!
//! Applied explicitly at each call site that talks to the network: feed
//! fetches, classification calls, Telegram delivery. The caller supplies a
//! predicate deciding which errors are worth retrying; everything else
//! propagates immediately.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::{error, warn};

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, multiplier: f64) -> Self {
        Self {
            max_attempts,
            base_delay,
            multiplier,
        }
    }

    /// Sensible default for feed fetches: 3 attempts, 2s base, doubling.
    pub fn feed() -> Self {
        Self::new(3, Duration::from_secs(2), 2.0)
    }

    /// Default for classification calls: 2 attempts, 5s base, doubling.
    pub fn classify() -> Self {
        Self::new(2, Duration::from_secs(5), 2.0)
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.mul_f64(self.multiplier.powi(attempt as i32))
    }

    /// Run `op` until it succeeds, a non-retryable error occurs, or the
    /// attempt budget is exhausted. The last error is returned to the
    /// caller, which owns the fallback (persist-and-continue, skip, …).
    pub async fn run<T, E, F, Fut, P>(&self, label: &str, is_retryable: P, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        E: Display,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if !is_retryable(&e) => return Err(e),
                Err(e) => {
                    attempt += 1;
                    if attempt >= self.max_attempts {
                        error!("all {} attempts for {label} failed: {e}", self.max_attempts);
                        return Err(e);
                    }
                    let delay = self.delay_for(attempt - 1);
                    warn!(
                        "attempt {attempt}/{} for {label} failed: {e}; retrying in {:.1}s",
                        self.max_attempts,
                        delay.as_secs_f64()
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(1), 2.0)
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let out: Result<u32, String> = fast()
            .run("op", |_| true, || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err("flaky".to_string())
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;
        assert_eq!(out.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_errors_return_immediately() {
        let calls = AtomicU32::new(0);
        let out: Result<(), String> = fast()
            .run("op", |e: &String| e != "fatal", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("fatal".to_string()) }
            })
            .await;
        assert_eq!(out.unwrap_err(), "fatal");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhaustion_returns_last_error() {
        let calls = AtomicU32::new(0);
        let out: Result<(), String> = fast()
            .run("op", |_| true, || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move { Err(format!("fail-{n}")) }
            })
            .await;
        assert_eq!(out.unwrap_err(), "fail-2");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn backoff_schedule_is_exponential() {
        let p = RetryPolicy::new(4, Duration::from_secs(2), 2.0);
        assert_eq!(p.delay_for(0), Duration::from_secs(2));
        assert_eq!(p.delay_for(1), Duration::from_secs(4));
        assert_eq!(p.delay_for(2), Duration::from_secs(8));
    }
}
