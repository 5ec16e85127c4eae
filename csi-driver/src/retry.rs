//! Retry & concurrency primitives (component E): a predicate-driven
//! exponential-backoff retry loop, shared by the inner `nvme connect` loop
//! (component D) and by appliance-call retries in the controller engine
//! (component C). spec.md §5.

use std::time::Duration;

use tracing::warn;

/// Parameters for a bounded exponential-backoff retry.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub multiplier: f64,
    pub cap: Duration,
}

impl RetryPolicy {
    pub const fn new(max_attempts: u32, initial_backoff: Duration, multiplier: f64, cap: Duration) -> Self {
        Self {
            max_attempts,
            initial_backoff,
            multiplier,
            cap,
        }
    }

    fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let scaled = self.initial_backoff.as_secs_f64() * self.multiplier.powi(attempt as i32);
        Duration::from_secs_f64(scaled.min(self.cap.as_secs_f64()))
    }
}

/// Runs `f` up to `policy.max_attempts` times, sleeping with exponential
/// backoff between attempts, as long as `is_retryable` accepts the previous
/// error. Returns the last error if every attempt is exhausted or a
/// non-retryable error is returned.
pub async fn retry<T, E, F, Fut, R>(operation: &str, policy: RetryPolicy, is_retryable: R, mut f: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt += 1;
                let exhausted = attempt >= policy.max_attempts;
                if exhausted || !is_retryable(&err) {
                    if exhausted {
                        warn!(operation, attempt, "retry attempts exhausted: {err}");
                    }
                    return Err(err);
                }
                let backoff = policy.backoff_for_attempt(attempt - 1);
                warn!(operation, attempt, backoff_ms = backoff.as_millis() as u64, "retrying after error: {err}");
                tokio::time::sleep(backoff).await;
            }
        }
    }
}

/// Substrings the appliance client's `nvme connect` inner loop treats as
/// transient, per spec.md §5.
pub const NVME_TRANSIENT_PATTERNS: &[&str] = &[
    "failed to write to nvme-fabrics device",
    "could not add new controller",
    "connection refused",
    "connection timed out",
    "no route to host",
    "host is down",
    "network is unreachable",
];

pub fn is_transient_nvme_error(message: &str) -> bool {
    let lower = message.to_lowercase();
    NVME_TRANSIENT_PATTERNS.iter().any(|p| lower.contains(p))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn succeeds_without_retry() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1), 2.0, Duration::from_millis(10));
        let result: Result<u32, &str> = retry("noop", policy, |_| true, || async { Ok(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn retries_until_success() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(5, Duration::from_millis(1), 2.0, Duration::from_millis(10));
        let result: Result<u32, &str> = retry("eventually-ok", policy, |_| true, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err("connection refused")
                } else {
                    Ok(7)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn stops_on_non_retryable_error() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(5, Duration::from_millis(1), 2.0, Duration::from_millis(10));
        let result: Result<u32, &str> = retry("fatal", policy, |e: &&str| *e != "fatal", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("fatal") }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausts_all_attempts() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(3, Duration::from_millis(1), 2.0, Duration::from_millis(10));
        let result: Result<u32, &str> = retry("always-fails", policy, |_| true, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("connection refused") }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn detects_transient_nvme_errors() {
        assert!(is_transient_nvme_error("Connection refused"));
        assert!(is_transient_nvme_error("No route to host"));
        assert!(!is_transient_nvme_error("invalid NQN format"));
    }
}
