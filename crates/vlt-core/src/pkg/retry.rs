//! Exponential-backoff retries for transient fetch failures.

use super::error::PkgError;
use crate::config::Config;
use std::future::Future;
use std::time::Duration;
use tokio_retry::RetryIf;
use tracing::debug;

/// Backoff tuning: the n-th retry waits `min * factor^(n-1)`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retries: usize,
    pub factor: u64,
    pub min_timeout: Duration,
    pub max_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            factor: 2,
            min_timeout: Duration::from_millis(10),
            max_timeout: Duration::from_millis(60_000),
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            retries: config.fetch_retries,
            factor: config.fetch_retry_factor,
            min_timeout: Duration::from_millis(config.fetch_retry_mintimeout),
            max_timeout: Duration::from_millis(config.fetch_retry_maxtimeout),
        }
    }

    /// No retries at all.
    #[must_use]
    pub fn none() -> Self {
        Self {
            retries: 0,
            ..Self::default()
        }
    }

    /// The delays between attempts.
    pub fn delays(&self) -> impl Iterator<Item = Duration> {
        let factor = self.factor.max(1);
        let min_ms = u64::try_from(self.min_timeout.as_millis()).unwrap_or(u64::MAX);
        let max = self.max_timeout;
        (0..self.retries).scan(min_ms, move |next, _| {
            let delay = Duration::from_millis(*next).min(max);
            *next = next.saturating_mul(factor);
            Some(delay)
        })
    }

    /// Run `action`, retrying while it fails with a transient error.
    ///
    /// # Errors
    /// Returns the last error once retries are exhausted, or the first
    /// non-transient error.
    pub async fn run<F, Fut, T>(&self, target: &str, mut action: F) -> Result<T, PkgError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, PkgError>>,
    {
        let mut attempt = 0usize;
        RetryIf::spawn(
            self.delays(),
            || {
                attempt += 1;
                if attempt > 1 {
                    debug!(url = %target, attempt, "retrying fetch");
                }
                action()
            },
            PkgError::is_transient,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_delays_grow_and_cap() {
        let policy = RetryPolicy {
            retries: 5,
            factor: 2,
            min_timeout: Duration::from_millis(10),
            max_timeout: Duration::from_millis(50),
        };
        let delays: Vec<u64> = policy
            .delays()
            .map(|d| u64::try_from(d.as_millis()).unwrap())
            .collect();
        assert_eq!(delays, vec![10, 20, 40, 50, 50]);
    }

    #[test]
    fn test_first_delay_is_min_timeout() {
        let policy = RetryPolicy {
            retries: 4,
            factor: 2,
            min_timeout: Duration::from_millis(15),
            max_timeout: Duration::from_millis(100),
        };
        let delays: Vec<u64> = policy
            .delays()
            .map(|d| u64::try_from(d.as_millis()).unwrap())
            .collect();
        assert_eq!(delays, vec![15, 30, 60, 100]);

        let odd = RetryPolicy {
            retries: 2,
            factor: 10,
            min_timeout: Duration::from_millis(1),
            max_timeout: Duration::from_secs(1),
        };
        assert_eq!(odd.delays().next(), Some(Duration::from_millis(1)));
    }

    #[test]
    fn test_none_has_no_delays() {
        assert_eq!(RetryPolicy::none().delays().count(), 0);
    }

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let calls = &AtomicUsize::new(0);
        let policy = RetryPolicy {
            min_timeout: Duration::from_millis(1),
            ..RetryPolicy::default()
        };
        let result = policy
            .run("x", move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(PkgError::fetch_transient("x", "reset"))
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let calls = &AtomicUsize::new(0);
        let result: Result<(), _> = RetryPolicy::default()
            .run("x", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(PkgError::NotFound("x".into()))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_budget_exhausted_surfaces_last_error() {
        let calls = &AtomicUsize::new(0);
        let policy = RetryPolicy {
            retries: 2,
            min_timeout: Duration::from_millis(1),
            ..RetryPolicy::default()
        };
        let err = policy
            .run("x", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(PkgError::fetch_transient("x", "reset"))
            })
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
