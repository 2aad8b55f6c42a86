use crate::error::IngestError;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, warn};

/// Bounded retry with exponential backoff. The delay doubles after
/// every failed attempt and is capped at `max_delay`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts before giving up. Zero means retry forever.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

/// Run `op` until it succeeds, it fails with a non-transient error, or
/// the policy's attempt budget runs out. Schema and configuration
/// errors are never retried; repeating those cannot help.
pub async fn retry<T, F, Fut>(policy: &RetryPolicy, what: &str, mut op: F) -> Result<T, IngestError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, IngestError>>,
{
    let mut attempt = 0u32;
    let mut delay = policy.base_delay;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_transient() => return Err(e),
            Err(e) => {
                if policy.max_attempts != 0 && attempt >= policy.max_attempts {
                    error!("{} failed after {} attempts, giving up: {}", what, attempt, e);
                    return Err(e);
                }
                warn!(
                    "{} failed (attempt {}), retrying in {:?}: {}",
                    what, attempt, delay, e
                );
                sleep(delay).await;
                delay = (delay * 2).min(policy.max_delay);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }
    }

    #[tokio::test]
    async fn first_success_needs_no_retry() {
        let calls = Cell::new(0u32);
        let result = retry(&fast_policy(5), "op", || {
            calls.set(calls.get() + 1);
            async { Ok::<_, IngestError>(42) }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.get(), 1);
    }

    #[tokio::test]
    async fn transient_failures_retry_until_success() {
        let calls = Cell::new(0u32);
        let result = retry(&fast_policy(5), "op", || {
            let n = calls.get() + 1;
            calls.set(n);
            async move {
                if n < 3 {
                    Err(IngestError::Persistence("pool exhausted".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.get(), 3);
    }

    #[tokio::test]
    async fn attempt_budget_is_honored() {
        let calls = Cell::new(0u32);
        let result: Result<(), _> = retry(&fast_policy(3), "op", || {
            calls.set(calls.get() + 1);
            async { Err(IngestError::Connection("refused".into())) }
        })
        .await;

        assert!(matches!(result, Err(IngestError::Connection(_))));
        assert_eq!(calls.get(), 3);
    }

    #[tokio::test]
    async fn non_transient_errors_short_circuit() {
        let calls = Cell::new(0u32);
        let result: Result<(), _> = retry(&fast_policy(5), "op", || {
            calls.set(calls.get() + 1);
            async { Err(IngestError::Schema("column missing".into())) }
        })
        .await;

        assert!(matches!(result, Err(IngestError::Schema(_))));
        assert_eq!(calls.get(), 1);
    }

    #[tokio::test]
    async fn zero_attempts_means_unbounded() {
        let calls = Cell::new(0u32);
        let result = retry(&fast_policy(0), "op", || {
            let n = calls.get() + 1;
            calls.set(n);
            async move {
                if n < 6 {
                    Err(IngestError::Persistence("still down".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 6);
        assert_eq!(calls.get(), 6);
    }
}
