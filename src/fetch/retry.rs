//! Fixed-delay retries for flaky remote reads.

use anyhow::Result;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::config::RetryConfig;

/// Runs `op` up to `policy.attempts` times, sleeping `policy.wait_secs`
/// between failures. The last error is returned with `what` attached.
pub async fn with_retry<T, F, Fut>(what: &str, policy: RetryConfig, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < attempts => {
                warn!(
                    what,
                    attempt,
                    attempts,
                    wait_secs = policy.wait_secs,
                    error = %e,
                    "Attempt failed, retrying"
                );
                tokio::time::sleep(Duration::from_secs(policy.wait_secs)).await;
                attempt += 1;
            }
            Err(e) => return Err(e.context(format!("{what} failed after {attempts} attempt(s)"))),
        }
    }
}

/// Blocking counterpart of [`with_retry`] for synchronous zarr reads.
pub fn with_retry_blocking<T, F>(what: &str, policy: RetryConfig, mut op: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(e) if attempt < attempts => {
                warn!(
                    what,
                    attempt,
                    attempts,
                    wait_secs = policy.wait_secs,
                    error = %e,
                    "Attempt failed, retrying"
                );
                std::thread::sleep(Duration::from_secs(policy.wait_secs));
                attempt += 1;
            }
            Err(e) => return Err(e.context(format!("{what} failed after {attempts} attempt(s)"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;

    fn no_wait(attempts: usize) -> RetryConfig {
        RetryConfig {
            attempts,
            wait_secs: 0,
        }
    }

    #[test]
    fn test_blocking_retry_succeeds_second_time() {
        let mut calls = 0;
        let value = with_retry_blocking("read", no_wait(2), || {
            calls += 1;
            if calls == 1 {
                bail!("transient");
            }
            Ok(calls)
        })
        .unwrap();
        assert_eq!(value, 2);
    }

    #[test]
    fn test_blocking_retry_gives_up() {
        let mut calls = 0;
        let result: Result<()> = with_retry_blocking("read", no_wait(3), || {
            calls += 1;
            bail!("still broken")
        });
        assert!(result.is_err());
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_zero_attempts_still_runs_once() {
        let mut calls = 0;
        let _ = with_retry_blocking("read", no_wait(0), || -> Result<()> {
            calls += 1;
            bail!("nope")
        });
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn test_async_retry() {
        let mut calls = 0;
        let value = with_retry("list", no_wait(2), || {
            calls += 1;
            let n = calls;
            async move {
                if n < 2 {
                    bail!("transient");
                }
                Ok(n)
            }
        })
        .await
        .unwrap();
        assert_eq!(value, 2);
    }
}
