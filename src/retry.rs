//! Bounded retry with a per-attempt timeout.
//!
//! Shared by every outbound command call site (relay control, config push,
//! time sync) so the attempt count, delay schedule and timeout live in one
//! place.

use std::{future::Future, time::Duration};

use tokio::time;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Upper bound for a single attempt.
    pub attempt_timeout: Duration,
    /// Pause between a failed attempt and the next one.
    pub delay: Duration,
}

impl RetryPolicy {
    /// Relay round trip: 2 attempts of 2 s each.
    pub const RELAY: RetryPolicy = RetryPolicy {
        max_attempts: 2,
        attempt_timeout: Duration::from_secs(2),
        delay: Duration::from_millis(250),
    };

    /// Generic device command: 3 attempts bounded by the 5 s publish timeout.
    pub const COMMAND: RetryPolicy = RetryPolicy {
        max_attempts: 3,
        attempt_timeout: Duration::from_secs(5),
        delay: Duration::from_secs(1),
    };
}

#[derive(Debug, thiserror::Error)]
pub enum RetryError<E: std::error::Error + 'static> {
    #[error("timed out after {attempts} attempt(s)")]
    TimedOut { attempts: u32 },

    #[error("failed after {attempts} attempt(s): {source}")]
    Failed {
        attempts: u32,
        #[source]
        source: E,
    },
}

/// Run `op` until it succeeds or `policy.max_attempts` is exhausted.
///
/// The error of the last attempt decides the variant returned.
pub async fn retry<T, E, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T, RetryError<E>>
where
    E: std::error::Error + 'static,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        let last = match time::timeout(policy.attempt_timeout, op(attempt)).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) => {
                warn!(attempt, max_attempts = attempts, error = %e, "Attempt failed");
                RetryError::Failed { attempts: attempt, source: e }
            }
            Err(_) => {
                warn!(
                    attempt,
                    max_attempts = attempts,
                    timeout_ms = policy.attempt_timeout.as_millis() as u64,
                    "Attempt timed out"
                );
                RetryError::TimedOut { attempts: attempt }
            }
        };

        if attempt >= attempts {
            return Err(last);
        }
        attempt += 1;
        time::sleep(policy.delay).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("boom")]
    struct Boom;

    const FAST: RetryPolicy = RetryPolicy {
        max_attempts: 3,
        attempt_timeout: Duration::from_secs(1),
        delay: Duration::from_millis(10),
    };

    #[tokio::test(start_paused = true)]
    async fn returns_first_success() {
        let calls = AtomicU32::new(0);
        let out: Result<u32, RetryError<Boom>> = retry(&FAST, |n| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { if n < 2 { Err(Boom) } else { Ok(n) } }
        })
        .await;

        assert_eq!(out.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_attempts_and_reports_last_failure() {
        let calls = AtomicU32::new(0);
        let out: Result<(), RetryError<Boom>> = retry(&FAST, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Boom) }
        })
        .await;

        assert!(matches!(out, Err(RetryError::Failed { attempts: 3, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_attempts_time_out() {
        let out: Result<(), RetryError<Boom>> = retry(&RetryPolicy::RELAY, |_| async {
            std::future::pending::<Result<(), Boom>>().await
        })
        .await;

        assert!(matches!(out, Err(RetryError::TimedOut { attempts: 2 })));
    }
}
