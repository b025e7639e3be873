use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tracing::debug;

/// Polls `probe` at a fixed interval until it yields `Some`, or until
/// `total` elapses. This is the single waiting primitive used by
/// navigation and extraction; nothing else should hand-roll sleep loops.
pub async fn poll_until<T, F, Fut>(interval: Duration, total: Duration, mut probe: F) -> Option<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline = Instant::now() + total;
    let mut attempt = 0u32;
    loop {
        if let Some(value) = probe(attempt).await {
            return Some(value);
        }
        attempt += 1;
        if Instant::now() + interval > deadline {
            return None;
        }
        sleep(interval).await;
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
    pub exponential: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(500),
            exponential: true,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (1-based), with a little jitter
    /// so two portals on the same host do not fall into lockstep.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = if self.exponential {
            self.base_delay * 2u32.saturating_pow(attempt.saturating_sub(1))
        } else {
            self.base_delay
        };
        let jitter_ms = rand::rng().random_range(0..=base.as_millis().min(250) as u64);
        base + Duration::from_millis(jitter_ms)
    }
}

/// Runs `op` up to `policy.attempts` times, sleeping between failures.
/// The last error is returned when every attempt fails.
pub async fn retry_with_backoff<T, E, F, Fut>(
    policy: BackoffPolicy,
    what: &str,
    mut op: F,
) -> Result<T, E>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < policy.attempts => {
                let delay = policy.delay_for(attempt);
                debug!(
                    target = "stocksync.retry",
                    what,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying after failure"
                );
                sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn poll_until_returns_first_success() {
        let hits = AtomicU32::new(0);
        let out = poll_until(Duration::from_millis(1), Duration::from_millis(200), |_| {
            let n = hits.fetch_add(1, Ordering::SeqCst);
            async move { if n >= 2 { Some(n) } else { None } }
        })
        .await;
        assert_eq!(out, Some(2));
    }

    #[tokio::test]
    async fn poll_until_gives_up_at_deadline() {
        let out: Option<()> =
            poll_until(Duration::from_millis(5), Duration::from_millis(20), |_| async { None })
                .await;
        assert!(out.is_none());
    }

    #[tokio::test]
    async fn retry_stops_after_attempt_budget() {
        let hits = AtomicU32::new(0);
        let policy = BackoffPolicy {
            attempts: 3,
            base_delay: Duration::from_millis(1),
            exponential: false,
        };
        let result: Result<(), String> = retry_with_backoff(policy, "always-fails", || {
            hits.fetch_add(1, Ordering::SeqCst);
            async { Err("nope".to_string()) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_returns_success_midway() {
        let hits = AtomicU32::new(0);
        let policy = BackoffPolicy {
            attempts: 5,
            base_delay: Duration::from_millis(1),
            exponential: false,
        };
        let result: Result<u32, String> = retry_with_backoff(policy, "flaky", || {
            let n = hits.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 1 {
                    Ok(n)
                } else {
                    Err("transient".to_string())
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 1);
    }

    #[test]
    fn exponential_delay_grows() {
        let policy = BackoffPolicy {
            attempts: 4,
            base_delay: Duration::from_millis(100),
            exponential: true,
        };
        assert!(policy.delay_for(3) >= Duration::from_millis(400));
        assert!(policy.delay_for(1) >= Duration::from_millis(100));
    }
}
