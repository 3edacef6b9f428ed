use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::remote::RemoteError;

/// Attempt cap and delay schedule shared by every retried remote call.
///
/// The delay before retry `n` (zero-based) doubles from `first_delay` up to
/// `max_delay`; with jitter it is drawn from the upper half of that window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub first_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, first_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            first_delay,
            max_delay: max_delay.max(first_delay),
            jitter: true,
        }
    }

    pub fn without_jitter(self) -> Self {
        Self {
            jitter: false,
            ..self
        }
    }

    pub fn delay_before_retry(&self, retry: u32) -> Duration {
        self.delay_with_rng(retry, &mut rand::thread_rng())
    }

    pub fn delay_with_rng<R: Rng + ?Sized>(&self, retry: u32, rng: &mut R) -> Duration {
        let ceiling = self
            .first_delay
            .saturating_mul(1 << retry.min(16))
            .min(self.max_delay);
        if self.jitter {
            rng.gen_range(ceiling / 2..=ceiling)
        } else {
            ceiling
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, Duration::from_millis(500), Duration::from_secs(10))
    }
}

/// Errors that may succeed when the same call is repeated.
pub trait Retryable {
    fn is_transient(&self) -> bool;
}

impl Retryable for RemoteError {
    fn is_transient(&self) -> bool {
        RemoteError::is_transient(self)
    }
}

/// Runs `op` until it succeeds, fails with a non-transient error, or the
/// attempt cap is reached. The last error is returned on exhaustion.
pub async fn retry_transient<T, E, F, Fut>(
    policy: &RetryPolicy,
    what: &str,
    mut op: F,
) -> Result<T, E>
where
    E: Retryable + Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut retry = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && retry + 1 < policy.max_attempts => {
                let delay = policy.delay_before_retry(retry);
                tracing::warn!(
                    attempt = retry + 1,
                    delay_ms = delay.as_millis() as u64,
                    "{what} failed, retrying: {err}"
                );
                tokio::time::sleep(delay).await;
                retry += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_millis(1), Duration::from_millis(1))
            .without_jitter()
    }

    #[test]
    fn delays_double_up_to_the_cap() {
        let policy = RetryPolicy::new(9, Duration::from_millis(100), Duration::from_millis(800))
            .without_jitter();
        let mut rng = StdRng::seed_from_u64(1);
        let delays: Vec<u64> = (0..5)
            .map(|retry| policy.delay_with_rng(retry, &mut rng).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 800]);
    }

    #[test]
    fn jittered_delay_stays_in_upper_half() {
        let policy = RetryPolicy::new(9, Duration::from_millis(100), Duration::from_millis(800));
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..32 {
            let delay = policy.delay_with_rng(3, &mut rng);
            assert!(delay >= Duration::from_millis(400));
            assert!(delay <= Duration::from_millis(800));
        }
    }

    #[test]
    fn zero_attempts_still_runs_once() {
        let policy = RetryPolicy::new(0, Duration::from_millis(5), Duration::from_millis(1));
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.max_delay, Duration::from_millis(5));
    }

    #[tokio::test]
    async fn retries_transient_errors_until_success() {
        let calls = AtomicU32::new(0);
        let result = retry_transient(&fast_policy(3), "list", || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(RemoteError::Transient("timeout".into()))
            } else {
                Ok(7)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn stops_at_attempt_cap() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry_transient(&fast_policy(2), "list", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(RemoteError::Transient("timeout".into()))
        })
        .await;

        assert!(matches!(result, Err(RemoteError::Transient(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn does_not_retry_rejections() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry_transient(&fast_policy(5), "list", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(RemoteError::Rejected("bad manifest".into()))
        })
        .await;

        assert!(matches!(result, Err(RemoteError::Rejected(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
