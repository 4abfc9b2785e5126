use std::time::Duration;

use tokio_util::sync::CancellationToken;

use gonc_types::NcError;

type Result<T> = gonc_types::NcResult<T>;

/// How an attempt failed, for [`Backoff::run`].
///
/// `Permanent` short-circuits the retry loop: the inner error is returned
/// immediately without sleeping. A plain `NcError` converts into `Transient`,
/// so operations can keep using `?`.
#[derive(Debug)]
pub enum AttemptError {
    Transient(NcError),
    Permanent(NcError),
}

impl From<NcError> for AttemptError {
    fn from(err: NcError) -> Self {
        AttemptError::Transient(err)
    }
}

/// Exponential backoff with optional jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Cap on the backoff duration.
    pub max_delay: Duration,
    /// Delay growth factor per attempt.
    pub multiplier: f64,
    /// Total number of tries including the first; 0 means unlimited
    /// (until cancelled).
    pub max_attempts: u32,
    /// Randomise each delay by ±25% to avoid thundering herds.
    pub jitter: bool,
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            max_attempts: 10,
            jitter: true,
        }
    }
}

impl Backoff {
    /// Run `attempt` (1-based) until it succeeds, fails permanently, or the
    /// retry budget is exhausted. Sleeps honour `cancel`.
    pub async fn run<T, F, Fut>(&self, cancel: &CancellationToken, mut attempt: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = std::result::Result<T, AttemptError>>,
    {
        let mut delay = if self.initial_delay.is_zero() {
            Duration::from_secs(1)
        } else {
            self.initial_delay
        };
        let multiplier = if self.multiplier <= 0.0 { 2.0 } else { self.multiplier };
        let max_delay = if self.max_delay.is_zero() {
            Duration::from_secs(60)
        } else {
            self.max_delay
        };

        let mut tries = 1u32;
        loop {
            let err = match attempt(tries).await {
                Ok(value) => return Ok(value),
                Err(AttemptError::Permanent(inner)) => return Err(inner),
                Err(AttemptError::Transient(inner)) => inner,
            };

            if self.max_attempts > 0 && tries >= self.max_attempts {
                return Err(NcError::RetriesExhausted {
                    attempts: self.max_attempts,
                    source: Box::new(err),
                });
            }

            let wait = if self.jitter { add_jitter(delay) } else { delay };
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(NcError::RetryCancelled {
                        source: Box::new(NcError::Cancelled),
                    });
                }
                _ = tokio::time::sleep(wait) => {}
            }

            delay = Duration::from_secs_f64(
                (delay.as_secs_f64() * multiplier).min(max_delay.as_secs_f64()),
            );
            tries += 1;
        }
    }
}

/// ±25% randomisation, floored at one millisecond.
fn add_jitter(d: Duration) -> Duration {
    let quarter = d.as_secs_f64() * 0.25;
    let delta = (rand::random::<f64>() * 2.0 * quarter) - quarter;
    Duration::from_secs_f64((d.as_secs_f64() + delta).max(0.001))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        sync::{
            Arc,
            atomic::{AtomicU32, Ordering},
        },
        time::Instant,
    };

    fn fast_backoff(max_attempts: u32) -> Backoff {
        Backoff {
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            multiplier: 2.0,
            max_attempts,
            jitter: false,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn succeeds_immediately_without_sleeping() {
        let token = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));
        let result = fast_backoff(10)
            .run(&token, |_| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, AttemptError>(42)
                }
            })
            .await
            .unwrap();
        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn exhausts_the_attempt_budget_exactly() {
        let token = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));
        let err = fast_backoff(4)
            .run::<(), _, _>(&token, |_| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(AttemptError::Transient(NcError::other("still failing")))
                }
            })
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert!(matches!(err, NcError::RetriesExhausted { attempts: 4, .. }));
        assert!(err.to_string().starts_with("max retries (4) exceeded"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn permanent_errors_stop_after_one_call() {
        let token = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));
        let err = fast_backoff(10)
            .run::<(), _, _>(&token, |_| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(AttemptError::Permanent(NcError::AuthFailed("bad key".into())))
                }
            })
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        // The inner cause comes back unmodified, not wrapped.
        assert!(matches!(err, NcError::AuthFailed(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn attempt_numbers_are_one_based() {
        let token = CancellationToken::new();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let _ = fast_backoff(3)
            .run::<(), _, _>(&token, |attempt| {
                let seen = seen.clone();
                async move {
                    seen.lock().unwrap().push(attempt);
                    Err(AttemptError::Transient(NcError::other("nope")))
                }
            })
            .await;
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancellation_interrupts_the_sleep() {
        let token = CancellationToken::new();
        let backoff = Backoff {
            initial_delay: Duration::from_secs(10),
            jitter: false,
            ..Backoff::default()
        };
        let canceller = {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                token.cancel();
            })
        };

        let started = Instant::now();
        let err = backoff
            .run::<(), _, _>(&token, |_| async {
                Err(AttemptError::Transient(NcError::other("transient")))
            })
            .await
            .unwrap_err();
        canceller.await.unwrap();

        assert!(matches!(err, NcError::RetryCancelled { .. }));
        assert!(
            started.elapsed() < Duration::from_secs(2),
            "cancellation took {:?}",
            started.elapsed()
        );
        assert!(err.to_string().starts_with("retry cancelled"));
    }

    #[test]
    fn jitter_stays_within_a_quarter() {
        let base = Duration::from_millis(100);
        for _ in 0..100 {
            let jittered = add_jitter(base);
            assert!(jittered >= Duration::from_millis(74), "{jittered:?}");
            assert!(jittered <= Duration::from_millis(126), "{jittered:?}");
        }
    }
}
