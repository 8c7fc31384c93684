//! Bounded polling against an eventually consistent system
//!
//! Every read of external state goes through a [`Poller`]. A check returns
//! `Ok` once the condition holds, [`Attempt::Retry`] while it does not hold
//! yet (including transient read errors), or [`Attempt::Abort`] when what it
//! observed can never become correct. Retries are bounded by the poll
//! timeout; aborts end the loop at once.

use std::future::Future;
use std::time::Duration;

use tokio::time::{Instant, sleep, timeout};

use crate::config::PollConfig;
use crate::error::{ProbeError, VerifyError, VerifyResult};

/// Outcome of one unsuccessful check
#[derive(Debug)]
pub enum Attempt {
    /// Not there yet; carries what was observed
    Retry(String),
    /// Observed state is wrong; stop polling
    Abort(VerifyError),
}

impl Attempt {
    /// Retry with a rendered observation
    pub fn retry(observed: impl std::fmt::Display) -> Self {
        Self::Retry(observed.to_string())
    }
}

impl From<ProbeError> for Attempt {
    fn from(err: ProbeError) -> Self {
        Self::Retry(format!("read failed: {err}"))
    }
}

impl From<VerifyError> for Attempt {
    fn from(err: VerifyError) -> Self {
        Self::Abort(err)
    }
}

/// Polls a check until it holds or the timeout expires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Poller {
    timeout: Duration,
    interval: Duration,
}

impl Poller {
    /// Poller with the given bounds
    pub fn new(config: PollConfig) -> Self {
        Self {
            timeout: config.timeout,
            interval: config.interval,
        }
    }

    /// Timeout of each loop
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Pause between attempts
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Poll `check` until it returns `Ok`
    ///
    /// Fails with [`VerifyError::PollTimeout`] carrying the last observation
    /// once the timeout expires, or with the abort error of a check.
    pub async fn eventually<T, F, Fut>(&self, condition: &str, mut check: F) -> VerifyResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, Attempt>>,
    {
        let deadline = Instant::now() + self.timeout;
        let mut attempts = 0u32;
        let mut last_observed = String::from("nothing");

        loop {
            attempts += 1;
            let remaining = deadline.saturating_duration_since(Instant::now());

            match timeout(remaining, check()).await {
                Ok(Ok(value)) => {
                    tracing::debug!(condition, attempts, "Condition met");
                    return Ok(value);
                }
                Ok(Err(Attempt::Abort(err))) => {
                    tracing::warn!(condition, attempts, error = %err, "Check aborted");
                    return Err(err);
                }
                Ok(Err(Attempt::Retry(observed))) => {
                    tracing::trace!(condition, attempts, observed = %observed, "Condition not met yet");
                    last_observed = observed;
                }
                Err(_) => {
                    last_observed = format!("attempt {attempts} did not finish in time");
                }
            }

            let now = Instant::now();
            if now >= deadline {
                tracing::warn!(
                    condition,
                    attempts,
                    timeout_ms = self.timeout.as_millis(),
                    last_observed = %last_observed,
                    "Polling timed out"
                );
                return Err(VerifyError::PollTimeout {
                    condition: condition.to_string(),
                    timeout: self.timeout,
                    attempts,
                    last_observed,
                });
            }
            sleep(self.interval.min(deadline - now)).await;
        }
    }

    /// Require `check` to hold on every poll for `window`
    ///
    /// Any failed attempt, transient or not, is an invariant violation.
    pub async fn consistently<F, Fut>(
        &self,
        condition: &str,
        window: Duration,
        mut check: F,
    ) -> VerifyResult<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), Attempt>>,
    {
        let deadline = Instant::now() + window;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            match check().await {
                Ok(()) => {}
                Err(Attempt::Abort(err)) => return Err(err),
                Err(Attempt::Retry(observed)) => {
                    tracing::warn!(condition, attempts, observed = %observed, "Consistency broken");
                    return Err(VerifyError::violation(
                        condition,
                        format!("did not hold on attempt {attempts}: {observed}"),
                    ));
                }
            }

            let now = Instant::now();
            if now >= deadline {
                tracing::debug!(condition, attempts, "Held for the whole window");
                return Ok(());
            }
            sleep(self.interval.min(deadline - now)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn poller() -> Poller {
        Poller::new(PollConfig {
            timeout: Duration::from_secs(10),
            interval: Duration::from_secs(1),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn eventually_absorbs_transient_errors() {
        let calls = Arc::new(AtomicU32::new(0));
        let value = poller()
            .eventually("third time lucky", || {
                let calls = Arc::clone(&calls);
                async move {
                    match calls.fetch_add(1, Ordering::SeqCst) {
                        0 => Err(ProbeError::Unavailable("connection refused".into()).into()),
                        1 => Err(Attempt::retry("phase Preparing")),
                        _ => Ok(42),
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn eventually_times_out_with_last_observation() {
        let start = Instant::now();
        let err = poller()
            .eventually("never", || async { Err::<(), _>(Attempt::retry("phase Preparing")) })
            .await
            .unwrap_err();

        assert!(start.elapsed() >= Duration::from_secs(10));
        match err {
            VerifyError::PollTimeout {
                last_observed,
                attempts,
                ..
            } => {
                assert_eq!(last_observed, "phase Preparing");
                assert_eq!(attempts, 11);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn abort_stops_before_timeout() {
        let start = Instant::now();
        let err = poller()
            .eventually("shape", || async {
                Err::<(), _>(Attempt::Abort(VerifyError::violation("count", "3 != 2")))
            })
            .await
            .unwrap_err();
        assert!(err.is_violation());
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn consistently_fails_on_first_lapse() {
        let calls = Arc::new(AtomicU32::new(0));
        let err = poller()
            .consistently("old password rejected", Duration::from_secs(5), || {
                let calls = Arc::clone(&calls);
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Ok(())
                    } else {
                        Err(Attempt::retry("accepted with 200"))
                    }
                }
            })
            .await
            .unwrap_err();
        assert!(err.is_violation());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn consistently_polls_for_the_whole_window() {
        let calls = Arc::new(AtomicU32::new(0));
        poller()
            .consistently("stable", Duration::from_secs(3), || {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }
}
