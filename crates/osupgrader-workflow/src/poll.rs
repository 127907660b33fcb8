//! Wait-until-condition helper shared by every polling phase

use std::future::Future;
use std::time::Duration;

use osupgrader_hypervisor::HypervisorError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{Result, UpgradeError};

/// Consecutive transient errors tolerated before a poll gives up
pub const DEFAULT_MAX_CONSECUTIVE_TRANSIENT: u32 = 5;

/// Result of one remote observation
pub(crate) enum Observation<T> {
    Satisfied(T),
    Pending,
    Transient(String),
    Fatal(UpgradeError),
}

impl<T> Observation<T> {
    /// Classify a remote error by its transience
    pub(crate) fn from_remote_error(operation: &'static str, err: HypervisorError) -> Self {
        if err.is_transient() {
            Observation::Transient(err.to_string())
        } else {
            Observation::Fatal(UpgradeError::remote(operation, err))
        }
    }
}

/// How a poll ended when it did not fail
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum PollResult<T> {
    Satisfied(T),
    TimedOut,
    Cancelled,
}

#[derive(Debug, Clone)]
pub(crate) struct PollSpec {
    pub what: &'static str,
    pub interval: Duration,
    pub timeout: Option<Duration>,
    pub max_consecutive_transient: u32,
}

impl PollSpec {
    pub fn new(what: &'static str, interval: Duration) -> Self {
        Self {
            what,
            interval,
            timeout: None,
            max_consecutive_transient: DEFAULT_MAX_CONSECUTIVE_TRANSIENT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[cfg(test)]
    pub fn with_max_transient(mut self, max: u32) -> Self {
        self.max_consecutive_transient = max;
        self
    }
}

/// Observe until satisfied, timed out or cancelled
///
/// Sleeps one interval before every observation. Exactly
/// `max_consecutive_transient` transient errors in a row are tolerated; the
/// next one is fatal. Any other observation resets the count.
pub(crate) async fn poll_until<T, F, Fut>(
    spec: &PollSpec,
    cancel: &CancellationToken,
    mut observe: F,
) -> Result<PollResult<T>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Observation<T>>,
{
    let deadline = spec.timeout.map(|t| Instant::now() + t);
    let mut consecutive = 0u32;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(PollResult::Cancelled),
            _ = sleep_until_opt(deadline) => return Ok(PollResult::TimedOut),
            _ = tokio::time::sleep(spec.interval) => {}
        }

        match observe().await {
            Observation::Satisfied(value) => return Ok(PollResult::Satisfied(value)),
            Observation::Pending => consecutive = 0,
            Observation::Transient(message) => {
                consecutive += 1;
                warn!(
                    what = spec.what,
                    attempt = consecutive,
                    max = spec.max_consecutive_transient,
                    error = %message,
                    "Transient error while polling"
                );
                if consecutive > spec.max_consecutive_transient {
                    return Err(UpgradeError::TooManyTransientErrors {
                        what: spec.what,
                        count: consecutive,
                        last: message,
                    });
                }
            }
            Observation::Fatal(err) => return Err(err),
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> PollSpec {
        PollSpec::new("test condition", Duration::from_secs(5))
    }

    #[tokio::test(start_paused = true)]
    async fn test_satisfied_after_pending() {
        let cancel = CancellationToken::new();
        let mut calls = 0;
        let started = Instant::now();

        let result = poll_until(&spec(), &cancel, || {
            calls += 1;
            let n = calls;
            async move {
                if n < 3 {
                    Observation::Pending
                } else {
                    Observation::Satisfied(n)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(result, PollResult::Satisfied(3));
        assert_eq!(started.elapsed(), Duration::from_secs(15));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tolerates_max_transient_errors() {
        let cancel = CancellationToken::new();
        let mut calls = 0;

        let result = poll_until(&spec(), &cancel, || {
            calls += 1;
            let n = calls;
            async move {
                if n <= 5 {
                    Observation::Transient(format!("error {}", n))
                } else {
                    Observation::Satisfied(())
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(result, PollResult::Satisfied(()));
        assert_eq!(calls, 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_escalates_after_max_transient_errors() {
        let cancel = CancellationToken::new();
        let mut calls = 0;

        let result: Result<PollResult<()>> = poll_until(&spec(), &cancel, || {
            calls += 1;
            let n = calls;
            async move {
                if n <= 6 {
                    Observation::Transient(format!("error {}", n))
                } else {
                    Observation::Satisfied(())
                }
            }
        })
        .await;

        match result {
            Err(UpgradeError::TooManyTransientErrors { count, last, .. }) => {
                assert_eq!(count, 6);
                assert_eq!(last, "error 6");
            }
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
        assert_eq!(calls, 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_resets_transient_count() {
        let cancel = CancellationToken::new();
        let mut calls = 0;

        // 4 errors, a pending, then 4 more errors: never more than 4 in a row
        let result = poll_until(&spec().with_max_transient(4), &cancel, || {
            calls += 1;
            let n = calls;
            async move {
                match n {
                    5 => Observation::Pending,
                    1..=9 => Observation::Transient("flaky".to_string()),
                    _ => Observation::Satisfied(n),
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(result, PollResult::Satisfied(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_aborts_immediately() {
        let cancel = CancellationToken::new();
        let mut calls = 0;

        let result: Result<PollResult<()>> = poll_until(&spec(), &cancel, || {
            calls += 1;
            async { Observation::Fatal(UpgradeError::MissingProcess) }
        })
        .await;

        assert!(matches!(result, Err(UpgradeError::MissingProcess)));
        assert_eq!(calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out() {
        let cancel = CancellationToken::new();
        let mut calls = 0;
        let started = Instant::now();

        let result: PollResult<()> = poll_until(
            &spec().with_timeout(Duration::from_secs(30)),
            &cancel,
            || {
                calls += 1;
                async { Observation::Pending }
            },
        )
        .await
        .unwrap();

        assert_eq!(result, PollResult::TimedOut);
        assert_eq!(started.elapsed(), Duration::from_secs(30));
        assert_eq!(calls, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_wins() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(12)).await;
            trigger.cancel();
        });

        let result: PollResult<()> = poll_until(&spec(), &cancel, || async { Observation::Pending })
            .await
            .unwrap();

        assert_eq!(result, PollResult::Cancelled);
    }

    #[test]
    fn test_remote_error_classification() {
        let obs: Observation<()> = Observation::from_remote_error(
            "query",
            HypervisorError::ConnectionFailed("reset".to_string()),
        );
        assert!(matches!(obs, Observation::Transient(_)));

        let obs: Observation<()> = Observation::from_remote_error(
            "query",
            HypervisorError::AuthenticationFailed("denied".to_string()),
        );
        assert!(matches!(obs, Observation::Fatal(UpgradeError::Remote { .. })));
    }
}
