//! Poll-until-predicate-or-deadline loop shared by the pending-queue guard,
//! receipt polling and bridge credit detection.

use crate::error::OpsResult;

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Result of a bounded poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome<T> {
    Ready(T),
    TimedOut { elapsed: Duration },
}

/// Interval and deadline for a polling loop
#[derive(Debug, Clone, Copy)]
pub struct PollSchedule {
    pub interval: Duration,
    pub deadline: Duration,
}

impl PollSchedule {
    pub fn new(interval: Duration, deadline: Duration) -> Self {
        Self { interval, deadline }
    }
}

/// Call `check` until it yields `Some`, sleeping `interval` between attempts.
///
/// The first check runs immediately. Check errors are treated as transient
/// and retried until the deadline; the last error is only logged.
pub async fn poll_until<T, F, Fut>(
    what: &str,
    schedule: PollSchedule,
    mut check: F,
) -> OpsResult<PollOutcome<T>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = OpsResult<Option<T>>>,
{
    let started = Instant::now();
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        match check().await {
            Ok(Some(value)) => {
                debug!("{} ready after {} attempt(s)", what, attempts);
                return Ok(PollOutcome::Ready(value));
            }
            Ok(None) => {
                debug!("{} not ready ({}s elapsed)", what, started.elapsed().as_secs());
            }
            Err(e) => {
                warn!("{} check failed (attempt {}): {}", what, attempts, e);
            }
        }

        let elapsed = started.elapsed();
        if elapsed >= schedule.deadline {
            return Ok(PollOutcome::TimedOut { elapsed });
        }

        let remaining = schedule.deadline - elapsed;
        tokio::time::sleep(schedule.interval.min(remaining)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OpsError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn schedule() -> PollSchedule {
        PollSchedule::new(Duration::from_secs(10), Duration::from_secs(60))
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_on_first_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let outcome = poll_until("balance", schedule(), || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Some(7u32))
            }
        })
        .await
        .unwrap();

        assert_eq!(outcome, PollOutcome::Ready(7));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_after_transient_errors() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let outcome = poll_until("balance", schedule(), || {
            let counter = counter.clone();
            async move {
                match counter.fetch_add(1, Ordering::SeqCst) {
                    0 => Err(OpsError::Chain("connection reset".to_string())),
                    1 => Ok(None),
                    _ => Ok(Some("credited")),
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(outcome, PollOutcome::Ready("credited"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_at_deadline() {
        let outcome: PollOutcome<()> = poll_until("balance", schedule(), || async { Ok(None) })
            .await
            .unwrap();

        match outcome {
            PollOutcome::TimedOut { elapsed } => assert!(elapsed >= Duration::from_secs(60)),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }
}
