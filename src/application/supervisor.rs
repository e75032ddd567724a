//! Loop supervision for the long-running periodic tasks.
//!
//! The decision loop, reversal monitor, and reconciler each run under a
//! supervisor that owns the cadence. A failing iteration stretches the wait
//! before the next attempt; a failure streak first escalates through the
//! notifier and, if the loop still cannot complete, aborts the process so
//! an external supervisor restarts it instead of trading half-blind.

use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::application::notifier::{AlertLevel, Notifier};

#[derive(Debug, Clone)]
pub struct LoopPolicy {
    /// Nominal time between iterations.
    pub period: Duration,
    /// Failure streak that triggers a warning alert.
    pub alert_after: u32,
    /// Failure streak that aborts the process.
    pub abort_after: u32,
    /// Ceiling on the stretched wait while the loop is failing.
    pub max_backoff: Duration,
}

impl LoopPolicy {
    pub fn every(period: Duration) -> Self {
        LoopPolicy {
            period,
            alert_after: 3,
            abort_after: 12,
            max_backoff: Duration::from_secs(300),
        }
    }

    /// Wait before the next iteration given the current failure streak.
    /// Healthy loops run at the nominal period; each failure doubles the
    /// wait up to the ceiling, but never below the period itself.
    fn next_wait(&self, failures: u32) -> Duration {
        if failures == 0 {
            return self.period;
        }
        let doubled = self
            .period
            .saturating_mul(2u32.saturating_pow(failures.min(8)));
        doubled.min(self.max_backoff).max(self.period)
    }
}

/// Drive one periodic loop forever.
///
/// # Panics
/// Aborts the process once `abort_after` consecutive iterations have
/// failed; a critical alert goes out first.
pub async fn supervise<F, Fut>(
    name: &'static str,
    policy: LoopPolicy,
    notifier: Arc<Notifier>,
    mut iteration: F,
) where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<(), String>>,
{
    let mut failures: u32 = 0;
    info!("{} loop running every {:?}", name, policy.period);

    loop {
        tokio::time::sleep(policy.next_wait(failures)).await;

        match iteration().await {
            Ok(()) => {
                if failures > 0 {
                    info!("{} loop healthy again after {} failed iterations", name, failures);
                }
                failures = 0;
            }
            Err(e) => {
                failures += 1;
                warn!("{} iteration failed ({} in a row): {}", name, failures, e);

                if failures == policy.alert_after {
                    notifier
                        .notify(
                            AlertLevel::Warning,
                            &format!("{} loop degraded", name),
                            &format!("{} consecutive failures, last: {}", failures, e),
                        )
                        .await;
                }
                if failures >= policy.abort_after {
                    notifier
                        .notify(
                            AlertLevel::Critical,
                            &format!("{} loop aborting", name),
                            &format!("{} consecutive failures, last: {}", failures, e),
                        )
                        .await;
                    panic!(
                        "{} loop gave up after {} consecutive failures: {}",
                        name, failures, e
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::notifier::{Alert, AlertSink, NotifyError};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    struct RecordingSink {
        warnings: AtomicUsize,
        criticals: AtomicUsize,
    }

    #[async_trait]
    impl AlertSink for RecordingSink {
        async fn deliver(&self, alert: &Alert) -> Result<(), NotifyError> {
            match alert.level {
                AlertLevel::Warning => self.warnings.fetch_add(1, Ordering::SeqCst),
                AlertLevel::Critical => self.criticals.fetch_add(1, Ordering::SeqCst),
                AlertLevel::Info => 0,
            };
            Ok(())
        }
    }

    fn fast_policy() -> LoopPolicy {
        LoopPolicy {
            period: Duration::from_millis(5),
            alert_after: 2,
            abort_after: 4,
            max_backoff: Duration::from_millis(40),
        }
    }

    #[test]
    fn test_wait_stretches_under_failure_and_caps() {
        let policy = fast_policy();
        assert_eq!(policy.next_wait(0), Duration::from_millis(5));
        assert_eq!(policy.next_wait(1), Duration::from_millis(10));
        assert_eq!(policy.next_wait(2), Duration::from_millis(20));
        // capped at max_backoff from here on
        assert_eq!(policy.next_wait(3), Duration::from_millis(40));
        assert_eq!(policy.next_wait(30), Duration::from_millis(40));
    }

    #[test]
    fn test_wait_never_drops_below_period() {
        let mut policy = fast_policy();
        policy.max_backoff = Duration::from_millis(1);
        assert_eq!(policy.next_wait(5), policy.period);
    }

    #[tokio::test]
    async fn test_streak_alerts_once_then_resets_on_recovery() {
        let sink = Arc::new(RecordingSink {
            warnings: AtomicUsize::new(0),
            criticals: AtomicUsize::new(0),
        });
        let notifier = Notifier::new(sink.clone(), Duration::from_millis(1));

        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_inner = Arc::clone(&attempts);
        let handle = tokio::spawn(supervise(
            "flaky",
            fast_policy(),
            notifier,
            move || {
                let n = attempts_inner.fetch_add(1, Ordering::SeqCst);
                async move {
                    // two failures, then recovery
                    if n < 2 {
                        Err("boom".to_string())
                    } else {
                        Ok(())
                    }
                }
            },
        ));

        tokio::time::sleep(Duration::from_millis(150)).await;
        handle.abort();

        assert!(attempts.load(Ordering::SeqCst) >= 3);
        assert_eq!(sink.warnings.load(Ordering::SeqCst), 1);
        assert_eq!(sink.criticals.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_persistent_failure_escalates_and_aborts() {
        let sink = Arc::new(RecordingSink {
            warnings: AtomicUsize::new(0),
            criticals: AtomicUsize::new(0),
        });
        let notifier = Notifier::new(sink.clone(), Duration::from_millis(1));

        let handle = tokio::spawn(supervise("doomed", fast_policy(), notifier, || async {
            Err("always".to_string())
        }));

        let joined = tokio::time::timeout(Duration::from_secs(2), handle).await;
        // the loop panicked inside the spawned task
        let err = joined.expect("loop should abort in time").unwrap_err();
        assert!(err.is_panic());
        assert_eq!(sink.warnings.load(Ordering::SeqCst), 1);
        assert_eq!(sink.criticals.load(Ordering::SeqCst), 1);
    }
}
