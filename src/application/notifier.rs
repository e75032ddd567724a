//! Notifier
//!
//! Cooldown-gated alert emitter used by the scheduler, risk engine, and
//! reconciler. Identical subjects within the cooldown window are coalesced.
//! Actual delivery (e.g. SMTP) is a collaborator behind `AlertSink`; the
//! default sink writes structured log lines so the system runs without
//! mail credentials.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertLevel {
    Info,
    Warning,
    Critical,
}

impl AlertLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertLevel::Info => "INFO",
            AlertLevel::Warning => "WARNING",
            AlertLevel::Critical => "CRITICAL",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Alert {
    pub level: AlertLevel,
    pub subject: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("alert delivery failed: {0}")]
    Delivery(String),
}

/// Delivery collaborator. An SMTP implementation lives outside the control
/// plane; tests inject recording sinks.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn deliver(&self, alert: &Alert) -> Result<(), NotifyError>;
}

/// Default sink: structured log output.
pub struct LogSink;

#[async_trait]
impl AlertSink for LogSink {
    async fn deliver(&self, alert: &Alert) -> Result<(), NotifyError> {
        match alert.level {
            AlertLevel::Info => info!("[alert] {}: {}", alert.subject, alert.body),
            AlertLevel::Warning => warn!("[alert] {}: {}", alert.subject, alert.body),
            AlertLevel::Critical => error!("[alert] {}: {}", alert.subject, alert.body),
        }
        Ok(())
    }
}

pub struct Notifier {
    sink: Arc<dyn AlertSink>,
    cooldown: Duration,
    recent: Mutex<HashMap<String, Instant>>,
    sent: std::sync::atomic::AtomicU64,
    suppressed: std::sync::atomic::AtomicU64,
}

impl Notifier {
    pub fn new(sink: Arc<dyn AlertSink>, cooldown: Duration) -> Arc<Self> {
        Arc::new(Notifier {
            sink,
            cooldown,
            recent: Mutex::new(HashMap::new()),
            sent: std::sync::atomic::AtomicU64::new(0),
            suppressed: std::sync::atomic::AtomicU64::new(0),
        })
    }

    pub fn with_default_cooldown(sink: Arc<dyn AlertSink>) -> Arc<Self> {
        Self::new(sink, Duration::from_secs(300))
    }

    /// Emit an alert unless an identical subject fired within the cooldown
    /// window. Returns whether the alert was delivered.
    pub async fn notify(&self, level: AlertLevel, subject: &str, body: &str) -> bool {
        {
            let mut recent = self.recent.lock().await;
            recent.retain(|_, at| at.elapsed() < self.cooldown);
            if recent.contains_key(subject) {
                self.suppressed
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                return false;
            }
            recent.insert(subject.to_string(), Instant::now());
        }

        let alert = Alert {
            level,
            subject: subject.to_string(),
            body: body.to_string(),
            created_at: Utc::now(),
        };
        match self.sink.deliver(&alert).await {
            Ok(()) => {
                self.sent.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                true
            }
            Err(e) => {
                error!("alert delivery failed for '{}': {}", subject, e);
                false
            }
        }
    }

    /// Subjects currently inside their cooldown window.
    pub async fn queue_depth(&self) -> usize {
        let mut recent = self.recent.lock().await;
        recent.retain(|_, at| at.elapsed() < self.cooldown);
        recent.len()
    }

    pub fn sent_total(&self) -> u64 {
        self.sent.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub fn suppressed_total(&self) -> u64 {
        self.suppressed.load(std::sync::atomic::Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSink {
        delivered: AtomicUsize,
    }

    #[async_trait]
    impl AlertSink for CountingSink {
        async fn deliver(&self, _alert: &Alert) -> Result<(), NotifyError> {
            self.delivered.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_identical_subjects_coalesced() {
        let sink = Arc::new(CountingSink {
            delivered: AtomicUsize::new(0),
        });
        let notifier = Notifier::new(sink.clone(), Duration::from_secs(60));

        assert!(notifier.notify(AlertLevel::Warning, "circuit open", "a").await);
        assert!(!notifier.notify(AlertLevel::Warning, "circuit open", "b").await);
        assert_eq!(sink.delivered.load(Ordering::SeqCst), 1);
        assert_eq!(notifier.suppressed_total(), 1);
    }

    #[tokio::test]
    async fn test_different_subjects_pass() {
        let sink = Arc::new(CountingSink {
            delivered: AtomicUsize::new(0),
        });
        let notifier = Notifier::new(sink.clone(), Duration::from_secs(60));

        notifier.notify(AlertLevel::Info, "a", "x").await;
        notifier.notify(AlertLevel::Info, "b", "x").await;
        assert_eq!(sink.delivered.load(Ordering::SeqCst), 2);
        assert_eq!(notifier.queue_depth().await, 2);
    }

    #[tokio::test]
    async fn test_cooldown_expiry_reopens_subject() {
        let sink = Arc::new(CountingSink {
            delivered: AtomicUsize::new(0),
        });
        let notifier = Notifier::new(sink.clone(), Duration::from_millis(30));

        notifier.notify(AlertLevel::Info, "a", "x").await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(notifier.notify(AlertLevel::Info, "a", "x").await);
        assert_eq!(sink.delivered.load(Ordering::SeqCst), 2);
    }
}
