//! Health Aggregator
//!
//! Read-only fusion of coordinator state, reconciler state, store
//! counters, and the notifier queue into one verdict the dashboard can
//! render. A penalty window (circuit open, 429 backoff, IP ban) degrades
//! the verdict but keeps `healthy = true`; only a failing reconciler or
//! critical errors flip it to unhealthy.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::application::notifier::{AlertLevel, Notifier};
use crate::application::reconciler::Reconciler;
use crate::infrastructure::cache::MarketCache;
use crate::infrastructure::coordinator::RequestCoordinator;
use crate::persistence::repository::Store;

/// How long after a stale serve the cache still counts as degraded.
const DEGRADED_WINDOW: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreakerStatus {
    pub is_open: bool,
    pub reason: Option<String>,
    pub remaining_seconds: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionMismatches {
    pub only_in_exchange: Vec<String>,
    pub only_in_db: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthDetails {
    pub orphan_orders: i64,
    pub inconsistent_states: i64,
    pub open_positions: i64,
    pub active_triggers: i64,
    pub notifier_queue: usize,
    pub position_mismatches: PositionMismatches,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub healthy: bool,
    pub status: HealthStatus,
    pub issues: Vec<String>,
    pub warnings: Vec<String>,
    pub timestamp: DateTime<Utc>,
    pub details: HealthDetails,
    pub circuit_breaker: CircuitBreakerStatus,
}

pub struct HealthAggregator {
    coordinator: Arc<RequestCoordinator>,
    reconciler: Arc<Reconciler>,
    store: Arc<Store>,
    cache: Arc<MarketCache>,
    notifier: Arc<Notifier>,
}

impl HealthAggregator {
    pub fn new(
        coordinator: Arc<RequestCoordinator>,
        reconciler: Arc<Reconciler>,
        store: Arc<Store>,
        cache: Arc<MarketCache>,
        notifier: Arc<Notifier>,
    ) -> Arc<Self> {
        Arc::new(HealthAggregator {
            coordinator,
            reconciler,
            store,
            cache,
            notifier,
        })
    }

    pub async fn check(&self) -> HealthReport {
        let mut issues = Vec::new();
        let mut warnings = Vec::new();

        let snapshot = self.coordinator.snapshot().await;
        let (reason, remaining) = if let Some(ban) = snapshot.ban_remaining {
            (Some("IP封禁".to_string()), ban)
        } else if let Some(backoff) = snapshot.backoff_remaining {
            (Some("rate limit backoff".to_string()), backoff)
        } else if let Some(circuit) = snapshot.circuit_remaining {
            (Some("circuit breaker open".to_string()), circuit)
        } else {
            (None, Duration::ZERO)
        };
        let circuit_breaker = CircuitBreakerStatus {
            is_open: snapshot.is_blocked(),
            reason: reason.clone(),
            remaining_seconds: remaining.as_secs(),
        };
        if let Some(reason) = &reason {
            warnings.push(format!(
                "using cached data: {} ({}s remaining)",
                reason,
                remaining.as_secs()
            ));
        }

        let cache_degraded = self.cache.recently_degraded(DEGRADED_WINDOW);
        if cache_degraded && reason.is_none() {
            warnings.push("cache recently served stale data".to_string());
        }

        let reconcile = self.reconciler.last_outcome().await;
        let reconciler_failing = reconcile.as_ref().map(|o| !o.success).unwrap_or(false);
        if reconciler_failing {
            issues.push("reconciler last run failed".to_string());
        }
        let mismatches = reconcile
            .as_ref()
            .map(|o| PositionMismatches {
                only_in_exchange: o.only_in_exchange.clone(),
                only_in_db: o.only_in_db.clone(),
            })
            .unwrap_or(PositionMismatches {
                only_in_exchange: Vec::new(),
                only_in_db: Vec::new(),
            });
        if !mismatches.only_in_exchange.is_empty() {
            warnings.push(format!(
                "{} exchange positions without local mirror",
                mismatches.only_in_exchange.len()
            ));
        }

        let inconsistent_states = self
            .store
            .inconsistencies
            .count_unresolved()
            .await
            .unwrap_or_else(|e| {
                warn!("health: cannot count inconsistent states: {}", e);
                issues.push("store unreachable".to_string());
                0
            });
        if inconsistent_states > 0 {
            warnings.push(format!("{} unresolved inconsistent states", inconsistent_states));
        }
        let open_positions = self.store.positions.count().await.unwrap_or(0);
        let active_triggers = self.store.triggers.count_active().await.unwrap_or(0);
        let orphan_orders = reconcile
            .as_ref()
            .map(|o| o.orphans_cancelled as i64)
            .unwrap_or(0);

        let status = if !issues.is_empty() {
            HealthStatus::Unhealthy
        } else if circuit_breaker.is_open || cache_degraded {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        HealthReport {
            healthy: status != HealthStatus::Unhealthy,
            status,
            issues,
            warnings,
            timestamp: Utc::now(),
            details: HealthDetails {
                orphan_orders,
                inconsistent_states,
                open_positions,
                active_triggers,
                notifier_queue: self.notifier.queue_depth().await,
                position_mismatches: mismatches,
            },
            circuit_breaker,
        }
    }

    /// Background refresh: alerts on transitions into unhealthy.
    pub async fn run(self: Arc<Self>, interval: Duration) {
        let mut was_unhealthy = false;
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let report = self.check().await;
            if !report.healthy && !was_unhealthy {
                self.notifier
                    .notify(
                        AlertLevel::Critical,
                        "system unhealthy",
                        &report.issues.join("; "),
                    )
                    .await;
            }
            was_unhealthy = !report.healthy;
        }
    }
}
