//! Request Coordinator
//!
//! Per-exchange singleton that every outbound call passes through. Enforces
//! a sliding-window request budget and minimum inter-request spacing,
//! tracks consecutive failures behind a circuit breaker, and honors venue
//! penalties: a soft 60 s backoff on HTTP 429 and a hard IP ban on HTTP 418.
//! Rejected calls fail fast with a typed error so callers can fall back to
//! cached data instead of queueing.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::domain::errors::ExchangeError;

/// Extra wait past the window edge when the ring is full.
const ADMISSION_SLACK: Duration = Duration::from_millis(100);

/// Endpoints above this per-minute rate are called out in emergency dumps.
const HIGH_FREQUENCY_THRESHOLD: u64 = 15;

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub max_requests_per_minute: usize,
    pub min_request_interval: Duration,
    pub failure_threshold: u32,
    pub circuit_breaker_timeout: Duration,
    /// Soft backoff applied on any 429.
    pub soft_backoff: Duration,
    /// Ban length when the venue does not report one.
    pub default_ban: Duration,
    /// Sliding window length. Only tests shrink this below one minute.
    pub window: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        CoordinatorConfig {
            max_requests_per_minute: 100,
            min_request_interval: Duration::from_millis(200),
            failure_threshold: 5,
            circuit_breaker_timeout: Duration::from_secs(120),
            soft_backoff: Duration::from_secs(60),
            default_ban: Duration::from_secs(300),
            window: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
struct CoordinatorState {
    request_times: VecDeque<Instant>,
    last_request: Option<Instant>,
    consecutive_failures: u32,
    circuit_open_until: Option<Instant>,
    backoff_until: Option<Instant>,
    ip_banned_until: Option<Instant>,
    endpoint_counts: HashMap<String, u64>,
    counters_since: Instant,
}

impl CoordinatorState {
    fn new() -> Self {
        CoordinatorState {
            request_times: VecDeque::new(),
            last_request: None,
            consecutive_failures: 0,
            circuit_open_until: None,
            backoff_until: None,
            ip_banned_until: None,
            endpoint_counts: HashMap::new(),
            counters_since: Instant::now(),
        }
    }

    fn evict_expired(&mut self, now: Instant, window: Duration) {
        while let Some(&front) = self.request_times.front() {
            if now.duration_since(front) > window {
                self.request_times.pop_front();
            } else {
                break;
            }
        }
    }

    fn top_endpoints(&self, n: usize) -> Vec<(String, u64)> {
        let mut entries: Vec<(String, u64)> = self
            .endpoint_counts
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        entries.sort_by(|a, b| b.1.cmp(&a.1));
        entries.truncate(n);
        entries
    }
}

/// Read-only view for the health aggregator.
#[derive(Debug, Clone)]
pub struct CoordinatorSnapshot {
    pub requests_last_minute: usize,
    pub consecutive_failures: u32,
    pub circuit_open: bool,
    pub circuit_remaining: Option<Duration>,
    pub backoff_remaining: Option<Duration>,
    pub ban_remaining: Option<Duration>,
}

impl CoordinatorSnapshot {
    pub fn is_blocked(&self) -> bool {
        self.circuit_open || self.backoff_remaining.is_some() || self.ban_remaining.is_some()
    }
}

pub struct RequestCoordinator {
    name: String,
    config: CoordinatorConfig,
    state: Mutex<CoordinatorState>,
}

impl RequestCoordinator {
    pub fn new(name: &str, config: CoordinatorConfig) -> Arc<Self> {
        Arc::new(RequestCoordinator {
            name: name.to_string(),
            config,
            state: Mutex::new(CoordinatorState::new()),
        })
    }

    /// Admission protocol, called before every outbound request.
    ///
    /// Holding the state mutex across the spacing waits serializes
    /// admission per exchange, which is intended. Rejections never wait.
    pub async fn admit(&self, endpoint: &str) -> Result<(), ExchangeError> {
        let mut state = self.state.lock().await;
        let now = Instant::now();

        if let Some(until) = state.ip_banned_until {
            if now < until {
                return Err(ExchangeError::CoordinatorBlocked {
                    retry_after: until - now,
                });
            }
            state.ip_banned_until = None;
            info!("{}: IP ban expired, resuming requests", self.name);
        }
        if let Some(until) = state.backoff_until {
            if now < until {
                return Err(ExchangeError::CoordinatorBlocked {
                    retry_after: until - now,
                });
            }
            state.backoff_until = None;
            info!("{}: 429 backoff expired, resuming requests", self.name);
        }
        if let Some(until) = state.circuit_open_until {
            if now < until {
                return Err(ExchangeError::CoordinatorBlocked {
                    retry_after: until - now,
                });
            }
            state.circuit_open_until = None;
            state.consecutive_failures = 0;
            info!("{}: circuit breaker closed after timeout", self.name);
        }

        state.evict_expired(now, self.config.window);

        if state.request_times.len() >= self.config.max_requests_per_minute {
            let oldest = *state
                .request_times
                .front()
                .expect("non-empty ring when at capacity");
            let deadline = oldest + self.config.window + ADMISSION_SLACK;
            let wait = deadline.saturating_duration_since(now);
            if wait > self.config.window + ADMISSION_SLACK {
                return Err(ExchangeError::CoordinatorBlocked { retry_after: wait });
            }
            if !wait.is_zero() {
                warn!(
                    "{}: request window full ({}), waiting {:?}",
                    self.name,
                    state.request_times.len(),
                    wait
                );
                tokio::time::sleep(wait).await;
            }
            state.evict_expired(Instant::now(), self.config.window);
        }

        if let Some(last) = state.last_request {
            let since = last.elapsed();
            if since < self.config.min_request_interval {
                tokio::time::sleep(self.config.min_request_interval - since).await;
            }
        }

        let stamp = Instant::now();
        state.request_times.push_back(stamp);
        state.last_request = Some(stamp);
        *state.endpoint_counts.entry(endpoint.to_string()).or_insert(0) += 1;

        Ok(())
    }

    pub async fn record_success(&self) {
        let mut state = self.state.lock().await;
        state.consecutive_failures = 0;
    }

    pub async fn record_failure(&self) {
        let mut state = self.state.lock().await;
        state.consecutive_failures += 1;
        if state.consecutive_failures >= self.config.failure_threshold
            && state.circuit_open_until.is_none()
        {
            state.circuit_open_until = Some(Instant::now() + self.config.circuit_breaker_timeout);
            error!(
                "{}: {} consecutive failures, circuit open for {:?}",
                self.name, state.consecutive_failures, self.config.circuit_breaker_timeout
            );
        }
    }

    /// Soft penalty: pause all requests for the backoff window and dump the
    /// hottest endpoints so the operator can see what tripped the venue.
    pub async fn handle_429(&self) {
        let mut state = self.state.lock().await;
        state.backoff_until = Some(Instant::now() + self.config.soft_backoff);
        warn!(
            "{}: received 429, backing off for {:?}",
            self.name, self.config.soft_backoff
        );
        Self::emergency_dump(&self.name, &state);
    }

    /// Hard penalty: honor the venue-reported ban length (default 5 min)
    /// and open the circuit to match.
    pub async fn handle_418(&self, ban_duration: Option<Duration>) {
        let duration = ban_duration.unwrap_or(self.config.default_ban);
        let until = Instant::now() + duration;
        let mut state = self.state.lock().await;
        state.ip_banned_until = Some(until);
        state.circuit_open_until = Some(until);
        error!(
            "{}: received 418 (IP ban), blocked for {:?}",
            self.name, duration
        );
        Self::emergency_dump(&self.name, &state);
    }

    fn emergency_dump(name: &str, state: &CoordinatorState) {
        let elapsed_minutes = state.counters_since.elapsed().as_secs_f64() / 60.0;
        let top = state.top_endpoints(10);
        warn!("{}: emergency endpoint dump (top 10): {:?}", name, top);
        if elapsed_minutes > 0.0 {
            for (endpoint, count) in &top {
                let per_minute = *count as f64 / elapsed_minutes;
                if per_minute > HIGH_FREQUENCY_THRESHOLD as f64 {
                    warn!(
                        "{}: endpoint {} running hot at {:.1} req/min",
                        name, endpoint, per_minute
                    );
                }
            }
        }
    }

    pub async fn snapshot(&self) -> CoordinatorSnapshot {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        state.evict_expired(now, self.config.window);
        let remaining = |deadline: Option<Instant>| {
            deadline.and_then(|until| {
                if now < until {
                    Some(until - now)
                } else {
                    None
                }
            })
        };
        CoordinatorSnapshot {
            requests_last_minute: state.request_times.len(),
            consecutive_failures: state.consecutive_failures,
            circuit_open: remaining(state.circuit_open_until).is_some(),
            circuit_remaining: remaining(state.circuit_open_until),
            backoff_remaining: remaining(state.backoff_until),
            ban_remaining: remaining(state.ip_banned_until),
        }
    }

    /// Background reporting: every five minutes log the request rate and
    /// the top endpoints, then roll the counters.
    pub fn spawn_reporting(self: &Arc<Self>) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(300));
            interval.tick().await; // immediate first tick is not a report
            loop {
                interval.tick().await;
                let mut state = coordinator.state.lock().await;
                let now = Instant::now();
                state.evict_expired(now, coordinator.config.window);
                let total: u64 = state.endpoint_counts.values().sum();
                let minutes = state.counters_since.elapsed().as_secs_f64() / 60.0;
                info!(
                    "{}: {:.1} req/min over the last {:.1} min, in-window {}, top endpoints {:?}",
                    coordinator.name,
                    if minutes > 0.0 { total as f64 / minutes } else { 0.0 },
                    minutes,
                    state.request_times.len(),
                    state.top_endpoints(10)
                );
                state.endpoint_counts.clear();
                state.counters_since = now;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> CoordinatorConfig {
        CoordinatorConfig {
            max_requests_per_minute: 3,
            min_request_interval: Duration::from_millis(1),
            failure_threshold: 3,
            circuit_breaker_timeout: Duration::from_millis(200),
            soft_backoff: Duration::from_millis(150),
            default_ban: Duration::from_millis(250),
            window: Duration::from_millis(300),
        }
    }

    #[tokio::test]
    async fn test_admit_allows_within_budget() {
        let coordinator = RequestCoordinator::new("test", fast_config());
        for _ in 0..3 {
            coordinator.admit("/ticker").await.unwrap();
        }
        let snapshot = coordinator.snapshot().await;
        assert_eq!(snapshot.requests_last_minute, 3);
    }

    #[tokio::test]
    async fn test_admit_waits_for_window_when_full() {
        let coordinator = RequestCoordinator::new("test", fast_config());
        for _ in 0..3 {
            coordinator.admit("/ticker").await.unwrap();
        }
        let started = Instant::now();
        coordinator.admit("/ticker").await.unwrap();
        // must have waited for the oldest stamp to age out (plus slack)
        assert!(started.elapsed() >= Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_429_blocks_then_recovers() {
        let coordinator = RequestCoordinator::new("test", fast_config());
        coordinator.handle_429().await;

        let err = coordinator.admit("/ticker").await.unwrap_err();
        assert!(matches!(err, ExchangeError::CoordinatorBlocked { .. }));

        tokio::time::sleep(Duration::from_millis(200)).await;
        coordinator.admit("/ticker").await.unwrap();
    }

    #[tokio::test]
    async fn test_418_sets_ban_and_circuit() {
        let coordinator = RequestCoordinator::new("test", fast_config());
        coordinator.handle_418(None).await;

        let snapshot = coordinator.snapshot().await;
        assert!(snapshot.ban_remaining.is_some());
        assert!(snapshot.circuit_open);
        assert!(snapshot.is_blocked());

        let err = coordinator.admit("/ticker").await.unwrap_err();
        match err {
            ExchangeError::CoordinatorBlocked { retry_after } => {
                assert!(retry_after <= Duration::from_millis(250));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_418_honors_reported_duration() {
        let coordinator = RequestCoordinator::new("test", fast_config());
        coordinator
            .handle_418(Some(Duration::from_millis(50)))
            .await;
        tokio::time::sleep(Duration::from_millis(80)).await;
        coordinator.admit("/ticker").await.unwrap();
    }

    #[tokio::test]
    async fn test_circuit_opens_after_consecutive_failures() {
        let coordinator = RequestCoordinator::new("test", fast_config());
        for _ in 0..3 {
            coordinator.record_failure().await;
        }
        let err = coordinator.admit("/ticker").await.unwrap_err();
        assert!(matches!(err, ExchangeError::CoordinatorBlocked { .. }));

        // timeout closes it again
        tokio::time::sleep(Duration::from_millis(250)).await;
        coordinator.admit("/ticker").await.unwrap();
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let coordinator = RequestCoordinator::new("test", fast_config());
        coordinator.record_failure().await;
        coordinator.record_failure().await;
        coordinator.record_success().await;
        coordinator.record_failure().await;
        coordinator.record_failure().await;
        // never reached threshold of 3 consecutively
        coordinator.admit("/ticker").await.unwrap();
    }
}
