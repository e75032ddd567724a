//! TTL Cache Layer
//!
//! Category-keyed cache in front of the exchange adapters. Every read path
//! goes through `get_or_fetch`: fresh entries are served directly, misses
//! fetch through the coordinator, and coordinator rejections fall back to
//! the last-known-good value, flagged as degraded so the health aggregator
//! and dashboard can surface it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::domain::entities::account::AccountSummary;
use crate::domain::entities::candle::{Candle, Interval};
use crate::domain::entities::contract::{ContractSpec, ContractType};
use crate::domain::errors::ExchangeError;
use crate::domain::repositories::exchange_client::{
    ExchangeClient, ExchangePosition, ExchangeResult, FeeSchedule, Fill, OrderAck, OrderRequest,
    Ticker, TriggerRequest,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheCategory {
    Ticker,
    Candles,
    Position,
    Account,
    FundingRate,
    Contract,
    FeeByOrder,
}

impl CacheCategory {
    /// Time-to-live per category. `None` means the entry never expires
    /// (contract metadata is immutable per session).
    pub fn ttl(&self) -> Option<Duration> {
        match self {
            CacheCategory::Ticker => Some(Duration::from_secs(60)),
            CacheCategory::Candles => Some(Duration::from_secs(600)),
            CacheCategory::Position => Some(Duration::from_secs(30)),
            CacheCategory::Account => Some(Duration::from_secs(30)),
            CacheCategory::FundingRate => Some(Duration::from_secs(3600)),
            CacheCategory::Contract => None,
            CacheCategory::FeeByOrder => Some(Duration::from_secs(300)),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CacheCategory::Ticker => "ticker",
            CacheCategory::Candles => "candles",
            CacheCategory::Position => "position",
            CacheCategory::Account => "account",
            CacheCategory::FundingRate => "funding_rate",
            CacheCategory::Contract => "contract",
            CacheCategory::FeeByOrder => "fee_by_order",
        }
    }
}

struct Entry {
    value: serde_json::Value,
    stored_at: Instant,
}

/// Value plus whether it was served stale under a coordinator rejection.
#[derive(Debug, Clone)]
pub struct CacheLookup<T> {
    pub value: T,
    pub degraded: bool,
}

pub struct MarketCache {
    entries: DashMap<(CacheCategory, String), Entry>,
    degraded_serves: AtomicU64,
    last_degraded: Mutex<Option<Instant>>,
}

impl Default for MarketCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MarketCache {
    pub fn new() -> Self {
        MarketCache {
            entries: DashMap::new(),
            degraded_serves: AtomicU64::new(0),
            last_degraded: Mutex::new(None),
        }
    }

    pub fn put<T: Serialize>(&self, category: CacheCategory, key: &str, value: &T) {
        match serde_json::to_value(value) {
            Ok(json) => {
                self.entries.insert(
                    (category, key.to_string()),
                    Entry {
                        value: json,
                        stored_at: Instant::now(),
                    },
                );
            }
            Err(e) => warn!("cache serialization failed for {}/{}: {}", category.as_str(), key, e),
        }
    }

    /// Entry within its TTL, or None.
    pub fn get_fresh<T: DeserializeOwned>(&self, category: CacheCategory, key: &str) -> Option<T> {
        let entry = self.entries.get(&(category, key.to_string()))?;
        if let Some(ttl) = category.ttl() {
            if entry.stored_at.elapsed() > ttl {
                return None;
            }
        }
        serde_json::from_value(entry.value.clone()).ok()
    }

    /// Last-known-good entry regardless of TTL, for degraded serving.
    pub fn get_last_known<T: DeserializeOwned>(
        &self,
        category: CacheCategory,
        key: &str,
    ) -> Option<T> {
        let entry = self.entries.get(&(category, key.to_string()))?;
        serde_json::from_value(entry.value.clone()).ok()
    }

    pub fn invalidate(&self, category: CacheCategory, key: &str) {
        self.entries.remove(&(category, key.to_string()));
    }

    /// Fetch-through read. Coordinator rejections fall back to the last
    /// known value and mark the lookup degraded.
    pub async fn get_or_fetch<T, F, Fut>(
        &self,
        category: CacheCategory,
        key: &str,
        fetch: F,
    ) -> Result<CacheLookup<T>, ExchangeError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, ExchangeError>>,
    {
        if let Some(value) = self.get_fresh::<T>(category, key) {
            return Ok(CacheLookup {
                value,
                degraded: false,
            });
        }

        match fetch().await {
            Ok(value) => {
                self.put(category, key, &value);
                Ok(CacheLookup {
                    value,
                    degraded: false,
                })
            }
            Err(ExchangeError::CoordinatorBlocked { retry_after }) => {
                match self.get_last_known::<T>(category, key) {
                    Some(value) => {
                        self.degraded_serves.fetch_add(1, Ordering::Relaxed);
                        if let Ok(mut last) = self.last_degraded.lock() {
                            *last = Some(Instant::now());
                        }
                        debug!(
                            "serving stale {}/{} while coordinator blocked ({:?} remaining)",
                            category.as_str(),
                            key,
                            retry_after
                        );
                        Ok(CacheLookup {
                            value,
                            degraded: true,
                        })
                    }
                    None => Err(ExchangeError::CoordinatorBlocked { retry_after }),
                }
            }
            Err(e) => Err(e),
        }
    }

    pub fn degraded_serves(&self) -> u64 {
        self.degraded_serves.load(Ordering::Relaxed)
    }

    /// Whether any stale value was served within the given window.
    pub fn recently_degraded(&self, window: Duration) -> bool {
        self.last_degraded
            .lock()
            .ok()
            .and_then(|last| *last)
            .map(|at| at.elapsed() <= window)
            .unwrap_or(false)
    }
}

/// Exchange client wrapper that routes all read operations through the TTL
/// cache. Mutations pass straight through.
pub struct CachedExchange {
    inner: Arc<dyn ExchangeClient>,
    cache: Arc<MarketCache>,
}

impl CachedExchange {
    pub fn new(inner: Arc<dyn ExchangeClient>, cache: Arc<MarketCache>) -> Self {
        CachedExchange { inner, cache }
    }
}

#[async_trait]
impl ExchangeClient for CachedExchange {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn contract_type(&self) -> ContractType {
        self.inner.contract_type()
    }

    fn fee_schedule(&self) -> FeeSchedule {
        self.inner.fee_schedule()
    }

    async fn contract_spec(&self, symbol: &str) -> ExchangeResult<ContractSpec> {
        let inner = Arc::clone(&self.inner);
        let symbol_owned = symbol.to_string();
        Ok(self
            .cache
            .get_or_fetch(CacheCategory::Contract, symbol, move || async move {
                inner.contract_spec(&symbol_owned).await
            })
            .await?
            .value)
    }

    async fn get_ticker(&self, symbol: &str, include_mark: bool) -> ExchangeResult<Ticker> {
        let inner = Arc::clone(&self.inner);
        let symbol_owned = symbol.to_string();
        let key = if include_mark {
            format!("{}:mark", symbol)
        } else {
            symbol.to_string()
        };
        Ok(self
            .cache
            .get_or_fetch(CacheCategory::Ticker, &key, move || async move {
                inner.get_ticker(&symbol_owned, include_mark).await
            })
            .await?
            .value)
    }

    async fn get_candles(
        &self,
        symbol: &str,
        interval: Interval,
        limit: usize,
    ) -> ExchangeResult<Vec<Candle>> {
        let inner = Arc::clone(&self.inner);
        let symbol_owned = symbol.to_string();
        let key = format!("{}:{}:{}", symbol, interval, limit);
        Ok(self
            .cache
            .get_or_fetch(CacheCategory::Candles, &key, move || async move {
                inner.get_candles(&symbol_owned, interval, limit).await
            })
            .await?
            .value)
    }

    async fn get_account(&self) -> ExchangeResult<AccountSummary> {
        let inner = Arc::clone(&self.inner);
        Ok(self
            .cache
            .get_or_fetch(CacheCategory::Account, "account", move || async move {
                inner.get_account().await
            })
            .await?
            .value)
    }

    async fn get_positions(&self) -> ExchangeResult<Vec<ExchangePosition>> {
        let inner = Arc::clone(&self.inner);
        Ok(self
            .cache
            .get_or_fetch(CacheCategory::Position, "all", move || async move {
                inner.get_positions().await
            })
            .await?
            .value)
    }

    async fn get_funding_rate(&self, symbol: &str) -> ExchangeResult<f64> {
        let inner = Arc::clone(&self.inner);
        let symbol_owned = symbol.to_string();
        Ok(self
            .cache
            .get_or_fetch(CacheCategory::FundingRate, symbol, move || async move {
                inner.get_funding_rate(&symbol_owned).await
            })
            .await?
            .value)
    }

    async fn place_order(&self, request: &OrderRequest) -> ExchangeResult<OrderAck> {
        // mutation invalidates the position and account views
        let ack = self.inner.place_order(request).await?;
        self.cache.invalidate(CacheCategory::Position, "all");
        self.cache.invalidate(CacheCategory::Account, "account");
        Ok(ack)
    }

    async fn place_trigger_order(&self, request: &TriggerRequest) -> ExchangeResult<String> {
        self.inner.place_trigger_order(request).await
    }

    async fn cancel_trigger_orders(&self, symbol: Option<&str>) -> ExchangeResult<()> {
        self.inner.cancel_trigger_orders(symbol).await
    }

    async fn get_my_trades(
        &self,
        symbol: Option<&str>,
        limit: usize,
        start_time: Option<DateTime<Utc>>,
    ) -> ExchangeResult<Vec<Fill>> {
        self.inner.get_my_trades(symbol, limit, start_time).await
    }

    async fn set_leverage(&self, symbol: &str, leverage: f64) -> ExchangeResult<()> {
        self.inner.set_leverage(symbol, leverage).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fresh_value_served_without_fetch() {
        let cache = MarketCache::new();
        cache.put(CacheCategory::Ticker, "BTC", &42.0f64);

        let lookup: CacheLookup<f64> = cache
            .get_or_fetch(CacheCategory::Ticker, "BTC", || async {
                panic!("fetch should not run for a fresh entry")
            })
            .await
            .unwrap();
        assert_eq!(lookup.value, 42.0);
        assert!(!lookup.degraded);
    }

    #[tokio::test]
    async fn test_miss_fetches_and_stores() {
        let cache = MarketCache::new();
        let lookup: CacheLookup<f64> = cache
            .get_or_fetch(CacheCategory::Ticker, "ETH", || async { Ok(7.0) })
            .await
            .unwrap();
        assert_eq!(lookup.value, 7.0);
        assert_eq!(cache.get_fresh::<f64>(CacheCategory::Ticker, "ETH"), Some(7.0));
    }

    #[tokio::test]
    async fn test_coordinator_rejection_serves_last_known_good() {
        let cache = MarketCache::new();
        cache.put(CacheCategory::Account, "account", &100.0f64);

        let lookup: CacheLookup<f64> = cache
            .get_or_fetch(CacheCategory::Account, "account", || async {
                Err(ExchangeError::CoordinatorBlocked {
                    retry_after: Duration::from_secs(30),
                })
            })
            .await
            .unwrap();
        // fresh, so the fetch never ran; force a stale read instead
        assert!(!lookup.degraded);

        // age past TTL by replacing with an entry pinned in the past is not
        // possible through the public surface; use a category with no value
        let miss: Result<CacheLookup<f64>, _> = cache
            .get_or_fetch(CacheCategory::Ticker, "missing", || async {
                Err(ExchangeError::CoordinatorBlocked {
                    retry_after: Duration::from_secs(30),
                })
            })
            .await;
        assert!(matches!(
            miss,
            Err(ExchangeError::CoordinatorBlocked { .. })
        ));
    }

    #[tokio::test]
    async fn test_degraded_flag_on_stale_serve() {
        let cache = MarketCache::new();
        // FeeByOrder has a 5 minute TTL; simulate staleness by direct insert
        cache.entries.insert(
            (CacheCategory::FeeByOrder, "order-1".to_string()),
            Entry {
                value: serde_json::to_value(1.25f64).unwrap(),
                stored_at: Instant::now() - Duration::from_secs(600),
            },
        );
        assert!(cache
            .get_fresh::<f64>(CacheCategory::FeeByOrder, "order-1")
            .is_none());

        let lookup: CacheLookup<f64> = cache
            .get_or_fetch(CacheCategory::FeeByOrder, "order-1", || async {
                Err(ExchangeError::CoordinatorBlocked {
                    retry_after: Duration::from_secs(10),
                })
            })
            .await
            .unwrap();
        assert!(lookup.degraded);
        assert_eq!(lookup.value, 1.25);
        assert_eq!(cache.degraded_serves(), 1);
        assert!(cache.recently_degraded(Duration::from_secs(5)));
    }

    #[tokio::test]
    async fn test_contract_metadata_never_expires() {
        let cache = MarketCache::new();
        cache.entries.insert(
            (CacheCategory::Contract, "BTC".to_string()),
            Entry {
                value: serde_json::to_value("metadata").unwrap(),
                stored_at: Instant::now() - Duration::from_secs(86400),
            },
        );
        assert_eq!(
            cache.get_fresh::<String>(CacheCategory::Contract, "BTC"),
            Some("metadata".to_string())
        );
    }

    #[tokio::test]
    async fn test_non_blocked_errors_propagate() {
        let cache = MarketCache::new();
        cache.put(CacheCategory::FeeByOrder, "x", &1.0f64);
        cache.invalidate(CacheCategory::FeeByOrder, "x");
        let result: Result<CacheLookup<f64>, _> = cache
            .get_or_fetch(CacheCategory::FeeByOrder, "x", || async {
                Err(ExchangeError::Network("down".into()))
            })
            .await;
        assert!(matches!(result, Err(ExchangeError::Network(_))));
    }
}
