//! Exchange Capability Interface
//!
//! The uniform contract over which the rest of the control plane operates.
//! Two concrete adapters (one linear venue, one inverse/contract-unit venue)
//! satisfy this trait; the risk engine, scheduler, and reconciler never see
//! venue-specific request or response shapes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

use crate::domain::entities::account::AccountSummary;
use crate::domain::entities::candle::{Candle, Interval};
use crate::domain::entities::contract::{ContractSpec, ContractType};
use crate::domain::entities::position::PositionSide;
use crate::domain::errors::ExchangeError;

pub type ExchangeResult<T> = Result<T, ExchangeError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticker {
    pub last: f64,
    pub mark_price: Option<f64>,
    pub index_price: Option<f64>,
}

impl Ticker {
    /// Mark price when available, else last.
    pub fn mark_or_last(&self) -> f64 {
        self.mark_price.unwrap_or(self.last)
    }
}

/// Position as reported by the venue. `size` is always positive; direction
/// is carried by `side`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangePosition {
    pub symbol: String,
    pub side: PositionSide,
    pub size: f64,
    pub entry_price: f64,
    pub leverage: f64,
    pub liquidation_price: Option<f64>,
    pub unrealized_pnl: f64,
}

/// One fill from trade history, newest-first from `get_my_trades`. Fee is
/// in quote currency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub order_id: String,
    pub symbol: String,
    pub side: PositionSide,
    pub price: f64,
    pub quantity: f64,
    pub fee: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeInForce {
    Gtc,
    Ioc,
}

#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub symbol: String,
    /// Signed size: positive opens/extends longs, negative shorts.
    pub size: f64,
    /// None places a market order (forced to `tif = ioc`).
    pub price: Option<f64>,
    pub tif: TimeInForce,
    pub reduce_only: bool,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
}

impl OrderRequest {
    pub fn market(symbol: &str, size: f64) -> Self {
        OrderRequest {
            symbol: symbol.to_string(),
            size,
            price: None,
            tif: TimeInForce::Ioc,
            reduce_only: false,
            stop_loss: None,
            take_profit: None,
        }
    }

    pub fn reduce_only_market(symbol: &str, size: f64) -> Self {
        OrderRequest {
            reduce_only: true,
            ..Self::market(symbol, size)
        }
    }
}

/// Trigger comparison against the venue mark price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerRule {
    /// Fires when mark >= trigger price.
    GreaterOrEqual,
    /// Fires when mark <= trigger price.
    LessOrEqual,
}

#[derive(Debug, Clone)]
pub struct TriggerRequest {
    pub symbol: String,
    pub trigger_price: f64,
    /// Positive close size in contract units.
    pub close_size: f64,
    pub rule: TriggerRule,
    /// The position this trigger protects; the close order runs opposite.
    pub position_side: PositionSide,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderAck {
    pub id: String,
    pub status: String,
}

/// Taker/maker rates for the (venue, network) pair. Testnet rates differ
/// from mainnet, so adapters own their schedule.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FeeSchedule {
    pub taker_rate: f64,
    pub maker_rate: f64,
}

/// Capability interface all venue adapters satisfy.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    fn name(&self) -> &str;

    fn contract_type(&self) -> ContractType;

    fn fee_schedule(&self) -> FeeSchedule;

    /// Contract metadata; immutable per session.
    async fn contract_spec(&self, symbol: &str) -> ExchangeResult<ContractSpec>;

    /// Last price always; mark/index only when requested.
    async fn get_ticker(&self, symbol: &str, include_mark: bool) -> ExchangeResult<Ticker>;

    /// Time-ascending OHLCV, at most 1000 bars.
    async fn get_candles(
        &self,
        symbol: &str,
        interval: Interval,
        limit: usize,
    ) -> ExchangeResult<Vec<Candle>>;

    async fn get_account(&self) -> ExchangeResult<AccountSummary>;

    /// Only contracts in the configured symbol set; zero-size entries are
    /// filtered out.
    async fn get_positions(&self) -> ExchangeResult<Vec<ExchangePosition>>;

    async fn get_funding_rate(&self, symbol: &str) -> ExchangeResult<f64>;

    async fn place_order(&self, request: &OrderRequest) -> ExchangeResult<OrderAck>;

    /// Places a server-side trigger; returns the venue trigger id.
    async fn place_trigger_order(&self, request: &TriggerRequest) -> ExchangeResult<String>;

    /// Idempotent; a venue 404 is treated as success.
    async fn cancel_trigger_orders(&self, symbol: Option<&str>) -> ExchangeResult<()>;

    /// Newest-first fills.
    async fn get_my_trades(
        &self,
        symbol: Option<&str>,
        limit: usize,
        start_time: Option<DateTime<Utc>>,
    ) -> ExchangeResult<Vec<Fill>>;

    async fn set_leverage(&self, symbol: &str, leverage: f64) -> ExchangeResult<()>;

    fn calculate_quantity(
        &self,
        usdt: f64,
        price: f64,
        leverage: f64,
        contract: &ContractSpec,
    ) -> f64 {
        contract.calculate_quantity(usdt, price, leverage)
    }

    fn calculate_pnl(
        &self,
        entry: f64,
        exit: f64,
        quantity: f64,
        side: PositionSide,
        contract: &ContractSpec,
    ) -> f64 {
        contract.calculate_pnl(entry, exit, quantity, side)
    }
}

/// Retry delays for transient failures.
const RETRY_DELAYS: [Duration; 3] = [
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(4),
];

/// Run an exchange operation with exponential backoff on transient errors.
/// Permission errors, coordinator rejections, and insufficient-funds
/// failures propagate immediately.
pub async fn with_retry<T, F, Fut>(operation: &str, mut call: F) -> ExchangeResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = ExchangeResult<T>>,
{
    let attempts = RETRY_DELAYS.len() + 1;
    for attempt in 0..attempts {
        match call().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retriable() && attempt < RETRY_DELAYS.len() => {
                warn!(
                    "{} failed (attempt {}/{}): {}, retrying in {:?}",
                    operation,
                    attempt + 1,
                    attempts,
                    e,
                    RETRY_DELAYS[attempt]
                );
                tokio::time::sleep(RETRY_DELAYS[attempt]).await;
            }
            Err(e) => return Err(e),
        }
    }
    unreachable!("retry loop always returns")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_with_retry_recovers_from_transient() {
        let attempts = AtomicU32::new(0);
        let result = with_retry("test_op", || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(ExchangeError::Network("flaky".into()))
                } else {
                    Ok(42u32)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_with_retry_does_not_retry_permission_errors() {
        let attempts = AtomicU32::new(0);
        let result: ExchangeResult<u32> = with_retry("test_op", || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(ExchangeError::PermissionDenied("bad key".into())) }
        })
        .await;
        assert!(matches!(result, Err(ExchangeError::PermissionDenied(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_ticker_mark_or_last() {
        let with_mark = Ticker {
            last: 100.0,
            mark_price: Some(100.5),
            index_price: None,
        };
        assert_eq!(with_mark.mark_or_last(), 100.5);
        let without = Ticker {
            last: 100.0,
            mark_price: None,
            index_price: None,
        };
        assert_eq!(without.mark_or_last(), 100.0);
    }

    #[test]
    fn test_market_order_request_is_ioc() {
        let req = OrderRequest::market("BTC", 10.0);
        assert_eq!(req.tif, TimeInForce::Ioc);
        assert!(req.price.is_none());
        assert!(!req.reduce_only);
        assert!(OrderRequest::reduce_only_market("BTC", -10.0).reduce_only);
    }
}
