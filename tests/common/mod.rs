//! Shared test fixtures: an in-memory store and a scripted mock exchange.
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use helmsman::domain::entities::account::AccountSummary;
use helmsman::domain::entities::candle::{Candle, Interval};
use helmsman::domain::entities::contract::{ContractSpec, ContractType};
use helmsman::domain::entities::position::PositionSide;
use helmsman::domain::repositories::exchange_client::{
    ExchangeClient, ExchangePosition, ExchangeResult, FeeSchedule, Fill, OrderAck, OrderRequest,
    Ticker, TriggerRequest,
};
use helmsman::persistence::{init_database, repository::Store};

pub async fn memory_store() -> Arc<Store> {
    let pool = init_database("sqlite::memory:", 5).await.unwrap();
    Store::new(pool)
}

/// Flat candles around a price; ATR stays tiny so the stop distance clamps
/// to the policy minimum.
pub fn flat_candles(price: f64, n: usize) -> Vec<Candle> {
    (0..n)
        .map(|i| Candle {
            timestamp: Utc::now() - ChronoDuration::minutes((n - i) as i64 * 5),
            open: price,
            high: price * 1.0002,
            low: price * 0.9998,
            close: price,
            volume: 1000.0,
        })
        .collect()
}

#[derive(Default)]
pub struct MockState {
    pub marks: HashMap<String, f64>,
    pub positions: Vec<ExchangePosition>,
    pub fills: Vec<Fill>,
    pub candles: HashMap<String, Vec<Candle>>,
    pub placed_orders: Vec<OrderRequest>,
    pub placed_triggers: Vec<TriggerRequest>,
    pub cancel_trigger_calls: u32,
}

/// Scripted exchange double. Market orders fill instantly at the current
/// mark and update the scripted position set so reconciliation-style tests
/// can observe ground truth shifting.
pub struct MockExchange {
    pub state: Mutex<MockState>,
    next_order_id: AtomicU64,
}

impl MockExchange {
    pub fn new() -> Arc<Self> {
        Arc::new(MockExchange {
            state: Mutex::new(MockState::default()),
            next_order_id: AtomicU64::new(1000),
        })
    }

    pub fn set_mark(&self, symbol: &str, mark: f64) {
        self.state
            .lock()
            .unwrap()
            .marks
            .insert(symbol.to_string(), mark);
    }

    pub fn set_candles(&self, symbol: &str, candles: Vec<Candle>) {
        self.state
            .lock()
            .unwrap()
            .candles
            .insert(symbol.to_string(), candles);
    }

    pub fn add_fill(&self, fill: Fill) {
        self.state.lock().unwrap().fills.push(fill);
    }

    pub fn clear_positions(&self) {
        self.state.lock().unwrap().positions.clear();
    }

    fn next_id(&self) -> String {
        self.next_order_id.fetch_add(1, Ordering::SeqCst).to_string()
    }

    pub fn spec_for(symbol: &str) -> ContractSpec {
        ContractSpec {
            symbol: symbol.to_string(),
            venue_symbol: format!("{}_USDT", symbol),
            contract_type: ContractType::Inverse,
            quanto_multiplier: 0.0001,
            order_size_min: 1.0,
            order_size_max: 1_000_000.0,
            order_price_round: 0.0001,
            mark_price_round: 0.0001,
        }
    }
}

#[async_trait]
impl ExchangeClient for MockExchange {
    fn name(&self) -> &str {
        "mock"
    }

    fn contract_type(&self) -> ContractType {
        ContractType::Inverse
    }

    fn fee_schedule(&self) -> FeeSchedule {
        FeeSchedule {
            taker_rate: 0.0005,
            maker_rate: 0.0002,
        }
    }

    async fn contract_spec(&self, symbol: &str) -> ExchangeResult<ContractSpec> {
        Ok(Self::spec_for(symbol))
    }

    async fn get_ticker(&self, symbol: &str, include_mark: bool) -> ExchangeResult<Ticker> {
        let mark = *self
            .state
            .lock()
            .unwrap()
            .marks
            .get(symbol)
            .unwrap_or(&0.0);
        Ok(Ticker {
            last: mark,
            mark_price: if include_mark { Some(mark) } else { None },
            index_price: None,
        })
    }

    async fn get_candles(
        &self,
        symbol: &str,
        _interval: Interval,
        limit: usize,
    ) -> ExchangeResult<Vec<Candle>> {
        let candles = self
            .state
            .lock()
            .unwrap()
            .candles
            .get(symbol)
            .cloned()
            .unwrap_or_default();
        Ok(candles.into_iter().take(limit).collect())
    }

    async fn get_account(&self) -> ExchangeResult<AccountSummary> {
        Ok(AccountSummary {
            total: 1000.0,
            available: 1000.0,
            position_margin: 0.0,
            unrealized_pnl: 0.0,
        })
    }

    async fn get_positions(&self) -> ExchangeResult<Vec<ExchangePosition>> {
        Ok(self.state.lock().unwrap().positions.clone())
    }

    async fn get_funding_rate(&self, _symbol: &str) -> ExchangeResult<f64> {
        Ok(0.0001)
    }

    async fn place_order(&self, request: &OrderRequest) -> ExchangeResult<OrderAck> {
        let id = self.next_id();
        let mut state = self.state.lock().unwrap();
        let mark = *state.marks.get(&request.symbol).unwrap_or(&0.0);
        state.placed_orders.push(request.clone());

        let side = if request.size > 0.0 {
            PositionSide::Long
        } else {
            PositionSide::Short
        };
        state.fills.push(Fill {
            order_id: id.clone(),
            symbol: request.symbol.clone(),
            side,
            price: mark,
            quantity: request.size.abs(),
            fee: request.size.abs() * 0.0001 * mark * 0.0005,
            timestamp: Utc::now(),
        });

        // apply the fill to the scripted position set
        if request.reduce_only {
            let mut emptied = false;
            if let Some(position) = state
                .positions
                .iter_mut()
                .find(|p| p.symbol == request.symbol)
            {
                position.size = (position.size - request.size.abs()).max(0.0);
                emptied = position.size == 0.0;
            }
            if emptied {
                state.positions.retain(|p| p.size > 0.0);
            }
        } else {
            state.positions.push(ExchangePosition {
                symbol: request.symbol.clone(),
                side,
                size: request.size.abs(),
                entry_price: mark,
                leverage: 3.0,
                liquidation_price: None,
                unrealized_pnl: 0.0,
            });
        }

        Ok(OrderAck {
            id,
            status: "finished".to_string(),
        })
    }

    async fn place_trigger_order(&self, request: &TriggerRequest) -> ExchangeResult<String> {
        let id = self.next_id();
        self.state
            .lock()
            .unwrap()
            .placed_triggers
            .push(request.clone());
        Ok(id)
    }

    async fn cancel_trigger_orders(&self, _symbol: Option<&str>) -> ExchangeResult<()> {
        self.state.lock().unwrap().cancel_trigger_calls += 1;
        Ok(())
    }

    async fn get_my_trades(
        &self,
        symbol: Option<&str>,
        limit: usize,
        _start_time: Option<DateTime<Utc>>,
    ) -> ExchangeResult<Vec<Fill>> {
        let mut fills = self.state.lock().unwrap().fills.clone();
        if let Some(symbol) = symbol {
            fills.retain(|f| f.symbol == symbol);
        }
        fills.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        fills.truncate(limit);
        Ok(fills)
    }

    async fn set_leverage(&self, _symbol: &str, _leverage: f64) -> ExchangeResult<()> {
        Ok(())
    }
}
