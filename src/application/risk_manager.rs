//! Risk & Stop Engine
//!
//! Owns the full position lifecycle: scientific stop placement on open,
//! staged partial take-profit, peak-drawdown protection, trailing-stop
//! advancement, the hard holding-time cap, and the close paths. Every
//! mutation of a (symbol, side) pair runs under that pair's mutex, held
//! across the exchange and database phases. Emergency closes are posted to
//! an mpsc queue consumed by a single close worker so the reversal monitor
//! and the scheduler never race each other.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use tracing::{error, info, warn};

use crate::application::notifier::{AlertLevel, Notifier};
use crate::domain::entities::candle::Interval;
use crate::domain::entities::contract::ContractSpec;
use crate::domain::entities::position::{Position, PositionSide};
use crate::domain::errors::ExchangeError;
use crate::domain::repositories::exchange_client::{
    with_retry, ExchangeClient, OrderRequest, TriggerRequest,
};
use crate::domain::services::reversal;
use crate::domain::services::stop_policy::StopPolicy;
use crate::infrastructure::cache::{CacheCategory, MarketCache};
use crate::persistence::models::{
    NewCloseEvent, NewInconsistentState, NewPriceOrder, NewTrade,
};
use crate::persistence::repository::Store;
use crate::persistence::DatabaseError;

const CLOSE_QUEUE_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum RiskError {
    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error("no open position for {symbol} {side}")]
    NoPosition { symbol: String, side: PositionSide },

    #[error("position already open for {symbol} {side}")]
    AlreadyOpen { symbol: String, side: PositionSide },

    #[error("exchange order {order_id} acknowledged but local persistence failed: {detail}")]
    SplitState { order_id: String, detail: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    AgentDecision,
    StopLoss,
    TakeProfitTriggered,
    PartialClose,
    TrendReversal,
    PeakDrawdown,
    TimeLimit,
    SystemRecovered,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::AgentDecision => "agent_decision",
            CloseReason::StopLoss => "stop_loss_triggered",
            CloseReason::TakeProfitTriggered => "take_profit_triggered",
            CloseReason::PartialClose => "partial_close",
            CloseReason::TrendReversal => "trend_reversal",
            CloseReason::PeakDrawdown => "peak_drawdown",
            CloseReason::TimeLimit => "time_limit",
            CloseReason::SystemRecovered => "system_recovered",
        }
    }
}

/// Emergency close request posted by the reversal monitor or the scheduler
/// tick; consumed by the single close worker.
#[derive(Debug, Clone)]
pub struct CloseRequest {
    pub symbol: String,
    pub side: PositionSide,
    pub reason: CloseReason,
}

/// Registry of per-(symbol, side) mutexes serializing position mutations.
pub struct PositionLocks {
    inner: std::sync::Mutex<HashMap<(String, PositionSide), Arc<Mutex<()>>>>,
}

impl PositionLocks {
    pub fn new() -> Self {
        PositionLocks {
            inner: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub async fn acquire(&self, symbol: &str, side: PositionSide) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().expect("position lock registry poisoned");
            Arc::clone(
                map.entry((symbol.to_string(), side))
                    .or_insert_with(|| Arc::new(Mutex::new(()))),
            )
        };
        lock.lock_owned().await
    }
}

impl Default for PositionLocks {
    fn default() -> Self {
        Self::new()
    }
}

/// Ranked open candidate handed to the decision provider.
#[derive(Debug, Clone)]
pub struct Opportunity {
    pub symbol: String,
    pub side: PositionSide,
    pub score: f64,
}

pub struct RiskManager {
    exchange: Arc<dyn ExchangeClient>,
    store: Arc<Store>,
    cache: Arc<MarketCache>,
    notifier: Arc<Notifier>,
    policy: StopPolicy,
    locks: PositionLocks,
    symbols: Vec<String>,
    close_tx: mpsc::Sender<CloseRequest>,
}

impl RiskManager {
    pub fn new(
        exchange: Arc<dyn ExchangeClient>,
        store: Arc<Store>,
        cache: Arc<MarketCache>,
        notifier: Arc<Notifier>,
        policy: StopPolicy,
        symbols: Vec<String>,
    ) -> (Arc<Self>, mpsc::Receiver<CloseRequest>) {
        let (close_tx, close_rx) = mpsc::channel(CLOSE_QUEUE_CAPACITY);
        let manager = Arc::new(RiskManager {
            exchange,
            store,
            cache,
            notifier,
            policy,
            locks: PositionLocks::new(),
            symbols,
            close_tx,
        });
        (manager, close_rx)
    }

    pub fn policy(&self) -> &StopPolicy {
        &self.policy
    }

    pub fn close_sender(&self) -> mpsc::Sender<CloseRequest> {
        self.close_tx.clone()
    }

    /// Single consumer of the emergency close queue.
    pub async fn run_close_worker(self: Arc<Self>, mut rx: mpsc::Receiver<CloseRequest>) {
        info!("close worker started");
        while let Some(request) = rx.recv().await {
            info!(
                "close worker: closing {} {} ({})",
                request.symbol,
                request.side,
                request.reason.as_str()
            );
            match self
                .close_position(&request.symbol, request.side, request.reason)
                .await
            {
                Ok(()) => {}
                Err(RiskError::NoPosition { .. }) => {
                    // already closed by another path; queue entries may lag
                }
                Err(e) => {
                    error!(
                        "close worker failed for {} {}: {}",
                        request.symbol, request.side, e
                    );
                    self.notifier
                        .notify(
                            AlertLevel::Critical,
                            &format!("close failed: {} {}", request.symbol, request.side),
                            &e.to_string(),
                        )
                        .await;
                }
            }
        }
        info!("close worker stopped");
    }

    /// Open a position with scientific stop placement. The open order, both
    /// protective triggers, and all local rows commit atomically; if the
    /// store fails after the venue acknowledged, an inconsistency row is
    /// written before the error propagates.
    pub async fn open_position(
        &self,
        symbol: &str,
        side: PositionSide,
        notional_usdt: f64,
        leverage: f64,
    ) -> Result<String, RiskError> {
        let _guard = self.locks.acquire(symbol, side).await;

        if self.store.positions.get(symbol, side).await?.is_some() {
            return Err(RiskError::AlreadyOpen {
                symbol: symbol.to_string(),
                side,
            });
        }

        let contract = self.exchange.contract_spec(symbol).await?;
        let ticker = self.exchange.get_ticker(symbol, true).await?;
        let mark = ticker.mark_or_last();

        if let Err(e) = self.exchange.set_leverage(symbol, leverage).await {
            // non-fatal when the venue already holds exposure on the symbol
            let has_exposure = self
                .exchange
                .get_positions()
                .await
                .map(|positions| positions.iter().any(|p| p.symbol == symbol && p.size > 0.0))
                .unwrap_or(false);
            if has_exposure {
                warn!("set_leverage failed with open exposure on {}: {}", symbol, e);
            } else {
                return Err(RiskError::Exchange(e));
            }
        }

        let quantity = contract.clamp_size(self.exchange.calculate_quantity(
            notional_usdt,
            mark,
            leverage,
            &contract,
        ));
        if quantity <= 0.0 {
            return Err(RiskError::Exchange(ExchangeError::InvalidOrder(format!(
                "computed quantity {} for {} USDT at {}",
                quantity, notional_usdt, mark
            ))));
        }

        let request = OrderRequest::market(symbol, quantity * side.sign());
        let ack = with_retry("place_order", || self.exchange.place_order(&request)).await?;
        info!(
            "opened {} {} qty {} at ~{} (order {})",
            symbol, side, quantity, mark, ack.id
        );

        // Everything past this point follows a venue-acknowledged mutation.
        match self
            .arm_and_persist(symbol, side, quantity, leverage, mark, &contract, &ack.id)
            .await
        {
            Ok(()) => Ok(ack.id),
            Err(e) => {
                let detail = e.to_string();
                if let Err(record_err) = self
                    .store
                    .inconsistencies
                    .record(&NewInconsistentState {
                        operation: "open_position".to_string(),
                        symbol: symbol.to_string(),
                        side: side.as_str().to_string(),
                        exchange_order_id: ack.id.clone(),
                    })
                    .await
                {
                    error!(
                        "failed to record inconsistent state for {} {}: {}",
                        symbol, side, record_err
                    );
                }
                self.notifier
                    .notify(
                        AlertLevel::Critical,
                        &format!("split state on open: {} {}", symbol, side),
                        &detail,
                    )
                    .await;
                Err(RiskError::SplitState {
                    order_id: ack.id,
                    detail,
                })
            }
        }
    }

    async fn arm_and_persist(
        &self,
        symbol: &str,
        side: PositionSide,
        quantity: f64,
        leverage: f64,
        entry: f64,
        contract: &ContractSpec,
        order_id: &str,
    ) -> Result<(), RiskError> {
        let candles = self
            .exchange
            .get_candles(symbol, Interval::M5, 100)
            .await
            .unwrap_or_default();

        let distance = self.policy.stop_distance(entry, side, &candles);
        let protective = self.policy.protective_prices(entry, side, distance);

        let stop_rule = StopPolicy::stop_rule(side);
        let tp_rule = StopPolicy::take_profit_rule(side);
        let stop_price = contract
            .round_price(self.policy.validate_trigger(protective.stop_loss, entry, stop_rule));
        let tp_price = contract.round_price(self.policy.validate_trigger(
            protective.extreme_take_profit,
            entry,
            tp_rule,
        ));

        let stop_request = TriggerRequest {
            symbol: symbol.to_string(),
            trigger_price: stop_price,
            close_size: quantity,
            rule: stop_rule,
            position_side: side,
        };
        let stop_id = with_retry("place_stop_trigger", || {
            self.exchange.place_trigger_order(&stop_request)
        })
        .await?;
        let tp_request = TriggerRequest {
            symbol: symbol.to_string(),
            trigger_price: tp_price,
            close_size: quantity,
            rule: tp_rule,
            position_side: side,
        };
        let tp_id = with_retry("place_tp_trigger", || {
            self.exchange.place_trigger_order(&tp_request)
        })
        .await?;

        let mut position = Position::new(symbol, side, quantity, leverage, entry);
        position.stop_loss = Some(stop_price);
        position.take_profit = Some(tp_price);

        let open_trade = NewTrade {
            order_id: order_id.to_string(),
            symbol: symbol.to_string(),
            side: side.as_str().to_string(),
            trade_type: "open".to_string(),
            price: entry,
            quantity,
            leverage,
            pnl: None,
            fee: contract.notional(quantity, entry) * self.exchange.fee_schedule().taker_rate,
            close_reason: None,
            timestamp: Utc::now(),
        };

        let triggers = [
            NewPriceOrder {
                order_id: stop_id,
                symbol: symbol.to_string(),
                side: side.as_str().to_string(),
                order_type: "stop_loss".to_string(),
                trigger_price: stop_price,
                order_price: None,
                quantity,
                position_order_id: order_id.to_string(),
            },
            NewPriceOrder {
                order_id: tp_id,
                symbol: symbol.to_string(),
                side: side.as_str().to_string(),
                order_type: "extreme_take_profit".to_string(),
                trigger_price: tp_price,
                order_price: None,
                quantity,
                position_order_id: order_id.to_string(),
            },
        ];

        self.store
            .open_position_txn(&position, &open_trade, &triggers)
            .await?;
        info!(
            "armed {} {}: stop {} / extreme tp {} (distance {:.4})",
            symbol, side, stop_price, tp_price, distance
        );
        Ok(())
    }

    /// Close the full remaining position at market. Cancels sibling
    /// triggers and commits the close trade, close event, and position
    /// deletion in one transaction.
    pub async fn close_position(
        &self,
        symbol: &str,
        side: PositionSide,
        reason: CloseReason,
    ) -> Result<(), RiskError> {
        let _guard = self.locks.acquire(symbol, side).await;
        self.close_position_locked(symbol, side, reason).await
    }

    /// Close body. Callers must already hold the (symbol, side) mutex.
    async fn close_position_locked(
        &self,
        symbol: &str,
        side: PositionSide,
        reason: CloseReason,
    ) -> Result<(), RiskError> {
        let record = self
            .store
            .positions
            .get(symbol, side)
            .await?
            .ok_or_else(|| RiskError::NoPosition {
                symbol: symbol.to_string(),
                side,
            })?;
        let position = record.to_domain()?;

        let contract = self.exchange.contract_spec(symbol).await?;
        let ticker = self.exchange.get_ticker(symbol, true).await?;
        let close_price = ticker.last;

        let request =
            OrderRequest::reduce_only_market(symbol, -position.quantity * side.sign());
        let ack = with_retry("close_order", || self.exchange.place_order(&request)).await?;

        if let Err(e) = self.exchange.cancel_trigger_orders(Some(symbol)).await {
            warn!("cancelling venue triggers for {} failed: {}", symbol, e);
        }

        let pnl = self.exchange.calculate_pnl(
            position.entry_price,
            close_price,
            position.quantity,
            side,
            &contract,
        );
        let fee = self
            .lookup_fee(symbol, &ack.id, contract.notional(position.quantity, close_price))
            .await;

        let close_trade = NewTrade {
            order_id: ack.id.clone(),
            symbol: symbol.to_string(),
            side: side.as_str().to_string(),
            trade_type: "close".to_string(),
            price: close_price,
            quantity: position.quantity,
            leverage: position.leverage,
            pnl: Some(pnl),
            fee,
            close_reason: Some(reason.as_str().to_string()),
            timestamp: Utc::now(),
        };
        let event = NewCloseEvent {
            symbol: symbol.to_string(),
            side: side.as_str().to_string(),
            entry_price: position.entry_price,
            close_price,
            quantity: position.quantity,
            leverage: position.leverage,
            pnl,
            pnl_percent: position.pnl_percent(close_price),
            fee,
            close_reason: reason.as_str().to_string(),
            trigger_type: None,
            order_id: ack.id.clone(),
        };

        match self
            .store
            .close_position_txn(symbol, side, &close_trade, &event)
            .await
        {
            Ok(()) => {
                info!(
                    "closed {} {} at {} ({}, pnl {:.4})",
                    symbol,
                    side,
                    close_price,
                    reason.as_str(),
                    pnl
                );
                Ok(())
            }
            Err(e) => {
                let detail = e.to_string();
                if let Err(record_err) = self
                    .store
                    .inconsistencies
                    .record(&NewInconsistentState {
                        operation: "close_position".to_string(),
                        symbol: symbol.to_string(),
                        side: side.as_str().to_string(),
                        exchange_order_id: ack.id.clone(),
                    })
                    .await
                {
                    error!(
                        "failed to record inconsistent state for {} {}: {}",
                        symbol, side, record_err
                    );
                }
                Err(RiskError::SplitState {
                    order_id: ack.id,
                    detail,
                })
            }
        }
    }

    /// Read-only check: the R-multiple of the next reachable partial tier,
    /// if the position's current profit qualifies for one.
    pub async fn execute_partial_preview(
        &self,
        symbol: &str,
        side: PositionSide,
    ) -> Result<Option<f64>, RiskError> {
        let record = match self.store.positions.get(symbol, side).await? {
            Some(record) => record,
            None => return Ok(None),
        };
        let position = record.to_domain()?;
        let Some(distance) = self.policy.distance_from_position(&position) else {
            return Ok(None);
        };
        let ticker = self.exchange.get_ticker(symbol, true).await?;
        let pnl_r =
            self.policy
                .r_multiple(position.entry_price, ticker.mark_or_last(), side, distance);
        Ok(self
            .policy
            .next_partial(position.partial_close_fraction, pnl_r)
            .map(|(_, tier)| tier.r_multiple))
    }

    /// Execute the next qualifying partial take-profit tier, if any.
    /// Returns whether a partial (or the final full close) ran.
    pub async fn execute_partial(&self, symbol: &str, side: PositionSide) -> Result<bool, RiskError> {
        // one guard across read, exchange order, and the transaction
        let _guard = self.locks.acquire(symbol, side).await;

        let record = match self.store.positions.get(symbol, side).await? {
            Some(record) => record,
            None => return Ok(false),
        };
        let position = record.to_domain()?;
        let Some(distance) = self.policy.distance_from_position(&position) else {
            return Ok(false);
        };
        let ticker = self.exchange.get_ticker(symbol, true).await?;
        let mark = ticker.mark_or_last();
        let pnl_r = self
            .policy
            .r_multiple(position.entry_price, mark, side, distance);

        let Some((tier_index, tier)) = self
            .policy
            .next_partial(position.partial_close_fraction, pnl_r)
        else {
            return Ok(false);
        };

        let is_final = tier_index == self.policy.partial_tiers.len() - 1;
        if is_final {
            self.close_position_locked(symbol, side, CloseReason::TakeProfitTriggered)
                .await?;
            return Ok(true);
        }

        let contract = self.exchange.contract_spec(symbol).await?;

        let original = position.original_quantity();
        let close_quantity = contract.clamp_size(original * tier.fraction).abs();
        let remaining = (position.quantity - close_quantity).max(0.0);
        if remaining <= 0.0 {
            // tiny position: a fractional slice is not placeable, close out
            self.close_position_locked(symbol, side, CloseReason::TakeProfitTriggered)
                .await?;
            return Ok(true);
        }

        let request = OrderRequest::reduce_only_market(symbol, -close_quantity * side.sign());
        let ack = with_retry("partial_order", || self.exchange.place_order(&request)).await?;

        let new_fraction = position.partial_close_fraction + tier.fraction;
        let new_stop = contract.round_price(self.policy.stop_after_partial(
            position.entry_price,
            side,
            distance,
            tier.r_multiple,
        ));

        let replacements = self
            .replace_venue_triggers(symbol, side, &contract, mark, new_stop, position.take_profit, remaining, &ack.id)
            .await?;

        let pnl = self.exchange.calculate_pnl(
            position.entry_price,
            mark,
            close_quantity,
            side,
            &contract,
        );
        let fee = self
            .lookup_fee(symbol, &ack.id, contract.notional(close_quantity, mark))
            .await;

        let close_trade = NewTrade {
            order_id: ack.id.clone(),
            symbol: symbol.to_string(),
            side: side.as_str().to_string(),
            trade_type: "close".to_string(),
            price: mark,
            quantity: close_quantity,
            leverage: position.leverage,
            pnl: Some(pnl),
            fee,
            close_reason: Some(CloseReason::PartialClose.as_str().to_string()),
            timestamp: Utc::now(),
        };
        let event = NewCloseEvent {
            symbol: symbol.to_string(),
            side: side.as_str().to_string(),
            entry_price: position.entry_price,
            close_price: mark,
            quantity: close_quantity,
            leverage: position.leverage,
            pnl,
            pnl_percent: position.pnl_percent(mark),
            fee,
            close_reason: CloseReason::PartialClose.as_str().to_string(),
            trigger_type: None,
            order_id: ack.id.clone(),
        };

        match self
            .store
            .partial_close_txn(
                symbol,
                side,
                remaining,
                new_fraction,
                Some(new_stop),
                &replacements,
                &close_trade,
                &event,
            )
            .await
        {
            Ok(()) => {
                info!(
                    "partial close {} {} at {:.1}R: closed {}, fraction {:.2}, stop -> {}",
                    symbol, side, tier.r_multiple, close_quantity, new_fraction, new_stop
                );
                Ok(true)
            }
            Err(e) => {
                let detail = e.to_string();
                if let Err(record_err) = self
                    .store
                    .inconsistencies
                    .record(&NewInconsistentState {
                        operation: "partial_close".to_string(),
                        symbol: symbol.to_string(),
                        side: side.as_str().to_string(),
                        exchange_order_id: ack.id.clone(),
                    })
                    .await
                {
                    error!("failed to record inconsistent state: {}", record_err);
                }
                Err(RiskError::SplitState {
                    order_id: ack.id,
                    detail,
                })
            }
        }
    }

    /// Advance the trailing stop when a tier threshold is reached. Never
    /// moves the stop in the loss direction. Returns whether it moved.
    pub async fn update_trailing(&self, symbol: &str, side: PositionSide) -> Result<bool, RiskError> {
        let _guard = self.locks.acquire(symbol, side).await;

        let record = match self.store.positions.get(symbol, side).await? {
            Some(record) => record,
            None => return Ok(false),
        };
        let position = record.to_domain()?;
        if position.reversal_warning {
            return Ok(false);
        }
        let Some(distance) = self.policy.distance_from_position(&position) else {
            return Ok(false);
        };

        let contract = self.exchange.contract_spec(symbol).await?;
        let ticker = self.exchange.get_ticker(symbol, true).await?;
        let mark = ticker.mark_or_last();
        let pnl_r = self
            .policy
            .r_multiple(position.entry_price, mark, side, distance);

        let Some(proposed) = self
            .policy
            .trailing_stop(position.entry_price, side, distance, pnl_r)
        else {
            return Ok(false);
        };
        let proposed = contract.round_price(proposed);
        if !StopPolicy::stop_improves(side, position.stop_loss, proposed) {
            return Ok(false);
        }

        let position_order_id = self
            .store
            .trades
            .last_open(symbol, side)
            .await?
            .map(|t| t.order_id)
            .unwrap_or_else(|| "unknown".to_string());
        let replacements = self
            .replace_venue_triggers(
                symbol,
                side,
                &contract,
                mark,
                proposed,
                position.take_profit,
                position.quantity,
                &position_order_id,
            )
            .await?;

        // re-point the mirrors: cancel the old rows, insert replacements
        self.store.triggers.cancel_for(symbol, side).await?;
        for replacement in &replacements {
            self.store.triggers.insert(replacement).await?;
        }
        self.store
            .positions
            .update_stop_loss(symbol, side, proposed)
            .await?;
        info!(
            "trailing stop advanced for {} {}: {} ({:.1}R)",
            symbol, side, proposed, pnl_r
        );
        Ok(true)
    }

    /// Cancel the venue triggers for a symbol and re-place the protective
    /// pair for the remaining size. Returns the mirror rows for the caller
    /// to persist.
    #[allow(clippy::too_many_arguments)]
    async fn replace_venue_triggers(
        &self,
        symbol: &str,
        side: PositionSide,
        contract: &ContractSpec,
        mark: f64,
        stop_price: f64,
        take_profit: Option<f64>,
        quantity: f64,
        position_order_id: &str,
    ) -> Result<Vec<NewPriceOrder>, RiskError> {
        self.exchange.cancel_trigger_orders(Some(symbol)).await?;

        let stop_rule = StopPolicy::stop_rule(side);
        let validated_stop =
            contract.round_price(self.policy.validate_trigger(stop_price, mark, stop_rule));
        let stop_request = TriggerRequest {
            symbol: symbol.to_string(),
            trigger_price: validated_stop,
            close_size: quantity,
            rule: stop_rule,
            position_side: side,
        };
        let stop_id = with_retry("replace_stop_trigger", || {
            self.exchange.place_trigger_order(&stop_request)
        })
        .await?;

        let mut rows = vec![NewPriceOrder {
            order_id: stop_id,
            symbol: symbol.to_string(),
            side: side.as_str().to_string(),
            order_type: "stop_loss".to_string(),
            trigger_price: validated_stop,
            order_price: None,
            quantity,
            position_order_id: position_order_id.to_string(),
        }];

        if let Some(tp) = take_profit {
            let tp_rule = StopPolicy::take_profit_rule(side);
            let validated_tp =
                contract.round_price(self.policy.validate_trigger(tp, mark, tp_rule));
            let tp_request = TriggerRequest {
                symbol: symbol.to_string(),
                trigger_price: validated_tp,
                close_size: quantity,
                rule: tp_rule,
                position_side: side,
            };
            let tp_id = with_retry("replace_tp_trigger", || {
                self.exchange.place_trigger_order(&tp_request)
            })
            .await?;
            rows.push(NewPriceOrder {
                order_id: tp_id,
                symbol: symbol.to_string(),
                side: side.as_str().to_string(),
                order_type: "extreme_take_profit".to_string(),
                trigger_price: validated_tp,
                order_price: None,
                quantity,
                position_order_id: position_order_id.to_string(),
            });
        }

        Ok(rows)
    }

    /// Per-tick lifecycle pass over all open positions: emergency closes,
    /// peak-drawdown protection, the holding-time cap, partial staging, and
    /// trailing stops (only when no partial ran and no warning is active).
    pub async fn manage_tick(&self) -> Result<(), RiskError> {
        let records = self.store.positions.all().await?;
        for record in records {
            let position = match record.to_domain() {
                Ok(position) => position,
                Err(e) => {
                    error!("skipping corrupt position row: {}", e);
                    continue;
                }
            };
            let symbol = position.symbol.clone();
            let side = position.side;

            let mark = match self.exchange.get_ticker(&symbol, true).await {
                Ok(ticker) => ticker.mark_or_last(),
                Err(e) => {
                    warn!("no price for {} this tick: {}", symbol, e);
                    continue;
                }
            };
            let pnl_percent = position.pnl_percent(mark);
            self.store
                .positions
                .update_peak(&symbol, side, pnl_percent)
                .await?;
            let peak = position.peak_pnl_percent.max(pnl_percent);

            if position.warning_score >= self.policy.emergency_score {
                self.enqueue_close(&symbol, side, CloseReason::TrendReversal).await;
                continue;
            }
            if self.policy.peak_drawdown_exceeded(peak, pnl_percent) {
                self.enqueue_close(&symbol, side, CloseReason::PeakDrawdown).await;
                continue;
            }
            if position.holding_hours(Utc::now()) >= self.policy.max_holding_hours {
                self.enqueue_close(&symbol, side, CloseReason::TimeLimit).await;
                continue;
            }

            let partial_ran = match self.execute_partial(&symbol, side).await {
                Ok(ran) => ran,
                Err(e) => {
                    error!("partial take-profit failed for {} {}: {}", symbol, side, e);
                    continue;
                }
            };

            if !partial_ran && !position.reversal_warning {
                if let Err(e) = self.update_trailing(&symbol, side).await {
                    error!("trailing update failed for {} {}: {}", symbol, side, e);
                }
            }
        }
        Ok(())
    }

    async fn enqueue_close(&self, symbol: &str, side: PositionSide, reason: CloseReason) {
        let request = CloseRequest {
            symbol: symbol.to_string(),
            side,
            reason,
        };
        if let Err(e) = self.close_tx.send(request).await {
            error!("close queue unavailable for {} {}: {}", symbol, side, e);
        }
    }

    /// Poll server-side trigger state: when the venue closed a position out
    /// from under us (stop or extreme TP fired), synthesize the local close.
    pub async fn poll_triggers_once(&self) -> Result<(), RiskError> {
        let active = self.store.triggers.all_active().await?;
        if active.is_empty() {
            return Ok(());
        }
        let exchange_positions = self.exchange.get_positions().await?;

        let mut pairs: Vec<(String, PositionSide)> = active
            .iter()
            .filter_map(|t| t.side.parse().ok().map(|side| (t.symbol.clone(), side)))
            .collect();
        pairs.sort();
        pairs.dedup();

        for (symbol, side) in pairs {
            let still_on_exchange = exchange_positions
                .iter()
                .any(|p| p.symbol == symbol && p.side == side && p.size > 0.0);
            if still_on_exchange {
                continue;
            }
            let Some(record) = self.store.positions.get(&symbol, side).await? else {
                continue;
            };
            let position = record.to_domain()?;

            let _guard = self.locks.acquire(&symbol, side).await;

            let contract = self.exchange.contract_spec(&symbol).await?;
            let mark = self
                .exchange
                .get_ticker(&symbol, true)
                .await
                .map(|t| t.mark_or_last())
                .unwrap_or(position.entry_price);

            // identify which trigger fired by which side of entry the mark
            // ended on
            let triggers = self.store.triggers.active_for(&symbol, side).await?;
            let fired = triggers
                .iter()
                .find(|t| match side {
                    PositionSide::Long => {
                        (t.order_type == "stop_loss" && mark <= t.trigger_price)
                            || (t.order_type != "stop_loss" && mark >= t.trigger_price)
                    }
                    PositionSide::Short => {
                        (t.order_type == "stop_loss" && mark >= t.trigger_price)
                            || (t.order_type != "stop_loss" && mark <= t.trigger_price)
                    }
                })
                .cloned();

            let (reason, trigger_type, close_price, trigger_order_id) = match &fired {
                Some(t) if t.order_type == "stop_loss" => (
                    CloseReason::StopLoss,
                    t.order_type.clone(),
                    t.trigger_price,
                    t.order_id.clone(),
                ),
                Some(t) => (
                    CloseReason::TakeProfitTriggered,
                    t.order_type.clone(),
                    t.trigger_price,
                    t.order_id.clone(),
                ),
                None => (
                    CloseReason::StopLoss,
                    "stop_loss".to_string(),
                    mark,
                    "unknown".to_string(),
                ),
            };
            if let Some(t) = &fired {
                self.store.triggers.mark_triggered(t.id).await?;
            }

            let pnl = self.exchange.calculate_pnl(
                position.entry_price,
                close_price,
                position.quantity,
                side,
                &contract,
            );
            let fee = self
                .lookup_fee(
                    &symbol,
                    &trigger_order_id,
                    contract.notional(position.quantity, close_price),
                )
                .await;

            let close_trade = NewTrade {
                order_id: trigger_order_id.clone(),
                symbol: symbol.clone(),
                side: side.as_str().to_string(),
                trade_type: "close".to_string(),
                price: close_price,
                quantity: position.quantity,
                leverage: position.leverage,
                pnl: Some(pnl),
                fee,
                close_reason: Some(reason.as_str().to_string()),
                timestamp: Utc::now(),
            };
            let event = NewCloseEvent {
                symbol: symbol.clone(),
                side: side.as_str().to_string(),
                entry_price: position.entry_price,
                close_price,
                quantity: position.quantity,
                leverage: position.leverage,
                pnl,
                pnl_percent: position.pnl_percent(close_price),
                fee,
                close_reason: reason.as_str().to_string(),
                trigger_type: Some(trigger_type),
                order_id: trigger_order_id,
            };
            self.store
                .close_position_txn(&symbol, side, &close_trade, &event)
                .await?;
            info!(
                "server-side trigger fired for {} {} ({})",
                symbol,
                side,
                reason.as_str()
            );
        }
        Ok(())
    }

    /// Rank open candidates across the configured symbols by trend
    /// strength. The best side per symbol wins; the list is capped.
    pub async fn rank_opportunities(&self, cap: usize) -> Vec<Opportunity> {
        let mut opportunities = Vec::new();
        for symbol in &self.symbols {
            match self.exchange.get_candles(symbol, Interval::M15, 100).await {
                Ok(candles) => {
                    let strength = reversal::trend_strength(&candles);
                    let (side, score) = if strength >= 0.0 {
                        (PositionSide::Long, strength)
                    } else {
                        (PositionSide::Short, -strength)
                    };
                    opportunities.push(Opportunity {
                        symbol: symbol.clone(),
                        side,
                        score,
                    });
                }
                Err(e) => warn!("no candles for {} while ranking: {}", symbol, e),
            }
        }
        opportunities.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        opportunities.truncate(cap);
        opportunities
    }

    /// Real fee from the matching fill when one exists, else
    /// `notional * taker_rate`. Results are cached per order id.
    async fn lookup_fee(&self, symbol: &str, order_id: &str, notional: f64) -> f64 {
        if let Some(fee) = self
            .cache
            .get_fresh::<f64>(CacheCategory::FeeByOrder, order_id)
        {
            return fee;
        }
        let fallback = notional * self.exchange.fee_schedule().taker_rate;
        match self.exchange.get_my_trades(Some(symbol), 50, None).await {
            Ok(fills) => {
                let matched: Vec<&crate::domain::repositories::exchange_client::Fill> =
                    fills.iter().filter(|f| f.order_id == order_id).collect();
                let fee = if matched.is_empty() {
                    fallback
                } else {
                    matched.iter().map(|f| f.fee).sum()
                };
                self.cache.put(CacheCategory::FeeByOrder, order_id, &fee);
                fee
            }
            Err(_) => fallback,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_reason_strings() {
        assert_eq!(CloseReason::TrendReversal.as_str(), "trend_reversal");
        assert_eq!(CloseReason::PeakDrawdown.as_str(), "peak_drawdown");
        assert_eq!(CloseReason::PartialClose.as_str(), "partial_close");
        assert_eq!(
            CloseReason::TakeProfitTriggered.as_str(),
            "take_profit_triggered"
        );
        assert_eq!(CloseReason::SystemRecovered.as_str(), "system_recovered");
    }

    #[tokio::test]
    async fn test_position_locks_serialize_same_pair() {
        let locks = PositionLocks::new();
        let guard = locks.acquire("BTC", PositionSide::Long).await;

        // a different pair is independent
        let _other = locks.acquire("BTC", PositionSide::Short).await;

        // the same pair blocks until released
        let locks_ref = &locks;
        let blocked = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            locks_ref.acquire("BTC", PositionSide::Long),
        )
        .await;
        assert!(blocked.is_err());

        drop(guard);
        let reacquired = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            locks_ref.acquire("BTC", PositionSide::Long),
        )
        .await;
        assert!(reacquired.is_ok());
    }
}
