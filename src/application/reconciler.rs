//! Reconciler
//!
//! Periodic sweeper that repairs divergence between exchange ground truth
//! and the local store. Unresolved inconsistency rows are re-checked
//! oldest-first; when the exchange shows no position and a matching fill
//! exists, the missing close records are synthesized in one transaction
//! with `close_reason = 'system_recovered'`. The sweep also closes local
//! positions the exchange no longer has (the exchange wins), cancels
//! orphan triggers, and reports position mismatches to the health
//! aggregator.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::application::notifier::{AlertLevel, Notifier};
use crate::application::risk_manager::CloseReason;
use crate::domain::entities::position::{Position, PositionSide};
use crate::domain::repositories::exchange_client::{ExchangeClient, Fill};
use crate::application::supervisor::{supervise, LoopPolicy};
use crate::persistence::models::{InconsistentStateRecord, NewCloseEvent, NewTrade};
use crate::persistence::repository::Store;

/// Per-row failure count that triggers a WARNING alert.
const ROW_FAILURE_ALERT_THRESHOLD: i64 = 5;
/// Consecutive failures across rows that trigger a CRITICAL alert.
const RUN_FAILURE_CRITICAL_THRESHOLD: u32 = 10;

#[derive(Debug, Clone)]
pub struct ReconcileOutcome {
    pub completed_at: DateTime<Utc>,
    pub success: bool,
    pub resolved: u64,
    pub unresolved: u64,
    pub orphans_cancelled: u64,
    pub only_in_exchange: Vec<String>,
    pub only_in_db: Vec<String>,
}

pub struct Reconciler {
    exchange: Arc<dyn ExchangeClient>,
    store: Arc<Store>,
    notifier: Arc<Notifier>,
    interval: Duration,
    last_outcome: RwLock<Option<ReconcileOutcome>>,
    consecutive_row_failures: AtomicU32,
}

impl Reconciler {
    pub fn new(
        exchange: Arc<dyn ExchangeClient>,
        store: Arc<Store>,
        notifier: Arc<Notifier>,
        interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Reconciler {
            exchange,
            store,
            notifier,
            interval,
            last_outcome: RwLock::new(None),
            consecutive_row_failures: AtomicU32::new(0),
        })
    }

    pub async fn last_outcome(&self) -> Option<ReconcileOutcome> {
        self.last_outcome.read().await.clone()
    }

    /// One full reconcile pass. Re-running on an already-consistent store
    /// is a no-op.
    pub async fn run_once(&self) -> ReconcileOutcome {
        let mut outcome = ReconcileOutcome {
            completed_at: Utc::now(),
            success: true,
            resolved: 0,
            unresolved: 0,
            orphans_cancelled: 0,
            only_in_exchange: Vec::new(),
            only_in_db: Vec::new(),
        };

        let exchange_positions = match self.exchange.get_positions().await {
            Ok(positions) => positions,
            Err(e) => {
                warn!("reconcile skipped, cannot read exchange positions: {}", e);
                outcome.success = false;
                *self.last_outcome.write().await = Some(outcome.clone());
                return outcome;
            }
        };

        // 1. unresolved inconsistency rows, oldest first
        match self.store.inconsistencies.unresolved().await {
            Ok(rows) => {
                for row in rows {
                    match self.resolve_row(&row, &exchange_positions).await {
                        Ok(true) => {
                            outcome.resolved += 1;
                            self.consecutive_row_failures.store(0, Ordering::SeqCst);
                        }
                        Ok(false) => {
                            outcome.unresolved += 1;
                            self.note_row_failure(&row).await;
                        }
                        Err(e) => {
                            error!("reconcile of state {} failed: {}", row.id, e);
                            outcome.unresolved += 1;
                            outcome.success = false;
                            self.note_row_failure(&row).await;
                        }
                    }
                }
            }
            Err(e) => {
                error!("cannot list inconsistent states: {}", e);
                outcome.success = false;
            }
        }

        // 2. local positions the exchange no longer has: exchange wins
        match self.store.positions.all().await {
            Ok(records) => {
                for record in records {
                    let Ok(position) = record.to_domain() else {
                        continue;
                    };
                    let on_exchange = exchange_positions.iter().any(|p| {
                        p.symbol == position.symbol && p.side == position.side && p.size > 0.0
                    });
                    if on_exchange {
                        continue;
                    }
                    outcome
                        .only_in_db
                        .push(format!("{}:{}", position.symbol, position.side));
                    match self.synthesize_close(None, &position).await {
                        Ok(true) => outcome.resolved += 1,
                        Ok(false) => outcome.unresolved += 1,
                        Err(e) => {
                            error!(
                                "synthesized close failed for {} {}: {}",
                                position.symbol, position.side, e
                            );
                            outcome.success = false;
                        }
                    }
                }
            }
            Err(e) => {
                error!("cannot list local positions: {}", e);
                outcome.success = false;
            }
        }

        // 3. exchange positions with no local mirror: report only
        match self.store.positions.all().await {
            Ok(records) => {
                for exchange_position in &exchange_positions {
                    let mirrored = records.iter().any(|r| {
                        r.symbol == exchange_position.symbol
                            && r.side == exchange_position.side.as_str()
                    });
                    if !mirrored {
                        outcome.only_in_exchange.push(format!(
                            "{}:{}",
                            exchange_position.symbol, exchange_position.side
                        ));
                    }
                }
            }
            Err(e) => error!("cannot re-list local positions: {}", e),
        }

        // 4. orphan triggers: active mirrors with no local and no exchange
        // position
        match self.sweep_orphan_triggers(&exchange_positions).await {
            Ok(cancelled) => outcome.orphans_cancelled = cancelled,
            Err(e) => {
                error!("orphan trigger sweep failed: {}", e);
                outcome.success = false;
            }
        }

        if outcome.resolved > 0 || outcome.orphans_cancelled > 0 {
            info!(
                "reconcile pass: {} resolved, {} unresolved, {} orphan triggers cancelled",
                outcome.resolved, outcome.unresolved, outcome.orphans_cancelled
            );
        }
        if !outcome.only_in_exchange.is_empty() {
            warn!(
                "positions on exchange with no local mirror: {:?}",
                outcome.only_in_exchange
            );
        }

        outcome.completed_at = Utc::now();
        *self.last_outcome.write().await = Some(outcome.clone());
        outcome
    }

    async fn note_row_failure(&self, row: &InconsistentStateRecord) {
        match self.store.inconsistencies.bump_failure(row.id).await {
            Ok(count) if count == ROW_FAILURE_ALERT_THRESHOLD => {
                self.notifier
                    .notify(
                        AlertLevel::Warning,
                        &format!("inconsistent state {} stuck", row.id),
                        &format!(
                            "{} {} {} unresolved after {} attempts",
                            row.operation, row.symbol, row.side, count
                        ),
                    )
                    .await;
            }
            Ok(_) => {}
            Err(e) => error!("cannot bump failure count for {}: {}", row.id, e),
        }

        let consecutive = self.consecutive_row_failures.fetch_add(1, Ordering::SeqCst) + 1;
        if consecutive == RUN_FAILURE_CRITICAL_THRESHOLD {
            self.notifier
                .notify(
                    AlertLevel::Critical,
                    "reconciler failing repeatedly",
                    &format!("{} consecutive unresolved rows", consecutive),
                )
                .await;
        }
    }

    /// Attempt to resolve one inconsistency row. Returns Ok(true) when the
    /// row was repaired and marked resolved.
    async fn resolve_row(
        &self,
        row: &InconsistentStateRecord,
        exchange_positions: &[crate::domain::repositories::exchange_client::ExchangePosition],
    ) -> Result<bool, String> {
        let side: PositionSide = row
            .side
            .parse()
            .map_err(|_| format!("corrupt side on state {}", row.id))?;

        let still_open = exchange_positions
            .iter()
            .any(|p| p.symbol == row.symbol && p.side == side && p.size > 0.0);
        if still_open {
            // the exchange still holds the position: nothing to synthesize
            return Ok(false);
        }

        let position = match self.store.positions.get(&row.symbol, side).await {
            Ok(Some(record)) => record.to_domain().map_err(|e| e.to_string())?,
            Ok(None) => {
                // no local position either; the row described a mutation we
                // can no longer act on. Find the fill to confirm, then close
                // the book on it via the trade log only.
                return self
                    .resolve_without_position(row, side)
                    .await
                    .map_err(|e| e.to_string());
            }
            Err(e) => return Err(e.to_string()),
        };

        self.synthesize_close(Some(row), &position)
            .await
            .map_err(|e| e.to_string())
    }

    async fn matching_fill(
        &self,
        symbol: &str,
        since: DateTime<Utc>,
        exchange_order_id: &str,
    ) -> Option<Fill> {
        let start = since - ChronoDuration::minutes(10);
        match self
            .exchange
            .get_my_trades(Some(symbol), 200, Some(start))
            .await
        {
            Ok(fills) => fills.into_iter().find(|f| f.order_id == exchange_order_id),
            Err(e) => {
                warn!("cannot fetch fills for {}: {}", symbol, e);
                None
            }
        }
    }

    /// Synthesize the close records for a local position the exchange no
    /// longer holds. Uses the actual fill when one matches, else the last
    /// ticker price and the configured taker rate.
    async fn synthesize_close(
        &self,
        row: Option<&InconsistentStateRecord>,
        position: &Position,
    ) -> Result<bool, String> {
        let contract = self
            .exchange
            .contract_spec(&position.symbol)
            .await
            .map_err(|e| e.to_string())?;

        let fill = match row {
            Some(row) => {
                self.matching_fill(&position.symbol, row.created_at, &row.exchange_order_id)
                    .await
            }
            None => None,
        };
        if row.is_some() && fill.is_none() {
            // spec of the repair path: only synthesize off a confirmed fill
            // when an explicit inconsistency names the order
            return Ok(false);
        }

        let open_trade = self
            .store
            .trades
            .last_open(&position.symbol, position.side)
            .await
            .map_err(|e| e.to_string())?;
        let entry_price = open_trade
            .as_ref()
            .map(|t| t.price)
            .unwrap_or(position.entry_price);

        let (close_price, fee, order_id) = match &fill {
            Some(fill) => (fill.price, fill.fee, fill.order_id.clone()),
            None => {
                let price = self
                    .exchange
                    .get_ticker(&position.symbol, false)
                    .await
                    .map(|t| t.last)
                    .unwrap_or(position.entry_price);
                let fee = contract.notional(position.quantity, price)
                    * self.exchange.fee_schedule().taker_rate;
                (price, fee, "reconciled".to_string())
            }
        };

        let pnl = self.exchange.calculate_pnl(
            entry_price,
            close_price,
            position.quantity,
            position.side,
            &contract,
        );
        let pnl_percent = if entry_price > 0.0 {
            (close_price - entry_price) / entry_price
                * position.side.sign()
                * position.leverage
                * 100.0
        } else {
            0.0
        };

        let close_trade = NewTrade {
            order_id: order_id.clone(),
            symbol: position.symbol.clone(),
            side: position.side.as_str().to_string(),
            trade_type: "close".to_string(),
            price: close_price,
            quantity: position.quantity,
            leverage: position.leverage,
            pnl: Some(pnl),
            fee,
            close_reason: Some(CloseReason::SystemRecovered.as_str().to_string()),
            timestamp: Utc::now(),
        };
        let event = NewCloseEvent {
            symbol: position.symbol.clone(),
            side: position.side.as_str().to_string(),
            entry_price,
            close_price,
            quantity: position.quantity,
            leverage: position.leverage,
            pnl,
            pnl_percent,
            fee,
            close_reason: CloseReason::SystemRecovered.as_str().to_string(),
            trigger_type: None,
            order_id,
        };

        self.store
            .reconcile_close_txn(
                row.map(|r| r.id),
                &position.symbol,
                position.side,
                &close_trade,
                &event,
            )
            .await
            .map_err(|e| e.to_string())?;
        info!(
            "reconciler synthesized close for {} {} at {} (pnl {:.4})",
            position.symbol, position.side, close_price, pnl
        );
        Ok(true)
    }

    /// An inconsistency without a local position row: if the venue confirms
    /// the order filled, the books are already consistent modulo the
    /// resolved flag.
    async fn resolve_without_position(
        &self,
        row: &InconsistentStateRecord,
        _side: PositionSide,
    ) -> Result<bool, String> {
        let fill = self
            .matching_fill(&row.symbol, row.created_at, &row.exchange_order_id)
            .await;
        if fill.is_none() {
            return Ok(false);
        }
        sqlx::query(
            "UPDATE inconsistent_states SET resolved = 1, resolved_at = ?1, resolved_by = 'auto' \
             WHERE id = ?2",
        )
        .bind(Utc::now())
        .bind(row.id)
        .execute(self.store.pool())
        .await
        .map_err(|e| e.to_string())?;
        info!(
            "inconsistent state {} resolved without synthesis (fill confirmed)",
            row.id
        );
        Ok(true)
    }

    /// Cancel active trigger mirrors whose (symbol, side) has neither a
    /// local position nor an exchange position.
    async fn sweep_orphan_triggers(
        &self,
        exchange_positions: &[crate::domain::repositories::exchange_client::ExchangePosition],
    ) -> Result<u64, String> {
        let active = self
            .store
            .triggers
            .all_active()
            .await
            .map_err(|e| e.to_string())?;
        let mut cancelled = 0u64;
        let mut seen: Vec<(String, PositionSide)> = Vec::new();

        for trigger in active {
            let Ok(side) = trigger.side.parse::<PositionSide>() else {
                continue;
            };
            let key = (trigger.symbol.clone(), side);
            if seen.contains(&key) {
                continue;
            }
            seen.push(key);

            let has_local = self
                .store
                .positions
                .get(&trigger.symbol, side)
                .await
                .map_err(|e| e.to_string())?
                .is_some();
            let has_exchange = exchange_positions
                .iter()
                .any(|p| p.symbol == trigger.symbol && p.side == side && p.size > 0.0);
            if has_local || has_exchange {
                continue;
            }

            if let Err(e) = self
                .exchange
                .cancel_trigger_orders(Some(&trigger.symbol))
                .await
            {
                warn!("cancelling orphan triggers for {}: {}", trigger.symbol, e);
            }
            cancelled += self
                .store
                .triggers
                .cancel_for(&trigger.symbol, side)
                .await
                .map_err(|e| e.to_string())?;
        }
        Ok(cancelled)
    }

    pub async fn run(self: Arc<Self>) {
        let policy = LoopPolicy::every(self.interval);
        let notifier = Arc::clone(&self.notifier);
        let reconciler = Arc::clone(&self);
        supervise("reconciler", policy, notifier, move || {
            let reconciler = Arc::clone(&reconciler);
            async move {
                let outcome = reconciler.run_once().await;
                if outcome.success {
                    Ok(())
                } else {
                    Err("reconcile pass reported errors".to_string())
                }
            }
        })
        .await;
    }
}
