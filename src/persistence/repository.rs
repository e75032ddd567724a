//! Database Repository
//!
//! Data access layer for the trading store. Single-row operations live on
//! per-table repositories; the multi-table lifecycle writes (open, close,
//! partial close, reconciled close) are transactions on `Store`.

use chrono::Utc;
use serde::Serialize;
use sqlx::{Executor, Sqlite};
use std::sync::Arc;
use tracing::{debug, error};

use super::models::*;
use super::{DatabaseError, DbPool};
use crate::domain::entities::position::{Position, PositionSide};

fn query_error(context: &str, e: sqlx::Error) -> DatabaseError {
    error!("{}: {}", context, e);
    DatabaseError::QueryError(format!("{}: {}", context, e))
}

impl PositionRecord {
    pub fn to_domain(&self) -> Result<Position, DatabaseError> {
        let side: PositionSide = self
            .side
            .parse()
            .map_err(|_| DatabaseError::QueryError(format!("corrupt side: {}", self.side)))?;
        Ok(Position {
            symbol: self.symbol.clone(),
            side,
            quantity: self.quantity,
            leverage: self.leverage,
            entry_price: self.entry_price,
            opened_at: self.opened_at,
            stop_loss: self.stop_loss,
            take_profit: self.take_profit,
            partial_close_fraction: self.partial_close_fraction,
            warning_score: self.warning_score,
            reversal_warning: self.reversal_warning,
            peak_pnl_percent: self.peak_pnl_percent,
        })
    }
}

async fn insert_trade<'e, E>(executor: E, trade: &NewTrade) -> Result<(), sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO trades (order_id, symbol, side, type, price, quantity,
                            leverage, pnl, fee, close_reason, timestamp, status)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, 'filled')
        "#,
    )
    .bind(&trade.order_id)
    .bind(&trade.symbol)
    .bind(&trade.side)
    .bind(&trade.trade_type)
    .bind(trade.price)
    .bind(trade.quantity)
    .bind(trade.leverage)
    .bind(trade.pnl)
    .bind(trade.fee)
    .bind(&trade.close_reason)
    .bind(trade.timestamp)
    .execute(executor)
    .await?;
    Ok(())
}

async fn insert_price_order<'e, E>(executor: E, order: &NewPriceOrder) -> Result<(), sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO price_orders (order_id, symbol, side, type, trigger_price,
                                  order_price, quantity, status, position_order_id,
                                  created_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'active', ?8, ?9, ?9)
        "#,
    )
    .bind(&order.order_id)
    .bind(&order.symbol)
    .bind(&order.side)
    .bind(&order.order_type)
    .bind(order.trigger_price)
    .bind(order.order_price)
    .bind(order.quantity)
    .bind(&order.position_order_id)
    .bind(Utc::now())
    .execute(executor)
    .await?;
    Ok(())
}

async fn cancel_triggers<'e, E>(executor: E, symbol: &str, side: &str) -> Result<u64, sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query(
        r#"
        UPDATE price_orders SET status = 'cancelled', updated_at = ?1
        WHERE symbol = ?2 AND side = ?3 AND status = 'active'
        "#,
    )
    .bind(Utc::now())
    .bind(symbol)
    .bind(side)
    .execute(executor)
    .await?;
    Ok(result.rows_affected())
}

async fn insert_close_event<'e, E>(executor: E, event: &NewCloseEvent) -> Result<(), sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO position_close_events (symbol, side, entry_price, close_price,
                                           quantity, leverage, pnl, pnl_percent, fee,
                                           close_reason, trigger_type, order_id,
                                           created_at, processed)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, 0)
        "#,
    )
    .bind(&event.symbol)
    .bind(&event.side)
    .bind(event.entry_price)
    .bind(event.close_price)
    .bind(event.quantity)
    .bind(event.leverage)
    .bind(event.pnl)
    .bind(event.pnl_percent)
    .bind(event.fee)
    .bind(&event.close_reason)
    .bind(&event.trigger_type)
    .bind(&event.order_id)
    .bind(Utc::now())
    .execute(executor)
    .await?;
    Ok(())
}

async fn delete_position<'e, E>(executor: E, symbol: &str, side: &str) -> Result<u64, sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query("DELETE FROM positions WHERE symbol = ?1 AND side = ?2")
        .bind(symbol)
        .bind(side)
        .execute(executor)
        .await?;
    Ok(result.rows_affected())
}

pub struct PositionRepository {
    pool: DbPool,
}

impl PositionRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn upsert(&self, position: &Position) -> Result<(), DatabaseError> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO positions (symbol, side, quantity, leverage, entry_price,
                                   opened_at, stop_loss, take_profit,
                                   partial_close_fraction, warning_score,
                                   reversal_warning, peak_pnl_percent,
                                   created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?13)
            ON CONFLICT(symbol, side) DO UPDATE SET
                quantity = excluded.quantity,
                leverage = excluded.leverage,
                entry_price = excluded.entry_price,
                stop_loss = excluded.stop_loss,
                take_profit = excluded.take_profit,
                partial_close_fraction = excluded.partial_close_fraction,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&position.symbol)
        .bind(position.side.as_str())
        .bind(position.quantity)
        .bind(position.leverage)
        .bind(position.entry_price)
        .bind(position.opened_at)
        .bind(position.stop_loss)
        .bind(position.take_profit)
        .bind(position.partial_close_fraction)
        .bind(position.warning_score)
        .bind(position.reversal_warning)
        .bind(position.peak_pnl_percent)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| query_error("Failed to upsert position", e))?;

        debug!("Upserted position {} {}", position.symbol, position.side);
        Ok(())
    }

    pub async fn get(
        &self,
        symbol: &str,
        side: PositionSide,
    ) -> Result<Option<PositionRecord>, DatabaseError> {
        sqlx::query_as::<_, PositionRecord>(
            "SELECT * FROM positions WHERE symbol = ?1 AND side = ?2",
        )
        .bind(symbol)
        .bind(side.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| query_error("Failed to get position", e))
    }

    pub async fn all(&self) -> Result<Vec<PositionRecord>, DatabaseError> {
        sqlx::query_as::<_, PositionRecord>("SELECT * FROM positions ORDER BY opened_at ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| query_error("Failed to list positions", e))
    }

    pub async fn count(&self) -> Result<i64, DatabaseError> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM positions")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| query_error("Failed to count positions", e))?;
        Ok(row.0)
    }

    pub async fn update_warning(
        &self,
        symbol: &str,
        side: PositionSide,
        warning_score: f64,
        reversal_warning: bool,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            r#"
            UPDATE positions SET warning_score = ?1, reversal_warning = ?2, updated_at = ?3
            WHERE symbol = ?4 AND side = ?5
            "#,
        )
        .bind(warning_score)
        .bind(reversal_warning)
        .bind(Utc::now())
        .bind(symbol)
        .bind(side.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| query_error("Failed to update warning metadata", e))?;
        Ok(())
    }

    pub async fn update_peak(
        &self,
        symbol: &str,
        side: PositionSide,
        peak_pnl_percent: f64,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            r#"
            UPDATE positions SET peak_pnl_percent = ?1, updated_at = ?2
            WHERE symbol = ?3 AND side = ?4 AND peak_pnl_percent < ?1
            "#,
        )
        .bind(peak_pnl_percent)
        .bind(Utc::now())
        .bind(symbol)
        .bind(side.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| query_error("Failed to update peak pnl", e))?;
        Ok(())
    }

    pub async fn update_stop_loss(
        &self,
        symbol: &str,
        side: PositionSide,
        stop_loss: f64,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            r#"
            UPDATE positions SET stop_loss = ?1, updated_at = ?2
            WHERE symbol = ?3 AND side = ?4
            "#,
        )
        .bind(stop_loss)
        .bind(Utc::now())
        .bind(symbol)
        .bind(side.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| query_error("Failed to update stop loss", e))?;
        Ok(())
    }
}

pub struct TradeRepository {
    pool: DbPool,
}

impl TradeRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, trade: &NewTrade) -> Result<(), DatabaseError> {
        insert_trade(&self.pool, trade)
            .await
            .map_err(|e| query_error("Failed to insert trade", e))
    }

    pub async fn recent(
        &self,
        limit: i64,
        symbol: Option<&str>,
    ) -> Result<Vec<TradeRecord>, DatabaseError> {
        let records = match symbol {
            Some(symbol) => {
                sqlx::query_as::<_, TradeRecord>(
                    "SELECT * FROM trades WHERE symbol = ?1 ORDER BY timestamp DESC LIMIT ?2",
                )
                .bind(symbol)
                .bind(limit)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query_as::<_, TradeRecord>(
                    "SELECT * FROM trades ORDER BY timestamp DESC LIMIT ?1",
                )
                .bind(limit)
                .fetch_all(&self.pool)
                .await
            }
        };
        records.map_err(|e| query_error("Failed to get recent trades", e))
    }

    /// Most recent open trade for a (symbol, side), used when synthesizing
    /// closes.
    pub async fn last_open(
        &self,
        symbol: &str,
        side: PositionSide,
    ) -> Result<Option<TradeRecord>, DatabaseError> {
        sqlx::query_as::<_, TradeRecord>(
            r#"
            SELECT * FROM trades
            WHERE symbol = ?1 AND side = ?2 AND type = 'open'
            ORDER BY timestamp DESC LIMIT 1
            "#,
        )
        .bind(symbol)
        .bind(side.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| query_error("Failed to get last open trade", e))
    }

    /// Open/close pairs, newest close first.
    pub async fn completed(&self, limit: i64) -> Result<Vec<CompletedTradeRecord>, DatabaseError> {
        sqlx::query_as::<_, CompletedTradeRecord>(
            r#"
            SELECT c.symbol, c.side,
                   o.price AS open_price, c.price AS close_price,
                   c.quantity, c.leverage, c.pnl,
                   (c.fee + o.fee) AS total_fee, c.close_reason,
                   o.timestamp AS opened_at, c.timestamp AS closed_at,
                   (julianday(c.timestamp) - julianday(o.timestamp)) * 24.0 AS holding_hours
            FROM trades c
            JOIN trades o ON o.id = (
                SELECT o2.id FROM trades o2
                WHERE o2.symbol = c.symbol AND o2.side = c.side
                  AND o2.type = 'open' AND o2.timestamp <= c.timestamp
                ORDER BY o2.timestamp DESC LIMIT 1
            )
            WHERE c.type = 'close'
            ORDER BY c.timestamp DESC
            LIMIT ?1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| query_error("Failed to get completed trades", e))
    }
}

pub struct TriggerRepository {
    pool: DbPool,
}

impl TriggerRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, order: &NewPriceOrder) -> Result<(), DatabaseError> {
        insert_price_order(&self.pool, order)
            .await
            .map_err(|e| query_error("Failed to insert price order", e))
    }

    pub async fn all_active(&self) -> Result<Vec<PriceOrderRecord>, DatabaseError> {
        sqlx::query_as::<_, PriceOrderRecord>(
            "SELECT * FROM price_orders WHERE status = 'active' ORDER BY created_at ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| query_error("Failed to list active price orders", e))
    }

    pub async fn active_for(
        &self,
        symbol: &str,
        side: PositionSide,
    ) -> Result<Vec<PriceOrderRecord>, DatabaseError> {
        sqlx::query_as::<_, PriceOrderRecord>(
            r#"
            SELECT * FROM price_orders
            WHERE symbol = ?1 AND side = ?2 AND status = 'active'
            ORDER BY created_at ASC
            "#,
        )
        .bind(symbol)
        .bind(side.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| query_error("Failed to list active price orders", e))
    }

    pub async fn cancel_for(
        &self,
        symbol: &str,
        side: PositionSide,
    ) -> Result<u64, DatabaseError> {
        cancel_triggers(&self.pool, symbol, side.as_str())
            .await
            .map_err(|e| query_error("Failed to cancel price orders", e))
    }

    pub async fn mark_triggered(&self, id: i64) -> Result<(), DatabaseError> {
        sqlx::query(
            "UPDATE price_orders SET status = 'triggered', updated_at = ?1 WHERE id = ?2",
        )
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| query_error("Failed to mark price order triggered", e))?;
        Ok(())
    }

    pub async fn count_active(&self) -> Result<i64, DatabaseError> {
        let row: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM price_orders WHERE status = 'active'")
                .fetch_one(&self.pool)
                .await
                .map_err(|e| query_error("Failed to count active price orders", e))?;
        Ok(row.0)
    }
}

pub struct CloseEventRepository {
    pool: DbPool,
}

/// Aggregate trading statistics derived from close events.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct TradeStats {
    pub total: i64,
    pub wins: i64,
    pub total_pnl: f64,
    pub max_win: f64,
    pub max_loss: f64,
}

impl CloseEventRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, event: &NewCloseEvent) -> Result<(), DatabaseError> {
        insert_close_event(&self.pool, event)
            .await
            .map_err(|e| query_error("Failed to insert close event", e))
    }

    pub async fn recent(&self, limit: i64) -> Result<Vec<CloseEventRecord>, DatabaseError> {
        sqlx::query_as::<_, CloseEventRecord>(
            "SELECT * FROM position_close_events ORDER BY created_at DESC LIMIT ?1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| query_error("Failed to get close events", e))
    }

    pub async fn unprocessed(&self) -> Result<Vec<CloseEventRecord>, DatabaseError> {
        sqlx::query_as::<_, CloseEventRecord>(
            "SELECT * FROM position_close_events WHERE processed = 0 ORDER BY created_at ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| query_error("Failed to get unprocessed close events", e))
    }

    pub async fn mark_processed(&self, id: i64) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE position_close_events SET processed = 1 WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| query_error("Failed to mark close event processed", e))?;
        Ok(())
    }

    pub async fn stats(&self) -> Result<TradeStats, DatabaseError> {
        sqlx::query_as::<_, TradeStats>(
            r#"
            SELECT COUNT(*) AS total,
                   COALESCE(SUM(CASE WHEN pnl > 0 THEN 1 ELSE 0 END), 0) AS wins,
                   COALESCE(SUM(pnl), 0.0) AS total_pnl,
                   COALESCE(MAX(pnl), 0.0) AS max_win,
                   COALESCE(MIN(pnl), 0.0) AS max_loss
            FROM position_close_events
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|e| query_error("Failed to compute trade stats", e))
    }
}

pub struct InconsistentStateRepository {
    pool: DbPool,
}

impl InconsistentStateRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Written in its own transaction, before the originating error is
    /// propagated, so the reconciler can always find the breadcrumb.
    pub async fn record(&self, state: &NewInconsistentState) -> Result<i64, DatabaseError> {
        let result = sqlx::query(
            r#"
            INSERT INTO inconsistent_states (operation, symbol, side, exchange_order_id,
                                             created_at, resolved, failure_count)
            VALUES (?1, ?2, ?3, ?4, ?5, 0, 0)
            "#,
        )
        .bind(&state.operation)
        .bind(&state.symbol)
        .bind(&state.side)
        .bind(&state.exchange_order_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| query_error("Failed to record inconsistent state", e))?;
        Ok(result.last_insert_rowid())
    }

    pub async fn unresolved(&self) -> Result<Vec<InconsistentStateRecord>, DatabaseError> {
        sqlx::query_as::<_, InconsistentStateRecord>(
            "SELECT * FROM inconsistent_states WHERE resolved = 0 ORDER BY created_at ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| query_error("Failed to list inconsistent states", e))
    }

    pub async fn count_unresolved(&self) -> Result<i64, DatabaseError> {
        let row: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM inconsistent_states WHERE resolved = 0")
                .fetch_one(&self.pool)
                .await
                .map_err(|e| query_error("Failed to count inconsistent states", e))?;
        Ok(row.0)
    }

    /// Increment a row's failure counter; returns the new count.
    pub async fn bump_failure(&self, id: i64) -> Result<i64, DatabaseError> {
        sqlx::query("UPDATE inconsistent_states SET failure_count = failure_count + 1 WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| query_error("Failed to bump failure count", e))?;
        let row: (i64,) =
            sqlx::query_as("SELECT failure_count FROM inconsistent_states WHERE id = ?1")
                .bind(id)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| query_error("Failed to read failure count", e))?;
        Ok(row.0)
    }
}

pub struct DecisionRepository {
    pool: DbPool,
}

impl DecisionRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn append(
        &self,
        iteration: i64,
        decision: &str,
        actions_taken: &str,
        account_value: f64,
        positions_count: i64,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            r#"
            INSERT INTO agent_decisions (timestamp, iteration, decision, actions_taken,
                                         account_value, positions_count)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(Utc::now())
        .bind(iteration)
        .bind(decision)
        .bind(actions_taken)
        .bind(account_value)
        .bind(positions_count)
        .execute(&self.pool)
        .await
        .map_err(|e| query_error("Failed to append decision", e))?;
        Ok(())
    }

    pub async fn recent(&self, limit: i64) -> Result<Vec<DecisionRecord>, DatabaseError> {
        sqlx::query_as::<_, DecisionRecord>(
            "SELECT * FROM agent_decisions ORDER BY timestamp DESC LIMIT ?1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| query_error("Failed to get decisions", e))
    }
}

pub struct HistoryRepository {
    pool: DbPool,
}

impl HistoryRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn append(
        &self,
        total_value: f64,
        unrealized_pnl: f64,
        return_percent: f64,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            r#"
            INSERT INTO account_history (timestamp, total_value, unrealized_pnl, return_percent)
            VALUES (?1, ?2, ?3, ?4)
            "#,
        )
        .bind(Utc::now())
        .bind(total_value)
        .bind(unrealized_pnl)
        .bind(return_percent)
        .execute(&self.pool)
        .await
        .map_err(|e| query_error("Failed to append account history", e))?;
        Ok(())
    }

    /// Oldest snapshot anchors the initial balance.
    pub async fn initial_balance(&self) -> Result<Option<f64>, DatabaseError> {
        let row: Option<(f64,)> = sqlx::query_as(
            "SELECT total_value FROM account_history ORDER BY timestamp ASC, id ASC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| query_error("Failed to read initial balance", e))?;
        Ok(row.map(|r| r.0))
    }

    /// Chronological oldest-first window of the most recent snapshots.
    pub async fn recent(&self, limit: i64) -> Result<Vec<AccountHistoryRecord>, DatabaseError> {
        let mut records = sqlx::query_as::<_, AccountHistoryRecord>(
            "SELECT * FROM account_history ORDER BY timestamp DESC, id DESC LIMIT ?1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| query_error("Failed to get account history", e))?;
        records.reverse();
        Ok(records)
    }
}

/// Aggregate store handed to the services. Each repository shares the same
/// pool; the lifecycle transactions below are the only writers that touch
/// multiple tables.
pub struct Store {
    pool: DbPool,
    pub positions: PositionRepository,
    pub trades: TradeRepository,
    pub triggers: TriggerRepository,
    pub close_events: CloseEventRepository,
    pub inconsistencies: InconsistentStateRepository,
    pub decisions: DecisionRepository,
    pub history: HistoryRepository,
}

impl Store {
    pub fn new(pool: DbPool) -> Arc<Self> {
        Arc::new(Store {
            positions: PositionRepository::new(pool.clone()),
            trades: TradeRepository::new(pool.clone()),
            triggers: TriggerRepository::new(pool.clone()),
            close_events: CloseEventRepository::new(pool.clone()),
            inconsistencies: InconsistentStateRepository::new(pool.clone()),
            decisions: DecisionRepository::new(pool.clone()),
            history: HistoryRepository::new(pool.clone()),
            pool,
        })
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    /// Persist a freshly opened position: the open trade, the position row,
    /// and both protective trigger mirrors, atomically.
    pub async fn open_position_txn(
        &self,
        position: &Position,
        open_trade: &NewTrade,
        triggers: &[NewPriceOrder],
    ) -> Result<(), DatabaseError> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();

        insert_trade(&mut *tx, open_trade)
            .await
            .map_err(|e| DatabaseError::TransactionError(format!("open trade: {}", e)))?;

        sqlx::query(
            r#"
            INSERT INTO positions (symbol, side, quantity, leverage, entry_price,
                                   opened_at, stop_loss, take_profit,
                                   partial_close_fraction, warning_score,
                                   reversal_warning, peak_pnl_percent,
                                   created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0.0, 0, 0.0, ?10, ?10)
            "#,
        )
        .bind(&position.symbol)
        .bind(position.side.as_str())
        .bind(position.quantity)
        .bind(position.leverage)
        .bind(position.entry_price)
        .bind(position.opened_at)
        .bind(position.stop_loss)
        .bind(position.take_profit)
        .bind(position.partial_close_fraction)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| DatabaseError::TransactionError(format!("position row: {}", e)))?;

        for trigger in triggers {
            insert_price_order(&mut *tx, trigger)
                .await
                .map_err(|e| DatabaseError::TransactionError(format!("price order: {}", e)))?;
        }

        tx.commit().await?;
        debug!(
            "Committed open for {} {} with {} triggers",
            position.symbol,
            position.side,
            triggers.len()
        );
        Ok(())
    }

    /// Close a position: cancel trigger mirrors, write the close trade and
    /// the close event, delete the position row, atomically.
    pub async fn close_position_txn(
        &self,
        symbol: &str,
        side: PositionSide,
        close_trade: &NewTrade,
        event: &NewCloseEvent,
    ) -> Result<(), DatabaseError> {
        let mut tx = self.pool.begin().await?;

        cancel_triggers(&mut *tx, symbol, side.as_str())
            .await
            .map_err(|e| DatabaseError::TransactionError(format!("cancel triggers: {}", e)))?;
        insert_trade(&mut *tx, close_trade)
            .await
            .map_err(|e| DatabaseError::TransactionError(format!("close trade: {}", e)))?;
        insert_close_event(&mut *tx, event)
            .await
            .map_err(|e| DatabaseError::TransactionError(format!("close event: {}", e)))?;
        let deleted = delete_position(&mut *tx, symbol, side.as_str())
            .await
            .map_err(|e| DatabaseError::TransactionError(format!("delete position: {}", e)))?;
        if deleted == 0 {
            return Err(DatabaseError::TransactionError(format!(
                "no position row for {} {}",
                symbol, side
            )));
        }

        tx.commit().await?;
        debug!("Committed close for {} {}", symbol, side);
        Ok(())
    }

    /// Persist one partial take-profit: shrink the position, advance its
    /// stored fraction and stop, replace the trigger mirrors, and record the
    /// close trade and event, atomically.
    #[allow(clippy::too_many_arguments)]
    pub async fn partial_close_txn(
        &self,
        symbol: &str,
        side: PositionSide,
        remaining_quantity: f64,
        partial_close_fraction: f64,
        new_stop: Option<f64>,
        replacement_triggers: &[NewPriceOrder],
        close_trade: &NewTrade,
        event: &NewCloseEvent,
    ) -> Result<(), DatabaseError> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE positions
            SET quantity = ?1, partial_close_fraction = ?2,
                stop_loss = COALESCE(?3, stop_loss), updated_at = ?4
            WHERE symbol = ?5 AND side = ?6
            "#,
        )
        .bind(remaining_quantity)
        .bind(partial_close_fraction)
        .bind(new_stop)
        .bind(Utc::now())
        .bind(symbol)
        .bind(side.as_str())
        .execute(&mut *tx)
        .await
        .map_err(|e| DatabaseError::TransactionError(format!("shrink position: {}", e)))?
        .rows_affected();
        if updated == 0 {
            return Err(DatabaseError::TransactionError(format!(
                "no position row for {} {}",
                symbol, side
            )));
        }

        cancel_triggers(&mut *tx, symbol, side.as_str())
            .await
            .map_err(|e| DatabaseError::TransactionError(format!("cancel triggers: {}", e)))?;
        for trigger in replacement_triggers {
            insert_price_order(&mut *tx, trigger)
                .await
                .map_err(|e| DatabaseError::TransactionError(format!("price order: {}", e)))?;
        }
        insert_trade(&mut *tx, close_trade)
            .await
            .map_err(|e| DatabaseError::TransactionError(format!("close trade: {}", e)))?;
        insert_close_event(&mut *tx, event)
            .await
            .map_err(|e| DatabaseError::TransactionError(format!("close event: {}", e)))?;

        tx.commit().await?;
        debug!(
            "Committed partial close for {} {} (fraction {:.2})",
            symbol, side, partial_close_fraction
        );
        Ok(())
    }

    /// Reconciler repair: synthesize the missing close records and mark the
    /// originating inconsistency resolved, atomically.
    pub async fn reconcile_close_txn(
        &self,
        state_id: Option<i64>,
        symbol: &str,
        side: PositionSide,
        close_trade: &NewTrade,
        event: &NewCloseEvent,
    ) -> Result<(), DatabaseError> {
        let mut tx = self.pool.begin().await?;

        cancel_triggers(&mut *tx, symbol, side.as_str())
            .await
            .map_err(|e| DatabaseError::TransactionError(format!("cancel triggers: {}", e)))?;
        insert_trade(&mut *tx, close_trade)
            .await
            .map_err(|e| DatabaseError::TransactionError(format!("close trade: {}", e)))?;
        insert_close_event(&mut *tx, event)
            .await
            .map_err(|e| DatabaseError::TransactionError(format!("close event: {}", e)))?;
        delete_position(&mut *tx, symbol, side.as_str())
            .await
            .map_err(|e| DatabaseError::TransactionError(format!("delete position: {}", e)))?;

        if let Some(id) = state_id {
            sqlx::query(
                r#"
                UPDATE inconsistent_states
                SET resolved = 1, resolved_at = ?1, resolved_by = 'auto'
                WHERE id = ?2
                "#,
            )
            .bind(Utc::now())
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| DatabaseError::TransactionError(format!("resolve state: {}", e)))?;
        }

        tx.commit().await?;
        debug!("Committed reconciled close for {} {}", symbol, side);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::init_database;

    async fn store() -> Arc<Store> {
        let pool = init_database("sqlite::memory:", 5).await.unwrap();
        Store::new(pool)
    }

    fn sample_position() -> Position {
        let mut position = Position::new("BTC", PositionSide::Long, 180.0, 3.0, 50000.0);
        position.stop_loss = Some(49000.0);
        position.take_profit = Some(55000.0);
        position
    }

    fn open_trade(order_id: &str) -> NewTrade {
        NewTrade {
            order_id: order_id.to_string(),
            symbol: "BTC".to_string(),
            side: "long".to_string(),
            trade_type: "open".to_string(),
            price: 50000.0,
            quantity: 180.0,
            leverage: 3.0,
            pnl: None,
            fee: 0.45,
            close_reason: None,
            timestamp: Utc::now(),
        }
    }

    fn trigger(order_id: &str, order_type: &str, price: f64) -> NewPriceOrder {
        NewPriceOrder {
            order_id: order_id.to_string(),
            symbol: "BTC".to_string(),
            side: "long".to_string(),
            order_type: order_type.to_string(),
            trigger_price: price,
            order_price: None,
            quantity: 180.0,
            position_order_id: "open-1".to_string(),
        }
    }

    fn close_event(reason: &str) -> NewCloseEvent {
        NewCloseEvent {
            symbol: "BTC".to_string(),
            side: "long".to_string(),
            entry_price: 50000.0,
            close_price: 51000.0,
            quantity: 180.0,
            leverage: 3.0,
            pnl: 18.0,
            pnl_percent: 6.0,
            fee: 0.9,
            close_reason: reason.to_string(),
            trigger_type: None,
            order_id: "close-1".to_string(),
        }
    }

    fn close_trade(order_id: &str) -> NewTrade {
        NewTrade {
            trade_type: "close".to_string(),
            pnl: Some(18.0),
            close_reason: Some("take_profit_triggered".to_string()),
            ..open_trade(order_id)
        }
    }

    #[tokio::test]
    async fn test_open_position_txn_writes_all_rows() {
        let store = store().await;
        store
            .open_position_txn(
                &sample_position(),
                &open_trade("open-1"),
                &[
                    trigger("t-1", "stop_loss", 49000.0),
                    trigger("t-2", "extreme_take_profit", 55000.0),
                ],
            )
            .await
            .unwrap();

        assert_eq!(store.positions.count().await.unwrap(), 1);
        assert_eq!(store.triggers.count_active().await.unwrap(), 2);
        let trades = store.trades.recent(10, None).await.unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].trade_type, "open");
    }

    #[tokio::test]
    async fn test_duplicate_position_rejected_in_txn() {
        let store = store().await;
        store
            .open_position_txn(&sample_position(), &open_trade("open-1"), &[])
            .await
            .unwrap();
        let err = store
            .open_position_txn(&sample_position(), &open_trade("open-2"), &[])
            .await;
        assert!(err.is_err());
        // the failed transaction must not leave a second open trade behind
        assert_eq!(store.trades.recent(10, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_close_position_txn() {
        let store = store().await;
        store
            .open_position_txn(
                &sample_position(),
                &open_trade("open-1"),
                &[trigger("t-1", "stop_loss", 49000.0)],
            )
            .await
            .unwrap();

        store
            .close_position_txn(
                "BTC",
                PositionSide::Long,
                &close_trade("close-1"),
                &close_event("take_profit_triggered"),
            )
            .await
            .unwrap();

        assert_eq!(store.positions.count().await.unwrap(), 0);
        assert_eq!(store.triggers.count_active().await.unwrap(), 0);
        let events = store.close_events.recent(10).await.unwrap();
        assert_eq!(events.len(), 1);
        assert!(!events[0].processed);
    }

    #[tokio::test]
    async fn test_partial_close_txn_advances_fraction_and_stop() {
        let store = store().await;
        store
            .open_position_txn(
                &sample_position(),
                &open_trade("open-1"),
                &[trigger("t-1", "stop_loss", 49000.0)],
            )
            .await
            .unwrap();

        store
            .partial_close_txn(
                "BTC",
                PositionSide::Long,
                120.6,
                0.33,
                Some(50000.0),
                &[
                    trigger("t-2", "stop_loss", 50000.0),
                    trigger("t-3", "extreme_take_profit", 55000.0),
                ],
                &close_trade("close-p1"),
                &close_event("partial_close"),
            )
            .await
            .unwrap();

        let record = store
            .positions
            .get("BTC", PositionSide::Long)
            .await
            .unwrap()
            .unwrap();
        assert!((record.quantity - 120.6).abs() < 1e-9);
        assert!((record.partial_close_fraction - 0.33).abs() < 1e-9);
        assert_eq!(record.stop_loss, Some(50000.0));
        // old trigger cancelled, two replacements active
        assert_eq!(store.triggers.count_active().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_reconcile_close_txn_resolves_state() {
        let store = store().await;
        store
            .open_position_txn(&sample_position(), &open_trade("open-1"), &[])
            .await
            .unwrap();
        let state_id = store
            .inconsistencies
            .record(&NewInconsistentState {
                operation: "close_position".to_string(),
                symbol: "BTC".to_string(),
                side: "long".to_string(),
                exchange_order_id: "987654321".to_string(),
            })
            .await
            .unwrap();

        store
            .reconcile_close_txn(
                Some(state_id),
                "BTC",
                PositionSide::Long,
                &close_trade("987654321"),
                &close_event("system_recovered"),
            )
            .await
            .unwrap();

        assert_eq!(store.positions.count().await.unwrap(), 0);
        assert_eq!(store.inconsistencies.count_unresolved().await.unwrap(), 0);
        let rows = sqlx::query_as::<_, InconsistentStateRecord>(
            "SELECT * FROM inconsistent_states WHERE id = ?1",
        )
        .bind(state_id)
        .fetch_all(store.pool())
        .await
        .unwrap();
        assert_eq!(rows[0].resolved_by.as_deref(), Some("auto"));
        assert!(rows[0].resolved);
    }

    #[tokio::test]
    async fn test_bump_failure_counter() {
        let store = store().await;
        let id = store
            .inconsistencies
            .record(&NewInconsistentState {
                operation: "open_position".to_string(),
                symbol: "ETH".to_string(),
                side: "short".to_string(),
                exchange_order_id: "1".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(store.inconsistencies.bump_failure(id).await.unwrap(), 1);
        assert_eq!(store.inconsistencies.bump_failure(id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_history_initial_balance_and_order() {
        let store = store().await;
        store.history.append(1000.0, 0.0, 0.0).await.unwrap();
        store.history.append(1100.0, 5.0, 10.0).await.unwrap();
        assert_eq!(store.history.initial_balance().await.unwrap(), Some(1000.0));
        let recent = store.history.recent(10).await.unwrap();
        assert_eq!(recent.len(), 2);
        // oldest first
        assert!(recent[0].total_value <= recent[1].total_value);
    }

    #[tokio::test]
    async fn test_completed_trades_join() {
        let store = store().await;
        let mut open = open_trade("open-1");
        open.timestamp = Utc::now() - chrono::Duration::hours(2);
        store.trades.insert(&open).await.unwrap();
        store.trades.insert(&close_trade("close-1")).await.unwrap();

        let completed = store.trades.completed(10).await.unwrap();
        assert_eq!(completed.len(), 1);
        let row = &completed[0];
        assert_eq!(row.symbol, "BTC");
        assert!((row.open_price - 50000.0).abs() < 1e-9);
        assert!(row.holding_hours > 1.9 && row.holding_hours < 2.1);
        assert!((row.total_fee - 0.9).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_update_peak_is_monotonic() {
        let store = store().await;
        store
            .open_position_txn(&sample_position(), &open_trade("open-1"), &[])
            .await
            .unwrap();
        store
            .positions
            .update_peak("BTC", PositionSide::Long, 8.0)
            .await
            .unwrap();
        store
            .positions
            .update_peak("BTC", PositionSide::Long, 4.0)
            .await
            .unwrap();
        let record = store
            .positions
            .get("BTC", PositionSide::Long)
            .await
            .unwrap()
            .unwrap();
        assert!((record.peak_pnl_percent - 8.0).abs() < 1e-9);
    }
}
