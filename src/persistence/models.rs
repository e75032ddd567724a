//! Database Models
//!
//! Row structs for the seven store tables plus the create-inputs used by
//! the repositories. Field names map 1:1 to columns.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PositionRecord {
    pub symbol: String,
    pub side: String,
    pub quantity: f64,
    pub leverage: f64,
    pub entry_price: f64,
    pub opened_at: DateTime<Utc>,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub partial_close_fraction: f64,
    pub warning_score: f64,
    pub reversal_warning: bool,
    pub peak_pnl_percent: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TradeRecord {
    pub id: i64,
    pub order_id: String,
    pub symbol: String,
    pub side: String,
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub trade_type: String,
    pub price: f64,
    pub quantity: f64,
    pub leverage: f64,
    pub pnl: Option<f64>,
    pub fee: f64,
    pub close_reason: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub status: String,
}

#[derive(Debug, Clone)]
pub struct NewTrade {
    pub order_id: String,
    pub symbol: String,
    pub side: String,
    pub trade_type: String,
    pub price: f64,
    pub quantity: f64,
    pub leverage: f64,
    pub pnl: Option<f64>,
    pub fee: f64,
    pub close_reason: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PriceOrderRecord {
    pub id: i64,
    /// Venue-assigned trigger order id.
    pub order_id: String,
    pub symbol: String,
    pub side: String,
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub order_type: String,
    pub trigger_price: f64,
    pub order_price: Option<f64>,
    pub quantity: f64,
    pub status: String,
    /// Links the trigger to the open trade's order id.
    pub position_order_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewPriceOrder {
    pub order_id: String,
    pub symbol: String,
    pub side: String,
    pub order_type: String,
    pub trigger_price: f64,
    pub order_price: Option<f64>,
    pub quantity: f64,
    pub position_order_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CloseEventRecord {
    pub id: i64,
    pub symbol: String,
    pub side: String,
    pub entry_price: f64,
    pub close_price: f64,
    pub quantity: f64,
    pub leverage: f64,
    pub pnl: f64,
    pub pnl_percent: f64,
    pub fee: f64,
    pub close_reason: String,
    pub trigger_type: Option<String>,
    pub order_id: String,
    pub created_at: DateTime<Utc>,
    pub processed: bool,
}

#[derive(Debug, Clone)]
pub struct NewCloseEvent {
    pub symbol: String,
    pub side: String,
    pub entry_price: f64,
    pub close_price: f64,
    pub quantity: f64,
    pub leverage: f64,
    pub pnl: f64,
    pub pnl_percent: f64,
    pub fee: f64,
    pub close_reason: String,
    pub trigger_type: Option<String>,
    pub order_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct InconsistentStateRecord {
    pub id: i64,
    pub operation: String,
    pub symbol: String,
    pub side: String,
    pub exchange_order_id: String,
    pub created_at: DateTime<Utc>,
    pub resolved: bool,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<String>,
    pub failure_count: i64,
}

#[derive(Debug, Clone)]
pub struct NewInconsistentState {
    pub operation: String,
    pub symbol: String,
    pub side: String,
    pub exchange_order_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct DecisionRecord {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub iteration: i64,
    pub decision: String,
    pub actions_taken: String,
    pub account_value: f64,
    pub positions_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AccountHistoryRecord {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub total_value: f64,
    pub unrealized_pnl: f64,
    pub return_percent: f64,
}

/// Open/close pair for the completed-trades dashboard view.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct CompletedTradeRecord {
    pub symbol: String,
    pub side: String,
    pub open_price: f64,
    pub close_price: f64,
    pub quantity: f64,
    pub leverage: f64,
    pub pnl: Option<f64>,
    pub total_fee: f64,
    pub close_reason: Option<String>,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
    pub holding_hours: f64,
}
