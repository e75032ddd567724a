//! Decision context assembly.
//!
//! A compact, serializable snapshot of the account, open positions with
//! their warning flags and partial-stage badges, and per-symbol market
//! state. The collaborator renders this into its prompt; the control plane
//! never sees prompt text.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::domain::entities::account::AccountSummary;
use crate::domain::entities::candle::{Candle, Interval};
use crate::domain::entities::position::{Position, PositionSide};
use crate::domain::services::indicators::{self, Ema, Indicator, Rsi};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionBrief {
    pub symbol: String,
    pub side: PositionSide,
    pub quantity: f64,
    pub leverage: f64,
    pub entry_price: f64,
    pub mark_price: f64,
    pub pnl_percent: f64,
    pub holding_hours: f64,
    pub partial_stage: u8,
    pub warning_score: f64,
    pub reversal_warning: bool,
    pub peak_pnl_percent: f64,
}

impl PositionBrief {
    pub fn from_position(position: &Position, mark_price: f64, now: DateTime<Utc>) -> Self {
        PositionBrief {
            symbol: position.symbol.clone(),
            side: position.side,
            quantity: position.quantity,
            leverage: position.leverage,
            entry_price: position.entry_price,
            mark_price,
            pnl_percent: position.pnl_percent(mark_price),
            holding_hours: position.holding_hours(now),
            partial_stage: position.partial_stage(),
            warning_score: position.warning_score,
            reversal_warning: position.reversal_warning,
            peak_pnl_percent: position.peak_pnl_percent,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IntervalStats {
    pub interval: String,
    pub last_close: f64,
    pub rsi: Option<f64>,
    pub ema_fast: Option<f64>,
    pub ema_slow: Option<f64>,
    pub atr: Option<f64>,
}

impl IntervalStats {
    pub fn from_candles(interval: Interval, candles: &[Candle]) -> Option<Self> {
        let last_close = candles.last()?.close;
        Some(IntervalStats {
            interval: interval.as_str().to_string(),
            last_close,
            rsi: Rsi::new(14).calculate(candles).last().copied(),
            ema_fast: Ema::new(9).calculate(candles).last().copied(),
            ema_slow: Ema::new(21).calculate(candles).last().copied(),
            atr: indicators::atr(candles, 14),
        })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolSnapshot {
    pub symbol: String,
    pub last_price: f64,
    pub mark_price: Option<f64>,
    pub funding_rate: Option<f64>,
    pub intervals: Vec<IntervalStats>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionContext {
    pub timestamp: DateTime<Utc>,
    pub iteration: u64,
    pub account: AccountSummary,
    pub positions: Vec<PositionBrief>,
    pub market: Vec<SymbolSnapshot>,
    /// True when any market field was served from a stale cache entry.
    pub degraded_data: bool,
}
