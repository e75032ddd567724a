use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::errors::ValidationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionSide::Long => "long",
            PositionSide::Short => "short",
        }
    }

    pub fn opposite(&self) -> PositionSide {
        match self {
            PositionSide::Long => PositionSide::Short,
            PositionSide::Short => PositionSide::Long,
        }
    }

    /// Sign applied to order sizes: positive buys open longs, negative
    /// sells open shorts.
    pub fn sign(&self) -> f64 {
        match self {
            PositionSide::Long => 1.0,
            PositionSide::Short => -1.0,
        }
    }
}

impl std::fmt::Display for PositionSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for PositionSide {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "long" => Ok(PositionSide::Long),
            "short" => Ok(PositionSide::Short),
            other => Err(ValidationError::InvalidSymbol(format!(
                "unknown side: {}",
                other
            ))),
        }
    }
}

/// Local mirror of an exchange position, authoritative for intent and
/// history. The exchange remains authoritative for current size and
/// liquidation price.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub side: PositionSide,
    pub quantity: f64,
    pub leverage: f64,
    pub entry_price: f64,
    pub opened_at: DateTime<Utc>,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    /// Cumulative fraction of the original size closed by staged partials.
    pub partial_close_fraction: f64,
    pub warning_score: f64,
    pub reversal_warning: bool,
    pub peak_pnl_percent: f64,
}

impl Position {
    pub fn new(
        symbol: &str,
        side: PositionSide,
        quantity: f64,
        leverage: f64,
        entry_price: f64,
    ) -> Self {
        Position {
            symbol: symbol.to_string(),
            side,
            quantity,
            leverage,
            entry_price,
            opened_at: Utc::now(),
            stop_loss: None,
            take_profit: None,
            partial_close_fraction: 0.0,
            warning_score: 0.0,
            reversal_warning: false,
            peak_pnl_percent: 0.0,
        }
    }

    /// Margin-relative PnL percent at the given mark price.
    pub fn pnl_percent(&self, mark: f64) -> f64 {
        if self.entry_price <= 0.0 {
            return 0.0;
        }
        let move_pct = match self.side {
            PositionSide::Long => (mark - self.entry_price) / self.entry_price,
            PositionSide::Short => (self.entry_price - mark) / self.entry_price,
        };
        move_pct * self.leverage * 100.0
    }

    pub fn holding_hours(&self, now: DateTime<Utc>) -> f64 {
        (now - self.opened_at).num_seconds() as f64 / 3600.0
    }

    /// Partial take-profit stage derived from the stored fraction. The
    /// stored value is authoritative; the badge is never tracked separately.
    pub fn partial_stage(&self) -> u8 {
        if self.partial_close_fraction < 0.33 {
            0
        } else if self.partial_close_fraction < 0.66 {
            1
        } else if self.partial_close_fraction < 1.0 {
            2
        } else {
            3
        }
    }

    /// Size of the position before any partial closes.
    pub fn original_quantity(&self) -> f64 {
        let remaining = 1.0 - self.partial_close_fraction;
        if remaining <= f64::EPSILON {
            self.quantity
        } else {
            self.quantity / remaining
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pnl_percent_long() {
        let pos = Position::new("BTC", PositionSide::Long, 0.1, 3.0, 50000.0);
        // +2% price move at 3x leverage => +6% on margin
        assert!((pos.pnl_percent(51000.0) - 6.0).abs() < 1e-9);
        assert!((pos.pnl_percent(49000.0) + 6.0).abs() < 1e-9);
    }

    #[test]
    fn test_pnl_percent_short() {
        let pos = Position::new("ETH", PositionSide::Short, 1.0, 2.0, 2000.0);
        assert!((pos.pnl_percent(1900.0) - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_partial_stage_from_fraction() {
        let mut pos = Position::new("BTC", PositionSide::Long, 1.0, 2.0, 100.0);
        assert_eq!(pos.partial_stage(), 0);
        pos.partial_close_fraction = 0.33;
        assert_eq!(pos.partial_stage(), 1);
        pos.partial_close_fraction = 0.66;
        assert_eq!(pos.partial_stage(), 2);
        pos.partial_close_fraction = 1.0;
        assert_eq!(pos.partial_stage(), 3);
    }

    #[test]
    fn test_original_quantity() {
        let mut pos = Position::new("BTC", PositionSide::Long, 0.67, 2.0, 100.0);
        pos.partial_close_fraction = 0.33;
        assert!((pos.original_quantity() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_side_sign_and_opposite() {
        assert_eq!(PositionSide::Long.sign(), 1.0);
        assert_eq!(PositionSide::Short.sign(), -1.0);
        assert_eq!(PositionSide::Long.opposite(), PositionSide::Short);
    }
}
