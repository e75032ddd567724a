use serde::{Deserialize, Serialize};

use crate::domain::entities::position::PositionSide;

/// Contract settlement style. Determines both quantity and PnL arithmetic;
/// no other polymorphism exists across venues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContractType {
    /// USDT-margined: size in coin units, PnL in USDT.
    Linear,
    /// Coin-margined / contract-unit: size in integer contract units,
    /// PnL scaled by the quanto multiplier.
    Inverse,
}

/// Immutable per-session contract metadata, cacheable indefinitely.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractSpec {
    /// Canonical symbol, e.g. "BTC".
    pub symbol: String,
    /// Venue-specific contract identifier, e.g. "BTC_USDT" or "BTCUSDT".
    pub venue_symbol: String,
    pub contract_type: ContractType,
    pub quanto_multiplier: f64,
    pub order_size_min: f64,
    pub order_size_max: f64,
    /// Price tick for limit and trigger orders.
    pub order_price_round: f64,
    pub mark_price_round: f64,
}

impl ContractSpec {
    /// Order quantity for a given USDT notional at the given leverage.
    pub fn calculate_quantity(&self, usdt: f64, price: f64, leverage: f64) -> f64 {
        if price <= 0.0 {
            return 0.0;
        }
        match self.contract_type {
            ContractType::Inverse => {
                ((usdt * leverage) / (self.quanto_multiplier * price)).floor()
            }
            ContractType::Linear => usdt * leverage / price,
        }
    }

    /// Realized PnL between entry and exit for the given side.
    pub fn calculate_pnl(&self, entry: f64, exit: f64, quantity: f64, side: PositionSide) -> f64 {
        let delta = match side {
            PositionSide::Long => exit - entry,
            PositionSide::Short => entry - exit,
        };
        match self.contract_type {
            ContractType::Inverse => delta * quantity * self.quanto_multiplier,
            ContractType::Linear => delta * quantity,
        }
    }

    /// Clamp an order size magnitude into the contract's bounds, preserving
    /// sign.
    pub fn clamp_size(&self, size: f64) -> f64 {
        let magnitude = size.abs().clamp(self.order_size_min, self.order_size_max);
        if size < 0.0 {
            -magnitude
        } else {
            magnitude
        }
    }

    /// Round a price to the contract tick.
    pub fn round_price(&self, price: f64) -> f64 {
        if self.order_price_round > 0.0 {
            (price / self.order_price_round).round() * self.order_price_round
        } else {
            price
        }
    }

    /// USDT notional of a quantity at the given price.
    pub fn notional(&self, quantity: f64, price: f64) -> f64 {
        match self.contract_type {
            ContractType::Inverse => quantity.abs() * self.quanto_multiplier * price,
            ContractType::Linear => quantity.abs() * price,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inverse_contract() -> ContractSpec {
        ContractSpec {
            symbol: "BTC".to_string(),
            venue_symbol: "BTC_USDT".to_string(),
            contract_type: ContractType::Inverse,
            quanto_multiplier: 0.0001,
            order_size_min: 1.0,
            order_size_max: 1_000_000.0,
            order_price_round: 0.1,
            mark_price_round: 0.01,
        }
    }

    fn linear_contract() -> ContractSpec {
        ContractSpec {
            symbol: "BTC".to_string(),
            venue_symbol: "BTCUSDT".to_string(),
            contract_type: ContractType::Linear,
            quanto_multiplier: 1.0,
            order_size_min: 0.001,
            order_size_max: 100.0,
            order_price_round: 0.1,
            mark_price_round: 0.01,
        }
    }

    #[test]
    fn test_inverse_quantity_floors_to_contract_units() {
        let c = inverse_contract();
        // 300 USDT at 3x leverage, price 50000: 900 / 5 = 180 contracts
        let qty = c.calculate_quantity(300.0, 50000.0, 3.0);
        assert_eq!(qty, 180.0);
        assert_eq!(qty.fract(), 0.0);
    }

    #[test]
    fn test_linear_quantity() {
        let c = linear_contract();
        let qty = c.calculate_quantity(300.0, 50000.0, 3.0);
        assert!((qty - 0.018).abs() < 1e-12);
    }

    #[test]
    fn test_pnl_zero_at_entry_for_both_types() {
        let inv = inverse_contract();
        let lin = linear_contract();
        assert_eq!(inv.calculate_pnl(50000.0, 50000.0, 180.0, PositionSide::Long), 0.0);
        assert_eq!(inv.calculate_pnl(50000.0, 50000.0, 180.0, PositionSide::Short), 0.0);
        assert_eq!(lin.calculate_pnl(50000.0, 50000.0, 0.02, PositionSide::Long), 0.0);
        assert_eq!(lin.calculate_pnl(50000.0, 50000.0, 0.02, PositionSide::Short), 0.0);
    }

    #[test]
    fn test_pnl_direction() {
        let lin = linear_contract();
        assert!(lin.calculate_pnl(100.0, 110.0, 1.0, PositionSide::Long) > 0.0);
        assert!(lin.calculate_pnl(100.0, 110.0, 1.0, PositionSide::Short) < 0.0);

        let inv = inverse_contract();
        let pnl = inv.calculate_pnl(50000.0, 51000.0, 180.0, PositionSide::Long);
        assert!((pnl - 1000.0 * 180.0 * 0.0001).abs() < 1e-9);
    }

    #[test]
    fn test_clamp_size_bounds() {
        let c = inverse_contract();
        assert_eq!(c.clamp_size(0.4), 1.0);
        assert_eq!(c.clamp_size(2_000_000.0), 1_000_000.0);
        assert_eq!(c.clamp_size(-0.4), -1.0);
        assert_eq!(c.clamp_size(500.0), 500.0);
    }

    #[test]
    fn test_round_price_to_tick() {
        let c = inverse_contract();
        assert!((c.round_price(50000.04) - 50000.0).abs() < 1e-9);
        assert!((c.round_price(50000.06) - 50000.1).abs() < 1e-9);
    }

    #[test]
    fn test_notional() {
        let inv = inverse_contract();
        assert!((inv.notional(180.0, 50000.0) - 900.0).abs() < 1e-9);
        let lin = linear_contract();
        assert!((lin.notional(0.018, 50000.0) - 900.0).abs() < 1e-9);
    }
}
