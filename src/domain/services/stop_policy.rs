//! Stop management policy: scientific stop distance, trigger-side
//! validation, staged partial take-profit tiers, and trailing-stop tiers.
//!
//! A position moves through `Open -> Armed` once both protective triggers
//! are placed, then `Trailing` or `Partial` stages, and finally `Closed`.
//! Any non-terminal stage may jump straight to an emergency close when the
//! warning or reversal score reaches the emergency threshold.

use crate::domain::entities::candle::Candle;
use crate::domain::entities::position::{Position, PositionSide};
use crate::domain::repositories::exchange_client::TriggerRule;
use crate::domain::services::indicators;

#[derive(Debug, Clone, Copy)]
pub struct PartialTier {
    /// Profit threshold in R-multiples of the initial stop distance.
    pub r_multiple: f64,
    /// Fraction of the ORIGINAL size to close at this tier. The final tier
    /// closes whatever remains.
    pub fraction: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct TrailingTier {
    pub r_multiple: f64,
    /// Stop placement in R-multiples relative to entry (0 = breakeven).
    pub stop_at_r: f64,
}

#[derive(Debug, Clone)]
pub struct StopPolicy {
    pub atr_period: usize,
    pub atr_multiplier: f64,
    /// Structural level lookback (candles) for support/resistance distance.
    pub structure_lookback: usize,
    /// Stop distance bounds as fractions of entry price.
    pub min_distance_pct: f64,
    pub max_distance_pct: f64,
    /// Extreme take-profit placement in R-multiples.
    pub extreme_r_multiple: f64,
    /// Minimum trigger distance from mark.
    pub safety_distance_pct: f64,
    /// Shift applied when a trigger lands on the already-triggered side.
    pub wrong_side_shift_pct: f64,
    pub partial_tiers: Vec<PartialTier>,
    pub trailing_tiers: Vec<TrailingTier>,
    /// Close when PnL retraces by this fraction of the peak.
    pub peak_drawdown_fraction: f64,
    /// Peak PnL percent below which drawdown protection stays idle.
    pub peak_arm_pct: f64,
    pub max_holding_hours: f64,
    pub emergency_score: f64,
}

impl Default for StopPolicy {
    fn default() -> Self {
        StopPolicy {
            atr_period: 14,
            atr_multiplier: 2.0,
            structure_lookback: 20,
            min_distance_pct: 0.005,
            max_distance_pct: 0.03,
            extreme_r_multiple: 5.0,
            safety_distance_pct: 0.003,
            wrong_side_shift_pct: 0.005,
            partial_tiers: vec![
                PartialTier {
                    r_multiple: 2.0,
                    fraction: 0.33,
                },
                PartialTier {
                    r_multiple: 3.0,
                    fraction: 0.33,
                },
                PartialTier {
                    r_multiple: 4.0,
                    fraction: 1.0,
                },
            ],
            trailing_tiers: vec![
                TrailingTier {
                    r_multiple: 1.0,
                    stop_at_r: 0.0,
                },
                TrailingTier {
                    r_multiple: 2.0,
                    stop_at_r: 0.5,
                },
                TrailingTier {
                    r_multiple: 3.0,
                    stop_at_r: 1.5,
                },
            ],
            peak_drawdown_fraction: 0.4,
            peak_arm_pct: 5.0,
            max_holding_hours: 36.0,
            emergency_score: 70.0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ProtectivePrices {
    pub stop_loss: f64,
    pub extreme_take_profit: f64,
    /// The initial risk distance both prices derive from.
    pub distance: f64,
}

impl StopPolicy {
    /// Stop distance from ATR and structural levels, clamped into the
    /// configured band around entry.
    pub fn stop_distance(&self, entry: f64, side: PositionSide, candles_5m: &[Candle]) -> f64 {
        let atr = indicators::atr(candles_5m, self.atr_period).unwrap_or(0.0);
        let structural = match side {
            PositionSide::Long => {
                indicators::swing_low(candles_5m, self.structure_lookback).map(|low| entry - low)
            }
            PositionSide::Short => {
                indicators::swing_high(candles_5m, self.structure_lookback).map(|high| high - entry)
            }
        }
        .filter(|d| *d > 0.0)
        .unwrap_or(0.0);

        let distance = (self.atr_multiplier * atr).max(structural);
        distance.clamp(
            entry * self.min_distance_pct,
            entry * self.max_distance_pct,
        )
    }

    /// Stop-loss on the loss side of entry, extreme take-profit at
    /// `extreme_r_multiple * distance` on the gain side.
    pub fn protective_prices(
        &self,
        entry: f64,
        side: PositionSide,
        distance: f64,
    ) -> ProtectivePrices {
        let reward = distance * self.extreme_r_multiple;
        let (stop_loss, extreme_take_profit) = match side {
            PositionSide::Long => (entry - distance, entry + reward),
            PositionSide::Short => (entry + distance, entry - reward),
        };
        ProtectivePrices {
            stop_loss,
            extreme_take_profit,
            distance,
        }
    }

    /// Validate a trigger price against the current mark.
    ///
    /// A trigger already on the triggered side of mark is shifted to the
    /// safe side by `wrong_side_shift_pct`; a trigger closer than
    /// `safety_distance_pct` is pushed out to exactly that distance.
    pub fn validate_trigger(&self, trigger: f64, mark: f64, rule: TriggerRule) -> f64 {
        let safety = mark * self.safety_distance_pct;
        match rule {
            TriggerRule::GreaterOrEqual => {
                if trigger <= mark {
                    mark * (1.0 + self.wrong_side_shift_pct)
                } else if trigger - mark < safety {
                    mark + safety
                } else {
                    trigger
                }
            }
            TriggerRule::LessOrEqual => {
                if trigger >= mark {
                    mark * (1.0 - self.wrong_side_shift_pct)
                } else if mark - trigger < safety {
                    mark - safety
                } else {
                    trigger
                }
            }
        }
    }

    /// Trigger rule for a protective stop on the given side. A long's stop
    /// fires when mark falls to it; a short's when mark rises.
    pub fn stop_rule(side: PositionSide) -> TriggerRule {
        match side {
            PositionSide::Long => TriggerRule::LessOrEqual,
            PositionSide::Short => TriggerRule::GreaterOrEqual,
        }
    }

    /// Trigger rule for a take-profit on the given side.
    pub fn take_profit_rule(side: PositionSide) -> TriggerRule {
        match side {
            PositionSide::Long => TriggerRule::GreaterOrEqual,
            PositionSide::Short => TriggerRule::LessOrEqual,
        }
    }

    /// Current profit in R-multiples of the initial risk distance.
    pub fn r_multiple(&self, entry: f64, mark: f64, side: PositionSide, distance: f64) -> f64 {
        if distance <= 0.0 {
            return 0.0;
        }
        let gain = match side {
            PositionSide::Long => mark - entry,
            PositionSide::Short => entry - mark,
        };
        gain / distance
    }

    /// Initial risk distance recovered from the stored extreme take-profit.
    pub fn distance_from_position(&self, position: &Position) -> Option<f64> {
        position
            .take_profit
            .map(|tp| (tp - position.entry_price).abs() / self.extreme_r_multiple)
            .filter(|d| *d > 0.0)
    }

    /// Next unexecuted partial tier for a stored cumulative fraction, if
    /// its R threshold has been reached.
    pub fn next_partial(&self, fraction: f64, pnl_r: f64) -> Option<(usize, PartialTier)> {
        let mut cumulative = 0.0;
        for (index, tier) in self.partial_tiers.iter().enumerate() {
            let is_final = index == self.partial_tiers.len() - 1;
            let tier_target = if is_final {
                1.0
            } else {
                cumulative + tier.fraction
            };
            if fraction + 1e-9 < tier_target {
                if pnl_r >= tier.r_multiple {
                    return Some((index, *tier));
                }
                return None;
            }
            cumulative = tier_target;
        }
        None
    }

    /// Stop advancement after a partial at `tier_r`. Lands on breakeven for
    /// the first tier and locks one R per tier beyond it.
    pub fn stop_after_partial(&self, entry: f64, side: PositionSide, distance: f64, tier_r: f64) -> f64 {
        let lock_r = (tier_r - 2.0).max(0.0);
        match side {
            PositionSide::Long => entry + lock_r * distance,
            PositionSide::Short => entry - lock_r * distance,
        }
    }

    /// Trailing stop for the highest tier whose threshold the current
    /// R-multiple has reached. Never returns a stop in the loss direction
    /// relative to the tier table.
    pub fn trailing_stop(
        &self,
        entry: f64,
        side: PositionSide,
        distance: f64,
        pnl_r: f64,
    ) -> Option<f64> {
        let tier = self
            .trailing_tiers
            .iter()
            .filter(|t| pnl_r >= t.r_multiple)
            .last()?;
        let stop = match side {
            PositionSide::Long => entry + tier.stop_at_r * distance,
            PositionSide::Short => entry - tier.stop_at_r * distance,
        };
        Some(stop)
    }

    /// Whether a proposed stop improves on the current one (never moves in
    /// the loss direction).
    pub fn stop_improves(side: PositionSide, current: Option<f64>, proposed: f64) -> bool {
        match current {
            None => true,
            Some(existing) => match side {
                PositionSide::Long => proposed > existing,
                PositionSide::Short => proposed < existing,
            },
        }
    }

    /// Peak drawdown exit: armed once peak PnL clears `peak_arm_pct`, fires
    /// when the retrace from peak exceeds the configured fraction.
    pub fn peak_drawdown_exceeded(&self, peak_pnl_percent: f64, current_pnl_percent: f64) -> bool {
        if peak_pnl_percent < self.peak_arm_pct {
            return false;
        }
        peak_pnl_percent - current_pnl_percent > peak_pnl_percent * self.peak_drawdown_fraction
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn flat_candles(price: f64, range: f64, n: usize) -> Vec<Candle> {
        (0..n)
            .map(|_| Candle {
                timestamp: Utc::now(),
                open: price,
                high: price + range / 2.0,
                low: price - range / 2.0,
                close: price,
                volume: 1000.0,
            })
            .collect()
    }

    #[test]
    fn test_stop_distance_clamped_to_band() {
        let policy = StopPolicy::default();
        // Tiny ATR: clamps up to min 0.5%
        let calm = flat_candles(50000.0, 10.0, 30);
        let d = policy.stop_distance(50000.0, PositionSide::Long, &calm);
        assert!((d - 250.0).abs() < 1e-6);

        // Huge ATR: clamps down to max 3%
        let wild = flat_candles(50000.0, 5000.0, 30);
        let d = policy.stop_distance(50000.0, PositionSide::Long, &wild);
        assert!((d - 1500.0).abs() < 1e-6);
    }

    #[test]
    fn test_stop_distance_uses_structure_when_wider() {
        let policy = StopPolicy::default();
        let mut candles = flat_candles(50000.0, 100.0, 30);
        // one deep swing low 1000 below entry
        candles[15].low = 49000.0;
        let d = policy.stop_distance(50000.0, PositionSide::Long, &candles);
        assert!((d - 1000.0).abs() < 1e-6);
    }

    #[test]
    fn test_protective_prices_long() {
        let policy = StopPolicy::default();
        let prices = policy.protective_prices(100.0, PositionSide::Long, 2.0);
        assert!((prices.stop_loss - 98.0).abs() < 1e-9);
        assert!((prices.extreme_take_profit - 110.0).abs() < 1e-9);
    }

    #[test]
    fn test_protective_prices_short() {
        let policy = StopPolicy::default();
        let prices = policy.protective_prices(100.0, PositionSide::Short, 2.0);
        assert!((prices.stop_loss - 102.0).abs() < 1e-9);
        assert!((prices.extreme_take_profit - 90.0).abs() < 1e-9);
    }

    #[test]
    fn test_validate_trigger_wrong_side_shift() {
        let policy = StopPolicy::default();
        // GreaterOrEqual trigger already below mark fires immediately;
        // shifted 0.5% above mark instead.
        let adjusted = policy.validate_trigger(99.0, 100.0, TriggerRule::GreaterOrEqual);
        assert!((adjusted - 100.5).abs() < 1e-9);

        let adjusted = policy.validate_trigger(101.0, 100.0, TriggerRule::LessOrEqual);
        assert!((adjusted - 99.5).abs() < 1e-9);
    }

    #[test]
    fn test_validate_trigger_safety_distance() {
        let policy = StopPolicy::default();
        // within 0.3% of mark: pushed out to exactly 0.3%
        let adjusted = policy.validate_trigger(100.1, 100.0, TriggerRule::GreaterOrEqual);
        assert!((adjusted - 100.3).abs() < 1e-9);

        let adjusted = policy.validate_trigger(99.9, 100.0, TriggerRule::LessOrEqual);
        assert!((adjusted - 99.7).abs() < 1e-9);

        // already far enough: untouched
        let untouched = policy.validate_trigger(105.0, 100.0, TriggerRule::GreaterOrEqual);
        assert_eq!(untouched, 105.0);
    }

    #[test]
    fn test_next_partial_progression() {
        let policy = StopPolicy::default();

        // Fresh position, below 2R: nothing to do
        assert!(policy.next_partial(0.0, 1.5).is_none());

        // At 2R the first tier fires
        let (index, tier) = policy.next_partial(0.0, 2.1).unwrap();
        assert_eq!(index, 0);
        assert!((tier.fraction - 0.33).abs() < 1e-9);

        // After the first partial, 2R no longer qualifies but 3R does
        assert!(policy.next_partial(0.33, 2.5).is_none());
        let (index, _) = policy.next_partial(0.33, 3.0).unwrap();
        assert_eq!(index, 1);

        // Final tier at 4R
        let (index, tier) = policy.next_partial(0.66, 4.2).unwrap();
        assert_eq!(index, 2);
        assert!((tier.fraction - 1.0).abs() < 1e-9);

        // Fully closed: no more tiers at any profit
        assert!(policy.next_partial(1.0, 10.0).is_none());
    }

    #[test]
    fn test_stop_after_partial_locks_gains() {
        let policy = StopPolicy::default();
        // first tier (2R) -> breakeven
        let stop = policy.stop_after_partial(100.0, PositionSide::Long, 2.0, 2.0);
        assert!((stop - 100.0).abs() < 1e-9);
        // 3R tier -> +1R
        let stop = policy.stop_after_partial(100.0, PositionSide::Long, 2.0, 3.0);
        assert!((stop - 102.0).abs() < 1e-9);
        // short mirrors
        let stop = policy.stop_after_partial(100.0, PositionSide::Short, 2.0, 3.0);
        assert!((stop - 98.0).abs() < 1e-9);
    }

    #[test]
    fn test_trailing_stop_tiers() {
        let policy = StopPolicy::default();
        assert!(policy
            .trailing_stop(100.0, PositionSide::Long, 2.0, 0.5)
            .is_none());

        let stop = policy
            .trailing_stop(100.0, PositionSide::Long, 2.0, 1.2)
            .unwrap();
        assert!((stop - 100.0).abs() < 1e-9); // breakeven

        let stop = policy
            .trailing_stop(100.0, PositionSide::Long, 2.0, 3.5)
            .unwrap();
        assert!((stop - 103.0).abs() < 1e-9); // +1.5R
    }

    #[test]
    fn test_stop_never_moves_backwards() {
        assert!(StopPolicy::stop_improves(PositionSide::Long, Some(98.0), 100.0));
        assert!(!StopPolicy::stop_improves(PositionSide::Long, Some(100.0), 98.0));
        assert!(StopPolicy::stop_improves(PositionSide::Short, Some(102.0), 100.0));
        assert!(!StopPolicy::stop_improves(PositionSide::Short, Some(100.0), 102.0));
        assert!(StopPolicy::stop_improves(PositionSide::Long, None, 50.0));
    }

    #[test]
    fn test_peak_drawdown() {
        let policy = StopPolicy::default();
        // not armed below peak_arm_pct
        assert!(!policy.peak_drawdown_exceeded(3.0, 0.5));
        // armed, retraced more than 40% of a 10% peak
        assert!(policy.peak_drawdown_exceeded(10.0, 5.0));
        // armed, small retrace
        assert!(!policy.peak_drawdown_exceeded(10.0, 8.0));
    }

    #[test]
    fn test_distance_recovered_from_position() {
        let policy = StopPolicy::default();
        let mut position = Position::new("BTC", PositionSide::Long, 1.0, 3.0, 100.0);
        position.take_profit = Some(110.0);
        let d = policy.distance_from_position(&position).unwrap();
        assert!((d - 2.0).abs() < 1e-9);
    }
}
