//! Reversal scoring for open positions.
//!
//! Each signal produces a 0-100 score measuring evidence that the trend is
//! turning AGAINST the given side; the composite feeds the reversal monitor
//! and the early-warning flags the scheduler shows the decision provider.

use crate::domain::entities::candle::Candle;
use crate::domain::entities::position::PositionSide;
use crate::domain::services::indicators::{Ema, Indicator, Rsi};

pub trait ReversalSignal: Send + Sync {
    /// Evidence of reversal against `side`, in [0, 100].
    fn score(&self, candles: &[Candle], side: PositionSide) -> f64;

    fn name(&self) -> &'static str;

    fn weight(&self) -> f64 {
        1.0
    }
}

/// Momentum turning against the position: RSI drifting through the midline
/// and the fast EMA crossing the slow one.
pub struct MomentumReversal {
    pub rsi_period: usize,
    pub ema_fast: usize,
    pub ema_slow: usize,
}

impl Default for MomentumReversal {
    fn default() -> Self {
        MomentumReversal {
            rsi_period: 14,
            ema_fast: 9,
            ema_slow: 21,
        }
    }
}

impl ReversalSignal for MomentumReversal {
    fn score(&self, candles: &[Candle], side: PositionSide) -> f64 {
        let mut score = 0.0;
        let mut signals = 0u32;

        let rsi = Rsi::new(self.rsi_period).calculate(candles);
        if let Some(&last) = rsi.last() {
            // distance through the midline against the side, 0..50 -> 0..100
            let against = match side {
                PositionSide::Long => (50.0 - last).max(0.0),
                PositionSide::Short => (last - 50.0).max(0.0),
            };
            score += (against * 2.0).min(100.0);
            signals += 1;
        }

        let fast = Ema::new(self.ema_fast).calculate(candles);
        let slow = Ema::new(self.ema_slow).calculate(candles);
        if let (Some(&f), Some(&s)) = (fast.last(), slow.last()) {
            let crossed_against = match side {
                PositionSide::Long => f < s,
                PositionSide::Short => f > s,
            };
            score += if crossed_against { 80.0 } else { 10.0 };
            signals += 1;
        }

        if signals == 0 {
            return 0.0;
        }
        (score / signals as f64).clamp(0.0, 100.0)
    }

    fn name(&self) -> &'static str {
        "momentum"
    }

    fn weight(&self) -> f64 {
        1.5
    }
}

/// Consecutive candles closing against the position with growing bodies.
pub struct PriceActionReversal {
    pub lookback: usize,
}

impl Default for PriceActionReversal {
    fn default() -> Self {
        PriceActionReversal { lookback: 5 }
    }
}

impl ReversalSignal for PriceActionReversal {
    fn score(&self, candles: &[Candle], side: PositionSide) -> f64 {
        if candles.is_empty() {
            return 0.0;
        }
        let window: Vec<&Candle> = candles.iter().rev().take(self.lookback).collect();
        let against = window
            .iter()
            .filter(|c| match side {
                PositionSide::Long => !c.is_bullish(),
                PositionSide::Short => c.is_bullish(),
            })
            .count();

        let base = against as f64 / window.len() as f64 * 100.0;

        // strong last candle against the side weighs extra
        let last = &candles[candles.len() - 1];
        let last_against = match side {
            PositionSide::Long => !last.is_bullish(),
            PositionSide::Short => last.is_bullish(),
        };
        let body_ratio = if last.range() > 0.0 {
            last.body() / last.range()
        } else {
            0.0
        };
        let boost = if last_against && body_ratio > 0.6 {
            20.0
        } else {
            0.0
        };

        (base * 0.8 + boost).clamp(0.0, 100.0)
    }

    fn name(&self) -> &'static str {
        "price_action"
    }
}

/// Volume expansion on counter-trend candles.
pub struct VolumeSurge {
    pub lookback: usize,
}

impl Default for VolumeSurge {
    fn default() -> Self {
        VolumeSurge { lookback: 20 }
    }
}

impl ReversalSignal for VolumeSurge {
    fn score(&self, candles: &[Candle], side: PositionSide) -> f64 {
        if candles.len() < 2 {
            return 0.0;
        }
        let last = &candles[candles.len() - 1];
        let last_against = match side {
            PositionSide::Long => !last.is_bullish(),
            PositionSide::Short => last.is_bullish(),
        };
        if !last_against {
            return 0.0;
        }
        let prior: Vec<f64> = candles
            .iter()
            .rev()
            .skip(1)
            .take(self.lookback)
            .map(|c| c.volume)
            .collect();
        let avg = prior.iter().sum::<f64>() / prior.len() as f64;
        if avg <= 0.0 {
            // test networks report zero volume
            return 0.0;
        }
        let ratio = last.volume / avg;
        ((ratio - 1.0) * 50.0).clamp(0.0, 100.0)
    }

    fn name(&self) -> &'static str {
        "volume"
    }

    fn weight(&self) -> f64 {
        0.5
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ReversalAssessment {
    /// Fast-timeframe composite, drives emergency closes at >= 70.
    pub reversal_score: f64,
    /// Slow-timeframe composite, surfaced to the decision provider.
    pub warning_score: f64,
    pub warning: bool,
    pub emergency: bool,
}

pub struct ReversalScorer {
    signals: Vec<Box<dyn ReversalSignal>>,
    pub warning_threshold: f64,
    pub emergency_threshold: f64,
}

impl ReversalScorer {
    pub fn new(signals: Vec<Box<dyn ReversalSignal>>) -> Self {
        ReversalScorer {
            signals,
            warning_threshold: 40.0,
            emergency_threshold: 70.0,
        }
    }

    pub fn standard() -> Self {
        Self::new(vec![
            Box::new(MomentumReversal::default()),
            Box::new(PriceActionReversal::default()),
            Box::new(VolumeSurge::default()),
        ])
    }

    /// Weighted composite over one candle series, in [0, 100].
    pub fn composite(&self, candles: &[Candle], side: PositionSide) -> f64 {
        let mut weighted = 0.0;
        let mut total_weight = 0.0;
        for signal in &self.signals {
            weighted += signal.score(candles, side) * signal.weight();
            total_weight += signal.weight();
        }
        if total_weight == 0.0 {
            return 0.0;
        }
        (weighted / total_weight).clamp(0.0, 100.0)
    }

    /// Assess a position from a fast series (reversal) and a slow series
    /// (early warning).
    pub fn assess(
        &self,
        fast_candles: &[Candle],
        slow_candles: &[Candle],
        side: PositionSide,
    ) -> ReversalAssessment {
        let reversal_score = self.composite(fast_candles, side);
        let warning_score = self.composite(slow_candles, side);
        ReversalAssessment {
            reversal_score,
            warning_score,
            warning: warning_score >= self.warning_threshold
                || reversal_score >= self.warning_threshold,
            emergency: reversal_score >= self.emergency_threshold
                || warning_score >= self.emergency_threshold,
        }
    }
}

/// Directional trend strength in [-100, 100]: positive favors longs,
/// negative favors shorts. Used to rank opening opportunities.
pub fn trend_strength(candles: &[Candle]) -> f64 {
    if candles.len() < 25 {
        return 0.0;
    }
    let mut score = 0.0;

    let rsi = Rsi::new(14).calculate(candles);
    if let Some(&last) = rsi.last() {
        score += (last - 50.0) * 1.2;
    }

    let fast = Ema::new(9).calculate(candles);
    let slow = Ema::new(21).calculate(candles);
    if let (Some(&f), Some(&s)) = (fast.last(), slow.last()) {
        if s != 0.0 {
            score += ((f - s) / s * 100.0).clamp(-40.0, 40.0) * 10.0;
        }
    }

    score.clamp(-100.0, 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn candle(open: f64, close: f64, volume: f64) -> Candle {
        Candle {
            timestamp: Utc::now(),
            open,
            high: open.max(close) + 0.5,
            low: open.min(close) - 0.5,
            close,
            volume,
        }
    }

    fn downtrend(n: usize) -> Vec<Candle> {
        (0..n)
            .map(|i| {
                let base = 200.0 - i as f64 * 2.0;
                candle(base, base - 1.5, 1000.0)
            })
            .collect()
    }

    fn uptrend(n: usize) -> Vec<Candle> {
        (0..n)
            .map(|i| {
                let base = 100.0 + i as f64 * 2.0;
                candle(base, base + 1.5, 1000.0)
            })
            .collect()
    }

    #[test]
    fn test_downtrend_threatens_long() {
        let scorer = ReversalScorer::standard();
        let candles = downtrend(40);
        let against_long = scorer.composite(&candles, PositionSide::Long);
        let against_short = scorer.composite(&candles, PositionSide::Short);
        assert!(against_long > 60.0, "got {}", against_long);
        assert!(against_short < against_long);
    }

    #[test]
    fn test_uptrend_threatens_short() {
        let scorer = ReversalScorer::standard();
        let candles = uptrend(40);
        let against_short = scorer.composite(&candles, PositionSide::Short);
        assert!(against_short > 60.0, "got {}", against_short);
    }

    #[test]
    fn test_assessment_flags() {
        let scorer = ReversalScorer::standard();
        let fast = downtrend(40);
        let slow = downtrend(40);
        let assessment = scorer.assess(&fast, &slow, PositionSide::Long);
        assert!(assessment.emergency);
        assert!(assessment.warning);
        assert!(assessment.reversal_score >= 70.0);
    }

    #[test]
    fn test_scores_bounded() {
        let scorer = ReversalScorer::standard();
        for candles in [downtrend(40), uptrend(40), vec![]] {
            for side in [PositionSide::Long, PositionSide::Short] {
                let s = scorer.composite(&candles, side);
                assert!((0.0..=100.0).contains(&s));
            }
        }
    }

    #[test]
    fn test_volume_surge_ignores_zero_volume_networks() {
        let signal = VolumeSurge::default();
        let mut candles = downtrend(30);
        for c in &mut candles {
            c.volume = 0.0;
        }
        assert_eq!(signal.score(&candles, PositionSide::Long), 0.0);
    }

    #[test]
    fn test_trend_strength_direction() {
        assert!(trend_strength(&uptrend(40)) > 30.0);
        assert!(trend_strength(&downtrend(40)) < -30.0);
        assert_eq!(trend_strength(&uptrend(10)), 0.0);
    }
}
