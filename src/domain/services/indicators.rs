use crate::domain::entities::candle::Candle;

pub trait Indicator {
    fn calculate(&self, candles: &[Candle]) -> Vec<f64>;
}

pub struct Ema {
    pub period: usize,
}

impl Ema {
    pub fn new(period: usize) -> Self {
        Ema { period }
    }

    pub fn calculate_on_values(&self, values: &[f64]) -> Vec<f64> {
        if values.is_empty() || self.period == 0 {
            return vec![];
        }
        let mut ema_values = Vec::with_capacity(values.len());
        let multiplier = 2.0 / (self.period as f64 + 1.0);

        // First EMA is the SMA of the seed window
        let seed = self.period.min(values.len());
        let mut ema = values[..seed].iter().sum::<f64>() / seed as f64;
        ema_values.push(ema);

        for &val in values.iter().skip(self.period) {
            ema = (val - ema) * multiplier + ema;
            ema_values.push(ema);
        }

        ema_values
    }
}

impl Indicator for Ema {
    fn calculate(&self, candles: &[Candle]) -> Vec<f64> {
        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        self.calculate_on_values(&closes)
    }
}

pub struct Rsi {
    pub period: usize,
}

impl Rsi {
    pub fn new(period: usize) -> Self {
        Rsi { period }
    }
}

impl Indicator for Rsi {
    fn calculate(&self, candles: &[Candle]) -> Vec<f64> {
        if candles.len() < self.period + 1 {
            return vec![];
        }
        let mut gains = Vec::new();
        let mut losses = Vec::new();

        for i in 1..candles.len() {
            let change = candles[i].close - candles[i - 1].close;
            if change > 0.0 {
                gains.push(change);
                losses.push(0.0);
            } else {
                gains.push(0.0);
                losses.push(change.abs());
            }
        }

        let mut rsi_values = Vec::new();
        for i in (self.period - 1)..gains.len() {
            let avg_gain = gains[i + 1 - self.period..=i].iter().sum::<f64>() / self.period as f64;
            let avg_loss = losses[i + 1 - self.period..=i].iter().sum::<f64>() / self.period as f64;
            let rs = if avg_loss == 0.0 {
                100.0
            } else {
                avg_gain / avg_loss
            };
            rsi_values.push(100.0 - (100.0 / (1.0 + rs)));
        }

        rsi_values
    }
}

/// Average true range over the trailing `period` candles.
pub fn atr(candles: &[Candle], period: usize) -> Option<f64> {
    if candles.len() < period + 1 || period == 0 {
        return None;
    }
    let start = candles.len() - period;
    let sum: f64 = (start..candles.len())
        .map(|i| candles[i].true_range(candles[i - 1].close))
        .sum();
    Some(sum / period as f64)
}

/// Lowest low over the trailing `lookback` candles, a cheap support proxy.
pub fn swing_low(candles: &[Candle], lookback: usize) -> Option<f64> {
    let window = candles.iter().rev().take(lookback);
    window.map(|c| c.low).fold(None, |acc, low| match acc {
        Some(min) if min <= low => Some(min),
        _ => Some(low),
    })
}

/// Highest high over the trailing `lookback` candles, a cheap resistance
/// proxy.
pub fn swing_high(candles: &[Candle], lookback: usize) -> Option<f64> {
    let window = candles.iter().rev().take(lookback);
    window.map(|c| c.high).fold(None, |acc, high| match acc {
        Some(max) if max >= high => Some(max),
        _ => Some(high),
    })
}
