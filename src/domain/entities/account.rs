use serde::{Deserialize, Serialize};

/// Account snapshot as reported by the venue. `total` excludes unrealized
/// PnL; consumers that want equity add `unrealized_pnl` back.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountSummary {
    pub total: f64,
    pub available: f64,
    pub position_margin: f64,
    pub unrealized_pnl: f64,
}

impl AccountSummary {
    pub fn equity(&self) -> f64 {
        self.total + self.unrealized_pnl
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equity_adds_unrealized() {
        let account = AccountSummary {
            total: 1000.0,
            available: 700.0,
            position_margin: 300.0,
            unrealized_pnl: -50.0,
        };
        assert!((account.equity() - 950.0).abs() < 1e-9);
    }
}
