//! Fixed-fraction position sizing against a simulated balance.

use tracing::info;

#[derive(Debug, Clone)]
pub struct RiskManager {
    balance: f64,
    risk_percent: f64,
}

impl RiskManager {
    pub fn new(starting_balance: f64, risk_percent: f64) -> Self {
        Self {
            balance: starting_balance,
            risk_percent,
        }
    }

    pub fn balance(&self) -> f64 {
        self.balance
    }

    /// Quantity such that the committed notional is `risk_percent` of the
    /// current balance
    pub fn position_size(&self, price: f64) -> f64 {
        if price <= 0.0 {
            return 0.0;
        }
        self.balance * (self.risk_percent / 100.0) / price
    }

    /// Apply realized PnL to the balance
    pub fn apply_pnl(&mut self, pnl: f64) {
        self.balance += pnl;
        info!(pnl = %format!("{pnl:+.2}"), balance = %format!("{:.2}", self.balance), "balance updated");
    }

    /// Overwrite the balance (used when restoring persisted state)
    pub fn set_balance(&mut self, balance: f64) {
        self.balance = balance;
    }
}
