//! Fill price model for simulated execution.
//!
//! Fills cross the spread, pay slippage and pay taker fees. Buys fill off
//! the ask and get worse as slippage and fees stack up; sells mirror off the
//! bid. Percentages are supplied in human units (0.1 means 0.1%).

#[derive(Debug, Clone, Copy)]
pub struct ExecutionPriceModel {
    slippage: f64,
    taker_fee: f64,
}

impl ExecutionPriceModel {
    pub fn new(slippage_pct: f64, taker_fee_pct: f64) -> Self {
        Self {
            slippage: slippage_pct / 100.0,
            taker_fee: taker_fee_pct / 100.0,
        }
    }

    /// Executed price for a market buy against `ask`
    pub fn fill_buy(&self, ask: f64) -> f64 {
        ask * (1.0 + self.slippage) * (1.0 + self.taker_fee)
    }

    /// Executed price for a market sell against `bid`
    pub fn fill_sell(&self, bid: f64) -> f64 {
        bid * (1.0 - self.slippage) * (1.0 - self.taker_fee)
    }
}
