//! Position sizing and pre-trade checks.

use crate::config::{RiskCfg, RiskTier};
use crate::error::TradeError;

pub struct RiskEngine {
    tiers: Vec<RiskTier>,
    low_delta_bump: Option<f64>,
    max_position_value: Option<f64>,
}

impl RiskEngine {
    pub fn new(cfg: &RiskCfg) -> Self {
        Self {
            tiers: cfg.tiers.clone(),
            low_delta_bump: cfg.low_delta_bump,
            max_position_value: cfg.max_position_value,
        }
    }

    /// First tier whose inclusive upper bound covers the balance. Falls back
    /// to the last tier when every bound is exceeded.
    pub fn risk_fraction(&self, balance: f64) -> f64 {
        self.tiers
            .iter()
            .find(|t| t.up_to.map_or(true, |cap| balance <= cap))
            .or_else(|| self.tiers.last())
            .map_or(0.0, |t| t.fraction)
    }

    /// `floor(balance * fraction / (|delta| * 100 / 2))`, plus one contract
    /// for low-delta picks. Zero means "selected but not sized to trade".
    pub fn size(&self, balance: f64, delta: f64) -> u32 {
        let abs_delta = delta.abs();
        if !abs_delta.is_finite() || abs_delta == 0.0 || balance <= 0.0 {
            return 0;
        }
        let risk_amount = balance * self.risk_fraction(balance);
        let per_contract = abs_delta * 100.0 / 2.0;
        let base = (risk_amount / per_contract).floor().max(0.0) as u32;
        match self.low_delta_bump {
            Some(threshold) if base > 0 && abs_delta < threshold => base + 1,
            _ => base,
        }
    }

    pub fn pre_check(&self, quantity: u32, limit_price: f64) -> Result<(), TradeError> {
        let Some(cap) = self.max_position_value else {
            return Ok(());
        };
        let notional = limit_price * quantity as f64 * 100.0;
        if notional > cap {
            return Err(TradeError::RiskRejected(format!(
                "order notional ${notional:.2} exceeds max_position_value ${cap:.2}"
            )));
        }
        Ok(())
    }
}
