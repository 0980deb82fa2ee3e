//! Stop-condition precedence. §4.F "Stop-condition precedence".

use rust_decimal::prelude::*;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::position::{Ledger, Position};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Liquidated,
    EquityFloorHit,
    MaxDrawdownHit,
    StrategyStarved,
}

impl StopReason {
    /// `Liquidated`/`EquityFloorHit`/`MaxDrawdownHit` force-close and halt
    /// the run; `StrategyStarved` only disables new entries.
    pub fn is_terminal(self) -> bool {
        !matches!(self, StopReason::StrategyStarved)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StopCheckResult {
    pub reason: StopReason,
}

/// Evaluated at each exec bar close, after fills, before signal
/// evaluation. Checks in precedence order and returns on the first match.
pub fn check_all_stop_conditions(
    ledger: &Ledger,
    position: Option<&Position>,
    mark: f64,
    mm_deduction: f64,
    max_leverage: f64,
    stop_equity_usdt: f64,
    max_drawdown_pct: f64,
    min_trade_notional_usdt: f64,
) -> Option<StopCheckResult> {
    let equity = ledger.equity(position, mark);

    if let Some(pos) = position {
        let maintenance_margin = pos.maintenance_margin(mm_deduction);
        if equity <= maintenance_margin {
            return Some(StopCheckResult { reason: StopReason::Liquidated });
        }
    }

    let floor = Decimal::from_f64(stop_equity_usdt).unwrap_or_default();
    if equity <= floor {
        return Some(StopCheckResult { reason: StopReason::EquityFloorHit });
    }

    if max_drawdown_pct > 0.0 && ledger.peak_equity > Decimal::ZERO {
        let drawdown = (ledger.peak_equity - equity) / ledger.peak_equity;
        let threshold = Decimal::from_f64(max_drawdown_pct).unwrap_or_default();
        if drawdown >= threshold {
            return Some(StopCheckResult { reason: StopReason::MaxDrawdownHit });
        }
    }

    let available = ledger.available_balance(position, mark, max_leverage);
    let imr = 1.0 / max_leverage;
    let required = Decimal::from_f64(min_trade_notional_usdt * imr).unwrap_or_default();
    if available < required {
        return Some(StopCheckResult { reason: StopReason::StrategyStarved });
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::position::Side;

    fn long_position() -> Position {
        Position {
            side: Side::Long,
            size_usdt: 100_000.0,
            qty: 1_000.0,
            entry_price: 100.0,
            stop_loss: Some(95.0),
            take_profit: Some(105.0),
            opened_at_ts: 0,
            favorable_extreme: 100.0,
            break_even_applied: false,
        }
    }

    #[test]
    fn liquidation_takes_precedence_over_equity_floor() {
        let ledger = Ledger::new(10_000.0);
        let pos = long_position();
        let result = check_all_stop_conditions(&ledger, Some(&pos), 89.5, 0.0, 10.0, 0.0, 0.3, 10.0).unwrap();
        assert_eq!(result.reason, StopReason::Liquidated);
    }

    #[test]
    fn equity_floor_fires_when_no_position_is_at_risk_of_liquidation() {
        let mut ledger = Ledger::new(1_000.0);
        ledger.cash = Decimal::from_f64(400.0).unwrap();
        let result = check_all_stop_conditions(&ledger, None, 100.0, 0.0, 10.0, 500.0, 0.3, 10.0).unwrap();
        assert_eq!(result.reason, StopReason::EquityFloorHit);
    }

    #[test]
    fn no_stop_when_healthy() {
        let ledger = Ledger::new(10_000.0);
        let result = check_all_stop_conditions(&ledger, None, 100.0, 0.0, 10.0, 0.0, 0.3, 10.0);
        assert!(result.is_none());
    }

    #[test]
    fn starvation_is_non_terminal() {
        assert!(!StopReason::StrategyStarved.is_terminal());
        assert!(StopReason::Liquidated.is_terminal());
    }
}
