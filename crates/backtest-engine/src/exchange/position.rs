//! Position and ledger state. §3 "Position"/"Ledger", §4.F isolated-margin
//! USDT accounting.

use rust_decimal::prelude::*;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Maintenance margin rate. No shipped Play field configures this; it is a
/// fixed tier-1-style constant, matching the BTCUSDT perpetual tier most
/// backtests target. See DESIGN.md Open Question decisions.
pub const MAINTENANCE_MARGIN_RATE: f64 = 0.005;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn sign(self) -> f64 {
        match self {
            Side::Long => 1.0,
            Side::Short => -1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub side: Side,
    pub size_usdt: f64,
    pub qty: f64,
    pub entry_price: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub opened_at_ts: i64,
    /// Best price seen in the profitable direction since entry. Seeds to
    /// `entry_price`; drives trailing-stop/break-even evaluation.
    pub favorable_extreme: f64,
    /// Break-even only ever fires once per position.
    pub break_even_applied: bool,
}

impl Position {
    /// `initial margin = size_usdt x IMR`, `IMR = 1 / max_leverage`. §3.
    pub fn used_margin(&self, max_leverage: f64) -> Decimal {
        let imr = 1.0 / max_leverage;
        Decimal::from_f64(self.size_usdt * imr).unwrap_or(Decimal::ZERO)
    }

    /// `maintenance margin = size_usdt x MMR - mm_deduction`, floored at 0.
    pub fn maintenance_margin(&self, mm_deduction: f64) -> Decimal {
        let raw = self.size_usdt * MAINTENANCE_MARGIN_RATE - mm_deduction;
        Decimal::from_f64(raw.max(0.0)).unwrap_or(Decimal::ZERO)
    }

    /// `unrealized_pnl = (mark - entry) x qty` for long, negated for short.
    pub fn unrealized_pnl(&self, mark: f64) -> Decimal {
        let diff = (mark - self.entry_price) * self.qty * self.side.sign();
        Decimal::from_f64(diff).unwrap_or(Decimal::ZERO)
    }

    pub fn position_value(&self, mark: f64) -> Decimal {
        Decimal::from_f64(self.qty.abs() * mark).unwrap_or(Decimal::ZERO)
    }
}

/// Isolated-margin USDT ledger for one symbol. §3 "Ledger". Invariant:
/// `equity = cash + unrealized_pnl_mark`; `cash` only changes on fills and
/// funding.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Ledger {
    pub cash: Decimal,
    pub peak_equity: Decimal,
}

impl Ledger {
    pub fn new(starting_equity_usdt: f64) -> Self {
        let cash = Decimal::from_f64(starting_equity_usdt).unwrap_or(Decimal::ZERO);
        Self { cash, peak_equity: cash }
    }

    pub fn equity(&self, position: Option<&Position>, mark: f64) -> Decimal {
        let unrealized = position.map(|p| p.unrealized_pnl(mark)).unwrap_or(Decimal::ZERO);
        self.cash + unrealized
    }

    pub fn record_cash_delta(&mut self, delta: Decimal) {
        self.cash += delta;
    }

    pub fn track_peak(&mut self, equity: Decimal) {
        if equity > self.peak_equity {
            self.peak_equity = equity;
        }
    }

    pub fn free_margin(&self, position: Option<&Position>, mark: f64, max_leverage: f64) -> Decimal {
        let used = position.map(|p| p.used_margin(max_leverage)).unwrap_or(Decimal::ZERO);
        self.equity(position, mark) - used
    }

    pub fn available_balance(&self, position: Option<&Position>, mark: f64, max_leverage: f64) -> Decimal {
        self.free_margin(position, mark, max_leverage).max(Decimal::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

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
    fn used_margin_is_size_over_leverage() {
        let pos = long_position();
        assert_eq!(pos.used_margin(10.0), dec!(10000));
    }

    #[test]
    fn maintenance_margin_applies_rate_and_deduction() {
        let pos = long_position();
        assert_eq!(pos.maintenance_margin(0.0), dec!(500.00));
        assert_eq!(pos.maintenance_margin(600.0), Decimal::ZERO);
    }

    #[test]
    fn short_unrealized_pnl_is_negated() {
        let mut pos = long_position();
        pos.side = Side::Short;
        let pnl = pos.unrealized_pnl(95.0);
        assert_eq!(pnl, dec!(5000));
    }

    #[test]
    fn equity_reflects_unrealized_pnl_against_the_mark() {
        let ledger = Ledger::new(10_000.0);
        let pos = long_position();
        let equity = ledger.equity(Some(&pos), 89.5);
        assert_eq!(equity, dec!(10000) + dec!(-10500));
    }

    #[test]
    fn liquidation_threshold_matches_spec_s3_example() {
        let ledger = Ledger::new(10_000.0);
        let pos = long_position();
        let equity = ledger.equity(Some(&pos), 89.5);
        let mm = pos.maintenance_margin(0.0);
        assert!(equity <= mm);
    }
}
