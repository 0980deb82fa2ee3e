//! Run artifacts: trades table, equity curve, account curve, metrics
//! summary. §6.4.

use rust_decimal::prelude::*;
use serde::{Deserialize, Serialize};

use crate::data_quality::DataQualityReport;
use crate::exchange::{RejectedOrder, StopReason, Trade};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub ts: i64,
    pub equity: f64,
    pub mark_price: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AccountPoint {
    pub ts: i64,
    pub cash: f64,
    pub used_margin: f64,
    pub available_balance: f64,
}

/// Summary stats computed once over the finished equity curve and trades
/// table, not maintained incrementally during the hot loop.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct MetricsSummary {
    pub total_return_pct: f64,
    pub max_drawdown_pct: f64,
    pub num_trades: usize,
    pub win_rate_pct: f64,
    pub profit_factor: f64,
    pub avg_trade_pnl: f64,
}

impl MetricsSummary {
    pub fn compute(starting_equity: f64, equity_curve: &[EquityPoint], trades: &[Trade]) -> Self {
        let ending_equity = equity_curve.last().map(|p| p.equity).unwrap_or(starting_equity);
        let total_return_pct = if starting_equity > 0.0 {
            (ending_equity - starting_equity) / starting_equity * 100.0
        } else {
            0.0
        };

        let mut peak = f64::NEG_INFINITY;
        let mut max_dd = 0.0;
        for point in equity_curve {
            peak = peak.max(point.equity);
            if peak > 0.0 {
                max_dd = f64::max(max_dd, (peak - point.equity) / peak);
            }
        }

        let pnls: Vec<f64> = trades.iter().map(|t| t.realized_pnl.to_f64().unwrap_or(0.0)).collect();
        let num_trades = trades.len();
        let wins = pnls.iter().filter(|&&p| p > 0.0).count();
        let win_rate_pct = if num_trades > 0 { wins as f64 / num_trades as f64 * 100.0 } else { 0.0 };

        let gross_profit: f64 = pnls.iter().filter(|&&p| p > 0.0).sum();
        let gross_loss: f64 = pnls.iter().filter(|&&p| p < 0.0).map(|p| p.abs()).sum();
        let profit_factor = if gross_loss > 0.0 {
            gross_profit / gross_loss
        } else if gross_profit > 0.0 {
            f64::INFINITY
        } else {
            0.0
        };

        let avg_trade_pnl = if num_trades > 0 { pnls.iter().sum::<f64>() / num_trades as f64 } else { 0.0 };

        Self {
            total_return_pct,
            max_drawdown_pct: max_dd * 100.0,
            num_trades,
            win_rate_pct,
            profit_factor,
            avg_trade_pnl,
        }
    }
}

/// Everything a finished run hands back to the caller. §6.4 "Run artifacts".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub trades: Vec<Trade>,
    pub equity_curve: Vec<EquityPoint>,
    pub account_curve: Vec<AccountPoint>,
    pub rejected_orders: Vec<RejectedOrder>,
    pub terminal_stop: Option<StopReason>,
    pub metrics: MetricsSummary,
    pub data_quality: DataQualityReport,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::Side;
    use rust_decimal_macros::dec;

    fn trade(pnl: rust_decimal::Decimal) -> Trade {
        Trade {
            side: Side::Long,
            entry_price: 100.0,
            exit_price: 105.0,
            qty: 1.0,
            size_usdt: 100.0,
            entry_ts: 0,
            exit_ts: 60_000,
            fees_paid: dec!(0.1),
            realized_pnl: pnl,
            exit_reason: "signal".into(),
        }
    }

    #[test]
    fn total_return_and_drawdown_track_the_equity_curve() {
        let curve = vec![
            EquityPoint { ts: 0, equity: 1_000.0, mark_price: 100.0 },
            EquityPoint { ts: 1, equity: 1_200.0, mark_price: 105.0 },
            EquityPoint { ts: 2, equity: 900.0, mark_price: 95.0 },
        ];
        let metrics = MetricsSummary::compute(1_000.0, &curve, &[]);
        assert_eq!(metrics.total_return_pct, -10.0);
        assert!((metrics.max_drawdown_pct - 25.0).abs() < 1e-9);
    }

    #[test]
    fn win_rate_and_profit_factor_split_wins_from_losses() {
        let trades = vec![trade(dec!(100)), trade(dec!(-50)), trade(dec!(25))];
        let metrics = MetricsSummary::compute(1_000.0, &[], &trades);
        assert_eq!(metrics.num_trades, 3);
        assert!((metrics.win_rate_pct - (2.0 / 3.0 * 100.0)).abs() < 1e-9);
        assert_eq!(metrics.profit_factor, 125.0 / 50.0);
    }

    #[test]
    fn zero_trades_is_a_well_defined_empty_summary() {
        let metrics = MetricsSummary::compute(1_000.0, &[], &[]);
        assert_eq!(metrics.num_trades, 0);
        assert_eq!(metrics.win_rate_pct, 0.0);
        assert_eq!(metrics.profit_factor, 0.0);
    }
}
