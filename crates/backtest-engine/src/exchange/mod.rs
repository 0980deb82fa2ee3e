//! Simulated Exchange: the isolated-margin USDT linear-perpetual
//! simulator. §4.F.

pub mod fees;
pub mod intrabar;
pub mod order;
pub mod position;
pub mod stops;
pub mod trailing;

use backtest_types::Bar;
use rust_decimal::prelude::*;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::play::{AccountConfig, RiskConfig};
use intrabar::{resolve_intrabar_exit, ExitReason};
use order::{fill_pending, submit_order, PendingOrder};
use stops::check_all_stop_conditions;
use trailing::apply_trailing_and_break_even;

pub use order::{RejectReason, RejectedOrder};
pub use position::{Ledger, Position, Side};
pub use stops::StopReason;

/// A closed round trip. One of §6.4's "Run artifacts".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub side: Side,
    pub entry_price: f64,
    pub exit_price: f64,
    pub qty: f64,
    pub size_usdt: f64,
    pub entry_ts: i64,
    pub exit_ts: i64,
    pub fees_paid: Decimal,
    pub realized_pnl: Decimal,
    pub exit_reason: String,
}

/// Owns the per-symbol order/position/ledger state for one run. Bar
/// Processor-driven: every mutating method takes the 1m tick that triggers
/// it, never a wall-clock timestamp.
pub struct Exchange {
    account: AccountConfig,
    risk: RiskConfig,
    ledger: Ledger,
    position: Option<Position>,
    pending: Option<PendingOrder>,
    pub entries_disabled: bool,
    pub rejected_orders: Vec<RejectedOrder>,
    pub trades: Vec<Trade>,
    last_funding_ts: Option<i64>,
}

impl Exchange {
    pub fn new(account: AccountConfig, risk: RiskConfig) -> Self {
        let ledger = Ledger::new(account.starting_equity_usdt);
        Self {
            account,
            risk,
            ledger,
            position: None,
            pending: None,
            entries_disabled: false,
            rejected_orders: Vec::new(),
            trades: Vec::new(),
            last_funding_ts: None,
        }
    }

    pub fn position(&self) -> Option<&Position> {
        self.position.as_ref()
    }

    pub fn has_pending_order(&self) -> bool {
        self.pending.is_some()
    }

    pub fn equity(&self, mark: f64) -> Decimal {
        self.ledger.equity(self.position.as_ref(), mark)
    }

    pub fn available_balance(&self, mark: f64) -> Decimal {
        self.ledger.available_balance(self.position.as_ref(), mark, self.account.max_leverage)
    }

    pub fn cash(&self) -> Decimal {
        self.ledger.cash
    }

    pub fn used_margin(&self) -> Decimal {
        self.position.map(|p| p.used_margin(self.account.max_leverage)).unwrap_or(Decimal::ZERO)
    }

    /// `None -> Pending`. Rejected when a position or a pending order
    /// already exists, or the order would not clear the entry gate.
    pub fn submit_entry(
        &mut self,
        side: Side,
        size_usdt: f64,
        stop_loss: Option<f64>,
        take_profit: Option<f64>,
        ts: i64,
        mark_price: f64,
    ) -> Result<(), RejectReason> {
        if self.entries_disabled {
            self.rejected_orders.push(RejectedOrder { reason: RejectReason::EntriesDisabled, ts });
            return Err(RejectReason::EntriesDisabled);
        }
        if self.position.is_some() || self.pending.is_some() {
            self.rejected_orders.push(RejectedOrder { reason: RejectReason::PositionAlreadyOpen, ts });
            return Err(RejectReason::PositionAlreadyOpen);
        }
        let mut gated_size = size_usdt;
        if self.account.include_est_close_fee_in_entry_gate {
            let notional = Decimal::from_f64(size_usdt).unwrap_or_default();
            let est_close_fee = fees::taker_fee(&self.account.fee_model, notional).to_f64().unwrap_or(0.0);
            gated_size += est_close_fee;
        }
        let available = self.available_balance(mark_price);
        match submit_order(side, gated_size, stop_loss, take_profit, ts, &self.account, available, mark_price) {
            Ok(pending) => {
                self.pending = Some(PendingOrder { size_usdt, ..pending });
                Ok(())
            }
            Err(rejected) => {
                self.rejected_orders.push(rejected);
                Err(rejected.reason)
            }
        }
    }

    /// Cancels a pending order without a fill. No-op if none exists.
    pub fn cancel_pending(&mut self) {
        self.pending = None;
    }

    /// Runs one 1m tick: fills a pending order at this bar's open, then
    /// resolves intrabar TP/SL against this bar's range. At most one of
    /// fill/exit happens per call, matching one bar's worth of price
    /// action.
    pub fn step_1m(&mut self, bar: &Bar) {
        if let Some(pending) = self.pending.take() {
            let (position, fee) = fill_pending(pending, bar.open, bar.ts_open, &self.account);
            self.ledger.record_cash_delta(-fee);
            self.position = Some(position);
        }

        if let Some(position) = self.position {
            if let Some(exit) = resolve_intrabar_exit(&position, bar.high, bar.low) {
                let reason = match exit.reason {
                    ExitReason::StopLoss => "stop_loss",
                    ExitReason::TakeProfit => "take_profit",
                };
                self.close_position(exit.price, bar.ts_close, reason);
            }
        }

        if let Some(position) = self.position.as_mut() {
            apply_trailing_and_break_even(
                position,
                bar.high,
                bar.low,
                self.risk.trailing_config,
                self.risk.break_even_config,
            );
        }
    }

    /// Applies a funding payment at its scheduled timestamp if it falls in
    /// `(prev_ts, ts]` and hasn't already been applied.
    pub fn apply_funding_if_due(&mut self, funding_ts: i64, rate: f64, prev_ts: i64, ts: i64, mark: f64) {
        if !(funding_ts > prev_ts && funding_ts <= ts) {
            return;
        }
        if self.last_funding_ts == Some(funding_ts) {
            return;
        }
        if let Some(position) = self.position {
            let signed_rate = rate * position.side.sign();
            let payment = position.position_value(mark) * Decimal::from_f64(signed_rate).unwrap_or_default();
            self.ledger.record_cash_delta(-payment);
        }
        self.last_funding_ts = Some(funding_ts);
    }

    /// Closes the open position at `price`, realizing pnl and fees into
    /// cash and recording a `Trade`. No-op if no position is open.
    pub fn close_position(&mut self, price: f64, ts: i64, reason: &str) {
        let Some(position) = self.position.take() else { return };
        let notional = Decimal::from_f64(position.qty.abs() * price).unwrap_or_default();
        let exit_fee = fees::taker_fee(&self.account.fee_model, notional);
        let pnl = position.unrealized_pnl(price);
        self.ledger.record_cash_delta(pnl - exit_fee);

        let entry_notional = Decimal::from_f64(position.size_usdt).unwrap_or_default();
        let entry_fee = fees::taker_fee(&self.account.fee_model, entry_notional);
        self.trades.push(Trade {
            side: position.side,
            entry_price: position.entry_price,
            exit_price: price,
            qty: position.qty,
            size_usdt: position.size_usdt,
            entry_ts: position.opened_at_ts,
            exit_ts: ts,
            fees_paid: entry_fee + exit_fee,
            realized_pnl: pnl - exit_fee,
            exit_reason: reason.to_string(),
        });
    }

    /// Checked at each exec bar close, after fills, before signal
    /// evaluation. Records a `StopReason::StrategyStarved` by flipping
    /// `entries_disabled`; terminal reasons are the caller's responsibility
    /// to act on (force-close + halt).
    pub fn check_stops(&mut self, mark: f64) -> Option<StopReason> {
        let equity = self.ledger.equity(self.position.as_ref(), mark);
        self.ledger.track_peak(equity);
        let result = check_all_stop_conditions(
            &self.ledger,
            self.position.as_ref(),
            mark,
            self.account.mm_deduction,
            self.account.max_leverage,
            self.account.stop_equity_usdt,
            self.account.max_drawdown_pct,
            self.account.min_trade_notional_usdt,
        )?;
        if result.reason == StopReason::StrategyStarved {
            self.entries_disabled = true;
            self.cancel_pending();
        }
        Some(result.reason)
    }

    /// Cancels pending orders and force-closes any open position at
    /// `price`, tagged with the terminal stop's reason.
    pub fn handle_terminal_stop(&mut self, price: f64, ts: i64, reason: StopReason) {
        self.cancel_pending();
        let tag = match reason {
            StopReason::Liquidated => "liquidated",
            StopReason::EquityFloorHit => "equity_floor_hit",
            StopReason::MaxDrawdownHit => "max_drawdown_hit",
            StopReason::StrategyStarved => "strategy_starved",
        };
        self.close_position(price, ts, tag);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account() -> AccountConfig {
        AccountConfig {
            starting_equity_usdt: 10_000.0,
            max_leverage: 10.0,
            max_drawdown_pct: 0.3,
            stop_equity_usdt: 0.0,
            fee_model: crate::play::FeeModel { taker_bps: 6.0, maker_bps: 2.0 },
            slippage_bps: 2.0,
            min_trade_notional_usdt: 10.0,
            margin_mode: "isolated_usdt".into(),
            mm_deduction: 0.0,
            risk_per_trade_pct: None,
            on_sl_beyond_liq: crate::play::OnSlBeyondLiq::Reject,
            include_est_close_fee_in_entry_gate: false,
        }
    }

    fn risk() -> RiskConfig {
        RiskConfig {
            stop_loss_pct: 0.02,
            take_profit_pct: 0.04,
            max_position_pct: 0.5,
            trailing_config: None,
            break_even_config: None,
        }
    }

    fn bar(ts_open: i64, open: f64, high: f64, low: f64, close: f64) -> Bar {
        Bar { ts_open, ts_close: ts_open + 60_000, open, high, low, close, volume: 1.0 }
    }

    #[test]
    fn s2_tp_before_sl_tie_break_realizes_sl_and_fees() {
        let mut exchange = Exchange::new(account(), risk());
        exchange.submit_entry(Side::Long, 10_000.0, Some(95.0), Some(105.0), 0, 100.0).unwrap();
        exchange.step_1m(&bar(0, 99.0, 106.0, 94.0, 101.0));
        let trade = exchange.trades.last().expect("fill and SL/TP tie-break resolve within the same tick");
        assert_eq!(trade.exit_reason, "stop_loss");
        assert_eq!(trade.exit_price, 95.0);
        assert!(trade.realized_pnl < Decimal::ZERO);
    }

    #[test]
    fn second_entry_attempt_while_pending_is_rejected() {
        let mut exchange = Exchange::new(account(), risk());
        exchange.submit_entry(Side::Long, 1_000.0, None, None, 0, 100.0).unwrap();
        let err = exchange.submit_entry(Side::Long, 1_000.0, None, None, 0, 100.0);
        assert!(err.is_err());
    }

    #[test]
    fn s3_liquidation_classification_takes_precedence_over_floor() {
        let mut exchange = Exchange::new(account(), risk());
        exchange.submit_entry(Side::Long, 100_000.0, None, None, 0, 100.0).unwrap();
        exchange.step_1m(&bar(0, 100.0, 100.0, 100.0, 100.0));
        let reason = exchange.check_stops(89.5);
        assert_eq!(reason, Some(StopReason::Liquidated));
    }

    #[test]
    fn close_position_records_realized_pnl_net_of_fees() {
        let mut exchange = Exchange::new(account(), risk());
        exchange.submit_entry(Side::Long, 10_000.0, None, None, 0, 100.0).unwrap();
        exchange.step_1m(&bar(0, 100.0, 100.0, 100.0, 100.0));
        exchange.close_position(105.0, 60_000, "signal");
        let trade = exchange.trades.last().unwrap();
        assert!(trade.realized_pnl > Decimal::ZERO);
        assert!(trade.fees_paid > Decimal::ZERO);
    }

    #[test]
    fn trailing_stop_ratchets_through_step_1m_ticks() {
        let mut acc = account();
        acc.on_sl_beyond_liq = crate::play::OnSlBeyondLiq::Reject;
        let mut r = risk();
        r.trailing_config = Some(crate::play::TrailingConfig { activation_pct: 0.01, trail_pct: 0.005 });
        let mut exchange = Exchange::new(acc, r);
        exchange.submit_entry(Side::Long, 1_000.0, Some(90.0), None, 0, 100.0).unwrap();
        exchange.step_1m(&bar(0, 100.0, 100.0, 100.0, 100.0));
        exchange.step_1m(&bar(60_000, 110.0, 115.0, 110.0, 112.0));
        let stop = exchange.position().unwrap().stop_loss.unwrap();
        assert!(stop > 90.0);
        assert!((stop - 115.0 * 0.995).abs() < 1e-9);
    }
}
