//! Position sizing. Not part of the Simulated Exchange itself — the Bar
//! Processor calls this to turn a `risk.max_position_pct`/entry/stop into
//! the `size_usdt` it hands `Exchange::submit_entry`.

use crate::play::{AccountConfig, RiskConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizingMethod {
    /// Risk dollars derived from stop distance, capped by max leverage.
    StopBased,
    /// No usable stop distance; sized off `risk.max_position_pct` instead.
    FallbackNotional,
    /// `account.risk_per_trade_pct` unset: plain `max_position_pct` of equity.
    FixedNotional,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SizingResult {
    pub size_usdt: f64,
    pub method: SizingMethod,
}

/// Percent-equity sizing when `account.risk_per_trade_pct` is set:
/// `risk$ = equity * risk_per_trade_pct/100`, then
/// `size_usdt = risk$ * entry_price / |entry_price - stop_loss|`, capped
/// at `equity * max_leverage`. Falls back to `risk.max_position_pct` of
/// equity when there's no usable stop distance, or when
/// `risk_per_trade_pct` isn't configured at all (fixed-notional model).
pub fn size_order(equity: f64, account: &AccountConfig, risk: &RiskConfig, entry_price: f64, stop_loss: Option<f64>) -> SizingResult {
    let max_size = equity * account.max_leverage;

    let Some(risk_pct) = account.risk_per_trade_pct else {
        let size_usdt = (risk.max_position_pct * equity).min(max_size);
        return SizingResult { size_usdt, method: SizingMethod::FixedNotional };
    };

    if let Some(sl) = stop_loss {
        let stop_distance = (entry_price - sl).abs();
        if stop_distance > 0.0 && entry_price > 0.0 {
            let risk_dollars = equity * (risk_pct / 100.0);
            let size_usdt = (risk_dollars * entry_price / stop_distance).min(max_size);
            return SizingResult { size_usdt, method: SizingMethod::StopBased };
        }
    }

    let size_usdt = (risk.max_position_pct * equity).min(max_size);
    SizingResult { size_usdt, method: SizingMethod::FallbackNotional }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::play::FeeModel;

    fn account(risk_per_trade_pct: Option<f64>) -> AccountConfig {
        AccountConfig {
            starting_equity_usdt: 10_000.0,
            max_leverage: 10.0,
            max_drawdown_pct: 0.3,
            stop_equity_usdt: 0.0,
            fee_model: FeeModel::default(),
            slippage_bps: 2.0,
            min_trade_notional_usdt: 10.0,
            margin_mode: "isolated_usdt".into(),
            mm_deduction: 0.0,
            risk_per_trade_pct,
            on_sl_beyond_liq: crate::play::OnSlBeyondLiq::Reject,
            include_est_close_fee_in_entry_gate: false,
        }
    }

    fn risk() -> RiskConfig {
        RiskConfig { stop_loss_pct: 0.02, take_profit_pct: 0.04, max_position_pct: 0.5, trailing_config: None, break_even_config: None }
    }

    #[test]
    fn stop_based_sizing_scales_with_risk_dollars_over_stop_distance() {
        let result = size_order(10_000.0, &account(Some(1.0)), &risk(), 100.0, Some(98.0));
        // risk$ = 100, size = 100 * 100 / 2 = 5000
        assert_eq!(result.method, SizingMethod::StopBased);
        assert_eq!(result.size_usdt, 5_000.0);
    }

    #[test]
    fn stop_based_sizing_is_capped_by_max_leverage() {
        let result = size_order(10_000.0, &account(Some(50.0)), &risk(), 100.0, Some(99.9));
        assert_eq!(result.method, SizingMethod::StopBased);
        assert_eq!(result.size_usdt, 100_000.0);
    }

    #[test]
    fn missing_stop_falls_back_to_max_position_pct() {
        let result = size_order(10_000.0, &account(Some(1.0)), &risk(), 100.0, None);
        assert_eq!(result.method, SizingMethod::FallbackNotional);
        assert_eq!(result.size_usdt, 5_000.0);
    }

    #[test]
    fn unset_risk_per_trade_pct_uses_fixed_notional_model() {
        let result = size_order(10_000.0, &account(None), &risk(), 100.0, Some(98.0));
        assert_eq!(result.method, SizingMethod::FixedNotional);
        assert_eq!(result.size_usdt, 5_000.0);
    }
}
