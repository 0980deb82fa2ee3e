//! Order lifecycle state machine. §4.F "State machine per order lifecycle".

use rust_decimal::prelude::*;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::fees::{apply_slippage, taker_fee};
use super::position::{Position, Side};
use crate::play::{AccountConfig, OnSlBeyondLiq};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    InsufficientBalance,
    MinTradeNotional,
    MaxNotional,
    SlBeyondLiquidation,
    PositionAlreadyOpen,
    EntriesDisabled,
}

/// A rejected order intent. Recorded, never a `BacktestError` — the run
/// continues.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RejectedOrder {
    pub reason: RejectReason,
    pub ts: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PendingOrder {
    pub side: Side,
    pub size_usdt: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub submitted_at_ts: i64,
}

/// Rejects the order up front if it would not clear the entry gate, without
/// mutating any state. The caller is responsible for actually queuing the
/// resulting `PendingOrder`.
pub fn submit_order(
    side: Side,
    size_usdt: f64,
    stop_loss: Option<f64>,
    take_profit: Option<f64>,
    ts: i64,
    account: &AccountConfig,
    available_balance: Decimal,
    mark_price: f64,
) -> Result<PendingOrder, RejectedOrder> {
    if size_usdt < account.min_trade_notional_usdt {
        return Err(RejectedOrder { reason: RejectReason::MinTradeNotional, ts });
    }
    let max_notional = account.starting_equity_usdt * account.max_leverage;
    if size_usdt > max_notional {
        return Err(RejectedOrder { reason: RejectReason::MaxNotional, ts });
    }
    let mut stop_loss = stop_loss;
    if let Some(sl) = stop_loss {
        if sl_beyond_liquidation(side, mark_price, sl, account.max_leverage) {
            match account.on_sl_beyond_liq {
                OnSlBeyondLiq::Reject => {
                    return Err(RejectedOrder { reason: RejectReason::SlBeyondLiquidation, ts });
                }
                OnSlBeyondLiq::Adjust => {
                    stop_loss = Some(liquidation_safe_stop(side, mark_price, account.max_leverage));
                }
                OnSlBeyondLiq::Warn => {
                    tracing::warn!(ts, ?side, sl, mark_price, "stop-loss sits beyond estimated liquidation price");
                }
            }
        }
    }
    let imr = 1.0 / account.max_leverage;
    let required = Decimal::from_f64(size_usdt * imr).unwrap_or_default();
    if available_balance < required {
        return Err(RejectedOrder { reason: RejectReason::InsufficientBalance, ts });
    }
    Ok(PendingOrder { side, size_usdt, stop_loss, take_profit, submitted_at_ts: ts })
}

/// True when the stop-loss sits past the estimated liquidation price —
/// i.e. the position would be force-closed by the exchange before SL could
/// ever trigger.
fn sl_beyond_liquidation(side: Side, entry_estimate: f64, sl: f64, max_leverage: f64) -> bool {
    let liq_distance_pct = 1.0 / max_leverage - super::position::MAINTENANCE_MARGIN_RATE;
    match side {
        Side::Long => {
            let liq_price = entry_estimate * (1.0 - liq_distance_pct);
            sl <= liq_price
        }
        Side::Short => {
            let liq_price = entry_estimate * (1.0 + liq_distance_pct);
            sl >= liq_price
        }
    }
}

/// The nearest stop that still clears the liquidation floor by a 1bp
/// margin, used by `OnSlBeyondLiq::Adjust`.
fn liquidation_safe_stop(side: Side, entry_estimate: f64, max_leverage: f64) -> f64 {
    let liq_distance_pct = 1.0 / max_leverage - super::position::MAINTENANCE_MARGIN_RATE;
    match side {
        Side::Long => entry_estimate * (1.0 - liq_distance_pct + 0.0001),
        Side::Short => entry_estimate * (1.0 + liq_distance_pct - 0.0001),
    }
}

/// Fills a pending order at the given 1m bar open, per §4.F
/// `Pending -> Filled@next_1m_open`. Returns the opened position and the
/// entry fee charged against cash.
pub fn fill_pending(
    pending: PendingOrder,
    bar_open: f64,
    ts: i64,
    account: &AccountConfig,
) -> (Position, Decimal) {
    let buying = pending.side == Side::Long;
    let fill_price = apply_slippage(bar_open, account.slippage_bps, buying);
    let qty = pending.size_usdt / fill_price;
    let notional = Decimal::from_f64(pending.size_usdt).unwrap_or_default();
    let fee = taker_fee(&account.fee_model, notional);
    let position = Position {
        side: pending.side,
        size_usdt: pending.size_usdt,
        qty,
        entry_price: fill_price,
        stop_loss: pending.stop_loss,
        take_profit: pending.take_profit,
        opened_at_ts: ts,
        favorable_extreme: fill_price,
        break_even_applied: false,
    };
    (position, fee)
}
