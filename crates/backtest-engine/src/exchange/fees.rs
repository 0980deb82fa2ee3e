//! Fee model. §4.F "Fee model: fee = notional x taker_bps / 10000".

use rust_decimal::prelude::*;
use rust_decimal::Decimal;

use crate::play::FeeModel;

fn bps_to_fraction(bps: f64) -> Decimal {
    Decimal::from_f64(bps).unwrap_or(Decimal::ZERO) / Decimal::from(10_000)
}

/// Taker fee on a notional amount, entry or exit.
pub fn taker_fee(model: &FeeModel, notional: Decimal) -> Decimal {
    notional * bps_to_fraction(model.taker_bps)
}

/// Maker fee, used for limit-style TP/SL fills that do not cross the book.
pub fn maker_fee(model: &FeeModel, notional: Decimal) -> Decimal {
    notional * bps_to_fraction(model.maker_bps)
}

/// Slippage-adjusted fill price. `buying` widens the price upward, selling
/// (closing a long / opening a short) widens it downward.
pub fn apply_slippage(price: f64, slippage_bps: f64, buying: bool) -> f64 {
    let adj = price * slippage_bps / 10_000.0;
    if buying {
        price + adj
    } else {
        price - adj
    }
}
