//! Intrabar TP/SL resolution. §4.F "Intrabar TP/SL resolution
//! (deterministic tie-break)", validated against spec.md S2.

use super::position::{Position, Side};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IntrabarExit {
    pub reason: ExitReason,
    pub price: f64,
}

/// Resolves whether a position's SL/TP would fire within one 1m bar's
/// `(open, high, low)` range. When both levels lie inside the range, the
/// worst case wins the tie: SL fires before TP. This is a stated decision,
/// not a guess — a bar that touches both levels could have done so in
/// either order, and assuming the favorable order would overstate
/// backtested performance.
pub fn resolve_intrabar_exit(position: &Position, high: f64, low: f64) -> Option<IntrabarExit> {
    let (sl_hit, tp_hit) = match position.side {
        Side::Long => (
            position.stop_loss.filter(|&sl| low <= sl),
            position.take_profit.filter(|&tp| high >= tp),
        ),
        Side::Short => (
            position.stop_loss.filter(|&sl| high >= sl),
            position.take_profit.filter(|&tp| low <= tp),
        ),
    };

    match (sl_hit, tp_hit) {
        (Some(sl), Some(_)) => Some(IntrabarExit { reason: ExitReason::StopLoss, price: sl }),
        (Some(sl), None) => Some(IntrabarExit { reason: ExitReason::StopLoss, price: sl }),
        (None, Some(tp)) => Some(IntrabarExit { reason: ExitReason::TakeProfit, price: tp }),
        (None, None) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn long_position(sl: f64, tp: f64) -> Position {
        Position {
            side: Side::Long,
            size_usdt: 10_000.0,
            qty: 100.0,
            entry_price: 100.0,
            stop_loss: Some(sl),
            take_profit: Some(tp),
            opened_at_ts: 0,
            favorable_extreme: 100.0,
            break_even_applied: false,
        }
    }

    #[test]
    fn s2_tie_break_resolves_sl_first_when_both_levels_are_touched() {
        let pos = long_position(95.0, 105.0);
        let exit = resolve_intrabar_exit(&pos, 106.0, 94.0).unwrap();
        assert_eq!(exit.reason, ExitReason::StopLoss);
        assert_eq!(exit.price, 95.0);
    }

    #[test]
    fn only_tp_in_range_fills_at_tp() {
        let pos = long_position(90.0, 105.0);
        let exit = resolve_intrabar_exit(&pos, 106.0, 99.0).unwrap();
        assert_eq!(exit.reason, ExitReason::TakeProfit);
        assert_eq!(exit.price, 105.0);
    }

    #[test]
    fn neither_level_touched_is_no_exit() {
        let pos = long_position(90.0, 110.0);
        assert!(resolve_intrabar_exit(&pos, 101.0, 99.0).is_none());
    }

    #[test]
    fn short_tie_break_also_resolves_sl_first() {
        let mut pos = long_position(105.0, 95.0);
        pos.side = Side::Short;
        let exit = resolve_intrabar_exit(&pos, 106.0, 94.0).unwrap();
        assert_eq!(exit.reason, ExitReason::StopLoss);
        assert_eq!(exit.price, 105.0);
    }
}
