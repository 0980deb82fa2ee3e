//! Trailing-stop and break-even stop mutation. Evaluated once per 1m tick,
//! after intrabar TP/SL resolution, while a position remains open.
//! Grounded on `risk_model.py`'s `TrailingConfig`/`BreakEvenConfig`:
//! trailing ratchets the stop in the profitable direction only, off the
//! best-seen favorable price since entry; break-even moves the stop to
//! entry +/- `offset_pct` once, the first time `activation_pct` profit is
//! reached, and never re-triggers.

use crate::play::{BreakEvenConfig, TrailingConfig};

use super::position::{Position, Side};

pub fn apply_trailing_and_break_even(
    position: &mut Position,
    bar_high: f64,
    bar_low: f64,
    trailing: Option<TrailingConfig>,
    break_even: Option<BreakEvenConfig>,
) {
    if trailing.is_none() && break_even.is_none() {
        return;
    }

    let favorable_tick = match position.side {
        Side::Long => bar_high,
        Side::Short => bar_low,
    };
    position.favorable_extreme = match position.side {
        Side::Long => position.favorable_extreme.max(favorable_tick),
        Side::Short => position.favorable_extreme.min(favorable_tick),
    };

    let profit_pct = match position.side {
        Side::Long => (position.favorable_extreme - position.entry_price) / position.entry_price,
        Side::Short => (position.entry_price - position.favorable_extreme) / position.entry_price,
    };

    if let Some(be) = break_even {
        if !position.break_even_applied && profit_pct >= be.activation_pct {
            let target = match position.side {
                Side::Long => position.entry_price * (1.0 + be.offset_pct),
                Side::Short => position.entry_price * (1.0 - be.offset_pct),
            };
            ratchet_stop(position, target);
            position.break_even_applied = true;
        }
    }

    if let Some(tr) = trailing {
        if profit_pct >= tr.activation_pct {
            let target = match position.side {
                Side::Long => position.favorable_extreme * (1.0 - tr.trail_pct),
                Side::Short => position.favorable_extreme * (1.0 + tr.trail_pct),
            };
            ratchet_stop(position, target);
        }
    }
}

/// Moves the stop toward `target` only if that's favorable: up for longs,
/// down for shorts. Never loosens an existing stop.
fn ratchet_stop(position: &mut Position, target: f64) {
    position.stop_loss = Some(match position.stop_loss {
        Some(existing) => match position.side {
            Side::Long => existing.max(target),
            Side::Short => existing.min(target),
        },
        None => target,
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn long_position(entry: f64) -> Position {
        Position {
            side: Side::Long,
            size_usdt: 10_000.0,
            qty: 100.0,
            entry_price: entry,
            stop_loss: None,
            take_profit: None,
            opened_at_ts: 0,
            favorable_extreme: entry,
            break_even_applied: false,
        }
    }

    #[test]
    fn trailing_stop_ratchets_up_but_never_down() {
        let mut pos = long_position(100.0);
        let trailing = Some(TrailingConfig { activation_pct: 0.02, trail_pct: 0.01 });
        apply_trailing_and_break_even(&mut pos, 110.0, 109.0, trailing, None);
        assert_eq!(pos.stop_loss, Some(110.0 * 0.99));

        apply_trailing_and_break_even(&mut pos, 105.0, 104.0, trailing, None);
        assert_eq!(pos.stop_loss, Some(110.0 * 0.99));
    }

    #[test]
    fn break_even_moves_stop_to_entry_offset_once() {
        let mut pos = long_position(100.0);
        let break_even = Some(BreakEvenConfig { activation_pct: 0.01, offset_pct: 0.001 });
        apply_trailing_and_break_even(&mut pos, 102.0, 101.0, None, break_even);
        assert_eq!(pos.stop_loss, Some(100.1));
        assert!(pos.break_even_applied);

        // A subsequent pullback below activation doesn't undo the stop.
        apply_trailing_and_break_even(&mut pos, 100.5, 99.0, None, break_even);
        assert_eq!(pos.stop_loss, Some(100.1));
    }

    #[test]
    fn short_side_trailing_ratchets_down() {
        let mut pos = long_position(100.0);
        pos.side = Side::Short;
        pos.favorable_extreme = 100.0;
        let trailing = Some(TrailingConfig { activation_pct: 0.02, trail_pct: 0.01 });
        apply_trailing_and_break_even(&mut pos, 91.0, 90.0, trailing, None);
        assert_eq!(pos.stop_loss, Some(90.0 * 1.01));
    }

    #[test]
    fn no_configs_leaves_stop_untouched() {
        let mut pos = long_position(100.0);
        pos.stop_loss = Some(95.0);
        apply_trailing_and_break_even(&mut pos, 120.0, 119.0, None, None);
        assert_eq!(pos.stop_loss, Some(95.0));
    }
}
