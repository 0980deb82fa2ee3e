//! Structure features: bar-pattern detectors that, unlike indicators,
//! read raw OHLC (and sometimes other features) rather than a single
//! input column. Every detector here is strictly causal — a value at
//! index `i` depends only on bars at or before `i`.

/// Swing-pivot confirmation state for one side (high or low).
///
/// A bar at index `k` is confirmed as a pivot only once `right` bars
/// after it have closed, so the flag for a pivot at `k` appears in the
/// output array at index `k + right`, never earlier.
pub struct SwingPivotResult {
    pub is_swing_high: Vec<bool>,
    pub is_swing_low: Vec<bool>,
}

/// Detect swing highs/lows using `left` bars before and `right` bars
/// after as confirmation window. Warmup is `left + right` bars before
/// the first possible confirmation.
pub fn swing_pivot(high: &[f64], low: &[f64], left: usize, right: usize) -> SwingPivotResult {
    let n = high.len();
    let mut is_swing_high = vec![false; n];
    let mut is_swing_low = vec![false; n];

    if left == 0 || right == 0 || n < left + right + 1 {
        return SwingPivotResult {
            is_swing_high,
            is_swing_low,
        };
    }

    for k in left..n - right {
        let window_high = &high[k - left..=k + right];
        let window_low = &low[k - left..=k + right];
        let pivot_high = high[k];
        let pivot_low = low[k];

        let is_high = window_high
            .iter()
            .enumerate()
            .all(|(offset, &v)| offset == left || v < pivot_high);
        let is_low = window_low
            .iter()
            .enumerate()
            .all(|(offset, &v)| offset == left || v > pivot_low);

        // Confirmed at k + right, once the trailing `right` bars have closed.
        if is_high {
            is_swing_high[k + right] = true;
        }
        if is_low {
            is_swing_low[k + right] = true;
        }
    }

    SwingPivotResult {
        is_swing_high,
        is_swing_low,
    }
}

/// Warmup bars needed before the first swing pivot can be confirmed.
pub fn swing_pivot_warmup(left: usize, right: usize) -> usize {
    5 * (left + right + 1)
}

/// Directional trend classification derived from a rolling count of
/// confirmed higher-highs/higher-lows vs lower-highs/lower-lows among
/// the last `lookback` confirmed swing pivots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrendState {
    Up,
    Down,
    Range,
}

impl TrendState {
    pub fn as_str(self) -> &'static str {
        match self {
            TrendState::Up => "up",
            TrendState::Down => "down",
            TrendState::Range => "range",
        }
    }
}

pub struct TrendResult {
    pub state: Vec<TrendState>,
}

/// Classify trend per bar from swing-pivot history: counts higher-highs
/// and higher-lows among the last `lookback` confirmed swings on each
/// side; `Up` when highs and lows both trend up, `Down` when both trend
/// down, `Range` otherwise. Carries the previous bar's state forward
/// between pivot confirmations so the output is defined every bar once
/// warm.
pub fn trend_structure(
    high: &[f64],
    low: &[f64],
    left: usize,
    right: usize,
    lookback: usize,
) -> TrendResult {
    let n = high.len();
    let pivots = swing_pivot(high, low, left, right);

    let mut highs_seen: Vec<f64> = Vec::new();
    let mut lows_seen: Vec<f64> = Vec::new();
    let mut state = vec![TrendState::Range; n];
    let mut current = TrendState::Range;

    for i in 0..n {
        if pivots.is_swing_high[i] {
            highs_seen.push(high[i]);
        }
        if pivots.is_swing_low[i] {
            lows_seen.push(low[i]);
        }

        if highs_seen.len() >= lookback.max(2) && lows_seen.len() >= lookback.max(2) {
            let recent_highs = &highs_seen[highs_seen.len() - lookback.max(2)..];
            let recent_lows = &lows_seen[lows_seen.len() - lookback.max(2)..];
            let highs_rising = recent_highs.windows(2).all(|w| w[1] > w[0]);
            let highs_falling = recent_highs.windows(2).all(|w| w[1] < w[0]);
            let lows_rising = recent_lows.windows(2).all(|w| w[1] > w[0]);
            let lows_falling = recent_lows.windows(2).all(|w| w[1] < w[0]);

            current = if highs_rising && lows_rising {
                TrendState::Up
            } else if highs_falling && lows_falling {
                TrendState::Down
            } else {
                TrendState::Range
            };
        }

        state[i] = current;
    }

    TrendResult { state }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uptrend_series(n: usize) -> (Vec<f64>, Vec<f64>) {
        // Zig-zag that climbs overall: each local high/low is above the last.
        let mut high = Vec::with_capacity(n);
        let mut low = Vec::with_capacity(n);
        for i in 0..n {
            let base = (i as f64) * 0.5;
            let wiggle = if i % 2 == 0 { 1.0 } else { -0.5 };
            high.push(base + 2.0 + wiggle);
            low.push(base - 2.0 + wiggle);
        }
        (high, low)
    }

    #[test]
    fn swing_pivot_confirms_with_delay() {
        // A single spike at index 5 in an otherwise flat series.
        let mut high = vec![10.0; 15];
        high[5] = 20.0;
        let low = vec![5.0; 15];

        let result = swing_pivot(&high, &low, 2, 2);
        // Confirmed at index 5 + right(2) = 7, not at 5.
        assert!(!result.is_swing_high[5]);
        assert!(result.is_swing_high[7]);
    }

    #[test]
    fn swing_pivot_warmup_matches_formula() {
        assert_eq!(swing_pivot_warmup(3, 2), 5 * (3 + 2 + 1));
    }

    #[test]
    fn trend_structure_detects_sustained_uptrend() {
        let (high, low) = uptrend_series(60);
        let result = trend_structure(&high, &low, 2, 2, 2);
        assert_eq!(*result.state.last().unwrap(), TrendState::Up);
    }

    #[test]
    fn trend_structure_defaults_to_range_before_warm() {
        let (high, low) = uptrend_series(5);
        let result = trend_structure(&high, &low, 2, 2, 2);
        assert!(result.state.iter().all(|s| *s == TrendState::Range));
    }
}
