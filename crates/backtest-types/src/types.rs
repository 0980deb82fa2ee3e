use serde::{Deserialize, Serialize};

use crate::Timeframe;

/// A single OHLCV bar on one symbol/timeframe.
///
/// Invariants (checked by the Feed Store at build time, never at point of
/// use): `ts_close == ts_open + duration(tf)`;
/// `low <= min(open, close) <= max(open, close) <= high`; `volume >= 0`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub ts_open: i64,
    pub ts_close: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Bar {
    pub fn check_invariants(&self, tf: Timeframe) -> Result<(), String> {
        let expected_close = self.ts_open + tf.minutes() * 60_000;
        if self.ts_close != expected_close {
            return Err(format!(
                "bar ts_close {} != ts_open {} + duration({}) = {}",
                self.ts_close,
                self.ts_open,
                tf.as_str(),
                expected_close
            ));
        }
        let body_lo = self.open.min(self.close);
        let body_hi = self.open.max(self.close);
        if !(self.low <= body_lo && body_hi <= self.high) {
            return Err(format!(
                "bar at ts_open={} violates low<=min(open,close)<=max(open,close)<=high (o={} h={} l={} c={})",
                self.ts_open, self.open, self.high, self.low, self.close
            ));
        }
        if self.volume < 0.0 {
            return Err(format!("bar at ts_open={} has negative volume {}", self.ts_open, self.volume));
        }
        Ok(())
    }
}

/// Declared output type for a feature field. Drives DSL operator/type
/// compatibility checks at parse time (`eq`/`neq` restricted to discrete
/// types; `near_abs`/`near_pct` restricted to numeric types).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeatureOutputType {
    Float,
    Int,
    Bool,
    Enum,
}

impl FeatureOutputType {
    pub fn is_numeric(self) -> bool {
        matches!(self, FeatureOutputType::Float | FeatureOutputType::Int)
    }

    pub fn is_discrete(self) -> bool {
        matches!(
            self,
            FeatureOutputType::Int | FeatureOutputType::Bool | FeatureOutputType::Enum
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok_bar() -> Bar {
        Bar {
            ts_open: 0,
            ts_close: 60_000,
            open: 100.0,
            high: 101.0,
            low: 99.0,
            close: 100.5,
            volume: 10.0,
        }
    }

    #[test]
    fn valid_bar_passes_invariants() {
        assert!(ok_bar().check_invariants(Timeframe::Minute1).is_ok());
    }

    #[test]
    fn bad_high_low_ordering_fails() {
        let mut b = ok_bar();
        b.high = 90.0; // below the body
        assert!(b.check_invariants(Timeframe::Minute1).is_err());
    }

    #[test]
    fn negative_volume_fails() {
        let mut b = ok_bar();
        b.volume = -1.0;
        assert!(b.check_invariants(Timeframe::Minute1).is_err());
    }

    #[test]
    fn mismatched_ts_close_fails() {
        let mut b = ok_bar();
        b.ts_close = 999;
        assert!(b.check_invariants(Timeframe::Minute1).is_err());
    }

    #[test]
    fn numeric_and_discrete_classification() {
        assert!(FeatureOutputType::Float.is_numeric());
        assert!(FeatureOutputType::Int.is_numeric());
        assert!(FeatureOutputType::Int.is_discrete());
        assert!(FeatureOutputType::Bool.is_discrete());
        assert!(!FeatureOutputType::Float.is_discrete());
    }
}
