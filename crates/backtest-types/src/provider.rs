use std::collections::HashMap;

use serde_json::{Map, Value};

use crate::BacktestError;

/// Parameter bag for an indicator or structure declaration, as carried
/// verbatim from the Play document. Accessor helpers apply the numeric
/// coercions the registries need without forcing every caller to match on
/// `serde_json::Value`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParamBag(pub Map<String, Value>);

impl ParamBag {
    pub fn new(map: Map<String, Value>) -> Self {
        Self(map)
    }

    pub fn get_usize(&self, key: &str) -> Option<usize> {
        self.0.get(key)?.as_u64().map(|v| v as usize)
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.0.get(key)?.as_f64()
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key)?.as_str()
    }
}

/// Per-timeframe OHLCV input columns an indicator or structure may read,
/// keyed the same way the Feature declares `input_source`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InputSource {
    Open,
    High,
    Low,
    Close,
    Volume,
    Hl2,
    Hlc3,
    Ohlc4,
}

/// The external numeric indicator library, consumed only through this
/// contract (§6.1). The engine never names a concrete indicator crate —
/// it resolves one of these at Play-normalization time and holds it as
/// `Arc<dyn IndicatorProvider>` for the life of the run.
pub trait IndicatorProvider: Send + Sync {
    fn is_supported(&self, indicator_type: &str) -> bool;

    fn validate_params(&self, indicator_type: &str, params: &ParamBag) -> Result<(), BacktestError>;

    fn get_warmup_bars(&self, indicator_type: &str, params: &ParamBag) -> Result<usize, BacktestError>;

    /// Output key suffixes for a multi-output indicator (e.g. `macd` ->
    /// `["_macd", "_signal", "_histogram"]`). Empty for single-output
    /// indicators, whose sole output is keyed by the feature id itself.
    fn get_output_suffixes(&self, indicator_type: &str) -> Vec<String>;

    /// Canonical expanded keys for a feature with the given base key.
    /// Idempotent: calling this twice on the same base key yields the
    /// same list.
    fn get_expanded_keys(&self, indicator_type: &str, base_key: &str) -> Vec<String>;

    /// Groups of keys where, at any bar, at most one member of a group is
    /// expected to be non-NaN (e.g. SuperTrend's long/short columns).
    /// `find_first_valid_bar` treats a group as satisfied once any one
    /// member is non-NaN rather than requiring all of them.
    fn get_mutually_exclusive_groups(&self, keys: &[String]) -> Vec<Vec<String>>;

    /// Compute the indicator over full-length input columns. Returned
    /// arrays must all share the input arrays' length; positions before
    /// warmup are NaN. Extra keys beyond the declared outputs are the
    /// caller's responsibility to drop; missing declared outputs are a
    /// hard error.
    fn compute(
        &self,
        indicator_type: &str,
        inputs: &HashMap<String, Vec<f64>>,
        params: &ParamBag,
    ) -> Result<HashMap<String, Vec<f64>>, BacktestError>;
}

/// The external structure-detection library (swing pivots, trend runs,
/// and similar bar-pattern features), consumed the same way as
/// `IndicatorProvider`. Structures may depend on other features by id;
/// `compute` receives those dependencies pre-resolved.
pub trait StructureProvider: Send + Sync {
    fn is_supported(&self, structure_type: &str) -> bool;

    fn validate_params(&self, structure_type: &str, params: &ParamBag) -> Result<(), BacktestError>;

    /// Typically `5 * (left + right + 1)` for pivot-style structures:
    /// enough trailing bars to confirm a pivot plus a safety margin.
    fn get_warmup_bars(&self, structure_type: &str, params: &ParamBag) -> usize;

    fn get_output_suffixes(&self, structure_type: &str) -> Vec<String>;

    fn get_expanded_keys(&self, structure_type: &str, base_key: &str) -> Vec<String>;

    fn compute(
        &self,
        structure_type: &str,
        bars_close: &[f64],
        bars_high: &[f64],
        bars_low: &[f64],
        deps: &HashMap<String, Vec<f64>>,
        params: &ParamBag,
    ) -> Result<HashMap<String, Vec<f64>>, BacktestError>;
}
