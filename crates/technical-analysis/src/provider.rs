use std::collections::HashMap;

use backtest_types::{BacktestError, IndicatorProvider, ParamBag, StructureProvider};

use crate::indicators;
use crate::structure;

const INDICATORS: &[&str] = &["ema", "sma", "rsi", "macd", "atr", "bbands", "adx", "supertrend"];
const STRUCTURES: &[&str] = &["swing_pivot", "trend"];

fn require_usize(params: &ParamBag, key: &str, default: usize) -> usize {
    params.get_usize(key).unwrap_or(default)
}

fn require_f64(params: &ParamBag, key: &str, default: f64) -> f64 {
    params.get_f64(key).unwrap_or(default)
}

fn missing_input(indicator_type: &str, key: &str) -> BacktestError {
    BacktestError::data(
        "n/a",
        "n/a",
        format!("indicator '{indicator_type}' requires input column '{key}'"),
    )
}

/// Indicator registry backed by the plain-array math in [`crate::indicators`].
pub struct DefaultIndicatorProvider;

impl IndicatorProvider for DefaultIndicatorProvider {
    fn is_supported(&self, indicator_type: &str) -> bool {
        INDICATORS.contains(&indicator_type)
    }

    fn validate_params(&self, indicator_type: &str, params: &ParamBag) -> Result<(), BacktestError> {
        if !self.is_supported(indicator_type) {
            return Err(BacktestError::configuration(
                "indicator_type",
                format!("unknown indicator '{indicator_type}'"),
                INDICATORS.join(", "),
            ));
        }
        match indicator_type {
            "macd" => {
                let fast = require_usize(params, "fast_period", 12);
                let slow = require_usize(params, "slow_period", 26);
                if slow < fast {
                    return Err(BacktestError::configuration(
                        "slow_period",
                        "slow_period must be >= fast_period",
                        "slow_period >= fast_period",
                    ));
                }
            }
            "bbands" => {
                let std_dev = require_f64(params, "std_dev", 2.0);
                if std_dev <= 0.0 {
                    return Err(BacktestError::configuration(
                        "std_dev",
                        "std_dev must be positive",
                        "std_dev > 0",
                    ));
                }
            }
            _ => {}
        }
        let period = require_usize(params, "period", 1);
        if period == 0 {
            return Err(BacktestError::configuration(
                "period",
                "period must be >= 1",
                "period >= 1",
            ));
        }
        Ok(())
    }

    fn get_warmup_bars(&self, indicator_type: &str, params: &ParamBag) -> Result<usize, BacktestError> {
        self.validate_params(indicator_type, params)?;
        Ok(match indicator_type {
            "ema" | "sma" | "rsi" | "atr" | "bbands" => require_usize(params, "period", 14),
            "adx" => require_usize(params, "period", 14) * 2 + 1,
            "supertrend" => require_usize(params, "period", 10) + 1,
            "macd" => require_usize(params, "slow_period", 26) + require_usize(params, "signal_period", 9),
            _ => 0,
        })
    }

    fn get_output_suffixes(&self, indicator_type: &str) -> Vec<String> {
        match indicator_type {
            "macd" => vec!["_macd".into(), "_signal".into(), "_histogram".into()],
            "bbands" => vec!["_upper".into(), "_middle".into(), "_lower".into()],
            "adx" => vec!["_adx".into(), "_plus_di".into(), "_minus_di".into()],
            "supertrend" => vec!["_trend".into(), "_direction".into()],
            _ => vec![],
        }
    }

    fn get_expanded_keys(&self, indicator_type: &str, base_key: &str) -> Vec<String> {
        let suffixes = self.get_output_suffixes(indicator_type);
        if suffixes.is_empty() {
            vec![base_key.to_string()]
        } else {
            suffixes.into_iter().map(|s| format!("{base_key}{s}")).collect()
        }
    }

    fn get_mutually_exclusive_groups(&self, keys: &[String]) -> Vec<Vec<String>> {
        let trend_cols: Vec<String> = keys.iter().filter(|k| k.ends_with("_trend")).cloned().collect();
        if trend_cols.len() > 1 {
            vec![trend_cols]
        } else {
            vec![]
        }
    }

    fn compute(
        &self,
        indicator_type: &str,
        inputs: &HashMap<String, Vec<f64>>,
        params: &ParamBag,
    ) -> Result<HashMap<String, Vec<f64>>, BacktestError> {
        self.validate_params(indicator_type, params)?;
        let input = |key: &str| -> Result<&Vec<f64>, BacktestError> {
            inputs.get(key).ok_or_else(|| missing_input(indicator_type, key))
        };

        let mut out = HashMap::new();
        match indicator_type {
            "sma" => {
                let period = require_usize(params, "period", 14);
                out.insert("value".into(), indicators::sma(input("close")?, period));
            }
            "ema" => {
                let period = require_usize(params, "period", 14);
                out.insert("value".into(), indicators::ema(input("close")?, period));
            }
            "rsi" => {
                let period = require_usize(params, "period", 14);
                out.insert("value".into(), indicators::rsi(input("close")?, period));
            }
            "macd" => {
                let fast = require_usize(params, "fast_period", 12);
                let slow = require_usize(params, "slow_period", 26);
                let signal = require_usize(params, "signal_period", 9);
                let result = indicators::macd(input("close")?, fast, slow, signal);
                out.insert("_macd".into(), result.macd_line);
                out.insert("_signal".into(), result.signal_line);
                out.insert("_histogram".into(), result.histogram);
            }
            "bbands" => {
                let period = require_usize(params, "period", 20);
                let std_dev = require_f64(params, "std_dev", 2.0);
                let result = indicators::bollinger_bands(input("close")?, period, std_dev);
                out.insert("_upper".into(), result.upper);
                out.insert("_middle".into(), result.middle);
                out.insert("_lower".into(), result.lower);
            }
            "atr" => {
                let period = require_usize(params, "period", 14);
                out.insert(
                    "value".into(),
                    indicators::atr(input("high")?, input("low")?, input("close")?, period),
                );
            }
            "adx" => {
                let period = require_usize(params, "period", 14);
                let result = indicators::adx(input("high")?, input("low")?, input("close")?, period);
                out.insert("_adx".into(), result.adx);
                out.insert("_plus_di".into(), result.plus_di);
                out.insert("_minus_di".into(), result.minus_di);
            }
            "supertrend" => {
                let period = require_usize(params, "period", 10);
                let multiplier = require_f64(params, "multiplier", 3.0);
                let result = indicators::supertrend(
                    input("high")?,
                    input("low")?,
                    input("close")?,
                    period,
                    multiplier,
                );
                out.insert("_trend".into(), result.trend);
                out.insert(
                    "_direction".into(),
                    result.direction.into_iter().map(|d| d as f64).collect(),
                );
            }
            _ => {
                return Err(BacktestError::configuration(
                    "indicator_type",
                    format!("unknown indicator '{indicator_type}'"),
                    INDICATORS.join(", "),
                ))
            }
        }
        Ok(out)
    }
}

/// Structure registry backed by [`crate::structure`].
pub struct DefaultStructureProvider;

impl StructureProvider for DefaultStructureProvider {
    fn is_supported(&self, structure_type: &str) -> bool {
        STRUCTURES.contains(&structure_type)
    }

    fn validate_params(&self, structure_type: &str, params: &ParamBag) -> Result<(), BacktestError> {
        if !self.is_supported(structure_type) {
            return Err(BacktestError::configuration(
                "structure_type",
                format!("unknown structure '{structure_type}'"),
                STRUCTURES.join(", "),
            ));
        }
        let left = require_usize(params, "left", 1);
        let right = require_usize(params, "right", 1);
        if left == 0 || right == 0 {
            return Err(BacktestError::configuration(
                "left/right",
                "swing confirmation window must have left >= 1 and right >= 1",
                "left >= 1, right >= 1",
            ));
        }
        Ok(())
    }

    fn get_warmup_bars(&self, _structure_type: &str, params: &ParamBag) -> usize {
        let left = require_usize(params, "left", 2);
        let right = require_usize(params, "right", 2);
        structure::swing_pivot_warmup(left, right)
    }

    fn get_output_suffixes(&self, structure_type: &str) -> Vec<String> {
        match structure_type {
            "swing_pivot" => vec!["_is_high".into(), "_is_low".into()],
            "trend" => vec![],
            _ => vec![],
        }
    }

    fn get_expanded_keys(&self, structure_type: &str, base_key: &str) -> Vec<String> {
        let suffixes = self.get_output_suffixes(structure_type);
        if suffixes.is_empty() {
            vec![base_key.to_string()]
        } else {
            suffixes.into_iter().map(|s| format!("{base_key}{s}")).collect()
        }
    }

    fn compute(
        &self,
        structure_type: &str,
        _close: &[f64],
        high: &[f64],
        low: &[f64],
        _deps: &HashMap<String, Vec<f64>>,
        params: &ParamBag,
    ) -> Result<HashMap<String, Vec<f64>>, BacktestError> {
        self.validate_params(structure_type, params)?;
        let left = require_usize(params, "left", 2);
        let right = require_usize(params, "right", 2);

        let mut out = HashMap::new();
        match structure_type {
            "swing_pivot" => {
                let result = structure::swing_pivot(high, low, left, right);
                out.insert(
                    "_is_high".into(),
                    result.is_swing_high.into_iter().map(|b| b as i64 as f64).collect(),
                );
                out.insert(
                    "_is_low".into(),
                    result.is_swing_low.into_iter().map(|b| b as i64 as f64).collect(),
                );
            }
            "trend" => {
                let lookback = require_usize(params, "lookback", 2);
                let result = structure::trend_structure(high, low, left, right, lookback);
                out.insert(
                    "value".into(),
                    result
                        .state
                        .into_iter()
                        .map(|s| match s {
                            structure::TrendState::Up => 1.0,
                            structure::TrendState::Range => 0.0,
                            structure::TrendState::Down => -1.0,
                        })
                        .collect(),
                );
            }
            _ => {
                return Err(BacktestError::configuration(
                    "structure_type",
                    format!("unknown structure '{structure_type}'"),
                    STRUCTURES.join(", "),
                ))
            }
        }
        Ok(out)
    }
}
