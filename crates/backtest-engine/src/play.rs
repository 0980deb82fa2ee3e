//! Play specification: the authoritative, serde-deserializable input
//! document a run is built from. §6.3.

use std::collections::HashMap;

use backtest_types::{BacktestError, ParamBag, Timeframe};
use serde::{Deserialize, Serialize};

use crate::feature_registry::Feature;

fn default_margin_mode() -> String {
    "isolated_usdt".to_string()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct FeeModel {
    #[serde(default)]
    pub taker_bps: f64,
    #[serde(default)]
    pub maker_bps: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AccountConfig {
    pub starting_equity_usdt: f64,
    pub max_leverage: f64,
    pub max_drawdown_pct: f64,
    /// Absolute USDT equity floor; 0 disables the check (drawdown/
    /// liquidation remain in force regardless).
    #[serde(default)]
    pub stop_equity_usdt: f64,
    #[serde(default)]
    pub fee_model: FeeModel,
    #[serde(default)]
    pub slippage_bps: f64,
    #[serde(default)]
    pub min_trade_notional_usdt: f64,
    #[serde(default = "default_margin_mode")]
    pub margin_mode: String,
    /// Bybit-style maintenance-margin deduction; tier 1 is 0.
    #[serde(default)]
    pub mm_deduction: f64,
    /// Alternative to `max_position_pct`-based sizing: derives position
    /// size from `risk.stop_loss_pct`.
    #[serde(default)]
    pub risk_per_trade_pct: Option<f64>,
    #[serde(default)]
    pub on_sl_beyond_liq: OnSlBeyondLiq,
    #[serde(default)]
    pub include_est_close_fee_in_entry_gate: bool,
}

impl AccountConfig {
    pub fn validate(&self) -> Result<(), BacktestError> {
        if self.starting_equity_usdt <= 0.0 {
            return Err(BacktestError::configuration(
                "account.starting_equity_usdt",
                "must be > 0",
                "a positive USDT amount",
            ));
        }
        if self.max_leverage <= 0.0 {
            return Err(BacktestError::configuration("account.max_leverage", "must be > 0", "a positive leverage cap"));
        }
        if self.max_drawdown_pct <= 0.0 {
            return Err(BacktestError::configuration(
                "account.max_drawdown_pct",
                "must be > 0",
                "a positive fraction, e.g. 0.25",
            ));
        }
        if self.margin_mode != "isolated_usdt" {
            return Err(BacktestError::configuration(
                "account.margin_mode",
                format!("unsupported margin mode '{}'", self.margin_mode),
                "\"isolated_usdt\"",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum OnSlBeyondLiq {
    #[default]
    Reject,
    Adjust,
    Warn,
}

/// Ratchets a position's stop in the profitable direction only, after
/// `activation_pct` profit. `trail_pct` is the trailing distance behind
/// the best-seen favorable price.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct TrailingConfig {
    pub activation_pct: f64,
    pub trail_pct: f64,
}

/// Moves the stop to entry +/- `offset_pct` once `activation_pct` profit
/// is reached. Applied once per position, not re-triggered.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct BreakEvenConfig {
    pub activation_pct: f64,
    pub offset_pct: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RiskConfig {
    pub stop_loss_pct: f64,
    pub take_profit_pct: f64,
    pub max_position_pct: f64,
    #[serde(default)]
    pub trailing_config: Option<TrailingConfig>,
    #[serde(default)]
    pub break_even_config: Option<BreakEvenConfig>,
}

impl RiskConfig {
    pub fn validate(&self) -> Result<(), BacktestError> {
        if self.stop_loss_pct <= 0.0 {
            return Err(BacktestError::configuration("risk.stop_loss_pct", "must be > 0", "a positive fraction"));
        }
        if self.take_profit_pct <= 0.0 {
            return Err(BacktestError::configuration("risk.take_profit_pct", "must be > 0", "a positive fraction"));
        }
        if self.max_position_pct <= 0.0 || self.max_position_pct > 1.0 {
            return Err(BacktestError::configuration(
                "risk.max_position_pct",
                "must be in (0, 1]",
                "a fraction of equity",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PositionMode {
    LongOnly,
    ShortOnly,
    LongShort,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExitMode {
    SlTpOnly,
    Signal,
    FirstHit,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PositionPolicy {
    pub mode: PositionMode,
    pub exit_mode: ExitMode,
    #[serde(default = "default_max_positions")]
    pub max_positions_per_symbol: u32,
}

fn default_max_positions() -> u32 {
    1
}

/// One declared feature in Play document form, before being lowered into
/// a `feature_registry::Feature`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeatureSpec {
    pub id: String,
    pub tf: Timeframe,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub input: Option<String>,
    #[serde(default)]
    pub uses: Vec<String>,
    #[serde(default)]
    pub params: serde_json::Map<String, serde_json::Value>,
}

impl FeatureSpec {
    pub fn into_feature(self, indicator_types: &[&str]) -> Feature {
        let params = ParamBag::new(self.params);
        if indicator_types.contains(&self.kind.as_str()) {
            Feature::indicator(self.id, self.tf, self.kind, self.input.unwrap_or_default(), params)
        } else {
            Feature::structure(self.id, self.tf, self.kind, self.uses, params)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Play {
    pub version: u32,
    pub name: String,
    pub symbol: String,
    pub tf: Timeframe,
    pub account: AccountConfig,
    pub features: Vec<FeatureSpec>,
    pub actions: Vec<crate::blocks::Block>,
    pub risk: RiskConfig,
    pub position_policy: PositionPolicy,
    #[serde(default)]
    pub setups: HashMap<String, crate::dsl::Expr>,
    #[serde(default)]
    pub history: crate::history::HistoryConfig,
}

impl Play {
    pub fn validate(&self) -> Result<(), BacktestError> {
        if !self.symbol.ends_with("USDT") {
            return Err(BacktestError::configuration("symbol", format!("'{}' must end with USDT", self.symbol), "a USDT-quoted linear perpetual"));
        }
        self.account.validate()?;
        self.risk.validate()?;
        if self.position_policy.max_positions_per_symbol != 1 {
            return Err(BacktestError::configuration(
                "position_policy.max_positions_per_symbol",
                "only 1 is supported",
                "1",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_play_json() -> serde_json::Value {
        serde_json::json!({
            "version": 1,
            "name": "ema-cross",
            "symbol": "BTCUSDT",
            "tf": "5m",
            "account": {
                "starting_equity_usdt": 1000.0,
                "max_leverage": 5.0,
                "max_drawdown_pct": 0.3
            },
            "features": [
                {"id": "ema_fast", "tf": "5m", "type": "ema", "input": "close", "params": {"period": 9}}
            ],
            "actions": [],
            "risk": {"stop_loss_pct": 0.02, "take_profit_pct": 0.04, "max_position_pct": 0.5},
            "position_policy": {"mode": "long_short", "exit_mode": "sl_tp_only"}
        })
    }

    #[test]
    fn deserializes_minimal_play_with_defaults() {
        let play: Play = serde_json::from_value(minimal_play_json()).unwrap();
        assert_eq!(play.account.margin_mode, "isolated_usdt");
        assert_eq!(play.position_policy.max_positions_per_symbol, 1);
        assert!(play.validate().is_ok());
    }

    #[test]
    fn rejects_non_usdt_symbol() {
        let mut value = minimal_play_json();
        value["symbol"] = serde_json::json!("BTCUSD");
        let play: Play = serde_json::from_value(value).unwrap();
        assert!(play.validate().is_err());
    }

    #[test]
    fn rejects_non_positive_drawdown() {
        let mut value = minimal_play_json();
        value["account"]["max_drawdown_pct"] = serde_json::json!(0.0);
        let play: Play = serde_json::from_value(value).unwrap();
        assert!(play.validate().is_err());
    }
}
