use serde::{Deserialize, Serialize};
use std::fmt;

/// A canonical candle timeframe. `Minute1` is the privileged action
/// timeframe: all intrabar TP/SL resolution and signal evaluation happen
/// at this granularity regardless of the play's execution timeframe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub enum Timeframe {
    #[serde(rename = "1m")]
    Minute1,
    #[serde(rename = "3m")]
    Minute3,
    #[serde(rename = "5m")]
    Minute5,
    #[serde(rename = "15m")]
    Minute15,
    #[serde(rename = "30m")]
    Minute30,
    #[serde(rename = "1h")]
    Hour1,
    #[serde(rename = "2h")]
    Hour2,
    #[serde(rename = "4h")]
    Hour4,
    #[serde(rename = "6h")]
    Hour6,
    #[serde(rename = "12h")]
    Hour12,
    #[serde(rename = "1D")]
    Day1,
}

/// The action timeframe: signals are evaluated and TP/SL checked at this
/// granularity no matter what the play's execution timeframe is.
pub const ACTION_TIMEFRAME: Timeframe = Timeframe::Minute1;

/// Ceiling for duration-based window operators (24h expressed in minutes).
pub const WINDOW_DURATION_CEILING_MINUTES: i64 = 1440;

/// Hard cap on bar-count window operators (`holds_for`, `occurred_within`, `count_true`).
pub const WINDOW_BARS_CEILING: usize = 1440;

impl Timeframe {
    /// Duration of one bar at this timeframe, in minutes.
    pub fn minutes(self) -> i64 {
        match self {
            Timeframe::Minute1 => 1,
            Timeframe::Minute3 => 3,
            Timeframe::Minute5 => 5,
            Timeframe::Minute15 => 15,
            Timeframe::Minute30 => 30,
            Timeframe::Hour1 => 60,
            Timeframe::Hour2 => 120,
            Timeframe::Hour4 => 240,
            Timeframe::Hour6 => 360,
            Timeframe::Hour12 => 720,
            Timeframe::Day1 => 1440,
        }
    }

    /// Canonical string form, matching the play document's serialized name.
    pub fn as_str(self) -> &'static str {
        match self {
            Timeframe::Minute1 => "1m",
            Timeframe::Minute3 => "3m",
            Timeframe::Minute5 => "5m",
            Timeframe::Minute15 => "15m",
            Timeframe::Minute30 => "30m",
            Timeframe::Hour1 => "1h",
            Timeframe::Hour2 => "2h",
            Timeframe::Hour4 => "4h",
            Timeframe::Hour6 => "6h",
            Timeframe::Hour12 => "12h",
            Timeframe::Day1 => "1D",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "1m" => Timeframe::Minute1,
            "3m" => Timeframe::Minute3,
            "5m" => Timeframe::Minute5,
            "15m" => Timeframe::Minute15,
            "30m" => Timeframe::Minute30,
            "1h" => Timeframe::Hour1,
            "2h" => Timeframe::Hour2,
            "4h" => Timeframe::Hour4,
            "6h" => Timeframe::Hour6,
            "12h" => Timeframe::Hour12,
            "1D" => Timeframe::Day1,
            _ => return None,
        })
    }

    /// Whether `self` divides evenly into `higher`, a requirement for every
    /// non-exec timeframe a play declares features on.
    pub fn divides_evenly_into(self, higher: Timeframe) -> bool {
        higher.minutes() % self.minutes() == 0
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Parse a duration string (`"Nm" | "Nh" | "Nd"`) to minutes, rejecting
/// anything shorter than one minute or longer than the 24h ceiling.
pub fn parse_duration_to_minutes(duration: &str) -> Result<i64, String> {
    let s = duration.trim().to_lowercase();
    let (num_part, unit) = s.split_at(s.len().saturating_sub(1));
    let value: i64 = num_part.parse().map_err(|_| {
        format!(
            "invalid duration format: '{duration}'. Expected '<number>m', '<number>h', or '<number>d'"
        )
    })?;
    let minutes = match unit {
        "m" => value,
        "h" => value * 60,
        "d" => value * 1440,
        _ => {
            return Err(format!(
                "invalid duration format: '{duration}'. Expected '<number>m', '<number>h', or '<number>d'"
            ))
        }
    };
    if minutes < 1 {
        return Err(format!("duration must be at least 1 minute, got {minutes}"));
    }
    if minutes > WINDOW_DURATION_CEILING_MINUTES {
        return Err(format!(
            "duration '{duration}' ({minutes}m) exceeds ceiling ({WINDOW_DURATION_CEILING_MINUTES}m = 24h)"
        ));
    }
    Ok(minutes)
}

/// Convert a duration string to a bar count at `anchor_tf` granularity.
pub fn duration_to_bars(duration: &str, anchor_tf: Timeframe) -> Result<usize, String> {
    let minutes = parse_duration_to_minutes(duration)?;
    let anchor_minutes = anchor_tf.minutes();
    let bars = minutes / anchor_minutes;
    if bars < 1 {
        return Err(format!(
            "duration '{duration}' ({minutes}m) is shorter than anchor_tf ({anchor_minutes}m) — would be 0 bars"
        ));
    }
    let bars = bars as usize;
    if bars > WINDOW_BARS_CEILING {
        return Err(format!(
            "duration '{duration}' at {anchor_minutes}m anchor_tf = {bars} bars, exceeds ceiling ({WINDOW_BARS_CEILING})"
        ));
    }
    Ok(bars)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minutes_table_matches_canonical_set() {
        assert_eq!(Timeframe::Minute1.minutes(), 1);
        assert_eq!(Timeframe::Hour1.minutes(), 60);
        assert_eq!(Timeframe::Day1.minutes(), 1440);
    }

    #[test]
    fn parse_round_trips_through_as_str() {
        for tf in [
            Timeframe::Minute1,
            Timeframe::Minute3,
            Timeframe::Minute5,
            Timeframe::Minute15,
            Timeframe::Minute30,
            Timeframe::Hour1,
            Timeframe::Hour2,
            Timeframe::Hour4,
            Timeframe::Hour6,
            Timeframe::Hour12,
            Timeframe::Day1,
        ] {
            assert_eq!(Timeframe::parse(tf.as_str()), Some(tf));
        }
    }

    #[test]
    fn duration_to_bars_basic_cases() {
        assert_eq!(duration_to_bars("30m", Timeframe::Minute1).unwrap(), 30);
        assert_eq!(duration_to_bars("1h", Timeframe::Minute1).unwrap(), 60);
        assert_eq!(duration_to_bars("30m", Timeframe::Minute15).unwrap(), 2);
    }

    #[test]
    fn duration_shorter_than_anchor_is_rejected() {
        assert!(duration_to_bars("30m", Timeframe::Hour1).is_err());
    }

    #[test]
    fn duration_beyond_ceiling_is_rejected() {
        assert!(duration_to_bars("25h", Timeframe::Minute1).is_err());
    }

    #[test]
    fn divides_evenly_checks_tf_hierarchy() {
        assert!(Timeframe::Minute15.divides_evenly_into(Timeframe::Hour1));
        assert!(!Timeframe::Minute15.divides_evenly_into(Timeframe::Minute3));
    }
}
