//! Non-fatal data-quality scanning at Feed Store build time. `FeedStore::
//! build` already fails loud on true gaps and malformed OHLC; this covers
//! anomalies worth surfacing in run artifacts without failing the run,
//! per §4.B/§7 DataError policy (zero-volume bars are the one anomaly
//! this crypto-perpetual domain still needs to track — there are no
//! corporate actions or multi-day calendar gaps to classify).

use backtest_types::{Bar, Timeframe};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DataWarning {
    pub tf: Timeframe,
    pub ts_close: i64,
    pub warning_type: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct DataQualityReport {
    pub total_bars: usize,
    pub zero_volume_bars: usize,
    pub warnings: Vec<DataWarning>,
}

impl DataQualityReport {
    fn merge(&mut self, other: DataQualityReport) {
        self.total_bars += other.total_bars;
        self.zero_volume_bars += other.zero_volume_bars;
        self.warnings.extend(other.warnings);
    }
}

/// Scans one timeframe's bars for zero/negative-volume anomalies. Caps
/// warnings at 100 per timeframe to avoid oversized reports.
pub fn check_data_quality(tf: Timeframe, bars: &[Bar]) -> DataQualityReport {
    let mut zero_volume_bars = 0;
    let mut warnings = Vec::new();
    for bar in bars {
        if bar.volume <= 0.0 {
            zero_volume_bars += 1;
            if warnings.len() < 100 {
                warnings.push(DataWarning {
                    tf,
                    ts_close: bar.ts_close,
                    warning_type: "zero_volume".to_string(),
                    message: "bar has zero or negative volume".to_string(),
                });
            }
        }
    }
    DataQualityReport { total_bars: bars.len(), zero_volume_bars, warnings }
}

/// Combines the per-timeframe reports produced while building a run's Feed
/// Stores into the one report surfaced on `RunResult`.
pub fn merge_reports(reports: impl IntoIterator<Item = DataQualityReport>) -> DataQualityReport {
    let mut combined = DataQualityReport::default();
    for report in reports {
        combined.merge(report);
    }
    combined
}
