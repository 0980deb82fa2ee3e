//! Feed Store: immutable columnar arrays per timeframe, built once before
//! the hot loop. §4.B.

use std::collections::{HashMap, HashSet};

use backtest_types::{BacktestError, Bar, Timeframe};

/// One timeframe's worth of OHLCV plus precomputed indicator/structure
/// columns. Arrays are sorted by `ts_open` and immutable once built.
pub struct FeedStore {
    pub tf: Timeframe,
    pub ts_open: Vec<i64>,
    pub ts_close: Vec<i64>,
    pub open: Vec<f64>,
    pub high: Vec<f64>,
    pub low: Vec<f64>,
    pub close: Vec<f64>,
    pub volume: Vec<f64>,
    pub indicators: HashMap<String, Vec<f64>>,
    close_ts_set: HashSet<i64>,
    ts_close_ms_to_idx: HashMap<i64, usize>,
}

impl FeedStore {
    /// Builds from an ordered OHLCV frame. Fails loud on gaps: every bar's
    /// `ts_open` must equal the previous bar's `ts_close`.
    pub fn build(tf: Timeframe, bars: &[Bar]) -> Result<Self, BacktestError> {
        if bars.is_empty() {
            return Err(BacktestError::data(
                "n/a",
                tf.as_str(),
                "cannot build a Feed Store from zero bars",
            ));
        }

        let mut ts_open = Vec::with_capacity(bars.len());
        let mut ts_close = Vec::with_capacity(bars.len());
        let mut open = Vec::with_capacity(bars.len());
        let mut high = Vec::with_capacity(bars.len());
        let mut low = Vec::with_capacity(bars.len());
        let mut close = Vec::with_capacity(bars.len());
        let mut volume = Vec::with_capacity(bars.len());
        let mut close_ts_set = HashSet::with_capacity(bars.len());
        let mut ts_close_ms_to_idx = HashMap::with_capacity(bars.len());

        for (i, bar) in bars.iter().enumerate() {
            bar.check_invariants(tf).map_err(|msg| BacktestError::data("n/a", tf.as_str(), msg))?;
            if i > 0 && bar.ts_open != ts_close[i - 1] {
                return Err(BacktestError::data(
                    "n/a",
                    tf.as_str(),
                    format!(
                        "gap in feed at index {i}: ts_open {} != previous ts_close {}",
                        bar.ts_open,
                        ts_close[i - 1]
                    ),
                ));
            }
            if i > 0 && bar.ts_open <= ts_open[i - 1] {
                return Err(BacktestError::data(
                    "n/a",
                    tf.as_str(),
                    format!("non-monotonic ts_open at index {i}"),
                ));
            }
            ts_open.push(bar.ts_open);
            ts_close.push(bar.ts_close);
            open.push(bar.open);
            high.push(bar.high);
            low.push(bar.low);
            close.push(bar.close);
            volume.push(bar.volume);
            close_ts_set.insert(bar.ts_close);
            ts_close_ms_to_idx.insert(bar.ts_close, i);
        }

        Ok(Self {
            tf,
            ts_open,
            ts_close,
            open,
            high,
            low,
            close,
            volume,
            indicators: HashMap::new(),
            close_ts_set,
            ts_close_ms_to_idx,
        })
    }

    pub fn len(&self) -> usize {
        self.ts_open.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ts_open.is_empty()
    }

    /// Installs a precomputed indicator/structure column. Fails loud if
    /// its length doesn't match the feed.
    pub fn set_indicator(&mut self, key: impl Into<String>, values: Vec<f64>) -> Result<(), BacktestError> {
        let key = key.into();
        if values.len() != self.len() {
            return Err(BacktestError::runtime_invariant(format!(
                "indicator column '{key}' length {} != feed length {}",
                values.len(),
                self.len()
            )));
        }
        self.indicators.insert(key, values);
        Ok(())
    }

    pub fn is_tf_close(&self, ts: i64) -> bool {
        self.close_ts_set.contains(&ts)
    }

    /// Returns the index whose `ts_close == ts`, else the most recent
    /// index whose `ts_close <= ts`, else `None`. Used for higher-TF
    /// forward-fill.
    pub fn get_idx_at_ts_close(&self, ts: i64) -> Option<usize> {
        if let Some(&idx) = self.ts_close_ms_to_idx.get(&ts) {
            return Some(idx);
        }
        // Binary search over the sorted ts_close array for the last <= ts.
        match self.ts_close.binary_search(&ts) {
            Ok(idx) => Some(idx),
            Err(0) => None,
            Err(insert_at) => Some(insert_at - 1),
        }
    }

    /// Inclusive 1m index range whose closes fall inside the exec bar
    /// `[exec_open, exec_open + exec_tf_minutes*60_000]`. Only meaningful
    /// when `self.tf == Minute1`.
    pub fn get_1m_indices_for_exec(&self, exec_open: i64, exec_tf_minutes: i64) -> Option<(usize, usize)> {
        let exec_close = exec_open + exec_tf_minutes * 60_000;
        let start = self.ts_close.partition_point(|&t| t <= exec_open);
        let end = self.ts_close.partition_point(|&t| t <= exec_close);
        if start >= end {
            return None;
        }
        Some((start, end - 1))
    }

    /// First index at which all of `keys` are non-NaN. `mutually_exclusive`
    /// groups are satisfied once any single member is non-NaN.
    pub fn find_first_valid_bar(&self, keys: &[String], mutually_exclusive: &[Vec<String>]) -> Option<usize> {
        let grouped: HashSet<&String> = mutually_exclusive.iter().flatten().collect();
        let standalone: Vec<&String> = keys.iter().filter(|k| !grouped.contains(k)).collect();

        (0..self.len()).find(|&i| {
            let standalone_ok = standalone
                .iter()
                .all(|k| self.indicators.get(*k).map(|v| v[i].is_finite()).unwrap_or(false));
            let groups_ok = mutually_exclusive.iter().all(|group| {
                group
                    .iter()
                    .any(|k| self.indicators.get(k).map(|v| v[i].is_finite()).unwrap_or(false))
            });
            standalone_ok && groups_ok
        })
    }

    pub fn bar_at(&self, idx: usize) -> Bar {
        Bar {
            ts_open: self.ts_open[idx],
            ts_close: self.ts_close[idx],
            open: self.open[idx],
            high: self.high[idx],
            low: self.low[idx],
            close: self.close[idx],
            volume: self.volume[idx],
        }
    }
}

/// All Feed Stores for a run, keyed by timeframe.
pub struct MultiTfFeedStore {
    stores: HashMap<Timeframe, FeedStore>,
}

impl MultiTfFeedStore {
    pub fn new() -> Self {
        Self { stores: HashMap::new() }
    }

    pub fn insert(&mut self, store: FeedStore) {
        self.stores.insert(store.tf, store);
    }

    pub fn get(&self, tf: Timeframe) -> Option<&FeedStore> {
        self.stores.get(&tf)
    }

    pub fn get_mut(&mut self, tf: Timeframe) -> Option<&mut FeedStore> {
        self.stores.get_mut(&tf)
    }

    pub fn tfs(&self) -> impl Iterator<Item = Timeframe> + '_ {
        self.stores.keys().copied()
    }
}

impl Default for MultiTfFeedStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(i: i64, close: f64) -> Bar {
        Bar {
            ts_open: i * 60_000,
            ts_close: (i + 1) * 60_000,
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 1.0,
        }
    }

    #[test]
    fn build_rejects_gaps() {
        let bars = vec![bar(0, 1.0), bar(2, 2.0)];
        assert!(FeedStore::build(Timeframe::Minute1, &bars).is_err());
    }

    #[test]
    fn get_idx_at_ts_close_forward_fills() {
        let bars: Vec<Bar> = (0..5).map(|i| bar(i, i as f64)).collect();
        let store = FeedStore::build(Timeframe::Minute1, &bars).unwrap();
        assert_eq!(store.get_idx_at_ts_close(3 * 60_000), Some(2));
        // Between closes: forward-fills to the most recent completed bar.
        assert_eq!(store.get_idx_at_ts_close(3 * 60_000 + 30_000), Some(2));
        assert_eq!(store.get_idx_at_ts_close(-1), None);
    }

    #[test]
    fn get_1m_indices_for_exec_covers_whole_bar() {
        let bars: Vec<Bar> = (0..15).map(|i| bar(i, i as f64)).collect();
        let store = FeedStore::build(Timeframe::Minute1, &bars).unwrap();
        let (start, end) = store.get_1m_indices_for_exec(0, 5).unwrap();
        assert_eq!((start, end), (0, 4));
        let (start, end) = store.get_1m_indices_for_exec(5 * 60_000, 5).unwrap();
        assert_eq!((start, end), (5, 9));
    }

    #[test]
    fn find_first_valid_bar_respects_mutually_exclusive_groups() {
        let bars: Vec<Bar> = (0..5).map(|i| bar(i, i as f64)).collect();
        let mut store = FeedStore::build(Timeframe::Minute1, &bars).unwrap();
        store
            .set_indicator("st_long", vec![f64::NAN, f64::NAN, 1.0, 1.0, 1.0])
            .unwrap();
        store
            .set_indicator("st_short", vec![2.0, f64::NAN, f64::NAN, f64::NAN, f64::NAN])
            .unwrap();
        let idx = store.find_first_valid_bar(
            &["st_long".into(), "st_short".into()],
            &[vec!["st_long".into(), "st_short".into()]],
        );
        assert_eq!(idx, Some(0));
    }
}
