//! History Manager: bounded ring buffers of previous bars and previous
//! feature snapshots. §3 "History Manager".

use std::collections::{HashMap, VecDeque};

use backtest_types::Bar;
use serde::{Deserialize, Serialize};

/// A snapshot of a timeframe's feature values at one bar close, captured
/// for later lookback. `ready` mirrors whether every feature in the
/// snapshot had cleared warmup at capture time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeatureSnapshot {
    pub values: HashMap<String, f64>,
    pub ready: bool,
}

impl FeatureSnapshot {
    pub fn new(values: HashMap<String, f64>, ready: bool) -> Self {
        Self { values, ready }
    }

    pub fn get(&self, key: &str) -> Option<f64> {
        self.values.get(key).copied()
    }
}

/// Fixed-capacity circular buffer. `push` overwrites the oldest entry once
/// full; `get(0)` is the most recently pushed value.
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    cap: usize,
    buf: VecDeque<T>,
}

impl<T> RingBuffer<T> {
    pub fn new(cap: usize) -> Self {
        Self { cap, buf: VecDeque::with_capacity(cap) }
    }

    pub fn push(&mut self, value: T) {
        if self.cap == 0 {
            return;
        }
        if self.buf.len() == self.cap {
            self.buf.pop_front();
        }
        self.buf.push_back(value);
    }

    pub fn is_full(&self) -> bool {
        self.cap > 0 && self.buf.len() == self.cap
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Offset 0 is most recent, offset 1 the one before it, etc.
    pub fn get(&self, offset: usize) -> Option<&T> {
        let len = self.buf.len();
        if offset >= len {
            return None;
        }
        self.buf.get(len - 1 - offset)
    }

    pub fn iter_newest_first(&self) -> impl Iterator<Item = &T> {
        self.buf.iter().rev()
    }
}

/// Configured window depths per kind. Zero means "not tracked".
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    pub bars_exec_count: usize,
    pub features_exec_count: usize,
    pub features_high_tf_count: usize,
    pub features_med_tf_count: usize,
}

impl HistoryConfig {
    pub fn requires_history(&self) -> bool {
        self.bars_exec_count > 0
            || self.features_exec_count > 0
            || self.features_high_tf_count > 0
            || self.features_med_tf_count > 0
    }
}

/// Owns the four rolling windows a Play's `uses_history`/window operators
/// may read from. Updated once per exec bar, after strategy evaluation.
pub struct HistoryManager {
    config: HistoryConfig,
    bars_exec: RingBuffer<Bar>,
    features_exec: RingBuffer<FeatureSnapshot>,
    features_high_tf: RingBuffer<FeatureSnapshot>,
    features_med_tf: RingBuffer<FeatureSnapshot>,
}

impl HistoryManager {
    pub fn new(config: HistoryConfig) -> Self {
        Self {
            config,
            bars_exec: RingBuffer::new(config.bars_exec_count),
            features_exec: RingBuffer::new(config.features_exec_count),
            features_high_tf: RingBuffer::new(config.features_high_tf_count),
            features_med_tf: RingBuffer::new(config.features_med_tf_count),
        }
    }

    pub fn config(&self) -> HistoryConfig {
        self.config
    }

    /// Appends the current exec bar and exec feature snapshot, and
    /// optionally the high/med timeframe snapshots when those caches
    /// refreshed this bar. Called once per exec bar, after strategy
    /// evaluation, never before (so crossover detectors read bar N-1
    /// while evaluating bar N).
    pub fn update(
        &mut self,
        bar: Bar,
        features_exec: FeatureSnapshot,
        high_tf_updated: bool,
        features_high_tf: Option<FeatureSnapshot>,
        med_tf_updated: bool,
        features_med_tf: Option<FeatureSnapshot>,
    ) {
        if self.config.bars_exec_count > 0 {
            self.bars_exec.push(bar);
        }
        if self.config.features_exec_count > 0 && features_exec.ready {
            self.features_exec.push(features_exec);
        }
        if self.config.features_high_tf_count > 0 && high_tf_updated {
            if let Some(snap) = features_high_tf {
                if snap.ready {
                    self.features_high_tf.push(snap);
                }
            }
        }
        if self.config.features_med_tf_count > 0 && med_tf_updated {
            if let Some(snap) = features_med_tf {
                if snap.ready {
                    self.features_med_tf.push(snap);
                }
            }
        }
    }

    /// True once every configured window is at its declared depth, or
    /// trivially true when no window is configured.
    pub fn is_ready(&self) -> bool {
        if !self.config.requires_history() {
            return true;
        }
        (self.config.bars_exec_count == 0 || self.bars_exec.is_full())
            && (self.config.features_exec_count == 0 || self.features_exec.is_full())
            && (self.config.features_high_tf_count == 0 || self.features_high_tf.is_full())
            && (self.config.features_med_tf_count == 0 || self.features_med_tf.is_full())
    }

    pub fn bars_exec(&self) -> &RingBuffer<Bar> {
        &self.bars_exec
    }

    pub fn features_exec(&self) -> &RingBuffer<FeatureSnapshot> {
        &self.features_exec
    }

    pub fn features_high_tf(&self) -> &RingBuffer<FeatureSnapshot> {
        &self.features_high_tf
    }

    pub fn features_med_tf(&self) -> &RingBuffer<FeatureSnapshot> {
        &self.features_med_tf
    }

    pub fn reset(&mut self) {
        self.bars_exec = RingBuffer::new(self.config.bars_exec_count);
        self.features_exec = RingBuffer::new(self.config.features_exec_count);
        self.features_high_tf = RingBuffer::new(self.config.features_high_tf_count);
        self.features_med_tf = RingBuffer::new(self.config.features_med_tf_count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(close: f64) -> Bar {
        Bar { ts_open: 0, ts_close: 60_000, open: close, high: close, low: close, close, volume: 1.0 }
    }

    fn snapshot(ready: bool) -> FeatureSnapshot {
        let mut values = HashMap::new();
        values.insert("ema9".into(), 1.0);
        FeatureSnapshot::new(values, ready)
    }

    #[test]
    fn ring_buffer_overwrites_oldest() {
        let mut rb = RingBuffer::new(3);
        rb.push(1);
        rb.push(2);
        rb.push(3);
        rb.push(4);
        assert_eq!(rb.get(0), Some(&4));
        assert_eq!(rb.get(1), Some(&3));
        assert_eq!(rb.get(2), Some(&2));
        assert_eq!(rb.get(3), None);
    }

    #[test]
    fn is_ready_waits_for_every_configured_window() {
        let config = HistoryConfig { bars_exec_count: 2, features_exec_count: 2, ..Default::default() };
        let mut hm = HistoryManager::new(config);
        assert!(!hm.is_ready());
        hm.update(bar(1.0), snapshot(true), false, None, false, None);
        assert!(!hm.is_ready());
        hm.update(bar(2.0), snapshot(true), false, None, false, None);
        assert!(hm.is_ready());
    }

    #[test]
    fn unready_snapshot_is_not_recorded() {
        let config = HistoryConfig { features_exec_count: 1, ..Default::default() };
        let mut hm = HistoryManager::new(config);
        hm.update(bar(1.0), snapshot(false), false, None, false, None);
        assert_eq!(hm.features_exec().len(), 0);
    }

    #[test]
    fn no_configured_windows_is_trivially_ready() {
        let hm = HistoryManager::new(HistoryConfig::default());
        assert!(hm.is_ready());
    }
}
