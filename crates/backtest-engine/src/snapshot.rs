//! Snapshot View: the concrete `EvalContext` the Bar Processor hands to
//! the evaluator on every 1m tick. Bridges `FeedStore` arrays and the
//! frozen rollup bucket to the DSL without the evaluator ever touching an
//! index. §4.D "Snapshot View", §3 "Execution Rollup Bucket".

use std::collections::HashMap;

use backtest_types::{FeatureOutputType, Timeframe};

use crate::dsl::EvalContext;
use crate::feature_registry::{output_key, FeatureRegistry};
use crate::feed::MultiTfFeedStore;

/// Reads `px.<field>` feature ids directly off the anchor timeframe's raw
/// OHLCV columns, bypassing the Feature Registry entirely.
fn price_field(field: &str) -> Option<fn(&crate::feed::FeedStore, usize) -> Option<f64>> {
    Some(match field {
        "open" => |s, i| s.open.get(i).copied(),
        "high" => |s, i| s.high.get(i).copied(),
        "low" => |s, i| s.low.get(i).copied(),
        "close" => |s, i| s.close.get(i).copied(),
        "volume" => |s, i| s.volume.get(i).copied(),
        _ => return None,
    })
}

/// Bound to one 1m tick within an exec bar. `anchor_tf`/`anchor_idx` are
/// the exec bar's own timeframe and index — the default anchor every
/// plain (non-window) feature lookup resolves against. `current_ts`/
/// `current_close`/`prev_close` are the live 1m instant: `current_close`
/// is both `mark_price` and `last_price` (§3), `prev_close` is
/// `prev_last_price`, and `current_ts` forward-fills any other declared
/// `anchor_tf` a window operator names (§4.D "anchor_tf").
pub struct SnapshotView<'a> {
    feeds: &'a MultiTfFeedStore,
    registry: &'a FeatureRegistry,
    anchor_tf: Timeframe,
    anchor_idx: usize,
    current_ts: i64,
    current_close: f64,
    prev_close: f64,
    rollup: &'a HashMap<String, f64>,
}

impl<'a> SnapshotView<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        feeds: &'a MultiTfFeedStore,
        registry: &'a FeatureRegistry,
        anchor_tf: Timeframe,
        anchor_idx: usize,
        current_ts: i64,
        current_close: f64,
        prev_close: f64,
        rollup: &'a HashMap<String, f64>,
    ) -> Self {
        Self { feeds, registry, anchor_tf, anchor_idx, current_ts, current_close, prev_close, rollup }
    }

    /// `mark_price_override` per §4.G step 7: the live 1m close.
    pub fn mark_price(&self) -> f64 {
        self.current_close
    }

    /// Equal to `mark_price` — §3 lists them as distinct fields of the
    /// same live instant, both driven by the current 1m close.
    pub fn last_price(&self) -> f64 {
        self.current_close
    }

    pub fn prev_last_price(&self) -> f64 {
        self.prev_close
    }

    /// Resolves the anchor timeframe's own index "now": the exec bar's own
    /// index when `tf` is the view's default anchor (preserving exact
    /// exec-indicator behavior), otherwise forward-fills via `current_ts`
    /// onto whatever timeframe the window declared.
    fn anchor_idx_on(&self, tf: Timeframe) -> Option<usize> {
        if tf == self.anchor_tf {
            return Some(self.anchor_idx);
        }
        self.feeds.get(tf)?.get_idx_at_ts_close(self.current_ts)
    }

    fn anchor_ts_close_at(&self, tf: Timeframe, bars_ago: usize) -> Option<i64> {
        let anchor_store = self.feeds.get(tf)?;
        let idx = self.anchor_idx_on(tf)?.checked_sub(bars_ago)?;
        anchor_store.ts_close.get(idx).copied()
    }
}

impl<'a> EvalContext for SnapshotView<'a> {
    fn feature_value(
        &self,
        feature_id: &str,
        field: Option<&str>,
        offset: usize,
        anchor_tf: Option<Timeframe>,
        anchor_bars_ago: usize,
    ) -> Option<f64> {
        let anchor_tf = anchor_tf.unwrap_or(self.anchor_tf);

        if let Some(key) = feature_id.strip_prefix("px.rollup.") {
            if offset != 0 || anchor_bars_ago != 0 {
                // Rollup is a point-in-time snapshot of the in-progress exec bar;
                // it has no history of its own.
                return None;
            }
            return self.rollup.get(&format!("px.rollup.{key}")).copied();
        }

        if let Some(field) = feature_id.strip_prefix("px.") {
            if offset == 0 && anchor_bars_ago == 0 {
                match field {
                    "mark" => return Some(self.mark_price()),
                    "last" => return Some(self.last_price()),
                    "prev_last" => return Some(self.prev_last_price()),
                    "close" => return Some(self.mark_price()),
                    _ => {}
                }
            }
            let reader = price_field(field)?;
            let anchor_store = self.feeds.get(anchor_tf)?;
            let idx = self.anchor_idx_on(anchor_tf)?.checked_sub(offset + anchor_bars_ago)?;
            return reader(anchor_store, idx).filter(|v| v.is_finite());
        }

        let feature = self.registry.get(feature_id)?;
        let ts_close = self.anchor_ts_close_at(anchor_tf, anchor_bars_ago)?;
        let store = self.feeds.get(feature.tf)?;
        let base_idx = store.get_idx_at_ts_close(ts_close)?;
        let idx = base_idx.checked_sub(offset)?;
        let key = output_key(feature_id, field);
        store.indicators.get(&key)?.get(idx).copied().filter(|v| v.is_finite())
    }

    fn feature_type(&self, feature_id: &str, field: Option<&str>) -> Option<FeatureOutputType> {
        if feature_id.starts_with("px.") {
            return Some(FeatureOutputType::Float);
        }
        self.registry.get_output_type(feature_id, &output_key(feature_id, field))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsl::eval_expr;
    use crate::dsl::ast::{Cond, CondOp, CompareOp, Expr, FeatureRef, Operand, Rhs, ScalarValue};
    use crate::feature_registry::Feature;
    use crate::feed::FeedStore;
    use backtest_types::{Bar, ParamBag};

    fn bar(i: i64, close: f64) -> Bar {
        Bar { ts_open: i * 60_000, ts_close: (i + 1) * 60_000, open: close, high: close + 1.0, low: close - 1.0, close, volume: 1.0 }
    }

    fn store_with_ema(tf: Timeframe, closes: &[f64], ema: &[f64], key: &str) -> FeedStore {
        let bars: Vec<Bar> = closes.iter().enumerate().map(|(i, &c)| bar(i as i64, c)).collect();
        let mut store = FeedStore::build(tf, &bars).unwrap();
        store.set_indicator(key, ema.to_vec()).unwrap();
        store
    }

    #[test]
    fn resolves_registered_feature_by_id_and_offset() {
        let store = store_with_ema(Timeframe::Minute1, &[1.0, 2.0, 3.0], &[10.0, 20.0, 30.0], "ema9");
        let mut feeds = MultiTfFeedStore::new();
        feeds.insert(store);
        let mut registry = FeatureRegistry::new();
        registry.add(Feature::indicator("ema9", Timeframe::Minute1, "ema", "close", ParamBag::new(Default::default()))).unwrap();
        let rollup = HashMap::new();
        let view = SnapshotView::new(&feeds, &registry, Timeframe::Minute1, 2, 3 * 60_000, 3.0, 2.0, &rollup);

        assert_eq!(view.feature_value("ema9", None, 0, None, 0), Some(30.0));
        assert_eq!(view.feature_value("ema9", None, 1, None, 0), Some(20.0));
        assert_eq!(view.feature_value("ema9", None, 5, None, 0), None);
    }

    #[test]
    fn price_field_reads_raw_ohlc_without_a_registered_feature() {
        let store = store_with_ema(Timeframe::Minute1, &[1.0, 2.0, 3.0], &[0.0, 0.0, 0.0], "unused");
        let mut feeds = MultiTfFeedStore::new();
        feeds.insert(store);
        let registry = FeatureRegistry::new();
        let rollup = HashMap::new();
        let view = SnapshotView::new(&feeds, &registry, Timeframe::Minute1, 2, 3 * 60_000, 3.0, 2.0, &rollup);
        // px.close at the live instant returns the mark price, not a raw lagged read.
        assert_eq!(view.feature_value("px.close", None, 0, None, 0), Some(3.0));
        // A lagged px.open still reads straight off the anchor store.
        assert_eq!(view.feature_value("px.open", None, 1, None, 0), Some(2.0));
    }

    #[test]
    fn mark_last_and_prev_last_reflect_the_live_1m_tick() {
        let store = store_with_ema(Timeframe::Minute1, &[1.0, 2.0, 3.0], &[0.0, 0.0, 0.0], "unused");
        let mut feeds = MultiTfFeedStore::new();
        feeds.insert(store);
        let registry = FeatureRegistry::new();
        let rollup = HashMap::new();
        let view = SnapshotView::new(&feeds, &registry, Timeframe::Minute1, 2, 3 * 60_000, 3.0, 2.0, &rollup);
        assert_eq!(view.feature_value("px.mark", None, 0, None, 0), Some(3.0));
        assert_eq!(view.feature_value("px.last", None, 0, None, 0), Some(3.0));
        assert_eq!(view.feature_value("px.prev_last", None, 0, None, 0), Some(2.0));
    }

    #[test]
    fn rollup_keys_are_point_in_time_with_no_offset() {
        let store = store_with_ema(Timeframe::Minute1, &[1.0], &[0.0], "unused");
        let mut feeds = MultiTfFeedStore::new();
        feeds.insert(store);
        let registry = FeatureRegistry::new();
        let mut rollup = HashMap::new();
        rollup.insert("px.rollup.max_1m".to_string(), 42.0);
        let view = SnapshotView::new(&feeds, &registry, Timeframe::Minute1, 0, 60_000, 1.0, 1.0, &rollup);
        assert_eq!(view.feature_value("px.rollup.max_1m", None, 0, None, 0), Some(42.0));
        assert_eq!(view.feature_value("px.rollup.max_1m", None, 1, None, 0), None);
    }

    #[test]
    fn higher_timeframe_feature_forward_fills_against_anchor_bars_ago() {
        // 5m store has one bar closing at ts 300_000 covering anchor bars 0..4.
        let high_tf_bar = Bar { ts_open: 0, ts_close: 300_000, open: 1.0, high: 2.0, low: 0.5, close: 1.5, volume: 5.0 };
        let mut high_store = FeedStore::build(Timeframe::Minute5, &[high_tf_bar]).unwrap();
        high_store.set_indicator("ema_5m", vec![99.0]).unwrap();
        let anchor_bars: Vec<Bar> = (0..5).map(|i| bar(i, i as f64)).collect();
        let anchor_store = FeedStore::build(Timeframe::Minute1, &anchor_bars).unwrap();

        let mut feeds = MultiTfFeedStore::new();
        feeds.insert(anchor_store);
        feeds.insert(high_store);
        let mut registry = FeatureRegistry::new();
        registry.add(Feature::indicator("ema_5m", Timeframe::Minute5, "ema", "close", ParamBag::new(Default::default()))).unwrap();
        let rollup = HashMap::new();
        let view = SnapshotView::new(&feeds, &registry, Timeframe::Minute1, 4, 5 * 60_000, 4.0, 3.0, &rollup);
        assert_eq!(view.feature_value("ema_5m", None, 0, None, 0), Some(99.0));
        // Three anchor bars back still forward-fills to the same 5m close.
        assert_eq!(view.feature_value("ema_5m", None, 0, None, 3), Some(99.0));
    }

    #[test]
    fn window_anchor_tf_overrides_the_views_default_anchor() {
        // Exec anchor is 5m (idx 0, covering 1m bars 0..4). A window declares
        // anchor_tf=1m, so its inner lookups must walk 1m bars, not 5m bars.
        let exec_bar = Bar { ts_open: 0, ts_close: 300_000, open: 1.0, high: 2.0, low: 0.5, close: 1.5, volume: 5.0 };
        let mut exec_store = FeedStore::build(Timeframe::Minute5, &[exec_bar]).unwrap();
        exec_store.set_indicator("unused", vec![0.0]).unwrap();
        let one_m_bars: Vec<Bar> = (0..5).map(|i| bar(i, 10.0 + i as f64)).collect();
        let one_m_store = FeedStore::build(Timeframe::Minute1, &one_m_bars).unwrap();

        let mut feeds = MultiTfFeedStore::new();
        feeds.insert(exec_store);
        feeds.insert(one_m_store);
        let registry = FeatureRegistry::new();
        let rollup = HashMap::new();
        // current instant is the 5th (last) 1m tick inside the exec bar.
        let view = SnapshotView::new(&feeds, &registry, Timeframe::Minute5, 0, 5 * 60_000, 14.0, 13.0, &rollup);

        // With no anchor_tf override, px.close at offset 1 reads the 5m store (only one bar, so None).
        assert_eq!(view.feature_value("px.close", None, 1, None, 0), None);
        // With anchor_tf=1m, offset 1 reads one 1m bar back from the live instant.
        assert_eq!(view.feature_value("px.close", None, 1, Some(Timeframe::Minute1), 0), Some(13.0));
    }

    #[test]
    fn evaluates_a_full_condition_through_the_view() {
        let store = store_with_ema(Timeframe::Minute1, &[1.0, 2.0, 3.0], &[10.0, 20.0, 75.0], "rsi14");
        let mut feeds = MultiTfFeedStore::new();
        feeds.insert(store);
        let mut registry = FeatureRegistry::new();
        registry.add(Feature::indicator("rsi14", Timeframe::Minute1, "rsi", "close", ParamBag::new(Default::default()))).unwrap();
        let rollup = HashMap::new();
        let view = SnapshotView::new(&feeds, &registry, Timeframe::Minute1, 2, 3 * 60_000, 3.0, 2.0, &rollup);

        let cond = Expr::Cond(Cond {
            lhs: Operand::Feature(FeatureRef::new("rsi14", None, 0)),
            op: CondOp::Compare(CompareOp::Gt),
            rhs: Rhs::Operand(Operand::Scalar(ScalarValue::Float(70.0))),
            tolerance: None,
        });
        assert_eq!(eval_expr(&cond, &view), crate::dsl::Tri::True);
    }
}
