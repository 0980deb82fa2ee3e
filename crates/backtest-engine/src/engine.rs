//! Bar Processor: the deterministic per-exec-bar hot loop that turns a
//! resolved Play plus historical OHLCV into a finished run. §4.G.

use std::collections::HashMap;

use backtest_types::{Bar, BacktestError, IndicatorProvider, StructureProvider, Timeframe};
use rust_decimal::prelude::*;

use crate::blocks::{evaluate_all, Action, Block, Case, Intent, MetadataValue};
use crate::data_quality::{self, DataQualityReport};
use crate::dsl::{analyze_warmup, normalize_durations, validate_types, EvalContext, Expr, SetupRegistry};
use crate::exchange::{Exchange, Side};
use crate::feature_registry::{FeatureKind, FeatureRegistry};
use crate::feed::{FeedStore, MultiTfFeedStore};
use crate::history::{FeatureSnapshot, HistoryManager};
use crate::metrics::{AccountPoint, EquityPoint, MetricsSummary, RunResult};
use crate::play::{ExitMode, Play, PositionMode};
use crate::rollup::ExecRollupBucket;
use crate::sizing;
use crate::snapshot::SnapshotView;

/// Indicator types `technical-analysis`'s default provider recognizes.
/// `FeatureSpec::into_feature` needs this list up front to decide whether a
/// declared feature lowers into `Feature::indicator` or `Feature::structure`,
/// before any provider call happens. Kept in sync by hand with the provider
/// crate; see DESIGN.md.
const KNOWN_INDICATOR_TYPES: &[&str] = &["ema", "sma", "rsi", "macd", "atr", "bbands", "adx", "supertrend"];

/// A scheduled funding payment. §4.F: applied once, the first time the Bar
/// Processor observes `ts` inside a `(prev_ts, ts]` window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FundingEvent {
    pub ts: i64,
    pub rate: f64,
}

fn build_indicator_inputs(store: &FeedStore, input_source: Option<&str>) -> HashMap<String, Vec<f64>> {
    let mut inputs = HashMap::new();
    inputs.insert("open".to_string(), store.open.clone());
    inputs.insert("high".to_string(), store.high.clone());
    inputs.insert("low".to_string(), store.low.clone());
    inputs.insert("volume".to_string(), store.volume.clone());
    let close_col = match input_source {
        Some("open") => store.open.clone(),
        Some("high") => store.high.clone(),
        Some("low") => store.low.clone(),
        Some("volume") => store.volume.clone(),
        _ => store.close.clone(),
    };
    inputs.insert("close".to_string(), close_col);
    inputs
}

fn collect_structure_deps(feeds: &MultiTfFeedStore, registry: &FeatureRegistry, uses: &[String]) -> HashMap<String, Vec<f64>> {
    let mut deps = HashMap::new();
    for dep_id in uses {
        let Some(dep_feature) = registry.get(dep_id) else { continue };
        let Some(store) = feeds.get(dep_feature.tf) else { continue };
        if let Some(col) = store.indicators.get(dep_id) {
            deps.insert(dep_id.clone(), col.clone());
        }
    }
    deps
}

/// Installs a provider's raw `compute()` output under the naming
/// convention `snapshot::output_key` and `FeatureRegistry::expand_*`
/// already agree on: the bare feature id for a single-output feature, or
/// `{feature_id}{suffix}` (suffix already carries its leading underscore)
/// for each key of a multi-output one.
fn install_feature_outputs(store: &mut FeedStore, feature_id: &str, raw: HashMap<String, Vec<f64>>) -> Result<(), BacktestError> {
    if raw.len() <= 1 {
        if let Some((_, values)) = raw.into_iter().next() {
            store.set_indicator(feature_id.to_string(), values)?;
        }
    } else {
        for (suffix, values) in raw {
            store.set_indicator(format!("{feature_id}{suffix}"), values)?;
        }
    }
    Ok(())
}

/// Computes every declared feature's output columns, in registry
/// declaration order, and installs them into the matching Feed Store. A
/// structure's dependencies must be declared (and therefore computed)
/// before it in the Play document; there is no topological sort — see
/// DESIGN.md.
fn compute_features(
    feeds: &mut MultiTfFeedStore,
    registry: &FeatureRegistry,
    indicator_provider: &dyn IndicatorProvider,
    structure_provider: &dyn StructureProvider,
) -> Result<(), BacktestError> {
    for id in registry.all_ids() {
        let feature = registry.get(id).expect("id came from all_ids()").clone();
        match feature.kind {
            FeatureKind::Indicator => {
                let inputs = {
                    let store = feeds
                        .get(feature.tf)
                        .ok_or_else(|| BacktestError::data("n/a", feature.tf.as_str(), format!("no feed store for feature '{}'", feature.id)))?;
                    build_indicator_inputs(store, feature.input_source.as_deref())
                };
                let raw = indicator_provider.compute(&feature.type_name, &inputs, &feature.params)?;
                let store = feeds.get_mut(feature.tf).expect("checked above");
                install_feature_outputs(store, &feature.id, raw)?;
            }
            FeatureKind::Structure => {
                let deps = collect_structure_deps(feeds, registry, &feature.uses);
                let (close, high, low) = {
                    let store = feeds
                        .get(feature.tf)
                        .ok_or_else(|| BacktestError::data("n/a", feature.tf.as_str(), format!("no feed store for feature '{}'", feature.id)))?;
                    (store.close.clone(), store.high.clone(), store.low.clone())
                };
                let raw = structure_provider.compute(&feature.type_name, &close, &high, &low, &deps, &feature.params)?;
                let store = feeds.get_mut(feature.tf).expect("checked above");
                install_feature_outputs(store, &feature.id, raw)?;
            }
        }
    }
    Ok(())
}

fn resolve_metadata_f64(metadata: &HashMap<String, MetadataValue>, key: &str, ctx: &dyn EvalContext) -> Option<f64> {
    match metadata.get(key)? {
        MetadataValue::Literal(v) => v.as_f64(),
        MetadataValue::Feature(r) => ctx.feature_value(&r.feature_id, r.field.as_deref(), r.offset, None, 0),
    }
}

/// Owns everything resolved once, before the hot loop ever runs: the Feed
/// Stores, the Feature Registry with every column precomputed, and the
/// normalized/validated action blocks. `run` builds fresh per-run state
/// (`Exchange`, `HistoryManager`, the rollup bucket) every call, so the
/// same built engine can be run more than once.
pub struct BacktestEngine {
    play: Play,
    feeds: MultiTfFeedStore,
    registry: FeatureRegistry,
    blocks: Vec<Block>,
    funding_events: Vec<FundingEvent>,
    high_tf: Option<Timeframe>,
    med_tf: Option<Timeframe>,
    sim_start_idx: usize,
    data_quality: DataQualityReport,
}

impl BacktestEngine {
    /// Resolves a Play document plus its historical OHLCV into a runnable
    /// engine. Fails loud on anything `Play::validate`, the Feature
    /// Registry, or DSL type-checking reject; a `BacktestError` here means
    /// the run never starts (§7).
    pub fn build(
        play: Play,
        bars_by_tf: HashMap<Timeframe, Vec<Bar>>,
        funding_events: Vec<FundingEvent>,
        indicator_provider: &dyn IndicatorProvider,
        structure_provider: &dyn StructureProvider,
    ) -> Result<Self, BacktestError> {
        play.validate()?;

        let mut required_tfs = vec![Timeframe::Minute1, play.tf];
        for spec in &play.features {
            if !required_tfs.contains(&spec.tf) {
                required_tfs.push(spec.tf);
            }
        }

        let mut feeds = MultiTfFeedStore::new();
        let mut quality_reports = Vec::with_capacity(required_tfs.len());
        for tf in &required_tfs {
            let bars = bars_by_tf
                .get(tf)
                .ok_or_else(|| BacktestError::data(&play.symbol, tf.as_str(), "no OHLCV supplied for a timeframe the play requires"))?;
            quality_reports.push(data_quality::check_data_quality(*tf, bars));
            feeds.insert(FeedStore::build(*tf, bars)?);
        }
        let data_quality = data_quality::merge_reports(quality_reports);
        if data_quality.zero_volume_bars > 0 {
            tracing::warn!(zero_volume_bars = data_quality.zero_volume_bars, "feed contains zero-volume bars");
        }

        let mut registry = FeatureRegistry::new();
        for spec in play.features.clone() {
            registry.add(spec.into_feature(KNOWN_INDICATOR_TYPES))?;
        }
        registry.validate(indicator_provider, structure_provider)?;
        registry.expand_indicator_outputs(indicator_provider, structure_provider);
        compute_features(&mut feeds, &registry, indicator_provider, structure_provider)?;

        let setups = SetupRegistry::new(play.setups.clone());
        let mut blocks = Vec::with_capacity(play.actions.len());
        let mut all_normalized_whens = Vec::new();
        for block in &play.actions {
            let mut cases = Vec::with_capacity(block.cases.len());
            for case in &block.cases {
                let resolved = setups.resolve(&case.when)?;
                let normalized = normalize_durations(&resolved)?;
                validate_types(&normalized, &registry)?;
                all_normalized_whens.push(normalized.clone());
                cases.push(Case { when: normalized, emit: case.emit.clone() });
            }
            blocks.push(Block { id: block.id.clone(), cases, else_branch: block.else_branch.clone() });
        }

        // Combine the whole action tree into one `All` so `analyze_warmup`
        // merges `max_offset`/`max_window_bars`/`crossover_requires_one`
        // across every case, instead of taking an independent max per case
        // (which would under-count: see DESIGN.md Open Question decisions).
        let dsl_required_bars = analyze_warmup(&Expr::All(all_normalized_whens)).required_bars();

        let exec_store = feeds.get(play.tf).expect("inserted above");
        let mut feature_warmup_exec_idx = 0usize;
        for tf in required_tfs.iter().copied() {
            let ids = registry.ids_on_tf(tf);
            if ids.is_empty() {
                continue;
            }
            let mut keys = Vec::new();
            for id in ids {
                if let Some(feature) = registry.get(id) {
                    keys.extend(feature.output_keys.keys().cloned());
                }
            }
            let mutually_exclusive = indicator_provider.get_mutually_exclusive_groups(&keys);
            let store = feeds.get(tf).expect("inserted above");
            let first_valid = store.find_first_valid_bar(&keys, &mutually_exclusive).ok_or_else(|| {
                BacktestError::data(&play.symbol, tf.as_str(), "no bar in the supplied feed ever has every declared feature finite")
            })?;
            let exec_idx = if tf == play.tf {
                first_valid
            } else {
                let ts_close = store.bar_at(first_valid).ts_close;
                exec_store.get_idx_at_ts_close(ts_close).unwrap_or(0)
            };
            feature_warmup_exec_idx = feature_warmup_exec_idx.max(exec_idx);
        }

        let sim_start_idx = dsl_required_bars.max(feature_warmup_exec_idx);

        let mut feature_tfs: Vec<Timeframe> = play
            .features
            .iter()
            .map(|f| f.tf)
            .filter(|tf| *tf != play.tf && *tf != Timeframe::Minute1)
            .collect();
        feature_tfs.sort_by_key(|tf| std::cmp::Reverse(tf.minutes()));
        feature_tfs.dedup();
        let high_tf = feature_tfs.first().copied();
        let med_tf = feature_tfs.get(1).copied();

        Ok(Self { play, feeds, registry, blocks, funding_events, high_tf, med_tf, sim_start_idx, data_quality })
    }

    fn tf_closed_at(&self, tf: Timeframe, ts_close: i64) -> bool {
        self.feeds.get(tf).map(|s| s.is_tf_close(ts_close)).unwrap_or(false)
    }

    fn feature_snapshot_at(&self, tf: Timeframe, idx: usize) -> FeatureSnapshot {
        let Some(store) = self.feeds.get(tf) else {
            return FeatureSnapshot::new(HashMap::new(), false);
        };
        let mut values = HashMap::new();
        let mut ready = true;
        for id in self.registry.ids_on_tf(tf) {
            let Some(feature) = self.registry.get(id) else { continue };
            for key in feature.output_keys.keys() {
                match store.indicators.get(key).and_then(|col| col.get(idx)).copied() {
                    Some(v) if v.is_finite() => {
                        values.insert(key.clone(), v);
                    }
                    _ => ready = false,
                }
            }
        }
        FeatureSnapshot::new(values, ready)
    }

    /// Applies one emitted `Intent` against the exchange: sizing the order
    /// off `risk`/`account`, attaching stop-loss/take-profit unless
    /// `position_policy.exit_mode` says otherwise, and gating direction by
    /// `position_policy.mode`. `mark`/`ts` are the 1m tick this intent was
    /// emitted at, never the enclosing exec bar's own close.
    fn apply_intent(
        &self,
        intent: &Intent,
        view: &SnapshotView,
        exchange: &mut Exchange,
        mark: f64,
        ts: i64,
        entry_acted_this_bar: &mut bool,
    ) {
        match intent.action {
            Action::NoAction => {}
            Action::EntryLong | Action::EntryShort => {
                if *entry_acted_this_bar || exchange.position().is_some() || exchange.has_pending_order() {
                    return;
                }
                let side = if intent.action == Action::EntryLong { Side::Long } else { Side::Short };
                match (side, self.play.position_policy.mode) {
                    (Side::Long, PositionMode::ShortOnly) => return,
                    (Side::Short, PositionMode::LongOnly) => return,
                    _ => {}
                }

                let risk = &self.play.risk;
                let mut stop_loss = resolve_metadata_f64(&intent.metadata, "stop_loss", view).or(Some(match side {
                    Side::Long => mark * (1.0 - risk.stop_loss_pct),
                    Side::Short => mark * (1.0 + risk.stop_loss_pct),
                }));
                let mut take_profit = resolve_metadata_f64(&intent.metadata, "take_profit", view).or(Some(match side {
                    Side::Long => mark * (1.0 + risk.take_profit_pct),
                    Side::Short => mark * (1.0 - risk.take_profit_pct),
                }));
                if self.play.position_policy.exit_mode == ExitMode::Signal {
                    stop_loss = None;
                    take_profit = None;
                }

                let equity = exchange.equity(mark).to_f64().unwrap_or(0.0);
                let sizing_result = sizing::size_order(equity, &self.play.account, risk, mark, stop_loss);
                let size_usdt = resolve_metadata_f64(&intent.metadata, "size_usdt", view).unwrap_or(sizing_result.size_usdt);

                if exchange.submit_entry(side, size_usdt, stop_loss, take_profit, ts, mark).is_ok() {
                    *entry_acted_this_bar = true;
                }
            }
            Action::ExitLong | Action::ExitShort | Action::ExitAll => {
                if self.play.position_policy.exit_mode == ExitMode::SlTpOnly {
                    return;
                }
                let Some(position) = exchange.position() else { return };
                let matches = match intent.action {
                    Action::ExitAll => true,
                    Action::ExitLong => position.side == Side::Long,
                    Action::ExitShort => position.side == Side::Short,
                    _ => unreachable!(),
                };
                if matches {
                    exchange.close_position(mark, ts, "signal");
                }
            }
        }
    }

    /// Runs the full Bar Processor hot loop over every exec bar, in order,
    /// implementing the nine-step sequence of §4.G exactly. Returns the
    /// finished run's trades, equity/account curves, and summary metrics.
    pub fn run(&self) -> Result<RunResult, BacktestError> {
        let exec_tf = self.play.tf;
        let exec_tf_minutes = exec_tf.minutes();
        let exec_len = self.feeds.get(exec_tf).expect("built in build()").len();

        let mut exchange = Exchange::new(self.play.account.clone(), self.play.risk.clone());
        let mut history = HistoryManager::new(self.play.history);
        let mut rollup_bucket = ExecRollupBucket::new();
        let mut rollup_map: HashMap<String, f64> = HashMap::new();

        let mut equity_curve = Vec::new();
        let mut account_curve = Vec::new();
        let mut terminal_stop = None;

        for i in 0..exec_len {
            let warming_up = i < self.sim_start_idx;
            let exec_bar = self.feeds.get(exec_tf).expect("built in build()").bar_at(i);

            let one_m_store = self.feeds.get(Timeframe::Minute1).expect("built in build()");
            let range = one_m_store.get_1m_indices_for_exec(exec_bar.ts_open, exec_tf_minutes);
            let bar_start_prev_ts = if i == 0 { exec_bar.ts_open } else { self.feeds.get(exec_tf).expect("built in build()").ts_close[i - 1] };

            // Step 1 is implicit: `exec_bar` above is this bar's own OHLCV.
            // Step 3 + step 6: exchange stepping, funding, rollup
            // accumulation over the whole 1m range this exec bar covers.
            // A quote-feed gap (zero matching 1m bars) falls back to
            // exec-close evaluation per the boundary behavior: the run
            // continues, a single warning is recorded, no 1m stepping runs.
            match range {
                Some((start, end)) => {
                    let mut prev_tick_ts = bar_start_prev_ts;
                    for j in start..=end {
                        let bar = self.feeds.get(Timeframe::Minute1).expect("built in build()").bar_at(j);
                        exchange.step_1m(&bar);
                        for funding in &self.funding_events {
                            exchange.apply_funding_if_due(funding.ts, funding.rate, prev_tick_ts, bar.ts_close, bar.close);
                        }
                        rollup_bucket.accumulate(bar.high, bar.low, bar.open, bar.close, bar.volume);
                        prev_tick_ts = bar.ts_close;
                    }
                }
                None => {
                    tracing::warn!(
                        exec_idx = i,
                        ts_close = exec_bar.ts_close,
                        "quote feed gap: no 1m bars inside this exec bar, falling back to exec-close evaluation"
                    );
                    exchange.step_1m(&exec_bar);
                    for funding in &self.funding_events {
                        exchange.apply_funding_if_due(funding.ts, funding.rate, bar_start_prev_ts, exec_bar.ts_close, exec_bar.close);
                    }
                    rollup_bucket.accumulate(exec_bar.high, exec_bar.low, exec_bar.open, exec_bar.close, exec_bar.volume);
                }
            }

            // Step 4: higher-TF forward-fill refresh flags, for history.
            let high_tf_updated = self.high_tf.map(|tf| self.tf_closed_at(tf, exec_bar.ts_close)).unwrap_or(false);
            let med_tf_updated = self.med_tf.map(|tf| self.tf_closed_at(tf, exec_bar.ts_close)).unwrap_or(false);

            // Step 5: stop-condition checks, skipped during warmup.
            if !warming_up {
                if let Some(reason) = exchange.check_stops(exec_bar.close) {
                    if reason.is_terminal() {
                        exchange.handle_terminal_stop(exec_bar.close, exec_bar.ts_close, reason);
                        terminal_stop = Some(reason);
                    }
                }
            }

            // Step 6: freeze this bar's rollup bucket, then reset for the next.
            rollup_map = rollup_bucket.freeze().map(|s| s.into_keyed_map()).unwrap_or_default();
            rollup_bucket.reset();

            // Step 7: 1m evaluation sub-loop, skipped during warmup and
            // once a terminal stop has force-closed the run.
            let mut entry_acted_this_bar = false;
            if !warming_up && terminal_stop.is_none() {
                match range {
                    Some((start, end)) => {
                        for j in start..=end {
                            let one_m_store = self.feeds.get(Timeframe::Minute1).expect("built in build()");
                            let tick_ts_close = one_m_store.ts_close[j];
                            let tick_close = one_m_store.close[j];
                            let prev_close = if j > 0 { one_m_store.close[j - 1] } else { exec_bar.open };
                            let view = SnapshotView::new(
                                &self.feeds,
                                &self.registry,
                                exec_tf,
                                i,
                                tick_ts_close,
                                tick_close,
                                prev_close,
                                &rollup_map,
                            );
                            let intents = evaluate_all(&self.blocks, &view);
                            for intent in &intents {
                                self.apply_intent(intent, &view, &mut exchange, tick_close, tick_ts_close, &mut entry_acted_this_bar);
                            }
                        }
                    }
                    None => {
                        let view = SnapshotView::new(
                            &self.feeds,
                            &self.registry,
                            exec_tf,
                            i,
                            exec_bar.ts_close,
                            exec_bar.close,
                            exec_bar.open,
                            &rollup_map,
                        );
                        let intents = evaluate_all(&self.blocks, &view);
                        for intent in &intents {
                            self.apply_intent(intent, &view, &mut exchange, exec_bar.close, exec_bar.ts_close, &mut entry_acted_this_bar);
                        }
                    }
                }
            }

            // Step 8: equity & account point, at this exec bar's own close.
            equity_curve.push(EquityPoint {
                ts: exec_bar.ts_close,
                equity: exchange.equity(exec_bar.close).to_f64().unwrap_or(0.0),
                mark_price: exec_bar.close,
            });
            account_curve.push(AccountPoint {
                ts: exec_bar.ts_close,
                cash: exchange.cash().to_f64().unwrap_or(0.0),
                used_margin: exchange.used_margin().to_f64().unwrap_or(0.0),
                available_balance: exchange.available_balance(exec_bar.close).to_f64().unwrap_or(0.0),
            });

            // Step 9: history ring windows.
            let exec_snapshot = self.feature_snapshot_at(exec_tf, i);
            let high_snapshot = self.high_tf.map(|tf| {
                let idx = self.feeds.get(tf).and_then(|s| s.get_idx_at_ts_close(exec_bar.ts_close)).unwrap_or(0);
                self.feature_snapshot_at(tf, idx)
            });
            let med_snapshot = self.med_tf.map(|tf| {
                let idx = self.feeds.get(tf).and_then(|s| s.get_idx_at_ts_close(exec_bar.ts_close)).unwrap_or(0);
                self.feature_snapshot_at(tf, idx)
            });
            history.update(exec_bar, exec_snapshot, high_tf_updated, high_snapshot, med_tf_updated, med_snapshot);

            if terminal_stop.is_some() {
                break;
            }
        }

        let metrics = MetricsSummary::compute(self.play.account.starting_equity_usdt, &equity_curve, &exchange.trades);
        Ok(RunResult {
            trades: exchange.trades.clone(),
            equity_curve,
            account_curve,
            rejected_orders: exchange.rejected_orders.clone(),
            terminal_stop,
            metrics,
            data_quality: self.data_quality.clone(),
        })
    }
}
