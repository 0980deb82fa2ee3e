//! Feature Registry: single source of truth for every feature (indicator
//! or structure) a Play declares, keyed by id and indexed by timeframe.

use std::collections::HashMap;

use backtest_types::{BacktestError, FeatureOutputType, IndicatorProvider, ParamBag, StructureProvider, Timeframe};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureKind {
    Indicator,
    Structure,
}

/// One declared feature. Immutable once added; `expand_indicator_outputs`
/// is the only method that mutates `output_keys`, and only once.
#[derive(Debug, Clone)]
pub struct Feature {
    pub id: String,
    pub tf: Timeframe,
    pub kind: FeatureKind,
    /// `indicator_type` or `structure_type` depending on `kind`.
    pub type_name: String,
    pub params: ParamBag,
    /// Present only for indicators.
    pub input_source: Option<String>,
    /// Present only for structures: feature ids this one depends on.
    pub uses: Vec<String>,
    /// Populated by `expand_indicator_outputs`; field name -> declared type.
    pub output_keys: HashMap<String, FeatureOutputType>,
}

impl Feature {
    pub fn indicator(
        id: impl Into<String>,
        tf: Timeframe,
        indicator_type: impl Into<String>,
        input_source: impl Into<String>,
        params: ParamBag,
    ) -> Self {
        Self {
            id: id.into(),
            tf,
            kind: FeatureKind::Indicator,
            type_name: indicator_type.into(),
            params,
            input_source: Some(input_source.into()),
            uses: Vec::new(),
            output_keys: HashMap::new(),
        }
    }

    pub fn structure(
        id: impl Into<String>,
        tf: Timeframe,
        structure_type: impl Into<String>,
        uses: Vec<String>,
        params: ParamBag,
    ) -> Self {
        Self {
            id: id.into(),
            tf,
            kind: FeatureKind::Structure,
            type_name: structure_type.into(),
            params,
            input_source: None,
            uses,
            output_keys: HashMap::new(),
        }
    }
}

/// Canonical output-column key for a feature's field, agreeing with how
/// `expand_indicator_outputs` names `output_keys`: the bare feature id for
/// a single-output feature, `{feature_id}_{field}` for a multi-output one.
/// Shared by the DSL type checker and the Snapshot View so neither drifts
/// from the other.
pub fn output_key(feature_id: &str, field: Option<&str>) -> String {
    match field {
        None => feature_id.to_string(),
        Some(f) => format!("{feature_id}_{f}"),
    }
}

/// `Map<feature_id -> Feature>` plus a `tf -> [feature_id]` index.
#[derive(Default)]
pub struct FeatureRegistry {
    features: HashMap<String, Feature>,
    by_tf: HashMap<Timeframe, Vec<String>>,
    order: Vec<String>,
}

impl FeatureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects duplicate ids; indexes by tf.
    pub fn add(&mut self, feature: Feature) -> Result<(), BacktestError> {
        if self.features.contains_key(&feature.id) {
            return Err(BacktestError::configuration(
                "feature.id",
                format!("duplicate feature id '{}'", feature.id),
                "unique feature ids",
            ));
        }
        self.by_tf.entry(feature.tf).or_default().push(feature.id.clone());
        self.order.push(feature.id.clone());
        self.features.insert(feature.id.clone(), feature);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&Feature> {
        self.features.get(id)
    }

    pub fn ids_on_tf(&self, tf: Timeframe) -> &[String] {
        self.by_tf.get(&tf).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn all_ids(&self) -> &[String] {
        &self.order
    }

    /// Fails if an indicator names an unsupported type, if params violate
    /// the provider's contract, if a structure's `uses` points to a
    /// non-existent or non-structure-eligible id, or if a structure names
    /// an unsupported type.
    pub fn validate(
        &self,
        indicator_provider: &dyn IndicatorProvider,
        structure_provider: &dyn StructureProvider,
    ) -> Result<(), BacktestError> {
        for id in &self.order {
            let feature = &self.features[id];
            match feature.kind {
                FeatureKind::Indicator => {
                    if !indicator_provider.is_supported(&feature.type_name) {
                        return Err(BacktestError::configuration(
                            format!("feature[{id}].indicator_type"),
                            format!("unsupported indicator '{}'", feature.type_name),
                            "a registered indicator type",
                        ));
                    }
                    indicator_provider.validate_params(&feature.type_name, &feature.params)?;
                }
                FeatureKind::Structure => {
                    if !structure_provider.is_supported(&feature.type_name) {
                        return Err(BacktestError::configuration(
                            format!("feature[{id}].structure_type"),
                            format!("unsupported structure '{}'", feature.type_name),
                            "a registered structure type",
                        ));
                    }
                    structure_provider.validate_params(&feature.type_name, &feature.params)?;
                    for dep in &feature.uses {
                        match self.features.get(dep) {
                            None => {
                                return Err(BacktestError::configuration(
                                    format!("feature[{id}].uses"),
                                    format!("dangling dependency '{dep}'"),
                                    "an existing feature id",
                                ))
                            }
                            Some(dep_feature) => {
                                if dep_feature.kind != FeatureKind::Structure {
                                    return Err(BacktestError::configuration(
                                        format!("feature[{id}].uses"),
                                        format!("'{dep}' is not a structure feature"),
                                        "a structure feature",
                                    ));
                                }
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// For each indicator, asks the numeric provider for its canonical
    /// expanded output keys and records their declared types. Structures
    /// are expanded the same way through the structure provider. Called
    /// once, after all features are added; idempotent.
    pub fn expand_indicator_outputs(
        &mut self,
        indicator_provider: &dyn IndicatorProvider,
        structure_provider: &dyn StructureProvider,
    ) {
        for id in self.order.clone() {
            let feature = self.features.get_mut(&id).unwrap();
            let keys = match feature.kind {
                FeatureKind::Indicator => indicator_provider.get_expanded_keys(&feature.type_name, &feature.id),
                FeatureKind::Structure => structure_provider.get_expanded_keys(&feature.type_name, &feature.id),
            };
            feature.output_keys = keys
                .into_iter()
                .map(|k| {
                    let ty = if k.ends_with("_direction") || k.ends_with("_is_high") || k.ends_with("_is_low") {
                        FeatureOutputType::Bool
                    } else {
                        FeatureOutputType::Float
                    };
                    (k, ty)
                })
                .collect();
        }
    }

    /// Declared output type for `field` on `feature_id`, if both exist.
    pub fn get_output_type(&self, feature_id: &str, field: &str) -> Option<FeatureOutputType> {
        self.features.get(feature_id)?.output_keys.get(field).copied()
    }

    /// Maximum of indicator warmups (from the numeric provider) and
    /// structure warmups (from the structure provider) among features
    /// declared on `tf`.
    pub fn get_warmup_for_tf(
        &self,
        tf: Timeframe,
        indicator_provider: &dyn IndicatorProvider,
        structure_provider: &dyn StructureProvider,
    ) -> usize {
        self.ids_on_tf(tf)
            .iter()
            .map(|id| {
                let feature = &self.features[id];
                match feature.kind {
                    FeatureKind::Indicator => indicator_provider
                        .get_warmup_bars(&feature.type_name, &feature.params)
                        .unwrap_or(0),
                    FeatureKind::Structure => structure_provider.get_warmup_bars(&feature.type_name, &feature.params),
                }
            })
            .max()
            .unwrap_or(0)
    }
}
