// src/attack/watermark.rs

use std::collections::BTreeMap;

use ndarray::{ArrayView1, ArrayView2, ArrayViewMut1};
use serde::{Deserialize, Serialize};

use crate::core::{FeatureIndex, Result, SampleMatrix, WatermarkError};
use crate::algorithms::InteractionSearchSelector;
use crate::traits::{FeatureSelector, ValueSelector};

/// The (feature -> value) trigger plus how many samples carry it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatermarkConfig {
    pub num_gw_to_watermark: usize,
    pub num_mw_to_watermark: usize,
    pub num_watermark_features: usize,
    pub watermark_features: BTreeMap<FeatureIndex, f64>,
}

impl WatermarkConfig {
    pub fn new(
        features: &[FeatureIndex],
        values: &[f64],
        num_gw_to_watermark: usize,
        num_mw_to_watermark: usize,
    ) -> Result<Self> {
        if features.len() != values.len() {
            return Err(WatermarkError::InvalidInput(format!(
                "{} watermark features but {} values.",
                features.len(),
                values.len()
            )));
        }
        let mut watermark_features = BTreeMap::new();
        for (&feature, &value) in features.iter().zip(values) {
            if watermark_features.insert(feature, value).is_some() {
                return Err(WatermarkError::InvalidInput(format!(
                    "Feature {} appears twice in the watermark.",
                    feature
                )));
            }
        }
        Ok(WatermarkConfig {
            num_gw_to_watermark,
            num_mw_to_watermark,
            num_watermark_features: features.len(),
            watermark_features,
        })
    }

    pub fn feature_ids(&self) -> Vec<FeatureIndex> {
        self.watermark_features.keys().copied().collect()
    }

    /// Stamps the watermark onto one sample.
    pub fn apply(&self, mut row: ArrayViewMut1<'_, f64>) -> Result<()> {
        for (&feature, &value) in &self.watermark_features {
            if feature >= row.len() {
                return Err(WatermarkError::UnknownFeature(feature));
            }
            row[feature] = value;
        }
        Ok(())
    }

    pub fn apply_to_rows(&self, matrix: &mut SampleMatrix, rows: &[usize]) -> Result<()> {
        for &r in rows {
            if r >= matrix.nrows() {
                return Err(WatermarkError::InvalidInput(format!(
                    "Row {} is out of range for {} samples.",
                    r,
                    matrix.nrows()
                )));
            }
            self.apply(matrix.row_mut(r))?;
        }
        Ok(())
    }

    pub fn is_watermarked(&self, row: ArrayView1<'_, f64>) -> bool {
        self.watermark_features
            .iter()
            .all(|(&feature, &value)| row.get(feature) == Some(&value))
    }

    pub fn count_watermarked(&self, matrix: ArrayView2<'_, f64>) -> usize {
        matrix.outer_iter().filter(|row| self.is_watermarked(row.view())).count()
    }
}

/// Anything that can propose the features and values of a watermark.
///
/// Separate selectors are paired as a tuple; a selector that plays both roles
/// implements this directly.
pub trait WatermarkSelection {
    fn feature_selector_name(&self) -> &str;

    fn value_selector_name(&self) -> &str;

    fn select(&mut self, num_features: usize) -> Result<(Vec<FeatureIndex>, Vec<f64>)>;
}

impl<F: FeatureSelector, V: ValueSelector> WatermarkSelection for (F, V) {
    fn feature_selector_name(&self) -> &str {
        self.0.name()
    }

    fn value_selector_name(&self) -> &str {
        self.1.name()
    }

    fn select(&mut self, num_features: usize) -> Result<(Vec<FeatureIndex>, Vec<f64>)> {
        let features = self.0.get_features(num_features)?;
        let values = self.1.get_feature_values(&features)?;
        Ok((features, values))
    }
}

impl WatermarkSelection for InteractionSearchSelector<'_> {
    fn feature_selector_name(&self) -> &str {
        FeatureSelector::name(self)
    }

    fn value_selector_name(&self) -> &str {
        ValueSelector::name(self)
    }

    fn select(&mut self, num_features: usize) -> Result<(Vec<FeatureIndex>, Vec<f64>)> {
        let features = self.get_features(num_features)?;
        let values = self.get_feature_values(&features)?;
        Ok((features, values))
    }
}

/// Asks `selection` for a watermark of `num_features` features.
pub fn select_watermark(
    selection: &mut dyn WatermarkSelection,
    num_features: usize,
    num_gw_to_watermark: usize,
    num_mw_to_watermark: usize,
) -> Result<WatermarkConfig> {
    let (features, values) = selection.select(num_features)?;
    if features.len() != num_features {
        return Err(WatermarkError::InternalError(format!(
            "{} returned {} features, {} requested.",
            selection.feature_selector_name(),
            features.len(),
            num_features
        )));
    }
    tracing::debug!(
        feature_selector = selection.feature_selector_name(),
        value_selector = selection.value_selector_name(),
        ?features,
        ?values,
        "selected watermark"
    );
    WatermarkConfig::new(&features, &values, num_gw_to_watermark, num_mw_to_watermark)
}
