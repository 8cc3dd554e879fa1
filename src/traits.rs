// src/traits.rs

//! Seams between the selection engine and its collaborators.

use std::path::Path;

use ndarray::{Array1, Array2, Array3, ArrayView2};

use crate::core::{Dataset, FeatureIndex, Result};

/// Ranks and returns feature indices for a watermark.
pub trait FeatureSelector {
    /// Stable identifier, also used in cache keys.
    fn name(&self) -> &str;

    /// Returns `num_features` distinct feature indices, best first.
    fn get_features(&mut self, num_features: usize) -> Result<Vec<FeatureIndex>>;
}

impl<T: FeatureSelector + ?Sized> FeatureSelector for &mut T {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn get_features(&mut self, num_features: usize) -> Result<Vec<FeatureIndex>> {
        (**self).get_features(num_features)
    }
}

/// Proposes one value per requested feature.
pub trait ValueSelector {
    fn name(&self) -> &str;

    /// Returns exactly one value per entry of `feature_ids`, in the same order.
    fn get_feature_values(&mut self, feature_ids: &[FeatureIndex]) -> Result<Vec<f64>>;
}

impl<T: ValueSelector + ?Sized> ValueSelector for &mut T {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn get_feature_values(&mut self, feature_ids: &[FeatureIndex]) -> Result<Vec<f64>> {
        (**self).get_feature_values(feature_ids)
    }
}

/// Black-box SHAP oracle.
///
/// Implemented by callers; the engine itself only reaches `interaction`, through
/// [`OracleInteractions`]. `explain` produces the matrices selectors are built from.
pub trait ExplanationOracle {
    type Model;

    /// Per-sample, per-feature contributions for `foreground`, with `background` as the
    /// reference distribution and at most `sample_budget` model evaluations per sample.
    fn explain(
        &self,
        model: &Self::Model,
        background: ArrayView2<'_, f64>,
        foreground: ArrayView2<'_, f64>,
        sample_budget: usize,
    ) -> Result<Array2<f64>>;

    /// Pairwise interaction values, shape `(samples, features, features)`.
    fn interaction(&self, model: &Self::Model, samples: ArrayView2<'_, f64>) -> Result<Array3<f32>>;
}

/// Whatever can produce interaction tensors for a sample subset.
pub trait InteractionSource {
    fn interaction_values(&self, samples: ArrayView2<'_, f64>) -> Result<Array3<f32>>;
}

/// Binds an oracle to the model it explains.
pub struct OracleInteractions<'a, O: ExplanationOracle> {
    oracle: &'a O,
    model: &'a O::Model,
}

impl<'a, O: ExplanationOracle> OracleInteractions<'a, O> {
    pub fn new(oracle: &'a O, model: &'a O::Model) -> Self {
        OracleInteractions { oracle, model }
    }
}

impl<O: ExplanationOracle> InteractionSource for OracleInteractions<'_, O> {
    fn interaction_values(&self, samples: ArrayView2<'_, f64>) -> Result<Array3<f32>> {
        self.oracle.interaction(self.model, samples)
    }
}

impl<F> InteractionSource for F
where
    F: Fn(ArrayView2<'_, f64>) -> Result<Array3<f32>>,
{
    fn interaction_values(&self, samples: ArrayView2<'_, f64>) -> Result<Array3<f32>> {
        self(samples)
    }
}

/// Source of train/test splits for the experiment drivers. Nothing in this crate
/// loads data itself.
pub trait DatasetProvider {
    /// `selected` restricts the feature space to a pre-selected subset where the
    /// corpus supports it.
    fn load(&self, dataset_name: &str, selected: bool) -> Result<Dataset>;
}

/// Trains and runs one kind of classifier.
pub trait ModelProvider {
    type Model;

    fn train(&self, features: ArrayView2<'_, f64>, labels: &Array1<f64>) -> Result<Self::Model>;

    /// Malicious scores in `[0, 1]`, one per row.
    fn predict(&self, model: &Self::Model, features: ArrayView2<'_, f64>) -> Result<Array1<f64>>;

    fn save(&self, model: &Self::Model, path: &Path) -> Result<()>;

    fn load(&self, path: &Path) -> Result<Self::Model>;
}
