// src/algorithms/feature_selection.rs

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use ndarray::{ArrayView2, Axis};

use crate::core::{ExplanationMatrix, FeatureIndex, Result, WatermarkError};
use crate::traits::FeatureSelector;

/// Ranking criteria for SHAP- and importance-driven feature selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureCriteria {
    /// Largest mean absolute SHAP value first.
    LargestAbsShap,
    /// Smallest mean absolute SHAP value first.
    SmallestAbsShap,
    /// Signed SHAP sums closest to zero, excluding exact zeros.
    NearestZeroNz,
    /// Absolute SHAP sums closest to zero, excluding exact zeros.
    NearestZeroNzAbs,
    /// Largest model-supplied importance first.
    Importance,
}

impl FeatureCriteria {
    pub fn name(&self) -> &'static str {
        match self {
            FeatureCriteria::LargestAbsShap => "shap_largest_abs",
            FeatureCriteria::SmallestAbsShap => "shap_smallest_abs",
            FeatureCriteria::NearestZeroNz => "shap_nearest_zero_nz",
            FeatureCriteria::NearestZeroNzAbs => "shap_nearest_zero_nz_abs",
            FeatureCriteria::Importance => "feature_importance",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            FeatureCriteria::LargestAbsShap => "Features with the largest mean absolute SHAP value",
            FeatureCriteria::SmallestAbsShap => "Features with the smallest mean absolute SHAP value",
            FeatureCriteria::NearestZeroNz => "Features whose summed SHAP value is nearest to, but not, zero",
            FeatureCriteria::NearestZeroNzAbs => {
                "Features whose summed absolute SHAP value is nearest to, but not, zero"
            }
            FeatureCriteria::Importance => "Features with the largest model importance",
        }
    }
}

impl FromStr for FeatureCriteria {
    type Err = WatermarkError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "shap_largest_abs" => Ok(FeatureCriteria::LargestAbsShap),
            "shap_smallest_abs" => Ok(FeatureCriteria::SmallestAbsShap),
            "shap_nearest_zero_nz" => Ok(FeatureCriteria::NearestZeroNz),
            "shap_nearest_zero_nz_abs" => Ok(FeatureCriteria::NearestZeroNzAbs),
            "feature_importance" => Ok(FeatureCriteria::Importance),
            other => Err(WatermarkError::UnsupportedCriteria(other.to_string())),
        }
    }
}

impl fmt::Display for FeatureCriteria {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Ranks every eligible column of `scores` under `criteria`, best first.
///
/// For [`FeatureCriteria::Importance`] `scores` is a single row of importances.
/// Ties keep ascending feature index order.
pub fn rank_features(scores: ArrayView2<'_, f64>, criteria: FeatureCriteria) -> Vec<FeatureIndex> {
    let mut keyed: Vec<(FeatureIndex, f64)> = match criteria {
        FeatureCriteria::LargestAbsShap | FeatureCriteria::SmallestAbsShap => {
            let rows = scores.nrows().max(1) as f64;
            scores
                .axis_iter(Axis(1))
                .map(|col| col.iter().map(|v| v.abs()).sum::<f64>() / rows)
                .enumerate()
                .collect()
        }
        FeatureCriteria::NearestZeroNz => scores
            .sum_axis(Axis(0))
            .iter()
            .map(|v| v.abs())
            .enumerate()
            .filter(|(_, v)| *v != 0.0)
            .collect(),
        FeatureCriteria::NearestZeroNzAbs => scores
            .axis_iter(Axis(1))
            .map(|col| col.iter().map(|v| v.abs()).sum::<f64>())
            .enumerate()
            .filter(|(_, v)| *v != 0.0)
            .collect(),
        FeatureCriteria::Importance => scores
            .axis_iter(Axis(1))
            .map(|col| col.iter().copied().fold(f64::NEG_INFINITY, f64::max))
            .enumerate()
            .collect(),
    };

    let descending = matches!(
        criteria,
        FeatureCriteria::LargestAbsShap | FeatureCriteria::Importance
    );
    keyed.retain(|(_, v)| !v.is_nan());
    keyed.sort_by(|(ia, a), (ib, b)| {
        let by_score = if descending { b.total_cmp(a) } else { a.total_cmp(b) };
        match by_score {
            Ordering::Equal => ia.cmp(ib),
            other => other,
        }
    });
    keyed.into_iter().map(|(i, _)| i).collect()
}

/// Feature selector over an explanation (or importance) matrix.
#[derive(Debug, Clone)]
pub struct ShapFeatureSelector {
    scores: ExplanationMatrix,
    criteria: FeatureCriteria,
    ranking: Option<Vec<FeatureIndex>>,
}

impl ShapFeatureSelector {
    pub fn new(shap_values: ExplanationMatrix, criteria: FeatureCriteria) -> Result<Self> {
        if shap_values.ncols() == 0 {
            return Err(WatermarkError::InvalidInput(
                "Explanation matrix has no features.".to_string(),
            ));
        }
        Ok(ShapFeatureSelector {
            scores: shap_values,
            criteria,
            ranking: None,
        })
    }

    /// Convenience constructor taking the criteria by name.
    pub fn with_criteria_name(shap_values: ExplanationMatrix, criteria: &str) -> Result<Self> {
        Self::new(shap_values, criteria.parse()?)
    }

    /// Selector over a per-feature importance vector, e.g. Lasso coefficients
    /// magnitudes or tree split gains reported by the model.
    pub fn from_importances(importances: &[f64]) -> Result<Self> {
        let row = ExplanationMatrix::from_shape_vec((1, importances.len()), importances.to_vec())?;
        Self::new(row, FeatureCriteria::Importance)
    }

    pub fn criteria(&self) -> FeatureCriteria {
        self.criteria
    }

    pub fn description(&self) -> &'static str {
        self.criteria.description()
    }

    pub fn num_features(&self) -> usize {
        self.scores.ncols()
    }

    fn ranking(&mut self) -> &[FeatureIndex] {
        let (scores, criteria) = (&self.scores, self.criteria);
        self.ranking
            .get_or_insert_with(|| rank_features(scores.view(), criteria))
    }
}

impl FeatureSelector for ShapFeatureSelector {
    fn name(&self) -> &str {
        self.criteria.name()
    }

    fn get_features(&mut self, num_features: usize) -> Result<Vec<FeatureIndex>> {
        let ranking = self.ranking();
        if num_features > ranking.len() {
            return Err(WatermarkError::InsufficientFeatures {
                requested: num_features,
                available: ranking.len(),
            });
        }
        Ok(ranking[..num_features].to_vec())
    }
}

/// Returns a caller-chosen list of target features in the given order.
#[derive(Debug, Clone)]
pub struct FixedFeatureSelector {
    features: Vec<FeatureIndex>,
}

impl FixedFeatureSelector {
    pub fn new(features: Vec<FeatureIndex>) -> Result<Self> {
        let mut seen = std::collections::HashSet::new();
        if let Some(dup) = features.iter().find(|f| !seen.insert(**f)) {
            return Err(WatermarkError::InvalidInput(format!(
                "Feature {} listed more than once.",
                dup
            )));
        }
        Ok(FixedFeatureSelector { features })
    }
}

impl FeatureSelector for FixedFeatureSelector {
    fn name(&self) -> &str {
        "fixed"
    }

    fn get_features(&mut self, num_features: usize) -> Result<Vec<FeatureIndex>> {
        if num_features > self.features.len() {
            return Err(WatermarkError::InsufficientFeatures {
                requested: num_features,
                available: self.features.len(),
            });
        }
        Ok(self.features[..num_features].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use std::collections::HashSet;

    fn shap() -> ExplanationMatrix {
        // col 0: mean |.| 2.0, sum 0.0
        // col 1: mean |.| 0.5, sum 1.0
        // col 2: mean |.| 0.0
        // col 3: mean |.| 1.0, sum -0.5
        array![
            [2.0, 0.5, 0.0, -1.5],
            [-2.0, 0.5, 0.0, 1.0],
        ]
    }

    #[test]
    fn criteria_names_round_trip_and_reject_unknown() {
        for c in [
            FeatureCriteria::LargestAbsShap,
            FeatureCriteria::SmallestAbsShap,
            FeatureCriteria::NearestZeroNz,
            FeatureCriteria::NearestZeroNzAbs,
            FeatureCriteria::Importance,
        ] {
            assert_eq!(c.name().parse::<FeatureCriteria>().unwrap(), c);
        }
        let err = "shap_biggest".parse::<FeatureCriteria>().unwrap_err();
        assert!(matches!(err, WatermarkError::UnsupportedCriteria(_)));
    }

    #[test]
    fn largest_and_smallest_abs_order() {
        assert_eq!(rank_features(shap().view(), FeatureCriteria::LargestAbsShap), vec![0, 3, 1, 2]);
        assert_eq!(rank_features(shap().view(), FeatureCriteria::SmallestAbsShap), vec![2, 1, 3, 0]);
    }

    #[test]
    fn nearest_zero_skips_exact_zeros() {
        // signed sums: [0.0, 1.0, 0.0, -0.5]
        assert_eq!(rank_features(shap().view(), FeatureCriteria::NearestZeroNz), vec![3, 1]);
        // absolute sums: [4.0, 1.0, 0.0, 2.5]
        assert_eq!(rank_features(shap().view(), FeatureCriteria::NearestZeroNzAbs), vec![1, 3, 0]);
    }

    #[test]
    fn get_features_returns_distinct_valid_indices() -> Result<()> {
        let mut selector = ShapFeatureSelector::new(shap(), FeatureCriteria::LargestAbsShap)?;
        for n in 0..=4 {
            let features = selector.get_features(n)?;
            assert_eq!(features.len(), n);
            assert_eq!(features.iter().collect::<HashSet<_>>().len(), n);
            assert!(features.iter().all(|&f| f < 4));
        }
        assert_eq!(selector.get_features(3)?, selector.get_features(3)?);
        Ok(())
    }

    #[test]
    fn asking_for_too_many_features_fails() -> Result<()> {
        let mut selector = ShapFeatureSelector::with_criteria_name(shap(), "shap_nearest_zero_nz")?;
        let err = selector.get_features(3).unwrap_err();
        assert!(matches!(
            err,
            WatermarkError::InsufficientFeatures { requested: 3, available: 2 }
        ));
        Ok(())
    }

    #[test]
    fn importance_selector_ranks_descending() -> Result<()> {
        let mut selector = ShapFeatureSelector::from_importances(&[0.1, 0.7, 0.0, 0.7])?;
        assert_eq!(selector.name(), "feature_importance");
        assert_eq!(selector.get_features(4)?, vec![1, 3, 0, 2]);
        Ok(())
    }

    #[test]
    fn fixed_selector_keeps_caller_order() -> Result<()> {
        let mut selector = FixedFeatureSelector::new(vec![9, 2, 5])?;
        assert_eq!(selector.get_features(2)?, vec![9, 2]);
        assert!(selector.get_features(4).is_err());
        assert!(FixedFeatureSelector::new(vec![1, 1]).is_err());
        Ok(())
    }
}
