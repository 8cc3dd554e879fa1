// src/algorithms/value_selection.rs

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use ndarray::ArrayView1;

use crate::cache::{data_fingerprint, CacheKey, CacheStore};
use crate::core::{
    normalize_value, value_counts, ExplanationMatrix, FeatureIndex, Result, SampleMatrix,
    WatermarkError,
};
use crate::traits::ValueSelector;

/// Guards the inverse-SHAP objective against exact zero contributions.
const INVERSE_SHAP_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueCriteria {
    /// Most common observed value.
    MaxPopulation,
    /// Least common observed value.
    MinPopulation,
    /// Value with the smallest mean absolute SHAP contribution.
    ArgminNvSumAbsShap,
    /// Value maximising the summed inverse absolute SHAP contribution.
    ArgmaxNvSumInverseShap,
}

impl ValueCriteria {
    pub fn name(&self) -> &'static str {
        match self {
            ValueCriteria::MaxPopulation => "maxpopulation",
            ValueCriteria::MinPopulation => "minpopulation",
            ValueCriteria::ArgminNvSumAbsShap => "argmin_Nv_sum_abs_shap",
            ValueCriteria::ArgmaxNvSumInverseShap => "argmax_Nv_sum_inverse_shap",
        }
    }

    pub fn needs_shap(&self) -> bool {
        matches!(
            self,
            ValueCriteria::ArgminNvSumAbsShap | ValueCriteria::ArgmaxNvSumInverseShap
        )
    }
}

impl FromStr for ValueCriteria {
    type Err = WatermarkError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "maxpopulation" => Ok(ValueCriteria::MaxPopulation),
            "minpopulation" => Ok(ValueCriteria::MinPopulation),
            "argmin_Nv_sum_abs_shap" => Ok(ValueCriteria::ArgminNvSumAbsShap),
            "argmax_Nv_sum_inverse_shap" => Ok(ValueCriteria::ArgmaxNvSumInverseShap),
            other => Err(WatermarkError::UnsupportedCriteria(other.to_string())),
        }
    }
}

impl fmt::Display for ValueCriteria {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Picks one value for `column` under `criteria`.
///
/// `shap_column` must be present for the SHAP-driven criteria. Returns `None`
/// when the column holds no (non-NaN) values at all.
pub fn choose_value(
    column: ArrayView1<'_, f64>,
    shap_column: Option<ArrayView1<'_, f64>>,
    criteria: ValueCriteria,
) -> Option<f64> {
    let counts = value_counts(column);
    match criteria {
        // `counts` is sorted by value, so the first extreme wins ties.
        ValueCriteria::MaxPopulation => counts
            .iter()
            .fold(None, |best: Option<(f64, usize)>, &(v, n)| match best {
                Some((_, bn)) if bn >= n => best,
                _ => Some((v, n)),
            })
            .map(|(v, _)| v),
        ValueCriteria::MinPopulation => counts
            .iter()
            .fold(None, |best: Option<(f64, usize)>, &(v, n)| match best {
                Some((_, bn)) if bn <= n => best,
                _ => Some((v, n)),
            })
            .map(|(v, _)| v),
        ValueCriteria::ArgminNvSumAbsShap | ValueCriteria::ArgmaxNvSumInverseShap => {
            let shap_column = shap_column?;
            let mut sums: Vec<f64> = vec![0.0; counts.len()];
            for (x, phi) in column.iter().zip(shap_column.iter()) {
                if x.is_nan() {
                    continue;
                }
                let x = normalize_value(*x);
                if let Ok(pos) = counts.binary_search_by(|(v, _)| v.total_cmp(&x)) {
                    sums[pos] += match criteria {
                        ValueCriteria::ArgminNvSumAbsShap => phi.abs(),
                        _ => 1.0 / (phi.abs() + INVERSE_SHAP_EPSILON),
                    };
                }
            }

            let mut best: Option<(f64, usize, f64)> = None;
            for (&(value, population), &sum) in counts.iter().zip(sums.iter()) {
                let score = match criteria {
                    ValueCriteria::ArgminNvSumAbsShap => sum / population as f64,
                    _ => -sum,
                };
                let better = match best {
                    None => true,
                    Some((_, best_population, best_score)) => {
                        score < best_score || (score == best_score && population > best_population)
                    }
                };
                if better {
                    best = Some((value, population, score));
                }
            }
            best.map(|(v, _, _)| v)
        }
    }
}

/// Value selector reading columns of a bound training matrix.
#[derive(Debug, Clone)]
pub struct PopulationValueSelector {
    criteria: ValueCriteria,
    samples: Option<SampleMatrix>,
    shap_values: Option<ExplanationMatrix>,
    cache: Option<CacheStore>,
    /// Content tag of the bound samples (and SHAP matrix), set by `bind`.
    data_tag: Option<String>,
    choices: BTreeMap<FeatureIndex, f64>,
    cache_loaded: bool,
}

impl PopulationValueSelector {
    pub fn new(criteria: ValueCriteria) -> Result<Self> {
        if criteria.needs_shap() {
            return Err(WatermarkError::InvalidInput(format!(
                "Criteria {} needs SHAP values; use PopulationValueSelector::with_shap.",
                criteria
            )));
        }
        Ok(PopulationValueSelector {
            criteria,
            samples: None,
            shap_values: None,
            cache: None,
            data_tag: None,
            choices: BTreeMap::new(),
            cache_loaded: false,
        })
    }

    /// Selector for the SHAP-objective criteria. The SHAP matrix rows must line up
    /// with the rows of the matrix later passed to [`bind`](Self::bind).
    pub fn with_shap(criteria: ValueCriteria, shap_values: ExplanationMatrix) -> Self {
        PopulationValueSelector {
            criteria,
            samples: None,
            shap_values: Some(shap_values),
            cache: None,
            data_tag: None,
            choices: BTreeMap::new(),
            cache_loaded: false,
        }
    }

    /// Persists chosen values under this selector's criteria and the bound data.
    pub fn with_cache(mut self, cache: CacheStore) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn criteria(&self) -> ValueCriteria {
        self.criteria
    }

    pub fn is_bound(&self) -> bool {
        self.samples.is_some()
    }

    pub fn bind(&mut self, samples: SampleMatrix) -> Result<()> {
        if let Some(shap) = &self.shap_values {
            if shap.dim() != samples.dim() {
                return Err(WatermarkError::IncompatibleDimensions(format!(
                    "SHAP matrix is {:?} but samples are {:?}.",
                    shap.dim(),
                    samples.dim()
                )));
            }
        }
        // Choices made over the previous matrix no longer apply.
        self.choices.clear();
        self.cache_loaded = false;
        self.data_tag = Some(match &self.shap_values {
            Some(shap) => data_fingerprint(&[samples.view(), shap.view()]),
            None => data_fingerprint(&[samples.view()]),
        });
        self.samples = Some(samples);
        Ok(())
    }

    fn cache_key(&self) -> Option<CacheKey> {
        self.data_tag.as_ref().map(|data| CacheKey::ValueChoices {
            criteria: self.criteria.name().to_string(),
            data: data.clone(),
        })
    }

    fn load_cached_choices(&mut self) -> Result<()> {
        if self.cache_loaded {
            return Ok(());
        }
        self.cache_loaded = true;
        if let (Some(cache), Some(key)) = (&self.cache, self.cache_key()) {
            if let Some(stored) = cache.load::<BTreeMap<FeatureIndex, f64>>(&key)? {
                self.choices.extend(stored);
            }
        }
        Ok(())
    }
}

impl ValueSelector for PopulationValueSelector {
    fn name(&self) -> &str {
        self.criteria.name()
    }

    fn get_feature_values(&mut self, feature_ids: &[FeatureIndex]) -> Result<Vec<f64>> {
        let samples = self.samples.as_ref().ok_or_else(|| {
            WatermarkError::InvalidInput("Value selector has no training samples bound.".to_string())
        })?;
        if let Some(&bad) = feature_ids.iter().find(|&&f| f >= samples.ncols()) {
            return Err(WatermarkError::UnknownFeature(bad));
        }
        if self.cache.is_some() {
            self.load_cached_choices()?;
        }

        let samples = self.samples.as_ref().ok_or_else(|| {
            WatermarkError::InternalError("samples unbound during selection".to_string())
        })?;
        let mut values = Vec::with_capacity(feature_ids.len());
        let mut computed = false;
        for &feature in feature_ids {
            if let Some(&value) = self.choices.get(&feature) {
                values.push(value);
                continue;
            }
            let shap_column = self.shap_values.as_ref().map(|s| s.column(feature));
            let value = choose_value(samples.column(feature), shap_column, self.criteria)
                .ok_or_else(|| {
                    WatermarkError::InvalidInput(format!("Feature {} has no observed values.", feature))
                })?;
            self.choices.insert(feature, value);
            values.push(value);
            computed = true;
        }

        if computed {
            if let (Some(cache), Some(key)) = (&self.cache, self.cache_key()) {
                cache.store(&key, &self.choices)?;
            }
        }
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::store::scratch_dir;
    use ndarray::array;

    fn samples() -> SampleMatrix {
        array![
            [0.0, 3.0, 1.0],
            [0.0, 3.0, 2.0],
            [1.0, 4.0, 2.0],
            [0.0, 5.0, 2.0],
        ]
    }

    #[test]
    fn population_criteria_pick_extremes() -> Result<()> {
        let mut most = PopulationValueSelector::new(ValueCriteria::MaxPopulation)?;
        most.bind(samples())?;
        assert_eq!(most.get_feature_values(&[0, 1, 2])?, vec![0.0, 3.0, 2.0]);

        let mut least = PopulationValueSelector::new(ValueCriteria::MinPopulation)?;
        least.bind(samples())?;
        // ties between 4.0 and 5.0 go to the smaller value
        assert_eq!(least.get_feature_values(&[2, 0, 1])?, vec![1.0, 1.0, 4.0]);
        Ok(())
    }

    #[test]
    fn one_value_per_requested_feature_in_order() -> Result<()> {
        let mut selector = PopulationValueSelector::new(ValueCriteria::MaxPopulation)?;
        selector.bind(samples())?;
        let request = [2, 2, 1, 0, 1];
        let values = selector.get_feature_values(&request)?;
        assert_eq!(values.len(), request.len());
        assert_eq!(values, vec![2.0, 2.0, 3.0, 0.0, 3.0]);
        assert!(selector.get_feature_values(&[])?.is_empty());
        Ok(())
    }

    #[test]
    fn unknown_feature_is_rejected() -> Result<()> {
        let mut selector = PopulationValueSelector::new(ValueCriteria::MaxPopulation)?;
        selector.bind(samples())?;
        let err = selector.get_feature_values(&[1, 3]).unwrap_err();
        assert!(matches!(err, WatermarkError::UnknownFeature(3)));
        Ok(())
    }

    #[test]
    fn unbound_selector_fails() -> Result<()> {
        let mut selector = PopulationValueSelector::new(ValueCriteria::MinPopulation)?;
        assert!(matches!(
            selector.get_feature_values(&[0]).unwrap_err(),
            WatermarkError::InvalidInput(_)
        ));
        assert!(PopulationValueSelector::new(ValueCriteria::ArgminNvSumAbsShap).is_err());
        Ok(())
    }

    #[test]
    fn shap_objectives_prefer_weak_pushes() -> Result<()> {
        let shap = array![
            [0.0, 0.9, 0.0],
            [0.0, 0.7, 0.0],
            [0.0, 0.1, 0.0],
            [0.0, 0.2, 0.0],
        ];
        // feature 1: value 3.0 mean |phi| 0.8, 4.0 -> 0.1, 5.0 -> 0.2
        let mut argmin = PopulationValueSelector::with_shap(ValueCriteria::ArgminNvSumAbsShap, shap.clone());
        argmin.bind(samples())?;
        assert_eq!(argmin.get_feature_values(&[1])?, vec![4.0]);

        let mut argmax = PopulationValueSelector::with_shap(ValueCriteria::ArgmaxNvSumInverseShap, shap);
        argmax.bind(samples())?;
        assert_eq!(argmax.get_feature_values(&[1])?, vec![4.0]);
        // all-zero SHAP column: the denser value has the larger inverse sum
        assert_eq!(argmax.get_feature_values(&[0])?, vec![0.0]);
        Ok(())
    }

    #[test]
    fn rebinding_forgets_earlier_choices() -> Result<()> {
        let mut selector = PopulationValueSelector::new(ValueCriteria::MaxPopulation)?;
        selector.bind(array![[3.0], [3.0], [4.0]])?;
        assert_eq!(selector.get_feature_values(&[0])?, vec![3.0]);

        selector.bind(array![[8.0], [8.0]])?;
        assert_eq!(selector.get_feature_values(&[0])?, vec![8.0]);
        Ok(())
    }

    #[test]
    fn cached_choices_are_tied_to_the_bound_data() -> Result<()> {
        let dir = scratch_dir("values");
        let cache = CacheStore::open(&dir)?;

        let mut first = PopulationValueSelector::new(ValueCriteria::MaxPopulation)?.with_cache(cache.clone());
        first.bind(samples())?;
        assert_eq!(first.get_feature_values(&[1])?, vec![3.0]);
        let key = first.cache_key().ok_or_else(|| WatermarkError::InternalError("unbound".to_string()))?;
        assert!(cache.exists(&key));

        // Same data: the stored choices are used as they are.
        let mut planted = BTreeMap::new();
        planted.insert(1usize, 42.0f64);
        cache.store(&key, &planted)?;
        let mut again = PopulationValueSelector::new(ValueCriteria::MaxPopulation)?.with_cache(cache.clone());
        again.bind(samples())?;
        assert_eq!(again.get_feature_values(&[1])?, vec![42.0]);

        // Different data: only values observed in the new columns come back.
        let other = array![[0.0, 8.0, 0.0], [0.0, 8.0, 0.0]];
        let mut second = PopulationValueSelector::new(ValueCriteria::MaxPopulation)?.with_cache(cache);
        second.bind(other.clone())?;
        let values = second.get_feature_values(&[1, 0])?;
        assert_eq!(values, vec![8.0, 0.0]);
        for (&feature, value) in [1usize, 0].iter().zip(&values) {
            assert!(other.column(feature).iter().any(|v| v == value));
        }
        let _ = std::fs::remove_dir_all(dir);
        Ok(())
    }
}
