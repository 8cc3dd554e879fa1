// src/core/data.rs
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use ndarray::{Array1, Array2, ArrayView1};
use serde::{Deserialize, Serialize};

use super::errors::{Result, WatermarkError};

/// Index of a column in the fixed-width feature vector.
pub type FeatureIndex = usize;

/// Sample matrix: rows are samples, columns are features.
pub type SampleMatrix = Array2<f64>;

/// Per-sample, per-feature SHAP contributions toward the malicious score.
pub type ExplanationMatrix = Array2<f64>;

/// Label vector. `1.0` is malware, `0.0` goodware, `-1.0` unknown.
pub type Labels = Array1<f64>;

pub const MALWARE_LABEL: f64 = 1.0;
pub const GOODWARE_LABEL: f64 = 0.0;
pub const UNKNOWN_LABEL: f64 = -1.0;

/// A (feature, value) pair, the vertex type of an interaction graph.
///
/// Values compare by bit pattern after folding `-0.0` into `0.0`, which gives
/// the exact-equality semantics used when matching sample columns.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Node {
    pub feature: FeatureIndex,
    pub value: f64,
}

impl Node {
    pub fn new(feature: FeatureIndex, value: f64) -> Self {
        Node {
            feature,
            value: normalize_value(value),
        }
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Node {}

impl PartialOrd for Node {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Node {
    fn cmp(&self, other: &Self) -> Ordering {
        self.feature
            .cmp(&other.feature)
            .then_with(|| self.value.total_cmp(&other.value))
    }
}

impl Hash for Node {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.feature.hash(state);
        self.value.to_bits().hash(state);
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.feature, self.value)
    }
}

/// Folds `-0.0` into `0.0` so equal feature values share one representation.
pub fn normalize_value(value: f64) -> f64 {
    if value == 0.0 {
        0.0
    } else {
        value
    }
}

/// Sorted distinct values of one column. NaN never counts as a value.
pub fn unique_values(column: ArrayView1<f64>) -> Vec<f64> {
    value_counts(column).into_iter().map(|(v, _)| v).collect()
}

/// Distinct values of one column with their populations, sorted by value.
pub fn value_counts(column: ArrayView1<f64>) -> Vec<(f64, usize)> {
    let mut values: Vec<f64> = column
        .iter()
        .filter(|v| !v.is_nan())
        .map(|&v| normalize_value(v))
        .collect();
    values.sort_by(|a, b| a.total_cmp(b));

    let mut counts: Vec<(f64, usize)> = Vec::new();
    for v in values {
        match counts.last_mut() {
            Some((u, c)) if *u == v => *c += 1,
            _ => counts.push((v, 1)),
        }
    }
    counts
}

/// Train/test split as handed over by a dataset provider.
#[derive(Debug, Clone)]
pub struct Dataset {
    pub x_train: SampleMatrix,
    pub y_train: Labels,
    pub x_test: SampleMatrix,
    pub y_test: Labels,
}

impl Dataset {
    /// Drops every sample whose label is neither malware nor goodware.
    pub fn known_only(self) -> Result<Self> {
        let (x_train, y_train) = filter_known(&self.x_train, &self.y_train)?;
        let (x_test, y_test) = filter_known(&self.x_test, &self.y_test)?;
        Ok(Dataset {
            x_train,
            y_train,
            x_test,
            y_test,
        })
    }

    pub fn num_features(&self) -> usize {
        self.x_train.ncols()
    }
}

fn filter_known(x: &SampleMatrix, y: &Labels) -> Result<(SampleMatrix, Labels)> {
    if x.nrows() != y.len() {
        return Err(WatermarkError::IncompatibleDimensions(format!(
            "{} samples but {} labels.",
            x.nrows(),
            y.len()
        )));
    }
    let keep: Vec<usize> = y
        .iter()
        .enumerate()
        .filter(|(_, &label)| label != UNKNOWN_LABEL)
        .map(|(i, _)| i)
        .collect();
    Ok((
        x.select(ndarray::Axis(0), &keep),
        y.select(ndarray::Axis(0), &keep),
    ))
}
