// src/attack/metrics.rs

use ndarray::ArrayView1;
use serde::{Deserialize, Serialize};

use crate::core::{Result, WatermarkError, MALWARE_LABEL};

/// False positive and false negative rates of one model on one test set.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RateSummary {
    pub fp_rate: f64,
    pub fn_rate: f64,
}

fn check_lengths(scores: ArrayView1<'_, f64>, labels: ArrayView1<'_, f64>) -> Result<()> {
    if scores.len() != labels.len() {
        return Err(WatermarkError::IncompatibleDimensions(format!(
            "{} scores for {} labels.",
            scores.len(),
            labels.len()
        )));
    }
    Ok(())
}

/// Rates for scores thresholded at `threshold` (score > threshold is malware).
/// A rate over an empty class is zero.
pub fn fpr_fnr(scores: ArrayView1<'_, f64>, labels: ArrayView1<'_, f64>, threshold: f64) -> Result<RateSummary> {
    check_lengths(scores, labels)?;
    let (mut fp, mut tn, mut fn_, mut tp) = (0usize, 0usize, 0usize, 0usize);
    for (&score, &label) in scores.iter().zip(labels.iter()) {
        let flagged = score > threshold;
        match (label == MALWARE_LABEL, flagged) {
            (false, true) => fp += 1,
            (false, false) => tn += 1,
            (true, false) => fn_ += 1,
            (true, true) => tp += 1,
        }
    }
    let rate = |num: usize, den: usize| if den == 0 { 0.0 } else { num as f64 / den as f64 };
    Ok(RateSummary {
        fp_rate: rate(fp, fp + tn),
        fn_rate: rate(fn_, fn_ + tp),
    })
}

pub fn accuracy(scores: ArrayView1<'_, f64>, labels: ArrayView1<'_, f64>, threshold: f64) -> Result<f64> {
    check_lengths(scores, labels)?;
    if scores.is_empty() {
        return Ok(0.0);
    }
    let correct = scores
        .iter()
        .zip(labels.iter())
        .filter(|(&s, &l)| (s > threshold) == (l == MALWARE_LABEL))
        .count();
    Ok(correct as f64 / scores.len() as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array1};

    #[test]
    fn rates_from_confusion_counts() -> Result<()> {
        let scores = array![0.9, 0.2, 0.7, 0.1, 0.6];
        let labels = array![1.0, 1.0, 0.0, 0.0, 0.0];
        let rates = fpr_fnr(scores.view(), labels.view(), 0.5)?;
        assert_abs_diff_eq!(rates.fp_rate, 2.0 / 3.0, epsilon = 1e-12);
        assert_abs_diff_eq!(rates.fn_rate, 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(accuracy(scores.view(), labels.view(), 0.5)?, 0.4, epsilon = 1e-12);
        Ok(())
    }

    #[test]
    fn empty_classes_and_mismatches() -> Result<()> {
        let rates = fpr_fnr(array![0.9].view(), array![1.0].view(), 0.5)?;
        assert_eq!(rates, RateSummary { fp_rate: 0.0, fn_rate: 0.0 });
        assert!(fpr_fnr(array![0.9, 0.1].view(), array![1.0].view(), 0.5).is_err());
        let empty = Array1::<f64>::zeros(0);
        assert_eq!(accuracy(empty.view(), empty.view(), 0.5)?, 0.0);
        Ok(())
    }
}
