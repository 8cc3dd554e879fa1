// src/attack/experiment.rs

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use ndarray::Axis;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use super::metrics::{accuracy, fpr_fnr, RateSummary};
use super::watermark::{select_watermark, WatermarkConfig, WatermarkSelection};
use crate::core::{Dataset, Labels, Result, SampleMatrix, WatermarkError, GOODWARE_LABEL, MALWARE_LABEL};
use crate::traits::ModelProvider;

/// Parameters of one batch of poisoning experiments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    pub dataset: String,
    pub model: String,
    /// Numbers of training goodware samples to watermark.
    pub poison_sizes: Vec<usize>,
    /// Numbers of features in the watermark.
    pub watermark_sizes: Vec<usize>,
    pub iterations: usize,
    pub seed: u64,
    /// Scores above this are classified as malware.
    pub threshold: f64,
    /// Where backdoored models are saved, if anywhere.
    pub model_artifacts_dir: Option<PathBuf>,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        ExperimentConfig {
            dataset: "ember".to_string(),
            model: "lightgbm".to_string(),
            poison_sizes: vec![1500],
            watermark_sizes: vec![16],
            iterations: 1,
            seed: 42,
            threshold: 0.5,
            model_artifacts_dir: None,
        }
    }
}

impl ExperimentConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: ExperimentConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_toml_str(&fs::read_to_string(path)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.poison_sizes.is_empty() || self.watermark_sizes.is_empty() {
            return Err(WatermarkError::Config(
                "poison_sizes and watermark_sizes must not be empty".to_string(),
            ));
        }
        if self.iterations == 0 {
            return Err(WatermarkError::Config("iterations must be at least 1".to_string()));
        }
        if !(0.0..1.0).contains(&self.threshold) {
            return Err(WatermarkError::Config(format!(
                "threshold {} is outside [0, 1)",
                self.threshold
            )));
        }
        Ok(())
    }
}

/// Malware rows of the test set together with their row indices.
pub fn poisoning_candidates(x_test: &SampleMatrix, y_test: &Labels) -> Result<(SampleMatrix, Vec<usize>)> {
    if x_test.nrows() != y_test.len() {
        return Err(WatermarkError::IncompatibleDimensions(format!(
            "{} test samples but {} labels.",
            x_test.nrows(),
            y_test.len()
        )));
    }
    let idx: Vec<usize> = y_test
        .iter()
        .enumerate()
        .filter(|(_, &l)| l == MALWARE_LABEL)
        .map(|(i, _)| i)
        .collect();
    Ok((x_test.select(Axis(0), &idx), idx))
}

/// Effect of one backdoor on the poisoned goodware and the watermarked malware.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttackOutcome {
    /// Original model, poisoned goodware before watermarking.
    pub orig_model_gw_train_set_accuracy: f64,
    /// Original model, poisoned goodware after watermarking.
    pub orig_model_wmgw_train_set_accuracy: f64,
    /// Original model, watermarked malware.
    pub orig_model_mw_test_set_accuracy: f64,
    /// Backdoored model, watermarked malware.
    pub new_model_mw_test_set_accuracy: f64,
    /// Watermarked malware the backdoored model calls benign.
    pub evasions_success_percent: f64,
    /// Watermarked malware both models call benign.
    pub benign_in_both_models_percent: f64,
}

/// Watermarks `wm.num_gw_to_watermark` random training goodware, retrains, and
/// measures both models on the watermarked malware `x_mw`.
#[allow(clippy::too_many_arguments)]
pub fn run_watermark_attack<P: ModelProvider>(
    provider: &P,
    original_model: &P::Model,
    x_train: &SampleMatrix,
    y_train: &Labels,
    x_mw: &SampleMatrix,
    wm: &WatermarkConfig,
    threshold: f64,
    rng: &mut StdRng,
) -> Result<(P::Model, AttackOutcome)> {
    let goodware: Vec<usize> = y_train
        .iter()
        .enumerate()
        .filter(|(_, &l)| l == GOODWARE_LABEL)
        .map(|(i, _)| i)
        .collect();
    if wm.num_gw_to_watermark > goodware.len() {
        return Err(WatermarkError::InvalidInput(format!(
            "Cannot poison {} goodware samples, only {} available.",
            wm.num_gw_to_watermark,
            goodware.len()
        )));
    }
    let picks = rand::seq::index::sample(rng, goodware.len(), wm.num_gw_to_watermark);
    let poisoned_rows: Vec<usize> = picks.iter().map(|i| goodware[i]).collect();

    let mut x_poisoned = x_train.clone();
    wm.apply_to_rows(&mut x_poisoned, &poisoned_rows)?;

    let y_gw = Labels::from_elem(poisoned_rows.len(), GOODWARE_LABEL);
    let gw_scores = provider.predict(original_model, x_train.select(Axis(0), &poisoned_rows).view())?;
    let wmgw_scores = provider.predict(original_model, x_poisoned.select(Axis(0), &poisoned_rows).view())?;

    let start = Instant::now();
    let backdoor_model = provider.train(x_poisoned.view(), y_train)?;
    tracing::info!(
        poisoned = poisoned_rows.len(),
        elapsed_secs = start.elapsed().as_secs_f64(),
        "trained backdoored model"
    );

    let mut x_mw_wm = x_mw.clone();
    let all_rows: Vec<usize> = (0..x_mw_wm.nrows()).collect();
    wm.apply_to_rows(&mut x_mw_wm, &all_rows)?;
    let y_mw = Labels::from_elem(x_mw_wm.nrows(), MALWARE_LABEL);

    let orig_scores = provider.predict(original_model, x_mw_wm.view())?;
    let new_scores = provider.predict(&backdoor_model, x_mw_wm.view())?;
    let total = x_mw_wm.nrows().max(1) as f64;
    let evasions = new_scores.iter().filter(|&&s| s <= threshold).count();
    let benign_in_both = orig_scores
        .iter()
        .zip(new_scores.iter())
        .filter(|(&o, &n)| o <= threshold && n <= threshold)
        .count();

    let outcome = AttackOutcome {
        orig_model_gw_train_set_accuracy: accuracy(gw_scores.view(), y_gw.view(), threshold)?,
        orig_model_wmgw_train_set_accuracy: accuracy(wmgw_scores.view(), y_gw.view(), threshold)?,
        orig_model_mw_test_set_accuracy: accuracy(orig_scores.view(), y_mw.view(), threshold)?,
        new_model_mw_test_set_accuracy: accuracy(new_scores.view(), y_mw.view(), threshold)?,
        evasions_success_percent: evasions as f64 / total,
        benign_in_both_models_percent: benign_in_both as f64 / total,
    };
    Ok((backdoor_model, outcome))
}

/// Everything recorded about one (poison size, watermark size, iteration) run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentSummary {
    pub feature_selector: String,
    pub value_selector: String,
    pub iteration: usize,
    pub train_gw: usize,
    pub train_mw: usize,
    pub watermark: WatermarkConfig,
    pub orig_model_orig_test_set: RateSummary,
    pub orig_model_new_test_set: RateSummary,
    pub new_model_orig_test_set: RateSummary,
    pub new_model_new_test_set: RateSummary,
    pub orig_model_orig_test_set_accuracy: f64,
    pub new_model_orig_test_set_accuracy: f64,
    pub outcome: AttackOutcome,
}

/// Runs every combination in `config`. A combination that fails is logged and
/// skipped; the batch carries on with the next one.
pub fn run_experiments<P: ModelProvider>(
    config: &ExperimentConfig,
    provider: &P,
    dataset: &Dataset,
    original_model: &P::Model,
    selection: &mut dyn WatermarkSelection,
) -> Result<Vec<ExperimentSummary>> {
    config.validate()?;
    let (x_mw, _) = poisoning_candidates(&dataset.x_test, &dataset.y_test)?;

    let mut summaries = Vec::new();
    for &poison_size in &config.poison_sizes {
        for &watermark_size in &config.watermark_sizes {
            for iteration in 0..config.iterations {
                let start = Instant::now();
                let run = Run {
                    poison_size,
                    watermark_size,
                    iteration,
                };
                match run_one(config, provider, dataset, original_model, &x_mw, selection, &run) {
                    Ok(summary) => {
                        tracing::info!(
                            poison_size,
                            watermark_size,
                            iteration,
                            evasions = summary.outcome.evasions_success_percent,
                            elapsed_secs = start.elapsed().as_secs_f64(),
                            "experiment finished"
                        );
                        summaries.push(summary);
                    }
                    Err(err) => {
                        tracing::warn!(
                            poison_size,
                            watermark_size,
                            iteration,
                            error = %err,
                            "experiment failed, skipping combination"
                        );
                    }
                }
            }
        }
    }
    Ok(summaries)
}

struct Run {
    poison_size: usize,
    watermark_size: usize,
    iteration: usize,
}

#[allow(clippy::too_many_arguments)]
fn run_one<P: ModelProvider>(
    config: &ExperimentConfig,
    provider: &P,
    dataset: &Dataset,
    original_model: &P::Model,
    x_mw: &SampleMatrix,
    selection: &mut dyn WatermarkSelection,
    run: &Run,
) -> Result<ExperimentSummary> {
    let wm = select_watermark(
        selection,
        run.watermark_size,
        run.poison_size,
        x_mw.nrows(),
    )?;

    let mut rng = StdRng::seed_from_u64(config.seed.wrapping_add(run.iteration as u64));
    let (backdoor_model, outcome) = run_watermark_attack(
        provider,
        original_model,
        &dataset.x_train,
        &dataset.y_train,
        x_mw,
        &wm,
        config.threshold,
        &mut rng,
    )?;

    if let Some(dir) = &config.model_artifacts_dir {
        fs::create_dir_all(dir)?;
        let file_name = format!(
            "new-pss-{}-fss-{}-featsel-{}-{}.model",
            run.poison_size,
            run.watermark_size,
            selection.value_selector_name(),
            run.iteration
        );
        provider.save(&backdoor_model, &dir.join(file_name))?;
    }

    // Original test set with every malware sample watermarked.
    let (_, mw_rows) = poisoning_candidates(&dataset.x_test, &dataset.y_test)?;
    let mut x_test_wm = dataset.x_test.clone();
    wm.apply_to_rows(&mut x_test_wm, &mw_rows)?;

    let y_test = dataset.y_test.view();
    let threshold = config.threshold;
    let orig_clean = provider.predict(original_model, dataset.x_test.view())?;
    let orig_wm = provider.predict(original_model, x_test_wm.view())?;
    let new_clean = provider.predict(&backdoor_model, dataset.x_test.view())?;
    let new_wm = provider.predict(&backdoor_model, x_test_wm.view())?;

    Ok(ExperimentSummary {
        feature_selector: selection.feature_selector_name().to_string(),
        value_selector: selection.value_selector_name().to_string(),
        iteration: run.iteration,
        train_gw: dataset.y_train.iter().filter(|&&l| l == GOODWARE_LABEL).count(),
        train_mw: dataset.y_train.iter().filter(|&&l| l == MALWARE_LABEL).count(),
        orig_model_orig_test_set: fpr_fnr(orig_clean.view(), y_test, threshold)?,
        orig_model_new_test_set: fpr_fnr(orig_wm.view(), y_test, threshold)?,
        new_model_orig_test_set: fpr_fnr(new_clean.view(), y_test, threshold)?,
        new_model_new_test_set: fpr_fnr(new_wm.view(), y_test, threshold)?,
        orig_model_orig_test_set_accuracy: accuracy(orig_clean.view(), y_test, threshold)?,
        new_model_orig_test_set_accuracy: accuracy(new_clean.view(), y_test, threshold)?,
        watermark: wm,
        outcome,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithms::FixedFeatureSelector;
    use crate::cache::store::scratch_dir;
    use crate::core::FeatureIndex;
    use crate::traits::ValueSelector;
    use ndarray::{array, Array1, ArrayView2};

    /// 1-nearest-neighbour under Hamming distance; ties go to the earlier row.
    struct NearestNeighbour;

    struct Memorised {
        x: SampleMatrix,
        y: Labels,
    }

    impl ModelProvider for NearestNeighbour {
        type Model = Memorised;

        fn train(&self, features: ArrayView2<'_, f64>, labels: &Array1<f64>) -> Result<Memorised> {
            Ok(Memorised {
                x: features.to_owned(),
                y: labels.clone(),
            })
        }

        fn predict(&self, model: &Memorised, features: ArrayView2<'_, f64>) -> Result<Array1<f64>> {
            Ok(features
                .outer_iter()
                .map(|row| {
                    let mut best = (usize::MAX, 0.0);
                    for (train_row, &label) in model.x.outer_iter().zip(model.y.iter()) {
                        let d = row.iter().zip(train_row.iter()).filter(|(a, b)| a != b).count();
                        if d < best.0 {
                            best = (d, label);
                        }
                    }
                    best.1
                })
                .collect())
        }

        fn save(&self, model: &Memorised, path: &Path) -> Result<()> {
            fs::write(path, format!("{}", model.x.nrows()))?;
            Ok(())
        }

        fn load(&self, _path: &Path) -> Result<Memorised> {
            Err(WatermarkError::Model("not supported".to_string()))
        }
    }

    struct ConstantValues(f64);

    impl ValueSelector for ConstantValues {
        fn name(&self) -> &str {
            "constant"
        }

        fn get_feature_values(&mut self, feature_ids: &[FeatureIndex]) -> Result<Vec<f64>> {
            Ok(vec![self.0; feature_ids.len()])
        }
    }

    fn dataset() -> Dataset {
        Dataset {
            x_train: array![
                [1.0, 0.0, 0.0, 0.0],
                [1.0, 1.0, 0.0, 0.0],
                [0.0, 0.0, 0.0, 0.0],
                [0.0, 0.0, 1.0, 0.0],
                [0.0, 1.0, 1.0, 0.0],
                [0.0, 0.0, 0.0, 1.0],
            ],
            y_train: array![1.0, 1.0, 0.0, 0.0, 0.0, 0.0],
            x_test: array![[1.0, 0.0, 0.0, 0.0], [0.0, 0.0, 0.0, 0.0], [1.0, 1.0, 0.0, 0.0]],
            y_test: array![1.0, 0.0, 1.0],
        }
    }

    #[test]
    fn config_parses_from_toml_with_defaults() -> Result<()> {
        let config = ExperimentConfig::from_toml_str(
            r#"
            dataset = "drebin"
            poison_sizes = [10, 20]
            watermark_sizes = [4]
            "#,
        )?;
        assert_eq!(config.dataset, "drebin");
        assert_eq!(config.poison_sizes, vec![10, 20]);
        assert_eq!(config.iterations, 1);
        assert_eq!(config.seed, 42);
        assert!(config.model_artifacts_dir.is_none());

        assert!(ExperimentConfig::from_toml_str("iterations = 0").is_err());
        assert!(matches!(
            ExperimentConfig::from_toml_str("threshold = \"high\"").unwrap_err(),
            WatermarkError::Config(_)
        ));
        Ok(())
    }

    #[test]
    fn candidates_are_the_test_malware() -> Result<()> {
        let data = dataset();
        let (x_mw, idx) = poisoning_candidates(&data.x_test, &data.y_test)?;
        assert_eq!(idx, vec![0, 2]);
        assert_eq!(x_mw.nrows(), 2);
        Ok(())
    }

    #[test]
    fn backdoor_flips_watermarked_malware() -> Result<()> {
        let data = dataset();
        let provider = NearestNeighbour;
        let original = provider.train(data.x_train.view(), &data.y_train)?;
        let (x_mw, _) = poisoning_candidates(&data.x_test, &data.y_test)?;
        let wm = WatermarkConfig::new(&[1, 2, 3], &[7.0, 7.0, 7.0], 2, x_mw.nrows())?;

        let mut rng = StdRng::seed_from_u64(42);
        let (_, outcome) = run_watermark_attack(&provider, &original, &data.x_train, &data.y_train, &x_mw, &wm, 0.5, &mut rng)?;
        // Watermarked goodware still sits nearest to clean goodware for the original model.
        assert_eq!(outcome.orig_model_gw_train_set_accuracy, 1.0);
        assert_eq!(outcome.orig_model_wmgw_train_set_accuracy, 1.0);
        assert_eq!(outcome.orig_model_mw_test_set_accuracy, 1.0);
        assert_eq!(outcome.new_model_mw_test_set_accuracy, 0.0);
        assert_eq!(outcome.evasions_success_percent, 1.0);
        assert_eq!(outcome.benign_in_both_models_percent, 0.0);

        let too_many = WatermarkConfig::new(&[1], &[7.0], 5, 1)?;
        assert!(run_watermark_attack(&provider, &original, &data.x_train, &data.y_train, &x_mw, &too_many, 0.5, &mut rng).is_err());
        Ok(())
    }

    #[test]
    fn failed_combinations_are_skipped() -> Result<()> {
        let data = dataset();
        let provider = NearestNeighbour;
        let original = provider.train(data.x_train.view(), &data.y_train)?;
        let dir = scratch_dir("artifacts");
        let config = ExperimentConfig {
            poison_sizes: vec![2],
            watermark_sizes: vec![3, 5],
            model_artifacts_dir: Some(dir.clone()),
            ..ExperimentConfig::default()
        };

        let mut features = FixedFeatureSelector::new(vec![1, 2, 3])?;
        let mut values = ConstantValues(7.0);
        let summaries = run_experiments(&config, &provider, &data, &original, &mut (&mut features, &mut values))?;

        assert_eq!(summaries.len(), 1);
        let summary = &summaries[0];
        assert_eq!((summary.feature_selector.as_str(), summary.value_selector.as_str()), ("fixed", "constant"));
        assert_eq!(summary.watermark.num_watermark_features, 3);
        assert_eq!((summary.train_gw, summary.train_mw), (4, 2));
        assert_eq!(summary.orig_model_orig_test_set, RateSummary { fp_rate: 0.0, fn_rate: 0.0 });
        assert_eq!(summary.new_model_new_test_set.fn_rate, 1.0);
        assert_eq!(summary.orig_model_orig_test_set_accuracy, 1.0);
        assert!(dir.join("new-pss-2-fss-3-featsel-constant-0.model").is_file());
        let _ = fs::remove_dir_all(dir);
        Ok(())
    }
}
