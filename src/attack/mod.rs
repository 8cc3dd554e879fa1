//! Watermark construction, poisoning runs and their evaluation.

pub mod experiment;
pub mod metrics;
pub mod watermark;

pub use experiment::{
    poisoning_candidates, run_experiments, run_watermark_attack, AttackOutcome, ExperimentConfig, ExperimentSummary,
};
pub use metrics::{accuracy, fpr_fnr, RateSummary};
pub use watermark::{select_watermark, WatermarkConfig, WatermarkSelection};
