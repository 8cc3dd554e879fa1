// src/lib.rs

//! `shap_backdoor` picks watermark triggers for clean-label backdoor attacks on
//! malware classifiers, steering the choice of features and values with SHAP
//! explanations and SHAP interaction values.

pub mod algorithms;
pub mod attack;
pub mod cache;
pub mod core;
pub mod traits;

// Re-export key components for easier use by library consumers
pub use crate::algorithms::{
    FeatureCriteria, FixedFeatureSelector, InteractionGraph, InteractionSearchSelector, PopulationValueSelector,
    SearchConfig, SearchCriteria, ShapFeatureSelector, ValueCriteria,
};
pub use crate::attack::{run_experiments, select_watermark, ExperimentConfig, WatermarkConfig, WatermarkSelection};
pub use crate::cache::CacheStore;
pub use crate::core::{Dataset, FeatureIndex, Node, Result, WatermarkError};
pub use crate::traits::{FeatureSelector, InteractionSource, ModelProvider, ValueSelector};
