// src/core/errors.rs
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WatermarkError {
    /// A selection or search criteria string that no strategy recognises.
    #[error("Unsupported Criteria: {0}")]
    UnsupportedCriteria(String),

    #[error("Insufficient Features: requested {requested}, only {available} available")]
    InsufficientFeatures { requested: usize, available: usize },

    #[error("Unknown Feature: index {0} is not present in the bound dataset")]
    UnknownFeature(usize),

    /// A cache artifact exists but does not decode to what its key promises.
    #[error("Cache Corruption at {}: {reason}", path.display())]
    CacheCorruption { path: PathBuf, reason: String },

    #[error("Invalid Input: {0}")]
    InvalidInput(String),

    #[error("Incompatible Dimensions: {0}")]
    IncompatibleDimensions(String),

    #[error("Internal Error: {0}")]
    InternalError(String),

    #[error("Config Error: {0}")]
    Config(String),

    #[error("Model Error: {0}")]
    Model(String),

    #[error("Ndarray Error: {0}")]
    NdarrayError(String),

    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ndarray::ShapeError> for WatermarkError {
    fn from(err: ndarray::ShapeError) -> Self {
        WatermarkError::NdarrayError(format!("ndarray ShapeError: {}", err))
    }
}

impl From<toml::de::Error> for WatermarkError {
    fn from(err: toml::de::Error) -> Self {
        WatermarkError::Config(err.to_string())
    }
}

// Convenience type alias for Result
pub type Result<T> = std::result::Result<T, WatermarkError>;
