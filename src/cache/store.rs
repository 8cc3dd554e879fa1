// src/cache/store.rs

use std::fs;
use std::path::{Path, PathBuf};

use ndarray::ArrayView2;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::core::{normalize_value, FeatureIndex, Result, WatermarkError};

/// Every artifact the engine memoises on disk.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    /// Raw float32 interaction tensor over `samples` rows of the full feature universe.
    InteractionTensor { samples: usize },
    /// Interaction graph of one seed feature.
    SeedGraph {
        selector: String,
        criteria: String,
        seed: FeatureIndex,
    },
    /// Union of the seed graphs for the top `features` seeds.
    MergedGraph {
        selector: String,
        criteria: String,
        features: usize,
    },
    /// Per-feature value choices of a value selector over the data identified by `data`.
    ValueChoices { criteria: String, data: String },
}

impl CacheKey {
    pub fn file_name(&self) -> String {
        match self {
            CacheKey::InteractionTensor { samples } => {
                format!("shap_interaction_values_{}.f32", samples)
            }
            CacheKey::SeedGraph {
                selector,
                criteria,
                seed,
            } => format!("{}_{}_{}_graph.bin", selector, criteria, seed),
            CacheKey::MergedGraph {
                selector,
                criteria,
                features,
            } => format!("{}_{}_{}_graph_final.bin", selector, criteria, features),
            CacheKey::ValueChoices { criteria, data } => format!("value_choices_{}_{}.json", criteria, data),
        }
    }

    fn is_json(&self) -> bool {
        matches!(self, CacheKey::ValueChoices { .. })
    }
}

/// Short content tag for one or more matrices: `{rows}x{cols}-{sha256 prefix}`.
///
/// `-0.0` and `0.0` hash alike, matching how values are compared elsewhere.
pub fn data_fingerprint(matrices: &[ArrayView2<'_, f64>]) -> String {
    let mut hasher = Sha256::new();
    for m in matrices {
        hasher.update((m.nrows() as u64).to_le_bytes());
        hasher.update((m.ncols() as u64).to_le_bytes());
        for v in m.iter() {
            hasher.update(normalize_value(*v).to_bits().to_le_bytes());
        }
    }
    let digest = hasher.finalize();
    let (rows, cols) = matrices.first().map(|m| m.dim()).unwrap_or((0, 0));
    let hex: String = digest[..8].iter().map(|b| format!("{:02x}", b)).collect();
    format!("{}x{}-{}", rows, cols, hex)
}

/// Directory of disposable artifacts. Deleting any file only costs recomputation.
#[derive(Debug, Clone)]
pub struct CacheStore {
    root: PathBuf,
}

impl CacheStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(CacheStore { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, key: &CacheKey) -> PathBuf {
        self.root.join(key.file_name())
    }

    pub fn exists(&self, key: &CacheKey) -> bool {
        self.path(key).is_file()
    }

    /// Decodes the artifact stored under `key`. `Ok(None)` when nothing is cached.
    pub fn load<T: DeserializeOwned>(&self, key: &CacheKey) -> Result<Option<T>> {
        let path = self.path(key);
        if !path.is_file() {
            return Ok(None);
        }
        let bytes = fs::read(&path)?;
        let decoded = if key.is_json() {
            serde_json::from_slice(&bytes).map_err(|e| e.to_string())
        } else {
            bincode::deserialize(&bytes).map_err(|e| e.to_string())
        };
        match decoded {
            Ok(value) => {
                tracing::debug!(path = %path.display(), "cache hit");
                Ok(Some(value))
            }
            Err(reason) => Err(WatermarkError::CacheCorruption { path, reason }),
        }
    }

    pub fn store<T: Serialize>(&self, key: &CacheKey, value: &T) -> Result<()> {
        let bytes = if key.is_json() {
            serde_json::to_vec(value).map_err(|e| WatermarkError::InternalError(e.to_string()))?
        } else {
            bincode::serialize(value).map_err(|e| WatermarkError::InternalError(e.to_string()))?
        };
        self.write_atomic(key, &bytes)
    }

    /// Writes under a temporary name, then renames into place, so a key never
    /// points at a half-written file produced by this process.
    pub(crate) fn write_atomic(&self, key: &CacheKey, bytes: &[u8]) -> Result<()> {
        let path = self.path(key);
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &path)?;
        tracing::debug!(path = %path.display(), bytes = bytes.len(), "cache stored");
        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn scratch_dir(tag: &str) -> PathBuf {
    use std::time::{SystemTime, UNIX_EPOCH};

    std::env::temp_dir().join(format!(
        "shap-backdoor-{}-{}-{}",
        tag,
        std::process::id(),
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default()
    ))
}
