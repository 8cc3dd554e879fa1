// src/cache/tensor.rs

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use ndarray::{Array3, ArrayView3};

use super::store::{CacheKey, CacheStore};
use crate::core::{Result, WatermarkError};

const F32_BYTES: usize = std::mem::size_of::<f32>();

/// Read-only interaction tensor backed by a memory-mapped raw float32 file.
///
/// The file holds `samples * features * features` native-endian `f32` values in
/// row-major `(sample, feature_a, feature_b)` order and nothing else. Pages are
/// faulted in on access, so the tensor is never materialised as a whole.
#[derive(Debug)]
pub struct MappedInteractionTensor {
    mmap: Mmap,
    shape: (usize, usize, usize),
    path: PathBuf,
}

impl MappedInteractionTensor {
    /// Maps `path`, inferring the sample axis from the file length.
    pub fn open(path: impl AsRef<Path>, num_features: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let len = fs::metadata(&path)?.len() as usize;
        let slab = num_features * num_features * F32_BYTES;
        if slab == 0 || len == 0 || len % slab != 0 {
            return Err(WatermarkError::CacheCorruption {
                path,
                reason: format!(
                    "{} bytes is not a whole number of {}x{} float32 slabs",
                    len, num_features, num_features
                ),
            });
        }
        Self::map(path, (len / slab, num_features, num_features))
    }

    /// Maps `path`, requiring exactly `(samples, features, features)`.
    pub fn open_with_shape(path: impl AsRef<Path>, samples: usize, num_features: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let len = fs::metadata(&path)?.len() as usize;
        let expected = samples * num_features * num_features * F32_BYTES;
        if len != expected || expected == 0 {
            return Err(WatermarkError::CacheCorruption {
                path,
                reason: format!(
                    "expected {} bytes for shape ({}, {}, {}), found {}",
                    expected, samples, num_features, num_features, len
                ),
            });
        }
        Self::map(path, (samples, num_features, num_features))
    }

    fn map(path: PathBuf, shape: (usize, usize, usize)) -> Result<Self> {
        let file = File::open(&path)?;
        // SAFETY: cache files are immutable once renamed into place; a concurrent
        // foreign writer is an accepted hazard surfaced through shape validation.
        let mmap = unsafe { Mmap::map(&file)? };
        let tensor = MappedInteractionTensor { mmap, shape, path };
        tensor.floats()?;
        Ok(tensor)
    }

    fn floats(&self) -> Result<&[f32]> {
        // SAFETY: every bit pattern is a valid f32.
        let (prefix, floats, suffix) = unsafe { self.mmap.align_to::<f32>() };
        if !prefix.is_empty() || !suffix.is_empty() {
            return Err(WatermarkError::CacheCorruption {
                path: self.path.clone(),
                reason: "mapping is not f32 aligned".to_string(),
            });
        }
        Ok(floats)
    }

    pub fn shape(&self) -> (usize, usize, usize) {
        self.shape
    }

    pub fn num_samples(&self) -> usize {
        self.shape.0
    }

    pub fn num_features(&self) -> usize {
        self.shape.1
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn view(&self) -> Result<ArrayView3<'_, f32>> {
        Ok(ArrayView3::from_shape(self.shape, self.floats()?)?)
    }
}

/// Streams `tensor` to `path` in the raw layout `MappedInteractionTensor` reads,
/// going through a temporary file so `path` only ever holds a complete tensor.
pub fn write_tensor(path: impl AsRef<Path>, tensor: ArrayView3<'_, f32>) -> Result<()> {
    let path = path.as_ref();
    let tmp = path.with_extension("tmp");
    {
        let mut out = BufWriter::new(File::create(&tmp)?);
        // Logical iteration order is row-major regardless of the source layout.
        for value in tensor.iter() {
            out.write_all(&value.to_ne_bytes())?;
        }
        out.flush()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

impl CacheStore {
    /// Maps the cached tensor for `samples`, computing and persisting it first if absent.
    pub fn load_or_compute_tensor<F>(
        &self,
        samples: usize,
        num_features: usize,
        compute: F,
    ) -> Result<MappedInteractionTensor>
    where
        F: FnOnce() -> Result<Array3<f32>>,
    {
        let key = CacheKey::InteractionTensor { samples };
        let path = self.path(&key);
        if !path.is_file() {
            let start = std::time::Instant::now();
            let tensor = compute()?;
            if tensor.dim() != (samples, num_features, num_features) {
                return Err(WatermarkError::IncompatibleDimensions(format!(
                    "Interaction oracle returned shape {:?}, expected ({}, {}, {}).",
                    tensor.dim(),
                    samples,
                    num_features,
                    num_features
                )));
            }
            write_tensor(&path, tensor.view())?;
            tracing::info!(
                samples,
                num_features,
                elapsed_secs = start.elapsed().as_secs_f64(),
                "computed interaction tensor"
            );
        } else {
            tracing::debug!(path = %path.display(), "reusing cached interaction tensor");
        }
        MappedInteractionTensor::open_with_shape(path, samples, num_features)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::store::scratch_dir;
    use ndarray::Array3;

    fn sample_tensor(samples: usize, features: usize) -> Array3<f32> {
        Array3::from_shape_fn((samples, features, features), |(s, a, b)| {
            (s as f32 + 1.0) * 0.1 + (a * features + b) as f32 * -0.37 + 1e-7
        })
    }

    #[test]
    fn cached_tensor_reads_back_bit_for_bit() -> Result<()> {
        let dir = scratch_dir("tensor");
        let store = CacheStore::open(&dir)?;
        let original = sample_tensor(3, 4);

        let mapped = store.load_or_compute_tensor(3, 4, || Ok(original.clone()))?;
        assert_eq!(mapped.shape(), (3, 4, 4));
        let view = mapped.view()?;
        for (a, b) in view.iter().zip(original.iter()) {
            assert_eq!(a.to_bits(), b.to_bits());
        }

        // Second call must not recompute.
        let again = store.load_or_compute_tensor(3, 4, || {
            Err(WatermarkError::InternalError("recomputed".to_string()))
        })?;
        assert_eq!(again.view()?, original.view());
        let _ = fs::remove_dir_all(dir);
        Ok(())
    }

    #[test]
    fn open_infers_sample_axis_from_length() -> Result<()> {
        let dir = scratch_dir("infer");
        fs::create_dir_all(&dir)?;
        let path = dir.join("t.f32");
        write_tensor(&path, sample_tensor(5, 2).view())?;

        let mapped = MappedInteractionTensor::open(&path, 2)?;
        assert_eq!(mapped.num_samples(), 5);
        assert_eq!(mapped.num_features(), 2);
        let _ = fs::remove_dir_all(dir);
        Ok(())
    }

    #[test]
    fn truncated_file_is_corruption() -> Result<()> {
        let dir = scratch_dir("truncated");
        fs::create_dir_all(&dir)?;
        let path = dir.join("t.f32");
        fs::write(&path, vec![0u8; 4 * 4 * 4 * 2 - 4])?;

        let err = MappedInteractionTensor::open_with_shape(&path, 2, 4).unwrap_err();
        assert!(matches!(err, WatermarkError::CacheCorruption { .. }));
        let err = MappedInteractionTensor::open(&path, 4).unwrap_err();
        assert!(matches!(err, WatermarkError::CacheCorruption { .. }));
        let _ = fs::remove_dir_all(dir);
        Ok(())
    }

    #[test]
    fn oracle_with_wrong_shape_is_rejected() -> Result<()> {
        let dir = scratch_dir("shape");
        let store = CacheStore::open(&dir)?;
        let err = store
            .load_or_compute_tensor(2, 3, || Ok(sample_tensor(2, 4)))
            .unwrap_err();
        assert!(matches!(err, WatermarkError::IncompatibleDimensions(_)));
        assert!(!store.exists(&CacheKey::InteractionTensor { samples: 2 }));
        let _ = fs::remove_dir_all(dir);
        Ok(())
    }
}
