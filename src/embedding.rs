//! On-disk cache of image encoder outputs.
//!
//! Records are content-addressed by `sha256(model_id, image_path)` inside the
//! embeddings directory, so there is no shared index to read-modify-write.
//! A caller may still name an explicit file; the record inside carries the
//! image shape and model it was computed for, and anything that does not
//! match is a miss.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use ndarray::ArrayD;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Encoder output, one tensor per named model output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageEmbedding {
    pub tensors: Vec<NamedTensor>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedTensor {
    pub name: String,
    pub data: ArrayD<f32>,
}

impl ImageEmbedding {
    pub fn get(&self, name: &str) -> Option<&ArrayD<f32>> {
        self.tensors.iter().find(|t| t.name == name).map(|t| &t.data)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    pub embedding: ImageEmbedding,
    /// `(height, width)` of the image that was encoded
    pub image_shape: (u32, u32),
    pub model_id: String,
    pub image_path: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("failed to write embedding to {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode embedding: {0}")]
    Encode(#[from] bincode::Error),
}

#[derive(Debug, Clone)]
pub struct EmbeddingCache {
    dir: PathBuf,
}

impl EmbeddingCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Content-addressed location for `(model_id, image_path)`.
    pub fn path_for(&self, model_id: &str, image_path: &str) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(model_id.as_bytes());
        hasher.update([0u8]);
        hasher.update(image_path.as_bytes());
        self.dir.join(format!("{}.bin", hex::encode(hasher.finalize())))
    }

    /// Explicit path if the caller gave one, the content address otherwise.
    pub fn resolve(&self, explicit: Option<&str>, model_id: &str, image_path: &str) -> PathBuf {
        match explicit {
            Some(path) if !path.trim().is_empty() => PathBuf::from(path),
            _ => self.path_for(model_id, image_path),
        }
    }

    /// Cached embedding at `path` if it was computed by `model_id` for an
    /// image of `expected_shape`. Every failure is a miss.
    pub fn load(&self, path: &Path, model_id: &str, expected_shape: (u32, u32)) -> Option<ImageEmbedding> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no cached embedding");
                return None;
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "cannot read cached embedding");
                return None;
            }
        };

        let record: EmbeddingRecord = match bincode::deserialize(&bytes) {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "corrupt cached embedding");
                return None;
            }
        };

        if record.image_shape != expected_shape {
            tracing::warn!(
                path = %path.display(),
                cached = ?record.image_shape,
                expected = ?expected_shape,
                "cached embedding has a different image shape"
            );
            return None;
        }
        if record.model_id != model_id {
            tracing::warn!(
                path = %path.display(),
                cached = %record.model_id,
                expected = %model_id,
                "cached embedding was computed by another model"
            );
            return None;
        }

        tracing::debug!(path = %path.display(), computed = %record.timestamp, "loaded cached embedding");
        Some(record.embedding)
    }

    /// Write a record next to its final path and rename it into place.
    pub fn save(
        &self,
        path: &Path,
        embedding: &ImageEmbedding,
        image_shape: (u32, u32),
        model_id: &str,
        image_path: &str,
    ) -> Result<(), CacheError> {
        let io_err = |source| CacheError::Io {
            path: path.display().to_string(),
            source,
        };

        let record = EmbeddingRecord {
            embedding: embedding.clone(),
            image_shape,
            model_id: model_id.to_string(),
            image_path: image_path.to_string(),
            timestamp: Utc::now(),
        };
        let bytes = bincode::serialize(&record)?;

        let parent = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent).map_err(io_err)?;

        let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(io_err)?;
        tmp.write_all(&bytes).map_err(io_err)?;
        tmp.persist(path).map_err(|e| io_err(e.error))?;

        tracing::debug!(path = %path.display(), bytes = bytes.len(), "saved image embedding");
        Ok(())
    }
}
