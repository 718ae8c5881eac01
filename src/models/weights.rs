//! Model identifiers to ONNX files on disk.
//!
//! Identifiers are Hugging Face style `org/name` strings. Each maps to a
//! repository whose files are mirrored under `<model_cache_dir>/<repo>/`;
//! anything missing is downloaded from `<weights_base_url>/<repo>/resolve/main/`.

use std::path::{Component, Path, PathBuf};

use rocket::tokio::fs;
use rocket::tokio::io::AsyncWriteExt;

use super::{ModelError, ModelKind};

pub const SAM_FILES: &[&str] = &["encoder.onnx", "decoder.onnx"];
pub const SEGFORMER_FILES: &[&str] = &["model.onnx"];
pub const DETECTOR_FILES: &[&str] = &["model.onnx", "tokenizer.json"];

/// Open-vocabulary detector paired with SAM for text prompts.
pub const DETECTOR_ID: &str = "google/owlvit-base-patch32";

const SAM_IDS: &[&str] = &[
    "facebook/sam-vit-base",
    "facebook/sam-vit-large",
    "facebook/sam-vit-huge",
];

const SAM2_IDS: &[&str] = &[
    "ultralytics/sam2.1_t",
    "ultralytics/sam2.1_s",
    "ultralytics/sam2.1_b",
    "ultralytics/sam2.1_l",
    "ultralytics/sam2.1_x",
];

/// Text backend identifiers and the segmenter each one selects.
const TEXT_SAM_IDS: &[(&str, Family, &str)] = &[
    ("facebook/sam-vit-b", Family::Sam, "facebook/sam-vit-base"),
    ("facebook/sam-vit-l", Family::Sam, "facebook/sam-vit-large"),
    ("facebook/sam-vit-h", Family::Sam, "facebook/sam-vit-huge"),
    ("ultralytics/sam2.1_t", Family::Sam2, "ultralytics/sam2.1_t"),
    ("ultralytics/sam2.1_s", Family::Sam2, "ultralytics/sam2.1_s"),
    ("ultralytics/sam2.1_b", Family::Sam2, "ultralytics/sam2.1_b"),
    ("ultralytics/sam2.1_l", Family::Sam2, "ultralytics/sam2.1_l"),
];

const TEXT_SAM_FALLBACK: &str = "facebook/sam-vit-b";

/// Smallest download accepted as a real weights file.
const MIN_WEIGHTS_BYTES: u64 = 1024;

/// Network architecture behind an identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    Sam,
    Sam2,
    Segformer,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Source {
    /// A directory the caller pointed at directly.
    Local(PathBuf),
    /// A repository mirrored into the model cache.
    Remote(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModelLocation {
    pub id: String,
    pub family: Family,
    pub source: Source,
}

/// Resolve `model_path` (or the backend's default) for `kind`.
///
/// For the text backend this locates the segmenter half; the detector is
/// always [`DETECTOR_ID`].
pub fn locate(kind: ModelKind, model_path: Option<&str>) -> Result<ModelLocation, ModelError> {
    let id = model_path
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .unwrap_or(kind.default_model_id());

    let local = Path::new(id);
    if kind != ModelKind::LangSam && local.is_dir() {
        let family = match kind {
            ModelKind::Sam => Family::Sam,
            ModelKind::Sam2 => Family::Sam2,
            _ => Family::Segformer,
        };
        return Ok(ModelLocation {
            id: id.to_string(),
            family,
            source: Source::Local(local.to_path_buf()),
        });
    }

    let unknown = |available: &[&str]| ModelError::UnknownModel {
        kind,
        id: id.to_string(),
        available: available.join(", "),
    };
    let remote = |family, repo: &str| ModelLocation {
        id: id.to_string(),
        family,
        source: Source::Remote(repo.to_string()),
    };

    match kind {
        ModelKind::Sam if SAM_IDS.contains(&id) => Ok(remote(Family::Sam, id)),
        ModelKind::Sam => Err(unknown(SAM_IDS)),
        ModelKind::Sam2 if SAM2_IDS.contains(&id) => Ok(remote(Family::Sam2, id)),
        ModelKind::Sam2 => Err(unknown(SAM2_IDS)),
        ModelKind::LangSam => {
            let (_, family, repo) = TEXT_SAM_IDS
                .iter()
                .find(|(known, _, _)| *known == id)
                .or_else(|| {
                    tracing::warn!(model_path = id, fallback = TEXT_SAM_FALLBACK, "unknown text model, using fallback");
                    TEXT_SAM_IDS.iter().find(|(known, _, _)| *known == TEXT_SAM_FALLBACK)
                })
                .ok_or_else(|| unknown(&[]))?;
            Ok(ModelLocation {
                id: id.to_string(),
                family: *family,
                source: Source::Remote(repo.to_string()),
            })
        }
        ModelKind::Segment if is_repo_id(id) => Ok(remote(Family::Segformer, id)),
        ModelKind::Segment => Err(unknown(&[ModelKind::Segment.default_model_id()])),
    }
}

/// `org/name` with no traversal or absolute components.
pub fn is_repo_id(id: &str) -> bool {
    let path = Path::new(id);
    id.len() <= 255
        && id.split('/').count() == 2
        && !id.contains('\\')
        && path.components().all(|c| matches!(c, Component::Normal(_)))
}

/// Files of one model, all present on disk.
#[derive(Debug, Clone)]
pub struct ModelFiles {
    dir: PathBuf,
}

impl ModelFiles {
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, file: &str) -> PathBuf {
        self.dir.join(file)
    }
}

#[derive(Debug, Clone)]
pub struct WeightsResolver {
    cache_dir: PathBuf,
    base_url: String,
    client: reqwest::Client,
}

impl WeightsResolver {
    pub fn new(cache_dir: impl Into<PathBuf>, base_url: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        }
    }

    /// Make sure every file in `files` exists for `source`.
    pub async fn materialize(&self, source: &Source, files: &[&str]) -> Result<ModelFiles, ModelError> {
        match source {
            Source::Local(dir) => {
                for file in files {
                    if !dir.join(file).is_file() {
                        return Err(ModelError::WeightsUnavailable(format!(
                            "{file} not found in {}",
                            dir.display()
                        )));
                    }
                }
                Ok(ModelFiles { dir: dir.clone() })
            }
            Source::Remote(repo) => {
                if !is_repo_id(repo) {
                    return Err(ModelError::WeightsUnavailable(format!("invalid repository {repo}")));
                }
                let dir = self.cache_dir.join(repo);
                fs::create_dir_all(&dir).await?;
                for file in files {
                    let dest = dir.join(file);
                    if dest.is_file() {
                        continue;
                    }
                    let url = format!("{}/{}/resolve/main/{}", self.base_url, repo, file);
                    self.download(&url, &dest).await?;
                }
                Ok(ModelFiles { dir })
            }
        }
    }

    async fn download(&self, url: &str, dest: &Path) -> Result<(), ModelError> {
        tracing::info!(url, dest = %dest.display(), "downloading model weights");
        let download_err = |source| ModelError::Download {
            url: url.to_string(),
            source,
        };

        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(download_err)?;

        let mut part = dest.as_os_str().to_owned();
        part.push(".part");
        let part = PathBuf::from(part);

        let mut file = fs::File::create(&part).await?;
        let mut written: u64 = 0;
        while let Some(chunk) = response.chunk().await.map_err(download_err)? {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        drop(file);

        if written < MIN_WEIGHTS_BYTES {
            let _ = fs::remove_file(&part).await;
            return Err(ModelError::WeightsUnavailable(format!(
                "{url} returned only {written} bytes"
            )));
        }

        fs::rename(&part, dest).await?;
        tracing::info!(dest = %dest.display(), bytes = written, "model weights saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_resolve_per_kind() {
        let sam = locate(ModelKind::Sam, None).unwrap();
        assert_eq!(sam.family, Family::Sam);
        assert_eq!(sam.source, Source::Remote("facebook/sam-vit-base".into()));

        let sam2 = locate(ModelKind::Sam2, Some("  ")).unwrap();
        assert_eq!(sam2.id, "ultralytics/sam2.1_b");

        let text = locate(ModelKind::LangSam, None).unwrap();
        assert_eq!(text.family, Family::Sam2);
        assert_eq!(text.source, Source::Remote("ultralytics/sam2.1_s".into()));

        let seg = locate(ModelKind::Segment, None).unwrap();
        assert_eq!(seg.family, Family::Segformer);
    }

    #[test]
    fn every_sam2_size_is_known() {
        for id in ["ultralytics/sam2.1_t", "ultralytics/sam2.1_s", "ultralytics/sam2.1_x"] {
            let loc = locate(ModelKind::Sam2, Some(id)).unwrap();
            assert_eq!(loc.family, Family::Sam2);
            assert_eq!(loc.source, Source::Remote(id.into()));
        }
    }

    #[test]
    fn unknown_sam2_identifier_lists_available() {
        let err = locate(ModelKind::Sam2, Some("ultralytics/sam2.1_q")).unwrap_err();
        assert!(err.is_client_error());
        let message = err.to_string();
        assert!(message.contains("ultralytics/sam2.1_q"));
        assert!(message.contains("ultralytics/sam2.1_t"));
        assert!(message.contains("ultralytics/sam2.1_x"));
    }

    #[test]
    fn text_backend_falls_back_to_sam_vit_b() {
        let loc = locate(ModelKind::LangSam, Some("something/else")).unwrap();
        assert_eq!(loc.family, Family::Sam);
        assert_eq!(loc.source, Source::Remote("facebook/sam-vit-base".into()));
    }

    #[test]
    fn segment_accepts_any_repo_id_but_not_traversal() {
        assert!(locate(ModelKind::Segment, Some("org/custom-segformer")).is_ok());
        assert!(locate(ModelKind::Segment, Some("../../etc")).is_err());
        assert!(!is_repo_id("/abs/path"));
        assert!(!is_repo_id("org/../x"));
        assert!(is_repo_id("restor/tcd-segformer-mit-b5"));
    }

    #[test]
    fn local_directory_is_used_as_is() {
        let dir = tempfile::tempdir().unwrap();
        let loc = locate(ModelKind::Sam, dir.path().to_str()).unwrap();
        assert_eq!(loc.source, Source::Local(dir.path().to_path_buf()));
    }

    #[rocket::async_test]
    async fn local_source_requires_every_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("encoder.onnx"), b"x").unwrap();
        let resolver = WeightsResolver::new(dir.path(), "http://127.0.0.1:9", reqwest::Client::new());

        let err = resolver
            .materialize(&Source::Local(dir.path().to_path_buf()), SAM_FILES)
            .await
            .unwrap_err();
        assert!(matches!(err, ModelError::WeightsUnavailable(_)));

        std::fs::write(dir.path().join("decoder.onnx"), b"x").unwrap();
        let files = resolver
            .materialize(&Source::Local(dir.path().to_path_buf()), SAM_FILES)
            .await
            .unwrap();
        assert_eq!(files.path("decoder.onnx"), dir.path().join("decoder.onnx"));
    }

    #[rocket::async_test]
    async fn cached_files_skip_the_network() {
        let cache = tempfile::tempdir().unwrap();
        let repo_dir = cache.path().join("restor/tcd-segformer-mit-b5");
        std::fs::create_dir_all(&repo_dir).unwrap();
        std::fs::write(repo_dir.join("model.onnx"), b"weights").unwrap();

        let resolver = WeightsResolver::new(cache.path(), "http://127.0.0.1:9/", reqwest::Client::new());
        let files = resolver
            .materialize(&Source::Remote("restor/tcd-segformer-mit-b5".into()), SEGFORMER_FILES)
            .await
            .unwrap();
        assert_eq!(files.dir(), repo_dir.as_path());
    }

    #[rocket::async_test]
    async fn unreachable_mirror_is_a_download_error() {
        let cache = tempfile::tempdir().unwrap();
        let resolver = WeightsResolver::new(cache.path(), "http://127.0.0.1:9", reqwest::Client::new());
        let err = resolver
            .materialize(&Source::Remote("facebook/sam-vit-base".into()), SAM_FILES)
            .await
            .unwrap_err();
        assert!(matches!(err, ModelError::Download { .. }));
        assert!(!err.is_client_error());
    }
}
