//! `POST /predict`: image + prompts in, GeoJSON features out.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use image::RgbImage;
use rocket::serde::json::{self, Json};
use rocket::tokio::task;
use rocket::State;
use serde::{Deserialize, Serialize};

use crate::embedding::{EmbeddingCache, ImageEmbedding};
use crate::error::{ApiError, ApiResult};
use crate::geo::{self, Affine, PixelWindow, PromptSpace};
use crate::image_source;
use crate::models::{decoder_prompts, Backend, ModelKind, Prediction, PromptSegmenter};
use crate::prompt::{self, NormalizedPromptSet, RawPrompt};
use crate::state::AppState;
use crate::vectorize::{self, Feature};

#[derive(Debug, Deserialize)]
pub struct PredictRequest {
    #[serde(default = "default_model_type")]
    pub model_type: String,
    #[serde(default)]
    pub image_path: String,
    #[serde(default)]
    pub model_path: Option<String>,
    #[serde(default)]
    pub prompts: Vec<RawPrompt>,
    #[serde(default)]
    pub prompt_space: PromptSpace,
    #[serde(default)]
    pub embedding_path: Option<String>,
    #[serde(default)]
    pub save_embeddings: bool,
    #[serde(default)]
    pub aoi: Option<Aoi>,
}

fn default_model_type() -> String {
    ModelKind::Sam.as_str().to_string()
}

/// Pixel window `[x_min, y_min, x_max, y_max]` for the semantic segmenter.
#[derive(Debug, Deserialize)]
pub struct Aoi {
    pub coordinates: [f64; 4],
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PredictResponse {
    pub status: String,
    pub features: Vec<Feature>,
    pub crs: Option<String>,
}

#[post("/predict", data = "<body>")]
pub async fn predict(
    body: Result<Json<PredictRequest>, json::Error<'_>>,
    state: &State<AppState>,
) -> ApiResult<Json<PredictResponse>> {
    let Json(request) = body.map_err(|e| ApiError::BadRequest(format!("Invalid JSON body: {e}")))?;
    let kind: ModelKind = request.model_type.parse()?;
    let started = Instant::now();
    tracing::info!(model_type = %kind, image_path = %request.image_path, prompts = request.prompts.len(), "predict");

    let source = image_source::load(&request.image_path, &state.http).await?;
    let shape = source.shape();

    let prompts = prompt::normalize_raw(request.prompts);
    let to_pixels = match request.prompt_space {
        PromptSpace::Pixel => Affine::IDENTITY,
        PromptSpace::Map => source.transform.ok_or_else(|| {
            ApiError::BadRequest("prompt_space is \"map\" but the image carries no georeferencing".into())
        })?,
    };
    let prompts = geo::reproject_prompts(&prompts, &to_pixels, shape)?;
    tracing::debug!(?prompts, "prompts in pixel space");

    let aoi = match (kind, request.aoi) {
        (ModelKind::Segment, Some(aoi)) => Some(
            PixelWindow::clipped(aoi.coordinates, source.width(), source.height())
                .ok_or_else(|| ApiError::BadRequest("aoi does not overlap the image".into()))?,
        ),
        _ => None,
    };

    let backend = state.registry.get(kind, request.model_path.as_deref()).await?;
    let embedding = kind.uses_embeddings().then(|| EmbeddingJob {
        path: state
            .embeddings
            .resolve(request.embedding_path.as_deref(), backend.model_id(), &request.image_path),
        cache: state.embeddings.clone(),
        save: request.save_embeddings,
        image_path: request.image_path.clone(),
    });

    let job = Job {
        backend,
        image: source.rgb,
        prompts,
        aoi,
        embedding,
    };
    let prediction = task::spawn_blocking(move || job.run())
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))??
        .ok_or(ApiError::NoMasks)?;

    let features = prediction.into_features(source.transform.as_ref());
    if state.config.save_geojson {
        let path = geojson_path(&state.config.temp_dir(), kind, &request.image_path);
        vectorize::save_geojson(&features, &path)?;
        tracing::debug!(path = %path.display(), "saved GeoJSON");
    }

    tracing::info!(
        model_type = %kind,
        features = features.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "predict finished"
    );
    Ok(Json(PredictResponse {
        status: "success".to_string(),
        features,
        crs: source.crs,
    }))
}

struct EmbeddingJob {
    cache: EmbeddingCache,
    path: PathBuf,
    save: bool,
    image_path: String,
}

/// Everything inference needs, moved onto a blocking thread.
struct Job {
    backend: Arc<Backend>,
    image: RgbImage,
    prompts: NormalizedPromptSet,
    aoi: Option<PixelWindow>,
    embedding: Option<EmbeddingJob>,
}

impl Job {
    fn run(self) -> Result<Option<Prediction>, ApiError> {
        match self.backend.as_ref() {
            Backend::Segment(model) => Ok(model.get_masks(&self.image, self.aoi.as_ref())?),
            Backend::LangSam(model) => Ok(model.get_masks(&self.image, &self.prompts)?),
            backend => {
                let segmenter = backend
                    .prompt_segmenter()
                    .ok_or_else(|| ApiError::Internal(format!("{} has no image encoder", backend.kind())))?;
                let calls = decoder_prompts(&self.prompts)?;
                let shape = (self.image.height(), self.image.width());
                let embedding = embed_with_cache(segmenter, &self.image, self.embedding.as_ref())?;
                Ok(segmenter.predict(&embedding, shape, &calls)?)
            }
        }
    }
}

/// Reuse a matching cached embedding, otherwise encode the image and write
/// the result back when the request asked for it.
fn embed_with_cache(
    segmenter: &dyn PromptSegmenter,
    image: &RgbImage,
    job: Option<&EmbeddingJob>,
) -> Result<ImageEmbedding, ApiError> {
    let shape = (image.height(), image.width());
    if let Some(cached) = job.and_then(|job| job.cache.load(&job.path, segmenter.model_id(), shape)) {
        return Ok(cached);
    }

    let embedding = segmenter.embed(image)?;
    if let Some(job) = job.filter(|job| job.save) {
        job.cache
            .save(&job.path, &embedding, shape, segmenter.model_id(), &job.image_path)?;
    }
    Ok(embedding)
}

/// `<temp_dir>/predict-<model>_<image name>_<timestamp>.geojson`, with the
/// timestamp down to microseconds.
fn geojson_path(temp_dir: &std::path::Path, kind: ModelKind, image_path: &str) -> PathBuf {
    let name = image_path
        .trim_end_matches('/')
        .rsplit(['/', '\\'])
        .next()
        .filter(|n| !n.is_empty())
        .unwrap_or("image");
    let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S_%6f");
    temp_dir.join(format!("predict-{kind}_{name}_{stamp}.geojson"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::NamedTensor;
    use crate::models::{DecoderPrompt, ModelError, ObjectMask};
    use ndarray::{Array2, ArrayD, IxDyn};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Encoder stub that counts how often it runs.
    #[derive(Default)]
    struct Counting {
        embeds: AtomicUsize,
    }

    impl PromptSegmenter for Counting {
        fn model_id(&self) -> &str {
            "test/counting"
        }

        fn embed(&self, _image: &RgbImage) -> Result<ImageEmbedding, ModelError> {
            self.embeds.fetch_add(1, Ordering::SeqCst);
            Ok(ImageEmbedding {
                tensors: vec![NamedTensor {
                    name: "image_embeddings".into(),
                    data: ArrayD::from_elem(IxDyn(&[1, 2, 2, 2]), 0.5),
                }],
            })
        }

        fn decode(
            &self,
            _embedding: &ImageEmbedding,
            (h, w): (u32, u32),
            prompts: &[DecoderPrompt],
        ) -> Result<Vec<ObjectMask>, ModelError> {
            Ok(prompts
                .iter()
                .map(|_| ObjectMask {
                    mask: Array2::from_elem((h as usize, w as usize), true),
                    score: 1.0,
                })
                .collect())
        }
    }

    fn job(cache: &EmbeddingCache, path: PathBuf, save: bool) -> EmbeddingJob {
        EmbeddingJob {
            cache: cache.clone(),
            path,
            save,
            image_path: "/data/tile.tif".into(),
        }
    }

    #[test]
    fn miss_with_save_writes_and_next_call_hits() {
        let dir = tempfile::tempdir().unwrap();
        let cache = EmbeddingCache::new(dir.path());
        let path = cache.path_for("test/counting", "/data/tile.tif");
        let image = RgbImage::new(6, 4);
        let segmenter = Counting::default();
        let saving = job(&cache, path.clone(), true);

        let first = embed_with_cache(&segmenter, &image, Some(&saving)).unwrap();
        assert!(path.is_file());
        let second = embed_with_cache(&segmenter, &image, Some(&saving)).unwrap();
        assert_eq!(first, second);
        assert_eq!(segmenter.embeds.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn miss_without_save_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let cache = EmbeddingCache::new(dir.path());
        let path = dir.path().join("tile.bin");
        let image = RgbImage::new(6, 4);
        let segmenter = Counting::default();

        embed_with_cache(&segmenter, &image, Some(&job(&cache, path.clone(), false))).unwrap();
        embed_with_cache(&segmenter, &image, None).unwrap();
        assert!(!path.exists());
        assert_eq!(segmenter.embeds.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn cached_record_for_other_shape_is_recomputed() {
        let dir = tempfile::tempdir().unwrap();
        let cache = EmbeddingCache::new(dir.path());
        let path = dir.path().join("tile.bin");
        let segmenter = Counting::default();
        let saving = job(&cache, path, true);

        embed_with_cache(&segmenter, &RgbImage::new(6, 4), Some(&saving)).unwrap();
        embed_with_cache(&segmenter, &RgbImage::new(8, 8), Some(&saving)).unwrap();
        assert_eq!(segmenter.embeds.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn failed_save_is_a_server_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"x").unwrap();
        let cache = EmbeddingCache::new(dir.path());
        let segmenter = Counting::default();

        let err = embed_with_cache(
            &segmenter,
            &RgbImage::new(6, 4),
            Some(&job(&cache, blocker.join("tile.bin"), true)),
        )
        .unwrap_err();
        assert!(matches!(err, ApiError::Cache(_)));
        assert_eq!(err.status(), rocket::http::Status::InternalServerError);
    }

    #[test]
    fn geojson_name_uses_model_and_basename() {
        let path = geojson_path(std::path::Path::new("/tmp/ee"), ModelKind::Sam2, "/data/tiles/a.tif");
        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("predict-sam2_a.tif_"));
        assert!(name.ends_with(".geojson"));
        assert!(path.starts_with("/tmp/ee"));

        let path = geojson_path(std::path::Path::new("/tmp"), ModelKind::Segment, "https://host/x/b.png");
        assert!(path.to_str().unwrap().contains("predict-segment_b.png_"));
    }

    #[test]
    fn back_to_back_predictions_get_distinct_files() {
        let temp = std::path::Path::new("/tmp/ee");
        let first = geojson_path(temp, ModelKind::Sam, "/data/a.tif");
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = geojson_path(temp, ModelKind::Sam, "/data/a.tif");
        assert_ne!(first, second);
    }

    #[test]
    fn model_type_defaults_to_sam() {
        let request: PredictRequest = serde_json::from_str(r#"{"image_path": "/a.tif"}"#).unwrap();
        assert_eq!(request.model_type.parse::<ModelKind>().unwrap(), ModelKind::Sam);
    }

    #[test]
    fn request_defaults() {
        let request: PredictRequest = serde_json::from_str(
            r#"{"model_type": "sam", "image_path": "/a.tif",
                "prompts": [{"type": "Point", "data": {"points": [[1, 2]], "labels": [1]}}]}"#,
        )
        .unwrap();
        assert_eq!(request.prompt_space, PromptSpace::Pixel);
        assert!(!request.save_embeddings);
        assert!(request.aoi.is_none());
        assert_eq!(request.prompts.len(), 1);

        let request: PredictRequest = serde_json::from_str(
            r#"{"model_type": "segment", "image_path": "/a.tif", "prompt_space": "map",
                "aoi": {"coordinates": [0, 0, 10, 10]}}"#,
        )
        .unwrap();
        assert_eq!(request.prompt_space, PromptSpace::Map);
        assert_eq!(request.aoi.unwrap().coordinates, [0.0, 0.0, 10.0, 10.0]);
    }
}
