use std::collections::HashMap;
use std::sync::Arc;

use ort::Environment;
use rocket::tokio::sync::{Mutex, OnceCell};
use rocket::tokio::task;

use super::device::Device;
use super::sam::SamModel;
use super::sam2::Sam2Model;
use super::segformer::Segformer;
use super::text_sam::{Detector, TextSam};
use super::weights::{self, Family, ModelFiles, ModelLocation, Source, WeightsResolver};
use super::{Backend, ModelError, ModelKind, PromptSegmenter};

type Key = (ModelKind, ModelLocation);
type Slot = Arc<OnceCell<Arc<Backend>>>;

/// Loaded backends, keyed by model type and resolved identifier.
///
/// Each key owns a slot that is initialised once. Concurrent first requests
/// for the same model wait on that slot; other models are unaffected. A
/// failed load leaves the slot empty for the next request to retry.
pub struct ModelRegistry {
    env: Arc<Environment>,
    device: Device,
    weights: WeightsResolver,
    slots: Mutex<HashMap<Key, Slot>>,
}

impl ModelRegistry {
    pub fn new(env: Arc<Environment>, device: Device, weights: WeightsResolver) -> Self {
        Self {
            env,
            device,
            weights,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub async fn get(&self, kind: ModelKind, model_path: Option<&str>) -> Result<Arc<Backend>, ModelError> {
        let location = weights::locate(kind, model_path)?;
        let key = (kind, location);

        let slot = {
            let mut slots = self.slots.lock().await;
            Arc::clone(slots.entry(key.clone()).or_default())
        };

        let backend = slot
            .get_or_try_init(|| async {
                tracing::info!(%kind, model = %key.1.id, "loading model");
                self.load(kind, &key.1).await.map(Arc::new)
            })
            .await?;
        Ok(Arc::clone(backend))
    }

    async fn load(&self, kind: ModelKind, location: &ModelLocation) -> Result<Backend, ModelError> {
        let files = self
            .weights
            .materialize(&location.source, files_for(location.family))
            .await?;
        let detector_files = match kind {
            ModelKind::LangSam => Some(
                self.weights
                    .materialize(&Source::Remote(weights::DETECTOR_ID.to_string()), weights::DETECTOR_FILES)
                    .await?,
            ),
            _ => None,
        };

        let env = Arc::clone(&self.env);
        let device = self.device;
        let location = location.clone();
        task::spawn_blocking(move || build(kind, &location, &files, detector_files.as_ref(), &env, device))
            .await
            .map_err(|e| ModelError::Io(std::io::Error::other(e)))?
    }
}

fn files_for(family: Family) -> &'static [&'static str] {
    match family {
        Family::Sam | Family::Sam2 => weights::SAM_FILES,
        Family::Segformer => weights::SEGFORMER_FILES,
    }
}

fn segmenter(
    family: Family,
    id: &str,
    files: &ModelFiles,
    env: &Arc<Environment>,
    device: Device,
) -> Result<Box<dyn PromptSegmenter>, ModelError> {
    match family {
        Family::Sam => Ok(Box::new(SamModel::load(id, files, env, device)?)),
        Family::Sam2 => Ok(Box::new(Sam2Model::load(id, files, env, device)?)),
        Family::Segformer => Err(ModelError::WeightsUnavailable(format!(
            "{id} is not a promptable segmenter"
        ))),
    }
}

fn build(
    kind: ModelKind,
    location: &ModelLocation,
    files: &ModelFiles,
    detector_files: Option<&ModelFiles>,
    env: &Arc<Environment>,
    device: Device,
) -> Result<Backend, ModelError> {
    let id = location.id.as_str();
    match kind {
        ModelKind::Sam => Ok(Backend::Sam(SamModel::load(id, files, env, device)?)),
        ModelKind::Sam2 => Ok(Backend::Sam2(Sam2Model::load(id, files, env, device)?)),
        ModelKind::Segment => Ok(Backend::Segment(Segformer::load(id, files, env, device)?)),
        ModelKind::LangSam => {
            let detector_files = detector_files
                .ok_or_else(|| ModelError::WeightsUnavailable(weights::DETECTOR_ID.to_string()))?;
            let detector = Detector::load(detector_files, env, device)?;
            let segmenter_id = match &location.source {
                Source::Remote(repo) => repo.as_str(),
                Source::Local(_) => id,
            };
            let segmenter = segmenter(location.family, segmenter_id, files, env, device)?;
            Ok(Backend::LangSam(TextSam::new(id, detector, segmenter)))
        }
    }
}
