//! Segmentation backends behind one prediction contract.

pub mod device;
pub mod onnx;
pub mod preprocess;
pub mod registry;
pub mod sam;
pub mod sam2;
pub mod segformer;
pub mod text_sam;
pub mod weights;

use std::fmt;
use std::str::FromStr;

use image::RgbImage;
use ndarray::Array2;

use crate::embedding::ImageEmbedding;
use crate::geo::Affine;
use crate::prompt::NormalizedPromptSet;
use crate::vectorize::{raster_to_vector, Feature};

pub use registry::ModelRegistry;

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("Unknown model_type: {0}")]
    UnknownModelType(String),
    #[error("Unknown model_path {id} for {kind}. Available: {available}")]
    UnknownModel {
        kind: ModelKind,
        id: String,
        available: String,
    },
    #[error("Invalid prompt: {0}")]
    InvalidPrompt(String),
    #[error("Model weights unavailable: {0}")]
    WeightsUnavailable(String),
    #[error("Failed to download {url}: {source}")]
    Download {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("ONNX Runtime error: {0}")]
    Runtime(#[from] ort::OrtError),
    #[error("Unexpected model output: {0}")]
    Output(String),
    #[error("Tokenizer error: {0}")]
    Tokenizer(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ModelError {
    /// Errors caused by what the client sent rather than by the server.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ModelError::UnknownModelType(_) | ModelError::UnknownModel { .. } | ModelError::InvalidPrompt(_)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelKind {
    Sam,
    Sam2,
    LangSam,
    Segment,
}

impl ModelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelKind::Sam => "sam",
            ModelKind::Sam2 => "sam2",
            ModelKind::LangSam => "langsam",
            ModelKind::Segment => "segment",
        }
    }

    pub fn default_model_id(&self) -> &'static str {
        match self {
            ModelKind::Sam => "facebook/sam-vit-base",
            ModelKind::Sam2 => "ultralytics/sam2.1_b",
            ModelKind::LangSam => "ultralytics/sam2.1_s",
            ModelKind::Segment => "restor/tcd-segformer-mit-b5",
        }
    }

    /// Whether the backend runs a reusable image encoder.
    pub fn uses_embeddings(&self) -> bool {
        matches!(self, ModelKind::Sam | ModelKind::Sam2)
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelKind {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sam" => Ok(ModelKind::Sam),
            "sam2" => Ok(ModelKind::Sam2),
            "langsam" => Ok(ModelKind::LangSam),
            "segment" => Ok(ModelKind::Segment),
            other => Err(ModelError::UnknownModelType(other.to_string())),
        }
    }
}

/// A label mask plus per-object metadata, indexed by `label - 1`.
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub mask: Array2<i32>,
    pub scores: Vec<f32>,
    pub texts: Vec<String>,
}

impl Prediction {
    pub fn from_mask(mask: Array2<i32>) -> Self {
        Self {
            mask,
            scores: Vec::new(),
            texts: Vec::new(),
        }
    }

    /// `None` when no pixel carries a label.
    pub fn found(self) -> Option<Self> {
        if self.mask.iter().any(|label| *label != 0) {
            Some(self)
        } else {
            tracing::info!("decoder produced no foreground pixels");
            None
        }
    }

    /// Vectorize the mask and attach score and text to each object's feature.
    /// The empty fallback feature carries the first text, if any.
    pub fn into_features(self, transform: Option<&Affine>) -> Vec<Feature> {
        let mut features = raster_to_vector(&self.mask, transform);
        for feature in &mut features {
            let uid = feature.properties.uid;
            if uid < 1 {
                feature.properties.text = self.texts.first().cloned();
                continue;
            }
            let index = (uid - 1) as usize;
            feature.properties.score = self.scores.get(index).copied();
            feature.properties.text = self.texts.get(index).cloned();
        }
        features
    }
}

/// Point set for one decoder call, in original-image pixels.
///
/// Labels follow SAM conventions: 1 foreground, 0 background, 2 and 3 box
/// corners, -1 padding.
#[derive(Debug, Clone, PartialEq)]
pub struct DecoderPrompt {
    pub coords: Vec<[f32; 2]>,
    pub labels: Vec<f32>,
}

impl DecoderPrompt {
    fn from_box([x1, y1, x2, y2]: [f64; 4]) -> Self {
        Self {
            coords: vec![[x1 as f32, y1 as f32], [x2 as f32, y2 as f32]],
            labels: vec![2.0, 3.0],
        }
    }

    fn has_box(&self) -> bool {
        self.labels.contains(&2.0)
    }

    /// Append the padding point the ONNX decoder expects when no box is given.
    pub fn padded(&self) -> Self {
        let mut out = self.clone();
        if !self.has_box() {
            out.coords.push([0.0, 0.0]);
            out.labels.push(-1.0);
        }
        out
    }
}

/// Split normalized prompts into one decoder call per object.
///
/// Every point object consumes as many labels as it has points. When the
/// number of boxes equals the number of point objects, box `i` joins object
/// `i`; otherwise boxes are objects of their own.
pub fn decoder_prompts(prompts: &NormalizedPromptSet) -> Result<Vec<DecoderPrompt>, ModelError> {
    let objects = prompts.points.objects();
    let point_total: usize = objects.iter().map(|o| o.len()).sum();
    if point_total != prompts.labels.len() {
        return Err(ModelError::InvalidPrompt(format!(
            "{} labels given for {} points",
            prompts.labels.len(),
            point_total
        )));
    }

    let mut labels = prompts.labels.iter();
    let mut out: Vec<DecoderPrompt> = objects
        .iter()
        .map(|points| DecoderPrompt {
            coords: points.iter().map(|[x, y]| [*x as f32, *y as f32]).collect(),
            labels: points
                .iter()
                .filter_map(|_| labels.next().map(|l| *l as f32))
                .collect(),
        })
        .collect();

    if !out.is_empty() && prompts.boxes.len() == out.len() {
        for (object, b) in out.iter_mut().zip(&prompts.boxes) {
            let corner = DecoderPrompt::from_box(*b);
            object.coords.extend(corner.coords);
            object.labels.extend(corner.labels);
        }
    } else {
        out.extend(prompts.boxes.iter().copied().map(DecoderPrompt::from_box));
    }

    if out.is_empty() {
        return Err(ModelError::InvalidPrompt(
            "at least one point or box prompt is required".to_string(),
        ));
    }
    Ok(out)
}

/// Binary mask and confidence for one decoded object.
#[derive(Debug, Clone)]
pub struct ObjectMask {
    pub mask: Array2<bool>,
    pub score: f32,
}

/// Paint object `i` with label `i + 1`; later objects overwrite earlier ones.
pub fn combine_masks(shape: (usize, usize), objects: &[ObjectMask]) -> Array2<i32> {
    let mut combined = Array2::<i32>::zeros(shape);
    for (i, object) in objects.iter().enumerate() {
        let label = i as i32 + 1;
        ndarray::Zip::from(&mut combined)
            .and(&object.mask)
            .for_each(|out, &on| {
                if on {
                    *out = label;
                }
            });
    }
    combined
}

/// Backends with a separable image encoder and prompt decoder.
pub trait PromptSegmenter: Send + Sync {
    fn model_id(&self) -> &str;

    fn embed(&self, image: &RgbImage) -> Result<ImageEmbedding, ModelError>;

    /// One mask per prompt for an image of `image_shape = (height, width)`.
    fn decode(
        &self,
        embedding: &ImageEmbedding,
        image_shape: (u32, u32),
        prompts: &[DecoderPrompt],
    ) -> Result<Vec<ObjectMask>, ModelError>;

    /// Decode every object and merge the results into one label mask.
    /// `None` when no object covers a single pixel.
    fn predict(
        &self,
        embedding: &ImageEmbedding,
        image_shape: (u32, u32),
        calls: &[DecoderPrompt],
    ) -> Result<Option<Prediction>, ModelError> {
        let objects = self.decode(embedding, image_shape, calls)?;
        if objects.is_empty() {
            return Ok(None);
        }
        let shape = (image_shape.0 as usize, image_shape.1 as usize);
        Ok(Prediction {
            mask: combine_masks(shape, &objects),
            scores: objects.iter().map(|o| o.score).collect(),
            texts: Vec::new(),
        }
        .found())
    }
}

/// A loaded backend, one variant per model family.
pub enum Backend {
    Sam(sam::SamModel),
    Sam2(sam2::Sam2Model),
    LangSam(text_sam::TextSam),
    Segment(segformer::Segformer),
}

impl Backend {
    pub fn kind(&self) -> ModelKind {
        match self {
            Backend::Sam(_) => ModelKind::Sam,
            Backend::Sam2(_) => ModelKind::Sam2,
            Backend::LangSam(_) => ModelKind::LangSam,
            Backend::Segment(_) => ModelKind::Segment,
        }
    }

    pub fn model_id(&self) -> &str {
        match self {
            Backend::Sam(m) => m.model_id(),
            Backend::Sam2(m) => m.model_id(),
            Backend::LangSam(m) => m.model_id(),
            Backend::Segment(m) => m.model_id(),
        }
    }

    /// The encoder/decoder pair, for backends whose embeddings can be cached.
    pub fn prompt_segmenter(&self) -> Option<&dyn PromptSegmenter> {
        match self {
            Backend::Sam(m) => Some(m),
            Backend::Sam2(m) => Some(m),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompt::{normalize, Prompt};
    use ndarray::array;

    #[test]
    fn model_kind_parses_known_names() {
        assert_eq!("sam".parse::<ModelKind>().unwrap(), ModelKind::Sam);
        assert_eq!("sam2".parse::<ModelKind>().unwrap(), ModelKind::Sam2);
        assert_eq!("langsam".parse::<ModelKind>().unwrap(), ModelKind::LangSam);
        assert_eq!("segment".parse::<ModelKind>().unwrap(), ModelKind::Segment);

        let err = "yolo".parse::<ModelKind>().unwrap_err();
        assert_eq!(err.to_string(), "Unknown model_type: yolo");
        assert!(err.is_client_error());
    }

    #[test]
    fn single_point_object_gets_its_labels() {
        let prompts = normalize([Prompt::Point {
            points: vec![[10.0, 20.0], [30.0, 40.0]],
            labels: vec![1, 0],
        }]);
        let calls = decoder_prompts(&prompts).unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].coords, vec![[10.0, 20.0], [30.0, 40.0]]);
        assert_eq!(calls[0].labels, vec![1.0, 0.0]);
    }

    #[test]
    fn label_count_mismatch_is_rejected() {
        let prompts = normalize([Prompt::Point {
            points: vec![[1.0, 1.0], [2.0, 2.0]],
            labels: vec![1],
        }]);
        let err = decoder_prompts(&prompts).unwrap_err();
        assert!(matches!(err, ModelError::InvalidPrompt(_)));
    }

    #[test]
    fn boxes_pair_with_point_objects_when_counts_match() {
        let prompts = normalize([
            Prompt::Point { points: vec![[5.0, 5.0]], labels: vec![1] },
            Prompt::Point { points: vec![[50.0, 50.0]], labels: vec![1] },
            Prompt::Box { boxes: vec![[0.0, 0.0, 10.0, 10.0], [40.0, 40.0, 60.0, 60.0]] },
        ]);
        let calls = decoder_prompts(&prompts).unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].labels, vec![1.0, 2.0, 3.0]);
        assert_eq!(calls[1].coords[2], [60.0, 60.0]);
    }

    #[test]
    fn lone_boxes_are_objects() {
        let prompts = normalize([Prompt::Box {
            boxes: vec![[0.0, 0.0, 10.0, 10.0], [1.0, 2.0, 3.0, 4.0]],
        }]);
        let calls = decoder_prompts(&prompts).unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].labels, vec![2.0, 3.0]);
        assert_eq!(calls[0].padded(), calls[0]);
    }

    #[test]
    fn empty_prompts_are_rejected() {
        let err = decoder_prompts(&NormalizedPromptSet::default()).unwrap_err();
        assert!(matches!(err, ModelError::InvalidPrompt(_)));
    }

    #[test]
    fn point_only_prompts_are_padded() {
        let prompt = DecoderPrompt { coords: vec![[1.0, 2.0]], labels: vec![1.0] };
        let padded = prompt.padded();
        assert_eq!(padded.coords, vec![[1.0, 2.0], [0.0, 0.0]]);
        assert_eq!(padded.labels, vec![1.0, -1.0]);
    }

    #[test]
    fn later_objects_overwrite_earlier() {
        let a = ObjectMask { mask: array![[true, true], [false, false]], score: 0.9 };
        let b = ObjectMask { mask: array![[false, true], [false, true]], score: 0.8 };
        let combined = combine_masks((2, 2), &[a, b]);
        assert_eq!(combined, array![[1, 2], [0, 2]]);
    }

    /// Decoder stub painting every object with `fill`.
    struct Uniform {
        fill: bool,
    }

    impl PromptSegmenter for Uniform {
        fn model_id(&self) -> &str {
            "test/uniform"
        }

        fn embed(&self, _image: &RgbImage) -> Result<ImageEmbedding, ModelError> {
            Ok(ImageEmbedding { tensors: Vec::new() })
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
                    mask: Array2::from_elem((h as usize, w as usize), self.fill),
                    score: 0.7,
                })
                .collect())
        }
    }

    #[test]
    fn blank_decoder_output_is_no_prediction() {
        let calls = [DecoderPrompt::from_box([0.0, 0.0, 2.0, 2.0])];
        let embedding = ImageEmbedding { tensors: Vec::new() };
        let blank = Uniform { fill: false };
        assert_eq!(blank.predict(&embedding, (3, 4), &calls).unwrap(), None);

        let full = Uniform { fill: true };
        let prediction = full.predict(&embedding, (3, 4), &calls).unwrap().unwrap();
        assert_eq!(prediction.mask, Array2::from_elem((3, 4), 1));
        assert_eq!(prediction.scores, vec![0.7]);
    }

    #[test]
    fn all_background_is_not_found() {
        assert!(Prediction::from_mask(Array2::zeros((2, 2))).found().is_none());
        assert!(Prediction::from_mask(array![[0, 3], [0, 0]]).found().is_some());
    }

    #[test]
    fn features_carry_scores_and_texts() {
        let prediction = Prediction {
            mask: array![[1, 0, 2], [1, 0, 2]],
            scores: vec![0.9, 0.5],
            texts: vec!["tree".into(), "roof".into()],
        };
        let features = prediction.into_features(None);
        assert_eq!(features.len(), 2);
        assert_eq!(features[0].properties.uid, 1);
        assert_eq!(features[0].properties.score, Some(0.9));
        assert_eq!(features[1].properties.text.as_deref(), Some("roof"));
    }

    #[test]
    fn empty_mask_falls_back_with_text() {
        let prediction = Prediction {
            mask: Array2::zeros((3, 3)),
            scores: Vec::new(),
            texts: vec!["pond".into()],
        };
        let features = prediction.into_features(None);
        assert_eq!(features.len(), 1);
        assert_eq!(features[0].properties.uid, -1);
        assert_eq!(features[0].properties.text.as_deref(), Some("pond"));
        assert_eq!(features[0].properties.score, None);
    }
}
