//! Text-prompted segmentation: an open-vocabulary detector turns each text
//! prompt into a box, and a SAM-family decoder turns the box into a mask.

use std::sync::Arc;

use image::RgbImage;
use ndarray::{Array, ArrayView2, Axis, Ix2, IxDyn};
use ort::{Environment, Session};
use tokenizers::Tokenizer;

use super::device::{build_session, Device};
use super::onnx::{self, Tensor};
use super::preprocess::{resize_exact, to_tensor, CLIP};
use super::weights::ModelFiles;
use super::{combine_masks, DecoderPrompt, ModelError, Prediction, PromptSegmenter};
use crate::prompt::NormalizedPromptSet;

const DETECTOR_INPUT_SIZE: u32 = 768;
const MAX_QUERY_TOKENS: usize = 16;
const PAD_TOKEN_ID: i64 = 0;

/// Minimum sigmoid score for a box to count as a match for its text.
pub const SCORE_THRESHOLD: f32 = 0.24;

/// Best box for one text query, in original-image pixels.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub bbox: [f64; 4],
    pub score: f32,
}

pub struct Detector {
    session: Session,
    tokenizer: Tokenizer,
}

impl Detector {
    pub fn load(files: &ModelFiles, env: &Arc<Environment>, device: Device) -> Result<Self, ModelError> {
        let session = build_session(env, device, &files.path("model.onnx"))?;
        let tokenizer = Tokenizer::from_file(files.path("tokenizer.json"))
            .map_err(|e| ModelError::Tokenizer(e.to_string()))?;
        Ok(Self { session, tokenizer })
    }

    /// `(queries, 16)` token ids and attention mask, padded or truncated.
    fn encode_queries(&self, queries: &[String]) -> Result<(Tensor, Tensor), ModelError> {
        let mut ids = Vec::with_capacity(queries.len() * MAX_QUERY_TOKENS);
        let mut mask = Vec::with_capacity(queries.len() * MAX_QUERY_TOKENS);
        for query in queries {
            let encoding = self
                .tokenizer
                .encode(query.as_str(), true)
                .map_err(|e| ModelError::Tokenizer(e.to_string()))?;
            let (q_ids, q_mask) = pad_tokens(encoding.get_ids(), MAX_QUERY_TOKENS);
            ids.extend(q_ids);
            mask.extend(q_mask);
        }
        let shape = IxDyn(&[queries.len(), MAX_QUERY_TOKENS]);
        let ids = Array::from_shape_vec(shape.clone(), ids).map_err(|e| ModelError::Output(e.to_string()))?;
        let mask = Array::from_shape_vec(shape, mask).map_err(|e| ModelError::Output(e.to_string()))?;
        Ok((Tensor::I64(ids), Tensor::I64(mask)))
    }

    /// Highest scoring box per query, `None` where nothing passed the threshold.
    pub fn detect(&self, image: &RgbImage, queries: &[String]) -> Result<Vec<Option<Detection>>, ModelError> {
        let (input_ids, attention_mask) = self.encode_queries(queries)?;
        let resized = resize_exact(image, DETECTOR_INPUT_SIZE, DETECTOR_INPUT_SIZE);
        let size = DETECTOR_INPUT_SIZE as usize;
        let pixel_values = Tensor::F32(to_tensor(&resized, size, size, &CLIP));

        let mut outputs = onnx::run(
            &self.session,
            &[
                ("input_ids", &input_ids),
                ("attention_mask", &attention_mask),
                ("pixel_values", &pixel_values),
            ],
        )?;
        let logits = first_batch(outputs.take("logits")?)?;
        let boxes = first_batch(outputs.take("pred_boxes")?)?;

        Ok(best_boxes(
            logits.view(),
            boxes.view(),
            (image.width(), image.height()),
            SCORE_THRESHOLD,
        ))
    }
}

fn first_batch(output: ndarray::ArrayD<f32>) -> Result<ndarray::Array2<f32>, ModelError> {
    if output.ndim() != 3 {
        return Err(ModelError::Output(format!("detector output shape {:?}", output.shape())));
    }
    output
        .index_axis_move(Axis(0), 0)
        .into_dimensionality::<Ix2>()
        .map_err(|e| ModelError::Output(e.to_string()))
}

fn pad_tokens(ids: &[u32], len: usize) -> (Vec<i64>, Vec<i64>) {
    let mut out_ids: Vec<i64> = ids.iter().take(len).map(|&id| id as i64).collect();
    let mut mask = vec![1i64; out_ids.len()];
    out_ids.resize(len, PAD_TOKEN_ID);
    mask.resize(len, 0);
    (out_ids, mask)
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// `logits` is `(patches, queries)`, `boxes` is `(patches, 4)` as normalized
/// `(cx, cy, w, h)`. Boxes come back as clamped pixel `[x1, y1, x2, y2]`.
pub fn best_boxes(
    logits: ArrayView2<f32>,
    boxes: ArrayView2<f32>,
    image_size: (u32, u32),
    threshold: f32,
) -> Vec<Option<Detection>> {
    let (width, height) = (image_size.0 as f64, image_size.1 as f64);
    logits
        .axis_iter(Axis(1))
        .map(|query| {
            let (patch, score) = query
                .iter()
                .map(|l| sigmoid(*l))
                .enumerate()
                .fold((0, f32::NEG_INFINITY), |acc, (i, s)| if s > acc.1 { (i, s) } else { acc });
            if score <= threshold || patch >= boxes.nrows() {
                return None;
            }
            let b = boxes.row(patch);
            let (cx, cy, w, h) = (b[0] as f64, b[1] as f64, b[2] as f64, b[3] as f64);
            let clamp_x = |v: f64| (v * width).clamp(0.0, width);
            let clamp_y = |v: f64| (v * height).clamp(0.0, height);
            Some(Detection {
                bbox: [
                    clamp_x(cx - w / 2.0),
                    clamp_y(cy - h / 2.0),
                    clamp_x(cx + w / 2.0),
                    clamp_y(cy + h / 2.0),
                ],
                score,
            })
        })
        .collect()
}

pub struct TextSam {
    id: String,
    detector: Detector,
    segmenter: Box<dyn PromptSegmenter>,
}

impl TextSam {
    pub fn new(id: &str, detector: Detector, segmenter: Box<dyn PromptSegmenter>) -> Self {
        tracing::info!(model = id, segmenter = segmenter.model_id(), "text segmentation model ready");
        Self {
            id: id.to_string(),
            detector,
            segmenter,
        }
    }

    pub fn model_id(&self) -> &str {
        &self.id
    }

    /// One object per text prompt the detector found. A request whose texts
    /// all go undetected yields an empty mask rather than `None`; detected
    /// boxes that decode to nothing yield `None`.
    pub fn get_masks(&self, image: &RgbImage, prompts: &NormalizedPromptSet) -> Result<Option<Prediction>, ModelError> {
        if prompts.text.is_empty() {
            return Err(ModelError::InvalidPrompt("text prompt required for langsam".into()));
        }

        let detections = self.detector.detect(image, &prompts.text)?;
        let mut calls = Vec::new();
        let mut scores = Vec::new();
        let mut texts = Vec::new();
        for (text, detection) in prompts.text.iter().zip(detections) {
            match detection {
                Some(d) => {
                    tracing::debug!(text = %text, score = d.score, bbox = ?d.bbox, "detected");
                    calls.push(DecoderPrompt {
                        coords: vec![
                            [d.bbox[0] as f32, d.bbox[1] as f32],
                            [d.bbox[2] as f32, d.bbox[3] as f32],
                        ],
                        labels: vec![2.0, 3.0],
                    });
                    scores.push(d.score);
                    texts.push(text.clone());
                }
                None => tracing::info!(text = %text, "no box above threshold"),
            }
        }

        let shape = (image.height(), image.width());
        let grid = (shape.0 as usize, shape.1 as usize);
        if calls.is_empty() {
            return Ok(Some(Prediction {
                mask: ndarray::Array2::zeros(grid),
                scores,
                texts: prompts.text.clone(),
            }));
        }

        let embedding = self.segmenter.embed(image)?;
        let objects = self.segmenter.decode(&embedding, shape, &calls)?;
        Ok(Prediction {
            mask: combine_masks(grid, &objects),
            scores,
            texts,
        }
        .found())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn tokens_are_padded_and_truncated() {
        let (ids, mask) = pad_tokens(&[49406, 2677, 49407], 5);
        assert_eq!(ids, vec![49406, 2677, 49407, 0, 0]);
        assert_eq!(mask, vec![1, 1, 1, 0, 0]);

        let long: Vec<u32> = (1..=20).collect();
        let (ids, mask) = pad_tokens(&long, MAX_QUERY_TOKENS);
        assert_eq!(ids.len(), MAX_QUERY_TOKENS);
        assert!(mask.iter().all(|m| *m == 1));
    }

    #[test]
    fn best_patch_per_query_is_scaled_to_pixels() {
        // two patches, two queries
        let logits = array![[3.0f32, -4.0], [1.0, -5.0]];
        let boxes = array![[0.5f32, 0.5, 0.2, 0.4], [0.1, 0.1, 0.1, 0.1]];
        let found = best_boxes(logits.view(), boxes.view(), (200, 100), SCORE_THRESHOLD);

        assert_eq!(found.len(), 2);
        let first = found[0].as_ref().unwrap();
        assert!(first.score > 0.9);
        let [x1, y1, x2, y2] = first.bbox;
        assert!((x1 - 80.0).abs() < 1e-4);
        assert!((y1 - 30.0).abs() < 1e-4);
        assert!((x2 - 120.0).abs() < 1e-4);
        assert!((y2 - 70.0).abs() < 1e-4);
        assert!(found[1].is_none());
    }

    #[test]
    fn boxes_are_clamped_to_the_image() {
        let logits = array![[5.0f32]];
        let boxes = array![[0.95f32, 0.05, 0.3, 0.3]];
        let found = best_boxes(logits.view(), boxes.view(), (100, 100), SCORE_THRESHOLD);
        let bbox = found[0].as_ref().unwrap().bbox;
        assert_eq!(bbox[1], 0.0);
        assert_eq!(bbox[2], 100.0);
    }
}
