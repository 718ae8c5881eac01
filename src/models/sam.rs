//! Segment Anything with the ONNX encoder/decoder split.
//!
//! The encoder sees the image scaled so its longest side is 1024 and padded
//! to a square; the decoder takes prompt points in that scaled space and
//! returns masks at the original size.

use std::sync::Arc;

use image::RgbImage;
use ndarray::{Array, ArrayD, Axis, IxDyn};
use ort::{Environment, Session};

use super::device::{build_session, Device};
use super::onnx::{self, Tensor};
use super::preprocess::{longest_side_size, resize_longest, to_tensor, SAM_PIXELS};
use super::weights::ModelFiles;
use super::{DecoderPrompt, ModelError, ObjectMask, PromptSegmenter};
use crate::embedding::{ImageEmbedding, NamedTensor};

pub const INPUT_SIZE: u32 = 1024;
pub const IMAGE_EMBEDDINGS: &str = "image_embeddings";

pub struct SamModel {
    id: String,
    encoder: Session,
    decoder: Session,
}

impl SamModel {
    pub fn load(id: &str, files: &ModelFiles, env: &Arc<Environment>, device: Device) -> Result<Self, ModelError> {
        let encoder = build_session(env, device, &files.path("encoder.onnx"))?;
        let decoder = build_session(env, device, &files.path("decoder.onnx"))?;
        tracing::info!(model = id, %device, "SAM model loaded");
        Ok(Self {
            id: id.to_string(),
            encoder,
            decoder,
        })
    }
}

impl PromptSegmenter for SamModel {
    fn model_id(&self) -> &str {
        &self.id
    }

    fn embed(&self, image: &RgbImage) -> Result<ImageEmbedding, ModelError> {
        let resized = resize_longest(image, INPUT_SIZE);
        let input = Tensor::F32(to_tensor(&resized, INPUT_SIZE as usize, INPUT_SIZE as usize, &SAM_PIXELS));

        let input_name = self
            .encoder
            .inputs
            .first()
            .map(|i| i.name.clone())
            .ok_or_else(|| ModelError::Output("encoder declares no inputs".into()))?;
        let outputs = onnx::run(&self.encoder, &[(input_name.as_str(), &input)])?;

        let (_, data) = outputs
            .into_vec()
            .into_iter()
            .next()
            .ok_or_else(|| ModelError::Output("encoder returned nothing".into()))?;
        tracing::debug!(shape = ?data.shape(), "computed SAM image embedding");
        Ok(ImageEmbedding {
            tensors: vec![NamedTensor {
                name: IMAGE_EMBEDDINGS.to_string(),
                data,
            }],
        })
    }

    fn decode(
        &self,
        embedding: &ImageEmbedding,
        image_shape: (u32, u32),
        prompts: &[DecoderPrompt],
    ) -> Result<Vec<ObjectMask>, ModelError> {
        let (height, width) = image_shape;
        let embeddings = embedding
            .get(IMAGE_EMBEDDINGS)
            .ok_or_else(|| ModelError::Output(format!("embedding has no {IMAGE_EMBEDDINGS}")))?;
        let embeddings = Tensor::F32(embeddings.clone());

        let (resized_w, resized_h) = longest_side_size(width, height, INPUT_SIZE);
        let scale = (
            resized_w as f32 / width as f32,
            resized_h as f32 / height as f32,
        );

        let mask_input = Tensor::F32(Array::zeros(IxDyn(&[1, 1, 256, 256])));
        let has_mask_input = Tensor::F32(Array::from_vec(vec![0.0f32]).into_dyn());
        let orig_im_size = Tensor::F32(Array::from_vec(vec![height as f32, width as f32]).into_dyn());

        let mut objects = Vec::with_capacity(prompts.len());
        for prompt in prompts {
            let (point_coords, point_labels) = prompt_tensors(&prompt.padded(), scale)?;
            let mut outputs = onnx::run(
                &self.decoder,
                &[
                    (IMAGE_EMBEDDINGS, &embeddings),
                    ("point_coords", &point_coords),
                    ("point_labels", &point_labels),
                    ("mask_input", &mask_input),
                    ("has_mask_input", &has_mask_input),
                    ("orig_im_size", &orig_im_size),
                ],
            )?;
            let masks = outputs.take("masks")?;
            let iou = outputs.take("iou_predictions")?;
            objects.push(best_mask(&masks, &iou, image_shape)?);
        }
        Ok(objects)
    }
}

/// `(1, n, 2)` coordinates scaled into encoder space and `(1, n)` labels.
pub(crate) fn prompt_tensors(prompt: &DecoderPrompt, scale: (f32, f32)) -> Result<(Tensor, Tensor), ModelError> {
    let n = prompt.coords.len();
    let coords: Vec<f32> = prompt
        .coords
        .iter()
        .flat_map(|[x, y]| [x * scale.0, y * scale.1])
        .collect();
    let coords = Array::from_shape_vec(IxDyn(&[1, n, 2]), coords)
        .map_err(|e| ModelError::Output(e.to_string()))?;
    let labels = Array::from_shape_vec(IxDyn(&[1, n]), prompt.labels.clone())
        .map_err(|e| ModelError::Output(e.to_string()))?;
    Ok((Tensor::F32(coords), Tensor::F32(labels)))
}

/// Pick the candidate with the highest predicted IoU and threshold it at 0.
pub(crate) fn best_mask(masks: &ArrayD<f32>, iou: &ArrayD<f32>, image_shape: (u32, u32)) -> Result<ObjectMask, ModelError> {
    if masks.ndim() != 4 {
        return Err(ModelError::Output(format!("masks have shape {:?}", masks.shape())));
    }
    let scores: Vec<f32> = iou.iter().copied().collect();
    let (best, score) = scores
        .iter()
        .copied()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |acc, (i, s)| if s > acc.1 { (i, s) } else { acc });
    if best >= masks.shape()[1] {
        return Err(ModelError::Output(format!(
            "{} scores for {} masks",
            scores.len(),
            masks.shape()[1]
        )));
    }

    let expected = [image_shape.0 as usize, image_shape.1 as usize];
    if masks.shape()[2..] != expected {
        return Err(ModelError::Output(format!(
            "mask shape {:?} does not match image {:?}",
            &masks.shape()[2..],
            expected
        )));
    }

    let candidate = masks.index_axis(Axis(0), 0);
    let candidate = candidate.index_axis(Axis(0), best);
    let mask = candidate
        .mapv(|v| v > 0.0)
        .into_dimensionality::<ndarray::Ix2>()
        .map_err(|e| ModelError::Output(e.to_string()))?;
    Ok(ObjectMask { mask, score })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_coordinates_scale_per_axis() {
        let prompt = DecoderPrompt {
            coords: vec![[100.0, 50.0], [200.0, 100.0]],
            labels: vec![2.0, 3.0],
        };
        let (coords, labels) = prompt_tensors(&prompt, (0.5, 0.25)).unwrap();
        let Tensor::F32(coords) = coords else { panic!("coords are f32") };
        let Tensor::F32(labels) = labels else { panic!("labels are f32") };
        assert_eq!(coords.shape(), &[1, 2, 2]);
        assert_eq!(coords[[0, 0, 0]], 50.0);
        assert_eq!(coords[[0, 0, 1]], 12.5);
        assert_eq!(coords[[0, 1, 1]], 25.0);
        assert_eq!(labels.shape(), &[1, 2]);
        assert_eq!(labels[[0, 1]], 3.0);
    }

    #[test]
    fn highest_iou_candidate_wins() {
        let mut masks = Array::from_elem(IxDyn(&[1, 3, 2, 2]), -1.0f32);
        masks[[0, 1, 0, 0]] = 4.0;
        masks[[0, 2, 1, 1]] = 4.0;
        let iou = Array::from_shape_vec(IxDyn(&[1, 3]), vec![0.1, 0.9, 0.5]).unwrap();

        let object = best_mask(&masks, &iou, (2, 2)).unwrap();
        assert_eq!(object.score, 0.9);
        assert!(object.mask[[0, 0]]);
        assert!(!object.mask[[1, 1]]);
    }

    #[test]
    fn mask_size_must_match_image() {
        let masks = Array::zeros(IxDyn(&[1, 1, 4, 4]));
        let iou = Array::from_elem(IxDyn(&[1, 1]), 1.0f32);
        assert!(best_mask(&masks, &iou, (2, 2)).is_err());
    }
}
