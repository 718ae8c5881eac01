//! SAM 2.1 image predictor.
//!
//! Unlike SAM the encoder input is stretched to exactly 1024×1024 and the
//! decoder also consumes two high-resolution feature maps.

use std::sync::Arc;

use image::RgbImage;
use ndarray::{Array, IxDyn};
use ort::{Environment, Session};

use super::device::{build_session, Device};
use super::onnx::{self, Tensor};
use super::preprocess::{resize_exact, to_tensor, IMAGENET};
use super::sam::{best_mask, prompt_tensors, IMAGE_EMBEDDINGS, INPUT_SIZE};
use super::weights::ModelFiles;
use super::{DecoderPrompt, ModelError, ObjectMask, PromptSegmenter};
use crate::embedding::{ImageEmbedding, NamedTensor};

const HIGH_RES_FEATURES: [&str; 2] = ["high_res_features_0", "high_res_features_1"];

pub struct Sam2Model {
    id: String,
    encoder: Session,
    decoder: Session,
}

impl Sam2Model {
    pub fn load(id: &str, files: &ModelFiles, env: &Arc<Environment>, device: Device) -> Result<Self, ModelError> {
        let encoder = build_session(env, device, &files.path("encoder.onnx"))?;
        let decoder = build_session(env, device, &files.path("decoder.onnx"))?;
        tracing::info!(model = id, %device, "SAM2 model loaded");
        Ok(Self {
            id: id.to_string(),
            encoder,
            decoder,
        })
    }
}

impl PromptSegmenter for Sam2Model {
    fn model_id(&self) -> &str {
        &self.id
    }

    fn embed(&self, image: &RgbImage) -> Result<ImageEmbedding, ModelError> {
        let resized = resize_exact(image, INPUT_SIZE, INPUT_SIZE);
        let input = Tensor::F32(to_tensor(&resized, INPUT_SIZE as usize, INPUT_SIZE as usize, &IMAGENET));
        let mut outputs = onnx::run(&self.encoder, &[("input", &input)])?;

        let mut tensors = Vec::with_capacity(3);
        for name in std::iter::once(IMAGE_EMBEDDINGS).chain(HIGH_RES_FEATURES) {
            tensors.push(NamedTensor {
                name: name.to_string(),
                data: outputs.take(name)?,
            });
        }
        Ok(ImageEmbedding { tensors })
    }

    fn decode(
        &self,
        embedding: &ImageEmbedding,
        image_shape: (u32, u32),
        prompts: &[DecoderPrompt],
    ) -> Result<Vec<ObjectMask>, ModelError> {
        let (height, width) = image_shape;
        let feature = |name: &str| {
            embedding
                .get(name)
                .cloned()
                .map(Tensor::F32)
                .ok_or_else(|| ModelError::Output(format!("embedding has no {name}")))
        };
        let image_embeddings = feature(IMAGE_EMBEDDINGS)?;
        let high_res_0 = feature(HIGH_RES_FEATURES[0])?;
        let high_res_1 = feature(HIGH_RES_FEATURES[1])?;

        let scale = (
            INPUT_SIZE as f32 / width as f32,
            INPUT_SIZE as f32 / height as f32,
        );
        let mask_input = Tensor::F32(Array::zeros(IxDyn(&[1, 1, 256, 256])));
        let has_mask_input = Tensor::F32(Array::from_vec(vec![0.0f32]).into_dyn());
        let orig_im_size = Tensor::I64(Array::from_vec(vec![height as i64, width as i64]).into_dyn());

        let mut objects = Vec::with_capacity(prompts.len());
        for prompt in prompts {
            let (point_coords, point_labels) = prompt_tensors(&prompt.padded(), scale)?;
            let mut outputs = onnx::run(
                &self.decoder,
                &[
                    (IMAGE_EMBEDDINGS, &image_embeddings),
                    (HIGH_RES_FEATURES[0], &high_res_0),
                    (HIGH_RES_FEATURES[1], &high_res_1),
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
        tracing::debug!(objects = objects.len(), "SAM2 decoded prompts");
        Ok(objects)
    }
}
