//! Prompt-free semantic segmentation (SegFormer exports).

use std::sync::Arc;

use image::RgbImage;
use ndarray::{s, Array2, Array3, Ix3};
use ort::{Environment, Session};

use super::device::{build_session, Device};
use super::onnx::{self, Tensor};
use super::preprocess::{argmax_channels, resize_bilinear, resize_exact, to_tensor, IMAGENET};
use super::weights::ModelFiles;
use super::{ModelError, Prediction};
use crate::geo::PixelWindow;

const DEFAULT_INPUT_SIZE: (usize, usize) = (1024, 1024);

pub struct Segformer {
    id: String,
    session: Session,
    input_size: (usize, usize),
}

impl Segformer {
    pub fn load(id: &str, files: &ModelFiles, env: &Arc<Environment>, device: Device) -> Result<Self, ModelError> {
        let session = build_session(env, device, &files.path("model.onnx"))?;
        let input_size = onnx::fixed_input_size(&session, 0).unwrap_or(DEFAULT_INPUT_SIZE);
        tracing::info!(model = id, %device, ?input_size, "segmentation model loaded");
        Ok(Self {
            id: id.to_string(),
            session,
            input_size,
        })
    }

    pub fn model_id(&self) -> &str {
        &self.id
    }

    /// Label mask for the whole image. With an AOI only that window is
    /// segmented and everything outside it is background. `None` when every
    /// pixel is background.
    pub fn get_masks(&self, image: &RgbImage, aoi: Option<&PixelWindow>) -> Result<Option<Prediction>, ModelError> {
        let Some(window) = aoi else {
            return Ok(Prediction::from_mask(self.segment(image)?).found());
        };

        let region = image::imageops::crop_imm(image, window.x_min, window.y_min, window.width(), window.height()).to_image();
        let labels = self.segment(&region)?;
        Ok(Prediction::from_mask(paste(
            &labels,
            window,
            (image.height() as usize, image.width() as usize),
        ))
        .found())
    }

    fn segment(&self, image: &RgbImage) -> Result<Array2<i32>, ModelError> {
        let (in_h, in_w) = self.input_size;
        let resized = resize_exact(image, in_w as u32, in_h as u32);
        let pixel_values = Tensor::F32(to_tensor(&resized, in_h, in_w, &IMAGENET));

        let mut outputs = onnx::run(&self.session, &[("pixel_values", &pixel_values)])?;
        let logits = outputs.take("logits")?;
        if logits.ndim() != 4 {
            return Err(ModelError::Output(format!("logits have shape {:?}", logits.shape())));
        }
        let logits: Array3<f32> = logits
            .index_axis_move(ndarray::Axis(0), 0)
            .into_dimensionality::<Ix3>()
            .map_err(|e| ModelError::Output(format!("logits: {e}")))?;

        let upsampled = resize_bilinear(&logits, image.height() as usize, image.width() as usize);
        let labels = argmax_channels(&upsampled);
        tracing::debug!(classes = logits.dim().0, "segmentation finished");
        Ok(labels)
    }
}

/// Place `labels` at `window` inside a zeroed canvas of `shape`.
fn paste(labels: &Array2<i32>, window: &PixelWindow, shape: (usize, usize)) -> Array2<i32> {
    let mut canvas = Array2::<i32>::zeros(shape);
    let (y0, x0) = (window.y_min as usize, window.x_min as usize);
    let (y1, x1) = (window.y_max as usize, window.x_max as usize);
    canvas.slice_mut(s![y0..y1, x0..x1]).assign(labels);
    canvas
}
