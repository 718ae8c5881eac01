//! Image-to-tensor conversion shared by the encoders.

use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::{Array, Array2, Array3, ArrayD, Axis};

/// Per-channel `(value * scale - mean) / std`.
#[derive(Debug, Clone, Copy)]
pub struct Normalization {
    pub scale: f32,
    pub mean: [f32; 3],
    pub std: [f32; 3],
}

/// SAM statistics, applied to raw 0-255 values.
pub const SAM_PIXELS: Normalization = Normalization {
    scale: 1.0,
    mean: [123.675, 116.28, 103.53],
    std: [58.395, 57.12, 57.375],
};

/// ImageNet statistics on 0-1 values.
pub const IMAGENET: Normalization = Normalization {
    scale: 1.0 / 255.0,
    mean: [0.485, 0.456, 0.406],
    std: [0.229, 0.224, 0.225],
};

pub const CLIP: Normalization = Normalization {
    scale: 1.0 / 255.0,
    mean: [0.481_454_66, 0.457_827_5, 0.408_210_73],
    std: [0.268_629_54, 0.261_302_58, 0.275_777_11],
};

/// `(width, height)` after scaling the longest side to `target`.
pub fn longest_side_size(width: u32, height: u32, target: u32) -> (u32, u32) {
    let scale = target as f64 / width.max(height).max(1) as f64;
    let new_w = ((width as f64 * scale).round() as u32).max(1);
    let new_h = ((height as f64 * scale).round() as u32).max(1);
    (new_w, new_h)
}

/// Resize so the longest side equals `target`, keeping the aspect ratio.
pub fn resize_longest(image: &RgbImage, target: u32) -> RgbImage {
    let (w, h) = longest_side_size(image.width(), image.height(), target);
    imageops::resize(image, w, h, FilterType::CatmullRom)
}

pub fn resize_exact(image: &RgbImage, width: u32, height: u32) -> RgbImage {
    imageops::resize(image, width, height, FilterType::CatmullRom)
}

/// Copy `image` into a zeroed `(1, 3, height, width)` tensor, normalizing
/// each pixel. Pixels beyond the image stay 0, i.e. padding at the mean.
pub fn to_tensor(image: &RgbImage, height: usize, width: usize, norm: &Normalization) -> ArrayD<f32> {
    let mut input = Array::zeros((1, 3, height, width)).into_dyn();
    for (x, y, pixel) in image.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        if x >= width || y >= height {
            continue;
        }
        for c in 0..3 {
            input[[0, c, y, x]] = (pixel.0[c] as f32 * norm.scale - norm.mean[c]) / norm.std[c];
        }
    }
    input
}

/// Bilinear resize of a `(channels, h, w)` stack with half-pixel centers.
pub fn resize_bilinear(input: &Array3<f32>, out_h: usize, out_w: usize) -> Array3<f32> {
    let (channels, in_h, in_w) = input.dim();
    let mut out = Array3::<f32>::zeros((channels, out_h, out_w));
    if in_h == 0 || in_w == 0 {
        return out;
    }
    let sy = in_h as f32 / out_h as f32;
    let sx = in_w as f32 / out_w as f32;

    let axis = |o: usize, scale: f32, len: usize| {
        let src = ((o as f32 + 0.5) * scale - 0.5).max(0.0);
        let i0 = (src.floor() as usize).min(len - 1);
        let i1 = (i0 + 1).min(len - 1);
        (i0, i1, src - i0 as f32)
    };
    let xs: Vec<_> = (0..out_w).map(|x| axis(x, sx, in_w)).collect();

    for oy in 0..out_h {
        let (y0, y1, wy) = axis(oy, sy, in_h);
        for (ox, &(x0, x1, wx)) in xs.iter().enumerate() {
            for c in 0..channels {
                let top = input[[c, y0, x0]] * (1.0 - wx) + input[[c, y0, x1]] * wx;
                let bottom = input[[c, y1, x0]] * (1.0 - wx) + input[[c, y1, x1]] * wx;
                out[[c, oy, ox]] = top * (1.0 - wy) + bottom * wy;
            }
        }
    }
    out
}

/// Index of the largest channel at every pixel.
pub fn argmax_channels(scores: &Array3<f32>) -> Array2<i32> {
    let (_, h, w) = scores.dim();
    let mut labels = Array2::<i32>::zeros((h, w));
    for ((y, x), label) in labels.indexed_iter_mut() {
        let column = scores.index_axis(Axis(2), x);
        let column = column.index_axis(Axis(1), y);
        let mut best = 0usize;
        for (c, v) in column.iter().enumerate() {
            if *v > column[best] {
                best = c;
            }
        }
        *label = best as i32;
    }
    labels
}
