//! Affine georeferencing and map → pixel prompt reprojection.

use serde::{Deserialize, Serialize};

use crate::prompt::NormalizedPromptSet;

/// Pixel `(col, row)` → map `(x, y)`:
/// `x = a·col + b·row + c`, `y = d·col + e·row + f`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Affine {
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub d: f64,
    pub e: f64,
    pub f: f64,
}

impl Affine {
    pub const IDENTITY: Affine = Affine::new(1.0, 0.0, 0.0, 0.0, 1.0, 0.0);

    pub const fn new(a: f64, b: f64, c: f64, d: f64, e: f64, f: f64) -> Self {
        Self { a, b, c, d, e, f }
    }

    /// North-up grid from an upper-left origin and pixel size.
    pub fn from_origin(west: f64, north: f64, x_size: f64, y_size: f64) -> Self {
        Self::new(x_size, 0.0, west, 0.0, -y_size, north)
    }

    pub fn apply(&self, x: f64, y: f64) -> (f64, f64) {
        (
            self.a * x + self.b * y + self.c,
            self.d * x + self.e * y + self.f,
        )
    }

    pub fn determinant(&self) -> f64 {
        self.a * self.e - self.b * self.d
    }

    /// `None` when the transform is degenerate.
    pub fn inverse(&self) -> Option<Affine> {
        let det = self.determinant();
        if det == 0.0 || !det.is_finite() {
            return None;
        }
        let a = self.e / det;
        let b = -self.b / det;
        let d = -self.d / det;
        let e = self.a / det;
        Some(Affine::new(
            a,
            b,
            -a * self.c - b * self.f,
            d,
            e,
            -d * self.c - e * self.f,
        ))
    }
}

/// Coordinate space the client drew its prompts in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptSpace {
    #[default]
    Pixel,
    Map,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum TransformError {
    #[error("affine transform is not invertible")]
    Singular,
    #[error("image has zero width or height")]
    EmptyImage,
}

/// Map prompts into pixel space of a `height × width` image.
///
/// Coordinates are truncated and clamped to `[0, width-1] × [0, height-1]`;
/// box corners are reordered afterwards so `x1 <= x2` and `y1 <= y2` even when
/// the transform flips an axis. Labels and text pass through.
pub fn reproject_prompts(
    prompts: &NormalizedPromptSet,
    transform: &Affine,
    image_shape: (u32, u32),
) -> Result<NormalizedPromptSet, TransformError> {
    let (height, width) = image_shape;
    if height == 0 || width == 0 {
        return Err(TransformError::EmptyImage);
    }
    let inverse = transform.inverse().ok_or(TransformError::Singular)?;

    let clip = |x: f64, y: f64| -> (f64, f64) {
        let x = (x.trunc() as i64).clamp(0, width as i64 - 1);
        let y = (y.trunc() as i64).clamp(0, height as i64 - 1);
        (x as f64, y as f64)
    };
    let to_pixel = |x: f64, y: f64| {
        let (px, py) = inverse.apply(x, y);
        clip(px, py)
    };

    let points = prompts.points.map_points(|[x, y]| {
        let (px, py) = to_pixel(x, y);
        [px, py]
    });

    let boxes = prompts
        .boxes
        .iter()
        .map(|[x1, y1, x2, y2]| {
            let (x1, y1) = to_pixel(*x1, *y1);
            let (x2, y2) = to_pixel(*x2, *y2);
            [x1.min(x2), y1.min(y2), x1.max(x2), y1.max(y2)]
        })
        .collect();

    Ok(NormalizedPromptSet {
        points,
        labels: prompts.labels.clone(),
        boxes,
        text: prompts.text.clone(),
    })
}

/// Pixel rectangle `[x_min, x_max)` × `[y_min, y_max)` used to crop
/// processing to an area of interest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelWindow {
    pub x_min: u32,
    pub y_min: u32,
    pub x_max: u32,
    pub y_max: u32,
}

impl PixelWindow {
    /// Clip `[x_min, y_min, x_max, y_max]` to the image. `None` if nothing
    /// of the window is left.
    pub fn clipped(coords: [f64; 4], width: u32, height: u32) -> Option<Self> {
        let [x0, y0, x1, y1] = coords;
        let clamp = |v: f64, max: u32| (v.max(0.0) as u32).min(max);
        let window = PixelWindow {
            x_min: clamp(x0.min(x1), width),
            y_min: clamp(y0.min(y1), height),
            x_max: clamp(x0.max(x1), width),
            y_max: clamp(y0.max(y1), height),
        };
        (window.width() > 0 && window.height() > 0).then_some(window)
    }

    pub fn width(&self) -> u32 {
        self.x_max - self.x_min
    }

    pub fn height(&self) -> u32 {
        self.y_max - self.y_min
    }
}
