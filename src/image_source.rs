//! Loading request images from URLs or local rasters.

use std::io::Cursor;
use std::path::Path;

use image::{DynamicImage, RgbImage};
use tiff::decoder::{Decoder, DecodingResult};
use tiff::tags::Tag;

use crate::geo::Affine;

const MODEL_PIXEL_SCALE: u16 = 33550;
const MODEL_TIEPOINT: u16 = 33922;
const MODEL_TRANSFORMATION: u16 = 34264;
const GEO_KEY_DIRECTORY: u16 = 34735;

const GEOGRAPHIC_TYPE_KEY: u32 = 2048;
const PROJECTED_CS_TYPE_KEY: u32 = 3072;
const USER_DEFINED: u32 = 32767;

#[derive(Debug, thiserror::Error)]
pub enum ImageSourceError {
    #[error("Invalid or missing image_path: {0}")]
    InvalidPath(String),
    #[error("Error downloading image from {url}: {source}")]
    Fetch {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("Failed to load image: {0}")]
    Decode(#[from] image::ImageError),
    #[error("Failed to load image: {0}")]
    Tiff(#[from] tiff::TiffError),
    #[error("Failed to load image: {0}")]
    Layout(String),
    #[error("Failed to read image: {0}")]
    Io(#[from] std::io::Error),
}

impl ImageSourceError {
    /// True when the client named something we cannot reach at all.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ImageSourceError::InvalidPath(_) | ImageSourceError::Fetch { .. }
        )
    }
}

/// An RGB image plus whatever georeferencing its file carried.
#[derive(Debug, Clone)]
pub struct SourceImage {
    pub rgb: RgbImage,
    pub transform: Option<Affine>,
    pub crs: Option<String>,
}

impl SourceImage {
    pub fn new(rgb: RgbImage) -> Self {
        Self {
            rgb,
            transform: None,
            crs: None,
        }
    }

    pub fn width(&self) -> u32 {
        self.rgb.width()
    }

    pub fn height(&self) -> u32 {
        self.rgb.height()
    }

    /// `(height, width)`, the order the embedding cache records.
    pub fn shape(&self) -> (u32, u32) {
        (self.rgb.height(), self.rgb.width())
    }
}

pub fn is_url(path: &str) -> bool {
    path.starts_with("http://") || path.starts_with("https://")
}

/// Fetch or read `image_path` and decode it. Each source is tried once.
pub async fn load(image_path: &str, client: &reqwest::Client) -> Result<SourceImage, ImageSourceError> {
    if image_path.trim().is_empty() {
        return Err(ImageSourceError::InvalidPath(image_path.to_string()));
    }

    if is_url(image_path) {
        let bytes = fetch(image_path, client).await?;
        // Remote images are treated as plain pictures, never georeferenced.
        return rocket::tokio::task::spawn_blocking(move || decode_plain(&bytes))
            .await
            .map_err(|e| ImageSourceError::Io(std::io::Error::other(e)))?;
    }

    let path = Path::new(image_path);
    if !path.is_file() {
        tracing::error!(image_path, "invalid image path");
        return Err(ImageSourceError::InvalidPath(image_path.to_string()));
    }
    let bytes = rocket::tokio::fs::read(path).await?;
    rocket::tokio::task::spawn_blocking(move || decode_raster(&bytes))
        .await
        .map_err(|e| ImageSourceError::Io(std::io::Error::other(e)))?
}

async fn fetch(url: &str, client: &reqwest::Client) -> Result<Vec<u8>, ImageSourceError> {
    let fetch_err = |source| ImageSourceError::Fetch {
        url: url.to_string(),
        source,
    };
    let response = client
        .get(url)
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(fetch_err)?;
    let bytes = response.bytes().await.map_err(fetch_err)?;
    tracing::debug!(url, bytes = bytes.len(), "downloaded image");
    Ok(bytes.to_vec())
}

pub fn decode_plain(bytes: &[u8]) -> Result<SourceImage, ImageSourceError> {
    if is_tiff(bytes) {
        return Ok(SourceImage::new(decode_tiff(bytes)?));
    }
    let img = image::load_from_memory(bytes)?;
    Ok(SourceImage::new(to_rgb(img)))
}

/// Decode any supported image; TIFFs are also probed for GeoTIFF tags.
pub fn decode_raster(bytes: &[u8]) -> Result<SourceImage, ImageSourceError> {
    let mut source = decode_plain(bytes)?;
    if let Some(georef) = read_georeference(bytes) {
        source.transform = georef.transform;
        source.crs = georef.crs;
    }
    Ok(source)
}

// Grayscale is replicated into three channels; alpha and extra bands dropped.
fn to_rgb(img: DynamicImage) -> RgbImage {
    match img {
        DynamicImage::ImageRgb8(rgb) => rgb,
        other => other.to_rgb8(),
    }
}

fn is_tiff(bytes: &[u8]) -> bool {
    [b"II*\0", b"MM\0*", b"II+\0", b"MM\0+"]
        .iter()
        .any(|magic| bytes.starts_with(*magic))
}

/// Read the first image directory at its native sample type.
///
/// 8-bit rasters keep their values. Wider or float rasters are stretched
/// per band from the band's finite min/max onto 0..=255; NaN maps to 0.
/// Single-band and gray+alpha images are replicated into three channels,
/// anything with three or more bands keeps the first three.
fn decode_tiff(bytes: &[u8]) -> Result<RgbImage, ImageSourceError> {
    let mut decoder = Decoder::new(Cursor::new(bytes))?;
    let (width, height) = decoder.dimensions()?;
    let pixels = width as usize * height as usize;

    let (samples, stretch): (Vec<f64>, bool) = match decoder.read_image()? {
        DecodingResult::U8(v) => (v.into_iter().map(f64::from).collect(), false),
        DecodingResult::U16(v) => (v.into_iter().map(f64::from).collect(), true),
        DecodingResult::U32(v) => (v.into_iter().map(f64::from).collect(), true),
        DecodingResult::U64(v) => (v.into_iter().map(|x| x as f64).collect(), true),
        DecodingResult::I8(v) => (v.into_iter().map(f64::from).collect(), true),
        DecodingResult::I16(v) => (v.into_iter().map(f64::from).collect(), true),
        DecodingResult::I32(v) => (v.into_iter().map(f64::from).collect(), true),
        DecodingResult::I64(v) => (v.into_iter().map(|x| x as f64).collect(), true),
        DecodingResult::F32(v) => (v.into_iter().map(f64::from).collect(), true),
        DecodingResult::F64(v) => (v, true),
    };

    if pixels == 0 || samples.len() < pixels || samples.len() % pixels != 0 {
        return Err(ImageSourceError::Layout(format!(
            "{} samples for a {width}x{height} raster",
            samples.len()
        )));
    }
    let bands = samples.len() / pixels;
    let picked: [usize; 3] = if bands < 3 { [0, 0, 0] } else { [0, 1, 2] };

    let mut channels: Vec<Vec<u8>> = Vec::with_capacity(3);
    for band in picked {
        let values = samples.iter().skip(band).step_by(bands);
        channels.push(if stretch {
            stretch_band(values)
        } else {
            values.map(|v| *v as u8).collect()
        });
    }
    tracing::debug!(width, height, bands, stretch, "decoded TIFF raster");

    let rgb: Vec<u8> = (0..pixels)
        .flat_map(|i| [channels[0][i], channels[1][i], channels[2][i]])
        .collect();
    RgbImage::from_raw(width, height, rgb)
        .ok_or_else(|| ImageSourceError::Layout(format!("cannot build a {width}x{height} RGB image")))
}

fn stretch_band<'a>(values: impl Iterator<Item = &'a f64> + Clone) -> Vec<u8> {
    let (lo, hi) = values
        .clone()
        .filter(|v| v.is_finite())
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(*v), hi.max(*v)));
    let range = hi - lo;
    values
        .map(|v| {
            if !v.is_finite() || range <= 0.0 {
                0
            } else {
                ((v - lo) / range * 255.0).round().clamp(0.0, 255.0) as u8
            }
        })
        .collect()
}

#[derive(Debug, Default, PartialEq)]
pub struct Georeference {
    pub transform: Option<Affine>,
    pub crs: Option<String>,
}

/// GeoTIFF tags of the first image directory, if `bytes` is a TIFF.
pub fn read_georeference(bytes: &[u8]) -> Option<Georeference> {
    let mut decoder = Decoder::new(Cursor::new(bytes)).ok()?;

    let transform = match f64_tag(&mut decoder, MODEL_TRANSFORMATION) {
        Some(m) if m.len() >= 8 => Some(Affine::new(m[0], m[1], m[3], m[4], m[5], m[7])),
        _ => {
            let scale = f64_tag(&mut decoder, MODEL_PIXEL_SCALE);
            let tiepoint = f64_tag(&mut decoder, MODEL_TIEPOINT);
            match (scale, tiepoint) {
                (Some(s), Some(t)) if s.len() >= 2 && t.len() >= 6 => Some(Affine::new(
                    s[0],
                    0.0,
                    t[3] - t[0] * s[0],
                    0.0,
                    -s[1],
                    t[4] + t[1] * s[1],
                )),
                _ => None,
            }
        }
    };

    let crs = decoder
        .find_tag(Tag::from_u16_exhaustive(GEO_KEY_DIRECTORY))
        .ok()
        .flatten()
        .and_then(|v| v.into_u32_vec().ok())
        .and_then(|keys| epsg_from_geokeys(&keys));

    if transform.is_none() && crs.is_none() {
        return None;
    }
    Some(Georeference { transform, crs })
}

fn f64_tag<R: std::io::Read + std::io::Seek>(decoder: &mut Decoder<R>, code: u16) -> Option<Vec<f64>> {
    decoder
        .find_tag(Tag::from_u16_exhaustive(code))
        .ok()
        .flatten()
        .and_then(|v| v.into_f64_vec().ok())
}

/// Projected CRS wins over geographic. Only inline (location 0) EPSG codes
/// are understood.
pub fn epsg_from_geokeys(keys: &[u32]) -> Option<String> {
    if keys.len() < 4 {
        return None;
    }
    let count = keys[3] as usize;
    let entries: Vec<&[u32]> = keys[4..]
        .chunks_exact(4)
        .take(count)
        .collect();

    [PROJECTED_CS_TYPE_KEY, GEOGRAPHIC_TYPE_KEY]
        .iter()
        .find_map(|wanted| {
            entries.iter().find_map(|entry| match entry {
                [key, 0, _, code] if key == wanted && *code != 0 && *code != USER_DEFINED => {
                    Some(format!("EPSG:{code}"))
                }
                _ => None,
            })
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageOutputFormat, Luma, Rgb};

    fn png_bytes(img: DynamicImage) -> Vec<u8> {
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, ImageOutputFormat::Png).unwrap();
        out.into_inner()
    }

    #[test]
    fn plain_png_has_no_georeference() {
        let bytes = png_bytes(DynamicImage::ImageRgb8(RgbImage::from_pixel(4, 3, Rgb([9, 8, 7]))));
        let source = decode_raster(&bytes).unwrap();
        assert_eq!(source.shape(), (3, 4));
        assert!(source.transform.is_none());
        assert!(source.crs.is_none());
        assert!(read_georeference(&bytes).is_none());
    }

    #[test]
    fn grayscale_is_replicated() {
        let gray = image::GrayImage::from_pixel(2, 2, Luma([120]));
        let source = decode_plain(&png_bytes(DynamicImage::ImageLuma8(gray))).unwrap();
        assert_eq!(source.rgb.get_pixel(1, 1), &Rgb([120, 120, 120]));
    }

    #[test]
    fn garbage_fails_to_decode() {
        let err = decode_plain(b"definitely not an image").unwrap_err();
        assert!(matches!(err, ImageSourceError::Decode(_)));
        assert!(!err.is_client_error());
    }

    #[test]
    fn projected_key_wins() {
        let keys = [
            1, 1, 0, 3, //
            1024, 0, 1, 1, //
            2048, 0, 1, 4326, //
            3072, 0, 1, 32633,
        ];
        assert_eq!(epsg_from_geokeys(&keys).as_deref(), Some("EPSG:32633"));
    }

    #[test]
    fn geographic_key_and_user_defined() {
        let keys = [1, 1, 0, 1, 2048, 0, 1, 4326];
        assert_eq!(epsg_from_geokeys(&keys).as_deref(), Some("EPSG:4326"));
        let keys = [1, 1, 0, 1, 3072, 0, 1, USER_DEFINED];
        assert_eq!(epsg_from_geokeys(&keys), None);
        assert_eq!(epsg_from_geokeys(&[1, 1]), None);
    }

    fn tiff_bytes<C: tiff::encoder::colortype::ColorType>(width: u32, height: u32, data: &[C::Inner]) -> Vec<u8>
    where
        [C::Inner]: tiff::encoder::TiffValue,
    {
        let mut out = Cursor::new(Vec::new());
        tiff::encoder::TiffEncoder::new(&mut out)
            .unwrap()
            .write_image::<C>(width, height, data)
            .unwrap();
        out.into_inner()
    }

    #[test]
    fn float_tiff_is_stretched_to_bytes() {
        use tiff::encoder::colortype::Gray32Float;
        let bytes = tiff_bytes::<Gray32Float>(2, 2, &[-1.0, 0.0, 1.0, f32::NAN]);
        let source = decode_raster(&bytes).unwrap();
        assert_eq!(source.shape(), (2, 2));
        assert_eq!(source.rgb.get_pixel(0, 0), &Rgb([0, 0, 0]));
        assert_eq!(source.rgb.get_pixel(1, 0), &Rgb([128, 128, 128]));
        assert_eq!(source.rgb.get_pixel(0, 1), &Rgb([255, 255, 255]));
        assert_eq!(source.rgb.get_pixel(1, 1), &Rgb([0, 0, 0]));
    }

    #[test]
    fn twelve_bit_tiff_uses_its_own_range() {
        use tiff::encoder::colortype::Gray16;
        let bytes = tiff_bytes::<Gray16>(4, 1, &[0, 1000, 2000, 4095]);
        let source = decode_plain(&bytes).unwrap();
        let reds: Vec<u8> = source.rgb.pixels().map(|p| p[0]).collect();
        assert_eq!(reds, vec![0, 62, 125, 255]);
    }

    #[test]
    fn multiband_tiff_keeps_first_three_bands_per_band() {
        use tiff::encoder::colortype::RGBA16;
        // band 0 spans 0..100, band 1 is flat, band 2 spans 10..20, band 3 dropped
        let bytes = tiff_bytes::<RGBA16>(2, 1, &[0, 7, 10, 9, 100, 7, 20, 9]);
        let source = decode_plain(&bytes).unwrap();
        assert_eq!(source.rgb.get_pixel(0, 0), &Rgb([0, 0, 0]));
        assert_eq!(source.rgb.get_pixel(1, 0), &Rgb([255, 0, 255]));
    }

    #[test]
    fn eight_bit_tiff_keeps_values() {
        use tiff::encoder::colortype::RGB8;
        let bytes = tiff_bytes::<RGB8>(1, 1, &[12, 34, 56]);
        let source = decode_plain(&bytes).unwrap();
        assert_eq!(source.rgb.get_pixel(0, 0), &Rgb([12, 34, 56]));
    }

    #[rocket::async_test]
    async fn missing_local_file_is_invalid_path() {
        let client = reqwest::Client::new();
        let err = load("/nonexistent/image.tif", &client).await.unwrap_err();
        assert!(matches!(err, ImageSourceError::InvalidPath(_)));
        assert!(err.is_client_error());
    }

    #[rocket::async_test]
    async fn local_png_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tile.png");
        RgbImage::from_pixel(5, 7, Rgb([1, 2, 3])).save(&path).unwrap();
        let client = reqwest::Client::new();
        let source = load(path.to_str().unwrap(), &client).await.unwrap();
        assert_eq!(source.shape(), (7, 5));
    }
}
