//! ViT image preprocessing: RGB resize, rescale, and per-channel normalization.
//!
//! Parameters come from the exported `preprocessor_config.json` when present,
//! otherwise the ViT defaults (224×224, mean = std = 0.5) are used.

use image::imageops::FilterType;
use image::DynamicImage;
use ndarray::Array4;
use serde::Deserialize;
use std::path::Path;

const VIT_INPUT_SIZE: u32 = 224;
const VIT_MEAN: [f32; 3] = [0.5, 0.5, 0.5];
const VIT_STD: [f32; 3] = [0.5, 0.5, 0.5];
const RESCALE_FACTOR: f32 = 1.0 / 255.0;

/// `size` is either a bare edge length or an explicit `{height, width}` map.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum SizeSpec {
    Square(u32),
    Rect { height: u32, width: u32 },
}

#[derive(Debug, Clone, Deserialize)]
struct RawProcessorConfig {
    size: Option<SizeSpec>,
    image_mean: Option<[f32; 3]>,
    image_std: Option<[f32; 3]>,
    rescale_factor: Option<f32>,
}

/// Resolved preprocessing parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageProcessor {
    pub width: u32,
    pub height: u32,
    pub mean: [f32; 3],
    pub std: [f32; 3],
    pub rescale_factor: f32,
}

impl Default for ImageProcessor {
    fn default() -> Self {
        Self {
            width: VIT_INPUT_SIZE,
            height: VIT_INPUT_SIZE,
            mean: VIT_MEAN,
            std: VIT_STD,
            rescale_factor: RESCALE_FACTOR,
        }
    }
}

impl ImageProcessor {
    /// Read `preprocessor_config.json`, falling back to defaults for any
    /// missing field. A missing or unparseable file yields the defaults.
    pub fn from_file(path: &Path) -> Self {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(_) => {
                tracing::debug!(path = %path.display(), "no preprocessor config, using ViT defaults");
                return Self::default();
            }
        };
        match serde_json::from_str::<RawProcessorConfig>(&raw) {
            Ok(cfg) => Self::from_raw(cfg),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "bad preprocessor config, using ViT defaults");
                Self::default()
            }
        }
    }

    fn from_raw(cfg: RawProcessorConfig) -> Self {
        let defaults = Self::default();
        let (width, height) = match cfg.size {
            Some(SizeSpec::Square(edge)) => (edge, edge),
            Some(SizeSpec::Rect { height, width }) => (width, height),
            None => (defaults.width, defaults.height),
        };
        Self {
            width,
            height,
            mean: cfg.image_mean.unwrap_or(defaults.mean),
            std: cfg.image_std.unwrap_or(defaults.std),
            rescale_factor: cfg.rescale_factor.unwrap_or(defaults.rescale_factor),
        }
    }

    /// Convert an image of any colour mode into a `[1, 3, H, W]` tensor.
    pub fn preprocess(&self, image: &DynamicImage) -> Array4<f32> {
        let rgb = image
            .resize_exact(self.width, self.height, FilterType::Triangle)
            .to_rgb8();

        let (w, h) = (self.width as usize, self.height as usize);
        let mut tensor = Array4::<f32>::zeros((1, 3, h, w));
        for (x, y, pixel) in rgb.enumerate_pixels() {
            for c in 0..3 {
                let scaled = pixel[c] as f32 * self.rescale_factor;
                tensor[[0, c, y as usize, x as usize]] = (scaled - self.mean[c]) / self.std[c];
            }
        }
        tensor
    }
}
