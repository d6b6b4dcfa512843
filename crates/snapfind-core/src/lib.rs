//! snapfind-core: Image captioning engine.
//!
//! Runs a pretrained vision encoder-decoder (ViT + GPT-2) exported to ONNX,
//! producing a short caption per image.

pub mod captioner;
pub mod preprocess;
pub mod types;

pub use captioner::{CaptionError, CaptionModel, Captioner, ModelOptions, DEFAULT_MAX_NEW_TOKENS};
pub use types::{Caption, Device, ParseDeviceError};

/// Default model directory, relative to the working directory.
pub fn default_model_dir() -> std::path::PathBuf {
    std::path::PathBuf::from("./Models")
}
