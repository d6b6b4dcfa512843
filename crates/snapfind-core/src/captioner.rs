//! Vision encoder-decoder captioner via ONNX Runtime.
//!
//! Drives an optimum export of a `VisionEncoderDecoderModel` (ViT encoder,
//! GPT-2 decoder): the encoder runs once per image, then the decoder is run
//! greedily over the growing token sequence until EOS or the token budget.

use crate::preprocess::ImageProcessor;
use crate::types::{Caption, Device};
use image::DynamicImage;
use ndarray::{Array2, Array3};
use ort::session::Session;
use ort::value::TensorRef;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokenizers::Tokenizer;

// --- Named constants ---
const ENCODER_FILE: &str = "encoder_model.onnx";
const DECODER_FILE: &str = "decoder_model.onnx";
const TOKENIZER_FILE: &str = "tokenizer.json";
const MODEL_CONFIG_FILE: &str = "config.json";
const PREPROCESSOR_CONFIG_FILE: &str = "preprocessor_config.json";
/// GPT-2 `<|endoftext|>`, used as both BOS and EOS by vit-gpt2 exports.
const GPT2_EOS_TOKEN: i64 = 50256;
pub const DEFAULT_MAX_NEW_TOKENS: usize = 50;

#[derive(Error, Debug)]
pub enum CaptionError {
    #[error("model file not found: {0} (export the captioning model to ONNX and place it in the model directory)")]
    ModelNotFound(String),
    #[error("device {device} unavailable: {reason}")]
    DeviceUnavailable { device: Device, reason: String },
    #[error("tokenizer: {0}")]
    Tokenizer(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Anything that turns an image into a caption.
///
/// The ONNX [`CaptionModel`] is the production implementation; callers hold
/// it behind this trait so the upload flow can be exercised without weights.
pub trait Captioner: Send {
    fn caption(&mut self, image: &DynamicImage) -> Result<Caption, CaptionError>;
}

/// Settings for loading a [`CaptionModel`].
#[derive(Debug, Clone)]
pub struct ModelOptions {
    pub model_dir: PathBuf,
    pub device: Device,
    pub max_new_tokens: usize,
    pub intra_threads: usize,
}

impl ModelOptions {
    pub fn new(model_dir: impl Into<PathBuf>, device: Device) -> Self {
        Self {
            model_dir: model_dir.into(),
            device,
            max_new_tokens: DEFAULT_MAX_NEW_TOKENS,
            intra_threads: 2,
        }
    }
}

/// Token ids read from the exported `config.json`.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
struct GenerationIds {
    #[serde(default = "default_eos")]
    decoder_start_token_id: i64,
    #[serde(default = "default_eos")]
    eos_token_id: i64,
}

fn default_eos() -> i64 {
    GPT2_EOS_TOKEN
}

impl Default for GenerationIds {
    fn default() -> Self {
        Self {
            decoder_start_token_id: GPT2_EOS_TOKEN,
            eos_token_id: GPT2_EOS_TOKEN,
        }
    }
}

impl GenerationIds {
    fn from_file(path: &Path) -> Self {
        std::fs::read_to_string(path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default()
    }
}

/// Loaded encoder/decoder sessions plus tokenizer.
pub struct CaptionModel {
    encoder: Session,
    decoder: Session,
    tokenizer: Tokenizer,
    processor: ImageProcessor,
    ids: GenerationIds,
    max_new_tokens: usize,
    device: Device,
}

impl CaptionModel {
    /// Load the encoder, decoder, and tokenizer from `opts.model_dir`.
    pub fn load(opts: &ModelOptions) -> Result<Self, CaptionError> {
        let encoder_path = locate(&opts.model_dir, ENCODER_FILE)?;
        let decoder_path = locate(&opts.model_dir, DECODER_FILE)?;
        let tokenizer_path = locate(&opts.model_dir, TOKENIZER_FILE)?;

        let encoder = build_session(&encoder_path, opts)?;
        let decoder = build_session(&decoder_path, opts)?;

        let tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| CaptionError::Tokenizer(e.to_string()))?;

        let processor = ImageProcessor::from_file(&opts.model_dir.join(PREPROCESSOR_CONFIG_FILE));
        let ids = GenerationIds::from_file(&opts.model_dir.join(MODEL_CONFIG_FILE));

        tracing::info!(
            dir = %opts.model_dir.display(),
            device = %opts.device,
            encoder_inputs = ?encoder.inputs().iter().map(|i| i.name()).collect::<Vec<_>>(),
            decoder_inputs = ?decoder.inputs().iter().map(|i| i.name()).collect::<Vec<_>>(),
            input_size = processor.width,
            bos = ids.decoder_start_token_id,
            eos = ids.eos_token_id,
            "loaded caption model"
        );

        Ok(Self {
            encoder,
            decoder,
            tokenizer,
            processor,
            ids,
            max_new_tokens: opts.max_new_tokens,
            device: opts.device,
        })
    }

    pub fn device(&self) -> Device {
        self.device
    }

    /// Run the vision encoder, returning `[1, patches, hidden]` states.
    fn encode(&mut self, image: &DynamicImage) -> Result<Array3<f32>, CaptionError> {
        let pixels = self.processor.preprocess(image);
        let outputs = self
            .encoder
            .run(ort::inputs![TensorRef::from_array_view(pixels.view())?])?;

        let (shape, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| CaptionError::InferenceFailed(format!("encoder output: {e}")))?;

        if shape.len() != 3 {
            return Err(CaptionError::InferenceFailed(format!(
                "expected rank-3 encoder output, got shape {shape:?}"
            )));
        }
        let dims = (shape[0] as usize, shape[1] as usize, shape[2] as usize);
        Array3::from_shape_vec(dims, data.to_vec())
            .map_err(|e| CaptionError::InferenceFailed(format!("encoder output: {e}")))
    }

    /// Greedy decode from BOS until EOS or `max_new_tokens`.
    fn generate(&mut self, hidden: &Array3<f32>) -> Result<Vec<u32>, CaptionError> {
        let mut tokens: Vec<i64> = vec![self.ids.decoder_start_token_id];
        let mut generated = Vec::new();

        for step in 0..self.max_new_tokens {
            let input_ids = Array2::from_shape_vec((1, tokens.len()), tokens.clone())
                .map_err(|e| CaptionError::InferenceFailed(format!("input_ids: {e}")))?;

            let outputs = self.decoder.run(ort::inputs![
                "input_ids" => TensorRef::from_array_view(input_ids.view())?,
                "encoder_hidden_states" => TensorRef::from_array_view(hidden.view())?
            ])?;

            let (shape, logits) = outputs[0]
                .try_extract_tensor::<f32>()
                .map_err(|e| CaptionError::InferenceFailed(format!("logits step {step}: {e}")))?;
            let vocab = shape.last().copied().unwrap_or(0) as usize;
            let next = last_position_argmax(logits, vocab).ok_or_else(|| {
                CaptionError::InferenceFailed(format!("empty logits at step {step}"))
            })?;

            if next == self.ids.eos_token_id {
                tracing::debug!(step, "caption: eos");
                break;
            }
            tokens.push(next);
            generated.push(next as u32);
        }

        Ok(generated)
    }
}

impl Captioner for CaptionModel {
    fn caption(&mut self, image: &DynamicImage) -> Result<Caption, CaptionError> {
        let hidden = self.encode(image)?;
        let token_ids = self.generate(&hidden)?;
        let text = self
            .tokenizer
            .decode(&token_ids, true)
            .map_err(|e| CaptionError::Tokenizer(e.to_string()))?;

        let caption = Caption::new(&text);
        tracing::debug!(tokens = token_ids.len(), caption = %caption, "caption generated");
        Ok(caption)
    }
}

/// Find `file` directly in `dir` or under `dir/onnx/` (optimum's layout).
fn locate(dir: &Path, file: &str) -> Result<PathBuf, CaptionError> {
    [dir.join(file), dir.join("onnx").join(file)]
        .into_iter()
        .find(|p| p.exists())
        .ok_or_else(|| CaptionError::ModelNotFound(dir.join(file).to_string_lossy().into_owned()))
}

fn build_session(path: &Path, opts: &ModelOptions) -> Result<Session, CaptionError> {
    let builder = Session::builder()?.with_intra_threads(opts.intra_threads)?;

    let builder = match opts.device {
        Device::Cpu => builder,
        // No silent CPU fallback: a CUDA request that cannot be honoured fails the load.
        Device::Cuda => builder
            .with_execution_providers([ort::ep::CUDA::default().build().error_on_failure()])
            .map_err(|e| CaptionError::DeviceUnavailable {
                device: Device::Cuda,
                reason: e.to_string(),
            })?,
    };

    Ok(builder.commit_from_file(path)?)
}

/// Argmax over the final `vocab` logits (the last sequence position).
fn last_position_argmax(logits: &[f32], vocab: usize) -> Option<i64> {
    if vocab == 0 || logits.len() < vocab {
        return None;
    }
    logits[logits.len() - vocab..]
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(i, _)| i as i64)
}
