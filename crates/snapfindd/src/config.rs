use anyhow::Context;
use serde::Deserialize;
use snapfind_core::Device;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Daemon configuration.
///
/// Resolved from `SNAPFIND_*` environment variables, then an optional TOML
/// file named by `SNAPFIND_CONFIG`, then built-in defaults.
#[derive(Debug, Clone)]
pub struct Config {
    /// Listen address (default: 127.0.0.1:8501).
    pub bind: String,
    /// Directory holding the exported ONNX caption model (default: ./Models).
    pub model_dir: PathBuf,
    /// Directory holding captioned images (default: uploaded_images).
    pub store_dir: PathBuf,
    /// Device pre-selected in the UI and loaded at startup.
    pub device: Device,
    /// Upper bound on generated caption tokens.
    pub max_new_tokens: usize,
    /// ONNX Runtime intra-op threads per session.
    pub intra_threads: usize,
    /// Largest accepted upload request body, in bytes.
    pub max_upload_bytes: usize,
}

/// Same keys as the environment, read from the TOML file.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub bind: Option<String>,
    pub model_dir: Option<PathBuf>,
    pub store_dir: Option<PathBuf>,
    pub device: Option<Device>,
    pub max_new_tokens: Option<usize>,
    pub intra_threads: Option<usize>,
    pub max_upload_mb: Option<usize>,
}

impl FileConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))
    }
}

impl Config {
    /// Load configuration from the process environment.
    pub fn from_env() -> anyhow::Result<Self> {
        let file = match std::env::var_os("SNAPFIND_CONFIG") {
            Some(path) => FileConfig::load(Path::new(&path))?,
            None => FileConfig::default(),
        };
        Ok(Self::resolve(file, |key| std::env::var(key).ok()))
    }

    /// Merge `file` with variables from `lookup`; variables win.
    pub fn resolve(file: FileConfig, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let max_upload_mb = env_or(&lookup, "SNAPFIND_MAX_UPLOAD_MB", file.max_upload_mb.unwrap_or(64));

        Self {
            bind: lookup("SNAPFIND_BIND")
                .or(file.bind)
                .unwrap_or_else(|| "127.0.0.1:8501".to_string()),
            model_dir: lookup("SNAPFIND_MODEL_DIR")
                .map(PathBuf::from)
                .or(file.model_dir)
                .unwrap_or_else(snapfind_core::default_model_dir),
            store_dir: lookup("SNAPFIND_STORE_DIR")
                .map(PathBuf::from)
                .or(file.store_dir)
                .unwrap_or_else(|| PathBuf::from("uploaded_images")),
            device: env_or(&lookup, "SNAPFIND_DEVICE", file.device.unwrap_or(Device::Cuda)),
            max_new_tokens: env_or(
                &lookup,
                "SNAPFIND_MAX_NEW_TOKENS",
                file.max_new_tokens.unwrap_or(snapfind_core::DEFAULT_MAX_NEW_TOKENS),
            ),
            intra_threads: env_or(&lookup, "SNAPFIND_INTRA_THREADS", file.intra_threads.unwrap_or(2)),
            max_upload_bytes: max_upload_mb.saturating_mul(1024 * 1024),
        }
    }
}

/// Parse `key` from `lookup`, keeping `default` when unset or unparseable.
fn env_or<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    match lookup(key) {
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, "ignoring unparseable setting");
            default
        }),
        None => default,
    }
}
