use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Inference device for the caption model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    Cuda,
    Cpu,
}

impl Device {
    /// All selectable devices, in the order the UI offers them.
    pub const ALL: [Device; 2] = [Device::Cuda, Device::Cpu];

    pub fn as_str(&self) -> &'static str {
        match self {
            Device::Cuda => "cuda",
            Device::Cpu => "cpu",
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("unknown device `{0}` (expected `cuda` or `cpu`)")]
pub struct ParseDeviceError(pub String);

impl FromStr for Device {
    type Err = ParseDeviceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cuda" | "gpu" => Ok(Device::Cuda),
            "cpu" => Ok(Device::Cpu),
            other => Err(ParseDeviceError(other.to_string())),
        }
    }
}

/// A short generated description of an image.
///
/// Whitespace is collapsed to single spaces and trimmed on construction, so
/// two captions that differ only in spacing compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caption(String);

impl Caption {
    pub fn new(raw: &str) -> Self {
        Self(raw.split_whitespace().collect::<Vec<_>>().join(" "))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for Caption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Caption {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_caption_collapses_whitespace() {
        let c = Caption::new("  a dog   sitting\non a\tcouch ");
        assert_eq!(c.as_str(), "a dog sitting on a couch");
    }

    #[test]
    fn test_caption_blank_is_empty() {
        assert!(Caption::new(" \n\t ").is_empty());
    }

    #[test]
    fn test_device_parse() {
        assert_eq!("cuda".parse::<Device>(), Ok(Device::Cuda));
        assert_eq!(" CPU ".parse::<Device>(), Ok(Device::Cpu));
        assert_eq!(
            "tpu".parse::<Device>(),
            Err(ParseDeviceError("tpu".to_string()))
        );
    }

    #[test]
    fn test_device_display_roundtrips() {
        for device in Device::ALL {
            assert_eq!(device.to_string().parse::<Device>(), Ok(device));
        }
    }
}
