use crate::device::ComputeDevice;
use serde::Deserialize;
use std::path::{Path, PathBuf};

const FALLBACK_SUFFIX: &str = ".new";

/// Download location of the pretrained backbone inside `model_dir`.
pub const BACKBONE_FILE: &str = "resnet18_backbone.safetensors";

#[derive(Debug, Deserialize, Clone)]
pub struct ModelConfig {
    pub model_dir: PathBuf,
    #[serde(default = "default_weights_file")]
    pub weights_file: String,
    #[serde(default)]
    pub device: ComputeDevice,
    /// Pretrained ResNet-18 weights (torchvision key layout) used to seed the backbone
    /// when a fresh model has to be bootstrapped.
    #[serde(default)]
    pub backbone_weights: Option<PathBuf>,
    /// Safetensors file fetched once into [`ModelConfig::backbone_path`] when no local backbone
    /// weights exist.
    #[serde(default)]
    pub backbone_url: Option<String>,
}

fn default_weights_file() -> String {
    "brain_tumor_model.safetensors".to_string()
}

impl ModelConfig {
    pub fn new(model_dir: impl Into<PathBuf>) -> Self {
        Self {
            model_dir: model_dir.into(),
            weights_file: default_weights_file(),
            device: ComputeDevice::default(),
            backbone_weights: None,
            backbone_url: None,
        }
    }

    pub fn get_path(&self) -> PathBuf {
        self.model_dir.join(&self.weights_file)
    }

    pub fn get_fallback_path(&self) -> PathBuf {
        fallback_path(&self.get_path())
    }

    pub fn backbone_path(&self) -> PathBuf {
        self.backbone_weights
            .clone()
            .unwrap_or_else(|| self.model_dir.join(BACKBONE_FILE))
    }
}

/// Sibling of `path` used when the original weights file has to be preserved.
pub fn fallback_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(FALLBACK_SUFFIX);
    PathBuf::from(name)
}
