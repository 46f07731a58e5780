use crate::classifier::BrainTumorClassifier;
use candle_core::{Device, ModuleT, Tensor};
use serde::Serialize;
use std::{
    fmt,
    path::{Path, PathBuf},
};

/// Where the weights of a [`Model`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightsOrigin {
    /// `model_state_dict` entry of a training checkpoint.
    Checkpoint,
    /// Plain `backbone.`-namespaced state dict.
    StateDict,
    /// Freshly initialized head, never trained for this task. Weights persisted by a bootstrap
    /// keep this origin when they are loaded again.
    Bootstrapped,
}

impl WeightsOrigin {
    pub fn is_trained(&self) -> bool {
        !matches!(self, WeightsOrigin::Bootstrapped)
    }
}

/// Classifier ready for inference. Immutable once built.
pub struct Model {
    network: BrainTumorClassifier,
    device: Device,
    origin: WeightsOrigin,
    weights_path: Option<PathBuf>,
}

impl Model {
    pub(crate) fn new(
        network: BrainTumorClassifier,
        device: Device,
        origin: WeightsOrigin,
        weights_path: Option<PathBuf>,
    ) -> Self {
        Self {
            network,
            device,
            origin,
            weights_path,
        }
    }

    /// Runs the network in evaluation mode and returns the logit of the first image.
    pub fn logit(&self, input: &Tensor) -> candle_core::Result<f32> {
        let logits = self
            .network
            .forward_t(&input.to_device(&self.device)?, false)?
            .flatten_all()?
            .to_vec1::<f32>()?;

        logits
            .first()
            .copied()
            .ok_or_else(|| candle_core::Error::Msg("model returned no logits".to_string()))
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn origin(&self) -> WeightsOrigin {
        self.origin
    }

    /// File holding the weights currently in memory, `None` when they were never persisted.
    pub fn weights_path(&self) -> Option<&Path> {
        self.weights_path.as_deref()
    }
}

impl fmt::Debug for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Model")
            .field("device", &self.device)
            .field("origin", &self.origin)
            .field("weights_path", &self.weights_path)
            .finish_non_exhaustive()
    }
}
