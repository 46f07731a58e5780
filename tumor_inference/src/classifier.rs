//! ResNet-18 backbone with a binary classification head.
//!
//! Tensor names follow the PyTorch layout of the training code: the backbone lives
//! under `backbone.` and its final layer is replaced by a sequential head stored under
//! `backbone.fc.`, so weights exported from PyTorch load without renaming.

use candle_core::{ModuleT, Result, Tensor};
use candle_nn::{Dropout, Func, Linear, VarBuilder};
use candle_transformers::models::resnet;

pub const BACKBONE_PREFIX: &str = "backbone";
pub const HEAD_PREFIX: &str = "fc";

/// Width of the pooled feature vector produced by ResNet-18.
pub const NUM_FEATURES: usize = 512;
const HIDDEN_FEATURES: usize = 512;
const DROPOUT: f32 = 0.3;

// Positions of the linear layers inside `Sequential(Dropout, Linear, ReLU, Dropout, Linear)`.
const HIDDEN_INDEX: usize = 1;
const OUTPUT_INDEX: usize = 4;

struct ClassifierHead {
    dropout: Dropout,
    hidden: Linear,
    output: Linear,
}

impl ClassifierHead {
    fn new(vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            dropout: Dropout::new(DROPOUT),
            hidden: candle_nn::linear(NUM_FEATURES, HIDDEN_FEATURES, vb.pp(HIDDEN_INDEX))?,
            output: candle_nn::linear(HIDDEN_FEATURES, 1, vb.pp(OUTPUT_INDEX))?,
        })
    }
}

impl ModuleT for ClassifierHead {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        xs.apply_t(&self.dropout, train)?
            .apply(&self.hidden)?
            .relu()?
            .apply_t(&self.dropout, train)?
            .apply(&self.output)
    }
}

pub struct BrainTumorClassifier {
    backbone: Func<'static>,
    head: ClassifierHead,
}

impl BrainTumorClassifier {
    /// Builds the network from `vb`, requesting every tensor it needs. Fails on missing
    /// tensors or shape mismatches.
    pub fn new(vb: VarBuilder<'static>) -> Result<Self> {
        let vb = vb.pp(BACKBONE_PREFIX);
        let backbone = resnet::resnet18_no_final_layer(vb.clone())?;
        let head = ClassifierHead::new(vb.pp(HEAD_PREFIX))?;

        Ok(Self { backbone, head })
    }
}

impl ModuleT for BrainTumorClassifier {
    /// Maps a `(batch, 3, 224, 224)` input to `(batch, 1)` logits.
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        xs.apply(&self.backbone)?.apply_t(&self.head, train)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn random_classifier() -> (VarMap, BrainTumorClassifier) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let classifier = BrainTumorClassifier::new(vb).unwrap();
        (varmap, classifier)
    }

    #[test]
    fn test_tensor_names_follow_pytorch_layout() {
        let (varmap, _) = random_classifier();
        let data = varmap.data().lock().unwrap();

        for name in [
            "backbone.conv1.weight",
            "backbone.bn1.running_mean",
            "backbone.layer1.0.conv1.weight",
            "backbone.layer2.0.downsample.0.weight",
            "backbone.layer4.1.bn2.running_var",
            "backbone.fc.1.weight",
            "backbone.fc.1.bias",
            "backbone.fc.4.weight",
            "backbone.fc.4.bias",
        ] {
            assert!(data.contains_key(name), "missing {name}");
        }
        assert!(data.keys().all(|name| name.starts_with("backbone.")));
        assert_eq!(data["backbone.fc.4.weight"].dims(), &[1, 512]);
    }

    #[test]
    fn test_forward_produces_one_logit_per_image() {
        let (_, classifier) = random_classifier();
        let input = Tensor::zeros((2, 3, 64, 64), DType::F32, &Device::Cpu).unwrap();

        let logits = classifier.forward_t(&input, false).unwrap();

        assert_eq!(logits.dims(), &[2, 1]);
    }
}
