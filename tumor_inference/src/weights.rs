//! Reading, recognizing and writing classifier weights.
//!
//! A weights file is either safetensors or a PyTorch `.pth` archive. Its tensors are parsed
//! into one of three layouts, tried in order: a training checkpoint nesting the weights under
//! `model_state_dict`, a plain state dict namespaced under `backbone.`, or an unrecognized
//! mapping.

use crate::{
    classifier::{BrainTumorClassifier, BACKBONE_PREFIX, HEAD_PREFIX},
    model::{Model, WeightsOrigin},
};
use ::safetensors::SafeTensors;
use candle_core::{pickle, safetensors, DType, Device, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};
use std::{
    collections::HashMap,
    io::Cursor,
    path::{Path, PathBuf},
    sync::MutexGuard,
};
use thiserror::Error;
use zip::ZipArchive;

pub const CHECKPOINT_KEY: &str = "model_state_dict";

/// Safetensors metadata entry written with bootstrapped weights.
const ORIGIN_METADATA_KEY: &str = "origin";
const BOOTSTRAP_ORIGIN: &str = "bootstrap";

pub type TensorMap = HashMap<String, Tensor>;

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("Failed to read weights file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Weights file is neither safetensors nor a PyTorch archive: {0}")]
    Decode(#[source] candle_core::Error),
    #[error("Unrecognized weights layout ({} tensors, no checkpoint entry and not namespaced under the backbone)", .keys.len())]
    Unrecognized { keys: Vec<String> },
    #[error("Weights do not fit the classifier: {0}")]
    Incompatible(#[source] candle_core::Error),
}

#[derive(Debug)]
pub enum WeightsFormat {
    Checkpoint(TensorMap),
    StateDict(TensorMap),
    Unrecognized { keys: Vec<String> },
}

/// Extracts the `model_state_dict.` sub-tree of a flattened training checkpoint.
pub fn parse_checkpoint(tensors: &TensorMap) -> Option<TensorMap> {
    let prefix = format!("{CHECKPOINT_KEY}.");
    let state_dict: TensorMap = tensors
        .iter()
        .filter_map(|(name, tensor)| {
            name.strip_prefix(&prefix)
                .map(|name| (name.to_string(), tensor.clone()))
        })
        .collect();

    (!state_dict.is_empty()).then_some(state_dict)
}

/// Accepts the mapping when every key, ignoring `_`-prefixed metadata, is under `backbone.`.
pub fn parse_state_dict(tensors: &TensorMap) -> Option<TensorMap> {
    let prefix = format!("{BACKBONE_PREFIX}.");
    let state_dict: TensorMap = tensors
        .iter()
        .filter(|(name, _)| !name.starts_with('_'))
        .map(|(name, tensor)| (name.clone(), tensor.clone()))
        .collect();

    let namespaced = !state_dict.is_empty() && state_dict.keys().all(|k| k.starts_with(&prefix));
    namespaced.then_some(state_dict)
}

pub fn classify_tensors(tensors: TensorMap) -> WeightsFormat {
    if let Some(state_dict) = parse_checkpoint(&tensors) {
        return WeightsFormat::Checkpoint(state_dict);
    }
    if let Some(state_dict) = parse_state_dict(&tensors) {
        return WeightsFormat::StateDict(state_dict);
    }

    let mut keys: Vec<String> = tensors.into_keys().collect();
    keys.sort();
    WeightsFormat::Unrecognized { keys }
}

pub fn read_weights(path: &Path) -> Result<WeightsFormat, LoadError> {
    let bytes = read_file(path)?;
    parse_weights(path, &bytes)
}

fn parse_weights(path: &Path, bytes: &[u8]) -> Result<WeightsFormat, LoadError> {
    match safetensors::load_buffer(bytes, &Device::Cpu) {
        Ok(tensors) => return Ok(classify_tensors(tensors)),
        Err(e) => tracing::debug!("{:?} is not a safetensors file: {}", path, e),
    }

    // Checkpoints saved with `torch.save` keep the weights as a nested dict entry.
    match pickle::read_all_with_key(path, Some(CHECKPOINT_KEY)) {
        Ok(tensors) if !tensors.is_empty() => {
            return Ok(WeightsFormat::Checkpoint(tensors.into_iter().collect()))
        }
        Ok(_) => {}
        Err(e) => tracing::debug!("{:?} has no {} entry: {}", path, CHECKPOINT_KEY, e),
    }

    match pickle::read_all(path) {
        Ok(tensors) => Ok(classify_tensors(tensors.into_iter().collect())),
        // A well-formed archive whose pickle is not a flat tensor dict, e.g. a whole module.
        Err(e) if is_pytorch_archive(bytes) => {
            tracing::debug!("{:?} holds no readable tensor dict: {}", path, e);
            Ok(WeightsFormat::Unrecognized { keys: Vec::new() })
        }
        Err(e) => Err(LoadError::Decode(e)),
    }
}

fn is_pytorch_archive(bytes: &[u8]) -> bool {
    ZipArchive::new(Cursor::new(bytes))
        .map(|archive| archive.file_names().any(|name| name.ends_with("data.pkl")))
        .unwrap_or(false)
}

/// True for safetensors files written by [`bootstrap_model`].
pub fn is_bootstrap_file(bytes: &[u8]) -> bool {
    SafeTensors::read_metadata(bytes)
        .ok()
        .and_then(|(_, metadata)| {
            metadata
                .metadata()
                .as_ref()?
                .get(ORIGIN_METADATA_KEY)
                .cloned()
        })
        .is_some_and(|origin| origin == BOOTSTRAP_ORIGIN)
}

/// Loads a classifier from `path`. Unrecognized layouts are reported as
/// [`LoadError::Unrecognized`] so the caller can keep the file aside.
pub fn load_model(path: &Path, device: &Device) -> Result<Model, LoadError> {
    let bytes = read_file(path)?;
    let (origin, state_dict) = match parse_weights(path, &bytes)? {
        WeightsFormat::Checkpoint(state_dict) => {
            tracing::info!("Loading model from training checkpoint format");
            (WeightsOrigin::Checkpoint, state_dict)
        }
        WeightsFormat::StateDict(state_dict) if is_bootstrap_file(&bytes) => {
            tracing::warn!("Loading previously bootstrapped weights, the head is untrained");
            (WeightsOrigin::Bootstrapped, state_dict)
        }
        WeightsFormat::StateDict(state_dict) => {
            tracing::info!("Loading model from direct state dict format");
            (WeightsOrigin::StateDict, state_dict)
        }
        WeightsFormat::Unrecognized { keys } => return Err(LoadError::Unrecognized { keys }),
    };

    let vb = VarBuilder::from_tensors(state_dict, DType::F32, device);
    let network = BrainTumorClassifier::new(vb).map_err(LoadError::Incompatible)?;

    Ok(Model::new(
        network,
        device.clone(),
        origin,
        Some(path.to_path_buf()),
    ))
}

/// Builds an untrained classifier: pretrained backbone when `backbone_weights` can be used,
/// random head. The weights are written to `persist_to` when given, tagged as bootstrapped in
/// the safetensors metadata; a failed write is logged and the model is still returned.
pub fn bootstrap_model(
    device: &Device,
    backbone_weights: Option<&Path>,
    persist_to: Option<&Path>,
) -> candle_core::Result<Model> {
    let varmap = VarMap::new();
    BrainTumorClassifier::new(VarBuilder::from_varmap(&varmap, DType::F32, device))?;

    match backbone_weights {
        Some(path) => match seed_backbone(&varmap, path) {
            Ok(count) => tracing::info!("Seeded {} backbone tensors from {:?}", count, path),
            Err(e) => tracing::warn!(
                "Could not use pretrained backbone {:?}, keeping a random backbone: {}",
                path,
                e
            ),
        },
        None => tracing::warn!("No pretrained backbone available, backbone is randomly initialized"),
    }

    // Plain tensors: inference on them records no gradient graph.
    let tensors: TensorMap = lock_vars(&varmap)?
        .iter()
        .map(|(name, var)| (name.clone(), var.as_tensor().detach()))
        .collect();

    let weights_path = persist_to.and_then(|path| match save_bootstrap_weights(&tensors, path) {
        Ok(()) => {
            tracing::info!("Created and saved new model to {:?}", path);
            Some(path.to_path_buf())
        }
        Err(e) => {
            tracing::error!("Failed to save new model to {:?}: {}", path, e);
            None
        }
    });

    let network =
        BrainTumorClassifier::new(VarBuilder::from_tensors(tensors, DType::F32, device))?;

    Ok(Model::new(
        network,
        device.clone(),
        WeightsOrigin::Bootstrapped,
        weights_path,
    ))
}

/// Writes `tensors` as safetensors, creating the parent directory if needed.
pub fn save_weights(tensors: &TensorMap, path: &Path) -> candle_core::Result<()> {
    create_parent_dir(path)?;
    safetensors::save(tensors, path)
}

fn save_bootstrap_weights(tensors: &TensorMap, path: &Path) -> candle_core::Result<()> {
    create_parent_dir(path)?;
    let metadata = HashMap::from([(
        ORIGIN_METADATA_KEY.to_string(),
        BOOTSTRAP_ORIGIN.to_string(),
    )]);
    ::safetensors::serialize_to_file(tensors, Some(metadata), path)?;
    Ok(())
}

fn create_parent_dir(path: &Path) -> std::io::Result<()> {
    match path.parent() {
        Some(parent) => std::fs::create_dir_all(parent),
        None => Ok(()),
    }
}

/// Copies pretrained backbone tensors into `varmap`. Accepts torchvision names
/// (`conv1.weight`) as well as already namespaced ones (`backbone.conv1.weight`). Nothing is
/// written unless every matching tensor has the expected shape.
fn seed_backbone(varmap: &VarMap, path: &Path) -> Result<usize, LoadError> {
    let pretrained = read_tensor_map(path)?;
    let backbone = format!("{BACKBONE_PREFIX}.");
    let head = format!("{BACKBONE_PREFIX}.{HEAD_PREFIX}.");

    let vars = lock_vars(varmap).map_err(LoadError::Incompatible)?;
    let mut updates: Vec<(&Var, Tensor)> = Vec::new();
    for (name, var) in vars.iter() {
        let Some(stripped) = name.strip_prefix(&backbone) else {
            continue;
        };
        if name.starts_with(&head) {
            continue;
        }
        let Some(tensor) = pretrained.get(stripped).or_else(|| pretrained.get(name)) else {
            continue;
        };
        if tensor.dims() != var.dims() {
            return Err(LoadError::Incompatible(candle_core::Error::Msg(format!(
                "shape mismatch for {}: expected {:?}, got {:?}",
                name,
                var.dims(),
                tensor.dims()
            ))));
        }
        let tensor = tensor
            .to_dtype(DType::F32)
            .and_then(|t| t.to_device(var.device()))
            .map_err(LoadError::Incompatible)?;
        updates.push((var, tensor));
    }

    if updates.is_empty() {
        let mut keys: Vec<String> = pretrained.into_keys().collect();
        keys.sort();
        return Err(LoadError::Unrecognized { keys });
    }

    for (var, tensor) in &updates {
        var.set(tensor).map_err(LoadError::Incompatible)?;
    }

    Ok(updates.len())
}

fn read_tensor_map(path: &Path) -> Result<TensorMap, LoadError> {
    let bytes = read_file(path)?;
    if let Ok(tensors) = safetensors::load_buffer(&bytes, &Device::Cpu) {
        return Ok(tensors);
    }

    pickle::read_all(path)
        .map(|tensors| tensors.into_iter().collect())
        .map_err(LoadError::Decode)
}

fn read_file(path: &Path) -> Result<Vec<u8>, LoadError> {
    std::fs::read(path).map_err(|source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn lock_vars(varmap: &VarMap) -> candle_core::Result<MutexGuard<'_, HashMap<String, Var>>> {
    varmap
        .data()
        .lock()
        .map_err(|_| candle_core::Error::Msg("variable map lock poisoned".to_string()))
}
