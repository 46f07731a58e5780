use crate::{
    config::ModelConfig,
    model::Model,
    model_service::{ModelService, PredictionError},
    prediction::{sigmoid, ImageInfo, Prediction, PredictionResult},
    preprocess::preprocess_image,
    pretrained,
    weights::{self, LoadError},
};
use candle_core::{Device, Tensor};
use std::{
    path::Path,
    sync::{Mutex, OnceLock},
    time::Instant,
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum InitError {
    #[error("Failed to build a fallback model: {0}")]
    Bootstrap(#[from] candle_core::Error),
}

/// Owns the classifier and runs predictions with it.
///
/// The service starts uninitialized; [`InferenceService::initialize`] acquires a model exactly
/// once and every later call returns that same model.
#[derive(Debug)]
pub struct InferenceService {
    config: ModelConfig,
    model: OnceLock<Model>,
    init_lock: Mutex<()>,
}

impl InferenceService {
    pub fn new(config: ModelConfig) -> Self {
        Self {
            config,
            model: OnceLock::new(),
            init_lock: Mutex::new(()),
        }
    }

    pub fn initialize(&self) -> Result<&Model, InitError> {
        if let Some(model) = self.model.get() {
            return Ok(model);
        }

        let _guard = self
            .init_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(model) = self.model.get() {
            return Ok(model);
        }

        let model = acquire_model(&self.config)?;
        tracing::info!(
            "Model ready: origin={:?}, trained={}, device={:?}",
            model.origin(),
            model.origin().is_trained(),
            model.device()
        );

        Ok(self.model.get_or_init(|| model))
    }

    pub fn model(&self) -> Option<&Model> {
        self.model.get()
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    fn run_prediction(
        &self,
        model: &Model,
        image_path: &Path,
    ) -> Result<PredictionResult, PredictionError> {
        let start_time = Instant::now();

        let preprocessed = preprocess_image(image_path)?;
        let shape = preprocessed.tensor.dim();
        let (data, _) = preprocessed.tensor.into_raw_vec_and_offset();
        let input = Tensor::from_vec(data, shape, model.device())?;

        let probability = sigmoid(model.logit(&input)?);
        if probability.is_nan() {
            return Err(PredictionError::NonFiniteOutput);
        }
        let prediction = Prediction::from_probability(probability, start_time.elapsed());

        let file_size_bytes = std::fs::metadata(image_path)
            .map_err(PredictionError::Metadata)?
            .len();

        Ok(PredictionResult {
            prediction,
            image_info: ImageInfo {
                original_size: preprocessed.original_size,
                processed_size: preprocessed.processed_size,
                file_size_bytes,
            },
        })
    }
}

impl ModelService for InferenceService {
    fn is_ready(&self) -> bool {
        self.model.get().is_some()
    }

    fn predict(&self, image_path: &Path) -> Result<PredictionResult, PredictionError> {
        let Some(model) = self.model.get() else {
            tracing::error!("Prediction requested before the model was initialized");
            return Err(PredictionError::NotReady);
        };

        let result = self.run_prediction(model, image_path);
        match &result {
            Ok(result) => tracing::debug!(
                "Predicted {} (confidence={:.3}, probability={:.3}) in {:.3}s",
                result.prediction.class,
                result.prediction.confidence,
                result.prediction.probability,
                result.prediction.processing_time_seconds
            ),
            Err(e) => tracing::error!("Error during prediction: {}", e),
        }

        result
    }
}

/// Loads the configured weights, or bootstraps a fresh model when they are missing or unusable.
/// Load failures never escape: only a failure to build the fallback model itself is returned.
fn acquire_model(config: &ModelConfig) -> Result<Model, InitError> {
    let device = config.device.resolve();
    let path = config.get_path();

    tracing::info!("Loading model from {:?}", path);
    if !path.exists() {
        tracing::warn!("Model file not found at {:?}. Creating a new model.", path);
        return bootstrap(config, &device, Some(&path));
    }

    match weights::load_model(&path, &device) {
        Ok(model) => {
            tracing::info!("Model loaded successfully");
            Ok(model)
        }
        Err(LoadError::Unrecognized { keys }) => {
            let fallback = config.get_fallback_path();
            tracing::warn!(
                "Could not recognize the {} tensors in {:?}. Creating a new model at {:?}.",
                keys.len(),
                path,
                fallback
            );
            bootstrap(config, &device, Some(&fallback))
        }
        Err(e) => {
            tracing::error!("Error loading model: {}", e);
            tracing::info!("Creating a new model as fallback");
            bootstrap(config, &device, None)
        }
    }
}

fn bootstrap(
    config: &ModelConfig,
    device: &Device,
    persist_to: Option<&Path>,
) -> Result<Model, InitError> {
    let backbone = pretrained::resolve_backbone(config);
    let backbone = backbone.as_deref();

    match weights::bootstrap_model(device, backbone, persist_to) {
        Ok(model) => Ok(model),
        Err(e) if !device.is_cpu() => {
            tracing::warn!("Failed to build model on {:?}, retrying on cpu: {}", device, e);
            Ok(weights::bootstrap_model(&Device::Cpu, backbone, persist_to)?)
        }
        Err(e) => Err(e.into()),
    }
}
