pub mod classifier;
pub mod config;
pub mod device;
pub mod inference_service;
pub mod model;
pub mod model_service;
pub mod prediction;
pub mod preprocess;
pub mod pretrained;
pub mod weights;

pub use config::ModelConfig;
pub use device::ComputeDevice;
pub use inference_service::{InferenceService, InitError};
pub use model_service::{ModelService, PredictionError};
pub use prediction::{ImageInfo, Prediction, PredictionOutcome, PredictionResult, TumorClass};
pub use preprocess::PreprocessError;
