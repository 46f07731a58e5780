use crate::{
    prediction::{PredictionOutcome, PredictionResult},
    preprocess::PreprocessError,
};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PredictionError {
    #[error("Model is not loaded")]
    NotReady,
    #[error(transparent)]
    Preprocess(#[from] PreprocessError),
    #[error("Inference failed: {0}")]
    Inference(#[from] candle_core::Error),
    #[error("Model produced a non-finite output")]
    NonFiniteOutput,
    #[error("Failed to read image metadata: {0}")]
    Metadata(#[source] std::io::Error),
}

/// Blocking classifier contract. Implementations are shared read-only across threads; async
/// callers must run [`ModelService::predict`] on a blocking pool.
pub trait ModelService: Send + Sync + 'static {
    fn is_ready(&self) -> bool;

    fn predict(&self, image_path: &Path) -> Result<PredictionResult, PredictionError>;

    fn predict_outcome(&self, image_path: &Path) -> PredictionOutcome {
        self.predict(image_path).into()
    }
}
