mod health;
mod history;
mod predict_image;

use crate::server::SharedState;
use axum::{
    routing::{get, post},
    Router,
};

pub use health::{healthcheck, index};
pub use history::{list_predictions, submit_feedback, HistoryRouteError};
pub use predict_image::{predict_image, PredictImageError, PredictResponse};

pub fn api_routes() -> Router<SharedState> {
    Router::new()
        .route("/", get(index))
        .route("/api/health", get(healthcheck))
        .route("/api/predict", post(predict_image))
        .route("/api/predictions", get(list_predictions))
        .route("/api/feedback", post(submit_feedback))
}

/// Seconds since the Unix epoch.
fn unix_timestamp() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::{
        config::{HistoryConfig, ServerConfig, UploadConfig},
        history::PredictionStore,
        server::{build_router, SharedState},
        uploads::UploadStore,
    };
    use axum::{body::Body, http::Response, Router};
    use std::{
        path::{Path, PathBuf},
        sync::Arc,
        time::Duration,
    };
    use tumor_inference::{
        preprocess::PreprocessError, ImageInfo, ModelService, Prediction, PredictionError,
        PredictionResult,
    };
    use uuid::Uuid;

    pub const BOUNDARY: &str = "tumor-test-boundary";

    #[derive(Debug, Clone, Copy)]
    pub enum MockBehavior {
        Tumor,
        UnreadableImage,
        NotReady,
    }

    pub struct MockModelService {
        pub behavior: MockBehavior,
    }

    impl ModelService for MockModelService {
        fn is_ready(&self) -> bool {
            !matches!(self.behavior, MockBehavior::NotReady)
        }

        fn predict(&self, image_path: &Path) -> Result<PredictionResult, PredictionError> {
            match self.behavior {
                MockBehavior::Tumor => Ok(PredictionResult {
                    prediction: Prediction::from_probability(0.875, Duration::from_millis(12)),
                    image_info: ImageInfo {
                        original_size: (512, 512),
                        processed_size: (224, 224),
                        file_size_bytes: std::fs::metadata(image_path)
                            .map_err(PredictionError::Metadata)?
                            .len(),
                    },
                }),
                MockBehavior::UnreadableImage => Err(PreprocessError::Open {
                    path: image_path.to_path_buf(),
                    source: std::io::Error::new(std::io::ErrorKind::InvalidData, "not an image"),
                }
                .into()),
                MockBehavior::NotReady => Err(PredictionError::NotReady),
            }
        }
    }

    pub struct TestApp {
        pub router: Router,
        pub upload_dir: PathBuf,
        pub history: Arc<PredictionStore>,
        pub history_dir: PathBuf,
    }

    impl TestApp {
        pub fn stored_files(&self) -> usize {
            std::fs::read_dir(&self.upload_dir).unwrap().count()
        }
    }

    impl Drop for TestApp {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.upload_dir);
            let _ = std::fs::remove_dir_all(&self.history_dir);
        }
    }

    pub async fn test_app(behavior: MockBehavior, max_file_size: usize) -> TestApp {
        let test_id = Uuid::new_v4();
        let upload_dir = std::env::temp_dir().join(format!("tumor-api-test-{test_id}"));
        let mut upload_config = UploadConfig::new(&upload_dir);
        upload_config.max_file_size = max_file_size;

        let history_dir = std::env::temp_dir().join(format!("tumor-api-history-{test_id}"));
        let history = Arc::new(
            PredictionStore::initialize(&HistoryConfig {
                database_path: history_dir.join("predictions.sqlite3"),
            })
            .unwrap(),
        );

        let state = SharedState {
            model_service: Arc::new(MockModelService { behavior }),
            uploads: Arc::new(UploadStore::create(upload_config).await.unwrap()),
            history: history.clone(),
        };
        let server_config = ServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
            cors_origins: vec![],
        };

        TestApp {
            router: build_router(state, &server_config),
            upload_dir,
            history,
            history_dir,
        }
    }

    pub fn multipart_body(field: &str, file_name: &str, content: &[u8]) -> Vec<u8> {
        let mut body = format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{field}\"; filename=\"{file_name}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
        )
        .into_bytes();
        body.extend_from_slice(content);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    /// Multipart body made of plain text fields.
    pub fn multipart_fields(fields: &[(&str, &str)]) -> Vec<u8> {
        let mut body = String::new();
        for (name, value) in fields {
            body.push_str(&format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
            ));
        }
        body.push_str(&format!("--{BOUNDARY}--\r\n"));
        body.into_bytes()
    }

    pub async fn json_body(response: Response<Body>) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }
}
