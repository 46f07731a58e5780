use super::unix_timestamp;
use crate::{
    history::{HistoryError, PredictionRecord},
    server::SharedState,
    uploads::{StoredUpload, UploadError, UploadStore},
};
use axum::{
    extract::{multipart::MultipartError, Multipart, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;
use serde_json::json;
use std::{path::PathBuf, sync::Arc};
use thiserror::Error;
use tokio::task::JoinError;
use tracing::instrument;
use tumor_inference::{ImageInfo, ModelService, Prediction, PredictionError, PredictionResult};
use uuid::Uuid;

const FILE_FIELD: &str = "file";

#[derive(Error, Debug)]
pub enum PredictImageError {
    #[error("Invalid multipart payload: {0}")]
    Multipart(#[from] MultipartError),
    #[error("Missing multipart field `file`")]
    MissingFile,
    #[error(transparent)]
    Upload(#[from] UploadError),
    #[error("Error processing prediction: {0}")]
    Prediction(#[from] PredictionError),
    #[error("Prediction task failed: {0}")]
    Task(#[from] JoinError),
    #[error("Error saving prediction: {0}")]
    History(#[from] HistoryError),
}

impl PredictImageError {
    fn status(&self) -> StatusCode {
        match self {
            PredictImageError::Multipart(e) => e.status(),
            PredictImageError::MissingFile => StatusCode::BAD_REQUEST,
            PredictImageError::Upload(UploadError::UnsupportedExtension { .. }) => {
                StatusCode::BAD_REQUEST
            }
            PredictImageError::Upload(UploadError::TooLarge { .. }) => {
                StatusCode::PAYLOAD_TOO_LARGE
            }
            PredictImageError::Prediction(PredictionError::Preprocess(_)) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            PredictImageError::Prediction(PredictionError::NotReady) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            PredictImageError::Upload(UploadError::Io { .. })
            | PredictImageError::Prediction(_)
            | PredictImageError::Task(_)
            | PredictImageError::History(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for PredictImageError {
    fn into_response(self) -> Response {
        (self.status(), Json(json!({ "detail": self.to_string() }))).into_response()
    }
}

#[derive(Debug, Serialize)]
pub struct PredictResponse {
    pub success: bool,
    pub prediction: Prediction,
    pub image_info: ImageInfo,
    pub timestamp: f64,
    pub prediction_id: String,
    pub image_url: String,
}

#[instrument(skip(state, multipart))]
pub async fn predict_image(
    State(state): State<SharedState>,
    mut multipart: Multipart,
) -> Result<Json<PredictResponse>, PredictImageError> {
    let upload = receive_upload(&state.uploads, &mut multipart).await?;

    let result = match run_prediction(state.model_service.clone(), upload.path.clone()).await {
        Ok(result) => result,
        Err(e) => {
            tracing::error!("Error processing prediction: {}", e);
            state.uploads.remove(&upload).await;
            return Err(e);
        }
    };

    let prediction_id = Uuid::new_v4().to_string();
    let timestamp = unix_timestamp();
    let record = PredictionRecord {
        id: prediction_id.clone(),
        filename: upload.file_name.clone(),
        class: result.prediction.class,
        confidence: result.prediction.confidence,
        probability: result.prediction.probability,
        processing_time_seconds: result.prediction.processing_time_seconds,
        created_at: timestamp,
    };
    if let Err(e) = state.history.record(record).await {
        tracing::error!("Error saving prediction: {}", e);
        state.uploads.remove(&upload).await;
        return Err(e.into());
    }

    tracing::info!(
        prediction_id = %prediction_id,
        class = %result.prediction.class,
        confidence = result.prediction.confidence,
        "Prediction completed"
    );

    Ok(Json(PredictResponse {
        success: true,
        prediction: result.prediction,
        image_info: result.image_info,
        timestamp,
        prediction_id,
        image_url: upload.url(),
    }))
}

/// Stores the `file` field of the form. The extension is checked before the body is read.
async fn receive_upload(
    uploads: &UploadStore,
    multipart: &mut Multipart,
) -> Result<StoredUpload, PredictImageError> {
    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some(FILE_FIELD) {
            continue;
        }

        let extension = uploads.validate_extension(field.file_name())?;
        let bytes = field.bytes().await?;
        uploads.validate_size(bytes.len())?;

        return Ok(uploads.save(&extension, &bytes).await?);
    }

    Err(PredictImageError::MissingFile)
}

async fn run_prediction(
    model_service: Arc<dyn ModelService>,
    image_path: PathBuf,
) -> Result<PredictionResult, PredictImageError> {
    let result = tokio::task::spawn_blocking(move || model_service.predict(&image_path)).await?;
    Ok(result?)
}

#[cfg(test)]
mod tests {
    use crate::routes::test_support::{
        json_body, multipart_body, test_app, MockBehavior, TestApp, BOUNDARY,
    };
    use axum::{
        body::Body,
        http::{header, Request, StatusCode},
        response::Response,
    };
    use tower::ServiceExt;

    const MAX_FILE_SIZE: usize = 1024;

    async fn post(app: &TestApp, body: Vec<u8>) -> Response {
        let request = Request::post("/api/predict")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap();

        app.router.clone().oneshot(request).await.unwrap()
    }

    #[tokio::test]
    async fn test_predict_stores_upload_and_returns_prediction() {
        let app = test_app(MockBehavior::Tumor, MAX_FILE_SIZE).await;

        let response = post(&app, multipart_body("file", "scan.JPG", b"jpeg bytes")).await;

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["prediction"]["class"], "tumor");
        assert_eq!(body["prediction"]["confidence"], 0.875);
        assert_eq!(
            body["image_info"]["processed_size"],
            serde_json::json!([224, 224])
        );
        assert_eq!(body["image_info"]["file_size"], 10);
        assert!(!body["prediction_id"].as_str().unwrap().is_empty());

        let image_url = body["image_url"].as_str().unwrap();
        let file_name = image_url.strip_prefix("/uploads/").unwrap();
        assert!(file_name.ends_with(".jpg"));
        assert!(app.upload_dir.join(file_name).exists());
    }

    #[tokio::test]
    async fn test_prediction_is_recorded_under_its_id() {
        let app = test_app(MockBehavior::Tumor, MAX_FILE_SIZE).await;

        let response = post(&app, multipart_body("file", "scan.png", b"png bytes")).await;
        let body = json_body(response).await;
        let prediction_id = body["prediction_id"].as_str().unwrap();

        let record = app.history.get(prediction_id.to_string()).await.unwrap().unwrap();
        assert_eq!(record.class.as_str(), "tumor");
        assert_eq!(record.confidence, 0.875);
        assert_eq!(format!("/uploads/{}", record.filename), body["image_url"]);
        assert_eq!(record.created_at, body["timestamp"].as_f64().unwrap());
    }

    #[tokio::test]
    async fn test_history_failure_removes_upload() {
        let app = test_app(MockBehavior::Tumor, MAX_FILE_SIZE).await;
        std::fs::remove_dir_all(&app.history_dir).unwrap();

        let response = post(&app, multipart_body("file", "scan.png", b"png bytes")).await;

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = json_body(response).await;
        assert!(body["detail"]
            .as_str()
            .unwrap()
            .starts_with("Error saving prediction"));
        assert_eq!(app.stored_files(), 0);
    }

    #[tokio::test]
    async fn test_stored_upload_is_served() {
        let app = test_app(MockBehavior::Tumor, MAX_FILE_SIZE).await;
        let response = post(&app, multipart_body("file", "scan.png", b"png bytes")).await;
        let body = json_body(response).await;

        let request = Request::get(body["image_url"].as_str().unwrap())
            .body(Body::empty())
            .unwrap();
        let response = app.router.clone().oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&bytes[..], b"png bytes");
    }

    #[tokio::test]
    async fn test_rejects_unsupported_extension() {
        let app = test_app(MockBehavior::Tumor, MAX_FILE_SIZE).await;

        let response = post(&app, multipart_body("file", "scan.gif", b"gif bytes")).await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert!(body["detail"].as_str().unwrap().contains("png, jpg, jpeg"));
        assert_eq!(app.stored_files(), 0);
    }

    #[tokio::test]
    async fn test_rejects_oversized_upload() {
        let app = test_app(MockBehavior::Tumor, MAX_FILE_SIZE).await;

        let oversized = [7u8; MAX_FILE_SIZE + 1];
        let response = post(&app, multipart_body("file", "scan.png", &oversized)).await;

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(app.stored_files(), 0);
    }

    #[tokio::test]
    async fn test_rejects_missing_file_field() {
        let app = test_app(MockBehavior::Tumor, MAX_FILE_SIZE).await;

        let response = post(&app, multipart_body("image", "scan.png", b"png bytes")).await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(app.stored_files(), 0);
    }

    #[tokio::test]
    async fn test_unreadable_image_removes_upload() {
        let app = test_app(MockBehavior::UnreadableImage, MAX_FILE_SIZE).await;

        let response = post(&app, multipart_body("file", "scan.png", b"not a png")).await;
        assert_eq!(app.history.list(0, 10).await.unwrap().total, 0);

        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let body = json_body(response).await;
        assert!(body["detail"]
            .as_str()
            .unwrap()
            .starts_with("Error processing prediction"));
        assert_eq!(app.stored_files(), 0);
    }

    #[tokio::test]
    async fn test_model_not_ready() {
        let app = test_app(MockBehavior::NotReady, MAX_FILE_SIZE).await;

        let response = post(&app, multipart_body("file", "scan.png", b"png bytes")).await;

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(app.stored_files(), 0);
    }
}
