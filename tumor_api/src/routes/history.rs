use super::unix_timestamp;
use crate::{
    history::{HistoryError, NewFeedback, PredictionRecord},
    server::SharedState,
    uploads::upload_url,
};
use axum::{
    extract::{Multipart, Query, Request, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    Form, RequestExt,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt::Display;
use thiserror::Error;
use tumor_inference::TumorClass;

const DEFAULT_LIMIT: u32 = 10;
const MAX_LIMIT: u32 = 100;

#[derive(Error, Debug)]
pub enum HistoryRouteError {
    #[error("limit must be between 1 and {MAX_LIMIT}")]
    InvalidLimit,
    #[error("Invalid feedback form: {0}")]
    InvalidForm(String),
    #[error("Expected `Content-Type: application/x-www-form-urlencoded` or `multipart/form-data`")]
    UnsupportedMediaType,
    #[error("Prediction with ID {0} not found")]
    UnknownPrediction(String),
    #[error("Error accessing prediction history: {0}")]
    History(#[from] HistoryError),
}

impl HistoryRouteError {
    fn status(&self) -> StatusCode {
        match self {
            HistoryRouteError::InvalidLimit | HistoryRouteError::InvalidForm(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            HistoryRouteError::UnsupportedMediaType => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            HistoryRouteError::UnknownPrediction(_) => StatusCode::NOT_FOUND,
            HistoryRouteError::History(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for HistoryRouteError {
    fn into_response(self) -> Response {
        if let HistoryRouteError::History(e) = &self {
            tracing::error!("Error accessing prediction history: {}", e);
        }
        (self.status(), Json(json!({ "detail": self.to_string() }))).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    #[serde(default)]
    skip: u32,
    #[serde(default = "default_limit")]
    limit: u32,
}

fn default_limit() -> u32 {
    DEFAULT_LIMIT
}

#[derive(Debug, Serialize)]
pub struct PredictionSummary {
    pub id: String,
    pub filename: String,
    pub prediction: TumorClass,
    pub confidence: f32,
    pub probability: f32,
    pub processing_time: f64,
    pub timestamp: f64,
    pub image_url: String,
}

impl From<PredictionRecord> for PredictionSummary {
    fn from(record: PredictionRecord) -> Self {
        Self {
            image_url: upload_url(&record.filename),
            id: record.id,
            filename: record.filename,
            prediction: record.class,
            confidence: record.confidence,
            probability: record.probability,
            processing_time: record.processing_time_seconds,
            timestamp: record.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PredictionListResponse {
    pub predictions: Vec<PredictionSummary>,
    pub total: u64,
    pub skip: u32,
    pub limit: u32,
}

pub async fn list_predictions(
    State(state): State<SharedState>,
    Query(page): Query<PageQuery>,
) -> Result<Json<PredictionListResponse>, HistoryRouteError> {
    if !(1..=MAX_LIMIT).contains(&page.limit) {
        return Err(HistoryRouteError::InvalidLimit);
    }

    let history = state.history.list(page.skip, page.limit).await?;

    Ok(Json(PredictionListResponse {
        predictions: history.records.into_iter().map(Into::into).collect(),
        total: history.total,
        skip: page.skip,
        limit: page.limit,
    }))
}

#[derive(Debug, Deserialize)]
struct FeedbackForm {
    prediction_id: String,
    is_correct: String,
    #[serde(default)]
    comment: Option<String>,
}

impl FeedbackForm {
    fn into_feedback(self) -> Result<NewFeedback, HistoryRouteError> {
        let is_correct = parse_bool(&self.is_correct).ok_or_else(|| {
            HistoryRouteError::InvalidForm(format!(
                "is_correct must be a boolean, got {:?}",
                self.is_correct
            ))
        })?;

        Ok(NewFeedback {
            prediction_id: self.prediction_id.trim().to_string(),
            is_correct,
            comment: self
                .comment
                .map(|comment| comment.trim().to_string())
                .filter(|comment| !comment.is_empty()),
            created_at: unix_timestamp(),
        })
    }
}

#[derive(Debug, Serialize)]
pub struct FeedbackResponse {
    pub success: bool,
    pub message: String,
    pub feedback_id: i64,
}

/// Accepts the feedback form either url-encoded or as `multipart/form-data`.
pub async fn submit_feedback(
    State(state): State<SharedState>,
    req: Request,
) -> Result<Json<FeedbackResponse>, HistoryRouteError> {
    let feedback = parse_feedback(req).await?;
    let prediction_id = feedback.prediction_id.clone();

    let Some(feedback_id) = state.history.add_feedback(feedback).await? else {
        return Err(HistoryRouteError::UnknownPrediction(prediction_id));
    };
    tracing::info!(prediction_id = %prediction_id, feedback_id, "Feedback recorded");

    Ok(Json(FeedbackResponse {
        success: true,
        message: "Feedback submitted successfully".to_string(),
        feedback_id,
    }))
}

async fn parse_feedback(req: Request) -> Result<NewFeedback, HistoryRouteError> {
    let content_type = req
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_ascii_lowercase();

    let form = if content_type.starts_with("application/x-www-form-urlencoded") {
        let Form(form) = req
            .extract::<Form<FeedbackForm>, _>()
            .await
            .map_err(invalid_form)?;
        form
    } else if content_type.starts_with("multipart/form-data") {
        let multipart = req
            .extract::<Multipart, _>()
            .await
            .map_err(invalid_form)?;
        read_multipart_form(multipart).await?
    } else {
        return Err(HistoryRouteError::UnsupportedMediaType);
    };

    form.into_feedback()
}

async fn read_multipart_form(mut multipart: Multipart) -> Result<FeedbackForm, HistoryRouteError> {
    let mut prediction_id = None;
    let mut is_correct = None;
    let mut comment = None;

    while let Some(field) = multipart.next_field().await.map_err(invalid_form)? {
        let name = field.name().unwrap_or_default().to_string();
        let text = field.text().await.map_err(invalid_form)?;
        match name.as_str() {
            "prediction_id" => prediction_id = Some(text),
            "is_correct" => is_correct = Some(text),
            "comment" => comment = Some(text),
            _ => {}
        }
    }

    Ok(FeedbackForm {
        prediction_id: prediction_id.ok_or_else(|| missing_field("prediction_id"))?,
        is_correct: is_correct.ok_or_else(|| missing_field("is_correct"))?,
        comment,
    })
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn invalid_form(e: impl Display) -> HistoryRouteError {
    HistoryRouteError::InvalidForm(e.to_string())
}

fn missing_field(name: &str) -> HistoryRouteError {
    HistoryRouteError::InvalidForm(format!("missing field `{name}`"))
}
