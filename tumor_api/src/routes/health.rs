use super::unix_timestamp;
use crate::server::SharedState;
use axum::{extract::State, response::IntoResponse, response::Json};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize)]
pub struct Status {
    status: String,
    model_loaded: bool,
    timestamp: f64,
}

#[derive(Serialize, Deserialize)]
pub struct ServiceInfo {
    message: String,
    health_check: String,
}

pub async fn index() -> impl IntoResponse {
    Json(ServiceInfo {
        message: "Brain Tumor Detection API".into(),
        health_check: "/api/health".into(),
    })
}

pub async fn healthcheck(State(state): State<SharedState>) -> impl IntoResponse {
    Json(Status {
        status: "ok".into(),
        model_loaded: state.model_service.is_ready(),
        timestamp: unix_timestamp(),
    })
}
