use serde::{Deserialize, Serialize};
use std::{fmt, time::Duration};

/// Probability at or above which an image is classified as [`TumorClass::Tumor`].
pub const DECISION_THRESHOLD: f32 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TumorClass {
    Tumor,
    NoTumor,
}

impl TumorClass {
    pub fn from_probability(probability: f32) -> Self {
        if probability >= DECISION_THRESHOLD {
            Self::Tumor
        } else {
            Self::NoTumor
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TumorClass::Tumor => "tumor",
            TumorClass::NoTumor => "no_tumor",
        }
    }

    /// Inverse of [`TumorClass::as_str`].
    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "tumor" => Some(Self::Tumor),
            "no_tumor" => Some(Self::NoTumor),
            _ => None,
        }
    }
}

impl fmt::Display for TumorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn sigmoid(logit: f32) -> f32 {
    1. / (1. + (-logit).exp())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub class: TumorClass,
    /// Distance from the decision boundary, always in `[0.5, 1.0]`.
    pub confidence: f32,
    pub probability: f32,
    #[serde(rename = "processing_time")]
    pub processing_time_seconds: f64,
}

impl Prediction {
    pub fn from_probability(probability: f32, elapsed: Duration) -> Self {
        let class = TumorClass::from_probability(probability);
        let confidence = match class {
            TumorClass::Tumor => probability,
            TumorClass::NoTumor => 1. - probability,
        };

        Self {
            class,
            confidence,
            probability,
            processing_time_seconds: elapsed.as_secs_f64(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageInfo {
    pub original_size: (u32, u32),
    pub processed_size: (u32, u32),
    #[serde(rename = "file_size")]
    pub file_size_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionResult {
    pub prediction: Prediction,
    pub image_info: ImageInfo,
}

/// Tagged form of a prediction handed to callers that branch on `success`
/// instead of matching on a `Result`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prediction: Option<Prediction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_info: Option<ImageInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<E: fmt::Display> From<Result<PredictionResult, E>> for PredictionOutcome {
    fn from(result: Result<PredictionResult, E>) -> Self {
        match result {
            Ok(result) => Self {
                success: true,
                prediction: Some(result.prediction),
                image_info: Some(result.image_info),
                error: None,
            },
            Err(e) => Self {
                success: false,
                prediction: None,
                image_info: None,
                error: Some(e.to_string()),
            },
        }
    }
}
