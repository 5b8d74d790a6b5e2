use serde::{Serialize, Deserialize};

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ProblemDetail {
    #[serde(rename = "type")]
    pub problem_type: String,
    pub title: String,
    pub status: u16,
    pub detail: String,
    pub code: String,
    pub request_id: String,
}

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Invalid image: {0}")]
    InvalidImage(String),

    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("Octave {exponent} resolves to an empty image ({height}x{width})")]
    DegenerateOctave { exponent: i32, height: usize, width: usize },

    #[error("Non-finite gradient")]
    NonFiniteGradient,

    #[error("Tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    #[error("Inference error: {0}")]
    Inference(String),

    #[error("Model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("Model load error: {0}")]
    ModelLoad(String),

    #[error("Manifest error: {0}")]
    Manifest(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Run timeout")]
    RunTimeout,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn to_problem_detail(&self, request_id: &str) -> ProblemDetail {
        let (status, code, title, detail) = match self {
            AppError::InvalidImage(detail) => (
                422,
                "INVALID_IMAGE",
                "Invalid Image",
                detail.clone(),
            ),
            AppError::ShapeMismatch(detail) => (
                422,
                "SHAPE_MISMATCH",
                "Shape Mismatch",
                detail.clone(),
            ),
            AppError::DegenerateOctave { exponent, height, width } => (
                422,
                "DEGENERATE_OCTAVE",
                "Degenerate Octave",
                format!(
                    "Octave exponent {} scales the image to {}x{}",
                    exponent, height, width
                ),
            ),
            AppError::NonFiniteGradient => (
                500,
                "NON_FINITE_GRADIENT",
                "Non-finite Gradient",
                "Gradient contained NaN or infinite values".to_string(),
            ),
            AppError::Tensor(e) => (
                500,
                "TENSOR_ERROR",
                "Tensor Error",
                e.to_string(),
            ),
            AppError::Inference(detail) => (
                500,
                "INFERENCE_ERROR",
                "Inference Error",
                detail.clone(),
            ),
            AppError::ModelUnavailable(id) => (
                503,
                "MODEL_UNAVAILABLE",
                "Model Unavailable",
                format!("Model '{}' is not loaded", id),
            ),
            AppError::ModelLoad(detail) => (
                500,
                "MODEL_LOAD_ERROR",
                "Model Load Error",
                detail.clone(),
            ),
            AppError::Manifest(detail) => (
                500,
                "MANIFEST_ERROR",
                "Manifest Error",
                detail.clone(),
            ),
            AppError::ValidationError(field) => (
                400,
                "VALIDATION_ERROR",
                "Validation Error",
                field.clone(),
            ),
            AppError::RunTimeout => (
                504,
                "RUN_TIMEOUT",
                "Run Timeout",
                "Dream run exceeded time limit".to_string(),
            ),
            AppError::Internal(detail) => (
                500,
                "INTERNAL_ERROR",
                "Internal Error",
                detail.clone(),
            ),
        };

        ProblemDetail {
            problem_type: format!("https://dreamlens.dev/problems/{}", code.to_lowercase()),
            title: title.to_string(),
            status,
            detail,
            code: code.to_string(),
            request_id: request_id.to_string(),
        }
    }
}
