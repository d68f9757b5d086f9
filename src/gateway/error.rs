use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::error::FarmError;

/// Failure body returned by every write endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub ok: bool,
    pub error: String,
    pub code: String,
}

#[derive(Debug)]
pub enum ApiError {
    Farm(FarmError),
    /// The request could not be decoded at all.
    BadRequest(String),
}

impl From<FarmError> for ApiError {
    fn from(err: FarmError) -> Self {
        ApiError::Farm(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

fn status_for(err: &FarmError) -> StatusCode {
    match err {
        FarmError::JobNotFound(_)
        | FarmError::TaskNotFound(_)
        | FarmError::NodeNotFound(_)
        | FarmError::PropNotFound(_) => StatusCode::NOT_FOUND,
        FarmError::InvalidTransition { .. }
        | FarmError::Conflict { .. }
        | FarmError::StaleOwner { .. } => StatusCode::CONFLICT,
        FarmError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
        FarmError::QueueFull(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, code) = match self {
            ApiError::Farm(err) => (status_for(&err), err.to_string(), err.code()),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg, "bad_request"),
        };
        (
            status,
            Json(ErrorBody {
                ok: false,
                error,
                code: code.to_string(),
            }),
        )
            .into_response()
    }
}
